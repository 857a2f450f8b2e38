//! Fixed, case-insensitive deny-lists for processes and services the core
//! must never pass to a kill/stop/restart primitive (invariant 6).

const PROTECTED_PROCESSES: &[&str] = &[
    "system", "csrss.exe", "wininit.exe", "winlogon.exe", "services.exe", "lsass.exe", "smss.exe",
    "svchost.exe", "init", "systemd", "kernel_task", "launchd",
];

const PROTECTED_SERVICES: &[&str] = &[
    "rpcss", "dcomlaunch", "eventlog", "plugplay", "power", "lsm", "wininit", "systemd",
];

pub fn is_protected_process(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    PROTECTED_PROCESSES.iter().any(|p| *p == lower)
}

pub fn is_protected_service(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    PROTECTED_SERVICES.iter().any(|p| *p == lower)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_process_match_is_case_insensitive() {
        assert!(is_protected_process("LSASS.EXE"));
        assert!(!is_protected_process("chrome.exe"));
    }

    #[test]
    fn protected_service_match_is_case_insensitive() {
        assert!(is_protected_service("RpcSs"));
        assert!(!is_protected_service("Spooler"));
    }
}
