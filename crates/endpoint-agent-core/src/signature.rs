//! Deterministic fingerprinting: turns a `Signal` plus device context into a
//! `DeviceSignature` whose `signature_id` is stable across repeated
//! occurrences of the same condition (invariant 2).

use crate::types::{DeviceContext, DeviceSignature, Severity, Signal, StableSymptom, Target, TargetType};
use ring::digest::{digest, SHA256};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Bounded,
    Inverted,
    Unbounded,
}

fn classify_metric(metric: &str) -> MetricKind {
    if metric.contains("free") {
        MetricKind::Inverted
    } else if metric.contains("memory_mb") || metric == "process_memory" {
        MetricKind::Unbounded
    } else {
        MetricKind::Bounded
    }
}

fn confidence_for(signal: &Signal) -> u8 {
    let ratio = match classify_metric(&signal.metric) {
        MetricKind::Bounded => {
            let headroom = 100.0 - signal.threshold;
            if headroom <= 0.0 {
                1.0
            } else {
                (signal.value - signal.threshold) / headroom
            }
        }
        MetricKind::Inverted => {
            if signal.threshold <= 0.0 {
                1.0
            } else {
                (signal.threshold - signal.value) / signal.threshold
            }
        }
        MetricKind::Unbounded => {
            if signal.threshold <= 0.0 {
                1.5
            } else {
                signal.value / signal.threshold
            }
        }
    };

    let (hi, lo) = match classify_metric(&signal.metric) {
        MetricKind::Unbounded => (1.5, 1.2),
        _ => (0.5, 0.2),
    };

    let score = if ratio >= hi {
        95
    } else if ratio >= lo {
        85
    } else {
        70
    };
    score.clamp(50, 100)
}

fn canonical_hash(symptom: &StableSymptom, targets: &[Target], context: &DeviceContext) -> String {
    let value = json!({
        "symptom": {
            "type": symptom.category,
            "severity": symptom.severity,
            "details": {
                "metric": symptom.metric,
                "threshold": symptom.threshold,
            },
        },
        "targets": targets.iter().map(|t| json!({"type": t.target_type, "name": t.name})).collect::<Vec<_>>(),
        "context": context,
        "signal_category": symptom.category,
    });

    // serde_json's default Map is key-sorted (no `preserve_order` feature),
    // so this serialization is deterministic regardless of field insertion
    // order above.
    let bytes = serde_json::to_vec(&value).expect("stable_subset is always serializable");
    let digest = digest(&SHA256, &bytes);
    let full = hex::encode(digest.as_ref());
    full[..32].to_string()
}

/// Build a `DeviceSignature` for `signal`. `targets` are the entities this
/// condition would act on (e.g. the offending service or process);
/// `severity` on the signature mirrors the signal's.
pub fn generate(signal: &Signal, targets: Vec<Target>, context: DeviceContext) -> DeviceSignature {
    let symptom = StableSymptom {
        category: signal.category,
        severity: signal.severity,
        metric: signal.metric.clone(),
        threshold: signal.threshold,
    };

    let signature_id = canonical_hash(&symptom, &targets, &context);
    let confidence_local = confidence_for(signal);

    DeviceSignature {
        signature_id,
        symptoms: vec![symptom],
        targets,
        context,
        severity: signal.severity,
        confidence_local,
        category: signal.category,
    }
}

pub fn target_for_service(name: impl Into<String>) -> Target {
    Target {
        target_type: TargetType::Service,
        name: name.into(),
    }
}

pub fn target_for_process(name: impl Into<String>) -> Target {
    Target {
        target_type: TargetType::Process,
        name: name.into(),
    }
}

/// Drives have no dedicated `TargetType`; a drive letter is represented as
/// a `System` target, consistent with other whole-machine signals that
/// carry no target at all.
pub fn target_for_drive(letter: impl Into<String>) -> Target {
    Target {
        target_type: TargetType::System,
        name: letter.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignalCategory;
    use crate::types::SignalMetadata;
    use chrono::Utc;

    fn context() -> DeviceContext {
        DeviceContext {
            os_build: "22631".to_string(),
            os_version: "10.0".to_string(),
            device_role: "workstation".to_string(),
        }
    }

    #[test]
    fn identical_condition_yields_identical_signature_despite_volatile_fields() {
        let s1 = Signal::new(
            SignalCategory::Performance,
            "system:cpu",
            91.0,
            90.0,
            Severity::Critical,
            SignalMetadata::System,
            Utc::now(),
        );
        let s2 = Signal::new(
            SignalCategory::Performance,
            "system:cpu",
            99.7,
            90.0,
            Severity::Critical,
            SignalMetadata::System,
            Utc::now(),
        );

        let sig1 = generate(&s1, vec![], context());
        let sig2 = generate(&s2, vec![], context());
        assert_eq!(sig1.signature_id, sig2.signature_id);
    }

    #[test]
    fn different_targets_change_the_signature() {
        let s = Signal::new(
            SignalCategory::Services,
            "service:Spooler:state",
            1.0,
            0.0,
            Severity::Critical,
            SignalMetadata::Service {
                service_name: "Spooler".to_string(),
            },
            Utc::now(),
        );

        let sig_a = generate(&s, vec![target_for_service("Spooler")], context());
        let sig_b = generate(&s, vec![target_for_service("RpcSs")], context());
        assert_ne!(sig_a.signature_id, sig_b.signature_id);
    }

    #[test]
    fn signature_id_is_32_hex_chars() {
        let s = Signal::new(
            SignalCategory::Performance,
            "system:memory",
            95.0,
            90.0,
            Severity::Critical,
            SignalMetadata::System,
            Utc::now(),
        );
        let sig = generate(&s, vec![], context());
        assert_eq!(sig.signature_id.len(), 32);
        assert!(sig.signature_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest::proptest! {
        #[test]
        fn regenerating_from_the_same_input_is_deterministic(
            value in 0.0f64..500.0,
            threshold in 0.0f64..500.0,
            target_name in "[a-zA-Z0-9]{1,16}",
        ) {
            let s = Signal::new(
                SignalCategory::Services,
                "service:probe:state",
                value,
                threshold,
                Severity::Warning,
                SignalMetadata::Service { service_name: target_name.clone() },
                Utc::now(),
            );
            let targets = vec![target_for_service(target_name)];

            let sig1 = generate(&s, targets.clone(), context());
            let sig2 = generate(&s, targets, context());
            proptest::prop_assert_eq!(sig1.signature_id, sig2.signature_id);
        }
    }

    #[test]
    fn bounded_metric_confidence_bands() {
        let low = Signal::new(
            SignalCategory::Performance,
            "system:cpu",
            91.0,
            90.0,
            Severity::Critical,
            SignalMetadata::System,
            Utc::now(),
        );
        let high = Signal::new(
            SignalCategory::Performance,
            "system:cpu",
            99.0,
            90.0,
            Severity::Critical,
            SignalMetadata::System,
            Utc::now(),
        );
        assert_eq!(confidence_for(&low), 70);
        assert_eq!(confidence_for(&high), 95);
    }
}
