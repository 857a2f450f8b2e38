//! Event-log adaptor: converts drained `EventLogRecord`s into `Signal`s.
//! SMART, ECC, and BSOD records pass through unchanged into the pipeline
//! (§4.3); everything else is dropped — the rule engine covers metric-based
//! conditions and this adaptor exists only for event-sourced ones.

use crate::ports::{EventLogLevel, EventLogRecord};
use crate::types::{Severity, Signal, SignalCategory, SignalMetadata};

fn classify(source: &str) -> Option<&'static str> {
    let lower = source.to_ascii_lowercase();
    if lower.contains("smart") {
        Some("smart")
    } else if lower.contains("ecc") {
        Some("ecc")
    } else if lower.contains("bsod") || lower.contains("bugcheck") {
        Some("bsod")
    } else {
        None
    }
}

fn severity_for(level: EventLogLevel) -> Severity {
    match level {
        EventLogLevel::Error => Severity::Critical,
        EventLogLevel::Warning => Severity::Warning,
        EventLogLevel::Information => Severity::Info,
    }
}

/// Convert one batch of drained event-log records into signals, dropping
/// anything outside the SMART/ECC/BSOD categories this adaptor recognizes.
pub fn to_signals(records: Vec<EventLogRecord>) -> Vec<Signal> {
    records
        .into_iter()
        .filter_map(|record| {
            let prefix = classify(&record.source)?;
            Some(Signal::new(
                SignalCategory::Eventlog,
                format!("eventlog:{prefix}"),
                1.0,
                0.0,
                severity_for(record.level),
                SignalMetadata::EventLog {
                    source: record.source.clone(),
                    event_id: record.event_id,
                },
                record.observed_at,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(source: &str, level: EventLogLevel) -> EventLogRecord {
        EventLogRecord {
            source: source.to_string(),
            event_id: Some(7),
            level,
            message: "disk predictive failure".to_string(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn smart_record_passes_through_as_critical_eventlog_signal() {
        let signals = to_signals(vec![record("disk-SMART", EventLogLevel::Error)]);
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].category, SignalCategory::Eventlog);
        assert_eq!(signals[0].metric, "eventlog:smart");
        assert_eq!(signals[0].severity, Severity::Critical);
    }

    #[test]
    fn bugcheck_source_classified_as_bsod() {
        let signals = to_signals(vec![record("Microsoft-Windows-BugCheck", EventLogLevel::Error)]);
        assert_eq!(signals[0].metric, "eventlog:bsod");
    }

    #[test]
    fn unrelated_source_is_dropped() {
        let signals = to_signals(vec![record("Application", EventLogLevel::Information)]);
        assert!(signals.is_empty());
    }
}
