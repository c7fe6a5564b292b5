//! Deduplicating reporter for repeated cache failures.
//!
//! The same failure (unit + error type) is shown as a light warning for the
//! first few occurrences, escalated to an error once it keeps happening, and
//! then suppressed. Counts live in the reporter instance and are cleared with
//! [`ErrorReporter::reset`] when a new session starts.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::AlertThresholds;
use crate::error::CacheError;
use crate::events::{Alert, CacheEvent, EventSink, Severity};
use crate::key::CacheKey;

pub struct ErrorReporter {
    thresholds: AlertThresholds,
    counts: Mutex<HashMap<(String, String), u32>>,
    sink: EventSink,
}

impl ErrorReporter {
    pub fn new(thresholds: AlertThresholds, sink: EventSink) -> Self {
        Self {
            thresholds,
            counts: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Count one occurrence and return the alert to show, if any.
    pub fn classify(&self, unit_name: &str, error_type: &str, message: String) -> Option<Alert> {
        let count = {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            let c = counts
                .entry((unit_name.to_string(), error_type.to_string()))
                .or_insert(0);
            *c += 1;
            *c
        };

        if count < self.thresholds.warn_limit {
            Some(Alert {
                severity: Severity::Warning,
                message,
                unit_name: Some(unit_name.to_string()),
                details: Vec::new(),
            })
        } else if count < self.thresholds.suppress_after {
            Some(Alert {
                severity: Severity::Error,
                message,
                unit_name: Some(unit_name.to_string()),
                details: vec![format!("error has occurred {count} times")],
            })
        } else {
            None
        }
    }

    /// Report a storage failure for `key`, emitting an alert unless suppressed.
    pub fn report(&self, key: &CacheKey, err: &CacheError) {
        let error_type = err.error_type();
        tracing::warn!(
            unit = key.unit_name(),
            data_kind = %key.data_kind(),
            error_type,
            "{err}"
        );
        let message = format!(
            "{error_type} occurred when caching analyzed {} data for gene {}. Clear the cache to recover.",
            key.data_kind(),
            key.unit_name()
        );
        if let Some(alert) = self.classify(key.unit_name(), error_type, message) {
            (self.sink)(CacheEvent::AlertIssued(alert));
        }
    }

    pub fn occurrences(&self, unit_name: &str, error_type: &str) -> u32 {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(unit_name.to_string(), error_type.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::key::{DataKind, KeyFields, SessionId};

    fn reporter(sink: &RecordingSink) -> ErrorReporter {
        ErrorReporter::new(AlertThresholds::default(), sink.sink())
    }

    #[test]
    fn warns_then_escalates_then_suppresses() {
        let rec = RecordingSink::new();
        let r = reporter(&rec);
        let severities: Vec<Option<Severity>> = (0..10)
            .map(|_| r.classify("BRCA1", "BackendWriteError", "boom".into()).map(|a| a.severity))
            .collect();

        assert_eq!(
            severities,
            vec![
                Some(Severity::Warning),
                Some(Severity::Warning),
                Some(Severity::Error),
                Some(Severity::Error),
                Some(Severity::Error),
                Some(Severity::Error),
                Some(Severity::Error),
                None,
                None,
                None,
            ]
        );
    }

    #[test]
    fn counts_are_per_unit_and_type() {
        let rec = RecordingSink::new();
        let r = reporter(&rec);
        r.classify("BRCA1", "BackendWriteError", "x".into());
        r.classify("BRCA1", "BackendWriteError", "x".into());
        r.classify("BRCA2", "BackendWriteError", "x".into());
        r.classify("BRCA1", "CompressionError", "x".into());
        assert_eq!(r.occurrences("BRCA1", "BackendWriteError"), 2);
        assert_eq!(r.occurrences("BRCA2", "BackendWriteError"), 1);
        assert_eq!(r.occurrences("BRCA1", "CompressionError"), 1);

        r.reset();
        assert_eq!(r.occurrences("BRCA1", "BackendWriteError"), 0);
    }

    #[test]
    fn report_emits_alert_event() {
        let rec = RecordingSink::new();
        let r = reporter(&rec);
        let key = CacheKey::new(
            SessionId(1),
            KeyFields::new("proband", "s", "TP53", "T1", DataKind::DangerSummary, Some("vep".into())),
        );
        r.report(
            &key,
            &CacheError::BackendWrite {
                key: "k".into(),
                message: "quota exceeded".into(),
            },
        );
        let alerts = rec.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].unit_name.as_deref(), Some("TP53"));
        assert!(alerts[0].message.contains("dangerSummary"));
    }

    #[test]
    fn custom_thresholds() {
        let rec = RecordingSink::new();
        let r = ErrorReporter::new(
            AlertThresholds {
                warn_limit: 1,
                suppress_after: 2,
            },
            rec.sink(),
        );
        assert_eq!(
            r.classify("G", "E", "m".into()).map(|a| a.severity),
            Some(Severity::Error)
        );
        assert!(r.classify("G", "E", "m".into()).is_none());
    }
}
