//! Notifications emitted by the scheduler and storage layer.
//!
//! The UI layer consumes these through an [`EventSink`]; nothing here knows how
//! they are rendered.

use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Alert {
    pub severity: Severity,
    pub message: String,
    pub unit_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// Identity of an analyzed unit, reduced to its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitRef {
    pub name: String,
}

/// Identity of the unit variant that was analyzed (e.g. a transcript).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariantRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheEvent {
    UnitAnalyzed {
        unit: UnitRef,
        variant: VariantRef,
        was_variant_calling: bool,
    },
    UnitNotAnalyzed {
        unit_name: String,
    },
    BatchCompleted {
        elapsed_seconds: f64,
    },
    AlertIssued(Alert),
}

/// Sink for cache events. Called synchronously from whichever task produced the event.
pub type EventSink = Arc<dyn Fn(CacheEvent) + Send + Sync>;

/// A sink that drops everything.
pub fn null_sink() -> EventSink {
    Arc::new(|_: CacheEvent| {})
}

/// Sink that records every event; handy for tests and for batch tools that report afterwards.
#[derive(Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<CacheEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> EventSink {
        let events = self.events.clone();
        Arc::new(move |ev: CacheEvent| {
            if let Ok(mut guard) = events.lock() {
                guard.push(ev);
            }
        })
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                CacheEvent::AlertIssued(a) => Some(a),
                _ => None,
            })
            .collect()
    }
}
