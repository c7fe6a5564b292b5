//! Bounded-concurrency batch scheduler.
//!
//! A batch run moves units from `pending` into `in_flight` (at most
//! `capacity` at a time), dispatches one analysis task per in-flight unit and
//! refills after every completion until both lists drain.
//!
//! ```text
//! Idle ──start──▶ Running ──drained──▶ Completed
//!                    │                    │
//!                    └──cancel──▶ Cancelled ◀┘ (start again from either)
//! ```
//!
//! Every completion path funnels into [`BatchScheduler::refill`]. The queue
//! lock is never held across an await, and completions from an earlier or
//! cancelled run are ignored by comparing run ids.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;

use crate::error::{CacheError, CacheResult};
use crate::events::{Alert, CacheEvent, EventSink, Severity, UnitRef, VariantRef};

pub type RunId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled)
    }
}

/// Published on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStatus {
    pub run_id: RunId,
    pub state: RunState,
}

/// Options forwarded to every analysis task of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisOptions {
    /// Run variant calling from alignments.
    pub call_variants: bool,
    pub include_coverage: bool,
    pub annotate: bool,
    /// Cohort has alignments but no variant files; forces variant calling.
    pub alignments_only: bool,
    /// Per-unit variant (transcript) to analyze instead of the default one.
    pub variant_overrides: HashMap<String, String>,
}

impl AnalysisOptions {
    pub fn is_calling(&self) -> bool {
        self.call_variants || self.alignments_only
    }

    fn normalized(mut self) -> Self {
        if self.alignments_only {
            self.call_variants = true;
        }
        self
    }
}

/// Severity tag carried by an analysis failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertType {
    Warning,
    Error,
}

impl From<AlertType> for Severity {
    fn from(t: AlertType) -> Self {
        match t {
            AlertType::Warning => Severity::Warning,
            AlertType::Error => Severity::Error,
        }
    }
}

/// A unit's analysis did not produce a result. Never aborts a batch.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{unit_name}: {message}")]
pub struct AnalysisFailure {
    pub unit_name: String,
    pub message: String,
    pub alert: AlertType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzedUnit {
    pub unit: UnitRef,
    pub variant: VariantRef,
}

/// Answer of the already-analyzed check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatus {
    pub is_cached: bool,
    pub is_cached_for_calling: bool,
}

/// The per-unit domain analysis, provided by the host application.
#[async_trait]
pub trait AnalysisPipeline: Send + Sync {
    async fn analyze(
        &self,
        unit_name: &str,
        variant_override: Option<&str>,
        options: &AnalysisOptions,
    ) -> Result<AnalyzedUnit, AnalysisFailure>;

    async fn is_analyzed(
        &self,
        unit_name: &str,
        options: &AnalysisOptions,
    ) -> anyhow::Result<CacheStatus>;

    /// Record a human-readable summary of a failure; returns where it was stored.
    async fn summarize_failure(&self, unit_name: &str, message: &str) -> anyhow::Result<String>;
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub run_id: RunId,
    pub state: RunState,
    pub pending: Vec<String>,
    pub in_flight: Vec<String>,
    pub analyzed: Vec<String>,
    pub failed: Vec<String>,
}

/// Result of `analyze_all` / `analyze_subset`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub run_id: RunId,
    pub state: RunState,
    /// Units skipped because they were already cached.
    pub skipped: Vec<String>,
    pub analyzed: Vec<String>,
    pub failed: Vec<String>,
    pub elapsed: Duration,
}

struct Queue {
    run_id: RunId,
    state: RunState,
    pending: VecDeque<String>,
    in_flight: Vec<String>,
    analyzed: Vec<String>,
    failed: Vec<String>,
    options: Arc<AnalysisOptions>,
    started: Option<Instant>,
    elapsed: Duration,
}

struct Inner {
    capacity: usize,
    pipeline: Arc<dyn AnalysisPipeline>,
    sink: EventSink,
    queue: Mutex<Queue>,
    status: watch::Sender<RunStatus>,
}

#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<Inner>,
}

impl BatchScheduler {
    pub fn new(capacity: usize, pipeline: Arc<dyn AnalysisPipeline>, sink: EventSink) -> Self {
        let (status, _) = watch::channel(RunStatus {
            run_id: 0,
            state: RunState::Idle,
        });
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                pipeline,
                sink,
                queue: Mutex::new(Queue {
                    run_id: 0,
                    state: RunState::Idle,
                    pending: VecDeque::new(),
                    in_flight: Vec::new(),
                    analyzed: Vec::new(),
                    failed: Vec::new(),
                    options: Arc::new(AnalysisOptions::default()),
                    started: None,
                    elapsed: Duration::ZERO,
                }),
                status,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Begin a run over `units`. Fails with `SchedulerBusy` while a run is active.
    pub async fn start(&self, units: Vec<String>, options: AnalysisOptions) -> CacheResult<RunId> {
        let run_id = {
            let mut q = self.inner.queue();
            if q.state == RunState::Running {
                return Err(CacheError::SchedulerBusy { run_id: q.run_id });
            }
            let mut seen = HashSet::new();
            q.run_id += 1;
            q.state = RunState::Running;
            q.pending = units.into_iter().filter(|u| seen.insert(u.clone())).collect();
            q.in_flight.clear();
            q.analyzed.clear();
            q.failed.clear();
            q.options = Arc::new(options.normalized());
            q.started = Some(Instant::now());
            q.elapsed = Duration::ZERO;
            tracing::info!(run_id = q.run_id, units = q.pending.len(), capacity = self.inner.capacity, "batch run started");
            q.run_id
        };
        self.inner.publish(run_id, RunState::Running);
        self.inner.refill();
        Ok(run_id)
    }

    /// Fill free in-flight slots from the head of `pending`.
    pub fn refill(&self) {
        self.inner.refill();
    }

    /// Stop the current run. Tasks already dispatched finish but their results are ignored.
    pub fn cancel(&self) {
        let run_id = {
            let mut q = self.inner.queue();
            if q.state != RunState::Running {
                return;
            }
            q.state = RunState::Cancelled;
            q.pending.clear();
            q.in_flight.clear();
            q.elapsed = q.started.map(|s| s.elapsed()).unwrap_or_default();
            tracing::info!(run_id = q.run_id, "batch run cancelled");
            q.run_id
        };
        self.inner.publish(run_id, RunState::Cancelled);
    }

    /// Check every unit against the cache, then analyze the ones not cached yet and wait for the run to end.
    pub async fn analyze_all(
        &self,
        units: Vec<String>,
        options: AnalysisOptions,
    ) -> CacheResult<BatchOutcome> {
        let options = options.normalized();
        let calling = options.is_calling();
        let checks = futures::future::join_all(
            units
                .iter()
                .map(|u| self.inner.pipeline.is_analyzed(u, &options)),
        )
        .await;

        let mut pending = Vec::new();
        let mut skipped = Vec::new();
        for (unit, check) in units.into_iter().zip(checks) {
            let cached = match check {
                Ok(status) if calling => status.is_cached_for_calling,
                Ok(status) => status.is_cached,
                Err(e) => {
                    tracing::warn!(unit = %unit, error = %e, "already-analyzed check failed, analyzing");
                    false
                }
            };
            if cached {
                skipped.push(unit);
            } else {
                pending.push(unit);
            }
        }
        let mut outcome = self.run_to_end(pending, options).await?;
        outcome.skipped = skipped;
        Ok(outcome)
    }

    /// Analyze exactly `units`, cached or not, and wait for the run to end.
    pub async fn analyze_subset(
        &self,
        units: Vec<String>,
        options: AnalysisOptions,
    ) -> CacheResult<BatchOutcome> {
        self.run_to_end(units, options).await
    }

    async fn run_to_end(
        &self,
        units: Vec<String>,
        options: AnalysisOptions,
    ) -> CacheResult<BatchOutcome> {
        let mut rx = self.inner.status.subscribe();
        let run_id = self.start(units, options).await?;
        // The sender lives in `inner`, which we hold; the wait cannot fail on a closed channel.
        let _ = rx
            .wait_for(|s| s.run_id != run_id || s.state.is_terminal())
            .await;

        let q = self.inner.queue();
        Ok(BatchOutcome {
            run_id,
            state: if q.run_id == run_id { q.state } else { RunState::Cancelled },
            skipped: Vec::new(),
            analyzed: q.analyzed.clone(),
            failed: q.failed.clone(),
            elapsed: q.elapsed,
        })
    }

    /// Whether `unit` is waiting or being analyzed in the current run.
    pub fn is_in_progress(&self, unit_name: &str) -> bool {
        let q = self.inner.queue();
        q.state == RunState::Running
            && (q.in_flight.iter().any(|u| u.eq_ignore_ascii_case(unit_name))
                || q.pending.iter().any(|u| u.eq_ignore_ascii_case(unit_name)))
    }

    /// Drop an in-flight unit without waiting for its task, freeing its slot.
    pub fn release(&self, unit_name: &str) -> bool {
        let removed = {
            let mut q = self.inner.queue();
            if q.state != RunState::Running {
                return false;
            }
            match q
                .in_flight
                .iter()
                .position(|u| u.eq_ignore_ascii_case(unit_name))
            {
                Some(idx) => {
                    let unit = q.in_flight.remove(idx);
                    q.failed.push(unit.clone());
                    Some(unit)
                }
                None => None,
            }
        };
        match removed {
            Some(unit) => {
                (self.inner.sink)(CacheEvent::UnitNotAnalyzed { unit_name: unit });
                self.inner.refill();
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let q = self.inner.queue();
        QueueSnapshot {
            run_id: q.run_id,
            state: q.state,
            pending: q.pending.iter().cloned().collect(),
            in_flight: q.in_flight.clone(),
            analyzed: q.analyzed.clone(),
            failed: q.failed.clone(),
        }
    }

    pub fn state(&self) -> RunState {
        self.inner.queue().state
    }

    /// Receiver for state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.inner.status.subscribe()
    }
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, run_id: RunId, state: RunState) {
        self.status.send_replace(RunStatus { run_id, state });
    }

    fn refill(self: &Arc<Self>) {
        let (run_id, options, dispatch, finished) = {
            let mut q = self.queue();
            if q.state != RunState::Running {
                return;
            }
            let mut dispatch = Vec::new();
            while q.in_flight.len() < self.capacity {
                let Some(unit) = q.pending.pop_front() else {
                    break;
                };
                q.in_flight.push(unit.clone());
                dispatch.push(unit);
            }
            let finished = if q.pending.is_empty() && q.in_flight.is_empty() {
                q.state = RunState::Completed;
                q.elapsed = q.started.map(|s| s.elapsed()).unwrap_or_default();
                Some(q.elapsed)
            } else {
                None
            };
            (q.run_id, q.options.clone(), dispatch, finished)
        };

        for unit in dispatch {
            tracing::debug!(run_id, unit = %unit, "dispatching analysis");
            let inner = self.clone();
            let options = options.clone();
            tokio::spawn(async move { inner.run_unit(run_id, unit, options).await });
        }

        if let Some(elapsed) = finished {
            tracing::info!(run_id, elapsed_seconds = elapsed.as_secs_f64(), "batch run completed");
            self.publish(run_id, RunState::Completed);
            (self.sink)(CacheEvent::BatchCompleted {
                elapsed_seconds: elapsed.as_secs_f64(),
            });
        }
    }

    async fn run_unit(self: Arc<Self>, run_id: RunId, unit: String, options: Arc<AnalysisOptions>) {
        let variant = options.variant_overrides.get(&unit).cloned();
        // A panicking analysis takes the failure path so its slot is freed.
        let result = AssertUnwindSafe(self.pipeline.analyze(&unit, variant.as_deref(), &options))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(AnalysisFailure {
                    unit_name: unit.clone(),
                    message: format!("analysis panicked: {}", panic_message(panic.as_ref())),
                    alert: AlertType::Error,
                })
            });

        match result {
            Ok(analyzed) => {
                if !self.finish(run_id, &unit, true) {
                    return;
                }
                (self.sink)(CacheEvent::UnitAnalyzed {
                    unit: analyzed.unit,
                    variant: analyzed.variant,
                    was_variant_calling: options.is_calling(),
                });
            }
            Err(failure) => {
                if !self.is_active(run_id, &unit) {
                    tracing::debug!(run_id, unit = %unit, "ignoring failure from stale run");
                    return;
                }
                tracing::warn!(run_id, unit = %unit, alert = ?failure.alert, "{}", failure.message);
                (self.sink)(CacheEvent::AlertIssued(Alert {
                    severity: failure.alert.into(),
                    message: failure.message.clone(),
                    unit_name: Some(unit.clone()),
                    details: Vec::new(),
                }));
                if failure.alert == AlertType::Error {
                    let summary = AssertUnwindSafe(self.pipeline.summarize_failure(&unit, &failure.message))
                        .catch_unwind()
                        .await;
                    match summary {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            tracing::warn!(unit = %unit, error = %e, "failed to record failure summary");
                        }
                        Err(panic) => {
                            tracing::warn!(unit = %unit, panic = panic_message(panic.as_ref()), "failure summary panicked");
                        }
                    }
                }
                if !self.finish(run_id, &unit, false) {
                    return;
                }
                (self.sink)(CacheEvent::UnitNotAnalyzed { unit_name: unit });
            }
        }
        self.refill();
    }

    fn is_active(&self, run_id: RunId, unit: &str) -> bool {
        let q = self.queue();
        q.run_id == run_id && q.state == RunState::Running && q.in_flight.iter().any(|u| u == unit)
    }

    /// Move `unit` out of in-flight. False when the run moved on or the unit was released.
    fn finish(&self, run_id: RunId, unit: &str, ok: bool) -> bool {
        let mut q = self.queue();
        if q.run_id != run_id || q.state != RunState::Running {
            return false;
        }
        let Some(idx) = q.in_flight.iter().position(|u| u == unit) else {
            return false;
        };
        let unit = q.in_flight.remove(idx);
        if ok {
            q.analyzed.push(unit);
        } else {
            q.failed.push(unit);
        }
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
