//! Cache and batch-analysis scheduling layer for incremental per-gene analysis.
//!
//! - [`key`]: structured cache keys and their wire format
//! - [`compress`]: payload sanitizing and compression
//! - [`store`]: flat and SQLite backends behind [`store::CacheStorage`]
//! - [`scheduler`]: bounded-concurrency batch runs
//! - [`session`]: session classification, size accounting, eviction
//! - [`snapshot`]: bundle export and import
//! - [`cache`]: the [`GeneCache`] facade

pub mod alerts;
pub mod cache;
pub mod compress;
pub mod config;
pub mod error;
pub mod events;
pub mod key;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod worker;

pub use cache::{GeneCache, SummaryRefresher};
pub use compress::Payload;
pub use config::{BackendKind, CacheConfig};
pub use error::{CacheError, CacheResult};
pub use events::{Alert, CacheEvent, EventSink, Severity};
pub use key::{CacheKey, DataKind, KeyFields, PortableKey, SessionId};
pub use scheduler::{
    AlertType, AnalysisFailure, AnalysisOptions, AnalysisPipeline, AnalyzedUnit, BatchOutcome,
    BatchScheduler, CacheStatus, RunState,
};
pub use session::{KeyFilter, SessionManager, SizeReport};
pub use snapshot::{ExportOptions, ImportOptions, KeyForm, SnapshotEntry, SummaryObserver};
pub use store::{CacheBackend, CacheStorage, StoredKey};
