//! Experiments and their stores
//!
//! An [`Experiment`] is one profiling session: a status, an execution slot
//! serializing the commands issued against it, the collectors attached to it
//! and the SQLite database its data lands in.
//!
//! ## Layout
//!
//! ```text
//! ExperimentRegistry ──< Experiment ── ExperimentStore (X<id>.<n>.openss)
//!                            │
//!                            └── InstrumentationBackend
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use perfex::config::Config;
//! use perfex::experiment::{ExperimentRegistry, ExperimentStatus};
//! use perfex::ingest::OfflineBackend;
//!
//! let dir = tempfile::tempdir()?;
//! let config = Config {
//!     database_dir: Some(dir.path().to_path_buf()),
//!     ..Config::default()
//! };
//! let registry = ExperimentRegistry::new(config, Arc::new(OfflineBackend::new()));
//! let id = registry.create(None)?;
//! assert_eq!(registry.find(id).unwrap().status(), ExperimentStatus::Paused);
//! registry.close(id)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod record;
mod registry;
mod samples;
mod store;

pub use record::{Experiment, ExperimentSlot, ExperimentStatus};
pub use registry::ExperimentRegistry;
pub use samples::{bitmap_allows, Granularity, SampleBucket};
pub use store::{decode, encode, ExperimentStore, LinkedObjectRecord, ThreadRecord, OPEN_END};

/// Experiment identifier. Ids start at 1 and are never reused.
pub type ExperimentId = u64;
