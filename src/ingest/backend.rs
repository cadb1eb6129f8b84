//! Instrumentation backends

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::events::{BackendEvent, SymbolTable, ThreadName};
use super::EventSink;
use crate::experiment::ExperimentId;
use crate::sync::lock;
use crate::Result;

/// Process a backend is asked to attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachTarget {
    /// Host name.
    pub host: String,
    /// Process id.
    pub pid: i64,
}

/// Connection between experiments and the processes they monitor.
///
/// Control requests come from command handlers on worker threads. Data flows
/// back asynchronously through the [`EventSink`] handed to `attach`.
pub trait InstrumentationBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Attach the experiment's collectors to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Backend`] if the process cannot be attached.
    fn attach(
        &self,
        experiment: ExperimentId,
        target: &AttachTarget,
        collectors: &[String],
        sink: &EventSink,
    ) -> Result<()>;

    /// Detach from every process of the experiment.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Backend`] if the request fails.
    fn detach(&self, experiment: ExperimentId) -> Result<()>;

    /// Start or resume collection.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Backend`] if the request fails.
    fn start(&self, experiment: ExperimentId) -> Result<()>;

    /// Pause collection.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Backend`] if the request fails.
    fn pause(&self, experiment: ExperimentId) -> Result<()>;

    /// Symbols of a linked object that received samples, if the backend has
    /// them.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Backend`] if symbol lookup fails.
    fn symbols(&self, experiment: ExperimentId, linked_object: &Path)
        -> Result<Option<SymbolTable>>;
}

/// A request an [`OfflineBackend`] received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendRequest {
    /// `attach`
    Attach {
        /// Experiment.
        experiment: ExperimentId,
        /// Target process.
        target: AttachTarget,
        /// Collectors to attach.
        collectors: Vec<String>,
    },
    /// `detach`
    Detach {
        /// Experiment.
        experiment: ExperimentId,
    },
    /// `start`
    Start {
        /// Experiment.
        experiment: ExperimentId,
    },
    /// `pause`
    Pause {
        /// Experiment.
        experiment: ExperimentId,
    },
}

/// Backend with no live processes behind it.
///
/// It records the requests it gets, reports each attach as a single attached
/// thread, and serves only the symbol tables it was given up front.
#[derive(Debug, Default)]
pub struct OfflineBackend {
    requests: Mutex<Vec<BackendRequest>>,
    symbols: FxHashMap<PathBuf, SymbolTable>,
}

impl OfflineBackend {
    /// Backend with no symbol tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `table` for its linked object.
    #[must_use]
    pub fn with_symbols(mut self, table: SymbolTable) -> Self {
        self.symbols.insert(table.linked_object.clone(), table);
        self
    }

    /// Requests received so far, oldest first.
    #[must_use]
    pub fn requests(&self) -> Vec<BackendRequest> {
        lock(&self.requests).clone()
    }

    fn record(&self, request: BackendRequest) {
        debug!(?request, "offline backend request");
        lock(&self.requests).push(request);
    }
}

impl InstrumentationBackend for OfflineBackend {
    fn name(&self) -> &str {
        "offline"
    }

    fn attach(
        &self,
        experiment: ExperimentId,
        target: &AttachTarget,
        collectors: &[String],
        sink: &EventSink,
    ) -> Result<()> {
        self.record(BackendRequest::Attach {
            experiment,
            target: target.clone(),
            collectors: collectors.to_vec(),
        });
        sink.emit(BackendEvent::ThreadsAttached {
            experiment,
            threads: vec![ThreadName::process(target.host.clone(), target.pid)],
        })
    }

    fn detach(&self, experiment: ExperimentId) -> Result<()> {
        self.record(BackendRequest::Detach { experiment });
        Ok(())
    }

    fn start(&self, experiment: ExperimentId) -> Result<()> {
        self.record(BackendRequest::Start { experiment });
        Ok(())
    }

    fn pause(&self, experiment: ExperimentId) -> Result<()> {
        self.record(BackendRequest::Pause { experiment });
        Ok(())
    }

    fn symbols(
        &self,
        _experiment: ExperimentId,
        linked_object: &Path,
    ) -> Result<Option<SymbolTable>> {
        Ok(self.symbols.get(linked_object).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_backend_records_requests() {
        let backend = OfflineBackend::new();
        backend.start(1).unwrap();
        backend.pause(1).unwrap();
        assert_eq!(
            backend.requests(),
            vec![
                BackendRequest::Start { experiment: 1 },
                BackendRequest::Pause { experiment: 1 }
            ]
        );
    }

    #[test]
    fn test_offline_backend_serves_given_symbols() {
        let table = SymbolTable {
            linked_object: PathBuf::from("/bin/app"),
            ..SymbolTable::default()
        };
        let backend = OfflineBackend::new().with_symbols(table.clone());
        assert_eq!(backend.symbols(1, Path::new("/bin/app")).unwrap(), Some(table));
        assert_eq!(backend.symbols(1, Path::new("/bin/other")).unwrap(), None);
    }
}
