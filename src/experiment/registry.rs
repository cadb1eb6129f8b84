//! Registry of live experiments

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use super::record::{Experiment, ExperimentSlot};
use super::store::ExperimentStore;
use super::ExperimentId;
use crate::command::CommandObject;
use crate::config::Config;
use crate::ingest::InstrumentationBackend;
use crate::sync::lock;
use crate::{Error, Result};

/// Owns every open experiment, keyed by id.
pub struct ExperimentRegistry {
    experiments: DashMap<ExperimentId, Arc<Experiment>>,
    last_id: Mutex<ExperimentId>,
    config: Config,
    default_backend: Arc<dyn InstrumentationBackend>,
}

impl std::fmt::Debug for ExperimentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentRegistry")
            .field("experiments", &self.ids())
            .field("default_backend", &self.default_backend.name())
            .finish_non_exhaustive()
    }
}

impl ExperimentRegistry {
    /// Empty registry; new experiments use `default_backend` unless told
    /// otherwise.
    #[must_use]
    pub fn new(config: Config, default_backend: Arc<dyn InstrumentationBackend>) -> Self {
        Self {
            experiments: DashMap::new(),
            last_id: Mutex::new(0),
            config,
            default_backend,
        }
    }

    /// Configuration the registry was built with.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.config.busy_timeout_ms)
    }

    fn next_id(&self) -> ExperimentId {
        let mut last = lock(&self.last_id);
        *last += 1;
        *last
    }

    /// Create a paused experiment backed by a fresh scratch store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be created; the
    /// experiment is not registered and its id is not reused.
    pub fn create(&self, name: Option<&str>) -> Result<ExperimentId> {
        self.create_with_backend(name, Arc::clone(&self.default_backend))
    }

    /// Like [`ExperimentRegistry::create`] with an explicit backend.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the store cannot be created.
    pub fn create_with_backend(
        &self,
        name: Option<&str>,
        backend: Arc<dyn InstrumentationBackend>,
    ) -> Result<ExperimentId> {
        let id = self.next_id();
        let store =
            ExperimentStore::create_scratch(&self.config.database_dir(), id, self.busy_timeout())?;
        Ok(self.register(id, name, store, backend))
    }

    /// Register an experiment over an existing database file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreUnavailable`] if the file cannot be opened as a
    /// store.
    pub fn restore(&self, path: &Path) -> Result<ExperimentId> {
        if !path.is_file() {
            return Err(Error::StoreUnavailable(format!(
                "{} is not an experiment database",
                path.display()
            )));
        }
        let id = self.next_id();
        let store = ExperimentStore::open(path, self.busy_timeout())?;
        let backend = Arc::clone(&self.default_backend);
        Ok(self.register(id, None, store, backend))
    }

    fn register(
        &self,
        id: ExperimentId,
        name: Option<&str>,
        store: ExperimentStore,
        backend: Arc<dyn InstrumentationBackend>,
    ) -> ExperimentId {
        info!(
            experiment = id,
            store = %store.path().display(),
            backend = backend.name(),
            "experiment created"
        );
        let experiment = Experiment::new(id, name.map(str::to_string), store, backend);
        self.experiments.insert(id, Arc::new(experiment));
        id
    }

    /// Look up an experiment.
    #[must_use]
    pub fn find(&self, id: ExperimentId) -> Option<Arc<Experiment>> {
        self.experiments.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    fn get(&self, id: ExperimentId) -> Result<Arc<Experiment>> {
        self.find(id).ok_or(Error::ExperimentNotFound(id))
    }

    /// Ids of all open experiments, ascending.
    #[must_use]
    pub fn ids(&self) -> Vec<ExperimentId> {
        let mut ids: Vec<_> = self.experiments.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Number of open experiments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.experiments.len()
    }

    /// True when no experiment is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.experiments.is_empty()
    }

    /// Block until `command` holds the experiment's slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExperimentNotFound`] for an unknown id.
    pub fn acquire(&self, id: ExperimentId, command: &CommandObject) -> Result<()> {
        self.get(id)?.acquire(command);
        Ok(())
    }

    /// Hand the experiment's slot to the next waiter, or free it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExperimentNotFound`] for an unknown id.
    pub fn release(&self, id: ExperimentId) -> Result<()> {
        self.get(id)?.release();
        Ok(())
    }

    /// Take the slot without waiting. Unknown ids report `false`.
    #[must_use]
    pub fn try_acquire(&self, id: ExperimentId) -> bool {
        self.find(id).is_some_and(|experiment| experiment.try_acquire())
    }

    /// Acquire the slot and return a guard releasing it on drop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExperimentNotFound`] for an unknown id.
    pub fn lock(&self, id: ExperimentId, command: &CommandObject) -> Result<ExperimentSlot> {
        Ok(self.get(id)?.lock(command))
    }

    /// Unregister an experiment and release its store. Scratch stores are
    /// deleted unless `save_database` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExperimentNotFound`] for an unknown id, or an I/O
    /// error if the scratch file cannot be removed.
    pub fn close(&self, id: ExperimentId) -> Result<()> {
        let (_, experiment) = self
            .experiments
            .remove(&id)
            .ok_or(Error::ExperimentNotFound(id))?;
        experiment.close(self.config.save_database)?;
        info!(
            experiment = id,
            kept = self.config.save_database || !experiment.store().is_scratch(),
            "experiment closed"
        );
        Ok(())
    }

    /// Close every experiment, logging failures.
    pub fn close_all(&self) {
        for id in self.ids() {
            if let Err(err) = self.close(id) {
                warn!(experiment = id, error = %err, "failed to close experiment");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::OfflineBackend;

    fn registry(dir: &Path) -> ExperimentRegistry {
        let config = Config {
            database_dir: Some(dir.to_path_buf()),
            ..Config::default()
        };
        ExperimentRegistry::new(config, Arc::new(OfflineBackend::new()))
    }

    #[test]
    fn test_ids_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let a = registry.create(None).unwrap();
        let b = registry.create(Some("second")).unwrap();
        registry.close(a).unwrap();
        let c = registry.create(None).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(registry.ids(), vec![2, 3]);
        assert_eq!(registry.find(b).unwrap().name(), Some("second"));
    }

    #[test]
    fn test_close_removes_scratch_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let id = registry.create(None).unwrap();
        let path = registry.find(id).unwrap().store().path().to_path_buf();
        assert!(path.exists());
        registry.close(id).unwrap();
        assert!(!path.exists());
        assert!(registry.find(id).is_none());
    }

    #[test]
    fn test_save_database_keeps_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            database_dir: Some(dir.path().to_path_buf()),
            save_database: true,
            ..Config::default()
        };
        let registry = ExperimentRegistry::new(config, Arc::new(OfflineBackend::new()));
        let id = registry.create(None).unwrap();
        let path = registry.find(id).unwrap().store().path().to_path_buf();
        registry.close(id).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_unknown_ids() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        assert!(registry.find(9).is_none());
        assert!(!registry.try_acquire(9));
        assert!(matches!(registry.release(9), Err(Error::ExperimentNotFound(9))));
        assert!(matches!(registry.close(9), Err(Error::ExperimentNotFound(9))));
    }

    #[test]
    fn test_store_failure_leaves_nothing_registered() {
        let config = Config {
            database_dir: Some("/nonexistent/perfex".into()),
            ..Config::default()
        };
        let registry = ExperimentRegistry::new(config, Arc::new(OfflineBackend::new()));
        let err = registry.create(None).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::StoreUnavailable);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_restore_reopens_saved_store() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let id = registry.create(None).unwrap();
        let saved = dir.path().join("saved.openss");
        registry.find(id).unwrap().store().save_as(&saved).unwrap();
        let restored = registry.restore(&saved).unwrap();
        let experiment = registry.find(restored).unwrap();
        assert!(!experiment.store().is_scratch());
        registry.close(restored).unwrap();
        assert!(saved.exists());
        assert!(registry.restore(&dir.path().join("missing.openss")).is_err());
    }
}
