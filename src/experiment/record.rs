//! Experiment - one live profiling session and its execution slot

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::store::ExperimentStore;
use super::ExperimentId;
use crate::command::CommandObject;
use crate::ingest::InstrumentationBackend;
use crate::sync::lock;
use crate::Result;

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentStatus {
    /// Closed, or never created.
    NonExistent,
    /// Created or paused; not collecting.
    Paused,
    /// Collecting data.
    Running,
    /// The monitored program has exited.
    Terminated,
    /// The backend reported a failure.
    InError,
}

impl ExperimentStatus {
    /// Name shown in status reports.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NonExistent => "NonExistent",
            Self::Paused => "Paused",
            Self::Running => "Running",
            Self::Terminated => "Terminated",
            Self::InError => "Error",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

struct Waiter {
    sequence: u64,
    signal: SyncSender<()>,
}

#[derive(Default)]
struct Slot {
    reserved: bool,
    waiting: VecDeque<Waiter>,
}

/// A live experiment.
///
/// At most one command holds the experiment's execution slot at a time;
/// others queue in submission order and are handed the slot one by one.
pub struct Experiment {
    id: ExperimentId,
    name: Option<String>,
    created_at: DateTime<Utc>,
    status: Mutex<ExperimentStatus>,
    slot: Mutex<Slot>,
    collectors: Mutex<Vec<String>>,
    closed: AtomicBool,
    store: ExperimentStore,
    backend: Arc<dyn InstrumentationBackend>,
}

impl fmt::Debug for Experiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Experiment")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("store", &self.store.path())
            .field("backend", &self.backend.name())
            .finish_non_exhaustive()
    }
}

impl Experiment {
    pub(super) fn new(
        id: ExperimentId,
        name: Option<String>,
        store: ExperimentStore,
        backend: Arc<dyn InstrumentationBackend>,
    ) -> Self {
        Self {
            id,
            name,
            created_at: Utc::now(),
            status: Mutex::new(ExperimentStatus::Paused),
            slot: Mutex::new(Slot::default()),
            collectors: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            store,
            backend,
        }
    }

    /// Identifier.
    #[must_use]
    pub const fn id(&self) -> ExperimentId {
        self.id
    }

    /// Optional user-supplied name.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ExperimentStatus {
        *lock(&self.status)
    }

    /// Replace the status.
    pub fn set_status(&self, status: ExperimentStatus) {
        *lock(&self.status) = status;
    }

    /// Collectors attached so far, in attach order.
    #[must_use]
    pub fn collectors(&self) -> Vec<String> {
        lock(&self.collectors).clone()
    }

    /// Attach a collector by name; attaching twice is a no-op.
    pub fn add_collector(&self, name: &str) {
        let mut collectors = lock(&self.collectors);
        if !collectors.iter().any(|c| c == name) {
            collectors.push(name.to_string());
        }
    }

    /// Backing store.
    #[must_use]
    pub const fn store(&self) -> &ExperimentStore {
        &self.store
    }

    /// Instrumentation backend chosen at creation.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn InstrumentationBackend> {
        &self.backend
    }

    /// True once the experiment has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Execution slot
    // ========================================================================

    /// Take the execution slot, waiting behind earlier commands.
    pub fn acquire(&self, command: &CommandObject) {
        self.acquire_then(command, || {});
    }

    /// Like [`Experiment::acquire`], running `on_queued` once the command's
    /// place in line is fixed (before any wait). The dispatcher uses this to
    /// let the next command start only after this one has queued.
    pub fn acquire_then<F: FnOnce()>(&self, command: &CommandObject, on_queued: F) {
        let mut slot = lock(&self.slot);
        on_queued();
        if !slot.reserved {
            slot.reserved = true;
            return;
        }
        slot.waiting.push_back(Waiter {
            sequence: command.sequence(),
            signal: command.dependency_signal(),
        });
        debug!(
            experiment = self.id,
            command = command.sequence(),
            depth = slot.waiting.len(),
            "waiting for experiment"
        );
        drop(slot);
        // The releaser hands the slot over; `reserved` stays set.
        command.wait_on_dependency();
    }

    /// Take the slot only if it is free.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut slot = lock(&self.slot);
        if slot.reserved {
            false
        } else {
            slot.reserved = true;
            true
        }
    }

    /// Pass the slot to the oldest waiter, or free it.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not held.
    pub fn release(&self) {
        let mut slot = lock(&self.slot);
        assert!(
            slot.reserved,
            "release of experiment {} without holding its slot",
            self.id
        );
        while let Some(next) = slot.waiting.pop_front() {
            if next.signal.send(()).is_ok() {
                debug!(experiment = self.id, command = next.sequence, "slot handed over");
                return;
            }
        }
        slot.reserved = false;
    }

    /// Lock the slot for the lifetime of the returned guard.
    #[must_use]
    pub fn lock(self: &Arc<Self>, command: &CommandObject) -> ExperimentSlot {
        self.acquire(command);
        ExperimentSlot {
            experiment: Arc::clone(self),
        }
    }

    /// Guard for a slot already taken with one of the acquire calls.
    #[must_use]
    pub fn held(self: &Arc<Self>) -> ExperimentSlot {
        ExperimentSlot {
            experiment: Arc::clone(self),
        }
    }

    /// True while some command holds the slot.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        lock(&self.slot).reserved
    }

    /// Sequence numbers of queued commands, oldest first.
    #[must_use]
    pub fn waiting(&self) -> Vec<u64> {
        lock(&self.slot).waiting.iter().map(|w| w.sequence).collect()
    }

    pub(super) fn close(&self, keep_store: bool) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.set_status(ExperimentStatus::NonExistent);
        if self.store.is_scratch() && !keep_store {
            self.store.remove()?;
        }
        Ok(())
    }
}

/// Holds an experiment's execution slot; dropping it releases the slot.
#[derive(Debug)]
pub struct ExperimentSlot {
    experiment: Arc<Experiment>,
}

impl ExperimentSlot {
    /// Shared handle to the experiment.
    #[must_use]
    pub fn experiment(&self) -> &Arc<Experiment> {
        &self.experiment
    }
}

impl Deref for ExperimentSlot {
    type Target = Experiment;

    fn deref(&self) -> &Experiment {
        &self.experiment
    }
}

impl Drop for ExperimentSlot {
    fn drop(&mut self) {
        self.experiment.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ParsedCommand;
    use crate::ingest::OfflineBackend;
    use std::time::Duration;

    fn experiment(dir: &std::path::Path) -> Arc<Experiment> {
        let store = ExperimentStore::create_scratch(dir, 1, Duration::from_millis(100)).unwrap();
        Arc::new(Experiment::new(1, None, store, Arc::new(OfflineBackend::new())))
    }

    #[test]
    fn test_new_experiment_is_paused() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        assert_eq!(exp.status(), ExperimentStatus::Paused);
        assert!(!exp.is_reserved());
    }

    #[test]
    fn test_try_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        assert!(exp.try_acquire());
        assert!(!exp.try_acquire());
        exp.release();
        assert!(exp.try_acquire());
    }

    #[test]
    fn test_slot_guard_releases() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        let cmd = CommandObject::new(1, ParsedCommand::new("expGo"));
        {
            let _slot = exp.lock(&cmd);
            assert!(exp.is_reserved());
        }
        assert!(!exp.is_reserved());
    }

    #[test]
    fn test_release_hands_over_to_head() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        assert!(exp.try_acquire());

        let waiter = Arc::new(CommandObject::new(2, ParsedCommand::new("expPause")));
        let handle = {
            let exp = Arc::clone(&exp);
            let waiter = Arc::clone(&waiter);
            std::thread::spawn(move || exp.acquire(&waiter))
        };
        while exp.waiting().is_empty() {
            std::thread::yield_now();
        }
        assert_eq!(exp.waiting(), vec![2]);

        exp.release();
        handle.join().unwrap();
        // Ownership moved to the waiter without the slot becoming free.
        assert!(exp.is_reserved());
        assert!(exp.waiting().is_empty());
        exp.release();
        assert!(!exp.is_reserved());
    }

    #[test]
    #[should_panic(expected = "without holding its slot")]
    fn test_release_without_hold_panics() {
        let dir = tempfile::tempdir().unwrap();
        experiment(dir.path()).release();
    }

    #[test]
    fn test_add_collector_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let exp = experiment(dir.path());
        exp.add_collector("pcsamp");
        exp.add_collector("pcsamp");
        assert_eq!(exp.collectors(), vec!["pcsamp".to_string()]);
    }
}
