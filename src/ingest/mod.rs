//! Data ingestion
//!
//! Backends push [`BackendEvent`]s into an [`EventSink`]. Each experiment's
//! backend connection gets its own delivery lane: a bounded queue drained by
//! a dedicated thread that applies events to that experiment's store through
//! [`callbacks`]. A slow store on one experiment never holds up another.
//! Ingestion never touches an experiment's execution slot; it relies on
//! SQLite transactions alone.

mod backend;
pub mod callbacks;
mod events;

use std::fmt;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use backend::{AttachTarget, BackendRequest, InstrumentationBackend, OfflineBackend};
pub(crate) use events::Delivery;
pub use events::{
    AddressBitmap, AddressRange, BackendEvent, FunctionEntry, LinkedObjectInfo, PerformanceBlob,
    StatementEntry, SymbolTable, ThreadName,
};

use crate::experiment::{Experiment, ExperimentId, ExperimentRegistry};
use crate::sync::lock;
use crate::{Error, Result};

struct Lane {
    sender: mpsc::Sender<Delivery>,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct Lanes {
    closed: bool,
    by_experiment: FxHashMap<ExperimentId, Lane>,
}

struct Shared {
    registry: Arc<ExperimentRegistry>,
    capacity: usize,
    lanes: Mutex<Lanes>,
}

impl Shared {
    /// Sender of the experiment's lane, starting the lane on first use.
    /// `None` if the experiment is not open.
    fn lane(&self, experiment: ExperimentId) -> Result<Option<mpsc::Sender<Delivery>>> {
        let mut lanes = lock(&self.lanes);
        if lanes.closed {
            return Err(Error::QueueClosed);
        }
        if let Some(lane) = lanes.by_experiment.get(&experiment) {
            return Ok(Some(lane.sender.clone()));
        }
        if self.registry.find(experiment).is_none() {
            return Ok(None);
        }
        let (sender, receiver) = mpsc::channel(self.capacity);
        let registry = Arc::clone(&self.registry);
        let worker = std::thread::Builder::new()
            .name(format!("perfex-ingest-{experiment}"))
            .spawn(move || run(&registry, experiment, receiver))?;
        debug!(experiment, "ingestion lane started");
        lanes.by_experiment.insert(
            experiment,
            Lane {
                sender: sender.clone(),
                worker,
            },
        );
        Ok(Some(sender))
    }

    fn senders(&self) -> Result<Vec<mpsc::Sender<Delivery>>> {
        let lanes = lock(&self.lanes);
        if lanes.closed {
            return Err(Error::QueueClosed);
        }
        Ok(lanes.by_experiment.values().map(|lane| lane.sender.clone()).collect())
    }
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lanes = lock(&self.lanes);
        let mut open: Vec<_> = lanes.by_experiment.keys().copied().collect();
        open.sort_unstable();
        f.debug_struct("Shared")
            .field("capacity", &self.capacity)
            .field("closed", &lanes.closed)
            .field("lanes", &open)
            .finish()
    }
}

/// Sending half of the delivery lanes. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    shared: Arc<Shared>,
}

impl EventSink {
    /// Queue an event on its experiment's lane, waiting while that lane is
    /// full. Events for experiments that are not open are dropped. Must not
    /// be called from inside an async runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] once the service has shut down, or an
    /// I/O error if a lane thread cannot be spawned.
    pub fn emit(&self, event: BackendEvent) -> Result<()> {
        let experiment = event.experiment();
        let Some(sender) = self.shared.lane(experiment)? else {
            warn!(
                experiment,
                event = event.name(),
                "event for an experiment that no longer exists"
            );
            return Ok(());
        };
        sender
            .blocking_send(Delivery::Event(Box::new(event)))
            .map_err(|_| Error::QueueClosed)
    }
}

/// Owns the delivery lanes.
#[derive(Debug)]
pub struct IngestService {
    shared: Arc<Shared>,
}

impl IngestService {
    /// Create the service. Lanes start on their experiment's first event
    /// and each queues at most `capacity` events.
    #[must_use]
    pub fn new(registry: Arc<ExperimentRegistry>, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry,
                capacity: capacity.max(1),
                lanes: Mutex::new(Lanes::default()),
            }),
        }
    }

    /// A new handle for backends.
    #[must_use]
    pub fn sink(&self) -> EventSink {
        EventSink {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of running delivery lanes.
    #[must_use]
    pub fn lanes(&self) -> usize {
        lock(&self.shared.lanes).by_experiment.len()
    }

    /// Block until every event queued before this call has been applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] if the service has shut down.
    pub fn flush(&self) -> Result<()> {
        let waits: Vec<Receiver<()>> = self
            .shared
            .senders()?
            .into_iter()
            .map(|sender| -> Result<Receiver<()>> {
                let (done, wait) = sync_channel(1);
                sender
                    .blocking_send(Delivery::Flush(done))
                    .map_err(|_| Error::QueueClosed)?;
                Ok(wait)
            })
            .collect::<Result<_>>()?;
        for wait in waits {
            wait.recv().map_err(|_| Error::QueueClosed)?;
        }
        Ok(())
    }

    /// Apply what is queued, then stop every lane. Idempotent.
    pub fn shutdown(&self) {
        let lanes = {
            let mut lanes = lock(&self.shared.lanes);
            if lanes.closed {
                return;
            }
            lanes.closed = true;
            std::mem::take(&mut lanes.by_experiment)
        };
        for (experiment, lane) in lanes {
            if lane.sender.blocking_send(Delivery::Shutdown).is_ok() && lane.worker.join().is_err()
            {
                warn!(experiment, "ingestion lane panicked");
            }
        }
        info!("ingestion stopped");
    }
}

impl Drop for IngestService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    registry: &ExperimentRegistry,
    experiment_id: ExperimentId,
    mut receiver: mpsc::Receiver<Delivery>,
) {
    while let Some(delivery) = receiver.blocking_recv() {
        match delivery {
            Delivery::Event(event) => {
                let Some(experiment) = registry.find(experiment_id) else {
                    warn!(
                        experiment = experiment_id,
                        event = event.name(),
                        "event for an experiment that no longer exists"
                    );
                    continue;
                };
                if let Err(err) = apply(&experiment, &event) {
                    warn!(
                        experiment = experiment_id,
                        event = event.name(),
                        error = %err,
                        "failed to store event"
                    );
                }
            }
            Delivery::Flush(done) => {
                let _ = done.send(());
            }
            Delivery::Shutdown => break,
        }
    }
    debug!(experiment = experiment_id, "ingestion lane stopped");
}

/// Apply one event to the experiment's store.
///
/// # Errors
///
/// Returns an error if the store cannot be opened, a write fails, or the
/// backend fails to supply symbols.
pub fn apply(experiment: &Experiment, event: &BackendEvent) -> Result<()> {
    let mut connection = experiment.store().connect()?;
    match event {
        BackendEvent::ThreadsAttached { threads, .. } => {
            callbacks::threads_attached(&mut connection, threads)?;
        }
        BackendEvent::ProcessCreated {
            original, created, ..
        } => {
            callbacks::process_created(&mut connection, original, created)?;
        }
        BackendEvent::LinkedObjectLoaded {
            threads,
            time,
            object,
            ..
        } => callbacks::linked_object_loaded(&mut connection, threads, *time, object)?,
        BackendEvent::LinkedObjectGroupLoaded {
            thread,
            time,
            objects,
            ..
        } => callbacks::linked_object_group_loaded(&mut connection, thread, *time, objects)?,
        BackendEvent::LinkedObjectUnloaded {
            threads,
            time,
            path,
            ..
        } => callbacks::linked_object_unloaded(&mut connection, threads, *time, path)?,
        BackendEvent::SymbolTableDelivered { table, .. } => {
            callbacks::symbol_table_delivered(&mut connection, table)?;
        }
        BackendEvent::PerformanceDataDelivered { blob, .. } => {
            experiment.add_collector(&blob.collector);
            let unresolved = callbacks::performance_data_delivered(&mut connection, blob)?;
            for path in unresolved {
                match experiment.backend().symbols(experiment.id(), &path)? {
                    Some(table) => {
                        callbacks::symbol_table_delivered(&mut connection, &table)?;
                    }
                    None => debug!(object = %path.display(), "no symbols available"),
                }
            }
        }
    }
    Ok(())
}
