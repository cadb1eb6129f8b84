//! Worker pool that runs submitted commands
//!
//! Commands are dispatched one at a time in submission order. Dispatch
//! closes a gate; the running command reopens it once its position is fixed:
//! when it has queued on its experiment's slot, or when it finishes. This
//! keeps per-experiment FIFO order while commands on different experiments
//! run concurrently. A handler that panics fails its own command only.

use std::any::Any;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufWriter;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::descriptor::ParsedCommand;
use super::handlers::{CommandContext, CommandServices, HandlerTable};
use super::object::{CommandObject, CommandStatus};
use crate::result::{RenderOptions, ResultValue};
use crate::sync::{lock, wait};
use crate::{Error, Result};

/// Reported for a recognized command with no handler.
pub const NOT_IMPLEMENTED_MESSAGE: &str = "This command has not been implemented yet";

/// Prefixes the error text of a failed handler.
pub const UNRECOVERABLE_MESSAGE: &str =
    "An unrecoverable error was encountered while trying to execute this command.";

const FILE_COLUMN_SEPARATOR: &str = "  ";

/// Snapshot of the pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Live worker threads.
    pub allocated: usize,
    /// Workers waiting for a command.
    pub free: usize,
    /// Commands not yet dispatched.
    pub queued: usize,
    /// Commands that have finished on a worker.
    pub executed: u64,
}

struct PoolState {
    queue: VecDeque<Arc<CommandObject>>,
    allocated: usize,
    free: usize,
    ready: bool,
    terminate: bool,
    drained: bool,
    drain_requested: Option<u64>,
    last_dispatched: u64,
    executed: u64,
    spawned: u64,
}

pub(crate) struct Pool {
    me: Weak<Pool>,
    state: Mutex<PoolState>,
    work: Condvar,
    idle: Condvar,
    max_workers: usize,
    handlers: HandlerTable,
    services: CommandServices,
}

impl Pool {
    fn spawn_worker(&self, state: &mut PoolState) {
        let Some(pool) = self.me.upgrade() else {
            return;
        };
        state.spawned += 1;
        let index = state.spawned;
        let spawned = thread::Builder::new()
            .name(format!("perfex-worker-{index}"))
            .spawn(move || pool.work_loop());
        match spawned {
            Ok(_) => {
                state.allocated += 1;
                state.free += 1;
                debug!(worker = index, allocated = state.allocated, "command worker spawned");
            }
            Err(err) => {
                error!(error = %err, allocated = state.allocated, "could not spawn command worker");
            }
        }
    }

    fn work_loop(&self) {
        loop {
            let command = {
                let mut state = lock(&self.state);
                let command = loop {
                    if state.terminate {
                        state.allocated -= 1;
                        state.free -= 1;
                        self.idle.notify_all();
                        return;
                    }
                    if state.ready {
                        if let Some(command) = state.queue.pop_front() {
                            break command;
                        }
                    }
                    state = wait(&self.work, state);
                };
                state.ready = false;
                state.free -= 1;
                state.last_dispatched = command.sequence();
                command
            };

            self.execute(&command);

            let drain = {
                let mut state = lock(&self.state);
                state.free += 1;
                state.executed += 1;
                self.idle.notify_all();
                state.drain_requested == Some(command.sequence())
            };
            if drain {
                self.drain_from_worker();
                return;
            }
        }
    }

    fn execute(&self, command: &CommandObject) {
        let sequence = command.sequence();
        if command.status().is_final() {
            self.safe_to_do_next(sequence);
            finish(command);
            return;
        }
        debug!(sequence, command = %command.command(), "dispatching command");

        let output = match command.command().redirect() {
            None => None,
            Some(path) => match File::create(path) {
                Ok(file) => Some(file),
                Err(source) => {
                    let err = Error::Redirect {
                        path: path.to_path_buf(),
                        source,
                    };
                    warn!(sequence, error = %err, "redirect failed");
                    command.attach_result(ResultValue::String(err.to_string()));
                    command.set_status(CommandStatus::Error);
                    self.safe_to_do_next(sequence);
                    finish(command);
                    return;
                }
            },
        };

        command.set_status(CommandStatus::Executing);
        let handler = command.command().kind().and_then(|kind| self.handlers.get(kind));
        match handler {
            None => {
                command.attach_result(ResultValue::String(NOT_IMPLEMENTED_MESSAGE.into()));
                command.set_status(CommandStatus::Error);
            }
            Some(handler) => {
                let ctx = CommandContext::new(&self.services, self, sequence);
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&ctx, command)))
                        .unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            error!(sequence, panic = %message, "command handler panicked");
                            Err(Error::Other(format!("handler panicked: {message}")))
                        });
                match outcome {
                    Ok(()) => {
                        command.set_status(CommandStatus::Complete);
                    }
                    Err(Error::Aborted) => {
                        command.set_status(CommandStatus::Aborted);
                    }
                    Err(err) => {
                        debug!(sequence, error = %err, "command failed");
                        command.attach_result(ResultValue::String(UNRECOVERABLE_MESSAGE.into()));
                        command.attach_result(ResultValue::String(err.to_string()));
                        command.set_status(CommandStatus::Error);
                    }
                }
            }
        }
        self.safe_to_do_next(sequence);

        if let Some(file) = output {
            let mut writer = BufWriter::new(file);
            match command.print_results(&mut writer, FILE_COLUMN_SEPARATOR, "\n") {
                Ok(_) => command.set_results_used(),
                Err(err) => warn!(sequence, error = %err, "could not write redirected output"),
            }
        }
        finish(command);
    }

    /// Reopen the dispatch gate for the command dispatched as `sequence`.
    /// A stale call from an older command does nothing.
    pub(crate) fn safe_to_do_next(&self, sequence: u64) {
        let mut state = lock(&self.state);
        if state.ready || state.last_dispatched != sequence {
            return;
        }
        state.ready = true;
        if !state.queue.is_empty() {
            if state.free > 0 {
                self.work.notify_one();
            } else if state.allocated < self.max_workers && !state.terminate {
                self.spawn_worker(&mut state);
            }
        }
    }

    pub(crate) fn wait_for_previous_commands(&self) {
        let mut state = lock(&self.state);
        while state.allocated > state.free + 1 {
            state = wait(&self.idle, state);
        }
    }

    pub(crate) fn request_drain(&self, sequence: u64) {
        lock(&self.state).drain_requested = Some(sequence);
    }

    fn begin_shutdown(&self) -> Vec<Arc<CommandObject>> {
        let purged: Vec<_> = {
            let mut state = lock(&self.state);
            state.terminate = true;
            state.queue.drain(..).collect()
        };
        self.work.notify_all();
        abort_all(&purged);
        purged
    }

    fn drain_from_worker(&self) {
        self.begin_shutdown();
        let mut state = lock(&self.state);
        while state.allocated > 1 {
            state = wait(&self.idle, state);
        }
        state.allocated -= 1;
        state.free -= 1;
        state.drained = true;
        self.idle.notify_all();
        info!(executed = state.executed, "command dispatcher drained");
    }
}

fn abort_all(commands: &[Arc<CommandObject>]) {
    for command in commands {
        command.abort();
        finish(command);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn finish(command: &CommandObject) {
    if command.status() == CommandStatus::Aborted && command.results().is_empty() {
        command.attach_result(ResultValue::RawString(Error::Aborted.to_string()));
    }
    command.complete();
}

/// Bounded worker pool over a FIFO of submitted commands.
///
/// ```rust
/// use std::sync::Arc;
/// use perfex::command::{CommandServices, CommandStatus, Dispatcher, HandlerTable};
/// use perfex::experiment::ExperimentRegistry;
/// use perfex::ingest::{IngestService, OfflineBackend};
/// use perfex::Config;
///
/// let dir = tempfile::tempdir()?;
/// let config = Config { database_dir: Some(dir.path().into()), ..Config::default() };
/// let registry = Arc::new(ExperimentRegistry::new(config, Arc::new(OfflineBackend::new())));
/// let ingest = IngestService::new(Arc::clone(&registry), 16);
/// let dispatcher = Dispatcher::new(
///     4,
///     HandlerTable::builtin(),
///     CommandServices::new(registry, ingest.sink()),
/// );
///
/// let command = dispatcher.submit_line("expCreate pcsamp")?;
/// command.wait_for_completion();
/// assert_eq!(command.status(), CommandStatus::Complete);
/// dispatcher.drain();
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Dispatcher {
    pool: Arc<Pool>,
    next_sequence: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_workers", &self.pool.max_workers)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// A pool of at most `max_workers` threads. Workers are spawned on
    /// demand.
    #[must_use]
    pub fn new(max_workers: usize, handlers: HandlerTable, services: CommandServices) -> Self {
        let pool = Arc::new_cyclic(|me| Pool {
            me: me.clone(),
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                allocated: 0,
                free: 0,
                ready: true,
                terminate: false,
                drained: false,
                drain_requested: None,
                last_dispatched: 0,
                executed: 0,
                spawned: 0,
            }),
            work: Condvar::new(),
            idle: Condvar::new(),
            max_workers: max_workers.max(1),
            handlers,
            services,
        });
        Self {
            pool,
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Shared command services.
    #[must_use]
    pub fn services(&self) -> &CommandServices {
        &self.pool.services
    }

    /// Sequence number for the next command built here.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Wrap `command` in a new command object and submit it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutDown`] once the dispatcher has drained; the
    /// object is still returned through the error path as aborted.
    pub fn submit_command(&self, command: ParsedCommand) -> Result<Arc<CommandObject>> {
        let render = RenderOptions::from(self.pool.services.registry().config());
        let object =
            Arc::new(CommandObject::new(self.next_sequence(), command).with_render_options(render));
        self.submit(Arc::clone(&object))?;
        Ok(object)
    }

    /// Parse `line` and submit it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperand`] if the line does not parse, or
    /// [`Error::ShutDown`] after draining.
    pub fn submit_line(&self, line: &str) -> Result<Arc<CommandObject>> {
        self.submit_command(ParsedCommand::parse(line)?)
    }

    /// Queue `command` for execution. Never blocks on execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutDown`] once the dispatcher has drained; the
    /// command is completed as aborted.
    pub fn submit(&self, command: Arc<CommandObject>) -> Result<()> {
        let mut state = lock(&self.pool.state);
        if state.terminate {
            drop(state);
            abort_all(&[command]);
            return Err(Error::ShutDown);
        }
        debug!(sequence = command.sequence(), command = %command.command(), "command queued");
        state.queue.push_back(command);
        if state.free > 0 {
            self.pool.work.notify_one();
        } else if state.allocated < self.pool.max_workers {
            self.pool.spawn_worker(&mut state);
        }
        Ok(())
    }

    /// Abort every command that has not been dispatched. Returns how many
    /// were removed.
    pub fn purge_queue(&self) -> usize {
        let purged: Vec<_> = lock(&self.pool.state).queue.drain(..).collect();
        abort_all(&purged);
        self.pool.idle.notify_all();
        purged.len()
    }

    /// Stop accepting commands, abort queued ones, and wait for every worker
    /// to exit. Idempotent.
    pub fn drain(&self) {
        self.pool.begin_shutdown();
        let mut state = lock(&self.pool.state);
        while state.allocated > 0 {
            state = wait(&self.pool.idle, state);
        }
        if !state.drained {
            state.drained = true;
            info!(executed = state.executed, "command dispatcher drained");
        }
        self.pool.idle.notify_all();
    }

    /// Block until the queue is empty and every worker is idle.
    pub fn wait_idle(&self) {
        let mut state = lock(&self.pool.state);
        while !(state.queue.is_empty() && state.free == state.allocated) {
            state = wait(&self.pool.idle, state);
        }
    }

    /// Block until the dispatcher has drained, for example after `exit`.
    pub fn wait_drained(&self) {
        let mut state = lock(&self.pool.state);
        while !state.drained {
            state = wait(&self.pool.idle, state);
        }
    }

    /// True once draining has finished.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        lock(&self.pool.state).drained
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let state = lock(&self.pool.state);
        DispatcherStats {
            allocated: state.allocated,
            free: state.free,
            queued: state.queue.len(),
            executed: state.executed,
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.drain();
    }
}
