//! # perfex: Concurrent Command Execution for Performance Experiments
//!
//! **Version**: 0.1.0
//!
//! perfex is the command-processing core of a profiling tool. Commands
//! against experiments run on a bounded worker pool, in submission order per
//! experiment. Reports are built by small instruction programs that
//! aggregate typed values over sampled performance data kept in one SQLite
//! store per experiment.
//!
//! ## Design Principles
//!
//! - **Per-experiment FIFO**: a reserved slot plus a wait list serializes
//!   commands on one experiment without blocking the others
//! - **Monotonic status**: a command only moves forward through
//!   `Parsed`, `Executing` and a final state
//! - **Idempotent ingestion**: replayed backend events leave the store as is
//! - **Shared values, not globals**: registry, dispatcher and session are
//!   passed by handle
//!
//! ## Example Usage
//!
//! ```rust
//! use perfex::command::CommandStatus;
//! use perfex::{Config, Session};
//!
//! let dir = tempfile::tempdir()?;
//! let session = Session::builder()
//!     .config(Config { database_dir: Some(dir.path().into()), ..Config::default() })
//!     .build()?;
//!
//! let create = session.execute("expCreate pcsamp")?;
//! create.wait_for_completion();
//! assert_eq!(create.status(), CommandStatus::Complete);
//!
//! let view = session.execute("expView -x 1 pcsamp")?;
//! view.wait_for_completion();
//! let mut out = Vec::new();
//! view.print_results(&mut out, "  ", "\n")?;
//! assert!(String::from_utf8(out)?.starts_with("There were no data samples"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod command;
pub mod config;
pub mod error;
pub mod experiment;
pub mod ingest;
pub mod result;
mod sync;
pub mod telemetry;
pub mod view;

use std::sync::Arc;

use command::{CommandObject, CommandServices, Dispatcher, HandlerTable};
use experiment::ExperimentRegistry;
use ingest::{IngestService, InstrumentationBackend, OfflineBackend};

pub use config::Config;
pub use error::{Error, ErrorKind, Result};

/// A registry, a dispatcher and an ingestion service wired together.
///
/// Dropping the session drains the dispatcher, stops ingestion and closes
/// every experiment.
pub struct Session {
    dispatcher: Dispatcher,
    ingest: IngestService,
    registry: Arc<ExperimentRegistry>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("dispatcher", &self.dispatcher)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a new session builder
    #[must_use]
    pub fn builder() -> SessionBuilder {
        SessionBuilder::default()
    }

    /// Parse and submit `line`. The command runs asynchronously; wait on the
    /// returned object for its results.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperand`] if the line does not parse, or
    /// [`Error::ShutDown`] after `exit`.
    pub fn execute(&self, line: &str) -> Result<Arc<CommandObject>> {
        self.dispatcher.submit_line(line)
    }

    /// Submit `line` and wait for it to finish.
    ///
    /// # Errors
    ///
    /// Same as [`Session::execute`].
    pub fn execute_and_wait(&self, line: &str) -> Result<Arc<CommandObject>> {
        let command = self.execute(line)?;
        command.wait_for_completion();
        Ok(command)
    }

    /// The command dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The ingestion service.
    #[must_use]
    pub const fn ingest(&self) -> &IngestService {
        &self.ingest
    }

    /// The experiment registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ExperimentRegistry> {
        &self.registry
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispatcher.drain();
        self.ingest.shutdown();
        self.registry.close_all();
    }
}

/// Session builder
#[derive(Default)]
pub struct SessionBuilder {
    config: Option<Config>,
    backend: Option<Arc<dyn InstrumentationBackend>>,
    handlers: Option<HandlerTable>,
}

impl SessionBuilder {
    /// Use `config` instead of [`Config::default`].
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Backend for new experiments. Defaults to [`OfflineBackend`].
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn InstrumentationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Replace the built-in handler table.
    #[must_use]
    pub fn handlers(mut self, handlers: HandlerTable) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Build the session
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid, or an IO
    /// error if the ingestion thread cannot be started.
    pub fn build(self) -> Result<Session> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let backend: Arc<dyn InstrumentationBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(OfflineBackend::new()),
        };
        let max_workers = config.max_workers;
        let capacity = config.ingest_queue_capacity;

        let registry = Arc::new(ExperimentRegistry::new(config, backend));
        let ingest = IngestService::new(Arc::clone(&registry), capacity);
        let services = CommandServices::new(Arc::clone(&registry), ingest.sink());
        let dispatcher = Dispatcher::new(
            max_workers,
            self.handlers.unwrap_or_else(HandlerTable::builtin),
            services,
        );
        Ok(Session {
            dispatcher,
            ingest,
            registry,
        })
    }
}
