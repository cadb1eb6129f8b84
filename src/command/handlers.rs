//! Command handlers and the table that routes command kinds to them

use std::path::Path;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::info;

use super::descriptor::CommandKind;
use super::dispatcher::Pool;
use super::object::CommandObject;
use crate::config::Config;
use crate::experiment::{
    ExperimentId, ExperimentRegistry, ExperimentSlot, ExperimentStatus, Granularity,
};
use crate::ingest::{AttachTarget, EventSink};
use crate::result::ResultValue;
use crate::sync::lock;
use crate::view::catalog::{collector_metrics, view_named};
use crate::view::{Cancellation, VIEWS};
use crate::{Error, Result};

/// Collectors the built-in views know about.
pub const KNOWN_COLLECTORS: &[&str] = &["pcsamp"];

const DEFAULT_HOST: &str = "localhost";

/// Long-lived state shared by every command.
#[derive(Debug)]
pub struct CommandServices {
    registry: Arc<ExperimentRegistry>,
    sink: EventSink,
    focus: Mutex<Option<ExperimentId>>,
}

impl CommandServices {
    /// Bundle the registry and the ingestion sink handed to backends.
    #[must_use]
    pub fn new(registry: Arc<ExperimentRegistry>, sink: EventSink) -> Self {
        Self {
            registry,
            sink,
            focus: Mutex::new(None),
        }
    }

    /// The experiment registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ExperimentRegistry> {
        &self.registry
    }
}

/// What a handler sees while it runs.
pub struct CommandContext<'a> {
    services: &'a CommandServices,
    pool: &'a Pool,
    sequence: u64,
}

impl<'a> CommandContext<'a> {
    pub(crate) const fn new(services: &'a CommandServices, pool: &'a Pool, sequence: u64) -> Self {
        Self {
            services,
            pool,
            sequence,
        }
    }

    /// The experiment registry.
    #[must_use]
    pub fn registry(&self) -> &ExperimentRegistry {
        &self.services.registry
    }

    /// Sink backends deliver events into.
    #[must_use]
    pub fn sink(&self) -> &EventSink {
        &self.services.sink
    }

    /// Session configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        self.services.registry.config()
    }

    /// Experiment used when a command has no `-x`.
    #[must_use]
    pub fn focus(&self) -> Option<ExperimentId> {
        *lock(&self.services.focus)
    }

    /// Change the focused experiment.
    pub fn set_focus(&self, id: Option<ExperimentId>) {
        *lock(&self.services.focus) = id;
    }

    /// The experiment a command addresses: `-x`, else the focus.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOperand`] if neither is set.
    pub fn target(&self, command: &CommandObject) -> Result<ExperimentId> {
        command
            .command()
            .experiment()
            .or_else(|| self.focus())
            .ok_or_else(|| Error::InvalidOperand("no experiment selected; use -x <id>".into()))
    }

    /// Take the addressed experiment's slot, queueing behind earlier
    /// commands. The next command is allowed to start once this one has its
    /// place in line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ExperimentNotFound`] if the experiment does not exist
    /// or was closed while this command waited.
    pub fn lock_experiment(&self, command: &CommandObject) -> Result<ExperimentSlot> {
        let id = self.target(command)?;
        let experiment = self
            .registry()
            .find(id)
            .ok_or(Error::ExperimentNotFound(id))?;
        experiment.acquire_then(command, || self.allow_next());
        let slot = experiment.held();
        if slot.is_closed() {
            return Err(Error::ExperimentNotFound(id));
        }
        Ok(slot)
    }

    /// Let the dispatcher start the next command now.
    pub fn allow_next(&self) {
        self.pool.safe_to_do_next(self.sequence);
    }

    /// Block until no other worker is executing.
    ///
    /// Call this before [`Self::lock_experiment`], never while holding a
    /// slot: a worker queued on that slot counts as executing, so the wait
    /// would never end.
    pub fn wait_for_previous_commands(&self) {
        self.pool.wait_for_previous_commands();
    }

    /// Ask the dispatcher to shut down once this command completes.
    pub fn request_drain(&self) {
        self.pool.request_drain(self.sequence);
    }
}

/// Executes one kind of command.
pub trait CommandHandler: Send + Sync {
    /// Run `command`, attaching its results.
    ///
    /// # Errors
    ///
    /// Any error is reported on the command and sets its status to `Error`;
    /// [`Error::Aborted`] sets it to `Aborted` instead.
    fn execute(&self, ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&CommandContext<'_>, &CommandObject) -> Result<()> + Send + Sync,
{
    fn execute(&self, ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
        self(ctx, command)
    }
}

/// Routes command kinds to handlers.
#[derive(Default)]
pub struct HandlerTable {
    handlers: FxHashMap<CommandKind, Box<dyn CommandHandler>>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().map(|k| k.name()).collect();
        kinds.sort_unstable();
        f.debug_struct("HandlerTable").field("kinds", &kinds).finish()
    }
}

impl HandlerTable {
    /// A table with no handlers.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// A table with every built-in handler.
    #[must_use]
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        table.register(CommandKind::ExpCreate, exp_create);
        table.register(CommandKind::ExpAttach, exp_attach);
        table.register(CommandKind::ExpDetach, exp_detach);
        table.register(CommandKind::ExpGo, exp_go);
        table.register(CommandKind::ExpPause, exp_pause);
        table.register(CommandKind::ExpClose, exp_close);
        table.register(CommandKind::ExpFocus, exp_focus);
        table.register(CommandKind::ExpRestore, exp_restore);
        table.register(CommandKind::ExpSave, exp_save);
        table.register(CommandKind::ExpStatus, exp_status);
        table.register(CommandKind::ExpView, exp_view);
        table.register(CommandKind::ListExp, list_exp);
        table.register(CommandKind::ListStatus, list_status);
        table.register(CommandKind::ListThreads, list_threads);
        table.register(CommandKind::ListObj, list_obj);
        table.register(CommandKind::ListViews, list_views);
        table.register(CommandKind::ListMetrics, list_metrics);
        table.register(CommandKind::Exit, exit);
        table.register(CommandKind::Help, help);
        table
    }

    /// Install or replace the handler for `kind`.
    pub fn register<H>(&mut self, kind: CommandKind, handler: H)
    where
        H: CommandHandler + 'static,
    {
        self.handlers.insert(kind, Box::new(handler));
    }

    /// Handler for `kind`.
    #[must_use]
    pub fn get(&self, kind: CommandKind) -> Option<&dyn CommandHandler> {
        self.handlers.get(&kind).map(AsRef::as_ref)
    }

    /// True if `kind` has a handler.
    #[must_use]
    pub fn contains(&self, kind: CommandKind) -> bool {
        self.handlers.contains_key(&kind)
    }
}

// ============================================================================
// Experiment control
// ============================================================================

fn check_collectors(collectors: &[String]) -> Result<()> {
    match collectors
        .iter()
        .find(|c| !KNOWN_COLLECTORS.contains(&c.as_str()))
    {
        Some(unknown) => Err(Error::InvalidOperand(format!("unknown collector '{unknown}'"))),
        None => Ok(()),
    }
}

fn attach_target(command: &CommandObject) -> Result<Option<AttachTarget>> {
    let Some(pid) = command.command().option("p") else {
        return Ok(None);
    };
    let pid = pid
        .parse()
        .map_err(|_| Error::InvalidOperand(format!("'{pid}' is not a process id")))?;
    let host = command.command().option("h").unwrap_or(DEFAULT_HOST);
    Ok(Some(AttachTarget {
        host: host.to_string(),
        pid,
    }))
}

fn attach(
    ctx: &CommandContext<'_>,
    slot: &ExperimentSlot,
    target: &AttachTarget,
    collectors: &[String],
) -> Result<()> {
    for collector in collectors {
        slot.add_collector(collector);
    }
    slot.backend()
        .attach(slot.id(), target, &slot.collectors(), ctx.sink())
}

/// `expCreate [-f program] [-p pid [-h host]] collector...`
fn exp_create(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let collectors = command.command().positionals();
    check_collectors(collectors)?;
    let target = attach_target(command)?;

    let id = ctx.registry().create(command.command().option("f"))?;
    let experiment = ctx
        .registry()
        .find(id)
        .ok_or(Error::ExperimentNotFound(id))?;
    for collector in collectors {
        experiment.add_collector(collector);
    }
    if let Some(target) = target {
        experiment.acquire(command);
        let slot = experiment.held();
        attach(ctx, &slot, &target, collectors)?;
    }
    ctx.set_focus(Some(id));
    command.attach_result(ResultValue::UnsignedInt(id));
    Ok(())
}

/// `expAttach [-x id] -p pid [-h host] collector...`
fn exp_attach(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let collectors = command.command().positionals();
    check_collectors(collectors)?;
    let target = attach_target(command)?
        .ok_or_else(|| Error::InvalidOperand("expAttach needs -p <pid>".into()))?;
    let slot = ctx.lock_experiment(command)?;
    attach(ctx, &slot, &target, collectors)?;
    command.attach_result(ResultValue::UnsignedInt(slot.id()));
    Ok(())
}

fn exp_detach(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let slot = ctx.lock_experiment(command)?;
    slot.backend().detach(slot.id())?;
    command.attach_result(ResultValue::UnsignedInt(slot.id()));
    Ok(())
}

fn exp_go(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let slot = ctx.lock_experiment(command)?;
    match slot.status() {
        ExperimentStatus::Terminated | ExperimentStatus::InError => {
            return Err(Error::InvalidOperand(format!(
                "experiment {} is {} and cannot be run",
                slot.id(),
                slot.status()
            )));
        }
        _ => {}
    }
    slot.backend().start(slot.id())?;
    slot.set_status(ExperimentStatus::Running);
    command.attach_result(ResultValue::UnsignedInt(slot.id()));
    Ok(())
}

fn exp_pause(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let slot = ctx.lock_experiment(command)?;
    if slot.status() == ExperimentStatus::Running {
        slot.backend().pause(slot.id())?;
        slot.set_status(ExperimentStatus::Paused);
    }
    command.attach_result(ResultValue::UnsignedInt(slot.id()));
    Ok(())
}

fn exp_close(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let slot = ctx.lock_experiment(command)?;
    let id = slot.id();
    ctx.registry().close(id)?;
    drop(slot);
    if ctx.focus() == Some(id) {
        ctx.set_focus(ctx.registry().ids().last().copied());
    }
    command.attach_result(ResultValue::UnsignedInt(id));
    Ok(())
}

/// `expFocus [-x id]`: set or report the focused experiment.
fn exp_focus(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    if let Some(id) = command.command().experiment() {
        if ctx.registry().find(id).is_none() {
            return Err(Error::ExperimentNotFound(id));
        }
        ctx.set_focus(Some(id));
    }
    command.attach_result(ctx.focus().map_or(ResultValue::Null, ResultValue::UnsignedInt));
    Ok(())
}

/// `expRestore -f file`
fn exp_restore(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let path = command
        .command()
        .option("f")
        .ok_or_else(|| Error::InvalidOperand("expRestore needs -f <file>".into()))?;
    let id = ctx.registry().restore(Path::new(path))?;
    if let Some(experiment) = ctx.registry().find(id) {
        for collector in experiment.store().collectors_with_data()? {
            experiment.add_collector(&collector);
        }
    }
    ctx.set_focus(Some(id));
    command.attach_result(ResultValue::UnsignedInt(id));
    Ok(())
}

/// `expSave [-x id] -f file`
fn exp_save(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let path = command
        .command()
        .option("f")
        .ok_or_else(|| Error::InvalidOperand("expSave needs -f <file>".into()))?;
    let slot = ctx.lock_experiment(command)?;
    slot.store().save_as(Path::new(path))?;
    info!(experiment = slot.id(), path, "experiment saved");
    command.attach_result(ResultValue::String(path.to_string()));
    Ok(())
}

/// Report status without waiting on busy experiments.
fn exp_status(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let ids = match command.command().experiment() {
        Some(id) => vec![id],
        None => ctx.registry().ids(),
    };
    for id in ids {
        let experiment = ctx
            .registry()
            .find(id)
            .ok_or(Error::ExperimentNotFound(id))?;
        let mut line = format!("Experiment {id} status: {}", experiment.status());
        if experiment.try_acquire() {
            let slot = experiment.held();
            let collectors = slot.collectors();
            if !collectors.is_empty() {
                line.push_str(&format!(", collectors: {}", collectors.join(",")));
            }
            line.push_str(&format!(", threads: {}", slot.store().threads()?.len()));
        } else {
            line.push_str(", busy");
        }
        command.attach_result(ResultValue::RawString(line));
    }
    Ok(())
}

/// `expView [-x id] [-v functions|statements|linkedobjects] [view]`
fn exp_view(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let granularity: Granularity = match command.command().option("v") {
        Some(v) => v.parse()?,
        None => Granularity::default(),
    };
    let slot = ctx.lock_experiment(command)?;
    let name = match command.command().positionals().first() {
        Some(name) => name.clone(),
        None => slot
            .collectors()
            .into_iter()
            .find(|c| VIEWS.iter().any(|v| v.collector == c.as_str()))
            .unwrap_or_else(|| "pcsamp".to_string()),
    };
    let view = view_named(&name)?;
    let rows = view.generate(slot.store(), granularity, command)?;
    command.attach_results(rows);
    if command.is_cancelled() {
        return Err(Error::Aborted);
    }
    Ok(())
}

// ============================================================================
// Listings
// ============================================================================

fn list_exp(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let ids = ctx.registry().ids();
    if ids.is_empty() {
        command.attach_result(ResultValue::RawString("There are no open experiments.".into()));
    }
    command.attach_results(ids.into_iter().map(ResultValue::UnsignedInt));
    Ok(())
}

fn list_status(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let ids = match command.command().experiment() {
        Some(id) => vec![id],
        None => ctx.registry().ids(),
    };
    for id in ids {
        let experiment = ctx
            .registry()
            .find(id)
            .ok_or(Error::ExperimentNotFound(id))?;
        command.attach_result(ResultValue::String(experiment.status().name().to_string()));
    }
    Ok(())
}

fn list_threads(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let slot = ctx.lock_experiment(command)?;
    let threads = slot.store().threads()?;
    if threads.is_empty() {
        command.attach_result(ResultValue::RawString("(none)".into()));
    }
    for thread in threads {
        let text = match thread.posix_tid {
            Some(tid) => format!("{}:{}:{tid}", thread.host, thread.pid),
            None => format!("{}:{}", thread.host, thread.pid),
        };
        command.attach_result(ResultValue::String(text));
    }
    Ok(())
}

fn list_obj(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let slot = ctx.lock_experiment(command)?;
    let objects = slot.store().linked_objects()?;
    if objects.is_empty() {
        command.attach_result(ResultValue::RawString("(none)".into()));
    }
    for object in objects {
        command.attach_result(ResultValue::String(object.path.display().to_string()));
    }
    Ok(())
}

fn collectors_for(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<Vec<String>> {
    match command.command().experiment() {
        Some(id) => Ok(ctx
            .registry()
            .find(id)
            .ok_or(Error::ExperimentNotFound(id))?
            .collectors()),
        None => Ok(KNOWN_COLLECTORS.iter().map(|c| (*c).to_string()).collect()),
    }
}

fn list_views(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    let collectors = collectors_for(ctx, command)?;
    for view in VIEWS.iter().filter(|v| collectors.iter().any(|c| c == v.collector)) {
        command.attach_result(ResultValue::String(view.name.to_string()));
    }
    if command.results().is_empty() {
        command.attach_result(ResultValue::RawString("(none)".into()));
    }
    Ok(())
}

fn list_metrics(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    for collector in collectors_for(ctx, command)? {
        for (metric, _) in collector_metrics(&collector) {
            command.attach_result(ResultValue::String(format!("{collector}::{metric}")));
        }
    }
    if command.results().is_empty() {
        command.attach_result(ResultValue::RawString("(none)".into()));
    }
    Ok(())
}

// ============================================================================
// Session
// ============================================================================

fn exit(ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    ctx.request_drain();
    command.attach_result(ResultValue::RawString("Exiting.".into()));
    Ok(())
}

fn help(_ctx: &CommandContext<'_>, command: &CommandObject) -> Result<()> {
    command.attach_results(
        CommandKind::ALL
            .iter()
            .map(|kind| ResultValue::String(kind.name().to_string())),
    );
    Ok(())
}
