//! Command objects - one submitted command, its status and its results

use std::fmt;
use std::io::{self, Write};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Condvar, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::descriptor::ParsedCommand;
use crate::result::{RenderOptions, ResultValue};
use crate::sync::{lock, wait};
use crate::view::Cancellation;

/// Where a command is in its life.
///
/// Status only moves forward: `Parsed`, then `Executing`, then one of the
/// final states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Submitted, not yet picked up.
    Parsed,
    /// Running on a worker.
    Executing,
    /// Finished successfully.
    Complete,
    /// Finished with an error; the message is among the results.
    Error,
    /// Cancelled before or while running.
    Aborted,
}

impl CommandStatus {
    /// True for `Complete`, `Error` and `Aborted`.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Aborted)
    }

    const fn stage(self) -> u8 {
        match self {
            Self::Parsed => 0,
            Self::Executing => 1,
            Self::Complete | Self::Error | Self::Aborted => 2,
        }
    }
}

type CompletionCallback = Box<dyn FnOnce(&CommandObject) + Send>;

struct State {
    status: CommandStatus,
    results: Vec<ResultValue>,
    annotations: Vec<String>,
    results_used: bool,
    completed: bool,
}

/// One submitted command.
///
/// Shared as `Arc<CommandObject>` between the submitter, the dispatcher and
/// the worker running it.
pub struct CommandObject {
    sequence: u64,
    command: ParsedCommand,
    submitted_at: DateTime<Utc>,
    render: RenderOptions,
    state: Mutex<State>,
    completion: Condvar,
    on_complete: Mutex<Option<CompletionCallback>>,
    dependency_tx: SyncSender<()>,
    dependency_rx: Mutex<Receiver<()>>,
}

impl fmt::Debug for CommandObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandObject")
            .field("sequence", &self.sequence)
            .field("command", &self.command.to_string())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl CommandObject {
    /// A command in `Parsed` state.
    #[must_use]
    pub fn new(sequence: u64, command: ParsedCommand) -> Self {
        let (dependency_tx, dependency_rx) = sync_channel(1);
        Self {
            sequence,
            command,
            submitted_at: Utc::now(),
            render: RenderOptions::default(),
            state: Mutex::new(State {
                status: CommandStatus::Parsed,
                results: Vec::new(),
                annotations: Vec::new(),
                results_used: false,
                completed: false,
            }),
            completion: Condvar::new(),
            on_complete: Mutex::new(None),
            dependency_tx,
            dependency_rx: Mutex::new(dependency_rx),
        }
    }

    /// Use `render` when printing results.
    #[must_use]
    pub fn with_render_options(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    /// Global submission order.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The descriptor this command was built from.
    #[must_use]
    pub const fn command(&self) -> &ParsedCommand {
        &self.command
    }

    /// Time the object was created.
    #[must_use]
    pub const fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Formatting used by [`CommandObject::print_results`].
    #[must_use]
    pub const fn render_options(&self) -> &RenderOptions {
        &self.render
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> CommandStatus {
        lock(&self.state).status
    }

    /// Move to `status` if that is a step forward. Returns whether the status
    /// changed.
    pub fn set_status(&self, status: CommandStatus) -> bool {
        let mut state = lock(&self.state);
        if status.stage() > state.status.stage() {
            state.status = status;
            true
        } else {
            false
        }
    }

    /// Request cancellation. Has no effect on a finished command.
    pub fn abort(&self) -> bool {
        self.set_status(CommandStatus::Aborted)
    }

    /// Append a result; list order is display order.
    pub fn attach_result(&self, value: ResultValue) {
        lock(&self.state).results.push(value);
    }

    /// Append several results.
    pub fn attach_results<I>(&self, values: I)
    where
        I: IntoIterator<Item = ResultValue>,
    {
        lock(&self.state).results.extend(values);
    }

    /// Append a free-form annotation line.
    pub fn annotate(&self, text: impl Into<String>) {
        lock(&self.state).annotations.push(text.into());
    }

    /// Snapshot of the results.
    #[must_use]
    pub fn results(&self) -> Vec<ResultValue> {
        lock(&self.state).results.clone()
    }

    /// Snapshot of the annotations.
    #[must_use]
    pub fn annotations(&self) -> Vec<String> {
        lock(&self.state).annotations.clone()
    }

    /// True once the results were printed somewhere.
    #[must_use]
    pub fn results_used(&self) -> bool {
        lock(&self.state).results_used
    }

    /// Mark the results as printed.
    pub fn set_results_used(&self) {
        lock(&self.state).results_used = true;
    }

    /// Write annotations, then results, each followed by `terminator`. Cells
    /// of row results are joined with `column_separator`. Returns whether
    /// anything was written.
    ///
    /// # Errors
    ///
    /// Returns any error from `stream`.
    pub fn print_results<W: Write + ?Sized>(
        &self,
        stream: &mut W,
        column_separator: &str,
        terminator: &str,
    ) -> io::Result<bool> {
        let (annotations, results) = {
            let state = lock(&self.state);
            (state.annotations.clone(), state.results.clone())
        };
        for line in &annotations {
            write!(stream, "{line}{terminator}")?;
        }
        for value in &results {
            let text = match value {
                ResultValue::HeaderRow(row)
                | ResultValue::ColumnRow(row)
                | ResultValue::SummaryRow(row) => row.render_separated(&self.render, column_separator),
                other => other.form(&self.render),
            };
            write!(stream, "{text}{terminator}")?;
        }
        stream.flush()?;
        Ok(!annotations.is_empty() || !results.is_empty())
    }

    /// Results as JSON: `{"sequence", "command", "status", "results",
    /// "annotations"}`.
    #[must_use]
    pub fn results_json(&self) -> Value {
        let state = lock(&self.state);
        json!({
            "sequence": self.sequence,
            "command": self.command.to_string(),
            "status": state.status,
            "results": state
                .results
                .iter()
                .map(|value| value.to_json(&self.render))
                .collect::<Vec<_>>(),
            "annotations": state.annotations,
        })
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Run `callback` once the command completes; immediately if it already
    /// has.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        let done = lock(&self.state).completed;
        if done {
            callback(self);
        } else {
            *lock(&self.on_complete) = Some(Box::new(callback));
            // Completion may have raced the registration.
            if lock(&self.state).completed {
                self.run_callback();
            }
        }
    }

    /// True once the command has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        lock(&self.state).completed
    }

    /// Block until the command completes.
    pub fn wait_for_completion(&self) {
        let mut state = lock(&self.state);
        while !state.completed {
            state = wait(&self.completion, state);
        }
    }

    /// Signal completion: wake waiters and run the callback. Only the first
    /// call has any effect.
    pub(crate) fn complete(&self) {
        {
            let mut state = lock(&self.state);
            if state.completed {
                return;
            }
            state.completed = true;
        }
        self.completion.notify_all();
        self.run_callback();
    }

    fn run_callback(&self) {
        let callback = lock(&self.on_complete).take();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    // ========================================================================
    // Waiting on an experiment
    // ========================================================================

    /// Sender the experiment uses to hand its slot to this command.
    #[must_use]
    pub fn dependency_signal(&self) -> SyncSender<()> {
        self.dependency_tx.clone()
    }

    /// Block until the experiment hands this command its slot.
    pub fn wait_on_dependency(&self) {
        // The object holds a sender, so the channel never disconnects.
        let _ = lock(&self.dependency_rx).recv();
    }
}

impl Cancellation for CommandObject {
    fn is_cancelled(&self) -> bool {
        self.status() == CommandStatus::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Row;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn command(name: &str) -> CommandObject {
        CommandObject::new(1, ParsedCommand::new(name))
    }

    #[test]
    fn test_status_never_regresses() {
        let cmd = command("expGo");
        assert!(cmd.set_status(CommandStatus::Executing));
        assert!(cmd.set_status(CommandStatus::Complete));
        assert!(!cmd.set_status(CommandStatus::Executing));
        assert!(!cmd.set_status(CommandStatus::Error));
        assert!(!cmd.abort());
        assert_eq!(cmd.status(), CommandStatus::Complete);
    }

    #[test]
    fn test_abort_before_execution() {
        let cmd = command("expView");
        assert!(cmd.abort());
        assert!(cmd.is_cancelled());
        assert!(!cmd.set_status(CommandStatus::Executing));
    }

    #[test]
    fn test_print_results() {
        let cmd = command("expView");
        cmd.annotate("note");
        cmd.attach_result(ResultValue::UnsignedInt(7));
        cmd.attach_result(ResultValue::ColumnRow(Row::from(vec![
            ResultValue::UnsignedInt(1),
            ResultValue::from("main"),
        ])));
        let mut out = Vec::new();
        assert!(cmd.print_results(&mut out, " | ", "\n").unwrap());
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, format!("note\n7\n{:>20} | main\n", 1));
    }

    #[test]
    fn test_print_nothing() {
        let mut out = Vec::new();
        assert!(!command("help").print_results(&mut out, "  ", "\n").unwrap());
        assert!(out.is_empty());
    }

    #[test]
    fn test_completion_runs_callback_once() {
        let cmd = Arc::new(command("listExp"));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        cmd.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cmd.complete();
        cmd.complete();
        cmd.wait_for_completion();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let late = Arc::clone(&calls);
        cmd.on_complete(move |_| {
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_results_json() {
        let cmd = command("listExp");
        cmd.attach_result(ResultValue::UnsignedInt(3));
        let json = cmd.results_json();
        assert_eq!(json["command"], "listExp");
        assert_eq!(json["status"], "Parsed");
        assert_eq!(json["results"].as_array().unwrap().len(), 1);
    }
}
