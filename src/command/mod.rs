//! Command execution
//!
//! A [`ParsedCommand`] is wrapped in a [`CommandObject`] and submitted to the
//! [`Dispatcher`], whose workers route it through the [`HandlerTable`].
//! Commands addressing the same experiment run one at a time in submission
//! order; other commands run concurrently.

mod descriptor;
mod dispatcher;
mod handlers;
mod object;

pub use descriptor::{CommandKind, ParsedCommand};
pub use dispatcher::{Dispatcher, DispatcherStats, NOT_IMPLEMENTED_MESSAGE, UNRECOVERABLE_MESSAGE};
pub use handlers::{
    CommandContext, CommandHandler, CommandServices, HandlerTable, KNOWN_COLLECTORS,
};
pub use object::{CommandObject, CommandStatus};
