//! Report views
//!
//! A view is an instruction program ([`ViewInstruction`]) run by the
//! [`ViewEngine`] over per-key temporaries pulled from an experiment store.
//! [`catalog`] holds the built-in views.

pub mod catalog;
mod engine;
mod instruction;

pub use catalog::{find_view, ViewDefinition, VIEWS};
pub use engine::{
    Cancellation, NeverCancelled, ViewEngine, ViewItem, NO_DATA_MESSAGE, SUMMARY_LABEL,
};
pub use instruction::{ViewInstruction, ViewOpCode};
