//! Restore pipeline: manifest, then plan, then per-action execution.

pub mod executor;
pub mod plan;
pub mod prompt;

pub use executor::{ActionRecord, ActionState, RestoreExecutor, RestoreOutcome};
pub use plan::{ActionKind, RestoreAction, RestorePlan, Scope};
pub use prompt::{Prompter, TerminalPrompter};
