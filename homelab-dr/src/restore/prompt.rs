//! Operator prompts for restore: scope menu and per-action confirmation.

use crate::restore::plan::Scope;
use crate::utils::{DrError, Result};
use dialoguer::{Confirm, Select};

/// Interactive decisions the restore executor needs from an operator.
pub trait Prompter: Send + Sync {
    /// Pick what to restore; `None` means the operator cancelled.
    fn choose_scope(&self) -> Result<Option<Scope>>;

    /// Ask before a destructive action. Anything but an explicit yes is a no.
    ///
    /// Ctrl+C yields [`DrError::Interrupted`], which ends the whole run.
    fn confirm(&self, question: &str) -> Result<bool>;
}

/// Prompts on the controlling terminal.
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn choose_scope(&self) -> Result<Option<Scope>> {
        let mut items: Vec<String> = Scope::CHOICES.iter().map(ToString::to_string).collect();
        items.push("cancel".to_string());

        let selection = Select::new()
            .with_prompt("What do you want to restore?")
            .items(&items)
            .default(0)
            .interact_opt()
            .map_err(prompt_error)?;

        Ok(selection.and_then(|i| Scope::CHOICES.get(i).copied()))
    }

    fn confirm(&self, question: &str) -> Result<bool> {
        Confirm::new()
            .with_prompt(format!("{question}. Continue?"))
            .default(false)
            .interact()
            .map_err(prompt_error)
    }
}

/// The terminal is in raw mode while a prompt is up, so Ctrl+C arrives as
/// an interrupted read rather than as SIGINT.
fn prompt_error(error: dialoguer::Error) -> DrError {
    match error {
        dialoguer::Error::IO(e) if e.kind() == std::io::ErrorKind::Interrupted => {
            DrError::Interrupted
        }
        other => DrError::Prompt(other.to_string()),
    }
}
