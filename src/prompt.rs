//! Yes/no confirmations asked of the operator.

use std::sync::Arc;

use inquire::{Confirm, InquireError};

pub trait Prompter: Send + Sync {
    fn confirm(&self, question: &str, default: bool) -> bool;
}

/// Asks on the terminal. Every question here leads to killing processes, so
/// without a terminal to ask on the answer is no; `--yes` opts in.
#[derive(Debug, Default, Clone, Copy)]
pub struct InteractivePrompter;

impl Prompter for InteractivePrompter {
    fn confirm(&self, question: &str, default: bool) -> bool {
        let result = Confirm::new(question).with_default(default).prompt();
        interpret(question, result)
    }
}

fn interpret(question: &str, result: Result<bool, InquireError>) -> bool {
    match result {
        Ok(answer) => answer,
        Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => false,
        Err(InquireError::NotTTY) => {
            log::warn!("No terminal to ask \"{question}\"; assuming no (pass --yes to confirm)");
            false
        }
        Err(e) => {
            log::warn!("Prompt failed ({e}); assuming no");
            false
        }
    }
}

/// Gives the same answer to every question (`--yes`, tests).
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Prompter for FixedAnswer {
    fn confirm(&self, question: &str, _default: bool) -> bool {
        log::info!("{question} -> {}", yes_no(self.0));
        self.0
    }
}

/// Ask on a blocking thread so the runtime keeps driving child output.
pub async fn ask(prompter: &Arc<dyn Prompter>, question: impl Into<String>, default: bool) -> bool {
    let prompter = Arc::clone(prompter);
    let question = question.into();
    tokio::task::spawn_blocking(move || prompter.confirm(&question, default))
        .await
        .unwrap_or(false)
}

fn yes_no(answer: bool) -> &'static str {
    if answer { "yes" } else { "no" }
}
