use std::{io::IsTerminal, path::PathBuf};

use dialoguer::{Input, Select, theme::ColorfulTheme};
use piobridge::python::{PromptOutcome, PythonPrompt};

/// Asks on the terminal how to continue without a Python interpreter.
/// Gives up when stdin is not a terminal.
pub struct TerminalPrompt;

#[async_trait::async_trait]
impl PythonPrompt for TerminalPrompt {
    async fn prompt(&self) -> PromptOutcome {
        if !std::io::stdin().is_terminal() {
            tracing::warn!("no Python interpreter found and stdin is not a terminal");
            return PromptOutcome::Abort;
        }
        match tokio::task::spawn_blocking(ask).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "interpreter prompt");
                PromptOutcome::Abort
            }
            Err(e) => {
                tracing::warn!(error = %e, "interpreter prompt task");
                PromptOutcome::Abort
            }
        }
    }
}

fn ask() -> anyhow::Result<PromptOutcome> {
    let theme = ColorfulTheme::default();
    let items = [
        "Try again (after installing Python)",
        "Use a custom Python interpreter",
        "Abort",
    ];
    let choice = Select::with_theme(&theme)
        .with_prompt("PlatformIO Core needs Python, but none was found")
        .items(&items)
        .default(0)
        .interact()?;
    match choice {
        0 => Ok(PromptOutcome::Retry),
        1 => {
            let path: String = Input::with_theme(&theme)
                .with_prompt("Path to the python executable")
                .interact_text()?;
            Ok(PromptOutcome::CustomPath(PathBuf::from(path.trim())))
        }
        _ => Ok(PromptOutcome::Abort),
    }
}
