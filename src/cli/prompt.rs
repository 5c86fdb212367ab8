//! Interactive approval of change sets.

use async_trait::async_trait;
use std::io::{BufRead, Write};

use super::commands::OutputFormat;
use super::output::OutputFormatter;
use crate::engine::Approver;
use crate::error::{Result, TopoformError};
use crate::planner::ChangeSet;

/// Shows the change set on stderr and asks for confirmation on stdin.
#[derive(Debug, Clone)]
pub struct PromptApprover {
    confirm_word: &'static str,
}

impl PromptApprover {
    /// Approver accepting `y` or `yes`.
    #[must_use]
    pub const fn new() -> Self {
        Self { confirm_word: "yes" }
    }

    /// Approver requiring `destroy` to be typed in full.
    #[must_use]
    pub const fn for_destroy() -> Self {
        Self {
            confirm_word: "destroy",
        }
    }

    /// Checks an answer against the confirmation word.
    #[must_use]
    pub fn accepts(&self, answer: &str) -> bool {
        let answer = answer.trim();
        if self.confirm_word == "yes" {
            answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
        } else {
            answer == self.confirm_word
        }
    }
}

impl Default for PromptApprover {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Approver for PromptApprover {
    async fn approve(&self, changes: &ChangeSet) -> Result<bool> {
        let rendered = OutputFormatter::new(OutputFormat::Text).format_plan(changes, None);
        let question = if self.confirm_word == "yes" {
            String::from("Do you want to apply these changes? [y/N]: ")
        } else {
            String::from("This action is IRREVERSIBLE. Type 'destroy' to confirm: ")
        };

        let answer = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stderr = std::io::stderr().lock();
            write!(stderr, "{rendered}\n{question}")?;
            stderr.flush()?;

            let mut input = String::new();
            std::io::stdin().lock().read_line(&mut input)?;
            Ok(input)
        })
        .await
        .map_err(|e| TopoformError::internal(format!("prompt task failed: {e}")))??;

        Ok(self.accepts(&answer))
    }
}
