//! Operator confirmation, injected wherever the engine may need to ask a question

use async_trait::async_trait;
use std::io::{self, BufRead, Write};
use tracing::{info, warn};

/// Answers a yes/no question on behalf of the operator
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, question: &str) -> bool;
}

/// Asks on the controlling terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirm;

#[async_trait]
impl Confirm for TerminalConfirm {
    async fn confirm(&self, question: &str) -> bool {
        let question = question.to_string();
        let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
            let mut stdout = io::stdout();
            write!(stdout, "{} [y/N] ", question)?;
            stdout.flush()?;

            let mut line = String::new();
            io::stdin().lock().read_line(&mut line)?;
            Ok(line)
        })
        .await;

        match answer {
            Ok(Ok(line)) => parse_answer(&line),
            Ok(Err(e)) => {
                warn!("Failed to read answer: {}", e);
                false
            }
            Err(e) => {
                warn!("Prompt task failed: {}", e);
                false
            }
        }
    }
}

/// Declines every question; used for unattended runs
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractive;

#[async_trait]
impl Confirm for NonInteractive {
    async fn confirm(&self, question: &str) -> bool {
        info!("Non-interactive mode, declining: {}", question);
        false
    }
}

fn parse_answer(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
