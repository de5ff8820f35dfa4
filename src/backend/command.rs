//! External-command analyzer.
//!
//! Runs an executable per item. The item id, payload locator and the slot's
//! credential are passed in the environment; the verdict comes back as JSON
//! on stdout. Exit status tells the scheduler how to treat a failure:
//!
//! | exit | meaning |
//! |------|---------|
//! | 0    | stdout is a verdict |
//! | 69   | rate limited (`EX_UNAVAILABLE`) |
//! | 75   | transient (`EX_TEMPFAIL`) |
//! | other| permanent |

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AnalyzeError, Analyzer};
use crate::config::secrets::Credential;
use crate::model::{Verdict, WorkItem};

pub const EXIT_RATE_LIMITED: i32 = 69;
pub const EXIT_TRANSIENT: i32 = 75;

const STDERR_TAIL: usize = 512;

pub struct CommandAnalyzer {
    command: PathBuf,
    timeout: Duration,
}

impl CommandAnalyzer {
    pub fn new(command: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }

    fn resolved_command(&self) -> std::io::Result<PathBuf> {
        // Bare names go through PATH; relative paths are anchored to the CWD.
        if self.command.is_relative() && self.command.components().count() > 1 {
            Ok(std::env::current_dir()?.join(&self.command))
        } else {
            Ok(self.command.clone())
        }
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

fn classify_exit(code: Option<i32>, stderr: &[u8]) -> AnalyzeError {
    let detail = stderr_tail(stderr);
    match code {
        Some(EXIT_RATE_LIMITED) => AnalyzeError::RateLimited(detail),
        Some(EXIT_TRANSIENT) => AnalyzeError::Transient(detail),
        Some(code) => AnalyzeError::Permanent(format!("exited with status {code}: {detail}")),
        None => AnalyzeError::Transient(format!("terminated by signal: {detail}")),
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn analyze(
        &self,
        item: &WorkItem,
        credential: &Credential,
    ) -> Result<Verdict, AnalyzeError> {
        let command = self
            .resolved_command()
            .map_err(|e| AnalyzeError::Transient(format!("cannot resolve analyzer path: {e}")))?;

        debug!(
            id = %item.id,
            command = %command.display(),
            credential = %credential.name,
            "running analyzer"
        );

        let started = Instant::now();
        let mut cmd = Command::new(&command);
        cmd.env("AUDITQ_ITEM_ID", item.id.as_str())
            .env("AUDITQ_PAYLOAD", item.payload.to_string())
            .env("AUDITQ_CREDENTIAL_NAME", &credential.name)
            .env("AUDITQ_CREDENTIAL", credential.key().expose_secret())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(AnalyzeError::Transient(format!(
                    "failed to run {}: {e}",
                    command.display()
                )));
            }
            Err(_) => {
                warn!(id = %item.id, timeout_ms = self.timeout.as_millis() as u64, "analyzer timed out");
                return Err(AnalyzeError::Transient(format!(
                    "timed out after {}ms",
                    self.timeout.as_millis()
                )));
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if !output.status.success() {
            let err = classify_exit(output.status.code(), &output.stderr);
            debug!(id = %item.id, duration_ms, error = %err, "analyzer failed");
            return Err(err);
        }

        serde_json::from_slice::<Verdict>(&output.stdout).map_err(|e| {
            AnalyzeError::Transient(format!("unreadable verdict on stdout: {e}"))
        })
    }
}
