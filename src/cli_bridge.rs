//! Local CLI bridge backend
//!
//! Runs a command-line model client as a subprocess, writes the flattened
//! prompt to its stdin and reads the completion from stdout. These calls can
//! take minutes, so the deadline is long; on expiry the process gets SIGTERM,
//! then SIGKILL if it is still alive after a grace period.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::backend::{AnalysisBackend, ChatMessage};
use crate::error::BackendError;
use crate::logging;
use crate::settings::BackendSettings;

const KILL_GRACE: Duration = Duration::from_secs(5);

pub struct CliBridgeBackend {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CliBridgeBackend {
    pub fn new(command: &str, args: &[String], timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            timeout,
        }
    }

    pub fn from_settings(settings: &BackendSettings) -> Self {
        Self::new(&settings.cli_command, &settings.cli_args, settings.cli_timeout())
    }

    async fn run(&self, prompt: String) -> Result<String, BackendError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Process(format!("failed to spawn {}: {}", self.command, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Process("stdin unavailable".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Process("stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Process("stderr unavailable".into()))?;

        let work = async {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| BackendError::Process(format!("write failed: {}", e)))?;
            drop(stdin);

            let mut out = String::new();
            let mut err = String::new();
            // stderr is diagnostic only; a failed read there is not fatal.
            let (read_out, _) =
                tokio::join!(stdout.read_to_string(&mut out), stderr.read_to_string(&mut err));
            read_out.map_err(|e| BackendError::Process(format!("read failed: {}", e)))?;
            Ok::<_, BackendError>((out, err))
        };

        let (out, err) = match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result?,
            Err(_) => {
                terminate(&mut child).await;
                return Err(BackendError::Timeout(self.timeout));
            }
        };

        let status = child
            .wait()
            .await
            .map_err(|e| BackendError::Process(format!("wait failed: {}", e)))?;
        if !status.success() {
            return Err(BackendError::Process(format!(
                "{} exited with {}: {}",
                self.command,
                status,
                err.trim()
            )));
        }

        let text = out.trim().to_string();
        if text.is_empty() {
            return Err(BackendError::EmptyResponse(self.command.clone()));
        }
        Ok(text)
    }
}

/// SIGTERM, wait, then SIGKILL.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = Command::new("kill")
                .arg("-TERM")
                .arg(pid.to_string())
                .status()
                .await;
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    logging::log_error(None, "CLI bridge did not exit after SIGTERM, killing");
    let _ = child.kill().await;
}

/// Flatten chat messages into one prompt for a single-shot CLI client.
pub fn flatten_messages(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}:\n{}", m.role.to_uppercase(), m.content))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[async_trait]
impl AnalysisBackend for CliBridgeBackend {
    fn name(&self) -> &str {
        "cli"
    }

    async fn complete(&self, messages: &[ChatMessage], _max_tokens: u32) -> Result<String, BackendError> {
        self.run(flatten_messages(messages)).await
    }
}
