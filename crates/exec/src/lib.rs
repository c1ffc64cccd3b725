//! Subprocess runner for agent-generated code.
//!
//! Generated solutions arrive as ordered source lines plus one example
//! invocation line. The runner assembles them into a single script, executes
//! it under the configured interpreter in its own process group, and captures
//! `{return_code, output, error}`. Timeouts and cancellation kill the whole
//! group so nothing the script spawned survives it.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Exit code reported when the wall-clock timeout fired.
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported when the run was cancelled.
pub const EXIT_CANCELLED: i32 = 130;

/// Environment variable through which tabular context (a CSV/DataFrame path)
/// reaches the generated code.
pub const DATA_PATH_ENV: &str = "VALET_DATA_PATH";

#[derive(Debug, Clone, Default)]
pub struct CodeRequest {
    /// Ordered source lines of the generated solution.
    pub lines: Vec<String>,
    /// Example invocation appended after the solution body.
    pub example: String,
    /// Declared return type tag ("string", "date", …). Informational.
    pub returns: String,
    /// Optional tabular context passed via [`DATA_PATH_ENV`].
    pub data_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeResponse {
    pub return_code: i32,
    pub output: String,
    pub error: Option<String>,
}

impl CodeResponse {
    pub fn ran_to_completion(&self) -> bool {
        self.return_code == 0
    }
}

/// Executes assembled scripts under an interpreter with a hard timeout.
#[derive(Debug, Clone)]
pub struct CodeRunner {
    interpreter: String,
    timeout: Duration,
}

impl CodeRunner {
    pub fn new(interpreter: impl Into<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            timeout,
        }
    }

    /// Join the solution lines and the example invocation into one script.
    pub fn assemble(request: &CodeRequest) -> String {
        let mut script = request.lines.join("\n");
        if !request.example.trim().is_empty() {
            script.push_str("\n\n");
            script.push_str(request.example.trim_end());
        }
        script.push('\n');
        script
    }

    /// Run without external cancellation.
    pub async fn run(&self, request: &CodeRequest) -> Result<CodeResponse> {
        let (_tx, rx) = watch::channel(false);
        self.run_cancellable(request, rx).await
    }

    /// Run the request; a `true` on the watch channel kills the process group
    /// and reports [`EXIT_CANCELLED`].
    pub async fn run_cancellable(
        &self,
        request: &CodeRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<CodeResponse> {
        let script = Self::assemble(request);
        let scratch = std::env::temp_dir().join(format!("valet-exec-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&scratch)?;
        let script_path = scratch.join("solution");
        std::fs::write(&script_path, &script)
            .with_context(|| format!("writing script to {}", script_path.display()))?;

        debug!(
            interpreter = %self.interpreter,
            lines = request.lines.len(),
            path = %script_path.display(),
            "running generated code"
        );

        let mut command = Command::new(&self.interpreter);
        command
            .arg(&script_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(data_path) = &request.data_path {
            command.env(DATA_PATH_ENV, data_path);
        }
        // Own process group so timeout/cancel can kill the script and
        // everything it spawned in one shot.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = command.spawn().with_context(|| {
            format!("spawning interpreter '{}'", self.interpreter)
        })?;
        let pid = child.id();

        let mut stdout = child.stdout.take().context("child stdout missing")?;
        let mut stderr = child.stderr.take().context("child stderr missing")?;
        let stdout_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stdout.read_to_string(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let return_code = tokio::select! {
            status = child.wait() => {
                status?.code().unwrap_or(-1)
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "generated code timed out — killing process group");
                kill_group(pid);
                let _ = child.wait().await;
                EXIT_TIMEOUT
            }
            _ = wait_for_cancel(&mut cancel) => {
                warn!("generated code cancelled — killing process group");
                kill_group(pid);
                let _ = child.wait().await;
                EXIT_CANCELLED
            }
        };

        let output = stdout_task.await.unwrap_or_default();
        let stderr_text = stderr_task.await.unwrap_or_default();
        let _ = std::fs::remove_dir_all(&scratch);

        let error = match return_code {
            0 => None,
            EXIT_TIMEOUT => Some("execution timed out".to_string()),
            EXIT_CANCELLED => Some("execution cancelled".to_string()),
            _ if !stderr_text.trim().is_empty() => Some(stderr_text.trim().to_string()),
            _ => Some(format!("interpreter exited with code {return_code}")),
        };

        Ok(CodeResponse {
            return_code,
            output: output.trim_end().to_string(),
            error,
        })
    }
}

async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    if *cancel.borrow() {
        return;
    }
    loop {
        if cancel.changed().await.is_err() {
            // Sender gone — cancellation can never arrive.
            std::future::pending::<()>().await;
        }
        if *cancel.borrow() {
            return;
        }
    }
}

fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // The child called setsid, so its pid is the group id.
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}
