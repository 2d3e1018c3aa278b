// Shared external-command runner.
//
// Every phase that touches the OS (psql, systemctl, nginx, npm, ssh) goes
// through here: bounded timeout, retry on transient failures, and masked
// argument logging.

use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::utils::logging::mask_arg;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = e.to_string().to_ascii_lowercase();
    msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("busy")
        || msg.contains("in use")
        || msg.contains("resource")
        || msg.contains("i/o")
        || msg.contains("io error")
        || msg.contains("connection")
        || msg.contains("network")
}

async fn run_once(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    stdin_data: Option<&[u8]>,
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();

    debug!(
        "[PHASE: exec] [STEP: spawn] {} (program={}, args=[{}], timeout_ms={})",
        operation,
        program,
        args.iter().map(|a| mask_arg(a)).collect::<Vec<_>>().join(", "),
        timeout_dur.as_millis()
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in envs {
        cmd.env(k, v);
    }

    let mut child = cmd.spawn().with_context(|| {
        format!("Failed to spawn command '{}' (operation={})", program, operation)
    })?;

    if let Some(data) = stdin_data {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow::anyhow!("Failed to open stdin (operation={})", operation))?;
        stdin
            .write_all(data)
            .await
            .with_context(|| format!("Failed to write stdin (operation={})", operation))?;
        // Dropping the handle closes the pipe so the child sees EOF.
        drop(stdin);
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(String::from_utf8_lossy(&buf).to_string())
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!("Command wait failed (operation={}, program={})", operation, program)
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: exec] [STEP: timeout] Killing timed-out process (operation={}, program={}, timeout_ms={})",
                operation,
                program,
                timeout_dur.as_millis()
            );
            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: exec] [STEP: timeout] Failed to kill process (operation={}): {}",
                    operation, e
                );
            }
            // Best-effort reap (avoid zombies)
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            return Err(anyhow::anyhow!(
                "Command timed out after {}ms (operation={}, program={})",
                timeout_dur.as_millis(),
                operation,
                program
            ));
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms: started.elapsed().as_millis(),
    };

    debug!(
        "[PHASE: exec] [STEP: exit] {} (program={}, exit_code={:?}, duration_ms={})",
        operation, program, out.exit_code, out.duration_ms
    );

    Ok(out)
}

/// Run an external command with a timeout and up to 3 retries for transient
/// failures.
///
/// Returns captured stdout/stderr even when the exit code is non-zero; the
/// caller decides what counts as success.
pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    run_cmd_with_timeout_env(program, args, &[], timeout_dur, operation).await
}

/// Same as [`run_cmd_with_timeout`] but with extra environment variables for
/// the child. Secrets travel through the environment, never through argv.
pub async fn run_cmd_with_timeout_env(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();
    info!(
        "[PHASE: exec] [STEP: run] {} (program={}, args_count={}, timeout_ms={})",
        operation,
        program,
        args.len(),
        timeout_dur.as_millis()
    );

    let program_owned = program.to_string();
    let args_owned = args.to_vec();
    let envs_owned = envs.to_vec();
    let operation_owned = operation.to_string();

    let attempt = move || {
        let program = program_owned.clone();
        let args = args_owned.clone();
        let envs = envs_owned.clone();
        let op = operation_owned.clone();
        async move { run_once(&program, &args, &envs, None, timeout_dur, &op).await }
    };

    let retry_strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .map(jitter);

    let result = RetryIf::spawn(retry_strategy, attempt, |e: &anyhow::Error| {
        let transient = is_transient_exec_error(e);
        if transient {
            warn!(
                "[PHASE: exec] [STEP: retry] Transient command failure; will retry (operation={}, program={}, err={})",
                operation, program, e
            );
        }
        transient
    })
    .await;

    match &result {
        Ok(out) => {
            info!(
                "[PHASE: exec] [STEP: done] {} (program={}, exit_code={:?}, duration_ms={})",
                operation,
                program,
                out.exit_code,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!(
                "[PHASE: exec] [STEP: error] {} (program={}, duration_ms={}, err={:?})",
                operation,
                program,
                started.elapsed().as_millis(),
                e
            );
        }
    }

    result
}

/// Run a command feeding `stdin_data` to the child. Single attempt, no
/// retries: stdin payloads (SQL, password material) must not be replayed
/// blindly. Secrets ride the pipe, never argv.
pub async fn run_cmd_with_stdin(
    program: &str,
    args: &[String],
    stdin_data: &[u8],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    info!(
        "[PHASE: exec] [STEP: run] {} (program={}, args_count={}, stdin_bytes={}, timeout_ms={})",
        operation,
        program,
        args.len(),
        stdin_data.len(),
        timeout_dur.as_millis()
    );
    run_once(program, args, &[], Some(stdin_data), timeout_dur, operation).await
}
