// Supervised-process phase: write the systemd unit, enable it, and wait for
// the service to report active.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use log::info;
use tokio::time::{sleep, Duration};

use crate::error::InstallError;
use crate::exec::run_cmd_with_timeout;
use crate::rollback::UndoAction;

use super::InstallContext;

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(60);
const ACTIVE_POLL_ATTEMPTS: u32 = 10;
const ACTIVE_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Pure unit-file renderer. Secrets stay in the EnvironmentFile; the unit
/// itself holds nothing sensitive.
pub fn build_systemd_unit_text(service: &str, install_dir: &Path, app_port: u16) -> String {
    format!(
        r#"[Unit]
Description=SessionLens session-streaming service ({service})
After=network-online.target postgresql.service
Wants=network-online.target

[Service]
Type=simple
WorkingDirectory={dir}
EnvironmentFile={dir}/.env.secrets
Environment=SESSIONLENS_PORT={port}
ExecStart=/usr/bin/node server.js
Restart=on-failure
RestartSec=5
NoNewPrivileges=true
ProtectSystem=full
ProtectHome=true

[Install]
WantedBy=multi-user.target
"#,
        service = service,
        dir = install_dir.display(),
        port = app_port,
    )
}

pub fn unit_path(service: &str) -> PathBuf {
    PathBuf::from(format!("/etc/systemd/system/{service}.service"))
}

async fn systemctl(args: &[&str], operation: &str) -> Result<()> {
    let out = run_cmd_with_timeout(
        "systemctl",
        &args.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        SYSTEMCTL_TIMEOUT,
        operation,
    )
    .await?;
    if !out.success() {
        return Err(anyhow!(
            "systemctl {} failed (exit_code={:?}): {}",
            args.join(" "),
            out.exit_code,
            out.stderr.trim()
        ));
    }
    Ok(())
}

/// Poll `systemctl is-active` until the unit reports active. Bounded; a
/// crash-looping service fails this phase instead of hanging it.
pub async fn wait_until_active(service: &str) -> Result<()> {
    for attempt in 1..=ACTIVE_POLL_ATTEMPTS {
        let out = run_cmd_with_timeout(
            "systemctl",
            &["is-active".to_string(), service.to_string()],
            SYSTEMCTL_TIMEOUT,
            "process_is_active",
        )
        .await?;
        let state = out.stdout.trim();
        if state == "active" {
            return Ok(());
        }
        if state == "failed" {
            return Err(anyhow!("service '{service}' entered the failed state"));
        }
        info!(
            "[PHASE: start-process] [STEP: wait] Service '{}' is '{}' (attempt {}/{})",
            service, state, attempt, ACTIVE_POLL_ATTEMPTS
        );
        sleep(ACTIVE_POLL_INTERVAL).await;
    }
    Err(anyhow!(
        "service '{service}' did not become active within {} attempts",
        ACTIVE_POLL_ATTEMPTS
    ))
}

async fn start(ctx: &mut InstallContext) -> Result<()> {
    let service = ctx.cfg.service_name.clone();
    let unit = unit_path(&service);

    if ctx.dry_run_gate(&format!(
        "write {unit:?}, daemon-reload, enable --now, wait for active",
    )) {
        return Ok(());
    }

    let text = build_systemd_unit_text(&service, &ctx.cfg.install_dir, ctx.cfg.app_port);
    tokio::fs::write(&unit, text)
        .await
        .with_context(|| format!("cannot write unit file {unit:?}"))?;
    // The unit file is on disk from here on; record it before enabling so a
    // service that never comes up is still stopped and removed.
    ctx.undo.push(UndoAction::StopProcess {
        service: service.clone(),
        unit_path: unit,
    });

    systemctl(&["daemon-reload"], "process_daemon_reload").await?;
    systemctl(&["enable", "--now", &service], "process_enable_now").await?;
    wait_until_active(&service).await?;

    info!(
        "[PHASE: start-process] [STEP: done] Service '{}' is active",
        service
    );
    Ok(())
}

pub async fn run(ctx: &mut InstallContext) -> Result<(), InstallError> {
    start(ctx)
        .await
        .map_err(|e| InstallError::phase("start-process", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_text_points_at_the_env_file_and_port() {
        let text =
            build_systemd_unit_text("sessionlens", &PathBuf::from("/opt/sessionlens"), 9100);
        assert!(text.contains("EnvironmentFile=/opt/sessionlens/.env.secrets"));
        assert!(text.contains("Environment=SESSIONLENS_PORT=9100"));
        assert!(text.contains("WorkingDirectory=/opt/sessionlens"));
        assert!(text.contains("Restart=on-failure"));
        // Hardening directives stay in place.
        assert!(text.contains("NoNewPrivileges=true"));
    }

    #[test]
    fn unit_path_follows_the_service_name() {
        assert_eq!(
            unit_path("sessionlens"),
            PathBuf::from("/etc/systemd/system/sessionlens.service")
        );
    }
}
