// Post-install verification and security audit.
//
// Hard gates: the supervised process is active and the app port answers.
// Audit checks are advisory except the unauthenticated proxy probe, which
// must be refused.

use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cli::InstallMode;
use crate::error::InstallError;
use crate::exec::run_cmd_with_timeout;
use crate::phases::InstallContext;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, detail: detail.into() }
    }
    fn warn(name: &'static str, detail: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Warn, detail: detail.into() }
    }
    fn fail(name: &'static str, detail: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, detail: detail.into() }
    }
}

async fn check_service_active(service: &str) -> CheckResult {
    match run_cmd_with_timeout(
        "systemctl",
        &["is-active".to_string(), service.to_string()],
        PROBE_TIMEOUT,
        "verify_is_active",
    )
    .await
    {
        Ok(out) if out.stdout.trim() == "active" => {
            CheckResult::pass("service-active", format!("'{service}' is active"))
        }
        Ok(out) => CheckResult::fail(
            "service-active",
            format!("'{}' reports '{}'", service, out.stdout.trim()),
        ),
        Err(e) => CheckResult::fail("service-active", format!("cannot query systemd: {e}")),
    }
}

async fn check_port_answering(port: u16) -> CheckResult {
    match timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_)) => CheckResult::pass("port-bound", format!("port {port} is answering")),
        Ok(Err(e)) => CheckResult::fail("port-bound", format!("port {port} refused: {e}")),
        Err(_) => CheckResult::fail("port-bound", format!("port {port} probe timed out")),
    }
}

fn check_file_mode(
    name: &'static str,
    path: &std::path::Path,
    expect: u32,
    exact: bool,
) -> CheckResult {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode() & 0o777;
            let ok = if exact { mode == expect } else { mode & !expect == 0 };
            if ok {
                CheckResult::pass(name, format!("{path:?} mode {mode:03o}"))
            } else {
                CheckResult::warn(
                    name,
                    format!("{path:?} mode {mode:03o}, expected {expect:03o}"),
                )
            }
        }
        Err(e) => CheckResult::warn(name, format!("{path:?} unreadable: {e}")),
    }
}

/// The proxy must refuse an unauthenticated request. Anything other than
/// 401/403 on the front door is a hard failure.
async fn check_proxy_requires_auth(ctx: &InstallContext, domain: &str) -> CheckResult {
    let req = ctx
        .http
        .get("http://127.0.0.1/")
        .header("Host", domain)
        .timeout(PROBE_TIMEOUT);
    match req.send().await {
        Ok(resp) => {
            let code = resp.status().as_u16();
            if code == 401 || code == 403 {
                CheckResult::pass("proxy-auth", format!("unauthenticated probe got {code}"))
            } else {
                CheckResult::fail(
                    "proxy-auth",
                    format!("unauthenticated probe got {code}, expected 401/403"),
                )
            }
        }
        Err(_) => CheckResult::warn("proxy-auth", "proxy probe failed to connect".to_string()),
    }
}

/// Post-install verification checks for the resolved mode.
pub async fn verify(ctx: &InstallContext) -> Vec<CheckResult> {
    match &ctx.cfg.mode {
        InstallMode::FullStack { .. } => {
            vec![
                check_service_active(&ctx.cfg.service_name).await,
                check_port_answering(ctx.cfg.app_port).await,
            ]
        }
        InstallMode::ClientOnly { .. } => {
            let marker = crate::fetcher::FLATTEN_MARKERS
                .iter()
                .any(|m| ctx.cfg.install_dir.join(m).exists());
            let client_env = ctx.cfg.install_dir.join("client.env").exists();
            vec![
                if marker {
                    CheckResult::pass("client-files", "package marker present")
                } else {
                    CheckResult::fail("client-files", "package marker missing")
                },
                if client_env {
                    CheckResult::pass("client-config", "client.env present")
                } else {
                    CheckResult::fail("client-config", "client.env missing")
                },
            ]
        }
    }
}

/// Security audit for full-stack installs.
pub async fn audit(ctx: &InstallContext) -> Vec<CheckResult> {
    let InstallMode::FullStack { domain } = &ctx.cfg.mode else {
        return Vec::new();
    };
    vec![
        check_file_mode("secret-file-mode", &ctx.cfg.secret_file_path(), 0o600, true),
        // Any world-readable bit on the auth store is a finding.
        check_file_mode("htpasswd-mode", &ctx.cfg.htpasswd_path, 0o770, false),
        check_proxy_requires_auth(ctx, domain).await,
    ]
}

fn report(phase: &'static str, results: &[CheckResult]) -> Result<(), InstallError> {
    let mut failed = Vec::new();
    for check in results {
        match check.status {
            CheckStatus::Pass => {
                info!("[PHASE: {}] [STEP: {}] PASS: {}", phase, check.name, check.detail)
            }
            CheckStatus::Warn => {
                warn!("[PHASE: {}] [STEP: {}] WARN: {}", phase, check.name, check.detail)
            }
            CheckStatus::Fail => {
                warn!("[PHASE: {}] [STEP: {}] FAIL: {}", phase, check.name, check.detail);
                failed.push(format!("{}: {}", check.name, check.detail));
            }
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(InstallError::phase(
            phase,
            anyhow::anyhow!("{}", failed.join("; ")),
        ))
    }
}

pub async fn run_verify_phase(ctx: &mut InstallContext) -> Result<(), InstallError> {
    if ctx.dry_run {
        println!("DRY-RUN: verify service state and port binding");
        return Ok(());
    }
    let results = verify(ctx).await;
    report("verify", &results)
}

pub async fn run_audit_phase(ctx: &mut InstallContext) -> Result<(), InstallError> {
    if ctx.dry_run {
        println!("DRY-RUN: audit file permissions and proxy auth");
        return Ok(());
    }
    let results = audit(ctx).await;
    report("audit", &results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_mode_check_flags_deviations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets");
        std::fs::write(&path, "x").unwrap();

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(
            check_file_mode("secret-file-mode", &path, 0o600, true).status,
            CheckStatus::Pass
        );

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(
            check_file_mode("secret-file-mode", &path, 0o600, true).status,
            CheckStatus::Warn
        );
    }

    #[test]
    fn mask_mode_check_flags_world_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("htpasswd");
        std::fs::write(&path, "x").unwrap();

        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();
        assert_eq!(
            check_file_mode("htpasswd-mode", &path, 0o770, false).status,
            CheckStatus::Pass
        );

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(
            check_file_mode("htpasswd-mode", &path, 0o770, false).status,
            CheckStatus::Warn
        );
    }

    #[test]
    fn report_fails_only_on_hard_findings() {
        let ok = vec![
            CheckResult::pass("a", "fine"),
            CheckResult::warn("b", "loose perms"),
        ];
        assert!(report("verify", &ok).is_ok());

        let bad = vec![CheckResult::fail("service-active", "inactive")];
        assert!(report("verify", &bad).is_err());
    }

    #[tokio::test]
    async fn unbound_port_fails_the_gate() {
        // Bind then release an ephemeral port so nothing is listening on it.
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert_eq!(check_port_answering(port).await.status, CheckStatus::Fail);
    }

    #[tokio::test]
    async fn bound_port_passes_the_gate() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(check_port_answering(port).await.status, CheckStatus::Pass);
        drop(listener);
    }
}
