// Existing-install detection. Runs first, read-only.
//
// Three outcomes: abort (default), force-overwrite (--force), or continue
// after an interactive confirmation.

use log::{info, warn};

use crate::cli::InstallMode;
use crate::error::InstallError;

use super::InstallContext;

/// Resources an earlier run may have left behind.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExistingInstall {
    pub install_dir: bool,
    pub unit_file: bool,
    pub proxy_conf: bool,
}

impl ExistingInstall {
    pub fn any(&self) -> bool {
        self.install_dir || self.unit_file || self.proxy_conf
    }

    pub fn describe(&self) -> String {
        let mut found = Vec::new();
        if self.install_dir {
            found.push("install directory");
        }
        if self.unit_file {
            found.push("service unit");
        }
        if self.proxy_conf {
            found.push("proxy config");
        }
        found.join(", ")
    }
}

async fn dir_is_nonempty(path: &std::path::Path) -> bool {
    match tokio::fs::read_dir(path).await {
        Ok(mut rd) => rd.next_entry().await.ok().flatten().is_some(),
        Err(_) => false,
    }
}

pub async fn probe(ctx: &InstallContext) -> ExistingInstall {
    let unit_path = format!("/etc/systemd/system/{}.service", ctx.cfg.service_name);
    ExistingInstall {
        install_dir: dir_is_nonempty(&ctx.cfg.install_dir).await,
        unit_file: tokio::fs::try_exists(&unit_path).await.unwrap_or(false),
        proxy_conf: tokio::fs::try_exists(&ctx.cfg.nginx_conf_path)
            .await
            .unwrap_or(false),
    }
}

pub async fn run(ctx: &mut InstallContext) -> Result<(), InstallError> {
    let mut existing = probe(ctx).await;
    if matches!(ctx.cfg.mode, InstallMode::ClientOnly { .. }) {
        // Client-only installs never own the unit or proxy config.
        existing.unit_file = false;
        existing.proxy_conf = false;
    }

    if !existing.any() {
        info!("[PHASE: detect-existing] [STEP: probe] No prior installation found");
        return Ok(());
    }

    let what = existing.describe();
    if ctx.force {
        warn!(
            "[PHASE: detect-existing] [STEP: probe] Existing installation found ({}); continuing (--force)",
            what
        );
        return Ok(());
    }
    if ctx.interactive {
        let keep_going = crate::cli::confirm(
            &format!("Found an existing installation ({what}). Continue and overwrite?"),
            false,
        );
        if keep_going {
            warn!(
                "[PHASE: detect-existing] [STEP: probe] Continuing over existing installation ({})",
                what
            );
            return Ok(());
        }
    }

    Err(InstallError::Preflight(format!(
        "existing installation detected ({what}); re-run with --force to overwrite"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::InstallArgs;
    use clap::Parser;

    fn ctx_with_dir(dir: &std::path::Path, force: bool) -> InstallContext {
        let args = InstallArgs::parse_from([
            "sessionlens-install",
            "--domain",
            "example.com",
            "--install-dir",
            dir.to_str().unwrap(),
        ]);
        let mode = args.resolve_mode().unwrap();
        let cfg = args.target_config(&mode);
        InstallContext::new(cfg, false, false, force, false)
    }

    #[tokio::test]
    async fn empty_target_passes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = ctx_with_dir(dir.path(), false);
        // Probe only looks at the configured paths; the conf/unit paths do
        // not exist on a dev machine.
        assert!(run(&mut ctx).await.is_ok());
    }

    #[tokio::test]
    async fn populated_target_aborts_unattended() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("leftover.txt"), "x").unwrap();
        let mut ctx = ctx_with_dir(dir.path(), false);
        let err = run(&mut ctx).await.unwrap_err();
        assert!(matches!(err, InstallError::Preflight(_)));
        assert!(!err.triggers_rollback());
    }

    #[tokio::test]
    async fn force_overrides_populated_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("leftover.txt"), "x").unwrap();
        let mut ctx = ctx_with_dir(dir.path(), true);
        assert!(run(&mut ctx).await.is_ok());
    }

    #[test]
    fn describe_lists_found_resources() {
        let existing = ExistingInstall {
            install_dir: true,
            unit_file: false,
            proxy_conf: true,
        };
        assert_eq!(existing.describe(), "install directory, proxy config");
    }
}
