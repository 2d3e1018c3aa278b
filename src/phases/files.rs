// File installation: copy the verified package tree into the install
// directory, install runtime dependencies, and write the environment files.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::info;
use tokio::time::Duration;

use crate::cli::InstallMode;
use crate::credentials::{write_secret_file, Credentials};
use crate::error::InstallError;
use crate::exec::run_cmd_with_timeout;
use crate::rollback::UndoAction;

use super::InstallContext;

const NPM_TIMEOUT: Duration = Duration::from_secs(600);

/// Recursive copy preserving the tree shape. Symlinks are recreated as
/// symlinks; a flattened package tree contains none, an unflattened one may.
fn copy_tree(src: &Path, dst: &Path) -> Result<u64> {
    std::fs::create_dir_all(dst).with_context(|| format!("cannot create {dst:?}"))?;
    let mut copied = 0u64;
    for entry in std::fs::read_dir(src).with_context(|| format!("cannot read {src:?}"))? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = std::fs::symlink_metadata(&from)?;
        if meta.file_type().is_symlink() {
            #[cfg(unix)]
            {
                let target = std::fs::read_link(&from)?;
                if to.exists() {
                    std::fs::remove_file(&to)?;
                }
                std::os::unix::fs::symlink(&target, &to)
                    .with_context(|| format!("cannot recreate symlink {to:?}"))?;
                copied += 1;
            }
            #[cfg(not(unix))]
            return Err(anyhow!("symlink in package tree unsupported on this platform"));
        } else if meta.is_dir() {
            copied += copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).with_context(|| format!("cannot copy {from:?}"))?;
            copied += 1;
        }
    }
    Ok(copied)
}

async fn npm_install(install_dir: &Path) -> Result<()> {
    if !install_dir.join("package.json").exists() {
        info!("[PHASE: install-files] [STEP: deps] No package.json; skipping dependency install");
        return Ok(());
    }
    let out = run_cmd_with_timeout(
        "npm",
        &[
            "--prefix".to_string(),
            install_dir.to_string_lossy().to_string(),
            "ci".to_string(),
            "--omit=dev".to_string(),
        ],
        NPM_TIMEOUT,
        "files_npm_ci",
    )
    .await?;
    if !out.success() {
        return Err(anyhow!(
            "npm ci failed (exit_code={:?}): {}",
            out.exit_code,
            out.stderr.trim()
        ));
    }
    Ok(())
}

/// Non-secret client configuration for client-only installs.
fn client_env_contents(origin: &str, flavor: &str) -> String {
    format!(
        "# Generated by sessionlens-install\nSESSIONLENS_ORIGIN={origin}\nSESSIONLENS_CLIENT_FLAVOR={flavor}\n"
    )
}

async fn write_env_files(ctx: &mut InstallContext) -> Result<()> {
    match &ctx.cfg.mode {
        InstallMode::FullStack { domain } => {
            let creds: &Credentials = ctx
                .credentials
                .as_ref()
                .ok_or_else(|| anyhow!("credentials not generated"))?;
            let contents = creds.secret_file_contents(domain);
            let path = ctx.cfg.secret_file_path();
            write_secret_file(&path, &contents).await?;
            ctx.undo.push(UndoAction::EraseSecretFile { path });
        }
        InstallMode::ClientOnly { origin, flavor } => {
            let path = ctx.cfg.install_dir.join("client.env");
            tokio::fs::write(&path, client_env_contents(origin, flavor.as_str()))
                .await
                .with_context(|| format!("cannot write {path:?}"))?;
        }
    }
    Ok(())
}

async fn install(ctx: &mut InstallContext) -> Result<()> {
    let package = ctx
        .package
        .as_ref()
        .ok_or_else(|| anyhow!("package not fetched"))?;

    if ctx.dry_run_gate(&format!(
        "copy package tree into {:?}, run npm ci, write environment files",
        ctx.cfg.install_dir
    )) {
        return Ok(());
    }

    let src = package.root().to_path_buf();
    let dst = ctx.cfg.install_dir.clone();
    let copied = tokio::task::spawn_blocking(move || copy_tree(&src, &dst))
        .await
        .context("copy task failed")??;
    // The tree is on disk from here on; record it before the marker check
    // so a failure anywhere in the rest of this phase removes it.
    ctx.undo.push(UndoAction::RemoveInstalledFiles {
        dir: ctx.cfg.install_dir.clone(),
    });
    info!(
        "[PHASE: install-files] [STEP: copy] Copied {} entries into {:?}",
        copied, ctx.cfg.install_dir
    );

    // Verification: the copied tree must carry one of the package markers.
    let markered = crate::fetcher::FLATTEN_MARKERS
        .iter()
        .any(|m| ctx.cfg.install_dir.join(m).exists());
    if !markered {
        return Err(anyhow!(
            "copied tree is missing the package marker file; refusing to continue"
        ));
    }

    npm_install(&ctx.cfg.install_dir).await?;
    write_env_files(ctx).await?;

    info!("[PHASE: install-files] [STEP: done] Files installed");
    Ok(())
}

pub async fn run(ctx: &mut InstallContext) -> Result<(), InstallError> {
    install(ctx)
        .await
        .map_err(|e| InstallError::phase("install-files", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_preserves_nesting() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("lib/util")).unwrap();
        std::fs::write(src.path().join("package.json"), "{}").unwrap();
        std::fs::write(src.path().join("lib/util/a.js"), "x").unwrap();

        let copied = copy_tree(src.path(), dst.path()).unwrap();
        assert_eq!(copied, 2);
        assert!(dst.path().join("package.json").exists());
        assert!(dst.path().join("lib/util/a.js").exists());
    }

    #[cfg(unix)]
    #[test]
    fn copy_tree_recreates_symlinks() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("real.js"), "x").unwrap();
        std::os::unix::fs::symlink("real.js", src.path().join("alias.js")).unwrap();

        copy_tree(src.path(), dst.path()).unwrap();
        let meta = std::fs::symlink_metadata(dst.path().join("alias.js")).unwrap();
        assert!(meta.file_type().is_symlink());
    }

    #[test]
    fn client_env_is_plain_key_value() {
        let contents = client_env_contents("https://replay.example.com", "project");
        assert!(contents.contains("SESSIONLENS_ORIGIN=https://replay.example.com"));
        assert!(contents.contains("SESSIONLENS_CLIENT_FLAVOR=project"));
    }

    #[tokio::test]
    async fn failed_marker_check_still_records_the_copied_tree() {
        use clap::Parser;
        use crate::fetcher::ExtractedPackage;
        use crate::phases::InstallContext;

        // A package with no marker file: the copy lands, verification fails.
        let pkg = tempfile::tempdir().unwrap();
        std::fs::write(pkg.path().join("data"), "x").unwrap();
        let target = tempfile::tempdir().unwrap();
        let install_dir = target.path().join("app");

        let args = crate::cli::InstallArgs::parse_from([
            "sessionlens-install",
            "--domain",
            "example.com",
        ]);
        let mode = args.resolve_mode().unwrap();
        let mut cfg = args.target_config(&mode);
        cfg.install_dir = install_dir.clone();
        let mut ctx = InstallContext::new(cfg, false, false, false, false);
        ctx.package = Some(ExtractedPackage::from_parts(pkg, false));

        let err = run(&mut ctx).await.unwrap_err();
        assert!(err.triggers_rollback());
        // The partial tree exists, and the undo stack knows about it.
        assert!(install_dir.join("data").exists());
        let actions = ctx.undo.drain_reverse();
        assert!(actions
            .iter()
            .any(|a| matches!(a, UndoAction::RemoveInstalledFiles { dir } if *dir == install_dir)));
    }
}
