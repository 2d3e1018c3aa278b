// Preflight checks. Read-only against the target host: nothing here
// mutates, so a failure aborts the run without rollback.
//
// The package fetch also happens here. Downloading and verifying into a
// temp directory touches nothing the installer owns, and it means an
// integrity failure surfaces before the first mutating phase.

use std::time::Duration;

use log::{info, warn};
use tokio::net::TcpListener;

use crate::cli::InstallMode;
use crate::error::InstallError;
use crate::fetcher;
use crate::utils::disk;

use super::InstallContext;

const MIN_FREE_DISK_BYTES: u64 = 1024 * 1024 * 1024;
const MIN_AVAILABLE_MEMORY_MB: u64 = 512;
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

fn required_tools(mode: &InstallMode) -> &'static [&'static str] {
    match mode {
        InstallMode::FullStack { .. } => {
            &["psql", "nginx", "systemctl", "node", "npm", "openssl"]
        }
        InstallMode::ClientOnly { .. } => &["node", "npm"],
    }
}

async fn check_tools(mode: &InstallMode) -> Result<(), InstallError> {
    let mut missing = Vec::new();
    for tool in required_tools(mode) {
        match which::which(tool) {
            Ok(path) => {
                info!(
                    "[PHASE: preflight] [STEP: tools] {} found at {:?}",
                    tool, path
                );
            }
            Err(_) => missing.push(*tool),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(InstallError::Preflight(format!(
            "required tools not found on PATH: {}",
            missing.join(", ")
        )))
    }
}

async fn check_resources(ctx: &InstallContext) -> Result<(), InstallError> {
    // The install dir may not exist yet; measure its nearest existing
    // ancestor.
    let mut probe_path = ctx.cfg.install_dir.as_path();
    while !probe_path.exists() {
        probe_path = probe_path.parent().unwrap_or(std::path::Path::new("/"));
    }
    let free = disk::free_space_bytes(probe_path)
        .await
        .map_err(|e| InstallError::Preflight(format!("cannot determine free disk space: {e}")))?;
    if free < MIN_FREE_DISK_BYTES {
        return Err(InstallError::Preflight(format!(
            "insufficient disk space: {} MB free, {} MB required",
            free / (1024 * 1024),
            MIN_FREE_DISK_BYTES / (1024 * 1024)
        )));
    }

    match disk::available_memory_mb().await {
        Ok(mb) if mb < MIN_AVAILABLE_MEMORY_MB => {
            return Err(InstallError::Preflight(format!(
                "insufficient available memory: {mb} MB, {MIN_AVAILABLE_MEMORY_MB} MB required"
            )));
        }
        Ok(mb) => {
            info!("[PHASE: preflight] [STEP: resources] {} MB memory available", mb);
        }
        Err(e) => {
            // /proc/meminfo is unavailable in some containers.
            warn!(
                "[PHASE: preflight] [STEP: resources] Cannot read available memory; continuing: {}",
                e
            );
        }
    }
    Ok(())
}

async fn check_port_free(port: u16) -> Result<(), InstallError> {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(InstallError::Preflight(
            format!("port {port} is already bound; pass --app-port to choose another"),
        )),
        Err(e) => {
            warn!(
                "[PHASE: preflight] [STEP: port] Bind probe inconclusive on port {}: {}",
                port, e
            );
            Ok(())
        }
    }
}

/// Probe the origin that later steps will talk to. Failures surface as
/// `ConnectivityError` (CLI exit code 3), never as a phase failure.
async fn check_connectivity(ctx: &InstallContext) -> Result<(), InstallError> {
    let probe_url = match &ctx.cfg.mode {
        InstallMode::FullStack { .. } => ctx.cfg.package_url.clone(),
        InstallMode::ClientOnly { origin, .. } => origin.clone(),
    };
    let resp = ctx
        .http
        .head(&probe_url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .map_err(fetcher::sanitize_reqwest)?;
    info!(
        "[PHASE: preflight] [STEP: connectivity] Origin answered with status {}",
        resp.status()
    );
    Ok(())
}

pub async fn run(ctx: &mut InstallContext) -> Result<(), InstallError> {
    check_tools(&ctx.cfg.mode).await?;
    check_resources(ctx).await?;
    if matches!(ctx.cfg.mode, InstallMode::FullStack { .. }) {
        check_port_free(ctx.cfg.app_port).await?;
    }
    check_connectivity(ctx).await?;

    // Fetch and verify the package now so every integrity failure lands
    // before the first mutation.
    let work_dir = tempfile::tempdir()
        .map_err(|e| InstallError::Preflight(format!("cannot create work directory: {e}")))?;
    let archive = fetcher::fetch(
        &ctx.http,
        &ctx.cfg.package_url,
        &ctx.cfg.checksum_url,
        work_dir.path(),
    )
    .await?;
    let archive_path = archive.path.clone();
    let package =
        tokio::task::spawn_blocking(move || fetcher::extract_archive(&archive_path))
            .await
            .map_err(|e| InstallError::Preflight(format!("extraction task failed: {e}")))??;
    info!(
        "[PHASE: preflight] [STEP: package] Package verified (sha256={}, flattened={})",
        archive.sha256, package.flattened
    );
    ctx.package = Some(package);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_stack_requires_the_server_toolchain() {
        let tools = required_tools(&InstallMode::FullStack {
            domain: "example.com".into(),
        });
        for expected in ["psql", "nginx", "systemctl", "npm"] {
            assert!(tools.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn client_only_needs_no_server_tools() {
        let tools = required_tools(&InstallMode::ClientOnly {
            origin: "https://replay.example.com".into(),
            flavor: crate::cli::ClientFlavor::Source,
        });
        assert!(!tools.contains(&"psql"));
        assert!(!tools.contains(&"nginx"));
    }

    #[tokio::test]
    async fn bound_port_is_reported() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = check_port_free(port).await.unwrap_err();
        assert!(matches!(err, InstallError::Preflight(_)));
    }

    #[tokio::test]
    async fn free_port_passes() {
        // Bind to an ephemeral port, release it, then probe it.
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(check_port_free(port).await.is_ok());
    }
}
