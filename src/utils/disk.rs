// Free-space and memory probing for preflight checks.
//
// We only *detect* capacity; nothing here modifies disks or volumes.

use std::path::Path;

use anyhow::{Context, Result};
use log::debug;
use tokio::time::Duration;

use crate::exec::run_cmd_with_timeout;

/// Best-effort free-space check for a given filesystem path (returns bytes).
///
/// Uses `df -Pk <path>` (POSIX output) and parses the "Available" column.
pub async fn free_space_bytes(path: &Path) -> Result<u64> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid path"))?
        .to_string();

    let out = run_cmd_with_timeout(
        "df",
        &["-Pk".to_string(), path_str],
        Duration::from_secs(10),
        "preflight_free_space_df",
    )
    .await?;

    if out.exit_code != Some(0) {
        anyhow::bail!("Failed to query free space (exit_code={:?})", out.exit_code);
    }

    // Expect:
    // Filesystem 1024-blocks Used Available Capacity Mounted on
    // ...
    let mut lines = out.stdout.lines();
    let _header = lines.next();
    let data = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("df output missing data row"))?;
    let cols: Vec<&str> = data.split_whitespace().collect();
    if cols.len() < 4 {
        anyhow::bail!("df output parse error");
    }
    let avail_kb: u64 = cols[3]
        .parse()
        .with_context(|| format!("Unable to parse df available KB '{}'", cols[3]))?;
    Ok(avail_kb.saturating_mul(1024))
}

/// Available memory in MB from /proc/meminfo (MemAvailable).
pub async fn available_memory_mb() -> Result<u64> {
    let contents = tokio::fs::read_to_string("/proc/meminfo")
        .await
        .context("Failed to read /proc/meminfo")?;
    let mb = parse_meminfo_available_mb(&contents)
        .ok_or_else(|| anyhow::anyhow!("MemAvailable not present in /proc/meminfo"))?;
    debug!(
        "[PHASE: preflight] [STEP: memory] available_memory_mb={}",
        mb
    );
    Ok(mb)
}

fn parse_meminfo_available_mb(contents: &str) -> Option<u64> {
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .ok()?;
            return Some(kb / 1024);
        }
    }
    None
}
