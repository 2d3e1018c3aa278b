// Secure package fetcher.
//
// Download path: bounded retries with backoff+jitter, content sniffing,
// strict checksum contract, streamed SHA-256, fail closed on mismatch.
// Extraction path: isolated temp directory, traversal defense, and a
// symlink-gated flattening step.
//
// The flattening symlink policy is deliberate: a blanket "no symlinks"
// rejection breaks ordinary npm-style packages (binary shims are symlinks),
// while "allow all" lets an archive plant links that later copies would
// follow out of the sandbox. Only links under the shim allow-list are
// tolerated, and they are materialized during flattening.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{InstallError, IntegrityError};

/// Package-manager binary shims live here; symlinks under this relative
/// path are the only ones flattening tolerates.
pub const SYMLINK_SHIM_ALLOWLIST: &str = "node_modules/.bin";

/// A top-level directory counts as "the application" only when it carries
/// one of these entry files.
pub const FLATTEN_MARKERS: &[&str] = &["package.json", "sessionlens.toml"];

const DOWNLOAD_ATTEMPTS: usize = 3;
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const CHECKSUM_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_FREE_BYTES: u64 = 1_000_000_000;

/// SHA-256 hex digest (lowercase).
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug)]
pub struct FetchedArchive {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

/// The extracted (and possibly flattened) package tree. Dropping this drops
/// the temp directory and everything in it.
#[derive(Debug)]
pub struct ExtractedPackage {
    temp: TempDir,
    pub flattened: bool,
}

impl ExtractedPackage {
    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    #[cfg(test)]
    pub(crate) fn from_parts(temp: TempDir, flattened: bool) -> Self {
        Self { temp, flattened }
    }
}

/// The companion checksum must be exactly one 64-character hex digest after
/// whitespace trimming. Anything else is a tampering signal.
pub fn parse_checksum_body(body: &str) -> Result<String, IntegrityError> {
    let trimmed = body.trim();
    if trimmed.len() != 64 || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(IntegrityError::MalformedChecksum);
    }
    Ok(trimmed.to_ascii_lowercase())
}

/// Magic-byte sniff: the download must look like a ZIP before anything
/// trusts it. (`PK\x03\x04` local header; `PK\x05\x06` empty archive.)
pub fn sniff_is_zip(head: &[u8]) -> bool {
    head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06")
}

/// Download the versioned bundle and its sibling checksum, verify, and
/// return the local archive. The partial download is discarded on any
/// integrity failure; the install directory is never touched here.
pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    checksum_url: &str,
    work_dir: &Path,
) -> Result<FetchedArchive, InstallError> {
    info!(
        "[PHASE: fetch] [STEP: start] Fetching package (url={})",
        crate::utils::logging::mask_url_credentials(url)
    );

    let free = crate::utils::disk::free_space_bytes(work_dir)
        .await
        .map_err(|e| InstallError::Preflight(format!("free-space probe failed: {e}")))?;
    if free < MIN_FREE_BYTES {
        return Err(InstallError::Preflight(format!(
            "insufficient disk space for download (free={} MB, minimum={} MB)",
            free / 1_000_000,
            MIN_FREE_BYTES / 1_000_000
        )));
    }

    let archive_path = work_dir.join("sessionlens-package.zip");

    let downloaded = download_with_retries(client, url, &archive_path).await?;

    if !sniff_is_zip(&downloaded.head) {
        let _ = tokio::fs::remove_file(&archive_path).await;
        return Err(IntegrityError::WrongContentType.into());
    }

    let expected = fetch_checksum(client, checksum_url).await?;
    if downloaded.sha256 != expected {
        warn!(
            "[PHASE: fetch] [STEP: verify] Checksum mismatch; discarding download (expected={}, actual={})",
            expected, downloaded.sha256
        );
        let _ = tokio::fs::remove_file(&archive_path).await;
        return Err(IntegrityError::ChecksumMismatch {
            expected,
            actual: downloaded.sha256,
        }
        .into());
    }

    info!(
        "[PHASE: fetch] [STEP: verify] Package verified (bytes={}, sha256={})",
        downloaded.bytes, downloaded.sha256
    );

    Ok(FetchedArchive {
        path: archive_path,
        sha256: downloaded.sha256,
        bytes: downloaded.bytes,
    })
}

struct Downloaded {
    sha256: String,
    bytes: u64,
    head: Vec<u8>,
}

async fn download_with_retries(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<Downloaded, InstallError> {
    let retry_strategy = ExponentialBackoff::from_millis(500)
        .factor(2)
        .max_delay(Duration::from_secs(10))
        .take(DOWNLOAD_ATTEMPTS - 1)
        .map(jitter);

    let attempt = || async { download_once(client, url, dest).await };

    RetryIf::spawn(retry_strategy, attempt, |e: &InstallError| {
        let retry = matches!(e, InstallError::Connectivity(_) | InstallError::Timeout(_));
        if retry {
            warn!(
                "[PHASE: fetch] [STEP: retry] Transient download failure; will retry ({})",
                e
            );
        }
        retry
    })
    .await
}

async fn download_once(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<Downloaded, InstallError> {
    let response = tokio::time::timeout(DOWNLOAD_TIMEOUT, async {
        let resp = client.get(url).send().await.map_err(sanitize_reqwest)?;
        if !resp.status().is_success() {
            return Err(InstallError::Connectivity(format!(
                "package origin returned HTTP {}",
                resp.status().as_u16()
            )));
        }

        let total = resp.content_length();
        let bar = match total {
            Some(len) => {
                let bar = ProgressBar::new(len);
                bar.set_style(
                    ProgressStyle::with_template(
                        "{msg} [{bar:30}] {bytes}/{total_bytes} ({eta})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar.set_message("downloading");
                bar
            }
            None => ProgressBar::hidden(),
        };

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| InstallError::Preflight(format!("cannot create download file: {e}")))?;
        let mut hasher = Sha256::new();
        let mut head: Vec<u8> = Vec::with_capacity(8);
        let mut bytes: u64 = 0;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(sanitize_reqwest)?;
            if head.len() < 8 {
                head.extend_from_slice(&chunk[..chunk.len().min(8 - head.len())]);
            }
            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| InstallError::Preflight(format!("download write failed: {e}")))?;
            bytes = bytes.saturating_add(chunk.len() as u64);
            bar.inc(chunk.len() as u64);
        }
        file.flush()
            .await
            .map_err(|e| InstallError::Preflight(format!("download flush failed: {e}")))?;
        bar.finish_and_clear();

        let sha256 = hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        Ok(Downloaded { sha256, bytes, head })
    })
    .await;

    match response {
        Ok(result) => result,
        Err(_) => {
            let _ = tokio::fs::remove_file(dest).await;
            Err(InstallError::Timeout(format!(
                "package download exceeded {}s",
                DOWNLOAD_TIMEOUT.as_secs()
            )))
        }
    }
}

async fn fetch_checksum(
    client: &reqwest::Client,
    checksum_url: &str,
) -> Result<String, InstallError> {
    let body = tokio::time::timeout(CHECKSUM_TIMEOUT, async {
        let resp = client
            .get(checksum_url)
            .send()
            .await
            .map_err(sanitize_reqwest)?;
        if !resp.status().is_success() {
            return Err(InstallError::Connectivity(format!(
                "checksum origin returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        resp.text().await.map_err(sanitize_reqwest)
    })
    .await
    .map_err(|_| InstallError::Timeout("checksum download timed out".to_string()))??;

    Ok(parse_checksum_body(&body)?)
}

/// Never echo reqwest's internal error text (it can embed full URLs and
/// socket addresses) to the user.
pub(crate) fn sanitize_reqwest(e: reqwest::Error) -> InstallError {
    if e.is_timeout() {
        InstallError::Timeout("package origin did not respond in time".to_string())
    } else if e.is_connect() {
        InstallError::Connectivity("package origin is unreachable".to_string())
    } else {
        InstallError::Connectivity("package download failed".to_string())
    }
}

// ============================================================================
// Extraction
// ============================================================================

/// Unpack the archive into an isolated temp directory, then flatten a single
/// redundant top-level directory when the symlink policy allows it.
///
/// Synchronous (the zip crate is); callers on the async path wrap this in
/// `spawn_blocking`.
pub fn extract_archive(archive_path: &Path) -> Result<ExtractedPackage, InstallError> {
    let temp = TempDir::new()
        .map_err(|e| InstallError::Preflight(format!("cannot create extraction dir: {e}")))?;
    let canonical_root = temp
        .path()
        .canonicalize()
        .map_err(|e| InstallError::Preflight(format!("cannot resolve extraction dir: {e}")))?;

    let file = std::fs::File::open(archive_path)
        .map_err(|e| InstallError::Preflight(format!("cannot open archive: {e}")))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|_| IntegrityError::WrongContentType)?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|_| IntegrityError::WrongContentType)?;

        let rel = entry
            .enclosed_name()
            .map(Path::to_path_buf)
            .ok_or_else(|| IntegrityError::PathTraversal(PathBuf::from(entry.name())))?;
        let out_path = temp.path().join(&rel);

        // The resolved real path of every entry must stay inside the
        // extraction root, even when an earlier entry created a symlinked
        // directory on the way there.
        ensure_within(&canonical_root, &out_path)
            .map_err(|_| IntegrityError::PathTraversal(rel.clone()))?;

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|e| InstallError::Preflight(format!("extract mkdir failed: {e}")))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| InstallError::Preflight(format!("extract mkdir failed: {e}")))?;
        }

        let unix_mode = entry.unix_mode();
        let is_symlink = unix_mode.map(|m| m & 0o170000 == 0o120000).unwrap_or(false);

        if is_symlink {
            #[cfg(unix)]
            {
                let mut target = String::new();
                entry
                    .read_to_string(&mut target)
                    .map_err(|_| IntegrityError::DisallowedSymlink(rel.clone()))?;
                std::os::unix::fs::symlink(&target, &out_path).map_err(|e| {
                    InstallError::Preflight(format!("symlink create failed: {e}"))
                })?;
                continue;
            }
            #[cfg(not(unix))]
            return Err(IntegrityError::DisallowedSymlink(rel).into());
        }

        let mut out_file = std::fs::File::create(&out_path)
            .map_err(|e| InstallError::Preflight(format!("extract create failed: {e}")))?;
        std::io::copy(&mut entry, &mut out_file)
            .map_err(|e| InstallError::Preflight(format!("extract write failed: {e}")))?;

        #[cfg(unix)]
        if let Some(mode) = unix_mode {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode & 0o777));
        }
    }

    let flattened = flatten_if_single_top(temp.path())?;
    Ok(ExtractedPackage { temp, flattened })
}

/// Require that the deepest existing ancestor of `candidate` resolves inside
/// `canonical_root`.
fn ensure_within(canonical_root: &Path, candidate: &Path) -> anyhow::Result<()> {
    let mut probe = candidate
        .parent()
        .ok_or_else(|| anyhow::anyhow!("entry has no parent"))?;
    loop {
        if probe.exists() {
            let resolved = probe
                .canonicalize()
                .with_context(|| format!("cannot resolve {:?}", probe))?;
            if !resolved.starts_with(canonical_root) {
                anyhow::bail!("resolved path {:?} escapes extraction root", resolved);
            }
            return Ok(());
        }
        probe = probe
            .parent()
            .ok_or_else(|| anyhow::anyhow!("entry escapes all ancestors"))?;
    }
}

/// If the extraction root contains exactly one top-level directory carrying
/// an expected entry file, collapse it into the root.
///
/// Returns whether flattening happened. Archives with any symlink outside
/// the shim allow-list keep their nested layout unchanged; symlinks that
/// resolve outside the package tree are an integrity violation either way.
pub fn flatten_if_single_top(root: &Path) -> Result<bool, InstallError> {
    let entries: Vec<std::fs::DirEntry> = std::fs::read_dir(root)
        .map_err(|e| InstallError::Preflight(format!("read extraction dir failed: {e}")))?
        .collect::<std::io::Result<_>>()
        .map_err(|e| InstallError::Preflight(format!("read extraction dir failed: {e}")))?;

    if entries.len() != 1 {
        return Ok(false);
    }
    let top = entries[0].path();
    let top_meta = std::fs::symlink_metadata(&top)
        .map_err(|e| InstallError::Preflight(format!("stat failed: {e}")))?;
    if !top_meta.is_dir() {
        return Ok(false);
    }

    if !FLATTEN_MARKERS.iter().any(|m| top.join(m).is_file()) {
        return Ok(false);
    }

    let canonical_root = root
        .canonicalize()
        .map_err(|e| InstallError::Preflight(format!("cannot resolve extraction dir: {e}")))?;

    // Enumerate every symlink before moving anything.
    let symlinks = collect_symlinks(&top)
        .map_err(|e| InstallError::Preflight(format!("symlink walk failed: {e}")))?;
    for link in &symlinks {
        let rel = link.strip_prefix(&top).unwrap_or(link);
        if !rel.starts_with(SYMLINK_SHIM_ALLOWLIST) {
            info!(
                "[PHASE: fetch] [STEP: flatten] Symlink outside shim allow-list; keeping nested layout (link={:?})",
                rel
            );
            return Ok(false);
        }
        // Allow-listed shims must still resolve inside the package tree.
        let resolved = link
            .canonicalize()
            .map_err(|_| IntegrityError::DisallowedSymlink(rel.to_path_buf()))?;
        if !resolved.starts_with(&canonical_root) {
            return Err(IntegrityError::DisallowedSymlink(rel.to_path_buf()).into());
        }
    }

    // Materialize the shims so the flattened tree contains zero symlinks.
    for link in &symlinks {
        let resolved = link
            .canonicalize()
            .map_err(|_| IntegrityError::DisallowedSymlink(link.clone()))?;
        std::fs::remove_file(link)
            .map_err(|e| InstallError::Preflight(format!("shim unlink failed: {e}")))?;
        std::fs::copy(&resolved, link)
            .map_err(|e| InstallError::Preflight(format!("shim materialize failed: {e}")))?;
    }

    for entry in std::fs::read_dir(&top)
        .map_err(|e| InstallError::Preflight(format!("read top dir failed: {e}")))?
    {
        let entry = entry.map_err(|e| InstallError::Preflight(format!("read top dir: {e}")))?;
        let from = entry.path();
        let to = root.join(entry.file_name());
        std::fs::rename(&from, &to)
            .map_err(|e| InstallError::Preflight(format!("flatten rename failed: {e}")))?;
    }
    std::fs::remove_dir(&top)
        .map_err(|e| InstallError::Preflight(format!("flatten cleanup failed: {e}")))?;

    info!("[PHASE: fetch] [STEP: flatten] Collapsed single top-level directory");
    Ok(true)
}

fn collect_symlinks(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let meta = std::fs::symlink_metadata(&path)?;
            if meta.file_type().is_symlink() {
                out.push(path);
            } else if meta.is_dir() {
                stack.push(path);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_zip(build: impl FnOnce(&mut zip::ZipWriter<std::fs::File>)) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pkg.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        build(&mut writer);
        writer.finish().unwrap();
        (dir, path)
    }

    fn file_options() -> zip::write::FileOptions {
        zip::write::FileOptions::default().unix_permissions(0o644)
    }

    #[test]
    fn checksum_contract_accepts_only_bare_64_hex() {
        let digest = "a".repeat(64);
        assert_eq!(parse_checksum_body(&digest).unwrap(), digest);
        assert_eq!(
            parse_checksum_body(&format!("  {}\n", digest.to_uppercase())).unwrap(),
            digest
        );

        assert!(parse_checksum_body("").is_err());
        assert!(parse_checksum_body(&"a".repeat(63)).is_err());
        assert!(parse_checksum_body(&format!("{}  pkg.zip", digest)).is_err());
        assert!(parse_checksum_body(&format!("{}zz", &digest[..62])).is_err());
        assert!(parse_checksum_body("<html>Not Found</html>").is_err());
    }

    #[test]
    fn zip_sniff() {
        assert!(sniff_is_zip(b"PK\x03\x04rest"));
        assert!(sniff_is_zip(b"PK\x05\x06"));
        assert!(!sniff_is_zip(b"\x1f\x8b\x08gzip"));
        assert!(!sniff_is_zip(b"<html>"));
    }

    #[test]
    fn traversal_entry_fails_extraction() {
        let (_dir, path) = write_zip(|w| {
            w.start_file("../evil.txt", file_options()).unwrap();
            w.write_all(b"boom").unwrap();
        });

        let err = extract_archive(&path).expect_err("traversal must fail");
        assert!(matches!(
            err,
            InstallError::Integrity(IntegrityError::PathTraversal(_))
        ));
    }

    #[test]
    fn clean_archive_extracts_and_flattens() {
        let (_dir, path) = write_zip(|w| {
            w.add_directory("sessionlens-1.2.0/", file_options()).unwrap();
            w.start_file("sessionlens-1.2.0/package.json", file_options())
                .unwrap();
            w.write_all(b"{}").unwrap();
            w.start_file("sessionlens-1.2.0/server.js", file_options())
                .unwrap();
            w.write_all(b"// app").unwrap();
        });

        let pkg = extract_archive(&path).expect("extract");
        assert!(pkg.flattened);
        assert!(pkg.root().join("package.json").is_file());
        assert!(pkg.root().join("server.js").is_file());
        assert!(!pkg.root().join("sessionlens-1.2.0").exists());
    }

    #[test]
    fn archive_without_marker_is_not_flattened() {
        let (_dir, path) = write_zip(|w| {
            w.start_file("data-1.0/readme.txt", file_options()).unwrap();
            w.write_all(b"hi").unwrap();
        });

        let pkg = extract_archive(&path).expect("extract");
        assert!(!pkg.flattened);
        assert!(pkg.root().join("data-1.0/readme.txt").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn shim_symlinks_flatten_to_zero_symlinks() {
        let root = TempDir::new().unwrap();
        let top = root.path().join("sessionlens-1.2.0");
        std::fs::create_dir_all(top.join("node_modules/.bin")).unwrap();
        std::fs::create_dir_all(top.join("node_modules/esbuild/bin")).unwrap();
        std::fs::write(top.join("package.json"), "{}").unwrap();
        std::fs::write(top.join("node_modules/esbuild/bin/esbuild"), "#!/bin/sh\n").unwrap();
        std::os::unix::fs::symlink(
            "../esbuild/bin/esbuild",
            top.join("node_modules/.bin/esbuild"),
        )
        .unwrap();

        let flattened = flatten_if_single_top(root.path()).expect("flatten");
        assert!(flattened);
        assert!(root.path().join("package.json").is_file());

        let leftovers = collect_symlinks(root.path()).unwrap();
        assert!(leftovers.is_empty(), "symlinks remained: {:?}", leftovers);
        assert!(root.path().join("node_modules/.bin/esbuild").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_outside_shim_path_skips_flattening() {
        let root = TempDir::new().unwrap();
        let top = root.path().join("sessionlens-1.2.0");
        std::fs::create_dir_all(&top).unwrap();
        std::fs::write(top.join("package.json"), "{}").unwrap();
        std::fs::write(top.join("config.real"), "x").unwrap();
        std::os::unix::fs::symlink("config.real", top.join("config")).unwrap();

        let flattened = flatten_if_single_top(root.path()).expect("decision");
        assert!(!flattened);
        // Nested layout preserved unchanged, symlink intact.
        let meta = std::fs::symlink_metadata(top.join("config")).unwrap();
        assert!(meta.file_type().is_symlink());
        assert!(top.join("package.json").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn shim_symlink_escaping_the_tree_is_an_integrity_error() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("victim"), "secret").unwrap();

        let root = TempDir::new().unwrap();
        let top = root.path().join("sessionlens-1.2.0");
        std::fs::create_dir_all(top.join("node_modules/.bin")).unwrap();
        std::fs::write(top.join("package.json"), "{}").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("victim"),
            top.join("node_modules/.bin/escape"),
        )
        .unwrap();

        let err = flatten_if_single_top(root.path()).expect_err("must fail");
        assert!(matches!(
            err,
            InstallError::Integrity(IntegrityError::DisallowedSymlink(_))
        ));
    }
}
