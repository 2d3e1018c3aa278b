// Credential generation and secret-file lifecycle.
//
// Secrets are drawn from an alphanumeric alphabet, so no shell or SQL
// metacharacter can ever appear in one; interpolation sites still quote
// defensively. Secrets are never logged; only fingerprints are.

use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use ring::rand::{SecureRandom, SystemRandom};
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;

use crate::exec::run_cmd_with_timeout;

const SECRET_LEN: usize = 32;
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const OVERWRITE_PASSES: usize = 3;

pub const DEFAULT_AUTH_USER: &str = "sessionlens-admin";

/// A generated secret. `Debug` is redacted so a stray `{:?}` of any struct
/// holding one cannot leak it.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Stable, non-reversible identifier safe to log.
    pub fn fingerprint(&self) -> String {
        crate::fetcher::sha256_hex(self.0.as_bytes())[..12].to_string()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}

/// The full credentials bundle for one installation. Generated once at
/// orchestrator start, written to the permissioned secret file and the
/// proxy's auth store, destroyed on rollback.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub db_password: Secret,
    pub admin_key: Secret,
    pub auth_user: String,
    pub auth_password: Secret,
}

impl Credentials {
    pub fn generate() -> Result<Self> {
        let rng = SystemRandom::new();
        Ok(Self {
            db_password: generate_secret(&rng)?,
            admin_key: generate_secret(&rng)?,
            auth_user: DEFAULT_AUTH_USER.to_string(),
            auth_password: generate_secret(&rng)?,
        })
    }

    /// Env-file body consumed by the supervised process.
    pub fn secret_file_contents(&self, origin: &str) -> String {
        format!(
            "SESSIONLENS_ORIGIN={}\nSESSIONLENS_DB_PASSWORD={}\nSESSIONLENS_ADMIN_KEY={}\nSESSIONLENS_AUTH_USER={}\nSESSIONLENS_AUTH_PASSWORD={}\n",
            origin,
            self.db_password.expose(),
            self.admin_key.expose(),
            self.auth_user,
            self.auth_password.expose(),
        )
    }
}

/// Rejection-sampled so every alphabet character is equally likely.
fn generate_secret(rng: &SystemRandom) -> Result<Secret> {
    let mut out = String::with_capacity(SECRET_LEN);
    let mut buf = [0u8; 64];
    // 62 * 4 = 248 is the largest multiple of the alphabet size below 256.
    let limit = (256 / ALPHABET.len()) * ALPHABET.len();

    while out.len() < SECRET_LEN {
        rng.fill(&mut buf)
            .map_err(|_| anyhow::anyhow!("Failed to draw random bytes"))?;
        for &b in buf.iter() {
            if (b as usize) < limit {
                out.push(ALPHABET[b as usize % ALPHABET.len()] as char);
                if out.len() == SECRET_LEN {
                    break;
                }
            }
        }
    }
    Ok(Secret(out))
}

/// Remove shell and SQL metacharacters from an externally supplied secret.
/// Generated secrets never contain any; this guards values that arrive over
/// the relay.
pub fn strip_metacharacters(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        .collect()
}

/// Write the secret file with owner-only permissions, created fresh so mode
/// bits apply before any contents land.
pub async fn write_secret_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create secret directory: {:?}", parent))?;
    }

    let mut opts = tokio::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);
    let mut file = opts
        .open(path)
        .await
        .with_context(|| format!("Failed to create secret file: {:?}", path))?;
    file.write_all(contents.as_bytes()).await?;
    file.flush().await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Re-assert in case the file pre-existed with looser bits.
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    info!(
        "[PHASE: credentials] [STEP: secret_file] Wrote secret file (path={:?}, bytes={})",
        path,
        contents.len()
    );
    Ok(())
}

/// Multi-pass secure erase then unlink. Prefers `shred`; falls back to
/// overwriting with random data when it is unavailable.
pub async fn secure_erase(path: &Path) -> Result<()> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }

    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid secret path"))?
        .to_string();

    let shred = run_cmd_with_timeout(
        "shred",
        &[
            "-u".to_string(),
            "-n".to_string(),
            OVERWRITE_PASSES.to_string(),
            path_str,
        ],
        Duration::from_secs(30),
        "secure_erase_shred",
    )
    .await;

    match shred {
        Ok(out) if out.success() => {
            info!(
                "[PHASE: rollback] [STEP: secure_erase] shred removed secret file (path={:?})",
                path
            );
            return Ok(());
        }
        Ok(out) => {
            warn!(
                "[PHASE: rollback] [STEP: secure_erase] shred failed (exit_code={:?}); falling back to random overwrite",
                out.exit_code
            );
        }
        Err(e) => {
            warn!(
                "[PHASE: rollback] [STEP: secure_erase] shred unavailable ({}); falling back to random overwrite",
                e
            );
        }
    }

    overwrite_with_random(path).await?;
    tokio::fs::remove_file(path)
        .await
        .with_context(|| format!("Failed to unlink secret file: {:?}", path))?;
    info!(
        "[PHASE: rollback] [STEP: secure_erase] Overwrote and unlinked secret file (path={:?})",
        path
    );
    Ok(())
}

async fn overwrite_with_random(path: &Path) -> Result<()> {
    let len = tokio::fs::metadata(path).await?.len() as usize;
    let rng = SystemRandom::new();

    for pass in 1..=OVERWRITE_PASSES {
        let mut junk = vec![0u8; len.max(1)];
        rng.fill(&mut junk)
            .map_err(|_| anyhow::anyhow!("Failed to draw random bytes for overwrite"))?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("Failed to reopen secret file for overwrite: {:?}", path))?;
        file.write_all(&junk).await?;
        file.sync_all().await?;
        log::debug!(
            "[PHASE: rollback] [STEP: secure_erase] overwrite pass {}/{} (path={:?})",
            pass,
            OVERWRITE_PASSES,
            path
        );
    }
    Ok(())
}
