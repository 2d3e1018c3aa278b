// Installer error taxonomy.
//
// The split matters for rollback: preflight and integrity failures happen
// before anything mutated, so the install directory and services are left
// untouched. A `Phase` failure means a mutating phase's own verification
// failed and the undo stack must be unwound.

use std::path::PathBuf;

use thiserror::Error;

/// Package integrity violations. All of these are fatal: the partial
/// download is discarded and the install directory is never touched.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    /// The companion checksum file must be exactly one 64-character hex
    /// digest. Anything else is treated as a tampering signal.
    #[error("checksum file is not a 64-character hex digest")]
    MalformedChecksum,

    #[error("downloaded file is not a recognized archive")]
    WrongContentType,

    #[error("archive entry escapes the extraction directory: {0:?}")]
    PathTraversal(PathBuf),

    #[error("archive symlink resolves outside the package tree: {0:?}")]
    DisallowedSymlink(PathBuf),
}

#[derive(Debug, Error)]
pub enum InstallError {
    /// A read-only check failed before anything mutated. No rollback runs.
    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("package integrity violation: {0}")]
    Integrity(#[from] IntegrityError),

    /// A mutating phase's own verification failed. Triggers rollback.
    #[error("phase '{phase}' failed: {source}")]
    Phase {
        phase: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Unreachable host / rejected auth during preflight probes. Messages
    /// are sanitized before reaching the user.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl InstallError {
    pub fn phase(phase: &'static str, source: anyhow::Error) -> Self {
        Self::Phase { phase, source }
    }

    /// Only `Phase` failures leave mutations behind that need undoing.
    pub fn triggers_rollback(&self) -> bool {
        matches!(self, Self::Phase { .. } | Self::Timeout(_))
    }

    /// CLI exit code contract: 0 success, 1 failure after best-effort
    /// rollback, 2 argument errors (clap), 3 connectivity errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Connectivity(_) => 3,
            _ => 1,
        }
    }
}

/// Tunnel-upgrade refusals from the relay. The connection is closed after a
/// single error frame; no session resources are allocated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("unknown install token")]
    Unknown,

    #[error("install token has expired")]
    Expired,

    #[error("install token was minted for a different address")]
    IpMismatch,

    #[error("install token was already used")]
    AlreadyConsumed,

    #[error("too many token requests from this address")]
    RateLimited,

    #[error("relay is at capacity")]
    CapacityReached,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_maps_to_exit_code_three() {
        let err = InstallError::Connectivity("origin unreachable".into());
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn phase_failures_trigger_rollback_but_preflight_does_not() {
        let phase = InstallError::phase("configure-proxy", anyhow::anyhow!("nginx -t failed"));
        assert!(phase.triggers_rollback());
        assert_eq!(phase.exit_code(), 1);

        let pre = InstallError::Preflight("psql not found".into());
        assert!(!pre.triggers_rollback());

        let integrity = InstallError::Integrity(IntegrityError::MalformedChecksum);
        assert!(!integrity.triggers_rollback());
    }
}
