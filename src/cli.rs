// CLI surface and mode selection.
//
// Every flag is also settable through a SESSIONLENS_* environment variable so
// the relay can drive a fully non-interactive invocation over the tunnel.

use std::io::{BufRead, Write};
use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Fixed package origin. The fetcher only ever downloads versioned bundles
/// (and their sibling checksums) from here.
pub const DEFAULT_PACKAGE_URL: &str =
    "https://packages.sessionlens.io/bundles/sessionlens-latest.zip";

pub const DEFAULT_INSTALL_DIR: &str = "/opt/sessionlens";
pub const DEFAULT_APP_PORT: u16 = 9100;
pub const SERVICE_NAME: &str = "sessionlens";
pub const DB_NAME: &str = "sessionlens";
pub const DB_ROLE: &str = "sessionlens";
pub const NGINX_CONF_PATH: &str = "/etc/nginx/conf.d/sessionlens.conf";
pub const HTPASSWD_PATH: &str = "/etc/nginx/sessionlens.htpasswd";

/// Which flavor of the reporting client a client-only install deploys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClientFlavor {
    Source,
    Project,
}

impl ClientFlavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientFlavor::Source => "source",
            ClientFlavor::Project => "project",
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "sessionlens-install", version, about = "SessionLens installer")]
pub struct InstallArgs {
    /// Install the full stack (database, proxy, supervised process) serving
    /// this domain.
    #[arg(long, env = "SESSIONLENS_DOMAIN")]
    pub domain: Option<String>,

    /// Install only the reporting client, pointed at an existing SessionLens
    /// host at this URL.
    #[arg(long, env = "SESSIONLENS_SOURCE_URL", conflicts_with = "domain")]
    pub source_url: Option<String>,

    /// Client flavor for client-only installs.
    #[arg(long, value_enum, env = "SESSIONLENS_MODE", default_value = "source")]
    pub mode: ClientFlavor,

    #[arg(long, env = "SESSIONLENS_INSTALL_DIR", default_value = DEFAULT_INSTALL_DIR)]
    pub install_dir: PathBuf,

    /// Run all read-only checks but print every mutating action instead of
    /// executing it.
    #[arg(long, env = "SESSIONLENS_DRY_RUN")]
    pub dry_run: bool,

    /// Never prompt; rollback fires automatically on phase failure.
    #[arg(long, env = "SESSIONLENS_NON_INTERACTIVE")]
    pub non_interactive: bool,

    /// Overwrite resources left behind by an existing installation.
    #[arg(long, env = "SESSIONLENS_FORCE")]
    pub force: bool,

    /// Keep the provisioned database during unattended rollback.
    #[arg(long, env = "SESSIONLENS_PRESERVE_DATA")]
    pub preserve_data: bool,

    /// Override the package bundle URL (checksum is fetched from
    /// `<url>.sha256`).
    #[arg(long, env = "SESSIONLENS_PACKAGE_URL", default_value = DEFAULT_PACKAGE_URL)]
    pub package_url: String,

    /// Port the supervised application process listens on.
    #[arg(long, env = "SESSIONLENS_APP_PORT", default_value_t = DEFAULT_APP_PORT)]
    pub app_port: u16,

    /// Debug-level logging on stderr.
    #[arg(long, short, env = "SESSIONLENS_VERBOSE")]
    pub verbose: bool,
}

/// Which provisioning flow runs, derived from which target flag was supplied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallMode {
    FullStack { domain: String },
    ClientOnly { origin: String, flavor: ClientFlavor },
}

impl InstallMode {
    pub fn label(&self) -> &'static str {
        match self {
            InstallMode::FullStack { .. } => "full-stack",
            InstallMode::ClientOnly { .. } => "client-only",
        }
    }
}

impl InstallArgs {
    /// Exactly one of `--domain` / `--source-url` must be given. Violations
    /// are argument errors (exit code 2), handled by the binary.
    pub fn resolve_mode(&self) -> Result<InstallMode, String> {
        match (&self.domain, &self.source_url) {
            (Some(domain), None) => {
                let domain = domain.trim();
                crate::utils::validation::validate_hostname(domain)
                    .map_err(|e| format!("invalid --domain: {e}"))?;
                Ok(InstallMode::FullStack {
                    domain: domain.to_string(),
                })
            }
            (None, Some(url)) => {
                let origin = url.trim();
                let parsed = url::Url::parse(origin)
                    .map_err(|_| "invalid --source-url: not a valid URL".to_string())?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err("invalid --source-url: must be http(s)".to_string());
                }
                Ok(InstallMode::ClientOnly {
                    origin: origin.trim_end_matches('/').to_string(),
                    flavor: self.mode,
                })
            }
            (Some(_), Some(_)) => {
                Err("--domain and --source-url are mutually exclusive".to_string())
            }
            (None, None) => Err("one of --domain or --source-url is required".to_string()),
        }
    }

    pub fn target_config(&self, mode: &InstallMode) -> TargetConfig {
        TargetConfig {
            mode: mode.clone(),
            install_dir: self.install_dir.clone(),
            app_port: self.app_port,
            package_url: self.package_url.clone(),
            checksum_url: format!("{}.sha256", self.package_url),
            service_name: SERVICE_NAME.to_string(),
            db_name: DB_NAME.to_string(),
            db_role: DB_ROLE.to_string(),
            nginx_conf_path: PathBuf::from(NGINX_CONF_PATH),
            htpasswd_path: PathBuf::from(HTPASSWD_PATH),
        }
    }
}

/// Resolved target of one installer run. Built once from the CLI args and
/// threaded through every phase.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub mode: InstallMode,
    pub install_dir: PathBuf,
    pub app_port: u16,
    pub package_url: String,
    pub checksum_url: String,
    pub service_name: String,
    pub db_name: String,
    pub db_role: String,
    pub nginx_conf_path: PathBuf,
    pub htpasswd_path: PathBuf,
}

impl TargetConfig {
    pub fn secret_file_path(&self) -> PathBuf {
        self.install_dir.join(".env.secrets")
    }

    pub fn migration_marker_path(&self) -> PathBuf {
        self.install_dir.join("migrations.applied")
    }
}

/// Relay server flags. Same env-var convention as the installer.
#[derive(Parser, Debug, Clone)]
#[command(name = "sessionlens-relay", version, about = "SessionLens remote-install relay")]
pub struct RelayArgs {
    #[arg(long, env = "SESSIONLENS_RELAY_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    #[arg(long, env = "SESSIONLENS_RELAY_PORT", default_value_t = 8870)]
    pub port: u16,

    /// Token requests allowed per address per window.
    #[arg(long, env = "SESSIONLENS_RELAY_TOKEN_QUOTA", default_value_t = 5)]
    pub token_quota: u32,

    /// Rate-limit window in seconds.
    #[arg(long, env = "SESSIONLENS_RELAY_WINDOW_SECS", default_value_t = 3600)]
    pub window_secs: u64,

    /// Token validity in seconds.
    #[arg(long, env = "SESSIONLENS_RELAY_TOKEN_TTL_SECS", default_value_t = 900)]
    pub token_ttl_secs: u64,

    /// Global ceiling on concurrent tunnels.
    #[arg(long, env = "SESSIONLENS_RELAY_MAX_TUNNELS", default_value_t = 8)]
    pub max_tunnels: usize,

    /// Hard wall-clock limit for one tunnel session, in seconds.
    #[arg(long, env = "SESSIONLENS_RELAY_SESSION_TIMEOUT_SECS", default_value_t = 600)]
    pub session_timeout_secs: u64,

    /// Debug-level logging on stderr.
    #[arg(long, short, env = "SESSIONLENS_VERBOSE")]
    pub verbose: bool,
}

/// Interactive yes/no prompt on stdin. `default` is returned on empty input
/// or any read error (non-interactive callers never reach this).
pub fn confirm(question: &str, default: bool) -> bool {
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    print!("{question} {hint} ");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().lock().read_line(&mut line).is_err() {
        return default;
    }
    match line.trim().to_ascii_lowercase().as_str() {
        "" => default,
        "y" | "yes" => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> InstallArgs {
        InstallArgs::parse_from(["sessionlens-install", "--domain", "example.com"])
    }

    #[test]
    fn domain_selects_full_stack() {
        let args = base_args();
        let mode = args.resolve_mode().expect("mode");
        assert_eq!(
            mode,
            InstallMode::FullStack {
                domain: "example.com".to_string()
            }
        );
    }

    #[test]
    fn source_url_selects_client_only() {
        let args = InstallArgs::parse_from([
            "sessionlens-install",
            "--source-url",
            "https://replay.example.com/",
            "--mode",
            "project",
        ]);
        let mode = args.resolve_mode().expect("mode");
        assert_eq!(
            mode,
            InstallMode::ClientOnly {
                origin: "https://replay.example.com".to_string(),
                flavor: ClientFlavor::Project,
            }
        );
    }

    #[test]
    fn missing_target_flag_is_an_argument_error() {
        let args = InstallArgs::parse_from(["sessionlens-install"]);
        assert!(args.resolve_mode().is_err());
    }

    #[test]
    fn both_target_flags_rejected_by_clap() {
        let parsed = InstallArgs::try_parse_from([
            "sessionlens-install",
            "--domain",
            "example.com",
            "--source-url",
            "https://replay.example.com",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn bad_source_url_scheme_rejected() {
        let args = InstallArgs::parse_from([
            "sessionlens-install",
            "--source-url",
            "ftp://replay.example.com",
        ]);
        assert!(args.resolve_mode().is_err());
    }

    #[test]
    fn checksum_url_is_sibling_of_package() {
        let args = base_args();
        let mode = args.resolve_mode().unwrap();
        let cfg = args.target_config(&mode);
        assert_eq!(cfg.checksum_url, format!("{}.sha256", cfg.package_url));
    }
}
