// Remote command construction.
//
// The relay never concatenates raw browser input into a shell line. The
// builder takes an enumerated mode and already-validated fields, strips
// control characters, and single-quotes every interpolated value. The result
// is exactly the installer's non-interactive invocation.

use anyhow::{bail, Result};

use crate::cli::ClientFlavor;
use crate::utils::validation::{strip_control_chars, validate_hostname, validate_port};

/// Shell-quote one argument for POSIX sh. Wraps in single quotes; embedded
/// single quotes become `'\''`.
pub fn shell_quote(value: &str) -> String {
    let clean = strip_control_chars(value);
    let mut out = String::with_capacity(clean.len() + 2);
    out.push('\'');
    for c in clean.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// What the remote installer should provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    FullStack { domain: String },
    ClientOnly { origin: String, flavor: ClientFlavor },
}

/// Validated inputs for one remote install. Construction is the only way to
/// get a command string, so nothing unvalidated can reach the shell.
#[derive(Debug, Clone)]
pub struct RemoteCommandBuilder {
    target: RemoteTarget,
    install_dir: Option<String>,
    app_port: Option<u16>,
    dry_run: bool,
}

impl RemoteCommandBuilder {
    pub fn full_stack(domain: &str) -> Result<Self> {
        let domain = strip_control_chars(domain.trim());
        validate_hostname(&domain)?;
        Ok(Self {
            target: RemoteTarget::FullStack { domain },
            install_dir: None,
            app_port: None,
            dry_run: false,
        })
    }

    pub fn client_only(origin: &str, flavor: ClientFlavor) -> Result<Self> {
        let origin = strip_control_chars(origin.trim());
        let parsed = url::Url::parse(&origin)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            bail!("source origin must be http(s)");
        }
        Ok(Self {
            target: RemoteTarget::ClientOnly {
                origin: origin.trim_end_matches('/').to_string(),
                flavor,
            },
            install_dir: None,
            app_port: None,
            dry_run: false,
        })
    }

    pub fn install_dir(mut self, dir: &str) -> Result<Self> {
        let dir = strip_control_chars(dir.trim());
        if !dir.starts_with('/') {
            bail!("install directory must be an absolute path");
        }
        self.install_dir = Some(dir);
        Ok(self)
    }

    pub fn app_port(mut self, port: u16) -> Result<Self> {
        validate_port(port)?;
        self.app_port = Some(port);
        Ok(self)
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The exact line run on the target host.
    pub fn build(&self) -> String {
        let mut parts: Vec<String> = vec![
            "sessionlens-install".to_string(),
            "--non-interactive".to_string(),
        ];
        match &self.target {
            RemoteTarget::FullStack { domain } => {
                parts.push("--domain".to_string());
                parts.push(shell_quote(domain));
            }
            RemoteTarget::ClientOnly { origin, flavor } => {
                parts.push("--source-url".to_string());
                parts.push(shell_quote(origin));
                parts.push("--mode".to_string());
                parts.push(shell_quote(flavor.as_str()));
            }
        }
        if let Some(dir) = &self.install_dir {
            parts.push("--install-dir".to_string());
            parts.push(shell_quote(dir));
        }
        if let Some(port) = self.app_port {
            parts.push("--app-port".to_string());
            parts.push(port.to_string());
        }
        if self.dry_run {
            parts.push("--dry-run".to_string());
        }
        // Interleave stderr into the streamed output.
        parts.push("2>&1".to_string());
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_neutralizes_shell_metacharacters() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("x'; rm -rf /"), r#"'x'\''; rm -rf /'"#);
        assert_eq!(shell_quote("$(whoami)"), "'$(whoami)'");
    }

    #[test]
    fn control_characters_are_stripped_before_quoting() {
        assert_eq!(shell_quote("ab\x00c\nd"), "'abcd'");
    }

    #[test]
    fn full_stack_command_shape() {
        let cmd = RemoteCommandBuilder::full_stack("replay.example.com")
            .unwrap()
            .app_port(9100)
            .unwrap()
            .build();
        assert_eq!(
            cmd,
            "sessionlens-install --non-interactive --domain 'replay.example.com' --app-port 9100 2>&1"
        );
    }

    #[test]
    fn client_only_command_shape() {
        let cmd = RemoteCommandBuilder::client_only(
            "https://replay.example.com/",
            ClientFlavor::Project,
        )
        .unwrap()
        .install_dir("/opt/sessionlens")
        .unwrap()
        .build();
        assert_eq!(
            cmd,
            "sessionlens-install --non-interactive --source-url 'https://replay.example.com' --mode 'project' --install-dir '/opt/sessionlens' 2>&1"
        );
    }

    #[test]
    fn hostile_domain_is_rejected_not_escaped() {
        assert!(RemoteCommandBuilder::full_stack("example.com; reboot").is_err());
        assert!(RemoteCommandBuilder::full_stack("").is_err());
    }

    #[test]
    fn relative_install_dir_rejected() {
        let builder = RemoteCommandBuilder::full_stack("example.com").unwrap();
        assert!(builder.install_dir("../../etc").is_err());
    }

    #[test]
    fn port_zero_rejected() {
        let builder = RemoteCommandBuilder::full_stack("example.com").unwrap();
        assert!(builder.app_port(0).is_err());
    }
}
