// Input validation for everything that crosses a trust boundary: CLI flags,
// relay auth frames, and identifiers interpolated into SQL or shell
// commands.

use std::net::IpAddr;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;

fn hostname_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,62}[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]{0,62}[A-Za-z0-9])?)*$")
            .expect("hostname regex")
    })
}

fn username_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Restrictive POSIX-style login names only. Anything fancier is refused
    // rather than escaped.
    RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("username regex"))
}

fn db_ident_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("db identifier regex"))
}

/// Validate a DNS hostname (RFC 1123 shape, 253 chars max). IP literals are
/// accepted too; the relay applies its own address-range policy afterwards.
pub fn validate_hostname(host: &str) -> Result<()> {
    let h = host.trim();
    if h.is_empty() {
        anyhow::bail!("hostname is required");
    }
    if h.len() > 253 {
        anyhow::bail!("hostname exceeds 253 characters");
    }
    if h.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    if !hostname_re().is_match(h) {
        anyhow::bail!("hostname contains invalid characters");
    }
    Ok(())
}

/// Validate a remote login name against a restrictive identifier pattern.
pub fn validate_username(name: &str) -> Result<()> {
    if !username_re().is_match(name) {
        anyhow::bail!("username must match ^[a-z_][a-z0-9_-]{{0,31}}$");
    }
    Ok(())
}

pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        anyhow::bail!("port must be between 1 and 65535");
    }
    Ok(())
}

/// Validate a PostgreSQL role/database name (letters, numbers, underscore;
/// must not be a reserved name).
pub fn validate_db_identifier(name: &str) -> Result<()> {
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("identifier is required");
    }
    if name.len() > 63 {
        anyhow::bail!("identifier must be 63 characters or fewer");
    }
    if !db_ident_re().is_match(name) {
        anyhow::bail!(
            "identifier must start with a letter or underscore and contain only letters, numbers, and underscores"
        );
    }
    let reserved = ["postgres", "template0", "template1"];
    if reserved.iter().any(|r| r.eq_ignore_ascii_case(name)) {
        anyhow::bail!("'{}' is a reserved database name", name);
    }
    Ok(())
}

/// Double-quote a PostgreSQL identifier.
pub fn pg_quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Escape a PostgreSQL string literal.
pub fn pg_quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Remove ASCII control characters (including newlines) from a value before
/// it can be interpolated anywhere.
pub fn strip_control_chars(value: &str) -> String {
    value.chars().filter(|c| !c.is_control()).collect()
}

/// Address ranges the relay refuses to tunnel to: using the relay to reach
/// internal services would turn it into an SSRF proxy.
pub fn is_disallowed_target_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                // CGNAT 100.64.0.0/10
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // Unique-local fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // Link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                // IPv4-mapped: apply the IPv4 policy
                || v6
                    .to_ipv4_mapped()
                    .map(|v4| is_disallowed_target_ip(&IpAddr::V4(v4)))
                    .unwrap_or(false)
        }
    }
}
