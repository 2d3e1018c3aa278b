// Reverse-proxy configuration: fill the nginx server-block template, write
// the basic-auth store, validate with `nginx -t`, then reload.
//
// `nginx -t` is this phase's own verification; a failure there means the
// written config is withdrawn by rollback, not served.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use tokio::time::Duration;

use crate::cli::InstallMode;
use crate::error::InstallError;
use crate::exec::{run_cmd_with_stdin, run_cmd_with_timeout};
use crate::rollback::UndoAction;

use super::InstallContext;

const NGINX_TIMEOUT: Duration = Duration::from_secs(30);

/// Render the server block. Pure so the template stays testable; the inputs
/// were validated at mode resolution (hostname grammar, bounded port).
pub fn render_server_block(domain: &str, app_port: u16, htpasswd_path: &Path) -> String {
    format!(
        r#"# Managed by sessionlens-install. Manual edits will be overwritten.
server {{
    listen 80;
    server_name {domain};

    auth_basic "SessionLens";
    auth_basic_user_file {htpasswd};

    location / {{
        proxy_pass http://127.0.0.1:{app_port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_read_timeout 300s;
    }}
}}
"#,
        domain = domain,
        htpasswd = htpasswd_path.display(),
        app_port = app_port,
    )
}

/// Hash the auth password with SHA-512 crypt. The password reaches openssl
/// over stdin, never argv.
async fn crypt_password(password: &str) -> Result<String> {
    let out = run_cmd_with_stdin(
        "openssl",
        &["passwd".to_string(), "-6".to_string(), "-stdin".to_string()],
        format!("{password}\n").as_bytes(),
        NGINX_TIMEOUT,
        "proxy_hash_password",
    )
    .await?;
    if !out.success() {
        return Err(anyhow!(
            "openssl passwd failed (exit_code={:?})",
            out.exit_code
        ));
    }
    let hash = out.stdout.trim().to_string();
    if !hash.starts_with("$6$") {
        return Err(anyhow!("openssl produced an unexpected hash format"));
    }
    Ok(hash)
}

async fn write_htpasswd(path: &Path, user: &str, hash: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    // Group-readable so the proxy worker account can open it.
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o640)
        .open(path)
        .await
        .with_context(|| format!("cannot write auth store {path:?}"))?;
    file.write_all(format!("{user}:{hash}\n").as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

async fn nginx_test() -> Result<()> {
    let out = run_cmd_with_timeout(
        "nginx",
        &["-t".to_string()],
        NGINX_TIMEOUT,
        "proxy_nginx_test",
    )
    .await?;
    if !out.success() {
        return Err(anyhow!(
            "nginx -t rejected the configuration: {}",
            out.stderr.trim()
        ));
    }
    Ok(())
}

async fn nginx_reload() -> Result<()> {
    let out = run_cmd_with_timeout(
        "systemctl",
        &["reload".to_string(), "nginx".to_string()],
        NGINX_TIMEOUT,
        "proxy_nginx_reload",
    )
    .await?;
    if !out.success() {
        return Err(anyhow!(
            "nginx reload failed (exit_code={:?}): {}",
            out.exit_code,
            out.stderr.trim()
        ));
    }
    Ok(())
}

async fn configure(ctx: &mut InstallContext) -> Result<()> {
    let InstallMode::FullStack { domain } = ctx.cfg.mode.clone() else {
        return Err(anyhow!("proxy phase requires full-stack mode"));
    };
    let creds = ctx
        .credentials
        .as_ref()
        .ok_or_else(|| anyhow!("credentials not generated"))?;

    if ctx.cfg.nginx_conf_path.exists() && !ctx.force {
        warn!(
            "[PHASE: configure-proxy] [STEP: probe] {:?} already exists; overwriting with this run's config",
            ctx.cfg.nginx_conf_path
        );
    }

    if ctx.dry_run_gate(&format!(
        "write {:?} and {:?}, then nginx -t and reload",
        ctx.cfg.nginx_conf_path, ctx.cfg.htpasswd_path
    )) {
        return Ok(());
    }

    let hash = crypt_password(creds.auth_password.expose()).await?;
    write_htpasswd(&ctx.cfg.htpasswd_path, &creds.auth_user, &hash).await?;
    // Files start landing from here on; record them before validation so a
    // failure anywhere past this point removes them.
    ctx.undo.push(UndoAction::RemoveProxyConfig {
        conf_path: ctx.cfg.nginx_conf_path.clone(),
        htpasswd_path: ctx.cfg.htpasswd_path.clone(),
    });

    let block = render_server_block(&domain, ctx.cfg.app_port, &ctx.cfg.htpasswd_path);
    tokio::fs::write(&ctx.cfg.nginx_conf_path, block)
        .await
        .with_context(|| format!("cannot write {:?}", ctx.cfg.nginx_conf_path))?;

    // Verification: only a config nginx itself accepts counts as done.
    if let Err(e) = nginx_test().await {
        // Withdraw the bad config immediately; a later manual reload must
        // never pick it up, whether or not rollback proceeds.
        let _ = tokio::fs::remove_file(&ctx.cfg.nginx_conf_path).await;
        let _ = tokio::fs::remove_file(&ctx.cfg.htpasswd_path).await;
        return Err(e);
    }
    nginx_reload().await?;

    info!(
        "[PHASE: configure-proxy] [STEP: done] Proxy serving {} -> 127.0.0.1:{}",
        domain, ctx.cfg.app_port
    );
    Ok(())
}

pub async fn run(ctx: &mut InstallContext) -> Result<(), InstallError> {
    configure(ctx)
        .await
        .map_err(|e| InstallError::phase("configure-proxy", e))
}
