// Database provisioning through the postgres service account.
//
// All SQL travels to psql over stdin: the generated password must never
// appear on argv or in the process table. Existence probes keep re-runs
// idempotent.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio::time::Duration;

use crate::cli::TargetConfig;
use crate::error::InstallError;
use crate::exec::{run_cmd_with_stdin, run_cmd_with_timeout};
use crate::rollback::UndoAction;
use crate::utils::validation::{pg_quote_ident, pg_quote_literal, validate_db_identifier};

use super::InstallContext;

const PSQL_TIMEOUT: Duration = Duration::from_secs(60);
const MIGRATION_TIMEOUT: Duration = Duration::from_secs(300);

fn psql_args(extra: &[&str]) -> Vec<String> {
    let mut args = vec![
        "-u".to_string(),
        "postgres".to_string(),
        "psql".to_string(),
        "-v".to_string(),
        "ON_ERROR_STOP=1".to_string(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    args
}

/// Run a single read-only catalog query, returning trimmed stdout.
async fn catalog_query(sql: &str, operation: &str) -> Result<String> {
    let out = run_cmd_with_timeout(
        "sudo",
        &psql_args(&["-tAc", sql]),
        PSQL_TIMEOUT,
        operation,
    )
    .await?;
    if !out.success() {
        return Err(anyhow!(
            "catalog query failed (operation={}, exit_code={:?}): {}",
            operation,
            out.exit_code,
            out.stderr.trim()
        ));
    }
    Ok(out.stdout.trim().to_string())
}

async fn role_exists(role: &str) -> Result<bool> {
    let sql = format!(
        "SELECT 1 FROM pg_roles WHERE rolname = {};",
        pg_quote_literal(role)
    );
    Ok(catalog_query(&sql, "db_probe_role").await? == "1")
}

async fn database_exists(db: &str) -> Result<bool> {
    let sql = format!(
        "SELECT 1 FROM pg_database WHERE datname = {};",
        pg_quote_literal(db)
    );
    Ok(catalog_query(&sql, "db_probe_database").await? == "1")
}

/// Feed SQL to psql over stdin under the postgres service account.
async fn run_sql(sql: &str, database: Option<&str>, operation: &str) -> Result<()> {
    let extra: Vec<&str> = match database {
        Some(db) => vec!["-d", db],
        None => vec![],
    };
    let out = run_cmd_with_stdin(
        "sudo",
        &psql_args(&extra),
        sql.as_bytes(),
        MIGRATION_TIMEOUT,
        operation,
    )
    .await?;
    if !out.success() {
        return Err(anyhow!(
            "psql failed (operation={}, exit_code={:?}): {}",
            operation,
            out.exit_code,
            out.stderr.trim()
        ));
    }
    Ok(())
}

/// Migration files shipped in the package, lexicographic order.
fn migration_files(package_root: &std::path::Path) -> Result<Vec<std::path::PathBuf>> {
    let dir = package_root.join("migrations");
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files: Vec<_> = std::fs::read_dir(&dir)
        .with_context(|| format!("cannot read migrations directory {dir:?}"))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    files.sort();
    Ok(files)
}

async fn apply_migrations(ctx: &InstallContext) -> Result<usize> {
    let package = ctx
        .package
        .as_ref()
        .ok_or_else(|| anyhow!("package not fetched"))?;
    let files = migration_files(package.root())?;
    info!(
        "[PHASE: provision-database] [STEP: migrate] {} migration file(s) to apply",
        files.len()
    );

    let mut applied = Vec::new();
    for file in &files {
        let name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("<unnamed>")
            .to_string();
        let sql = tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("cannot read migration {name}"))?;
        run_sql(&sql, Some(&ctx.cfg.db_name), "db_apply_migration").await?;
        info!("[PHASE: provision-database] [STEP: migrate] Applied {}", name);
        applied.push(name);
    }

    // Each migration inserts its own ledger row; the count gate catches a
    // migration that ran but failed to record itself.
    if !files.is_empty() {
        let count = catalog_query_in_db(
            &ctx.cfg.db_name,
            "SELECT count(*) FROM schema_migrations;",
            "db_migration_ledger",
        )
        .await?;
        let count: usize = count
            .parse()
            .with_context(|| format!("unexpected migration ledger count: {count:?}"))?;
        if count != files.len() {
            return Err(anyhow!(
                "migration ledger holds {} row(s) but {} file(s) were applied",
                count,
                files.len()
            ));
        }
    }

    append_migration_marker(ctx, &applied).await?;
    Ok(files.len())
}

async fn catalog_query_in_db(db: &str, sql: &str, operation: &str) -> Result<String> {
    let out = run_cmd_with_timeout(
        "sudo",
        &psql_args(&["-d", db, "-tAc", sql]),
        PSQL_TIMEOUT,
        operation,
    )
    .await?;
    if !out.success() {
        return Err(anyhow!(
            "catalog query failed (operation={}, exit_code={:?}): {}",
            operation,
            out.exit_code,
            out.stderr.trim()
        ));
    }
    Ok(out.stdout.trim().to_string())
}

/// Append the applied set to the run marker. Append-only: earlier runs'
/// records are never rewritten.
async fn append_migration_marker(ctx: &InstallContext, applied: &[String]) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    tokio::fs::create_dir_all(&ctx.cfg.install_dir)
        .await
        .context("cannot create install directory for the migration marker")?;
    let marker = ctx.cfg.migration_marker_path();
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&marker)
        .await
        .with_context(|| format!("cannot open migration marker {marker:?}"))?;
    let stamp = Utc::now().to_rfc3339();
    for name in applied {
        file.write_all(format!("{stamp} {name}\n").as_bytes())
            .await
            .context("cannot append to migration marker")?;
    }
    file.flush().await.context("cannot flush migration marker")?;
    Ok(())
}

/// Preview lines for dry-run, one per mutating action the real run would
/// perform given the probed state.
fn dry_run_plan(
    role_present: bool,
    db_present: bool,
    force: bool,
    cfg: &TargetConfig,
) -> Vec<String> {
    let mut plan = Vec::new();
    if !role_present {
        plan.push(format!("create database role '{}'", cfg.db_role));
    } else if force {
        plan.push(format!("reset the password for role '{}'", cfg.db_role));
    }
    if !db_present {
        plan.push(format!(
            "create database '{}' owned by '{}'",
            cfg.db_name, cfg.db_role
        ));
    }
    plan.push(
        "apply migrations, verify the ledger row count, and append the run marker".to_string(),
    );
    plan
}

async fn provision(ctx: &mut InstallContext) -> Result<()> {
    validate_db_identifier(&ctx.cfg.db_name)?;
    validate_db_identifier(&ctx.cfg.db_role)?;
    let password = ctx
        .credentials
        .as_ref()
        .ok_or_else(|| anyhow!("credentials not generated"))?
        .db_password
        .expose()
        .to_string();

    // Existence probes are read-only; they run even in dry-run so the
    // preview reflects what this host actually needs.
    let role_present = role_exists(&ctx.cfg.db_role).await?;
    let db_present = database_exists(&ctx.cfg.db_name).await?;

    if ctx.dry_run {
        for action in dry_run_plan(role_present, db_present, ctx.force, &ctx.cfg) {
            ctx.dry_run_gate(&action);
        }
        return Ok(());
    }

    if role_present && !ctx.force {
        warn!(
            "[PHASE: provision-database] [STEP: role] Role '{}' already exists; skipping creation",
            ctx.cfg.db_role
        );
    } else if role_present {
        // --force re-run: rebind the role to this run's generated password.
        // The role predates this run, so no undo action is recorded for it.
        let sql = format!(
            "ALTER ROLE {} WITH LOGIN PASSWORD {};",
            pg_quote_ident(&ctx.cfg.db_role),
            pg_quote_literal(&password)
        );
        run_sql(&sql, None, "db_alter_role").await?;
        info!(
            "[PHASE: provision-database] [STEP: role] Reset password for existing role '{}'",
            ctx.cfg.db_role
        );
    } else {
        let sql = format!(
            "CREATE ROLE {} WITH LOGIN PASSWORD {};",
            pg_quote_ident(&ctx.cfg.db_role),
            pg_quote_literal(&password)
        );
        run_sql(&sql, None, "db_create_role").await?;
        info!(
            "[PHASE: provision-database] [STEP: role] Created role '{}'",
            ctx.cfg.db_role
        );
        // The role exists from here on; record it so a failure later in
        // this phase still cleans it up.
        ctx.undo.push(UndoAction::DropRole {
            db_role: ctx.cfg.db_role.clone(),
        });
    }

    if db_present {
        warn!(
            "[PHASE: provision-database] [STEP: database] Database '{}' already exists; skipping creation",
            ctx.cfg.db_name
        );
    } else {
        let sql = format!(
            "CREATE DATABASE {} OWNER {};",
            pg_quote_ident(&ctx.cfg.db_name),
            pg_quote_ident(&ctx.cfg.db_role)
        );
        run_sql(&sql, None, "db_create_database").await?;
        info!(
            "[PHASE: provision-database] [STEP: database] Created database '{}'",
            ctx.cfg.db_name
        );
        ctx.undo.push(UndoAction::DropDatabase {
            db_name: ctx.cfg.db_name.clone(),
        });
    }

    let applied = apply_migrations(ctx).await?;
    info!(
        "[PHASE: provision-database] [STEP: done] Database provisioned ({} migration(s))",
        applied
    );
    Ok(())
}

pub async fn run(ctx: &mut InstallContext) -> Result<(), InstallError> {
    provision(ctx)
        .await
        .map_err(|e| InstallError::phase("provision-database", e))
}
