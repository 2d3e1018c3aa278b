// Rollback coordinator.
//
// Mutating phases push a typed undo action immediately after the mutation
// that creates each resource, so a phase that fails mid-way is unwound along
// with everything before it. On phase failure the coordinator pops the stack
// in reverse order. Every action is best-effort: rollback logs failures but
// never raises.

use std::path::PathBuf;

use async_trait::async_trait;
use log::{info, warn};
use tokio::time::Duration;

use crate::cli::confirm;
use crate::exec::run_cmd_with_timeout;
use crate::utils::validation::{pg_quote_ident, validate_db_identifier};

/// One reversible mutation, pushed by the phase that performed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    StopProcess {
        service: String,
        unit_path: PathBuf,
    },
    EraseSecretFile {
        path: PathBuf,
    },
    DropDatabase {
        db_name: String,
    },
    DropRole {
        db_role: String,
    },
    RemoveInstalledFiles {
        dir: PathBuf,
    },
    RemoveProxyConfig {
        conf_path: PathBuf,
        htpasswd_path: PathBuf,
    },
}

impl UndoAction {
    pub fn label(&self) -> &'static str {
        match self {
            UndoAction::StopProcess { .. } => "stop-process",
            UndoAction::EraseSecretFile { .. } => "erase-secret-file",
            UndoAction::DropDatabase { .. } => "drop-database",
            UndoAction::DropRole { .. } => "drop-role",
            UndoAction::RemoveInstalledFiles { .. } => "remove-installed-files",
            UndoAction::RemoveProxyConfig { .. } => "remove-proxy-config",
        }
    }
}

/// LIFO stack of undo actions for the current run.
#[derive(Debug, Default)]
pub struct UndoStack {
    actions: Vec<UndoAction>,
}

impl UndoStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: UndoAction) {
        info!(
            "[PHASE: rollback] [STEP: record] Undo action recorded ({})",
            action.label()
        );
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Drain in reverse push order (most recent mutation undone first).
    pub fn drain_reverse(&mut self) -> Vec<UndoAction> {
        let mut out = std::mem::take(&mut self.actions);
        out.reverse();
        out
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RollbackOptions {
    pub interactive: bool,
    /// Skip the database drop even when unattended.
    pub preserve_data: bool,
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct RollbackReport {
    /// (action label, succeeded) in execution order.
    pub attempted: Vec<(String, bool)>,
}

/// Seam for executing individual undo actions, so the unwind order and
/// policy can be tested without touching the system.
#[async_trait]
pub trait UndoExecutor: Send + Sync {
    async fn execute(&self, action: &UndoAction) -> anyhow::Result<()>;
}

/// Unwind the stack. Never returns an error; individual failures are logged
/// and recorded in the report.
pub async fn rollback(
    mut stack: UndoStack,
    opts: RollbackOptions,
    executor: &dyn UndoExecutor,
) -> RollbackReport {
    let mut report = RollbackReport::default();
    let actions = stack.drain_reverse();
    info!(
        "[PHASE: rollback] [STEP: start] Rolling back {} completed mutation(s)",
        actions.len()
    );

    // Set when the database drop was declined or preserved; the owning role
    // must then survive too, or the kept database loses its owner.
    let mut database_kept = false;

    for action in actions {
        match &action {
            UndoAction::DropDatabase { db_name } => {
                let drop_it = if opts.interactive {
                    confirm(
                        &format!("Drop the provisioned database '{db_name}'?"),
                        true,
                    )
                } else if opts.preserve_data {
                    info!(
                        "[PHASE: rollback] [STEP: drop_database] Preserving database '{}' (--preserve-data)",
                        db_name
                    );
                    false
                } else {
                    // Unattended partial install: nothing depends on the data yet.
                    warn!(
                        "[PHASE: rollback] [STEP: drop_database] Dropping database '{}' (unattended rollback)",
                        db_name
                    );
                    true
                };
                if !drop_it {
                    database_kept = true;
                    report.attempted.push((action.label().to_string(), true));
                    continue;
                }
            }
            UndoAction::DropRole { db_role } if database_kept => {
                info!(
                    "[PHASE: rollback] [STEP: drop_role] Keeping role '{}' (it owns the preserved database)",
                    db_role
                );
                report.attempted.push((action.label().to_string(), true));
                continue;
            }
            _ => {}
        }

        if opts.dry_run {
            println!("DRY-RUN: would undo {}", action.label());
            report.attempted.push((action.label().to_string(), true));
            continue;
        }

        match executor.execute(&action).await {
            Ok(()) => {
                info!(
                    "[PHASE: rollback] [STEP: undo] {} ok",
                    action.label()
                );
                report.attempted.push((action.label().to_string(), true));
            }
            Err(e) => {
                warn!(
                    "[PHASE: rollback] [STEP: undo] {} failed (continuing): {}",
                    action.label(),
                    e
                );
                report.attempted.push((action.label().to_string(), false));
            }
        }
    }

    info!(
        "[PHASE: rollback] [STEP: done] Rollback finished ({} action(s))",
        report.attempted.len()
    );
    report
}

/// One administrative statement through psql under the postgres account.
async fn psql_admin(sql: String, op: &'static str) -> anyhow::Result<()> {
    let out = run_cmd_with_timeout(
        "sudo",
        &[
            "-u".to_string(),
            "postgres".to_string(),
            "psql".to_string(),
            "-v".to_string(),
            "ON_ERROR_STOP=1".to_string(),
            "-c".to_string(),
            sql,
        ],
        Duration::from_secs(60),
        op,
    )
    .await?;
    if !out.success() {
        anyhow::bail!("{} failed (exit_code={:?})", op, out.exit_code);
    }
    Ok(())
}

/// Production executor: shells out to the same tools the phases used.
pub struct SystemUndoExecutor;

#[async_trait]
impl UndoExecutor for SystemUndoExecutor {
    async fn execute(&self, action: &UndoAction) -> anyhow::Result<()> {
        match action {
            UndoAction::StopProcess { service, unit_path } => {
                // The process may already be down; both calls are best-effort.
                let _ = run_cmd_with_timeout(
                    "systemctl",
                    &["stop".to_string(), service.clone()],
                    Duration::from_secs(30),
                    "rollback_systemctl_stop",
                )
                .await;
                let _ = run_cmd_with_timeout(
                    "systemctl",
                    &["disable".to_string(), service.clone()],
                    Duration::from_secs(30),
                    "rollback_systemctl_disable",
                )
                .await;
                let _ = tokio::fs::remove_file(unit_path).await;
                let _ = run_cmd_with_timeout(
                    "systemctl",
                    &["daemon-reload".to_string()],
                    Duration::from_secs(30),
                    "rollback_daemon_reload",
                )
                .await;
                Ok(())
            }
            UndoAction::EraseSecretFile { path } => {
                crate::credentials::secure_erase(path).await
            }
            UndoAction::DropDatabase { db_name } => {
                validate_db_identifier(db_name)?;
                psql_admin(
                    format!("DROP DATABASE IF EXISTS {};", pg_quote_ident(db_name)),
                    "rollback_drop_database",
                )
                .await
            }
            UndoAction::DropRole { db_role } => {
                validate_db_identifier(db_role)?;
                psql_admin(
                    format!("DROP ROLE IF EXISTS {};", pg_quote_ident(db_role)),
                    "rollback_drop_role",
                )
                .await
            }
            UndoAction::RemoveInstalledFiles { dir } => {
                if tokio::fs::try_exists(dir).await.unwrap_or(false) {
                    tokio::fs::remove_dir_all(dir).await?;
                }
                Ok(())
            }
            UndoAction::RemoveProxyConfig {
                conf_path,
                htpasswd_path,
            } => {
                let _ = tokio::fs::remove_file(conf_path).await;
                let _ = tokio::fs::remove_file(htpasswd_path).await;
                // Reload so the removed server block stops being served.
                let _ = run_cmd_with_timeout(
                    "nginx",
                    &["-s".to_string(), "reload".to_string()],
                    Duration::from_secs(30),
                    "rollback_nginx_reload",
                )
                .await;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records executed actions instead of touching the system.
    #[derive(Default)]
    pub struct RecordingExecutor {
        pub executed: Mutex<Vec<UndoAction>>,
        pub fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl UndoExecutor for RecordingExecutor {
        async fn execute(&self, action: &UndoAction) -> anyhow::Result<()> {
            self.executed.lock().unwrap().push(action.clone());
            if Some(action.label()) == self.fail_on {
                anyhow::bail!("injected failure");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingExecutor;
    use super::*;

    fn full_stack() -> UndoStack {
        let mut stack = UndoStack::new();
        stack.push(UndoAction::DropRole {
            db_role: "sessionlens".into(),
        });
        stack.push(UndoAction::DropDatabase {
            db_name: "sessionlens".into(),
        });
        stack.push(UndoAction::RemoveInstalledFiles {
            dir: PathBuf::from("/opt/sessionlens"),
        });
        stack.push(UndoAction::EraseSecretFile {
            path: PathBuf::from("/opt/sessionlens/.env.secrets"),
        });
        stack.push(UndoAction::RemoveProxyConfig {
            conf_path: PathBuf::from("/etc/nginx/conf.d/sessionlens.conf"),
            htpasswd_path: PathBuf::from("/etc/nginx/sessionlens.htpasswd"),
        });
        stack.push(UndoAction::StopProcess {
            service: "sessionlens".into(),
            unit_path: PathBuf::from("/etc/systemd/system/sessionlens.service"),
        });
        stack
    }

    #[test]
    fn drain_reverse_is_lifo() {
        let mut stack = full_stack();
        let labels: Vec<&str> = stack.drain_reverse().iter().map(|a| a.label()).collect();
        assert_eq!(
            labels,
            vec![
                "stop-process",
                "remove-proxy-config",
                "erase-secret-file",
                "remove-installed-files",
                "drop-database",
                "drop-role",
            ]
        );
        assert!(stack.is_empty());
    }

    #[tokio::test]
    async fn rollback_executes_all_actions_in_reverse_order() {
        let exec = RecordingExecutor::default();
        let report = rollback(
            full_stack(),
            RollbackOptions {
                interactive: false,
                preserve_data: false,
                dry_run: false,
            },
            &exec,
        )
        .await;

        let executed = exec.executed.lock().unwrap();
        assert_eq!(executed.len(), 6);
        assert_eq!(executed[0].label(), "stop-process");
        // The database must go before the role that owns it.
        assert_eq!(executed[4].label(), "drop-database");
        assert_eq!(executed.last().unwrap().label(), "drop-role");
        assert!(report.attempted.iter().all(|(_, ok)| *ok));
    }

    #[tokio::test]
    async fn rollback_continues_past_failures() {
        let exec = RecordingExecutor {
            fail_on: Some("erase-secret-file"),
            ..Default::default()
        };
        let report = rollback(
            full_stack(),
            RollbackOptions {
                interactive: false,
                preserve_data: false,
                dry_run: false,
            },
            &exec,
        )
        .await;

        // All six attempted despite the injected failure.
        assert_eq!(report.attempted.len(), 6);
        assert_eq!(
            report
                .attempted
                .iter()
                .filter(|(_, ok)| !*ok)
                .map(|(label, _)| label.as_str())
                .collect::<Vec<_>>(),
            vec!["erase-secret-file"]
        );
    }

    #[tokio::test]
    async fn preserve_data_skips_the_database_drop() {
        let exec = RecordingExecutor::default();
        rollback(
            full_stack(),
            RollbackOptions {
                interactive: false,
                preserve_data: true,
                dry_run: false,
            },
            &exec,
        )
        .await;

        let executed = exec.executed.lock().unwrap();
        assert!(executed.iter().all(|a| a.label() != "drop-database"));
        // The role owns the preserved database, so it survives too.
        assert!(executed.iter().all(|a| a.label() != "drop-role"));
        assert_eq!(executed.len(), 4);
    }

    #[tokio::test]
    async fn dry_run_executes_nothing() {
        let exec = RecordingExecutor::default();
        rollback(
            full_stack(),
            RollbackOptions {
                interactive: false,
                preserve_data: false,
                dry_run: true,
            },
            &exec,
        )
        .await;
        assert!(exec.executed.lock().unwrap().is_empty());
    }
}
