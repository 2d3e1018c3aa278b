// Phase orchestrator.
//
// Phases run strictly in order, single-threaded. Read-only phases abort the
// run without mutating anything; mutating phases push a typed undo action
// onto the run's undo stack as soon as each mutation lands, so a phase that
// fails mid-way is unwound along with the phases before it. Rollback still
// never undoes more than what actually happened.

pub mod database;
pub mod detect;
pub mod files;
pub mod preflight;
pub mod process;
pub mod proxy;

use std::time::Instant;

use futures::future::BoxFuture;
use log::{error, info, warn};

use crate::cli::{confirm, InstallMode, TargetConfig};
use crate::credentials::Credentials;
use crate::error::InstallError;
use crate::fetcher::ExtractedPackage;
use crate::rollback::{rollback, RollbackOptions, UndoExecutor, UndoStack};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    ReadOnly,
    Mutating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    Passed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Passed => "passed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Skipped => "skipped",
        }
    }
}

/// One line of the phase trace printed at the end of a run.
#[derive(Debug, Clone)]
pub struct PhaseRecord {
    pub name: &'static str,
    pub status: PhaseStatus,
    pub duration_ms: u128,
}

/// Mutable state threaded through every phase of one run. Only one
/// installation runs per host, so nothing here is shared.
pub struct InstallContext {
    pub cfg: TargetConfig,
    pub dry_run: bool,
    pub interactive: bool,
    pub force: bool,
    pub preserve_data: bool,
    pub http: reqwest::Client,
    /// Generated once per run for full-stack installs.
    pub credentials: Option<Credentials>,
    /// Fetched and verified during preflight; consumed by later phases.
    pub package: Option<ExtractedPackage>,
    pub undo: UndoStack,
    pub trace: Vec<PhaseRecord>,
}

impl InstallContext {
    pub fn new(
        cfg: TargetConfig,
        dry_run: bool,
        interactive: bool,
        force: bool,
        preserve_data: bool,
    ) -> Self {
        Self {
            cfg,
            dry_run,
            interactive,
            force,
            preserve_data,
            http: reqwest::Client::new(),
            credentials: None,
            package: None,
            undo: UndoStack::new(),
            trace: Vec::new(),
        }
    }

    /// Prints the DRY-RUN substitute line when dry-run is active. Returns
    /// true when the caller should skip the real action.
    pub fn dry_run_gate(&self, action: &str) -> bool {
        if self.dry_run {
            println!("DRY-RUN: {action}");
        }
        self.dry_run
    }
}

pub type PhaseFuture<'a> = BoxFuture<'a, Result<(), InstallError>>;

pub struct Phase {
    pub name: &'static str,
    pub kind: PhaseKind,
    pub run: for<'a> fn(&'a mut InstallContext) -> PhaseFuture<'a>,
}

fn detect_phase(ctx: &mut InstallContext) -> PhaseFuture<'_> {
    Box::pin(detect::run(ctx))
}
fn preflight_phase(ctx: &mut InstallContext) -> PhaseFuture<'_> {
    Box::pin(preflight::run(ctx))
}
fn database_phase(ctx: &mut InstallContext) -> PhaseFuture<'_> {
    Box::pin(database::run(ctx))
}
fn files_phase(ctx: &mut InstallContext) -> PhaseFuture<'_> {
    Box::pin(files::run(ctx))
}
fn proxy_phase(ctx: &mut InstallContext) -> PhaseFuture<'_> {
    Box::pin(proxy::run(ctx))
}
fn process_phase(ctx: &mut InstallContext) -> PhaseFuture<'_> {
    Box::pin(process::run(ctx))
}
fn verify_phase(ctx: &mut InstallContext) -> PhaseFuture<'_> {
    Box::pin(crate::verify::run_verify_phase(ctx))
}
fn audit_phase(ctx: &mut InstallContext) -> PhaseFuture<'_> {
    Box::pin(crate::verify::run_audit_phase(ctx))
}

/// The standard phase list for a mode. Client-only installs deploy files
/// against an existing host and skip database, proxy, and supervision.
pub fn standard_phases(mode: &InstallMode) -> Vec<Phase> {
    match mode {
        InstallMode::FullStack { .. } => vec![
            Phase { name: "detect-existing", kind: PhaseKind::ReadOnly, run: detect_phase },
            Phase { name: "preflight", kind: PhaseKind::ReadOnly, run: preflight_phase },
            Phase { name: "provision-database", kind: PhaseKind::Mutating, run: database_phase },
            Phase { name: "install-files", kind: PhaseKind::Mutating, run: files_phase },
            Phase { name: "configure-proxy", kind: PhaseKind::Mutating, run: proxy_phase },
            Phase { name: "start-process", kind: PhaseKind::Mutating, run: process_phase },
            Phase { name: "verify", kind: PhaseKind::ReadOnly, run: verify_phase },
            Phase { name: "audit", kind: PhaseKind::ReadOnly, run: audit_phase },
        ],
        InstallMode::ClientOnly { .. } => vec![
            Phase { name: "detect-existing", kind: PhaseKind::ReadOnly, run: detect_phase },
            Phase { name: "preflight", kind: PhaseKind::ReadOnly, run: preflight_phase },
            Phase { name: "install-files", kind: PhaseKind::Mutating, run: files_phase },
            Phase { name: "verify", kind: PhaseKind::ReadOnly, run: verify_phase },
        ],
    }
}

/// Run `phases` in order against `ctx`. On a rollback-worthy failure the
/// undo stack is unwound (after a prompt in interactive mode) before the
/// error is returned. The phase trace is always left in `ctx.trace`.
pub async fn run_phases(
    ctx: &mut InstallContext,
    phases: Vec<Phase>,
    undo_executor: &dyn UndoExecutor,
) -> Result<(), InstallError> {
    let mut failed: Option<InstallError> = None;
    let mut iter = phases.into_iter();

    for phase in iter.by_ref() {
        info!(
            "[PHASE: {}] [STEP: start] ({:?})",
            phase.name, phase.kind
        );
        let started = Instant::now();
        match (phase.run)(ctx).await {
            Ok(()) => {
                ctx.trace.push(PhaseRecord {
                    name: phase.name,
                    status: PhaseStatus::Passed,
                    duration_ms: started.elapsed().as_millis(),
                });
                info!("[PHASE: {}] [STEP: done]", phase.name);
            }
            Err(e) => {
                ctx.trace.push(PhaseRecord {
                    name: phase.name,
                    status: PhaseStatus::Failed,
                    duration_ms: started.elapsed().as_millis(),
                });
                error!("[PHASE: {}] [STEP: failed] {}", phase.name, e);
                failed = Some(e);
                break;
            }
        }
    }

    let Some(err) = failed else {
        return Ok(());
    };

    // Remaining phases never ran.
    for phase in iter {
        ctx.trace.push(PhaseRecord {
            name: phase.name,
            status: PhaseStatus::Skipped,
            duration_ms: 0,
        });
    }

    if err.triggers_rollback() && !ctx.undo.is_empty() {
        let proceed = if ctx.interactive {
            confirm("Installation failed. Roll back the completed phases?", true)
        } else {
            true
        };
        if proceed {
            let stack = std::mem::take(&mut ctx.undo);
            let report = rollback(
                stack,
                RollbackOptions {
                    interactive: ctx.interactive,
                    preserve_data: ctx.preserve_data,
                    dry_run: ctx.dry_run,
                },
                undo_executor,
            )
            .await;
            let failures = report.attempted.iter().filter(|(_, ok)| !*ok).count();
            if failures > 0 {
                warn!(
                    "[PHASE: rollback] [STEP: summary] {} undo action(s) failed; manual cleanup may be needed",
                    failures
                );
            }
        } else {
            warn!("[PHASE: rollback] [STEP: skipped] Rollback declined; partial install left in place");
        }
    }

    Err(err)
}

/// Entry point used by the CLI binary: standard phases for the resolved
/// mode, system undo executor.
pub async fn execute(ctx: &mut InstallContext) -> Result<(), InstallError> {
    let mode = ctx.cfg.mode.clone();
    let phases = standard_phases(&mode);
    run_phases(ctx, phases, &crate::rollback::SystemUndoExecutor).await
}

/// Render the phase trace as the end-of-run transcript block.
pub fn format_trace(trace: &[PhaseRecord]) -> String {
    let mut out = String::from("Phase trace:\n");
    for rec in trace {
        out.push_str(&format!(
            "  {:<20} {:<8} {:>6} ms\n",
            rec.name,
            rec.status.as_str(),
            rec.duration_ms
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{InstallArgs, InstallMode};
    use crate::rollback::testing::RecordingExecutor;
    use crate::rollback::UndoAction;
    use clap::Parser;
    use std::path::PathBuf;

    fn test_ctx() -> InstallContext {
        let args = InstallArgs::parse_from(["sessionlens-install", "--domain", "example.com"]);
        let mode = args.resolve_mode().unwrap();
        let cfg = args.target_config(&mode);
        InstallContext::new(cfg, false, false, false, false)
    }

    fn ok_mutating(name: &'static str) -> Phase {
        fn run(ctx: &mut InstallContext) -> PhaseFuture<'_> {
            Box::pin(async move {
                ctx.undo.push(UndoAction::RemoveInstalledFiles {
                    dir: PathBuf::from("/tmp/fake"),
                });
                Ok(())
            })
        }
        Phase { name, kind: PhaseKind::Mutating, run }
    }

    fn failing_mutating(name: &'static str) -> Phase {
        fn run(_ctx: &mut InstallContext) -> PhaseFuture<'_> {
            Box::pin(async move {
                Err(InstallError::phase(
                    "injected",
                    anyhow::anyhow!("verification failed"),
                ))
            })
        }
        Phase { name, kind: PhaseKind::Mutating, run }
    }

    fn failing_readonly(name: &'static str) -> Phase {
        fn run(_ctx: &mut InstallContext) -> PhaseFuture<'_> {
            Box::pin(async move { Err(InstallError::Preflight("tool missing".into())) })
        }
        Phase { name, kind: PhaseKind::ReadOnly, run }
    }

    #[tokio::test]
    async fn all_phases_passing_yields_full_trace() {
        let mut ctx = test_ctx();
        let exec = RecordingExecutor::default();
        let phases = vec![ok_mutating("a"), ok_mutating("b")];
        run_phases(&mut ctx, phases, &exec).await.unwrap();
        assert_eq!(ctx.trace.len(), 2);
        assert!(ctx.trace.iter().all(|r| r.status == PhaseStatus::Passed));
        assert!(exec.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn readonly_failure_aborts_without_rollback() {
        let mut ctx = test_ctx();
        let exec = RecordingExecutor::default();
        let phases = vec![ok_mutating("a"), failing_readonly("pre"), ok_mutating("never")];
        let err = run_phases(&mut ctx, phases, &exec).await.unwrap_err();
        assert!(!err.triggers_rollback());
        // Completed mutation is left in place for the operator to inspect.
        assert!(exec.executed.lock().unwrap().is_empty());
        assert_eq!(ctx.trace.last().unwrap().status, PhaseStatus::Skipped);
    }

    #[tokio::test]
    async fn phase_failure_unwinds_every_completed_mutation() {
        // Inject the failure at each of the four mutating slots in turn; the
        // undo stack must hold exactly the completed phases each time.
        for fail_at in 0..4 {
            let mut ctx = test_ctx();
            let exec = RecordingExecutor::default();
            let mut phases = Vec::new();
            for i in 0..4 {
                if i == fail_at {
                    phases.push(failing_mutating("boom"));
                } else {
                    phases.push(ok_mutating("step"));
                }
            }
            let err = run_phases(&mut ctx, phases, &exec).await.unwrap_err();
            assert!(err.triggers_rollback());
            assert_eq!(exec.executed.lock().unwrap().len(), fail_at);
            assert!(ctx.undo.is_empty());
        }
    }

    #[tokio::test]
    async fn failure_after_all_mutations_rolls_back_everything_with_exit_one() {
        let mut ctx = test_ctx();
        let exec = RecordingExecutor::default();
        let phases = vec![
            ok_mutating("db"),
            ok_mutating("files"),
            failing_mutating("proxy"),
        ];
        let err = run_phases(&mut ctx, phases, &exec).await.unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert_eq!(exec.executed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn dry_run_executes_no_undo_actions() {
        let mut ctx = test_ctx();
        ctx.dry_run = true;
        let exec = RecordingExecutor::default();
        let phases = vec![ok_mutating("a"), failing_mutating("b")];
        let _ = run_phases(&mut ctx, phases, &exec).await;
        // Rollback in dry-run prints instead of executing.
        assert!(exec.executed.lock().unwrap().is_empty());
    }

    #[test]
    fn client_only_skips_server_side_phases() {
        let mode = InstallMode::ClientOnly {
            origin: "https://replay.example.com".into(),
            flavor: crate::cli::ClientFlavor::Source,
        };
        let names: Vec<&str> = standard_phases(&mode).iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec!["detect-existing", "preflight", "install-files", "verify"]
        );
    }

    #[test]
    fn full_stack_runs_all_eight_phases() {
        let mode = InstallMode::FullStack {
            domain: "example.com".into(),
        };
        assert_eq!(standard_phases(&mode).len(), 8);
    }
}
