// sessionlens-install: multi-phase provisioning CLI.
//
// Exit codes: 0 success, 1 failure after best-effort rollback, 2 argument
// errors (clap), 3 connectivity errors during preflight probes.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use sessionlens_installer::cli::{InstallArgs, InstallMode};
use sessionlens_installer::credentials::Credentials;
use sessionlens_installer::phases::{execute, format_trace, InstallContext};
use sessionlens_installer::utils::logging;

fn log_dir() -> PathBuf {
    let system = PathBuf::from("/var/log/sessionlens");
    if std::fs::create_dir_all(&system).is_ok() {
        system
    } else {
        std::env::temp_dir().join("sessionlens-install")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = InstallArgs::parse();

    let mode = match args.resolve_mode() {
        Ok(mode) => mode,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!("Run with --help for usage.");
            return ExitCode::from(2);
        }
    };

    let log_file = match logging::init(&log_dir(), args.verbose) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("error: cannot set up logging: {e}");
            return ExitCode::from(1);
        }
    };

    info!(
        "[PHASE: main] [STEP: start] sessionlens-install {} ({} mode{})",
        env!("CARGO_PKG_VERSION"),
        mode.label(),
        if args.dry_run { ", dry-run" } else { "" }
    );

    let cfg = args.target_config(&mode);
    let mut ctx = InstallContext::new(
        cfg,
        args.dry_run,
        !args.non_interactive,
        args.force,
        args.preserve_data,
    );

    if matches!(mode, InstallMode::FullStack { .. }) {
        ctx.credentials = match Credentials::generate() {
            Ok(creds) => Some(creds),
            Err(e) => {
                error!("[PHASE: main] [STEP: credentials] {}", e);
                eprintln!("error: could not generate installation credentials");
                return ExitCode::from(1);
            }
        };
    }

    let result = execute(&mut ctx).await;
    print!("{}", format_trace(&ctx.trace));

    match result {
        Ok(()) => {
            if args.dry_run {
                println!("Dry run complete. No changes were made.");
            } else {
                println!("Installation complete.");
            }
            println!("Log: {}", log_file.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            let failed_phase = ctx
                .trace
                .iter()
                .rev()
                .find(|r| r.status == sessionlens_installer::phases::PhaseStatus::Failed)
                .map(|r| r.name)
                .unwrap_or("unknown");
            eprintln!("Installation failed during '{failed_phase}': {e}");
            eprintln!("Log: {}", log_file.display());
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
