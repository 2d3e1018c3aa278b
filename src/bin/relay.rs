// sessionlens-relay: browser-driven remote-install relay.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use sessionlens_installer::cli::RelayArgs;
use sessionlens_installer::relay;
use sessionlens_installer::utils::logging;

fn log_dir() -> PathBuf {
    let system = PathBuf::from("/var/log/sessionlens");
    if std::fs::create_dir_all(&system).is_ok() {
        system
    } else {
        std::env::temp_dir().join("sessionlens-relay")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = RelayArgs::parse();

    if let Err(e) = logging::init_json(&log_dir(), args.verbose) {
        eprintln!("error: cannot set up logging: {e}");
        return ExitCode::from(1);
    }

    match relay::serve(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("relay failed: {e}");
            ExitCode::from(1)
        }
    }
}
