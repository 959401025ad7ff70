//! The remote-side agent binary. Transports start it with `stage0` on
//! every host (and on every hop of a via-chain); the bootstrapper runs its
//! `check` to validate a freshly installed environment.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use frog::agent;

#[derive(Debug, Parser)]
#[command(name = "frog-agent", about = "frog remote execution agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the frame protocol on stdio. Started by a transport, never by
    /// hand.
    Stage0 {
        /// Context id assigned by the controller.
        #[arg(long)]
        id: u32,
    },

    /// Verify an installed environment and exit.
    Check {
        /// Environment directory to check.
        #[arg(long)]
        env: PathBuf,
    },
}

fn main() -> ExitCode {
    // stdout carries the wire protocol; logs go to stderr and bubble up
    // the context tree.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("FROG_AGENT_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Stage0 { id } => {
            agent::serve(id);
            ExitCode::SUCCESS
        }
        Command::Check { env } => {
            let requirements = env.join("requirements.txt");
            if !requirements.is_file() {
                eprintln!("missing {}", requirements.display());
                return ExitCode::FAILURE;
            }
            if !env.join("bin").is_dir() || !env.join("share").is_dir() {
                eprintln!("environment layout at {} is incomplete", env.display());
                return ExitCode::FAILURE;
            }

            println!("ok");
            ExitCode::SUCCESS
        }
    }
}
