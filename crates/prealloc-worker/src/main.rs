//! The worker process for the disk space pre-allocation.
//!
//! Without arguments, serves the requests read from stdin and writes the
//! replies to stdout. The logs go to stderr.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// The environment variable to read the log filter from.
const LOG_ENV: &str = "PREALLOC_LOG";

#[derive(Debug, Parser)]
#[command(version, about = "Disk space pre-allocation worker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the requests from stdin (the default)
    Serve,

    /// Allocate the disk space for a single file
    Allocate {
        /// The file to allocate the space for, created if missing
        path: PathBuf,

        /// The amount of bytes to allocate
        length: u64,

        /// The offset to allocate at
        #[arg(long, default_value_t = 0)]
        offset: u64,

        /// The mode flags to pass to fallocate
        #[arg(long)]
        mode: Option<i32>,

        /// Use posix_fallocate instead of fallocate
        #[arg(long)]
        posix: bool,
    },

    /// Print the resolved strategies and the error backend
    Probe,
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let stdin = std::io::stdin();
            let stdout = std::io::stdout();
            prealloc::worker::serve(stdin.lock(), stdout.lock())
                .context("worker channel failure")?;
        }
        Command::Allocate {
            path,
            length,
            offset,
            mode,
            posix,
        } => {
            let method = if posix {
                prealloc::Method::PosixFallocate
            } else {
                prealloc::Method::Fallocate
            };
            method
                .invoke(&path, offset.into(), length.into(), mode.map(Into::into))
                .with_context(|| format!("unable to allocate {}", path.display()))?;
            println!("{}: {} bytes at {}", path.display(), length, offset);
        }
        Command::Probe => {
            for (family, kind) in prealloc::sync::strategies() {
                match kind {
                    Some(kind) => println!("{family}: {kind:?}"),
                    None => println!("{family}: none"),
                }
            }
            match prealloc::errors::backend() {
                Some(resolved) => println!("errors: {:?}", resolved.value.kind()),
                None => println!("errors: none"),
            }
        }
    }

    Ok(())
}
