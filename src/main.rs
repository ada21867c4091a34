// src/main.rs

use anyhow::Result;
use clap::Parser;
use railyard::cli::Cli;
use railyard::commands;

fn main() -> Result<()> {
    // Usage errors exit 1; --help and --version still exit 0
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    // RUST_LOG wins; otherwise the -d/-v flags pick the level
    let default_level = if cli.debug > 1 {
        "trace"
    } else if cli.debug > 0 {
        "debug"
    } else if cli.verbose > 0 {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    commands::run(cli)
}
