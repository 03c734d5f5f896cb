mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "symbind=debug"
    } else {
        "symbind=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Check => commands::check::run(),
        Command::Scan {
            path,
            pattern,
            scope,
            section,
            limit,
        } => commands::scan::run(&path, &pattern, scope, &section, limit),
        Command::Decode {
            path,
            address,
            kind,
        } => commands::decode::run(&path, &address, kind),
        Command::Resolve { path, config, json } => {
            commands::resolve::run(&path, &config, json.as_deref())
        }
    }
}
