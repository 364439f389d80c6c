//! Operator entry point for placetree databases.
//!
//! # Responsibility
//! - Parse arguments and start file logging when a log directory is given.
//! - Run one subcommand and map its outcome to the process exit code.

mod cli;
mod commands;

use clap::Parser;
use std::error::Error;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    if let Some(log_dir) = cli.log_dir.as_deref() {
        if let Err(message) = placetree_core::init_logging(&cli.log_level, log_dir) {
            eprintln!("error: {message}");
            return ExitCode::FAILURE;
        }
    }

    match commands::run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("event=cli_run module=cli status=error error={err}");
            eprintln!("error: {err}");
            let mut source = err.source();
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
