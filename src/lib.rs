pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod excel;
pub mod models;
pub mod ocr;
pub mod persist;
pub mod services;
pub mod types;

pub use error::{Error, Result};

use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so stdout carries only the JSON result.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run() -> ExitCode {
    init_tracing();
    cli::main()
}
