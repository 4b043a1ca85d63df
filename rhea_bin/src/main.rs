//! The Rhea storage engine entry point.
//!
//! `rhea_bin start` / `rhea_bin open <data_dir>` runs recovery and holds
//! the engine open until stdin closes; `rhea_bin checkpoint <data_dir>`
//! runs recovery and takes one administrative checkpoint.

use rhea_bin::{Engine, EngineConfig, EngineError};
use std::io::BufRead;

fn main() -> Result<(), EngineError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("start");
    let data_dir = args
        .get(1)
        .cloned()
        .or_else(|| std::env::var("RHEA_DATA_DIR").ok())
        .unwrap_or_else(|| "rhea_data".to_string());

    let config = EngineConfig::from_env();
    match command {
        "start" | "open" => {
            let engine = Engine::open(&data_dir, config)?;
            tracing::info!(%data_dir, "engine ready; close stdin to shut down");
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                if line.is_err() {
                    break;
                }
            }
            engine.close()
        }
        "checkpoint" => {
            let engine = Engine::open(&data_dir, config)?;
            let end_lsn = engine.checkpoint()?;
            tracing::info!(end_lsn, "manual checkpoint complete");
            engine.close()
        }
        other => {
            eprintln!("usage: rhea_bin [start|open|checkpoint] [data_dir]");
            eprintln!("unknown command: {other}");
            std::process::exit(2);
        }
    }
}
