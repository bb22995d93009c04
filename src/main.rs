// src/main.rs

//! The main entry point for the framegate server application.

use anyhow::Result;
use framegate::config::Config;
use framegate::server;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("framegate version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path. It can be provided via a --config
    // flag; otherwise, it defaults to "config.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    // A missing default config file starts the server with defaults so a
    // fresh checkout can boot; an explicit path must exist.
    let mut config = if std::path::Path::new(config_path).exists() {
        match Config::from_file(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
                std::process::exit(1);
            }
        }
    } else if args.iter().any(|arg| arg == "--config") {
        eprintln!("Configuration file \"{config_path}\" does not exist");
        std::process::exit(1);
    } else {
        Config::default()
    };

    // Override port if provided as a command-line argument.
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        if let Some(port_str) = args.get(port_index + 1) {
            match port_str.parse::<u16>() {
                Ok(port) => config.port = port,
                Err(_) => {
                    eprintln!("Invalid port number: {port_str}");
                    std::process::exit(1);
                }
            }
        } else {
            eprintln!("--port flag requires a value");
            std::process::exit(1);
        }
    }

    // Setup logging with reloading capabilities so the level can be changed
    // at runtime through the admin API.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true),
        )
        .init();

    let reload_handle = Arc::new(reload_handle);

    if let Err(e) = server::run(config, Some(reload_handle)).await {
        error!("Server runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
