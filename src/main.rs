#[cfg(any(target_os = "linux", target_os = "macos"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

mod agents;
mod config;
mod console;
mod core;
mod heartbeat;
mod memory;
mod orchestrator;
mod prompt;
mod providers;
mod reminders;
mod scheduler;
mod session;
mod tokens;
mod tools;
mod traits;
mod warmup;
mod workspace;

#[cfg(test)]
mod integration_tests;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    // .env is optional; ADJUTANT_ENV_FILE overrides discovery.
    if let Ok(path) = std::env::var("ADJUTANT_ENV_FILE") {
        if !path.trim().is_empty() {
            if let Err(e) = dotenvy::from_path(&path) {
                eprintln!("Warning: failed to load ADJUTANT_ENV_FILE '{}': {}", path, e);
            }
        } else {
            let _ = dotenvy::dotenv();
        }
    } else {
        let _ = dotenvy::dotenv();
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-V" => {
                println!("adjutant {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                println!("adjutant {}", env!("CARGO_PKG_VERSION"));
                println!("{}\n", env!("CARGO_PKG_DESCRIPTION"));
                println!("Usage: adjutant [--config path/to/config.toml]");
                println!("\nSecrets are read from the OS keychain or ADJUTANT_* env vars");
                println!("(ADJUTANT_LLM_API_KEY at minimum).");
                return Ok(());
            }
            _ => {}
        }
    }

    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    // Corrupted config: try the backups before giving up.
    let config = match config::AppConfig::load(&config_path) {
        Ok(c) => c,
        Err(e) if config_path.exists() => {
            eprintln!("Config load failed: {}", e);
            let candidates = [
                config_path.with_extension("toml.bak"),
                config_path.with_extension("toml.bak.1"),
            ];
            let mut restored = None;
            for candidate in &candidates {
                if candidate.exists() {
                    eprintln!("Trying restore from {}...", candidate.display());
                    if std::fs::copy(candidate, &config_path).is_ok() {
                        if let Ok(c) = config::AppConfig::load(&config_path) {
                            eprintln!("Restored config from {}", candidate.display());
                            restored = Some(c);
                            break;
                        }
                    }
                }
            }
            match restored {
                Some(c) => c,
                None => return Err(e),
            }
        }
        Err(_) => {
            // No config at all: defaults are enough to run against env
            // secrets and ~/.adjutant.
            toml::from_str("[provider]\n").expect("default config parses")
        }
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let transport = Arc::new(console::ConsoleTransport);
            let daemon = core::Daemon::start(config, transport).await?;
            console::run_repl(daemon).await
        })
}
