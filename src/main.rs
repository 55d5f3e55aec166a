//! OCPP gateway entry point
//!
//! Reads configuration from TOML (path via `OCPP_GATEWAY_CONFIG` or the
//! user config dir), initializes tracing, then runs the gateway until a
//! shutdown signal arrives.

use tracing::{info, warn};

use ocpp_gateway::support::errors::ConfigError;
use ocpp_gateway::{default_config_path, AppConfig, Gateway};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // ── Load configuration ─────────────────────────────────────
    let config_path = std::env::var("OCPP_GATEWAY_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_path());

    let (config, config_note) = match AppConfig::load(&config_path) {
        Ok(config) => (config, format!("loaded from {}", config_path.display())),
        Err(ConfigError::Io { .. }) => {
            // no file is fine; defaults give a runnable local gateway
            (AppConfig::default(), "using built-in defaults".to_string())
        }
        Err(e) => {
            // a present-but-broken config must refuse startup
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    // ── Tracing ────────────────────────────────────────────────
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(config = config_note.as_str(), "starting OCPP gateway");
    if let Err(e) = config.validate() {
        // unreachable for loaded configs (load validates); guards defaults
        warn!(error = %e, "configuration invalid");
        return Err(e.into());
    }

    let gateway = Gateway::build(config).await?;
    gateway.run().await
}
