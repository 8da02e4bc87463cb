//! # Chatter Server
//!
//! Real-time chat delivery server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! chatter
//!
//! # Run with custom config
//! chatter --config /path/to/chatter.toml
//!
//! # Run with environment variables
//! CHATTER_PORT=8080 CHATTER_HOST=0.0.0.0 chatter
//! CHATTER__LIMITS__MAX_CONNECTIONS=5000 chatter
//! ```

use anyhow::Result;
use chatter_server::{config::Config, handlers, metrics};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Real-time chat delivery server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file. Without it the default locations are searched.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match args.config {
        Some(path) => Config::from_file(path)?.with_env_overrides()?,
        None => Config::load()?,
    };

    tracing::info!("Starting Chatter server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_config_flag() {
        let args = Args::try_parse_from(["chatter"]).unwrap();
        assert_eq!(args.config, None);

        let args = Args::try_parse_from(["chatter", "--config", "/etc/chatter.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/chatter.toml")));

        let args = Args::try_parse_from(["chatter", "--config=local.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("local.toml")));

        assert!(Args::try_parse_from(["chatter", "--config"]).is_err());
        assert!(Args::try_parse_from(["chatter", "--port", "80"]).is_err());
    }
}
