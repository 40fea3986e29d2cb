//! Phonly You signaling relay.
//!
//! An axum WebSocket server that groups browser peers into channels and
//! forwards call-control messages (`extension_request`,
//! `extension_response`) to the other members of the sender's channel.
//!
//! # Usage
//!
//! ```bash
//! # Run on default address 0.0.0.0:8080
//! cargo run --bin phonly-relay
//!
//! # Run on custom address
//! cargo run --bin phonly-relay -- --bind 127.0.0.1:3001
//!
//! # Or via environment variable
//! PHONLY_RELAY_ADDR=127.0.0.1:3001 cargo run --bin phonly-relay
//! ```

use std::sync::Arc;

use clap::Parser;
use phonly_relay::config::{RelayCliArgs, RelayConfig};
use phonly_relay::relay::{self, RelayState};

#[tokio::main]
async fn main() {
    let cli = RelayCliArgs::parse();

    // Load config from CLI args + config file + env vars + defaults.
    let config = match RelayConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    // RUST_LOG wins over the configured level.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(
        addr = %config.bind_addr,
        max_payload_size = config.max_payload_size,
        "starting phonly signaling relay"
    );

    let state = Arc::new(RelayState::with_config(config.max_payload_size));

    match relay::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
        Ok((bound_addr, handle)) => {
            tracing::info!(addr = %bound_addr, "relay server listening");
            tokio::select! {
                res = handle => {
                    if let Err(e) = res {
                        tracing::error!(error = %e, "relay server task failed");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutdown requested, closing connections");
                    state.registry.close_all();
                    // Give writer tasks a moment to flush the close frames.
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start relay server");
            std::process::exit(1);
        }
    }
}
