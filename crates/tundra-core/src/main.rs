// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tundra Core - Contest Judging Engine
//!
//! The server binary: replays the event log, then serves the control and
//! judge channels until interrupted.

use anyhow::Result;
use tracing::{error, info};

use tundra_core::Config;
use tundra_core::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tundra_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Tundra Core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        control_addr = %config.control_addr,
        judge_addr = %config.judge_addr,
        data_prefix = %config.data_prefix,
        judge_auth = config.judge_key.is_some(),
        "Configuration loaded"
    );

    tokio::select! {
        result = server::run(config) => {
            if let Err(e) = &result {
                error!("Server error: {}", e);
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            Ok(())
        }
    }
}
