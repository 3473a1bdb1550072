// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;

/// Tundra Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix for the data files; the event log lives at `<prefix>.log`
    /// and the content store at `<prefix>.bin`.
    pub data_prefix: String,
    /// Loopback address of the control channel (newline-delimited JSON).
    pub control_addr: SocketAddr,
    /// Address judges connect to.
    pub judge_addr: SocketAddr,
    /// Shared secret judges must present on registration. When unset, any
    /// password is accepted.
    pub judge_key: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TUNDRA_DATA_PREFIX`: prefix for the event log and content store
    ///
    /// Optional (with defaults):
    /// - `TUNDRA_CONTROL_PORT`: control channel port (default: 17240)
    /// - `TUNDRA_JUDGE_PORT`: judge channel port (default: 17239)
    /// - `TUNDRA_JUDGE_KEY`: shared secret for judge registration
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_prefix = std::env::var("TUNDRA_DATA_PREFIX")
            .map_err(|_| ConfigError::Missing("TUNDRA_DATA_PREFIX"))?;

        let control_port: u16 = std::env::var("TUNDRA_CONTROL_PORT")
            .unwrap_or_else(|_| "17240".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TUNDRA_CONTROL_PORT", "must be a valid port number")
            })?;

        let judge_port: u16 = std::env::var("TUNDRA_JUDGE_PORT")
            .unwrap_or_else(|_| "17239".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("TUNDRA_JUDGE_PORT", "must be a valid port number")
            })?;

        let judge_key = std::env::var("TUNDRA_JUDGE_KEY").ok();

        Ok(Self {
            data_prefix,
            control_addr: SocketAddr::from(([127, 0, 0, 1], control_port)),
            judge_addr: SocketAddr::from(([0, 0, 0, 0], judge_port)),
            judge_key,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
