// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use crate::late_runs::LateRunsConfig;
use crate::logs::LogShippingConfig;
use crate::waiter::WaiterConfig;

/// Syntask services configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Late-run detector settings
    pub late_runs: LateRunsConfig,
    /// Log shipping settings
    pub logging_to_api: LogShippingConfig,
    /// Run waiter settings
    pub waiter: WaiterConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SYNTASK_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `SYNTASK_API_SERVICES_LATE_RUNS_ENABLED`: Start the late-run detector (default: true)
    /// - `SYNTASK_API_SERVICES_LATE_RUNS_LOOP_SECONDS`: Seconds between sweeps (default: 5)
    /// - `SYNTASK_API_SERVICES_LATE_RUNS_AFTER_SECONDS`: Seconds past schedule before a run is late (default: 15)
    /// - `SYNTASK_API_SERVICES_LATE_RUNS_BATCH_SIZE`: Runs corrected per batch (default: 400)
    /// - `SYNTASK_LOGGING_TO_API_BATCH_INTERVAL`: Seconds between log flushes, fractional (default: 2.0)
    /// - `SYNTASK_LOGGING_TO_API_BATCH_SIZE`: Bytes per log batch (default: 4000000)
    /// - `SYNTASK_LOGGING_TO_API_MAX_LOG_SIZE`: Bytes per log record (default: 1000000)
    /// - `SYNTASK_LOGGING_TO_API_MAX_BATCH_ITEMS`: Records per log batch (default: 1000)
    /// - `SYNTASK_WAITER_CACHE_TTL_SECONDS`: Seconds a completion is remembered (default: 600)
    /// - `SYNTASK_WAITER_CACHE_CAPACITY`: Completions remembered (default: 10000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SYNTASK_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SYNTASK_DATABASE_URL"))?;

        let late_runs = LateRunsConfig {
            enabled: bool_var("SYNTASK_API_SERVICES_LATE_RUNS_ENABLED", true)?,
            loop_interval: Duration::from_secs(positive_var(
                "SYNTASK_API_SERVICES_LATE_RUNS_LOOP_SECONDS",
                5,
            )?),
            late_after: Duration::from_secs(var(
                "SYNTASK_API_SERVICES_LATE_RUNS_AFTER_SECONDS",
                15,
                "must be a non-negative integer",
            )?),
            batch_size: positive_var("SYNTASK_API_SERVICES_LATE_RUNS_BATCH_SIZE", 400)?,
        };

        let batch_interval: f64 = var(
            "SYNTASK_LOGGING_TO_API_BATCH_INTERVAL",
            2.0,
            "must be a positive number of seconds",
        )?;
        if !batch_interval.is_finite() || batch_interval <= 0.0 {
            return Err(ConfigError::Invalid(
                "SYNTASK_LOGGING_TO_API_BATCH_INTERVAL",
                "must be a positive number of seconds",
            ));
        }

        let logging_to_api = LogShippingConfig {
            batch_interval: Duration::from_secs_f64(batch_interval),
            batch_size: positive_var("SYNTASK_LOGGING_TO_API_BATCH_SIZE", 4_000_000)?,
            max_log_size: positive_var("SYNTASK_LOGGING_TO_API_MAX_LOG_SIZE", 1_000_000)?,
            max_batch_items: positive_var("SYNTASK_LOGGING_TO_API_MAX_BATCH_ITEMS", 1000)?,
        };

        let waiter = WaiterConfig {
            cache_ttl: Duration::from_secs(positive_var("SYNTASK_WAITER_CACHE_TTL_SECONDS", 600)?),
            cache_capacity: positive_var("SYNTASK_WAITER_CACHE_CAPACITY", 10_000)?,
            ..Default::default()
        };

        Ok(Self {
            database_url,
            late_runs,
            logging_to_api,
            waiter,
        })
    }
}

fn var<T: FromStr>(key: &'static str, default: T, reason: &'static str) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, reason)),
        Err(_) => Ok(default),
    }
}

fn positive_var<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
{
    let value = var(key, default, "must be a positive integer")?;
    if value <= T::default() {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

fn bool_var(key: &'static str, default: bool) -> Result<bool, ConfigError> {
    let Ok(value) = std::env::var(key) else {
        return Ok(default);
    };

    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid(key, "must be true or false")),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
