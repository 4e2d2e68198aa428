// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::RunError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use trackrun_dispatch::{DispatchMode, DispatcherConfig, TerminationPolicy};

pub const QUEUE_SIZE: usize = 10000;
pub const RESOURCES_METRICS_INTERVAL: Duration = Duration::from_secs(30);
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Where a run sends its records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Online,
    Offline,
    /// Every call is rejected, nothing is recorded anywhere.
    Disabled,
}

/// Connection settings for the tracking service
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL (e.g., https://tracking.example.com)
    pub url: Option<String>,
    /// Bearer token used for every request
    pub token: Option<String>,
    /// Root of the offline journal, one sub-directory per run
    pub offline_directory: PathBuf,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            offline_directory: default_offline_directory(),
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

fn default_offline_directory() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(env::temp_dir)
        .join(".trackrun")
}

impl ClientConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let url = env::var("TRACKRUN_URL")
            .ok()
            .map(|val| val.trim_end_matches('/').to_string())
            .filter(|val| !val.is_empty());
        let token = env::var("TRACKRUN_TOKEN").ok().filter(|val| !val.is_empty());
        let offline_directory = env::var_os("TRACKRUN_OFFLINE_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(default_offline_directory);
        let https_proxy = env::var("TRACKRUN_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();
        let log_level = env::var("TRACKRUN_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());

        Self {
            url,
            token,
            offline_directory,
            https_proxy,
            log_level,
        }
    }

    /// Validate the configuration for the given mode
    pub fn validate(&self, mode: Mode) -> Result<(), RunError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(RunError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        if mode == Mode::Online && (self.url.is_none() || self.token.is_none()) {
            return Err(RunError::InvalidConfig(
                "Unable to get URL and token from the environment".to_string(),
            ));
        }

        if mode == Mode::Offline && self.offline_directory.as_os_str().is_empty() {
            return Err(RunError::InvalidConfig(
                "Offline directory cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

/// Per-run tuning knobs, the counterpart of the client's `config()` call
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Log errors and return `Ok(false)` instead of returning them
    pub suppress_errors: bool,
    /// Wait for queue space instead of rejecting items when full
    pub queue_blocking: bool,
    pub queue_size: usize,
    pub resources_metrics_interval: Duration,
    pub disable_resources_metrics: bool,
    pub heartbeat_interval: Duration,
    pub dispatch_mode: DispatchMode,
    pub max_buffer_size: usize,
    pub max_read_rate: f64,
    pub termination: TerminationPolicy,
    /// Storage backend to attach to registered files
    pub storage_id: Option<String>,
    /// Process whose resource usage is sampled, defaults to this process
    pub pid: Option<u32>,
}

impl Default for RunOptions {
    fn default() -> Self {
        let dispatcher = DispatcherConfig::default();
        Self {
            suppress_errors: true,
            queue_blocking: false,
            queue_size: QUEUE_SIZE,
            resources_metrics_interval: RESOURCES_METRICS_INTERVAL,
            disable_resources_metrics: false,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            dispatch_mode: DispatchMode::Queued,
            max_buffer_size: dispatcher.max_buffer_size,
            max_read_rate: dispatcher.max_read_rate,
            termination: dispatcher.termination,
            storage_id: None,
            pid: None,
        }
    }
}

impl RunOptions {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_buffer_size: self.max_buffer_size,
            max_read_rate: self.max_read_rate,
            queue_capacity: Some(self.queue_size),
            termination: self.termination,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), RunError> {
        if self.queue_size == 0 {
            return Err(RunError::InvalidConfig(
                "queue_size must be greater than 0".to_string(),
            ));
        }
        if self.max_buffer_size == 0 {
            return Err(RunError::InvalidConfig(
                "max_buffer_size must be greater than 0".to_string(),
            ));
        }
        if !(self.max_read_rate.is_finite() && self.max_read_rate > 0.0) {
            return Err(RunError::InvalidConfig(
                "max_read_rate must be a positive number".to_string(),
            ));
        }
        if self.resources_metrics_interval.is_zero() || self.heartbeat_interval.is_zero() {
            return Err(RunError::InvalidConfig(
                "worker intervals must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reads the `exp` claim (seconds since the epoch) of a JWT style token.
pub fn token_expiry(token: &str) -> Option<i64> {
    let claims = token.split('.').nth(1)?;
    let decoded = URL_SAFE_NO_PAD.decode(claims.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    claims.get("exp")?.as_i64()
}

/// Tokens that cannot be decoded count as expired.
pub fn token_expired(token: &str, now: i64) -> bool {
    token_expiry(token).map_or(true, |exp| exp <= now)
}
