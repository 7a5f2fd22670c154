//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::wait::{ConvergenceWaiter, TokioClock};

/// Connection and polling settings for the remote compute API, layered from
/// defaults, configuration files, and environment variables.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "TETHER",
    discovery(
        app_name = "tether",
        env_var = "TETHER_CONFIG_PATH",
        config_file_name = "tether.toml",
        dotfile_name = ".tether.toml",
        project_file_name = "tether.toml"
    )
)]
pub struct ApiConfig {
    /// Base URL of the compute API (for example `https://compute.example.net/v1`).
    pub endpoint: String,
    /// Token sent in the `X-Auth-Token` header. Required.
    pub token: String,
    /// Per-request timeout in seconds.
    #[ortho_config(default = 30)]
    pub request_timeout_secs: u64,
    /// Delay between status reads while waiting, in seconds.
    #[ortho_config(default = 5)]
    pub poll_interval_secs: u64,
    /// Default wait budget for `--wait`, in seconds.
    #[ortho_config(default = 300)]
    pub wait_timeout_secs: u64,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to tether.toml",
            self.description, self.env_var, self.toml_key
        ))
    }

    fn invalid(&self, reason: &str) -> ConfigError {
        ConfigError::Invalid(format!(
            "invalid {} ({reason}): check {} or {} in tether.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const ENDPOINT: FieldMetadata = FieldMetadata::new("API endpoint", "TETHER_ENDPOINT", "endpoint");
const TOKEN: FieldMetadata = FieldMetadata::new("API token", "TETHER_TOKEN", "token");
const REQUEST_TIMEOUT: FieldMetadata = FieldMetadata::new(
    "request timeout",
    "TETHER_REQUEST_TIMEOUT_SECS",
    "request_timeout_secs",
);
const POLL_INTERVAL: FieldMetadata = FieldMetadata::new(
    "poll interval",
    "TETHER_POLL_INTERVAL_SECS",
    "poll_interval_secs",
);

impl ApiConfig {
    /// Loads configuration without attempting to parse CLI arguments. Values
    /// merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("tether")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages name the environment
    /// variable and configuration key that supply each value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ENDPOINT.missing());
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ENDPOINT.invalid("expected an http:// or https:// URL"));
        }
        if self.token.trim().is_empty() {
            return Err(TOKEN.missing());
        }
        if self.request_timeout_secs == 0 {
            return Err(REQUEST_TIMEOUT.invalid("must be at least one second"));
        }
        if self.poll_interval_secs == 0 {
            return Err(POLL_INTERVAL.invalid("must be at least one second"));
        }
        Ok(())
    }

    /// Endpoint without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.endpoint.trim().trim_end_matches('/')
    }

    /// Per-request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Default wait budget.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    /// Builds the production convergence waiter. Failed reads back off for
    /// twice the poll interval.
    #[must_use]
    pub const fn waiter(&self) -> ConvergenceWaiter<TokioClock> {
        let interval = Duration::from_secs(self.poll_interval_secs);
        ConvergenceWaiter::new(TokioClock)
            .with_poll_interval(interval)
            .with_error_backoff(Duration::from_secs(self.poll_interval_secs.saturating_mul(2)))
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a configuration value is present but unusable.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
