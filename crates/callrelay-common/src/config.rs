//! Relay configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > callrelay.toml > defaults

use crate::error::{RelayError, RelayResult};
use crate::validation::validate_device_id;
use chrono::TimeDelta;
use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::Path;

/// Default config file name, looked up in the working directory.
const DEFAULT_CONFIG_FILE: &str = "callrelay";

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub relay: RelaySettings,
    pub policy: PolicyConfig,
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelaySettings {
    /// Seconds a call attempt may stay short of `Active` before it is evicted
    pub call_timeout_secs: u64,
    /// How often the timeout sweeper runs
    pub sweep_interval_secs: u64,
    /// Send `error{UNKNOWN_RELAY_TARGET}` instead of silently dropping
    pub report_unknown_target: bool,
    /// Only relay offer/answer/ICE between participants of a call record
    pub require_call_record: bool,
    /// Tell the remaining participant when the other side disconnects
    pub notify_peer_on_disconnect: bool,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            sweep_interval_secs: 5,
            report_unknown_target: true,
            require_call_record: true,
            notify_peer_on_disconnect: true,
        }
    }
}

impl RelaySettings {
    /// `call_timeout_secs` as a span usable against call timestamps.
    pub fn call_timeout(&self) -> RelayResult<TimeDelta> {
        i64::try_from(self.call_timeout_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| {
                config_error(format!(
                    "relay.call_timeout_secs = {} is out of range",
                    self.call_timeout_secs
                ))
            })
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PolicyConfig {
    /// Also allow the reverse direction of every rule
    #[serde(default)]
    pub mirror: bool,
    #[serde(default)]
    pub allow: Vec<AllowRule>,
}

/// One whitelist row: `caller` may call each of `receivers`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct AllowRule {
    pub caller: String,
    pub receivers: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    pub json: bool,
}

impl RelayConfig {
    /// Load configuration from defaults, an optional config file, `.env` and the environment.
    ///
    /// With `config_file = None` the relay looks for `callrelay.toml` in the working
    /// directory and carries on without it; an explicit path must exist.
    pub fn load(config_file: Option<&Path>) -> RelayResult<Self> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        let file = match config_file {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let cfg = with_defaults()?
            .add_source(file)
            // Environment variables (CALLRELAY__SERVER__PORT, CALLRELAY__RELAY__CALL_TIMEOUT_SECS, ...)
            .add_source(
                Environment::with_prefix("CALLRELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from a TOML document layered over the defaults.
    pub fn from_toml_str(toml: &str) -> RelayResult<Self> {
        let config: Self = with_defaults()?
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the relay could not honor at runtime.
    ///
    /// Whitelist entries must be ids a device could actually register under.
    pub fn validate(&self) -> RelayResult<()> {
        self.relay.call_timeout()?;

        for (i, rule) in self.policy.allow.iter().enumerate() {
            for device_id in std::iter::once(&rule.caller).chain(&rule.receivers) {
                validate_device_id(Some(device_id.as_str())).map_err(|e| {
                    config_error(format!("policy.allow[{i}]: {device_id:?}: {e}"))
                })?;
            }
        }
        Ok(())
    }
}

fn config_error(message: String) -> RelayError {
    RelayError::Config(ConfigError::Message(message))
}

fn with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    config::Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("relay.call_timeout_secs", 30)?
        .set_default("relay.sweep_interval_secs", 5)?
        .set_default("relay.report_unknown_target", true)?
        .set_default("relay.require_call_record", true)?
        .set_default("relay.notify_peer_on_disconnect", true)?
        .set_default("policy.mirror", false)?
        .set_default("log.filter", "callrelay=debug,tower_http=debug")?
        .set_default("log.json", false)
}
