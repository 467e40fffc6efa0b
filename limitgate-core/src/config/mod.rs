//! Process configuration, read from the environment at startup.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::Deserialize;

use crate::error::{Error, ErrorDetails};
use crate::rate_limiting::config::{default_ceiling, RateLimitConfig};

pub const DEFAULT_COORDINATION_URL: &str = "redis://localhost:6379";
pub const DEFAULT_WINDOW_SECONDS: u64 = 60;
pub const DEFAULT_MAX_INFLIGHT: usize = 1024;
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

#[derive(Clone, Debug)]
pub struct Config {
    pub coordination_url: String,
    pub window_seconds: u64,
    pub max_inflight: usize,
    pub listen_addr: SocketAddr,
    /// Per-deployment ceilings applied on top of the derived tiers.
    pub ceiling: RateLimitConfig,
    /// Static key -> config mapping; read once, immutable thereafter.
    pub overrides: HashMap<String, RateLimitConfig>,
}

/// Shape of the optional overrides file named by `OVERRIDES_PATH`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverridesFile {
    #[serde(default)]
    keys: HashMap<String, RateLimitConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from any name -> value lookup. `from_env` is the thin
    /// production wrapper; tests supply a map instead of mutating the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let coordination_url = lookup("COORDINATION_URL")
            .unwrap_or_else(|| DEFAULT_COORDINATION_URL.to_string());
        let window_seconds = parse_var(&lookup, "WINDOW_SECONDS", DEFAULT_WINDOW_SECONDS)?;
        let max_inflight = parse_var(&lookup, "MAX_INFLIGHT", DEFAULT_MAX_INFLIGHT)?;
        let listen_addr: SocketAddr = lookup("LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid LISTEN_ADDR: {e}"),
                })
            })?;

        let defaults = default_ceiling();
        let ceiling = RateLimitConfig {
            input_tpm: parse_var(&lookup, "INPUT_TPM_DEFAULT", defaults.input_tpm)?,
            output_tpm: parse_var(&lookup, "OUTPUT_TPM_DEFAULT", defaults.output_tpm)?,
            rpm: parse_var(&lookup, "RPM_DEFAULT", defaults.rpm)?,
        };

        let overrides = match lookup("OVERRIDES_PATH") {
            Some(path) => load_overrides(&path)?,
            None => HashMap::new(),
        };

        let config = Self {
            coordination_url,
            window_seconds,
            max_inflight,
            listen_addr,
            ceiling,
            overrides,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.window_seconds == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "WINDOW_SECONDS must be at least 1".to_string(),
            }));
        }
        if self.max_inflight == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "MAX_INFLIGHT must be at least 1".to_string(),
            }));
        }
        self.ceiling.validate().map_err(|message| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid limit ceiling: {message}"),
            })
        })?;
        for (key, config) in &self.overrides {
            config.validate().map_err(|message| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid override for `{key}`: {message}"),
                })
            })?;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw.parse().map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Invalid {name} `{raw}`: {e}"),
            })
        }),
        None => Ok(default),
    }
}

fn load_overrides(path: &str) -> Result<HashMap<String, RateLimitConfig>, Error> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Failed to read overrides file `{path}`: {e}"),
        })
    })?;
    let parsed: OverridesFile = toml::from_str(&raw).map_err(|e| {
        Error::new(ErrorDetails::Config {
            message: format!("Failed to parse overrides file `{path}`: {e}"),
        })
    })?;
    Ok(parsed.keys)
}
