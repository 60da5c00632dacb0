//! Server configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! All tunables come from the environment with sane defaults; the only
//! required variable is `TOKEN_SECRET`, without which no handshake can be
//! verified. Startup fails fast on a missing secret rather than accepting
//! connections it can never authenticate. Parsing is factored over a lookup
//! closure so tests can exercise it without mutating process environment.

use std::time::Duration;

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 900;
/// Hard ceiling on token lifetime: 15 minutes.
pub const MAX_TOKEN_TTL_SECS: u64 = 900;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const DEFAULT_MESSAGE_MAX_LEN: usize = 500;
pub const DEFAULT_WALK_SPEED: f64 = 4.0;
pub const DEFAULT_CANONICAL_SLUG: &str = "lobby";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: `{value}`")]
    Invalid { var: &'static str, value: String },
}

/// Typed runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_address: String,
    pub listen_port: u16,
    pub token_secret: String,
    pub token_ttl: Duration,
    pub history_limit: usize,
    pub message_max_len: usize,
    pub walk_speed: f64,
    pub canonical_slug: String,
}

impl ServerConfig {
    /// Build the config from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `TOKEN_SECRET` is absent or a variable
    /// fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token_secret = lookup("TOKEN_SECRET")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::MissingVar("TOKEN_SECRET"))?;

        let listen_address = lookup("LISTEN_ADDRESS").unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_owned());
        let listen_port = parse_var(&lookup, "PORT", DEFAULT_PORT)?;

        // Tokens longer-lived than the ceiling are clamped, not rejected.
        let ttl_secs = parse_var(&lookup, "TOKEN_TTL_SECS", DEFAULT_TOKEN_TTL_SECS)?.min(MAX_TOKEN_TTL_SECS);

        Ok(Self {
            listen_address,
            listen_port,
            token_secret,
            token_ttl: Duration::from_secs(ttl_secs),
            history_limit: parse_var(&lookup, "HISTORY_LIMIT", DEFAULT_HISTORY_LIMIT)?,
            message_max_len: parse_var(&lookup, "MESSAGE_MAX_LEN", DEFAULT_MESSAGE_MAX_LEN)?,
            walk_speed: parse_var(&lookup, "WALK_SPEED", DEFAULT_WALK_SPEED)?,
            canonical_slug: lookup("CANONICAL_SLUG").unwrap_or_else(|| DEFAULT_CANONICAL_SLUG.to_owned()),
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(default);
    };
    raw.parse::<T>()
        .map_err(|_| ConfigError::Invalid { var, value: raw })
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
