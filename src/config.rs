// Service configuration, read from environment-style variables

use std::time::Duration;
use thiserror::Error;

pub const TTL_SECONDS_VAR: &str = "TTL_SECONDS";
pub const PAGE_SIZE_VAR: &str = "PAGE_SIZE";
pub const STORE_TIMEOUT_MS_VAR: &str = "STORE_TIMEOUT_MS";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    // Expiry applied to every set_with_expiry fill
    pub ttl_seconds: u64,
    // Products per listing page
    pub page_size: u32,
    // Upper bound on each key-value store call
    pub store_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 60 * 60 * 4,
            page_size: 6,
            store_timeout_ms: 500,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    // Unset or blank variables keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            ttl_seconds: parse_var(&lookup, TTL_SECONDS_VAR, defaults.ttl_seconds, positive::<u64>)?,
            page_size: parse_var(&lookup, PAGE_SIZE_VAR, defaults.page_size, positive::<u32>)?,
            store_timeout_ms: parse_var(
                &lookup,
                STORE_TIMEOUT_MS_VAR,
                defaults.store_timeout_ms,
                positive::<u64>,
            )?,
        })
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn positive<T: Default + PartialEq>(value: &T) -> Result<(), &'static str> {
    if *value == T::default() {
        Err("must be greater than zero")
    } else {
        Ok(())
    }
}

fn parse_var<T, F, C>(lookup: &F, name: &'static str, default: T, check: C) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
    C: Fn(&T) -> Result<(), &'static str>,
{
    let raw = match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw,
        _ => return Ok(default),
    };

    let value = raw
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidValue {
            name,
            value: raw.clone(),
            reason: e.to_string(),
        })?;

    check(&value).map_err(|reason| ConfigError::InvalidValue {
        name,
        value: raw,
        reason: reason.to_string(),
    })?;

    Ok(value)
}
