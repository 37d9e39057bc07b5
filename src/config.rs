//! Configuration loading from `.env` files.

use std::{env, path::PathBuf};

use anyhow::{bail, Context, Result};

use crate::filter::UntilBound;
use crate::store::StoreOptions;

/// Default number of key-lock shards.
pub const DEFAULT_LOCK_SHARDS: usize = 64;

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for all storage.
    pub store_root: PathBuf,
    /// Verify Schnorr signatures on save (ids are always checked).
    pub verify_sig: bool,
    /// Treat `until` as inclusive (NIP-01 wording) instead of exclusive.
    pub until_inclusive: bool,
    /// Number of shards in the per-key write lock table.
    pub lock_shards: usize,
    /// Optional `tracing` filter directive such as `debug` or `hamerkop=trace`.
    pub log_level: Option<String>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    ///
    /// Variables already present in the process environment take precedence
    /// over the file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let store_root = PathBuf::from(env::var("STORE_ROOT").context("STORE_ROOT is not set")?);
        let verify_sig = parse_flag("VERIFY_SIG", true)?;
        let until_inclusive = parse_flag("UNTIL_INCLUSIVE", false)?;
        let lock_shards = match env::var("LOCK_SHARDS") {
            Ok(s) if !s.trim().is_empty() => s
                .trim()
                .parse()
                .with_context(|| format!("LOCK_SHARDS is not a valid integer: {s}"))?,
            _ => DEFAULT_LOCK_SHARDS,
        };
        let log_level = env::var("LOG_LEVEL").ok().filter(|s| !s.is_empty());
        Ok(Self {
            store_root,
            verify_sig,
            until_inclusive,
            lock_shards,
            log_level,
        })
    }

    /// Store tuning derived from these settings.
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            verify_sig: self.verify_sig,
            until_bound: if self.until_inclusive {
                UntilBound::Inclusive
            } else {
                UntilBound::Exclusive
            },
            lock_shards: self.lock_shards,
        }
    }
}

/// Read a boolean variable, falling back to `default` when unset or empty.
fn parse_flag(name: &str, default: bool) -> Result<bool> {
    let Ok(raw) = env::var(name) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{name} is not a valid boolean: {other}"),
    }
}
