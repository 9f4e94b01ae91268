//! Optional TOML configuration file.
//!
//! Every key is optional.  A file only overrides the settings it names; the
//! rest keep their defaults, and command-line arguments are applied on top
//! afterwards (see `main.rs`).
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0:8000"
//! readiness_timeout_ms = 5000
//!
//! [database]
//! host = "localhost"
//! port = 5432
//! user = "postgres"
//! password = ""
//! dbname = "messages"
//!
//! [pool]
//! max_leases = 32
//! max_lifetime_ms = 5000
//! max_idle_ms = 3000
//! acquire_timeout_ms = 5000
//!
//! [queries]
//! register = "SELECT add_user($1)"
//! ```
//!
//! Unknown keys are rejected so a misspelt setting does not silently fall
//! back to its default.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::BridgeConfig;
use crate::infrastructure::postgres::BackendQueries;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("I/O error reading config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// `server.bind` is not a socket address.
    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),

    /// `pool.max_leases` is zero.
    #[error("pool.max_leases must be at least 1")]
    ZeroLeases,
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub queries: QueriesSection,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub readiness_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PoolSection {
    pub max_leases: Option<usize>,
    pub max_lifetime_ms: Option<u64>,
    pub max_idle_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
}

/// SQL overrides for the backend calls.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct QueriesSection {
    pub snapshot: Option<String>,
    pub register: Option<String>,
    pub deregister: Option<String>,
    pub persist: Option<String>,
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Reads and parses the file at `path`.
///
/// Unlike a platform default location, a path given explicitly must exist.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read and
/// [`ConfigError::Parse`] if the TOML is malformed.
pub fn load(path: &Path) -> Result<ConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ConfigFile::parse(&content)
}

impl ConfigFile {
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Overwrites the settings this file names.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAddress`] for an unparsable
    /// `server.bind` and [`ConfigError::ZeroLeases`] for `max_leases = 0`.
    pub fn apply_to(&self, config: &mut BridgeConfig) -> Result<(), ConfigError> {
        if let Some(bind) = &self.server.bind {
            config.ws_bind_addr = bind
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidAddress(bind.clone()))?;
        }
        if let Some(ms) = self.server.readiness_timeout_ms {
            config.readiness_timeout = Duration::from_millis(ms);
        }

        let db = &mut config.database;
        overwrite(&mut db.host, &self.database.host);
        if let Some(port) = self.database.port {
            db.port = port;
        }
        overwrite(&mut db.user, &self.database.user);
        overwrite(&mut db.password, &self.database.password);
        overwrite(&mut db.dbname, &self.database.dbname);

        let pool = &mut config.pool;
        if let Some(max_leases) = self.pool.max_leases {
            if max_leases == 0 {
                return Err(ConfigError::ZeroLeases);
            }
            pool.max_leases = max_leases;
        }
        if let Some(ms) = self.pool.max_lifetime_ms {
            pool.max_lifetime = Duration::from_millis(ms);
        }
        if let Some(ms) = self.pool.max_idle_ms {
            pool.max_idle = Duration::from_millis(ms);
        }
        if let Some(ms) = self.pool.acquire_timeout_ms {
            pool.acquire_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    /// The backend SQL with this file's overrides applied.
    pub fn queries(&self) -> BackendQueries {
        let mut queries = BackendQueries::default();
        overwrite(&mut queries.snapshot, &self.queries.snapshot);
        overwrite(&mut queries.register, &self.queries.register);
        overwrite(&mut queries.deregister, &self.queries.deregister);
        overwrite(&mut queries.persist, &self.queries.persist);
        queries
    }
}

fn overwrite(target: &mut String, value: &Option<String>) {
    if let Some(value) = value {
        target.clone_from(value);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
