//! Bridge configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! It is built once at startup (defaults, then an optional TOML file, then
//! CLI arguments and environment variables) and handed to the pool, the
//! orchestrator and the server.  Nothing in the bridge reads configuration
//! from anywhere else.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// All runtime configuration for the bridge.
///
/// # Example
///
/// ```rust
/// use notify_bridge::domain::BridgeConfig;
///
/// let cfg = BridgeConfig::default();
/// assert_eq!(cfg.ws_bind_addr.port(), 8000);
/// assert_eq!(cfg.pool.max_leases, 32);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// The address and port the WebSocket server binds to.
    pub ws_bind_addr: SocketAddr,

    /// Where the backend database lives and how to log in.
    pub database: DatabaseConfig,

    /// Limits for the backend connection pool.
    pub pool: PoolConfig,

    /// How long the handshake waits for the listener to confirm its
    /// subscription before giving up on the session.
    pub readiness_timeout: Duration,
}

impl Default for BridgeConfig {
    /// | Field             | Default          |
    /// |-------------------|------------------|
    /// | ws_bind_addr      | `0.0.0.0:8000`   |
    /// | readiness_timeout | 5 seconds        |
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            database: DatabaseConfig::default(),
            pool: PoolConfig::default(),
            readiness_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection parameters for the backend database.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            dbname: "messages".to_string(),
        }
    }
}

// Written by hand so the password never reaches a log line.
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("dbname", &self.dbname)
            .finish()
    }
}

/// Limits enforced by [`LeasePool`](crate::application::pool::LeasePool).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of leases checked out at the same time.
    ///
    /// Every session holds two leases, so this allows `max_leases / 2`
    /// concurrent sessions.
    pub max_leases: usize,

    /// A connection older than this is closed instead of being reused.
    pub max_lifetime: Duration,

    /// An idle connection unused for this long is closed by the reaper.
    pub max_idle: Duration,

    /// How long `acquire` waits for a free slot before failing with
    /// `PoolExhausted`.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    /// | Field           | Default    |
    /// |-----------------|------------|
    /// | max_leases      | 32         |
    /// | max_lifetime    | 5 seconds  |
    /// | max_idle        | 3 seconds  |
    /// | acquire_timeout | 5 seconds  |
    fn default() -> Self {
        Self {
            max_leases: 32,
            max_lifetime: Duration::from_secs(5),
            max_idle: Duration::from_secs(3),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
