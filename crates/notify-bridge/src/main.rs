//! notify-bridge entry point.
//!
//! Serves two WebSocket endpoints backed by one PostgreSQL database:
//!
//! - `/connect`: every `NOTIFY callback` payload is pushed to the client.
//! - `/messages`: as above, plus a snapshot of recent messages as the first
//!   frame, session registration (`add_user`/`remove_user`) and relay of the
//!   client's own frames to `receive_data`.
//!
//! # Usage
//!
//! ```text
//! notify-bridge [OPTIONS]
//!
//! Options:
//!   --config <FILE>          TOML configuration file
//!   --init-sql <FILE>        SQL script run once before serving
//!   --bind <ADDR>            WebSocket listen address [default: 0.0.0.0:8000]
//!   --db-host <HOST>         [default: localhost]
//!   --db-port <PORT>         [default: 5432]
//!   --db-user <USER>         [default: postgres]
//!   --db-password <PASS>
//!   --db-name <NAME>         [default: messages]
//!   --max-leases <N>         Pool size [default: 32]
//!   --readiness-timeout-ms <MS>  [default: 5000]
//! ```
//!
//! Settings are layered: built-in defaults, then the `--config` file, then
//! environment variables and command-line arguments.
//!
//! | Variable                         | Flag                     |
//! |----------------------------------|--------------------------|
//! | `NOTIFY_BRIDGE_CONFIG`           | `--config`               |
//! | `NOTIFY_BRIDGE_INIT_SQL`         | `--init-sql`             |
//! | `NOTIFY_BRIDGE_BIND`             | `--bind`                 |
//! | `NOTIFY_BRIDGE_DB_HOST`          | `--db-host`              |
//! | `NOTIFY_BRIDGE_DB_PORT`          | `--db-port`              |
//! | `NOTIFY_BRIDGE_DB_USER`          | `--db-user`              |
//! | `NOTIFY_BRIDGE_DB_PASSWORD`      | `--db-password`          |
//! | `NOTIFY_BRIDGE_DB_NAME`          | `--db-name`              |
//! | `NOTIFY_BRIDGE_MAX_LEASES`       | `--max-leases`           |
//! | `NOTIFY_BRIDGE_READINESS_TIMEOUT_MS` | `--readiness-timeout-ms` |

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use notify_bridge::application::ports::{BackendConnection, Connector};
use notify_bridge::application::{Bridge, LeasePool};
use notify_bridge::domain::BridgeConfig;
use notify_bridge::infrastructure::config_file;
use notify_bridge::infrastructure::{BackendQueries, BridgeRouter, BridgeServer, PgConnector};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Bridges PostgreSQL LISTEN/NOTIFY to WebSocket clients.
///
/// Every option is optional; an absent option leaves the value from the
/// config file (or the built-in default) in place.
#[derive(Debug, Default, Parser)]
#[command(
    name = "notify-bridge",
    about = "Bridges PostgreSQL LISTEN/NOTIFY channels to live WebSocket sessions",
    version
)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "NOTIFY_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// SQL script executed once at startup, before any client is accepted.
    ///
    /// A failure here is fatal.
    #[arg(long, env = "NOTIFY_BRIDGE_INIT_SQL")]
    init_sql: Option<PathBuf>,

    /// Address the WebSocket server listens on.
    #[arg(long, env = "NOTIFY_BRIDGE_BIND")]
    bind: Option<String>,

    #[arg(long, env = "NOTIFY_BRIDGE_DB_HOST")]
    db_host: Option<String>,

    #[arg(long, env = "NOTIFY_BRIDGE_DB_PORT")]
    db_port: Option<u16>,

    #[arg(long, env = "NOTIFY_BRIDGE_DB_USER")]
    db_user: Option<String>,

    #[arg(long, env = "NOTIFY_BRIDGE_DB_PASSWORD", hide_env_values = true)]
    db_password: Option<String>,

    #[arg(long, env = "NOTIFY_BRIDGE_DB_NAME")]
    db_name: Option<String>,

    /// Maximum number of backend connections.  Each session holds two.
    #[arg(
        long,
        env = "NOTIFY_BRIDGE_MAX_LEASES",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    max_leases: Option<u64>,

    /// How long a new session waits for its listener to subscribe.
    #[arg(long, env = "NOTIFY_BRIDGE_READINESS_TIMEOUT_MS")]
    readiness_timeout_ms: Option<u64>,
}

impl Cli {
    /// Builds the runtime configuration: defaults, then the config file,
    /// then these arguments.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be read or parsed, or if
    /// `--bind` is not a socket address.
    fn into_bridge_config(self) -> anyhow::Result<(BridgeConfig, BackendQueries)> {
        let mut config = BridgeConfig::default();
        let mut queries = BackendQueries::default();

        if let Some(path) = &self.config {
            let file = config_file::load(path)
                .with_context(|| format!("failed to load config file {}", path.display()))?;
            file.apply_to(&mut config)
                .with_context(|| format!("invalid config file {}", path.display()))?;
            queries = file.queries();
        }

        if let Some(bind) = &self.bind {
            config.ws_bind_addr = bind
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid WebSocket bind address: '{bind}'"))?;
        }
        let db = &mut config.database;
        if let Some(host) = self.db_host {
            db.host = host;
        }
        if let Some(port) = self.db_port {
            db.port = port;
        }
        if let Some(user) = self.db_user {
            db.user = user;
        }
        if let Some(password) = self.db_password {
            db.password = password;
        }
        if let Some(name) = self.db_name {
            db.dbname = name;
        }
        if let Some(max_leases) = self.max_leases {
            config.pool.max_leases =
                usize::try_from(max_leases).context("--max-leases does not fit this platform")?;
        }
        if let Some(ms) = self.readiness_timeout_ms {
            config.readiness_timeout = Duration::from_millis(ms);
        }

        Ok((config, queries))
    }
}

// ── Startup helpers ───────────────────────────────────────────────────────────

/// Opens one pooled connection and hands it back, so an unreachable database
/// stops the process before the server is bound.
async fn check_connectivity<C: Connector>(
    pool: &LeasePool<C>,
    scope: &CancellationToken,
) -> anyhow::Result<()> {
    let lease = pool
        .acquire(scope)
        .await
        .context("unable to connect to database")?;
    lease.release();
    Ok(())
}

/// Runs the bootstrap script on one pooled connection.
async fn run_init_script<C: Connector>(
    pool: &LeasePool<C>,
    path: &Path,
    scope: &CancellationToken,
) -> anyhow::Result<()> {
    let script = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read init script {}", path.display()))?;
    let mut lease = pool
        .acquire(scope)
        .await
        .context("failed to acquire a connection for the init script")?;
    let executed = lease.execute_script(&script).await;
    lease.release();
    executed.with_context(|| format!("init script {} failed", path.display()))?;
    info!("init script {} executed", path.display());
    Ok(())
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// 1. Tracing is initialised (`RUST_LOG`, default `info`).
/// 2. The configuration is assembled from defaults, file and CLI.
/// 3. The connection pool is created and one connection is opened; the
///    optional init script runs.
/// 4. The idle-connection reaper is started.
/// 5. Ctrl+C cancels the background scope, which stops the server and every
///    open session.
/// 6. The server runs until then.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging setup ─────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let init_sql = cli.init_sql.clone();
    let (config, queries) = cli.into_bridge_config()?;

    info!(
        "notify-bridge starting: ws={}, db={}:{}/{}, max_leases={}",
        config.ws_bind_addr,
        config.database.host,
        config.database.port,
        config.database.dbname,
        config.pool.max_leases
    );

    let connector = PgConnector::new(&config.database).with_queries(queries);
    let pool = LeasePool::new(connector, config.pool);
    let background = CancellationToken::new();

    check_connectivity(&pool, &background).await?;
    info!("connected to database {}", config.database.dbname);

    if let Some(path) = &init_sql {
        run_init_script(&pool, path, &background).await?;
    }

    let reaper = pool.spawn_reaper(background.clone());

    // ── Graceful shutdown ─────────────────────────────────────────────────────
    let on_signal = background.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; initiating graceful shutdown");
                on_signal.cancel();
            }
            Err(e) => error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    // ── Main server loop ──────────────────────────────────────────────────────
    let bridge =
        Bridge::new(pool, background.clone()).with_readiness_timeout(config.readiness_timeout);
    let server =
        BridgeServer::bind(config.ws_bind_addr, BridgeRouter::standard(), bridge).await?;
    let served = server.serve(background.clone()).await;

    background.cancel();
    if let Err(e) = reaper.await {
        error!("pool reaper panicked: {e}");
    }
    served?;

    info!("notify-bridge stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use notify_bridge::domain::PoolConfig;
    use notify_bridge::infrastructure::mock::{BackendEvent, MockBackend};

    fn temp_file(ext: &str, content: &str) -> PathBuf {
        let name = format!("notify-bridge-main-{}.{ext}", uuid::Uuid::new_v4());
        let path = std::env::temp_dir().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_cli_defaults_produce_default_config() {
        // Arrange: parse with no arguments (all defaults apply)
        let cli = Cli::parse_from(["notify-bridge"]);

        // Act
        let (config, queries) = cli.into_bridge_config().unwrap();

        // Assert
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(queries, BackendQueries::default());
    }

    #[test]
    fn test_cli_bind_override() {
        let cli = Cli::parse_from(["notify-bridge", "--bind", "127.0.0.1:9999"]);
        let (config, _) = cli.into_bridge_config().unwrap();
        assert_eq!(config.ws_bind_addr.to_string(), "127.0.0.1:9999");
    }

    #[test]
    fn test_cli_database_overrides() {
        let cli = Cli::parse_from([
            "notify-bridge",
            "--db-host",
            "10.0.0.5",
            "--db-port",
            "6543",
            "--db-user",
            "bridge",
            "--db-name",
            "chat",
        ]);
        let (config, _) = cli.into_bridge_config().unwrap();
        assert_eq!(config.database.host, "10.0.0.5");
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.database.user, "bridge");
        assert_eq!(config.database.dbname, "chat");
    }

    #[test]
    fn test_cli_pool_and_timeout_overrides() {
        let cli = Cli::parse_from([
            "notify-bridge",
            "--max-leases",
            "4",
            "--readiness-timeout-ms",
            "750",
        ]);
        let (config, _) = cli.into_bridge_config().unwrap();
        assert_eq!(config.pool.max_leases, 4);
        assert_eq!(config.readiness_timeout, Duration::from_millis(750));
    }

    #[test]
    fn test_cli_rejects_zero_leases() {
        let result = Cli::try_parse_from(["notify-bridge", "--max-leases", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_bind_returns_error() {
        // Arrange: provide an invalid address string
        let cli = Cli {
            bind: Some("not.an.address".to_string()),
            ..Cli::default()
        };

        // Act
        let result = cli.into_bridge_config();

        // Assert: must return an error, not panic
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_overrides_config_file() {
        // Arrange
        let path = temp_file(
            "toml",
            concat!(
                "[server]\nbind = \"127.0.0.1:7000\"\n",
                "[database]\nhost = \"from-file\"\n",
                "[queries]\nregister = \"SELECT hello($1)\"\n",
            ),
        );
        let cli = Cli {
            config: Some(path.clone()),
            db_host: Some("from-cli".to_string()),
            ..Cli::default()
        };

        // Act
        let result = cli.into_bridge_config();
        std::fs::remove_file(&path).unwrap();
        let (config, queries) = result.unwrap();

        // Assert
        assert_eq!(config.ws_bind_addr.port(), 7000);
        assert_eq!(config.database.host, "from-cli");
        assert_eq!(queries.register, "SELECT hello($1)");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = Cli {
            config: Some(PathBuf::from("/nonexistent/notify-bridge.toml")),
            ..Cli::default()
        };
        assert!(cli.into_bridge_config().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_database_fails_startup() {
        // Arrange
        let backend = MockBackend::new();
        backend.fail_connect(true);
        let pool = LeasePool::new(
            backend.clone(),
            PoolConfig {
                acquire_timeout: Duration::from_millis(100),
                ..PoolConfig::default()
            },
        );

        // Act
        let result = check_connectivity(&pool, &CancellationToken::new()).await;

        // Assert
        let err = result.expect_err("startup must fail");
        assert!(err.to_string().contains("unable to connect to database"));
        assert_eq!(pool.stats().outstanding, 0);
        assert_eq!(backend.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_reachable_database_keeps_connection_for_reuse() {
        let backend = MockBackend::new();
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());

        check_connectivity(&pool, &CancellationToken::new()).await.unwrap();

        let stats = pool.stats();
        assert_eq!((stats.outstanding, stats.idle), (0, 1));
        assert_eq!(backend.connections_opened(), 1);
    }

    #[tokio::test]
    async fn test_init_script_runs_on_one_lease() {
        let backend = MockBackend::new();
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());
        let path = temp_file("sql", "CREATE TABLE IF NOT EXISTS messages (id serial);");

        let result = run_init_script(&pool, &path, &CancellationToken::new()).await;
        std::fs::remove_file(&path).unwrap();

        assert!(result.is_ok());
        assert!(backend.events().contains(&BackendEvent::ScriptExecuted));
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_init_script_failure_is_fatal() {
        let backend = MockBackend::new();
        backend.fail_call(notify_bridge::domain::BackendCall::ExecuteScript, true);
        let pool = LeasePool::new(backend.clone(), PoolConfig::default());
        let path = temp_file("sql", "SELECT broken(;");

        let result = run_init_script(&pool, &path, &CancellationToken::new()).await;
        std::fs::remove_file(&path).unwrap();

        assert!(result.is_err());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn test_init_script_missing_file_is_fatal() {
        let pool = LeasePool::new(MockBackend::new(), PoolConfig::default());
        let result = run_init_script(
            &pool,
            Path::new("/nonexistent/initialize.sql"),
            &CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
