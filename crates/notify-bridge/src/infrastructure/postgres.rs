//! PostgreSQL implementation of the backend ports.
//!
//! `tokio_postgres` splits a connection into a `Client` (issues queries) and
//! a `Connection` (owns the socket and must be polled for anything to
//! happen).  [`PgConnector::connect`] spawns a driver task per connection
//! that polls the `Connection` and forwards every `NOTIFY` it sees into an
//! unbounded channel.  [`PgConnection::next_notification`] reads from that
//! channel, which makes it cancel-safe: a notification that arrives while
//! nobody is waiting stays queued.
//!
//! The backend calls are plain SQL statements held in [`BackendQueries`];
//! the defaults call the stored functions of the `messages` schema.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::poll_fn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::types::ToSql;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::debug;

use crate::application::ports::{BackendConnection, Connector};
use crate::domain::{BackendCall, BridgeError, DatabaseConfig, Notification};

/// Reported to the server as `application_name`.
const APPLICATION_NAME: &str = "notify-bridge";

/// SQL text for each backend call.
///
/// `register`, `deregister` take the session id as `$1`; `persist` takes the
/// session id as `$1` and the client payload as `$2`.  Parameters are bound
/// as Rust strings, which the driver only accepts for text-like parameter
/// types (`text`, `varchar`, `name`).  A statement whose function expects
/// anything else must cast explicitly, as the default `persist` does for
/// the `json` payload.  The snapshot query must return one row whose first
/// column is text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendQueries {
    pub snapshot: String,
    pub register: String,
    pub deregister: String,
    pub persist: String,
}

impl Default for BackendQueries {
    fn default() -> Self {
        Self {
            snapshot: concat!(
                "SELECT format_json('message_change', ",
                "array_to_json(recent_messages()) :: text)"
            )
            .to_string(),
            register: "SELECT add_user($1)".to_string(),
            deregister: "SELECT remove_user($1)".to_string(),
            persist: "SELECT receive_data($1, $2::text::json)".to_string(),
        }
    }
}

/// Opens PostgreSQL connections for the lease pool.
#[derive(Clone)]
pub struct PgConnector {
    config: tokio_postgres::Config,
    queries: Arc<BackendQueries>,
}

impl PgConnector {
    pub fn new(database: &DatabaseConfig) -> Self {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&database.host)
            .port(database.port)
            .user(&database.user)
            .dbname(&database.dbname)
            .application_name(APPLICATION_NAME)
            .connect_timeout(Duration::from_secs(5));
        if !database.password.is_empty() {
            config.password(&database.password);
        }
        Self {
            config,
            queries: Arc::new(BackendQueries::default()),
        }
    }

    /// Replaces the SQL issued for the backend calls.
    pub fn with_queries(mut self, queries: BackendQueries) -> Self {
        self.queries = Arc::new(queries);
        self
    }

    pub fn queries(&self) -> &BackendQueries {
        &self.queries
    }

    pub fn pg_config(&self) -> &tokio_postgres::Config {
        &self.config
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgConnection;

    async fn connect(&self) -> Result<PgConnection, BridgeError> {
        let (client, mut connection) = self
            .config
            .connect(NoTls)
            .await
            .map_err(|e| BridgeError::BackendUnreachable(e.to_string()))?;

        let (tx, notifications) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            loop {
                match poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        // The receiver only goes away with the connection itself.
                        let _ = tx.send(Ok(Notification::new(n.channel(), n.payload())));
                    }
                    Some(Ok(AsyncMessage::Notice(notice))) => {
                        debug!("backend notice: {}", notice.message());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("backend connection failed: {e}");
                        let _ = tx.send(Err(e.to_string()));
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(PgConnection {
            client,
            notifications,
            driver,
            queries: Arc::clone(&self.queries),
        })
    }
}

/// One open PostgreSQL connection and its driver task.
pub struct PgConnection {
    client: Client,
    notifications: mpsc::UnboundedReceiver<Result<Notification, String>>,
    driver: JoinHandle<()>,
    queries: Arc<BackendQueries>,
}

impl PgConnection {
    async fn call(
        &self,
        call: BackendCall,
        sql: &str,
        params: &[&str],
    ) -> Result<(), BridgeError> {
        let params: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(sql, &params)
            .await
            .map(|_| ())
            .map_err(|e| BridgeError::call_failed(call, e))
    }
}

#[async_trait]
impl BackendConnection for PgConnection {
    async fn listen(&mut self, channel: &str) -> Result<(), BridgeError> {
        self.client
            .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
            .await
            .map_err(|e| BridgeError::SubscribeFailed {
                channel: channel.to_string(),
                reason: e.to_string(),
            })
    }

    async fn next_notification(&mut self) -> Result<Notification, BridgeError> {
        match self.notifications.recv().await {
            Some(Ok(notification)) => Ok(notification),
            Some(Err(reason)) => Err(BridgeError::NotificationWaitFailed(reason)),
            None => Err(BridgeError::NotificationWaitFailed(
                "backend connection closed".to_string(),
            )),
        }
    }

    async fn fetch_snapshot(&mut self) -> Result<String, BridgeError> {
        let row = self
            .client
            .query_one(self.queries.snapshot.as_str(), &[])
            .await
            .map_err(|e| BridgeError::call_failed(BackendCall::FetchSnapshot, e))?;
        row.try_get::<_, Option<String>>(0)
            .map_err(|e| BridgeError::call_failed(BackendCall::FetchSnapshot, e))?
            .ok_or_else(|| {
                BridgeError::call_failed(BackendCall::FetchSnapshot, "snapshot query returned NULL")
            })
    }

    async fn register_session(&mut self, session_id: &str) -> Result<(), BridgeError> {
        self.call(BackendCall::RegisterSession, &self.queries.register, &[session_id]).await
    }

    async fn deregister_session(&mut self, session_id: &str) -> Result<(), BridgeError> {
        self.call(BackendCall::DeregisterSession, &self.queries.deregister, &[session_id]).await
    }

    async fn persist(&mut self, session_id: &str, payload: &str) -> Result<(), BridgeError> {
        self.call(BackendCall::Persist, &self.queries.persist, &[session_id, payload]).await
    }

    async fn execute_script(&mut self, script: &str) -> Result<(), BridgeError> {
        self.client
            .batch_execute(script)
            .await
            .map_err(|e| BridgeError::call_failed(BackendCall::ExecuteScript, e))
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed() || self.driver.is_finished()
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Quotes `name` as an SQL identifier (`LISTEN` does not take parameters).
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_postgres::config::Host;

    #[test]
    fn test_quote_ident_plain_name() {
        assert_eq!(quote_ident("callback"), "\"callback\"");
    }

    #[test]
    fn test_quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_connector_uses_database_config() {
        // Arrange
        let database = DatabaseConfig {
            host: "db.internal".to_string(),
            port: 6543,
            user: "bridge".to_string(),
            password: "hunter2".to_string(),
            dbname: "messages".to_string(),
        };

        // Act
        let connector = PgConnector::new(&database);
        let cfg = connector.pg_config();

        // Assert
        assert_eq!(cfg.get_hosts(), &[Host::Tcp("db.internal".to_string())]);
        assert_eq!(cfg.get_ports(), &[6543]);
        assert_eq!(cfg.get_user(), Some("bridge"));
        assert_eq!(cfg.get_dbname(), Some("messages"));
        assert_eq!(cfg.get_password(), Some(&b"hunter2"[..]));
        assert_eq!(cfg.get_application_name(), Some(APPLICATION_NAME));
    }

    #[test]
    fn test_empty_password_is_not_sent() {
        let connector = PgConnector::new(&DatabaseConfig::default());
        assert_eq!(connector.pg_config().get_password(), None);
    }

    #[test]
    fn test_default_queries_call_stored_functions() {
        let queries = BackendQueries::default();
        assert!(queries.snapshot.contains("recent_messages()"));
        assert_eq!(queries.register, "SELECT add_user($1)");
        assert_eq!(queries.deregister, "SELECT remove_user($1)");
    }

    #[test]
    fn test_default_persist_binds_payload_as_text() {
        // The payload is bound from a &str, so a json parameter needs a cast.
        let queries = BackendQueries::default();
        assert_eq!(queries.persist, "SELECT receive_data($1, $2::text::json)");
    }

    #[test]
    fn test_with_queries_replaces_defaults() {
        let custom = BackendQueries {
            register: "SELECT join_room($1)".to_string(),
            ..BackendQueries::default()
        };
        let connector = PgConnector::new(&DatabaseConfig::default()).with_queries(custom.clone());
        assert_eq!(connector.queries(), &custom);
    }

    #[tokio::test]
    async fn test_unreachable_server_maps_to_backend_unreachable() {
        // Nothing listens on port 1.
        let database = DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..DatabaseConfig::default()
        };
        let connector = PgConnector::new(&database);

        let result = connector.connect().await;

        assert!(matches!(result, Err(BridgeError::BackendUnreachable(_))));
    }
}
