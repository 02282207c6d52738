//! Database connection, TLS support, advisory locking and per-change transactions.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::Client;

use crate::command::SqlExecutor;
use crate::config::{CairnConfig, SslMode};
use crate::error::{CairnError, Result};

/// Interval between `pg_try_advisory_lock` attempts, before jitter.
const LOCK_POLL_INTERVAL_MS: u64 = 500;

/// Quote a SQL identifier to prevent SQL injection.
///
/// Doubles any embedded double-quotes and wraps in double-quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validate that a SQL identifier contains only safe characters.
///
/// Returns an error for names with characters outside `[a-zA-Z0-9_]`.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CairnError::ConfigError(
            "Identifier cannot be empty".to_string(),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CairnError::ConfigError(format!(
            "Identifier '{}' contains invalid characters. Only [a-zA-Z0-9_] are allowed.",
            name
        )));
    }
    Ok(())
}

/// Build a rustls ClientConfig using the Mozilla CA bundle.
fn make_rustls_config() -> rustls::ClientConfig {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Check if a postgres error is a permanent authentication failure that should not be retried.
fn is_permanent_error(e: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = e.as_db_error() {
        let code = db_err.code().code();
        // 28P01 = invalid_password, 28000 = invalid_authorization_specification
        return code == "28P01" || code == "28000";
    }
    false
}

fn spawn_connection<S, T>(connection: tokio_postgres::Connection<S, T>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!(error = %e, "Database connection error");
        }
    });
}

async fn connect_once(
    conn_string: &str,
    ssl_mode: &SslMode,
    connect_timeout_secs: u32,
) -> std::result::Result<Client, tokio_postgres::Error> {
    let connect_fut = async {
        match ssl_mode {
            SslMode::Disable => {
                let (client, connection) =
                    tokio_postgres::connect(conn_string, tokio_postgres::NoTls).await?;
                spawn_connection(connection);
                Ok(client)
            }
            SslMode::Require => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_rustls_config());
                let (client, connection) = tokio_postgres::connect(conn_string, tls).await?;
                spawn_connection(connection);
                Ok(client)
            }
            SslMode::Prefer => {
                let tls = tokio_postgres_rustls::MakeRustlsConnect::new(make_rustls_config());
                match tokio_postgres::connect(conn_string, tls).await {
                    Ok((client, connection)) => {
                        spawn_connection(connection);
                        Ok(client)
                    }
                    Err(_) => {
                        tracing::debug!("TLS connection failed, falling back to plaintext");
                        let (client, connection) =
                            tokio_postgres::connect(conn_string, tokio_postgres::NoTls).await?;
                        spawn_connection(connection);
                        Ok(client)
                    }
                }
            }
        }
    };

    if connect_timeout_secs > 0 {
        match tokio::time::timeout(Duration::from_secs(connect_timeout_secs as u64), connect_fut)
            .await
        {
            Ok(result) => result,
            Err(_) => Err(tokio_postgres::Error::__private_api_timeout()),
        }
    } else {
        connect_fut.await
    }
}

/// Connect to the database using the provided connection string.
pub async fn connect(conn_string: &str) -> Result<Client> {
    connect_with_config(conn_string, &SslMode::Prefer, 0, 30, 0).await
}

/// Connect to the database, retrying up to `retries` times with exponential backoff + jitter.
///
/// Each retry waits `min(2^attempt, 30)s` plus up to one second of jitter.
/// Authentication failures are not retried.
pub async fn connect_with_config(
    conn_string: &str,
    ssl_mode: &SslMode,
    retries: u32,
    connect_timeout_secs: u32,
    statement_timeout_secs: u32,
) -> Result<Client> {
    let mut last_err = None;

    for attempt in 0..=retries {
        if attempt > 0 {
            let base_delay = std::cmp::min(1u64 << attempt, 30);
            let delay = Duration::from_secs(base_delay)
                + Duration::from_millis(fastrand::u64(0..1000));
            tracing::info!(
                attempt = attempt + 1,
                max_attempts = retries + 1,
                delay_ms = delay.as_millis() as u64,
                "Connection attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }

        match connect_once(conn_string, ssl_mode, connect_timeout_secs).await {
            Ok(client) => {
                if attempt > 0 {
                    tracing::info!(
                        attempt = attempt + 1,
                        max_attempts = retries + 1,
                        "Connected successfully after retry"
                    );
                }

                if statement_timeout_secs > 0 {
                    let timeout_sql =
                        format!("SET statement_timeout = '{}s'", statement_timeout_secs);
                    client.batch_execute(&timeout_sql).await?;
                }

                return Ok(client);
            }
            Err(e) => {
                if is_permanent_error(&e) {
                    tracing::error!(error = %e, "Permanent connection error, not retrying");
                    return Err(CairnError::DatabaseError(e));
                }
                last_err = Some(e);
            }
        }
    }

    match last_err {
        Some(e) => Err(CairnError::DatabaseError(e)),
        None => Err(CairnError::ConfigError(
            "No connection attempt was made".to_string(),
        )),
    }
}

/// Acquire the environment-wide advisory lock keyed on the audit table name.
///
/// Polls `pg_try_advisory_lock` until it succeeds or `timeout_secs` elapses.
/// A timeout of 0 tries exactly once.
pub async fn acquire_advisory_lock(client: &Client, table_name: &str, timeout_secs: u64) -> Result<()> {
    let lock_id = advisory_lock_id(table_name);
    let deadline = Instant::now() + Duration::from_secs(timeout_secs);
    tracing::info!(lock_id = lock_id, table = %table_name, timeout_secs, "Acquiring advisory lock");

    loop {
        let row = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&lock_id])
            .await
            .map_err(|e| CairnError::LockError(crate::error::format_db_error(&e)))?;
        if row.get::<_, bool>(0) {
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(CairnError::LockError(format!(
                "another deployment holds the lock for '{}' (waited {}s)",
                table_name, timeout_secs
            )));
        }

        let delay = Duration::from_millis(LOCK_POLL_INTERVAL_MS + fastrand::u64(0..250));
        tracing::debug!(lock_id = lock_id, delay_ms = delay.as_millis() as u64, "Advisory lock busy, waiting");
        tokio::time::sleep(delay).await;
    }
}

/// Release the advisory lock.
pub async fn release_advisory_lock(client: &Client, table_name: &str) -> Result<()> {
    let lock_id = advisory_lock_id(table_name);
    tracing::info!(lock_id = lock_id, table = %table_name, "Releasing advisory lock");

    client
        .execute("SELECT pg_advisory_unlock($1)", &[&lock_id])
        .await
        .map_err(|e| CairnError::LockError(format!("Failed to release advisory lock: {}", e)))?;

    Ok(())
}

/// Compute a stable i64 lock ID from the table name using CRC32.
///
/// DefaultHasher output is not stable across compiler versions.
fn advisory_lock_id(table_name: &str) -> i64 {
    crc32fast::hash(table_name.as_bytes()) as i64
}

/// Get the current database user.
pub async fn get_current_user(client: &Client) -> Result<String> {
    let row = client.query_one("SELECT current_user", &[]).await?;
    Ok(row.get::<_, String>(0))
}

/// Get the current database name.
pub async fn get_current_database(client: &Client) -> Result<String> {
    let row = client.query_one("SELECT current_database()", &[]).await?;
    Ok(row.get::<_, String>(0))
}

/// Run `sql` inside BEGIN/COMMIT with `search_path` pinned to `schema`.
/// Returns the execution time in milliseconds.
pub async fn execute_in_transaction(client: &Client, schema: &str, sql: &str) -> Result<i32> {
    let start = Instant::now();

    client.batch_execute("BEGIN").await?;

    let body = format!("SET LOCAL search_path TO {};\n{}", quote_ident(schema), sql);
    match client.batch_execute(&body).await {
        Ok(()) => {
            client.batch_execute("COMMIT").await?;
        }
        Err(e) => {
            if let Err(rollback_err) = client.batch_execute("ROLLBACK").await {
                tracing::warn!(error = %rollback_err, "Failed to rollback transaction");
            }
            return Err(CairnError::DatabaseError(e));
        }
    }

    Ok(start.elapsed().as_millis() as i32)
}

enum Connection<'a> {
    Borrowed(&'a Client),
    Owned(Client),
}

impl Deref for Connection<'_> {
    type Target = Client;

    fn deref(&self) -> &Client {
        match self {
            Connection::Borrowed(client) => client,
            Connection::Owned(client) => client,
        }
    }
}

/// [`SqlExecutor`] over one or more connections to the target database.
///
/// Each statement batch runs in its own transaction on one connection;
/// a connection never runs two batches at once. Batches are spread
/// round-robin, so parallel deploys get up to one connection per thread.
pub struct PgSqlExecutor<'a> {
    connections: Vec<Mutex<Connection<'a>>>,
    next: AtomicUsize,
}

impl<'a> PgSqlExecutor<'a> {
    /// Execute everything on `client`.
    pub fn single(client: &'a Client) -> Self {
        Self {
            connections: vec![Mutex::new(Connection::Borrowed(client))],
            next: AtomicUsize::new(0),
        }
    }

    /// Use `client` plus `extra` further connections opened from `config`.
    pub async fn with_pool(client: &'a Client, config: &CairnConfig, extra: usize) -> Result<Self> {
        let mut executor = Self::single(client);
        if extra == 0 {
            return Ok(executor);
        }

        let conn_string = config.connection_string()?;
        for _ in 0..extra {
            let conn = connect_with_config(
                &conn_string,
                &config.database.ssl_mode,
                config.database.connect_retries,
                config.database.connect_timeout_secs,
                config.database.statement_timeout_secs,
            )
            .await?;
            executor.connections.push(Mutex::new(Connection::Owned(conn)));
        }
        tracing::debug!(connections = executor.connections.len(), "Opened executor connections");
        Ok(executor)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[async_trait]
impl SqlExecutor for PgSqlExecutor<'_> {
    async fn execute(&self, schema: &str, sql: &str) -> Result<()> {
        // Prefer an idle connection; otherwise queue on the next one in turn.
        let guard = match self.connections.iter().find_map(|c| c.try_lock().ok()) {
            Some(guard) => guard,
            None => {
                let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.connections.len();
                self.connections[slot].lock().await
            }
        };
        let elapsed_ms = execute_in_transaction(&guard, schema, sql).await?;
        tracing::debug!(schema = %schema, elapsed_ms, "Executed statement batch");
        Ok(())
    }
}
