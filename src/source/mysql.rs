//! [`SqlConnector`] over the MySQL wire protocol, via `sqlx`.
//!
//! Each [`MySqlSession`] owns exactly one server connection, so session
//! variables set through [`SqlSession::execute`] apply to every later
//! statement of that session. Statements go out as plain text queries
//! (no server-side prepare), which TiDB accepts for `SHOW CONFIG` and the
//! metrics schema alike.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::{Connection, Executor as _, Row as _};
use tracing::{debug, warn};

use super::{DatabaseTarget, Row, SqlConnector, SqlSession};
use crate::error::{Result, TuneError};

#[derive(Debug, Clone)]
pub struct MySqlConnector {
    target: Arc<DatabaseTarget>,
    connect_timeout: Option<Duration>,
    statement_timeout: Option<Duration>,
}

impl MySqlConnector {
    pub fn new(target: DatabaseTarget) -> Self {
        Self {
            target: Arc::new(target),
            connect_timeout: None,
            statement_timeout: None,
        }
    }

    /// Bound the handshake; an elapsed limit counts as unreachable.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bound every statement run on sessions from this connector.
    pub fn statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    fn options(&self) -> MySqlConnectOptions {
        let t = &self.target;
        let opts = MySqlConnectOptions::new()
            .host(&t.host)
            .port(t.port)
            .username(&t.user)
            .password(&t.password);
        match &t.database {
            Some(db) => opts.database(db),
            None => opts,
        }
    }

    fn unavailable(&self, detail: impl ToString) -> TuneError {
        TuneError::SourceUnavailable {
            target: self.target.address(),
            detail: detail.to_string(),
        }
    }
}

#[async_trait]
impl SqlConnector for MySqlConnector {
    type Session = MySqlSession;

    async fn connect(&self) -> Result<MySqlSession> {
        let opts = self.options();
        debug!(host = %self.target.address(), user = %self.target.user, "connecting");
        let connecting = MySqlConnection::connect_with(&opts);
        let conn = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| self.unavailable(format!("connect timed out after {limit:?}")))?,
            None => connecting.await,
        }
        .map_err(|e| self.unavailable(e))?;

        Ok(MySqlSession {
            conn,
            address: self.target.address(),
            timeout: self.statement_timeout,
        })
    }
}

/// One open connection.
pub struct MySqlSession {
    conn: MySqlConnection,
    address: String,
    timeout: Option<Duration>,
}

#[async_trait]
impl SqlSession for MySqlSession {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        debug!(statement = sql, host = %self.address, "running SQL");
        let work = (&mut self.conn).execute(sqlx::raw_sql(sql));
        let done = bounded(self.timeout, &self.address, sql, work).await?;
        debug!(statement = sql, rows_affected = done.rows_affected(), "statement done");
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<Vec<Row>> {
        debug!(statement = sql, host = %self.address, "running SQL");
        let work = (&mut self.conn).fetch_all(sqlx::raw_sql(sql));
        let rows = bounded(self.timeout, &self.address, sql, work).await?;
        rows.iter()
            .map(text_row)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| TuneError::QueryFailed {
                statement: sql.to_string(),
                detail: e.to_string(),
            })
    }

    async fn close(self) {
        if let Err(e) = self.conn.close().await {
            warn!(host = %self.address, error = %e, "closing connection failed");
        }
    }
}

async fn bounded<T, F>(
    timeout: Option<Duration>,
    address: &str,
    sql: &str,
    work: F,
) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let outcome = match timeout {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| TuneError::QueryFailed {
                statement: sql.to_string(),
                detail: format!("timed out after {limit:?}"),
            })?,
        None => work.await,
    };
    outcome.map_err(|e| classify(sql, address, e))
}

/// Every column as text. Text-protocol results carry all values as text,
/// so numeric columns decode without a type check.
fn text_row(row: &MySqlRow) -> std::result::Result<Row, sqlx::Error> {
    (0..row.len())
        .map(|i| row.try_get_unchecked::<Option<String>, _>(i))
        .collect()
}

/// Transport failures mean the server went away; everything else is the
/// statement's fault.
fn classify(statement: &str, address: &str, err: sqlx::Error) -> TuneError {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => TuneError::SourceUnavailable {
            target: address.to_string(),
            detail: err.to_string(),
        },
        other => TuneError::QueryFailed {
            statement: statement.to_string(),
            detail: other.to_string(),
        },
    }
}
