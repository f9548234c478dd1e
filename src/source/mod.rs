//! # Module: source
//!
//! Capability traits for reading and writing the tuned database with plain
//! SQL text, and the connection target they are opened against.
//!
//! A [`SqlConnector`] hands out one [`SqlSession`] per call. Callers open a
//! session, run their statements and call [`SqlSession::close`] on every exit
//! path. Session-scoped settings issued through [`SqlSession::execute`] stay
//! in effect for the rest of that session and are never restored.
//!
//! ## Implementations
//! - [`mysql::MySqlConnector`]: one MySQL-protocol connection per session.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TuneError};

pub mod mysql;

pub use mysql::{MySqlConnector, MySqlSession};

/// One result row; `None` is SQL `NULL`.
pub type Row = Vec<Option<String>>;

/// Opens sessions against one database.
#[async_trait]
pub trait SqlConnector: Send + Sync {
    type Session: SqlSession;

    /// Open a session.
    ///
    /// # Errors
    /// [`TuneError::SourceUnavailable`] when the database cannot be reached.
    async fn connect(&self) -> Result<Self::Session>;
}

/// An open session. Parameterless SQL only.
#[async_trait]
pub trait SqlSession: Send {
    /// Run a statement that returns no rows.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Run a query and return all of its rows.
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>>;

    /// Release the session.
    async fn close(self);
}

// ---------------------------------------------------------------------------
// DatabaseTarget
// ---------------------------------------------------------------------------

/// Where and as whom to connect.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTarget {
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: Option<String>,
}

/// TiDB's default SQL port.
pub const DEFAULT_PORT: u16 = 4000;

impl DatabaseTarget {
    /// Parse a Go-driver style DSN: `user:password@tcp(host:port)/dbname?params`.
    ///
    /// The address part may also be a bare `host:port` or be omitted
    /// (`127.0.0.1:4000`). Query parameters are ignored.
    pub fn from_dsn(dsn: &str) -> Result<Self> {
        let invalid = |reason: &str| TuneError::Config(format!("invalid DSN: {reason}"));

        let slash = dsn.rfind('/').ok_or_else(|| invalid("missing '/dbname'"))?;
        let (left, db_part) = (&dsn[..slash], &dsn[slash + 1..]);
        let db = db_part.split('?').next().unwrap_or("");

        let (creds, addr) = match left.rfind('@') {
            Some(at) => (&left[..at], &left[at + 1..]),
            None => ("", left),
        };
        let (user, password) = match creds.split_once(':') {
            Some((u, p)) => (u, p),
            None => (creds, ""),
        };

        let addr = if addr.is_empty() {
            ""
        } else if let Some(inner) = addr.strip_prefix("tcp(") {
            inner.strip_suffix(')').ok_or_else(|| invalid("unterminated tcp(...)"))?
        } else if addr.contains('(') {
            return Err(invalid("only the tcp protocol is supported"));
        } else {
            addr
        };

        let (host, port) = if addr.is_empty() {
            ("127.0.0.1", DEFAULT_PORT)
        } else {
            match addr.rsplit_once(':') {
                Some((h, p)) => (
                    h,
                    p.parse::<u16>().map_err(|_| invalid("port is not a number"))?,
                ),
                None => (addr, DEFAULT_PORT),
            }
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        Ok(DatabaseTarget {
            user: user.to_string(),
            password: password.to_string(),
            host: host.to_string(),
            port,
            database: (!db.is_empty()).then(|| db.to_string()),
        })
    }

    /// `host:port`, used to label errors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseTarget")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .finish()
    }
}
