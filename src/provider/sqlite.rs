//! Embedded SQLite provider.
//!
//! Built on `rusqlite`. The embedded engine cannot take part in an ambient
//! transaction, so scopes over this provider refuse to be created while one
//! is active.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::OpenFlags;
use tracing::debug;
use ulid::Ulid;

use crate::provider::{
    AmbientSupport, BeginRequest, Capabilities, ConnectionString, StoreConnection, StoreProvider,
};
use crate::transaction::{IsolationLevel, ScopeError, ScopeResult};

const PROVIDER_NAME: &str = "sqlite";

/// A shared SQLite connection.
///
/// Cloning yields another handle to the same physical connection. Access is
/// serialized through [`SqliteConnection::with`].
#[derive(Clone)]
pub struct SqliteConnection {
    inner: Arc<SqliteConnectionInner>,
}

struct SqliteConnectionInner {
    id: Ulid,
    source: String,
    conn: Mutex<Option<rusqlite::Connection>>,
}

impl SqliteConnection {
    /// Open a connection from a connection string.
    ///
    /// Accepts a file path, `:memory:`, a `file:` URI, or `key=value` pairs
    /// with the keys `Data Source` (`Filename`), `Mode`
    /// (`ReadOnly`/`ReadWrite`/`ReadWriteCreate`/`Memory`), `Cache`
    /// (`Shared`/`Private`/`Default`), `Default Timeout` (seconds) and
    /// `Foreign Keys` (`True`/`False`).
    pub fn open(connection_string: &str) -> ScopeResult<Self> {
        let settings = SqliteSettings::parse(connection_string)?;
        let conn = rusqlite::Connection::open_with_flags(&settings.path, settings.flags)?;
        if let Some(timeout) = settings.timeout {
            conn.busy_timeout(timeout)?;
        }
        if let Some(enabled) = settings.foreign_keys {
            conn.pragma_update(None, "foreign_keys", enabled)?;
        }

        let handle = Self::wrap(conn, settings.path);
        debug!(
            target: "txscope::sqlite",
            connection_id = %handle.id(),
            source = %handle.source(),
            "Connection opened"
        );
        Ok(handle)
    }

    /// Wrap a connection the caller opened.
    pub fn from_connection(conn: rusqlite::Connection) -> Self {
        let source = conn
            .path()
            .filter(|p| !p.is_empty())
            .unwrap_or(":memory:")
            .to_string();
        Self::wrap(conn, source)
    }

    fn wrap(conn: rusqlite::Connection, source: String) -> Self {
        Self {
            inner: Arc::new(SqliteConnectionInner {
                id: Ulid::new(),
                source,
                conn: Mutex::new(Some(conn)),
            }),
        }
    }

    /// Database path or name the connection was opened with.
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// Run `f` against the underlying connection.
    ///
    /// Holds the connection lock for the duration of `f`; calling `with` on
    /// the same connection from inside `f` deadlocks.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&rusqlite::Connection) -> rusqlite::Result<R>,
    ) -> ScopeResult<R> {
        let guard = self.inner.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| ScopeError::ConnectionClosed(self.inner.id.to_string()))?;
        Ok(f(conn)?)
    }

    /// Check if the connection is outside any transaction.
    pub fn is_autocommit(&self) -> ScopeResult<bool> {
        self.with(|c| Ok(c.is_autocommit()))
    }
}

impl StoreConnection for SqliteConnection {
    fn id(&self) -> Ulid {
        self.inner.id
    }

    fn is_open(&self) -> bool {
        self.inner.conn.lock().is_some()
    }

    fn close(&self) -> ScopeResult<()> {
        let mut guard = self.inner.conn.lock();
        let Some(conn) = guard.take() else {
            return Ok(());
        };
        if let Err((conn, e)) = conn.close() {
            *guard = Some(conn);
            return Err(e.into());
        }
        debug!(target: "txscope::sqlite", connection_id = %self.inner.id, "Connection closed");
        Ok(())
    }

    fn begin_raw(&self, request: &BeginRequest) -> ScopeResult<()> {
        if request.label.is_some() {
            return Err(ScopeError::InvalidOptions(
                "sqlite does not support named transactions".to_string(),
            ));
        }
        let begin = match request.isolation {
            IsolationLevel::Unspecified
            | IsolationLevel::ReadUncommitted
            | IsolationLevel::ReadCommitted
            | IsolationLevel::RepeatableRead => "BEGIN DEFERRED",
            IsolationLevel::Serializable => "BEGIN IMMEDIATE",
            level @ (IsolationLevel::Snapshot | IsolationLevel::Chaos) => {
                return Err(ScopeError::UnsupportedIsolationLevel {
                    provider: PROVIDER_NAME,
                    level,
                })
            }
        };
        let read_uncommitted = request.isolation.allows_dirty_reads();

        self.with(|c| {
            c.pragma_update(None, "read_uncommitted", read_uncommitted)?;
            c.execute_batch(begin)
        })
    }

    fn commit_raw(&self) -> ScopeResult<()> {
        self.with(|c| c.execute_batch("COMMIT"))
    }

    fn rollback_raw(&self) -> ScopeResult<()> {
        self.with(|c| {
            // SQLite rolls back by itself on some errors.
            if c.is_autocommit() {
                return Ok(());
            }
            c.execute_batch("ROLLBACK")
        })
    }
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Connection settings decoded from a connection string.
#[derive(Debug, Clone, PartialEq)]
struct SqliteSettings {
    path: String,
    flags: OpenFlags,
    timeout: Option<Duration>,
    foreign_keys: Option<bool>,
}

impl SqliteSettings {
    fn parse(input: &str) -> ScopeResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ScopeError::InvalidConnectionString(
                "empty data source".to_string(),
            ));
        }

        let base = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        if !ConnectionString::looks_like_pairs(input) {
            return Ok(Self {
                path: input.to_string(),
                flags: base,
                timeout: None,
                foreign_keys: None,
            });
        }

        let cs = ConnectionString::parse(input)?;
        let mut settings = Self {
            path: String::new(),
            flags: base,
            timeout: None,
            foreign_keys: None,
        };
        let mut mode = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let mut cache = OpenFlags::empty();

        for (key, value) in cs.iter() {
            match key {
                "data source" | "datasource" | "filename" => settings.path = value.to_string(),
                "mode" => {
                    mode = match value.to_lowercase().as_str() {
                        "readonly" => OpenFlags::SQLITE_OPEN_READ_ONLY,
                        "readwrite" => OpenFlags::SQLITE_OPEN_READ_WRITE,
                        "readwritecreate" => {
                            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
                        }
                        "memory" => {
                            OpenFlags::SQLITE_OPEN_READ_WRITE
                                | OpenFlags::SQLITE_OPEN_CREATE
                                | OpenFlags::SQLITE_OPEN_MEMORY
                        }
                        other => {
                            return Err(ScopeError::InvalidConnectionString(format!(
                                "unknown mode '{}'",
                                other
                            )))
                        }
                    }
                }
                "cache" => {
                    cache = match value.to_lowercase().as_str() {
                        "shared" => OpenFlags::SQLITE_OPEN_SHARED_CACHE,
                        "private" => OpenFlags::SQLITE_OPEN_PRIVATE_CACHE,
                        "default" => OpenFlags::empty(),
                        other => {
                            return Err(ScopeError::InvalidConnectionString(format!(
                                "unknown cache mode '{}'",
                                other
                            )))
                        }
                    }
                }
                "default timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        ScopeError::InvalidConnectionString(format!(
                            "invalid timeout '{}'",
                            value
                        ))
                    })?;
                    settings.timeout = Some(Duration::from_secs(secs));
                }
                "foreign keys" => {
                    settings.foreign_keys = Some(parse_bool(value)?);
                }
                other => {
                    return Err(ScopeError::InvalidConnectionString(format!(
                        "keyword not supported: '{}'",
                        other
                    )))
                }
            }
        }

        if settings.path.is_empty() {
            return Err(ScopeError::InvalidConnectionString(
                "empty data source".to_string(),
            ));
        }
        settings.flags =
            mode | cache | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        Ok(settings)
    }
}

fn parse_bool(value: &str) -> ScopeResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ScopeError::InvalidConnectionString(format!(
            "invalid boolean '{}'",
            value
        ))),
    }
}

/// Provider for embedded SQLite databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteProvider;

impl SqliteProvider {
    /// Create a new SQLite provider.
    pub fn new() -> Self {
        Self
    }
}

impl StoreProvider for SqliteProvider {
    type Connection = SqliteConnection;

    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            ambient: AmbientSupport::Reject,
            named_transactions: false,
        }
    }

    fn open(&self, connection_string: &str) -> ScopeResult<SqliteConnection> {
        SqliteConnection::open(connection_string)
    }
}
