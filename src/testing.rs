//! Shared fixtures for unit tests.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::params;
use serde_json::json;
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

use crate::context::{ContextDatabase, ContextOptions, DataContext, FromContextOptions};
use crate::provider::{
    AmbientSupport, Capabilities, MemoryDatabase, MemoryProvider, SqliteConnection,
    SqliteProvider, StoreConnection, StoreProvider,
};
use crate::transaction::ScopeResult;

/// Context writing customers into a SQLite database.
#[derive(Debug)]
pub(crate) struct CustomerContext<P: StoreProvider<Connection = SqliteConnection>> {
    db: ContextDatabase<P>,
}

impl<P: StoreProvider<Connection = SqliteConnection>> CustomerContext<P> {
    pub(crate) fn add_customer(&mut self, code: &str, name: &str) -> ScopeResult<()> {
        self.db.connection().with(|c| {
            c.execute(
                "INSERT INTO customers (code, name) VALUES (?1, ?2)",
                params![code, name],
            )
            .map(|_| ())
        })
    }

    /// Customers visible through this context's connection.
    pub(crate) fn customer_count(&self) -> ScopeResult<i64> {
        self.db
            .connection()
            .with(|c| c.query_row("SELECT COUNT(*) FROM customers", [], |r| r.get(0)))
    }

    pub(crate) fn db(&self) -> &ContextDatabase<P> {
        &self.db
    }
}

impl<P: StoreProvider<Connection = SqliteConnection>> DataContext<P> for CustomerContext<P> {
    fn database(&mut self) -> &mut ContextDatabase<P> {
        &mut self.db
    }
}

impl<P: StoreProvider<Connection = SqliteConnection>> FromContextOptions<P>
    for CustomerContext<P>
{
    fn from_options(options: ContextOptions<P>) -> ScopeResult<Self> {
        Ok(Self {
            db: ContextDatabase::new(options),
        })
    }
}

/// Context writing customers into an in-memory database.
#[derive(Debug)]
pub(crate) struct MemoryCustomerContext {
    db: ContextDatabase<MemoryProvider>,
}

impl MemoryCustomerContext {
    pub(crate) fn add_customer(&mut self, code: &str, name: &str) -> ScopeResult<()> {
        self.store()
            .put("customers", code, json!({ "code": code, "name": name }))
            .map(|_| ())
    }

    pub(crate) fn customer_count(&self) -> ScopeResult<usize> {
        self.store().count("customers")
    }

    pub(crate) fn db(&self) -> &ContextDatabase<MemoryProvider> {
        &self.db
    }

    fn store(&self) -> &MemoryDatabase {
        self.db.connection()
    }
}

impl DataContext<MemoryProvider> for MemoryCustomerContext {
    fn database(&mut self) -> &mut ContextDatabase<MemoryProvider> {
        &mut self.db
    }
}

impl FromContextOptions<MemoryProvider> for MemoryCustomerContext {
    fn from_options(options: ContextOptions<MemoryProvider>) -> ScopeResult<Self> {
        Ok(Self {
            db: ContextDatabase::new(options),
        })
    }
}

/// SQLite provider that reports itself as able to enlist in ambient
/// transactions, so ambient behaviour can be tested without a server.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EnlistingSqlite;

impl StoreProvider for EnlistingSqlite {
    type Connection = SqliteConnection;

    fn name(&self) -> &'static str {
        "sqlite-enlisting"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            ambient: AmbientSupport::Enlist,
            named_transactions: false,
        }
    }

    fn open(&self, connection_string: &str) -> ScopeResult<SqliteConnection> {
        SqliteProvider::new().open(connection_string)
    }
}

/// Create a file database with an empty `customers` table.
///
/// Returns the directory guard and the connection string.
pub(crate) fn customer_store() -> (TempDir, String) {
    let dir = TempDir::new().unwrap();
    let connection_string = format!("Data Source={}", dir.path().join("store.db").display());
    let conn = SqliteConnection::open(&connection_string).unwrap();
    conn.with(|c| {
        c.execute_batch("CREATE TABLE customers (code TEXT PRIMARY KEY, name TEXT NOT NULL)")
    })
    .unwrap();
    conn.close().unwrap();
    (dir, connection_string)
}

/// Count customers through a fresh, independent connection.
pub(crate) fn committed_customers(connection_string: &str) -> i64 {
    let conn = SqliteConnection::open(connection_string).unwrap();
    let count = conn
        .with(|c| c.query_row("SELECT COUNT(*) FROM customers", [], |r| r.get(0)))
        .unwrap();
    conn.close().unwrap();
    count
}

#[derive(Clone)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with a debug-level subscriber and return what it logged.
pub(crate) fn capture_logs<F, R>(f: F) -> (R, String)
where
    F: FnOnce() -> R,
{
    let buf = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(LogBuffer(Arc::clone(&buf)))
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buf.lock()).into_owned();
    (result, logs)
}
