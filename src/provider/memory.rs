//! In-memory provider.
//!
//! Databases live in a [`MemoryDatabaseRoot`] and are addressed by name; every
//! connection opened with the same name against the same root sees the same
//! tables. The store has no transactions: writes are visible to everyone as
//! soon as they are made, commit does nothing and rollback does not undo
//! anything. Beginning a transaction is therefore treated as a warning whose
//! handling is configured through [`WarningBehavior`].

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::context::{ContextOptionsBuilder, WarningBehavior};
use crate::provider::{AmbientSupport, BeginRequest, Capabilities, StoreConnection, StoreProvider};
use crate::transaction::{ScopeError, ScopeResult};

const PROVIDER_NAME: &str = "memory";

static GLOBAL_ROOT: Lazy<MemoryDatabaseRoot> = Lazy::new(MemoryDatabaseRoot::new);

/// Tables of one named database: table name → row key → row.
#[derive(Default)]
struct MemoryStore {
    tables: RwLock<BTreeMap<String, BTreeMap<String, Value>>>,
}

/// A namespace of named in-memory databases.
#[derive(Clone, Default)]
pub struct MemoryDatabaseRoot {
    databases: Arc<Mutex<HashMap<String, Arc<MemoryStore>>>>,
}

impl MemoryDatabaseRoot {
    /// Create an empty root, isolated from every other root.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide root used by [`MemoryProvider::new`].
    pub fn global() -> Self {
        GLOBAL_ROOT.clone()
    }

    /// Open a connection to the database `name`, creating it if needed.
    pub fn open(&self, name: &str) -> ScopeResult<MemoryDatabase> {
        if name.trim().is_empty() {
            return Err(ScopeError::InvalidConnectionString(
                "in-memory database name must not be empty".to_string(),
            ));
        }
        let store = Arc::clone(self.databases.lock().entry(name.to_string()).or_default());

        let db = MemoryDatabase {
            inner: Arc::new(MemoryConnectionInner {
                id: Ulid::new(),
                name: name.to_string(),
                store,
                open: Mutex::new(true),
            }),
        };
        debug!(target: "txscope::memory", connection_id = %db.id(), name, "Connection opened");
        Ok(db)
    }

    /// Check whether a database with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.databases.lock().contains_key(name)
    }

    /// Forget a database. Open connections keep their data.
    pub fn remove(&self, name: &str) -> bool {
        self.databases.lock().remove(name).is_some()
    }
}

impl fmt::Debug for MemoryDatabaseRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDatabaseRoot")
            .field("databases", &self.databases.lock().len())
            .finish()
    }
}

/// A connection to a named in-memory database.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<MemoryConnectionInner>,
}

struct MemoryConnectionInner {
    id: Ulid,
    name: String,
    store: Arc<MemoryStore>,
    open: Mutex<bool>,
}

impl MemoryDatabase {
    /// Database name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn ensure_open(&self) -> ScopeResult<()> {
        if *self.inner.open.lock() {
            Ok(())
        } else {
            Err(ScopeError::ConnectionClosed(self.inner.id.to_string()))
        }
    }

    /// Insert or replace a row. Returns the previous row, if any.
    pub fn put(&self, table: &str, key: &str, row: Value) -> ScopeResult<Option<Value>> {
        self.ensure_open()?;
        let mut tables = self.inner.store.tables.write();
        Ok(tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), row))
    }

    /// Read a row.
    pub fn get(&self, table: &str, key: &str) -> ScopeResult<Option<Value>> {
        self.ensure_open()?;
        let tables = self.inner.store.tables.read();
        Ok(tables.get(table).and_then(|rows| rows.get(key)).cloned())
    }

    /// Delete a row. Returns the deleted row, if any.
    pub fn remove(&self, table: &str, key: &str) -> ScopeResult<Option<Value>> {
        self.ensure_open()?;
        let mut tables = self.inner.store.tables.write();
        Ok(tables.get_mut(table).and_then(|rows| rows.remove(key)))
    }

    /// All rows of a table in key order.
    pub fn scan(&self, table: &str) -> ScopeResult<Vec<Value>> {
        self.ensure_open()?;
        let tables = self.inner.store.tables.read();
        Ok(tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Number of rows in a table.
    pub fn count(&self, table: &str) -> ScopeResult<usize> {
        self.ensure_open()?;
        Ok(self
            .inner
            .store
            .tables
            .read()
            .get(table)
            .map_or(0, BTreeMap::len))
    }

    /// Drop every table.
    pub fn clear(&self) -> ScopeResult<()> {
        self.ensure_open()?;
        self.inner.store.tables.write().clear();
        Ok(())
    }
}

impl StoreConnection for MemoryDatabase {
    fn id(&self) -> Ulid {
        self.inner.id
    }

    fn is_open(&self) -> bool {
        *self.inner.open.lock()
    }

    fn close(&self) -> ScopeResult<()> {
        let mut open = self.inner.open.lock();
        if *open {
            *open = false;
            debug!(target: "txscope::memory", connection_id = %self.inner.id, "Connection closed");
        }
        Ok(())
    }

    fn begin_raw(&self, request: &BeginRequest) -> ScopeResult<()> {
        self.ensure_open()?;
        match request.transaction_warning {
            WarningBehavior::Throw => Err(ScopeError::TransactionsNotSupported {
                provider: PROVIDER_NAME,
            }),
            WarningBehavior::Log => {
                warn!(
                    target: "txscope::memory",
                    database = %self.inner.name,
                    "Transactions are not supported by the in-memory store and will be ignored"
                );
                Ok(())
            }
            WarningBehavior::Ignore => Ok(()),
        }
    }

    fn commit_raw(&self) -> ScopeResult<()> {
        self.ensure_open()
    }

    fn rollback_raw(&self) -> ScopeResult<()> {
        self.ensure_open()?;
        debug!(
            target: "txscope::memory",
            database = %self.inner.name,
            "Rollback requested; in-memory writes are not undone"
        );
        Ok(())
    }
}

impl fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Provider for named in-memory databases.
///
/// The connection string is the database name.
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    root: MemoryDatabaseRoot,
    transaction_warning: WarningBehavior,
}

impl MemoryProvider {
    /// Provider over the process-wide root.
    pub fn new() -> Self {
        Self::with_root(MemoryDatabaseRoot::global())
    }

    /// Provider over a caller-supplied root.
    pub fn with_root(root: MemoryDatabaseRoot) -> Self {
        Self {
            root,
            transaction_warning: WarningBehavior::default(),
        }
    }

    /// Default handling of "transaction ignored" for contexts of this provider.
    pub fn transaction_warning(mut self, behavior: WarningBehavior) -> Self {
        self.transaction_warning = behavior;
        self
    }

    /// The root databases are opened from.
    pub fn root(&self) -> &MemoryDatabaseRoot {
        &self.root
    }
}

impl StoreProvider for MemoryProvider {
    type Connection = MemoryDatabase;

    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            ambient: AmbientSupport::Ignore,
            named_transactions: false,
        }
    }

    fn open(&self, connection_string: &str) -> ScopeResult<MemoryDatabase> {
        self.root.open(connection_string)
    }

    fn bind_options(&self, connection: &MemoryDatabase) -> ContextOptionsBuilder<Self> {
        let mut builder = ContextOptionsBuilder::new(self.name(), connection.clone());
        builder.transaction_warning(self.transaction_warning);
        builder
    }
}
