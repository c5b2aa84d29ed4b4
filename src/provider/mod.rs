//! Store providers.
//!
//! A provider knows how to reach one kind of backing store. The coordinator
//! only needs three capabilities from it: open a connection, begin a
//! transaction on that connection, and bind context options to the
//! connection. Everything else (queries, change tracking) stays in the
//! contexts.
//!
//! # Backends
//!
//! ```text
//!                  ┌──────────────────────────┐
//!                  │      StoreProvider       │
//!                  │ open · begin · enlist ·  │
//!                  │      bind_options        │
//!                  └────────────┬─────────────┘
//!        ┌──────────────────────┼──────────────────────┐
//!        ▼                      ▼                      ▼
//! ┌──────────────┐      ┌───────────────┐      ┌───────────────┐
//! │   Postgres   │      │    Sqlite     │      │    Memory     │
//! │ (server,     │      │ (embedded,    │      │ (no real      │
//! │  enlists)    │      │  rejects      │      │  transactions,│
//! │              │      │  ambient)     │      │  ignores      │
//! │              │      │               │      │  ambient)     │
//! └──────────────┘      └───────────────┘      └───────────────┘
//! ```

mod connection_string;
pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use connection_string::ConnectionString;
pub use memory::{MemoryDatabase, MemoryDatabaseRoot, MemoryProvider};
pub use postgres::{PgConnection, PostgresProvider};
pub use sqlite::{SqliteConnection, SqliteProvider};

use ulid::Ulid;

use crate::context::{ContextOptionsBuilder, WarningBehavior};
use crate::transaction::{AmbientTransaction, Enlistment, IsolationLevel, ScopeResult, Transaction};

/// How a provider reacts to an active ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmbientSupport {
    /// The connection is enlisted in the ambient transaction and the scope
    /// starts no transaction of its own.
    Enlist,
    /// Scope construction fails with `AmbientTransactionsNotSupported`.
    Reject,
    /// The ambient transaction is ignored and the scope proceeds as usual.
    Ignore,
}

/// Backend capabilities consulted by the scope at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Ambient transaction behaviour.
    pub ambient: AmbientSupport,
    /// Whether transactions may carry a name.
    pub named_transactions: bool,
}

/// Parameters for beginning a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeginRequest {
    /// Requested isolation level.
    pub isolation: IsolationLevel,
    /// Optional transaction name.
    pub label: Option<String>,
    /// Reaction of stores without transactions.
    pub transaction_warning: WarningBehavior,
}

impl BeginRequest {
    /// Create a request for the given isolation level.
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            ..Default::default()
        }
    }

    /// Set the transaction name.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the warning behaviour for stores without transactions.
    pub fn transaction_warning(mut self, behavior: WarningBehavior) -> Self {
        self.transaction_warning = behavior;
        self
    }
}

/// A cloneable handle to one live physical connection.
///
/// Clones share the connection. Closing it through any clone closes it for
/// all of them; later operations fail with `ConnectionClosed`.
pub trait StoreConnection: Clone + Send + Sync + 'static {
    /// Unique identity of the physical connection.
    fn id(&self) -> Ulid;

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;

    /// Close the connection. Closing twice is a no-op.
    fn close(&self) -> ScopeResult<()>;

    /// Start a transaction on the connection.
    fn begin_raw(&self, request: &BeginRequest) -> ScopeResult<()>;

    /// Commit the running transaction.
    fn commit_raw(&self) -> ScopeResult<()>;

    /// Roll back the running transaction.
    fn rollback_raw(&self) -> ScopeResult<()>;
}

/// A backing store the coordinator can drive.
pub trait StoreProvider: Send + Sync + 'static {
    /// Connection handle type of this backend.
    type Connection: StoreConnection;

    /// Short backend name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Backend capabilities.
    fn capabilities(&self) -> Capabilities;

    /// Open a new connection from a connection string.
    fn open(&self, connection_string: &str) -> ScopeResult<Self::Connection>;

    /// Begin a transaction on `connection`.
    fn begin(
        &self,
        connection: &Self::Connection,
        request: &BeginRequest,
    ) -> ScopeResult<Transaction<Self::Connection>> {
        Transaction::begin(connection, request)
    }

    /// Enlist `connection` in an ambient transaction.
    ///
    /// The default begins a transaction on the connection and hands its
    /// completion over to the ambient transaction owner. Enlisting the same
    /// connection twice keeps the first enlistment.
    fn enlist(
        &self,
        connection: &Self::Connection,
        ambient: &AmbientTransaction,
    ) -> ScopeResult<()> {
        let request = BeginRequest::new(ambient.isolation());
        ambient.enlist_with(connection.id(), || {
            let tx = self.begin(connection, &request)?;
            Ok(Box::new(tx) as Box<dyn Enlistment>)
        })
    }

    /// Create context options bound to `connection`.
    fn bind_options(&self, connection: &Self::Connection) -> ContextOptionsBuilder<Self>
    where
        Self: Sized,
    {
        ContextOptionsBuilder::new(self.name(), connection.clone())
    }
}
