//! txscope - shared connections and transactions across data-access contexts
//!
//! A [`TransactionScope`](transaction::TransactionScope) opens (or borrows) one
//! connection, begins (or borrows, or defers to an ambient) transaction, and
//! hands both to every context created through it. Committing the scope
//! commits the work of all of them; dropping it uncommitted rolls it all back.
//!
//! Three backends are included: PostgreSQL (enlists in ambient transactions),
//! SQLite (refuses them) and an in-memory store without real transactions.
//!
//! # Example
//!
//! ```no_run
//! use txscope::provider::SqliteProvider;
//! use txscope::transaction::{TransactionScope, TransactionScopeOptions};
//!
//! let scope = TransactionScope::new(
//!     SqliteProvider::new(),
//!     TransactionScopeOptions::new().connection_string("Data Source=shop.db"),
//! )
//! .unwrap();
//! let options = scope.context_options().unwrap();
//! options
//!     .connection()
//!     .with(|c| c.execute("INSERT INTO customers (code) VALUES ('C1')", []))
//!     .unwrap();
//! scope.commit().unwrap();
//! ```

pub mod context;
pub mod provider;
pub mod registry;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use context::{ContextDatabase, ContextOptions, DataContext, FromContextOptions, WarningBehavior};
pub use provider::{StoreConnection, StoreProvider};
pub use registry::{ScopeRegistry, ScopeResolver, Services};
pub use transaction::{ScopeError, ScopeResult, TransactionScope, TransactionScopeOptions};
