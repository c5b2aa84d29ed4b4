//! Transaction scopes.
//!
//! A [`TransactionScope`] hands one connection and one transaction to every
//! context it creates, so work done through several contexts commits or rolls
//! back as a unit.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TransactionScope                        │
//! │   (resolves connection + transaction, enrolls contexts,     │
//! │    completes and releases only what it owns)                │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ Transaction │       │  Ambient    │       │ Isolation   │
//!  │  (handle)   │       │ Transaction │       │   Level     │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txscope::provider::SqliteProvider;
//! use txscope::transaction::{TransactionScope, TransactionScopeOptions};
//!
//! let scope = TransactionScope::new(
//!     SqliteProvider::new(),
//!     TransactionScopeOptions::new().connection_string("Data Source=shop.db"),
//! )?;
//!
//! let mut orders: Orders = scope.create_context()?;
//! let mut stock: Stock = scope.create_context()?;
//! orders.place(order)?;
//! stock.reserve(&order.lines)?;
//!
//! scope.commit()?; // or drop the scope to roll back
//! ```

pub mod ambient;
mod error;
mod handle;
mod isolation;
mod options;
mod scope;

pub use ambient::{AmbientScope, AmbientTransaction, Enlistment};
pub use error::{ScopeError, ScopeResult};
pub use handle::{Transaction, TransactionMetadata, TransactionState};
pub use isolation::IsolationLevel;
pub use options::TransactionScopeOptions;
pub use scope::{ScopeState, TransactionScope};
