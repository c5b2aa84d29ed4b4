//! Data-access contexts.
//!
//! A context is a user type that reads and writes through one connection.
//! The scope builds [`ContextOptions`] bound to its shared connection, hands
//! them to an activator, and enrolls the resulting context in the shared
//! transaction through [`ContextDatabase::use_transaction`].
//!
//! ```ignore
//! struct Orders {
//!     db: ContextDatabase<SqliteProvider>,
//! }
//!
//! impl DataContext<SqliteProvider> for Orders {
//!     fn database(&mut self) -> &mut ContextDatabase<SqliteProvider> {
//!         &mut self.db
//!     }
//! }
//!
//! impl FromContextOptions<SqliteProvider> for Orders {
//!     fn from_options(options: ContextOptions<SqliteProvider>) -> ScopeResult<Self> {
//!         Ok(Self { db: ContextDatabase::new(options) })
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::provider::{StoreConnection, StoreProvider};
use crate::transaction::{ScopeError, ScopeResult, Transaction};

/// Reaction of a store without transactions when one is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningBehavior {
    /// Fail with `TransactionsNotSupported`.
    #[default]
    Throw,
    /// Log a warning and carry on without a transaction.
    Log,
    /// Carry on silently.
    Ignore,
}

/// Hook run over every options builder the scope creates.
pub type ConfigureHook<P> = Arc<dyn Fn(&mut ContextOptionsBuilder<P>) + Send + Sync>;

/// Mutable options for contexts of provider `P`, bound to one connection.
pub struct ContextOptionsBuilder<P: StoreProvider> {
    provider: &'static str,
    connection: P::Connection,
    label: Option<String>,
    transaction_warning: WarningBehavior,
}

impl<P: StoreProvider> ContextOptionsBuilder<P> {
    /// Bind options to `connection`.
    pub fn new(provider: &'static str, connection: P::Connection) -> Self {
        Self {
            provider,
            connection,
            label: None,
            transaction_warning: WarningBehavior::default(),
        }
    }

    /// Name contexts created from these options (shows up in logs).
    pub fn label(&mut self, label: impl Into<String>) -> &mut Self {
        self.label = Some(label.into());
        self
    }

    /// Set the reaction of stores without transactions.
    pub fn transaction_warning(&mut self, behavior: WarningBehavior) -> &mut Self {
        self.transaction_warning = behavior;
        self
    }

    /// Current warning behaviour.
    pub fn warning_behavior(&self) -> WarningBehavior {
        self.transaction_warning
    }

    /// The bound connection.
    pub fn connection(&self) -> &P::Connection {
        &self.connection
    }

    /// Freeze the options.
    pub fn build(self) -> ContextOptions<P> {
        ContextOptions {
            provider: self.provider,
            connection: self.connection,
            label: self.label,
            transaction_warning: self.transaction_warning,
        }
    }
}

impl<P: StoreProvider> fmt::Debug for ContextOptionsBuilder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptionsBuilder")
            .field("provider", &self.provider)
            .field("connection_id", &self.connection.id())
            .field("label", &self.label)
            .field("transaction_warning", &self.transaction_warning)
            .finish()
    }
}

/// Finished context options.
pub struct ContextOptions<P: StoreProvider> {
    provider: &'static str,
    connection: P::Connection,
    label: Option<String>,
    transaction_warning: WarningBehavior,
}

impl<P: StoreProvider> ContextOptions<P> {
    /// Name of the provider the options were bound by.
    pub fn provider_name(&self) -> &'static str {
        self.provider
    }

    /// The bound connection.
    pub fn connection(&self) -> &P::Connection {
        &self.connection
    }

    /// Context label, if configured.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Reaction of stores without transactions.
    pub fn transaction_warning(&self) -> WarningBehavior {
        self.transaction_warning
    }
}

impl<P: StoreProvider> Clone for ContextOptions<P> {
    fn clone(&self) -> Self {
        Self {
            provider: self.provider,
            connection: self.connection.clone(),
            label: self.label.clone(),
            transaction_warning: self.transaction_warning,
        }
    }
}

impl<P: StoreProvider> fmt::Debug for ContextOptions<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("provider", &self.provider)
            .field("connection_id", &self.connection.id())
            .field("label", &self.label)
            .field("transaction_warning", &self.transaction_warning)
            .finish()
    }
}

/// Connection and current transaction of one context.
pub struct ContextDatabase<P: StoreProvider> {
    options: ContextOptions<P>,
    transaction: Option<Transaction<P::Connection>>,
}

impl<P: StoreProvider> ContextDatabase<P> {
    /// Create the database facade from bound options.
    pub fn new(options: ContextOptions<P>) -> Self {
        Self {
            options,
            transaction: None,
        }
    }

    /// Options the context was created with.
    pub fn options(&self) -> &ContextOptions<P> {
        &self.options
    }

    /// The connection all work goes through.
    pub fn connection(&self) -> &P::Connection {
        self.options.connection()
    }

    /// Transaction the context is enrolled in, if any.
    pub fn current_transaction(&self) -> Option<&Transaction<P::Connection>> {
        self.transaction.as_ref()
    }

    /// Enroll the context in `transaction`, or detach it with `None`.
    ///
    /// The transaction must run on this context's connection and still be
    /// active.
    pub fn use_transaction(
        &mut self,
        transaction: Option<Transaction<P::Connection>>,
    ) -> ScopeResult<()> {
        let Some(tx) = transaction else {
            self.transaction = None;
            return Ok(());
        };

        let connection_id = self.connection().id();
        if tx.connection_id() != connection_id {
            return Err(ScopeError::TransactionConnectionMismatch {
                tx_id: tx.id().to_string(),
                connection_id: connection_id.to_string(),
            });
        }
        tx.ensure_active()?;

        debug!(
            target: "txscope::context",
            tx_id = %tx.id(),
            connection_id = %connection_id,
            context = self.options.label().unwrap_or("-"),
            "Context enrolled in transaction"
        );
        self.transaction = Some(tx);
        Ok(())
    }
}

impl<P: StoreProvider> fmt::Debug for ContextDatabase<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextDatabase")
            .field("options", &self.options)
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.id()))
            .finish()
    }
}

/// A data-access context for provider `P`.
pub trait DataContext<P: StoreProvider> {
    /// The context's database facade.
    fn database(&mut self) -> &mut ContextDatabase<P>;
}

/// A context that can be constructed from bound options alone.
pub trait FromContextOptions<P: StoreProvider>: DataContext<P> + Sized {
    /// Build the context.
    fn from_options(options: ContextOptions<P>) -> ScopeResult<Self>;
}
