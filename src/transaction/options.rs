//! Options for constructing a [`TransactionScope`](super::TransactionScope).

use std::fmt;
use std::sync::Arc;

use crate::context::{ConfigureHook, ContextOptionsBuilder};
use crate::provider::{StoreConnection, StoreProvider};
use crate::transaction::ambient::AmbientTransaction;
use crate::transaction::handle::Transaction;
use crate::transaction::isolation::IsolationLevel;

/// Inputs of a transaction scope.
///
/// Either a connection string or an existing connection must be given. An
/// existing transaction implies its connection when no connection is set.
pub struct TransactionScopeOptions<P: StoreProvider> {
    pub(crate) connection_string: Option<String>,
    pub(crate) connection: Option<P::Connection>,
    pub(crate) transaction: Option<Transaction<P::Connection>>,
    pub(crate) isolation_level: IsolationLevel,
    pub(crate) transaction_label: Option<String>,
    pub(crate) ambient: Option<AmbientTransaction>,
    pub(crate) configure: Option<ConfigureHook<P>>,
}

impl<P: StoreProvider> TransactionScopeOptions<P> {
    /// Empty options.
    pub fn new() -> Self {
        Self {
            connection_string: None,
            connection: None,
            transaction: None,
            isolation_level: IsolationLevel::default(),
            transaction_label: None,
            ambient: None,
            configure: None,
        }
    }

    /// Open a new connection from this string. The scope owns it.
    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Use an existing connection. The scope never closes it.
    pub fn connection(mut self, connection: P::Connection) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Join an existing transaction. The scope never completes it.
    pub fn transaction(mut self, transaction: Transaction<P::Connection>) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// Isolation level for a transaction the scope starts itself.
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Name for a transaction the scope starts itself.
    pub fn transaction_label(mut self, label: impl Into<String>) -> Self {
        self.transaction_label = Some(label.into());
        self
    }

    /// Ambient transaction to consult.
    pub fn ambient(mut self, ambient: AmbientTransaction) -> Self {
        self.ambient = Some(ambient);
        self
    }

    /// Hook applied to every options builder the scope creates.
    pub fn configure<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut ContextOptionsBuilder<P>) + Send + Sync + 'static,
    {
        self.configure = Some(Arc::new(hook));
        self
    }
}

impl<P: StoreProvider> Default for TransactionScopeOptions<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: StoreProvider> fmt::Debug for TransactionScopeOptions<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScopeOptions")
            .field("connection_string", &self.connection_string.is_some())
            .field("connection", &self.connection.as_ref().map(|c| c.id()))
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.id()))
            .field("isolation_level", &self.isolation_level)
            .field("transaction_label", &self.transaction_label)
            .field("ambient", &self.ambient.as_ref().map(|a| a.id()))
            .field("configure", &self.configure.is_some())
            .finish()
    }
}
