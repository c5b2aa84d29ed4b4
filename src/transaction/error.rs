//! Transaction scope error types.

use thiserror::Error;

use crate::transaction::handle::TransactionState;
use crate::transaction::scope::ScopeState;
use crate::transaction::IsolationLevel;

/// Result type for scope, provider and context operations.
pub type ScopeResult<T> = Result<T, ScopeError>;

/// Errors raised by the coordinator, its providers and the registry.
///
/// Driver failures are carried through unchanged in the `Sqlite` and
/// `Postgres` variants.
#[derive(Debug, Error)]
pub enum ScopeError {
    /// Neither a connection nor a connection string was supplied.
    #[error("connection string was not provided")]
    MissingConnectionInfo,

    /// An ambient transaction is active but the provider cannot enlist in it.
    #[error("the current provider ({provider}) does not support ambient transactions")]
    AmbientTransactionsNotSupported { provider: &'static str },

    /// Commit was requested on a transaction the scope does not own.
    #[error("cannot commit an externally provided transaction")]
    CommitExternalTransaction,

    /// Rollback was requested on a transaction the scope does not own.
    #[error("cannot roll back an externally provided transaction")]
    RollbackExternalTransaction,

    /// The object has already been disposed.
    #[error("cannot access a disposed object: {type_name}")]
    ObjectDisposed { type_name: &'static str },

    /// The scope already committed or rolled back its transaction.
    #[error("transaction scope has already completed (state: {state})")]
    ScopeCompleted { state: ScopeState },

    /// The transaction handle was already committed, rolled back or disposed.
    #[error("transaction {tx_id} is no longer active (state: {state})")]
    TransactionNotActive { tx_id: String, state: TransactionState },

    /// A transaction was paired with a connection it was not started on.
    #[error("transaction {tx_id} is not associated with connection {connection_id}")]
    TransactionConnectionMismatch { tx_id: String, connection_id: String },

    /// The connection has been closed by its owner.
    #[error("connection {0} is closed")]
    ConnectionClosed(String),

    /// The provider cannot honour the requested isolation level.
    #[error("isolation level {level} is not supported by {provider}")]
    UnsupportedIsolationLevel {
        provider: &'static str,
        level: IsolationLevel,
    },

    /// The store does not support transactions and is configured to refuse them.
    #[error("transactions are not supported by the {provider} store")]
    TransactionsNotSupported { provider: &'static str },

    /// The options are inconsistent for the chosen provider.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// The connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// No scope was registered under the requested name.
    #[error("no transaction scope registered under name '{0}'")]
    UnknownScope(String),

    /// A scope was registered under the name, but for another provider.
    #[error("transaction scope '{name}' is not a {expected} scope")]
    ScopeTypeMismatch { name: String, expected: &'static str },

    /// A context activator asked for a service that was never registered.
    #[error("service not registered: {0}")]
    MissingService(&'static str),

    /// Embedded SQLite driver error.
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    /// PostgreSQL driver error.
    #[error(transparent)]
    Postgres(#[from] postgres::Error),
}

impl ScopeError {
    /// Check if this error comes from the ownership rules of the scope.
    pub fn is_ownership_error(&self) -> bool {
        matches!(
            self,
            ScopeError::CommitExternalTransaction | ScopeError::RollbackExternalTransaction
        )
    }

    /// Check if this error was caused by using something past its lifetime.
    pub fn is_lifecycle_error(&self) -> bool {
        matches!(
            self,
            ScopeError::ObjectDisposed { .. }
                | ScopeError::ScopeCompleted { .. }
                | ScopeError::TransactionNotActive { .. }
                | ScopeError::ConnectionClosed(_)
        )
    }

    /// Check if this error was raised by the underlying store driver.
    pub fn is_driver_error(&self) -> bool {
        matches!(self, ScopeError::Sqlite(_) | ScopeError::Postgres(_))
    }

    pub(crate) fn disposed<T: ?Sized>() -> Self {
        Self::ObjectDisposed {
            type_name: std::any::type_name::<T>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ScopeError::CommitExternalTransaction.is_ownership_error());
        assert!(ScopeError::RollbackExternalTransaction.is_ownership_error());
        assert!(!ScopeError::MissingConnectionInfo.is_ownership_error());

        let not_active = ScopeError::TransactionNotActive {
            tx_id: "tx001".to_string(),
            state: TransactionState::Committed,
        };
        assert!(not_active.is_lifecycle_error());
        assert!(!not_active.is_driver_error());

        let driver = ScopeError::from(rusqlite::Error::InvalidQuery);
        assert!(driver.is_driver_error());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ScopeError::CommitExternalTransaction.to_string(),
            "cannot commit an externally provided transaction"
        );
        assert_eq!(
            ScopeError::AmbientTransactionsNotSupported { provider: "sqlite" }.to_string(),
            "the current provider (sqlite) does not support ambient transactions"
        );
        let disposed = ScopeError::disposed::<String>();
        assert!(disposed.to_string().contains("String"));
    }
}
