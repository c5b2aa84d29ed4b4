//! Shared transaction handles.
//!
//! A [`Transaction`] is a cloneable handle to one transaction running on one
//! connection. Clones share state: once any clone commits, rolls back or
//! disposes the transaction, every other clone observes the new state and
//! refuses further work. This is what lets a scope hand the same transaction
//! to many contexts while keeping a single point of completion.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::provider::{BeginRequest, StoreConnection};
use crate::transaction::error::{ScopeError, ScopeResult};
use crate::transaction::isolation::IsolationLevel;

/// Lifecycle state of a transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Work may still be performed and the transaction may be completed.
    Active,
    /// The transaction was committed.
    Committed,
    /// The transaction was rolled back.
    RolledBack,
    /// The handle was released; an active transaction is rolled back first.
    Disposed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "active"),
            TransactionState::Committed => write!(f, "committed"),
            TransactionState::RolledBack => write!(f, "rolled back"),
            TransactionState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Transaction metadata.
#[derive(Debug, Clone)]
pub struct TransactionMetadata {
    /// Unique transaction ID.
    pub tx_id: Ulid,
    /// Connection the transaction runs on.
    pub connection_id: Ulid,
    /// Isolation level requested at begin.
    pub isolation: IsolationLevel,
    /// Optional transaction name.
    pub label: Option<String>,
    /// When the transaction started.
    pub started_at: DateTime<Utc>,
}

/// A transaction bound to exactly one connection.
pub struct Transaction<C: StoreConnection> {
    inner: Arc<TransactionInner<C>>,
}

struct TransactionInner<C: StoreConnection> {
    metadata: TransactionMetadata,
    connection: C,
    state: Mutex<TransactionState>,
}

impl<C: StoreConnection> Clone for Transaction<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: StoreConnection> Transaction<C> {
    /// Begin a new transaction on `connection`.
    pub fn begin(connection: &C, request: &BeginRequest) -> ScopeResult<Self> {
        connection.begin_raw(request)?;

        let tx = Self {
            inner: Arc::new(TransactionInner {
                metadata: TransactionMetadata {
                    tx_id: Ulid::new(),
                    connection_id: connection.id(),
                    isolation: request.isolation,
                    label: request.label.clone(),
                    started_at: Utc::now(),
                },
                connection: connection.clone(),
                state: Mutex::new(TransactionState::Active),
            }),
        };

        debug!(
            target: "txscope::transaction",
            tx_id = %tx.id(),
            connection_id = %tx.connection_id(),
            isolation = %request.isolation,
            "Transaction started"
        );
        Ok(tx)
    }

    /// Get the transaction ID.
    pub fn id(&self) -> Ulid {
        self.inner.metadata.tx_id
    }

    /// Get the ID of the connection this transaction runs on.
    pub fn connection_id(&self) -> Ulid {
        self.inner.metadata.connection_id
    }

    /// Get the connection this transaction runs on.
    pub fn connection(&self) -> &C {
        &self.inner.connection
    }

    /// Get the isolation level.
    pub fn isolation(&self) -> IsolationLevel {
        self.inner.metadata.isolation
    }

    /// Get the transaction name, if one was given.
    pub fn label(&self) -> Option<&str> {
        self.inner.metadata.label.as_deref()
    }

    /// Get the transaction metadata.
    pub fn metadata(&self) -> &TransactionMetadata {
        &self.inner.metadata
    }

    /// Current state of the transaction.
    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock()
    }

    /// Check if the transaction can still be used.
    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    /// Check if two handles refer to the same transaction.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fail unless the transaction is still active.
    pub fn ensure_active(&self) -> ScopeResult<()> {
        let state = self.state();
        if state == TransactionState::Active {
            Ok(())
        } else {
            Err(self.not_active(state))
        }
    }

    /// Commit the transaction.
    ///
    /// Fails with [`ScopeError::TransactionNotActive`] if the transaction was
    /// already completed; a second commit is never silently accepted.
    pub fn commit(&self) -> ScopeResult<()> {
        let mut state = self.inner.state.lock();
        if *state != TransactionState::Active {
            return Err(self.not_active(*state));
        }

        self.inner.connection.commit_raw()?;
        *state = TransactionState::Committed;

        debug!(target: "txscope::transaction", tx_id = %self.id(), "Transaction committed");
        Ok(())
    }

    /// Roll the transaction back.
    pub fn rollback(&self) -> ScopeResult<()> {
        let mut state = self.inner.state.lock();
        if *state != TransactionState::Active {
            return Err(self.not_active(*state));
        }

        self.inner.connection.rollback_raw()?;
        *state = TransactionState::RolledBack;

        debug!(target: "txscope::transaction", tx_id = %self.id(), "Transaction rolled back");
        Ok(())
    }

    /// Release the transaction.
    ///
    /// An active transaction is rolled back. Disposing twice is a no-op.
    pub fn dispose(&self) -> ScopeResult<()> {
        let mut state = self.inner.state.lock();
        let previous = std::mem::replace(&mut *state, TransactionState::Disposed);
        if previous == TransactionState::Active {
            debug!(
                target: "txscope::transaction",
                tx_id = %self.id(),
                "Rolling back transaction on dispose"
            );
            self.inner.connection.rollback_raw()?;
        }
        Ok(())
    }

    fn not_active(&self, state: TransactionState) -> ScopeError {
        ScopeError::TransactionNotActive {
            tx_id: self.id().to_string(),
            state,
        }
    }
}

impl<C: StoreConnection> Drop for TransactionInner<C> {
    fn drop(&mut self) {
        if *self.state.get_mut() != TransactionState::Active {
            return;
        }
        // Last handle gone without completion: never leave it open.
        if let Err(e) = self.connection.rollback_raw() {
            warn!(
                target: "txscope::transaction",
                tx_id = %self.metadata.tx_id,
                error = %e,
                "Failed to roll back abandoned transaction"
            );
        }
    }
}

impl<C: StoreConnection> fmt::Debug for Transaction<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("tx_id", &self.id())
            .field("connection_id", &self.connection_id())
            .field("isolation", &self.isolation())
            .field("state", &self.state())
            .finish()
    }
}
