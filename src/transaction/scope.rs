//! Transaction scope - one connection and one transaction shared by many
//! contexts.
//!
//! The scope resolves its connection and transaction once, at construction:
//!
//! - an existing connection is borrowed, otherwise one is opened from the
//!   connection string and owned;
//! - an active ambient transaction takes precedence: providers that enlist
//!   defer to it and start nothing locally, providers that reject it fail;
//! - an existing transaction is borrowed;
//! - otherwise the scope begins and owns a transaction.
//!
//! Only owned resources are ever committed, rolled back or closed by the
//! scope.

use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::context::{ConfigureHook, ContextOptions, DataContext, FromContextOptions};
use crate::provider::{AmbientSupport, BeginRequest, StoreConnection, StoreProvider};
use crate::registry::Services;
use crate::transaction::ambient::{self, AmbientTransaction};
use crate::transaction::error::{ScopeError, ScopeResult};
use crate::transaction::handle::Transaction;
use crate::transaction::options::TransactionScopeOptions;

/// Lifecycle state of a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeState {
    /// Contexts can be created and the transaction completed.
    Active,
    /// The owned transaction was committed.
    Committed,
    /// The owned transaction was rolled back.
    RolledBack,
    /// Owned resources were released.
    Disposed,
}

impl fmt::Display for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeState::Active => write!(f, "active"),
            ScopeState::Committed => write!(f, "committed"),
            ScopeState::RolledBack => write!(f, "rolled back"),
            ScopeState::Disposed => write!(f, "disposed"),
        }
    }
}

/// Coordinates one connection and one transaction across contexts.
///
/// Thread-safe: a scope can be shared behind an `Arc`, which is how the
/// registry hands it out.
pub struct TransactionScope<P: StoreProvider> {
    id: Ulid,
    provider: P,
    connection: P::Connection,
    owns_connection: bool,
    transaction: Option<Transaction<P::Connection>>,
    owns_transaction: bool,
    ambient: Option<AmbientTransaction>,
    configure: Option<ConfigureHook<P>>,
    services: Services,
    state: Mutex<ScopeState>,
}

/// Transaction resolved at construction and whether the scope owns it.
type Resolved<C> = (Option<Transaction<C>>, bool, Option<AmbientTransaction>);

impl<P: StoreProvider> TransactionScope<P> {
    /// Create a scope.
    pub fn new(provider: P, options: TransactionScopeOptions<P>) -> ScopeResult<Self> {
        let TransactionScopeOptions {
            connection_string,
            connection,
            transaction,
            isolation_level,
            transaction_label,
            ambient,
            configure,
        } = options;

        let capabilities = provider.capabilities();
        if transaction_label.is_some() && !capabilities.named_transactions {
            return Err(ScopeError::InvalidOptions(format!(
                "{} does not support named transactions",
                provider.name()
            )));
        }

        let ambient = ambient.filter(|a| ambient::is_active(Some(a)));
        if ambient.is_some() && capabilities.ambient == AmbientSupport::Reject {
            return Err(ScopeError::AmbientTransactionsNotSupported {
                provider: provider.name(),
            });
        }

        let (connection, owns_connection) = match (connection, &transaction, connection_string) {
            (Some(connection), _, _) => (connection, false),
            (None, Some(tx), _) => (tx.connection().clone(), false),
            (None, None, Some(cs)) => (provider.open(&cs)?, true),
            (None, None, None) => return Err(ScopeError::MissingConnectionInfo),
        };

        let mut scope = Self {
            id: Ulid::new(),
            provider,
            connection,
            owns_connection,
            transaction: None,
            owns_transaction: false,
            ambient: None,
            configure,
            services: Services::new(),
            state: Mutex::new(ScopeState::Active),
        };

        let request = BeginRequest {
            isolation: isolation_level,
            label: transaction_label,
            transaction_warning: Default::default(),
        };
        // On failure the half-built scope is dropped, which closes an owned
        // connection.
        let (transaction, owns_transaction, ambient) =
            scope.resolve_transaction(transaction, ambient, request)?;
        scope.transaction = transaction;
        scope.owns_transaction = owns_transaction;
        scope.ambient = ambient;

        debug!(
            target: "txscope::scope",
            scope_id = %scope.id,
            provider = scope.provider.name(),
            connection_id = %scope.connection.id(),
            owns_connection = scope.owns_connection,
            owns_transaction = scope.owns_transaction,
            ambient = scope.ambient.is_some(),
            "Scope created"
        );
        Ok(scope)
    }

    fn resolve_transaction(
        &self,
        transaction: Option<Transaction<P::Connection>>,
        ambient: Option<AmbientTransaction>,
        mut request: BeginRequest,
    ) -> ScopeResult<Resolved<P::Connection>> {
        if let Some(ambient) = ambient {
            match self.provider.capabilities().ambient {
                AmbientSupport::Enlist => {
                    if transaction.is_some() {
                        return Err(ScopeError::InvalidOptions(
                            "an existing transaction cannot be combined with an active ambient transaction"
                                .to_string(),
                        ));
                    }
                    self.provider.enlist(&self.connection, &ambient)?;
                    return Ok((None, false, Some(ambient)));
                }
                // Rejecting providers never get here, `new` fails first.
                AmbientSupport::Ignore | AmbientSupport::Reject => {
                    debug!(
                        target: "txscope::scope",
                        scope_id = %self.id,
                        ambient_id = %ambient.id(),
                        provider = self.provider.name(),
                        "Ambient transaction ignored by provider"
                    );
                }
            }
        }

        if let Some(tx) = transaction {
            if tx.connection_id() != self.connection.id() {
                return Err(ScopeError::TransactionConnectionMismatch {
                    tx_id: tx.id().to_string(),
                    connection_id: self.connection.id().to_string(),
                });
            }
            tx.ensure_active()?;
            return Ok((Some(tx), false, None));
        }

        let mut builder = self.provider.bind_options(&self.connection);
        if let Some(hook) = &self.configure {
            hook(&mut builder);
        }
        request.transaction_warning = builder.warning_behavior();

        let tx = self.provider.begin(&self.connection, &request)?;
        Ok((Some(tx), true, None))
    }

    /// Create a context enrolled in the shared transaction.
    pub fn create_context<C: FromContextOptions<P>>(&self) -> ScopeResult<C> {
        self.create_context_with(C::from_options)
    }

    /// Create a context with a custom activator.
    pub fn create_context_with<C, F>(&self, activator: F) -> ScopeResult<C>
    where
        C: DataContext<P>,
        F: FnOnce(ContextOptions<P>) -> ScopeResult<C>,
    {
        self.ensure_usable()?;

        let mut context = activator(self.bind_context_options())?;
        if let Some(tx) = &self.transaction {
            context.database().use_transaction(Some(tx.clone()))?;
        }

        debug!(
            target: "txscope::scope",
            scope_id = %self.id,
            context = std::any::type_name::<C>(),
            "Context created"
        );
        Ok(context)
    }

    /// Create a context with an activator that also receives the services
    /// the scope was registered with.
    pub fn create_context_with_services<C, F>(&self, activator: F) -> ScopeResult<C>
    where
        C: DataContext<P>,
        F: FnOnce(ContextOptions<P>, &Services) -> ScopeResult<C>,
    {
        self.create_context_with(|options| activator(options, &self.services))
    }

    /// Options bound to the shared connection, with the configure hook applied.
    ///
    /// Fails like [`create_context`](Self::create_context) once the scope is
    /// completed or disposed.
    pub fn context_options(&self) -> ScopeResult<ContextOptions<P>> {
        self.ensure_usable()?;
        Ok(self.bind_context_options())
    }

    fn bind_context_options(&self) -> ContextOptions<P> {
        let mut builder = self.provider.bind_options(&self.connection);
        if let Some(hook) = &self.configure {
            hook(&mut builder);
        }
        builder.build()
    }

    /// Commit the owned transaction.
    pub fn commit(&self) -> ScopeResult<()> {
        let mut state = self.state.lock();
        if *state == ScopeState::Disposed {
            return Err(ScopeError::disposed::<Self>());
        }
        let tx = self.owned_transaction().ok_or(ScopeError::CommitExternalTransaction)?;

        tx.commit()?;
        *state = ScopeState::Committed;
        debug!(target: "txscope::scope", scope_id = %self.id, tx_id = %tx.id(), "Scope committed");
        Ok(())
    }

    /// Roll back the owned transaction.
    pub fn rollback(&self) -> ScopeResult<()> {
        let mut state = self.state.lock();
        if *state == ScopeState::Disposed {
            return Err(ScopeError::disposed::<Self>());
        }
        let tx = self.owned_transaction().ok_or(ScopeError::RollbackExternalTransaction)?;

        tx.rollback()?;
        *state = ScopeState::RolledBack;
        debug!(target: "txscope::scope", scope_id = %self.id, tx_id = %tx.id(), "Scope rolled back");
        Ok(())
    }

    /// Release owned resources.
    ///
    /// An owned transaction that is still active is rolled back before an
    /// owned connection is closed. When the connection is enlisted in an
    /// ambient transaction that has not completed yet, closing it waits for
    /// that completion. Borrowed resources are left untouched. Disposing
    /// twice is a no-op.
    pub fn dispose(&self) -> ScopeResult<()> {
        let mut state = self.state.lock();
        let previous = std::mem::replace(&mut *state, ScopeState::Disposed);
        if previous == ScopeState::Disposed {
            return Ok(());
        }

        let mut first_error: Option<ScopeError> = None;

        if let Some(tx) = self.owned_transaction() {
            if tx.is_active() {
                warn!(
                    target: "txscope::scope",
                    scope_id = %self.id,
                    tx_id = %tx.id(),
                    "Scope disposed without completion, rolling back"
                );
            }
            if let Err(e) = tx.dispose() {
                first_error.get_or_insert(e);
            }
        }

        if self.owns_connection {
            // The ambient owner may be completing on another thread, so the
            // close is always handed over and runs once it has finished.
            let closed = match &self.ambient {
                Some(ambient) => {
                    debug!(
                        target: "txscope::scope",
                        scope_id = %self.id,
                        ambient_id = %ambient.id(),
                        "Connection close handed to ambient transaction"
                    );
                    let connection = self.connection.clone();
                    ambient.defer_release(move || connection.close())
                }
                None => self.connection.close(),
            };
            if let Err(e) = closed {
                first_error.get_or_insert(e);
            }
        }

        debug!(target: "txscope::scope", scope_id = %self.id, previous = %previous, "Scope disposed");
        first_error.map_or(Ok(()), Err)
    }

    /// Attach services passed to activators.
    pub fn with_services(mut self, services: Services) -> Self {
        self.services = services;
        self
    }

    /// Scope ID.
    pub fn id(&self) -> Ulid {
        self.id
    }

    /// The provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// The shared connection.
    pub fn connection(&self) -> &P::Connection {
        &self.connection
    }

    /// The shared transaction. `None` while deferring to an ambient transaction.
    pub fn transaction(&self) -> Option<&Transaction<P::Connection>> {
        self.transaction.as_ref()
    }

    /// Check whether the scope opened the connection itself.
    pub fn owns_connection(&self) -> bool {
        self.owns_connection
    }

    /// Check whether the scope began the transaction itself.
    pub fn owns_transaction(&self) -> bool {
        self.owns_transaction
    }

    /// Check whether transaction completion is left to an ambient transaction.
    pub fn is_ambient_deferred(&self) -> bool {
        self.ambient.is_some()
    }

    /// Ambient transaction the connection is enlisted in, if any.
    pub fn ambient(&self) -> Option<&AmbientTransaction> {
        self.ambient.as_ref()
    }

    /// Services passed to activators.
    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Current state.
    pub fn state(&self) -> ScopeState {
        *self.state.lock()
    }

    fn owned_transaction(&self) -> Option<&Transaction<P::Connection>> {
        self.transaction.as_ref().filter(|_| self.owns_transaction)
    }

    fn ensure_usable(&self) -> ScopeResult<()> {
        match *self.state.lock() {
            ScopeState::Active => Ok(()),
            ScopeState::Disposed => Err(ScopeError::disposed::<Self>()),
            state => Err(ScopeError::ScopeCompleted { state }),
        }
    }
}

impl<P: StoreProvider> Drop for TransactionScope<P> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(
                target: "txscope::scope",
                scope_id = %self.id,
                error = %e,
                "Failed to dispose transaction scope"
            );
        }
    }
}

impl<P: StoreProvider> fmt::Debug for TransactionScope<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionScope")
            .field("id", &self.id)
            .field("provider", &self.provider.name())
            .field("connection_id", &self.connection.id())
            .field("owns_connection", &self.owns_connection)
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.id()))
            .field("owns_transaction", &self.owns_transaction)
            .field("state", &self.state())
            .finish()
    }
}
