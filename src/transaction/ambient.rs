//! Ambient transactions.
//!
//! An ambient transaction spans every connection enlisted in it. It is
//! created by an [`AmbientScope`], passed around explicitly as an
//! [`AmbientTransaction`] handle, and completed when the scope is closed:
//! enlisted resources are committed if [`AmbientScope::complete`] was called
//! and rolled back otherwise.
//!
//! Enlisted resources commit one after another in enlistment order. There is
//! no prepare phase, so a failure halfway through leaves earlier resources
//! committed; the remaining ones are rolled back and the first error is
//! returned.
//!
//! While enlisted resources are being completed the transaction is neither
//! active nor finished: it refuses new enlistments but still queues deferred
//! releases, which run only once every resource has been completed.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::provider::StoreConnection;
use crate::transaction::error::{ScopeError, ScopeResult};
use crate::transaction::handle::{Transaction, TransactionState};
use crate::transaction::isolation::IsolationLevel;

/// A resource whose completion is driven by an ambient transaction.
pub trait Enlistment: Send + Sync {
    /// Connection the resource runs on.
    fn connection_id(&self) -> Ulid;

    /// Make the resource's work durable.
    fn commit(&self) -> ScopeResult<()>;

    /// Discard the resource's work.
    fn rollback(&self) -> ScopeResult<()>;
}

impl<C: StoreConnection> Enlistment for Transaction<C> {
    fn connection_id(&self) -> Ulid {
        Transaction::connection_id(self)
    }

    fn commit(&self) -> ScopeResult<()> {
        Transaction::commit(self)
    }

    fn rollback(&self) -> ScopeResult<()> {
        Transaction::rollback(self)
    }
}

type DeferredRelease = Box<dyn FnOnce() -> ScopeResult<()> + Send>;

struct AmbientInner {
    id: Ulid,
    isolation: IsolationLevel,
    status: Mutex<AmbientStatus>,
}

struct AmbientStatus {
    state: TransactionState,
    complete: bool,
    completing: bool,
    enlistments: Vec<Box<dyn Enlistment>>,
    deferred: Vec<DeferredRelease>,
}

/// Handle to an ambient transaction.
///
/// Handles are cheap to clone and can be stored in scope options. Only the
/// owning [`AmbientScope`] can complete the transaction.
#[derive(Clone)]
pub struct AmbientTransaction {
    inner: Arc<AmbientInner>,
}

impl AmbientTransaction {
    fn new(isolation: IsolationLevel) -> Self {
        Self {
            inner: Arc::new(AmbientInner {
                id: Ulid::new(),
                isolation,
                status: Mutex::new(AmbientStatus {
                    state: TransactionState::Active,
                    complete: false,
                    completing: false,
                    enlistments: Vec::new(),
                    deferred: Vec::new(),
                }),
            }),
        }
    }

    /// Ambient transaction ID.
    pub fn id(&self) -> Ulid {
        self.inner.id
    }

    /// Isolation level enlisted resources begin with.
    pub fn isolation(&self) -> IsolationLevel {
        self.inner.isolation
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.inner.status.lock().state
    }

    /// Check if the transaction still accepts work.
    ///
    /// `false` as soon as completion has started, even though the final
    /// state is not known yet.
    pub fn is_active(&self) -> bool {
        self.inner.status.lock().accepting()
    }

    /// Number of enlisted resources.
    pub fn enlisted_count(&self) -> usize {
        self.inner.status.lock().enlistments.len()
    }

    /// Check if a connection is already enlisted.
    pub fn is_enlisted(&self, connection_id: Ulid) -> bool {
        self.inner.status.lock().is_enlisted(connection_id)
    }

    /// Hand a resource's completion over to this transaction.
    ///
    /// Each connection can be enlisted once.
    pub fn enlist(&self, enlistment: Box<dyn Enlistment>) -> ScopeResult<()> {
        let mut status = self.inner.status.lock();
        self.ensure_accepting(&status)?;
        let connection_id = enlistment.connection_id();
        if status.is_enlisted(connection_id) {
            return Err(ScopeError::InvalidOptions(format!(
                "connection {} is already enlisted in ambient transaction {}",
                connection_id, self.inner.id
            )));
        }
        self.push(&mut status, enlistment);
        Ok(())
    }

    /// Enlist `connection_id` unless it already is, creating the resource
    /// with `begin` only when needed.
    ///
    /// The check and the enlistment happen under one lock, so concurrent
    /// callers for the same connection begin exactly one resource.
    pub fn enlist_with<F>(&self, connection_id: Ulid, begin: F) -> ScopeResult<()>
    where
        F: FnOnce() -> ScopeResult<Box<dyn Enlistment>>,
    {
        let mut status = self.inner.status.lock();
        self.ensure_accepting(&status)?;
        if status.is_enlisted(connection_id) {
            return Ok(());
        }
        let enlistment = begin()?;
        self.push(&mut status, enlistment);
        Ok(())
    }

    /// Run `release` once the transaction has completed.
    ///
    /// Queued while the transaction is active or completing, run
    /// immediately once it has finished.
    pub fn defer_release<F>(&self, release: F) -> ScopeResult<()>
    where
        F: FnOnce() -> ScopeResult<()> + Send + 'static,
    {
        {
            let mut status = self.inner.status.lock();
            if status.state == TransactionState::Active {
                status.deferred.push(Box::new(release));
                return Ok(());
            }
        }
        release()
    }

    fn ensure_accepting(&self, status: &AmbientStatus) -> ScopeResult<()> {
        if status.accepting() {
            return Ok(());
        }
        Err(ScopeError::TransactionNotActive {
            tx_id: self.inner.id.to_string(),
            state: status.state,
        })
    }

    fn push(&self, status: &mut AmbientStatus, enlistment: Box<dyn Enlistment>) {
        let connection_id = enlistment.connection_id();
        status.enlistments.push(enlistment);
        debug!(
            target: "txscope::ambient",
            ambient_id = %self.inner.id,
            connection_id = %connection_id,
            "Connection enlisted"
        );
    }

    fn finish(&self) -> ScopeResult<()> {
        let (complete, enlistments) = {
            let mut status = self.inner.status.lock();
            if !status.accepting() {
                return Ok(());
            }
            status.completing = true;
            (status.complete, std::mem::take(&mut status.enlistments))
        };

        let mut first_error: Option<ScopeError> = None;
        let mut committing = complete;
        for enlistment in &enlistments {
            let result = if committing {
                enlistment.commit()
            } else {
                enlistment.rollback()
            };
            if let Err(e) = result {
                warn!(
                    target: "txscope::ambient",
                    ambient_id = %self.inner.id,
                    connection_id = %enlistment.connection_id(),
                    error = %e,
                    "Enlisted resource failed to complete"
                );
                // Remaining resources are rolled back once a commit fails.
                committing = false;
                first_error.get_or_insert(e);
            }
        }

        let committed = complete && first_error.is_none();
        let deferred = {
            let mut status = self.inner.status.lock();
            status.state = if committed {
                TransactionState::Committed
            } else {
                TransactionState::RolledBack
            };
            status.completing = false;
            std::mem::take(&mut status.deferred)
        };

        for release in deferred {
            if let Err(e) = release() {
                warn!(
                    target: "txscope::ambient",
                    ambient_id = %self.inner.id,
                    error = %e,
                    "Deferred release failed"
                );
                first_error.get_or_insert(e);
            }
        }

        debug!(
            target: "txscope::ambient",
            ambient_id = %self.inner.id,
            committed,
            resources = enlistments.len(),
            "Ambient transaction completed"
        );
        first_error.map_or(Ok(()), Err)
    }
}

impl AmbientStatus {
    fn accepting(&self) -> bool {
        self.state == TransactionState::Active && !self.completing
    }

    fn is_enlisted(&self, connection_id: Ulid) -> bool {
        self.enlistments
            .iter()
            .any(|e| e.connection_id() == connection_id)
    }
}

impl fmt::Debug for AmbientTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.inner.status.lock();
        f.debug_struct("AmbientTransaction")
            .field("id", &self.inner.id)
            .field("isolation", &self.inner.isolation)
            .field("state", &status.state)
            .field("completing", &status.completing)
            .field("enlisted", &status.enlistments.len())
            .finish()
    }
}

/// Check whether an ambient transaction is present and active.
pub fn is_active(ambient: Option<&AmbientTransaction>) -> bool {
    ambient.is_some_and(AmbientTransaction::is_active)
}

/// Owner of an ambient transaction.
///
/// Dropping the scope without calling [`close`](Self::close) completes the
/// transaction the same way; errors are then only logged.
pub struct AmbientScope {
    transaction: AmbientTransaction,
    closed: bool,
}

impl AmbientScope {
    /// Start an ambient transaction at the serializable level.
    pub fn new() -> Self {
        Self::with_isolation(IsolationLevel::Serializable)
    }

    /// Start an ambient transaction at `isolation`.
    pub fn with_isolation(isolation: IsolationLevel) -> Self {
        let transaction = AmbientTransaction::new(isolation);
        debug!(
            target: "txscope::ambient",
            ambient_id = %transaction.id(),
            isolation = %isolation,
            "Ambient transaction started"
        );
        Self {
            transaction,
            closed: false,
        }
    }

    /// A handle to pass to scopes that should join the transaction.
    pub fn transaction(&self) -> AmbientTransaction {
        self.transaction.clone()
    }

    /// Vote to commit when the scope is closed.
    pub fn complete(&self) {
        self.transaction.inner.status.lock().complete = true;
    }

    /// Complete the transaction: commit if [`complete`](Self::complete) was
    /// called, roll back otherwise, then run deferred releases.
    pub fn close(mut self) -> ScopeResult<()> {
        self.closed = true;
        self.transaction.finish()
    }
}

impl Default for AmbientScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AmbientScope {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.transaction.finish() {
            warn!(
                target: "txscope::ambient",
                ambient_id = %self.transaction.id(),
                error = %e,
                "Failed to complete ambient transaction on drop"
            );
        }
    }
}

impl fmt::Debug for AmbientScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientScope")
            .field("transaction", &self.transaction)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    struct Recorder {
        id: Ulid,
        log: Arc<Mutex<Vec<String>>>,
        fail_commit: bool,
    }

    impl Recorder {
        fn boxed(log: &Arc<Mutex<Vec<String>>>, fail_commit: bool) -> (Ulid, Box<dyn Enlistment>) {
            let id = Ulid::new();
            let recorder = Recorder {
                id,
                log: Arc::clone(log),
                fail_commit,
            };
            (id, Box::new(recorder))
        }
    }

    impl Enlistment for Recorder {
        fn connection_id(&self) -> Ulid {
            self.id
        }

        fn commit(&self) -> ScopeResult<()> {
            if self.fail_commit {
                return Err(ScopeError::ConnectionClosed(self.id.to_string()));
            }
            self.log.lock().push(format!("commit {}", self.id));
            Ok(())
        }

        fn rollback(&self) -> ScopeResult<()> {
            self.log.lock().push(format!("rollback {}", self.id));
            Ok(())
        }
    }

    #[test]
    fn test_detector() {
        assert!(!is_active(None));
        let scope = AmbientScope::new();
        let ambient = scope.transaction();
        assert!(is_active(Some(&ambient)));
        scope.close().unwrap();
        assert!(!is_active(Some(&ambient)));
        assert_eq!(ambient.state(), TransactionState::RolledBack);
    }

    #[test]
    fn test_complete_commits_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = AmbientScope::with_isolation(IsolationLevel::ReadCommitted);
        let ambient = scope.transaction();
        assert_eq!(ambient.isolation(), IsolationLevel::ReadCommitted);

        let (first, a) = Recorder::boxed(&log, false);
        let (second, b) = Recorder::boxed(&log, false);
        ambient.enlist(a).unwrap();
        ambient.enlist(b).unwrap();
        assert!(ambient.is_enlisted(first));
        assert_eq!(ambient.enlisted_count(), 2);

        scope.complete();
        scope.close().unwrap();
        assert_eq!(
            *log.lock(),
            vec![format!("commit {}", first), format!("commit {}", second)]
        );
        assert_eq!(ambient.state(), TransactionState::Committed);
    }

    #[test]
    fn test_drop_without_complete_rolls_back() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ambient = {
            let scope = AmbientScope::new();
            let (_, a) = Recorder::boxed(&log, false);
            scope.transaction().enlist(a).unwrap();
            scope.transaction()
        };
        assert_eq!(log.lock().len(), 1);
        assert!(log.lock()[0].starts_with("rollback"));
        assert!(!ambient.is_active());
    }

    #[test]
    fn test_failed_commit_rolls_back_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = AmbientScope::new();
        let ambient = scope.transaction();
        let (_, bad) = Recorder::boxed(&log, true);
        let (later, good) = Recorder::boxed(&log, false);
        ambient.enlist(bad).unwrap();
        ambient.enlist(good).unwrap();

        scope.complete();
        let err = scope.close().unwrap_err();
        assert!(matches!(err, ScopeError::ConnectionClosed(_)));
        assert_eq!(*log.lock(), vec![format!("rollback {}", later)]);
        assert_eq!(ambient.state(), TransactionState::RolledBack);
    }

    #[test]
    fn test_duplicate_and_late_enlistment() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let scope = AmbientScope::new();
        let ambient = scope.transaction();

        let (id, a) = Recorder::boxed(&log, false);
        ambient.enlist(a).unwrap();
        let duplicate = Box::new(Recorder {
            id,
            log: Arc::clone(&log),
            fail_commit: false,
        });
        assert!(matches!(
            ambient.enlist(duplicate),
            Err(ScopeError::InvalidOptions(_))
        ));

        scope.close().unwrap();
        let (_, late) = Recorder::boxed(&log, false);
        assert!(matches!(
            ambient.enlist(late),
            Err(ScopeError::TransactionNotActive { .. })
        ));
    }

    #[test]
    fn test_deferred_release() {
        let released = Arc::new(AtomicUsize::new(0));
        let scope = AmbientScope::new();
        let ambient = scope.transaction();

        let counter = Arc::clone(&released);
        ambient
            .defer_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);

        scope.close().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);

        // Already completed: runs right away.
        let counter = Arc::clone(&released);
        ambient
            .defer_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_enlist_with_begins_once_per_connection() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let begun = Arc::new(AtomicUsize::new(0));
        let scope = AmbientScope::new();
        let connection_id = Ulid::new();
        let start = Arc::new(Barrier::new(4));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let ambient = scope.transaction();
                let log = Arc::clone(&log);
                let begun = Arc::clone(&begun);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    ambient.enlist_with(connection_id, || {
                        begun.fetch_add(1, Ordering::SeqCst);
                        Ok(Box::new(Recorder {
                            id: connection_id,
                            log,
                            fail_commit: false,
                        }) as Box<dyn Enlistment>)
                    })
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap().unwrap();
        }

        let ambient = scope.transaction();
        assert_eq!(begun.load(Ordering::SeqCst), 1);
        assert_eq!(ambient.enlisted_count(), 1);
        assert!(ambient.is_enlisted(connection_id));

        scope.complete();
        scope.close().unwrap();
        assert_eq!(*log.lock(), vec![format!("commit {}", connection_id)]);
    }

    struct Gate {
        id: Ulid,
        barrier: Arc<Barrier>,
    }

    impl Enlistment for Gate {
        fn connection_id(&self) -> Ulid {
            self.id
        }

        fn commit(&self) -> ScopeResult<()> {
            self.barrier.wait();
            self.barrier.wait();
            Ok(())
        }

        fn rollback(&self) -> ScopeResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_completion_in_progress() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));
        let scope = AmbientScope::new();
        let ambient = scope.transaction();
        ambient
            .enlist(Box::new(Gate {
                id: Ulid::new(),
                barrier: Arc::clone(&barrier),
            }))
            .unwrap();
        let (last, recorder) = Recorder::boxed(&log, false);
        ambient.enlist(recorder).unwrap();

        scope.complete();
        let closer = thread::spawn(move || scope.close());
        barrier.wait();

        // Mid-completion: no new work, releases still wait.
        assert!(!ambient.is_active());
        assert_eq!(ambient.state(), TransactionState::Active);
        let (_, late) = Recorder::boxed(&log, false);
        assert!(matches!(
            ambient.enlist(late),
            Err(ScopeError::TransactionNotActive { .. })
        ));
        let counter = Arc::clone(&released);
        let order = Arc::clone(&log);
        ambient
            .defer_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                order.lock().push("release".to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);

        barrier.wait();
        closer.join().unwrap().unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(
            *log.lock(),
            vec![format!("commit {}", last), "release".to_string()]
        );
        assert_eq!(ambient.state(), TransactionState::Committed);
    }
}
