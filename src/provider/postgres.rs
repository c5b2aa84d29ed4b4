//! PostgreSQL provider.
//!
//! Relational-server backend built on the synchronous `postgres` client.
//! Connections can be enlisted in an ambient transaction, and transactions
//! may carry a name that shows up as the session's `application_name` for
//! as long as the transaction runs.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::Mutex;
use postgres::{Client, Config, NoTls};
use tracing::debug;
use ulid::Ulid;

use crate::provider::{AmbientSupport, BeginRequest, Capabilities, StoreConnection, StoreProvider};
use crate::transaction::{IsolationLevel, ScopeError, ScopeResult};

const PROVIDER_NAME: &str = "postgres";

/// A shared PostgreSQL connection.
#[derive(Clone)]
pub struct PgConnection {
    inner: Arc<PgConnectionInner>,
}

struct PgConnectionInner {
    id: Ulid,
    client: Mutex<Option<Client>>,
}

impl PgConnection {
    /// Connect using a `key=value` or `postgresql://` connection string.
    pub fn open(connection_string: &str) -> ScopeResult<Self> {
        let config = Config::from_str(connection_string)
            .map_err(|e| ScopeError::InvalidConnectionString(e.to_string()))?;
        let client = config.connect(NoTls)?;

        let handle = Self::from_client(client);
        debug!(target: "txscope::postgres", connection_id = %handle.id(), "Connection opened");
        Ok(handle)
    }

    /// Wrap a client the caller connected.
    pub fn from_client(client: Client) -> Self {
        Self {
            inner: Arc::new(PgConnectionInner {
                id: Ulid::new(),
                client: Mutex::new(Some(client)),
            }),
        }
    }

    /// Run `f` against the underlying client.
    ///
    /// Holds the connection lock for the duration of `f`.
    pub fn with<R>(
        &self,
        f: impl FnOnce(&mut Client) -> Result<R, postgres::Error>,
    ) -> ScopeResult<R> {
        let mut guard = self.inner.client.lock();
        let client = guard
            .as_mut()
            .ok_or_else(|| ScopeError::ConnectionClosed(self.inner.id.to_string()))?;
        Ok(f(client)?)
    }
}

impl StoreConnection for PgConnection {
    fn id(&self) -> Ulid {
        self.inner.id
    }

    fn is_open(&self) -> bool {
        self.inner
            .client
            .lock()
            .as_ref()
            .is_some_and(|client| !client.is_closed())
    }

    fn close(&self) -> ScopeResult<()> {
        let Some(client) = self.inner.client.lock().take() else {
            return Ok(());
        };
        client.close()?;
        debug!(target: "txscope::postgres", connection_id = %self.inner.id, "Connection closed");
        Ok(())
    }

    fn begin_raw(&self, request: &BeginRequest) -> ScopeResult<()> {
        let mut batch = begin_statement(request.isolation)?.to_string();
        if let Some(label) = &request.label {
            batch.push_str(&format!(
                "; SET LOCAL application_name = {}",
                quote_literal(label)
            ));
        }
        self.with(|client| client.batch_execute(&batch))
    }

    fn commit_raw(&self) -> ScopeResult<()> {
        self.with(|client| client.batch_execute("COMMIT"))
    }

    fn rollback_raw(&self) -> ScopeResult<()> {
        self.with(|client| client.batch_execute("ROLLBACK"))
    }
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("id", &self.inner.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Statement that starts a transaction at `level`.
fn begin_statement(level: IsolationLevel) -> ScopeResult<&'static str> {
    match level {
        IsolationLevel::Unspecified => Ok("BEGIN"),
        IsolationLevel::ReadUncommitted => Ok("BEGIN ISOLATION LEVEL READ UNCOMMITTED"),
        IsolationLevel::ReadCommitted => Ok("BEGIN ISOLATION LEVEL READ COMMITTED"),
        // PostgreSQL's repeatable read is snapshot isolation.
        IsolationLevel::RepeatableRead | IsolationLevel::Snapshot => {
            Ok("BEGIN ISOLATION LEVEL REPEATABLE READ")
        }
        IsolationLevel::Serializable => Ok("BEGIN ISOLATION LEVEL SERIALIZABLE"),
        IsolationLevel::Chaos => Err(ScopeError::UnsupportedIsolationLevel {
            provider: PROVIDER_NAME,
            level,
        }),
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Provider for PostgreSQL servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresProvider;

impl PostgresProvider {
    /// Create a new PostgreSQL provider.
    pub fn new() -> Self {
        Self
    }
}

impl StoreProvider for PostgresProvider {
    type Connection = PgConnection;

    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            ambient: AmbientSupport::Enlist,
            named_transactions: true,
        }
    }

    fn open(&self, connection_string: &str) -> ScopeResult<PgConnection> {
        PgConnection::open(connection_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextDatabase, DataContext};
    use crate::transaction::{AmbientScope, ScopeState, TransactionScope, TransactionScopeOptions};

    /// Connection string of a disposable test server, if one is configured.
    fn server_url() -> Option<String> {
        std::env::var("TXSCOPE_POSTGRES_URL").ok()
    }

    /// A uniquely named customers table, dropped again at the end of a test.
    struct CustomerTable {
        url: String,
        name: String,
    }

    impl CustomerTable {
        fn create(url: &str) -> Self {
            let name = format!("customers_{}", Ulid::new().to_string().to_lowercase());
            let conn = PgConnection::open(url).unwrap();
            conn.with(|c| {
                c.batch_execute(&format!(
                    "CREATE TABLE {} (code TEXT PRIMARY KEY, name TEXT NOT NULL)",
                    name
                ))
            })
            .unwrap();
            conn.close().unwrap();
            Self {
                url: url.to_string(),
                name,
            }
        }

        /// Rows visible to a fresh, independent connection.
        fn committed(&self) -> i64 {
            let conn = PgConnection::open(&self.url).unwrap();
            let count = conn
                .with(|c| {
                    c.query_one(&format!("SELECT COUNT(*) FROM {}", self.name), &[])
                        .map(|row| row.get(0))
                })
                .unwrap();
            conn.close().unwrap();
            count
        }

        fn context(&self, scope: &TransactionScope<PostgresProvider>) -> PgCustomers {
            scope
                .create_context_with(|options| {
                    Ok(PgCustomers {
                        db: ContextDatabase::new(options),
                        table: self.name.clone(),
                    })
                })
                .unwrap()
        }
    }

    impl Drop for CustomerTable {
        fn drop(&mut self) {
            if let Ok(conn) = PgConnection::open(&self.url) {
                let _ = conn.with(|c| c.batch_execute(&format!("DROP TABLE IF EXISTS {}", self.name)));
                let _ = conn.close();
            }
        }
    }

    #[derive(Debug)]
    struct PgCustomers {
        db: ContextDatabase<PostgresProvider>,
        table: String,
    }

    impl PgCustomers {
        fn add_customer(&self, code: &str, name: &str) {
            let sql = format!("INSERT INTO {} (code, name) VALUES ($1, $2)", self.table);
            self.db
                .connection()
                .with(|c| c.execute(&sql, &[&code, &name]))
                .unwrap();
        }
    }

    impl DataContext<PostgresProvider> for PgCustomers {
        fn database(&mut self) -> &mut ContextDatabase<PostgresProvider> {
            &mut self.db
        }
    }

    fn server_scope(url: &str) -> TransactionScope<PostgresProvider> {
        TransactionScope::new(
            PostgresProvider::new(),
            TransactionScopeOptions::new().connection_string(url),
        )
        .unwrap()
    }

    #[test]
    fn test_begin_statement() {
        assert_eq!(begin_statement(IsolationLevel::Unspecified).unwrap(), "BEGIN");
        assert_eq!(
            begin_statement(IsolationLevel::Snapshot).unwrap(),
            "BEGIN ISOLATION LEVEL REPEATABLE READ"
        );
        assert_eq!(
            begin_statement(IsolationLevel::Serializable).unwrap(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE"
        );
        assert!(matches!(
            begin_statement(IsolationLevel::Chaos),
            Err(ScopeError::UnsupportedIsolationLevel { .. })
        ));
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("import"), "'import'");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_provider_capabilities() {
        let provider = PostgresProvider::new();
        assert_eq!(provider.capabilities().ambient, AmbientSupport::Enlist);
        assert!(provider.capabilities().named_transactions);
    }

    #[test]
    fn test_invalid_connection_string() {
        let err = PgConnection::open("host=localhost port=notaport").unwrap_err();
        assert!(matches!(err, ScopeError::InvalidConnectionString(_)));
    }

    #[test]
    fn test_named_transaction_on_server() {
        let Some(url) = server_url() else {
            eprintln!("TXSCOPE_POSTGRES_URL not set, skipping");
            return;
        };
        let conn = PgConnection::open(&url).unwrap();
        conn.begin_raw(&BeginRequest::new(IsolationLevel::ReadCommitted).label("nightly import"))
            .unwrap();
        let name: String = conn
            .with(|c| c.query_one("SHOW application_name", &[]).map(|row| row.get(0)))
            .unwrap();
        assert_eq!(name, "nightly import");
        conn.rollback_raw().unwrap();
        conn.close().unwrap();
        assert!(!conn.is_open());
    }

    #[test]
    fn test_scope_commits_all_contexts_on_server() {
        let Some(url) = server_url() else {
            eprintln!("TXSCOPE_POSTGRES_URL not set, skipping");
            return;
        };
        let table = CustomerTable::create(&url);
        let scope = server_scope(&url);
        let a = table.context(&scope);
        let b = table.context(&scope);
        a.add_customer("C1", "Ada");
        b.add_customer("C2", "Brian");
        assert_eq!(table.committed(), 0);

        scope.commit().unwrap();
        assert_eq!(scope.state(), ScopeState::Committed);
        assert_eq!(table.committed(), 2);
    }

    #[test]
    fn test_scope_dispose_rolls_back_on_server() {
        let Some(url) = server_url() else {
            eprintln!("TXSCOPE_POSTGRES_URL not set, skipping");
            return;
        };
        let table = CustomerTable::create(&url);
        let connection = {
            let scope = server_scope(&url);
            table.context(&scope).add_customer("C1", "Ada");
            scope.connection().clone()
        };
        assert!(!connection.is_open());
        assert_eq!(table.committed(), 0);
    }

    #[test]
    fn test_scope_defers_to_ambient_on_server() {
        let Some(url) = server_url() else {
            eprintln!("TXSCOPE_POSTGRES_URL not set, skipping");
            return;
        };
        let table = CustomerTable::create(&url);
        let ambient = AmbientScope::new();
        {
            let scope = TransactionScope::new(
                PostgresProvider::new(),
                TransactionScopeOptions::new()
                    .connection_string(&url)
                    .ambient(ambient.transaction()),
            )
            .unwrap();
            assert!(scope.is_ambient_deferred());
            table.context(&scope).add_customer("C1", "Ada");
            assert!(matches!(
                scope.commit(),
                Err(ScopeError::CommitExternalTransaction)
            ));
        }
        assert_eq!(table.committed(), 0);

        ambient.complete();
        ambient.close().unwrap();
        assert_eq!(table.committed(), 1);
    }

    #[test]
    fn test_scope_named_transaction_on_server() {
        let Some(url) = server_url() else {
            eprintln!("TXSCOPE_POSTGRES_URL not set, skipping");
            return;
        };
        let scope = TransactionScope::new(
            PostgresProvider::new(),
            TransactionScopeOptions::new()
                .connection_string(&url)
                .transaction_label("nightly import"),
        )
        .unwrap();
        let application_name = || -> String {
            scope
                .connection()
                .with(|c| c.query_one("SHOW application_name", &[]).map(|row| row.get(0)))
                .unwrap()
        };
        assert_eq!(application_name(), "nightly import");

        scope.commit().unwrap();
        assert_ne!(application_name(), "nightly import");
    }
}
