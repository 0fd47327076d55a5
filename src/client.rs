use std::sync::Arc;

use futures::future::BoxFuture;

use crate::batch::{
    batch_write, BatchSnapshot, BatchTransactionId, BatchWriteResults, MutationBatch, MutationGroup,
};
use crate::pool::{PoolStats, SessionKind, SessionPool};
use crate::proto::google::spanner::v1 as proto;
use crate::stream::{ResultStream, SessionRef, StreamRequest};
use crate::transaction::{
    execute_partitioned_dml, read_only_options, Settings, TransactionSelector,
};
use crate::{
    CallOptions, Config, ConfigBuilder, Connection, DatabaseId, Error,
    ReadOnlyTransaction, ReadWriteTransaction, RequestOptions, Session, SessionPoolConfig,
    SpannerResource, Statement, TimestampBound, ToSpanner, TransactionContext,
};

const LIST_SESSIONS_PAGE_SIZE: i32 = 100;

/// A handle to a Cloud Spanner database.
///
/// Cloning a client is cheap, clones share the session pool.
#[derive(Clone)]
pub struct Client {
    database: DatabaseId,
    pool: SessionPool,
    settings: Arc<Settings>,
}

impl Client {
    /// Returns a builder to configure and connect a client.
    pub fn configure() -> ConfigBuilder {
        Config::builder()
    }

    /// Connects to the database and starts warming up the session pool.
    pub async fn connect(mut config: Config) -> Result<Self, Error> {
        config.apply_environment(|name| std::env::var(name).ok());
        let connection = config.open_connection().await?;
        let client = Self::with_connection(connection, &config);
        client.pool.start();
        Ok(client)
    }

    /// Creates a client over an existing [`Connection`].
    ///
    /// The session pool's maintenance is not started, see [`Client::start`].
    pub fn with_connection(connection: Box<dyn Connection>, config: &Config) -> Self {
        let database = connection.database().clone();
        let settings = Arc::new(Settings {
            backoff: config.retry.clone(),
            resume: config.stream_resume.clone(),
            query_options: config.query_options.to_proto(),
        });
        Self {
            database,
            pool: SessionPool::new(connection, config.pool.clone(), config.database_role.clone()),
            settings,
        }
    }

    /// Starts the session pool's maintenance task, which also fills the pool to its minimum size.
    pub fn start(&self) {
        self.pool.start();
    }

    pub fn database(&self) -> &DatabaseId {
        &self.database
    }

    pub fn pool_config(&self) -> &SessionPoolConfig {
        self.pool.config()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// A single-use, strong, read-only transaction.
    pub async fn read_only(&self) -> Result<ReadOnlyTransaction, Error> {
        self.read_only_with_bound(TimestampBound::Strong).await
    }

    /// A single-use read-only transaction: every read runs in its own transaction at the given bound.
    pub async fn read_only_with_bound(
        &self,
        bound: TimestampBound,
    ) -> Result<ReadOnlyTransaction, Error> {
        let session = self.pool.acquire(SessionKind::ReadOnly).await?;
        Ok(ReadOnlyTransaction::single_use(
            self.pool.clone(),
            session,
            self.settings.clone(),
            bound,
        ))
    }

    /// A multi-use read-only transaction: all reads observe the database at the same timestamp.
    ///
    /// [`TimestampBound::MaxStaleness`] and [`TimestampBound::MinReadTimestamp`] cannot be used here.
    pub async fn snapshot(&self, bound: TimestampBound) -> Result<ReadOnlyTransaction, Error> {
        let session = self.pool.acquire(SessionKind::ReadOnly).await?;
        ReadOnlyTransaction::begin(self.pool.clone(), session, self.settings.clone(), bound).await
    }

    /// Streams the rows of a query run in a single-use transaction.
    pub async fn stream_query(
        &self,
        statement: Statement<'_>,
        bound: TimestampBound,
        options: RequestOptions,
    ) -> Result<ResultStream<'static>, Error> {
        let session = self.pool.acquire(SessionKind::ReadOnly).await?;
        let mut request =
            self.settings
                .sql_request(session.name(), &statement, options.to_proto(None))?;
        request.transaction =
            Some(TransactionSelector::SingleUse(read_only_options(&bound, false)).into());
        Ok(self.settings.stream(
            session.connection(),
            SessionRef::Owned(session),
            StreamRequest::Sql(request),
            CallOptions::default(),
        ))
    }

    /// Returns a runner of read-write transactions.
    pub fn read_write(&self) -> ReadWriteTransaction {
        ReadWriteTransaction::new(self.pool.clone(), self.settings.clone())
    }

    /// Runs `work` in a read-write transaction with the default options and returns its result.
    ///
    /// See [`ReadWriteTransaction::run`].
    pub async fn run_in_transaction<T, F>(&self, work: F) -> Result<T, Error>
    where
        F: for<'tx> FnMut(&'tx mut TransactionContext) -> BoxFuture<'tx, Result<T, Error>>,
        T: Send,
    {
        self.read_write().run(work).await.map(|result| result.value)
    }

    /// Runs a DML statement as partitioned DML and returns a lower bound of the number of modified rows.
    pub async fn execute_partitioned_dml(
        &self,
        sql: &str,
        params: &[(&str, &(dyn ToSpanner + Sync))],
    ) -> Result<i64, Error> {
        execute_partitioned_dml(
            &self.pool,
            &self.settings,
            Statement::new(sql, params),
            RequestOptions::default(),
        )
        .await
    }

    pub async fn execute_partitioned_dml_with(
        &self,
        statement: Statement<'_>,
        options: RequestOptions,
    ) -> Result<i64, Error> {
        execute_partitioned_dml(&self.pool, &self.settings, statement, options).await
    }

    /// Returns a batch of mutations committed in a single-use transaction.
    pub fn batch(&self) -> MutationBatch {
        MutationBatch::new(self.pool.clone(), self.settings.clone())
    }

    /// Applies groups of mutations, each atomically, in no particular order.
    pub async fn batch_write<G>(&self, groups: Vec<G>) -> Result<BatchWriteResults, Error>
    where
        G: Into<MutationGroup>,
    {
        self.batch_write_with(groups, RequestOptions::default(), false)
            .await
    }

    pub async fn batch_write_with<G>(
        &self,
        groups: Vec<G>,
        options: RequestOptions,
        exclude_txn_from_change_streams: bool,
    ) -> Result<BatchWriteResults, Error>
    where
        G: Into<MutationGroup>,
    {
        let groups = groups.into_iter().map(Into::into).collect();
        batch_write(&self.pool, groups, options, exclude_txn_from_change_streams).await
    }

    /// Begins a read-only transaction whose queries and reads can be partitioned.
    pub async fn batch_snapshot(&self, bound: TimestampBound) -> Result<BatchSnapshot, Error> {
        BatchSnapshot::begin(self.pool.clone(), self.settings.clone(), bound).await
    }

    /// Re-attaches to a [`BatchSnapshot`] begun by another client, possibly in another process.
    pub fn attach_batch_snapshot(&self, id: BatchTransactionId) -> BatchSnapshot {
        BatchSnapshot::attach(self.pool.clone(), self.settings.clone(), id)
    }

    /// Lists every session of the database, following the pages of `ListSessions`.
    pub async fn list_sessions(&self) -> Result<Vec<Session>, Error> {
        let mut connection = self.pool.connection();
        let mut sessions = Vec::new();
        let mut page_token = String::new();
        loop {
            let response = connection
                .list_sessions(
                    proto::ListSessionsRequest {
                        database: self.database.id(),
                        page_size: LIST_SESSIONS_PAGE_SIZE,
                        page_token,
                        filter: String::new(),
                    },
                    CallOptions::default(),
                )
                .await?;
            sessions.extend(response.sessions.into_iter().map(Session::from));
            if response.next_page_token.is_empty() {
                return Ok(sessions);
            }
            page_token = response.next_page_token;
        }
    }

    /// Deletes every pooled session. Sessions checked out when the client is closed are deleted when released.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
