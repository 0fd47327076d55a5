use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use futures::{Stream, StreamExt};
use tokio::time::Instant;

use crate::mutation::to_proto_mutations;
use crate::pool::{PooledSession, SessionKind, SessionPool};
use crate::proto::google::spanner::v1 as proto;
use crate::result_set::system_time;
use crate::stream::{ResultStream, SessionRef, StreamRequest};
use crate::transaction::{ReadOnlyTransaction, Settings, TransactionSelector};
use crate::{
    BatchWriteStream, CallOptions, CommitResult, Error, ErrorKind, KeySet, Mutation, Read,
    RequestOptions, ResultSet, Statement, TimestampBound, TransactionOptions, Value,
};

const MAX_SESSION_NOT_FOUND_ATTEMPTS: u32 = 3;
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(3600);

/// Mutations applied atomically in a single-use read-write transaction, without any read.
///
/// ```no_run
/// # use spanner_rs::*;
/// # async fn example(client: &Client) -> Result<(), Error> {
/// let result = client
///     .batch()
///     .insert("person", &["id", "name"], vec![vec![Value::Int64(1), Value::String("ferris".to_string())]])
///     .delete("person", KeySet::from(vec![Key::from(Value::Int64(2))]))
///     .commit()
///     .await?;
/// println!("committed at {:?}", result.commit_timestamp);
/// # Ok(()) }
/// ```
pub struct MutationBatch {
    pool: SessionPool,
    settings: Arc<Settings>,
    options: TransactionOptions,
    mutations: Vec<Mutation>,
    timeout: Duration,
}

impl MutationBatch {
    pub(crate) fn new(pool: SessionPool, settings: Arc<Settings>) -> Self {
        Self {
            pool,
            settings,
            options: TransactionOptions::default(),
            mutations: Vec::new(),
            timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }

    pub fn options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mutation(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn insert(self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        self.mutation(Mutation::insert(table, columns, rows))
    }

    pub fn update(self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        self.mutation(Mutation::update(table, columns, rows))
    }

    pub fn insert_or_update(self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        self.mutation(Mutation::insert_or_update(table, columns, rows))
    }

    pub fn replace(self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        self.mutation(Mutation::replace(table, columns, rows))
    }

    pub fn delete(self, table: &str, key_set: KeySet) -> Self {
        self.mutation(Mutation::delete(table, key_set))
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Commits the mutations, retrying when the transaction is aborted.
    pub async fn commit(self) -> Result<CommitResult<()>, Error> {
        let request = proto::CommitRequest {
            mutations: to_proto_mutations(&self.mutations)?,
            transaction: Some(proto::commit_request::Transaction::SingleUseTransaction(
                self.options.to_proto(Vec::new()),
            )),
            return_commit_stats: self.options.return_commit_stats,
            request_options: RequestOptions {
                priority: self.options.commit_priority,
                tag: None,
            }
            .to_proto(self.options.tag.as_deref()),
            max_commit_delay: self.options.max_commit_delay.map(Into::into),
            ..Default::default()
        };

        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0;
        let mut lost_sessions = 0;
        loop {
            attempt += 1;
            let mut session = self
                .pool
                .acquire_until(SessionKind::ReadWrite, deadline)
                .await?;
            let mut connection = session.connection();
            let result = connection
                .commit(
                    proto::CommitRequest {
                        session: session.name().to_string(),
                        ..request.clone()
                    },
                    CallOptions::leader(),
                )
                .await;
            let err = match result {
                Ok(response) => {
                    session.touch();
                    return Ok(CommitResult::new((), Some(response), attempt));
                }
                Err(err) => err,
            };
            match err.kind() {
                ErrorKind::Aborted => {
                    let delay = err
                        .retry_delay()
                        .unwrap_or_default()
                        .max(self.settings.backoff.jittered(attempt - 1));
                    if Instant::now() + delay >= deadline {
                        return Err(err.with_attempt(attempt));
                    }
                    log::debug!("batch aborted on attempt {}, retrying in {:?}", attempt, delay);
                    drop(session);
                    tokio::time::sleep(delay).await;
                }
                ErrorKind::SessionNotFound if lost_sessions + 1 < MAX_SESSION_NOT_FOUND_ATTEMPTS => {
                    session.mark_bad();
                    lost_sessions += 1;
                }
                _ => {
                    if err.is_session_not_found() {
                        session.mark_bad();
                    }
                    return Err(err.with_attempt(attempt));
                }
            }
        }
    }
}

/// A group of mutations applied atomically by [`crate::Client::batch_write`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationGroup(pub Vec<Mutation>);

impl From<Vec<Mutation>> for MutationGroup {
    fn from(mutations: Vec<Mutation>) -> Self {
        MutationGroup(mutations)
    }
}

/// The outcome of the mutation groups at `indexes`.
#[derive(Debug)]
pub struct BatchWriteResult {
    pub indexes: Vec<i32>,
    /// The commit timestamp of the groups, or the reason they were not applied.
    pub status: Result<Option<SystemTime>, Error>,
}

impl From<proto::BatchWriteResponse> for BatchWriteResult {
    fn from(value: proto::BatchWriteResponse) -> Self {
        let status = match value.status {
            Some(status) if status.code != tonic::Code::Ok as i32 => {
                Err(Error::from(status).with_operation("BatchWrite"))
            }
            _ => Ok(value.commit_timestamp.as_ref().and_then(system_time)),
        };
        Self {
            indexes: value.indexes,
            status,
        }
    }
}

/// The per-group outcomes of a batch write, holding on to the session until exhausted or dropped.
pub struct BatchWriteResults {
    // released when the stream is dropped
    _session: PooledSession,
    stream: BatchWriteStream,
}

impl Stream for BatchWriteResults {
    type Item = Result<BatchWriteResult, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream
            .poll_next_unpin(cx)
            .map(|item| item.map(|result| result.map(BatchWriteResult::from)))
    }
}

/// Applies groups of mutations without atomicity across groups; the groups may be applied in any order.
pub(crate) async fn batch_write(
    pool: &SessionPool,
    groups: Vec<MutationGroup>,
    options: RequestOptions,
    exclude_txn_from_change_streams: bool,
) -> Result<BatchWriteResults, Error> {
    let mutation_groups = groups
        .iter()
        .map(|group| {
            to_proto_mutations(&group.0)
                .map(|mutations| proto::batch_write_request::MutationGroup { mutations })
        })
        .collect::<Result<Vec<_>, Error>>()?;
    let mut session = pool.acquire(SessionKind::ReadWrite).await?;
    let mut connection = session.connection();
    let result = connection
        .batch_write(
            proto::BatchWriteRequest {
                session: session.name().to_string(),
                request_options: options.to_proto(None),
                mutation_groups,
                exclude_txn_from_change_streams,
            },
            CallOptions::leader(),
        )
        .await;
    match result {
        Ok(stream) => Ok(BatchWriteResults {
            _session: session,
            stream,
        }),
        Err(err) => {
            if err.is_session_not_found() {
                session.mark_bad();
            }
            Err(err)
        }
    }
}

/// Hints for partitioning a query or read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionOptions {
    /// Desired size of each partition, a hint only.
    pub partition_size_bytes: Option<i64>,
    /// Desired maximum number of partitions, a hint only.
    pub max_partitions: Option<i64>,
    /// Execute the partitions on independent compute resources.
    pub data_boost_enabled: bool,
}

impl From<&PartitionOptions> for proto::PartitionOptions {
    fn from(value: &PartitionOptions) -> Self {
        proto::PartitionOptions {
            partition_size_bytes: value.partition_size_bytes.unwrap_or_default(),
            max_partitions: value.max_partitions.unwrap_or_default(),
        }
    }
}

/// Identifies the transaction of a [`BatchSnapshot`] so that its partitions can be processed elsewhere.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchTransactionId {
    pub session: String,
    pub transaction_id: Vec<u8>,
    pub read_timestamp: Option<SystemTime>,
}

/// A slice of a partitioned query or read, executable independently of the others.
#[derive(Clone, Debug)]
pub struct Partition {
    token: Vec<u8>,
    request: StreamRequest,
}

impl Partition {
    /// The opaque token identifying this partition on the server.
    pub fn token(&self) -> &[u8] {
        &self.token
    }
}

/// A read-only transaction whose queries and reads are split into partitions processed in parallel.
///
/// Partitions are only valid while the transaction is, i.e. as long as the snapshot or any of its re-attached copies
/// are in use.
pub struct BatchSnapshot {
    pool: SessionPool,
    settings: Arc<Settings>,
    id: BatchTransactionId,
    transaction: Option<ReadOnlyTransaction>,
}

impl BatchSnapshot {
    pub(crate) async fn begin(
        pool: SessionPool,
        settings: Arc<Settings>,
        bound: TimestampBound,
    ) -> Result<Self, Error> {
        let session = pool.acquire(SessionKind::ReadOnly).await?;
        let transaction =
            ReadOnlyTransaction::begin(pool.clone(), session, settings.clone(), bound).await?;
        let id = BatchTransactionId {
            session: transaction.session().name().to_string(),
            transaction_id: transaction.id().unwrap_or_default().to_vec(),
            read_timestamp: transaction.read_timestamp(),
        };
        Ok(Self {
            pool,
            settings,
            id,
            transaction: Some(transaction),
        })
    }

    /// Re-attaches to the transaction of a snapshot created elsewhere.
    pub(crate) fn attach(pool: SessionPool, settings: Arc<Settings>, id: BatchTransactionId) -> Self {
        Self {
            pool,
            settings,
            id,
            transaction: None,
        }
    }

    pub fn id(&self) -> &BatchTransactionId {
        &self.id
    }

    pub fn read_timestamp(&self) -> Option<SystemTime> {
        self.id.read_timestamp
    }

    fn selector(&self) -> proto::TransactionSelector {
        TransactionSelector::Id(self.id.transaction_id.clone()).into()
    }

    fn session_ref(&self) -> SessionRef<'_> {
        match &self.transaction {
            Some(transaction) => SessionRef::Borrowed(transaction.session()),
            None => SessionRef::Detached,
        }
    }

    /// Splits a query into partitions. The query must be root-partitionable.
    pub async fn partition_query(
        &self,
        statement: Statement<'_>,
        options: PartitionOptions,
    ) -> Result<Vec<Partition>, Error> {
        let mut request = self
            .settings
            .sql_request(&self.id.session, &statement, None)?;
        request.transaction = Some(self.selector());
        request.data_boost_enabled = options.data_boost_enabled;

        let response = self
            .pool
            .connection()
            .partition_query(
                proto::PartitionQueryRequest {
                    session: self.id.session.clone(),
                    transaction: Some(self.selector()),
                    sql: request.sql.clone(),
                    params: request.params.clone(),
                    param_types: request.param_types.clone(),
                    partition_options: Some((&options).into()),
                },
                CallOptions::default(),
            )
            .await?;
        Ok(response
            .partitions
            .into_iter()
            .map(|partition| {
                let mut request = request.clone();
                request.partition_token = partition.partition_token.clone();
                Partition {
                    token: partition.partition_token,
                    request: StreamRequest::Sql(request),
                }
            })
            .collect())
    }

    /// Splits a read into partitions. Reads with a limit cannot be partitioned.
    pub async fn partition_read(
        &self,
        read: &Read,
        options: PartitionOptions,
    ) -> Result<Vec<Partition>, Error> {
        let mut request = read.to_request(&self.id.session, None);
        request.transaction = Some(self.selector());
        request.data_boost_enabled = options.data_boost_enabled;

        let response = self
            .pool
            .connection()
            .partition_read(
                proto::PartitionReadRequest {
                    session: self.id.session.clone(),
                    transaction: Some(self.selector()),
                    table: request.table.clone(),
                    index: request.index.clone(),
                    columns: request.columns.clone(),
                    key_set: request.key_set.clone(),
                    partition_options: Some((&options).into()),
                },
                CallOptions::default(),
            )
            .await?;
        Ok(response
            .partitions
            .into_iter()
            .map(|partition| {
                let mut request = request.clone();
                request.partition_token = partition.partition_token.clone();
                Partition {
                    token: partition.partition_token,
                    request: StreamRequest::Read(request),
                }
            })
            .collect())
    }

    /// Streams the rows of a single partition.
    pub fn process(&self, partition: &Partition) -> ResultStream<'_> {
        self.settings.stream(
            self.pool.connection(),
            self.session_ref(),
            partition.request.clone(),
            CallOptions::default(),
        )
    }

    /// Reads all rows of a single partition.
    pub async fn execute(&self, partition: &Partition) -> Result<ResultSet, Error> {
        self.process(partition).into_result_set().await
    }
}
