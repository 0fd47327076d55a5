use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::mutation::to_proto_mutations;
use crate::pool::{spawn, PooledSession, SessionKind, SessionPool};
use crate::proto::google::spanner::v1 as proto;
use crate::result_set::system_time;
use crate::statement::encode_params;
use crate::stream::{ResultStream, SessionRef, StreamRequest};
use crate::{
    Backoff, CallOptions, Connection, Error, ErrorKind, KeySet, Mutation, ResultSet, ResumePolicy,
    Statement, ToSpanner, Value,
};

/// Attempts made on fresh sessions when the server no longer knows the session in use.
const MAX_SESSION_NOT_FOUND_ATTEMPTS: u32 = 3;
/// Commits re-sent because the server asked for a newer precommit token.
const MAX_PRECOMMIT_RETRIES: u32 = 2;
const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Specifies the timestamp or maximum staleness of a read-only transaction.
///
/// See [the Cloud Spanner documentation](https://cloud.google.com/spanner/docs/timestamp-bounds) for details.
#[derive(Clone, Debug, PartialEq)]
pub enum TimestampBound {
    /// Read the effects of every transaction committed before the read started.
    Strong,
    ReadTimestamp(SystemTime),
    /// Read at a timestamp chosen by the server, no older than the given one.
    MinReadTimestamp(SystemTime),
    ExactStaleness(Duration),
    /// Read at a timestamp chosen by the server, at most this stale. Single-use transactions only.
    MaxStaleness(Duration),
}

impl Default for TimestampBound {
    fn default() -> Self {
        TimestampBound::Strong
    }
}

impl From<TimestampBound> for proto::transaction_options::read_only::TimestampBound {
    fn from(value: TimestampBound) -> Self {
        use proto::transaction_options::read_only::TimestampBound as Bound;
        match value {
            TimestampBound::Strong => Bound::Strong(true),
            TimestampBound::ReadTimestamp(timestamp) => Bound::ReadTimestamp(timestamp.into()),
            TimestampBound::MinReadTimestamp(timestamp) => {
                Bound::MinReadTimestamp(timestamp.into())
            }
            TimestampBound::MaxStaleness(duration) => Bound::MaxStaleness(duration.into()),
            TimestampBound::ExactStaleness(duration) => Bound::ExactStaleness(duration.into()),
        }
    }
}

pub(crate) fn read_only_options(
    bound: &TimestampBound,
    return_read_timestamp: bool,
) -> proto::TransactionOptions {
    proto::TransactionOptions {
        mode: Some(proto::transaction_options::Mode::ReadOnly(
            proto::transaction_options::ReadOnly {
                return_read_timestamp,
                timestamp_bound: Some(bound.clone().into()),
            },
        )),
        ..Default::default()
    }
}

/// Isolation level of a read-write transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationLevel {
    Serializable,
    /// Reads see a consistent snapshot, only write-write conflicts abort the transaction.
    RepeatableRead,
}

impl From<IsolationLevel> for proto::transaction_options::IsolationLevel {
    fn from(value: IsolationLevel) -> Self {
        match value {
            IsolationLevel::Serializable => proto::transaction_options::IsolationLevel::Serializable,
            IsolationLevel::RepeatableRead => {
                proto::transaction_options::IsolationLevel::RepeatableRead
            }
        }
    }
}

/// How reads of a serializable read-write transaction take locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadLockMode {
    Pessimistic,
    /// Locks are only validated at commit time.
    Optimistic,
}

impl From<ReadLockMode> for proto::transaction_options::read_write::ReadLockMode {
    fn from(value: ReadLockMode) -> Self {
        use proto::transaction_options::read_write::ReadLockMode as Mode;
        match value {
            ReadLockMode::Pessimistic => Mode::Pessimistic,
            ReadLockMode::Optimistic => Mode::Optimistic,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl From<Priority> for proto::request_options::Priority {
    fn from(value: Priority) -> Self {
        match value {
            Priority::Low => proto::request_options::Priority::Low,
            Priority::Medium => proto::request_options::Priority::Medium,
            Priority::High => proto::request_options::Priority::High,
        }
    }
}

/// Per-request options: priority and a request tag reported in the server's statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub priority: Option<Priority>,
    pub tag: Option<String>,
}

impl RequestOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub(crate) fn to_proto(&self, transaction_tag: Option<&str>) -> Option<proto::RequestOptions> {
        if self.priority.is_none() && self.tag.is_none() && transaction_tag.is_none() {
            return None;
        }
        Some(proto::RequestOptions {
            priority: self
                .priority
                .map(|priority| proto::request_options::Priority::from(priority) as i32)
                .unwrap_or_default(),
            request_tag: self.tag.clone().unwrap_or_default(),
            transaction_tag: transaction_tag.unwrap_or_default().to_string(),
        })
    }
}

/// Options of a read-write transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionOptions {
    pub isolation_level: Option<IsolationLevel>,
    /// Ignored under [`IsolationLevel::RepeatableRead`].
    pub read_lock_mode: Option<ReadLockMode>,
    /// Tag attached to every request of the transaction.
    pub tag: Option<String>,
    /// Priority of the commit request.
    pub commit_priority: Option<Priority>,
    pub exclude_txn_from_change_streams: bool,
    pub return_commit_stats: bool,
    pub max_commit_delay: Option<Duration>,
}

impl TransactionOptions {
    pub(crate) fn to_proto(&self, previous_transaction_id: Vec<u8>) -> proto::TransactionOptions {
        let read_lock_mode = match self.isolation_level {
            Some(IsolationLevel::RepeatableRead) => None,
            _ => self.read_lock_mode,
        };
        proto::TransactionOptions {
            mode: Some(proto::transaction_options::Mode::ReadWrite(
                proto::transaction_options::ReadWrite {
                    read_lock_mode: read_lock_mode
                        .map(|mode| proto::transaction_options::read_write::ReadLockMode::from(mode) as i32)
                        .unwrap_or_default(),
                    multiplexed_session_previous_transaction_id: previous_transaction_id,
                },
            )),
            exclude_txn_from_change_streams: self.exclude_txn_from_change_streams,
            isolation_level: self
                .isolation_level
                .map(|level| proto::transaction_options::IsolationLevel::from(level) as i32)
                .unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum TransactionSelector {
    SingleUse(proto::TransactionOptions),
    Begin(proto::TransactionOptions),
    Id(Vec<u8>),
}

impl From<TransactionSelector> for proto::TransactionSelector {
    fn from(value: TransactionSelector) -> Self {
        use proto::transaction_selector::Selector;
        let selector = match value {
            TransactionSelector::SingleUse(options) => Selector::SingleUse(options),
            TransactionSelector::Begin(options) => Selector::Begin(options),
            TransactionSelector::Id(id) => Selector::Id(id),
        };
        proto::TransactionSelector {
            selector: Some(selector),
        }
    }
}

/// How a read-write transaction obtained, or will obtain, its id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeginMode {
    /// No statement was sent yet.
    NotStarted,
    /// The transaction is begun by its first statement.
    Inline,
    /// The transaction was begun with a `BeginTransaction` call.
    Explicit,
}

/// Client-wide settings shared by every transaction.
pub(crate) struct Settings {
    pub(crate) backoff: Backoff,
    pub(crate) resume: ResumePolicy,
    pub(crate) query_options: Option<proto::execute_sql_request::QueryOptions>,
}

impl Settings {
    pub(crate) fn stream<'a>(
        &self,
        connection: Box<dyn Connection>,
        session: SessionRef<'a>,
        request: StreamRequest,
        options: CallOptions,
    ) -> ResultStream<'a> {
        ResultStream::new(
            connection,
            session,
            request,
            options,
            self.resume.clone(),
            self.backoff.clone(),
        )
    }

    pub(crate) fn sql_request(
        &self,
        session: &str,
        statement: &Statement<'_>,
        request_options: Option<proto::RequestOptions>,
    ) -> Result<proto::ExecuteSqlRequest, Error> {
        let (params, param_types) = encode_params(statement.params)?;
        Ok(proto::ExecuteSqlRequest {
            session: session.to_string(),
            sql: statement.sql.to_string(),
            params,
            param_types,
            query_options: self.query_options.clone(),
            request_options,
            ..Default::default()
        })
    }
}

/// The parameters of a read of rows by key.
#[derive(Clone, Debug, PartialEq)]
pub struct Read {
    pub table: String,
    /// Read through this secondary index instead of the primary key.
    pub index: Option<String>,
    pub columns: Vec<String>,
    pub key_set: KeySet,
    pub limit: Option<i64>,
}

impl Read {
    pub fn new(table: &str, columns: &[&str], key_set: KeySet) -> Self {
        Self {
            table: table.to_string(),
            index: None,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            key_set,
            limit: None,
        }
    }

    pub fn index(mut self, index: &str) -> Self {
        self.index = Some(index.to_string());
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn to_request(
        &self,
        session: &str,
        request_options: Option<proto::RequestOptions>,
    ) -> proto::ReadRequest {
        proto::ReadRequest {
            session: session.to_string(),
            table: self.table.clone(),
            index: self.index.clone().unwrap_or_default(),
            columns: self.columns.clone(),
            key_set: Some(self.key_set.clone().into()),
            limit: self.limit.unwrap_or_default(),
            request_options,
            ..Default::default()
        }
    }
}

/// Reading operations available in read-only and read-write transactions.
#[async_trait]
pub trait ReadContext: Send {
    /// Runs a query and reads all of its rows.
    ///
    /// ```no_run
    /// # use spanner_rs::*;
    /// # async fn example(client: &Client) -> Result<(), Error> {
    /// let mut tx = client.read_only().await?;
    /// let result_set = tx
    ///     .execute_query("SELECT name FROM person WHERE id = @id", &[("id", &42)])
    ///     .await?;
    /// # Ok(()) }
    /// ```
    async fn execute_query(
        &mut self,
        sql: &str,
        params: &[(&str, &(dyn ToSpanner + Sync))],
    ) -> Result<ResultSet, Error> {
        self.execute_query_with(Statement::new(sql, params), RequestOptions::default())
            .await
    }

    async fn execute_query_with(
        &mut self,
        statement: Statement<'_>,
        options: RequestOptions,
    ) -> Result<ResultSet, Error>;

    /// Reads the given columns of the rows identified by `key_set`.
    async fn read(
        &mut self,
        table: &str,
        key_set: KeySet,
        columns: &[&str],
    ) -> Result<ResultSet, Error> {
        self.read_with(Read::new(table, columns, key_set), RequestOptions::default())
            .await
    }

    async fn read_with(&mut self, read: Read, options: RequestOptions) -> Result<ResultSet, Error>;
}

/// A read-only transaction.
///
/// A single-use transaction runs every request in its own transaction with the same [`TimestampBound`],
/// consecutive reads are not guaranteed to observe the same data. A multi-use transaction (see [`crate::Client::snapshot`])
/// is begun explicitly and all of its reads happen at the same timestamp.
pub struct ReadOnlyTransaction {
    pool: SessionPool,
    session: PooledSession,
    settings: Arc<Settings>,
    bound: TimestampBound,
    return_read_timestamp: bool,
    transaction: Option<proto::Transaction>,
    read_timestamp: Option<SystemTime>,
}

impl ReadOnlyTransaction {
    pub(crate) fn single_use(
        pool: SessionPool,
        session: PooledSession,
        settings: Arc<Settings>,
        bound: TimestampBound,
    ) -> Self {
        Self {
            pool,
            session,
            settings,
            bound,
            return_read_timestamp: false,
            transaction: None,
            read_timestamp: None,
        }
    }

    pub(crate) async fn begin(
        pool: SessionPool,
        mut session: PooledSession,
        settings: Arc<Settings>,
        bound: TimestampBound,
    ) -> Result<Self, Error> {
        let mut connection = session.connection();
        let result = connection
            .begin_transaction(
                proto::BeginTransactionRequest {
                    session: session.name().to_string(),
                    options: Some(read_only_options(&bound, true)),
                    ..Default::default()
                },
                CallOptions::default(),
            )
            .await;
        let transaction = match result {
            Ok(transaction) => transaction,
            Err(err) => {
                if err.is_session_not_found() {
                    session.mark_bad();
                }
                return Err(err);
            }
        };
        session.touch();
        Ok(Self {
            pool,
            session,
            settings,
            bound,
            return_read_timestamp: true,
            read_timestamp: transaction.read_timestamp.as_ref().and_then(system_time),
            transaction: Some(transaction),
        })
    }

    /// Also return the timestamp single-use reads were done at, see [`ReadOnlyTransaction::read_timestamp`].
    pub fn return_read_timestamp(mut self, enabled: bool) -> Self {
        self.return_read_timestamp = enabled || self.transaction.is_some();
        self
    }

    pub fn bound(&self) -> &TimestampBound {
        &self.bound
    }

    pub fn is_multi_use(&self) -> bool {
        self.transaction.is_some()
    }

    /// The id of a multi-use transaction.
    pub fn id(&self) -> Option<&[u8]> {
        self.transaction.as_ref().map(|tx| tx.id.as_slice())
    }

    /// The timestamp of a multi-use transaction, or of the last single-use read when requested.
    pub fn read_timestamp(&self) -> Option<SystemTime> {
        self.read_timestamp
    }

    pub(crate) fn session(&self) -> &PooledSession {
        &self.session
    }

    fn selector(&self) -> proto::TransactionSelector {
        match &self.transaction {
            Some(tx) => TransactionSelector::Id(tx.id.clone()).into(),
            None => TransactionSelector::SingleUse(read_only_options(
                &self.bound,
                self.return_read_timestamp,
            ))
            .into(),
        }
    }

    /// Streams the rows of a query instead of reading them all in memory.
    pub fn stream_query(
        &self,
        statement: Statement<'_>,
        options: RequestOptions,
    ) -> Result<ResultStream<'_>, Error> {
        let mut request =
            self.settings
                .sql_request(self.session.name(), &statement, options.to_proto(None))?;
        request.transaction = Some(self.selector());
        Ok(self.settings.stream(
            self.session.connection(),
            SessionRef::Borrowed(&self.session),
            StreamRequest::Sql(request),
            CallOptions::default(),
        ))
    }

    pub fn stream_read(&self, read: &Read, options: RequestOptions) -> ResultStream<'_> {
        let mut request = read.to_request(self.session.name(), options.to_proto(None));
        request.transaction = Some(self.selector());
        self.settings.stream(
            self.session.connection(),
            SessionRef::Borrowed(&self.session),
            StreamRequest::Read(request),
            CallOptions::default(),
        )
    }

    /// Handles the outcome of a single-use request: a lost session is replaced and the request retried.
    async fn complete(
        &mut self,
        result: Result<ResultSet, Error>,
        attempt: u32,
    ) -> Result<Option<ResultSet>, Error> {
        match result {
            Ok(result_set) => {
                self.session.touch();
                if let Some(timestamp) = result_set.read_timestamp() {
                    self.read_timestamp = Some(timestamp);
                }
                Ok(Some(result_set))
            }
            Err(err) if err.is_session_not_found() => {
                self.session.mark_bad();
                if self.transaction.is_some() || attempt + 1 >= MAX_SESSION_NOT_FOUND_ATTEMPTS {
                    return Err(err);
                }
                log::debug!("session {} was lost, retrying on a new one", self.session.name());
                self.session = self.pool.acquire(SessionKind::ReadOnly).await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl ReadContext for ReadOnlyTransaction {
    async fn execute_query_with(
        &mut self,
        statement: Statement<'_>,
        options: RequestOptions,
    ) -> Result<ResultSet, Error> {
        let mut attempt = 0;
        loop {
            let result = match self.stream_query(statement, options.clone()) {
                Ok(stream) => stream.into_result_set().await,
                Err(err) => Err(err),
            };
            if let Some(result_set) = self.complete(result, attempt).await? {
                return Ok(result_set);
            }
            attempt += 1;
        }
    }

    async fn read_with(&mut self, read: Read, options: RequestOptions) -> Result<ResultSet, Error> {
        let mut attempt = 0;
        loop {
            let result = self
                .stream_read(&read, options.clone())
                .into_result_set()
                .await;
            if let Some(result_set) = self.complete(result, attempt).await? {
                return Ok(result_set);
            }
            attempt += 1;
        }
    }
}

/// The outcome of a batch of DML statements.
///
/// Statements run in order and stop at the first failure.
#[derive(Debug)]
pub struct BatchDmlResult {
    /// The number of rows modified by each successful statement.
    pub row_counts: Vec<i64>,
    pub failure: Option<BatchDmlFailure>,
}

#[derive(Debug)]
pub struct BatchDmlFailure {
    /// Index of the statement that failed.
    pub index: usize,
    pub error: Error,
}

impl BatchDmlResult {
    /// Fails with the error of the first failed statement, if any.
    pub fn into_result(self) -> Result<Vec<i64>, Error> {
        match self.failure {
            Some(failure) => Err(failure.error),
            None => Ok(self.row_counts),
        }
    }
}

/// A read-write transaction handed to the closure given to [`ReadWriteTransaction::run`].
///
/// The transaction is begun by its first statement. Mutations are buffered and sent with the commit.
pub struct TransactionContext {
    session: PooledSession,
    connection: Box<dyn Connection>,
    settings: Arc<Settings>,
    options: TransactionOptions,
    begin_mode: BeginMode,
    id: Option<Vec<u8>>,
    previous_id: Vec<u8>,
    mutations: Vec<Mutation>,
    seqno: i64,
    precommit_token: Option<proto::MultiplexedSessionPrecommitToken>,
    finished: bool,
}

impl TransactionContext {
    pub(crate) fn new(
        session: PooledSession,
        settings: Arc<Settings>,
        options: TransactionOptions,
        previous_id: Vec<u8>,
    ) -> Self {
        let connection = session.connection();
        Self {
            session,
            connection,
            settings,
            options,
            begin_mode: BeginMode::NotStarted,
            id: None,
            previous_id,
            mutations: Vec::new(),
            seqno: 0,
            precommit_token: None,
            finished: false,
        }
    }

    pub fn id(&self) -> Option<&[u8]> {
        self.id.as_deref()
    }

    pub fn begin_mode(&self) -> BeginMode {
        self.begin_mode
    }

    pub fn session_name(&self) -> &str {
        self.session.name()
    }

    /// The mutations buffered so far, in the order they will be applied.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn buffer(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn buffer_all<I: IntoIterator<Item = Mutation>>(&mut self, mutations: I) {
        self.mutations.extend(mutations);
    }

    pub fn insert(&mut self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.buffer(Mutation::insert(table, columns, rows));
    }

    pub fn update(&mut self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.buffer(Mutation::update(table, columns, rows));
    }

    pub fn insert_or_update(&mut self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.buffer(Mutation::insert_or_update(table, columns, rows));
    }

    pub fn replace(&mut self, table: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.buffer(Mutation::replace(table, columns, rows));
    }

    pub fn delete(&mut self, table: &str, key_set: KeySet) {
        self.buffer(Mutation::delete(table, key_set));
    }

    fn next_seqno(&mut self) -> i64 {
        let seqno = self.seqno;
        self.seqno += 1;
        seqno
    }

    fn request_options(&self, options: &RequestOptions) -> Option<proto::RequestOptions> {
        options.to_proto(self.options.tag.as_deref())
    }

    fn on_error(&mut self, err: Error) -> Error {
        if err.is_session_not_found() {
            self.session.mark_bad();
        }
        err
    }

    fn on_transaction(&mut self, transaction: Option<&proto::Transaction>) {
        if let Some(transaction) = transaction {
            if self.id.is_none() && !transaction.id.is_empty() {
                self.id = Some(transaction.id.clone());
            }
            crate::result_set::merge_precommit_token(
                &mut self.precommit_token,
                transaction.precommit_token.clone(),
            );
        }
    }

    fn on_result_set(&mut self, result_set: &ResultSet) {
        self.session.touch();
        self.on_transaction(result_set.transaction.as_ref());
        crate::result_set::merge_precommit_token(
            &mut self.precommit_token,
            result_set.precommit_token.clone(),
        );
    }

    async fn begin(&mut self, mutation_key: Option<proto::Mutation>) -> Result<Vec<u8>, Error> {
        let request = proto::BeginTransactionRequest {
            session: self.session.name().to_string(),
            options: Some(self.options.to_proto(self.previous_id.clone())),
            request_options: self.request_options(&RequestOptions::default()),
            mutation_key,
        };
        let result = self
            .connection
            .begin_transaction(request, CallOptions::leader())
            .await;
        let transaction = result.map_err(|err| self.on_error(err))?;
        self.begin_mode = BeginMode::Explicit;
        self.id = Some(transaction.id.clone());
        self.on_transaction(Some(&transaction));
        Ok(transaction.id)
    }

    /// Selects the transaction of the next statement, beginning it inline with the first one.
    async fn selector(&mut self) -> Result<proto::TransactionSelector, Error> {
        if let Some(id) = &self.id {
            return Ok(TransactionSelector::Id(id.clone()).into());
        }
        match self.begin_mode {
            BeginMode::NotStarted => {
                self.begin_mode = BeginMode::Inline;
                Ok(TransactionSelector::Begin(self.options.to_proto(self.previous_id.clone())).into())
            }
            // the statement that should have begun the transaction failed
            BeginMode::Inline | BeginMode::Explicit => {
                let id = self.begin(None).await?;
                Ok(TransactionSelector::Id(id).into())
            }
        }
    }

    /// Executes a DML statement and returns the number of modified rows.
    pub async fn execute_update(
        &mut self,
        sql: &str,
        params: &[(&str, &(dyn ToSpanner + Sync))],
    ) -> Result<i64, Error> {
        self.execute_update_with(Statement::new(sql, params), RequestOptions::default())
            .await
    }

    pub async fn execute_update_with(
        &mut self,
        statement: Statement<'_>,
        options: RequestOptions,
    ) -> Result<i64, Error> {
        let mut request = self.settings.sql_request(
            self.session.name(),
            &statement,
            self.request_options(&options),
        )?;
        request.transaction = Some(self.selector().await?);
        request.seqno = self.next_seqno();
        let result = self
            .connection
            .execute_sql(request, CallOptions::leader())
            .await;
        let result_set = ResultSet::try_from(result.map_err(|err| self.on_error(err))?)?;
        self.on_result_set(&result_set);
        result_set
            .row_count()
            .ok_or_else(|| Error::Codec("DML statement did not return a row count".to_string()))
    }

    /// Executes DML statements in a single round trip.
    ///
    /// A statement failing with `Aborted` fails the whole call so that the transaction can be retried. Other failures
    /// are reported in [`BatchDmlResult::failure`] along with the row counts of the statements that preceded it.
    pub async fn execute_updates(
        &mut self,
        statements: &[Statement<'_>],
    ) -> Result<BatchDmlResult, Error> {
        self.execute_updates_with(statements, RequestOptions::default())
            .await
    }

    pub async fn execute_updates_with(
        &mut self,
        statements: &[Statement<'_>],
        options: RequestOptions,
    ) -> Result<BatchDmlResult, Error> {
        let statements = statements
            .iter()
            .map(proto::execute_batch_dml_request::Statement::try_from)
            .collect::<Result<Vec<_>, Error>>()?;
        let request = proto::ExecuteBatchDmlRequest {
            session: self.session.name().to_string(),
            transaction: Some(self.selector().await?),
            statements,
            seqno: self.next_seqno(),
            request_options: self.request_options(&options),
            last_statements: false,
        };
        let result = self
            .connection
            .execute_batch_dml(request, CallOptions::leader())
            .await;
        let response = result.map_err(|err| self.on_error(err))?;
        crate::result_set::merge_precommit_token(
            &mut self.precommit_token,
            response.precommit_token,
        );

        let mut row_counts = Vec::with_capacity(response.result_sets.len());
        for result_set in response.result_sets {
            let result_set = ResultSet::try_from(result_set)?;
            self.on_result_set(&result_set);
            row_counts.push(result_set.row_count().unwrap_or_default());
        }
        let failure = match response.status {
            Some(status) if status.code != tonic::Code::Ok as i32 => {
                let error = self.on_error(Error::from(status).with_operation("ExecuteBatchDml"));
                if error.kind() == ErrorKind::Aborted {
                    return Err(error);
                }
                Some(BatchDmlFailure {
                    index: row_counts.len(),
                    error,
                })
            }
            _ => None,
        };
        Ok(BatchDmlResult {
            row_counts,
            failure,
        })
    }

    /// Commits the transaction, returning `None` when there was nothing to commit.
    pub(crate) async fn commit(&mut self) -> Result<Option<proto::CommitResponse>, Error> {
        let mutations = to_proto_mutations(&self.mutations)?;
        let id = match &self.id {
            Some(id) => id.clone(),
            None if mutations.is_empty() => {
                self.finished = true;
                return Ok(None);
            }
            None => {
                let mutation_key = mutations
                    .first()
                    .filter(|_| self.session.multiplexed())
                    .cloned();
                self.begin(mutation_key).await?
            }
        };

        let mut request = proto::CommitRequest {
            session: self.session.name().to_string(),
            transaction: Some(proto::commit_request::Transaction::TransactionId(id)),
            mutations,
            return_commit_stats: self.options.return_commit_stats,
            request_options: RequestOptions {
                priority: self.options.commit_priority,
                tag: None,
            }
            .to_proto(self.options.tag.as_deref()),
            max_commit_delay: self.options.max_commit_delay.map(Into::into),
            precommit_token: self.precommit_token.clone(),
        };
        for _ in 0..=MAX_PRECOMMIT_RETRIES {
            let result = self
                .connection
                .commit(request.clone(), CallOptions::leader())
                .await;
            let response = result.map_err(|err| self.on_error(err))?;
            match response.multiplexed_session_retry {
                Some(proto::commit_response::MultiplexedSessionRetry::PrecommitToken(token)) => {
                    log::debug!("commit returned precommit token {}, committing again", token.seq_num);
                    request.precommit_token = Some(token);
                }
                None => {
                    self.finished = true;
                    return Ok(Some(response));
                }
            }
        }
        Err(Error::Client(
            "commit did not complete after retrying with new precommit tokens".to_string(),
        ))
    }

    /// Rolls back the transaction if it was begun, ignoring failures.
    pub(crate) async fn rollback(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Some(id) = self.id.clone() {
            let request = proto::RollbackRequest {
                session: self.session.name().to_string(),
                transaction_id: id,
            };
            if let Err(err) = self.connection.rollback(request, CallOptions::leader()).await {
                log::debug!("failed to roll back transaction: {}", err);
            }
        }
    }

    /// An aborted transaction must not be rolled back.
    fn abandon(&mut self) {
        self.finished = true;
    }
}

impl Drop for TransactionContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(id) = self.id.take() {
            let mut connection = self.connection.clone();
            let request = proto::RollbackRequest {
                session: self.session.name().to_string(),
                transaction_id: id,
            };
            spawn(async move {
                if let Err(err) = connection.rollback(request, CallOptions::leader()).await {
                    log::debug!("failed to roll back abandoned transaction: {}", err);
                }
            });
        }
    }
}

#[async_trait]
impl ReadContext for TransactionContext {
    async fn execute_query_with(
        &mut self,
        statement: Statement<'_>,
        options: RequestOptions,
    ) -> Result<ResultSet, Error> {
        let mut request = self.settings.sql_request(
            self.session.name(),
            &statement,
            self.request_options(&options),
        )?;
        request.transaction = Some(self.selector().await?);
        request.seqno = self.next_seqno();
        let result = self
            .settings
            .stream(
                self.connection.clone(),
                SessionRef::Borrowed(&self.session),
                StreamRequest::Sql(request),
                CallOptions::leader(),
            )
            .into_result_set()
            .await;
        let result_set = result.map_err(|err| self.on_error(err))?;
        self.on_result_set(&result_set);
        Ok(result_set)
    }

    async fn read_with(&mut self, read: Read, options: RequestOptions) -> Result<ResultSet, Error> {
        let mut request = read.to_request(self.session.name(), self.request_options(&options));
        request.transaction = Some(self.selector().await?);
        let result = self
            .settings
            .stream(
                self.connection.clone(),
                SessionRef::Borrowed(&self.session),
                StreamRequest::Read(request),
                CallOptions::leader(),
            )
            .into_result_set()
            .await;
        let result_set = result.map_err(|err| self.on_error(err))?;
        self.on_result_set(&result_set);
        Ok(result_set)
    }
}

/// The outcome of a committed read-write transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitResult<T> {
    /// The value returned by the last attempt of the transaction's closure.
    pub value: T,
    /// `None` when the transaction neither wrote nor read anything.
    pub commit_timestamp: Option<SystemTime>,
    pub mutation_count: Option<i64>,
    pub attempts: u32,
}

impl<T> CommitResult<T> {
    pub(crate) fn new(value: T, response: Option<proto::CommitResponse>, attempts: u32) -> Self {
        let (commit_timestamp, mutation_count) = match response {
            Some(response) => (
                response.commit_timestamp.as_ref().and_then(system_time),
                response.commit_stats.map(|stats| stats.mutation_count),
            ),
            None => (None, None),
        };
        Self {
            value,
            commit_timestamp,
            mutation_count,
            attempts,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Runs read-write transactions, retrying them when Cloud Spanner aborts them.
///
/// Obtained with [`crate::Client::read_write`].
pub struct ReadWriteTransaction {
    pool: SessionPool,
    settings: Arc<Settings>,
    options: TransactionOptions,
    timeout: Duration,
}

impl ReadWriteTransaction {
    pub(crate) fn new(pool: SessionPool, settings: Arc<Settings>) -> Self {
        Self {
            pool,
            settings,
            options: TransactionOptions::default(),
            timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }

    pub fn options(mut self, options: TransactionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.options.tag = Some(tag.to_string());
        self
    }

    pub fn isolation_level(mut self, isolation_level: IsolationLevel) -> Self {
        self.options.isolation_level = Some(isolation_level);
        self
    }

    pub fn read_lock_mode(mut self, read_lock_mode: ReadLockMode) -> Self {
        self.options.read_lock_mode = Some(read_lock_mode);
        self
    }

    /// Time allowed for all attempts of the transaction, including the wait for a session.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs `work` in a transaction and commits it.
    ///
    /// `work` is invoked again, on a fresh transaction, every time the transaction is aborted: it must not have side
    /// effects outside of the transaction.
    ///
    /// ```no_run
    /// # use spanner_rs::*;
    /// # async fn example(client: &Client) -> Result<(), Error> {
    /// let result = client
    ///     .read_write()
    ///     .run(|tx| {
    ///         Box::pin(async move {
    ///             let rs = tx.execute_query("SELECT id FROM person", &[]).await?;
    ///             tx.execute_update("DELETE FROM person WHERE TRUE", &[]).await?;
    ///             Ok(rs.rows().len())
    ///         })
    ///     })
    ///     .await?;
    /// println!("deleted {} people at {:?}", result.value, result.commit_timestamp);
    /// # Ok(()) }
    /// ```
    pub async fn run<T, F>(&self, mut work: F) -> Result<CommitResult<T>, Error>
    where
        F: for<'tx> FnMut(&'tx mut TransactionContext) -> BoxFuture<'tx, Result<T, Error>>,
        T: Send,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0;
        let mut lost_sessions = 0;
        let mut previous_id = Vec::new();
        loop {
            attempt += 1;
            let session = self
                .pool
                .acquire_until(SessionKind::ReadWrite, deadline)
                .await
                .map_err(|err| err.with_attempt(attempt))?;
            let mut tx = TransactionContext::new(
                session,
                self.settings.clone(),
                self.options.clone(),
                std::mem::take(&mut previous_id),
            );
            let result = match work(&mut tx).await {
                Ok(value) => tx.commit().await.map(|response| (value, response)),
                Err(err) => Err(err),
            };
            let err = match result {
                Ok((value, response)) => return Ok(CommitResult::new(value, response, attempt)),
                Err(err) => err,
            };

            if err.kind() == ErrorKind::Aborted {
                tx.abandon();
                let delay = err
                    .retry_delay()
                    .unwrap_or_default()
                    .max(self.settings.backoff.jittered(attempt - 1));
                if Instant::now() + delay >= deadline {
                    return Err(err.with_attempt(attempt));
                }
                if tx.session.multiplexed() {
                    previous_id = tx.id.clone().unwrap_or_default();
                }
                log::debug!(
                    "transaction aborted on attempt {}, retrying in {:?}",
                    attempt,
                    delay
                );
                drop(tx);
                tokio::time::sleep(delay).await;
            } else if err.is_session_not_found() && lost_sessions + 1 < MAX_SESSION_NOT_FOUND_ATTEMPTS {
                tx.session.mark_bad();
                tx.abandon();
                lost_sessions += 1;
                log::debug!("session {} was lost, retrying the transaction", tx.session_name());
            } else {
                tx.rollback().await;
                return Err(err.with_attempt(attempt));
            }
        }
    }
}

/// Runs a statement as partitioned DML and returns a lower bound of the number of modified rows.
///
/// The statement is not retried: partitioned DML may have been applied to some partitions when it fails.
pub(crate) async fn execute_partitioned_dml(
    pool: &SessionPool,
    settings: &Settings,
    statement: Statement<'_>,
    options: RequestOptions,
) -> Result<i64, Error> {
    let mut session = pool.acquire(SessionKind::ReadWrite).await?;
    let mut connection = session.connection();
    let result = async {
        let mut request =
            settings.sql_request(session.name(), &statement, options.to_proto(None))?;
        let transaction = connection
            .begin_transaction(
                proto::BeginTransactionRequest {
                    session: session.name().to_string(),
                    options: Some(proto::TransactionOptions {
                        mode: Some(proto::transaction_options::Mode::PartitionedDml(
                            proto::transaction_options::PartitionedDml {},
                        )),
                        ..Default::default()
                    }),
                    request_options: options.to_proto(None),
                    mutation_key: None,
                },
                CallOptions::leader(),
            )
            .await?;
        request.transaction = Some(TransactionSelector::Id(transaction.id).into());
        settings
            .stream(
                connection.clone(),
                SessionRef::Borrowed(&session),
                StreamRequest::Sql(request),
                CallOptions::leader(),
            )
            .into_result_set()
            .await
    }
    .await;

    match result {
        Ok(result_set) => {
            session.touch();
            result_set.row_count().ok_or_else(|| {
                Error::Codec("partitioned DML did not return a row count".to_string())
            })
        }
        Err(err) => {
            if err.is_session_not_found() {
                session.mark_bad();
            }
            Err(err)
        }
    }
}
