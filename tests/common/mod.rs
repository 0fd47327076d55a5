#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use spanner_rs::proto::google::spanner::v1 as proto;
use spanner_rs::{
    BatchWriteStream, CallOptions, Client, Config, Connection, DatabaseId, Error, InstanceId,
    PartialResultStream, SessionPoolConfig, SpannerResource, StructType, Type,
};

pub const COMMIT_SECONDS: i64 = 1_700_000_000;

pub fn status(code: tonic::Code, message: &str) -> Error {
    Error::from(tonic::Status::new(code, message))
}

pub fn string_value(s: &str) -> prost_types::Value {
    prost_types::Value {
        kind: Some(prost_types::value::Kind::StringValue(s.to_string())),
    }
}

pub fn metadata(row_type: &StructType) -> Option<proto::ResultSetMetadata> {
    Some(proto::ResultSetMetadata {
        row_type: Some(row_type.into()),
        transaction: None,
        undeclared_parameters: None,
    })
}

pub fn frame(values: &[&str]) -> proto::PartialResultSet {
    proto::PartialResultSet {
        values: values.iter().map(|v| string_value(v)).collect(),
        ..Default::default()
    }
}

pub fn exact_count(count: i64) -> Option<proto::ResultSetStats> {
    Some(proto::ResultSetStats {
        query_stats: None,
        row_count: Some(proto::result_set_stats::RowCount::RowCountExact(count)),
    })
}

pub fn single_column(name: &str, tpe: Type) -> StructType {
    StructType::new(vec![(name, tpe)])
}

/// A call of a streaming RPC.
#[derive(Clone, Debug)]
pub enum StreamCall {
    Sql(proto::ExecuteSqlRequest),
    Read(proto::ReadRequest),
}

impl StreamCall {
    pub fn session(&self) -> &str {
        match self {
            StreamCall::Sql(request) => &request.session,
            StreamCall::Read(request) => &request.session,
        }
    }

    pub fn resume_token(&self) -> &[u8] {
        match self {
            StreamCall::Sql(request) => &request.resume_token,
            StreamCall::Read(request) => &request.resume_token,
        }
    }

    pub fn transaction(&self) -> Option<&proto::TransactionSelector> {
        match self {
            StreamCall::Sql(request) => request.transaction.as_ref(),
            StreamCall::Read(request) => request.transaction.as_ref(),
        }
    }
}

/// Scripted responses and recorded requests of a [`MockConnection`].
///
/// Calls without a scripted response get a default successful one.
#[derive(Default)]
pub struct MockState {
    pub execute_sql_responses: VecDeque<Result<proto::ResultSet, Error>>,
    pub stream_responses: VecDeque<Vec<Result<proto::PartialResultSet, Error>>>,
    pub batch_dml_responses: VecDeque<Result<proto::ExecuteBatchDmlResponse, Error>>,
    pub commit_responses: VecDeque<Result<proto::CommitResponse, Error>>,
    pub partition_responses: VecDeque<proto::PartitionResponse>,
    pub batch_write_responses: VecDeque<Vec<Result<proto::BatchWriteResponse, Error>>>,
    pub create_session_errors: VecDeque<Error>,
    /// Time every `CreateSession` call takes.
    pub create_session_delay: Option<Duration>,

    pub created: Vec<String>,
    /// `session_count` of every `BatchCreateSessions` call.
    pub batch_creates: Vec<i32>,
    pub deleted: Vec<String>,
    pub execute_sql: Vec<proto::ExecuteSqlRequest>,
    pub streams: Vec<StreamCall>,
    pub batch_dml: Vec<proto::ExecuteBatchDmlRequest>,
    pub begins: Vec<proto::BeginTransactionRequest>,
    pub commits: Vec<proto::CommitRequest>,
    pub rollbacks: Vec<proto::RollbackRequest>,
    pub partition_queries: Vec<proto::PartitionQueryRequest>,
    pub partition_reads: Vec<proto::PartitionReadRequest>,
    pub batch_writes: Vec<proto::BatchWriteRequest>,
    pub leader_calls: usize,

    next_transaction: u64,
}

impl MockState {
    fn new_transaction(&mut self) -> proto::Transaction {
        self.next_transaction += 1;
        proto::Transaction {
            id: format!("tx-{}", self.next_transaction).into_bytes(),
            read_timestamp: Some(prost_types::Timestamp {
                seconds: COMMIT_SECONDS - 1,
                nanos: 0,
            }),
            precommit_token: None,
        }
    }

    /// Returns the transaction begun inline by a selector, if any.
    fn inline_begin(
        &mut self,
        selector: Option<&proto::TransactionSelector>,
    ) -> Option<proto::Transaction> {
        match selector.and_then(|s| s.selector.as_ref()) {
            Some(proto::transaction_selector::Selector::Begin(_)) => Some(self.new_transaction()),
            _ => None,
        }
    }

    fn new_session(&mut self, database: &DatabaseId, multiplexed: bool) -> proto::Session {
        let name = format!("{}/sessions/{}", database.id(), self.created.len() + 1);
        self.created.push(name.clone());
        proto::Session {
            name,
            multiplexed,
            ..Default::default()
        }
    }
}

fn with_transaction(
    metadata: Option<proto::ResultSetMetadata>,
    transaction: Option<proto::Transaction>,
) -> Option<proto::ResultSetMetadata> {
    match transaction {
        Some(transaction) => {
            let mut metadata = metadata.unwrap_or_default();
            if metadata.transaction.is_none() {
                metadata.transaction = Some(transaction);
            }
            Some(metadata)
        }
        None => metadata,
    }
}

#[derive(Clone)]
pub struct MockConnection {
    database: DatabaseId,
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            database: DatabaseId::new(InstanceId::new("test-project", "test-instance"), "test-db"),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock()
    }

    fn record(&self, options: CallOptions) -> MutexGuard<'_, MockState> {
        let mut state = self.state.lock();
        if options.route_to_leader {
            state.leader_calls += 1;
        }
        state
    }
}

pub fn pool_config(max_sessions: usize) -> SessionPoolConfig {
    SessionPoolConfig {
        min_sessions: 0,
        max_sessions,
        target_idle_fraction: 0.0,
        ..Default::default()
    }
}

pub fn client(mock: &MockConnection, pool: SessionPoolConfig) -> Client {
    let _ = env_logger::builder().is_test(true).try_init();
    let config = Config::builder()
        .project("test-project")
        .instance("test-instance")
        .database("test-db")
        .pool(pool)
        .build()
        .unwrap();
    Client::with_connection(Box::new(mock.clone()), &config)
}

#[async_trait]
impl Connection for MockConnection {
    fn database(&self) -> &DatabaseId {
        &self.database
    }

    async fn create_session(
        &mut self,
        request: proto::CreateSessionRequest,
        options: CallOptions,
    ) -> Result<proto::Session, Error> {
        let delay = self.record(options).create_session_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some(err) = state.create_session_errors.pop_front() {
            return Err(err);
        }
        let multiplexed = request.session.map(|s| s.multiplexed).unwrap_or_default();
        Ok(state.new_session(&self.database, multiplexed))
    }

    async fn batch_create_sessions(
        &mut self,
        request: proto::BatchCreateSessionsRequest,
        options: CallOptions,
    ) -> Result<proto::BatchCreateSessionsResponse, Error> {
        let mut state = self.record(options);
        state.batch_creates.push(request.session_count);
        let session = (0..request.session_count)
            .map(|_| state.new_session(&self.database, false))
            .collect();
        Ok(proto::BatchCreateSessionsResponse { session })
    }

    async fn get_session(
        &mut self,
        request: proto::GetSessionRequest,
        _options: CallOptions,
    ) -> Result<proto::Session, Error> {
        let state = self.state.lock();
        if state.created.contains(&request.name) && !state.deleted.contains(&request.name) {
            Ok(proto::Session {
                name: request.name,
                ..Default::default()
            })
        } else {
            Err(status(tonic::Code::NotFound, "Session not found"))
        }
    }

    async fn list_sessions(
        &mut self,
        request: proto::ListSessionsRequest,
        _options: CallOptions,
    ) -> Result<proto::ListSessionsResponse, Error> {
        let state = self.state.lock();
        let alive: Vec<&String> = state
            .created
            .iter()
            .filter(|name| !state.deleted.contains(name))
            .collect();
        let offset: usize = request.page_token.parse().unwrap_or(0);
        let page_size = 2;
        let sessions = alive
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|name| proto::Session {
                name: name.to_string(),
                ..Default::default()
            })
            .collect();
        let next_page_token = if offset + page_size < alive.len() {
            (offset + page_size).to_string()
        } else {
            String::new()
        };
        Ok(proto::ListSessionsResponse {
            sessions,
            next_page_token,
        })
    }

    async fn delete_session(
        &mut self,
        request: proto::DeleteSessionRequest,
        options: CallOptions,
    ) -> Result<(), Error> {
        self.record(options).deleted.push(request.name);
        Ok(())
    }

    async fn execute_sql(
        &mut self,
        request: proto::ExecuteSqlRequest,
        options: CallOptions,
    ) -> Result<proto::ResultSet, Error> {
        let mut state = self.record(options);
        let response = state.execute_sql_responses.pop_front();
        let transaction = state.inline_begin(request.transaction.as_ref());
        state.execute_sql.push(request);
        let mut result_set = match response {
            Some(response) => response?,
            None => proto::ResultSet {
                metadata: metadata(&StructType::default()),
                stats: exact_count(1),
                ..Default::default()
            },
        };
        result_set.metadata = with_transaction(result_set.metadata, transaction);
        Ok(result_set)
    }

    async fn execute_streaming_sql(
        &mut self,
        request: proto::ExecuteSqlRequest,
        options: CallOptions,
    ) -> Result<PartialResultStream, Error> {
        let mut state = self.record(options);
        let transaction = state.inline_begin(request.transaction.as_ref());
        state.streams.push(StreamCall::Sql(request));
        Ok(stream_response(&mut state, transaction))
    }

    async fn execute_batch_dml(
        &mut self,
        request: proto::ExecuteBatchDmlRequest,
        options: CallOptions,
    ) -> Result<proto::ExecuteBatchDmlResponse, Error> {
        let mut state = self.record(options);
        let response = state.batch_dml_responses.pop_front();
        let transaction = state.inline_begin(request.transaction.as_ref());
        let statements = request.statements.len();
        state.batch_dml.push(request);
        let mut response = match response {
            Some(response) => response?,
            None => proto::ExecuteBatchDmlResponse {
                result_sets: (0..statements)
                    .map(|_| proto::ResultSet {
                        stats: exact_count(1),
                        ..Default::default()
                    })
                    .collect(),
                status: None,
                precommit_token: None,
            },
        };
        if let Some(first) = response.result_sets.first_mut() {
            first.metadata = with_transaction(first.metadata.take(), transaction);
        }
        Ok(response)
    }

    async fn read(
        &mut self,
        _request: proto::ReadRequest,
        _options: CallOptions,
    ) -> Result<proto::ResultSet, Error> {
        Err(status(tonic::Code::Unimplemented, "use streaming_read"))
    }

    async fn streaming_read(
        &mut self,
        request: proto::ReadRequest,
        options: CallOptions,
    ) -> Result<PartialResultStream, Error> {
        let mut state = self.record(options);
        let transaction = state.inline_begin(request.transaction.as_ref());
        state.streams.push(StreamCall::Read(request));
        Ok(stream_response(&mut state, transaction))
    }

    async fn begin_transaction(
        &mut self,
        request: proto::BeginTransactionRequest,
        options: CallOptions,
    ) -> Result<proto::Transaction, Error> {
        let mut state = self.record(options);
        state.begins.push(request);
        Ok(state.new_transaction())
    }

    async fn commit(
        &mut self,
        request: proto::CommitRequest,
        options: CallOptions,
    ) -> Result<proto::CommitResponse, Error> {
        let mut state = self.record(options);
        state.commits.push(request);
        match state.commit_responses.pop_front() {
            Some(response) => response,
            None => Ok(proto::CommitResponse {
                commit_timestamp: Some(prost_types::Timestamp {
                    seconds: COMMIT_SECONDS,
                    nanos: 0,
                }),
                ..Default::default()
            }),
        }
    }

    async fn rollback(
        &mut self,
        request: proto::RollbackRequest,
        options: CallOptions,
    ) -> Result<(), Error> {
        self.record(options).rollbacks.push(request);
        Ok(())
    }

    async fn partition_query(
        &mut self,
        request: proto::PartitionQueryRequest,
        options: CallOptions,
    ) -> Result<proto::PartitionResponse, Error> {
        let mut state = self.record(options);
        state.partition_queries.push(request);
        Ok(state.partition_responses.pop_front().unwrap_or_default())
    }

    async fn partition_read(
        &mut self,
        request: proto::PartitionReadRequest,
        options: CallOptions,
    ) -> Result<proto::PartitionResponse, Error> {
        let mut state = self.record(options);
        state.partition_reads.push(request);
        Ok(state.partition_responses.pop_front().unwrap_or_default())
    }

    async fn batch_write(
        &mut self,
        request: proto::BatchWriteRequest,
        options: CallOptions,
    ) -> Result<BatchWriteStream, Error> {
        let mut state = self.record(options);
        state.batch_writes.push(request);
        let responses = state.batch_write_responses.pop_front().unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(responses)))
    }
}

fn stream_response(
    state: &mut MockState,
    transaction: Option<proto::Transaction>,
) -> PartialResultStream {
    let mut frames = state.stream_responses.pop_front().unwrap_or_else(|| {
        vec![Ok(proto::PartialResultSet {
            metadata: metadata(&StructType::default()),
            stats: exact_count(1),
            ..Default::default()
        })]
    });
    if let Some(Ok(first)) = frames.first_mut() {
        if first.metadata.is_some() || transaction.is_some() {
            first.metadata = with_transaction(first.metadata.take(), transaction);
        }
    }
    Box::pin(futures::stream::iter(frames))
}
