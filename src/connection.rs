use async_trait::async_trait;
use dyn_clone::DynClone;
use futures::stream::BoxStream;
use tonic::metadata::MetadataMap;

use crate::proto::google::spanner::v1 as proto;
use crate::{DatabaseId, Error, RpcMethod};

/// The frames of a streaming query or read.
pub type PartialResultStream = BoxStream<'static, Result<proto::PartialResultSet, Error>>;

/// The per-group outcomes of a `BatchWrite` call.
pub type BatchWriteStream = BoxStream<'static, Result<proto::BatchWriteResponse, Error>>;

/// Per-call options of a [`Connection`] method.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// The request may mutate data and should be routed to the leader region.
    pub route_to_leader: bool,
}

impl CallOptions {
    pub fn leader() -> Self {
        Self {
            route_to_leader: true,
        }
    }
}

/// A pair of hooks run around every RPC issued by the gRPC connection.
///
/// Hooks run in registration order. `after` receives the response (or error) metadata.
pub trait CallHook: Send + Sync {
    fn before(&self, _method: RpcMethod, _metadata: &mut MetadataMap) {}
    fn after(&self, _method: RpcMethod, _metadata: &MetadataMap) {}
}

/// The Cloud Spanner data plane, one method per RPC.
///
/// The gRPC implementation retries unary calls according to [`RpcMethod::settings`]. Streaming calls are never
/// retried at this level.
#[async_trait]
pub trait Connection
where
    Self: DynClone + Send,
{
    fn database(&self) -> &DatabaseId;

    async fn create_session(
        &mut self,
        request: proto::CreateSessionRequest,
        options: CallOptions,
    ) -> Result<proto::Session, Error>;

    async fn batch_create_sessions(
        &mut self,
        request: proto::BatchCreateSessionsRequest,
        options: CallOptions,
    ) -> Result<proto::BatchCreateSessionsResponse, Error>;

    async fn get_session(
        &mut self,
        request: proto::GetSessionRequest,
        options: CallOptions,
    ) -> Result<proto::Session, Error>;

    async fn list_sessions(
        &mut self,
        request: proto::ListSessionsRequest,
        options: CallOptions,
    ) -> Result<proto::ListSessionsResponse, Error>;

    async fn delete_session(
        &mut self,
        request: proto::DeleteSessionRequest,
        options: CallOptions,
    ) -> Result<(), Error>;

    async fn execute_sql(
        &mut self,
        request: proto::ExecuteSqlRequest,
        options: CallOptions,
    ) -> Result<proto::ResultSet, Error>;

    async fn execute_streaming_sql(
        &mut self,
        request: proto::ExecuteSqlRequest,
        options: CallOptions,
    ) -> Result<PartialResultStream, Error>;

    async fn execute_batch_dml(
        &mut self,
        request: proto::ExecuteBatchDmlRequest,
        options: CallOptions,
    ) -> Result<proto::ExecuteBatchDmlResponse, Error>;

    async fn read(
        &mut self,
        request: proto::ReadRequest,
        options: CallOptions,
    ) -> Result<proto::ResultSet, Error>;

    async fn streaming_read(
        &mut self,
        request: proto::ReadRequest,
        options: CallOptions,
    ) -> Result<PartialResultStream, Error>;

    async fn begin_transaction(
        &mut self,
        request: proto::BeginTransactionRequest,
        options: CallOptions,
    ) -> Result<proto::Transaction, Error>;

    async fn commit(
        &mut self,
        request: proto::CommitRequest,
        options: CallOptions,
    ) -> Result<proto::CommitResponse, Error>;

    async fn rollback(
        &mut self,
        request: proto::RollbackRequest,
        options: CallOptions,
    ) -> Result<(), Error>;

    async fn partition_query(
        &mut self,
        request: proto::PartitionQueryRequest,
        options: CallOptions,
    ) -> Result<proto::PartitionResponse, Error>;

    async fn partition_read(
        &mut self,
        request: proto::PartitionReadRequest,
        options: CallOptions,
    ) -> Result<proto::PartitionResponse, Error>;

    async fn batch_write(
        &mut self,
        request: proto::BatchWriteRequest,
        options: CallOptions,
    ) -> Result<BatchWriteStream, Error>;
}

dyn_clone::clone_trait_object!(Connection);

pub(crate) mod grpc;
