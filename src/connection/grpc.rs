use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use gcp_auth::AuthenticationManager;
use tokio::time::Instant;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::transport::{Channel, ClientTlsConfig};
use tonic::{Request, Response, Status};
use tower::filter::{AsyncFilter, AsyncFilterLayer};
use tower::util::Either;
use tower::ServiceBuilder;

use super::{BatchWriteStream, CallHook, CallOptions, Connection, PartialResultStream};
use crate::auth::AuthFilter;
use crate::proto::google::spanner::v1::{self as proto, spanner_client::SpannerClient};
use crate::retry::retry;
use crate::{Backoff, DatabaseId, Error, RpcMethod, SpannerResource};

const DEFAULT_ENDPOINT: &str = "https://spanner.googleapis.com";
const DEFAULT_DOMAIN: &str = "spanner.googleapis.com";
const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";
const ROUTE_TO_LEADER_HEADER: &str = "x-goog-spanner-route-to-leader";

type Service = Either<AsyncFilter<Channel, AuthFilter>, Channel>;

/// Parameters of a gRPC connection to Cloud Spanner.
pub(crate) struct ConnectOptions {
    pub(crate) endpoint: Option<String>,
    pub(crate) tls: bool,
    pub(crate) auth: Option<AuthenticationManager>,
    pub(crate) database: DatabaseId,
    pub(crate) backoff: Backoff,
    pub(crate) route_to_leader_enabled: bool,
    pub(crate) hooks: Vec<Arc<dyn CallHook>>,
}

/// The per-connection state every call needs, shared by all clones of a connection.
struct CallContext {
    resource_prefix: AsciiMetadataValue,
    route_to_leader_enabled: bool,
    backoff: Backoff,
    hooks: Vec<Arc<dyn CallHook>>,
}

#[derive(Clone)]
struct GrpcConnection {
    database: DatabaseId,
    context: Arc<CallContext>,
    spanner: SpannerClient<Service>,
}

pub(crate) async fn connect(options: ConnectOptions) -> Result<Box<dyn Connection>, Error> {
    let endpoint = options
        .endpoint
        .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
    let channel = Channel::from_shared(endpoint)
        .map_err(|invalid_uri| Error::Config(format!("invalid endpoint: {}", invalid_uri)))?;
    let channel = if options.tls {
        channel.tls_config(ClientTlsConfig::new().domain_name(DEFAULT_DOMAIN))?
    } else {
        channel
    };

    let channel = channel.connect().await?;

    let auth_layer = options
        .auth
        .map(|auth| AsyncFilterLayer::new(AuthFilter::new(auth)));

    let channel = ServiceBuilder::new()
        .option_layer(auth_layer)
        .service(channel);

    let resource_prefix = options.database.id().parse().map_err(|_| {
        Error::Config(format!("invalid database name: {}", options.database.id()))
    })?;

    Ok(Box::new(GrpcConnection {
        database: options.database,
        context: Arc::new(CallContext {
            resource_prefix,
            route_to_leader_enabled: options.route_to_leader_enabled,
            backoff: options.backoff,
            hooks: options.hooks,
        }),
        spanner: SpannerClient::new(channel),
    }))
}

impl CallContext {
    fn prepare<T>(&self, method: RpcMethod, message: T, options: CallOptions) -> Request<T> {
        let mut request = Request::new(message);
        let metadata = request.metadata_mut();
        metadata.insert(RESOURCE_PREFIX_HEADER, self.resource_prefix.clone());
        if options.route_to_leader && self.route_to_leader_enabled {
            metadata.insert(ROUTE_TO_LEADER_HEADER, AsciiMetadataValue::from_static("true"));
        }
        for hook in &self.hooks {
            hook.before(method, metadata);
        }
        request
    }

    fn complete(&self, method: RpcMethod, metadata: &MetadataMap) {
        for hook in &self.hooks {
            hook.after(method, metadata);
        }
    }

    fn finish<T>(
        &self,
        method: RpcMethod,
        result: Result<Response<T>, Status>,
    ) -> Result<T, Error> {
        match result {
            Ok(response) => {
                self.complete(method, response.metadata());
                Ok(response.into_inner())
            }
            Err(status) => {
                self.complete(method, status.metadata());
                Err(status.into())
            }
        }
    }

    /// Issues a unary call, retrying it according to the method's settings until its deadline.
    async fn unary<Req, Resp, F, Fut>(
        &self,
        spanner: SpannerClient<Service>,
        method: RpcMethod,
        message: Req,
        options: CallOptions,
        mut call: F,
    ) -> Result<Resp, Error>
    where
        Req: Clone,
        F: FnMut(SpannerClient<Service>, Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let settings = method.settings();
        let deadline = Instant::now() + settings.timeout;
        retry(&self.backoff, settings.retry_on, deadline, move |remaining| {
            let request = self.prepare(method, message.clone(), options);
            let response = call(spanner.clone(), request);
            async move {
                match tokio::time::timeout(remaining, response).await {
                    Ok(result) => self.finish(method, result),
                    Err(_) => Err(Error::status(
                        tonic::Code::DeadlineExceeded,
                        format!("{} did not complete within {:?}", method.name(), remaining),
                    )),
                }
            }
        })
        .await
        .map_err(|err| err.with_operation(method.name()))
    }

    async fn server_streaming<Req, Resp, F, Fut>(
        &self,
        spanner: SpannerClient<Service>,
        method: RpcMethod,
        message: Req,
        options: CallOptions,
        call: F,
    ) -> Result<tonic::Streaming<Resp>, Error>
    where
        F: FnOnce(SpannerClient<Service>, Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<tonic::Streaming<Resp>>, Status>>,
    {
        let request = self.prepare(method, message, options);
        let result = call(spanner, request).await;
        self.finish(method, result)
            .map_err(|err| err.with_operation(method.name()))
    }
}

#[async_trait]
impl Connection for GrpcConnection {
    fn database(&self) -> &DatabaseId {
        &self.database
    }

    async fn create_session(
        &mut self,
        request: proto::CreateSessionRequest,
        options: CallOptions,
    ) -> Result<proto::Session, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::CreateSession,
            request,
            options,
            |mut spanner, request| async move { spanner.create_session(request).await },
        )
        .await
    }

    async fn batch_create_sessions(
        &mut self,
        request: proto::BatchCreateSessionsRequest,
        options: CallOptions,
    ) -> Result<proto::BatchCreateSessionsResponse, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::BatchCreateSessions,
            request,
            options,
            |mut spanner, request| async move { spanner.batch_create_sessions(request).await },
        )
        .await
    }

    async fn get_session(
        &mut self,
        request: proto::GetSessionRequest,
        options: CallOptions,
    ) -> Result<proto::Session, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::GetSession,
            request,
            options,
            |mut spanner, request| async move { spanner.get_session(request).await },
        )
        .await
    }

    async fn list_sessions(
        &mut self,
        request: proto::ListSessionsRequest,
        options: CallOptions,
    ) -> Result<proto::ListSessionsResponse, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::ListSessions,
            request,
            options,
            |mut spanner, request| async move { spanner.list_sessions(request).await },
        )
        .await
    }

    async fn delete_session(
        &mut self,
        request: proto::DeleteSessionRequest,
        options: CallOptions,
    ) -> Result<(), Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::DeleteSession,
            request,
            options,
            |mut spanner, request| async move { spanner.delete_session(request).await },
        )
        .await
    }

    async fn execute_sql(
        &mut self,
        request: proto::ExecuteSqlRequest,
        options: CallOptions,
    ) -> Result<proto::ResultSet, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::ExecuteSql,
            request,
            options,
            |mut spanner, request| async move { spanner.execute_sql(request).await },
        )
        .await
    }

    async fn execute_streaming_sql(
        &mut self,
        request: proto::ExecuteSqlRequest,
        options: CallOptions,
    ) -> Result<PartialResultStream, Error> {
        let stream = self
            .context
            .server_streaming(
                self.spanner.clone(),
                RpcMethod::ExecuteStreamingSql,
                request,
                options,
                |mut spanner, request| async move { spanner.execute_streaming_sql(request).await },
            )
            .await?;
        Ok(Box::pin(stream.map_err(Error::from)))
    }

    async fn execute_batch_dml(
        &mut self,
        request: proto::ExecuteBatchDmlRequest,
        options: CallOptions,
    ) -> Result<proto::ExecuteBatchDmlResponse, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::ExecuteBatchDml,
            request,
            options,
            |mut spanner, request| async move { spanner.execute_batch_dml(request).await },
        )
        .await
    }

    async fn read(
        &mut self,
        request: proto::ReadRequest,
        options: CallOptions,
    ) -> Result<proto::ResultSet, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::Read,
            request,
            options,
            |mut spanner, request| async move { spanner.read(request).await },
        )
        .await
    }

    async fn streaming_read(
        &mut self,
        request: proto::ReadRequest,
        options: CallOptions,
    ) -> Result<PartialResultStream, Error> {
        let stream = self
            .context
            .server_streaming(
                self.spanner.clone(),
                RpcMethod::StreamingRead,
                request,
                options,
                |mut spanner, request| async move { spanner.streaming_read(request).await },
            )
            .await?;
        Ok(Box::pin(stream.map_err(Error::from)))
    }

    async fn begin_transaction(
        &mut self,
        request: proto::BeginTransactionRequest,
        options: CallOptions,
    ) -> Result<proto::Transaction, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::BeginTransaction,
            request,
            options,
            |mut spanner, request| async move { spanner.begin_transaction(request).await },
        )
        .await
    }

    async fn commit(
        &mut self,
        request: proto::CommitRequest,
        options: CallOptions,
    ) -> Result<proto::CommitResponse, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::Commit,
            request,
            options,
            |mut spanner, request| async move { spanner.commit(request).await },
        )
        .await
    }

    async fn rollback(
        &mut self,
        request: proto::RollbackRequest,
        options: CallOptions,
    ) -> Result<(), Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::Rollback,
            request,
            options,
            |mut spanner, request| async move { spanner.rollback(request).await },
        )
        .await
    }

    async fn partition_query(
        &mut self,
        request: proto::PartitionQueryRequest,
        options: CallOptions,
    ) -> Result<proto::PartitionResponse, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::PartitionQuery,
            request,
            options,
            |mut spanner, request| async move { spanner.partition_query(request).await },
        )
        .await
    }

    async fn partition_read(
        &mut self,
        request: proto::PartitionReadRequest,
        options: CallOptions,
    ) -> Result<proto::PartitionResponse, Error> {
        self.context.unary(
            self.spanner.clone(),
            RpcMethod::PartitionRead,
            request,
            options,
            |mut spanner, request| async move { spanner.partition_read(request).await },
        )
        .await
    }

    async fn batch_write(
        &mut self,
        request: proto::BatchWriteRequest,
        options: CallOptions,
    ) -> Result<BatchWriteStream, Error> {
        let stream = self
            .context
            .server_streaming(
                self.spanner.clone(),
                RpcMethod::BatchWrite,
                request,
                options,
                |mut spanner, request| async move { spanner.batch_write(request).await },
            )
            .await?;
        Ok(Box::pin(stream.map_err(Error::from)))
    }
}
