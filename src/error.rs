use std::fmt;
use std::time::Duration;

use prost::Message;

use crate::proto::google::rpc;

const RETRY_INFO_TYPE: &str = "google.rpc.RetryInfo";
const RESOURCE_INFO_TYPE: &str = "google.rpc.ResourceInfo";
const RETRY_INFO_METADATA_KEY: &str = "google.rpc.retryinfo-bin";
const SESSION_RESOURCE_TYPE: &str = "type.googleapis.com/google.spanner.v1.Session";

// Signatures of an HTTP/2 stream that was torn down under an otherwise healthy RPC.
const BROKEN_STREAM_SIGNATURES: [&str; 3] = [
    "RST_STREAM",
    "Received unexpected EOS on DATA frame from server",
    "error reading a body from connection",
];

/// The kinds of errors surfaced by this client.
///
/// Every [`Error`] maps to exactly one kind, see [`Error::kind()`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Unavailable,
    Aborted,
    /// The session used for the request no longer exists on the server.
    SessionNotFound,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    FailedPrecondition,
    DeadlineExceeded,
    PermissionDenied,
    ResourceExhausted,
    Internal,
    Unknown,
}

impl ErrorKind {
    fn from_code(code: tonic::Code) -> Self {
        match code {
            tonic::Code::Unavailable => ErrorKind::Unavailable,
            tonic::Code::Aborted => ErrorKind::Aborted,
            tonic::Code::NotFound => ErrorKind::NotFound,
            tonic::Code::AlreadyExists => ErrorKind::AlreadyExists,
            tonic::Code::InvalidArgument | tonic::Code::OutOfRange => ErrorKind::InvalidArgument,
            tonic::Code::FailedPrecondition | tonic::Code::Unimplemented => {
                ErrorKind::FailedPrecondition
            }
            tonic::Code::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            tonic::Code::PermissionDenied | tonic::Code::Unauthenticated => {
                ErrorKind::PermissionDenied
            }
            tonic::Code::ResourceExhausted => ErrorKind::ResourceExhausted,
            tonic::Code::Internal | tonic::Code::DataLoss => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        }
    }
}

/// A resource named in a status' details.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceInfo {
    pub resource_type: String,
    pub resource_name: String,
}

/// An error status returned by Cloud Spanner (or synthesized by the client), along with the context it was raised in.
#[derive(Clone, Debug)]
pub struct StatusError {
    kind: ErrorKind,
    code: tonic::Code,
    message: String,
    retry_delay: Option<Duration>,
    resource: Option<ResourceInfo>,
    operation: Option<&'static str>,
    attempt: Option<u32>,
}

impl StatusError {
    pub fn new(code: tonic::Code, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_code(code),
            code,
            message: message.into(),
            retry_delay: None,
            resource: None,
            operation: None,
            attempt: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> tonic::Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The delay the server asked the client to wait before retrying, if any.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }

    pub fn resource(&self) -> Option<&ResourceInfo> {
        self.resource.as_ref()
    }

    /// The name of the operation that produced this error.
    pub fn operation(&self) -> Option<&'static str> {
        self.operation
    }

    /// For transaction errors, the attempt (starting at 1) during which the error occurred.
    pub fn attempt(&self) -> Option<u32> {
        self.attempt
    }

    fn classify(mut self) -> Self {
        if self.code == tonic::Code::NotFound {
            let session_resource = self
                .resource
                .as_ref()
                .map(|info| info.resource_type == SESSION_RESOURCE_TYPE)
                .unwrap_or(false);
            if session_resource || self.message.contains("Session not found") {
                self.kind = ErrorKind::SessionNotFound;
            }
        }
        self
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(operation) = self.operation {
            write!(f, "{}: ", operation)?;
        }
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(attempt) = self.attempt {
            write!(f, " (attempt {})", attempt)?;
        }
        Ok(())
    }
}

impl std::error::Error for StatusError {}

fn decode_retry_delay(bytes: &[u8]) -> Option<Duration> {
    rpc::RetryInfo::decode(bytes)
        .ok()
        .and_then(|info| info.retry_delay)
        .map(|delay| {
            Duration::from_secs(delay.seconds.max(0) as u64)
                + Duration::from_nanos(delay.nanos.max(0) as u64)
        })
}

impl From<tonic::Status> for StatusError {
    fn from(status: tonic::Status) -> Self {
        let mut error = StatusError::new(status.code(), status.message());

        if !status.details().is_empty() {
            if let Ok(details) = rpc::Status::decode(status.details()) {
                for any in details.details {
                    if any.type_url.ends_with(RETRY_INFO_TYPE) {
                        error.retry_delay = decode_retry_delay(&any.value);
                    } else if any.type_url.ends_with(RESOURCE_INFO_TYPE) {
                        error.resource = rpc::ResourceInfo::decode(any.value.as_slice())
                            .ok()
                            .map(|info| ResourceInfo {
                                resource_type: info.resource_type,
                                resource_name: info.resource_name,
                            });
                    }
                }
            }
        }

        if error.retry_delay.is_none() {
            error.retry_delay = status
                .metadata()
                .get_bin(RETRY_INFO_METADATA_KEY)
                .and_then(|value| value.to_bytes().ok())
                .and_then(|bytes| decode_retry_delay(&bytes));
        }

        error.classify()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("spanner client error: {0}")]
    Client(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("authentication error: {0}")]
    Auth(#[from] gcp_auth::Error),

    #[error("{0}")]
    Status(#[from] StatusError),
}

impl Error {
    pub(crate) fn status(code: tonic::Code, message: impl Into<String>) -> Self {
        Error::Status(StatusError::new(code, message))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Status(status) => status.kind(),
            Error::Client(_) => ErrorKind::Unknown,
            Error::Config(_) | Error::Codec(_) => ErrorKind::InvalidArgument,
            Error::TransportError(_) => ErrorKind::Unavailable,
            Error::Auth(_) => ErrorKind::PermissionDenied,
        }
    }

    pub fn status_error(&self) -> Option<&StatusError> {
        match self {
            Error::Status(status) => Some(status),
            _ => None,
        }
    }

    pub fn retry_delay(&self) -> Option<Duration> {
        self.status_error().and_then(StatusError::retry_delay)
    }

    pub fn is_session_not_found(&self) -> bool {
        self.kind() == ErrorKind::SessionNotFound
    }

    /// Returns true when the error is an `Internal` status caused by a broken HTTP/2 stream.
    pub fn is_broken_stream(&self) -> bool {
        match self {
            Error::Status(status) if status.kind() == ErrorKind::Internal => BROKEN_STREAM_SIGNATURES
                .iter()
                .any(|signature| status.message().contains(signature)),
            _ => false,
        }
    }

    /// Attaches the name of the operation to a status error that does not have one yet.
    pub(crate) fn with_operation(mut self, operation: &'static str) -> Self {
        if let Error::Status(status) = &mut self {
            status.operation.get_or_insert(operation);
        }
        self
    }

    pub(crate) fn with_attempt(mut self, attempt: u32) -> Self {
        if let Error::Status(status) = &mut self {
            status.attempt = Some(attempt);
        }
        self
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Status(status.into())
    }
}

impl From<rpc::Status> for Error {
    fn from(status: rpc::Status) -> Self {
        let code = tonic::Code::from_i32(status.code);
        let details = status.encode_to_vec();
        tonic::Status::with_details(code, status.message, details.into()).into()
    }
}
