use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::{Error, ErrorKind};

/// Exponential backoff parameters used when retrying RPCs and aborted transactions.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Growth factor applied to the delay after every retry.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            multiplier: 1.3,
            max: Duration::from_secs(32),
        }
    }
}

impl Backoff {
    /// The un-jittered delay before retry number `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let delay = self.initial.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// The delay before retry number `attempt` with half of it randomized.
    pub(crate) fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let half = delay / 2;
        half + half.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    }
}

/// Logical RPCs of the Cloud Spanner data plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    CreateSession,
    BatchCreateSessions,
    GetSession,
    ListSessions,
    DeleteSession,
    ExecuteSql,
    ExecuteStreamingSql,
    ExecuteBatchDml,
    Read,
    StreamingRead,
    BeginTransaction,
    Commit,
    Rollback,
    PartitionQuery,
    PartitionRead,
    BatchWrite,
}

/// Default retry policy of a single RPC.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySettings {
    /// Error kinds retried by the transport itself.
    pub retry_on: &'static [ErrorKind],
    /// Overall deadline of the call, retries included.
    pub timeout: Duration,
}

const UNAVAILABLE: &[ErrorKind] = &[ErrorKind::Unavailable];
const NONE: &[ErrorKind] = &[];

impl RpcMethod {
    pub fn name(&self) -> &'static str {
        match self {
            RpcMethod::CreateSession => "CreateSession",
            RpcMethod::BatchCreateSessions => "BatchCreateSessions",
            RpcMethod::GetSession => "GetSession",
            RpcMethod::ListSessions => "ListSessions",
            RpcMethod::DeleteSession => "DeleteSession",
            RpcMethod::ExecuteSql => "ExecuteSql",
            RpcMethod::ExecuteStreamingSql => "ExecuteStreamingSql",
            RpcMethod::ExecuteBatchDml => "ExecuteBatchDml",
            RpcMethod::Read => "Read",
            RpcMethod::StreamingRead => "StreamingRead",
            RpcMethod::BeginTransaction => "BeginTransaction",
            RpcMethod::Commit => "Commit",
            RpcMethod::Rollback => "Rollback",
            RpcMethod::PartitionQuery => "PartitionQuery",
            RpcMethod::PartitionRead => "PartitionRead",
            RpcMethod::BatchWrite => "BatchWrite",
        }
    }

    pub fn settings(&self) -> RetrySettings {
        let (retry_on, timeout) = match self {
            RpcMethod::CreateSession => (UNAVAILABLE, 30),
            RpcMethod::BatchCreateSessions => (UNAVAILABLE, 60),
            RpcMethod::GetSession => (UNAVAILABLE, 30),
            RpcMethod::ListSessions => (UNAVAILABLE, 3600),
            RpcMethod::DeleteSession => (UNAVAILABLE, 30),
            RpcMethod::ExecuteSql => (UNAVAILABLE, 30),
            RpcMethod::ExecuteBatchDml => (UNAVAILABLE, 30),
            RpcMethod::ExecuteStreamingSql => (NONE, 3600),
            RpcMethod::Read => (UNAVAILABLE, 30),
            RpcMethod::StreamingRead => (NONE, 3600),
            RpcMethod::BeginTransaction => (UNAVAILABLE, 30),
            RpcMethod::Commit => (UNAVAILABLE, 3600),
            RpcMethod::Rollback => (UNAVAILABLE, 30),
            RpcMethod::PartitionQuery => (UNAVAILABLE, 30),
            RpcMethod::PartitionRead => (UNAVAILABLE, 30),
            RpcMethod::BatchWrite => (NONE, 3600),
        };
        RetrySettings {
            retry_on,
            timeout: Duration::from_secs(timeout),
        }
    }
}

/// Runs `op` until it succeeds, fails with an error kind not listed in `retry_on`, or `deadline` passes.
///
/// `op` receives the time left before the deadline.
pub(crate) async fn retry<T, F, Fut>(
    backoff: &Backoff,
    retry_on: &[ErrorKind],
    deadline: Instant,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut(Duration) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::status(
                tonic::Code::DeadlineExceeded,
                "deadline exceeded before the call could be issued",
            ));
        }
        match op(remaining).await {
            Ok(value) => return Ok(value),
            Err(error) if retry_on.contains(&error.kind()) => {
                let delay = backoff.jittered(attempt);
                if Instant::now() + delay >= deadline {
                    return Err(error);
                }
                log::debug!("retrying in {:?} after error: {}", delay, error);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
