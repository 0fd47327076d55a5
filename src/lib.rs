//! Cloud Spanner data-plane client built on `tonic`.
//!
//! Requests run on pooled sessions. Read-write work is retried when the
//! server aborts it, and streamed results resume where they stopped after
//! a transient failure.
//!
//! ```no_run
//! use spanner_rs::{Client, Error, ReadContext, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let client = Client::configure()
//!         .project("my-project")
//!         .instance("my-instance")
//!         .database("my-database")
//!         .connect()
//!         .await?;
//!
//!     // Singers(SingerId INT64, FirstName STRING(MAX))
//!     client
//!         .read_write()
//!         .run(|tx| {
//!             Box::pin(async move {
//!                 tx.insert(
//!                     "Singers",
//!                     &["SingerId", "FirstName"],
//!                     vec![vec![Value::Int64(1), Value::String("Marc".to_string())]],
//!                 );
//!                 tx.execute_update(
//!                     "UPDATE Singers SET FirstName = @name WHERE SingerId = @id",
//!                     &[("id", &1), ("name", &"Marcel")],
//!                 )
//!                 .await
//!             })
//!         })
//!         .await?;
//!
//!     let singers = client
//!         .read_only()
//!         .await?
//!         .execute_query("SELECT SingerId, FirstName FROM Singers", &[])
//!         .await?;
//!     for row in singers.iter() {
//!         let id: i64 = row.get("SingerId")?;
//!         let name: Option<&str> = row.get("FirstName")?;
//!         println!("{} {:?}", id, name);
//!     }
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```
//!
//! # Reading
//!
//! Every read carries a [`TimestampBound`]. [`Client::read_only()`] sends each
//! request as its own single-use transaction. [`Client::snapshot()`] begins one
//! transaction whose reads all see the same timestamp. Both implement
//! [`ReadContext`]; large results can be consumed row by row with
//! [`Client::stream_query()`].
//!
//! ```no_run
//! # use spanner_rs::*;
//! # async fn example(client: &Client) -> Result<(), Error> {
//! let mut snapshot = client.snapshot(TimestampBound::Strong).await?;
//! let albums = snapshot
//!     .execute_query("SELECT COUNT(*) AS albums FROM Albums", &[])
//!     .await?;
//! let count: i64 = albums.rows()[0].get("albums")?;
//! # Ok(()) }
//! ```
//!
//! # Writing
//!
//! [`Client::read_write()`] hands a [`TransactionContext`] to a closure.
//! The closure may run several times: when the commit is aborted the whole
//! unit of work is replayed on a fresh transaction after a backoff.
//! [`Client::execute_partitioned_dml()`] applies one statement across the
//! database and returns a lower bound on the rows it touched.
//!
//! Blind writes go through [`Client::batch()`], or [`Client::batch_write()`]
//! when groups of mutations may commit independently.
//! [`Client::batch_snapshot()`] plans partitions of a query or read that can
//! be executed on separate workers.
//!
//! # Sessions and credentials
//!
//! The [`SessionPool`] sized by [`SessionPoolConfig`] creates sessions ahead of
//! demand, pings the idle ones and replaces those the server has forgotten.
//! Credentials come from [`gcp_auth`] unless `SPANNER_EMULATOR_HOST` is set,
//! in which case the client talks to the emulator in plaintext.

pub use crate::batch::{
    BatchSnapshot, BatchTransactionId, BatchWriteResult, BatchWriteResults, MutationBatch,
    MutationGroup, Partition, PartitionOptions,
};
pub use crate::client::Client;
pub use crate::config::{Config, ConfigBuilder, ConfigBuilderError, Credentials, QueryOptions};
pub use crate::connection::{
    BatchWriteStream, CallHook, CallOptions, Connection, PartialResultStream,
};
pub use crate::error::{Error, ErrorKind, ResourceInfo, StatusError};
pub use crate::from_spanner::*;
pub use crate::keys::*;
pub use crate::mutation::{Mutation, Write};
pub use crate::pool::{
    PoolStats, PooledSession, SessionKind, SessionPool, SessionPoolConfig,
    SessionPoolConfigBuilder,
};
pub use crate::resource::*;
pub use crate::result_set::{ResultSet, ResultSetStats, Row, RowCount, RowIndex};
pub use crate::retry::{Backoff, RetrySettings, RpcMethod};
pub use crate::session::Session;
pub use crate::statement::Statement;
pub use crate::stream::{ResultStream, ResumePolicy};
pub use crate::to_spanner::*;
pub use crate::transaction::{
    BatchDmlFailure, BatchDmlResult, BeginMode, CommitResult, IsolationLevel, Priority, Read,
    ReadContext, ReadLockMode, ReadOnlyTransaction, ReadWriteTransaction, RequestOptions,
    TimestampBound, TransactionContext, TransactionOptions,
};
pub use crate::types::*;
pub use crate::value::*;

mod auth;
mod batch;
mod client;
mod config;
mod connection;
mod error;
mod from_spanner;
mod keys;
mod mutation;
mod pool;
pub mod proto;
mod resource;
mod result_set;
mod retry;
mod session;
mod statement;
mod stream;
mod to_spanner;
mod transaction;
mod types;
mod value;
