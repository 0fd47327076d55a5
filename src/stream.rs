use std::collections::VecDeque;
use std::sync::Arc;
use std::time::SystemTime;

use futures::{Stream, StreamExt};
use prost_types::value::Kind;

use crate::pool::PooledSession;
use crate::proto::google::spanner::v1 as proto;
use crate::result_set::{merge_precommit_token, system_time};
use crate::{
    Backoff, CallOptions, Connection, Error, ErrorKind, PartialResultStream, ResultSet,
    ResultSetStats, Row, StructType, Type, Value,
};

/// Decides which errors interrupting a streaming query or read are retried by resuming the stream.
#[derive(Clone, Debug, PartialEq)]
pub struct ResumePolicy {
    /// Error kinds that resume the stream.
    pub resumable: Vec<ErrorKind>,
    /// Also resume on `Internal` errors caused by a broken HTTP/2 stream.
    pub resume_broken_streams: bool,
    /// Consecutive failures tolerated without receiving a new resume token.
    pub max_attempts_without_progress: u32,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self {
            resumable: vec![ErrorKind::Unavailable],
            resume_broken_streams: true,
            max_attempts_without_progress: 3,
        }
    }
}

impl ResumePolicy {
    pub fn is_resumable(&self, error: &Error) -> bool {
        self.resumable.contains(&error.kind())
            || (self.resume_broken_streams && error.is_broken_stream())
    }
}

/// The request behind a result stream, re-issued when the stream is resumed.
#[derive(Clone, Debug)]
pub(crate) enum StreamRequest {
    Sql(proto::ExecuteSqlRequest),
    Read(proto::ReadRequest),
}

impl StreamRequest {
    fn set_resume_token(&mut self, token: Vec<u8>) {
        match self {
            StreamRequest::Sql(request) => request.resume_token = token,
            StreamRequest::Read(request) => request.resume_token = token,
        }
    }

    fn transaction_mut(&mut self) -> &mut Option<proto::TransactionSelector> {
        match self {
            StreamRequest::Sql(request) => &mut request.transaction,
            StreamRequest::Read(request) => &mut request.transaction,
        }
    }

    async fn open(
        &self,
        connection: &mut dyn Connection,
        options: CallOptions,
    ) -> Result<PartialResultStream, Error> {
        match self {
            StreamRequest::Sql(request) => {
                connection
                    .execute_streaming_sql(request.clone(), options)
                    .await
            }
            StreamRequest::Read(request) => connection.streaming_read(request.clone(), options).await,
        }
    }
}

fn is_chunk(value: &prost_types::Value) -> bool {
    matches!(
        value.kind,
        Some(Kind::StringValue(_)) | Some(Kind::ListValue(_))
    )
}

/// Concatenates the two halves of a value split across partial result sets.
fn merge_chunks(
    tpe: &Type,
    head: prost_types::Value,
    tail: prost_types::Value,
) -> Result<prost_types::Value, Error> {
    let kind = match (head.kind, tail.kind) {
        (Some(Kind::StringValue(mut head)), Some(Kind::StringValue(tail))) => {
            head.push_str(&tail);
            Kind::StringValue(head)
        }
        (Some(Kind::ListValue(mut head)), Some(Kind::ListValue(tail))) => {
            let boundary_type = match tpe {
                Type::Array(element) => element.as_ref().clone(),
                Type::Struct(struct_type) => head
                    .values
                    .len()
                    .checked_sub(1)
                    .and_then(|idx| struct_type.fields().get(idx))
                    .map(|(_, tpe)| tpe.clone())
                    .ok_or_else(|| Error::Codec("chunked struct has too many fields".to_string()))?,
                other => {
                    return Err(Error::Codec(format!(
                        "list chunk received for type {:?}",
                        other
                    )))
                }
            };
            let mut tail = tail.values.into_iter().peekable();
            // a NULL on either side of the boundary is a complete element
            let mergeable = boundary_type.is_chunkable()
                && head.values.last().map_or(false, is_chunk)
                && tail.peek().map_or(false, is_chunk);
            if mergeable {
                if let (Some(last), Some(first)) = (head.values.pop(), tail.next()) {
                    head.values.push(merge_chunks(&boundary_type, last, first)?);
                }
            }
            head.values.extend(tail);
            Kind::ListValue(head)
        }
        (head, tail) => {
            return Err(Error::Codec(format!(
                "cannot merge chunks {:?} and {:?} of type {:?}",
                head, tail, tpe
            )))
        }
    };
    Ok(prost_types::Value { kind: Some(kind) })
}

/// Assembles rows out of the values of consecutive partial result sets.
#[derive(Default)]
struct Decoder {
    row_type: Option<Arc<StructType>>,
    values: Vec<prost_types::Value>,
    chunk: Option<prost_types::Value>,
    rows: VecDeque<Row>,
}

impl Decoder {
    fn push(&mut self, frame: proto::PartialResultSet) -> Result<(), Error> {
        if self.row_type.is_none() {
            let row_type = frame
                .metadata
                .and_then(|metadata| metadata.row_type)
                .ok_or_else(|| Error::Codec("missing result set metadata".to_string()))?;
            self.row_type = Some(Arc::new(StructType::try_from(row_type)?));
        }
        let row_type = match &self.row_type {
            Some(row_type) => row_type.clone(),
            None => return Ok(()),
        };

        let mut incoming = frame.values;
        if let Some(chunk) = self.chunk.take() {
            if incoming.is_empty() {
                incoming.push(chunk);
            } else {
                let tpe = Self::column_type(&row_type, self.values.len())?;
                let tail = incoming.remove(0);
                incoming.insert(0, merge_chunks(tpe, chunk, tail)?);
            }
        }
        if frame.chunked_value {
            self.chunk = incoming.pop();
        }

        if row_type.is_empty() {
            if incoming.is_empty() {
                return Ok(());
            }
            return Err(Error::Codec("values received for an empty row type".to_string()));
        }

        for value in incoming {
            self.values.push(value);
            if self.values.len() == row_type.len() {
                let columns = row_type
                    .types()
                    .zip(self.values.drain(..))
                    .map(|(tpe, value)| Value::try_from(tpe, value))
                    .collect::<Result<Vec<Value>, Error>>()?;
                self.rows.push_back(Row::new(row_type.clone(), columns));
            }
        }
        Ok(())
    }

    fn column_type(row_type: &StructType, idx: usize) -> Result<&Type, Error> {
        row_type
            .fields()
            .get(idx)
            .map(|(_, tpe)| tpe)
            .ok_or_else(|| Error::Codec(format!("no column at index {}", idx)))
    }

    fn is_mid_row(&self) -> bool {
        !self.values.is_empty() || self.chunk.is_some()
    }
}

/// The session a [`ResultStream`] runs in.
pub(crate) enum SessionRef<'a> {
    Owned(PooledSession),
    Borrowed(&'a PooledSession),
    /// A session owned by another process or task, e.g. the one of a re-attached batch transaction.
    Detached,
}

impl<'a> SessionRef<'a> {
    fn mark_bad(&mut self) {
        if let SessionRef::Owned(session) = self {
            session.mark_bad();
        }
    }

    fn name(&self) -> &str {
        match self {
            SessionRef::Owned(session) => session.name(),
            SessionRef::Borrowed(session) => session.name(),
            SessionRef::Detached => "<detached>",
        }
    }
}

/// A lazily decoded stream of rows from `ExecuteStreamingSql` or `StreamingRead`.
///
/// Partial result sets are only decoded once a resume token covers them, so that an interrupted stream can be resumed
/// without delivering a row twice. See [`ResumePolicy`] for which errors are resumed.
pub struct ResultStream<'a> {
    session: SessionRef<'a>,
    connection: Box<dyn Connection>,
    request: StreamRequest,
    options: CallOptions,
    policy: ResumePolicy,
    backoff: Backoff,
    stream: Option<PartialResultStream>,
    pending: Vec<proto::PartialResultSet>,
    decoder: Decoder,
    resume_token: Vec<u8>,
    failures: u32,
    done: bool,
    stats: Option<ResultSetStats>,
    transaction: Option<proto::Transaction>,
    precommit_token: Option<proto::MultiplexedSessionPrecommitToken>,
}

impl<'a> ResultStream<'a> {
    pub(crate) fn new(
        connection: Box<dyn Connection>,
        session: SessionRef<'a>,
        request: StreamRequest,
        options: CallOptions,
        policy: ResumePolicy,
        backoff: Backoff,
    ) -> Self {
        Self {
            session,
            connection,
            request,
            options,
            policy,
            backoff,
            stream: None,
            pending: Vec::new(),
            decoder: Decoder::default(),
            resume_token: Vec::new(),
            failures: 0,
            done: false,
            stats: None,
            transaction: None,
            precommit_token: None,
        }
    }

    /// Returns the next row, or `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Result<Option<Row>, Error> {
        loop {
            if let Some(row) = self.decoder.rows.pop_front() {
                return Ok(Some(row));
            }
            if self.done {
                return Ok(None);
            }
            self.advance().await?;
        }
    }

    async fn advance(&mut self) -> Result<(), Error> {
        let item = match self.stream.as_mut() {
            Some(stream) => stream.next().await,
            None => match self.request.open(self.connection.as_mut(), self.options).await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => Some(Err(err)),
            },
        };
        let result = match item {
            Some(Ok(frame)) => self.on_frame(frame),
            Some(Err(err)) => self.on_error(err).await,
            None => self.on_end(),
        };
        if result.is_err() {
            self.done = true;
            self.stream = None;
        }
        result
    }

    fn on_frame(&mut self, frame: proto::PartialResultSet) -> Result<(), Error> {
        if let Some(transaction) = frame
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.transaction.as_ref())
        {
            if !transaction.id.is_empty() {
                // a restarted request must not begin a second transaction
                *self.request.transaction_mut() = Some(proto::TransactionSelector {
                    selector: Some(proto::transaction_selector::Selector::Id(
                        transaction.id.clone(),
                    )),
                });
            }
            self.transaction = Some(transaction.clone());
        }
        merge_precommit_token(&mut self.precommit_token, frame.precommit_token.clone());
        if let Some(stats) = frame.stats.clone() {
            self.stats = Some(stats.into());
        }

        let resume_token = frame.resume_token.clone();
        let last = frame.last;
        self.pending.push(frame);
        if !resume_token.is_empty() {
            self.resume_token = resume_token;
            self.failures = 0;
            self.release()?;
        }
        if last {
            self.on_end()?;
        }
        Ok(())
    }

    fn release(&mut self) -> Result<(), Error> {
        for frame in self.pending.drain(..) {
            self.decoder.push(frame)?;
        }
        Ok(())
    }

    fn on_end(&mut self) -> Result<(), Error> {
        self.release()?;
        self.done = true;
        self.stream = None;
        if self.decoder.is_mid_row() {
            return Err(Error::Codec(
                "stream ended in the middle of a row".to_string(),
            ));
        }
        Ok(())
    }

    async fn on_error(&mut self, err: Error) -> Result<(), Error> {
        if err.is_session_not_found() {
            self.session.mark_bad();
        }
        if !self.policy.is_resumable(&err) || self.failures >= self.policy.max_attempts_without_progress {
            return Err(err);
        }
        self.stream = None;
        self.pending.clear();
        if self.resume_token.is_empty() {
            log::debug!(
                "restarting stream in session {} without a resume token after: {}",
                self.session.name(),
                err
            );
        } else {
            log::debug!("resuming stream in session {} after: {}", self.session.name(), err);
            self.request.set_resume_token(self.resume_token.clone());
        }
        let delay = self.backoff.jittered(self.failures);
        self.failures += 1;
        tokio::time::sleep(delay).await;
        Ok(())
    }

    /// The columns of the rows, known once the first rows were decoded.
    pub fn row_type(&self) -> Option<&StructType> {
        self.decoder.row_type.as_deref()
    }

    /// Statistics sent by the server with the last part of the result.
    pub fn stats(&self) -> Option<&ResultSetStats> {
        self.stats.as_ref()
    }

    /// The last resume token covering the rows decoded so far.
    pub fn resume_token(&self) -> &[u8] {
        &self.resume_token
    }

    pub fn read_timestamp(&self) -> Option<SystemTime> {
        self.transaction
            .as_ref()
            .and_then(|tx| tx.read_timestamp.as_ref())
            .and_then(system_time)
    }

    pub(crate) fn transaction(&self) -> Option<&proto::Transaction> {
        self.transaction.as_ref()
    }

    pub(crate) fn precommit_token(&self) -> Option<&proto::MultiplexedSessionPrecommitToken> {
        self.precommit_token.as_ref()
    }

    /// Reads the remaining rows into a [`ResultSet`].
    pub async fn into_result_set(mut self) -> Result<ResultSet, Error> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(ResultSet::new(
            self.decoder.row_type.take().unwrap_or_default(),
            rows,
            self.stats.take(),
            self.transaction.take(),
            self.precommit_token.take(),
        ))
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Row, Error>> + 'a {
        futures::stream::try_unfold(self, |mut stream| async move {
            Ok(stream.next().await?.map(|row| (row, stream)))
        })
    }
}
