use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::proto::google::spanner::v1 as proto;
use crate::{Error, FromSpanner, StructType, Value};

/// Identifies a column of a [`Row`], either by position or by name.
pub trait RowIndex {
    fn index(&self, row_type: &StructType) -> Option<usize>;
}

impl RowIndex for usize {
    fn index(&self, row_type: &StructType) -> Option<usize> {
        (*self < row_type.len()).then(|| *self)
    }
}

impl RowIndex for &str {
    fn index(&self, row_type: &StructType) -> Option<usize> {
        row_type.field_index(self)
    }
}

/// A row of a query or read result.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    row_type: Arc<StructType>,
    columns: Vec<Value>,
}

impl Row {
    pub(crate) fn new(row_type: Arc<StructType>, columns: Vec<Value>) -> Self {
        Self { row_type, columns }
    }

    pub fn row_type(&self) -> &StructType {
        &self.row_type
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.columns
    }

    pub fn value<R: RowIndex>(&self, column: R) -> Option<&Value> {
        column
            .index(&self.row_type)
            .and_then(|idx| self.columns.get(idx))
    }

    /// Converts the value of a column using [`FromSpanner`].
    ///
    /// ```no_run
    /// # fn example(row: &spanner_rs::Row) -> Result<(), spanner_rs::Error> {
    /// let id: i64 = row.get("id")?;
    /// let name: Option<&str> = row.get(1)?;
    /// # Ok(()) }
    /// ```
    pub fn get<'a, T, R>(&'a self, column: R) -> Result<T, Error>
    where
        T: FromSpanner<'a>,
        R: RowIndex,
    {
        let idx = column
            .index(&self.row_type)
            .ok_or_else(|| Error::Codec("no such column".to_string()))?;
        let (_, tpe) = &self.row_type.fields()[idx];
        let value = self
            .columns
            .get(idx)
            .ok_or_else(|| Error::Codec(format!("row has no value for column {}", idx)))?;
        T::from_spanner_nullable(tpe, value)
    }
}

/// The number of rows modified by a DML statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowCount {
    Exact(i64),
    /// Partitioned DML only reports a lower bound.
    LowerBound(i64),
}

/// Statistics returned with the last part of a result.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSetStats {
    pub row_count: Option<RowCount>,
    /// The query plan statistics, present when the query was profiled.
    pub query_stats: Option<prost_types::Struct>,
}

impl From<proto::ResultSetStats> for ResultSetStats {
    fn from(value: proto::ResultSetStats) -> Self {
        use proto::result_set_stats::RowCount as ProtoRowCount;
        Self {
            row_count: value.row_count.map(|count| match count {
                ProtoRowCount::RowCountExact(count) => RowCount::Exact(count),
                ProtoRowCount::RowCountLowerBound(count) => RowCount::LowerBound(count),
            }),
            query_stats: value.query_stats,
        }
    }
}

pub(crate) fn system_time(timestamp: &prost_types::Timestamp) -> Option<SystemTime> {
    let seconds = u64::try_from(timestamp.seconds).ok()?;
    let nanos = u32::try_from(timestamp.nanos).ok()?;
    UNIX_EPOCH.checked_add(Duration::new(seconds, nanos))
}

/// Keeps the precommit token with the highest sequence number.
pub(crate) fn merge_precommit_token(
    current: &mut Option<proto::MultiplexedSessionPrecommitToken>,
    token: Option<proto::MultiplexedSessionPrecommitToken>,
) {
    if let Some(token) = token {
        if current
            .as_ref()
            .map_or(true, |current| token.seq_num > current.seq_num)
        {
            *current = Some(token);
        }
    }
}

/// A fully materialized result.
#[derive(Clone, Debug, Default)]
pub struct ResultSet {
    row_type: Arc<StructType>,
    rows: Vec<Row>,
    stats: Option<ResultSetStats>,
    pub(crate) transaction: Option<proto::Transaction>,
    pub(crate) precommit_token: Option<proto::MultiplexedSessionPrecommitToken>,
}

impl ResultSet {
    pub(crate) fn new(
        row_type: Arc<StructType>,
        rows: Vec<Row>,
        stats: Option<ResultSetStats>,
        transaction: Option<proto::Transaction>,
        precommit_token: Option<proto::MultiplexedSessionPrecommitToken>,
    ) -> Self {
        Self {
            row_type,
            rows,
            stats,
            transaction,
            precommit_token,
        }
    }

    pub fn row_type(&self) -> &StructType {
        &self.row_type
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn stats(&self) -> Option<&ResultSetStats> {
        self.stats.as_ref()
    }

    /// The number of rows modified by a DML statement, if this is the result of one.
    pub fn row_count(&self) -> Option<i64> {
        self.stats
            .as_ref()
            .and_then(|stats| stats.row_count)
            .map(|count| match count {
                RowCount::Exact(count) | RowCount::LowerBound(count) => count,
            })
    }

    /// The read timestamp of the transaction, when it was requested.
    pub fn read_timestamp(&self) -> Option<SystemTime> {
        self.transaction
            .as_ref()
            .and_then(|tx| tx.read_timestamp.as_ref())
            .and_then(system_time)
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

impl TryFrom<proto::ResultSet> for ResultSet {
    type Error = Error;

    fn try_from(value: proto::ResultSet) -> Result<Self, Self::Error> {
        let (row_type, transaction) = match value.metadata {
            Some(metadata) => (
                metadata
                    .row_type
                    .map(StructType::try_from)
                    .transpose()?
                    .unwrap_or_default(),
                metadata.transaction,
            ),
            None => (StructType::default(), None),
        };
        let row_type = Arc::new(row_type);

        let rows = value
            .rows
            .into_iter()
            .map(|row| {
                if row.values.len() != row_type.len() {
                    return Err(Error::Codec(format!(
                        "row has {} values, expected {}",
                        row.values.len(),
                        row_type.len()
                    )));
                }
                row_type
                    .types()
                    .zip(row.values)
                    .map(|(tpe, value)| Value::try_from(tpe, value))
                    .collect::<Result<Vec<Value>, Error>>()
                    .map(|columns| Row::new(row_type.clone(), columns))
            })
            .collect::<Result<Vec<Row>, Error>>()?;

        Ok(Self {
            row_type,
            rows,
            stats: value.stats.map(Into::into),
            transaction,
            precommit_token: value.precommit_token,
        })
    }
}
