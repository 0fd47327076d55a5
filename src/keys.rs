use crate::proto::google::spanner::v1 as proto;
use crate::{Error, ToSpanner, Value};

use prost_types::ListValue;

/// The primary key (or index key) of a row: one value per key column.
#[derive(Debug, Clone, PartialEq)]
pub struct Key(Vec<Value>);

impl Key {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Builds a key by converting each part with [`ToSpanner`].
    pub fn try_from_parts(parts: &[&(dyn ToSpanner + Sync)]) -> Result<Self, Error> {
        parts
            .iter()
            .map(|part| part.to_spanner())
            .collect::<Result<Vec<Value>, Error>>()
            .map(Key)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl From<Value> for Key {
    fn from(v: Value) -> Self {
        Key(vec![v])
    }
}

impl From<(Value, Value)> for Key {
    fn from(v: (Value, Value)) -> Self {
        let (a, b) = v;
        Key(vec![a, b])
    }
}

impl From<Key> for ListValue {
    fn from(key: Key) -> Self {
        key.0.into_iter().collect()
    }
}

/// One end of a [`KeyRange`].
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    /// The bound's key is part of the range.
    Closed(Key),
    /// The bound's key is excluded from the range.
    Open(Key),
}

/// A range of keys. Keys that are prefixes of the table's full key select every row they prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub start: Bound,
    pub end: Bound,
}

impl KeyRange {
    pub fn new(start: Bound, end: Bound) -> Self {
        Self { start, end }
    }

    /// `[start, end]`
    pub fn closed(start: Key, end: Key) -> Self {
        Self::new(Bound::Closed(start), Bound::Closed(end))
    }

    /// `[start, end)`
    pub fn closed_open(start: Key, end: Key) -> Self {
        Self::new(Bound::Closed(start), Bound::Open(end))
    }
}

impl From<KeyRange> for proto::KeyRange {
    fn from(range: KeyRange) -> Self {
        use proto::key_range::{EndKeyType, StartKeyType};
        proto::KeyRange {
            start_key_type: Some(match range.start {
                Bound::Closed(key) => StartKeyType::StartClosed(key.into()),
                Bound::Open(key) => StartKeyType::StartOpen(key.into()),
            }),
            end_key_type: Some(match range.end {
                Bound::Closed(key) => EndKeyType::EndClosed(key.into()),
                Bound::Open(key) => EndKeyType::EndOpen(key.into()),
            }),
        }
    }
}

/// A set of rows to read or delete, identified by individual keys and key ranges.
///
/// Keys and ranges may overlap, Cloud Spanner only visits each row once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySet {
    keys: Vec<Key>,
    ranges: Vec<KeyRange>,
    all: bool,
}

impl KeySet {
    /// Every row of the table or index.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    pub fn add_key(mut self, key: Key) -> Self {
        self.keys.push(key);
        self
    }

    pub fn add_range(mut self, range: KeyRange) -> Self {
        self.ranges.push(range);
        self
    }
}

impl From<Vec<Key>> for KeySet {
    fn from(keys: Vec<Key>) -> Self {
        Self {
            keys,
            ..Default::default()
        }
    }
}

impl From<KeyRange> for KeySet {
    fn from(range: KeyRange) -> Self {
        Self::default().add_range(range)
    }
}

impl From<KeySet> for proto::KeySet {
    fn from(value: KeySet) -> Self {
        proto::KeySet {
            all: value.all,
            keys: value.keys.into_iter().map(Into::into).collect(),
            ranges: value.ranges.into_iter().map(Into::into).collect(),
        }
    }
}
