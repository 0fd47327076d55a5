use crate::proto::google::spanner::v1 as proto;
use crate::{Error, KeySet, ToSpanner, Value};

/// The rows written by an insert, update, insert-or-update or replace mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub table: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Write {
    fn new(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    fn single_row(table: &str, values: &[(&str, &(dyn ToSpanner + Sync))]) -> Result<Self, Error> {
        let row = values
            .iter()
            .map(|(_, value)| value.to_spanner())
            .collect::<Result<Vec<Value>, Error>>()?;
        let columns: Vec<&str> = values.iter().map(|(column, _)| *column).collect();
        Ok(Self::new(table, &columns, vec![row]))
    }
}

/// A write buffered by a transaction or a batch and applied atomically at commit time.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Fails with `AlreadyExists` if any row already exists.
    Insert(Write),
    /// Fails with `NotFound` if any row does not exist.
    Update(Write),
    InsertOrUpdate(Write),
    /// Like `InsertOrUpdate`, but columns that are not written are set to `NULL`.
    Replace(Write),
    Delete { table: String, key_set: KeySet },
}

impl Mutation {
    pub fn insert(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Mutation::Insert(Write::new(table, columns, rows))
    }

    pub fn update(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Mutation::Update(Write::new(table, columns, rows))
    }

    pub fn insert_or_update(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Mutation::InsertOrUpdate(Write::new(table, columns, rows))
    }

    pub fn replace(table: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        Mutation::Replace(Write::new(table, columns, rows))
    }

    pub fn delete(table: &str, key_set: KeySet) -> Self {
        Mutation::Delete {
            table: table.to_string(),
            key_set,
        }
    }

    /// A single-row insert from `(column, value)` pairs.
    pub fn insert_row(table: &str, values: &[(&str, &(dyn ToSpanner + Sync))]) -> Result<Self, Error> {
        Write::single_row(table, values).map(Mutation::Insert)
    }

    pub fn update_row(table: &str, values: &[(&str, &(dyn ToSpanner + Sync))]) -> Result<Self, Error> {
        Write::single_row(table, values).map(Mutation::Update)
    }

    pub fn insert_or_update_row(
        table: &str,
        values: &[(&str, &(dyn ToSpanner + Sync))],
    ) -> Result<Self, Error> {
        Write::single_row(table, values).map(Mutation::InsertOrUpdate)
    }

    pub fn replace_row(table: &str, values: &[(&str, &(dyn ToSpanner + Sync))]) -> Result<Self, Error> {
        Write::single_row(table, values).map(Mutation::Replace)
    }

    pub fn table(&self) -> &str {
        match self {
            Mutation::Insert(write)
            | Mutation::Update(write)
            | Mutation::InsertOrUpdate(write)
            | Mutation::Replace(write) => &write.table,
            Mutation::Delete { table, .. } => table,
        }
    }
}

impl TryFrom<Write> for proto::mutation::Write {
    type Error = Error;

    fn try_from(write: Write) -> Result<Self, Self::Error> {
        if let Some(row) = write.rows.iter().find(|row| row.len() != write.columns.len()) {
            return Err(Error::Codec(format!(
                "mutation on table {} has {} columns but a row has {} values",
                write.table,
                write.columns.len(),
                row.len()
            )));
        }
        Ok(proto::mutation::Write {
            table: write.table,
            columns: write.columns,
            values: write
                .rows
                .into_iter()
                .map(|row| row.into_iter().collect())
                .collect(),
        })
    }
}

impl TryFrom<Mutation> for proto::Mutation {
    type Error = Error;

    fn try_from(mutation: Mutation) -> Result<Self, Self::Error> {
        use proto::mutation::Operation;
        let operation = match mutation {
            Mutation::Insert(write) => Operation::Insert(write.try_into()?),
            Mutation::Update(write) => Operation::Update(write.try_into()?),
            Mutation::InsertOrUpdate(write) => Operation::InsertOrUpdate(write.try_into()?),
            Mutation::Replace(write) => Operation::Replace(write.try_into()?),
            Mutation::Delete { table, key_set } => Operation::Delete(proto::mutation::Delete {
                table,
                key_set: Some(key_set.into()),
            }),
        };
        Ok(proto::Mutation {
            operation: Some(operation),
        })
    }
}

pub(crate) fn to_proto_mutations(mutations: &[Mutation]) -> Result<Vec<proto::Mutation>, Error> {
    mutations.iter().cloned().map(proto::Mutation::try_from).collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Key;

    #[test]
    fn test_insert_row() {
        let mutation =
            Mutation::insert_row("Singers", &[("SingerId", &1i64), ("Name", &"Alice")]).unwrap();
        assert_eq!(mutation.table(), "Singers");
        let proto = proto::Mutation::try_from(mutation).unwrap();
        match proto.operation {
            Some(proto::mutation::Operation::Insert(write)) => {
                assert_eq!(write.table, "Singers");
                assert_eq!(write.columns, vec!["SingerId", "Name"]);
                assert_eq!(write.values.len(), 1);
                assert_eq!(write.values[0].values.len(), 2);
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }

    #[test]
    fn test_delete() {
        let mutation = Mutation::delete("Singers", KeySet::from(vec![Key::from(Value::Int64(1))]));
        let proto = proto::Mutation::try_from(mutation).unwrap();
        assert!(matches!(
            proto.operation,
            Some(proto::mutation::Operation::Delete(proto::mutation::Delete { ref table, key_set: Some(_) })) if table == "Singers"
        ));
    }

    #[test]
    fn test_row_width_mismatch() {
        let mutation = Mutation::update(
            "Singers",
            &["SingerId", "Name"],
            vec![vec![Value::Int64(1)]],
        );
        assert!(proto::Mutation::try_from(mutation).is_err());
    }

    #[test]
    fn test_order_preserved() {
        let mutations = vec![
            Mutation::insert("A", &["x"], vec![vec![Value::Int64(1)]]),
            Mutation::replace("B", &["x"], vec![vec![Value::Int64(2)]]),
            Mutation::delete("C", KeySet::all()),
        ];
        let protos = to_proto_mutations(&mutations).unwrap();
        let kinds: Vec<&str> = protos
            .iter()
            .map(|m| match m.operation {
                Some(proto::mutation::Operation::Insert(_)) => "insert",
                Some(proto::mutation::Operation::Replace(_)) => "replace",
                Some(proto::mutation::Operation::Delete(_)) => "delete",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["insert", "replace", "delete"]);
    }
}
