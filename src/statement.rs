use std::collections::HashMap;

use crate::proto::google::spanner::v1 as proto;
use crate::{Error, ToSpanner};
#[cfg(doc)]
use crate::TransactionContext;

/// A SQL statement and its named parameters.
///
/// Used for queries and for the batches of DML statements sent with [`TransactionContext::execute_updates`].
#[derive(Clone, Copy)]
pub struct Statement<'a> {
    pub sql: &'a str,
    pub params: &'a [(&'a str, &'a (dyn ToSpanner + Sync))],
}

impl<'a> Statement<'a> {
    pub fn new(sql: &'a str, params: &'a [(&'a str, &'a (dyn ToSpanner + Sync))]) -> Self {
        Self { sql, params }
    }
}

impl<'a> From<&'a str> for Statement<'a> {
    fn from(sql: &'a str) -> Self {
        Self { sql, params: &[] }
    }
}

/// Parameters encoded for the wire: the values and their declared types.
pub(crate) type EncodedParams = (Option<prost_types::Struct>, HashMap<String, proto::Type>);

pub(crate) fn encode_params(
    params: &[(&str, &(dyn ToSpanner + Sync))],
) -> Result<EncodedParams, Error> {
    if params.is_empty() {
        return Ok((None, HashMap::new()));
    }
    let mut fields = std::collections::BTreeMap::new();
    let mut param_types = HashMap::new();
    for (name, value) in params {
        let value = value.to_spanner()?;
        param_types.insert(name.to_string(), value.spanner_type().into());
        fields.insert(name.to_string(), value.into());
    }
    Ok((Some(prost_types::Struct { fields }), param_types))
}

impl<'a> TryFrom<&Statement<'a>> for proto::execute_batch_dml_request::Statement {
    type Error = Error;

    fn try_from(value: &Statement) -> Result<Self, Self::Error> {
        let (params, param_types) = encode_params(value.params)?;
        Ok(proto::execute_batch_dml_request::Statement {
            sql: value.sql.to_string(),
            params,
            param_types,
        })
    }
}
