use crate::{Error, StructValue, Type, Value};

#[cfg(feature = "numeric")]
use bigdecimal::BigDecimal;
#[cfg(feature = "temporal")]
use chrono::{DateTime, NaiveDate, Utc};

/// Conversion of a Cloud Spanner [`Value`] into a Rust value, used by [`crate::Row::get`].
///
/// Implementations may borrow from the value, e.g.: `&str` or `&[u8]`.
pub trait FromSpanner<'a>: Sized {
    fn from_spanner(tpe: &'a Type, value: &'a Value) -> Result<Self, Error>;

    /// Called instead of `from_spanner` when the value is `NULL`. Only nullable targets accept it.
    fn from_spanner_null(tpe: &Type) -> Result<Self, Error> {
        Err(Error::Codec(format!("unexpected NULL {:?} value", tpe)))
    }

    fn from_spanner_nullable(tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
        if let Value::Null(_) = value {
            Self::from_spanner_null(tpe)
        } else {
            Self::from_spanner(tpe, value)
        }
    }
}

fn mismatch(expected: &str, tpe: &Type) -> Error {
    Error::Codec(format!("cannot read {:?} as {}", tpe, expected))
}

impl<'a, T: FromSpanner<'a>> FromSpanner<'a> for Option<T> {
    fn from_spanner(tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
        T::from_spanner(tpe, value).map(Some)
    }

    fn from_spanner_null(_tpe: &Type) -> Result<Self, Error> {
        Ok(None)
    }
}

impl<'a> FromSpanner<'a> for Value {
    fn from_spanner(_tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
        Ok(value.clone())
    }

    fn from_spanner_null(tpe: &Type) -> Result<Self, Error> {
        Ok(Value::Null(tpe.clone()))
    }
}

impl<'a> FromSpanner<'a> for &'a str {
    fn from_spanner(tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
        match value {
            Value::String(s) => Ok(s.as_str()),
            _ => Err(mismatch("STRING", tpe)),
        }
    }
}

impl<'a> FromSpanner<'a> for &'a [u8] {
    fn from_spanner(tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
        match value {
            Value::Bytes(b) => Ok(b.as_slice()),
            _ => Err(mismatch("BYTES", tpe)),
        }
    }
}

impl<'a> FromSpanner<'a> for &'a StructValue {
    fn from_spanner(tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
        match value {
            Value::Struct(s) => Ok(s),
            _ => Err(mismatch("STRUCT", tpe)),
        }
    }
}

impl<'a> FromSpanner<'a> for f64 {
    fn from_spanner(tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
        match value {
            Value::Float64(f) => Ok(*f),
            _ => Err(mismatch("FLOAT64", tpe)),
        }
    }
}

impl<'a> FromSpanner<'a> for bool {
    fn from_spanner(tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
        match value {
            Value::Bool(b) => Ok(*b),
            _ => Err(mismatch("BOOL", tpe)),
        }
    }
}

// Narrower integers fail when the INT64 does not fit.
macro_rules! from_int64 {
    ($($t:ty),+) => {
        $(
            impl<'a> FromSpanner<'a> for $t {
                fn from_spanner(tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
                    match value {
                        Value::Int64(i) => <$t>::try_from(*i).map_err(|err| {
                            Error::Codec(format!("INT64 {} out of range: {}", i, err))
                        }),
                        _ => Err(mismatch("INT64", tpe)),
                    }
                }
            }
        )+
    };
}

from_int64!(i8, u8, i16, u16, i32, u32, i64, u64);

macro_rules! from_owned {
    ($t:ty, $variant:ident, $name:literal) => {
        impl<'a> FromSpanner<'a> for $t {
            fn from_spanner(tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
                match value {
                    Value::$variant(v) => Ok(v.clone()),
                    _ => Err(mismatch($name, tpe)),
                }
            }
        }
    };
}

from_owned!(String, String, "STRING");
// Vec<u8> reads BYTES, any other Vec<T> reads an ARRAY.
from_owned!(Vec<u8>, Bytes, "BYTES");
#[cfg(feature = "json")]
from_owned!(serde_json::Value, Json, "JSON");
#[cfg(feature = "numeric")]
from_owned!(BigDecimal, Numeric, "NUMERIC");
#[cfg(feature = "temporal")]
from_owned!(DateTime<Utc>, Timestamp, "TIMESTAMP");
#[cfg(feature = "temporal")]
from_owned!(NaiveDate, Date, "DATE");

/// Marker for element types that can be read out of an `ARRAY`.
pub trait FromSpannerElement<'a>: FromSpanner<'a> {}

impl<'a, T: FromSpannerElement<'a>> FromSpanner<'a> for Vec<T> {
    fn from_spanner(tpe: &'a Type, value: &'a Value) -> Result<Self, Error> {
        let (element_type, elements) = match value {
            Value::Array(element_type, elements) => (element_type, elements),
            _ => return Err(mismatch("ARRAY", tpe)),
        };
        elements
            .iter()
            .map(|element| T::from_spanner_nullable(element_type, element))
            .collect()
    }
}

macro_rules! array_elements {
    ($($t:ty),+) => {
        $(impl<'a> FromSpannerElement<'a> for $t {})+
    };
}

array_elements!(i8, i16, u16, i32, u32, i64, u64, bool, f64, String, Vec<u8>);
impl<'a> FromSpannerElement<'a> for &'a str {}
impl<'a> FromSpannerElement<'a> for &'a [u8] {}
impl<'a, T: FromSpannerElement<'a>> FromSpannerElement<'a> for Option<T> {}
#[cfg(feature = "json")]
array_elements!(serde_json::Value);
#[cfg(feature = "numeric")]
array_elements!(BigDecimal);
#[cfg(feature = "temporal")]
array_elements!(DateTime<Utc>, NaiveDate);

#[cfg(test)]
mod test {
    use super::*;

    fn read<'a, T: FromSpanner<'a>>(tpe: &'a Type, value: &'a Value) -> Result<T, Error> {
        T::from_spanner_nullable(tpe, value)
    }

    #[test]
    fn test_integers_check_range() {
        let big = Value::Int64(300);
        assert_eq!(read::<i64>(&Type::Int64, &big).unwrap(), 300);
        assert_eq!(read::<u16>(&Type::Int64, &big).unwrap(), 300);
        assert!(read::<u8>(&Type::Int64, &big).is_err());
        assert!(read::<i8>(&Type::Int64, &big).is_err());

        let negative = Value::Int64(-1);
        assert_eq!(read::<i32>(&Type::Int64, &negative).unwrap(), -1);
        assert!(read::<u64>(&Type::Int64, &negative).is_err());

        let max = Value::Int64(i64::MAX);
        assert_eq!(read::<u64>(&Type::Int64, &max).unwrap(), i64::MAX as u64);
    }

    #[test]
    fn test_wrong_variant_is_rejected() {
        let float = Value::Float64(4.5);
        assert!(read::<i64>(&Type::Float64, &float).is_err());
        assert!(read::<bool>(&Type::Float64, &float).is_err());
        assert!(read::<String>(&Type::Float64, &float).is_err());
        assert_eq!(read::<f64>(&Type::Float64, &float).unwrap(), 4.5);

        let text = Value::String("true".to_string());
        assert!(read::<bool>(&Type::String, &text).is_err());
        assert!(read::<&[u8]>(&Type::String, &text).is_err());
    }

    #[test]
    fn test_null_requires_option() {
        let null = Value::Null(Type::String);
        assert!(read::<String>(&Type::String, &null).is_err());
        assert!(read::<&str>(&Type::String, &null).is_err());
        assert_eq!(read::<Option<&str>>(&Type::String, &null).unwrap(), None);
        assert_eq!(read::<Option<i64>>(&Type::String, &null).unwrap(), None);
        assert_eq!(
            read::<Value>(&Type::String, &null).unwrap(),
            Value::Null(Type::String)
        );
    }

    #[test]
    fn test_borrowed_reads() {
        let name = Value::String("Marc".to_string());
        let borrowed: &str = read(&Type::String, &name).unwrap();
        assert_eq!(borrowed, "Marc");

        let bytes = Value::Bytes(vec![0xca, 0xfe]);
        assert_eq!(read::<&[u8]>(&Type::Bytes, &bytes).unwrap(), &[0xca, 0xfe]);
        assert_eq!(read::<Vec<u8>>(&Type::Bytes, &bytes).unwrap(), vec![0xca, 0xfe]);
    }

    #[test]
    fn test_arrays() {
        let tpe = Type::array(Type::String);
        let titles = Value::Array(
            Type::String,
            vec![
                Value::String("Go, Go, Go".to_string()),
                Value::Null(Type::String),
            ],
        );
        assert_eq!(
            read::<Vec<Option<&str>>>(&tpe, &titles).unwrap(),
            vec![Some("Go, Go, Go"), None]
        );
        assert!(read::<Vec<String>>(&tpe, &titles).is_err());
        assert!(read::<Vec<i64>>(&Type::Int64, &Value::Int64(1)).is_err());
    }
}
