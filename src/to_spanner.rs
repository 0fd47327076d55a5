use crate::{Error, Type, Value};

#[cfg(feature = "numeric")]
use bigdecimal::BigDecimal;
#[cfg(feature = "temporal")]
use chrono::{DateTime, NaiveDate, Utc};

/// Conversion of a Rust value into a Cloud Spanner [`Value`], used for statement parameters and mutations.
pub trait ToSpanner {
    fn to_spanner(&self) -> Result<Value, Error>;
}

/// Rust types that always map to the same Cloud Spanner type.
///
/// This is required to encode `NULL`s and empty arrays, which must carry their type.
pub trait SpannerType {
    fn spanner_type() -> Type;
}

impl ToSpanner for Value {
    fn to_spanner(&self) -> Result<Value, Error> {
        Ok(self.clone())
    }
}

impl<T> ToSpanner for Option<T>
where
    T: ToSpanner + SpannerType,
{
    fn to_spanner(&self) -> Result<Value, Error> {
        match self.as_ref() {
            Some(v) => v.to_spanner(),
            None => Ok(Value::Null(T::spanner_type())),
        }
    }
}

impl<T: SpannerType> SpannerType for Option<T> {
    fn spanner_type() -> Type {
        T::spanner_type()
    }
}

impl<T> ToSpanner for Vec<T>
where
    T: ToSpanner + SpannerType,
{
    fn to_spanner(&self) -> Result<Value, Error> {
        self.iter()
            .map(ToSpanner::to_spanner)
            .collect::<Result<Vec<Value>, Error>>()
            .map(|values| Value::Array(T::spanner_type(), values))
    }
}

impl<T: SpannerType> SpannerType for Vec<T> {
    fn spanner_type() -> Type {
        Type::array(T::spanner_type())
    }
}

impl<T: ToSpanner + ?Sized> ToSpanner for &T {
    fn to_spanner(&self) -> Result<Value, Error> {
        (*self).to_spanner()
    }
}

macro_rules! simple_to {
    ($t:ty, $v:ident, $self:ident, $into:expr) => {
        impl ToSpanner for $t {
            fn to_spanner(&self) -> Result<Value, Error> {
                let $self = self;
                Ok(Value::$v($into))
            }
        }

        impl SpannerType for $t {
            fn spanner_type() -> Type {
                Type::$v
            }
        }
    };
    ($t:ty, i64_from) => {
        simple_to!($t, Int64, v, i64::from(*v));
    };
    ($t:ty, $v:ident, clone) => {
        simple_to!($t, $v, v, v.clone());
    };
}

simple_to!(i8, i64_from);
simple_to!(i16, i64_from);
simple_to!(u16, i64_from);
simple_to!(i32, i64_from);
simple_to!(u32, i64_from);
simple_to!(i64, i64_from);
simple_to!(f32, Float64, v, f64::from(*v));
simple_to!(f64, Float64, v, *v);
simple_to!(bool, Bool, v, *v);
simple_to!(String, String, clone);
simple_to!(str, String, v, v.to_string());
simple_to!([u8], Bytes, v, v.to_vec());
#[cfg(feature = "json")]
simple_to!(serde_json::Value, Json, clone);
#[cfg(feature = "numeric")]
simple_to!(BigDecimal, Numeric, clone);
#[cfg(feature = "temporal")]
simple_to!(DateTime<Utc>, Timestamp, v, *v);
#[cfg(feature = "temporal")]
simple_to!(NaiveDate, Date, v, *v);

// u8 has no SpannerType so that Vec<u8> is BYTES rather than ARRAY<INT64>.
impl ToSpanner for u8 {
    fn to_spanner(&self) -> Result<Value, Error> {
        Ok(Value::Int64(i64::from(*self)))
    }
}

impl ToSpanner for Vec<u8> {
    fn to_spanner(&self) -> Result<Value, Error> {
        Ok(Value::Bytes(self.clone()))
    }
}

impl SpannerType for Vec<u8> {
    fn spanner_type() -> Type {
        Type::Bytes
    }
}

impl ToSpanner for u64 {
    fn to_spanner(&self) -> Result<Value, Error> {
        i64::try_from(*self)
            .map(Value::Int64)
            .map_err(|_| Error::Codec(format!("{} does not fit in an Int64", self)))
    }
}

impl SpannerType for u64 {
    fn spanner_type() -> Type {
        Type::Int64
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_scalars() {
        assert_eq!(42u8.to_spanner().unwrap(), Value::Int64(42));
        assert_eq!((-42i32).to_spanner().unwrap(), Value::Int64(-42));
        assert_eq!(1.5f64.to_spanner().unwrap(), Value::Float64(1.5));
        assert_eq!(true.to_spanner().unwrap(), Value::Bool(true));
        assert_eq!("ferris".to_spanner().unwrap(), Value::String("ferris".into()));
        assert_eq!(
            vec![1u8, 2].to_spanner().unwrap(),
            Value::Bytes(vec![1, 2])
        );
        assert!(u64::MAX.to_spanner().is_err());
    }

    #[test]
    fn test_option_and_array() {
        assert_eq!(
            None::<String>.to_spanner().unwrap(),
            Value::Null(Type::String)
        );
        assert_eq!(Some(7i64).to_spanner().unwrap(), Value::Int64(7));
        assert_eq!(
            Vec::<i64>::new().to_spanner().unwrap(),
            Value::Array(Type::Int64, vec![])
        );
        assert_eq!(
            vec![Some(1i64), None].to_spanner().unwrap(),
            Value::Array(Type::Int64, vec![Value::Int64(1), Value::Null(Type::Int64)])
        );
    }
}
