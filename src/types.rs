use crate::proto::google::spanner::v1 as proto;

/// The Cloud Spanner [`Struct`](https://cloud.google.com/spanner/docs/data-types#struct_type) type which is composed of optionally named fields and their data type.
///
/// The columns of a result set are described by a `StructType`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructType(pub(crate) Vec<(Option<String>, Type)>);

impl StructType {
    /// Creates a new `StructType` with the provided fields.
    ///
    /// Cloud Spanner allows "unnamed" fields: an empty field name becomes `None`.
    pub fn new(fields: Vec<(&str, Type)>) -> Self {
        Self(
            fields
                .into_iter()
                .map(|(name, tpe)| ((!name.is_empty()).then(|| name.to_string()), tpe))
                .collect(),
        )
    }

    pub fn fields(&self) -> &[(Option<String>, Type)] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &Option<String>> {
        self.0.iter().map(|(name, _)| name)
    }

    pub fn types(&self) -> impl Iterator<Item = &Type> {
        self.0.iter().map(|(_, tpe)| tpe)
    }

    /// Returns the index of the first field named `field_name`, ignoring unnamed fields.
    pub fn field_index(&self, field_name: &str) -> Option<usize> {
        self.0
            .iter()
            .position(|(name, _)| name.as_deref() == Some(field_name))
    }
}

impl TryFrom<proto::StructType> for StructType {
    type Error = crate::Error;

    fn try_from(value: proto::StructType) -> Result<Self, Self::Error> {
        StructType::try_from(&value)
    }
}

impl TryFrom<&proto::StructType> for StructType {
    type Error = crate::Error;

    fn try_from(value: &proto::StructType) -> Result<Self, Self::Error> {
        value
            .fields
            .iter()
            .map(|field| {
                let tpe = field.r#type.as_ref().ok_or_else(|| {
                    Self::Error::Codec(format!("field '{}' is missing type", field.name))
                })?;
                let name = (!field.name.is_empty()).then(|| field.name.clone());
                Ok((name, Type::try_from(tpe)?))
            })
            .collect::<Result<Vec<_>, Self::Error>>()
            .map(StructType)
    }
}

impl From<&StructType> for proto::StructType {
    fn from(value: &StructType) -> Self {
        proto::StructType {
            fields: value
                .0
                .iter()
                .map(|(name, tpe)| proto::struct_type::Field {
                    name: name.clone().unwrap_or_default(),
                    r#type: Some(tpe.into()),
                })
                .collect(),
        }
    }
}

/// An enumeration of all Cloud Spanner [data types](https://cloud.google.com/spanner/docs/data-types).
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    /// `BOOL`
    Bool,
    /// `INT64`, transmitted as a decimal string.
    Int64,
    /// `FLOAT64`; `NaN` and the infinities are transmitted as strings.
    Float64,
    /// `STRING`, must be valid UTF-8.
    String,
    /// `BYTES`, transmitted as a base64 string.
    Bytes,
    /// `JSON`, canonicalized by Cloud Spanner before storing.
    #[cfg(feature = "json")]
    Json,
    /// `NUMERIC`, a decimal with 38 digits of precision and 9 digits of scale.
    #[cfg(feature = "numeric")]
    Numeric,
    /// `TIMESTAMP`, nanosecond precision in UTC.
    #[cfg(feature = "temporal")]
    Timestamp,
    /// `DATE`, in the `YYYY-[M]M-[D]D` canonical format.
    #[cfg(feature = "temporal")]
    Date,
    /// `ARRAY` of any type other than `ARRAY`; may contain `NULL` elements.
    Array(
        /// The array's element type.
        Box<Type>,
    ),
    /// `STRUCT`
    Struct(StructType),
}

impl Type {
    /// Creates a new `Type::Array` with elements of the specified type.
    ///
    /// # Panics
    ///
    /// If the provided type is itself an `Type::Array`.
    pub fn array(inner: Type) -> Self {
        if let Type::Array(_) = &inner {
            panic!("array of array is not supported by Cloud Spanner");
        }
        Type::Array(Box::new(inner))
    }

    /// Creates a new `Type::Struct` with the provided field names and types.
    pub fn strct(fields: Vec<(&str, Type)>) -> Self {
        Type::Struct(StructType::new(fields))
    }

    /// Whether a streamed value of this type may be split across two partial result sets.
    pub(crate) fn is_chunkable(&self) -> bool {
        !matches!(self, Type::Bool | Type::Int64 | Type::Float64)
    }

    pub(crate) fn code(&self) -> proto::TypeCode {
        match self {
            Type::Bool => proto::TypeCode::Bool,
            Type::Int64 => proto::TypeCode::Int64,
            Type::Float64 => proto::TypeCode::Float64,
            Type::String => proto::TypeCode::String,
            Type::Bytes => proto::TypeCode::Bytes,
            #[cfg(feature = "json")]
            Type::Json => proto::TypeCode::Json,
            #[cfg(feature = "numeric")]
            Type::Numeric => proto::TypeCode::Numeric,
            #[cfg(feature = "temporal")]
            Type::Timestamp => proto::TypeCode::Timestamp,
            #[cfg(feature = "temporal")]
            Type::Date => proto::TypeCode::Date,
            Type::Array(_) => proto::TypeCode::Array,
            Type::Struct(_) => proto::TypeCode::Struct,
        }
    }
}

/// Scalar types enabled by the current feature set.
fn scalars() -> Vec<Type> {
    let mut scalars = vec![
        Type::Bool,
        Type::Int64,
        Type::Float64,
        Type::String,
        Type::Bytes,
    ];
    #[cfg(feature = "json")]
    scalars.push(Type::Json);
    #[cfg(feature = "numeric")]
    scalars.push(Type::Numeric);
    #[cfg(feature = "temporal")]
    scalars.extend([Type::Timestamp, Type::Date]);
    scalars
}

impl TryFrom<proto::Type> for Type {
    type Error = crate::Error;

    fn try_from(value: proto::Type) -> Result<Self, Self::Error> {
        Type::try_from(&value)
    }
}

impl TryFrom<&proto::Type> for Type {
    type Error = crate::Error;

    fn try_from(value: &proto::Type) -> Result<Self, Self::Error> {
        let code = proto::TypeCode::from_i32(value.code)
            .ok_or_else(|| Self::Error::Codec(format!("unknown type code {}", value.code)))?;
        match code {
            proto::TypeCode::Unspecified => Err(Self::Error::Codec("unspecified type".to_string())),
            proto::TypeCode::Array => {
                let element = value
                    .array_element_type
                    .as_deref()
                    .ok_or_else(|| Self::Error::Codec("missing array element type".to_string()))?;
                Ok(Type::Array(Box::new(Type::try_from(element)?)))
            }
            proto::TypeCode::Struct => {
                let fields = value.struct_type.as_ref().ok_or_else(|| {
                    Self::Error::Codec("missing struct type definition".to_string())
                })?;
                StructType::try_from(fields).map(Type::Struct)
            }
            scalar => scalars()
                .into_iter()
                .find(|tpe| tpe.code() == scalar)
                .ok_or_else(|| {
                    Self::Error::Codec(format!(
                        "{:?} values require enabling the matching crate feature",
                        scalar
                    ))
                }),
        }
    }
}

impl From<&Type> for proto::Type {
    fn from(value: &Type) -> Self {
        let mut tpe = proto::Type {
            code: value.code() as i32,
            array_element_type: None,
            struct_type: None,
        };
        match value {
            Type::Array(inner) => tpe.array_element_type = Some(Box::new(inner.as_ref().into())),
            Type::Struct(strct) => tpe.struct_type = Some(strct.into()),
            _ => {}
        }
        tpe
    }
}

impl From<Type> for proto::Type {
    fn from(value: Type) -> Self {
        From::from(&value)
    }
}
