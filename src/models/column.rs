//! Column type tags reported alongside result sets.

use serde::{Serialize, Serializer};

/// Inferred type of a result column.
///
/// Numeric codes match the driver-adapter catalogue consumed by ORM-style callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int32,
    Int64,
    Float,
    Double,
    Numeric,
    Boolean,
    Character,
    Text,
    Date,
    Time,
    DateTime,
    Json,
    Enum,
    Bytes,
    Set,
    Uuid,
    Int32Array,
    Int64Array,
    FloatArray,
    DoubleArray,
    NumericArray,
    BooleanArray,
    CharacterArray,
    TextArray,
    DateArray,
    TimeArray,
    DateTimeArray,
    JsonArray,
    EnumArray,
    BytesArray,
    UuidArray,
    UnknownNumber,
}

impl ColumnType {
    /// Stable numeric code of this tag.
    pub fn code(self) -> u8 {
        match self {
            Self::Int32 => 0,
            Self::Int64 => 1,
            Self::Float => 2,
            Self::Double => 3,
            Self::Numeric => 4,
            Self::Boolean => 5,
            Self::Character => 6,
            Self::Text => 7,
            Self::Date => 8,
            Self::Time => 9,
            Self::DateTime => 10,
            Self::Json => 11,
            Self::Enum => 12,
            Self::Bytes => 13,
            Self::Set => 14,
            Self::Uuid => 15,
            Self::Int32Array => 64,
            Self::Int64Array => 65,
            Self::FloatArray => 66,
            Self::DoubleArray => 67,
            Self::NumericArray => 68,
            Self::BooleanArray => 69,
            Self::CharacterArray => 70,
            Self::TextArray => 71,
            Self::DateArray => 72,
            Self::TimeArray => 73,
            Self::DateTimeArray => 74,
            Self::JsonArray => 75,
            Self::EnumArray => 76,
            Self::BytesArray => 77,
            Self::UuidArray => 78,
            Self::UnknownNumber => 128,
        }
    }

    /// The array variant holding elements of this type, if one exists.
    pub fn array_of(self) -> Option<Self> {
        let array = match self {
            Self::Int32 => Self::Int32Array,
            Self::Int64 => Self::Int64Array,
            Self::Float => Self::FloatArray,
            Self::Double => Self::DoubleArray,
            Self::Numeric => Self::NumericArray,
            Self::Boolean => Self::BooleanArray,
            Self::Character => Self::CharacterArray,
            Self::Text => Self::TextArray,
            Self::Date => Self::DateArray,
            Self::Time => Self::TimeArray,
            Self::DateTime => Self::DateTimeArray,
            Self::Json => Self::JsonArray,
            Self::Enum => Self::EnumArray,
            Self::Bytes => Self::BytesArray,
            Self::Uuid => Self::UuidArray,
            _ => return None,
        };
        Some(array)
    }

    pub fn is_array(self) -> bool {
        (64..128).contains(&self.code())
    }
}

impl Serialize for ColumnType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.code())
    }
}
