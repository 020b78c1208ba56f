//! Parameter and column values of the binary protocol
use crate::constants::{charset, column_flag, type_};
use crate::packet::{CodecError, CodecResult, PacketBuilder, PacketReader};
use crate::row::Column;

/// A value bound to a statement parameter or decoded from a result row
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// A boolean, sent as TINY
    Bool(bool),
    /// A signed integer
    Int(i64),
    /// An unsigned integer; separate from [Value::Int] so the full u64
    /// range survives the round trip
    UInt(u64),
    /// A double-precision float; FLOAT columns widen into this losslessly
    Double(f64),
    /// Character data
    Text(String),
    /// Raw bytes, produced by columns with the binary collation
    Bytes(Vec<u8>),
}

impl Value {
    /// Is this SQL NULL?
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The value as a string slice, if it holds character data
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    /// The value as raw bytes, if it holds character or binary data
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Text(v) => Some(v.as_bytes()),
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    /// The value as an i64, if it holds an integer that fits
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => (*v).try_into().ok(),
            _ => None,
        }
    }

    /// The value as a u64, if it holds a non-negative integer
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => (*v).try_into().ok(),
            _ => None,
        }
    }

    /// The value as an f64, if it holds a float
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// The parameter type byte and unsigned flag inferred for this value.
    ///
    /// Small non-negative integers travel as SHORT, everything else as
    /// LONGLONG with the unsigned flag tracking the sign; both kinds of
    /// string data travel as LONG_BLOB.
    pub(crate) fn parameter_type(&self) -> (u8, bool) {
        match self {
            Value::Null => (type_::NULL, false),
            Value::Bool(_) => (type_::TINY, true),
            Value::Int(v) if (0..0x8000).contains(v) => (type_::SHORT, true),
            Value::Int(v) => (type_::LONG_LONG, *v >= 0),
            Value::UInt(v) if *v < 0x8000 => (type_::SHORT, true),
            Value::UInt(_) => (type_::LONG_LONG, true),
            Value::Double(_) => (type_::DOUBLE, false),
            Value::Text(_) | Value::Bytes(_) => (type_::LONG_BLOB, false),
        }
    }

    /// Append the parameter body for this value.
    ///
    /// NULL writes nothing; it is carried by the bitmap alone.
    pub(crate) fn encode(&self, b: &mut PacketBuilder) {
        match self {
            Value::Null => {}
            Value::Bool(v) => b.put_u8(*v as u8),
            Value::Int(v) if (0..0x8000).contains(v) => b.put_u16(*v as u16),
            Value::Int(v) => b.put_i64(*v),
            Value::UInt(v) if *v < 0x8000 => b.put_u16(*v as u16),
            Value::UInt(v) => b.put_u64(*v),
            Value::Double(v) => b.put_f64(*v),
            Value::Text(v) => b.put_lenenc_bytes(v.as_bytes()),
            Value::Bytes(v) => b.put_lenenc_bytes(v),
        }
    }

    /// Decode one non-NULL column value from a binary result row
    pub(crate) fn decode_binary(r: &mut PacketReader<'_>, column: &Column) -> CodecResult<Value> {
        let unsigned = column.flags & column_flag::UNSIGNED != 0;
        match column.type_ {
            type_::STRING
            | type_::VAR_CHAR
            | type_::VAR_STRING
            | type_::ENUM
            | type_::SET
            | type_::TINY_BLOB
            | type_::MEDIUM_BLOB
            | type_::LONG_BLOB
            | type_::BLOB
            | type_::GEOMETRY
            | type_::BIT
            | type_::DECIMAL
            | type_::NEW_DECIMAL
            | type_::JSON => {
                let bytes = r.get_lenenc_blob()?;
                if column.character_set == charset::BINARY {
                    Ok(Value::Bytes(bytes.to_vec()))
                } else {
                    Ok(Value::Text(str::from_utf8(bytes)?.to_string()))
                }
            }
            type_::LONG_LONG => Ok(if unsigned {
                Value::UInt(r.get_u64()?)
            } else {
                Value::Int(r.get_i64()?)
            }),
            type_::LONG | type_::INT24 => Ok(if unsigned {
                Value::UInt(r.get_u32()?.into())
            } else {
                Value::Int(r.get_i32()?.into())
            }),
            type_::SHORT | type_::YEAR => Ok(if unsigned {
                Value::UInt(r.get_u16()?.into())
            } else {
                Value::Int(r.get_i16()?.into())
            }),
            type_::TINY => Ok(if unsigned {
                Value::UInt(r.get_u8()?.into())
            } else {
                Value::Int(r.get_i8()?.into())
            }),
            type_::FLOAT => Ok(Value::Double(r.get_f32()?.into())),
            type_::DOUBLE => Ok(Value::Double(r.get_f64()?)),
            type_::NULL => Ok(Value::Null),
            other => Err(CodecError::UnsupportedType(other)),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),+) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v.into())
            }
        })+
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Double(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
