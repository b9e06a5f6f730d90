//! The tagged value union stored in a [`VarMap`].
//!
//! Tag numbers are frozen wire constants; see [`ValueTag`].
//!
//! [`VarMap`]: crate::VarMap

use uuid::Uuid;

use crate::VarMap;

/// Wire tags for map values. Frozen.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueTag {
    Unspecified = 0,
    Str = 1,
    Bool = 2,
    Bytes = 3,
    U8 = 4,
    I16 = 5,
    U16 = 6,
    I32 = 7,
    U32 = 8,
    I64 = 9,
    U64 = 10,
    F32 = 11,
    F64 = 12,
    Decimal = 13,
    Map = 14,
    Guid = 15,
}

impl ValueTag {
    /// Convert from a wire byte.
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0 => Self::Unspecified,
            1 => Self::Str,
            2 => Self::Bool,
            3 => Self::Bytes,
            4 => Self::U8,
            5 => Self::I16,
            6 => Self::U16,
            7 => Self::I32,
            8 => Self::U32,
            9 => Self::I64,
            10 => Self::U64,
            11 => Self::F32,
            12 => Self::F64,
            13 => Self::Decimal,
            14 => Self::Map,
            15 => Self::Guid,
            _ => return None,
        })
    }

    /// Convert to the wire byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A 16-byte fixed-point decimal, carried opaquely.
///
/// The transport never interprets the digits; producers and consumers agree
/// on the layout out of band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Decimal128(pub [u8; 16]);

impl Decimal128 {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// A value stored under a map key.
///
/// The `Map` variant holds a shared handle; cloning a `Value` never deep
/// copies a nested map.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unspecified,
    Str(String),
    Bool(bool),
    Bytes(Vec<u8>),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Decimal(Decimal128),
    Map(VarMap),
    Guid(Uuid),
}

impl Value {
    /// The wire tag for this value.
    pub fn tag(&self) -> ValueTag {
        match self {
            Value::Unspecified => ValueTag::Unspecified,
            Value::Str(_) => ValueTag::Str,
            Value::Bool(_) => ValueTag::Bool,
            Value::Bytes(_) => ValueTag::Bytes,
            Value::U8(_) => ValueTag::U8,
            Value::I16(_) => ValueTag::I16,
            Value::U16(_) => ValueTag::U16,
            Value::I32(_) => ValueTag::I32,
            Value::U32(_) => ValueTag::U32,
            Value::I64(_) => ValueTag::I64,
            Value::U64(_) => ValueTag::U64,
            Value::F32(_) => ValueTag::F32,
            Value::F64(_) => ValueTag::F64,
            Value::Decimal(_) => ValueTag::Decimal,
            Value::Map(_) => ValueTag::Map,
            Value::Guid(_) => ValueTag::Guid,
        }
    }

    /// The nested map handle, if this value is a map.
    pub fn as_map(&self) -> Option<&VarMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

macro_rules! impl_value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_value_from! {
    String => Str,
    bool => Bool,
    Vec<u8> => Bytes,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    Decimal128 => Decimal,
    VarMap => Map,
    Uuid => Guid,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

/// Typed extraction from a [`Value`], with best-effort lexical coercion
/// between strings and scalars.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Str(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::U8(n) => Some(n.to_string()),
            Value::I16(n) => Some(n.to_string()),
            Value::U16(n) => Some(n.to_string()),
            Value::I32(n) => Some(n.to_string()),
            Value::U32(n) => Some(n.to_string()),
            Value::I64(n) => Some(n.to_string()),
            Value::U64(n) => Some(n.to_string()),
            Value::F32(n) => Some(n.to_string()),
            Value::F64(n) => Some(n.to_string()),
            Value::Guid(g) => Some(g.to_string()),
            _ => None,
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(*b),
            Value::U8(n) => Some(*n != 0),
            Value::Str(s) => match s.as_str() {
                "1" => Some(true),
                "0" => Some(false),
                other => other.parse().ok(),
            },
            _ => None,
        }
    }
}

macro_rules! impl_int_from_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Option<Self> {
                    match value {
                        Value::U8(n) => (*n).try_into().ok(),
                        Value::I16(n) => (*n).try_into().ok(),
                        Value::U16(n) => (*n).try_into().ok(),
                        Value::I32(n) => (*n).try_into().ok(),
                        Value::U32(n) => (*n).try_into().ok(),
                        Value::I64(n) => (*n).try_into().ok(),
                        Value::U64(n) => (*n).try_into().ok(),
                        Value::Str(s) => s.trim().parse().ok(),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_int_from_value!(u8, i16, u16, i32, u32, i64, u64);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::F64(n) => Some(*n),
            Value::F32(n) => Some(f64::from(*n)),
            Value::U8(n) => Some(f64::from(*n)),
            Value::I16(n) => Some(f64::from(*n)),
            Value::U16(n) => Some(f64::from(*n)),
            Value::I32(n) => Some(f64::from(*n)),
            Value::U32(n) => Some(f64::from(*n)),
            Value::I64(n) => Some(*n as f64),
            Value::U64(n) => Some(*n as f64),
            Value::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::F32(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            other => f64::from_value(other).map(|n| n as f32),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bytes(b) => Some(b.clone()),
            _ => None,
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Guid(g) => Some(*g),
            Value::Str(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }
}

impl FromValue for Decimal128 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Decimal(d) => Some(*d),
            _ => None,
        }
    }
}

impl FromValue for VarMap {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_map().cloned()
    }
}
