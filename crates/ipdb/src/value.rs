//! Scalar values of database fields and request keys.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::netlink::codec::{AttrValue, format_lladdr};

/// A scalar field value.
///
/// Numbers from the kernel are kept as `Int`; addresses, names and
/// link-layer addresses as `Str` in their usual text form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(*b as i64),
            Value::Str(s) => parse_int(s),
            Value::Null => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        self.as_int().and_then(|v| u32::try_from(v).ok())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Truth value: booleans, nonzero numbers, and `on`/`up`/`yes`/`true`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(v) => Some(*v != 0),
            Value::Str(s) => match s.as_str() {
                "1" | "on" | "up" | "yes" | "true" => Some(true),
                "0" | "off" | "down" | "no" | "false" => Some(false),
                _ => None,
            },
            Value::Null => None,
        }
    }

    /// Scalar view of a decoded attribute. Containers and blobs have none.
    pub fn from_attr(value: &AttrValue) -> Option<Self> {
        match value {
            AttrValue::I32(v) => Some(Value::Int(*v as i64)),
            AttrValue::Str(s) => Some(Value::Str(s.clone())),
            AttrValue::Ip(ip) => Some(Value::Str(ip.to_string())),
            AttrValue::LlAddr(mac) => Some(Value::Str(format_lladdr(mac))),
            AttrValue::Flag => Some(Value::Bool(true)),
            other => other.as_u64().map(|v| Value::Int(v as i64)),
        }
    }
}

fn parse_int(s: &str) -> Option<i64> {
    match s.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

macro_rules! int_from {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v as i64)
            }
        })*
    };
}

int_from!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<IpAddr> for Value {
    fn from(v: IpAddr) -> Self {
        Value::Str(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
