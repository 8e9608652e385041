//! Property values as they are mirrored by the registries.
//!
//! Values coming from the bus are converted into [`Value`] at the transport boundary, so neither
//! the registry nor its consumers ever have to deal with D-Bus variant types.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use zbus::zvariant;

use crate::BusError;

/// Mapping from (mirrored) property name to its value.
pub type Properties = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
    /// An object path. Kept apart from [`Value::Str`] so it can be sent back to the bus as one.
    Path(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Debug representation of a value we don't mirror structurally (file descriptors, maybes,
    /// dicts with non-string keys).
    Unsupported(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) | Value::Path(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Numeric value as a float, regardless of how it was encoded on the bus.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::UInt(n) => Some(*n as f64),
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(xs) => Some(xs),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// All string-like entries of a list value; anything that isn't a list yields nothing.
    pub fn string_list(&self) -> Vec<String> {
        self.as_list().unwrap_or_default().iter().filter_map(Value::as_str).map(str::to_owned).collect()
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::UInt(n as u64)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(xs: Vec<T>) -> Self {
        Value::List(xs.into_iter().map(Into::into).collect())
    }
}

impl From<&zvariant::Value<'_>> for Value {
    fn from(value: &zvariant::Value<'_>) -> Self {
        use zvariant::Value as V;
        match value {
            V::Bool(b) => Value::Bool(*b),
            V::U8(n) => Value::UInt(*n as u64),
            V::U16(n) => Value::UInt(*n as u64),
            V::U32(n) => Value::UInt(*n as u64),
            V::U64(n) => Value::UInt(*n),
            V::I16(n) => Value::Int(*n as i64),
            V::I32(n) => Value::Int(*n as i64),
            V::I64(n) => Value::Int(*n),
            V::F64(n) => Value::Double(*n),
            V::Str(s) => Value::Str(s.to_string()),
            V::Signature(s) => Value::Str(s.to_string()),
            V::ObjectPath(p) => Value::Path(p.to_string()),
            V::Value(inner) => Value::from(&**inner),
            V::Array(array) => Value::List(array.get().iter().map(Value::from).collect()),
            V::Structure(s) => Value::List(s.fields().iter().map(Value::from).collect()),
            V::Dict(dict) => match HashMap::<String, zvariant::Value<'_>>::try_from(dict.clone()) {
                Ok(entries) => Value::Map(entries.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect()),
                Err(_) => Value::Unsupported(format!("{:?}", dict)),
            },
            #[allow(unreachable_patterns)]
            other => Value::Unsupported(format!("{:?}", other)),
        }
    }
}

/// Convert a property map as returned by `org.freedesktop.DBus.Properties.GetAll`.
pub fn properties_from_bus(props: &HashMap<String, zvariant::OwnedValue>) -> Properties {
    props.iter().map(|(name, value)| (name.clone(), Value::from(&**value))).collect()
}

/// Encode a value as a method-call argument.
///
/// Integers are sent as `x`/`u`, which covers the methods the registries call. Lists must be
/// homogeneous lists of strings or of object paths; an empty list is sent as `ao`.
pub(crate) fn to_bus_arg(value: &Value) -> Result<zvariant::Value<'static>, BusError> {
    Ok(match value {
        Value::Bool(b) => zvariant::Value::from(*b),
        Value::Int(n) => zvariant::Value::from(*n),
        Value::UInt(n) => match u32::try_from(*n) {
            Ok(n) => zvariant::Value::from(n),
            Err(_) => zvariant::Value::from(*n),
        },
        Value::Double(n) => zvariant::Value::from(*n),
        Value::Str(s) => zvariant::Value::from(s.clone()),
        Value::Path(p) => zvariant::Value::from(object_path(p)?),
        Value::List(xs) if xs.iter().all(|x| matches!(x, Value::Path(_))) => {
            let paths = xs.iter().filter_map(Value::as_str).map(object_path).collect::<Result<Vec<_>, _>>()?;
            zvariant::Value::from(paths)
        }
        Value::List(xs) if xs.iter().all(|x| matches!(x, Value::Str(_))) => {
            zvariant::Value::from(xs.iter().filter_map(Value::as_str).map(str::to_owned).collect::<Vec<String>>())
        }
        other => return Err(BusError::Malformed(format!("cannot send {:?} as a method argument", other))),
    })
}

fn object_path(path: &str) -> Result<zvariant::ObjectPath<'static>, BusError> {
    zvariant::ObjectPath::try_from(path.to_owned()).map_err(|e| BusError::Malformed(format!("invalid object path {:?}: {}", path, e)))
}
