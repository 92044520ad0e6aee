//! Call arguments accepted by remote callables.
//!
//! Only primitive values can cross the wire. Host-specific objects (scene
//! handles, actors, ...) are represented by [`HostObject`] so callers get a
//! clear validation error instead of a silently broken call.

use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

/// A reference to a live object inside a host application.
#[derive(Debug, Clone, PartialEq)]
pub struct HostObject {
    /// Host type name, e.g. `bpy.types.Object`.
    pub type_name: String,
    /// Host-side identifier such as an object or asset path.
    pub id: String,
}

/// One positional or keyword argument.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArg {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<CallArg>),
    List(Vec<CallArg>),
    Map(BTreeMap<String, CallArg>),
    Object(HostObject),
}

impl CallArg {
    /// Runtime type name used in validation messages.
    pub fn type_name(&self) -> &str {
        match self {
            CallArg::Null => "null",
            CallArg::Bool(_) => "boolean",
            CallArg::Int(_) => "integer",
            CallArg::Float(_) => "float",
            CallArg::Str(_) => "string",
            CallArg::Tuple(_) => "tuple",
            CallArg::List(_) => "list",
            CallArg::Map(_) => "mapping",
            CallArg::Object(object) => &object.type_name,
        }
    }

    /// The first value (this one or a nested one) that cannot cross the wire.
    pub fn find_unsupported(&self) -> Option<&CallArg> {
        match self {
            CallArg::Object(_) => Some(self),
            CallArg::Tuple(items) | CallArg::List(items) => {
                items.iter().find_map(CallArg::find_unsupported)
            }
            CallArg::Map(entries) => entries.values().find_map(CallArg::find_unsupported),
            _ => None,
        }
    }

    /// Encode as a wire value. Host objects have no wire form.
    pub fn to_wire(&self) -> Option<Value> {
        Some(match self {
            CallArg::Null => Value::Null,
            CallArg::Bool(b) => Value::Bool(*b),
            CallArg::Int(i) => Value::Number((*i).into()),
            CallArg::Float(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
            CallArg::Str(s) => Value::String(s.clone()),
            CallArg::Tuple(items) | CallArg::List(items) => Value::Array(
                items
                    .iter()
                    .map(CallArg::to_wire)
                    .collect::<Option<Vec<_>>>()?,
            ),
            CallArg::Map(entries) => {
                let mut map = Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_wire()?);
                }
                Value::Object(map)
            }
            CallArg::Object(_) => return None,
        })
    }
}

impl From<Value> for CallArg {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => CallArg::Null,
            Value::Bool(b) => CallArg::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => CallArg::Int(i),
                None => CallArg::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => CallArg::Str(s),
            Value::Array(items) => CallArg::List(items.into_iter().map(CallArg::from).collect()),
            Value::Object(map) => {
                CallArg::Map(map.into_iter().map(|(k, v)| (k, CallArg::from(v))).collect())
            }
        }
    }
}

impl From<()> for CallArg {
    fn from(_: ()) -> Self {
        CallArg::Null
    }
}

impl From<bool> for CallArg {
    fn from(value: bool) -> Self {
        CallArg::Bool(value)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for CallArg {
            fn from(value: $t) -> Self {
                CallArg::Int(value as i64)
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for CallArg {
    fn from(value: f32) -> Self {
        CallArg::Float(value as f64)
    }
}

impl From<f64> for CallArg {
    fn from(value: f64) -> Self {
        CallArg::Float(value)
    }
}

impl From<&str> for CallArg {
    fn from(value: &str) -> Self {
        CallArg::Str(value.to_string())
    }
}

impl From<String> for CallArg {
    fn from(value: String) -> Self {
        CallArg::Str(value)
    }
}

impl<T: Into<CallArg>> From<Vec<T>> for CallArg {
    fn from(values: Vec<T>) -> Self {
        CallArg::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<CallArg>> From<Option<T>> for CallArg {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(CallArg::Null)
    }
}

impl From<HostObject> for CallArg {
    fn from(value: HostObject) -> Self {
        CallArg::Object(value)
    }
}

/// The full argument list of one call.
///
/// Keyword arguments exist only so they can be rejected before any network
/// activity; the wire carries positional arguments alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    pub positional: Vec<CallArg>,
    pub keyword: BTreeMap<String, CallArg>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(args: Vec<CallArg>) -> Self {
        Self {
            positional: args,
            keyword: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<CallArg>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<CallArg>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }
}

impl From<Vec<CallArg>> for Arguments {
    fn from(args: Vec<CallArg>) -> Self {
        Arguments::positional(args)
    }
}

/// Build positional [`Arguments`] from a list of values.
///
/// ```rust,ignore
/// let args = call_args![2, "x", 1.5];
/// ```
#[macro_export]
macro_rules! call_args {
    () => { $crate::Arguments::new() };
    ($($value:expr),+ $(,)?) => {
        $crate::Arguments::positional(vec![$($crate::CallArg::from($value)),+])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitives_encode_to_wire() {
        let arg = CallArg::List(vec![
            CallArg::from(1),
            CallArg::from("two"),
            CallArg::from(3.5),
            CallArg::from(true),
            CallArg::Null,
            CallArg::Tuple(vec![CallArg::from(4)]),
        ]);
        assert_eq!(arg.to_wire(), Some(json!([1, "two", 3.5, true, null, [4]])));
    }

    #[test]
    fn test_host_object_has_no_wire_form() {
        let cube = HostObject {
            type_name: "bpy.types.Object".into(),
            id: "Cube".into(),
        };
        let nested = CallArg::Map(BTreeMap::from([("target".to_string(), cube.clone().into())]));

        assert_eq!(nested.to_wire(), None);
        assert_eq!(
            nested.find_unsupported().map(CallArg::type_name),
            Some("bpy.types.Object")
        );
    }

    #[test]
    fn test_from_json_value() {
        let arg = CallArg::from(json!({"name": "Cube", "size": 2}));
        match arg {
            CallArg::Map(entries) => {
                assert_eq!(entries["name"], CallArg::Str("Cube".into()));
                assert_eq!(entries["size"], CallArg::Int(2));
            }
            other => panic!("expected a mapping, got {:?}", other),
        }
    }

    #[test]
    fn test_call_args_macro() {
        let args = call_args![2, "x"];
        assert_eq!(args.positional, vec![CallArg::Int(2), CallArg::Str("x".into())]);
        assert!(args.keyword.is_empty());
        assert!(call_args![].positional.is_empty());
    }
}
