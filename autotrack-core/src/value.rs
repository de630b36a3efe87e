//! Structural argument model for intercepted calls.
//!
//! Patched training routines receive a positional argument sequence and a
//! keyword argument mapping. Both sides of the patch boundary (the external
//! caller and the instrumentation) describe their arguments with [`ArgValue`]
//! so the controller can compare what instrumentation forwards against what
//! the caller supplied without knowing anything about the framework being
//! instrumented.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single argument flowing into an intercepted call.
///
/// Callables and objects carry an exception-safety marker attached at
/// construction time; the marker never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ArgValue>),
    Map(BTreeMap<String, ArgValue>),
    Callable(CallableArg),
    Object(ObjectArg),
}

/// A function-like argument, identified by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallableArg {
    pub name: String,
    pub exception_safe: bool,
}

/// An instance-like argument, identified by the name of its type.
///
/// `exception_safe` is a property of the type, not the instance: every
/// instance produced from an exception-safe unit carries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectArg {
    pub type_name: String,
    pub exception_safe: bool,
}

impl ArgValue {
    /// An unmarked callable argument.
    pub fn callable(name: impl Into<String>) -> Self {
        ArgValue::Callable(CallableArg {
            name: name.into(),
            exception_safe: false,
        })
    }

    /// A callable argument carrying the exception-safety marker.
    pub fn exception_safe_callable(name: impl Into<String>) -> Self {
        ArgValue::Callable(CallableArg {
            name: name.into(),
            exception_safe: true,
        })
    }

    /// An unmarked object argument.
    pub fn object(type_name: impl Into<String>) -> Self {
        ArgValue::Object(ObjectArg {
            type_name: type_name.into(),
            exception_safe: false,
        })
    }

    /// An object argument whose type carries the exception-safety tag.
    pub fn exception_safe_object(type_name: impl Into<String>) -> Self {
        ArgValue::Object(ObjectArg {
            type_name: type_name.into(),
            exception_safe: true,
        })
    }

    /// The name of this value's type, used in validation diagnostics.
    ///
    /// Two values have equal types when their `type_name` is equal; for
    /// objects this is the tagged type name rather than the enum variant.
    pub fn type_name(&self) -> String {
        match self {
            ArgValue::Null => "null".into(),
            ArgValue::Bool(_) => "bool".into(),
            ArgValue::Int(_) => "int".into(),
            ArgValue::Float(_) => "float".into(),
            ArgValue::Str(_) => "str".into(),
            ArgValue::List(_) => "list".into(),
            ArgValue::Map(_) => "map".into(),
            ArgValue::Callable(_) => "callable".into(),
            ArgValue::Object(o) => o.type_name.clone(),
        }
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Null => write!(f, "null"),
            ArgValue::Bool(b) => write!(f, "{b}"),
            ArgValue::Int(i) => write!(f, "{i}"),
            ArgValue::Float(x) => write!(f, "{x}"),
            ArgValue::Str(s) => write!(f, "{s:?}"),
            ArgValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ArgValue::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
            ArgValue::Callable(c) => write!(f, "<callable {}>", c.name),
            ArgValue::Object(o) => write!(f, "<{} instance>", o.type_name),
        }
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

/// The full argument list of one intercepted call: a positional sequence
/// plus a keyword mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallArgs {
    pub positional: Vec<ArgValue>,
    pub keyword: BTreeMap<String, ArgValue>,
}

impl CallArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one positional argument.
    pub fn arg(mut self, value: impl Into<ArgValue>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set one keyword argument.
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arg_value_type_names() {
        assert_eq!(ArgValue::Int(1).type_name(), "int");
        assert_eq!(ArgValue::from("x").type_name(), "str");
        assert_eq!(ArgValue::List(vec![]).type_name(), "list");
        assert_eq!(ArgValue::object("Dataset").type_name(), "Dataset");
        assert_eq!(ArgValue::callable("cb").type_name(), "callable");
    }

    #[test]
    fn test_exception_safety_markers() {
        let safe = ArgValue::exception_safe_callable("on_epoch_end");
        let unsafe_ = ArgValue::callable("on_epoch_end");
        match (&safe, &unsafe_) {
            (ArgValue::Callable(a), ArgValue::Callable(b)) => {
                assert!(a.exception_safe);
                assert!(!b.exception_safe);
            }
            _ => unreachable!(),
        }
        assert_ne!(safe, unsafe_);
    }

    #[test]
    fn test_call_args_builder() {
        let args = CallArgs::new()
            .arg(1i64)
            .arg("data")
            .kwarg("epochs", 10i64)
            .kwarg("verbose", true);
        assert_eq!(args.positional.len(), 2);
        assert_eq!(args.keyword.get("epochs"), Some(&ArgValue::Int(10)));
        assert!(!args.is_empty());
        assert!(CallArgs::new().is_empty());
    }

    #[test]
    fn test_display_renders_nested_values() {
        let v = ArgValue::List(vec![
            ArgValue::Int(1),
            ArgValue::Map(BTreeMap::from([("k".to_string(), ArgValue::from("v"))])),
        ]);
        assert_eq!(v.to_string(), r#"[1, {"k": "v"}]"#);
    }
}
