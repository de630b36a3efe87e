//! Exception-safety declaration API for instrumentation authors.
//!
//! Patched code commonly forwards freshly constructed callbacks or callback
//! holders into the original training routine (for example an epoch-end
//! metrics callback handed to a `fit` call). A bug inside such a callback
//! must never disrupt the training it observes, so every declared callable
//! swallows unexpected errors outside test mode. The declaration also tags
//! the value so the structural argument validator accepts it as a safe new
//! input.

use anyhow::anyhow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::is_testing;
use crate::value::{ArgValue, CallArgs};

type CallbackFn = Arc<dyn Fn(&CallArgs) -> anyhow::Result<ArgValue> + Send + Sync>;

/// An instrumentation callback wrapped with broad error handling.
///
/// Calling it never fails in normal operation: an error from the inner
/// function is downgraded to a warning and `None` is returned. In test mode
/// the error is re-raised so instrumentation bugs are caught before release.
#[derive(Clone)]
pub struct ExceptionSafeFn {
    name: String,
    inner: CallbackFn,
}

impl ExceptionSafeFn {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(&CallArgs) -> anyhow::Result<ArgValue> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            inner: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the wrapped callback.
    pub fn call(&self, args: &CallArgs) -> anyhow::Result<Option<ArgValue>> {
        match (self.inner)(args) {
            Ok(value) => Ok(Some(value)),
            Err(e) if is_testing() => Err(e),
            Err(e) => {
                warn!(callback = self.name, error = %e, "Encountered unexpected error during instrumentation callback");
                Ok(None)
            }
        }
    }

    /// The marker value to forward into an original call.
    pub fn as_arg(&self) -> ArgValue {
        ArgValue::exception_safe_callable(self.name.clone())
    }
}

impl std::fmt::Debug for ExceptionSafeFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExceptionSafeFn")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A named unit whose every method is exception-safe.
///
/// The wrapping happens once, when the unit is built; instances converted
/// with [`SafeUnit::as_arg`] carry the type-level exception-safety tag.
#[derive(Clone)]
pub struct SafeUnit {
    type_name: String,
    methods: BTreeMap<String, ExceptionSafeFn>,
}

impl SafeUnit {
    pub fn builder(type_name: impl Into<String>) -> SafeUnitBuilder {
        SafeUnitBuilder {
            type_name: type_name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }

    /// Invoke one method under the unit's error-handling policy.
    pub fn call_method(&self, method: &str, args: &CallArgs) -> anyhow::Result<Option<ArgValue>> {
        let f = self
            .methods
            .get(method)
            .ok_or_else(|| anyhow!("unit '{}' has no method '{method}'", self.type_name))?;
        f.call(args)
    }

    /// The marker value to forward into an original call.
    pub fn as_arg(&self) -> ArgValue {
        ArgValue::exception_safe_object(self.type_name.clone())
    }
}

impl std::fmt::Debug for SafeUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeUnit")
            .field("type_name", &self.type_name)
            .field("methods", &self.method_names())
            .finish()
    }
}

/// Builder that wraps each method with broad error handling at definition
/// time.
pub struct SafeUnitBuilder {
    type_name: String,
    methods: BTreeMap<String, ExceptionSafeFn>,
}

impl SafeUnitBuilder {
    pub fn method(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&CallArgs) -> anyhow::Result<ArgValue> + Send + Sync + 'static,
    ) -> Self {
        let name = name.into();
        let qualified = format!("{}::{}", self.type_name, name);
        self.methods.insert(name, ExceptionSafeFn::new(qualified, f));
        self
    }

    pub fn build(self) -> SafeUnit {
        SafeUnit {
            type_name: self.type_name,
            methods: self.methods,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support;

    fn failing_callback() -> ExceptionSafeFn {
        ExceptionSafeFn::new("broken", |_| Err(anyhow!("callback bug")))
    }

    #[test]
    fn test_callback_success_passes_through() {
        let cb = ExceptionSafeFn::new("double", |args| {
            let ArgValue::Int(x) = args.positional[0] else {
                return Err(anyhow!("expected int"));
            };
            Ok(ArgValue::Int(x * 2))
        });
        let out = cb.call(&CallArgs::new().arg(21i64)).unwrap();
        assert_eq!(out, Some(ArgValue::Int(42)));
    }

    #[test]
    fn test_callback_error_swallowed_outside_test_mode() {
        let _lock = test_support::test_mode_lock();
        let out = failing_callback().call(&CallArgs::new()).unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn test_callback_error_raised_in_test_mode() {
        let _guard = test_support::enable_test_mode();
        assert!(failing_callback().call(&CallArgs::new()).is_err());
    }

    #[test]
    fn test_callback_carries_marker() {
        let arg = failing_callback().as_arg();
        assert_eq!(arg, ArgValue::exception_safe_callable("broken"));
    }

    #[test]
    fn test_safe_unit_methods_are_wrapped() {
        let _lock = test_support::test_mode_lock();
        let unit = SafeUnit::builder("EpochLogger")
            .method("on_epoch_end", |_| Ok(ArgValue::Null))
            .method("on_train_end", |_| Err(anyhow!("flaky")))
            .build();

        assert_eq!(unit.method_names(), vec!["on_epoch_end", "on_train_end"]);
        assert_eq!(
            unit.call_method("on_epoch_end", &CallArgs::new()).unwrap(),
            Some(ArgValue::Null)
        );
        // Swallowed, not raised.
        assert_eq!(
            unit.call_method("on_train_end", &CallArgs::new()).unwrap(),
            None
        );
        assert_eq!(unit.as_arg(), ArgValue::exception_safe_object("EpochLogger"));
    }

    #[test]
    fn test_safe_unit_unknown_method_is_an_error() {
        let unit = SafeUnit::builder("EpochLogger").build();
        assert!(unit.call_method("missing", &CallArgs::new()).is_err());
    }
}
