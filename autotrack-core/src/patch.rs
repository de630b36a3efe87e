//! Safe patching of registered target functions.
//!
//! The controller never mutates foreign types: hosts opt in by registering a
//! target callable under a `(target, method)` slot, and route calls through
//! [`PatchRegistry::invoke`]. Installing a patch replaces the slot's
//! implementation with a wrapper that runs instrumentation around a call to
//! the saved original, with one overriding invariant: callers of a patched
//! function can never distinguish "instrumentation exists" from
//! "instrumentation does not exist" through the function's failure behavior
//! when the underlying function itself succeeds or fails on its own.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::client::TrackingClient;
use crate::config::{is_disabled, is_testing};
use crate::error::{PatchError, Result};
use crate::run::with_managed_run;
use crate::validate::validate_call_args;
use crate::value::{ArgValue, CallArgs};

/// A target callable. Its `Err` channel belongs to the original
/// implementation and is always propagated to callers verbatim.
pub type TargetFn = Arc<dyn Fn(&CallArgs) -> anyhow::Result<ArgValue> + Send + Sync>;

/// One parameter of a target function's signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub default: Option<ArgValue>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn with_default(name: impl Into<String>, default: impl Into<ArgValue>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
        }
    }
}

/// Name, documentation, and signature of a target function.
///
/// Preserved on the installed replacement so introspection-based caller code
/// is unaffected by patching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetMetadata {
    pub name: String,
    pub doc: String,
    pub signature: Vec<ParamSpec>,
}

impl TargetMetadata {
    pub fn new(name: impl Into<String>, doc: impl Into<String>, signature: Vec<ParamSpec>) -> Self {
        Self {
            name: name.into(),
            doc: doc.into(),
            signature,
        }
    }
}

/// Per-invocation record of what happened to the original function.
///
/// Stack-local, created at the start of one intercepted call and discarded
/// at its end. `original_failed` is only ever set after `original_invoked`.
#[derive(Debug, Default)]
pub struct CallOutcome {
    original_invoked: bool,
    original_result: Option<ArgValue>,
    original_failed: bool,
}

impl CallOutcome {
    pub fn original_invoked(&self) -> bool {
        self.original_invoked
    }

    pub fn original_failed(&self) -> bool {
        self.original_failed
    }
}

/// Handle through which patch implementations call the original function.
///
/// Tracks invocation state in an explicit [`CallOutcome`] record and, in
/// test mode, validates the forwarded arguments against the external
/// caller's arguments before the original runs.
pub struct CallOriginal<'a> {
    original: &'a TargetFn,
    caller_args: &'a CallArgs,
    metadata: &'a TargetMetadata,
    outcome: &'a mut CallOutcome,
}

impl CallOriginal<'_> {
    /// Invoke the original function with the given arguments.
    ///
    /// Failures of the original are recorded and re-raised; the controller
    /// propagates them to the external caller untouched.
    pub fn invoke(&mut self, args: &CallArgs) -> anyhow::Result<ArgValue> {
        if is_testing() {
            validate_call_args(self.caller_args, args)?;
        }
        self.outcome.original_invoked = true;
        match (self.original)(args) {
            Ok(value) => {
                self.outcome.original_result = Some(value.clone());
                Ok(value)
            }
            Err(e) => {
                self.outcome.original_failed = true;
                Err(e)
            }
        }
    }

    /// The original function's preserved metadata. Patch implementations
    /// inspect this the way they would inspect the original's signature.
    pub fn metadata(&self) -> &TargetMetadata {
        self.metadata
    }

    /// The arguments the external caller supplied.
    pub fn caller_args(&self) -> &CallArgs {
        self.caller_args
    }
}

/// Stateful patch implementation protocol: one unit is constructed per
/// intercepted invocation, `run` wraps the original call, and `on_failure`
/// observes an unhandled error from `run` before it is re-raised.
pub trait PatchUnit {
    fn run(&mut self, original: &mut CallOriginal<'_>, args: &CallArgs) -> anyhow::Result<ArgValue>;

    fn on_failure(&mut self, _error: &anyhow::Error) {}
}

/// Plain-callable patch protocol: the original is the first argument.
pub type PatchFn =
    Arc<dyn Fn(&mut CallOriginal<'_>, &CallArgs) -> anyhow::Result<ArgValue> + Send + Sync>;
/// Produces a fresh [`PatchUnit`] for each intercepted invocation.
pub type UnitFactory = Arc<dyn Fn() -> Box<dyn PatchUnit> + Send + Sync>;

/// A patch implementation: either a plain function taking the original as
/// its first argument, or a factory for stateful [`PatchUnit`]s.
#[derive(Clone)]
pub enum PatchImpl {
    Function(PatchFn),
    Unit(UnitFactory),
}

impl PatchImpl {
    pub fn function(
        f: impl Fn(&mut CallOriginal<'_>, &CallArgs) -> anyhow::Result<ArgValue> + Send + Sync + 'static,
    ) -> Self {
        PatchImpl::Function(Arc::new(f))
    }

    pub fn unit(factory: impl Fn() -> Box<dyn PatchUnit> + Send + Sync + 'static) -> Self {
        PatchImpl::Unit(Arc::new(factory))
    }

    pub(crate) fn invoke(
        &self,
        original: &mut CallOriginal<'_>,
        args: &CallArgs,
    ) -> anyhow::Result<ArgValue> {
        match self {
            PatchImpl::Function(f) => f(original, args),
            PatchImpl::Unit(factory) => {
                let mut unit = factory();
                match unit.run(original, args) {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        // The failure callback runs first; the error is
                        // re-raised regardless of what it does.
                        unit.on_failure(&e);
                        Err(e)
                    }
                }
            }
        }
    }
}

struct PatchDescriptor {
    /// The implementation the current wrapper treats as "the original".
    /// After re-patching this is the previously installed wrapper, so
    /// patches compose instead of silently discarding each other.
    original: TargetFn,
    /// The installed replacement; equals `original` while unpatched.
    wrapper: TargetFn,
    /// Metadata of the unmodified target, preserved across installs.
    metadata: Arc<TargetMetadata>,
}

/// Registry mapping `(target, method)` slots to their saved original
/// implementation and installed replacement. Owns the mapping for the
/// process lifetime; at most one descriptor exists per slot.
pub struct PatchRegistry {
    client: Arc<dyn TrackingClient>,
    slots: RwLock<HashMap<(String, String), PatchDescriptor>>,
}

impl PatchRegistry {
    pub fn new(client: Arc<dyn TrackingClient>) -> Self {
        Self {
            client,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> Arc<dyn TrackingClient> {
        Arc::clone(&self.client)
    }

    /// Register a target callable the host wants to expose for patching.
    /// Replaces any previous registration of the slot, dropping installed
    /// patches with it.
    pub fn register_target(
        &self,
        target: impl Into<String>,
        method: impl Into<String>,
        original: TargetFn,
        metadata: TargetMetadata,
    ) {
        let mut slots = self.slots.write().expect("patch registry poisoned");
        slots.insert(
            (target.into(), method.into()),
            PatchDescriptor {
                original: Arc::clone(&original),
                wrapper: original,
                metadata: Arc::new(metadata),
            },
        );
    }

    /// Install a safe patch over a registered slot.
    ///
    /// The replacement runs `patch_impl` around a call to the saved
    /// original with the error-handling contract of the module docs. With
    /// `manage_run`, the implementation is additionally bracketed with
    /// run-lifecycle calls via [`with_managed_run`].
    pub fn install(
        &self,
        integration: impl Into<String>,
        target: &str,
        method: &str,
        patch_impl: PatchImpl,
        manage_run: bool,
    ) -> Result<()> {
        let integration = integration.into();
        let patch_impl = if manage_run {
            with_managed_run(self.client(), patch_impl)
        } else {
            patch_impl
        };

        let mut slots = self.slots.write().expect("patch registry poisoned");
        let descriptor = slots
            .get_mut(&(target.to_string(), method.to_string()))
            .ok_or_else(|| PatchError::UnknownTarget {
                target: target.to_string(),
                method: method.to_string(),
            })?;

        // Compose with whatever is currently installed.
        let original = Arc::clone(&descriptor.wrapper);
        let metadata = Arc::clone(&descriptor.metadata);
        let wrapper: TargetFn = Arc::new(move |args: &CallArgs| {
            safe_patch_call(&integration, &original, &metadata, &patch_impl, args)
        });

        descriptor.original = Arc::clone(&descriptor.wrapper);
        descriptor.wrapper = wrapper;
        Ok(())
    }

    /// Invoke a slot's installed implementation (or the bare original when
    /// the slot has never been patched).
    pub fn invoke(&self, target: &str, method: &str, args: &CallArgs) -> anyhow::Result<ArgValue> {
        let wrapper = {
            let slots = self.slots.read().expect("patch registry poisoned");
            let descriptor = slots
                .get(&(target.to_string(), method.to_string()))
                .ok_or_else(|| PatchError::UnknownTarget {
                    target: target.to_string(),
                    method: method.to_string(),
                })?;
            Arc::clone(&descriptor.wrapper)
        };
        wrapper(args)
    }

    /// The implementation the currently installed patch treats as its
    /// original. Before any install this is the registered target itself;
    /// after re-patching it is the previously installed wrapper.
    pub fn saved_original(&self, target: &str, method: &str) -> Option<TargetFn> {
        let slots = self.slots.read().expect("patch registry poisoned");
        slots
            .get(&(target.to_string(), method.to_string()))
            .map(|d| Arc::clone(&d.original))
    }

    /// The preserved metadata of a registered target.
    pub fn metadata(&self, target: &str, method: &str) -> Option<TargetMetadata> {
        let slots = self.slots.read().expect("patch registry poisoned");
        slots
            .get(&(target.to_string(), method.to_string()))
            .map(|d| (*d.metadata).clone())
    }
}

/// One intercepted invocation.
///
/// Exceptions raised by the original function are observed through the
/// [`CallOutcome`] record and re-raised verbatim. Exceptions purely internal
/// to instrumentation are downgraded to warnings in normal operation and
/// fatal in test mode.
fn safe_patch_call(
    integration: &str,
    original: &TargetFn,
    metadata: &TargetMetadata,
    patch_impl: &PatchImpl,
    args: &CallArgs,
) -> anyhow::Result<ArgValue> {
    // A disabled integration bypasses all instrumentation.
    if is_disabled(integration) {
        return original(args);
    }

    let mut outcome = CallOutcome::default();
    let result = {
        let mut call_original = CallOriginal {
            original,
            caller_args: args,
            metadata,
            outcome: &mut outcome,
        };
        patch_impl.invoke(&mut call_original, args)
    };

    if let Err(e) = result {
        if outcome.original_failed || is_testing() {
            return Err(e);
        }
        warn!(
            integration = integration,
            error = %e,
            "Encountered unexpected error during instrumentation"
        );
    }

    if outcome.original_invoked {
        Ok(outcome.original_result.unwrap_or(ArgValue::Null))
    } else {
        // The patch never called the original (short-circuited or failed
        // early); the caller still observes one real invocation.
        original(args)
    }
}
