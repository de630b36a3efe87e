//! Process-wide integration configuration registry and test-mode flag.
//!
//! Each instrumented integration stores the options its enable call was
//! invoked with, keyed by integration name. The registry starts empty, lives
//! for the process lifetime, and has no teardown. Reads are lock-guarded so
//! patched functions may be invoked from multiple threads.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use crate::error::{ConfigError, Result};

/// Environment variable enabling test mode. When set to exactly "true",
/// swallowed instrumentation / transport / validation failures become fatal.
pub const TEST_MODE_ENV_VAR: &str = "AUTOTRACK_TESTING";

type IntegrationConfigs = HashMap<String, HashMap<String, Value>>;

fn registry() -> &'static RwLock<IntegrationConfigs> {
    static REGISTRY: OnceLock<RwLock<IntegrationConfigs>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Store the configuration for an integration's enable call.
///
/// A `disable` option defaulting to `false` is always present: it is
/// inserted when absent and must be a boolean when supplied. Registration
/// replaces any previously stored configuration for the integration; the
/// integration's own enable call is the only writer.
pub fn register_config(integration: &str, mut options: HashMap<String, Value>) -> Result<()> {
    match options.get("disable") {
        None => {
            options.insert("disable".to_string(), Value::Bool(false));
        }
        Some(Value::Bool(_)) => {}
        Some(other) => {
            return Err(ConfigError::InvalidDisableOption {
                integration: integration.to_string(),
                value: other.clone(),
            }
            .into());
        }
    }

    let mut configs = registry().write().expect("config registry poisoned");
    configs.insert(integration.to_string(), options);
    Ok(())
}

/// Return a config value for an integration, or `default` when the
/// integration is unknown or the key is not set.
pub fn get_config(integration: &str, key: &str, default: Value) -> Value {
    let configs = registry().read().expect("config registry poisoned");
    configs
        .get(integration)
        .and_then(|options| options.get(key).cloned())
        .unwrap_or(default)
}

/// Boolean convenience accessor over [`get_config`]. Non-boolean stored
/// values fall back to `default`.
pub fn config_flag(integration: &str, key: &str, default: bool) -> bool {
    match get_config(integration, key, Value::Bool(default)) {
        Value::Bool(b) => b,
        _ => default,
    }
}

/// Whether the integration is currently disabled.
///
/// Unknown integrations are treated as disabled: a patch must never run
/// instrumentation for an integration whose enable call has not happened.
pub fn is_disabled(integration: &str) -> bool {
    let configs = registry().read().expect("config registry poisoned");
    match configs.get(integration) {
        Some(options) => matches!(options.get("disable"), Some(Value::Bool(true))),
        None => true,
    }
}

/// Whether instrumentation is running in test mode.
///
/// Read from the environment on every call so tests can toggle it. Test mode
/// performs additional validation during instrumentation: arguments forwarded
/// to original functions are checked for exception safety, and failures that
/// would normally be downgraded to warnings are re-raised.
pub fn is_testing() -> bool {
    std::env::var(TEST_MODE_ENV_VAR).as_deref() == Ok("true")
}
