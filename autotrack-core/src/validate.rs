//! Structural argument validation.
//!
//! Detects when instrumentation silently alters the argument list forwarded
//! to an original function, or introduces extra arguments that are not
//! provably exception-safe. Introducing extras is expected and intentional;
//! the check exists to prove they are safe, not to forbid them. The patch
//! controller runs it only in test mode.

use std::collections::BTreeMap;

use crate::error::ValidationError;
use crate::value::{ArgValue, CallArgs};

/// Compare the argument list instrumentation is about to forward (`actual`)
/// against the argument list the external caller supplied (`expected`).
///
/// Positional sequences and keyword mappings are validated independently:
/// the actual side may be a superset of the expected side, and every
/// addition must pass the exception-safety check.
pub fn validate_call_args(expected: &CallArgs, actual: &CallArgs) -> Result<(), ValidationError> {
    validate_sequence(&expected.positional, &actual.positional)?;
    validate_mapping(&expected.keyword, &actual.keyword)
}

fn validate_sequence(expected: &[ArgValue], actual: &[ArgValue]) -> Result<(), ValidationError> {
    if actual.len() < expected.len() {
        return Err(ValidationError::MissingPositional {
            count: expected.len() - actual.len(),
        });
    }
    // Pad the expected side to the longer length so additions show up as
    // new inputs.
    for (i, actual_item) in actual.iter().enumerate() {
        validate_value(expected.get(i), actual_item)?;
    }
    Ok(())
}

fn validate_mapping(
    expected: &BTreeMap<String, ArgValue>,
    actual: &BTreeMap<String, ArgValue>,
) -> Result<(), ValidationError> {
    let missing: Vec<String> = expected
        .keys()
        .filter(|k| !actual.contains_key(*k))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::MissingKeys { keys: missing });
    }
    for (key, actual_value) in actual {
        validate_value(expected.get(key), actual_value)?;
    }
    Ok(())
}

/// Validate one forwarded value against the caller's value at the same
/// position or key. `expected == None` marks a value the instrumentation
/// introduced.
fn validate_value(
    expected: Option<&ArgValue>,
    actual: &ArgValue,
) -> Result<(), ValidationError> {
    let Some(expected) = expected else {
        return validate_new_input(actual);
    };

    if !same_type(expected, actual) {
        return Err(ValidationError::TypeMismatch {
            expected: expected.type_name(),
            actual: actual.type_name(),
        });
    }

    match (expected, actual) {
        (ArgValue::List(e), ArgValue::List(a)) => validate_sequence(e, a),
        (ArgValue::Map(e), ArgValue::Map(a)) => validate_mapping(e, a),
        // Value-or-identity equality for everything else; `PartialEq` is the
        // documented fallback, no deep structural guess.
        _ => {
            if expected == actual {
                Ok(())
            } else {
                Err(ValidationError::ValueMismatch {
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                })
            }
        }
    }
}

fn same_type(expected: &ArgValue, actual: &ArgValue) -> bool {
    match (expected, actual) {
        (ArgValue::Object(e), ArgValue::Object(a)) => e.type_name == a.type_name,
        _ => std::mem::discriminant(expected) == std::mem::discriminant(actual),
    }
}

/// A new input is valid when it carries the exception-safety marker, is an
/// instance of an exception-safe type, or is a list whose every element
/// independently passes this check.
fn validate_new_input(input: &ArgValue) -> Result<(), ValidationError> {
    match input {
        ArgValue::List(items) => items.iter().try_for_each(validate_new_input),
        ArgValue::Callable(c) if c.exception_safe => Ok(()),
        ArgValue::Object(o) if o.exception_safe => Ok(()),
        other => Err(ValidationError::UnsafeNewInput {
            value: other.clone(),
        }),
    }
}
