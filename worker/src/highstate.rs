// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interpreting the return of a highstate run.
//!
//! A fetched return looks like `{target: {"ret": {step_id: step, ...}}}`,
//! where each step carries a `result` flag. The run succeeded iff the
//! per-step mapping is present and no step has `result: false`. Salt reports
//! render and compile errors as a list of strings in place of the mapping;
//! those are treated as malformed.

use serde_json::Map;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepOutcome {
    pub name: String,
    pub success: bool,
}

/// The per-step outcome of a successful highstate run, in execution order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HighstateResult {
    pub steps: Vec<StepOutcome>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HighstateError {
    #[error("no return for {target}")]
    Missing { target: String },

    #[error("{target} returned an error: {message}")]
    ErrorSentinel { target: String, message: String },

    #[error("malformed return from {target}: {reason}")]
    Malformed { target: String, reason: String },

    #[error("step {step} failed on {target}")]
    StepFailed { target: String, step: String },
}

pub fn interpret(
    target: &str,
    result: &Value,
) -> Result<HighstateResult, HighstateError> {
    let entry = match result.get(target) {
        Some(Value::Object(entry)) => entry,
        Some(Value::String(message)) => {
            return Err(HighstateError::ErrorSentinel {
                target: target.to_string(),
                message: message.clone(),
            });
        }
        Some(_) | None => {
            return Err(HighstateError::Missing { target: target.to_string() });
        }
    };

    if let Some(error) = entry.get("Error").or_else(|| entry.get("error")) {
        return Err(HighstateError::ErrorSentinel {
            target: target.to_string(),
            message: describe(error),
        });
    }

    let steps = match entry.get("ret") {
        Some(Value::Object(steps)) => steps,
        Some(Value::String(message)) => {
            return Err(HighstateError::ErrorSentinel {
                target: target.to_string(),
                message: message.clone(),
            });
        }
        Some(Value::Array(entries)) => {
            let reason = entries
                .iter()
                .map(describe)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(HighstateError::Malformed {
                target: target.to_string(),
                reason: format!("expected per-step mapping, got: {reason}"),
            });
        }
        Some(other) => {
            return Err(HighstateError::Malformed {
                target: target.to_string(),
                reason: format!("expected per-step mapping, got: {other}"),
            });
        }
        None => {
            return Err(HighstateError::Missing { target: target.to_string() });
        }
    };

    let mut outcomes = Vec::with_capacity(steps.len());
    for (id, step) in ordered_steps(steps) {
        let Value::Object(fields) = step else {
            return Err(HighstateError::Malformed {
                target: target.to_string(),
                reason: format!("step {id} is not a mapping: {step}"),
            });
        };
        let name = step_name(fields);
        let success = !matches!(fields.get("result"), Some(Value::Bool(false)));
        if !success {
            return Err(HighstateError::StepFailed {
                target: target.to_string(),
                step: name.unwrap_or_else(|| step.to_string()),
            });
        }
        outcomes.push(StepOutcome {
            name: name.unwrap_or_else(|| id.clone()),
            success,
        });
    }

    Ok(HighstateResult { steps: outcomes })
}

// Steps in the order salt ran them, if it told us; otherwise as returned.
fn ordered_steps(steps: &Map<String, Value>) -> Vec<(&String, &Value)> {
    let mut ordered: Vec<_> = steps.iter().collect();
    ordered.sort_by_key(|(_, step)| {
        step.get("__run_num__").and_then(Value::as_u64).unwrap_or(u64::MAX)
    });
    ordered
}

fn step_name(fields: &Map<String, Value>) -> Option<String> {
    ["name", "__id__"]
        .iter()
        .filter_map(|key| fields.get(*key))
        .filter_map(Value::as_str)
        .next()
        .map(str::to_string)
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
