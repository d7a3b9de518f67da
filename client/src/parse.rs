//! Response body interpretation
//!
//! Pure functions over decoded JSON so every remote format quirk is testable
//! without a server.

use std::collections::HashMap;

use serde_json::Value;

use flowload_core::{DatabaseId, JobId, RunId, ServiceError};

fn invalid(message: impl Into<String>) -> ServiceError {
    ServiceError::InvalidResponse(message.into())
}

/// Read an integer id that may arrive as a number or a numeric string
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// `id` of a created job
pub fn extract_job_id(body: &Value) -> Result<JobId, ServiceError> {
    body.get("id")
        .and_then(as_u64)
        .map(JobId)
        .ok_or_else(|| invalid("job creation response has no id"))
}

/// Top-level `run_id`, or `result.run_id` for triggered jobs
pub fn extract_run_id(body: &Value) -> Result<RunId, ServiceError> {
    let raw = body
        .get("run_id")
        .or_else(|| body.get("result").and_then(|r| r.get("run_id")));
    match raw {
        Some(Value::String(s)) if !s.is_empty() => Ok(RunId(s.clone())),
        Some(Value::Number(n)) => Ok(RunId(n.to_string())),
        _ => Err(invalid("response has no run_id")),
    }
}

/// Pick named values out of a parameter listing
///
/// The listing is `result: [[name, {"value": ...}], ...]`. Names without a
/// string value are left out.
pub fn extract_params(body: &Value, names: &[&str]) -> HashMap<String, String> {
    let mut found = HashMap::new();
    let Some(items) = body.get("result").and_then(Value::as_array) else {
        return found;
    };
    for item in items {
        let (Some(name), Some(value)) = (
            item.get(0).and_then(Value::as_str),
            item.get(1).and_then(|v| v.get("value")).and_then(Value::as_str),
        ) else {
            continue;
        };
        if names.contains(&name) {
            found.insert(name.to_string(), value.to_string());
        }
    }
    found
}

/// Two named parameters, both required
pub fn extract_param_pair(
    body: &Value,
    first: &str,
    second: &str,
) -> Result<(String, String), ServiceError> {
    let mut params = extract_params(body, &[first, second]);
    let a = params
        .remove(first)
        .ok_or_else(|| invalid(format!("parameter {first} missing")))?;
    let b = params
        .remove(second)
        .ok_or_else(|| invalid(format!("parameter {second} missing")))?;
    Ok((a, b))
}

/// Find the database that belongs to `username`
///
/// Prefers a name starting with `<prefix>_<username without underscores>`,
/// then any name containing both the prefix and the normalized username.
pub fn match_database(body: &Value, prefix: &str, username: &str) -> Option<DatabaseId> {
    let normalized = username.replace('_', "");
    let expected = format!("{prefix}_{normalized}");
    let databases = body.get("result").and_then(Value::as_array)?;

    let named = || {
        databases.iter().filter_map(|db| {
            let name = db.get("database_name").and_then(Value::as_str)?;
            let id = db.get("id").and_then(as_u64)?;
            Some((name, DatabaseId(id)))
        })
    };

    named()
        .find(|(name, _)| name.starts_with(&expected))
        .or_else(|| named().find(|(name, _)| name.contains(prefix) && name.contains(&normalized)))
        .map(|(_, id)| id)
}

/// `data[0]["count()"]` of a SQL execution result
pub fn extract_row_count(body: &Value) -> Result<u64, ServiceError> {
    let row = body
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .ok_or_else(|| invalid("query returned no rows"))?;
    row.get("count()")
        .and_then(as_u64)
        .ok_or_else(|| invalid("query result has no count() column"))
}

/// `object_url` of the first artifact with the given event type
pub fn extract_artifact_url(body: &Value, event: &str) -> Option<String> {
    let artifacts = body.get("result").and_then(Value::as_array)?;
    let found = artifacts
        .iter()
        .filter(|a| a.get("event_type").and_then(Value::as_str) == Some(event))
        .find_map(|a| a.get("object_url").and_then(Value::as_str).map(str::to_string));

    if found.is_none() {
        let available: Vec<_> = artifacts
            .iter()
            .filter_map(|a| a.get("event_type").and_then(Value::as_str))
            .collect();
        tracing::warn!(event, ?available, "Expected artifact not found");
    }
    found
}
