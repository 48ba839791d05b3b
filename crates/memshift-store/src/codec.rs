use chrono::{DateTime, TimeZone, Utc};
use memshift_types::{JsonMap, MemoryEntry};
use serde_json::Value;
use thiserror::Error;

/// One memory row as it comes off the source, before any validation. Every
/// column is carried as loose JSON so a malformed row is the codec's problem,
/// not the reader's.
#[derive(Debug, Clone, Default)]
pub struct RawEntry {
    pub id: Option<Value>,
    pub agent_id: Option<Value>,
    pub session_id: Option<Value>,
    pub kind: Option<Value>,
    pub content: Option<Value>,
    pub context: Option<Value>,
    pub timestamp: Option<Value>,
    pub tags: Option<Value>,
    pub version: Option<Value>,
    pub parent_id: Option<Value>,
    pub metadata: Option<Value>,
}

/// A single malformed row. Recovered locally during migration (counted as
/// skipped), never propagated out of a run.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    Missing(&'static str),
    #[error("required field `{0}` is empty")]
    Empty(&'static str),
    #[error("invalid field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Check that every required field is present and usable, without building
/// the entry. Dry runs call this directly.
pub fn validate(raw: &RawEntry) -> Result<(), ValidationError> {
    require_text("id", &raw.id)?;
    require_text("agent_id", &raw.agent_id)?;
    require_text("session_id", &raw.session_id)?;
    require_text("type", &raw.kind)?;
    require_text("content", &raw.content)?;
    parse_timestamp(&raw.timestamp)?;
    Ok(())
}

/// Validate and normalize a raw row into the canonical entry model.
pub fn convert(raw: &RawEntry) -> Result<MemoryEntry, ValidationError> {
    validate(raw)?;

    Ok(MemoryEntry {
        id: require_text("id", &raw.id)?,
        agent_id: require_text("agent_id", &raw.agent_id)?,
        session_id: require_text("session_id", &raw.session_id)?,
        kind: require_text("type", &raw.kind)?,
        content: require_text("content", &raw.content)?,
        context: parse_object("context", &raw.context)?.unwrap_or_default(),
        timestamp: parse_timestamp(&raw.timestamp)?,
        tags: parse_tags(&raw.tags)?,
        version: parse_version(&raw.version)?,
        parent_id: parse_optional_text(&raw.parent_id),
        metadata: parse_object("metadata", &raw.metadata)?,
    })
}

fn require_text(field: &'static str, value: &Option<Value>) -> Result<String, ValidationError> {
    match value {
        None | Some(Value::Null) => Err(ValidationError::Missing(field)),
        Some(Value::String(text)) if text.is_empty() => Err(ValidationError::Empty(field)),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(other) => Err(ValidationError::Invalid {
            field,
            reason: format!("expected text, got {}", type_name(other)),
        }),
    }
}

fn parse_optional_text(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
        _ => None,
    }
}

/// The one explicit structured-or-serialized check: JSON text is parsed,
/// anything already structured passes through untouched.
fn normalize_structured(field: &'static str, value: &Value) -> Result<Value, ValidationError> {
    match value {
        Value::String(text) => {
            serde_json::from_str(text).map_err(|err| ValidationError::Invalid {
                field,
                reason: format!("unparseable JSON text: {}", err),
            })
        }
        other => Ok(other.clone()),
    }
}

fn parse_object(
    field: &'static str,
    value: &Option<Value>,
) -> Result<Option<JsonMap>, ValidationError> {
    let value = match value {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => normalize_structured(field, value)?,
    };
    match value {
        Value::Object(map) => Ok(Some(map.into_iter().collect())),
        Value::Null => Ok(None),
        other => Err(ValidationError::Invalid {
            field,
            reason: format!("expected object, got {}", type_name(&other)),
        }),
    }
}

fn parse_tags(value: &Option<Value>) -> Result<Vec<String>, ValidationError> {
    let value = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(value) => normalize_structured("tags", value)?,
    };
    let items = match value {
        Value::Array(items) => items,
        Value::Null => return Ok(Vec::new()),
        other => {
            return Err(ValidationError::Invalid {
                field: "tags",
                reason: format!("expected array, got {}", type_name(&other)),
            });
        }
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(tag) => Ok(tag),
            other => Err(ValidationError::Invalid {
                field: "tags",
                reason: format!("expected string element, got {}", type_name(&other)),
            }),
        })
        .collect()
}

fn parse_timestamp(value: &Option<Value>) -> Result<DateTime<Utc>, ValidationError> {
    let value = match value {
        None | Some(Value::Null) => return Err(ValidationError::Missing("timestamp")),
        Some(value) => value,
    };
    match value {
        Value::Number(number) => {
            let millis = number.as_i64().ok_or_else(|| ValidationError::Invalid {
                field: "timestamp",
                reason: format!("not an integer: {}", number),
            })?;
            millis_to_datetime(millis)
        }
        Value::String(text) if text.is_empty() => Err(ValidationError::Empty("timestamp")),
        Value::String(text) => {
            if text.bytes().all(|byte| byte.is_ascii_digit()) {
                let millis = text.parse::<i64>().map_err(|err| ValidationError::Invalid {
                    field: "timestamp",
                    reason: err.to_string(),
                })?;
                return millis_to_datetime(millis);
            }
            DateTime::parse_from_rfc3339(text)
                .map(|parsed| parsed.with_timezone(&Utc))
                .map_err(|err| ValidationError::Invalid {
                    field: "timestamp",
                    reason: err.to_string(),
                })
        }
        other => Err(ValidationError::Invalid {
            field: "timestamp",
            reason: format!("expected millis or RFC 3339 text, got {}", type_name(other)),
        }),
    }
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, ValidationError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| ValidationError::Invalid {
            field: "timestamp",
            reason: format!("out-of-range millis: {}", millis),
        })
}

fn parse_version(value: &Option<Value>) -> Result<i64, ValidationError> {
    let version = match value {
        None | Some(Value::Null) => return Ok(1),
        Some(Value::Number(number)) => number.as_i64().ok_or_else(|| ValidationError::Invalid {
            field: "version",
            reason: format!("not an integer: {}", number),
        })?,
        Some(other) => {
            return Err(ValidationError::Invalid {
                field: "version",
                reason: format!("expected integer, got {}", type_name(other)),
            });
        }
    };
    if version < 1 {
        return Err(ValidationError::Invalid {
            field: "version",
            reason: format!("must be positive, got {}", version),
        });
    }
    Ok(version)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
