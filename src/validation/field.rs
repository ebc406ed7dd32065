use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde_json::{Number, Value};

use crate::data_types::{FieldKind, FieldType, FileOptions, NumberOptions, TIMESTAMP_FORMAT};
use crate::sql_value::SqlValue;

/// Why a single value was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError(pub String);

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn reject<T>(reason: impl Into<String>) -> Result<T, FieldError> {
    Err(FieldError(reason.into()))
}

/// A field kind with its options compiled into checks (regex, parsed bounds)
#[derive(Debug, Clone)]
pub enum FieldSpec {
    Text {
        min_length: Option<usize>,
        max_length: Option<usize>,
        pattern: Option<Regex>,
    },
    Number(NumberOptions),
    Boolean,
    Datetime {
        min: Option<String>,
        max: Option<String>,
    },
    Json,
    Relation {
        collection_id: String,
    },
    File(FileOptions),
}

impl FieldSpec {
    /// Fails when the options themselves are unusable (bad regex, inverted bounds)
    pub fn compile(kind: &FieldKind) -> Result<Self, FieldError> {
        Ok(match kind {
            FieldKind::Text(options) => {
                if let (Some(min), Some(max)) = (options.min_length, options.max_length) {
                    if min > max {
                        return reject("min_length is greater than max_length");
                    }
                }
                let pattern = match &options.pattern {
                    Some(p) => Some(
                        Regex::new(p).map_err(|e| FieldError(format!("invalid pattern: {e}")))?,
                    ),
                    None => None,
                };
                FieldSpec::Text {
                    min_length: options.min_length,
                    max_length: options.max_length,
                    pattern,
                }
            }
            FieldKind::Number(options) => {
                if let (Some(min), Some(max)) = (options.min, options.max) {
                    if min > max {
                        return reject("min is greater than max");
                    }
                }
                FieldSpec::Number(options.clone())
            }
            FieldKind::Boolean => FieldSpec::Boolean,
            FieldKind::Datetime(options) => {
                let parse_bound = |bound: &Option<String>| match bound {
                    Some(b) => normalize_datetime(b)
                        .map(Some)
                        .ok_or_else(|| FieldError(format!("invalid datetime bound {b:?}"))),
                    None => Ok(None),
                };
                let min = parse_bound(&options.min)?;
                let max = parse_bound(&options.max)?;
                if let (Some(min), Some(max)) = (&min, &max) {
                    if min > max {
                        return reject("min is later than max");
                    }
                }
                FieldSpec::Datetime { min, max }
            }
            FieldKind::Json => FieldSpec::Json,
            FieldKind::Relation(options) => {
                if options.collection_id.is_empty() {
                    return reject("relation target collection is missing");
                }
                FieldSpec::Relation {
                    collection_id: options.collection_id.clone(),
                }
            }
            FieldKind::File(options) => FieldSpec::File(options.clone()),
        })
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            FieldSpec::Text { .. } => FieldType::Text,
            FieldSpec::Number(_) => FieldType::Number,
            FieldSpec::Boolean => FieldType::Boolean,
            FieldSpec::Datetime { .. } => FieldType::Datetime,
            FieldSpec::Json => FieldType::Json,
            FieldSpec::Relation { .. } => FieldType::Relation,
            FieldSpec::File(_) => FieldType::File,
        }
    }

    /// Coerce a non-null raw value to its stored form and check the options
    pub fn validate(&self, raw: &Value) -> Result<SqlValue, FieldError> {
        let value = coerce(self.field_type(), raw)?;

        match (self, &value) {
            (
                FieldSpec::Text {
                    min_length,
                    max_length,
                    pattern,
                },
                SqlValue::Text(s),
            ) => {
                let length = s.chars().count();
                if let Some(min) = min_length {
                    if length < *min {
                        return reject(format!("must be at least {min} characters"));
                    }
                }
                if let Some(max) = max_length {
                    if length > *max {
                        return reject(format!("must be at most {max} characters"));
                    }
                }
                if let Some(pattern) = pattern {
                    if !pattern.is_match(s) {
                        return reject(format!("must match pattern {}", pattern.as_str()));
                    }
                }
            }
            (FieldSpec::Number(options), SqlValue::Real(n)) => {
                if options.integer && n.fract() != 0.0 {
                    return reject("must be an integer");
                }
                if let Some(min) = options.min {
                    if *n < min {
                        return reject(format!("must be greater than or equal to {min}"));
                    }
                }
                if let Some(max) = options.max {
                    if *n > max {
                        return reject(format!("must be less than or equal to {max}"));
                    }
                }
            }
            (FieldSpec::Datetime { min, max }, SqlValue::Text(s)) => {
                if let Some(min) = min {
                    if s < min {
                        return reject(format!("must not be earlier than {min}"));
                    }
                }
                if let Some(max) = max {
                    if s > max {
                        return reject(format!("must not be later than {max}"));
                    }
                }
            }
            (FieldSpec::Relation { .. } | FieldSpec::File(_), SqlValue::Text(s)) => {
                if s.is_empty() {
                    return reject("must not be empty");
                }
            }
            _ => {}
        }

        Ok(value)
    }
}

/// Type-only coercion of a non-null JSON value into its stored form
pub fn coerce(field_type: FieldType, raw: &Value) -> Result<SqlValue, FieldError> {
    match field_type {
        FieldType::Text | FieldType::Relation | FieldType::File => match raw {
            Value::String(s) => Ok(SqlValue::Text(s.clone())),
            Value::Number(n) if field_type == FieldType::Text => Ok(SqlValue::Text(n.to_string())),
            Value::Bool(b) if field_type == FieldType::Text => Ok(SqlValue::Text(b.to_string())),
            _ => reject("must be a string"),
        },
        FieldType::Number => {
            let number = match raw {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            };
            match number {
                Some(n) if n.is_finite() => Ok(SqlValue::Real(n)),
                _ => reject("must be a number"),
            }
        }
        FieldType::Boolean => {
            let flag = match raw {
                Value::Bool(b) => Some(*b),
                Value::Number(n) => match n.as_f64() {
                    Some(f) if f == 0.0 => Some(false),
                    Some(f) if f == 1.0 => Some(true),
                    _ => None,
                },
                Value::String(s) => match s.as_str() {
                    "true" | "1" => Some(true),
                    "false" | "0" => Some(false),
                    _ => None,
                },
                _ => None,
            };
            flag.map(SqlValue::from)
                .ok_or_else(|| FieldError("must be a boolean".to_string()))
        }
        FieldType::Datetime => match raw {
            Value::String(s) => normalize_datetime(s)
                .map(SqlValue::Text)
                .ok_or_else(|| FieldError(format!("{s:?} is not a valid datetime"))),
            _ => reject("must be a datetime string"),
        },
        FieldType::Json => serde_json::to_string(raw)
            .map(SqlValue::Text)
            .map_err(|e| FieldError(format!("must be valid JSON: {e}"))),
    }
}

/// Convert a stored value back into its logical JSON value
pub fn to_logical(field_type: FieldType, value: SqlValue) -> Value {
    match (field_type, value) {
        (_, SqlValue::Null) => Value::Null,
        (FieldType::Boolean, SqlValue::Integer(i)) => Value::Bool(i != 0),
        (FieldType::Boolean, SqlValue::Real(f)) => Value::Bool(f != 0.0),
        (FieldType::Number, SqlValue::Integer(i)) => Value::from(i),
        (FieldType::Number, SqlValue::Real(f)) => number_value(f),
        (FieldType::Json, SqlValue::Text(s)) => {
            serde_json::from_str(&s).unwrap_or(Value::String(s))
        }
        (_, SqlValue::Integer(i)) => Value::String(i.to_string()),
        (_, SqlValue::Real(f)) => Value::String(f.to_string()),
        (_, SqlValue::Text(s)) => Value::String(s),
    }
}

// Integral values come back as JSON integers so that `5` round-trips as `5`
fn number_value(f: f64) -> Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER {
        Value::from(f as i64)
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Parse the accepted datetime spellings into `TIMESTAMP_FORMAT` (UTC)
pub fn normalize_datetime(input: &str) -> Option<String> {
    let input = input.trim();

    let parsed: Option<DateTime<Utc>> = DateTime::parse_from_rfc3339(input)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // "2024-01-02 03:04:05.678Z" and "2024-01-02 03:04:05"
            let naive = input.trim_end_matches('Z');
            NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f"))
                .ok()
                .map(|dt| dt.and_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
        });

    parsed.map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
}
