//! Point encoder
//!
//! Turns an incoming payload into typed points. Accepted shapes:
//! - `[[fields, tags], [fields, tags], ...]` - one point per pair
//! - `[fields, tags]` - one point
//! - `{field: value, ...}` - one point, fields only
//! - a scalar - one point with a single `value` field
//!
//! Numbers become float fields, strings shaped like `-?\d+i` become integer
//! fields, booleans stay booleans. A `time` key in a fields map sets the
//! point timestamp instead of producing a field.

use brivas_influx_sdk::{FieldValue, Point, Precision};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::{Error, Result};

/// Reserved fields-map key carrying the point timestamp
pub const TIME_KEY: &str = "time";

/// Field name used for scalar payloads
pub const SCALAR_FIELD: &str = "value";

/// Payload shape errors
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("payload is empty")]
    EmptyPayload,

    #[error("unsupported payload: {0}")]
    UnsupportedPayload(&'static str),

    #[error("entry {index} is not a [fields, tags] pair: {reason}")]
    InvalidPair { index: usize, reason: &'static str },

    #[error("field '{field}' has unsupported {kind} value")]
    UnsupportedFieldValue { field: String, kind: &'static str },

    #[error("field '{field}' integer literal '{literal}' does not fit in 64 bits")]
    IntegerOutOfRange { field: String, literal: String },

    #[error("tag '{tag}' has unsupported {kind} value")]
    UnsupportedTagValue { tag: String, kind: &'static str },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("entry {index} has no fields")]
    NoFields { index: usize },

    #[error("field and tag names must not be empty")]
    EmptyName,
}

/// Builds points for one measurement target
#[derive(Debug, Clone)]
pub struct PointEncoder {
    default_measurement: Option<String>,
    precision: Precision,
}

impl PointEncoder {
    /// `precision` governs how integer `time` values are interpreted
    pub fn new(default_measurement: Option<String>, precision: Precision) -> Self {
        Self {
            default_measurement: default_measurement.filter(|m| !m.is_empty()),
            precision,
        }
    }

    /// Pick the request's measurement, falling back to the configured default
    pub fn resolve_measurement<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str> {
        requested
            .filter(|m| !m.is_empty())
            .or(self.default_measurement.as_deref())
            .ok_or(Error::MissingMeasurement)
    }

    /// Encode a payload into points; either every point is built or none is
    pub fn encode(&self, measurement: Option<&str>, payload: &Value) -> Result<Vec<Point>> {
        let measurement = self.resolve_measurement(measurement)?;

        let points = match payload {
            Value::Array(items) if items.is_empty() => {
                return Err(EncodingError::EmptyPayload.into());
            }
            Value::Array(items) if is_pair_list(items) => items
                .iter()
                .enumerate()
                .map(|(index, item)| match item {
                    Value::Array(parts) => self.pair_point(measurement, index, parts),
                    _ => Err(EncodingError::InvalidPair {
                        index,
                        reason: "expected an array",
                    }),
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
            Value::Array(parts) => vec![self.pair_point(measurement, 0, parts)?],
            Value::Object(fields) => vec![self.fields_point(measurement, 0, fields, None)?],
            Value::Null => return Err(EncodingError::UnsupportedPayload("null").into()),
            scalar => {
                let mut point = Point::new(measurement);
                point.insert_field(SCALAR_FIELD, field_value(SCALAR_FIELD, scalar)?);
                vec![point]
            }
        };

        Ok(points)
    }

    fn pair_point(
        &self,
        measurement: &str,
        index: usize,
        parts: &[Value],
    ) -> std::result::Result<Point, EncodingError> {
        let fields = match parts.first() {
            Some(Value::Object(fields)) => fields,
            _ => {
                return Err(EncodingError::InvalidPair {
                    index,
                    reason: "first element must be a fields object",
                })
            }
        };

        let tags = match parts.get(1) {
            None | Some(Value::Null) => None,
            Some(Value::Object(tags)) => Some(tags),
            Some(_) => {
                return Err(EncodingError::InvalidPair {
                    index,
                    reason: "second element must be a tags object",
                })
            }
        };

        if parts.len() > 2 {
            return Err(EncodingError::InvalidPair {
                index,
                reason: "more than two elements",
            });
        }

        self.fields_point(measurement, index, fields, tags)
    }

    fn fields_point(
        &self,
        measurement: &str,
        index: usize,
        fields: &Map<String, Value>,
        tags: Option<&Map<String, Value>>,
    ) -> std::result::Result<Point, EncodingError> {
        let mut point = Point::new(measurement);

        for (name, value) in fields {
            if name.is_empty() {
                return Err(EncodingError::EmptyName);
            }
            if name == TIME_KEY {
                point.set_timestamp(self.timestamp(value)?);
            } else {
                point.insert_field(name.as_str(), field_value(name, value)?);
            }
        }

        for (name, value) in tags.into_iter().flatten() {
            if let Some(tag) = tag_value(name, value)? {
                point.insert_tag(name.as_str(), tag);
            }
        }

        if point.fields().is_empty() {
            return Err(EncodingError::NoFields { index });
        }

        Ok(point)
    }

    fn timestamp(&self, value: &Value) -> std::result::Result<DateTime<Utc>, EncodingError> {
        let units = match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => i,
                None => match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => f as i64,
                    _ => return Err(EncodingError::InvalidTimestamp(n.to_string())),
                },
            },
            Value::String(s) => match s.parse::<i64>() {
                Ok(i) => i,
                Err(_) => {
                    let ts = DateTime::parse_from_rfc3339(s)
                        .map(|ts| ts.with_timezone(&Utc))
                        .map_err(|e| EncodingError::InvalidTimestamp(format!("'{}': {}", s, e)))?;
                    // must also be writable at the configured precision
                    return match self.precision.from_datetime(&ts) {
                        Some(_) => Ok(ts),
                        None => Err(EncodingError::InvalidTimestamp(format!(
                            "'{}' is out of range for precision {}",
                            s, self.precision
                        ))),
                    };
                }
            },
            other => return Err(EncodingError::InvalidTimestamp(kind_of(other).to_string())),
        };

        self.precision.to_datetime(units).ok_or_else(|| {
            EncodingError::InvalidTimestamp(format!(
                "{} is out of range for precision {}",
                units, self.precision
            ))
        })
    }
}

/// A list of pairs is recognised by its first entry being a non-empty array
fn is_pair_list(items: &[Value]) -> bool {
    matches!(items.first(), Some(Value::Array(first)) if !first.is_empty())
}

fn field_value(name: &str, value: &Value) -> std::result::Result<FieldValue, EncodingError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .map(FieldValue::Float)
            .ok_or_else(|| EncodingError::UnsupportedFieldValue {
                field: name.to_string(),
                kind: "numeric",
            }),
        Value::String(s) => match integer_literal(s) {
            Some(digits) => digits.parse::<i64>().map(FieldValue::Integer).map_err(|_| {
                EncodingError::IntegerOutOfRange {
                    field: name.to_string(),
                    literal: s.clone(),
                }
            }),
            None => Ok(FieldValue::String(s.clone())),
        },
        Value::Bool(b) => Ok(FieldValue::Boolean(*b)),
        other => Err(EncodingError::UnsupportedFieldValue {
            field: name.to_string(),
            kind: kind_of(other),
        }),
    }
}

/// Returns the signed digits of a `-?\d+i` literal
fn integer_literal(s: &str) -> Option<&str> {
    let digits = s.strip_suffix('i')?;
    let unsigned = digits.strip_prefix('-').unwrap_or(digits);
    if !unsigned.is_empty() && unsigned.bytes().all(|b| b.is_ascii_digit()) {
        Some(digits)
    } else {
        None
    }
}

fn tag_value(name: &str, value: &Value) -> std::result::Result<Option<String>, EncodingError> {
    match value {
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Null => Ok(None),
        other => Err(EncodingError::UnsupportedTagValue {
            tag: name.to_string(),
            kind: kind_of(other),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "numeric",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
