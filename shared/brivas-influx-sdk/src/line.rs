//! Line protocol serialization

use std::fmt::Write;

use crate::{FieldValue, InfluxError, Point, Precision, Result};

const MEASUREMENT_SPECIAL: &[char] = &[',', ' '];
const KEY_SPECIAL: &[char] = &[',', '=', ' '];

impl Point {
    /// Render the point as one line-protocol record
    ///
    /// Tags with an empty key or value are omitted. A point without fields
    /// cannot be written and is rejected.
    pub fn to_line_protocol(&self, precision: Precision) -> Result<String> {
        if self.measurement().is_empty() {
            return Err(InfluxError::InvalidPoint("empty measurement name".into()));
        }
        if self.fields().is_empty() {
            return Err(InfluxError::InvalidPoint(format!(
                "point '{}' has no fields",
                self.measurement()
            )));
        }

        let mut line = String::with_capacity(64);
        escape_into(&mut line, self.measurement(), MEASUREMENT_SPECIAL);

        for (key, value) in self.tags() {
            if key.is_empty() || value.is_empty() {
                continue;
            }
            line.push(',');
            escape_into(&mut line, key, KEY_SPECIAL);
            line.push('=');
            escape_into(&mut line, value, KEY_SPECIAL);
        }

        line.push(' ');
        for (i, (key, value)) in self.fields().iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            escape_into(&mut line, key, KEY_SPECIAL);
            line.push('=');
            write_field_value(&mut line, key, value)?;
        }

        if let Some(timestamp) = self.timestamp() {
            let value = precision.from_datetime(&timestamp).ok_or_else(|| {
                InfluxError::InvalidPoint(format!(
                    "timestamp {} is out of range for precision {}",
                    timestamp, precision
                ))
            })?;
            let _ = write!(line, " {}", value);
        }

        Ok(line)
    }
}

fn write_field_value(out: &mut String, key: &str, value: &FieldValue) -> Result<()> {
    match value {
        FieldValue::Float(v) => {
            if !v.is_finite() {
                return Err(InfluxError::InvalidPoint(format!(
                    "field '{}' is not a finite number",
                    key
                )));
            }
            let _ = write!(out, "{}", v);
        }
        FieldValue::Integer(v) => {
            let _ = write!(out, "{}i", v);
        }
        FieldValue::Boolean(v) => out.push_str(if *v { "true" } else { "false" }),
        FieldValue::String(v) => {
            out.push('"');
            for c in v.chars() {
                if c == '"' || c == '\\' {
                    out.push('\\');
                }
                out.push(c);
            }
            out.push('"');
        }
    }
    Ok(())
}

fn escape_into(out: &mut String, raw: &str, special: &[char]) {
    for c in raw.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if special.contains(&c) => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
}
