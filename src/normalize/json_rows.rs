use crate::normalize::{FlatRecord, Scalar, conform_columns, normalize_column_name};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JsonRowsError {
    #[error("report JSON could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("report JSON is not an array of objects")]
    NotRows,
}

/// Flattens a JSON report (array of objects) into rows with snake_case columns.
/// Nested objects become `<parent>_<child>` columns; arrays are kept as JSON text.
pub fn parse_json_rows(bytes: &[u8]) -> Result<Vec<FlatRecord>, JsonRowsError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Array(items) = value else {
        return Err(JsonRowsError::NotRows);
    };
    let mut records = Vec::with_capacity(items.len());
    for item in &items {
        let Value::Object(map) = item else {
            return Err(JsonRowsError::NotRows);
        };
        let mut record = FlatRecord::new();
        flatten_into(&mut record, "", map);
        records.push(record);
    }
    Ok(conform_columns(records))
}

fn flatten_into(record: &mut FlatRecord, prefix: &str, map: &Map<String, Value>) {
    for (key, value) in map {
        let column = if prefix.is_empty() {
            normalize_column_name(key)
        } else {
            format!("{prefix}_{}", normalize_column_name(key))
        };
        match value {
            Value::Object(inner) => flatten_into(record, &column, inner),
            Value::Null => record.insert(column, Scalar::empty()),
            Value::Bool(b) => record.insert(column, b.to_string()),
            Value::Number(n) => match n.as_i64() {
                Some(i) => record.insert(column, Scalar::Int(i)),
                None => record.insert(column, Scalar::Float(n.as_f64().unwrap_or(0.0))),
            },
            Value::String(s) => record.insert(column, s.as_str()),
            Value::Array(_) => record.insert(column, value.to_string()),
        }
    }
}
