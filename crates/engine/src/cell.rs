use serde_json::Value;

use crate::EngineError;

/// A cell's stored value.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
}

impl Default for CellValue {
    fn default() -> Self {
        CellValue::Empty
    }
}

impl CellValue {
    /// Convert a wire scalar into a cell value.
    ///
    /// A string that parses as a number is coerced to a number; any
    /// other string stays text. Only null, numbers, and strings are
    /// scalars — arrays, objects, and booleans are shape errors here.
    pub fn from_json(value: &Value) -> Result<Self, EngineError> {
        match value {
            Value::Null => Ok(CellValue::Empty),
            Value::Number(n) => n
                .as_f64()
                .map(CellValue::Number)
                .ok_or_else(|| EngineError::Malformed("Expected a scalar value.".to_string())),
            Value::String(s) => {
                if let Ok(num) = s.trim().parse::<f64>() {
                    Ok(CellValue::Number(num))
                } else {
                    Ok(CellValue::Text(s.clone()))
                }
            }
            _ => Err(EngineError::Malformed("Expected a scalar value.".to_string())),
        }
    }

    /// Convert to a wire scalar. Empty cells are null; a non-finite
    /// number has no JSON representation and also becomes null.
    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Empty => Value::Null,
            CellValue::Text(s) => Value::String(s.clone()),
            CellValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }
}
