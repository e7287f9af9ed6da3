//! JSON workbook files.
//!
//! Two accepted shapes:
//! - a bare array of row arrays — a single sheet named "Sheet1";
//! - an array of `{"name": ..., "rows": [[...]]}` objects, one per
//!   sheet, in workbook order.
//!
//! Saving always writes the named form.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde_json::Value;

use crate::cell::CellValue;
use crate::sheet::Sheet;
use crate::workbook::Workbook;
use crate::{Document, Engine, EngineError};

/// The built-in engine. Stateless; every `open` loads a fresh document.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEngine;

impl Engine for JsonEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn Document>, EngineError> {
        Ok(Box::new(load_workbook(path)?))
    }
}

fn sheet_from_rows(name: &str, rows: &[Value]) -> Result<Sheet, EngineError> {
    let mut sheet = Sheet::new(name);
    for (row_idx, row) in rows.iter().enumerate() {
        let cells = row.as_array().ok_or_else(|| {
            EngineError::Malformed(format!("sheet '{}': row {} is not an array", name, row_idx))
        })?;
        for (col_idx, cell) in cells.iter().enumerate() {
            sheet.set(row_idx, col_idx, CellValue::from_json(cell)?);
        }
    }
    Ok(sheet)
}

/// Load a workbook from a JSON file.
pub fn load_workbook(path: &Path) -> Result<Workbook, EngineError> {
    let file = File::open(path).map_err(|e| EngineError::Io(e.to_string()))?;
    let value: Value = serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| EngineError::Malformed(format!("{}: {}", path.display(), e)))?;

    let entries = value.as_array().ok_or_else(|| {
        EngineError::Malformed(format!("{}: workbook must be a JSON array", path.display()))
    })?;

    // Bare array-of-arrays is the single-sheet shorthand.
    if entries.iter().all(Value::is_array) {
        return Ok(Workbook::new(vec![sheet_from_rows("Sheet1", entries)?]));
    }

    let mut sheets = Vec::with_capacity(entries.len());
    for entry in entries {
        let obj = entry.as_object().ok_or_else(|| {
            EngineError::Malformed(format!(
                "{}: sheet entry must be an object with name and rows",
                path.display()
            ))
        })?;
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Malformed(format!("{}: sheet is missing a name", path.display())))?;
        let rows = obj
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::Malformed(format!("{}: sheet '{}' is missing rows", path.display(), name)))?;
        sheets.push(sheet_from_rows(name, rows)?);
    }

    if sheets.is_empty() {
        return Err(EngineError::Malformed(format!(
            "{}: workbook has no sheets",
            path.display()
        )));
    }

    Ok(Workbook::new(sheets))
}

fn sheet_rows(sheet: &Sheet) -> Vec<Vec<Value>> {
    let (rows, cols) = sheet.extent();
    let mut out = Vec::with_capacity(rows);
    for row in 0..rows {
        let mut record: Vec<Value> = Vec::new();
        let mut last_non_empty = 0;
        for col in 0..cols {
            let value = sheet.get(row, col);
            if !value.is_empty() {
                last_non_empty = col + 1;
            }
            record.push(value.to_json());
        }
        // Trim trailing empty cells
        record.truncate(last_non_empty);
        out.push(record);
    }
    out
}

/// Save a workbook to `path` in the named multi-sheet form.
pub fn save_workbook(workbook: &Workbook, path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Io(e.to_string()))?;
        }
    }

    let entries: Vec<Value> = workbook
        .sheets()
        .iter()
        .map(|sheet| {
            serde_json::json!({
                "name": sheet.name,
                "rows": sheet_rows(sheet),
            })
        })
        .collect();

    let file = File::create(path).map_err(|e| EngineError::Io(e.to_string()))?;
    let writer = BufWriter::new(file);
    serde_json::to_writer_pretty(writer, &entries)
        .map_err(|e| EngineError::Io(e.to_string()))?;
    Ok(())
}
