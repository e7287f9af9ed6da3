//! Document engine seam.
//!
//! The server proxies workbook documents through the [`Engine`] and
//! [`Document`] traits and never depends on a concrete engine. The
//! built-in [`json::JsonEngine`] backs documents with JSON workbook
//! files; an external engine plugs in behind the same traits.
//!
//! Closing a document is dropping it.

pub mod cell;
pub mod json;
pub mod sheet;
pub mod workbook;

use std::fmt;
use std::path::Path;

pub use cell::CellValue;
pub use json::JsonEngine;
pub use sheet::Sheet;
pub use workbook::Workbook;

use gridserve_core::SheetRef;

/// Engine-side failure. Validation-grade variants surface to clients
/// as `{"ERROR": msg}`; I/O failures stay server-side.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The requested sheet does not exist in the document.
    UnknownSheet(String),
    /// The payload or the backing file has the wrong shape.
    Malformed(String),
    /// File read/write error.
    Io(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSheet(sheet) => write!(f, "Unknown sheet: {}.", sheet),
            Self::Malformed(msg) => f.write_str(msg),
            Self::Io(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// Opens documents. One engine instance serves the whole process.
pub trait Engine: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn Document>, EngineError>;
}

/// An open document: ordered sheets of sparse cells.
pub trait Document: Send {
    /// Sheet names in workbook order.
    fn sheet_names(&self) -> Vec<String>;

    /// Read one cell. Absent cells read as [`CellValue::Empty`].
    fn read_cell(&self, sheet: &SheetRef, row: usize, col: usize)
        -> Result<CellValue, EngineError>;

    /// Write one cell. Writing [`CellValue::Empty`] clears it.
    fn write_cell(
        &mut self,
        sheet: &SheetRef,
        row: usize,
        col: usize,
        value: CellValue,
    ) -> Result<(), EngineError>;

    /// Save the document's current state to `path`.
    fn save(&self, path: &Path) -> Result<(), EngineError>;
}
