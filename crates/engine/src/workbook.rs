use std::path::Path;

use gridserve_core::SheetRef;

use crate::cell::CellValue;
use crate::sheet::Sheet;
use crate::{json, Document, EngineError};

/// An in-memory workbook: ordered sheets, addressable by name or index.
#[derive(Debug, Clone, Default)]
pub struct Workbook {
    sheets: Vec<Sheet>,
}

impl Workbook {
    pub fn new(sheets: Vec<Sheet>) -> Self {
        Self { sheets }
    }

    /// A workbook with one empty sheet of the given name.
    pub fn with_sheet(name: impl Into<String>) -> Self {
        Self {
            sheets: vec![Sheet::new(name)],
        }
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    fn sheet(&self, sheet: &SheetRef) -> Result<&Sheet, EngineError> {
        match sheet {
            SheetRef::Index(i) => self.sheets.get(*i),
            SheetRef::Name(name) => self.sheets.iter().find(|s| s.name == *name),
        }
        .ok_or_else(|| EngineError::UnknownSheet(sheet.to_string()))
    }

    fn sheet_mut(&mut self, sheet: &SheetRef) -> Result<&mut Sheet, EngineError> {
        match sheet {
            SheetRef::Index(i) => self.sheets.get_mut(*i),
            SheetRef::Name(name) => self.sheets.iter_mut().find(|s| s.name == *name),
        }
        .ok_or_else(|| EngineError::UnknownSheet(sheet.to_string()))
    }
}

impl Document for Workbook {
    fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }

    fn read_cell(
        &self,
        sheet: &SheetRef,
        row: usize,
        col: usize,
    ) -> Result<CellValue, EngineError> {
        Ok(self.sheet(sheet)?.get(row, col))
    }

    fn write_cell(
        &mut self,
        sheet: &SheetRef,
        row: usize,
        col: usize,
        value: CellValue,
    ) -> Result<(), EngineError> {
        self.sheet_mut(sheet)?.set(row, col, value);
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<(), EngineError> {
        json::save_workbook(self, path)
    }
}
