use std::collections::HashMap;

use crate::cell::CellValue;

/// A single sheet: sparse cell storage keyed by (row, col).
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub name: String,
    cells: HashMap<(usize, usize), CellValue>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: HashMap::new(),
        }
    }

    pub fn get(&self, row: usize, col: usize) -> CellValue {
        self.cells.get(&(row, col)).cloned().unwrap_or_default()
    }

    /// Set a cell. Empty values remove the entry so the map stays sparse.
    pub fn set(&mut self, row: usize, col: usize, value: CellValue) {
        if value.is_empty() {
            self.cells.remove(&(row, col));
        } else {
            self.cells.insert((row, col), value);
        }
    }

    /// Smallest (rows, cols) box covering every non-empty cell.
    pub fn extent(&self) -> (usize, usize) {
        self.cells
            .keys()
            .fold((0, 0), |(rows, cols), &(row, col)| {
                (rows.max(row + 1), cols.max(col + 1))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_cells_read_empty() {
        let sheet = Sheet::new("Sheet1");
        assert_eq!(sheet.get(10, 10), CellValue::Empty);
    }

    #[test]
    fn set_then_get() {
        let mut sheet = Sheet::new("Sheet1");
        sheet.set(3, 1, CellValue::Number(5.0));
        assert_eq!(sheet.get(3, 1), CellValue::Number(5.0));
        sheet.set(3, 1, CellValue::Text("x".to_string()));
        assert_eq!(sheet.get(3, 1), CellValue::Text("x".to_string()));
    }

    #[test]
    fn setting_empty_clears_the_cell() {
        let mut sheet = Sheet::new("Sheet1");
        sheet.set(0, 0, CellValue::Number(1.0));
        sheet.set(0, 0, CellValue::Empty);
        assert!(sheet.is_empty());
    }

    #[test]
    fn extent_covers_outermost_cells() {
        let mut sheet = Sheet::new("Sheet1");
        assert_eq!(sheet.extent(), (0, 0));
        sheet.set(2, 0, CellValue::Number(1.0));
        sheet.set(0, 4, CellValue::Number(2.0));
        assert_eq!(sheet.extent(), (3, 5));
    }
}
