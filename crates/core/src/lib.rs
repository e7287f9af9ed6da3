//! Cell and range addressing.
//!
//! Pure conversions between A1-style reference strings ("B4", "A1:D6")
//! and zero-based numeric indices. No state, no I/O.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Last addressable row index (1,048,576 rows — LibreOffice's limit).
pub const MAX_ROW: usize = 1_048_575;

/// Last addressable column index ("AMJ" — LibreOffice's 1024-column limit).
pub const MAX_COL: usize = 1023;

/// Error for a reference string that does not denote a valid cell or range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressError {
    InvalidReference,
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Wire-visible message; clients match on it.
        match self {
            Self::InvalidReference => write!(f, "Cell range is invalid."),
        }
    }
}

impl std::error::Error for AddressError {}

/// Sheet selector: a zero-based index or a sheet name. Both forms are
/// accepted on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SheetRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for SheetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "#{}", i),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// A single cell position. Both axes are zero-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellAddress {
    pub row: usize,
    pub col: usize,
}

/// A rectangular cell area. `start` is the top-left corner, `end` the
/// bottom-right; a single cell has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRange {
    pub start: CellAddress,
    pub end: CellAddress,
}

/// Classification of a range by the equality of its corners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeShape {
    Single,
    Row,
    Column,
    Grid,
}

impl CellRange {
    pub fn shape(&self) -> RangeShape {
        let same_row = self.start.row == self.end.row;
        let same_col = self.start.col == self.end.col;
        match (same_row, same_col) {
            (true, true) => RangeShape::Single,
            (true, false) => RangeShape::Row,
            (false, true) => RangeShape::Column,
            (false, false) => RangeShape::Grid,
        }
    }

    /// Number of columns covered.
    pub fn width(&self) -> usize {
        self.end.col - self.start.col + 1
    }

    /// Number of rows covered.
    pub fn height(&self) -> usize {
        self.end.row - self.start.row + 1
    }
}

/// Parse a single-cell reference like "B4" or "amj1048576".
///
/// A reference is a run of ASCII letters followed by a run of ASCII
/// digits, nothing else. Letters are case-insensitive and form a
/// bijective base-26 column number (A=0 for the least-significant
/// letter; each more-significant letter contributes `(value + 1) * 26^n`).
/// Digits are a 1-based row number.
pub fn parse_cell(reference: &str) -> Result<CellAddress, AddressError> {
    let split = reference
        .find(|c: char| c.is_ascii_digit())
        .ok_or(AddressError::InvalidReference)?;
    let (letters, digits) = reference.split_at(split);

    if letters.is_empty() || !letters.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AddressError::InvalidReference);
    }
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(AddressError::InvalidReference);
    }
    // MAX_COL is three letters; anything longer is out of range before
    // we even fold (and could overflow on absurd inputs).
    if letters.len() > 3 || digits.len() > 8 {
        return Err(AddressError::InvalidReference);
    }

    let col = letters.chars().fold(0usize, |acc, c| {
        acc * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1)
    }) - 1;

    let row_1based: usize = digits.parse().map_err(|_| AddressError::InvalidReference)?;
    if row_1based == 0 {
        return Err(AddressError::InvalidReference);
    }
    let row = row_1based - 1;

    if row > MAX_ROW || col > MAX_COL {
        return Err(AddressError::InvalidReference);
    }

    Ok(CellAddress { row, col })
}

/// Parse a range reference like "A1:D6". Requires exactly one ':' with a
/// well-formed cell reference on each side. Reversed ranges (end above
/// or left of start) are rejected.
pub fn parse_range(reference: &str) -> Result<CellRange, AddressError> {
    let mut halves = reference.split(':');
    let (left, right) = match (halves.next(), halves.next(), halves.next()) {
        (Some(l), Some(r), None) => (l, r),
        _ => return Err(AddressError::InvalidReference),
    };

    let start = parse_cell(left)?;
    let end = parse_cell(right)?;
    if end.row < start.row || end.col < start.col {
        return Err(AddressError::InvalidReference);
    }

    Ok(CellRange { start, end })
}

/// Parse a reference that may be either a single cell or a range.
/// A lone cell yields a degenerate range with `start == end`.
pub fn parse_reference(reference: &str) -> Result<CellRange, AddressError> {
    if reference.contains(':') {
        parse_range(reference)
    } else {
        let addr = parse_cell(reference)?;
        Ok(CellRange { start: addr, end: addr })
    }
}

/// Convert column index to letter(s): 0 -> A, 25 -> Z, 26 -> AA, etc.
pub fn col_to_letters(col: usize) -> String {
    let mut result = String::new();
    let mut n = col + 1; // 1-indexed for calculation
    while n > 0 {
        n -= 1;
        result.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
    }
    result
}

/// Format a cell address in canonical uppercase A1 notation.
pub fn format_cell(addr: CellAddress) -> String {
    format!("{}{}", col_to_letters(addr.col), addr.row + 1)
}

/// Format a range. Single cells render without a separator.
pub fn format_range(range: &CellRange) -> String {
    if range.start == range.end {
        format_cell(range.start)
    } else {
        format!("{}:{}", format_cell(range.start), format_cell(range.end))
    }
}
