//! Cell addressing: references, regions, and A1/R1C1 text classification.
//!
//! Two address flavors exist on purpose:
//! - `CellRef` names the sheet by *name* and is the public lookup key.
//!   Sheet names key the evaluator caches because document-model sheet
//!   objects are not reliably identity-comparable across reads.
//! - `CellAddress` uses the workbook sheet *index* and anchors formula
//!   evaluation (relative references resolve against it).

use serde::{Deserialize, Serialize};

/// Highest zero-based row index of the file format (XLSX: 1,048,576 rows).
pub const LAST_ROW: usize = 1_048_575;
/// Highest zero-based column index of the file format (XLSX: XFD).
pub const LAST_COL: usize = 16_383;

/// A cell named by sheet name, for public lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRef {
    pub sheet: String,
    pub row: usize,
    pub col: usize,
}

impl CellRef {
    pub fn new(sheet: impl Into<String>, row: usize, col: usize) -> Self {
        Self { sheet: sheet.into(), row, col }
    }
}

/// A cell named by workbook sheet index. Never mutated after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellAddress {
    pub sheet: usize,
    pub row: usize,
    pub col: usize,
}

impl CellAddress {
    pub fn new(sheet: usize, row: usize, col: usize) -> Self {
        Self { sheet, row, col }
    }
}

/// A rectangular block of cells on one sheet, bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub first_row: usize,
    pub first_col: usize,
    pub last_row: usize,
    pub last_col: usize,
}

impl Region {
    pub fn new(first_row: usize, first_col: usize, last_row: usize, last_col: usize) -> Self {
        Self {
            first_row: first_row.min(last_row),
            first_col: first_col.min(last_col),
            last_row: first_row.max(last_row),
            last_col: first_col.max(last_col),
        }
    }

    /// Single-cell region.
    pub fn cell(row: usize, col: usize) -> Self {
        Self::new(row, col, row, col)
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.first_row && row <= self.last_row && col >= self.first_col && col <= self.last_col
    }

    pub fn width(&self) -> usize {
        self.last_col - self.first_col + 1
    }

    pub fn height(&self) -> usize {
        self.last_row - self.first_row + 1
    }
}

// =============================================================================
// Reference text classification
// =============================================================================

/// What a single reference fragment names, in A1 or R1C1 syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefClass {
    Cell,
    Row,
    Column,
    NamedRange,
    Bad,
}

/// Convert column letters ("A", "BC") to a zero-based index.
///
/// Returns None for empty input or non-letter characters.
pub fn col_from_letters(text: &str) -> Option<usize> {
    if text.is_empty() {
        return None;
    }
    let mut col: usize = 0;
    for ch in text.chars() {
        if !ch.is_ascii_alphabetic() {
            return None;
        }
        let digit = ch.to_ascii_uppercase() as usize - 'A' as usize + 1;
        col = col.checked_mul(26)?.checked_add(digit)?;
    }
    Some(col - 1)
}

/// Convert a zero-based column index to letters.
pub fn col_to_letters(mut col: usize) -> String {
    let mut out = String::new();
    loop {
        out.insert(0, (b'A' + (col % 26) as u8) as char);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    out
}

/// Drop a leading `$` absolute marker.
pub fn strip_dollar(text: &str) -> &str {
    text.strip_prefix('$').unwrap_or(text)
}

fn is_valid_name(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' || c == '\\' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

/// Classify an A1-style reference fragment.
///
/// A fragment that parses as a cell within the file format's bounds is a
/// cell; letters-only within the column bound is a column; digits-only
/// within the row bound is a row. Anything else that is a legal defined
/// name classifies as a named range.
pub fn classify_a1(text: &str) -> RefClass {
    if text.is_empty() {
        return RefClass::Bad;
    }
    let body = strip_dollar(text);
    if !body.is_empty() && body.chars().all(|c| c.is_ascii_alphabetic()) {
        return match col_from_letters(body) {
            Some(c) if c <= LAST_COL => RefClass::Column,
            _ if is_valid_name(text) => RefClass::NamedRange,
            _ => RefClass::Bad,
        };
    }
    if !body.is_empty() && body.chars().all(|c| c.is_ascii_digit()) {
        return match body.parse::<usize>() {
            Ok(n) if n >= 1 && n - 1 <= LAST_ROW => RefClass::Row,
            _ => RefClass::Bad,
        };
    }
    if parse_a1_cell(text).is_some() {
        return RefClass::Cell;
    }
    if is_valid_name(text) {
        return RefClass::NamedRange;
    }
    RefClass::Bad
}

/// Parse an A1-style single-cell reference ("B7", "$C$12") to (row, col).
pub fn parse_a1_cell(text: &str) -> Option<(usize, usize)> {
    let body = strip_dollar(text);
    let split = body.find(|c: char| !c.is_ascii_alphabetic())?;
    let (letters, rest) = body.split_at(split);
    let digits = strip_dollar(rest);
    if letters.is_empty() || digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let col = col_from_letters(letters)?;
    let row: usize = digits.parse().ok()?;
    if row < 1 || row - 1 > LAST_ROW || col > LAST_COL {
        return None;
    }
    Some((row - 1, col))
}

/// Byte offset of a marker letter, either case.
pub fn find_marker(text: &str, marker: char) -> Option<usize> {
    text.char_indices()
        .find(|(_, c)| c.eq_ignore_ascii_case(&marker))
        .map(|(i, _)| i)
}

/// Classify an R1C1-style reference fragment.
///
/// Presence of `R`/`C` markers decides the class; the numeric parts are
/// validated later when the reference is applied to an anchor.
pub fn classify_r1c1(text: &str) -> RefClass {
    let has_r = find_marker(text, 'R').is_some();
    let has_c = find_marker(text, 'C').is_some();
    match (has_r, has_c) {
        (true, true) => RefClass::Cell,
        (true, false) => RefClass::Row,
        (false, true) => RefClass::Column,
        (false, false) => RefClass::Bad,
    }
}

/// Parse one R1C1 axis component: absolute (`5` = 1-based) or bracketed
/// relative (`[-2]`), applied against `anchor` (zero-based).
///
/// An empty component means "same as anchor". Returns None on garbage.
pub fn apply_r1c1_axis(component: &str, anchor: usize) -> Option<usize> {
    let trimmed = component.trim();
    if trimmed.is_empty() {
        return Some(anchor);
    }
    if let Some(inner) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
        let delta: i64 = inner.trim().parse().ok()?;
        let shifted = anchor as i64 + delta;
        if shifted < 0 {
            return None;
        }
        return Some(shifted as usize);
    }
    let absolute: usize = trimmed.parse().ok()?;
    if absolute < 1 {
        return None;
    }
    Some(absolute - 1)
}

/// Apply a full R1C1 cell reference ("R2C4", "R[-1]C[2]") to an anchor.
///
/// Returns None if the text lacks the `R...C...` shape or a component
/// fails to parse even as a fallback.
pub fn apply_r1c1_cell(text: &str, anchor_row: usize, anchor_col: usize) -> Option<(usize, usize)> {
    let rpos = find_marker(text, 'R')?;
    let cpos = find_marker(text, 'C')?;
    if cpos <= rpos {
        return None;
    }
    let rval = &text[rpos + 1..cpos];
    let cval = &text[cpos + 1..];
    let row = apply_r1c1_axis(rval, anchor_row)?;
    let col = apply_r1c1_axis(cval, anchor_col)?;
    Some((row, col))
}
