//! Lazy reference resolution across sheets and workbooks.
//!
//! References never materialize cell data: `RefHandle` and `AreaHandle`
//! store coordinates plus a shared `SheetRange`, and fetch values on
//! demand from the per-sheet sources the recalculation engine provides.
//! Sub-ranges are new handles over the same range, so whole-row and
//! whole-column references stay cheap.
//!
//! ## Failure modes
//!
//! Lookup failures that happen *during* formula evaluation (a missing
//! linked workbook, an unknown sheet in a dynamic reference) become
//! `Value::Error(Ref)` so one broken link does not halt evaluation of
//! the rest of the sheet. The same failures while explicitly
//! constructing a resolver are `ResolveError` faults.

use std::fmt;
use std::rc::Rc;

use crate::addr::{
    apply_r1c1_axis, apply_r1c1_cell, classify_a1, classify_r1c1, col_from_letters, parse_a1_cell,
    strip_dollar, CellAddress, RefClass, Region, LAST_COL, LAST_ROW,
};
use crate::eval::{ErrorKind, Value};
use crate::model::{NameDefinition, Recalc, SheetValues};

// =============================================================================
// Errors
// =============================================================================

/// Structural resolution failures. These indicate a corrupt document or
/// a caller bug, not a normal spreadsheet state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// A linked workbook is not part of the evaluation environment.
    WorkbookNotFound(String),
    /// A sheet name does not exist in its workbook.
    SheetNotFound(String),
    /// Malformed input: empty sheet spans, out-of-extent slices,
    /// unparsable R1C1 text, missing named ranges.
    InvalidArgument(String),
    /// A resolution path the engine does not implement.
    NotSupported(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::WorkbookNotFound(name) => write!(f, "workbook not found: {}", name),
            ResolveError::SheetNotFound(name) => write!(f, "sheet not found: {}", name),
            ResolveError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            ResolveError::NotSupported(msg) => write!(f, "not supported: {}", msg),
        }
    }
}

impl std::error::Error for ResolveError {}

// =============================================================================
// Sheet spans
// =============================================================================

/// Textual description of a sheet span, before resolution.
///
/// All fields default to "current": no workbook means this workbook, no
/// first sheet means the anchor's sheet, no last sheet means a single
/// sheet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetSpec {
    pub workbook: Option<String>,
    pub first_sheet: Option<String>,
    pub last_sheet: Option<String>,
}

impl SheetSpec {
    /// The anchor's own sheet.
    pub fn current() -> Self {
        Self::default()
    }

    /// A single named sheet in this workbook.
    pub fn sheet(name: impl Into<String>) -> Self {
        Self { first_sheet: Some(name.into()), ..Self::default() }
    }

    /// A 3-D span of sheets in this workbook.
    pub fn span(first: impl Into<String>, last: impl Into<String>) -> Self {
        Self {
            first_sheet: Some(first.into()),
            last_sheet: Some(last.into()),
            ..Self::default()
        }
    }

    /// A sheet in a linked workbook.
    pub fn external(workbook: impl Into<String>, sheet: impl Into<String>) -> Self {
        Self {
            workbook: Some(workbook.into()),
            first_sheet: Some(sheet.into()),
            ..Self::default()
        }
    }
}

/// A cross-workbook name or function token awaiting resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameToken {
    pub workbook: Option<String>,
    pub sheet: Option<String>,
    pub name: String,
}

impl NameToken {
    pub fn local(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Self::default() }
    }

    pub fn external(workbook: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workbook: Some(workbook.into()),
            name: name.into(),
            ..Self::default()
        }
    }
}

/// A resolved, closed interval of sheets with one value source per
/// index. The interval is contiguous by construction.
#[derive(Clone)]
pub struct SheetRange {
    first_sheet: usize,
    sheets: Vec<Rc<dyn SheetValues>>,
}

impl fmt::Debug for SheetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SheetRange({}..={})", self.first_sheet, self.last_sheet_index())
    }
}

impl SheetRange {
    /// Build a range from contiguous per-sheet sources.
    ///
    /// Fails with invalid-argument if the list is empty or the sources'
    /// indices are not consecutive.
    pub fn new(sheets: Vec<Rc<dyn SheetValues>>) -> Result<Self, ResolveError> {
        let first = match sheets.first() {
            Some(s) => s.sheet_index(),
            None => {
                return Err(ResolveError::InvalidArgument(
                    "sheet range requires at least one sheet".to_string(),
                ))
            }
        };
        for (i, sheet) in sheets.iter().enumerate() {
            if sheet.sheet_index() != first + i {
                return Err(ResolveError::InvalidArgument(format!(
                    "sheet range indices not contiguous at position {}",
                    i
                )));
            }
        }
        Ok(Self { first_sheet: first, sheets })
    }

    pub fn single(sheet: Rc<dyn SheetValues>) -> Self {
        Self { first_sheet: sheet.sheet_index(), sheets: vec![sheet] }
    }

    pub fn first_sheet_index(&self) -> usize {
        self.first_sheet
    }

    pub fn last_sheet_index(&self) -> usize {
        self.first_sheet + self.sheets.len() - 1
    }

    pub fn is_single_sheet(&self) -> bool {
        self.sheets.len() == 1
    }

    /// Value at (row, col) on an absolute sheet index, `#REF!` outside
    /// the span.
    pub fn value_at(&self, sheet_index: usize, row: usize, col: usize) -> Value {
        match sheet_index
            .checked_sub(self.first_sheet)
            .and_then(|i| self.sheets.get(i))
        {
            Some(sheet) => sheet.value_at(row, col),
            None => Value::Error(ErrorKind::Ref),
        }
    }

    /// Value on the first sheet of the span.
    pub fn first_value_at(&self, row: usize, col: usize) -> Value {
        self.sheets[0].value_at(row, col)
    }

    /// Clamp a row index to the highest row actually used by any sheet
    /// in the range.
    ///
    /// Whole-column references nominally run to the file format's row
    /// limit; iterating that far over sparse sheets is wasted work, so
    /// callers clamp first. Rows below the used extent pass through
    /// unchanged.
    pub fn adjust_row_number(&self, row: usize) -> usize {
        let max_used = self
            .sheets
            .iter()
            .map(|s| s.last_used_row())
            .max()
            .unwrap_or(0);
        row.min(max_used)
    }
}

// =============================================================================
// Lazy handles
// =============================================================================

/// Lazy single-cell reference. Owns coordinates only.
#[derive(Debug, Clone)]
pub struct RefHandle {
    range: Rc<SheetRange>,
    row: usize,
    col: usize,
}

impl RefHandle {
    pub fn new(range: Rc<SheetRange>, row: usize, col: usize) -> Self {
        Self { range, row, col }
    }

    pub fn row(&self) -> usize {
        self.row
    }

    pub fn col(&self) -> usize {
        self.col
    }

    pub fn first_sheet_index(&self) -> usize {
        self.range.first_sheet_index()
    }

    /// The referenced value on the first sheet of the span.
    pub fn value(&self) -> Value {
        self.range.first_value_at(self.row, self.col)
    }

    /// The referenced value on a specific sheet, falling back to the
    /// first sheet when the index is outside the span.
    pub fn value_on_sheet(&self, sheet_index: usize) -> Value {
        if sheet_index >= self.range.first_sheet_index() && sheet_index <= self.range.last_sheet_index()
        {
            self.range.value_at(sheet_index, self.row, self.col)
        } else {
            self.value()
        }
    }

    pub fn same_location(&self, other: &RefHandle) -> bool {
        self.row == other.row
            && self.col == other.col
            && self.range.first_sheet_index() == other.range.first_sheet_index()
            && self.range.last_sheet_index() == other.range.last_sheet_index()
    }
}

/// Lazy rectangular reference. Owns coordinates plus a shared
/// `SheetRange`; values are fetched on demand, never copied.
#[derive(Debug, Clone)]
pub struct AreaHandle {
    range: Rc<SheetRange>,
    region: Region,
}

impl AreaHandle {
    pub fn new(range: Rc<SheetRange>, region: Region) -> Self {
        Self { range, region }
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn width(&self) -> usize {
        self.region.width()
    }

    pub fn height(&self) -> usize {
        self.region.height()
    }

    pub fn first_sheet_index(&self) -> usize {
        self.range.first_sheet_index()
    }

    /// Value at a position relative to the area anchor, on the first
    /// sheet of the span. Absolute = anchor + relative.
    pub fn value_at(&self, rel_row: usize, rel_col: usize) -> Value {
        self.range
            .first_value_at(self.region.first_row + rel_row, self.region.first_col + rel_col)
    }

    /// Like `value_at`, for a specific sheet in the span.
    pub fn value_on_sheet(&self, sheet_index: usize, rel_row: usize, rel_col: usize) -> Value {
        self.range.value_at(
            sheet_index,
            self.region.first_row + rel_row,
            self.region.first_col + rel_col,
        )
    }

    /// A new handle shifted and resized relative to this one, over the
    /// same sheet range. May extend past the current extent.
    pub fn offset(
        &self,
        rel_first_row: usize,
        rel_last_row: usize,
        rel_first_col: usize,
        rel_last_col: usize,
    ) -> AreaHandle {
        AreaHandle::new(
            self.range.clone(),
            Region::new(
                self.region.first_row + rel_first_row,
                self.region.first_col + rel_first_col,
                self.region.first_row + rel_last_row,
                self.region.first_col + rel_last_col,
            ),
        )
    }

    /// One row of the area as a new handle. Fails past the extent.
    pub fn row(&self, rel_row: usize) -> Result<AreaHandle, ResolveError> {
        if rel_row >= self.height() {
            return Err(ResolveError::InvalidArgument(format!(
                "row {} outside area of height {}",
                rel_row,
                self.height()
            )));
        }
        Ok(self.offset(rel_row, rel_row, 0, self.width() - 1))
    }

    /// One column of the area as a new handle. Fails past the extent.
    pub fn column(&self, rel_col: usize) -> Result<AreaHandle, ResolveError> {
        if rel_col >= self.width() {
            return Err(ResolveError::InvalidArgument(format!(
                "column {} outside area of width {}",
                rel_col,
                self.width()
            )));
        }
        Ok(self.offset(0, self.height() - 1, rel_col, rel_col))
    }

    pub fn same_location(&self, other: &AreaHandle) -> bool {
        self.region == other.region
            && self.range.first_sheet_index() == other.range.first_sheet_index()
            && self.range.last_sheet_index() == other.range.last_sheet_index()
    }
}

/// Unwrap one level of reference indirection: a single-cell handle
/// becomes its value. One bounded step, not a fixpoint; chained
/// multi-hop references stay wrapped.
pub fn unwrap_reference(value: Value) -> Value {
    match value {
        Value::Ref(handle) => handle.value(),
        other => other,
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves sheet spans, dynamic reference text, and cross-workbook
/// name tokens against an anchor cell.
pub struct RefResolver {
    book: Rc<dyn Recalc>,
    anchor: CellAddress,
}

impl RefResolver {
    pub fn new(book: Rc<dyn Recalc>, anchor: CellAddress) -> Self {
        Self { book, anchor }
    }

    pub fn anchor(&self) -> CellAddress {
        self.anchor
    }

    /// Resolve a sheet span to value sources.
    ///
    /// Same-workbook, same-sheet, 3-D, and cross-workbook specs are all
    /// constructible. Missing workbooks and sheets are faults here;
    /// during formula evaluation use `dynamic_reference`, which turns
    /// them into `#REF!` values instead.
    pub fn sheet_range(&self, spec: &SheetSpec) -> Result<SheetRange, ResolveError> {
        let target: Rc<dyn Recalc> = match &spec.workbook {
            None => self.book.clone(),
            Some(name) => self.book.other_workbook(name)?,
        };
        let first = match &spec.first_sheet {
            Some(name) => target
                .sheet_index(name)
                .ok_or_else(|| ResolveError::SheetNotFound(name.clone()))?,
            None => {
                if spec.workbook.is_some() {
                    return Err(ResolveError::InvalidArgument(
                        "sheet name required with a workbook name".to_string(),
                    ));
                }
                self.anchor.sheet
            }
        };
        let last = match &spec.last_sheet {
            Some(name) => target
                .sheet_index(name)
                .ok_or_else(|| ResolveError::SheetNotFound(name.clone()))?,
            None => first,
        };
        if last < first {
            return Err(ResolveError::InvalidArgument(format!(
                "sheet span runs backwards ({} before {})",
                last, first
            )));
        }
        let mut sheets = Vec::with_capacity(last - first + 1);
        for index in first..=last {
            let values = target
                .sheet_values(index)
                .ok_or_else(|| ResolveError::SheetNotFound(format!("sheet index {}", index)))?;
            sheets.push(values);
        }
        SheetRange::new(sheets)
    }

    /// The anchor's own sheet as a single-sheet range.
    pub fn current_sheet_range(&self) -> Result<SheetRange, ResolveError> {
        self.sheet_range(&SheetSpec::current())
    }

    /// Lazy single-cell reference on the anchor's sheet.
    pub fn cell_ref(&self, row: usize, col: usize) -> Result<Value, ResolveError> {
        let range = Rc::new(self.current_sheet_range()?);
        Ok(Value::Ref(RefHandle::new(range, row, col)))
    }

    /// Lazy area on an already-resolved sheet range.
    pub fn area(&self, range: SheetRange, region: Region) -> Value {
        Value::Area(AreaHandle::new(Rc::new(range), region))
    }

    /// Resolve reference text (one fragment, or two around `:`) to a
    /// lazy handle.
    ///
    /// Grammatically-invalid text yields `Ok(Value::Error(Ref))` so
    /// `#REF!` keeps propagating through formula evaluation. Faults are
    /// reserved for structural problems: a named range that does not
    /// exist, or R1C1 text unparsable even as a fallback.
    pub fn dynamic_reference(
        &self,
        workbook: Option<&str>,
        sheet: Option<&str>,
        part1: &str,
        part2: Option<&str>,
        a1_style: bool,
    ) -> Result<Value, ResolveError> {
        if workbook.is_some() && sheet.is_none() {
            return Err(ResolveError::InvalidArgument(
                "sheet name required with a workbook name".to_string(),
            ));
        }
        let range = match self.dynamic_sheet_range(workbook, sheet) {
            Some(range) => Rc::new(range),
            None => return Ok(Value::Error(ErrorKind::Ref)),
        };

        let class1 = if a1_style { classify_a1(part1) } else { classify_r1c1(part1) };
        match class1 {
            RefClass::Bad => return Ok(Value::Error(ErrorKind::Ref)),
            RefClass::NamedRange => {
                return self
                    .book
                    .evaluate_name(part1, Some(self.anchor.sheet))
                    .ok_or_else(|| {
                        ResolveError::InvalidArgument(format!("name '{}' is not defined", part1))
                    });
            }
            _ => {}
        }

        let part2 = match part2 {
            Some(text) => text,
            None => return self.single_part_reference(range, part1, class1, a1_style),
        };

        let class2 = if a1_style { classify_a1(part2) } else { classify_r1c1(part2) };
        match class2 {
            RefClass::Bad => return Ok(Value::Error(ErrorKind::Ref)),
            RefClass::NamedRange => {
                return Err(ResolveError::NotSupported(format!(
                    "indirect evaluation of defined name '{}'",
                    part2
                )));
            }
            _ => {}
        }
        if class1 != class2 {
            // Both sides of ':' must name the same kind of thing.
            return Ok(Value::Error(ErrorKind::Ref));
        }

        let region = match class1 {
            RefClass::Column => {
                let first = match self.parse_column(part1, a1_style) {
                    Some(col) => col,
                    None => return Ok(Value::Error(ErrorKind::Ref)),
                };
                let last = match self.parse_column(part2, a1_style) {
                    Some(col) => col,
                    None => return Ok(Value::Error(ErrorKind::Ref)),
                };
                Region::new(0, first, range.adjust_row_number(LAST_ROW), last)
            }
            RefClass::Row => {
                let first = match self.parse_row(part1, a1_style) {
                    Some(row) => row,
                    None => return Ok(Value::Error(ErrorKind::Ref)),
                };
                let last = match self.parse_row(part2, a1_style) {
                    Some(row) => row,
                    None => return Ok(Value::Error(ErrorKind::Ref)),
                };
                Region::new(first, 0, last, LAST_COL)
            }
            RefClass::Cell => {
                let (first_row, first_col) = self.parse_cell(part1, a1_style)?;
                let (last_row, last_col) = self.parse_cell(part2, a1_style)?;
                Region::new(first_row, first_col, last_row, last_col)
            }
            RefClass::NamedRange | RefClass::Bad => unreachable!(),
        };
        Ok(Value::Area(AreaHandle::new(range, region)))
    }

    /// Resolve a cross-workbook name or function token.
    ///
    /// Names in the current workbook resolve locally, falling back to
    /// the registered add-in functions. Cross-workbook
    /// tokens do a one-hop lookup in the other workbook's name table; a
    /// reference-valued name evaluates in that workbook's context.
    /// Deeper indirection is not supported.
    pub fn external_name(&self, token: &NameToken) -> Result<Value, ResolveError> {
        let workbook = match &token.workbook {
            Some(name) => name,
            None => return Ok(self.local_name(token)),
        };
        let other = match self.book.other_workbook(workbook) {
            Ok(book) => book,
            // a missing linked workbook surfaces as #REF! mid-evaluation
            Err(_) => return Ok(Value::Error(ErrorKind::Ref)),
        };
        let sheet_index = token.sheet.as_deref().and_then(|s| other.sheet_index(s));
        match other.name_definition(&token.name, sheet_index) {
            None => Ok(Value::Error(ErrorKind::Ref)),
            Some(NameDefinition::Cell { sheet, row, col }) => {
                match Self::range_over(&other, &sheet, None) {
                    Some(range) => Ok(Value::Ref(RefHandle::new(Rc::new(range), row, col))),
                    None => Ok(Value::Error(ErrorKind::Ref)),
                }
            }
            Some(NameDefinition::Area { first_sheet, last_sheet, region }) => {
                match Self::range_over(&other, &first_sheet, last_sheet.as_deref()) {
                    Some(range) => Ok(Value::Area(AreaHandle::new(Rc::new(range), region))),
                    None => Ok(Value::Error(ErrorKind::Ref)),
                }
            }
            Some(NameDefinition::Formula(_)) => Err(ResolveError::NotSupported(format!(
                "complex name formula for '{}' in workbook '{}'",
                token.name, workbook
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Sheet resolution inside formula evaluation: every failure is
    /// None, which callers turn into `#REF!`.
    fn dynamic_sheet_range(&self, workbook: Option<&str>, sheet: Option<&str>) -> Option<SheetRange> {
        let target: Rc<dyn Recalc> = match workbook {
            None => self.book.clone(),
            Some(name) => self.book.other_workbook(name).ok()?,
        };
        let index = match sheet {
            Some(name) => target.sheet_index(name)?,
            None => self.anchor.sheet,
        };
        Some(SheetRange::single(target.sheet_values(index)?))
    }

    fn single_part_reference(
        &self,
        range: Rc<SheetRange>,
        part1: &str,
        class: RefClass,
        a1_style: bool,
    ) -> Result<Value, ResolveError> {
        match class {
            RefClass::Column => {
                if a1_style {
                    // a lone column letter is not a valid dynamic ref in A1
                    return Ok(Value::Error(ErrorKind::Ref));
                }
                let col = match self.r1c1_component(part1, 'C', self.anchor.col) {
                    Some(col) => col,
                    None => return Ok(Value::Error(ErrorKind::Ref)),
                };
                let last_row = range.adjust_row_number(LAST_ROW);
                Ok(Value::Area(AreaHandle::new(range, Region::new(0, col, last_row, col))))
            }
            RefClass::Row => {
                if a1_style {
                    return Ok(Value::Error(ErrorKind::Ref));
                }
                let row = match self.r1c1_component(part1, 'R', self.anchor.row) {
                    Some(row) => row,
                    None => return Ok(Value::Error(ErrorKind::Ref)),
                };
                Ok(Value::Area(AreaHandle::new(range, Region::new(row, 0, row, LAST_COL))))
            }
            RefClass::Cell => {
                let (row, col) = self.parse_cell(part1, a1_style)?;
                Ok(Value::Ref(RefHandle::new(range, row, col)))
            }
            RefClass::NamedRange | RefClass::Bad => unreachable!(),
        }
    }

    /// Parse the numeric part after an R or C marker. A marker with no
    /// number ("C") is invalid as a standalone reference.
    fn r1c1_component(&self, text: &str, marker: char, anchor: usize) -> Option<usize> {
        let pos = crate::addr::find_marker(text, marker)?;
        let component = text[pos + 1..].trim();
        if component.is_empty() {
            return None;
        }
        apply_r1c1_axis(component, anchor)
    }

    fn parse_column(&self, text: &str, a1_style: bool) -> Option<usize> {
        if a1_style {
            col_from_letters(strip_dollar(text))
        } else {
            self.r1c1_component(text, 'C', self.anchor.col)
        }
    }

    fn parse_row(&self, text: &str, a1_style: bool) -> Option<usize> {
        if a1_style {
            let digits: usize = strip_dollar(text).parse().ok()?;
            digits.checked_sub(1)
        } else {
            self.r1c1_component(text, 'R', self.anchor.row)
        }
    }

    /// Parse a single-cell fragment. Classification has already said
    /// this is a cell, so failure here is a fault, not a `#REF!`.
    fn parse_cell(&self, text: &str, a1_style: bool) -> Result<(usize, usize), ResolveError> {
        let parsed = if a1_style {
            parse_a1_cell(text)
        } else {
            apply_r1c1_cell(text, self.anchor.row, self.anchor.col)
        };
        parsed.ok_or_else(|| {
            ResolveError::InvalidArgument(format!("'{}' is not a valid cell reference", text))
        })
    }

    fn local_name(&self, token: &NameToken) -> Value {
        let sheet_index = token.sheet.as_deref().and_then(|s| self.book.sheet_index(s));
        if self.book.name_definition(&token.name, sheet_index).is_some() {
            Value::ExternalName(token.name.clone())
        } else if self.book.is_user_defined_function(&token.name) {
            Value::FunctionName(token.name.clone())
        } else {
            Value::Error(ErrorKind::Name)
        }
    }

    fn range_over(
        book: &Rc<dyn Recalc>,
        first_sheet: &str,
        last_sheet: Option<&str>,
    ) -> Option<SheetRange> {
        let first = book.sheet_index(first_sheet)?;
        let last = match last_sheet {
            Some(name) => book.sheet_index(name)?,
            None => first,
        };
        if last < first {
            return None;
        }
        let mut sheets = Vec::with_capacity(last - first + 1);
        for index in first..=last {
            sheets.push(book.sheet_values(index)?);
        }
        SheetRange::new(sheets).ok()
    }
}
