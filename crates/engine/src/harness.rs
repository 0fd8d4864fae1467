//! Test harness: an in-memory workbook with a miniature evaluator.
//!
//! `TestBook` plays all three collaborator roles at once (`Recalc`,
//! `DocumentModel`, and per-sheet `SheetValues`), so evaluator tests
//! can build a workbook in a few lines. Its formula "evaluation"
//! handles exactly what rule expressions need: literals, single cell
//! references, and ranges, with `$` absolute markers and relative
//! shifting by the target's offset from the region anchor. Anything
//! else comes back as `#NAME?`.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::addr::{col_from_letters, CellAddress, CellRef, Region};
use crate::conditional::FormatGroupDef;
use crate::eval::{ErrorKind, Value};
use crate::model::{CellSnapshot, DocumentModel, NameDefinition, Recalc, SheetValues};
use crate::refs::{AreaHandle, RefHandle, RefResolver, ResolveError, SheetRange};
use crate::validation::ValidationRule;

#[derive(Default)]
struct SheetData {
    name: String,
    cells: FxHashMap<(usize, usize), CellSnapshot>,
    validations: Vec<ValidationRule>,
    format_groups: Vec<FormatGroupDef>,
}

#[derive(Default)]
struct BookData {
    sheets: Vec<SheetData>,
    names: FxHashMap<String, NameDefinition>,
    functions: FxHashSet<String>,
    linked: FxHashMap<String, TestBook>,
}

/// In-memory workbook for tests. Cloning shares the underlying data,
/// so a clone handed out as `Rc<dyn Recalc>` sees later mutations.
#[derive(Clone, Default)]
pub struct TestBook {
    inner: Rc<RefCell<BookData>>,
}

impl TestBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheets(names: &[&str]) -> Self {
        let book = Self::new();
        for name in names {
            book.add_sheet(name);
        }
        book
    }

    pub fn add_sheet(&self, name: &str) -> usize {
        let mut data = self.inner.borrow_mut();
        data.sheets.push(SheetData { name: name.to_string(), ..SheetData::default() });
        data.sheets.len() - 1
    }

    pub fn set_cell(&self, sheet: &str, row: usize, col: usize, snapshot: CellSnapshot) {
        let index = self.sheet_pos(sheet).expect("unknown sheet");
        self.inner.borrow_mut().sheets[index].cells.insert((row, col), snapshot);
    }

    pub fn set_number(&self, sheet: &str, row: usize, col: usize, value: f64) {
        self.set_cell(sheet, row, col, CellSnapshot::general(Value::Number(value)));
    }

    pub fn set_text(&self, sheet: &str, row: usize, col: usize, value: &str) {
        self.set_cell(sheet, row, col, CellSnapshot::general(Value::Text(value.to_string())));
    }

    pub fn set_bool(&self, sheet: &str, row: usize, col: usize, value: bool) {
        self.set_cell(sheet, row, col, CellSnapshot::general(Value::Bool(value)));
    }

    pub fn set_error(&self, sheet: &str, row: usize, col: usize, kind: ErrorKind) {
        self.set_cell(sheet, row, col, CellSnapshot::general(Value::Error(kind)));
    }

    /// Change only the display format, creating a blank cell if needed.
    pub fn set_format(&self, sheet: &str, row: usize, col: usize, format: &str) {
        let index = self.sheet_pos(sheet).expect("unknown sheet");
        let mut data = self.inner.borrow_mut();
        let cell = data.sheets[index]
            .cells
            .entry((row, col))
            .or_insert_with(|| CellSnapshot::general(Value::Blank));
        cell.number_format = format.to_string();
    }

    pub fn set_validations(&self, sheet: &str, rules: Vec<ValidationRule>) {
        let index = self.sheet_pos(sheet).expect("unknown sheet");
        self.inner.borrow_mut().sheets[index].validations = rules;
    }

    pub fn set_format_groups(&self, sheet: &str, groups: Vec<FormatGroupDef>) {
        let index = self.sheet_pos(sheet).expect("unknown sheet");
        self.inner.borrow_mut().sheets[index].format_groups = groups;
    }

    pub fn define_name(&self, name: &str, definition: NameDefinition) {
        self.inner.borrow_mut().names.insert(name.to_string(), definition);
    }

    pub fn register_function(&self, name: &str) {
        self.inner.borrow_mut().functions.insert(name.to_string());
    }

    pub fn link_workbook(&self, name: &str, other: TestBook) {
        self.inner.borrow_mut().linked.insert(name.to_string(), other);
    }

    pub fn recalc(&self) -> Rc<dyn Recalc> {
        Rc::new(self.clone())
    }

    pub fn document(&self) -> Rc<dyn DocumentModel> {
        Rc::new(self.clone())
    }

    pub fn resolver_at(&self, sheet: usize, row: usize, col: usize) -> RefResolver {
        RefResolver::new(self.recalc(), CellAddress::new(sheet, row, col))
    }

    // -------------------------------------------------------------------------
    // Mini evaluator
    // -------------------------------------------------------------------------

    fn sheet_pos(&self, name: &str) -> Option<usize> {
        self.inner.borrow().sheets.iter().position(|s| s.name == name)
    }

    fn values_range(&self, index: usize) -> Option<SheetRange> {
        if index >= self.inner.borrow().sheets.len() {
            return None;
        }
        Some(SheetRange::single(Rc::new(TestSheetValues {
            inner: self.inner.clone(),
            index,
        })))
    }

    /// Literals, A1 cell references, and A1 ranges, with an optional
    /// `Sheet!` prefix. Relative axes shift by the caller-supplied
    /// offsets; `$`-pinned axes do not.
    fn eval_text(&self, text: &str, sheet: usize, shift_rows: i64, shift_cols: i64) -> Value {
        let trimmed = text.trim().trim_start_matches('=').trim();
        if let Ok(n) = trimmed.parse::<f64>() {
            return Value::Number(n);
        }
        if trimmed.eq_ignore_ascii_case("TRUE") {
            return Value::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("FALSE") {
            return Value::Bool(false);
        }
        if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
            return Value::Text(trimmed[1..trimmed.len() - 1].to_string());
        }
        let (sheet, body) = match trimmed.split_once('!') {
            Some((name, rest)) => match self.sheet_pos(name.trim_matches('\'')) {
                Some(index) => (index, rest),
                None => return Value::Error(ErrorKind::Ref),
            },
            None => (sheet, trimmed),
        };
        let range = match self.values_range(sheet) {
            Some(range) => Rc::new(range),
            None => return Value::Error(ErrorKind::Ref),
        };
        if let Some((first, last)) = body.split_once(':') {
            match (
                shifted_a1(first, shift_rows, shift_cols),
                shifted_a1(last, shift_rows, shift_cols),
            ) {
                (Some((r0, c0)), Some((r1, c1))) => {
                    Value::Area(AreaHandle::new(range, Region::new(r0, c0, r1, c1)))
                }
                _ => Value::Error(ErrorKind::Name),
            }
        } else {
            match shifted_a1(body, shift_rows, shift_cols) {
                Some((row, col)) => Value::Ref(RefHandle::new(range, row, col)),
                None => Value::Error(ErrorKind::Name),
            }
        }
    }

    fn eval_in_context(&self, formula: &str, target: &CellRef, region: &Region) -> Value {
        let sheet = match self.sheet_pos(&target.sheet) {
            Some(index) => index,
            None => return Value::Error(ErrorKind::Ref),
        };
        let shift_rows = target.row as i64 - region.first_row as i64;
        let shift_cols = target.col as i64 - region.first_col as i64;
        self.eval_text(formula, sheet, shift_rows, shift_cols)
    }
}

/// Parse an A1 cell with `$` markers, shifting unpinned axes.
fn shifted_a1(text: &str, shift_rows: i64, shift_cols: i64) -> Option<(usize, usize)> {
    let trimmed = text.trim();
    let col_abs = trimmed.starts_with('$');
    let body = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let split = body.find(|c: char| !c.is_ascii_alphabetic())?;
    let (letters, rest) = body.split_at(split);
    let row_abs = rest.starts_with('$');
    let digits = rest.strip_prefix('$').unwrap_or(rest);
    let col = col_from_letters(letters)?;
    let row = digits.parse::<usize>().ok()?.checked_sub(1)?;
    let row = if row_abs {
        row
    } else {
        usize::try_from(row as i64 + shift_rows).ok()?
    };
    let col = if col_abs {
        col
    } else {
        usize::try_from(col as i64 + shift_cols).ok()?
    };
    Some((row, col))
}

struct TestSheetValues {
    inner: Rc<RefCell<BookData>>,
    index: usize,
}

impl SheetValues for TestSheetValues {
    fn sheet_index(&self) -> usize {
        self.index
    }

    fn value_at(&self, row: usize, col: usize) -> Value {
        self.inner.borrow().sheets[self.index]
            .cells
            .get(&(row, col))
            .map(|snapshot| snapshot.value.clone())
            .unwrap_or(Value::Blank)
    }

    fn last_used_row(&self) -> usize {
        self.inner.borrow().sheets[self.index]
            .cells
            .keys()
            .map(|&(row, _)| row)
            .max()
            .unwrap_or(0)
    }
}

impl Recalc for TestBook {
    fn evaluate(&self, formula: &str, target: &CellRef, region: &Region) -> Value {
        self.eval_in_context(formula, target, region)
    }

    fn evaluate_list(&self, formula: &str, target: &CellRef, region: &Region) -> Value {
        self.eval_in_context(formula, target, region)
    }

    fn sheet_index(&self, sheet_name: &str) -> Option<usize> {
        self.sheet_pos(sheet_name)
    }

    fn sheet_values(&self, sheet_index: usize) -> Option<Rc<dyn SheetValues>> {
        if sheet_index >= self.inner.borrow().sheets.len() {
            return None;
        }
        Some(Rc::new(TestSheetValues {
            inner: self.inner.clone(),
            index: sheet_index,
        }))
    }

    fn other_workbook(&self, workbook_name: &str) -> Result<Rc<dyn Recalc>, ResolveError> {
        match self.inner.borrow().linked.get(workbook_name) {
            Some(book) => Ok(Rc::new(book.clone())),
            None => Err(ResolveError::WorkbookNotFound(workbook_name.to_string())),
        }
    }

    fn name_definition(&self, name: &str, _sheet_index: Option<usize>) -> Option<NameDefinition> {
        self.inner.borrow().names.get(name).cloned()
    }

    fn evaluate_name(&self, name: &str, _sheet_index: Option<usize>) -> Option<Value> {
        let definition = self.inner.borrow().names.get(name).cloned()?;
        match definition {
            NameDefinition::Cell { sheet, row, col } => {
                let index = self.sheet_pos(&sheet)?;
                let range = Rc::new(self.values_range(index)?);
                Some(Value::Ref(RefHandle::new(range, row, col)))
            }
            NameDefinition::Area { first_sheet, last_sheet: _, region } => {
                let index = self.sheet_pos(&first_sheet)?;
                let range = Rc::new(self.values_range(index)?);
                Some(Value::Area(AreaHandle::new(range, region)))
            }
            NameDefinition::Formula(text) => Some(self.eval_text(&text, 0, 0, 0)),
        }
    }

    fn is_user_defined_function(&self, name: &str) -> bool {
        self.inner.borrow().functions.contains(name)
    }
}

impl DocumentModel for TestBook {
    fn has_sheet(&self, sheet_name: &str) -> bool {
        self.sheet_pos(sheet_name).is_some()
    }

    fn cell(&self, sheet_name: &str, row: usize, col: usize) -> Option<CellSnapshot> {
        let index = self.sheet_pos(sheet_name)?;
        self.inner.borrow().sheets[index].cells.get(&(row, col)).cloned()
    }

    fn validations(&self, sheet_name: &str) -> Vec<ValidationRule> {
        match self.sheet_pos(sheet_name) {
            Some(index) => self.inner.borrow().sheets[index].validations.clone(),
            None => Vec::new(),
        }
    }

    fn format_groups(&self, sheet_name: &str) -> Vec<FormatGroupDef> {
        match self.sheet_pos(sheet_name) {
            Some(index) => self.inner.borrow().sheets[index].format_groups.clone(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::unwrap_reference;

    #[test]
    fn test_literal_evaluation() {
        let book = TestBook::with_sheets(&["Sheet1"]);
        let target = CellRef::new("Sheet1", 0, 0);
        let region = Region::cell(0, 0);
        assert_eq!(book.evaluate("42", &target, &region), Value::Number(42.0));
        assert_eq!(book.evaluate("=3.5", &target, &region), Value::Number(3.5));
        assert_eq!(book.evaluate("TRUE", &target, &region), Value::Bool(true));
        assert_eq!(
            book.evaluate("\"hi\"", &target, &region),
            Value::Text("hi".to_string())
        );
        assert_eq!(
            book.evaluate("SUM(A1)", &target, &region),
            Value::Error(ErrorKind::Name)
        );
    }

    #[test]
    fn test_relative_shift_against_region_anchor() {
        let book = TestBook::with_sheets(&["Sheet1"]);
        book.set_number("Sheet1", 0, 0, 1.0);
        book.set_number("Sheet1", 2, 0, 3.0);

        let region = Region::new(0, 1, 9, 1);
        // target two rows below the anchor: A1 shifts to A3
        let target = CellRef::new("Sheet1", 2, 1);
        let shifted = unwrap_reference(book.evaluate("A1", &target, &region));
        assert_eq!(shifted, Value::Number(3.0));
        // pinned rows do not shift
        let pinned = unwrap_reference(book.evaluate("A$1", &target, &region));
        assert_eq!(pinned, Value::Number(1.0));
    }

    #[test]
    fn test_cross_sheet_reference() {
        let book = TestBook::with_sheets(&["Sheet1", "Data"]);
        book.set_number("Data", 0, 0, 9.0);
        let target = CellRef::new("Sheet1", 0, 0);
        let region = Region::cell(0, 0);
        let value = unwrap_reference(book.evaluate("Data!A1", &target, &region));
        assert_eq!(value, Value::Number(9.0));
        assert_eq!(
            book.evaluate("Gone!A1", &target, &region),
            Value::Error(ErrorKind::Ref)
        );
    }

    #[test]
    fn test_range_evaluation() {
        let book = TestBook::with_sheets(&["Sheet1"]);
        book.set_number("Sheet1", 0, 0, 1.0);
        book.set_number("Sheet1", 1, 0, 2.0);
        let target = CellRef::new("Sheet1", 0, 0);
        let region = Region::cell(0, 0);
        match book.evaluate_list("$A$1:$A$2", &target, &region) {
            Value::Area(area) => {
                assert_eq!(area.height(), 2);
                assert_eq!(area.value_at(1, 0), Value::Number(2.0));
            }
            other => panic!("expected area, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_data_across_clones() {
        let book = TestBook::with_sheets(&["Sheet1"]);
        let clone = book.clone();
        book.set_number("Sheet1", 0, 0, 5.0);
        let values = clone.sheet_values(0).unwrap();
        assert_eq!(values.value_at(0, 0), Value::Number(5.0));
        assert_eq!(values.last_used_row(), 0);
    }
}
