//! External collaborator traits.
//!
//! The engine evaluates rules against two outside systems it never owns:
//! the recalculation engine (formula evaluation, workbook/sheet lookup,
//! defined names) and the document model (cell storage, rule lists).
//! Both are specified here at their interface boundary only; their
//! latency and caching behavior are opaque to this crate.

use std::rc::Rc;

use crate::addr::{CellRef, Region};
use crate::conditional::FormatGroupDef;
use crate::eval::Value;
use crate::refs::ResolveError;
use crate::validation::ValidationRule;

/// Evaluated cell values for one sheet, as seen by the recalculation
/// engine. Values reflect the current or cached-formula-result state;
/// this crate never triggers re-evaluation through this trait.
pub trait SheetValues {
    /// Workbook index of this sheet.
    fn sheet_index(&self) -> usize;

    /// Evaluated value at an absolute (row, col). Unset cells are Blank.
    fn value_at(&self, row: usize, col: usize) -> Value;

    /// Highest row index holding any cell, 0 for an empty sheet.
    fn last_used_row(&self) -> usize;
}

/// The recalculation engine for one workbook.
pub trait Recalc {
    /// Evaluate formula text against a target cell and bounding region,
    /// unwrapping the result toward a single value. Relative references
    /// in the formula shift by the target's offset from the region
    /// anchor.
    fn evaluate(&self, formula: &str, target: &CellRef, region: &Region) -> Value;

    /// Like `evaluate`, but preserves a rectangular result instead of
    /// collapsing it to one value (list semantics).
    fn evaluate_list(&self, formula: &str, target: &CellRef, region: &Region) -> Value;

    /// Sheet index by name, None if the sheet does not exist.
    fn sheet_index(&self, sheet_name: &str) -> Option<usize>;

    /// Value source for a sheet, None past the sheet count.
    fn sheet_values(&self, sheet_index: usize) -> Option<Rc<dyn SheetValues>>;

    /// Evaluator for a linked workbook.
    ///
    /// Fails with `ResolveError::WorkbookNotFound`; callers decide
    /// whether that surfaces as a fault or a `#REF!` result value.
    fn other_workbook(&self, workbook_name: &str) -> Result<Rc<dyn Recalc>, ResolveError>;

    /// Definition of a workbook- or sheet-scoped name, None if absent.
    fn name_definition(&self, name: &str, sheet_index: Option<usize>) -> Option<NameDefinition>;

    /// Evaluate a defined name's formula in this workbook's context.
    /// None if the name does not exist.
    fn evaluate_name(&self, name: &str, sheet_index: Option<usize>) -> Option<Value>;

    /// Whether a user-defined function with this name is registered.
    fn is_user_defined_function(&self, name: &str) -> bool;
}

/// A defined name's target, as stored in a workbook's name table.
#[derive(Debug, Clone, PartialEq)]
pub enum NameDefinition {
    /// The name points at a single cell.
    Cell { sheet: String, row: usize, col: usize },
    /// The name points at a rectangle, possibly spanning sheets.
    Area {
        first_sheet: String,
        last_sheet: Option<String>,
        region: Region,
    },
    /// Anything more complex than a plain reference.
    Formula(String),
}

/// A cell's stored state as the document model exposes it.
///
/// `value` is the current value, or the cached formula result for
/// formula cells. `number_format` is the style's display-format string
/// ("General" when unstyled); rule evaluation treats it as an opaque
/// key.
#[derive(Debug, Clone, PartialEq)]
pub struct CellSnapshot {
    pub value: Value,
    pub number_format: String,
}

impl CellSnapshot {
    pub fn new(value: Value, number_format: impl Into<String>) -> Self {
        Self { value, number_format: number_format.into() }
    }

    /// A cell with the default display format.
    pub fn general(value: Value) -> Self {
        Self::new(value, "General")
    }
}

/// The document model for one workbook.
pub trait DocumentModel {
    fn has_sheet(&self, sheet_name: &str) -> bool;

    /// The stored cell, None if it was never created.
    fn cell(&self, sheet_name: &str, row: usize, col: usize) -> Option<CellSnapshot>;

    /// A sheet's data-validation rules, in defined order. Reading these
    /// from the underlying document is expensive; the validation
    /// evaluator memoizes per sheet.
    fn validations(&self, sheet_name: &str) -> Vec<ValidationRule>;

    /// A sheet's conditional-formatting groups, in defined order.
    fn format_groups(&self, sheet_name: &str) -> Vec<FormatGroupDef>;
}
