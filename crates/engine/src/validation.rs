//! Data-validation rule evaluation.
//!
//! A validation rule constrains what a cell may hold: whole numbers or
//! decimals against comparison bounds, membership in a list, text
//! length, or the truthiness of a custom formula. `DataValidationEvaluator`
//! answers "is this cell currently valid" against the rules the document
//! model defines, without mutating anything.
//!
//! Rule lists are memoized per sheet name because reading them out of
//! the underlying document is expensive. The cache is only dropped
//! explicitly via `clear_cached_values`; callers invalidate when sheet
//! structure or rule definitions change.

use std::cell::RefCell;
use std::rc::Rc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::addr::{CellRef, Region};
use crate::eval::Value;
use crate::model::{DocumentModel, Recalc};
use crate::refs::unwrap_reference;

// =============================================================================
// Rule definitions
// =============================================================================

/// What kind of content a rule constrains. IDs match the file format's
/// validation-type records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationConstraintType {
    /// No constraint; every value is valid.
    Any,
    /// Numeric and whole.
    Integer,
    /// Numeric.
    Decimal,
    /// Member of an explicit or referenced list.
    List,
    /// Date serial number (numeric).
    Date,
    /// Time fraction (numeric).
    Time,
    /// Length of the text content.
    TextLength,
    /// Custom formula evaluates truthy.
    Formula,
}

impl ValidationConstraintType {
    pub fn type_id(self) -> u8 {
        match self {
            ValidationConstraintType::Any => 0,
            ValidationConstraintType::Integer => 1,
            ValidationConstraintType::Decimal => 2,
            ValidationConstraintType::List => 3,
            ValidationConstraintType::Date => 4,
            ValidationConstraintType::Time => 5,
            ValidationConstraintType::TextLength => 6,
            ValidationConstraintType::Formula => 7,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(ValidationConstraintType::Any),
            1 => Some(ValidationConstraintType::Integer),
            2 => Some(ValidationConstraintType::Decimal),
            3 => Some(ValidationConstraintType::List),
            4 => Some(ValidationConstraintType::Date),
            5 => Some(ValidationConstraintType::Time),
            6 => Some(ValidationConstraintType::TextLength),
            7 => Some(ValidationConstraintType::Formula),
            _ => None,
        }
    }
}

/// Comparison operator for the numeric constraint types. IDs match the
/// file format's operator records.
///
/// Constraint types that take no operator (Any, List, Formula) store
/// `Between`, which doubles as the "ignored" marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationOperator {
    Between,
    NotBetween,
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

impl ValidationOperator {
    /// Placeholder for constraint types that ignore the operator.
    pub const IGNORED: ValidationOperator = ValidationOperator::Between;

    pub fn type_id(self) -> u8 {
        match self {
            ValidationOperator::Between => 0,
            ValidationOperator::NotBetween => 1,
            ValidationOperator::Equal => 2,
            ValidationOperator::NotEqual => 3,
            ValidationOperator::GreaterThan => 4,
            ValidationOperator::LessThan => 5,
            ValidationOperator::GreaterOrEqual => 6,
            ValidationOperator::LessOrEqual => 7,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(ValidationOperator::Between),
            1 => Some(ValidationOperator::NotBetween),
            2 => Some(ValidationOperator::Equal),
            3 => Some(ValidationOperator::NotEqual),
            4 => Some(ValidationOperator::GreaterThan),
            5 => Some(ValidationOperator::LessThan),
            6 => Some(ValidationOperator::GreaterOrEqual),
            7 => Some(ValidationOperator::LessOrEqual),
            _ => None,
        }
    }

    /// Apply the comparison. A missing bound never invalidates: users
    /// can save rules with blank limit fields, and those accept
    /// everything on the unconstrained side.
    pub fn is_valid(self, value: f64, v1: Option<f64>, v2: Option<f64>) -> bool {
        let v1 = match v1 {
            Some(v) => v,
            None => return true,
        };
        match self {
            ValidationOperator::Between => match v2 {
                Some(v2) => value >= v1 && value <= v2,
                None => true,
            },
            ValidationOperator::NotBetween => match v2 {
                Some(v2) => value < v1 || value > v2,
                None => true,
            },
            ValidationOperator::Equal => value == v1,
            ValidationOperator::NotEqual => value != v1,
            ValidationOperator::GreaterThan => value > v1,
            ValidationOperator::LessThan => value < v1,
            ValidationOperator::GreaterOrEqual => value >= v1,
            ValidationOperator::LessOrEqual => value <= v1,
        }
    }

    fn needs_second_bound(self) -> bool {
        matches!(self, ValidationOperator::Between | ValidationOperator::NotBetween)
    }
}

/// One data-validation rule as stored in the document.
///
/// `formula1`/`formula2` hold bound expressions (or plain numeric
/// literals) for the numeric constraint types, the list source for
/// `List` rules without an explicit list, and the custom expression for
/// `Formula` rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    pub constraint: ValidationConstraintType,
    pub operator: ValidationOperator,
    pub formula1: Option<String>,
    pub formula2: Option<String>,
    pub explicit_list: Option<Vec<String>>,
    pub allow_blank: bool,
    pub regions: Vec<Region>,
}

impl ValidationRule {
    pub fn new(constraint: ValidationConstraintType, operator: ValidationOperator) -> Self {
        Self {
            constraint,
            operator,
            formula1: None,
            formula2: None,
            explicit_list: None,
            allow_blank: true,
            regions: Vec::new(),
        }
    }

    pub fn with_formula1(mut self, formula: impl Into<String>) -> Self {
        self.formula1 = Some(formula.into());
        self
    }

    pub fn with_formula2(mut self, formula: impl Into<String>) -> Self {
        self.formula2 = Some(formula.into());
        self
    }

    pub fn with_explicit_list(mut self, entries: Vec<String>) -> Self {
        self.explicit_list = Some(entries);
        self
    }

    pub fn with_allow_blank(mut self, allow: bool) -> Self {
        self.allow_blank = allow;
        self
    }

    pub fn with_regions(mut self, regions: Vec<Region>) -> Self {
        self.regions = regions;
        self
    }
}

/// A rule applied to one concrete cell: the rule, the region of the rule
/// that contains the cell, and the cell itself. Bound formulas evaluate
/// relative to the region anchor, shifted to the target.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    rule: Rc<ValidationRule>,
    region: Region,
    target: CellRef,
}

impl ValidationContext {
    pub fn new(rule: Rc<ValidationRule>, region: Region, target: CellRef) -> Self {
        Self { rule, region, target }
    }

    pub fn rule(&self) -> &Rc<ValidationRule> {
        &self.rule
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn target(&self) -> &CellRef {
        &self.target
    }

    /// Target's row offset from the region anchor.
    pub fn offset_rows(&self) -> usize {
        self.target.row - self.region.first_row
    }

    /// Target's column offset from the region anchor.
    pub fn offset_cols(&self) -> usize {
        self.target.col - self.region.first_col
    }
}

// =============================================================================
// Evaluator
// =============================================================================

/// A bound expression that produced something no comparison can use.
/// The owning cell is invalid.
struct NotNumeric;

/// Evaluates data-validation rules against current cell values.
pub struct DataValidationEvaluator {
    model: Rc<dyn DocumentModel>,
    book: Rc<dyn Recalc>,
    rules: RefCell<FxHashMap<String, Rc<Vec<Rc<ValidationRule>>>>>,
}

impl DataValidationEvaluator {
    pub fn new(model: Rc<dyn DocumentModel>, book: Rc<dyn Recalc>) -> Self {
        Self {
            model,
            book,
            rules: RefCell::new(FxHashMap::default()),
        }
    }

    /// Drop all memoized rule lists. Call when sheets are added,
    /// removed, or renamed, or when validation definitions change.
    pub fn clear_cached_values(&self) {
        self.rules.borrow_mut().clear();
    }

    /// The rule governing a cell, or None when no rule's region contains
    /// it. When regions overlap, the first rule in definition order
    /// wins.
    pub fn validation_for_cell(&self, cell: &CellRef) -> Option<Rc<ValidationRule>> {
        self.validation_context_for_cell(cell)
            .map(|context| context.rule.clone())
    }

    /// Like `validation_for_cell`, but also reports which region matched.
    pub fn validation_context_for_cell(&self, cell: &CellRef) -> Option<ValidationContext> {
        let rules = self.rules_for_sheet(&cell.sheet)?;
        for rule in rules.iter() {
            for region in &rule.regions {
                if region.contains(cell.row, cell.col) {
                    return Some(ValidationContext::new(rule.clone(), *region, cell.clone()));
                }
            }
        }
        None
    }

    /// The allowed values for a `List`-constrained cell, unevaluated:
    /// explicit entries as text, or the raw first-column values of the
    /// referenced range. A list source that evaluates to anything but a
    /// rectangle yields no candidates, so nothing is valid against it.
    /// None for cells without a list rule.
    pub fn validation_values_for_cell(&self, cell: &CellRef) -> Option<Vec<Value>> {
        let context = self.validation_context_for_cell(cell)?;
        if context.rule.constraint != ValidationConstraintType::List {
            return None;
        }
        if let Some(entries) = &context.rule.explicit_list {
            return Some(entries.iter().map(|e| Value::Text(e.clone())).collect());
        }
        let formula = context.rule.formula1.as_deref()?;
        let result = self.book.evaluate_list(formula, &context.target, &context.region);
        Some(match result {
            Value::Area(area) => (0..area.height()).map(|row| area.value_at(row, 0)).collect(),
            _ => Vec::new(),
        })
    }

    /// Whether the cell's current value satisfies its validation rule.
    /// Cells with no rule are trivially valid.
    pub fn is_valid_cell(&self, cell: &CellRef) -> bool {
        let context = match self.validation_context_for_cell(cell) {
            Some(context) => context,
            None => return true,
        };
        let snapshot = self.model.cell(&cell.sheet, cell.row, cell.col);
        let value = match snapshot {
            Some(snapshot) => snapshot.value,
            None => Value::Blank,
        };
        // Blank cells and empty strings are governed by the rule's
        // allow-blank flag alone.
        if value.is_blank() || value.as_text() == Some("") {
            return context.rule.allow_blank;
        }
        match context.rule.constraint {
            ValidationConstraintType::Any => true,
            ValidationConstraintType::Formula => self.check_custom_formula(&context),
            ValidationConstraintType::List => self.check_list(&context, &value),
            ValidationConstraintType::Integer => match value.as_number() {
                Some(n) if n == n.trunc() => self.check_numeric(&context, n),
                _ => false,
            },
            ValidationConstraintType::Decimal
            | ValidationConstraintType::Date
            | ValidationConstraintType::Time => match value.as_number() {
                Some(n) => self.check_numeric(&context, n),
                None => false,
            },
            ValidationConstraintType::TextLength => match value.as_text() {
                Some(text) => self.check_numeric(&context, text.chars().count() as f64),
                None => false,
            },
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn rules_for_sheet(&self, sheet: &str) -> Option<Rc<Vec<Rc<ValidationRule>>>> {
        if !self.model.has_sheet(sheet) {
            return None;
        }
        if let Some(cached) = self.rules.borrow().get(sheet) {
            return Some(cached.clone());
        }
        let loaded: Rc<Vec<Rc<ValidationRule>>> = Rc::new(
            self.model
                .validations(sheet)
                .into_iter()
                .map(Rc::new)
                .collect(),
        );
        self.rules
            .borrow_mut()
            .insert(sheet.to_string(), loaded.clone());
        Some(loaded)
    }

    /// Custom-formula truthiness: blank passes, errors fail, booleans
    /// speak for themselves, numbers pass when nonzero.
    fn check_custom_formula(&self, context: &ValidationContext) -> bool {
        let formula = match context.rule.formula1.as_deref() {
            Some(f) => f,
            None => return true,
        };
        let result = unwrap_reference(self.book.evaluate(formula, &context.target, &context.region));
        match result {
            Value::Blank => true,
            Value::Bool(b) => b,
            Value::Number(n) => n != 0.0,
            _ => false,
        }
    }

    /// List membership: candidates compare same-type only, text
    /// case-insensitively. A blank candidate makes every value valid;
    /// error candidates are skipped.
    fn check_list(&self, context: &ValidationContext, value: &Value) -> bool {
        let candidates = match self.validation_values_for_cell(&context.target) {
            Some(candidates) => candidates,
            None => return true,
        };
        for candidate in candidates {
            match unwrap_reference(candidate) {
                Value::Blank => return true,
                Value::Error(_) => continue,
                Value::Bool(b) => {
                    if value.as_bool() == Some(b) {
                        return true;
                    }
                }
                Value::Number(n) => {
                    if value.as_number() == Some(n) {
                        return true;
                    }
                }
                Value::Text(candidate_text) => {
                    if let Some(text) = value.as_text() {
                        if text.to_lowercase() == candidate_text.to_lowercase() {
                            return true;
                        }
                    }
                }
                _ => continue,
            }
        }
        false
    }

    fn check_numeric(&self, context: &ValidationContext, value: f64) -> bool {
        let v1 = match self.eval_or_constant(context.rule.formula1.as_deref(), context) {
            Ok(v) => v,
            Err(NotNumeric) => return false,
        };
        let v2 = if context.rule.operator.needs_second_bound() {
            match self.eval_or_constant(context.rule.formula2.as_deref(), context) {
                Ok(v) => v,
                Err(NotNumeric) => return false,
            }
        } else {
            None
        };
        context.rule.operator.is_valid(value, v1, v2)
    }

    /// A bound expression as a number: literal first, then one
    /// evaluation pass unwrapped one step. Blank results mean "no
    /// bound"; anything non-numeric poisons the comparison.
    fn eval_or_constant(
        &self,
        expr: Option<&str>,
        context: &ValidationContext,
    ) -> Result<Option<f64>, NotNumeric> {
        let expr = match expr {
            Some(e) if !e.trim().is_empty() => e,
            _ => return Ok(None),
        };
        if let Ok(n) = expr.trim().parse::<f64>() {
            return Ok(Some(n));
        }
        let result = unwrap_reference(self.book.evaluate(expr, &context.target, &context.region));
        match result {
            Value::Blank => Ok(None),
            Value::Number(n) => Ok(Some(n)),
            Value::Text(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    Ok(None)
                } else {
                    trimmed.parse::<f64>().map(Some).map_err(|_| NotNumeric)
                }
            }
            _ => Err(NotNumeric),
        }
    }
}
