//! Conditional-format rule evaluation.
//!
//! Answers "does this rule highlight this cell right now" for the rule
//! kinds a document can define: value comparisons, truthy formulas,
//! gradient kinds that always apply (color scales, data bars, icon
//! sets), and the statistical filters (top-N, unique/duplicate, above
//! average, text/blank/error tests).
//!
//! The statistical filters need a full scan of the rule's anchor
//! region. Each `FormatRule` memoizes one scan result per region; the
//! memo lives only as long as the rule object, so recreating rules
//! (via `rules_for_sheet`) starts fresh. There is no explicit clear.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use ordered_float::OrderedFloat;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::addr::{CellRef, Region};
use crate::eval::Value;
use crate::model::{DocumentModel, Recalc};
use crate::refs::unwrap_reference;

// =============================================================================
// Rule definitions
// =============================================================================

/// Comparison operator for value-based rules. IDs match the file
/// format's operator records; `NoComparison` is what rules without an
/// operator store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormatOperator {
    NoComparison,
    Between,
    NotBetween,
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

impl FormatOperator {
    pub fn type_id(self) -> u8 {
        match self {
            FormatOperator::NoComparison => 0,
            FormatOperator::Between => 1,
            FormatOperator::NotBetween => 2,
            FormatOperator::Equal => 3,
            FormatOperator::NotEqual => 4,
            FormatOperator::GreaterThan => 5,
            FormatOperator::LessThan => 6,
            FormatOperator::GreaterOrEqual => 7,
            FormatOperator::LessOrEqual => 8,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(FormatOperator::NoComparison),
            1 => Some(FormatOperator::Between),
            2 => Some(FormatOperator::NotBetween),
            3 => Some(FormatOperator::Equal),
            4 => Some(FormatOperator::NotEqual),
            5 => Some(FormatOperator::GreaterThan),
            6 => Some(FormatOperator::LessThan),
            7 => Some(FormatOperator::GreaterOrEqual),
            8 => Some(FormatOperator::LessOrEqual),
            _ => None,
        }
    }

    /// Whether the operator passes when the cell and the bound have
    /// incomparable types. Only the negated operators do.
    pub fn valid_for_incompatible(self) -> bool {
        matches!(self, FormatOperator::NotBetween | FormatOperator::NotEqual)
    }

    /// Numeric comparison; a missing bound compares as 0.
    pub fn is_valid_number(self, value: f64, v1: Option<f64>, v2: Option<f64>) -> bool {
        self.check(value, v1.unwrap_or(0.0), v2.unwrap_or(0.0))
    }

    /// Text comparison, case-insensitive; a missing bound compares as "".
    pub fn is_valid_text(self, value: &str, v1: Option<&str>, v2: Option<&str>) -> bool {
        let value = value.to_lowercase();
        let v1 = v1.map_or(String::new(), str::to_lowercase);
        let v2 = v2.map_or(String::new(), str::to_lowercase);
        self.check(value.as_str(), v1.as_str(), v2.as_str())
    }

    /// Boolean comparison; with no boolean bound at all, falls back to
    /// the incompatible-types answer.
    pub fn is_valid_bool(self, value: bool, v1: Option<bool>, v2: Option<bool>) -> bool {
        match v1 {
            Some(v1) => self.check(value, v1, v2.unwrap_or(false)),
            None => self.valid_for_incompatible(),
        }
    }

    fn check<T: PartialOrd>(self, value: T, v1: T, v2: T) -> bool {
        match self {
            FormatOperator::NoComparison => false,
            FormatOperator::Between => value >= v1 && value <= v2,
            FormatOperator::NotBetween => value < v1 || value > v2,
            FormatOperator::Equal => value == v1,
            FormatOperator::NotEqual => value != v1,
            FormatOperator::GreaterThan => value > v1,
            FormatOperator::LessThan => value < v1,
            FormatOperator::GreaterOrEqual => value >= v1,
            FormatOperator::LessOrEqual => value <= v1,
        }
    }
}

/// What drives a rule's match decision. IDs match the file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    /// Compare the cell value against one or two bound formulas.
    CellValueIs,
    /// A formula evaluated per cell decides.
    Formula,
    /// Gradient over the region; every cell participates.
    ColorScale,
    /// In-cell bar over the region; every cell participates.
    DataBar,
    /// One of the statistical or content filters.
    Filter,
    /// Icon per cell over the region; every cell participates.
    IconSet,
}

impl ConditionType {
    pub fn type_id(self) -> u8 {
        match self {
            ConditionType::CellValueIs => 1,
            ConditionType::Formula => 2,
            ConditionType::ColorScale => 3,
            ConditionType::DataBar => 4,
            ConditionType::Filter => 5,
            ConditionType::IconSet => 6,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(ConditionType::CellValueIs),
            2 => Some(ConditionType::Formula),
            3 => Some(ConditionType::ColorScale),
            4 => Some(ConditionType::DataBar),
            5 => Some(ConditionType::Filter),
            6 => Some(ConditionType::IconSet),
            _ => None,
        }
    }
}

/// The filter sub-kinds of `ConditionType::Filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    /// AutoFilter-driven; never matches during rule evaluation.
    Filter,
    Top10,
    UniqueValues,
    DuplicateValues,
    ContainsText,
    NotContainsText,
    BeginsWith,
    EndsWith,
    ContainsBlanks,
    NotContainsBlanks,
    ContainsErrors,
    NotContainsErrors,
    /// Stored as a generated formula; evaluates like `Formula`.
    TimePeriod,
    AboveAverage,
}

impl FilterType {
    pub fn type_id(self) -> u8 {
        match self {
            FilterType::Filter => 0,
            FilterType::Top10 => 1,
            FilterType::UniqueValues => 2,
            FilterType::DuplicateValues => 3,
            FilterType::ContainsText => 4,
            FilterType::NotContainsText => 5,
            FilterType::BeginsWith => 6,
            FilterType::EndsWith => 7,
            FilterType::ContainsBlanks => 8,
            FilterType::NotContainsBlanks => 9,
            FilterType::ContainsErrors => 10,
            FilterType::NotContainsErrors => 11,
            FilterType::TimePeriod => 12,
            FilterType::AboveAverage => 13,
        }
    }

    pub fn from_type_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(FilterType::Filter),
            1 => Some(FilterType::Top10),
            2 => Some(FilterType::UniqueValues),
            3 => Some(FilterType::DuplicateValues),
            4 => Some(FilterType::ContainsText),
            5 => Some(FilterType::NotContainsText),
            6 => Some(FilterType::BeginsWith),
            7 => Some(FilterType::EndsWith),
            8 => Some(FilterType::ContainsBlanks),
            9 => Some(FilterType::NotContainsBlanks),
            10 => Some(FilterType::ContainsErrors),
            11 => Some(FilterType::NotContainsErrors),
            12 => Some(FilterType::TimePeriod),
            13 => Some(FilterType::AboveAverage),
            _ => None,
        }
    }
}

/// Parameters for the statistical filters (`Top10`, `AboveAverage`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Top-N count, or percentage when `percent` is set.
    pub rank: u32,
    /// Interpret `rank` as a percentage of the region's numeric cells.
    pub percent: bool,
    /// Bottom-N instead of top-N.
    pub bottom: bool,
    /// Above the mean (vs. below), for `AboveAverage`.
    pub above_average: bool,
    /// Include cells exactly at the mean.
    pub equal_average: bool,
    /// Shift the threshold by this many standard deviations; 0 means
    /// compare against the mean itself.
    pub std_dev: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            percent: false,
            bottom: false,
            above_average: true,
            equal_average: false,
            std_dev: 0,
        }
    }
}

/// One conditional-format rule as stored in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatRuleDef {
    pub condition: ConditionType,
    pub operator: FormatOperator,
    /// Lower value = applied first when rules compete.
    pub priority: i32,
    pub stop_if_true: bool,
    pub formula1: Option<String>,
    pub formula2: Option<String>,
    /// Needle for the text filters.
    pub text: Option<String>,
    pub filter: Option<FilterType>,
    pub filter_config: Option<FilterConfig>,
    /// Display format applied by a match, surfaced to callers as-is.
    pub number_format: Option<String>,
}

impl FormatRuleDef {
    pub fn new(condition: ConditionType) -> Self {
        Self {
            condition,
            operator: FormatOperator::NoComparison,
            priority: 0,
            stop_if_true: false,
            formula1: None,
            formula2: None,
            text: None,
            filter: None,
            filter_config: None,
            number_format: None,
        }
    }

    pub fn with_operator(mut self, operator: FormatOperator) -> Self {
        self.operator = operator;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stop_if_true(mut self, stop: bool) -> Self {
        self.stop_if_true = stop;
        self
    }

    pub fn with_formula1(mut self, formula: impl Into<String>) -> Self {
        self.formula1 = Some(formula.into());
        self
    }

    pub fn with_formula2(mut self, formula: impl Into<String>) -> Self {
        self.formula2 = Some(formula.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_filter(mut self, filter: FilterType) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_filter_config(mut self, config: FilterConfig) -> Self {
        self.filter_config = Some(config);
        self
    }

    pub fn with_number_format(mut self, format: impl Into<String>) -> Self {
        self.number_format = Some(format.into());
        self
    }
}

/// A group of rules sharing target regions, as stored per sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatGroupDef {
    pub regions: Vec<Region>,
    pub rules: Vec<FormatRuleDef>,
}

// =============================================================================
// Cell value + format pairs
// =============================================================================

/// A cell's content paired with its display format, the unit the
/// unique/duplicate and top-N filters reason about: two cells are "the
/// same" only when both content and format agree.
///
/// Equality and hashing include the format. Ordering (via
/// `cmp_by_content`) deliberately ignores it, so sorted runs group by
/// content; it is a named comparator rather than `Ord` because it is
/// inconsistent with equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ValueAndFormat {
    number: Option<OrderedFloat<f64>>,
    text: Option<String>,
    format: String,
}

impl ValueAndFormat {
    pub fn number(value: f64, format: impl Into<String>) -> Self {
        Self {
            number: Some(OrderedFloat(value)),
            text: None,
            format: format.into(),
        }
    }

    pub fn text(value: impl Into<String>, format: impl Into<String>) -> Self {
        Self {
            number: None,
            text: Some(value.into()),
            format: format.into(),
        }
    }

    pub fn is_number(&self) -> bool {
        self.number.is_some()
    }

    pub fn number_value(&self) -> Option<f64> {
        self.number.map(|n| n.0)
    }

    /// Content ordering: numbers by value then text lexically, with the
    /// absent side of each sorting last. Format plays no part.
    pub fn cmp_by_content(&self, other: &Self) -> Ordering {
        let by_number = match (&self.number, &other.number) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        };
        if by_number != Ordering::Equal {
            return by_number;
        }
        match (&self.text, &other.text) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

/// Memoized result of one full scan of a rule's region.
#[derive(Debug)]
enum RegionScan {
    /// The set of value/format pairs the filter accepts.
    Matches(FxHashSet<ValueAndFormat>),
    /// Population statistics over the region's numeric cells.
    Stats { mean: f64, std_dev: f64 },
}

// =============================================================================
// Rule evaluation
// =============================================================================

/// One rule bound to its sheet and group, ready to answer `matches`.
///
/// Identity (equality, hashing) is positional: sheet name
/// (case-insensitive), group index, rule index. Ordering adds priority
/// after the sheet name, so sorting a rule list yields application
/// order.
pub struct FormatRule {
    book: Rc<dyn Recalc>,
    model: Rc<dyn DocumentModel>,
    sheet: String,
    group_index: usize,
    rule_index: usize,
    def: FormatRuleDef,
    regions: Vec<Region>,
    /// Filter text pre-lowered once; all text filters compare lowercase.
    lower_text: Option<String>,
    /// The anchor region: bound formulas evaluate relative to its top
    /// left corner, and the statistical filters scan it.
    top_left: Region,
    scans: RefCell<FxHashMap<Region, Rc<RegionScan>>>,
}

impl FormatRule {
    pub fn new(
        book: Rc<dyn Recalc>,
        model: Rc<dyn DocumentModel>,
        sheet: impl Into<String>,
        group_index: usize,
        rule_index: usize,
        def: FormatRuleDef,
        regions: Vec<Region>,
    ) -> Self {
        let mut top_left = regions.first().copied().unwrap_or(Region::cell(0, 0));
        for region in regions.iter().skip(1) {
            if region.first_col < top_left.first_col || region.first_row < top_left.first_row {
                top_left = *region;
            }
        }
        let lower_text = def.text.as_ref().map(|t| t.to_lowercase());
        Self {
            book,
            model,
            sheet: sheet.into(),
            group_index,
            rule_index,
            def,
            regions,
            lower_text,
            top_left,
            scans: RefCell::new(FxHashMap::default()),
        }
    }

    /// All rules defined on a sheet, in application order (priority
    /// ascending). Each call builds fresh rule objects, and with them
    /// fresh region-scan memos.
    pub fn rules_for_sheet(
        book: &Rc<dyn Recalc>,
        model: &Rc<dyn DocumentModel>,
        sheet: &str,
    ) -> Vec<Rc<FormatRule>> {
        let mut rules = Vec::new();
        for (group_index, group) in model.format_groups(sheet).into_iter().enumerate() {
            for (rule_index, def) in group.rules.iter().enumerate() {
                rules.push(Rc::new(FormatRule::new(
                    book.clone(),
                    model.clone(),
                    sheet,
                    group_index,
                    rule_index,
                    def.clone(),
                    group.regions.clone(),
                )));
            }
        }
        rules.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
        rules
    }

    pub fn sheet_name(&self) -> &str {
        &self.sheet
    }

    pub fn group_index(&self) -> usize {
        self.group_index
    }

    pub fn rule_index(&self) -> usize {
        self.rule_index
    }

    pub fn def(&self) -> &FormatRuleDef {
        &self.def
    }

    pub fn priority(&self) -> i32 {
        self.def.priority
    }

    pub fn stop_if_true(&self) -> bool {
        self.def.stop_if_true
    }

    pub fn number_format(&self) -> Option<&str> {
        self.def.number_format.as_deref()
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Whether this rule currently applies to the cell. Cells outside
    /// every region never match.
    pub fn matches(&self, cell: &CellRef) -> bool {
        if !cell.sheet.eq_ignore_ascii_case(&self.sheet) {
            return false;
        }
        if !self.regions.iter().any(|r| r.contains(cell.row, cell.col)) {
            return false;
        }
        match self.def.condition {
            // The gradient kinds color every cell in range; the match
            // decision is trivially yes and the rendering layer does
            // the rest.
            ConditionType::ColorScale | ConditionType::DataBar | ConditionType::IconSet => true,
            ConditionType::CellValueIs => self.check_value(cell),
            ConditionType::Formula => self.check_formula(cell),
            ConditionType::Filter => self.check_filter(cell),
        }
    }

    // -------------------------------------------------------------------------
    // Match kinds
    // -------------------------------------------------------------------------

    /// Value comparison. Bound formulas evaluate against the anchor
    /// region's top-left corner, so relative references shift per cell.
    /// The comparison is type-matched: the cell only compares against
    /// bounds of its own type, with blank bounds standing in for the
    /// type's default (0, "").
    fn check_value(&self, cell: &CellRef) -> bool {
        let value = match self.cell_value(cell) {
            Some(value) => value,
            None => return false,
        };
        if value.is_blank() || value.is_error() || value.as_text() == Some("") {
            return false;
        }
        let formula1 = match self.def.formula1.as_deref() {
            Some(f) if !f.is_empty() => f,
            _ => return false,
        };
        let eval1 = unwrap_reference(self.book.evaluate(formula1, cell, &self.top_left));
        let eval2 = match self.def.formula2.as_deref() {
            Some(f) if !f.is_empty() => {
                unwrap_reference(self.book.evaluate(f, cell, &self.top_left))
            }
            _ => Value::Blank,
        };
        let op = self.def.operator;
        match &value {
            Value::Number(n) => match (number_bound(&eval1), number_bound(&eval2)) {
                (Some(v1), Some(v2)) => op.is_valid_number(*n, v1, v2),
                _ => op.valid_for_incompatible(),
            },
            Value::Text(s) => match (text_bound(&eval1), text_bound(&eval2)) {
                (Some(v1), Some(v2)) => op.is_valid_text(s, v1, v2),
                _ => op.valid_for_incompatible(),
            },
            Value::Bool(b) => match (bool_bound(&eval1), bool_bound(&eval2)) {
                (Some(v1), Some(v2)) => op.is_valid_bool(*b, v1, v2),
                _ => op.valid_for_incompatible(),
            },
            // cell and bounds disagree on type: only the negated
            // operators treat that as a match
            _ => op.valid_for_incompatible(),
        }
    }

    /// Formula truthiness: blank passes, errors fail, booleans speak
    /// for themselves, numbers pass when nonzero.
    fn check_formula(&self, cell: &CellRef) -> bool {
        let formula = match self.def.formula1.as_deref() {
            Some(f) if !f.is_empty() => f,
            _ => return false,
        };
        let result = unwrap_reference(self.book.evaluate(formula, cell, &self.top_left));
        match result {
            Value::Blank => true,
            Value::Bool(b) => b,
            Value::Number(n) => n != 0.0,
            _ => false,
        }
    }

    fn check_filter(&self, cell: &CellRef) -> bool {
        let filter = match self.def.filter {
            Some(filter) => filter,
            None => return false,
        };
        match filter {
            FilterType::Filter => false,
            FilterType::Top10 => self.check_top_n(cell),
            FilterType::UniqueValues => self.check_adjacency(cell, false),
            FilterType::DuplicateValues => self.check_adjacency(cell, true),
            FilterType::AboveAverage => self.check_above_average(cell),
            FilterType::ContainsText => self
                .lower_text
                .as_deref()
                .map_or(false, |needle| self.cell_text_lower(cell).contains(needle)),
            FilterType::NotContainsText => self
                .lower_text
                .as_deref()
                .map_or(true, |needle| !self.cell_text_lower(cell).contains(needle)),
            FilterType::BeginsWith => self
                .lower_text
                .as_deref()
                .map_or(false, |needle| self.cell_text_lower(cell).starts_with(needle)),
            FilterType::EndsWith => self
                .lower_text
                .as_deref()
                .map_or(false, |needle| self.cell_text_lower(cell).ends_with(needle)),
            FilterType::ContainsBlanks => match self.cell_value(cell) {
                None | Some(Value::Blank) => true,
                Some(Value::Text(s)) => s.trim().is_empty(),
                _ => false,
            },
            FilterType::NotContainsBlanks => match self.cell_value(cell) {
                None | Some(Value::Blank) => false,
                Some(Value::Text(s)) => !s.trim().is_empty(),
                _ => true,
            },
            FilterType::ContainsErrors => {
                matches!(self.cell_value(cell), Some(Value::Error(_)))
            }
            FilterType::NotContainsErrors => {
                !matches!(self.cell_value(cell), Some(Value::Error(_)))
            }
            // stored as a generated formula over the date functions
            FilterType::TimePeriod => self.check_formula(cell),
        }
    }

    // -------------------------------------------------------------------------
    // Statistical filters
    // -------------------------------------------------------------------------

    /// Top/bottom N (or percent). Only numeric cells participate; the
    /// cut is positional over the sorted values, so ties at the cut
    /// line fall out.
    fn check_top_n(&self, cell: &CellRef) -> bool {
        let candidate = self.cell_value_and_format(cell.row, cell.col);
        if !candidate.is_number() {
            return false;
        }
        let conf = self.def.filter_config.clone().unwrap_or_default();
        let scan = self.region_scan(self.top_left, false, |mut all| {
            if conf.bottom {
                all.sort_by(|a, b| a.cmp_by_content(b));
            } else {
                all.sort_by(|a, b| b.cmp_by_content(a));
            }
            let mut limit = conf.rank as usize;
            if conf.percent {
                limit = all.len() * limit / 100;
            }
            RegionScan::Matches(all.into_iter().take(limit).collect())
        });
        match scan.as_ref() {
            RegionScan::Matches(set) => set.contains(&candidate),
            RegionScan::Stats { .. } => false,
        }
    }

    /// Unique or duplicate values over the region, where "same" means
    /// matching content *and* display format. Detection sorts by
    /// content then format and inspects neighbors, so identical
    /// (value, format) pairs sit adjacent even when scan order
    /// interleaves formats.
    fn check_adjacency(&self, cell: &CellRef, want_duplicates: bool) -> bool {
        let scan = self.region_scan(self.top_left, true, |mut all| {
            all.sort_by(|a, b| a.cmp_by_content(b).then_with(|| a.format.cmp(&b.format)));
            let mut keep = FxHashSet::default();
            for i in 0..all.len() {
                let duplicate = (i + 1 < all.len() && all[i] == all[i + 1])
                    || (i > 0 && all[i] == all[i - 1]);
                if duplicate == want_duplicates {
                    keep.insert(all[i].clone());
                }
            }
            RegionScan::Matches(keep)
        });
        match scan.as_ref() {
            RegionScan::Matches(set) => set.contains(&self.cell_value_and_format(cell.row, cell.col)),
            RegionScan::Stats { .. } => false,
        }
    }

    /// Above/below the region mean, optionally shifted by N standard
    /// deviations (population formula, over the numeric cells only).
    fn check_above_average(&self, cell: &CellRef) -> bool {
        let candidate = self.cell_value_and_format(cell.row, cell.col);
        let value = match candidate.number_value() {
            Some(value) => value,
            None => return false,
        };
        let scan = self.region_scan(self.top_left, false, |all| {
            let n = all.len();
            if n == 0 {
                return RegionScan::Stats { mean: 0.0, std_dev: 0.0 };
            }
            let numbers: Vec<f64> = all.iter().filter_map(|v| v.number_value()).collect();
            let mean = numbers.iter().sum::<f64>() / n as f64;
            let variance = numbers.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n as f64;
            RegionScan::Stats { mean, std_dev: variance.sqrt() }
        });
        let (mean, std_dev) = match scan.as_ref() {
            RegionScan::Stats { mean, std_dev } => (*mean, *std_dev),
            RegionScan::Matches(_) => return false,
        };
        let conf = self.def.filter_config.clone().unwrap_or_default();
        let threshold = if conf.std_dev > 0 {
            let direction = if conf.above_average { 1.0 } else { -1.0 };
            mean + direction * std_dev * conf.std_dev as f64
        } else {
            mean
        };
        let op = match (conf.above_average, conf.equal_average) {
            (true, true) => FormatOperator::GreaterOrEqual,
            (true, false) => FormatOperator::GreaterThan,
            (false, true) => FormatOperator::LessOrEqual,
            (false, false) => FormatOperator::LessThan,
        };
        op.is_valid_number(value, Some(threshold), None)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn cell_value(&self, cell: &CellRef) -> Option<Value> {
        self.model
            .cell(&self.sheet, cell.row, cell.col)
            .map(|snapshot| snapshot.value)
    }

    fn cell_text_lower(&self, cell: &CellRef) -> String {
        match self.cell_value(cell) {
            Some(value) => value.display_text().to_lowercase(),
            None => String::new(),
        }
    }

    /// Content+format pair for one cell. Blanks and errors degrade to
    /// empty text so they can still collide in the adjacency filters.
    fn cell_value_and_format(&self, row: usize, col: usize) -> ValueAndFormat {
        match self.model.cell(&self.sheet, row, col) {
            Some(snapshot) => match &snapshot.value {
                Value::Number(n) => ValueAndFormat::number(*n, snapshot.number_format),
                Value::Text(_) | Value::Bool(_) => {
                    ValueAndFormat::text(snapshot.value.display_text(), snapshot.number_format)
                }
                _ => ValueAndFormat::text("", ""),
            },
            None => ValueAndFormat::text("", ""),
        }
    }

    /// One full scan of a region, memoized for the life of this rule
    /// object. `with_text` keeps text/blank cells; otherwise only
    /// numeric cells feed the builder.
    fn region_scan<F>(&self, region: Region, with_text: bool, build: F) -> Rc<RegionScan>
    where
        F: FnOnce(Vec<ValueAndFormat>) -> RegionScan,
    {
        if let Some(cached) = self.scans.borrow().get(&region) {
            return cached.clone();
        }
        let mut all = Vec::with_capacity(region.height() * region.width());
        for row in region.first_row..=region.last_row {
            for col in region.first_col..=region.last_col {
                let pair = self.cell_value_and_format(row, col);
                if with_text || pair.is_number() {
                    all.push(pair);
                }
            }
        }
        let scan = Rc::new(build(all));
        self.scans.borrow_mut().insert(region, scan.clone());
        scan
    }
}

/// A bound usable in a numeric comparison: blank stands in for the
/// implicit default, any other type is incompatible.
fn number_bound(value: &Value) -> Option<Option<f64>> {
    match value {
        Value::Blank => Some(None),
        Value::Number(n) => Some(Some(*n)),
        _ => None,
    }
}

fn text_bound(value: &Value) -> Option<Option<&str>> {
    match value {
        Value::Blank => Some(None),
        Value::Text(s) => Some(Some(s.as_str())),
        _ => None,
    }
}

fn bool_bound(value: &Value) -> Option<Option<bool>> {
    match value {
        Value::Blank => Some(None),
        Value::Bool(b) => Some(Some(*b)),
        _ => None,
    }
}

impl PartialEq for FormatRule {
    /// Positional identity: same sheet (case-insensitive), group, and
    /// rule slot. Two snapshots of the same defined rule are equal even
    /// if their definitions have since diverged.
    fn eq(&self, other: &Self) -> bool {
        self.sheet.eq_ignore_ascii_case(&other.sheet)
            && self.group_index == other.group_index
            && self.rule_index == other.rule_index
    }
}

impl Eq for FormatRule {}

impl Hash for FormatRule {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sheet.to_lowercase().hash(state);
        self.group_index.hash(state);
        self.rule_index.hash(state);
    }
}

impl PartialOrd for FormatRule {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FormatRule {
    /// Application order: sheet name (case-insensitive), then priority,
    /// then definition position as the tiebreak.
    fn cmp(&self, other: &Self) -> Ordering {
        self.sheet
            .to_lowercase()
            .cmp(&other.sheet.to_lowercase())
            .then_with(|| self.def.priority.cmp(&other.def.priority))
            .then_with(|| self.group_index.cmp(&other.group_index))
            .then_with(|| self.rule_index.cmp(&other.rule_index))
    }
}

impl std::fmt::Debug for FormatRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRule")
            .field("sheet", &self.sheet)
            .field("group_index", &self.group_index)
            .field("rule_index", &self.rule_index)
            .field("condition", &self.def.condition)
            .field("priority", &self.def.priority)
            .finish()
    }
}
