//! Evaluated cell values.
//!
//! `Value` is what the external recalculation engine hands back for a
//! formula or cell: a scalar, an error, or a lazy reference handle. This
//! crate never constructs numeric results itself except as comparison
//! bounds; everything else flows in through `model::Recalc`.

use std::fmt;

use crate::refs::{AreaHandle, RefHandle};

/// Evaluation error codes, mirroring the file format's BIFF error codes.
///
/// The numeric IDs are what the on-disk records store; do not rely on
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Null,
    Div0,
    Value,
    Ref,
    Name,
    Num,
    NA,
}

impl ErrorKind {
    /// The on-disk error code.
    pub fn code(self) -> u8 {
        match self {
            ErrorKind::Null => 0x00,
            ErrorKind::Div0 => 0x07,
            ErrorKind::Value => 0x0F,
            ErrorKind::Ref => 0x17,
            ErrorKind::Name => 0x1D,
            ErrorKind::Num => 0x24,
            ErrorKind::NA => 0x2A,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(ErrorKind::Null),
            0x07 => Some(ErrorKind::Div0),
            0x0F => Some(ErrorKind::Value),
            0x17 => Some(ErrorKind::Ref),
            0x1D => Some(ErrorKind::Name),
            0x24 => Some(ErrorKind::Num),
            0x2A => Some(ErrorKind::NA),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ErrorKind::Null => "#NULL!",
            ErrorKind::Div0 => "#DIV/0!",
            ErrorKind::Value => "#VALUE!",
            ErrorKind::Ref => "#REF!",
            ErrorKind::Name => "#NAME?",
            ErrorKind::Num => "#NUM!",
            ErrorKind::NA => "#N/A",
        };
        write!(f, "{}", text)
    }
}

/// An evaluated value.
///
/// Scalar variants carry data directly; `Ref` and `Area` are lazy
/// handles that fetch cell values on demand. `ExternalName` and
/// `FunctionName` are resolution intermediates for cross-workbook
/// tokens.
#[derive(Debug, Clone)]
pub enum Value {
    Blank,
    Number(f64),
    Text(String),
    Bool(bool),
    Error(ErrorKind),
    Ref(RefHandle),
    Area(AreaHandle),
    ExternalName(String),
    FunctionName(String),
}

impl Default for Value {
    fn default() -> Self {
        Value::Blank
    }
}

impl Value {
    pub fn is_blank(&self) -> bool {
        matches!(self, Value::Blank)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Text form used for display comparisons.
    ///
    /// Numbers print the stored decimal representation without an
    /// exponent for the magnitudes the format stores exactly.
    pub fn display_text(&self) -> String {
        match self {
            Value::Blank => String::new(),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::Text(s) => s.clone(),
            Value::Bool(b) => {
                if *b {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            Value::Error(e) => e.to_string(),
            Value::Ref(_) | Value::Area(_) => String::new(),
            Value::ExternalName(name) | Value::FunctionName(name) => name.clone(),
        }
    }
}

impl PartialEq for Value {
    /// Scalars compare by content. Lazy handles compare by coordinates
    /// and sheet span only; the backing value sources are opaque.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Blank, Value::Blank) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a.same_location(b),
            (Value::Area(a), Value::Area(b)) => a.same_location(b),
            (Value::ExternalName(a), Value::ExternalName(b)) => a == b,
            (Value::FunctionName(a), Value::FunctionName(b)) => a == b,
            _ => false,
        }
    }
}
