//! Event argument values
//!
//! Decoded protocol messages carry named arguments. Expectations compare the
//! arguments they expect against the ones received with [`match_args`]: every
//! expected argument must be present and equal, floats being compared with an
//! absolute tolerance.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Named arguments of an event or command message
pub type Args = BTreeMap<String, ArgValue>;

/// Errors raised when converting an [`ArgValue`] into a native type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    #[error("Expected a {expected} value, got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Missing argument: {0}")]
    MissingArgument(String),
}

/// A single decoded argument value
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ArgValue>),
}

impl ArgValue {
    /// Name of the value variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Bool(_) => "bool",
            ArgValue::Int(_) => "int",
            ArgValue::Float(_) => "float",
            ArgValue::Str(_) => "string",
            ArgValue::List(_) => "list",
        }
    }

    pub fn as_bool(&self) -> Result<bool, ValueError> {
        match self {
            ArgValue::Bool(b) => Ok(*b),
            other => Err(other.mismatch("bool")),
        }
    }

    pub fn as_i64(&self) -> Result<i64, ValueError> {
        match self {
            ArgValue::Int(i) => Ok(*i),
            other => Err(other.mismatch("int")),
        }
    }

    /// Numeric view of the value; integers are widened
    pub fn as_f64(&self) -> Result<f64, ValueError> {
        match self {
            ArgValue::Float(f) => Ok(*f),
            ArgValue::Int(i) => Ok(*i as f64),
            other => Err(other.mismatch("float")),
        }
    }

    pub fn as_str(&self) -> Result<&str, ValueError> {
        match self {
            ArgValue::Str(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    fn mismatch(&self, expected: &'static str) -> ValueError {
        ValueError::TypeMismatch {
            expected,
            found: self.type_name(),
        }
    }

    /// Compare a received value against an expected one
    pub fn matches(&self, expected: &ArgValue, float_tol: f64) -> bool {
        match (self, expected) {
            (ArgValue::List(received), ArgValue::List(expected)) => {
                received.len() == expected.len()
                    && received
                        .iter()
                        .zip(expected)
                        .all(|(r, e)| r.matches(e, float_tol))
            }
            (ArgValue::Float(_), ArgValue::Float(_) | ArgValue::Int(_))
            | (ArgValue::Int(_), ArgValue::Float(_)) => {
                match (self.as_f64(), expected.as_f64()) {
                    (Ok(r), Ok(e)) => (r - e).abs() <= float_tol,
                    _ => false,
                }
            }
            (received, expected) => received == expected,
        }
    }
}

/// Check that every expected argument is present in `received` and matches
pub fn match_args(received: &Args, expected: &Args, float_tol: f64) -> bool {
    expected.iter().all(|(name, value)| {
        received
            .get(name)
            .map(|r| r.matches(value, float_tol))
            .unwrap_or(false)
    })
}

/// Fetch a named argument, failing if it's absent
pub fn require<'a>(args: &'a Args, name: &str) -> Result<&'a ArgValue, ValueError> {
    args.get(name)
        .ok_or_else(|| ValueError::MissingArgument(name.to_string()))
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Bool(b) => write!(f, "{}", b),
            ArgValue::Int(i) => write!(f, "{}", i),
            ArgValue::Float(v) => write!(f, "{}", v),
            ArgValue::Str(s) => write!(f, "'{}'", s),
            ArgValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for ArgValue {
    fn from(v: bool) -> Self {
        ArgValue::Bool(v)
    }
}

impl From<i32> for ArgValue {
    fn from(v: i32) -> Self {
        ArgValue::Int(v as i64)
    }
}

impl From<i64> for ArgValue {
    fn from(v: i64) -> Self {
        ArgValue::Int(v)
    }
}

impl From<u8> for ArgValue {
    fn from(v: u8) -> Self {
        ArgValue::Int(v as i64)
    }
}

impl From<u32> for ArgValue {
    fn from(v: u32) -> Self {
        ArgValue::Int(v as i64)
    }
}

impl From<f32> for ArgValue {
    fn from(v: f32) -> Self {
        ArgValue::Float(v as f64)
    }
}

impl From<f64> for ArgValue {
    fn from(v: f64) -> Self {
        ArgValue::Float(v)
    }
}

impl From<&str> for ArgValue {
    fn from(v: &str) -> Self {
        ArgValue::Str(v.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(v: String) -> Self {
        ArgValue::Str(v)
    }
}

impl<T: Into<ArgValue>> From<Vec<T>> for ArgValue {
    fn from(v: Vec<T>) -> Self {
        ArgValue::List(v.into_iter().map(Into::into).collect())
    }
}

/// Build an [`Args`] map: `args! { "state" => "hovering", "alt" => 2.5 }`
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut args = $crate::Args::new();
        $(
            args.insert(::std::string::String::from($name), $crate::ArgValue::from($value));
        )+
        args
    }};
}
