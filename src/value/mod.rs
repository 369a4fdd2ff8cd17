//! SQL value model: runtime values, declared types, and the constraint policy
//! applied when a supplied value must shrink to fit its declared type.
//!
//! A [`Value`] is what callers hand to the binding layer; a [`SqlType`] is what
//! a procedure declares for each parameter, including its constraint data
//! (length limits, integer width). [`SqlType::conform`] reconciles the two
//! under a [`ConstraintMode`].

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// A runtime SQL value.
///
/// # Examples
///
/// ```
/// use sqlprog::value::Value;
///
/// let v: Value = "hello".into();
/// assert_eq!(v, Value::Text("hello".to_owned()));
///
/// let n: Value = Option::<i64>::None.into();
/// assert_eq!(n, Value::Null);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    Blob(Bytes),
}

impl Value {
    /// Returns a short name for the value's type class, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }

    /// Returns `true` if this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Real(r) => write!(f, "{r}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A declared parameter or column type, carrying its constraint data.
///
/// Variable-length types hold their maximum length (`None` means unbounded);
/// fixed-width integer types imply a range check on bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Bool,
    /// 8-bit unsigned integer (0..=255).
    TinyInt,
    /// 16-bit signed integer.
    SmallInt,
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer.
    BigInt,
    /// 32-bit float; binding a wider value is subject to the constraint mode.
    Real,
    /// 64-bit float.
    Double,
    /// Fixed-length character data, right-padded with spaces.
    Char(usize),
    /// Variable-length character data with an optional maximum length.
    VarChar(Option<usize>),
    /// Variable-length binary data with an optional maximum length.
    VarBinary(Option<usize>),
    /// An XML document; bound text must be minimally well-formed.
    Xml,
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => f.write_str("bool"),
            Self::TinyInt => f.write_str("tinyint"),
            Self::SmallInt => f.write_str("smallint"),
            Self::Int => f.write_str("int"),
            Self::BigInt => f.write_str("bigint"),
            Self::Real => f.write_str("real"),
            Self::Double => f.write_str("double"),
            Self::Char(n) => write!(f, "char({n})"),
            Self::VarChar(Some(n)) => write!(f, "varchar({n})"),
            Self::VarChar(None) => f.write_str("varchar(max)"),
            Self::VarBinary(Some(n)) => write!(f, "varbinary({n})"),
            Self::VarBinary(None) => f.write_str("varbinary(max)"),
            Self::Xml => f.write_str("xml"),
        }
    }
}

/// Policy governing behavior when a supplied value must be truncated or lose
/// precision to fit its declared type.
///
/// Integer range overflow is an error under every mode; the mode governs only
/// string/binary truncation and float narrowing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintMode {
    /// Reject the value with [`CoercionError::Truncated`] or
    /// [`CoercionError::PrecisionLoss`].
    #[default]
    Error,
    /// Coerce the value and emit a `tracing` warning.
    Warn,
    /// Coerce the value quietly.
    Silent,
}

/// Errors produced while conforming or converting values.
#[derive(Debug, Error, PartialEq)]
pub enum CoercionError {
    #[error("type mismatch: {supplied} value cannot be bound as {declared}")]
    TypeMismatch {
        declared: SqlType,
        supplied: &'static str,
    },

    #[error("value {value} is out of range for {declared}")]
    OutOfRange { declared: SqlType, value: i64 },

    #[error("value of length {len} exceeds {declared} limit of {max}")]
    Truncated {
        declared: SqlType,
        len: usize,
        max: usize,
    },

    #[error("value {value} loses precision when narrowed to {declared}")]
    PrecisionLoss { declared: SqlType, value: f64 },

    #[error("malformed XML document: {0}")]
    MalformedXml(String),

    #[error("cannot convert {supplied} value to {requested}")]
    Conversion {
        requested: &'static str,
        supplied: &'static str,
    },
}

impl SqlType {
    /// Validates and coerces `value` to this declared type under `mode`.
    ///
    /// `Null` conforms to every type unchanged. Conforming is idempotent: a
    /// value that already fits is returned as-is, and a coerced value fits
    /// its declared type on a second pass.
    ///
    /// # Errors
    ///
    /// - [`CoercionError::TypeMismatch`] — the value's type class cannot be
    ///   bound as this declared type under any mode.
    /// - [`CoercionError::OutOfRange`] — integer outside the declared width.
    /// - [`CoercionError::Truncated`] / [`CoercionError::PrecisionLoss`] —
    ///   lossy coercion rejected under [`ConstraintMode::Error`].
    /// - [`CoercionError::MalformedXml`] — text bound as `Xml` is not a
    ///   single well-formed document.
    pub fn conform(&self, value: Value, mode: ConstraintMode) -> Result<Value, CoercionError> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match (self, value) {
            (Self::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),

            (Self::TinyInt, Value::Int(i)) => self.check_range(i, 0, 255),
            (Self::SmallInt, Value::Int(i)) => {
                self.check_range(i, i64::from(i16::MIN), i64::from(i16::MAX))
            }
            (Self::Int, Value::Int(i)) => {
                self.check_range(i, i64::from(i32::MIN), i64::from(i32::MAX))
            }
            (Self::BigInt, Value::Int(i)) => Ok(Value::Int(i)),

            (Self::Real, Value::Int(i)) => self.narrow_to_f32(i as f64, mode),
            (Self::Real, Value::Real(r)) => self.narrow_to_f32(r, mode),
            (Self::Double, Value::Real(r)) => Ok(Value::Real(r)),
            (Self::Double, Value::Int(i)) => {
                let widened = i as f64;
                if widened as i64 == i {
                    Ok(Value::Real(widened))
                } else {
                    self.lossy(Value::Real(widened), mode, || CoercionError::PrecisionLoss {
                        declared: *self,
                        value: widened,
                    })
                }
            }

            (Self::Char(n), Value::Text(s)) => {
                let len = s.chars().count();
                if len > *n {
                    let truncated: String = s.chars().take(*n).collect();
                    self.lossy(Value::Text(truncated), mode, || CoercionError::Truncated {
                        declared: *self,
                        len,
                        max: *n,
                    })
                } else if len < *n {
                    // Fixed-length char data is space-padded; padding is lossless.
                    let mut padded = s;
                    padded.extend(std::iter::repeat_n(' ', *n - len));
                    Ok(Value::Text(padded))
                } else {
                    Ok(Value::Text(s))
                }
            }
            (Self::VarChar(limit), Value::Text(s)) => {
                let len = s.chars().count();
                match limit {
                    Some(max) if len > *max => {
                        let truncated: String = s.chars().take(*max).collect();
                        self.lossy(Value::Text(truncated), mode, || CoercionError::Truncated {
                            declared: *self,
                            len,
                            max: *max,
                        })
                    }
                    _ => Ok(Value::Text(s)),
                }
            }
            (Self::VarBinary(limit), Value::Blob(b)) => match limit {
                Some(max) if b.len() > *max => {
                    let truncated = b.slice(..*max);
                    self.lossy(Value::Blob(truncated), mode, || CoercionError::Truncated {
                        declared: *self,
                        len: b.len(),
                        max: *max,
                    })
                }
                _ => Ok(Value::Blob(b)),
            },

            (Self::Xml, Value::Text(s)) => match well_formed_xml(&s) {
                Ok(()) => Ok(Value::Text(s)),
                Err(reason) => Err(CoercionError::MalformedXml(reason)),
            },

            (_, other) => Err(CoercionError::TypeMismatch {
                declared: *self,
                supplied: other.type_name(),
            }),
        }
    }

    fn check_range(&self, i: i64, min: i64, max: i64) -> Result<Value, CoercionError> {
        if (min..=max).contains(&i) {
            Ok(Value::Int(i))
        } else {
            Err(CoercionError::OutOfRange {
                declared: *self,
                value: i,
            })
        }
    }

    fn narrow_to_f32(&self, v: f64, mode: ConstraintMode) -> Result<Value, CoercionError> {
        let narrowed = f64::from(v as f32);
        if narrowed == v || !v.is_finite() {
            Ok(Value::Real(narrowed))
        } else {
            self.lossy(Value::Real(narrowed), mode, || CoercionError::PrecisionLoss {
                declared: *self,
                value: v,
            })
        }
    }

    // Resolves a lossy coercion according to the constraint mode.
    fn lossy(
        &self,
        coerced: Value,
        mode: ConstraintMode,
        err: impl FnOnce() -> CoercionError,
    ) -> Result<Value, CoercionError> {
        match mode {
            ConstraintMode::Error => Err(err()),
            ConstraintMode::Warn => {
                warn!(declared = %self, detail = %err(), "lossy coercion applied");
                Ok(coerced)
            }
            ConstraintMode::Silent => Ok(coerced),
        }
    }
}

// ── Conversions into Value ────────────────────────────────────────────────────

macro_rules! value_from_int {
    ($($t:ty),+ $(,)?) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(i64::from(v))
            }
        })+
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Real(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(Bytes::from(v))
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

// ── Conversions out of Value ──────────────────────────────────────────────────

macro_rules! try_from_value {
    ($t:ty, $name:literal, $pat:pat => $out:expr) => {
        impl TryFrom<Value> for $t {
            type Error = CoercionError;

            fn try_from(value: Value) -> Result<Self, Self::Error> {
                match value {
                    $pat => $out,
                    other => Err(CoercionError::Conversion {
                        requested: $name,
                        supplied: other.type_name(),
                    }),
                }
            }
        }
    };
}

try_from_value!(bool, "bool", Value::Bool(b) => Ok(b));
try_from_value!(i64, "i64", Value::Int(i) => Ok(i));
try_from_value!(String, "string", Value::Text(s) => Ok(s));
try_from_value!(Bytes, "bytes", Value::Blob(b) => Ok(b));

impl TryFrom<Value> for f64 {
    type Error = CoercionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Real(r) => Ok(r),
            Value::Int(i) => Ok(i as f64),
            other => Err(CoercionError::Conversion {
                requested: "f64",
                supplied: other.type_name(),
            }),
        }
    }
}

impl TryFrom<Value> for i32 {
    type Error = CoercionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int(i) => i32::try_from(i).map_err(|_| CoercionError::OutOfRange {
                declared: SqlType::Int,
                value: i,
            }),
            other => Err(CoercionError::Conversion {
                requested: "i32",
                supplied: other.type_name(),
            }),
        }
    }
}

impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = CoercionError>,
{
    type Error = CoercionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(None),
            other => T::try_from(other).map(Some),
        }
    }
}

// ── Minimal XML well-formedness check ─────────────────────────────────────────

/// Checks that `s` contains exactly one minimally well-formed XML document:
/// balanced tags and a single root element. Prolog, comments, and CDATA
/// sections are skipped; attribute values may contain `>`.
pub(crate) fn well_formed_xml(s: &str) -> Result<(), String> {
    let mut stack: Vec<&str> = Vec::new();
    let mut roots = 0usize;
    let mut rest = s;

    loop {
        let Some(open) = rest.find('<') else { break };
        rest = &rest[open..];

        if let Some(r) = rest.strip_prefix("<?") {
            let end = r.find("?>").ok_or("unterminated processing instruction")?;
            rest = &r[end + 2..];
        } else if let Some(r) = rest.strip_prefix("<!--") {
            let end = r.find("-->").ok_or("unterminated comment")?;
            rest = &r[end + 3..];
        } else if let Some(r) = rest.strip_prefix("<![CDATA[") {
            let end = r.find("]]>").ok_or("unterminated CDATA section")?;
            rest = &r[end + 3..];
        } else if let Some(r) = rest.strip_prefix("</") {
            let end = r.find('>').ok_or("unterminated closing tag")?;
            let name = r[..end].trim();
            match stack.pop() {
                Some(expected) if expected == name => {}
                Some(expected) => {
                    return Err(format!("mismatched closing tag: expected </{expected}>, found </{name}>"));
                }
                None => return Err(format!("unexpected closing tag </{name}>")),
            }
            rest = &r[end + 1..];
        } else {
            let end = tag_end(&rest[1..]).ok_or("unterminated tag")?;
            let inner = &rest[1..end + 1];
            let self_closing = inner.ends_with('/');
            let inner = inner.trim_end_matches('/');
            let name = inner
                .split_whitespace()
                .next()
                .ok_or("empty tag name")?;
            if stack.is_empty() {
                roots += 1;
            }
            if !self_closing {
                stack.push(name);
            }
            rest = &rest[end + 2..];
        }
    }

    if let Some(unclosed) = stack.last() {
        return Err(format!("unclosed element <{unclosed}>"));
    }
    match roots {
        0 => Err("no root element".to_owned()),
        1 => Ok(()),
        n => Err(format!("{n} root elements, expected exactly one")),
    }
}

// Finds the index of the tag-closing `>`, skipping quoted attribute values.
fn tag_end(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '>') => return Some(i),
            (None, _) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_conforms_to_everything() {
        for ty in [SqlType::Bool, SqlType::Int, SqlType::VarChar(Some(3)), SqlType::Xml] {
            assert_eq!(ty.conform(Value::Null, ConstraintMode::Error), Ok(Value::Null));
        }
    }

    #[test]
    fn integer_widths() {
        assert_eq!(
            SqlType::TinyInt.conform(255.into(), ConstraintMode::Error),
            Ok(Value::Int(255))
        );
        assert!(matches!(
            SqlType::TinyInt.conform(256.into(), ConstraintMode::Silent),
            Err(CoercionError::OutOfRange { .. })
        ));
        assert!(matches!(
            SqlType::SmallInt.conform(40_000.into(), ConstraintMode::Silent),
            Err(CoercionError::OutOfRange { .. })
        ));
        assert_eq!(
            SqlType::BigInt.conform(i64::MAX.into(), ConstraintMode::Error),
            Ok(Value::Int(i64::MAX))
        );
    }

    #[test]
    fn varchar_truncation_by_mode() {
        let ty = SqlType::VarChar(Some(3));
        assert!(matches!(
            ty.conform("abcdef".into(), ConstraintMode::Error),
            Err(CoercionError::Truncated { len: 6, max: 3, .. })
        ));
        assert_eq!(
            ty.conform("abcdef".into(), ConstraintMode::Warn),
            Ok(Value::Text("abc".to_owned()))
        );
        assert_eq!(
            ty.conform("abcdef".into(), ConstraintMode::Silent),
            Ok(Value::Text("abc".to_owned()))
        );
        // Within the limit, every mode is a no-op.
        assert_eq!(ty.conform("ab".into(), ConstraintMode::Error), Ok(Value::Text("ab".to_owned())));
    }

    #[test]
    fn char_padding_is_lossless() {
        assert_eq!(
            SqlType::Char(4).conform("ab".into(), ConstraintMode::Error),
            Ok(Value::Text("ab  ".to_owned()))
        );
    }

    #[test]
    fn conform_is_idempotent() {
        let ty = SqlType::Char(4);
        let once = ty.conform("abcdef".into(), ConstraintMode::Silent).unwrap();
        let twice = ty.conform(once.clone(), ConstraintMode::Silent).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn real_narrowing() {
        // 0.5 is exactly representable in f32.
        assert_eq!(
            SqlType::Real.conform(0.5f64.into(), ConstraintMode::Error),
            Ok(Value::Real(0.5))
        );
        assert!(matches!(
            SqlType::Real.conform(0.1f64.into(), ConstraintMode::Error),
            Err(CoercionError::PrecisionLoss { .. })
        ));
        assert!(SqlType::Real.conform(0.1f64.into(), ConstraintMode::Silent).is_ok());
    }

    #[test]
    fn type_class_mismatch() {
        assert!(matches!(
            SqlType::Int.conform("five".into(), ConstraintMode::Silent),
            Err(CoercionError::TypeMismatch { .. })
        ));
        assert!(matches!(
            SqlType::VarChar(None).conform(5.into(), ConstraintMode::Silent),
            Err(CoercionError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn xml_well_formedness() {
        let ok = SqlType::Xml.conform("<a><b x=\"1>2\"/></a>".into(), ConstraintMode::Error);
        assert!(ok.is_ok());
        assert!(matches!(
            SqlType::Xml.conform("<a><b></a>".into(), ConstraintMode::Error),
            Err(CoercionError::MalformedXml(_))
        ));
        assert!(matches!(
            SqlType::Xml.conform("<a/><b/>".into(), ConstraintMode::Error),
            Err(CoercionError::MalformedXml(_))
        ));
    }

    #[test]
    fn xml_prolog_and_comments() {
        let doc = "<?xml version=\"1.0\"?><!-- note --><root><child/></root>";
        assert_eq!(well_formed_xml(doc), Ok(()));
    }

    #[test]
    fn typed_extraction() {
        assert_eq!(i64::try_from(Value::Int(7)), Ok(7));
        assert_eq!(f64::try_from(Value::Int(2)), Ok(2.0));
        assert_eq!(Option::<i64>::try_from(Value::Null), Ok(None));
        assert!(matches!(
            String::try_from(Value::Int(1)),
            Err(CoercionError::Conversion { .. })
        ));
        assert!(i32::try_from(Value::Int(i64::MAX)).is_err());
    }
}
