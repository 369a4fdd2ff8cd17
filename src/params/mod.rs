//! Parameter declaration and binding.
//!
//! A procedure declares an ordered set of named, typed parameters
//! ([`ParamSet`]). Callers supply values positionally (tuples of 1 through 19
//! elements, vectors, arrays, iterators) or by name (the [`NamedParams`]
//! builder). Binding pairs supplied values with declarations, applies the
//! declared type's constraint policy, and produces the ordered
//! [`BoundParam`] collection handed to a driver.
//!
//! Binding is pure marshalling — it never contacts a connection.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use thiserror::Error;

use crate::value::{CoercionError, ConstraintMode, SqlType, Value};

pub mod output;

pub use output::{MultiOutput, Output};

/// Parameter direction, as declared by the procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
    InputOutput,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Output => f.write_str("output"),
            Self::InputOutput => f.write_str("input-output"),
        }
    }
}

/// How strictly named binding is validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Validation {
    /// Every declared parameter must be bound exactly once; the supplied
    /// name set must be an exact permutation of the declared names.
    #[default]
    Strict,
    /// Unbound declared parameters are tolerated and fall to the
    /// procedure's defaults.
    Lenient,
}

/// Returns `name` in canonical form: trimmed, with a single leading `@`.
pub(crate) fn canonical(name: &str) -> String {
    let bare = name.trim().trim_start_matches('@');
    format!("@{bare}")
}

pub(crate) fn names_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

/// One declared parameter: canonical name, declared type, direction.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamDef {
    name: String,
    sql_type: SqlType,
    direction: Direction,
}

impl ParamDef {
    /// Declares an input parameter. The name is canonicalized (a leading
    /// `@` is added when absent).
    pub fn new(name: impl AsRef<str>, sql_type: SqlType) -> Self {
        Self {
            name: canonical(name.as_ref()),
            sql_type,
            direction: Direction::Input,
        }
    }

    /// Declares an output parameter.
    pub fn output(name: impl AsRef<str>, sql_type: SqlType) -> Self {
        Self {
            direction: Direction::Output,
            ..Self::new(name, sql_type)
        }
    }

    /// Declares an input-output parameter.
    pub fn input_output(name: impl AsRef<str>, sql_type: SqlType) -> Self {
        Self {
            direction: Direction::InputOutput,
            ..Self::new(name, sql_type)
        }
    }

    /// Returns the canonical parameter name (with leading `@`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the declared type.
    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    /// Returns the declared direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// Ordered collection of declared parameters with case-insensitive
/// find-by-name.
///
/// # Examples
///
/// ```
/// use sqlprog::params::{ParamDef, ParamSet};
/// use sqlprog::value::SqlType;
///
/// let mut defs = ParamSet::new();
/// defs.push(ParamDef::new("user_id", SqlType::Int)).unwrap();
/// defs.push(ParamDef::new("name", SqlType::VarChar(Some(40)))).unwrap();
///
/// assert!(defs.contains("@USER_ID"));
/// assert_eq!(defs.position("name"), Some(1));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    defs: Vec<ParamDef>,
}

impl ParamSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a declaration.
    ///
    /// # Errors
    ///
    /// Returns [`BindError::DuplicateParameter`] if a parameter with the
    /// same name (case-insensitive) is already declared.
    pub fn push(&mut self, def: ParamDef) -> Result<(), BindError> {
        if self.contains(def.name()) {
            return Err(BindError::DuplicateParameter {
                name: def.name().to_owned(),
            });
        }
        self.defs.push(def);
        Ok(())
    }

    /// Returns the declaration with the given name (case-insensitive,
    /// leading `@` optional), if any.
    pub fn get(&self, name: &str) -> Option<&ParamDef> {
        let wanted = canonical(name);
        self.defs.iter().find(|d| names_match(&d.name, &wanted))
    }

    /// Returns the declaration position for the given name.
    pub fn position(&self, name: &str) -> Option<usize> {
        let wanted = canonical(name);
        self.defs.iter().position(|d| names_match(&d.name, &wanted))
    }

    /// Returns `true` if a parameter with the given name is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Number of declared parameters.
    pub fn len(&self) -> usize {
        self.defs.len()
    }

    /// Returns `true` if no parameters are declared.
    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Iterates declarations in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ParamDef> {
        self.defs.iter()
    }

    // Renames the declaration at `index`; used by configuration remapping.
    pub(crate) fn set_name(&mut self, index: usize, name: &str) {
        self.defs[index].name = canonical(name);
    }

    // Binds a single named value outside a full bind pass; used by command
    // parameter mutation.
    pub(crate) fn bind_value(
        &self,
        name: &str,
        arg: Arg,
        mode: ConstraintMode,
    ) -> Result<BoundParam, BindError> {
        let def = self.get(name).ok_or_else(|| BindError::UnknownParameter {
            name: canonical(name),
        })?;
        bind_one(def, arg, mode)
    }

    /// Binds supplied parameters against this declaration set.
    ///
    /// Positional values are paired in declaration order; named values are
    /// looked up case-insensitively and the result is returned in
    /// declaration order regardless of the order supplied. Every paired
    /// value passes through [`SqlType::conform`] under `mode`.
    ///
    /// # Errors
    ///
    /// - [`BindError::TooManyValues`] — more positional values than
    ///   declared parameters.
    /// - [`BindError::UnknownParameter`] — a supplied name is not declared.
    /// - [`BindError::DuplicateParameter`] — a name supplied twice.
    /// - [`BindError::MissingParameter`] — a declared parameter left
    ///   unbound under [`Validation::Strict`] named binding.
    /// - [`BindError::DirectionMismatch`] — a plain value supplied for an
    ///   output parameter, or an output wrapper for an input parameter.
    /// - [`BindError::Coercion`] — the declared type rejected the value.
    pub fn bind(
        &self,
        params: Params,
        mode: ConstraintMode,
        validation: Validation,
    ) -> Result<Vec<BoundParam>, BindError> {
        match params {
            Params::None => self.bind_positional(Vec::new(), mode),
            Params::Positional(args) => self.bind_positional(args, mode),
            Params::Named(pairs) => self.bind_named(pairs, mode, validation),
        }
    }

    fn bind_positional(
        &self,
        args: Vec<Arg>,
        mode: ConstraintMode,
    ) -> Result<Vec<BoundParam>, BindError> {
        if args.len() > self.defs.len() {
            return Err(BindError::TooManyValues {
                supplied: args.len(),
                declared: self.defs.len(),
            });
        }
        self.defs
            .iter()
            .zip(args)
            .map(|(def, arg)| bind_one(def, arg, mode))
            .collect()
    }

    fn bind_named(
        &self,
        pairs: Vec<(String, Arg)>,
        mode: ConstraintMode,
        validation: Validation,
    ) -> Result<Vec<BoundParam>, BindError> {
        let mut slots: Vec<Option<Arg>> = (0..self.defs.len()).map(|_| None).collect();

        for (name, arg) in pairs {
            let Some(index) = self.position(&name) else {
                return Err(BindError::UnknownParameter {
                    name: canonical(&name),
                });
            };
            if slots[index].is_some() {
                return Err(BindError::DuplicateParameter {
                    name: self.defs[index].name.clone(),
                });
            }
            slots[index] = Some(arg);
        }

        if validation == Validation::Strict {
            if let Some(unbound) = self
                .defs
                .iter()
                .zip(&slots)
                .find_map(|(def, slot)| slot.is_none().then_some(def))
            {
                return Err(BindError::MissingParameter {
                    name: unbound.name.clone(),
                });
            }
        }

        self.defs
            .iter()
            .zip(slots)
            .filter_map(|(def, slot)| slot.map(|arg| (def, arg)))
            .map(|(def, arg)| bind_one(def, arg, mode))
            .collect()
    }
}

fn bind_one(def: &ParamDef, arg: Arg, mode: ConstraintMode) -> Result<BoundParam, BindError> {
    match (def.direction, &arg.sink) {
        (Direction::Input, Some(_)) => {
            return Err(BindError::DirectionMismatch {
                name: def.name.clone(),
                declared: Direction::Input,
                supplied: "an output wrapper",
            });
        }
        (Direction::Output | Direction::InputOutput, None) => {
            return Err(BindError::DirectionMismatch {
                name: def.name.clone(),
                declared: def.direction,
                supplied: "a plain value",
            });
        }
        _ => {}
    }

    let value = def
        .sql_type
        .conform(arg.value, mode)
        .map_err(|source| BindError::Coercion {
            name: def.name.clone(),
            source,
        })?;

    Ok(BoundParam {
        name: def.name.clone(),
        sql_type: def.sql_type,
        direction: def.direction,
        value,
        sink: arg.sink,
    })
}

/// Rejects bound sets that carry a single-connection output sink; broadcast
/// execution requires [`MultiOutput`].
pub(crate) fn ensure_broadcast_safe(bound: &[BoundParam]) -> Result<(), BindError> {
    for param in bound {
        if matches!(param.sink, Some(Sink::Single(_))) {
            return Err(BindError::OutputInBroadcast {
                name: param.name.clone(),
            });
        }
    }
    Ok(())
}

/// Errors produced while binding parameters.
#[derive(Debug, Error, PartialEq)]
pub enum BindError {
    #[error("{supplied} values supplied but only {declared} parameters are declared")]
    TooManyValues { supplied: usize, declared: usize },

    #[error("unknown parameter {name}")]
    UnknownParameter { name: String },

    #[error("parameter {name} bound more than once")]
    DuplicateParameter { name: String },

    #[error("parameter {name} is declared but not bound under strict validation")]
    MissingParameter { name: String },

    #[error("parameter {name} is declared {declared} but was supplied as {supplied}")]
    DirectionMismatch {
        name: String,
        declared: Direction,
        supplied: &'static str,
    },

    #[error("output parameter {name} requires a multi-connection output wrapper for broadcast execution")]
    OutputInBroadcast { name: String },

    #[error("parameter {name}: {source}")]
    Coercion {
        name: String,
        #[source]
        source: CoercionError,
    },
}

// ── Bound parameters and output sinks ─────────────────────────────────────────

// Where a driver-reported output value lands after execution.
#[derive(Debug, Clone)]
pub(crate) enum Sink {
    Single(Arc<Mutex<Option<Value>>>),
    Multi(Arc<Mutex<Vec<(String, Value)>>>),
}

impl Sink {
    pub(crate) fn record(&self, endpoint: &str, value: Value) {
        match self {
            Self::Single(slot) => {
                *slot.lock().expect("output slot poisoned") = Some(value);
            }
            Self::Multi(slot) => {
                slot.lock()
                    .expect("output slot poisoned")
                    .push((endpoint.to_owned(), value));
            }
        }
    }
}

/// One bound parameter, ready to hand to a driver.
#[derive(Debug, Clone)]
pub struct BoundParam {
    name: String,
    sql_type: SqlType,
    direction: Direction,
    value: Value,
    pub(crate) sink: Option<Sink>,
}

impl BoundParam {
    /// Canonical parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared type.
    pub fn sql_type(&self) -> SqlType {
        self.sql_type
    }

    /// Declared direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The conformed input value (`Null` for pure output parameters bound
    /// without an initial value).
    pub fn value(&self) -> &Value {
        &self.value
    }
}

// ── Supplied parameters ───────────────────────────────────────────────────────

/// One supplied argument: a value, optionally carrying an output sink.
#[derive(Debug, Clone)]
pub struct Arg {
    pub(crate) value: Value,
    pub(crate) sink: Option<Sink>,
}

/// Conversion into a single supplied argument.
///
/// Implemented for every type convertible into [`Value`], and for references
/// to the [`Output`] and [`MultiOutput`] wrappers.
pub trait IntoArg {
    fn into_arg(self) -> Arg;
}

impl IntoArg for Arg {
    fn into_arg(self) -> Arg {
        self
    }
}

impl IntoArg for Value {
    fn into_arg(self) -> Arg {
        Arg {
            value: self,
            sink: None,
        }
    }
}

macro_rules! impl_into_arg_via_value {
    ($($t:ty),+ $(,)?) => {
        $(impl IntoArg for $t {
            fn into_arg(self) -> Arg {
                Value::from(self).into_arg()
            }
        })+
    };
}

impl_into_arg_via_value!(
    bool, i8, i16, i32, i64, u8, u16, u32, f32, f64, String, &str, Vec<u8>, bytes::Bytes,
);

impl<T: Into<Value>> IntoArg for Option<T> {
    fn into_arg(self) -> Arg {
        Value::from(self).into_arg()
    }
}

/// Supplied parameters for one invocation.
#[derive(Debug, Clone, Default)]
pub enum Params {
    /// No parameters supplied; declared parameters fall to their defaults.
    #[default]
    None,
    /// Values paired with declarations in declaration order.
    Positional(Vec<Arg>),
    /// Values looked up by declared name.
    Named(Vec<(String, Arg)>),
}

/// Conversion into [`Params`].
///
/// Tuples of 1 through 19 elements bind positionally — one implementation
/// per arity, expanded below.
pub trait IntoParams {
    fn into_params(self) -> Params;
}

impl IntoParams for Params {
    fn into_params(self) -> Params {
        self
    }
}

impl IntoParams for () {
    fn into_params(self) -> Params {
        Params::None
    }
}

impl IntoParams for Vec<Value> {
    fn into_params(self) -> Params {
        Params::Positional(self.into_iter().map(IntoArg::into_arg).collect())
    }
}

impl IntoParams for &[Value] {
    fn into_params(self) -> Params {
        Params::Positional(self.iter().cloned().map(IntoArg::into_arg).collect())
    }
}

impl IntoParams for Vec<(String, Value)> {
    fn into_params(self) -> Params {
        Params::Named(
            self.into_iter()
                .map(|(name, value)| (name, value.into_arg()))
                .collect(),
        )
    }
}

impl<T: IntoArg, const N: usize> IntoParams for [T; N] {
    fn into_params(self) -> Params {
        Params::Positional(self.into_iter().map(IntoArg::into_arg).collect())
    }
}

/// Builds positional parameters from an iterator of convertible values.
pub fn params_from_iter<I>(iter: I) -> Params
where
    I: IntoIterator,
    I::Item: IntoArg,
{
    Params::Positional(iter.into_iter().map(IntoArg::into_arg).collect())
}

/// Fluent builder for named parameters.
///
/// # Examples
///
/// ```
/// use sqlprog::params::NamedParams;
///
/// let params = NamedParams::new()
///     .with("user_id", 7)
///     .with("name", "alice");
/// ```
#[derive(Debug, Clone, Default)]
pub struct NamedParams {
    pairs: Vec<(String, Arg)>,
}

impl NamedParams {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one named argument.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl IntoArg) -> Self {
        self.pairs.push((name.into(), value.into_arg()));
        self
    }
}

impl IntoParams for NamedParams {
    fn into_params(self) -> Params {
        Params::Named(self.pairs)
    }
}

// One implementation per arity, 1 through 19 — the variadic rendering of the
// fixed-arity overload family.
macro_rules! impl_into_params_for_tuple {
    ($($T:ident : $idx:tt),+) => {
        impl<$($T: IntoArg),+> IntoParams for ($($T,)+) {
            fn into_params(self) -> Params {
                Params::Positional(vec![$(self.$idx.into_arg()),+])
            }
        }
    };
}

impl_into_params_for_tuple!(T1: 0);
impl_into_params_for_tuple!(T1: 0, T2: 1);
impl_into_params_for_tuple!(T1: 0, T2: 1, T3: 2);
impl_into_params_for_tuple!(T1: 0, T2: 1, T3: 2, T4: 3);
impl_into_params_for_tuple!(T1: 0, T2: 1, T3: 2, T4: 3, T5: 4);
impl_into_params_for_tuple!(T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5);
impl_into_params_for_tuple!(T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6);
impl_into_params_for_tuple!(T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7);
impl_into_params_for_tuple!(T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8);
impl_into_params_for_tuple!(
    T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8, T10: 9
);
impl_into_params_for_tuple!(
    T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8, T10: 9, T11: 10
);
impl_into_params_for_tuple!(
    T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8, T10: 9, T11: 10, T12: 11
);
impl_into_params_for_tuple!(
    T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8, T10: 9, T11: 10, T12: 11,
    T13: 12
);
impl_into_params_for_tuple!(
    T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8, T10: 9, T11: 10, T12: 11,
    T13: 12, T14: 13
);
impl_into_params_for_tuple!(
    T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8, T10: 9, T11: 10, T12: 11,
    T13: 12, T14: 13, T15: 14
);
impl_into_params_for_tuple!(
    T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8, T10: 9, T11: 10, T12: 11,
    T13: 12, T14: 13, T15: 14, T16: 15
);
impl_into_params_for_tuple!(
    T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8, T10: 9, T11: 10, T12: 11,
    T13: 12, T14: 13, T15: 14, T16: 15, T17: 16
);
impl_into_params_for_tuple!(
    T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8, T10: 9, T11: 10, T12: 11,
    T13: 12, T14: 13, T15: 14, T16: 15, T17: 16, T18: 17
);
impl_into_params_for_tuple!(
    T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5, T7: 6, T8: 7, T9: 8, T10: 9, T11: 10, T12: 11,
    T13: 12, T14: 13, T15: 14, T16: 15, T17: 16, T18: 17, T19: 18
);
