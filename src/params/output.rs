//! Output-parameter wrappers.
//!
//! A procedure's output parameter needs somewhere to land after execution.
//! [`Output`] receives a single value from a single-connection execution;
//! [`MultiOutput`] collects one value per connection and is the wrapper the
//! broadcast (`_all`) execution forms require — handing an [`Output`] to a
//! broadcast call fails validation before any connection is contacted.

use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::params::{Arg, IntoArg, Sink};
use crate::value::{CoercionError, Value};

/// Receives the value a procedure writes to an output parameter on a
/// single-connection execution.
///
/// The wrapper is passed by reference when binding and read after the call
/// completes:
///
/// ```
/// use sqlprog::params::Output;
///
/// let total = Output::<i64>::new();
/// // ... bind (&total) into a program call, execute ...
/// assert_eq!(total.get().unwrap(), None); // nothing written yet
/// ```
#[derive(Debug)]
pub struct Output<T> {
    initial: Value,
    slot: Arc<Mutex<Option<Value>>>,
    marker: PhantomData<fn() -> T>,
}

impl<T> Output<T> {
    /// Creates an output wrapper with no initial value (the bound value is
    /// `NULL`; suitable for `Output` parameters).
    pub fn new() -> Self {
        Self::with_initial(Value::Null)
    }

    /// Creates an output wrapper carrying an initial value, for
    /// input-output parameters.
    pub fn with_initial(value: impl Into<Value>) -> Self {
        Self {
            initial: value.into(),
            slot: Arc::new(Mutex::new(None)),
            marker: PhantomData,
        }
    }

    /// Returns the raw value written by the procedure, or `None` if nothing
    /// has been written.
    pub fn raw(&self) -> Option<Value> {
        self.slot.lock().expect("output slot poisoned").clone()
    }

    pub(crate) fn slot(&self) -> Arc<Mutex<Option<Value>>> {
        Arc::clone(&self.slot)
    }
}

impl<T> Output<T>
where
    T: TryFrom<Value, Error = CoercionError>,
{
    /// Returns the typed value written by the procedure.
    ///
    /// `None` means the procedure has not (yet) written a value, or wrote
    /// `NULL`.
    ///
    /// # Errors
    ///
    /// Returns [`CoercionError::Conversion`] if the written value cannot be
    /// converted to `T`.
    pub fn get(&self) -> Result<Option<T>, CoercionError> {
        match self.raw() {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::try_from(value).map(Some),
        }
    }
}

impl<T> Default for Output<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Output<T> {
    fn clone(&self) -> Self {
        Self {
            initial: self.initial.clone(),
            slot: Arc::clone(&self.slot),
            marker: PhantomData,
        }
    }
}

impl<T> IntoArg for &Output<T> {
    fn into_arg(self) -> Arg {
        Arg {
            value: self.initial.clone(),
            sink: Some(Sink::Single(self.slot())),
        }
    }
}

/// Collects one output value per connection from a broadcast execution.
///
/// Values are recorded as `(endpoint id, value)` pairs in the order the
/// per-connection results are joined (endpoint declaration order).
#[derive(Debug)]
pub struct MultiOutput<T> {
    initial: Value,
    slot: Arc<Mutex<Vec<(String, Value)>>>,
    marker: PhantomData<fn() -> T>,
}

impl<T> MultiOutput<T> {
    /// Creates a broadcast output wrapper with no initial value.
    pub fn new() -> Self {
        Self::with_initial(Value::Null)
    }

    /// Creates a broadcast output wrapper carrying an initial value, for
    /// input-output parameters.
    pub fn with_initial(value: impl Into<Value>) -> Self {
        Self {
            initial: value.into(),
            slot: Arc::new(Mutex::new(Vec::new())),
            marker: PhantomData,
        }
    }

    /// Returns the raw `(endpoint id, value)` pairs recorded so far.
    pub fn raw(&self) -> Vec<(String, Value)> {
        self.slot.lock().expect("output slot poisoned").clone()
    }

    pub(crate) fn slot(&self) -> Arc<Mutex<Vec<(String, Value)>>> {
        Arc::clone(&self.slot)
    }
}

impl<T> MultiOutput<T>
where
    T: TryFrom<Value, Error = CoercionError>,
{
    /// Returns the typed per-endpoint values. `None` marks an endpoint that
    /// wrote `NULL`.
    ///
    /// # Errors
    ///
    /// Returns [`CoercionError::Conversion`] if any written value cannot be
    /// converted to `T`.
    pub fn values(&self) -> Result<Vec<(String, Option<T>)>, CoercionError> {
        self.raw()
            .into_iter()
            .map(|(endpoint, value)| {
                let typed = match value {
                    Value::Null => None,
                    other => Some(T::try_from(other)?),
                };
                Ok((endpoint, typed))
            })
            .collect()
    }
}

impl<T> Default for MultiOutput<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MultiOutput<T> {
    fn clone(&self) -> Self {
        Self {
            initial: self.initial.clone(),
            slot: Arc::clone(&self.slot),
            marker: PhantomData,
        }
    }
}

impl<T> IntoArg for &MultiOutput<T> {
    fn into_arg(self) -> Arg {
        Arg {
            value: self.initial.clone(),
            sink: Some(Sink::Multi(self.slot())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_output_round_trip() {
        let out = Output::<i64>::new();
        assert_eq!(out.get().unwrap(), None);

        let arg = (&out).into_arg();
        let sink = arg.sink.expect("output arg carries a sink");
        sink.record("primary", Value::Int(42));

        assert_eq!(out.get().unwrap(), Some(42));
    }

    #[test]
    fn null_reads_as_none() {
        let out = Output::<i64>::new();
        let arg = (&out).into_arg();
        arg.sink.unwrap().record("primary", Value::Null);
        assert_eq!(out.get().unwrap(), None);
        assert_eq!(out.raw(), Some(Value::Null));
    }

    #[test]
    fn typed_read_rejects_wrong_class() {
        let out = Output::<i64>::new();
        let arg = (&out).into_arg();
        arg.sink.unwrap().record("primary", Value::Text("x".to_owned()));
        assert!(matches!(out.get(), Err(CoercionError::Conversion { .. })));
    }

    #[test]
    fn initial_value_travels_with_the_arg() {
        let out = Output::<i64>::with_initial(10);
        let arg = (&out).into_arg();
        assert_eq!(arg.value, Value::Int(10));
    }

    #[test]
    fn multi_output_collects_per_endpoint() {
        let out = MultiOutput::<i64>::new();
        let arg = (&out).into_arg();
        let sink = arg.sink.unwrap();
        sink.record("a", Value::Int(1));
        sink.record("b", Value::Null);

        let values = out.values().unwrap();
        assert_eq!(values, vec![("a".to_owned(), Some(1)), ("b".to_owned(), None)]);
    }
}
