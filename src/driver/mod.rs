//! The driver seam — the external collaborator boundary.
//!
//! Everything above this module is parameter marshalling and configuration;
//! everything below it (wire protocol, pooling internals, transactions) is
//! the driver's business. A driver implements [`Driver`] to open connections
//! and [`DriverConn`] to execute one resolved procedure call.
//!
//! The crate ships one implementation, the in-process loopback driver in
//! [`memory`], used by tests and demos.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::params::BoundParam;
use crate::value::{CoercionError, Value};

pub mod memory;

/// Errors reported by a driver.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DriverError {
    #[error("failed to connect to {dsn}: {message}")]
    Connect { dsn: String, message: String },

    #[error("procedure {procedure} not found")]
    ProcedureNotFound { procedure: String },

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("call did not complete within {0:?}")]
    Timeout(Duration),
}

/// Opens connections for a given data source name.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Opens one physical connection.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::Connect`] if the data source cannot be
    /// reached.
    async fn connect(&self, dsn: &str) -> Result<Box<dyn DriverConn>, DriverError>;
}

/// One open physical connection.
#[async_trait]
pub trait DriverConn: Send + Sync {
    /// The data source name this connection was opened against.
    fn dsn(&self) -> &str;

    /// Executes one resolved procedure call.
    async fn call(&self, call: ProcCall) -> Result<ProcOutcome, DriverError>;
}

/// One resolved invocation as handed to a driver: the physical procedure
/// name and the ordered, conformed parameter collection.
#[derive(Debug, Clone)]
pub struct ProcCall {
    pub procedure: String,
    pub params: Vec<BoundParam>,
    /// Advisory timeout for drivers that support server-side enforcement;
    /// the invocation layer also enforces it client-side.
    pub timeout: Option<Duration>,
}

/// Everything a procedure call produced: zero or more record sets, a
/// rows-affected count, and values written to output parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcOutcome {
    pub records: Vec<RecordSet>,
    pub rows_affected: u64,
    pub outputs: Vec<(String, Value)>,
}

impl ProcOutcome {
    /// An outcome with no record sets and no rows affected.
    pub fn empty() -> Self {
        Self::default()
    }

    /// An outcome carrying only a rows-affected count.
    pub fn affected(rows: u64) -> Self {
        Self {
            rows_affected: rows,
            ..Self::default()
        }
    }

    /// An outcome whose single record set holds one value — the scalar
    /// result convention.
    pub fn scalar(value: impl Into<Value>) -> Self {
        let value: Value = value.into();
        Self::empty().record(RecordSet::new(["value"]).row([value]))
    }

    /// Appends a record set.
    #[must_use]
    pub fn record(mut self, records: RecordSet) -> Self {
        self.records.push(records);
        self
    }

    /// Appends an output-parameter value. Names are matched against bound
    /// output parameters case-insensitively when results are applied.
    #[must_use]
    pub fn output(mut self, name: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.outputs
            .push((crate::params::canonical(name.as_ref()), value.into()));
        self
    }
}

/// A tabular result: named columns and zero or more rows.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    columns: Arc<Vec<String>>,
    rows: Vec<Row>,
}

impl RecordSet {
    /// Creates an empty record set with the given column names.
    pub fn new<I>(columns: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            columns: Arc::new(columns.into_iter().map(Into::into).collect()),
            rows: Vec::new(),
        }
    }

    /// Appends a row. Values are taken in column order.
    #[must_use]
    pub fn row<I>(mut self, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        self.rows.push(Row {
            columns: Arc::clone(&self.columns),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Column names in declaration order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The rows of this record set.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns `true` if the record set has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates the rows.
    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }
}

/// Errors produced by typed row access.
#[derive(Debug, Error, PartialEq)]
pub enum RowError {
    #[error("column index {index} out of bounds for a {width}-column row")]
    OutOfBounds { index: usize, width: usize },

    #[error("unknown column {name}")]
    UnknownColumn { name: String },

    #[error(transparent)]
    Conversion(#[from] CoercionError),
}

/// One row of a [`RecordSet`].
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl Row {
    /// Returns the raw value at `index`, if in bounds.
    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Returns the value at `index` converted to `T`.
    ///
    /// # Errors
    ///
    /// [`RowError::OutOfBounds`] for a bad index, [`RowError::Conversion`]
    /// for an incompatible value.
    pub fn get<T>(&self, index: usize) -> Result<T, RowError>
    where
        T: TryFrom<Value, Error = CoercionError>,
    {
        let value = self.values.get(index).ok_or(RowError::OutOfBounds {
            index,
            width: self.values.len(),
        })?;
        Ok(T::try_from(value.clone())?)
    }

    /// Returns the value in the named column (case-insensitive) converted
    /// to `T`.
    ///
    /// # Errors
    ///
    /// [`RowError::UnknownColumn`] for an unknown name, otherwise as
    /// [`Row::get`].
    pub fn get_named<T>(&self, column: &str) -> Result<T, RowError>
    where
        T: TryFrom<Value, Error = CoercionError>,
    {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .ok_or_else(|| RowError::UnknownColumn {
                name: column.to_owned(),
            })?;
        self.get(index)
    }

    /// Number of values in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the row has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for value in &self.values {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_set_builder() {
        let rs = RecordSet::new(["id", "name"])
            .row([Value::Int(1), Value::Text("alice".to_owned())])
            .row([Value::Int(2), Value::Text("bob".to_owned())]);
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.columns(), ["id", "name"]);
    }

    #[test]
    fn typed_row_access() {
        let rs = RecordSet::new(["id", "name"]).row([Value::Int(1), Value::Text("alice".into())]);
        let row = &rs.rows()[0];
        assert_eq!(row.get::<i64>(0).unwrap(), 1);
        assert_eq!(row.get_named::<String>("NAME").unwrap(), "alice");
        assert!(matches!(
            row.get::<i64>(5),
            Err(RowError::OutOfBounds { index: 5, width: 2 })
        ));
        assert!(matches!(
            row.get_named::<i64>("missing"),
            Err(RowError::UnknownColumn { .. })
        ));
        assert!(matches!(row.get::<i64>(1), Err(RowError::Conversion(_))));
    }

    #[test]
    fn scalar_outcome_shape() {
        let outcome = ProcOutcome::scalar(42);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].rows()[0].value(0), Some(&Value::Int(42)));
    }

    #[test]
    fn output_names_are_canonicalized() {
        let outcome = ProcOutcome::empty().output("total", 9);
        assert_eq!(outcome.outputs, vec![("@total".to_owned(), Value::Int(9))]);
    }
}
