//! Blocking facade over the async API.
//!
//! Owns a multi-thread Tokio runtime and delegates every operation to the
//! async [`Program`](crate::program::Program) with `block_on`. Intended for
//! callers without a runtime of their own; must not be used from inside an
//! async context.

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Runtime;

use crate::config::Config;
use crate::connection::Endpoint;
use crate::driver::{Driver, RecordSet};
use crate::params::{IntoParams, ParamSet};
use crate::program::{self, ProgramBuilder, ProgramError};
use crate::value::{CoercionError, Value};

/// Errors starting the blocking facade.
#[derive(Debug, Error)]
pub enum BlockingError {
    #[error("failed to start runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error(transparent)]
    Program(#[from] ProgramError),
}

/// A blocking program handle.
#[derive(Clone)]
pub struct Program {
    inner: program::Program,
    runtime: Arc<Runtime>,
}

impl Program {
    /// Finishes a builder against `driver`, blocking until the endpoint set
    /// is open.
    ///
    /// # Errors
    ///
    /// [`BlockingError::Runtime`] if the runtime cannot start, otherwise
    /// any construction error from the async path.
    pub fn connect(
        builder: ProgramBuilder,
        driver: &dyn Driver,
        endpoints: Vec<Endpoint>,
    ) -> Result<Self, BlockingError> {
        let runtime = Arc::new(Runtime::new()?);
        let inner = runtime.block_on(builder.connect(driver, endpoints))?;
        Ok(Self { inner, runtime })
    }

    /// Blocking counterpart of
    /// [`Program::from_config`](crate::program::Program::from_config).
    pub fn from_config(
        driver: &dyn Driver,
        config: &Config,
        database: &str,
        program: &str,
        defs: ParamSet,
    ) -> Result<Self, BlockingError> {
        let runtime = Arc::new(Runtime::new()?);
        let inner = runtime.block_on(program::Program::from_config(
            driver, config, database, program, defs,
        ))?;
        Ok(Self { inner, runtime })
    }

    /// The wrapped async program.
    pub fn inner(&self) -> &program::Program {
        &self.inner
    }

    /// Blocking counterpart of
    /// [`Program::execute_scalar`](crate::program::Program::execute_scalar).
    pub fn execute_scalar<T>(&self, params: impl IntoParams) -> Result<Option<T>, ProgramError>
    where
        T: TryFrom<Value, Error = CoercionError>,
    {
        self.runtime.block_on(self.inner.execute_scalar(params))
    }

    /// Blocking counterpart of
    /// [`Program::execute_non_query`](crate::program::Program::execute_non_query).
    pub fn execute_non_query(&self, params: impl IntoParams) -> Result<u64, ProgramError> {
        self.runtime.block_on(self.inner.execute_non_query(params))
    }

    /// Blocking counterpart of
    /// [`Program::execute_reader`](crate::program::Program::execute_reader).
    pub fn execute_reader(&self, params: impl IntoParams) -> Result<RecordSet, ProgramError> {
        self.runtime.block_on(self.inner.execute_reader(params))
    }

    /// Blocking counterpart of
    /// [`Program::execute_xml`](crate::program::Program::execute_xml).
    pub fn execute_xml(&self, params: impl IntoParams) -> Result<String, ProgramError> {
        self.runtime.block_on(self.inner.execute_xml(params))
    }

    /// Blocking counterpart of
    /// [`Program::execute_scalar_all`](crate::program::Program::execute_scalar_all).
    pub fn execute_scalar_all<T>(
        &self,
        params: impl IntoParams,
    ) -> Result<Vec<Option<T>>, ProgramError>
    where
        T: TryFrom<Value, Error = CoercionError>,
    {
        self.runtime.block_on(self.inner.execute_scalar_all(params))
    }

    /// Blocking counterpart of
    /// [`Program::execute_non_query_all`](crate::program::Program::execute_non_query_all).
    pub fn execute_non_query_all(&self, params: impl IntoParams) -> Result<Vec<u64>, ProgramError> {
        self.runtime
            .block_on(self.inner.execute_non_query_all(params))
    }

    /// Blocking counterpart of
    /// [`Program::execute_reader_all`](crate::program::Program::execute_reader_all).
    pub fn execute_reader_all(
        &self,
        params: impl IntoParams,
    ) -> Result<Vec<RecordSet>, ProgramError> {
        self.runtime.block_on(self.inner.execute_reader_all(params))
    }

    /// Blocking counterpart of
    /// [`Program::execute_xml_all`](crate::program::Program::execute_xml_all).
    pub fn execute_xml_all(&self, params: impl IntoParams) -> Result<Vec<String>, ProgramError> {
        self.runtime.block_on(self.inner.execute_xml_all(params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::ProcOutcome;
    use crate::driver::memory::MemoryDriver;
    use crate::value::SqlType;

    #[test]
    fn blocking_round_trip() {
        let driver = MemoryDriver::new();
        driver.register("usp_add", |params| {
            let a = i64::try_from(params[0].value().clone()).unwrap_or(0);
            let b = i64::try_from(params[1].value().clone()).unwrap_or(0);
            Ok(ProcOutcome::scalar(a + b))
        });

        let program = Program::connect(
            program::Program::builder("add")
                .procedure("usp_add")
                .param("a", SqlType::BigInt)
                .param("b", SqlType::BigInt),
            &driver,
            vec![Endpoint::new("primary", "mem://primary")],
        )
        .unwrap();

        assert_eq!(program.execute_scalar::<i64>((2, 3)).unwrap(), Some(5));
    }

    #[test]
    fn blocking_broadcast() {
        let driver = MemoryDriver::new();
        driver.register("usp_ping", |_| Ok(ProcOutcome::affected(1)));

        let program = Program::connect(
            program::Program::builder("ping").procedure("usp_ping"),
            &driver,
            vec![
                Endpoint::new("a", "mem://a"),
                Endpoint::new("b", "mem://b"),
            ],
        )
        .unwrap();

        assert_eq!(program.execute_non_query_all(()).unwrap(), [1, 1]);
    }
}
