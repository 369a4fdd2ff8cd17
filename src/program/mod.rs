//! Typed program handles.
//!
//! A [`Program`] is a named, parameter-typed handle for one stored procedure
//! or function, carrying the declared parameter set, the load-balanced
//! connection set it executes against, and its execution options. Handles
//! are built directly with [`ProgramBuilder`] or resolved through the
//! configuration store with [`Program::from_config`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::{Config, ConfigError};
use crate::connection::{ConnectionError, Endpoint, LoadBalancedSet};
use crate::driver::{Driver, DriverError, RecordSet};
use crate::params::{BindError, IntoParams, ParamDef, ParamSet, Validation};
use crate::value::{CoercionError, ConstraintMode, SqlType, Value};

pub mod command;

pub use command::Command;

/// Errors surfaced by program construction and execution.
#[derive(Debug, Error)]
pub enum ProgramError {
    #[error(transparent)]
    Bind(#[from] BindError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Conversion(#[from] CoercionError),
}

/// A typed handle for one stored procedure or function.
///
/// # Examples
///
/// ```no_run
/// use sqlprog::connection::Endpoint;
/// use sqlprog::driver::memory::MemoryDriver;
/// use sqlprog::program::Program;
/// use sqlprog::value::SqlType;
///
/// # async fn run() -> Result<(), sqlprog::program::ProgramError> {
/// let driver = MemoryDriver::new();
/// let program = Program::builder("get_user")
///     .procedure("usp_get_user_v4")
///     .param("user_id", SqlType::Int)
///     .connect(&driver, vec![Endpoint::new("primary", "mem://primary")])
///     .await?;
///
/// let user = program.execute_reader((7,)).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Program {
    name: String,
    procedure: String,
    defs: ParamSet,
    set: Arc<LoadBalancedSet>,
    timeout: Option<Duration>,
    constraint_mode: ConstraintMode,
    validation: Validation,
}

impl Program {
    /// Starts building a program with the given logical name. The physical
    /// procedure name defaults to the logical name.
    pub fn builder(name: impl Into<String>) -> ProgramBuilder {
        ProgramBuilder::new(name)
    }

    /// Builds a program through the configuration store: resolves the
    /// logical name, applies the parameter-name map to `defs`, and opens
    /// the resolved endpoint set.
    ///
    /// # Errors
    ///
    /// Configuration resolution errors ([`ConfigError`]), declaration
    /// errors ([`BindError`]), and connection failures
    /// ([`ConnectionError`]).
    pub async fn from_config(
        driver: &dyn Driver,
        config: &Config,
        database: &str,
        program: &str,
        defs: ParamSet,
    ) -> Result<Self, ProgramError> {
        let resolved = config.resolve(database, program)?;
        let defs = resolved.remap(&defs)?;
        let set = LoadBalancedSet::connect(driver, resolved.endpoints).await?;
        debug!(
            program,
            procedure = %resolved.procedure,
            connections = set.len(),
            "program resolved from configuration"
        );
        Ok(Self {
            name: program.to_owned(),
            procedure: resolved.procedure,
            defs,
            set: Arc::new(set),
            timeout: resolved.timeout,
            constraint_mode: resolved.constraint_mode,
            validation: resolved.validation,
        })
    }

    /// The logical program name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The physical procedure name executions are dispatched to.
    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    /// The declared parameters (after any configuration remapping).
    pub fn params(&self) -> &ParamSet {
        &self.defs
    }

    /// Number of connections in the load-balanced set.
    pub fn connections(&self) -> usize {
        self.set.len()
    }

    /// Binds `params` and returns a reusable [`Command`].
    ///
    /// # Errors
    ///
    /// Any [`BindError`] from pairing the supplied parameters with the
    /// declarations.
    pub fn prepare(&self, params: impl IntoParams) -> Result<Command, ProgramError> {
        let bound = self
            .defs
            .bind(params.into_params(), self.constraint_mode, self.validation)?;
        Ok(Command::new(self, bound))
    }

    /// Executes and returns the first column of the first row, or `None`
    /// on an empty result.
    pub async fn execute_scalar<T>(&self, params: impl IntoParams) -> Result<Option<T>, ProgramError>
    where
        T: TryFrom<Value, Error = CoercionError>,
    {
        self.prepare(params)?.scalar().await
    }

    /// Executes and returns the number of rows affected.
    pub async fn execute_non_query(&self, params: impl IntoParams) -> Result<u64, ProgramError> {
        self.prepare(params)?.non_query().await
    }

    /// Executes and returns the first record set.
    pub async fn execute_reader(&self, params: impl IntoParams) -> Result<RecordSet, ProgramError> {
        self.prepare(params)?.reader().await
    }

    /// Executes and assembles the row-chunked XML stream into one document.
    pub async fn execute_xml(&self, params: impl IntoParams) -> Result<String, ProgramError> {
        self.prepare(params)?.xml().await
    }

    /// Broadcast form of [`execute_scalar`](Self::execute_scalar): one
    /// result per connection, in endpoint order.
    pub async fn execute_scalar_all<T>(
        &self,
        params: impl IntoParams,
    ) -> Result<Vec<Option<T>>, ProgramError>
    where
        T: TryFrom<Value, Error = CoercionError>,
    {
        self.prepare(params)?.scalar_all().await
    }

    /// Broadcast form of [`execute_non_query`](Self::execute_non_query).
    pub async fn execute_non_query_all(
        &self,
        params: impl IntoParams,
    ) -> Result<Vec<u64>, ProgramError> {
        self.prepare(params)?.non_query_all().await
    }

    /// Broadcast form of [`execute_reader`](Self::execute_reader).
    pub async fn execute_reader_all(
        &self,
        params: impl IntoParams,
    ) -> Result<Vec<RecordSet>, ProgramError> {
        self.prepare(params)?.reader_all().await
    }

    /// Broadcast form of [`execute_xml`](Self::execute_xml).
    pub async fn execute_xml_all(
        &self,
        params: impl IntoParams,
    ) -> Result<Vec<String>, ProgramError> {
        self.prepare(params)?.xml_all().await
    }

    pub(crate) fn balanced_set(&self) -> &Arc<LoadBalancedSet> {
        &self.set
    }

    pub(crate) fn defs(&self) -> &ParamSet {
        &self.defs
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn constraint_mode(&self) -> ConstraintMode {
        self.constraint_mode
    }
}

/// Fluent construction of a [`Program`].
pub struct ProgramBuilder {
    name: String,
    procedure: Option<String>,
    defs: Vec<ParamDef>,
    timeout: Option<Duration>,
    constraint_mode: ConstraintMode,
    validation: Validation,
}

impl ProgramBuilder {
    /// Starts a builder for the given logical name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            procedure: None,
            defs: Vec::new(),
            timeout: None,
            constraint_mode: ConstraintMode::default(),
            validation: Validation::default(),
        }
    }

    /// Sets the physical procedure name (defaults to the logical name).
    #[must_use]
    pub fn procedure(mut self, procedure: impl Into<String>) -> Self {
        self.procedure = Some(procedure.into());
        self
    }

    /// Declares an input parameter.
    #[must_use]
    pub fn param(mut self, name: impl AsRef<str>, sql_type: SqlType) -> Self {
        self.defs.push(ParamDef::new(name, sql_type));
        self
    }

    /// Declares an output parameter.
    #[must_use]
    pub fn output_param(mut self, name: impl AsRef<str>, sql_type: SqlType) -> Self {
        self.defs.push(ParamDef::output(name, sql_type));
        self
    }

    /// Declares an input-output parameter.
    #[must_use]
    pub fn input_output_param(mut self, name: impl AsRef<str>, sql_type: SqlType) -> Self {
        self.defs.push(ParamDef::input_output(name, sql_type));
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the constraint mode applied when binding values.
    #[must_use]
    pub fn constraint_mode(mut self, mode: ConstraintMode) -> Self {
        self.constraint_mode = mode;
        self
    }

    /// Sets the named-binding validation strictness.
    #[must_use]
    pub fn validation(mut self, validation: Validation) -> Self {
        self.validation = validation;
        self
    }

    /// Opens the endpoint set and finishes the program.
    ///
    /// # Errors
    ///
    /// [`BindError::DuplicateParameter`] for a repeated declaration,
    /// [`ConnectionError`] for connection failures.
    pub async fn connect(
        self,
        driver: &dyn Driver,
        endpoints: Vec<Endpoint>,
    ) -> Result<Program, ProgramError> {
        let mut defs = ParamSet::new();
        for def in self.defs {
            defs.push(def)?;
        }
        let set = LoadBalancedSet::connect(driver, endpoints).await?;
        Ok(Program {
            procedure: self.procedure.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            defs,
            set: Arc::new(set),
            timeout: self.timeout,
            constraint_mode: self.constraint_mode,
            validation: self.validation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::MemoryDriver;
    use crate::driver::{DriverConn, ProcCall, ProcOutcome};
    use crate::params::{MultiOutput, NamedParams, Output};
    use async_trait::async_trait;

    fn endpoints(n: usize) -> Vec<Endpoint> {
        (0..n)
            .map(|i| Endpoint::new(format!("ep{i}"), format!("mem://ep{i}")))
            .collect()
    }

    async fn user_program(driver: &MemoryDriver, connections: usize) -> Program {
        Program::builder("get_user")
            .procedure("usp_get_user")
            .param("user_id", SqlType::Int)
            .connect(driver, endpoints(connections))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn scalar_execution() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user", |params| {
            let id = i64::try_from(params[0].value().clone()).map_err(|e| {
                crate::driver::DriverError::Execution(e.to_string())
            })?;
            Ok(ProcOutcome::scalar(id * 10))
        });

        let program = user_program(&driver, 1).await;
        let result: Option<i64> = program.execute_scalar((7,)).await.unwrap();
        assert_eq!(result, Some(70));
    }

    #[tokio::test]
    async fn scalar_on_empty_result_is_none() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user", |_| Ok(ProcOutcome::empty()));
        let program = user_program(&driver, 1).await;
        let result: Option<i64> = program.execute_scalar((7,)).await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn non_query_reports_rows_affected() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user", |_| Ok(ProcOutcome::affected(3)));
        let program = user_program(&driver, 1).await;
        assert_eq!(program.execute_non_query((1,)).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reader_returns_first_record_set() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user", |_| {
            Ok(ProcOutcome::empty()
                .record(RecordSet::new(["id", "name"]).row([Value::Int(7), "alice".into()])))
        });
        let program = user_program(&driver, 1).await;
        let records = program.execute_reader((7,)).await.unwrap();
        assert_eq!(records.rows()[0].get_named::<String>("name").unwrap(), "alice");
    }

    #[tokio::test]
    async fn xml_concatenates_chunks() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user", |_| {
            Ok(ProcOutcome::empty().record(
                RecordSet::new(["chunk"])
                    .row(["<user>"])
                    .row(["<id>7</id>"])
                    .row(["</user>"]),
            ))
        });
        let program = user_program(&driver, 1).await;
        let doc = program.execute_xml((7,)).await.unwrap();
        assert_eq!(doc, "<user><id>7</id></user>");
    }

    #[tokio::test]
    async fn malformed_xml_stream_is_rejected() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user", |_| {
            Ok(ProcOutcome::empty().record(RecordSet::new(["chunk"]).row(["<user>"])))
        });
        let program = user_program(&driver, 1).await;
        assert!(matches!(
            program.execute_xml((7,)).await,
            Err(ProgramError::Conversion(CoercionError::MalformedXml(_)))
        ));
    }

    #[tokio::test]
    async fn single_executions_round_robin_across_the_set() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user", |_| Ok(ProcOutcome::affected(1)));
        let program = user_program(&driver, 2).await;

        for _ in 0..4 {
            program.execute_non_query((1,)).await.unwrap();
        }
        let dsns: Vec<_> = driver.calls().into_iter().map(|c| c.dsn).collect();
        assert_eq!(dsns, ["mem://ep0", "mem://ep1", "mem://ep0", "mem://ep1"]);
    }

    #[tokio::test]
    async fn broadcast_hits_every_connection_in_endpoint_order() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user", |_| Ok(ProcOutcome::affected(1)));
        let program = user_program(&driver, 3).await;

        let results = program.execute_non_query_all((1,)).await.unwrap();
        assert_eq!(results, [1, 1, 1]);
        assert_eq!(driver.call_count(), 3);

        let mut dsns: Vec<_> = driver.calls().into_iter().map(|c| c.dsn).collect();
        dsns.sort();
        assert_eq!(dsns, ["mem://ep0", "mem://ep1", "mem://ep2"]);
    }

    #[tokio::test]
    async fn broadcast_scalars_come_back_in_endpoint_order() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user", |params| {
            Ok(ProcOutcome::scalar(i64::try_from(params[0].value().clone()).unwrap()))
        });
        let program = user_program(&driver, 2).await;
        let results: Vec<Option<i64>> = program.execute_scalar_all((5,)).await.unwrap();
        assert_eq!(results, [Some(5), Some(5)]);
    }

    #[tokio::test]
    async fn single_output_wrapper_fails_broadcast_before_contact() {
        let driver = MemoryDriver::new();
        driver.register("usp_total", |_| Ok(ProcOutcome::empty()));

        let program = Program::builder("total")
            .procedure("usp_total")
            .output_param("total", SqlType::BigInt)
            .connect(&driver, endpoints(2))
            .await
            .unwrap();

        let out = Output::<i64>::new();
        let err = program.execute_non_query_all((&out,)).await.unwrap_err();
        assert!(matches!(
            err,
            ProgramError::Bind(BindError::OutputInBroadcast { .. })
        ));
        assert_eq!(driver.call_count(), 0);
    }

    #[tokio::test]
    async fn binding_failures_surface_before_contact() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user", |_| Ok(ProcOutcome::empty()));
        let program = user_program(&driver, 1).await;

        let err = program
            .execute_non_query(NamedParams::new().with("nope", 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProgramError::Bind(BindError::UnknownParameter { .. })
        ));
        assert_eq!(driver.call_count(), 0);
    }

    #[tokio::test]
    async fn output_parameter_lands_in_the_wrapper() {
        let driver = MemoryDriver::new();
        driver.register("usp_count", |_| Ok(ProcOutcome::affected(0).output("total", 42)));

        let program = Program::builder("count")
            .procedure("usp_count")
            .output_param("total", SqlType::BigInt)
            .connect(&driver, endpoints(1))
            .await
            .unwrap();

        let out = Output::<i64>::new();
        program.execute_non_query((&out,)).await.unwrap();
        assert_eq!(out.get().unwrap(), Some(42));
    }

    #[tokio::test]
    async fn multi_output_collects_every_endpoint() {
        let driver = MemoryDriver::new();
        driver.register("usp_count", |_| Ok(ProcOutcome::affected(0).output("total", 7)));

        let program = Program::builder("count")
            .procedure("usp_count")
            .output_param("total", SqlType::BigInt)
            .connect(&driver, endpoints(2))
            .await
            .unwrap();

        let out = MultiOutput::<i64>::new();
        program.execute_non_query_all((&out,)).await.unwrap();

        let values = out.values().unwrap();
        assert_eq!(
            values,
            vec![("ep0".to_owned(), Some(7)), ("ep1".to_owned(), Some(7))]
        );
    }

    #[tokio::test]
    async fn duplicate_declaration_is_rejected_at_build() {
        let driver = MemoryDriver::new();
        let result = Program::builder("p")
            .param("a", SqlType::Int)
            .param("@A", SqlType::Int)
            .connect(&driver, endpoints(1))
            .await;
        assert!(matches!(
            result,
            Err(ProgramError::Bind(BindError::DuplicateParameter { .. }))
        ));
    }

    #[tokio::test]
    async fn from_config_remaps_names_before_dispatch() {
        let driver = MemoryDriver::new();
        driver.register("usp_get_user_v4", |params| {
            assert_eq!(params[0].name(), "@user_id");
            Ok(ProcOutcome::scalar(1))
        });

        let config = Config::from_json(
            r#"{
                "databases": {
                    "app": {
                        "connections": [{ "id": "primary", "dsn": "mem://primary" }],
                        "programs": {
                            "get_user": {
                                "maps_to": "usp_get_user_v4",
                                "parameters": { "id": "@user_id" }
                            }
                        }
                    }
                }
            }"#,
        )
        .unwrap();

        let mut defs = ParamSet::new();
        defs.push(ParamDef::new("id", SqlType::Int)).unwrap();

        let program = Program::from_config(&driver, &config, "app", "get_user", defs)
            .await
            .unwrap();
        assert_eq!(program.procedure(), "usp_get_user_v4");

        // Named binding works against the logical-turned-physical name.
        let result: Option<i64> = program
            .execute_scalar(NamedParams::new().with("user_id", 9))
            .await
            .unwrap();
        assert_eq!(result, Some(1));
        assert_eq!(driver.calls()[0].procedure, "usp_get_user_v4");
    }

    #[tokio::test]
    async fn unknown_database_fails_construction() {
        let driver = MemoryDriver::new();
        let config = Config::from_json(r#"{ "databases": {} }"#).unwrap();
        let result =
            Program::from_config(&driver, &config, "nope", "p", ParamSet::new()).await;
        assert!(matches!(
            result,
            Err(ProgramError::Config(ConfigError::UnknownDatabase(_)))
        ));
    }

    // A driver whose calls never complete until the timer advances; used to
    // exercise client-side timeout enforcement under a paused clock.
    struct SlowDriver;

    struct SlowConn {
        dsn: String,
    }

    #[async_trait]
    impl Driver for SlowDriver {
        async fn connect(&self, dsn: &str) -> Result<Box<dyn DriverConn>, DriverError> {
            Ok(Box::new(SlowConn {
                dsn: dsn.to_owned(),
            }))
        }
    }

    #[async_trait]
    impl DriverConn for SlowConn {
        fn dsn(&self) -> &str {
            &self.dsn
        }

        async fn call(&self, _call: ProcCall) -> Result<ProcOutcome, DriverError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(ProcOutcome::empty())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_enforced_client_side() {
        let program = Program::builder("slow")
            .timeout(Duration::from_millis(50))
            .connect(&SlowDriver, endpoints(1))
            .await
            .unwrap();

        let err = program.execute_non_query(()).await.unwrap_err();
        assert!(matches!(
            err,
            ProgramError::Driver(DriverError::Timeout(_))
        ));
    }
}
