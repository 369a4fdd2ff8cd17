//! Prepared commands and the execution engine.
//!
//! A [`Command`] is one prepared invocation: the bound parameter collection
//! behind a mutex, the resolved procedure name, and the connection set to
//! run against. Clones share the parameter collection, so a command can be
//! handed across tasks and mutated through [`Command::set`] under the lock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use super::{Program, ProgramError};
use crate::connection::LoadBalancedSet;
use crate::driver::{DriverConn, DriverError, ProcCall, ProcOutcome, RecordSet};
use crate::params::{self, BindError, BoundParam, IntoArg, ParamSet};
use crate::value::{CoercionError, ConstraintMode, Value, well_formed_xml};

/// One prepared invocation of a program.
#[derive(Clone)]
pub struct Command {
    program: String,
    procedure: String,
    defs: ParamSet,
    params: Arc<Mutex<Vec<BoundParam>>>,
    set: Arc<LoadBalancedSet>,
    timeout: Option<Duration>,
    constraint_mode: ConstraintMode,
}

impl Command {
    pub(crate) fn new(program: &Program, bound: Vec<BoundParam>) -> Self {
        Self {
            program: program.name().to_owned(),
            procedure: program.procedure().to_owned(),
            defs: program.defs().clone(),
            params: Arc::new(Mutex::new(bound)),
            set: Arc::clone(program.balanced_set()),
            timeout: program.timeout(),
            constraint_mode: program.constraint_mode(),
        }
    }

    /// Rebinds one parameter by name, replacing any existing binding. The
    /// value passes through the declared type's constraint policy, and the
    /// collection keeps declaration order.
    ///
    /// # Errors
    ///
    /// [`BindError::UnknownParameter`] for an undeclared name, or any
    /// coercion/direction failure from binding the value.
    pub fn set(&self, name: &str, value: impl IntoArg) -> Result<(), BindError> {
        let bound = self
            .defs
            .bind_value(name, value.into_arg(), self.constraint_mode)?;
        let position = self.defs.position(name).unwrap_or(usize::MAX);

        let mut current = self.params.lock().expect("parameter collection poisoned");
        if let Some(existing) = current
            .iter_mut()
            .find(|p| params::names_match(p.name(), bound.name()))
        {
            *existing = bound;
        } else {
            let insert_at = current
                .iter()
                .position(|p| self.defs.position(p.name()).unwrap_or(usize::MAX) > position)
                .unwrap_or(current.len());
            current.insert(insert_at, bound);
        }
        Ok(())
    }

    /// Executes once and returns the first column of the first row, or
    /// `None` on an empty result.
    pub async fn scalar<T>(&self) -> Result<Option<T>, ProgramError>
    where
        T: TryFrom<Value, Error = CoercionError>,
    {
        scalar_from(&self.run_single().await?)
    }

    /// Executes once and returns the number of rows affected.
    pub async fn non_query(&self) -> Result<u64, ProgramError> {
        Ok(self.run_single().await?.rows_affected)
    }

    /// Executes once and returns the first record set (empty if the
    /// procedure produced none).
    pub async fn reader(&self) -> Result<RecordSet, ProgramError> {
        Ok(first_records(self.run_single().await?))
    }

    /// Executes once and assembles the row-chunked XML stream from column 0
    /// into a single document.
    pub async fn xml(&self) -> Result<String, ProgramError> {
        xml_from(&self.run_single().await?)
    }

    /// Broadcast form of [`scalar`](Self::scalar): one result per
    /// connection, in endpoint order.
    pub async fn scalar_all<T>(&self) -> Result<Vec<Option<T>>, ProgramError>
    where
        T: TryFrom<Value, Error = CoercionError>,
    {
        self.run_all().await?.iter().map(scalar_from).collect()
    }

    /// Broadcast form of [`non_query`](Self::non_query).
    pub async fn non_query_all(&self) -> Result<Vec<u64>, ProgramError> {
        Ok(self
            .run_all()
            .await?
            .into_iter()
            .map(|outcome| outcome.rows_affected)
            .collect())
    }

    /// Broadcast form of [`reader`](Self::reader).
    pub async fn reader_all(&self) -> Result<Vec<RecordSet>, ProgramError> {
        Ok(self.run_all().await?.into_iter().map(first_records).collect())
    }

    /// Broadcast form of [`xml`](Self::xml).
    pub async fn xml_all(&self) -> Result<Vec<String>, ProgramError> {
        self.run_all().await?.iter().map(xml_from).collect()
    }

    fn proc_call(&self) -> ProcCall {
        ProcCall {
            procedure: self.procedure.clone(),
            params: self
                .params
                .lock()
                .expect("parameter collection poisoned")
                .clone(),
            timeout: self.timeout,
        }
    }

    async fn run_single(&self) -> Result<ProcOutcome, ProgramError> {
        let member = self.set.pick();
        debug!(
            program = %self.program,
            procedure = %self.procedure,
            endpoint = %member.endpoint().id,
            "executing"
        );
        let outcome = call_with_timeout(Arc::clone(&member.conn), self.proc_call(), self.timeout)
            .await?;
        self.apply_outputs(&outcome, &member.endpoint().id);
        Ok(outcome)
    }

    async fn run_all(&self) -> Result<Vec<ProcOutcome>, ProgramError> {
        {
            let current = self.params.lock().expect("parameter collection poisoned");
            params::ensure_broadcast_safe(&current)?;
        }
        debug!(
            program = %self.program,
            procedure = %self.procedure,
            connections = self.set.len(),
            "broadcasting"
        );

        let mut handles = Vec::with_capacity(self.set.len());
        for member in self.set.members() {
            let conn = Arc::clone(&member.conn);
            let call = self.proc_call();
            handles.push((
                member.endpoint().id.clone(),
                tokio::spawn(call_with_timeout(conn, call, self.timeout)),
            ));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (endpoint, handle) in handles {
            let outcome = handle
                .await
                .map_err(|e| DriverError::Execution(format!("execution task failed: {e}")))??;
            self.apply_outputs(&outcome, &endpoint);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    // Routes driver-reported output values into the bound sinks.
    fn apply_outputs(&self, outcome: &ProcOutcome, endpoint: &str) {
        if outcome.outputs.is_empty() {
            return;
        }
        let current = self.params.lock().expect("parameter collection poisoned");
        for (name, value) in &outcome.outputs {
            match current
                .iter()
                .find(|p| params::names_match(p.name(), name))
            {
                Some(param) => match &param.sink {
                    Some(sink) => sink.record(endpoint, value.clone()),
                    None => debug!(parameter = %name, "output reported for a parameter without a sink"),
                },
                None => debug!(parameter = %name, "output reported for an unbound parameter"),
            }
        }
    }
}

async fn call_with_timeout(
    conn: Arc<dyn DriverConn>,
    call: ProcCall,
    timeout: Option<Duration>,
) -> Result<ProcOutcome, DriverError> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, conn.call(call)).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(limit)),
        },
        None => conn.call(call).await,
    }
}

fn first_records(outcome: ProcOutcome) -> RecordSet {
    outcome
        .records
        .into_iter()
        .next()
        .unwrap_or_else(|| RecordSet::new(Vec::<String>::new()))
}

fn scalar_from<T>(outcome: &ProcOutcome) -> Result<Option<T>, ProgramError>
where
    T: TryFrom<Value, Error = CoercionError>,
{
    let value = outcome
        .records
        .first()
        .and_then(|records| records.rows().first())
        .and_then(|row| row.value(0));
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(other) => Ok(Some(T::try_from(other.clone())?)),
    }
}

fn xml_from(outcome: &ProcOutcome) -> Result<String, ProgramError> {
    let mut doc = String::new();
    if let Some(records) = outcome.records.first() {
        for row in records.iter() {
            match row.value(0) {
                Some(Value::Text(chunk)) => doc.push_str(chunk),
                Some(other) => {
                    return Err(CoercionError::Conversion {
                        requested: "text chunk",
                        supplied: other.type_name(),
                    }
                    .into());
                }
                None => {}
            }
        }
    }
    well_formed_xml(&doc).map_err(CoercionError::MalformedXml)?;
    Ok(doc)
}
