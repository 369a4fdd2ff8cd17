//! In-process loopback driver.
//!
//! Procedures are registered as closures keyed by physical procedure name;
//! connecting is instantaneous and every call is recorded so tests can
//! assert on contact counts and bound-parameter shapes.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Driver, DriverConn, DriverError, ProcCall, ProcOutcome};
use crate::params::BoundParam;

/// A registered procedure body.
pub type ProcHandler =
    Arc<dyn Fn(&[BoundParam]) -> Result<ProcOutcome, DriverError> + Send + Sync>;

/// One call as observed by the driver.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub dsn: String,
    pub procedure: String,
    pub params: Vec<BoundParam>,
}

/// The loopback driver. Cloning shares the procedure registry and the call
/// log.
///
/// # Examples
///
/// ```
/// use sqlprog::driver::memory::MemoryDriver;
/// use sqlprog::driver::ProcOutcome;
///
/// let driver = MemoryDriver::new();
/// driver.register("usp_count_users", |_params| Ok(ProcOutcome::scalar(3)));
/// ```
#[derive(Clone, Default)]
pub struct MemoryDriver {
    procedures: Arc<Mutex<HashMap<String, ProcHandler>>>,
    calls: Arc<Mutex<Vec<CallRecord>>>,
}

impl MemoryDriver {
    /// Creates a driver with no registered procedures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a procedure under the given physical name.
    pub fn register<F>(&self, procedure: impl Into<String>, handler: F)
    where
        F: Fn(&[BoundParam]) -> Result<ProcOutcome, DriverError> + Send + Sync + 'static,
    {
        self.procedures
            .lock()
            .expect("procedure registry poisoned")
            .insert(procedure.into(), Arc::new(handler));
    }

    /// Returns every call observed so far, in arrival order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().expect("call log poisoned").clone()
    }

    /// Number of calls observed so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("call log poisoned").len()
    }
}

impl fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDriver").finish()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&self, dsn: &str) -> Result<Box<dyn DriverConn>, DriverError> {
        if dsn.is_empty() {
            return Err(DriverError::Connect {
                dsn: dsn.to_owned(),
                message: "empty data source name".to_owned(),
            });
        }
        Ok(Box::new(MemoryConn {
            dsn: dsn.to_owned(),
            driver: self.clone(),
        }))
    }
}

struct MemoryConn {
    dsn: String,
    driver: MemoryDriver,
}

#[async_trait]
impl DriverConn for MemoryConn {
    fn dsn(&self) -> &str {
        &self.dsn
    }

    async fn call(&self, call: ProcCall) -> Result<ProcOutcome, DriverError> {
        self.driver
            .calls
            .lock()
            .expect("call log poisoned")
            .push(CallRecord {
                dsn: self.dsn.clone(),
                procedure: call.procedure.clone(),
                params: call.params.clone(),
            });

        // Clone the handler out so the registry lock is not held while the
        // procedure body runs.
        let handler = self
            .driver
            .procedures
            .lock()
            .expect("procedure registry poisoned")
            .get(&call.procedure)
            .cloned();

        match handler {
            Some(handler) => handler(&call.params),
            None => Err(DriverError::ProcedureNotFound {
                procedure: call.procedure,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn call(procedure: &str) -> ProcCall {
        ProcCall {
            procedure: procedure.to_owned(),
            params: Vec::new(),
            timeout: None,
        }
    }

    #[tokio::test]
    async fn registered_procedure_runs() {
        let driver = MemoryDriver::new();
        driver.register("usp_ping", |_| Ok(ProcOutcome::scalar(1)));

        let conn = driver.connect("mem://a").await.unwrap();
        let outcome = conn.call(call("usp_ping")).await.unwrap();
        assert_eq!(outcome.records[0].rows()[0].value(0), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn unknown_procedure_is_reported() {
        let driver = MemoryDriver::new();
        let conn = driver.connect("mem://a").await.unwrap();
        let err = conn.call(call("usp_missing")).await.unwrap_err();
        assert_eq!(
            err,
            DriverError::ProcedureNotFound {
                procedure: "usp_missing".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn calls_are_recorded_per_dsn() {
        let driver = MemoryDriver::new();
        driver.register("usp_ping", |_| Ok(ProcOutcome::empty()));

        let a = driver.connect("mem://a").await.unwrap();
        let b = driver.connect("mem://b").await.unwrap();
        a.call(call("usp_ping")).await.unwrap();
        b.call(call("usp_ping")).await.unwrap();

        let calls = driver.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].dsn, "mem://a");
        assert_eq!(calls[1].dsn, "mem://b");
    }

    #[tokio::test]
    async fn empty_dsn_is_rejected() {
        let driver = MemoryDriver::new();
        assert!(matches!(
            driver.connect("").await,
            Err(DriverError::Connect { .. })
        ));
    }
}
