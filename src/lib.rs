//! # sqlprog
//!
//! A typed, configuration-driven stored-procedure invocation layer over
//! pluggable SQL drivers.
//!
//! A [`Program`] is a named, parameter-typed handle for one stored procedure
//! or function. Parameters bind positionally (tuples of 1 through 19
//! elements) or by name, pass through the declared type's constraint policy,
//! and the call executes against a single connection or broadcasts across a
//! load-balanced set.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sqlprog::connection::Endpoint;
//! use sqlprog::driver::memory::MemoryDriver;
//! use sqlprog::driver::ProcOutcome;
//! use sqlprog::program::Program;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let driver = MemoryDriver::new();
//!     driver.register("usp_count_users", |_| Ok(ProcOutcome::scalar(3)));
//!
//!     let program = Program::builder("count_users")
//!         .procedure("usp_count_users")
//!         .connect(&driver, vec![Endpoint::new("primary", "mem://primary")])
//!         .await?;
//!
//!     let count: Option<i64> = program.execute_scalar(()).await?;
//!     println!("{count:?}");
//!     Ok(())
//! }
//! ```

// ── Core modules ──────────────────────────────────────────────────────────────
pub mod connection;
pub mod driver;
pub mod params;
pub mod program;
pub mod value;

// ── Construction and outer surfaces ───────────────────────────────────────────
pub mod blocking;
pub mod config;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{Config, ConfigError};
pub use connection::Endpoint;
pub use params::{
    IntoParams, MultiOutput, NamedParams, Output, ParamDef, ParamSet, Params, Validation,
    params_from_iter,
};
pub use program::{Command, Program, ProgramBuilder, ProgramError};
pub use value::{ConstraintMode, SqlType, Value};
