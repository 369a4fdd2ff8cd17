//! End-to-end demo: a configured program executing against the loopback
//! driver, singly and as a broadcast.
//!
//! Run with: `cargo run --example basic`

use sqlprog::config::Config;
use sqlprog::driver::memory::MemoryDriver;
use sqlprog::driver::{ProcOutcome, RecordSet};
use sqlprog::params::{NamedParams, ParamDef, ParamSet};
use sqlprog::program::Program;
use sqlprog::value::SqlType;

const CONFIG: &str = r#"{
    "databases": {
        "app": {
            "constraint_mode": "warn",
            "connections": [
                { "id": "primary", "dsn": "mem://primary", "weight": 2 },
                { "id": "replica", "dsn": "mem://replica" }
            ],
            "programs": {
                "get_user": {
                    "maps_to": "usp_get_user_v4",
                    "parameters": { "id": "@user_id" }
                }
            }
        }
    }
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sqlprog=debug".into()),
        )
        .init();

    let driver = MemoryDriver::new();
    driver.register("usp_get_user_v4", |params| {
        let id = params[0].value().clone();
        Ok(ProcOutcome::empty()
            .record(RecordSet::new(["id", "name"]).row([id, "alice".into()])))
    });

    let config = Config::from_json(CONFIG)?;

    let mut defs = ParamSet::new();
    defs.push(ParamDef::new("id", SqlType::Int))?;

    let program = Program::from_config(&driver, &config, "app", "get_user", defs).await?;
    println!(
        "resolved {} -> {} over {} connection(s)",
        program.name(),
        program.procedure(),
        program.connections()
    );

    let user = program
        .execute_reader(NamedParams::new().with("user_id", 7))
        .await?;
    for row in user.iter() {
        println!("row: {row}");
    }

    let everywhere = program.execute_reader_all((7,)).await?;
    println!("broadcast returned {} record sets", everywhere.len());

    Ok(())
}
