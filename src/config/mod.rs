//! Hierarchical configuration store.
//!
//! A configuration document maps logical program names and logical parameter
//! names to a physical procedure name, physical parameter names, a target
//! connection set, and per-program option overrides. Resolution happens once,
//! at program-construction time; execution never consults configuration.
//!
//! ```json
//! {
//!   "databases": {
//!     "app": {
//!       "connections": [
//!         { "id": "primary", "dsn": "mem://primary", "weight": 2 }
//!       ],
//!       "programs": {
//!         "get_user": {
//!           "maps_to": "usp_get_user_v4",
//!           "connection": "primary",
//!           "timeout_ms": 5000,
//!           "constraint_mode": "warn",
//!           "parameters": { "id": "@user_id" }
//!         }
//!       }
//!     }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::connection::Endpoint;
use crate::params::{ParamSet, Validation, canonical};
use crate::value::ConstraintMode;

/// Errors loading or resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown database {0}")]
    UnknownDatabase(String),

    #[error("database {0} is disabled")]
    DatabaseDisabled(String),

    #[error("unknown connection {connection} in database {database}")]
    UnknownConnection {
        database: String,
        connection: String,
    },

    #[error("connection {connection} in database {database} is disabled")]
    ConnectionDisabled {
        database: String,
        connection: String,
    },

    #[error("database {0} has no enabled connections")]
    NoEnabledConnections(String),

    #[error("program {program}: invalid mapping: {reason}")]
    InvalidMapping { program: String, reason: String },
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

/// The root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    databases: HashMap<String, DatabaseConfig>,
}

/// One database: its connection set, its program entries, and defaults
/// programs inherit when they do not override them.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_enabled")]
    enabled: bool,
    connections: Vec<ConnectionConfig>,
    #[serde(default)]
    programs: HashMap<String, ProgramConfig>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    constraint_mode: Option<ConstraintMode>,
    #[serde(default)]
    validation: Option<Validation>,
}

/// One physical connection entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    id: String,
    dsn: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "default_weight")]
    weight: u32,
}

/// One program entry. Every field is optional; an absent entry means the
/// logical name passes through unmapped with database-level defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgramConfig {
    #[serde(default)]
    maps_to: Option<String>,
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    constraint_mode: Option<ConstraintMode>,
    #[serde(default)]
    validation: Option<Validation>,
    /// Logical parameter name → physical parameter name.
    #[serde(default)]
    parameters: HashMap<String, String>,
}

impl Config {
    /// Parses a configuration document from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed JSON.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`Config::from_json`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Resolves a logical program against a database entry.
    ///
    /// Resolution decides the physical procedure name, the endpoint set,
    /// the effective execution options (program entry over database
    /// defaults), and the parameter-name map to apply to the program's
    /// declarations.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::UnknownDatabase`] / [`ConfigError::DatabaseDisabled`]
    /// - [`ConfigError::UnknownConnection`] / [`ConfigError::ConnectionDisabled`] —
    ///   the program names a connection id that is absent or disabled.
    /// - [`ConfigError::NoEnabledConnections`] — no connection is eligible.
    /// - [`ConfigError::InvalidMapping`] — `maps_to` is present but empty.
    pub fn resolve(&self, database: &str, program: &str) -> Result<Resolved, ConfigError> {
        let db = self
            .databases
            .get(database)
            .ok_or_else(|| ConfigError::UnknownDatabase(database.to_owned()))?;
        if !db.enabled {
            return Err(ConfigError::DatabaseDisabled(database.to_owned()));
        }

        let entry = db.programs.get(program).cloned().unwrap_or_default();

        let procedure = match entry.maps_to {
            Some(ref mapped) if mapped.trim().is_empty() => {
                return Err(ConfigError::InvalidMapping {
                    program: program.to_owned(),
                    reason: "maps_to is empty".to_owned(),
                });
            }
            Some(mapped) => mapped,
            None => program.to_owned(),
        };

        let endpoints = match entry.connection {
            Some(ref id) => {
                let conn = db
                    .connections
                    .iter()
                    .find(|c| c.id == *id)
                    .ok_or_else(|| ConfigError::UnknownConnection {
                        database: database.to_owned(),
                        connection: id.clone(),
                    })?;
                if !conn.enabled {
                    return Err(ConfigError::ConnectionDisabled {
                        database: database.to_owned(),
                        connection: id.clone(),
                    });
                }
                vec![conn.endpoint()]
            }
            None => {
                let enabled: Vec<_> = db
                    .connections
                    .iter()
                    .filter(|c| c.enabled)
                    .map(ConnectionConfig::endpoint)
                    .collect();
                if enabled.is_empty() {
                    return Err(ConfigError::NoEnabledConnections(database.to_owned()));
                }
                enabled
            }
        };

        Ok(Resolved {
            program: program.to_owned(),
            procedure,
            endpoints,
            timeout: entry
                .timeout_ms
                .or(db.timeout_ms)
                .map(Duration::from_millis),
            constraint_mode: entry
                .constraint_mode
                .or(db.constraint_mode)
                .unwrap_or_default(),
            validation: entry.validation.or(db.validation).unwrap_or_default(),
            parameter_map: entry
                .parameters
                .iter()
                .map(|(logical, physical)| (canonical(logical), canonical(physical)))
                .collect(),
        })
    }
}

impl ConnectionConfig {
    fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.id, &self.dsn).weight(self.weight)
    }
}

/// The outcome of resolving one logical program.
#[derive(Debug, Clone)]
pub struct Resolved {
    program: String,
    /// Physical procedure name.
    pub procedure: String,
    /// Endpoints forming the load-balanced set.
    pub endpoints: Vec<Endpoint>,
    /// Effective timeout, if configured.
    pub timeout: Option<Duration>,
    /// Effective constraint mode.
    pub constraint_mode: ConstraintMode,
    /// Effective named-binding validation.
    pub validation: Validation,
    parameter_map: Vec<(String, String)>,
}

impl Resolved {
    /// Applies the parameter-name map to a declaration set, returning the
    /// remapped set.
    ///
    /// Remapping is idempotent: applying the map to an already-remapped set
    /// is a no-op, because a logical name that is no longer present but
    /// whose physical name is counts as already applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidMapping`] when a logical name is not
    /// declared (and its physical name is absent too), or when renaming
    /// would collide with a different declared parameter.
    pub fn remap(&self, defs: &ParamSet) -> Result<ParamSet, ConfigError> {
        let mut remapped = defs.clone();
        for (logical, physical) in &self.parameter_map {
            match remapped.position(logical) {
                Some(index) => {
                    if let Some(existing) = remapped.position(physical) {
                        if existing != index {
                            return Err(ConfigError::InvalidMapping {
                                program: self.program.clone(),
                                reason: format!(
                                    "renaming {logical} to {physical} collides with another declared parameter"
                                ),
                            });
                        }
                    }
                    remapped.set_name(index, physical);
                }
                None if remapped.contains(physical) => {
                    // Already applied — mapping twice is a no-op.
                }
                None => {
                    return Err(ConfigError::InvalidMapping {
                        program: self.program.clone(),
                        reason: format!("parameter {logical} is not declared"),
                    });
                }
            }
        }
        Ok(remapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamDef;
    use crate::value::SqlType;

    const DOC: &str = r#"{
        "databases": {
            "app": {
                "timeout_ms": 2000,
                "constraint_mode": "warn",
                "connections": [
                    { "id": "primary", "dsn": "mem://primary", "weight": 2 },
                    { "id": "replica", "dsn": "mem://replica" },
                    { "id": "retired", "dsn": "mem://retired", "enabled": false }
                ],
                "programs": {
                    "get_user": {
                        "maps_to": "usp_get_user_v4",
                        "connection": "primary",
                        "timeout_ms": 5000,
                        "validation": "lenient",
                        "parameters": { "id": "@user_id" }
                    },
                    "broken": { "maps_to": "  " },
                    "on_retired": { "connection": "retired" }
                }
            },
            "off": { "enabled": false, "connections": [] }
        }
    }"#;

    fn config() -> Config {
        Config::from_json(DOC).unwrap()
    }

    #[test]
    fn program_entry_overrides_database_defaults() {
        let resolved = config().resolve("app", "get_user").unwrap();
        assert_eq!(resolved.procedure, "usp_get_user_v4");
        assert_eq!(resolved.timeout, Some(Duration::from_millis(5000)));
        assert_eq!(resolved.constraint_mode, ConstraintMode::Warn);
        assert_eq!(resolved.validation, Validation::Lenient);
        assert_eq!(resolved.endpoints.len(), 1);
        assert_eq!(resolved.endpoints[0].id, "primary");
        assert_eq!(resolved.endpoints[0].weight, 2);
    }

    #[test]
    fn absent_program_entry_passes_through() {
        let resolved = config().resolve("app", "usp_adhoc").unwrap();
        assert_eq!(resolved.procedure, "usp_adhoc");
        assert_eq!(resolved.timeout, Some(Duration::from_millis(2000)));
        // All enabled connections form the set; the disabled one is skipped.
        let ids: Vec<_> = resolved.endpoints.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["primary", "replica"]);
    }

    #[test]
    fn unknown_and_disabled_databases() {
        assert!(matches!(
            config().resolve("nope", "p"),
            Err(ConfigError::UnknownDatabase(_))
        ));
        assert!(matches!(
            config().resolve("off", "p"),
            Err(ConfigError::DatabaseDisabled(_))
        ));
    }

    #[test]
    fn disabled_connection_is_an_error_when_named() {
        assert!(matches!(
            config().resolve("app", "on_retired"),
            Err(ConfigError::ConnectionDisabled { .. })
        ));
    }

    #[test]
    fn empty_maps_to_is_invalid() {
        assert!(matches!(
            config().resolve("app", "broken"),
            Err(ConfigError::InvalidMapping { .. })
        ));
    }

    #[test]
    fn remap_renames_and_is_idempotent() {
        let resolved = config().resolve("app", "get_user").unwrap();

        let mut defs = ParamSet::new();
        defs.push(ParamDef::new("id", SqlType::Int)).unwrap();
        defs.push(ParamDef::new("depth", SqlType::Int)).unwrap();

        let once = resolved.remap(&defs).unwrap();
        assert!(once.contains("@user_id"));
        assert!(!once.contains("@id"));
        assert!(once.contains("@depth"));

        // Applying the same map to the remapped set changes nothing.
        let twice = resolved.remap(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn remap_unknown_logical_name_is_invalid() {
        let resolved = config().resolve("app", "get_user").unwrap();
        let mut defs = ParamSet::new();
        defs.push(ParamDef::new("other", SqlType::Int)).unwrap();
        assert!(matches!(
            resolved.remap(&defs),
            Err(ConfigError::InvalidMapping { .. })
        ));
    }

    #[test]
    fn remap_collision_is_invalid() {
        let resolved = config().resolve("app", "get_user").unwrap();
        let mut defs = ParamSet::new();
        defs.push(ParamDef::new("id", SqlType::Int)).unwrap();
        defs.push(ParamDef::new("user_id", SqlType::Int)).unwrap();
        assert!(matches!(
            resolved.remap(&defs),
            Err(ConfigError::InvalidMapping { .. })
        ));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            Config::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
