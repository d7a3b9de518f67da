//! Identifiers and value types exchanged with the remote service

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a simulated actor
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub String);

impl ActorId {
    /// Build the id of the `index`-th actor of a role
    pub fn new(role: ActorRole, index: usize) -> Self {
        Self(format!("{}-{index}", role.as_str()))
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ActorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Actor class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Drives the full job pipeline and publishes artifacts
    Producer,
    /// Opens artifacts published by producers
    Consumer,
}

impl ActorRole {
    /// Label used in ids and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::Producer => "producer",
            ActorRole::Consumer => "consumer",
        }
    }
}

/// Remote job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote processing run identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a job writes its data, as reported by the job's parameters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetParams {
    /// Target connection name
    pub connection: String,
    /// Target schema
    pub schema: String,
}

/// Where a secondary job reads its data from
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceParams {
    /// Source connection name
    pub connection: String,
    /// Source schema
    pub schema: String,
}

/// Remote database identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatabaseId(pub u64);

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything an upload request needs to address its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Owning job
    pub job_id: JobId,
    /// Resolved database
    pub database_id: DatabaseId,
    /// Target schema
    pub schema: String,
    /// Target table (the job label)
    pub table: String,
}

/// A fully qualified table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Database holding the table
    pub database_id: DatabaseId,
    /// Schema
    pub schema: String,
    /// Table name
    pub table: String,
}

impl TableRef {
    /// Quoted `"schema"."table"` form
    pub fn qualified_name(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }
}

impl From<&UploadTarget> for TableRef {
    fn from(target: &UploadTarget) -> Self {
        Self {
            database_id: target.database_id,
            schema: target.schema.clone(),
            table: target.table.clone(),
        }
    }
}

/// Creation request for the secondary job derived from a primary job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryJobSpec {
    /// Primary job the secondary one reads from
    pub parent: JobId,
    /// Label of the secondary job
    pub label: String,
    /// Source resolved from the secondary job's parameters
    pub source: SourceParams,
    /// Table produced by the primary job
    pub table: String,
}

/// Lookup key for an artifact produced by a secondary run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactQuery {
    /// Secondary job
    pub job_id: JobId,
    /// Secondary run
    pub run_id: RunId,
    /// Sub-task that produced the artifact
    pub block_id: String,
    /// Run id of that sub-task
    pub block_run_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_actor_id_from_role() {
        assert_eq!(ActorId::new(ActorRole::Producer, 3).as_str(), "producer-3");
        assert_eq!(ActorId::new(ActorRole::Consumer, 0).to_string(), "consumer-0");
    }

    #[test]
    fn test_table_ref_qualified_name() {
        let table = TableRef {
            database_id: DatabaseId(7),
            schema: "staging".into(),
            table: "Tube_42".into(),
        };
        assert_eq!(table.qualified_name(), "\"staging\".\"Tube_42\"");
    }

    #[test]
    fn test_ids_serialize_transparently() {
        assert_eq!(serde_json::to_string(&JobId(12)).unwrap(), "12");
        assert_eq!(
            serde_json::to_string(&RunId("run-1".into())).unwrap(),
            "\"run-1\""
        );
    }
}
