//! Knowledge graph data types.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize, Serializer};
use time::OffsetDateTime;

use super::error::MemoryError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub name: String,
    pub entity_type: String,
    pub observations: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    /// Store-assigned row id; the logical identity is (from, to, relation_type).
    pub id: i64,
    pub from: String,
    pub to: String,
    pub relation_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeGraph {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
}

/// An entity to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EntityInput {
    /// Unique entity name
    pub name: String,
    /// Free-text classification, e.g. "project", "person"
    pub entity_type: String,
    /// Initial observations, in order
    #[serde(default)]
    pub observations: Vec<String>,
}

/// A relation to create or delete, identified by its triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RelationInput {
    /// Source entity name
    pub from: String,
    /// Target entity name
    pub to: String,
    /// Relation label in active voice, e.g. "depends_on"
    pub relation_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservationInput {
    pub entity_name: String,
    /// Observations to append, in order
    pub contents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservationDeletion {
    pub entity_name: String,
    /// Every occurrence of each of these values is removed
    pub observations: Vec<String>,
}

/// Rows removed by a delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionSummary {
    pub entities: usize,
    pub relations: usize,
}

impl std::ops::AddAssign for DeletionSummary {
    fn add_assign(&mut self, other: Self) {
        self.entities += other.entities;
        self.relations += other.relations;
    }
}

/// Result of a best-effort batch: one failing item never aborts the others.
#[derive(Debug, Serialize)]
pub struct BatchOutcome<I, T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<BatchFailure<I>>,
}

impl<I, T> Default for BatchOutcome<I, T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchFailure<I> {
    pub input: I,
    #[serde(serialize_with = "serialize_error")]
    pub error: MemoryError,
}

fn serialize_error<S: Serializer>(error: &MemoryError, serializer: S) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct Report<'a> {
        code: &'a str,
        message: String,
    }
    Report {
        code: error.code(),
        message: error.to_string(),
    }
    .serialize(serializer)
}
