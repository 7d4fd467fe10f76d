//! Knowledge graph memory: named entities carrying ordered observations,
//! linked by typed directed relations, persisted through the store adapter.

pub mod engine;
pub mod error;
pub mod graph;

pub use engine::MemoryEngine;
pub use error::MemoryError;
pub use graph::{
    BatchFailure, BatchOutcome, DeletionSummary, Entity, EntityInput, KnowledgeGraph,
    ObservationDeletion, ObservationInput, Relation, RelationInput,
};
