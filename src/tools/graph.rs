use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::memory::{EntityInput, ObservationDeletion, ObservationInput, RelationInput};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateEntitiesArgs {
    pub entities: Vec<EntityInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RelationsArgs {
    pub relations: Vec<RelationInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AddObservationsArgs {
    pub observations: Vec<ObservationInput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeleteEntitiesArgs {
    /// Entities to delete along with every relation touching them
    pub entity_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeleteObservationsArgs {
    pub deletions: Vec<ObservationDeletion>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchNodesArgs {
    /// Case-insensitive substring; empty matches everything
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct OpenNodesArgs {
    pub names: Vec<String>,
}
