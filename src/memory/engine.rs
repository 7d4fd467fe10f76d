//! Graph memory engine.
//!
//! Entities live in the `entities` table (observations as JSON text), relations
//! in `relations`. Every operation goes back to the store; nothing is cached.
//! Multi-step operations (check-then-insert, read-modify-write, cascade delete)
//! each run in a single store transaction. Batch operations are best-effort:
//! one transaction per item, failures logged and reported, never fatal.

use std::collections::HashSet;

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use super::error::MemoryError;
use super::graph::{
    BatchFailure, BatchOutcome, DeletionSummary, Entity, EntityInput, KnowledgeGraph,
    ObservationDeletion, ObservationInput, Relation, RelationInput,
};
use crate::store::{
    ColumnSpec, Conditions, Executor, IndexSpec, QueryOptions, Record, Row, Store, StoreError,
    TableSpec,
};

const ENTITIES: &str = "entities";
const RELATIONS: &str = "relations";

// Validation constants
const MAX_NAME_LENGTH: usize = 256;
const MAX_TYPE_LENGTH: usize = 128;
const MAX_OBSERVATION_LENGTH: usize = 4096;

fn validate_name(name: &str, field: &str) -> Result<(), MemoryError> {
    if name.is_empty() {
        return Err(MemoryError::Validation(format!("{} cannot be empty", field)));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(MemoryError::Validation(format!(
            "{} too long (max {} chars)",
            field, MAX_NAME_LENGTH
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(MemoryError::Validation(format!(
            "{} contains control characters",
            field
        )));
    }
    Ok(())
}

fn validate_type(type_str: &str, field: &str) -> Result<(), MemoryError> {
    if type_str.trim().is_empty() {
        return Err(MemoryError::Validation(format!("{} cannot be empty", field)));
    }
    if type_str.chars().count() > MAX_TYPE_LENGTH {
        return Err(MemoryError::Validation(format!(
            "{} too long (max {} chars)",
            field, MAX_TYPE_LENGTH
        )));
    }
    if type_str.chars().any(char::is_control) {
        return Err(MemoryError::Validation(format!(
            "{} contains control characters",
            field
        )));
    }
    Ok(())
}

fn validate_observations(observations: &[String]) -> Result<(), MemoryError> {
    for obs in observations {
        if obs.chars().count() > MAX_OBSERVATION_LENGTH {
            return Err(MemoryError::Validation(format!(
                "Observation too long (max {} chars)",
                MAX_OBSERVATION_LENGTH
            )));
        }
        if obs.contains('\0') {
            return Err(MemoryError::Validation(
                "Observation contains null bytes".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_relation(input: &RelationInput) -> Result<(), MemoryError> {
    validate_name(&input.from, "From entity")?;
    validate_name(&input.to, "To entity")?;
    validate_type(&input.relation_type, "Relation type")
}

fn entities_table() -> TableSpec {
    TableSpec::new(
        ENTITIES,
        vec![
            ColumnSpec::new("name", "TEXT").primary_key().not_null(),
            ColumnSpec::new("entity_type", "TEXT").not_null(),
            ColumnSpec::new("observations", "TEXT").not_null(),
            ColumnSpec::new("created_at", "TEXT").not_null(),
            ColumnSpec::new("updated_at", "TEXT").not_null(),
        ],
    )
}

/// No UNIQUE(from, to, type): repeated creates insert repeated rows.
fn relations_table() -> TableSpec {
    TableSpec::new(
        RELATIONS,
        vec![
            ColumnSpec::new("id", "INTEGER").primary_key().autoincrement(),
            ColumnSpec::new("from_entity", "TEXT").not_null(),
            ColumnSpec::new("to_entity", "TEXT").not_null(),
            ColumnSpec::new("relation_type", "TEXT").not_null(),
            ColumnSpec::new("created_at", "TEXT").not_null(),
        ],
    )
}

fn memory_indexes() -> Vec<IndexSpec> {
    vec![
        IndexSpec::new("idx_relations_from", RELATIONS, &["from_entity"]),
        IndexSpec::new("idx_relations_to", RELATIONS, &["to_entity"]),
        IndexSpec::new("idx_relations_type", RELATIONS, &["relation_type"]),
        IndexSpec::new("idx_entities_type", ENTITIES, &["entity_type"]),
        IndexSpec::new("idx_entities_updated", ENTITIES, &["updated_at"]),
    ]
}

fn format_stamp(at: OffsetDateTime) -> Result<String, StoreError> {
    at.format(&Rfc3339)
        .map_err(|e| StoreError::InvalidRequest(format!("unformattable timestamp: {}", e)))
}

fn parse_stamp(raw: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|e| StoreError::MalformedRow(format!("bad timestamp '{}': {}", raw, e)))
}

/// A stamp strictly after `previous`, even if the clock has not moved.
fn advance(previous: OffsetDateTime) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

fn text<'a>(row: &'a Row, column: &str) -> Result<&'a str, StoreError> {
    row.get(column)
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::MalformedRow(format!("missing text column '{}'", column)))
}

fn entity_from_row(row: &Row) -> Result<Entity, StoreError> {
    Ok(Entity {
        name: text(row, "name")?.to_string(),
        entity_type: text(row, "entity_type")?.to_string(),
        observations: serde_json::from_str(text(row, "observations")?)?,
        created_at: parse_stamp(text(row, "created_at")?)?,
        updated_at: parse_stamp(text(row, "updated_at")?)?,
    })
}

fn relation_from_row(row: &Row) -> Result<Relation, StoreError> {
    Ok(Relation {
        id: row
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| StoreError::MalformedRow("missing relation id".to_string()))?,
        from: text(row, "from_entity")?.to_string(),
        to: text(row, "to_entity")?.to_string(),
        relation_type: text(row, "relation_type")?.to_string(),
        created_at: parse_stamp(text(row, "created_at")?)?,
    })
}

fn entity_record(entity: &Entity) -> Result<Record, StoreError> {
    let mut record = Record::new();
    record.insert("name".into(), entity.name.clone().into());
    record.insert("entity_type".into(), entity.entity_type.clone().into());
    record.insert(
        "observations".into(),
        serde_json::to_string(&entity.observations)?.into(),
    );
    record.insert("created_at".into(), format_stamp(entity.created_at)?.into());
    record.insert("updated_at".into(), format_stamp(entity.updated_at)?.into());
    Ok(record)
}

/// Fields rewritten by an observation mutation.
fn observation_fields(entity: &Entity) -> Result<Record, StoreError> {
    let mut record = Record::new();
    record.insert(
        "observations".into(),
        serde_json::to_string(&entity.observations)?.into(),
    );
    record.insert("updated_at".into(), format_stamp(entity.updated_at)?.into());
    Ok(record)
}

fn by_name(name: &str) -> Conditions {
    Conditions::new().eq("name", name)
}

fn find_entity(db: &dyn Executor, name: &str) -> Result<Option<Entity>, StoreError> {
    let rows = db.query(ENTITIES, &by_name(name), &QueryOptions::default())?;
    rows.first().map(entity_from_row).transpose()
}

fn require_entity(db: &dyn Executor, name: &str) -> Result<Entity, MemoryError> {
    find_entity(db, name)?.ok_or_else(|| MemoryError::UnknownEntity(name.to_string()))
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(needle)
}

/// Runs `op` on every input; failures are logged and collected, not raised.
fn run_batch<I, T>(
    what: &str,
    inputs: Vec<I>,
    describe: impl Fn(&I) -> String,
    mut op: impl FnMut(&I) -> Result<T, MemoryError>,
) -> BatchOutcome<I, T> {
    let mut outcome = BatchOutcome::default();
    for input in inputs {
        match op(&input) {
            Ok(value) => outcome.succeeded.push(value),
            Err(error) => {
                warn!("memory: skipping {} {}: {}", what, describe(&input), error);
                outcome.failed.push(BatchFailure { input, error });
            }
        }
    }
    outcome
}

#[derive(Clone)]
pub struct MemoryEngine<S> {
    store: S,
}

impl<S: Store> MemoryEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Creates the backing tables and indexes. Safe to call repeatedly.
    /// Index failures only cost lookup speed and are logged, not raised.
    pub fn initialize(&self) -> Result<(), MemoryError> {
        self.store.read(|db| {
            for table in [entities_table(), relations_table()] {
                db.create_table(&table).map_err(MemoryError::Schema)?;
            }
            for index in memory_indexes() {
                if let Err(err) = db.create_index(&index) {
                    warn!(
                        "memory: index {} on {} not created: {}",
                        index.name, index.table, err
                    );
                }
            }
            info!("memory: schema ready");
            Ok(())
        })
    }

    pub fn create_entity(&self, input: &EntityInput) -> Result<Entity, MemoryError> {
        validate_name(&input.name, "Entity name")?;
        validate_type(&input.entity_type, "Entity type")?;
        validate_observations(&input.observations)?;

        self.store.transaction(|db| {
            if find_entity(db, &input.name)?.is_some() {
                return Err(MemoryError::DuplicateEntity(input.name.clone()));
            }
            let now = OffsetDateTime::now_utc();
            let entity = Entity {
                name: input.name.clone(),
                entity_type: input.entity_type.clone(),
                observations: input.observations.clone(),
                created_at: now,
                updated_at: now,
            };
            db.insert(ENTITIES, &[entity_record(&entity)?])
                .map_err(|err| {
                    if err.is_constraint_violation() {
                        MemoryError::DuplicateEntity(input.name.clone())
                    } else {
                        err.into()
                    }
                })?;
            debug!("memory: created entity '{}'", entity.name);
            Ok(entity)
        })
    }

    pub fn create_entities(&self, inputs: Vec<EntityInput>) -> BatchOutcome<EntityInput, Entity> {
        run_batch(
            "entity",
            inputs,
            |input| format!("'{}'", input.name),
            |input| self.create_entity(input),
        )
    }

    /// Both endpoints must already exist. No duplicate check on the triple.
    pub fn create_relation(&self, input: &RelationInput) -> Result<Relation, MemoryError> {
        validate_relation(input)?;

        self.store.transaction(|db| {
            require_entity(db, &input.from)?;
            require_entity(db, &input.to)?;

            let created_at = OffsetDateTime::now_utc();
            let mut record = Record::new();
            record.insert("from_entity".into(), input.from.clone().into());
            record.insert("to_entity".into(), input.to.clone().into());
            record.insert("relation_type".into(), input.relation_type.clone().into());
            record.insert("created_at".into(), format_stamp(created_at)?.into());

            let inserted = db.insert(RELATIONS, &[record])?;
            let id = inserted
                .last_id
                .ok_or_else(|| StoreError::MalformedRow("relation insert returned no id".to_string()))?;
            debug!(
                "memory: created relation {} -[{}]-> {}",
                input.from, input.relation_type, input.to
            );
            Ok(Relation {
                id,
                from: input.from.clone(),
                to: input.to.clone(),
                relation_type: input.relation_type.clone(),
                created_at,
            })
        })
    }

    pub fn create_relations(
        &self,
        inputs: Vec<RelationInput>,
    ) -> BatchOutcome<RelationInput, Relation> {
        run_batch(
            "relation",
            inputs,
            |r| format!("{} -[{}]-> {}", r.from, r.relation_type, r.to),
            |input| self.create_relation(input),
        )
    }

    /// Appends `contents` in order; duplicates are kept.
    pub fn add_observation(
        &self,
        entity_name: &str,
        contents: &[String],
    ) -> Result<Entity, MemoryError> {
        validate_name(entity_name, "Entity name")?;
        validate_observations(contents)?;

        self.store.transaction(|db| {
            let mut entity = require_entity(db, entity_name)?;
            entity.observations.extend(contents.iter().cloned());
            entity.updated_at = advance(entity.updated_at);
            db.update(ENTITIES, &by_name(entity_name), &observation_fields(&entity)?)?;
            Ok(entity)
        })
    }

    pub fn add_observations(
        &self,
        inputs: Vec<ObservationInput>,
    ) -> BatchOutcome<ObservationInput, Entity> {
        run_batch(
            "observations for",
            inputs,
            |input| format!("'{}'", input.entity_name),
            |input| self.add_observation(&input.entity_name, &input.contents),
        )
    }

    /// Removes every occurrence of each value in `observations`, keeping the
    /// order of what remains.
    pub fn delete_observation(
        &self,
        entity_name: &str,
        observations: &[String],
    ) -> Result<Entity, MemoryError> {
        validate_name(entity_name, "Entity name")?;
        let doomed: HashSet<&str> = observations.iter().map(String::as_str).collect();

        self.store.transaction(|db| {
            let mut entity = require_entity(db, entity_name)?;
            entity.observations.retain(|obs| !doomed.contains(obs.as_str()));
            entity.updated_at = advance(entity.updated_at);
            db.update(ENTITIES, &by_name(entity_name), &observation_fields(&entity)?)?;
            Ok(entity)
        })
    }

    pub fn delete_observations(
        &self,
        inputs: Vec<ObservationDeletion>,
    ) -> BatchOutcome<ObservationDeletion, Entity> {
        run_batch(
            "observation deletion for",
            inputs,
            |input| format!("'{}'", input.entity_name),
            |input| self.delete_observation(&input.entity_name, &input.observations),
        )
    }

    /// Deletes the entity and every relation touching it. A missing entity
    /// is not an error; the summary is simply all zeros.
    pub fn delete_entity(&self, name: &str) -> Result<DeletionSummary, MemoryError> {
        validate_name(name, "Entity name")?;

        self.store.transaction(|db| {
            let outgoing = db.delete(RELATIONS, &Conditions::new().eq("from_entity", name))?;
            let incoming = db.delete(RELATIONS, &Conditions::new().eq("to_entity", name))?;
            let entities = db.delete(ENTITIES, &by_name(name))?;
            debug!(
                "memory: deleted entity '{}' ({} relations)",
                name,
                outgoing + incoming
            );
            Ok(DeletionSummary {
                entities,
                relations: outgoing + incoming,
            })
        })
    }

    pub fn delete_entities(&self, names: &[String]) -> Result<DeletionSummary, MemoryError> {
        for name in names {
            validate_name(name, "Entity name")?;
        }
        let mut summary = DeletionSummary::default();
        for name in names {
            summary += self.delete_entity(name)?;
        }
        Ok(summary)
    }

    /// Deletes every row matching the full triple; returns how many.
    pub fn delete_relation(&self, input: &RelationInput) -> Result<usize, MemoryError> {
        validate_relation(input)?;
        let conditions = Conditions::new()
            .eq("from_entity", input.from.as_str())
            .eq("to_entity", input.to.as_str())
            .eq("relation_type", input.relation_type.as_str());
        Ok(self.store.read(|db| db.delete(RELATIONS, &conditions))?)
    }

    pub fn delete_relations(&self, inputs: &[RelationInput]) -> Result<usize, MemoryError> {
        for input in inputs {
            validate_relation(input)?;
        }
        let mut count = 0;
        for input in inputs {
            count += self.delete_relation(input)?;
        }
        Ok(count)
    }

    pub fn read_graph(&self) -> Result<KnowledgeGraph, MemoryError> {
        let graph = self.store.read(|db| -> Result<KnowledgeGraph, StoreError> {
            let entities = db
                .query(ENTITIES, &Conditions::new(), &QueryOptions::default())?
                .iter()
                .map(entity_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            let relations = db
                .query(RELATIONS, &Conditions::new(), &QueryOptions::ordered_by("id"))?
                .iter()
                .map(relation_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(KnowledgeGraph { entities, relations })
        })?;
        Ok(graph)
    }

    /// Case-insensitive substring search. Entities match on name, type or the
    /// stored observations text; relations on type, source or target. The two
    /// sides are matched independently.
    pub fn search_nodes(&self, query: &str) -> Result<KnowledgeGraph, MemoryError> {
        let needle = query.to_lowercase();
        let graph = self.store.read(|db| -> Result<KnowledgeGraph, StoreError> {
            let mut graph = KnowledgeGraph::default();
            for row in db.query(ENTITIES, &Conditions::new(), &QueryOptions::default())? {
                let hit = ["name", "entity_type", "observations"]
                    .into_iter()
                    .map(|column| text(&row, column))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter()
                    .any(|field| contains_ci(field, &needle));
                if hit {
                    graph.entities.push(entity_from_row(&row)?);
                }
            }
            for row in db.query(RELATIONS, &Conditions::new(), &QueryOptions::ordered_by("id"))? {
                let relation = relation_from_row(&row)?;
                if contains_ci(&relation.relation_type, &needle)
                    || contains_ci(&relation.from, &needle)
                    || contains_ci(&relation.to, &needle)
                {
                    graph.relations.push(relation);
                }
            }
            Ok(graph)
        })?;
        debug!(
            "memory: search '{}' matched {} entities, {} relations",
            query,
            graph.entities.len(),
            graph.relations.len()
        );
        Ok(graph)
    }

    pub fn open_node(&self, name: &str) -> Result<Option<Entity>, MemoryError> {
        validate_name(name, "Entity name")?;
        Ok(self.store.read(|db| find_entity(db, name))?)
    }

    /// Names that do not resolve land in `failed` as unknown entities.
    pub fn open_nodes(&self, names: Vec<String>) -> BatchOutcome<String, Entity> {
        run_batch(
            "node",
            names,
            |name| format!("'{}'", name),
            |name| {
                self.open_node(name)?
                    .ok_or_else(|| MemoryError::UnknownEntity(name.clone()))
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ColumnInfo, ExecOutcome, Inserted, SqliteStore};

    fn engine() -> MemoryEngine<SqliteStore> {
        let engine = MemoryEngine::new(SqliteStore::open_in_memory().unwrap());
        engine.initialize().unwrap();
        engine
    }

    fn entity(name: &str, entity_type: &str, observations: &[&str]) -> EntityInput {
        EntityInput {
            name: name.to_string(),
            entity_type: entity_type.to_string(),
            observations: observations.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn relation(from: &str, to: &str, relation_type: &str) -> RelationInput {
        RelationInput {
            from: from.to_string(),
            to: to.to_string(),
            relation_type: relation_type.to_string(),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn raw_begin_does_not_wedge_later_mutations() {
        let engine = engine();
        let err = engine
            .store()
            .read(|db| db.execute("BEGIN", &[]))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        engine.create_entity(&entity("a", "task", &[])).unwrap();
        engine.create_entity(&entity("b", "task", &[])).unwrap();
        engine.add_observation("a", &strings(&["note"])).unwrap();
        assert_eq!(engine.read_graph().unwrap().entities.len(), 2);
    }

    #[test]
    fn duplicate_entity_is_rejected_without_change() {
        let engine = engine();
        let created = engine.create_entity(&entity("api", "project", &["v1"])).unwrap();
        assert_eq!(created.created_at, created.updated_at);

        let before = engine.read_graph().unwrap();
        let err = engine
            .create_entity(&entity("api", "task", &["other"]))
            .unwrap_err();
        assert!(matches!(err, MemoryError::DuplicateEntity(ref n) if n == "api"));
        assert_eq!(engine.read_graph().unwrap(), before);
    }

    #[test]
    fn created_entity_round_trips_through_store() {
        let engine = engine();
        let created = engine
            .create_entity(&entity("api", "project", &["b", "a", "b"]))
            .unwrap();
        let graph = engine.read_graph().unwrap();
        assert_eq!(graph.entities, vec![created]);
        assert_eq!(graph.entities[0].observations, strings(&["b", "a", "b"]));
    }

    #[test]
    fn relation_requires_both_endpoints() {
        let engine = engine();
        engine.create_entity(&entity("a", "node", &[])).unwrap();

        let err = engine.create_relation(&relation("a", "b", "uses")).unwrap_err();
        assert!(matches!(err, MemoryError::UnknownEntity(ref n) if n == "b"));
        let err = engine.create_relation(&relation("z", "a", "uses")).unwrap_err();
        assert!(matches!(err, MemoryError::UnknownEntity(ref n) if n == "z"));
        assert!(engine.read_graph().unwrap().relations.is_empty());

        engine.create_entity(&entity("b", "node", &[])).unwrap();
        let created = engine.create_relation(&relation("a", "b", "uses")).unwrap();
        assert_eq!(engine.read_graph().unwrap().relations, vec![created]);
    }

    #[test]
    fn duplicate_relations_accumulate_and_delete_together() {
        let engine = engine();
        engine.create_entity(&entity("a", "node", &[])).unwrap();
        engine.create_entity(&entity("b", "node", &[])).unwrap();

        let first = engine.create_relation(&relation("a", "b", "blocks")).unwrap();
        let second = engine.create_relation(&relation("a", "b", "blocks")).unwrap();
        assert_ne!(first.id, second.id);
        engine.create_relation(&relation("a", "b", "owns")).unwrap();
        assert_eq!(engine.read_graph().unwrap().relations.len(), 3);

        assert_eq!(engine.delete_relation(&relation("a", "b", "blocks")).unwrap(), 2);
        let remaining = engine.read_graph().unwrap().relations;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].relation_type, "owns");
        assert_eq!(engine.delete_relation(&relation("a", "b", "blocks")).unwrap(), 0);
    }

    #[test]
    fn delete_entity_cascades_to_relations() {
        let engine = engine();
        for name in ["e", "x", "y"] {
            engine.create_entity(&entity(name, "node", &[])).unwrap();
        }
        engine.create_relation(&relation("e", "x", "t1")).unwrap();
        engine.create_relation(&relation("y", "e", "t2")).unwrap();
        engine.create_relation(&relation("x", "y", "t3")).unwrap();

        let summary = engine.delete_entity("e").unwrap();
        assert_eq!(summary, DeletionSummary { entities: 1, relations: 2 });

        let graph = engine.read_graph().unwrap();
        assert!(graph.entities.iter().all(|e| e.name != "e"));
        assert_eq!(graph.relations.len(), 1);
        assert_eq!(graph.relations[0].relation_type, "t3");

        assert_eq!(engine.delete_entity("e").unwrap(), DeletionSummary::default());
    }

    #[test]
    fn delete_entities_sums_and_validates_first() {
        let engine = engine();
        engine.create_entity(&entity("a", "node", &[])).unwrap();
        engine.create_entity(&entity("b", "node", &[])).unwrap();
        engine.create_relation(&relation("a", "b", "r")).unwrap();

        let err = engine.delete_entities(&strings(&["a", ""])).unwrap_err();
        assert!(matches!(err, MemoryError::Validation(_)));
        assert_eq!(engine.read_graph().unwrap().entities.len(), 2);

        let summary = engine.delete_entities(&strings(&["a", "b", "ghost"])).unwrap();
        assert_eq!(summary, DeletionSummary { entities: 2, relations: 1 });
        assert_eq!(engine.read_graph().unwrap(), KnowledgeGraph::default());
    }

    #[test]
    fn observation_append_then_remove() {
        let engine = engine();
        let created = engine.create_entity(&entity("e", "node", &[])).unwrap();

        let added = engine.add_observation("e", &strings(&["a", "b"])).unwrap();
        assert_eq!(added.observations, strings(&["a", "b"]));
        assert!(added.updated_at > created.updated_at);
        assert_eq!(added.created_at, created.created_at);

        let removed = engine.delete_observation("e", &strings(&["a"])).unwrap();
        assert_eq!(removed.observations, strings(&["b"]));
        assert!(removed.updated_at > added.updated_at);
        assert_eq!(removed.created_at, created.created_at);

        let stored = engine.open_node("e").unwrap().unwrap();
        assert_eq!(stored, removed);
    }

    #[test]
    fn delete_observation_removes_every_occurrence() {
        let engine = engine();
        engine.create_entity(&entity("e", "node", &["x", "y", "x"])).unwrap();
        let updated = engine.delete_observation("e", &strings(&["x"])).unwrap();
        assert_eq!(updated.observations, strings(&["y"]));
    }

    #[test]
    fn add_observation_keeps_duplicates() {
        let engine = engine();
        engine.create_entity(&entity("e", "node", &["x"])).unwrap();
        let updated = engine.add_observation("e", &strings(&["x", "x"])).unwrap();
        assert_eq!(updated.observations, strings(&["x", "x", "x"]));
    }

    #[test]
    fn observation_mutation_on_unknown_entity_fails() {
        let engine = engine();
        let err = engine.add_observation("ghost", &strings(&["a"])).unwrap_err();
        assert!(matches!(err, MemoryError::UnknownEntity(_)));
        let err = engine.delete_observation("ghost", &strings(&["a"])).unwrap_err();
        assert!(matches!(err, MemoryError::UnknownEntity(_)));
    }

    #[test]
    fn batch_create_skips_duplicates() {
        let engine = engine();
        let outcome = engine.create_entities(vec![
            entity("a", "node", &["first"]),
            entity("a", "node", &["second"]),
            entity("b", "node", &[]),
        ]);
        let names: Vec<_> = outcome.succeeded.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].input.observations, strings(&["second"]));
        assert!(matches!(outcome.failed[0].error, MemoryError::DuplicateEntity(_)));

        let stored = engine.open_node("a").unwrap().unwrap();
        assert_eq!(stored.observations, strings(&["first"]));
    }

    #[test]
    fn batch_relations_and_observations_are_best_effort() {
        let engine = engine();
        engine.create_entity(&entity("a", "node", &[])).unwrap();
        engine.create_entity(&entity("b", "node", &[])).unwrap();

        let relations = engine.create_relations(vec![
            relation("a", "b", "r1"),
            relation("a", "ghost", "r2"),
            relation("b", "a", "r3"),
        ]);
        assert_eq!(relations.succeeded.len(), 2);
        assert_eq!(relations.failed[0].input.to, "ghost");

        let added = engine.add_observations(vec![
            ObservationInput {
                entity_name: "ghost".to_string(),
                contents: strings(&["x"]),
            },
            ObservationInput {
                entity_name: "a".to_string(),
                contents: strings(&["x", "y"]),
            },
        ]);
        assert_eq!(added.succeeded.len(), 1);
        assert_eq!(added.failed.len(), 1);

        let deleted = engine.delete_observations(vec![ObservationDeletion {
            entity_name: "a".to_string(),
            observations: strings(&["y", "missing"]),
        }]);
        assert!(deleted.failed.is_empty());
        assert_eq!(deleted.succeeded[0].observations, strings(&["x"]));
    }

    #[test]
    fn search_matches_entities_and_relations_independently() {
        let engine = engine();
        engine
            .create_entity(&entity("user_auth", "feature", &["Login via OAuth"]))
            .unwrap();
        engine.create_entity(&entity("billing", "feature", &[])).unwrap();
        engine.create_entity(&entity("alice", "person", &[])).unwrap();
        engine.create_relation(&relation("alice", "billing", "owns")).unwrap();
        engine.create_relation(&relation("billing", "user_auth", "depends_on")).unwrap();

        let result = engine.search_nodes("AUTH").unwrap();
        let names: Vec<_> = result.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["user_auth"]);
        // Matched through its `to` endpoint text, not through the entity hit.
        assert_eq!(result.relations.len(), 1);
        assert_eq!(result.relations[0].relation_type, "depends_on");

        let by_type = engine.search_nodes("person").unwrap();
        assert_eq!(by_type.entities.len(), 1);
        assert!(by_type.relations.is_empty());

        let by_observation = engine.search_nodes("oauth").unwrap();
        assert_eq!(by_observation.entities[0].name, "user_auth");
        assert!(by_observation.relations.is_empty());

        let by_relation_type = engine.search_nodes("OWNS").unwrap();
        assert!(by_relation_type.entities.is_empty());
        assert_eq!(by_relation_type.relations.len(), 1);
    }

    #[test]
    fn open_nodes_reports_unknown_names() {
        let engine = engine();
        engine.create_entity(&entity("a", "node", &[])).unwrap();
        assert!(engine.open_node("b").unwrap().is_none());

        let outcome = engine.open_nodes(strings(&["a", "b"]));
        assert_eq!(outcome.succeeded.len(), 1);
        assert_eq!(outcome.succeeded[0].name, "a");
        assert_eq!(outcome.failed[0].input, "b");
        assert!(matches!(outcome.failed[0].error, MemoryError::UnknownEntity(_)));
    }

    #[test]
    fn validation_happens_before_store() {
        let engine = engine();
        let err = engine.create_entity(&entity("", "node", &[])).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let err = engine.create_entity(&entity("a", " ", &[])).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let long = "x".repeat(MAX_OBSERVATION_LENGTH + 1);
        let err = engine
            .create_entity(&entity("a", "node", &[long.as_str()]))
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        let err = engine.create_relation(&relation("a", "b", "")).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(engine.read_graph().unwrap(), KnowledgeGraph::default());
    }

    fn schema_objects(engine: &MemoryEngine<SqliteStore>) -> Vec<Value> {
        let outcome = engine
            .store()
            .read(|db| {
                db.execute(
                    "SELECT type, name FROM sqlite_master WHERE name NOT LIKE 'sqlite_%' ORDER BY name",
                    &[],
                )
            })
            .unwrap();
        match outcome {
            ExecOutcome::Rows(rows) => rows.into_iter().map(Value::Object).collect(),
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[test]
    fn initialize_is_idempotent() {
        let engine = engine();
        engine.create_entity(&entity("keep", "node", &[])).unwrap();
        let before = schema_objects(&engine);
        assert_eq!(before.len(), 7);

        engine.initialize().unwrap();
        engine.initialize().unwrap();
        assert_eq!(schema_objects(&engine), before);
        assert!(engine.open_node("keep").unwrap().is_some());
    }

    #[test]
    fn index_failure_is_not_fatal() {
        let store = SqliteStore::open_in_memory().unwrap();
        // A table squatting on an index name makes that CREATE INDEX fail.
        store
            .read(|db| db.execute("CREATE TABLE idx_entities_type (x TEXT)", &[]))
            .unwrap();
        let engine = MemoryEngine::new(store);
        engine.initialize().unwrap();
        engine.create_entity(&entity("a", "node", &[])).unwrap();
        assert_eq!(engine.search_nodes("node").unwrap().entities.len(), 1);
    }

    /// Store whose executor refuses to create tables.
    #[derive(Clone)]
    struct BrokenStore;

    struct BrokenExecutor;

    fn refused() -> StoreError {
        StoreError::InvalidRequest("disk is read-only".to_string())
    }

    impl Executor for BrokenExecutor {
        fn create_table(&self, _: &TableSpec) -> Result<(), StoreError> {
            Err(refused())
        }
        fn create_index(&self, _: &IndexSpec) -> Result<(), StoreError> {
            Err(refused())
        }
        fn drop_table(&self, _: &str) -> Result<(), StoreError> {
            Err(refused())
        }
        fn list_tables(&self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }
        fn describe_table(&self, _: &str) -> Result<Vec<ColumnInfo>, StoreError> {
            Err(refused())
        }
        fn insert(&self, _: &str, _: &[Record]) -> Result<Inserted, StoreError> {
            Err(refused())
        }
        fn query(&self, _: &str, _: &Conditions, _: &QueryOptions) -> Result<Vec<Row>, StoreError> {
            Ok(Vec::new())
        }
        fn update(&self, _: &str, _: &Conditions, _: &Record) -> Result<usize, StoreError> {
            Err(refused())
        }
        fn delete(&self, _: &str, _: &Conditions) -> Result<usize, StoreError> {
            Err(refused())
        }
        fn execute(&self, _: &str, _: &[Value]) -> Result<ExecOutcome, StoreError> {
            Err(refused())
        }
    }

    impl Store for BrokenStore {
        fn read<T, E>(&self, f: impl FnOnce(&dyn Executor) -> Result<T, E>) -> Result<T, E>
        where
            E: From<StoreError>,
        {
            f(&BrokenExecutor)
        }

        fn transaction<T, E>(
            &self,
            f: impl FnOnce(&dyn Executor) -> Result<T, E>,
        ) -> Result<T, E>
        where
            E: From<StoreError>,
        {
            f(&BrokenExecutor)
        }
    }

    #[test]
    fn table_creation_failure_is_a_schema_error() {
        let engine = MemoryEngine::new(BrokenStore);
        let err = engine.initialize().unwrap_err();
        assert_eq!(err.code(), "SCHEMA_ERROR");
    }

    #[test]
    fn store_failures_pass_through() {
        let engine = MemoryEngine::new(BrokenStore);
        let err = engine.create_entity(&entity("a", "node", &[])).unwrap_err();
        assert_eq!(err.code(), "STORE_ERROR");
        assert!(err.to_string().contains("read-only"));

        let outcome = engine.create_entities(vec![entity("a", "node", &[])]);
        assert!(outcome.succeeded.is_empty());
        assert_eq!(outcome.failed.len(), 1);
    }
}
