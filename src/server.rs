use std::path::PathBuf;

use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::memory::MemoryEngine;
use crate::response::{ErrorCode, ToolResponse};
use crate::store::{
    Conditions, ExecOutcome, Inserted, SqliteStore, Store, StoreError, TableSpec,
};
use crate::tools::database::{
    CreateTableArgs, DeleteRecordsArgs, ExecuteSqlArgs, ExportTableArgs, ImportRecordsArgs,
    InsertRecordsArgs, QueryRecordsArgs, TableArgs, UpdateRecordsArgs,
};
use crate::tools::graph::{
    AddObservationsArgs, CreateEntitiesArgs, DeleteEntitiesArgs, DeleteObservationsArgs,
    OpenNodesArgs, RelationsArgs, SearchNodesArgs,
};
use crate::transfer::{self, TransferError};

pub type SqliteMemory = MemoryEngine<SqliteStore>;

#[derive(Clone)]
pub struct MemoryServer {
    engine: SqliteMemory,
    /// Import and export files must live under this directory.
    transfer_root: PathBuf,
    tool_router: ToolRouter<Self>,
}

impl MemoryServer {
    pub fn new(engine: SqliteMemory, transfer_root: PathBuf) -> Self {
        Self {
            engine,
            transfer_root,
            tool_router: Self::tool_router(),
        }
    }

    fn server_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "sqlite-memory-mcp-rs".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                title: Some("SQLite Memory".to_string()),
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Knowledge graph memory plus direct access to the backing SQLite database.\n\
                Graph: entities (unique name, entityType, ordered observations) linked by directed relations (from, to, relationType).\n\
                Batch graph tools are best-effort: failed items are listed under data.failed with an error code, the rest are applied.\n\
                Deleting an entity deletes every relation touching it.\n\
                Every tool answers { success, data?, error?, message }; error carries a code such as UNKNOWN_ENTITY."
                    .to_string(),
            ),
        }
    }

    /// Runs store work off the async runtime.
    async fn blocking<T, F>(&self, f: F) -> Result<T, McpError>
    where
        F: FnOnce(&SqliteMemory) -> T + Send + 'static,
        T: Send + 'static,
    {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(internal_err("Store task failed"))
    }
}

#[tool_router]
impl MemoryServer {
    #[tool(
        name = "create_entities",
        description = "Create entities in the knowledge graph. Names must be unique; duplicates and invalid items are skipped and reported under data.failed."
    )]
    async fn create_entities(
        &self,
        Parameters(CreateEntitiesArgs { entities }): Parameters<CreateEntitiesArgs>,
    ) -> Result<CallToolResult, McpError> {
        let outcome = self
            .blocking(move |engine| engine.create_entities(entities))
            .await?;
        success(
            batch_message("Created", "entities", outcome.succeeded.len(), outcome.failed.len()),
            &outcome,
        )
    }

    #[tool(
        name = "create_relations",
        description = "Create directed relations between existing entities. Relations with a missing endpoint are skipped and reported under data.failed."
    )]
    async fn create_relations(
        &self,
        Parameters(RelationsArgs { relations }): Parameters<RelationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let outcome = self
            .blocking(move |engine| engine.create_relations(relations))
            .await?;
        success(
            batch_message("Created", "relations", outcome.succeeded.len(), outcome.failed.len()),
            &outcome,
        )
    }

    #[tool(
        name = "add_observations",
        description = "Append observations to existing entities, in order. Unknown entities are skipped and reported under data.failed."
    )]
    async fn add_observations(
        &self,
        Parameters(AddObservationsArgs { observations }): Parameters<AddObservationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let outcome = self
            .blocking(move |engine| engine.add_observations(observations))
            .await?;
        success(
            batch_message("Updated", "entities", outcome.succeeded.len(), outcome.failed.len()),
            &outcome,
        )
    }

    #[tool(
        name = "delete_entities",
        description = "Delete entities and every relation that starts or ends at them. Missing names are ignored."
    )]
    async fn delete_entities(
        &self,
        Parameters(DeleteEntitiesArgs { entity_names }): Parameters<DeleteEntitiesArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .blocking(move |engine| engine.delete_entities(&entity_names))
            .await?;
        respond("delete_entities", result, |summary| {
            format!(
                "Deleted {} entities and {} relations",
                summary.entities, summary.relations
            )
        })
    }

    #[tool(
        name = "delete_observations",
        description = "Remove every occurrence of the given observation values from entities. Unknown entities are skipped and reported under data.failed."
    )]
    async fn delete_observations(
        &self,
        Parameters(DeleteObservationsArgs { deletions }): Parameters<DeleteObservationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let outcome = self
            .blocking(move |engine| engine.delete_observations(deletions))
            .await?;
        success(
            batch_message("Updated", "entities", outcome.succeeded.len(), outcome.failed.len()),
            &outcome,
        )
    }

    #[tool(
        name = "delete_relations",
        description = "Delete relations matching (from, to, relationType) exactly. Every matching duplicate is removed."
    )]
    async fn delete_relations(
        &self,
        Parameters(RelationsArgs { relations }): Parameters<RelationsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let result = self
            .blocking(move |engine| engine.delete_relations(&relations))
            .await?;
        respond(
            "delete_relations",
            result.map(|deleted| json!({ "deleted": deleted })),
            |data| format!("Deleted {} relations", data["deleted"]),
        )
    }

    #[tool(
        name = "read_graph",
        description = "Return the whole knowledge graph: every entity and every relation."
    )]
    async fn read_graph(&self) -> Result<CallToolResult, McpError> {
        let result = self.blocking(|engine| engine.read_graph()).await?;
        respond("read_graph", result, |graph| {
            format!(
                "Graph has {} entities and {} relations",
                graph.entities.len(),
                graph.relations.len()
            )
        })
    }

    #[tool(
        name = "search_nodes",
        description = "Case-insensitive substring search. Entities match on name, type or observations; relations match on type or endpoint names."
    )]
    async fn search_nodes(
        &self,
        Parameters(SearchNodesArgs { query }): Parameters<SearchNodesArgs>,
    ) -> Result<CallToolResult, McpError> {
        let needle = query.clone();
        let result = self
            .blocking(move |engine| engine.search_nodes(&needle))
            .await?;
        respond("search_nodes", result, |graph| {
            format!(
                "Found {} entities and {} relations matching '{}'",
                graph.entities.len(),
                graph.relations.len(),
                query
            )
        })
    }

    #[tool(
        name = "open_nodes",
        description = "Fetch entities by exact name. Names that do not exist are listed under data.failed."
    )]
    async fn open_nodes(
        &self,
        Parameters(OpenNodesArgs { names }): Parameters<OpenNodesArgs>,
    ) -> Result<CallToolResult, McpError> {
        let outcome = self.blocking(move |engine| engine.open_nodes(names)).await?;
        success(
            batch_message("Opened", "entities", outcome.succeeded.len(), outcome.failed.len()),
            &outcome,
        )
    }

    #[tool(
        name = "create_table",
        description = "Create a table if it does not exist. Columns take name, type (TEXT, INTEGER, REAL, BLOB, VARCHAR(n), ...), primaryKey, autoincrement, notNull, unique, default."
    )]
    async fn create_table(
        &self,
        Parameters(CreateTableArgs { table, columns }): Parameters<CreateTableArgs>,
    ) -> Result<CallToolResult, McpError> {
        let spec = TableSpec::new(table.clone(), columns);
        let result = self
            .blocking(move |engine| engine.store().read(|db| db.create_table(&spec)))
            .await?;
        respond(
            "create_table",
            result.map(|()| json!({ "table": table })),
            |data| format!("Table {} ready", data["table"]),
        )
    }

    #[tool(name = "list_tables", description = "List user tables in the database.")]
    async fn list_tables(&self) -> Result<CallToolResult, McpError> {
        let result = self
            .blocking(|engine| engine.store().read(|db| db.list_tables()))
            .await?;
        respond("list_tables", result, |tables| format!("{} tables", tables.len()))
    }

    #[tool(
        name = "describe_table",
        description = "Describe the columns of a table: name, type, notNull, defaultValue, primaryKey."
    )]
    async fn describe_table(
        &self,
        Parameters(TableArgs { table }): Parameters<TableArgs>,
    ) -> Result<CallToolResult, McpError> {
        let name = table.clone();
        let result = self
            .blocking(move |engine| engine.store().read(|db| db.describe_table(&name)))
            .await?;
        respond("describe_table", result, |columns| {
            format!("Table '{}' has {} columns", table, columns.len())
        })
    }

    #[tool(name = "drop_table", description = "Drop a table if it exists.")]
    async fn drop_table(
        &self,
        Parameters(TableArgs { table }): Parameters<TableArgs>,
    ) -> Result<CallToolResult, McpError> {
        let name = table.clone();
        let result = self
            .blocking(move |engine| engine.store().read(|db| db.drop_table(&name)))
            .await?;
        respond(
            "drop_table",
            result.map(|()| json!({ "table": table })),
            |data| format!("Dropped table {}", data["table"]),
        )
    }

    #[tool(
        name = "insert_records",
        description = "Insert records (objects of column to value) into a table. All records are inserted or none."
    )]
    async fn insert_records(
        &self,
        Parameters(InsertRecordsArgs { table, records }): Parameters<InsertRecordsArgs>,
    ) -> Result<CallToolResult, McpError> {
        if records.is_empty() {
            return failure(
                "insert_records",
                &StoreError::InvalidRequest("records cannot be empty".to_string()),
            );
        }
        let result = self
            .blocking(move |engine| engine.store().transaction(|db| db.insert(&table, &records)))
            .await?;
        respond("insert_records", result, |inserted: &Inserted| {
            format!("Inserted {} records", inserted.count)
        })
    }

    #[tool(
        name = "query_records",
        description = "Select rows from a table. Optional equality conditions (null matches IS NULL), orderBy, descending, limit, offset."
    )]
    async fn query_records(
        &self,
        Parameters(args): Parameters<QueryRecordsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let (table, conditions, options) = args.split();
        let result = self
            .blocking(move |engine| {
                engine
                    .store()
                    .read(|db| db.query(&table, &conditions, &options))
            })
            .await?;
        respond("query_records", result, |rows| format!("Returned {} rows", rows.len()))
    }

    #[tool(
        name = "update_records",
        description = "Set fields on every row matching the equality conditions. Conditions must not be empty."
    )]
    async fn update_records(
        &self,
        Parameters(UpdateRecordsArgs {
            table,
            conditions,
            fields,
        }): Parameters<UpdateRecordsArgs>,
    ) -> Result<CallToolResult, McpError> {
        if conditions.is_empty() {
            return failure(
                "update_records",
                &StoreError::InvalidRequest("conditions cannot be empty".to_string()),
            );
        }
        let conditions = Conditions::from(conditions);
        let result = self
            .blocking(move |engine| {
                engine
                    .store()
                    .read(|db| db.update(&table, &conditions, &fields))
            })
            .await?;
        respond(
            "update_records",
            result.map(|updated| json!({ "updated": updated })),
            |data| format!("Updated {} rows", data["updated"]),
        )
    }

    #[tool(
        name = "delete_records",
        description = "Delete every row matching the equality conditions. Conditions must not be empty."
    )]
    async fn delete_records(
        &self,
        Parameters(DeleteRecordsArgs { table, conditions }): Parameters<DeleteRecordsArgs>,
    ) -> Result<CallToolResult, McpError> {
        if conditions.is_empty() {
            return failure(
                "delete_records",
                &StoreError::InvalidRequest("conditions cannot be empty".to_string()),
            );
        }
        let conditions = Conditions::from(conditions);
        let result = self
            .blocking(move |engine| engine.store().read(|db| db.delete(&table, &conditions)))
            .await?;
        respond(
            "delete_records",
            result.map(|deleted| json!({ "deleted": deleted })),
            |data| format!("Deleted {} rows", data["deleted"]),
        )
    }

    #[tool(
        name = "execute_sql",
        description = "Execute one SQL statement with positional parameters. Queries return rows; other statements return the affected row count."
    )]
    async fn execute_sql(
        &self,
        Parameters(ExecuteSqlArgs { sql, params }): Parameters<ExecuteSqlArgs>,
    ) -> Result<CallToolResult, McpError> {
        debug!("execute_sql: {}", sql);
        let result = self
            .blocking(move |engine| engine.store().read(|db| db.execute(&sql, &params)))
            .await?;
        match result {
            Ok(ExecOutcome::Rows(rows)) => {
                success(format!("Returned {} rows", rows.len()), &json!({ "rows": rows }))
            }
            Ok(ExecOutcome::Affected(count)) => {
                success(format!("{} rows affected", count), &json!({ "affected": count }))
            }
            Err(err) => failure("execute_sql", &err),
        }
    }

    #[tool(
        name = "export_table",
        description = "Export a whole table as json, csv or sql (INSERT statements). Returned inline, or written to outputPath (relative to, and confined to, the database directory)."
    )]
    async fn export_table(
        &self,
        Parameters(ExportTableArgs {
            table,
            format,
            output_path,
        }): Parameters<ExportTableArgs>,
    ) -> Result<CallToolResult, McpError> {
        let name = table.clone();
        let root = self.transfer_root.clone();
        let result = self
            .blocking(move |engine| -> Result<Value, TransferError> {
                let content = engine
                    .store()
                    .read(|db| transfer::export_table(db, &name, format))?;
                match output_path {
                    Some(path) => {
                        let path = transfer::resolve_transfer_path(&root, &path)?;
                        transfer::write_export(&path, &content)?;
                        Ok(json!({ "path": path.display().to_string(), "bytes": content.len() }))
                    }
                    None => Ok(json!({ "content": content })),
                }
            })
            .await?;
        respond("export_table", result, |_| format!("Exported table '{}'", table))
    }

    #[tool(
        name = "import_records",
        description = "Import json (array of objects) or csv (header row) into an existing table, from inline content or inputPath (confined to the database directory). All rows are imported or none."
    )]
    async fn import_records(
        &self,
        Parameters(ImportRecordsArgs {
            table,
            format,
            content,
            input_path,
        }): Parameters<ImportRecordsArgs>,
    ) -> Result<CallToolResult, McpError> {
        let root = self.transfer_root.clone();
        let result = self
            .blocking(move |engine| -> Result<Inserted, TransferError> {
                let content = match (content, input_path) {
                    (Some(content), None) => content,
                    (None, Some(path)) => {
                        std::fs::read_to_string(transfer::resolve_transfer_path(&root, &path)?)?
                    }
                    _ => {
                        return Err(TransferError::InvalidContent(
                            "give exactly one of content or inputPath".to_string(),
                        ));
                    }
                };
                engine
                    .store()
                    .transaction(|db| transfer::import_records(db, &table, format, &content))
            })
            .await?;
        respond("import_records", result, |inserted| {
            format!("Imported {} records", inserted.count)
        })
    }
}

#[tool_handler]
impl ServerHandler for MemoryServer {
    fn get_info(&self) -> ServerInfo {
        self.server_info()
    }
}

fn internal_err<T: ToString>(message: &'static str) -> impl FnOnce(T) -> McpError + Clone {
    move |err| McpError::internal_error(message, Some(json!({ "error": err.to_string() })))
}

fn success<T: Serialize>(message: impl Into<String>, value: &T) -> Result<CallToolResult, McpError> {
    let data = serde_json::to_value(value).map_err(internal_err("Failed to serialize result"))?;
    Ok(ToolResponse::ok(message, data).into_call_result())
}

fn failure(tool: &str, error: &impl ErrorCode) -> Result<CallToolResult, McpError> {
    warn!("{}: {} ({})", tool, error, error.code());
    Ok(ToolResponse::failure(error).into_call_result())
}

fn respond<T: Serialize, E: ErrorCode>(
    tool: &str,
    result: Result<T, E>,
    message: impl FnOnce(&T) -> String,
) -> Result<CallToolResult, McpError> {
    match result {
        Ok(value) => success(message(&value), &value),
        Err(err) => failure(tool, &err),
    }
}

fn batch_message(verb: &str, noun: &str, succeeded: usize, failed: usize) -> String {
    if failed == 0 {
        format!("{} {} {}", verb, succeeded, noun)
    } else {
        format!("{} {} {}, {} failed", verb, succeeded, noun, failed)
    }
}
