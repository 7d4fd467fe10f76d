use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::{ColumnSpec, Conditions, QueryOptions};
use crate::transfer::{ExportFormat, ImportFormat};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CreateTableArgs {
    pub table: String,
    pub columns: Vec<ColumnSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TableArgs {
    pub table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InsertRecordsArgs {
    pub table: String,
    /// Objects mapping column name to value
    pub records: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryRecordsArgs {
    pub table: String,
    /// Column equality tests joined with AND; null tests IS NULL
    #[serde(default)]
    pub conditions: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    #[serde(default)]
    pub descending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

impl QueryRecordsArgs {
    pub fn split(self) -> (String, Conditions, QueryOptions) {
        let options = QueryOptions {
            order_by: self.order_by,
            descending: self.descending,
            limit: self.limit,
            offset: self.offset,
        };
        (self.table, Conditions::from(self.conditions), options)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdateRecordsArgs {
    pub table: String,
    /// Must not be empty
    pub conditions: Map<String, Value>,
    pub fields: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DeleteRecordsArgs {
    pub table: String,
    /// Must not be empty
    pub conditions: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteSqlArgs {
    /// A single SQL statement; use ?1, ?2... for parameters
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportTableArgs {
    pub table: String,
    pub format: ExportFormat,
    /// Write the export to this file instead of returning it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecordsArgs {
    pub table: String,
    pub format: ImportFormat,
    /// Inline data; give this or `inputPath`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_path: Option<String>,
}
