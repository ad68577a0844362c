use serde::Serialize;
use serde_json::Value as JsonValue;

/// A value bound as a statement parameter.
#[derive(Debug, Clone)]
pub enum DbValue {
    /// NULL value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed 64-bit integer (BIGINT / BIGSERIAL ids)
    Int64(i64),
    /// Unsigned 64-bit integer (stored as BIGINT, e.g. block heights)
    Uint64(u64),
    /// Text
    Text(String),
    /// 32-byte word: hashes, storage keys and values (stored as BYTEA)
    Bytes32([u8; 32]),
    /// JSONB value
    JsonB(JsonValue),
}

impl DbValue {
    /// Create a JSONB value from any serializable type.
    pub fn jsonb<T: Serialize>(value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => DbValue::JsonB(value),
            Err(e) => {
                tracing::error!("Failed to serialize JSONB parameter: {}", e);
                DbValue::Null
            }
        }
    }
}

/// Write operation executed inside a transaction by `DbPool::execute_transaction`.
#[derive(Debug, Clone)]
pub enum DbOperation {
    /// INSERT with ON CONFLICT. An empty `update_columns` turns the
    /// conflict arm into `DO NOTHING`, which is how idempotent inserts
    /// are expressed.
    Upsert {
        table: String,
        columns: Vec<String>,
        values: Vec<DbValue>,
        /// Columns that form the unique constraint
        conflict_columns: Vec<String>,
        /// Columns to update on conflict
        update_columns: Vec<String>,
    },
    /// UPDATE with WHERE clause
    Update {
        table: String,
        set_columns: Vec<(String, DbValue)>,
        where_clause: WhereClause,
    },
    /// DELETE with WHERE clause
    Delete {
        table: String,
        where_clause: WhereClause,
    },
}

/// WHERE clause for UPDATE and DELETE operations.
#[derive(Debug, Clone)]
pub enum WhereClause {
    /// column = value
    Eq(String, DbValue),
}
