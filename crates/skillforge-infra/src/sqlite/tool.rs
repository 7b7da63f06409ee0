//! SQL tools over the workspace database.
//!
//! `SqlToolInvoker` serves the `sql` namespace:
//!
//! - `sql.execute` `{ "sql": "...", "params": [...] }` runs a statement and
//!   returns `{ "rows_affected", "last_insert_id" }`
//! - `sql.query` `{ "sql": "...", "params": [...] }` returns the rows as an
//!   array of JSON objects
//!
//! When the caller's `ExecutionEnv` carries a `SqliteTransactionHandle`, the
//! statement runs inside that transaction so savepoint rollback covers it.
//! Otherwise it runs on the pool in autocommit mode.

use futures_util::future::BoxFuture;
use serde_json::{Map, Value, json};
use skillforge_core::engine::tool::ToolInvoker;
use skillforge_core::rollback::ExecutionEnv;
use skillforge_types::error::{ToolError, ToolErrorKind};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Executor, Row, Sqlite, SqlitePool, TypeInfo, ValueRef};

use super::transaction::SqliteTransactionHandle;

pub struct SqlToolInvoker {
    pool: SqlitePool,
}

impl SqlToolInvoker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn call(
        &self,
        tool: &str,
        params: Map<String, Value>,
        env: &ExecutionEnv,
    ) -> Result<Value, ToolError> {
        let query_mode = match tool {
            "sql.execute" => false,
            "sql.query" => true,
            other => return Err(ToolError::not_found(other)),
        };

        let sql = params.get("sql").and_then(Value::as_str).ok_or_else(|| {
            ToolError::new(ToolErrorKind::InvalidParams, "parameter 'sql' must be a string")
        })?;
        let binds: &[Value] = match params.get("params") {
            None | Some(Value::Null) => &[],
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ToolError::new(
                    ToolErrorKind::InvalidParams,
                    "parameter 'params' must be an array",
                ));
            }
        };

        let transaction = env
            .transaction
            .as_ref()
            .and_then(|t| t.as_any().downcast_ref::<SqliteTransactionHandle>());

        let result = match (transaction, query_mode) {
            (Some(tx), false) => tx.execute(sql, binds).await,
            (Some(tx), true) => tx.query(sql, binds).await,
            (None, false) => run_execute(&self.pool, sql, binds).await,
            (None, true) => run_query(&self.pool, sql, binds).await,
        };

        result.map_err(|e| {
            tracing::debug!(tool, error = %e, "sql tool failed");
            ToolError::execution(e.to_string())
        })
    }
}

impl ToolInvoker for SqlToolInvoker {
    fn invoke<'a>(
        &'a self,
        tool: &'a str,
        params: Map<String, Value>,
        env: &'a ExecutionEnv,
    ) -> BoxFuture<'a, Result<Value, ToolError>> {
        Box::pin(self.call(tool, params, env))
    }
}

// ---------------------------------------------------------------------------
// Helpers shared with the transaction handle
// ---------------------------------------------------------------------------

pub(crate) async fn run_execute<'e, E>(
    executor: E,
    sql: &'e str,
    params: &[Value],
) -> Result<Value, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let result = bind_params(sqlx::query(sql), params)
        .execute(executor)
        .await?;
    Ok(json!({
        "rows_affected": result.rows_affected(),
        "last_insert_id": result.last_insert_rowid(),
    }))
}

pub(crate) async fn run_query<'e, E>(
    executor: E,
    sql: &'e str,
    params: &[Value],
) -> Result<Value, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = bind_params(sqlx::query(sql), params)
        .fetch_all(executor)
        .await?;
    rows.iter()
        .map(row_to_json)
        .collect::<Result<Vec<_>, _>>()
        .map(Value::Array)
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.clone()),
            // Arrays and objects are stored as JSON text
            other => query.bind(other.to_string()),
        };
    }
    query
}

fn row_to_json(row: &SqliteRow) -> Result<Value, sqlx::Error> {
    let mut object = Map::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let type_name = raw.type_info().name().to_string();
            match type_name.as_str() {
                "INTEGER" => json!(row.try_get::<i64, _>(index)?),
                "BOOLEAN" => json!(row.try_get::<bool, _>(index)?),
                "REAL" => json!(row.try_get::<f64, _>(index)?),
                "BLOB" => json!(row.try_get::<Vec<u8>, _>(index)?),
                // Declared affinities such as NUMERIC or DATETIME
                _ => row
                    .try_get::<String, _>(index)
                    .map(Value::String)
                    .or_else(|_| row.try_get::<i64, _>(index).map(|v| json!(v)))
                    .or_else(|_| row.try_get::<f64, _>(index).map(|v| json!(v)))?,
            }
        };
        object.insert(column.name().to_string(), value);
    }
    Ok(Value::Object(object))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::tests::test_workspace;
    use std::sync::Arc;

    fn params(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    async fn invoker() -> SqlToolInvoker {
        let pool = test_workspace().await;
        sqlx::query(
            "CREATE TABLE quotes (id INTEGER PRIMARY KEY, partner TEXT NOT NULL, amount REAL, notes TEXT)",
        )
        .execute(&pool)
        .await
        .unwrap();
        SqlToolInvoker::new(pool)
    }

    #[tokio::test]
    async fn test_execute_then_query_autocommit() {
        let tools = invoker().await;
        let env = ExecutionEnv::default();

        let inserted = tools
            .invoke(
                "sql.execute",
                params(json!({
                    "sql": "INSERT INTO quotes (partner, amount) VALUES (?, ?)",
                    "params": ["Acme", 99.5]
                })),
                &env,
            )
            .await
            .unwrap();
        assert_eq!(inserted["rows_affected"], json!(1));
        assert_eq!(inserted["last_insert_id"], json!(1));

        let rows = tools
            .invoke(
                "sql.query",
                params(json!({ "sql": "SELECT id, partner, amount, notes FROM quotes" })),
                &env,
            )
            .await
            .unwrap();
        assert_eq!(
            rows,
            json!([{ "id": 1, "partner": "Acme", "amount": 99.5, "notes": null }])
        );
    }

    #[tokio::test]
    async fn test_runs_inside_env_transaction() {
        let tools = invoker().await;
        let tx = Arc::new(SqliteTransactionHandle::begin(&tools.pool).await.unwrap());
        let env = ExecutionEnv::default().with_transaction(tx.clone());

        tools
            .invoke(
                "sql.execute",
                params(json!({
                    "sql": "INSERT INTO quotes (partner) VALUES (?)",
                    "params": ["Acme"]
                })),
                &env,
            )
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        let rows = tools
            .invoke(
                "sql.query",
                params(json!({ "sql": "SELECT * FROM quotes" })),
                &ExecutionEnv::default(),
            )
            .await
            .unwrap();
        assert_eq!(rows, json!([]));
    }

    #[tokio::test]
    async fn test_errors_are_classified() {
        let tools = invoker().await;
        let env = ExecutionEnv::default();

        let missing = tools.invoke("sql.drop", Map::new(), &env).await.unwrap_err();
        assert_eq!(missing.kind, ToolErrorKind::NotFound);

        let no_sql = tools.invoke("sql.query", Map::new(), &env).await.unwrap_err();
        assert_eq!(no_sql.kind, ToolErrorKind::InvalidParams);

        let bad = tools
            .invoke(
                "sql.execute",
                params(json!({ "sql": "INSERT INTO quotes (amount) VALUES (1)" })),
                &env,
            )
            .await
            .unwrap_err();
        assert_eq!(bad.kind, ToolErrorKind::Execution);
        assert!(bad.message.contains("NOT NULL"));
    }
}
