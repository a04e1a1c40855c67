//! PostgreSQL warehouse sink
//!
//! Each table replacement runs in a single transaction: drop, create from
//! the dataset schema, then batched multi-row inserts. PostgreSQL DDL is
//! transactional, so concurrent readers keep seeing the old table until
//! commit.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use dwh_common::{Column, ColumnType, Dataset, Value};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use super::WarehouseSink;

/// PostgreSQL bind parameter ceiling per statement
const MAX_BIND_PARAMS: usize = 65_535;

/// Upper bound on rows per INSERT statement
const MAX_ROWS_PER_INSERT: usize = 1_000;

/// Writes datasets into a PostgreSQL schema
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
    schema: String,
}

impl PostgresSink {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }
}

#[async_trait]
impl WarehouseSink for PostgresSink {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn replace_table(&self, table: &str, dataset: &Dataset) -> Result<u64> {
        let qualified = self.qualified(table);
        let columns = &dataset.schema.columns;

        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.schema)))
            .execute(&mut *tx)
            .await
            .context("Failed to ensure target schema")?;

        sqlx::query(&format!("DROP TABLE IF EXISTS {}", qualified))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to drop {}", qualified))?;

        sqlx::query(&create_table_sql(&qualified, columns))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to create {}", qualified))?;

        let mut written = 0u64;
        if !columns.is_empty() && !dataset.rows.is_empty() {
            let chunk_size = rows_per_insert(columns.len());
            let total_chunks = dataset.rows.len().div_ceil(chunk_size);
            let column_list = columns
                .iter()
                .map(|c| quote_ident(&c.name))
                .collect::<Vec<_>>()
                .join(", ");

            for (chunk_idx, chunk) in dataset.rows.chunks(chunk_size).enumerate() {
                let mut query_builder: QueryBuilder<Postgres> =
                    QueryBuilder::new(format!("INSERT INTO {} ({}) ", qualified, column_list));

                query_builder.push_values(chunk.iter(), |mut b, row| {
                    for (column, value) in columns.iter().zip(row) {
                        match column.ty {
                            ColumnType::Integer => b.push_bind(as_i64(value)),
                            ColumnType::Float => b.push_bind(as_f64(value)),
                            ColumnType::Boolean => b.push_bind(as_bool(value)),
                            ColumnType::DateTime => b.push_bind(as_datetime(value)),
                            ColumnType::String | ColumnType::Null => b.push_bind(as_text(value)),
                        };
                    }
                });

                let result = query_builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .with_context(|| {
                        format!("Failed to insert chunk {}/{} into {}", chunk_idx + 1, total_chunks, qualified)
                    })?;
                written += result.rows_affected();

                debug!(
                    table,
                    chunk = chunk_idx + 1,
                    total_chunks,
                    rows = chunk.len(),
                    "Inserted chunk"
                );
            }
        }

        tx.commit()
            .await
            .with_context(|| format!("Failed to commit replacement of {}", qualified))?;

        info!(table = %qualified, rows = written, "Table replaced");
        Ok(written)
    }
}

fn create_table_sql(qualified: &str, columns: &[Column]) -> String {
    let definitions = columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), sql_type(c.ty)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({})", qualified, definitions)
}

fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::String | ColumnType::Null => "TEXT",
        ColumnType::Integer => "BIGINT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::DateTime => "TIMESTAMP",
    }
}

fn rows_per_insert(column_count: usize) -> usize {
    (MAX_BIND_PARAMS / column_count.max(1)).clamp(1, MAX_ROWS_PER_INSERT)
}

/// Double-quote an identifier, escaping embedded quotes
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn as_text(value: &Value) -> Option<String> {
    (!value.is_null()).then(|| value.to_string())
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

fn as_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::DateTime(dt) => Some(*dt),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use dwh_common::{DatasetName, Schema};

    #[test]
    fn test_create_table_sql_maps_types() {
        let columns = vec![
            Column::new("id", ColumnType::Integer),
            Column::new("price", ColumnType::Float),
            Column::new("created_at", ColumnType::DateTime),
            Column::new("note", ColumnType::Null),
        ];
        let sql = create_table_sql("\"public\".\"orders\"", &columns);
        assert_eq!(
            sql,
            "CREATE TABLE \"public\".\"orders\" (\"id\" BIGINT, \"price\" DOUBLE PRECISION, \
             \"created_at\" TIMESTAMP, \"note\" TEXT)"
        );
    }

    #[test]
    fn test_chunking_respects_bind_limit() {
        assert_eq!(rows_per_insert(5), MAX_ROWS_PER_INSERT);
        assert_eq!(rows_per_insert(100), 655);
        assert_eq!(rows_per_insert(70_000), 1);
        assert!(rows_per_insert(100) * 100 <= MAX_BIND_PARAMS);
    }

    #[test]
    fn test_identifiers_are_quoted() {
        assert_eq!(quote_ident("Unnamed: 0"), "\"Unnamed: 0\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_null_cells_bind_as_sql_null() {
        assert_eq!(as_text(&Value::Null), None);
        assert_eq!(as_text(&Value::Int(7)), Some("7".to_string()));
        assert_eq!(as_f64(&Value::Int(2)), Some(2.0));
        assert_eq!(as_i64(&Value::Null), None);
    }

    const TEST_SCHEMA: &str = "warehouse_test";

    fn dataset(columns: Vec<Column>, rows: Vec<Vec<Value>>) -> Dataset {
        Dataset::new(DatasetName::Orders, Schema::new(columns), rows)
    }

    fn numbered(count: usize) -> Dataset {
        dataset(
            vec![
                Column::new("id", ColumnType::Integer),
                Column::new("label", ColumnType::String),
            ],
            (0..count)
                .map(|i| vec![Value::Int(i as i64), Value::String(format!("row-{i}"))])
                .collect(),
        )
    }

    async fn column_types(pool: &PgPool, table: &str) -> Vec<(String, String)> {
        sqlx::query_as(
            "SELECT column_name::text, data_type::text FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
        )
        .bind(TEST_SCHEMA)
        .bind(table)
        .fetch_all(pool)
        .await
        .unwrap()
    }

    async fn row_count(pool: &PgPool, table: &str) -> i64 {
        sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {}.{}",
            quote_ident(TEST_SCHEMA),
            quote_ident(table)
        ))
        .fetch_one(pool)
        .await
        .unwrap()
    }

    #[sqlx::test(migrations = false)]
    #[ignore] // Requires database
    async fn test_replace_swaps_schema_and_rows(pool: PgPool) {
        let sink = PostgresSink::new(pool.clone(), TEST_SCHEMA);

        assert_eq!(sink.replace_table("orders", &numbered(3)).await.unwrap(), 3);

        let replacement = dataset(
            vec![
                Column::new("id", ColumnType::Integer),
                Column::new("total", ColumnType::Float),
                Column::new("paid", ColumnType::Boolean),
            ],
            vec![vec![Value::Int(9), Value::Float(12.5), Value::Bool(true)]],
        );
        assert_eq!(sink.replace_table("orders", &replacement).await.unwrap(), 1);

        assert_eq!(
            column_types(&pool, "orders").await,
            vec![
                ("id".to_string(), "bigint".to_string()),
                ("total".to_string(), "double precision".to_string()),
                ("paid".to_string(), "boolean".to_string()),
            ]
        );
        let row: (i64, f64, bool) = sqlx::query_as("SELECT id, total, paid FROM warehouse_test.orders")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row, (9, 12.5, true));
    }

    #[sqlx::test(migrations = false)]
    #[ignore] // Requires database
    async fn test_values_round_trip_with_nulls(pool: PgPool) {
        let sink = PostgresSink::new(pool.clone(), TEST_SCHEMA);
        let created = NaiveDate::from_ymd_opt(2023, 11, 22)
            .unwrap()
            .and_hms_opt(8, 30, 15)
            .unwrap();
        let data = dataset(
            vec![
                Column::new("id", ColumnType::Integer),
                Column::new("created_at", ColumnType::DateTime),
                Column::new("zip_code", ColumnType::String),
                Column::new("note", ColumnType::Null),
            ],
            vec![
                vec![Value::Int(1), Value::DateTime(created), Value::from("2134"), Value::Null],
                vec![Value::Null, Value::Null, Value::Null, Value::Null],
            ],
        );

        sink.replace_table("orders", &data).await.unwrap();

        assert_eq!(
            column_types(&pool, "orders").await,
            vec![
                ("id".to_string(), "bigint".to_string()),
                ("created_at".to_string(), "timestamp without time zone".to_string()),
                ("zip_code".to_string(), "text".to_string()),
                ("note".to_string(), "text".to_string()),
            ]
        );

        type Row = (Option<i64>, Option<NaiveDateTime>, Option<String>, Option<String>);
        let rows: Vec<Row> = sqlx::query_as(
            "SELECT id, created_at, zip_code, note FROM warehouse_test.orders ORDER BY id NULLS LAST",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(
            rows,
            vec![
                (Some(1), Some(created), Some("2134".to_string()), None),
                (None, None, None, None),
            ]
        );
    }

    #[sqlx::test(migrations = false)]
    #[ignore] // Requires database
    async fn test_rows_beyond_one_chunk_are_all_written(pool: PgPool) {
        let sink = PostgresSink::new(pool.clone(), TEST_SCHEMA);
        let count = MAX_ROWS_PER_INSERT * 2 + 345;

        let written = sink.replace_table("orders", &numbered(count)).await.unwrap();

        assert_eq!(written, count as u64);
        assert_eq!(row_count(&pool, "orders").await, count as i64);
        let last: String = sqlx::query_scalar("SELECT label FROM warehouse_test.orders WHERE id = $1")
            .bind((count - 1) as i64)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(last, format!("row-{}", count - 1));
    }

    #[sqlx::test(migrations = false)]
    #[ignore] // Requires database
    async fn test_failed_insert_keeps_previous_table(pool: PgPool) {
        let sink = PostgresSink::new(pool.clone(), TEST_SCHEMA);
        sink.replace_table("orders", &numbered(5)).await.unwrap();

        // PostgreSQL text cannot hold NUL, so the second chunk is rejected
        let mut broken = numbered(MAX_ROWS_PER_INSERT + 10);
        broken.rows[MAX_ROWS_PER_INSERT + 3][1] = Value::from("bad\0label");

        let err = sink.replace_table("orders", &broken).await.unwrap_err();
        assert!(format!("{err:#}").contains("chunk 2/2"));

        assert_eq!(row_count(&pool, "orders").await, 5);
        assert_eq!(
            column_types(&pool, "orders").await,
            vec![
                ("id".to_string(), "bigint".to_string()),
                ("label".to_string(), "text".to_string()),
            ]
        );
    }
}
