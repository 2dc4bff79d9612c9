//! Incremental categorical encoding into `encoding_<column>` tables.

use anyhow::Context;
use hrva_core::{encoding_table_name, plan_new_encodings, EncodedValue, EncodingRun};
use hrva_storage::Database;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, instrument, warn};

pub fn encoding_table_create_query(table_name: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table_name} (
            id SERIAL PRIMARY KEY,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
            original_value TEXT NOT NULL UNIQUE,
            encoded_value INTEGER NOT NULL,
            run_id INTEGER NOT NULL,
            run_timestamp TEXT NOT NULL
        );
        "#
    )
}

/// Create `encoding_<column>` if needed and return its name.
pub async fn ensure_encoding_table(db: &Database, column_name: &str) -> anyhow::Result<String> {
    let table_name = encoding_table_name(column_name)?;
    db.ensure_table(&table_name, &encoding_table_create_query(&table_name))
        .await?;
    Ok(table_name)
}

pub async fn load_encoding_table(db: &Database, table_name: &str) -> anyhow::Result<Vec<EncodedValue>> {
    let sql = format!(
        "SELECT id, created_at, original_value, encoded_value, run_id, run_timestamp \
         FROM {table_name} ORDER BY encoded_value"
    );
    let rows = db
        .fetch_all(&sql)
        .await
        .with_context(|| format!("loading {table_name}"))?;
    let values = rows
        .iter()
        .map(encoded_value)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("decoding {table_name}"))?;
    debug!(table = %table_name, rows = values.len(), "loaded encoding table");
    Ok(values)
}

fn encoded_value(row: &PgRow) -> Result<EncodedValue, sqlx::Error> {
    Ok(EncodedValue {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        original_value: row.try_get("original_value")?,
        encoded_value: row.try_get("encoded_value")?,
        run_id: row.try_get("run_id")?,
        run_timestamp: row.try_get("run_timestamp")?,
    })
}

/// Insert `(original_value, encoded_value)` pairs stamped with the run.
pub async fn insert_encodings(
    db: &Database,
    table_name: &str,
    records: &[(String, i32)],
    run: &EncodingRun,
) -> anyhow::Result<usize> {
    if records.is_empty() {
        warn!(table = %table_name, "no records to insert");
        return Ok(0);
    }

    let sql = format!(
        "INSERT INTO {table_name} (original_value, encoded_value, run_id, run_timestamp) \
         VALUES ($1, $2, $3, $4)"
    );
    let mut tx = db.pool().begin().await.context("opening transaction")?;
    for (original, encoded) in records {
        sqlx::query(&sql)
            .bind(original)
            .bind(encoded)
            .bind(run.run_id)
            .bind(&run.run_timestamp)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting {original:?} into {table_name}"))?;
    }
    tx.commit().await.context("committing encodings")?;

    debug!(table = %table_name, inserted = records.len(), "inserted encoded values");
    Ok(records.len())
}

/// Encode the values of `uniques` not yet present in `encoding_<column>` and
/// return the whole table afterwards. Re-running with the same values writes
/// nothing.
#[instrument(skip(db, uniques, run), fields(run_id = run.run_id))]
pub async fn init_encode_table(
    db: &Database,
    uniques: &[String],
    column_name: &str,
    run: &EncodingRun,
) -> anyhow::Result<Vec<EncodedValue>> {
    let table_name = ensure_encoding_table(db, column_name).await?;

    let existing = load_encoding_table(db, &table_name).await?;
    debug!(existing = existing.len(), "got existing encoded values");

    let records = plan_new_encodings(&existing, uniques);
    debug!(new = records.len(), "determined new values");
    if records.is_empty() {
        debug!("no new values to encode");
        return Ok(existing);
    }
    debug!(next_code = records[0].1, "next starting code");

    insert_encodings(db, &table_name, &records, run).await?;
    load_encoding_table(db, &table_name).await
}
