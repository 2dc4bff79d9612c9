//! Upload-scoped `combinations_<client_id>_<origin>` tables.

use anyhow::Context;
use hrva_core::{
    combinations_table_name, validate_client_id, validate_upload_id, CombinationRecord, Origin,
    StoredCombination,
};
use hrva_storage::Database;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use tracing::{debug, instrument, warn};

pub fn combinations_table_create_query(client_id: i32, origin: Origin) -> String {
    let table_name = combinations_table_name(client_id, origin);
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table_name} (
            id SERIAL PRIMARY KEY,
            client_id INTEGER,
            origin TEXT,
            upload_id INTEGER,
            city TEXT,
            profile TEXT,
            options INTEGER,
            options_2 INTEGER,
            options_3 INTEGER,
            callbacks INTEGER
        );"#
    )
}

/// Rows of one upload; binds `$1 = upload_id`.
pub fn upload_rows_query(table_name: &str) -> String {
    format!(
        "SELECT id, client_id, origin, upload_id, city, profile, \
         options, options_2, options_3, callbacks \
         FROM {table_name} WHERE upload_id = $1 ORDER BY id"
    )
}

/// Binds `$1 = upload_id`.
pub fn delete_upload_query(table_name: &str) -> String {
    format!("DELETE FROM {table_name} WHERE upload_id = $1")
}

fn insert_query(table_name: &str) -> String {
    format!(
        "INSERT INTO {table_name} (\
            client_id, origin, upload_id, city, profile, \
            options, options_2, options_3, callbacks\
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
    )
}

pub(crate) fn stored_combination(row: &PgRow) -> Result<StoredCombination, sqlx::Error> {
    Ok(StoredCombination {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        origin: row.try_get("origin")?,
        upload_id: row.try_get("upload_id")?,
        city: row.try_get("city")?,
        profile: row.try_get("profile")?,
        options: row.try_get("options")?,
        options_2: row.try_get("options_2")?,
        options_3: row.try_get("options_3")?,
        callbacks: row.try_get("callbacks")?,
    })
}

pub async fn ensure_combinations_table(
    db: &Database,
    client_id: i32,
    origin: Origin,
) -> anyhow::Result<String> {
    let table_name = combinations_table_name(client_id, origin);
    db.ensure_table(&table_name, &combinations_table_create_query(client_id, origin))
        .await?;
    Ok(table_name)
}

pub async fn upload_rows(
    db: &Database,
    client_id: i32,
    origin: Origin,
    upload_id: i32,
) -> anyhow::Result<Vec<StoredCombination>> {
    let table_name = combinations_table_name(client_id, origin);
    let rows = sqlx::query(&upload_rows_query(&table_name))
        .bind(upload_id)
        .fetch_all(db.pool())
        .await
        .with_context(|| format!("reading upload {upload_id} from {table_name}"))?;
    rows.iter()
        .map(stored_combination)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("decoding {table_name}"))
}

pub async fn delete_upload(
    db: &Database,
    client_id: i32,
    origin: Origin,
    upload_id: i32,
) -> anyhow::Result<u64> {
    let table_name = combinations_table_name(client_id, origin);
    let result = sqlx::query(&delete_upload_query(&table_name))
        .bind(upload_id)
        .execute(db.pool())
        .await
        .with_context(|| format!("deleting upload {upload_id} from {table_name}"))?;
    Ok(result.rows_affected())
}

async fn insert_rows(
    conn: &mut PgConnection,
    table_name: &str,
    client_id: i32,
    origin: Origin,
    records: &[CombinationRecord],
) -> anyhow::Result<()> {
    let sql = insert_query(table_name);
    for record in records {
        sqlx::query(&sql)
            .bind(client_id)
            .bind(origin.as_str())
            .bind(record.upload_id)
            .bind(record.city.as_deref())
            .bind(record.profile.as_deref())
            .bind(record.options)
            .bind(record.options_2)
            .bind(record.options_3)
            .bind(record.callbacks)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting into {table_name}"))?;
    }
    Ok(())
}

/// Append records to the client/origin table as they are, in one transaction.
pub async fn insert_combinations(
    db: &Database,
    client_id: i32,
    origin: Origin,
    records: &[CombinationRecord],
) -> anyhow::Result<String> {
    validate_client_id(client_id)?;
    let table_name = combinations_table_name(client_id, origin);
    if records.is_empty() {
        warn!(table = %table_name, "no records to insert");
        return Ok(table_name);
    }

    let mut tx = db.pool().begin().await.context("opening transaction")?;
    insert_rows(&mut *tx, &table_name, client_id, origin, records).await?;
    tx.commit().await.context("committing combinations")?;

    debug!(table = %table_name, inserted = records.len(), "inserted records");
    Ok(table_name)
}

/// Replace upload `upload_id` of the client/origin table with `records`.
///
/// The table is created on first use. Existing rows of the upload are deleted
/// and the records inserted with `upload_id` forced to the given id; delete and
/// insert share a transaction. Returns the input records unchanged.
#[instrument(skip(db, records), fields(count = records.len()))]
pub async fn init_combinations_table(
    db: &Database,
    records: Vec<CombinationRecord>,
    client_id: i32,
    origin: Origin,
    upload_id: i32,
) -> anyhow::Result<Vec<CombinationRecord>> {
    validate_client_id(client_id)?;
    validate_upload_id(upload_id)?;

    let table_name = ensure_combinations_table(db, client_id, origin).await?;

    let stamped = with_upload_id(&records, upload_id);

    let mut tx = db.pool().begin().await.context("opening transaction")?;

    let existing = sqlx::query(&upload_rows_query(&table_name))
        .bind(upload_id)
        .fetch_all(&mut *tx)
        .await
        .with_context(|| format!("reading upload {upload_id} from {table_name}"))?;
    if !existing.is_empty() {
        sqlx::query(&delete_upload_query(&table_name))
            .bind(upload_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("deleting upload {upload_id} from {table_name}"))?;
        debug!(table = %table_name, deleted = existing.len(), "replaced previous upload rows");
    }

    if stamped.is_empty() {
        warn!(table = %table_name, "no records to insert");
    } else {
        insert_rows(&mut *tx, &table_name, client_id, origin, &stamped).await?;
    }
    tx.commit().await.context("committing upload")?;

    debug!(table = %table_name, inserted = stamped.len(), "inserted records");
    Ok(records)
}

/// Copies of `records` tagged with `upload_id`, whatever id they carried.
pub fn with_upload_id(records: &[CombinationRecord], upload_id: i32) -> Vec<CombinationRecord> {
    records
        .iter()
        .cloned()
        .map(|record| CombinationRecord {
            upload_id: Some(upload_id),
            ..record
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrva_core::created_table_name;

    #[test]
    fn create_query_is_per_client_and_origin() {
        let sql = combinations_table_create_query(118, Origin::Hv);
        assert_eq!(created_table_name(&sql).unwrap(), "combinations_118_hv");
        assert!(sql.contains("callbacks INTEGER"));
    }

    #[test]
    fn upload_queries_bind_the_upload_id() {
        let table = combinations_table_name(7, Origin::Av);
        assert_eq!(
            delete_upload_query(&table),
            "DELETE FROM combinations_7_av WHERE upload_id = $1"
        );
        let select = upload_rows_query(&table);
        assert!(select.starts_with("SELECT id, client_id, origin, upload_id"));
        assert!(select.contains("FROM combinations_7_av WHERE upload_id = $1"));
        assert!(insert_query(&table).contains("VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"));
    }

    #[test]
    fn records_are_stamped_with_the_target_upload() {
        let record = CombinationRecord {
            upload_id: Some(99),
            city: Some("Казань".into()),
            profile: Some("Picker".into()),
            options: Some(2),
            options_2: Some(0),
            options_3: Some(600),
            callbacks: Some(7),
        };
        let untagged = CombinationRecord {
            upload_id: None,
            ..record.clone()
        };
        let input = vec![record.clone(), untagged];

        let stamped = with_upload_id(&input, 3);
        assert!(stamped.iter().all(|r| r.upload_id == Some(3)));
        assert_eq!(stamped[0].callbacks, Some(7));
        assert_eq!(input[0].upload_id, Some(99));
        assert_eq!(input[1].upload_id, None);
    }
}
