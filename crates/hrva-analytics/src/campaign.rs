//! `campaign_upload` sequence of upload ids.

use anyhow::Context;
use hrva_core::{CampaignUpload, Origin, CAMPAIGN_UPLOAD_TABLE};
use hrva_storage::Database;
use tracing::{debug, info, instrument};

pub fn campaign_upload_table_create_query() -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {CAMPAIGN_UPLOAD_TABLE} (
            id SERIAL PRIMARY KEY,
            campaign_id TEXT,
            client_id INTEGER,
            origin TEXT,
            upload_id INTEGER
        );"#
    )
}

/// Next id after the highest `upload_id` across the whole table.
pub fn next_upload_id(max_upload_id: Option<i32>) -> i32 {
    max_upload_id.map(|max| max + 1).unwrap_or(1)
}

/// Register a campaign upload and return it with its freshly assigned `upload_id`.
#[instrument(skip(db))]
pub async fn init_campaign_upload(
    db: &Database,
    campaign_id: &str,
    client_id: i32,
    origin: Origin,
) -> anyhow::Result<CampaignUpload> {
    db.ensure_table(CAMPAIGN_UPLOAD_TABLE, &campaign_upload_table_create_query())
        .await?;

    let max_id: Option<i32> = sqlx::query_scalar(&format!(
        "SELECT MAX(upload_id) AS max_id FROM {CAMPAIGN_UPLOAD_TABLE}"
    ))
    .fetch_one(db.pool())
    .await
    .context("reading max upload_id")?;
    let upload_id = next_upload_id(max_id);
    debug!(upload_id, "next upload_id");

    sqlx::query(&format!(
        "INSERT INTO {CAMPAIGN_UPLOAD_TABLE} (campaign_id, client_id, origin, upload_id) \
         VALUES ($1, $2, $3, $4)"
    ))
    .bind(campaign_id)
    .bind(client_id)
    .bind(origin.as_str())
    .bind(upload_id)
    .execute(db.pool())
    .await
    .context("inserting campaign_upload entry")?;

    info!(campaign_id, client_id, %origin, upload_id, "inserted campaign_upload entry");
    Ok(CampaignUpload {
        campaign_id: campaign_id.to_string(),
        client_id,
        origin,
        upload_id,
    })
}
