//! Weekly option aggregates over `av_lines` / `hv_lines` and plan summaries.

use anyhow::Context;
use chrono::NaiveDate;
use hrva_core::{
    weekly_window, DateWindow, Origin, PlanSummary, WeeklyMedian, WeeklyOptions, EXCLUDED_PROFILE,
};
use hrva_storage::Database;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{info, instrument};

/// Source columns feeding `options`, `options_2` and `options_3`.
struct OptionColumns {
    options: &'static str,
    options_2: &'static str,
    options_3: &'static str,
}

fn option_columns(origin: Origin) -> OptionColumns {
    match origin {
        Origin::Av => OptionColumns {
            options: "lines.publication",
            options_2: "0",
            options_3: "lines.services_price",
        },
        Origin::Hv => OptionColumns {
            options: "lines.publications_standart",
            options_2: "lines.publications_standart_plus",
            options_3: "lines.publications_standart_premium",
        },
    }
}

/// Per-week sums for one client. Only short postings (`days < 11`) that start
/// and end inside the window count, and the catch-all profile is excluded.
pub fn weekly_options_query(origin: Origin, client_id: i32, window: &DateWindow) -> String {
    let columns = option_columns(origin);
    let table = origin.lines_table();
    let date_from = window.date_from.format("%Y-%m-%d");
    let date_to = window.date_to.format("%Y-%m-%d");
    format!(
        r#"
        SELECT
            t_lines.client_id
          , t_lines.city
          , t_lines.profile
          , t_lines.week_year
          , SUM(t_lines.options)::float8   AS options
          , SUM(t_lines.options_2)::float8 AS options_2
          , SUM(t_lines.options_3)::float8 AS options_3
        FROM
            (SELECT
                lines.client_id::bigint AS client_id
              , lines.region::text      AS city
              , lines."profile"::text   AS profile
              , to_char(lines.date_from::date, 'IW')::int AS week_year
              , {options}   AS options
              , {options_2} AS options_2
              , {options_3} AS options_3
            FROM {table} AS lines
            WHERE 1=1
              AND lines.client_id = {client_id}
              AND lines.days < 11
              AND LOWER(lines."profile") <> '{EXCLUDED_PROFILE}'
              AND lines.date_from >= '{date_from}'
              AND lines.date_to < '{date_to}'
            ) AS t_lines
        GROUP BY
            t_lines.client_id
          , t_lines.city
          , t_lines.profile
          , t_lines.week_year
        ORDER BY
            t_lines.city
          , t_lines.profile
          , t_lines.week_year
        "#,
        options = columns.options,
        options_2 = columns.options_2,
        options_3 = columns.options_3,
    )
}

fn weekly_options_row(origin: Origin, row: &PgRow) -> Result<WeeklyOptions, sqlx::Error> {
    Ok(WeeklyOptions {
        client_id: row.try_get("client_id")?,
        origin,
        city: row.try_get("city")?,
        profile: row.try_get("profile")?,
        week_year: row.try_get("week_year")?,
        options: row.try_get("options")?,
        options_2: row.try_get("options_2")?,
        options_3: row.try_get("options_3")?,
    })
}

#[instrument(skip(db))]
pub async fn weekly_options(
    db: &Database,
    origin: Origin,
    client_id: i32,
    prediction_date: NaiveDate,
) -> anyhow::Result<Vec<WeeklyOptions>> {
    let window = weekly_window(prediction_date);
    let rows = db
        .fetch_all(&weekly_options_query(origin, client_id, &window))
        .await
        .with_context(|| format!("loading weekly {origin} options for client {client_id}"))?;
    let weekly = rows
        .iter()
        .map(|row| weekly_options_row(origin, row))
        .collect::<Result<Vec<_>, _>>()
        .context("decoding weekly options")?;
    info!(
        rows = weekly.len(),
        date_from = %window.date_from,
        date_to = %window.date_to,
        "loaded weekly options"
    );
    Ok(weekly)
}

pub async fn av_weekly_options(
    db: &Database,
    client_id: i32,
    prediction_date: NaiveDate,
) -> anyhow::Result<Vec<WeeklyOptions>> {
    weekly_options(db, Origin::Av, client_id, prediction_date).await
}

pub async fn hv_weekly_options(
    db: &Database,
    client_id: i32,
    prediction_date: NaiveDate,
) -> anyhow::Result<Vec<WeeklyOptions>> {
    weekly_options(db, Origin::Hv, client_id, prediction_date).await
}

/// Median weekly options per client, origin, city and profile over the eight
/// weeks before the prediction date.
pub async fn weekly_median(
    db: &Database,
    client_id: i32,
    origin: Origin,
    prediction_date: NaiveDate,
) -> anyhow::Result<Vec<WeeklyMedian>> {
    let weekly = weekly_options(db, origin, client_id, prediction_date).await?;
    Ok(hrva_core::weekly_median(&weekly))
}

pub fn plans_query(client_id: i32, upload_id: i32) -> String {
    format!(
        r#"
        SELECT
            p.client_id::bigint     AS client_id
          , p.upload::bigint        AS upload_id
          , p.real_profile::text    AS profile
          , p.real_location::text   AS city
          , COUNT(DISTINCT p.object_id) AS objects_count
        FROM
            plans AS p
        WHERE 1=1
            AND p.client_id = {client_id}
            AND p.upload = {upload_id}
        GROUP BY
            p.client_id
          , p.upload
          , p.real_profile
          , p.real_location
        "#
    )
}

pub async fn plans_data(
    db: &Database,
    client_id: i32,
    upload_id: i32,
) -> anyhow::Result<Vec<PlanSummary>> {
    let rows = db
        .fetch_all(&plans_query(client_id, upload_id))
        .await
        .with_context(|| format!("loading plans for client {client_id} upload {upload_id}"))?;
    rows.iter()
        .map(|row| -> Result<PlanSummary, sqlx::Error> {
            Ok(PlanSummary {
                client_id: row.try_get("client_id")?,
                upload_id: row.try_get("upload_id")?,
                profile: row.try_get("profile")?,
                city: row.try_get("city")?,
                objects_count: row.try_get("objects_count")?,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .context("decoding plans")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> DateWindow {
        weekly_window(NaiveDate::from_ymd_opt(2025, 9, 22).unwrap())
    }

    #[test]
    fn av_query_maps_publication_and_services_price() {
        let sql = weekly_options_query(Origin::Av, 132, &window());
        assert!(sql.contains("FROM av_lines AS lines"));
        assert!(sql.contains("lines.publication   AS options"));
        assert!(sql.contains("0 AS options_2"));
        assert!(sql.contains("lines.services_price AS options_3"));
        assert!(sql.contains("AND lines.client_id = 132"));
        assert!(sql.contains("AND lines.date_from >= '2025-07-28'"));
        assert!(sql.contains("AND lines.date_to < '2025-09-22'"));
        assert!(sql.contains("LOWER(lines.\"profile\") <> 'другое'"));
    }

    #[test]
    fn hv_query_maps_standard_publications() {
        let sql = weekly_options_query(Origin::Hv, 7, &window());
        assert!(sql.contains("FROM hv_lines AS lines"));
        assert!(sql.contains("lines.publications_standart   AS options"));
        assert!(sql.contains("lines.publications_standart_plus AS options_2"));
        assert!(sql.contains("lines.publications_standart_premium AS options_3"));
        assert!(sql.contains("AND lines.days < 11"));
    }

    #[test]
    fn plans_query_filters_by_upload() {
        let sql = plans_query(132, 434);
        assert!(sql.contains("AND p.client_id = 132"));
        assert!(sql.contains("AND p.upload = 434"));
        assert!(sql.contains("COUNT(DISTINCT p.object_id) AS objects_count"));
    }
}
