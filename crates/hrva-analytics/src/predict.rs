//! Custom prediction lookup against previously uploaded combinations.

use anyhow::Context;
use hrva_core::{
    prediction_lookups, round_options_step, PredictionInput, PredictionLookup, StoredCombination,
};
use hrva_storage::Database;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::combinations::stored_combination;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PredictOutcome {
    pub found: bool,
    pub rows: Vec<PredictionInput>,
}

/// Lookup for the first complete row. Later rows are never looked up.
pub fn first_lookup(rows: &[PredictionInput]) -> Option<PredictionLookup> {
    prediction_lookups(rows).into_iter().next()
}

/// Copy the first non-null `callbacks` of `matches` onto every row. No match,
/// or only null `callbacks`, means no prediction was found.
pub fn attach_callbacks(mut rows: Vec<PredictionInput>, matches: &[StoredCombination]) -> PredictOutcome {
    let Some(callbacks) = matches.iter().find_map(|m| m.callbacks) else {
        return PredictOutcome { found: false, rows };
    };
    for row in &mut rows {
        row.callbacks = Some(callbacks);
    }
    PredictOutcome { found: true, rows }
}

/// Round the request rows, look up the first complete row in its
/// combinations table and, when a pre-saved prediction exists, copy its
/// `callbacks` onto every row.
#[instrument(skip(db, rows), fields(count = rows.len()))]
pub async fn init_custom_predict(
    db: &Database,
    rows: Vec<PredictionInput>,
) -> anyhow::Result<PredictOutcome> {
    let rows = round_options_step(rows)?;

    let Some(lookup) = first_lookup(&rows) else {
        info!("no complete row to build a lookup from");
        return Ok(PredictOutcome { found: false, rows });
    };
    info!(table = %lookup.table_name, city = %lookup.city, profile = %lookup.profile, "lookup");

    let matches = sqlx::query(&lookup.sql())
        .bind(lookup.options)
        .bind(lookup.options_2)
        .bind(lookup.options_3)
        .bind(&lookup.profile)
        .bind(&lookup.city)
        .bind(lookup.upload_id)
        .fetch_all(db.pool())
        .await
        .with_context(|| format!("looking up prediction in {}", lookup.table_name))?
        .iter()
        .map(stored_combination)
        .collect::<Result<Vec<StoredCombination>, _>>()
        .with_context(|| format!("decoding {}", lookup.table_name))?;

    let outcome = attach_callbacks(rows, &matches);
    if outcome.found {
        info!(matches = matches.len(), "pre-saved prediction exists");
    } else {
        error!(matches = matches.len(), "no prediction pre-saved for this combination");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hrva_core::Origin;

    fn row(city: Option<&str>, options: i32) -> PredictionInput {
        PredictionInput {
            client_id: Some(118),
            origin: Origin::Av,
            profile: Some("Sales Assistant".into()),
            city: city.map(Into::into),
            options: Some(options),
            options_2: Some(0),
            options_3: Some(600),
            upload_id: Some(2),
            callbacks: None,
        }
    }

    fn stored(id: i32, callbacks: Option<i32>) -> StoredCombination {
        StoredCombination {
            id,
            client_id: Some(118),
            origin: Some("av".into()),
            upload_id: Some(2),
            city: Some("Казань".into()),
            profile: Some("Sales Assistant".into()),
            options: Some(2),
            options_2: Some(0),
            options_3: Some(600),
            callbacks,
        }
    }

    #[test]
    fn only_the_first_complete_row_is_looked_up() {
        let rows = vec![row(None, 1), row(Some("Казань"), 2), row(Some("Москва"), 3)];
        let lookup = first_lookup(&rows).expect("complete row");
        assert_eq!(lookup.city, "Казань");
        assert_eq!(lookup.options, 2);
        assert_eq!(lookup.table_name, "combinations_118_av");

        assert!(first_lookup(&[row(None, 1)]).is_none());
    }

    #[test]
    fn first_non_null_callbacks_is_copied_to_every_row() {
        let rows = vec![row(Some("Казань"), 2), row(None, 5)];
        let outcome = attach_callbacks(rows, &[stored(1, None), stored(2, Some(7)), stored(3, Some(9))]);
        assert!(outcome.found);
        assert!(outcome.rows.iter().all(|r| r.callbacks == Some(7)));
    }

    #[test]
    fn all_null_callbacks_count_as_not_found() {
        let outcome = attach_callbacks(vec![row(Some("Казань"), 2)], &[stored(1, None), stored(2, None)]);
        assert!(!outcome.found);
        assert_eq!(outcome.rows[0].callbacks, None);

        let empty = attach_callbacks(vec![row(Some("Казань"), 2)], &[]);
        assert!(!empty.found);
    }
}
