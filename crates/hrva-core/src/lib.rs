//! Core domain model for HR vacancy analytics: origins, dynamic table naming,
//! categorical encoding, combination uploads, cached-prediction lookups and
//! weekly option statistics.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod agent;

pub use agent::{AgentError, AgentResult, QueryAgent, StubAgent};

pub const CRATE_NAME: &str = "hrva-core";

pub const CAMPAIGN_UPLOAD_TABLE: &str = "campaign_upload";

/// Cities that round `options_3` with the coarse step.
pub const MAJOR_CITIES: [&str; 2] = ["москва", "санкт-петербург"];
pub const MAJOR_CITY_STEP: i32 = 2000;
pub const DEFAULT_CITY_STEP: i32 = 300;

/// Profile value excluded from weekly statistics.
pub const EXCLUDED_PROFILE: &str = "другое";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("invalid origin: {0}. Expected \"av\" or \"hv\"")]
    InvalidOrigin(String),
    #[error("invalid identifier {0:?}: expected [a-z_][a-z0-9_]*")]
    InvalidIdentifier(String),
    #[error("query does not contain a valid CREATE TABLE IF NOT EXISTS statement")]
    MissingCreateTable,
    #[error("client_id must be positive, got {0}")]
    InvalidClientId(i32),
    #[error("upload_id must be positive, got {0}")]
    InvalidUploadId(i32),
    #[error("invalid prediction date {0:?}: expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("options_3 = {value} cannot be rounded up to a multiple of {step}")]
    OptionsOutOfRange { value: i32, step: i32 },
}

/// Upstream posting system a row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Origin {
    Av,
    Hv,
}

impl Origin {
    pub fn as_str(self) -> &'static str {
        match self {
            Origin::Av => "av",
            Origin::Hv => "hv",
        }
    }

    /// Upstream table holding this origin's raw posting lines.
    pub fn lines_table(self) -> &'static str {
        match self {
            Origin::Av => "av_lines",
            Origin::Hv => "hv_lines",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Origin {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "av" => Ok(Origin::Av),
            "hv" => Ok(Origin::Hv),
            _ => Err(DomainError::InvalidOrigin(s.to_string())),
        }
    }
}

impl TryFrom<String> for Origin {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Origin> for String {
    fn from(origin: Origin) -> Self {
        origin.as_str().to_string()
    }
}

/// Accepts the unquoted identifiers Postgres folds to lowercase.
pub fn validate_identifier(name: &str) -> Result<&str, DomainError> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_head && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(name)
    } else {
        Err(DomainError::InvalidIdentifier(name.to_string()))
    }
}

pub fn encoding_table_name(column_name: &str) -> Result<String, DomainError> {
    let column = validate_identifier(column_name)?;
    Ok(format!("encoding_{}", column.to_ascii_lowercase()))
}

pub fn combinations_table_name(client_id: i32, origin: Origin) -> String {
    format!("combinations_{client_id}_{origin}")
}

/// Table name targeted by a `CREATE TABLE IF NOT EXISTS <name>` statement.
pub fn created_table_name(create_sql: &str) -> Result<String, DomainError> {
    let pattern = Regex::new(r"(?i)CREATE TABLE IF NOT EXISTS\s+(\w+)")
        .map_err(|_| DomainError::MissingCreateTable)?;
    pattern
        .captures(create_sql)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or(DomainError::MissingCreateTable)
}

pub fn validate_client_id(client_id: i32) -> Result<i32, DomainError> {
    if client_id > 0 {
        Ok(client_id)
    } else {
        Err(DomainError::InvalidClientId(client_id))
    }
}

pub fn validate_upload_id(upload_id: i32) -> Result<i32, DomainError> {
    if upload_id > 0 {
        Ok(upload_id)
    } else {
        Err(DomainError::InvalidUploadId(upload_id))
    }
}

// === encoding

/// Ingestion run that stamps every code it assigns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingRun {
    pub run_id: i32,
    pub run_timestamp: String,
}

/// Row of an `encoding_<column>` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedValue {
    pub id: i32,
    pub created_at: Option<NaiveDateTime>,
    pub original_value: String,
    pub encoded_value: i32,
    pub run_id: i32,
    pub run_timestamp: String,
}

/// New `(original_value, code)` pairs for values the table has not seen yet.
///
/// Codes continue from the highest existing code, or start at 1. Input order
/// is preserved and repeated input values are encoded once.
pub fn plan_new_encodings(existing: &[EncodedValue], uniques: &[String]) -> Vec<(String, i32)> {
    let mut seen: HashSet<&str> = existing.iter().map(|e| e.original_value.as_str()).collect();
    let next_code = existing
        .iter()
        .map(|e| e.encoded_value)
        .max()
        .map(|max| max + 1)
        .unwrap_or(1);

    let mut planned = Vec::new();
    for value in uniques {
        if seen.insert(value.as_str()) {
            let code = next_code + planned.len() as i32;
            planned.push((value.clone(), code));
        }
    }
    planned
}

// === combinations

/// Uploaded combination row; `upload_id` is overwritten by the upload being written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinationRecord {
    #[serde(default)]
    pub upload_id: Option<i32>,
    pub city: Option<String>,
    pub profile: Option<String>,
    pub options: Option<i32>,
    pub options_2: Option<i32>,
    pub options_3: Option<i32>,
    pub callbacks: Option<i32>,
}

/// Row of a `combinations_<client_id>_<origin>` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCombination {
    pub id: i32,
    pub client_id: Option<i32>,
    pub origin: Option<String>,
    pub upload_id: Option<i32>,
    pub city: Option<String>,
    pub profile: Option<String>,
    pub options: Option<i32>,
    pub options_2: Option<i32>,
    pub options_3: Option<i32>,
    pub callbacks: Option<i32>,
}

/// Campaign registration; `upload_id` is assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignUpload {
    pub campaign_id: String,
    pub client_id: i32,
    pub origin: Origin,
    pub upload_id: i32,
}

// === custom predict

/// Input row of a custom prediction request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionInput {
    pub client_id: Option<i32>,
    pub origin: Origin,
    pub profile: Option<String>,
    pub city: Option<String>,
    pub options: Option<i32>,
    pub options_2: Option<i32>,
    pub options_3: Option<i32>,
    pub upload_id: Option<i32>,
    #[serde(default)]
    pub callbacks: Option<i32>,
}

pub fn options_step(city: &str) -> i32 {
    let city = city.to_lowercase();
    if MAJOR_CITIES.contains(&city.as_str()) {
        MAJOR_CITY_STEP
    } else {
        DEFAULT_CITY_STEP
    }
}

/// Smallest multiple of `step` that is `>= value`, or `None` when it does not fit in `i32`.
pub fn round_up_to_step(value: i32, step: i32) -> Option<i32> {
    let step = i64::from(step);
    let rounded = (i64::from(value) + step - 1).div_euclid(step) * step;
    i32::try_from(rounded).ok()
}

/// Round `options_3` of `av` rows up to the city step. Missing values count as 0.
pub fn round_options_step(mut rows: Vec<PredictionInput>) -> Result<Vec<PredictionInput>, DomainError> {
    for row in rows.iter_mut().filter(|r| r.origin == Origin::Av) {
        let step = options_step(row.city.as_deref().unwrap_or_default());
        let value = row.options_3.unwrap_or(0);
        let rounded =
            round_up_to_step(value, step).ok_or(DomainError::OptionsOutOfRange { value, step })?;
        row.options_3 = Some(rounded);
    }
    Ok(rows)
}

/// Exact-match lookup of a pre-saved prediction in a combinations table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionLookup {
    pub table_name: String,
    pub profile: String,
    pub city: String,
    pub options: i32,
    pub options_2: i32,
    pub options_3: i32,
    pub upload_id: i32,
}

impl PredictionLookup {
    /// `None` when any key column of the row is missing.
    pub fn from_input(row: &PredictionInput) -> Option<Self> {
        Some(Self {
            table_name: combinations_table_name(row.client_id?, row.origin),
            profile: row.profile.clone()?,
            city: row.city.clone()?,
            options: row.options?,
            options_2: row.options_2?,
            options_3: row.options_3?,
            upload_id: row.upload_id?,
        })
    }

    /// Binds, in order: options, options_2, options_3, profile, city, upload_id.
    pub fn sql(&self) -> String {
        format!(
            "SELECT id, client_id, origin, upload_id, city, profile, \
             options, options_2, options_3, callbacks \
             FROM {} \
             WHERE options = $1 AND options_2 = $2 AND options_3 = $3 \
             AND profile = $4 AND city = $5 AND upload_id = $6",
            self.table_name
        )
    }
}

pub fn prediction_lookups(rows: &[PredictionInput]) -> Vec<PredictionLookup> {
    rows.iter().filter_map(PredictionLookup::from_input).collect()
}

// === weekly statistics

/// Half-open date range `[date_from, date_to)` covering eight full ISO weeks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

/// Eight weeks ending at the Monday of the prediction date's week.
pub fn weekly_window(prediction_date: NaiveDate) -> DateWindow {
    let offset = i64::from(prediction_date.weekday().num_days_from_monday());
    let week_start = prediction_date - Duration::days(offset);
    DateWindow {
        date_from: week_start - Duration::weeks(8),
        date_to: week_start,
    }
}

pub fn parse_prediction_date(input: &str) -> Result<NaiveDate, DomainError> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d")
        .map_err(|_| DomainError::InvalidDate(input.to_string()))
}

/// Summed option counts for one client/origin/city/profile/ISO week.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyOptions {
    pub client_id: Option<i64>,
    pub origin: Origin,
    pub city: Option<String>,
    pub profile: Option<String>,
    pub week_year: Option<i32>,
    pub options: Option<f64>,
    pub options_2: Option<f64>,
    pub options_3: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyMedian {
    pub client_id: Option<i64>,
    pub origin: Origin,
    pub city: Option<String>,
    pub profile: Option<String>,
    pub median_options: Option<f64>,
    pub median_options_2: Option<f64>,
    pub median_options_3: Option<f64>,
}

/// Distinct planned objects per profile and location of one upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub client_id: Option<i64>,
    pub upload_id: Option<i64>,
    pub profile: Option<String>,
    pub city: Option<String>,
    pub objects_count: i64,
}

/// Median ignoring missing and NaN values.
pub fn median(values: &[Option<f64>]) -> Option<f64> {
    let mut present: Vec<f64> = values.iter().flatten().copied().filter(|v| !v.is_nan()).collect();
    if present.is_empty() {
        return None;
    }
    present.sort_by(f64::total_cmp);
    let mid = present.len() / 2;
    if present.len() % 2 == 0 {
        Some((present[mid - 1] + present[mid]) / 2.0)
    } else {
        Some(present[mid])
    }
}

/// Sorts `None` after every present value.
type NoneLast<T> = (bool, Option<T>);

fn none_last<T>(value: Option<T>) -> NoneLast<T> {
    (value.is_none(), value)
}

type MedianKey = (NoneLast<i64>, Origin, NoneLast<String>, NoneLast<String>);

/// Median of the weekly sums per client, origin, city and profile. Rows with
/// missing keys are grouped together rather than dropped, and their groups
/// sort after the named ones.
pub fn weekly_median(rows: &[WeeklyOptions]) -> Vec<WeeklyMedian> {
    let mut groups: BTreeMap<MedianKey, [Vec<Option<f64>>; 3]> = BTreeMap::new();
    for row in rows {
        let key = (
            none_last(row.client_id),
            row.origin,
            none_last(row.city.clone()),
            none_last(row.profile.clone()),
        );
        let entry = groups.entry(key).or_default();
        entry[0].push(row.options);
        entry[1].push(row.options_2);
        entry[2].push(row.options_3);
    }

    groups
        .into_iter()
        .map(|(((_, client_id), origin, (_, city), (_, profile)), values)| WeeklyMedian {
            client_id,
            origin,
            city,
            profile,
            median_options: median(&values[0]),
            median_options_2: median(&values[1]),
            median_options_3: median(&values[2]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: &str, code: i32) -> EncodedValue {
        EncodedValue {
            id: code,
            created_at: None,
            original_value: value.to_string(),
            encoded_value: code,
            run_id: 1,
            run_timestamp: "2025-09-22T00:00:00".into(),
        }
    }

    fn av_row(city: &str, options_3: Option<i32>) -> PredictionInput {
        PredictionInput {
            client_id: Some(118),
            origin: Origin::Av,
            profile: Some("Sales Assistant".into()),
            city: Some(city.into()),
            options: Some(3),
            options_2: Some(0),
            options_3,
            upload_id: Some(1),
            callbacks: None,
        }
    }

    fn weekly(city: &str, week: i32, options: f64) -> WeeklyOptions {
        WeeklyOptions {
            client_id: Some(132),
            origin: Origin::Hv,
            city: Some(city.into()),
            profile: Some("Cashier".into()),
            week_year: Some(week),
            options: Some(options),
            options_2: Some(options * 2.0),
            options_3: None,
        }
    }

    #[test]
    fn origin_parses_case_insensitively() {
        assert_eq!("AV".parse::<Origin>().unwrap(), Origin::Av);
        assert_eq!(" hv ".parse::<Origin>().unwrap(), Origin::Hv);
        assert_eq!(
            "zz".parse::<Origin>(),
            Err(DomainError::InvalidOrigin("zz".into()))
        );
        let json = serde_json::to_string(&Origin::Hv).unwrap();
        assert_eq!(json, "\"hv\"");
        let back: Origin = serde_json::from_str("\"Av\"").unwrap();
        assert_eq!(back, Origin::Av);
    }

    #[test]
    fn dynamic_table_names() {
        assert_eq!(combinations_table_name(118, Origin::Av), "combinations_118_av");
        assert_eq!(encoding_table_name("City").unwrap(), "encoding_city");
        assert!(encoding_table_name("city; DROP TABLE x").is_err());
        assert!(encoding_table_name("1city").is_err());
        assert!(encoding_table_name("").is_err());
    }

    #[test]
    fn created_table_name_is_extracted_case_insensitively() {
        let sql = "\n  create table if not exists encoding_profile (\n id SERIAL PRIMARY KEY);";
        assert_eq!(created_table_name(sql).unwrap(), "encoding_profile");
        assert_eq!(
            created_table_name("CREATE TABLE plain (id int)"),
            Err(DomainError::MissingCreateTable)
        );
    }

    #[test]
    fn new_encodings_continue_from_max_code() {
        let existing = vec![encoded("москва", 1), encoded("казань", 7)];
        let uniques = vec![
            "казань".to_string(),
            "сочи".to_string(),
            "омск".to_string(),
            "сочи".to_string(),
        ];
        let planned = plan_new_encodings(&existing, &uniques);
        assert_eq!(planned, vec![("сочи".to_string(), 8), ("омск".to_string(), 9)]);
    }

    #[test]
    fn new_encodings_start_at_one_for_empty_table() {
        let planned = plan_new_encodings(&[], &["a".to_string(), "b".to_string()]);
        assert_eq!(planned, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert!(plan_new_encodings(&[encoded("a", 1)], &["a".to_string()]).is_empty());
    }

    #[test]
    fn rounding_uses_city_dependent_step() {
        assert_eq!(round_up_to_step(1, 300), Some(300));
        assert_eq!(round_up_to_step(300, 300), Some(300));
        assert_eq!(round_up_to_step(301, 300), Some(600));
        assert_eq!(round_up_to_step(0, 2000), Some(0));
        assert_eq!(round_up_to_step(-5, 300), Some(0));
        assert_eq!(options_step("Москва"), 2000);
        assert_eq!(options_step("САНКТ-ПЕТЕРБУРГ"), 2000);
        assert_eq!(options_step("Казань"), 300);
    }

    #[test]
    fn round_options_step_only_touches_av_rows() {
        let mut hv = av_row("Казань", Some(301));
        hv.origin = Origin::Hv;
        let rows = round_options_step(vec![
            av_row("Москва", Some(2500)),
            av_row("Казань", Some(301)),
            av_row("Казань", None),
            hv,
        ])
        .unwrap();
        let rounded: Vec<_> = rows.iter().map(|r| r.options_3).collect();
        assert_eq!(rounded, vec![Some(4000), Some(600), Some(0), Some(301)]);
    }

    #[test]
    fn rounding_near_i32_max_is_an_error_not_a_wrap() {
        assert_eq!(round_up_to_step(i32::MAX - 10, 300), None);
        assert_eq!(round_up_to_step(i32::MAX, 1), Some(i32::MAX));
        let largest_multiple = i32::MAX - i32::MAX % 300;
        assert_eq!(round_up_to_step(largest_multiple - 1, 300), Some(largest_multiple));

        let err = round_options_step(vec![av_row("Казань", Some(i32::MAX - 10))]).unwrap_err();
        assert_eq!(
            err,
            DomainError::OptionsOutOfRange {
                value: i32::MAX - 10,
                step: 300
            }
        );

        let mut hv = av_row("Казань", Some(i32::MAX - 10));
        hv.origin = Origin::Hv;
        let rows = round_options_step(vec![hv]).unwrap();
        assert_eq!(rows[0].options_3, Some(i32::MAX - 10));
    }

    #[test]
    fn lookups_skip_rows_with_missing_keys() {
        let mut incomplete = av_row("Казань", Some(300));
        incomplete.profile = None;
        let rows = vec![incomplete, av_row("Москва", Some(2000))];
        let lookups = prediction_lookups(&rows);
        assert_eq!(lookups.len(), 1);
        assert_eq!(lookups[0].table_name, "combinations_118_av");
        assert_eq!(lookups[0].city, "Москва");
        assert!(lookups[0].sql().contains("FROM combinations_118_av"));
        assert!(lookups[0].sql().contains("upload_id = $6"));
    }

    #[test]
    fn weekly_window_spans_eight_weeks_before_monday() {
        let monday = parse_prediction_date("2025-09-22").unwrap();
        let wednesday = parse_prediction_date("2025-09-24").unwrap();
        let expected = DateWindow {
            date_from: NaiveDate::from_ymd_opt(2025, 7, 28).unwrap(),
            date_to: NaiveDate::from_ymd_opt(2025, 9, 22).unwrap(),
        };
        assert_eq!(weekly_window(monday), expected);
        assert_eq!(weekly_window(wednesday), expected);
        let sunday = parse_prediction_date("2025-09-28").unwrap();
        assert_eq!(weekly_window(sunday), expected);
        assert!(parse_prediction_date("22.09.2025").is_err());
    }

    #[test]
    fn median_ignores_missing_values() {
        assert_eq!(median(&[Some(3.0), None, Some(1.0), Some(2.0)]), Some(2.0));
        assert_eq!(median(&[Some(4.0), Some(1.0), Some(3.0), Some(2.0)]), Some(2.5));
        assert_eq!(median(&[None, Some(f64::NAN)]), None);
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn weekly_median_groups_by_city_and_profile() {
        let mut no_city = weekly("x", 30, 10.0);
        no_city.city = None;
        let rows = vec![
            weekly("Омск", 31, 1.0),
            weekly("Казань", 30, 4.0),
            weekly("Казань", 31, 6.0),
            weekly("Казань", 32, 20.0),
            no_city,
        ];
        let medians = weekly_median(&rows);
        assert_eq!(medians.len(), 3);

        let kazan = &medians[0];
        assert_eq!(kazan.city.as_deref(), Some("Казань"));
        assert_eq!(kazan.median_options, Some(6.0));
        assert_eq!(kazan.median_options_2, Some(12.0));
        assert_eq!(kazan.median_options_3, None);

        assert_eq!(medians[1].city.as_deref(), Some("Омск"));

        assert_eq!(medians[2].city, None);
        assert_eq!(medians[2].median_options, Some(10.0));
    }

    #[test]
    fn ids_must_be_positive() {
        assert!(validate_client_id(118).is_ok());
        assert_eq!(validate_client_id(0), Err(DomainError::InvalidClientId(0)));
        assert_eq!(validate_upload_id(-1), Err(DomainError::InvalidUploadId(-1)));
    }
}
