//! Database workflows: categorical encoding, combination uploads, cached
//! predictions, campaign upload ids and weekly option statistics.

use hrva_storage::DatabaseConfig;

pub mod campaign;
pub mod combinations;
pub mod encoding;
pub mod export;
pub mod predict;
pub mod weekly;

pub use campaign::init_campaign_upload;
pub use combinations::init_combinations_table;
pub use encoding::init_encode_table;
pub use export::export_weekly_median_parquet;
pub use predict::{init_custom_predict, PredictOutcome};
pub use weekly::{plans_data, weekly_median, weekly_options};

pub const CRATE_NAME: &str = "hrva-analytics";

/// The three databases the workflows talk to.
#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    /// Service database seeded by the init scripts (`POSTGRES_*`).
    pub vacancy: DatabaseConfig,
    /// Encoding, combinations and campaign tables (`DB_ML_*`).
    pub ml: DatabaseConfig,
    /// Upstream `av_lines`, `hv_lines` and `plans` (`DB_*`).
    pub prod: DatabaseConfig,
}

impl AnalyticsConfig {
    pub fn from_env() -> Self {
        Self {
            vacancy: DatabaseConfig::from_env("POSTGRES"),
            ml: DatabaseConfig::from_env("DB_ML"),
            prod: DatabaseConfig::from_env("DB"),
        }
    }
}
