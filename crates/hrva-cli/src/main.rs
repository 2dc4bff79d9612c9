use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use hrva_analytics::AnalyticsConfig;
use hrva_core::{parse_prediction_date, CombinationRecord, EncodingRun, Origin, PredictionInput};
use hrva_storage::{run_plan, Database, DatabaseConfig, ScriptPlan};
use serde::{de::DeserializeOwned, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hrva-cli")]
#[command(about = "HR vacancy analytics command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target {
    /// Service database (`POSTGRES_*`).
    Vacancy,
    /// Encoding, combinations and campaign tables (`DB_ML_*`).
    Ml,
    /// Upstream lines and plans (`DB_*`).
    Prod,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Run the init SQL scripts against the service database.
    InitDb {
        #[arg(long, default_value = "db/init.yaml")]
        plan: PathBuf,
    },
    CheckDb {
        #[arg(long, value_enum, default_value_t = Target::Vacancy)]
        target: Target,
    },
    Tables {
        #[arg(long, value_enum, default_value_t = Target::Vacancy)]
        target: Target,
    },
    WeeklyMedian {
        #[arg(long)]
        client_id: i32,
        #[arg(long)]
        origin: Origin,
        #[arg(long, value_parser = parse_prediction_date)]
        prediction_date: NaiveDate,
        /// Write the result as Parquet instead of printing it.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Plans {
        #[arg(long)]
        client_id: i32,
        #[arg(long)]
        upload_id: i32,
    },
    CampaignUpload {
        #[arg(long)]
        campaign_id: String,
        #[arg(long)]
        client_id: i32,
        #[arg(long)]
        origin: Origin,
    },
    UploadCombinations {
        #[arg(long)]
        client_id: i32,
        #[arg(long)]
        origin: Origin,
        #[arg(long)]
        upload_id: i32,
        /// JSON array of combination rows.
        #[arg(long)]
        input: PathBuf,
    },
    Encode {
        #[arg(long)]
        column: String,
        /// JSON array of distinct values.
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        run_id: i32,
        #[arg(long)]
        run_timestamp: String,
    },
    Predict {
        /// JSON array of prediction rows.
        #[arg(long)]
        input: PathBuf,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn database_config(config: &AnalyticsConfig, target: Target) -> &DatabaseConfig {
    match target {
        Target::Vacancy => &config.vacancy,
        Target::Ml => &config.ml,
        Target::Prod => &config.prod,
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = AnalyticsConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            hrva_web::serve_from_env().await?;
        }
        Commands::InitDb { plan } => {
            let plan = if plan.exists() {
                ScriptPlan::load(&plan).await?
            } else {
                info!(plan = %plan.display(), "plan file not found, using default scripts");
                ScriptPlan::default()
            };
            let db = Database::connect(&config.vacancy).await?;
            let outcomes = run_plan(&db, Path::new("."), &plan).await?;
            db.close().await;
            print_json(&outcomes)?;
        }
        Commands::CheckDb { target } => {
            let db = Database::connect_lazy(database_config(&config, target))?;
            let ok = db.check_connection().await;
            print_json(&serde_json::json!({ "target": format!("{target:?}").to_lowercase(), "ok": ok }))?;
            if !ok {
                anyhow::bail!("database connection check failed");
            }
        }
        Commands::Tables { target } => {
            let db = Database::connect(database_config(&config, target)).await?;
            print_json(&db.list_tables().await?)?;
        }
        Commands::WeeklyMedian {
            client_id,
            origin,
            prediction_date,
            output,
        } => {
            let db = Database::connect(&config.prod).await?;
            let rows =
                hrva_analytics::weekly_median(&db, client_id, origin, prediction_date).await?;
            match output {
                Some(path) => {
                    hrva_analytics::export_weekly_median_parquet(&path, &rows)?;
                    info!(rows = rows.len(), path = %path.display(), "wrote weekly median");
                }
                None => print_json(&rows)?,
            }
        }
        Commands::Plans {
            client_id,
            upload_id,
        } => {
            let db = Database::connect(&config.prod).await?;
            print_json(&hrva_analytics::plans_data(&db, client_id, upload_id).await?)?;
        }
        Commands::CampaignUpload {
            campaign_id,
            client_id,
            origin,
        } => {
            let db = Database::connect(&config.ml).await?;
            let upload =
                hrva_analytics::init_campaign_upload(&db, &campaign_id, client_id, origin).await?;
            print_json(&upload)?;
        }
        Commands::UploadCombinations {
            client_id,
            origin,
            upload_id,
            input,
        } => {
            let records: Vec<CombinationRecord> = read_json(&input).await?;
            let db = Database::connect(&config.ml).await?;
            let written =
                hrva_analytics::init_combinations_table(&db, records, client_id, origin, upload_id)
                    .await?;
            print_json(&written)?;
        }
        Commands::Encode {
            column,
            input,
            run_id,
            run_timestamp,
        } => {
            let uniques: Vec<String> = read_json(&input).await?;
            let run = EncodingRun {
                run_id,
                run_timestamp,
            };
            let db = Database::connect(&config.ml).await?;
            let table = hrva_analytics::init_encode_table(&db, &uniques, &column, &run).await?;
            print_json(&table)?;
        }
        Commands::Predict { input } => {
            let rows: Vec<PredictionInput> = read_json(&input).await?;
            let db = Database::connect(&config.ml).await?;
            print_json(&hrva_analytics::init_custom_predict(&db, rows).await?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekly_median_arguments_parse() {
        let cli = Cli::try_parse_from([
            "hrva-cli",
            "weekly-median",
            "--client-id",
            "132",
            "--origin",
            "HV",
            "--prediction-date",
            "2025-09-24",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::WeeklyMedian {
                client_id,
                origin,
                prediction_date,
                output,
            }) => {
                assert_eq!(client_id, 132);
                assert_eq!(origin, Origin::Hv);
                assert_eq!(prediction_date, NaiveDate::from_ymd_opt(2025, 9, 24).unwrap());
                assert!(output.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_origin_is_rejected() {
        let err = Cli::try_parse_from([
            "hrva-cli",
            "campaign-upload",
            "--campaign-id",
            "c1",
            "--client-id",
            "1",
            "--origin",
            "xx",
        ]);
        assert!(err.is_err());
    }

    #[test]
    fn no_subcommand_defaults_to_serve() {
        let cli = Cli::try_parse_from(["hrva-cli"]).unwrap();
        assert!(cli.command.is_none());
    }
}
