//! Postgres connection handling, table introspection and SQL script execution.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use hrva_core::created_table_name;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use tracing::{debug, error, info};

pub mod script;

pub use script::{run_plan, run_script, split_sql_statements, ScriptOutcome, ScriptPlan, ScriptStep, SqlScript};

pub const CRATE_NAME: &str = "hrva-storage";

const LOCAL_USER: &str = "myuser";
const LOCAL_PASSWORD: &str = "mypassword";
const LOCAL_HOST: &str = "localhost";
const LOCAL_PORT: u16 = 5432;
const LOCAL_DB: &str = "mydatabase";

/// Connection settings for one database target, e.g. `POSTGRES_*` or `DB_ML_*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Full connection URL; takes precedence over the individual fields.
    pub url: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            user: LOCAL_USER.to_string(),
            password: LOCAL_PASSWORD.to_string(),
            host: LOCAL_HOST.to_string(),
            port: LOCAL_PORT,
            name: LOCAL_DB.to_string(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            url: None,
        }
    }
}

impl DatabaseConfig {
    /// Read `<PREFIX>_USER`, `_PASSWORD`, `_HOST`, `_PORT`, `_DB` (or `_NAME`)
    /// and `_URL`, falling back to the local development database.
    pub fn from_env(prefix: &str) -> Self {
        let var = |suffix: &str| std::env::var(format!("{prefix}_{suffix}")).ok();
        let defaults = Self::default();
        Self {
            user: var("USER").unwrap_or(defaults.user),
            password: var("PASSWORD").unwrap_or(defaults.password),
            host: var("HOST").unwrap_or(defaults.host),
            port: var("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            name: var("DB").or_else(|| var("NAME")).unwrap_or(defaults.name),
            max_connections: var("MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            acquire_timeout: defaults.acquire_timeout,
            url: var("URL"),
        }
    }

    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}",
                self.user, self.password, self.host, self.port, self.name
            ),
        }
    }

    /// Connection URL safe to log.
    pub fn redacted_url(&self) -> String {
        match &self.url {
            Some(url) => redact_url(url),
            None => format!(
                "postgres://{}:***@{}:{}/{}",
                self.user, self.host, self.port, self.name
            ),
        }
    }

    pub fn connect_options(&self) -> anyhow::Result<PgConnectOptions> {
        match &self.url {
            Some(url) => PgConnectOptions::from_str(url)
                .with_context(|| format!("parsing database url {}", redact_url(url))),
            None => Ok(PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.user)
                .password(&self.password)
                .database(&self.name)),
        }
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .acquire_timeout(self.acquire_timeout)
    }
}

fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => url.to_string(),
    }
}

/// Pooled handle to one Postgres database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let options = config.connect_options()?;
        let pool = config
            .pool_options()
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {}", config.redacted_url()))?;
        debug!(url = %config.redacted_url(), "connected to database");
        Ok(Self { pool })
    }

    /// Pool that opens connections on first use.
    pub fn connect_lazy(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let options = config.connect_options()?;
        Ok(Self {
            pool: config.pool_options().connect_lazy_with(options),
        })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Run `SELECT 1`; failures are logged, not returned.
    pub async fn check_connection(&self) -> bool {
        match sqlx::query_scalar::<_, i32>("SELECT 1 AS healthcheck")
            .fetch_one(&self.pool)
            .await
        {
            Ok(1) => {
                info!("database connection test succeeded");
                true
            }
            Ok(other) => {
                error!(value = other, "database connection test failed: unexpected response");
                false
            }
            Err(err) => {
                error!(error = %err, "database connection test failed");
                false
            }
        }
    }

    /// Execute the non-blank statements in a single transaction and return
    /// how many ran. On failure the transaction is rolled back, so nothing is
    /// committed. With `raise_on_error` set the error is returned; otherwise
    /// it is logged and the count of statements that ran before it is
    /// returned, although none of those statements were committed.
    pub async fn execute_statements<S: AsRef<str>>(
        &self,
        statements: &[S],
        raise_on_error: bool,
    ) -> anyhow::Result<usize> {
        if statements.is_empty() {
            error!("statements must be a non-empty list");
            return Ok(0);
        }

        let mut executed = 0usize;
        let outcome: Result<(), sqlx::Error> = async {
            let mut tx = self.pool.begin().await?;
            for statement in statements {
                let statement = statement.as_ref();
                if statement.trim().is_empty() {
                    continue;
                }
                sqlx::raw_sql(statement).execute(&mut *tx).await?;
                executed += 1;
            }
            tx.commit().await
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(executed, "executed statements");
                Ok(executed)
            }
            Err(err) => {
                error!(error = %err, executed, "error executing SQL statements");
                if raise_on_error {
                    Err(err).context("executing SQL statements")
                } else {
                    Ok(executed)
                }
            }
        }
    }

    /// Execute a `CREATE TABLE IF NOT EXISTS` statement and return the table name.
    pub async fn create_table(&self, create_sql: &str) -> anyhow::Result<String> {
        let table_name = created_table_name(create_sql)?;
        sqlx::raw_sql(create_sql)
            .execute(&self.pool)
            .await
            .with_context(|| format!("creating table {table_name}"))?;
        debug!(table = %table_name, "executed create query");
        Ok(table_name)
    }

    pub async fn table_exists(&self, table_name: &str) -> anyhow::Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT FROM information_schema.tables
                 WHERE table_schema = 'public'
                   AND table_name = $1
            )
            "#,
        )
        .bind(table_name)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("checking whether table {table_name} exists"))?;
        Ok(exists)
    }

    /// Create the table unless it is already present. Returns true when created.
    pub async fn ensure_table(&self, table_name: &str, create_sql: &str) -> anyhow::Result<bool> {
        if self.table_exists(table_name).await? {
            debug!(table = %table_name, "table already exists");
            return Ok(false);
        }
        self.create_table(create_sql).await?;
        debug!(table = %table_name, "created table");
        Ok(true)
    }

    /// User-defined base tables of the `public` schema.
    pub async fn list_tables(&self) -> anyhow::Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT table_name::text
              FROM information_schema.tables
             WHERE table_schema = 'public'
               AND table_type = 'BASE TABLE'
             ORDER BY table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing database tables")?;
        let tables: Vec<String> = rows.into_iter().map(|(name,)| name).collect();
        info!(count = tables.len(), "count tables from database");
        Ok(tables)
    }

    pub async fn fetch_all(&self, sql: &str) -> anyhow::Result<Vec<PgRow>> {
        if sql.trim().is_empty() {
            anyhow::bail!("query must be a non-empty string");
        }
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .context("executing query")?;
        debug!(rows = rows.len(), "loaded rows");
        Ok(rows)
    }
}
