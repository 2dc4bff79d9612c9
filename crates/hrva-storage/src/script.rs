//! SQL script files: loading, statement splitting and plan execution.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer, TokenizerError};
use tokio::fs;
use tracing::{info, info_span, Instrument};

use crate::Database;

/// A loaded script split into executable statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlScript {
    pub file_name: String,
    pub path: PathBuf,
    pub sha256: String,
    pub statements: Vec<String>,
}

impl SqlScript {
    pub async fn load(root: &Path, dir_name: &str, file_name: &str) -> anyhow::Result<Self> {
        let path = root.join(dir_name).join(file_name);
        let source = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading sql script {}", path.display()))?;
        Self::from_source(file_name, path, &source)
    }

    pub fn from_source(file_name: &str, path: PathBuf, source: &str) -> anyhow::Result<Self> {
        let statements = split_sql_statements(source)
            .with_context(|| format!("tokenizing sql script {}", path.display()))?;
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        Ok(Self {
            file_name: file_name.to_string(),
            path,
            sha256: hex::encode(hasher.finalize()),
            statements,
        })
    }
}

/// Split a script into statements on top-level `;` using the Postgres
/// tokenizer. Each statement is the source text from its first to its last
/// token, so comments before or after it are dropped and statements made of
/// comments only disappear. Unterminated strings or comments are an error.
pub fn split_sql_statements(sql: &str) -> Result<Vec<String>, TokenizerError> {
    let tokens = Tokenizer::new(&PostgreSqlDialect {}, sql).tokenize_with_location()?;
    let offsets = LineOffsets::new(sql);

    let mut statements = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for item in &tokens {
        match &item.token {
            Token::SemiColon => {
                if let Some((start, end)) = current.take() {
                    statements.push(sql[start..end].to_string());
                }
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => {
                let end = offsets.byte_offset(&item.span.end);
                let start = match current {
                    Some((start, _)) => start,
                    None => offsets.byte_offset(&item.span.start),
                };
                current = Some((start, end));
            }
        }
    }
    if let Some((start, end)) = current {
        statements.push(sql[start..end].to_string());
    }
    Ok(statements)
}

/// Maps the tokenizer's 1-based line/column (in chars) back to byte offsets.
struct LineOffsets<'a> {
    source: &'a str,
    line_starts: Vec<usize>,
}

impl<'a> LineOffsets<'a> {
    fn new(source: &'a str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        Self {
            source,
            line_starts,
        }
    }

    fn byte_offset(&self, location: &Location) -> usize {
        let line = (location.line as usize).saturating_sub(1);
        let Some(&line_start) = self.line_starts.get(line) else {
            return self.source.len();
        };
        let rest = &self.source[line_start..];
        let column = (location.column as usize).saturating_sub(1);
        line_start
            + rest
                .char_indices()
                .nth(column)
                .map(|(i, _)| i)
                .unwrap_or(rest.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptStep {
    pub dir: String,
    pub file: String,
}

/// Ordered list of scripts to run, usually read from `db/init.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPlan {
    pub steps: Vec<ScriptStep>,
}

impl Default for ScriptPlan {
    fn default() -> Self {
        Self {
            steps: vec![
                ScriptStep {
                    dir: "db/create".into(),
                    file: "001_create_vacancy_activity.sql".into(),
                },
                ScriptStep {
                    dir: "db/insert".into(),
                    file: "001_insert_vacancy_activity.sql".into(),
                },
            ],
        }
    }
}

impl ScriptPlan {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptOutcome {
    pub file_name: String,
    pub sha256: String,
    pub executed: usize,
}

/// Execute every statement of the script in one transaction, failing on the first error.
pub async fn run_script(db: &Database, script: &SqlScript) -> anyhow::Result<usize> {
    info!(
        file = %script.file_name,
        sha256 = %script.sha256,
        statements = script.statements.len(),
        "loaded sql script"
    );
    let executed = db
        .execute_statements(&script.statements, true)
        .await
        .with_context(|| format!("running sql script {}", script.file_name))?;
    info!(file = %script.file_name, executed, "sql script executed successfully");
    Ok(executed)
}

pub async fn run_plan(
    db: &Database,
    root: &Path,
    plan: &ScriptPlan,
) -> anyhow::Result<Vec<ScriptOutcome>> {
    let mut outcomes = Vec::with_capacity(plan.steps.len());
    for step in &plan.steps {
        let span = info_span!("sql_script", dir = %step.dir, file = %step.file);
        let outcome = async {
            info!("start");
            let script = SqlScript::load(root, &step.dir, &step.file).await?;
            let executed = run_script(db, &script).await?;
            info!("finished");
            anyhow::Ok(ScriptOutcome {
                file_name: script.file_name,
                sha256: script.sha256,
                executed,
            })
        }
        .instrument(span)
        .await?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
