//! Source extractor contracts, fixture-first extractors and vocabulary seed loading.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ethos_core::{Codesystem, Concept};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ethos-adapters";

/// HES admitted patient care extraction. Numeric `ethnos` values belong to the
/// retired coding scheme and are left out together with rows missing a code or date.
pub const HES_APC_QUERY: &str = r#"
select distinct participant_id as id
    ,ethnos as ethnicity_code
    ,admidate::date as source_date
from q4_19_nhsd.apc
where ethnos not in ('0', '1', '2', '3', '4', '5', '6', '7', '8', '9') and
ethnos is not null and
admidate is not null
"#;

/// One raw row handed from an extractor to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedRow {
    pub participant_id: String,
    pub ethnicity_code: String,
    pub source_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub workspace_root: PathBuf,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("{0}")]
    Message(String),
    #[error("source database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceExtractor: Send + Sync {
    /// Fixed source label every extracted row is tagged with.
    fn source_label(&self) -> &str;

    async fn extract(&self, ctx: &ExtractContext) -> Result<Vec<ExtractedRow>, ExtractError>;
}

/// How a registered source is read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExtractorSpec {
    /// JSON bundle, path relative to the workspace root.
    Fixture { path: PathBuf },
    /// SQL query against a source database whose URL is read from `database_url_env`.
    Postgres {
        database_url_env: String,
        #[serde(default)]
        query: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub source: String,
    pub extracted_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub rows: Vec<FixtureRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureRow {
    pub participant_id: String,
    pub ethnicity_code: Option<String>,
    pub source_date: Option<NaiveDate>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn fixture_rows_to_extracted(rows: &[FixtureRow]) -> Vec<ExtractedRow> {
    rows.iter()
        .filter_map(|row| {
            let participant_id = Some(row.participant_id.trim()).filter(|p| !p.is_empty())?;
            let code = row.ethnicity_code.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
            Some(ExtractedRow {
                participant_id: participant_id.to_string(),
                ethnicity_code: code.to_string(),
                source_date: row.source_date?,
            })
        })
        .collect()
}

pub struct FixtureExtractor {
    source_label: String,
    path: PathBuf,
}

impl FixtureExtractor {
    pub fn new(source_label: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_label: source_label.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl SourceExtractor for FixtureExtractor {
    fn source_label(&self) -> &str {
        &self.source_label
    }

    async fn extract(&self, ctx: &ExtractContext) -> Result<Vec<ExtractedRow>, ExtractError> {
        let path = ctx.workspace_root.join(&self.path);
        let bundle = load_fixture_bundle(&path)?;
        if bundle.source != self.source_label {
            return Err(ExtractError::Message(format!(
                "bundle source={} does not match extractor source={}",
                bundle.source, self.source_label
            )));
        }
        let rows = fixture_rows_to_extracted(&bundle.rows);
        debug!(
            source = %self.source_label,
            fixture_id = %bundle.fixture_id,
            kept = rows.len(),
            dropped = bundle.rows.len() - rows.len(),
            "loaded fixture bundle"
        );
        Ok(rows)
    }
}

pub struct PgQueryExtractor {
    source_label: String,
    database_url: String,
    query: String,
}

impl PgQueryExtractor {
    pub fn new(source_label: impl Into<String>, database_url: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            source_label: source_label.into(),
            database_url: database_url.into(),
            query: query.into(),
        }
    }
}

#[async_trait]
impl SourceExtractor for PgQueryExtractor {
    fn source_label(&self) -> &str {
        &self.source_label
    }

    async fn extract(&self, ctx: &ExtractContext) -> Result<Vec<ExtractedRow>, ExtractError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(&self.database_url)
            .await?;
        let rows = sqlx::query(&self.query).fetch_all(&pool).await?;
        pool.close().await;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ExtractedRow {
                participant_id: row.try_get("id")?,
                ethnicity_code: row.try_get("ethnicity_code")?,
                source_date: row.try_get("source_date")?,
            });
        }
        info!(run_id = %ctx.run_id, source = %self.source_label, rows = out.len(), "extracted source rows");
        Ok(out)
    }
}

/// Built-in extraction query for sources that do not configure their own.
pub fn preset_query(source_label: &str) -> Option<&'static str> {
    match source_label {
        "hes_apc" => Some(HES_APC_QUERY),
        _ => None,
    }
}

pub fn extractor_for_source(
    source_label: &str,
    spec: &ExtractorSpec,
) -> Result<Box<dyn SourceExtractor>, ExtractError> {
    match spec {
        ExtractorSpec::Fixture { path } => Ok(Box::new(FixtureExtractor::new(source_label, path.clone()))),
        ExtractorSpec::Postgres {
            database_url_env,
            query,
        } => {
            let database_url = std::env::var(database_url_env).map_err(|_| {
                ExtractError::Message(format!(
                    "{database_url_env} is not set; cannot reach source {source_label}"
                ))
            })?;
            let query = match query {
                Some(query) => query.clone(),
                None => preset_query(source_label)
                    .ok_or_else(|| {
                        ExtractError::Message(format!("no query configured for source {source_label}"))
                    })?
                    .to_string(),
            };
            Ok(Box::new(PgQueryExtractor::new(source_label, database_url, query)))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConceptSeedRow {
    concept_code: String,
    codesystem: String,
    #[serde(default)]
    description: Option<String>,
}

/// Parse vocabulary seed CSV with header `concept_code,codesystem,description`.
pub fn parse_concept_seed<R: Read>(reader: R) -> Result<Vec<Concept>> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut concepts = Vec::new();
    for (idx, record) in reader.deserialize::<ConceptSeedRow>().enumerate() {
        // header is line 1
        let line = idx + 2;
        let row = record.with_context(|| format!("reading concept seed line {line}"))?;
        let codesystem: Codesystem = row
            .codesystem
            .parse()
            .with_context(|| format!("concept seed line {line}"))?;
        concepts.push(Concept::new(
            codesystem,
            row.concept_code.trim(),
            row.description.unwrap_or_default(),
        ));
    }
    Ok(concepts)
}

pub fn load_concept_seed(path: impl AsRef<Path>) -> Result<Vec<Concept>> {
    let path = path.as_ref();
    let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let concepts = parse_concept_seed(file).with_context(|| format!("parsing {}", path.display()))?;
    info!(rows = concepts.len(), path = %path.display(), "loaded concept seed");
    Ok(concepts)
}
