//! Observation store for ETHOS: an in-memory backend and a Postgres backend.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ethos_core::{
    Codesystem, Commonality, Concept, CorpusStats, ObservationKey, Participant, ResolvedEthnicity,
    StoredObservation,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Executor, PgPool, Postgres, Row};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ethos-storage";

/// Schema bootstrap script for the Postgres backend.
pub const SCHEMA_SQL: &str = include_str!("../sql/ethnicity_store.sql");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("participant {0} is not stored")]
    UnknownParticipant(String),
    #[error("observation for participant {observation} submitted with participant {participant}")]
    ParticipantMismatch { participant: String, observation: String },
    #[error("stored row is invalid: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// `true` when the participant row did not exist before this call.
    pub created: bool,
    pub observations_written: usize,
}

/// Persistence contract for participants, their observations and resolved output.
///
/// `upsert_participant` is the atomic unit: readers never see some but not
/// all of the observations submitted in one call.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    async fn seed_concepts(&self, concepts: &[Concept]) -> Result<usize, StoreError>;

    async fn load_concepts(&self) -> Result<Vec<Concept>, StoreError>;

    async fn upsert_participant(
        &self,
        participant: &Participant,
        observations: &[StoredObservation],
    ) -> Result<UpsertOutcome, StoreError>;

    /// Insert or overwrite one observation by its natural key.
    async fn merge(&self, observation: &StoredObservation) -> Result<(), StoreError>;

    async fn participant(&self, id: &str) -> Result<Option<Participant>, StoreError>;

    async fn participant_ids(&self) -> Result<Vec<String>, StoreError>;

    async fn get_all_for(&self, participant_id: &str) -> Result<Vec<StoredObservation>, StoreError>;

    async fn corpus_stats(&self) -> Result<CorpusStats, StoreError>;

    async fn corpus_commonality(&self, code: &str) -> Result<f64, StoreError> {
        Ok(self.corpus_stats().await?.commonality(code))
    }

    /// Remove a participant with its observations and resolved row. Returns whether it existed.
    async fn delete_participant(&self, id: &str) -> Result<bool, StoreError>;

    async fn save_resolution(&self, resolved: &ResolvedEthnicity) -> Result<(), StoreError>;

    async fn resolved(&self, participant_id: &str) -> Result<Option<ResolvedEthnicity>, StoreError>;
}

fn check_ownership(participant: &Participant, observations: &[StoredObservation]) -> Result<(), StoreError> {
    match observations.iter().find(|o| o.participant_id != participant.id) {
        Some(stray) => Err(StoreError::ParticipantMismatch {
            participant: participant.id.clone(),
            observation: stray.participant_id.clone(),
        }),
        None => Ok(()),
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    concepts: BTreeMap<(Codesystem, String), Concept>,
    participants: BTreeMap<String, Participant>,
    observations: BTreeMap<String, BTreeMap<ObservationKey, StoredObservation>>,
    resolved: BTreeMap<String, ResolvedEthnicity>,
}

/// Process-local store. Every call holds the state lock for its whole duration.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ObservationStore for MemoryStore {
    async fn seed_concepts(&self, concepts: &[Concept]) -> Result<usize, StoreError> {
        let mut state = self.state.write().await;
        for concept in concepts {
            state
                .concepts
                .insert((concept.codesystem, concept.code.clone()), concept.clone());
        }
        Ok(concepts.len())
    }

    async fn load_concepts(&self) -> Result<Vec<Concept>, StoreError> {
        let state = self.state.read().await;
        Ok(state.concepts.values().cloned().collect())
    }

    async fn upsert_participant(
        &self,
        participant: &Participant,
        observations: &[StoredObservation],
    ) -> Result<UpsertOutcome, StoreError> {
        check_ownership(participant, observations)?;

        let mut state = self.state.write().await;
        let created = state
            .participants
            .insert(participant.id.clone(), participant.clone())
            .is_none();
        let rows = state.observations.entry(participant.id.clone()).or_default();
        for observation in observations {
            rows.insert(observation.key(), observation.clone());
        }
        debug!(participant_id = %participant.id, created, "memory upsert");
        Ok(UpsertOutcome {
            created,
            observations_written: observations.len(),
        })
    }

    async fn merge(&self, observation: &StoredObservation) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.participants.contains_key(&observation.participant_id) {
            return Err(StoreError::UnknownParticipant(observation.participant_id.clone()));
        }
        state
            .observations
            .entry(observation.participant_id.clone())
            .or_default()
            .insert(observation.key(), observation.clone());
        Ok(())
    }

    async fn participant(&self, id: &str) -> Result<Option<Participant>, StoreError> {
        Ok(self.state.read().await.participants.get(id).cloned())
    }

    async fn participant_ids(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.state.read().await.participants.keys().cloned().collect())
    }

    async fn get_all_for(&self, participant_id: &str) -> Result<Vec<StoredObservation>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .observations
            .get(participant_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn corpus_stats(&self) -> Result<CorpusStats, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .observations
            .values()
            .flat_map(|rows| rows.values())
            .map(|o| o.ethnicity_code.as_str())
            .collect())
    }

    async fn delete_participant(&self, id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        state.observations.remove(id);
        state.resolved.remove(id);
        Ok(state.participants.remove(id).is_some())
    }

    async fn save_resolution(&self, resolved: &ResolvedEthnicity) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.participants.contains_key(&resolved.participant_id) {
            return Err(StoreError::UnknownParticipant(resolved.participant_id.clone()));
        }
        state
            .resolved
            .insert(resolved.participant_id.clone(), resolved.clone());
        Ok(())
    }

    async fn resolved(&self, participant_id: &str) -> Result<Option<ResolvedEthnicity>, StoreError> {
        Ok(self.state.read().await.resolved.get(participant_id).cloned())
    }
}

/// Postgres store over the `ethnicity_store` schema.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn create_schema(&self) -> Result<(), StoreError> {
        info!("creating ethnicity_store schema");
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn drop_schema(&self) -> Result<(), StoreError> {
        info!("dropping ethnicity_store schema");
        sqlx::query("DROP SCHEMA IF EXISTS ethnicity_store CASCADE")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn upsert_observation<'c, E>(executor: E, observation: &StoredObservation) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO ethnicity_store.reported_ethnicity
            (participant_id, ethnicity_code, ethnicity_cid, source_code, source_cid, source_date)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (participant_id, ethnicity_code, source_code, source_date) DO UPDATE SET
            ethnicity_cid = EXCLUDED.ethnicity_cid,
            source_cid = EXCLUDED.source_cid
        "#,
    )
    .bind(&observation.participant_id)
    .bind(&observation.ethnicity_code)
    .bind(observation.ethnicity_id)
    .bind(&observation.source)
    .bind(observation.source_id)
    .bind(observation.source_date)
    .execute(executor)
    .await?;
    Ok(())
}

fn unknown_participant_on_fk(err: sqlx::Error, participant_id: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
            StoreError::UnknownParticipant(participant_id.to_string())
        }
        _ => StoreError::Database(err),
    }
}

fn concept_from_row(row: &PgRow) -> Result<Concept, StoreError> {
    let codesystem: String = row.try_get("codesystem")?;
    let codesystem = codesystem
        .parse::<Codesystem>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    Ok(Concept {
        id: row.try_get("uid")?,
        codesystem,
        code: row.try_get("concept_code")?,
        description: row.try_get("description")?,
    })
}

fn participant_from_row(row: &PgRow) -> Result<Participant, StoreError> {
    Ok(Participant {
        id: row.try_get("id")?,
        group_id: row.try_get("group_cid")?,
        in_ngrl: row.try_get("in_ngrl")?,
        programme_id: row.try_get("programme_cid")?,
    })
}

fn observation_from_row(row: &PgRow) -> Result<StoredObservation, StoreError> {
    let source_date: NaiveDate = row.try_get("source_date")?;
    let ethnicity_id: Option<Uuid> = row.try_get("ethnicity_cid")?;
    let source_id: Option<Uuid> = row.try_get("source_cid")?;
    Ok(StoredObservation {
        participant_id: row.try_get("participant_id")?,
        ethnicity_code: row.try_get("ethnicity_code")?,
        ethnicity_id,
        source: row.try_get("source_code")?,
        source_id,
        source_date,
    })
}

#[async_trait]
impl ObservationStore for PgStore {
    async fn seed_concepts(&self, concepts: &[Concept]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        for concept in concepts {
            sqlx::query(
                r#"
                INSERT INTO ethnicity_store.concept (uid, concept_code, codesystem, description)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (codesystem, concept_code) DO UPDATE SET
                    description = EXCLUDED.description
                "#,
            )
            .bind(concept.id)
            .bind(&concept.code)
            .bind(concept.codesystem.as_str())
            .bind(&concept.description)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(rows = concepts.len(), "seeded concept table");
        Ok(concepts.len())
    }

    async fn load_concepts(&self) -> Result<Vec<Concept>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT uid, concept_code, codesystem, description
              FROM ethnicity_store.concept
             ORDER BY codesystem, concept_code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(concept_from_row).collect()
    }

    async fn upsert_participant(
        &self,
        participant: &Participant,
        observations: &[StoredObservation],
    ) -> Result<UpsertOutcome, StoreError> {
        check_ownership(participant, observations)?;

        let mut tx = self.pool.begin().await?;
        let created: bool = sqlx::query_scalar(
            r#"
            INSERT INTO ethnicity_store.participant (id, group_cid, in_ngrl, programme_cid)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                group_cid = EXCLUDED.group_cid,
                in_ngrl = EXCLUDED.in_ngrl,
                programme_cid = EXCLUDED.programme_cid
            RETURNING (xmax = 0) AS created
            "#,
        )
        .bind(&participant.id)
        .bind(participant.group_id)
        .bind(participant.in_ngrl)
        .bind(participant.programme_id)
        .fetch_one(&mut *tx)
        .await?;

        for observation in observations {
            upsert_observation(&mut *tx, observation).await?;
        }
        tx.commit().await?;

        debug!(participant_id = %participant.id, created, "postgres upsert");
        Ok(UpsertOutcome {
            created,
            observations_written: observations.len(),
        })
    }

    async fn merge(&self, observation: &StoredObservation) -> Result<(), StoreError> {
        upsert_observation(&self.pool, observation)
            .await
            .map_err(|err| unknown_participant_on_fk(err, &observation.participant_id))
    }

    async fn participant(&self, id: &str) -> Result<Option<Participant>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, group_cid, in_ngrl, programme_cid
              FROM ethnicity_store.participant
             WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(participant_from_row).transpose()
    }

    async fn participant_ids(&self) -> Result<Vec<String>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM ethnicity_store.participant ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn get_all_for(&self, participant_id: &str) -> Result<Vec<StoredObservation>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT participant_id, ethnicity_code, ethnicity_cid, source_code, source_cid, source_date
              FROM ethnicity_store.reported_ethnicity
             WHERE participant_id = $1
             ORDER BY ethnicity_code, source_code, source_date
            "#,
        )
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(observation_from_row).collect()
    }

    async fn corpus_stats(&self) -> Result<CorpusStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT ethnicity_code, COUNT(*) AS observations
              FROM ethnicity_store.reported_ethnicity
             GROUP BY ethnicity_code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let code: String = row.try_get("ethnicity_code")?;
            let observations: i64 = row.try_get("observations")?;
            counts.push((code, observations.max(0) as u64));
        }
        Ok(CorpusStats::from_counts(counts))
    }

    async fn corpus_commonality(&self, code: &str) -> Result<f64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) FILTER (WHERE ethnicity_code = $1) AS matching,
                   COUNT(*) AS total
              FROM ethnicity_store.reported_ethnicity
            "#,
        )
        .bind(code)
        .fetch_one(&self.pool)
        .await?;
        let matching: i64 = row.try_get("matching")?;
        let total: i64 = row.try_get("total")?;
        if total == 0 {
            return Ok(0.0);
        }
        Ok(matching as f64 / total as f64)
    }

    async fn delete_participant(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM ethnicity_store.participant WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_resolution(&self, resolved: &ResolvedEthnicity) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ethnicity_store.resolved_ethnicity
                (participant_id, ethnicity_code, resolved_at, run_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (participant_id) DO UPDATE SET
                ethnicity_code = EXCLUDED.ethnicity_code,
                resolved_at = EXCLUDED.resolved_at,
                run_id = EXCLUDED.run_id
            "#,
        )
        .bind(&resolved.participant_id)
        .bind(&resolved.ethnicity_code)
        .bind(resolved.resolved_at)
        .bind(resolved.run_id)
        .execute(&self.pool)
        .await
        .map_err(|err| unknown_participant_on_fk(err, &resolved.participant_id))?;
        Ok(())
    }

    async fn resolved(&self, participant_id: &str) -> Result<Option<ResolvedEthnicity>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT participant_id, ethnicity_code, resolved_at, run_id
              FROM ethnicity_store.resolved_ethnicity
             WHERE participant_id = $1
            "#,
        )
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let resolved_at: DateTime<Utc> = row.try_get("resolved_at")?;
        Ok(Some(ResolvedEthnicity {
            participant_id: row.try_get("participant_id")?,
            ethnicity_code: row.try_get("ethnicity_code")?,
            resolved_at,
            run_id: row.try_get("run_id")?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethos_core::concept_id;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn participant(id: &str, in_ngrl: bool) -> Participant {
        Participant {
            id: id.to_string(),
            group_id: concept_id(Codesystem::Group, "100k_ca"),
            in_ngrl,
            programme_id: concept_id(Codesystem::Programme, "100k"),
        }
    }

    fn observation(participant_id: &str, code: &str, source: &str, day: &str) -> StoredObservation {
        StoredObservation {
            participant_id: participant_id.to_string(),
            ethnicity_code: code.to_string(),
            ethnicity_id: Some(concept_id(Codesystem::ReportedEthnicityCode, code)),
            source: source.to_string(),
            source_id: Some(concept_id(Codesystem::Source, source)),
            source_date: date(day),
        }
    }

    #[tokio::test]
    async fn resubmitting_identical_observation_is_idempotent() {
        let store = MemoryStore::new();
        let rows = vec![observation("1", "A", "dams", "1900-01-01")];
        store.upsert_participant(&participant("1", true), &rows).await.unwrap();
        store.upsert_participant(&participant("1", true), &rows).await.unwrap();
        store.merge(&rows[0]).await.unwrap();

        assert_eq!(store.get_all_for("1").await.unwrap().len(), 1);
        assert_eq!(store.corpus_stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn participant_fields_are_last_write_wins() {
        let store = MemoryStore::new();
        let first = store.upsert_participant(&participant("1", true), &[]).await.unwrap();
        let second = store.upsert_participant(&participant("1", false), &[]).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(store.participant_ids().await.unwrap(), vec!["1".to_string()]);
        assert!(!store.participant("1").await.unwrap().unwrap().in_ngrl);
    }

    #[tokio::test]
    async fn distinct_keys_accumulate() {
        let store = MemoryStore::new();
        store
            .upsert_participant(
                &participant("1", true),
                &[
                    observation("1", "A", "dams", "1900-01-01"),
                    observation("1", "A", "hes", "1900-01-01"),
                    observation("1", "A", "dams", "1901-01-01"),
                ],
            )
            .await
            .unwrap();
        store
            .upsert_participant(&participant("1", true), &[observation("1", "B", "dams", "1900-01-01")])
            .await
            .unwrap();
        assert_eq!(store.get_all_for("1").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn merge_requires_existing_participant() {
        let store = MemoryStore::new();
        let err = store
            .merge(&observation("ghost", "A", "dams", "1900-01-01"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownParticipant(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn mismatched_observation_rejects_whole_upsert() {
        let store = MemoryStore::new();
        let err = store
            .upsert_participant(
                &participant("1", true),
                &[
                    observation("1", "A", "dams", "1900-01-01"),
                    observation("2", "B", "dams", "1900-01-01"),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ParticipantMismatch { .. }));
        assert!(store.participant("1").await.unwrap().is_none());
        assert!(store.get_all_for("1").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_upserts_for_one_participant_serialize() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut tasks = tokio::task::JoinSet::new();
        let mut expected = std::collections::BTreeSet::new();
        for writer in 0..8u32 {
            let rows = (0..5u32)
                .map(|i| {
                    let day = format!("19{:02}-01-{:02}", writer, i + 1);
                    observation("1", "A", "dams", &day)
                })
                .collect::<Vec<_>>();
            expected.extend(rows.iter().map(StoredObservation::key));
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .upsert_participant(&participant("1", writer % 2 == 0), &rows)
                    .await
                    .unwrap()
            });
        }

        let mut created = 0;
        while let Some(outcome) = tasks.join_next().await {
            let outcome = outcome.unwrap();
            assert_eq!(outcome.observations_written, 5);
            if outcome.created {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(store.participant_ids().await.unwrap(), vec!["1".to_string()]);
        let stored = store
            .get_all_for("1")
            .await
            .unwrap()
            .iter()
            .map(StoredObservation::key)
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(stored, expected);
    }

    #[tokio::test]
    async fn corpus_commonality_spans_all_participants() {
        let store = MemoryStore::new();
        store
            .upsert_participant(
                &participant("1", true),
                &[
                    observation("1", "C", "dams", "1900-01-01"),
                    observation("1", "H", "dams", "1900-01-01"),
                ],
            )
            .await
            .unwrap();
        store
            .upsert_participant(
                &participant("2", true),
                &[
                    observation("2", "C", "dams", "1900-01-01"),
                    observation("2", "C", "hes", "1900-01-01"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.corpus_commonality("C").await.unwrap(), 0.75);
        assert_eq!(store.corpus_commonality("H").await.unwrap(), 0.25);
        assert_eq!(store.corpus_commonality("J").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn delete_cascades_to_observations_and_resolution() {
        let store = MemoryStore::new();
        store
            .upsert_participant(&participant("1", true), &[observation("1", "A", "dams", "1900-01-01")])
            .await
            .unwrap();
        store
            .save_resolution(&ResolvedEthnicity {
                participant_id: "1".into(),
                ethnicity_code: "A".into(),
                resolved_at: Utc::now(),
                run_id: None,
            })
            .await
            .unwrap();

        assert!(store.delete_participant("1").await.unwrap());
        assert!(store.get_all_for("1").await.unwrap().is_empty());
        assert!(store.resolved("1").await.unwrap().is_none());
        assert!(!store.delete_participant("1").await.unwrap());
    }

    #[tokio::test]
    async fn seeding_concepts_overwrites_by_codesystem_and_code() {
        let store = MemoryStore::new();
        store
            .seed_concepts(&[
                Concept::new(Codesystem::Source, "dams", "DAMS"),
                Concept::new(Codesystem::Group, "dams", "not a source"),
            ])
            .await
            .unwrap();
        store
            .seed_concepts(&[Concept::new(Codesystem::Source, "dams", "Data Access Management System")])
            .await
            .unwrap();

        let concepts = store.load_concepts().await.unwrap();
        assert_eq!(concepts.len(), 2);
        assert!(concepts
            .iter()
            .any(|c| c.codesystem == Codesystem::Source && c.description == "Data Access Management System"));
    }
}
