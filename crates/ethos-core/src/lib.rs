//! Core domain model, vocabulary table and best-ethnicity resolution for ETHOS.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ethos-core";

/// Categories of controlled-vocabulary codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codesystem {
    Group,
    Programme,
    Source,
    ReportedEthnicityCode,
}

impl Codesystem {
    /// Every codesystem must carry at least one concept before anything can be classified.
    pub const REQUIRED: [Codesystem; 4] = [
        Codesystem::Group,
        Codesystem::Programme,
        Codesystem::Source,
        Codesystem::ReportedEthnicityCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Codesystem::Group => "group",
            Codesystem::Programme => "programme",
            Codesystem::Source => "source",
            Codesystem::ReportedEthnicityCode => "reported_ethnicity_code",
        }
    }
}

impl fmt::Display for Codesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codesystem {
    type Err = VocabularyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "group" => Ok(Codesystem::Group),
            "programme" => Ok(Codesystem::Programme),
            "source" => Ok(Codesystem::Source),
            "reported_ethnicity_code" => Ok(Codesystem::ReportedEthnicityCode),
            other => Err(VocabularyError::UnknownCodesystem(other.to_string())),
        }
    }
}

/// Stable concept id for a `(codesystem, code)` pair.
pub fn concept_id(codesystem: Codesystem, code: &str) -> Uuid {
    let name = format!("ethnicity_store:{}:{}", codesystem.as_str(), code);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// Immutable vocabulary entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub id: Uuid,
    pub codesystem: Codesystem,
    pub code: String,
    pub description: String,
}

impl Concept {
    pub fn new(codesystem: Codesystem, code: impl Into<String>, description: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            id: concept_id(codesystem, &code),
            codesystem,
            code,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VocabularyError {
    #[error("vocabulary has no concepts for required codesystem `{0}`")]
    MissingCodesystem(Codesystem),
    #[error("duplicate concept `{code}` in codesystem `{codesystem}`")]
    DuplicateConcept { codesystem: Codesystem, code: String },
    #[error("unknown codesystem `{0}`")]
    UnknownCodesystem(String),
}

/// Read-only `(codesystem, code) -> id` lookup, built once and shared.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    ids: HashMap<(Codesystem, String), Uuid>,
    concepts: Vec<Concept>,
}

impl Vocabulary {
    pub fn from_concepts(concepts: impl IntoIterator<Item = Concept>) -> Result<Self, VocabularyError> {
        let mut ids = HashMap::new();
        let mut kept = Vec::new();
        for concept in concepts {
            let key = (concept.codesystem, concept.code.clone());
            if ids.insert(key, concept.id).is_some() {
                return Err(VocabularyError::DuplicateConcept {
                    codesystem: concept.codesystem,
                    code: concept.code,
                });
            }
            kept.push(concept);
        }

        let vocabulary = Self { ids, concepts: kept };
        for codesystem in Codesystem::REQUIRED {
            if vocabulary.count(codesystem) == 0 {
                return Err(VocabularyError::MissingCodesystem(codesystem));
            }
        }
        Ok(vocabulary)
    }

    pub fn lookup(&self, codesystem: Codesystem, code: &str) -> Option<Uuid> {
        self.ids.get(&(codesystem, code.to_string())).copied()
    }

    pub fn count(&self, codesystem: Codesystem) -> usize {
        self.concepts
            .iter()
            .filter(|c| c.codesystem == codesystem)
            .count()
    }

    pub fn concepts(&self) -> &[Concept] {
        &self.concepts
    }

    pub fn len(&self) -> usize {
        self.concepts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concepts.is_empty()
    }
}

/// A mandatory classification code (group or programme) that the vocabulary does not know.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("participant {participant_id}: {codesystem} code `{code}` is not in the vocabulary")]
pub struct ClassificationError {
    pub participant_id: String,
    pub codesystem: Codesystem,
    pub code: String,
}

/// Non-fatal lookup miss on an observation's ethnicity code or source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub participant_id: String,
    pub codesystem: Codesystem,
    pub code: String,
}

impl fmt::Display for UnresolvedReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "participant {}: unresolved {} `{}`",
            self.participant_id, self.codesystem, self.code
        )
    }
}

/// One reported ethnicity fact, still in raw code form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Observation {
    pub ethnicity_code: String,
    pub source: String,
    pub source_date: NaiveDate,
}

impl Observation {
    pub fn new(ethnicity_code: impl Into<String>, source: impl Into<String>, source_date: NaiveDate) -> Self {
        Self {
            ethnicity_code: ethnicity_code.into(),
            source: source.into(),
            source_date,
        }
    }
}

/// Input to the participant aggregate: identity, classification and observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSubmission {
    pub id: String,
    pub group_code: String,
    pub in_ngrl: bool,
    pub programme_code: String,
    #[serde(default)]
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub group_id: Uuid,
    pub in_ngrl: bool,
    pub programme_id: Uuid,
}

/// Natural key of a stored observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObservationKey {
    pub participant_id: String,
    pub ethnicity_code: String,
    pub source: String,
    pub source_date: NaiveDate,
}

/// Persisted observation. Reference ids are `None` when the raw code did not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObservation {
    pub participant_id: String,
    pub ethnicity_code: String,
    pub ethnicity_id: Option<Uuid>,
    pub source: String,
    pub source_id: Option<Uuid>,
    pub source_date: NaiveDate,
}

impl StoredObservation {
    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            participant_id: self.participant_id.clone(),
            ethnicity_code: self.ethnicity_code.clone(),
            source: self.source.clone(),
            source_date: self.source_date,
        }
    }

    pub fn is_resolvable(&self) -> bool {
        self.ethnicity_id.is_some() && self.source_id.is_some()
    }

    pub fn observation(&self) -> Observation {
        Observation::new(self.ethnicity_code.clone(), self.source.clone(), self.source_date)
    }
}

/// Result of one aggregate upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub participant: Participant,
    pub observations: Vec<StoredObservation>,
    pub warnings: Vec<UnresolvedReference>,
    pub created: bool,
    /// Observation rows written by this submission.
    pub written: usize,
}

/// Materialized best-ethnicity row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEthnicity {
    pub participant_id: String,
    pub ethnicity_code: String,
    pub resolved_at: DateTime<Utc>,
    pub run_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Band {
    Valid,
    Other,
}

/// Resolution configuration: the reserved "unknown/other" codes and source authority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionPolicy {
    other_band: BTreeSet<String>,
    source_priority: Vec<String>,
}

impl ResolutionPolicy {
    /// `source_priority` lists sources most authoritative first.
    pub fn new<O, S>(other_band: O, source_priority: S) -> Self
    where
        O: IntoIterator,
        O::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
    {
        Self {
            other_band: other_band.into_iter().map(Into::into).collect(),
            source_priority: source_priority.into_iter().map(Into::into).collect(),
        }
    }

    pub fn band_of(&self, code: &str) -> Band {
        if self.other_band.contains(code) {
            Band::Other
        } else {
            Band::Valid
        }
    }

    /// Higher is more authoritative; unlisted sources get `None`, which ranks below every listed one.
    pub fn source_rank(&self, source: &str) -> Option<u32> {
        self.source_priority
            .iter()
            .position(|s| s == source)
            .map(|idx| (self.source_priority.len() - idx) as u32)
    }

    pub fn other_band(&self) -> impl Iterator<Item = &str> {
        self.other_band.iter().map(String::as_str)
    }

    pub fn source_priority(&self) -> &[String] {
        &self.source_priority
    }
}

/// Population-level relative frequency of a code, in `[0, 1]`.
pub trait Commonality {
    fn commonality(&self, code: &str) -> f64;
}

/// Code counts over the whole observation corpus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusStats {
    counts: BTreeMap<String, u64>,
    total: u64,
}

impl CorpusStats {
    pub fn from_counts(counts: impl IntoIterator<Item = (String, u64)>) -> Self {
        let mut stats = Self::default();
        for (code, count) in counts {
            *stats.counts.entry(code).or_default() += count;
            stats.total += count;
        }
        stats
    }

    pub fn record(&mut self, code: &str) {
        *self.counts.entry(code.to_string()).or_default() += 1;
        self.total += 1;
    }

    pub fn count(&self, code: &str) -> u64 {
        self.counts.get(code).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Commonality for CorpusStats {
    fn commonality(&self, code: &str) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.count(code) as f64 / self.total as f64
    }
}

impl<'a> FromIterator<&'a str> for CorpusStats {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut stats = Self::default();
        for code in iter {
            stats.record(code);
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no resolvable observations to rank")]
    NoObservations,
}

/// Per-code statistics used to rank one candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateRank {
    pub code: String,
    pub band: Band,
    pub frequency: usize,
    pub max_date: NaiveDate,
    pub source_priority: Option<u32>,
    pub commonality: f64,
}

/// Rank the candidate codes of one participant, best first.
///
/// Only the valid band is considered when it has any member; otherwise the
/// other band. Within the band codes are ordered by frequency, latest date,
/// best source, corpus commonality and finally by code, so distinct codes
/// never compare equal.
pub fn rank_candidates<C>(
    observations: &[Observation],
    policy: &ResolutionPolicy,
    commonality: &C,
) -> Vec<CandidateRank>
where
    C: Commonality + ?Sized,
{
    let band = if observations
        .iter()
        .any(|o| policy.band_of(&o.ethnicity_code) == Band::Valid)
    {
        Band::Valid
    } else {
        Band::Other
    };

    let mut by_code: BTreeMap<&str, CandidateRank> = BTreeMap::new();
    for obs in observations
        .iter()
        .filter(|o| policy.band_of(&o.ethnicity_code) == band)
    {
        let rank = policy.source_rank(&obs.source);
        let entry = by_code
            .entry(obs.ethnicity_code.as_str())
            .or_insert_with(|| CandidateRank {
                code: obs.ethnicity_code.clone(),
                band,
                frequency: 0,
                max_date: obs.source_date,
                source_priority: None,
                commonality: commonality.commonality(&obs.ethnicity_code),
            });
        entry.frequency += 1;
        entry.max_date = entry.max_date.max(obs.source_date);
        entry.source_priority = entry.source_priority.max(rank);
    }

    let mut ranked = by_code.into_values().collect::<Vec<_>>();
    ranked.sort_by(compare_candidates);
    ranked
}

fn compare_candidates(a: &CandidateRank, b: &CandidateRank) -> Ordering {
    b.frequency
        .cmp(&a.frequency)
        .then_with(|| b.max_date.cmp(&a.max_date))
        .then_with(|| b.source_priority.cmp(&a.source_priority))
        .then_with(|| b.commonality.total_cmp(&a.commonality))
        .then_with(|| a.code.cmp(&b.code))
}

/// Select the single best ethnicity code for one participant's observations.
pub fn resolve<C>(
    observations: &[Observation],
    policy: &ResolutionPolicy,
    commonality: &C,
) -> Result<String, ResolutionError>
where
    C: Commonality + ?Sized,
{
    rank_candidates(observations, policy, commonality)
        .into_iter()
        .next()
        .map(|c| c.code)
        .ok_or(ResolutionError::NoObservations)
}

/// Stored rows that may take part in ranking; unresolved references are left out.
pub fn resolvable_observations(stored: &[StoredObservation]) -> Vec<Observation> {
    stored
        .iter()
        .filter(|o| o.is_resolvable())
        .map(StoredObservation::observation)
        .collect()
}
