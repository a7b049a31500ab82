//! Core domain model and shared configuration types for FieldScore.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fieldscore-core";

/// Upstream quality assessment tier, ordered coarsest to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    Casual,
    NeedsId,
    Research,
}

impl QualityTier {
    /// Parse the upstream string form. Unknown or absent grades are
    /// treated as the lowest tier rather than rejected.
    pub fn from_upstream(value: Option<&str>) -> Self {
        match value {
            Some("research") => Self::Research,
            Some("needs_id") => Self::NeedsId,
            _ => Self::Casual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Casual => "casual",
            Self::NeedsId => "needs_id",
            Self::Research => "research",
        }
    }
}

/// Whether a taxonomic rank string names a species-level or finer taxon.
pub fn is_species_or_finer(rank: &str) -> bool {
    matches!(
        rank,
        "species" | "hybrid" | "subspecies" | "variety" | "form" | "infrahybrid"
    )
}

/// One externally-sourced observation, canonicalized by the normalizer.
/// Exactly one stored row exists per `external_id`; `updated_at` is the
/// sync watermark and is non-decreasing per record across syncs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub external_id: i64,
    pub observer_login: Option<String>,
    pub taxon_id: Option<i64>,
    pub taxon_rank: Option<String>,
    pub observed_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub quality_grade: QualityTier,
    pub raw_payload: JsonValue,
}

/// Association between an observation and a scoring scope. Unique per
/// `(scope_id, external_id)`; `participant_id` is null when identity
/// resolution misses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantLink {
    pub scope_id: Uuid,
    pub external_id: i64,
    pub participant_id: Option<Uuid>,
    pub included: bool,
    pub novelty_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Closed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

/// One sync+score invocation as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub watermark_through: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub counts: RunCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub upserted: i64,
    pub deleted: i64,
    pub entries_written: i64,
}

/// Structured sub-scores behind one participant's total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub volume: f64,
    pub unique_taxa: f64,
    pub quality: f64,
    pub rank_level: f64,
    pub participation: f64,
    pub novelty_bonus: f64,
    pub duplicate_penalty: f64,
}

/// One participant's result for a run. Unique per `(run_id,
/// participant_id)` and fully determined by the record set visible to
/// that run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub run_id: Uuid,
    pub participant_id: Uuid,
    pub breakdown: ScoreBreakdown,
    pub total_points: f64,
}

/// The joined link+observation row the scoring engine consumes. Only
/// resolved, included links become scorable records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorableRecord {
    pub external_id: i64,
    pub participant_id: Uuid,
    pub taxon_id: Option<i64>,
    pub taxon_rank: Option<String>,
    pub quality: QualityTier,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub nelat: f64,
    pub nelng: f64,
    pub swlat: f64,
    pub swlng: f64,
}

/// Source-side filter window for a sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncFilters {
    pub date_start: Option<NaiveDate>,
    pub date_end: Option<NaiveDate>,
    pub bounding_box: Option<BoundingBox>,
    pub observer_logins: Vec<String>,
}

impl SyncFilters {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let (Some(start), Some(end)) = (self.date_start, self.date_end) {
            if end < start {
                return Err(ConfigError::new("date_end precedes date_start"));
            }
        }
        if let Some(bbox) = &self.bounding_box {
            if !bbox.nelat.is_finite()
                || !bbox.nelng.is_finite()
                || !bbox.swlat.is_finite()
                || !bbox.swlng.is_finite()
            {
                return Err(ConfigError::new("bounding box contains non-finite values"));
            }
        }
        Ok(())
    }
}

/// Batch-write tuning shared by observation, link, and entry writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertTuning {
    pub max_batch: usize,
    pub min_batch: usize,
    pub immediate_retries: usize,
}

impl Default for UpsertTuning {
    fn default() -> Self {
        Self {
            max_batch: 200,
            min_batch: 10,
            immediate_retries: 2,
        }
    }
}

impl UpsertTuning {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch == 0 {
            return Err(ConfigError::new("max_batch must be positive"));
        }
        if self.min_batch == 0 || self.min_batch > self.max_batch {
            return Err(ConfigError::new("min_batch must be in 1..=max_batch"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub volume: f64,
    pub unique: f64,
    pub quality: f64,
    pub rank: f64,
    pub participation: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            volume: 10.0,
            unique: 15.0,
            quality: 1.0,
            rank: 0.5,
            participation: 5.0,
        }
    }
}

/// Constants controlling novelty bucketing, duplicate suppression, and
/// the composite aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Decimal places kept when rounding coordinates into bucket keys.
    pub coord_decimals: u32,
    /// Width of the novelty time bucket, in seconds.
    pub time_bucket_secs: i64,
    /// Points for the Nth-ranked record in a bucket; past the end of the
    /// table the flat `late_bonus` applies.
    pub rank_points: Vec<f64>,
    pub late_bonus: f64,
    /// Adjacent observations of the same taxon within this many seconds
    /// at the same rounded location count as duplicates.
    pub duplicate_window_secs: i64,
    pub duplicate_penalty: f64,
    pub weights: ScoringWeights,
    /// Day boundaries for the participation term are computed at this
    /// fixed offset from UTC so results are portable across hosts.
    pub day_offset_hours: i32,
    pub novelty_min_quality: QualityTier,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            coord_decimals: 1,
            time_bucket_secs: 7 * 24 * 3600,
            rank_points: vec![10.0, 5.0, 2.0],
            late_bonus: 1.0,
            duplicate_window_secs: 3600,
            duplicate_penalty: 2.0,
            weights: ScoringWeights::default(),
            day_offset_hours: 0,
            novelty_min_quality: QualityTier::Research,
        }
    }
}

impl ScoringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rank_points.is_empty() {
            return Err(ConfigError::new("rank_points table is empty"));
        }
        if self.time_bucket_secs <= 0 {
            return Err(ConfigError::new("time_bucket_secs must be positive"));
        }
        if self.duplicate_window_secs < 0 {
            return Err(ConfigError::new("duplicate_window_secs must be non-negative"));
        }
        if self.coord_decimals > 6 {
            return Err(ConfigError::new("coord_decimals above 6 is meaningless"));
        }
        Ok(())
    }
}

/// Configuration rejected before any network or store activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid configuration: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}
