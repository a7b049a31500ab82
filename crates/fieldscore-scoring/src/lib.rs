//! Deterministic per-participant scoring over synchronized records.
//!
//! The engine is a pure function of the record set: grouping uses
//! `BTreeMap`, every ordering has a total tie-break on `external_id`,
//! and recomputation over the same input reproduces identical entries.
//! Pipeline per run: collect, bucket novelty, suppress duplicates,
//! aggregate. Writing is the store's concern.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use fieldscore_core::{
    is_species_or_finer, QualityTier, ScorableRecord, ScoreBreakdown, ScoreEntry, ScoringConfig,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fieldscore-scoring";

/// Bucket identity for novelty ranking: taxon, rounded location, and
/// time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct BucketKey {
    taxon_id: i64,
    lat: i64,
    lon: i64,
    window: i64,
}

fn rounded_coord(value: f64, decimals: u32) -> i64 {
    let scale = 10f64.powi(decimals as i32);
    (value * scale).round() as i64
}

fn bucket_for(record: &ScorableRecord, cfg: &ScoringConfig) -> Option<BucketKey> {
    if record.quality < cfg.novelty_min_quality {
        return None;
    }
    if !record
        .taxon_rank
        .as_deref()
        .is_some_and(is_species_or_finer)
    {
        return None;
    }
    let taxon_id = record.taxon_id?;
    let lat = record.latitude?;
    let lon = record.longitude?;
    let observed_at = record.observed_at?;
    Some(BucketKey {
        taxon_id,
        lat: rounded_coord(lat, cfg.coord_decimals),
        lon: rounded_coord(lon, cfg.coord_decimals),
        window: observed_at.timestamp().div_euclid(cfg.time_bucket_secs),
    })
}

/// String form of the novelty bucket, stored on participant links for
/// inspection. `None` for records that are not novelty-eligible.
pub fn novelty_key(
    taxon_id: Option<i64>,
    taxon_rank: Option<&str>,
    quality: QualityTier,
    latitude: Option<f64>,
    longitude: Option<f64>,
    observed_at: Option<DateTime<Utc>>,
    cfg: &ScoringConfig,
) -> Option<String> {
    let probe = ScorableRecord {
        external_id: 0,
        participant_id: Uuid::nil(),
        taxon_id,
        taxon_rank: taxon_rank.map(ToString::to_string),
        quality,
        latitude,
        longitude,
        observed_at,
    };
    bucket_for(&probe, cfg).map(|key| {
        format!(
            "t{}:y{}:x{}:w{}",
            key.taxon_id, key.lat, key.lon, key.window
        )
    })
}

/// Compute one entry per participant for `run_id`. Input records must
/// already be scope-filtered and resolved; the output is sorted by
/// participant id.
pub fn compute_entries(
    run_id: Uuid,
    records: &[ScorableRecord],
    cfg: &ScoringConfig,
) -> Vec<ScoreEntry> {
    let mut by_participant: BTreeMap<Uuid, Vec<&ScorableRecord>> = BTreeMap::new();
    for record in records {
        by_participant
            .entry(record.participant_id)
            .or_default()
            .push(record);
    }

    let novelty_sums = novelty_bonuses(records, cfg);

    let mut entries = Vec::with_capacity(by_participant.len());
    for (participant_id, mut rows) in by_participant {
        rows.sort_by_key(|r| (r.observed_at, r.external_id));

        let duplicates = count_adjacent_duplicates(&rows, cfg);
        let breakdown = aggregate(
            &rows,
            novelty_sums.get(&participant_id).copied().unwrap_or(0.0),
            duplicates,
            cfg,
        );
        let total_points = breakdown.volume
            + breakdown.unique_taxa
            + breakdown.quality
            + breakdown.rank_level
            + breakdown.participation
            + breakdown.novelty_bonus
            - breakdown.duplicate_penalty;

        entries.push(ScoreEntry {
            run_id,
            participant_id,
            breakdown,
            total_points,
        });
    }
    entries
}

/// Rank records inside each novelty bucket by observation time (ties
/// broken on `external_id`) and pay out the rank-points table, then the
/// flat late bonus past its end.
fn novelty_bonuses(records: &[ScorableRecord], cfg: &ScoringConfig) -> BTreeMap<Uuid, f64> {
    let mut buckets: BTreeMap<BucketKey, Vec<&ScorableRecord>> = BTreeMap::new();
    for record in records {
        if let Some(key) = bucket_for(record, cfg) {
            buckets.entry(key).or_default().push(record);
        }
    }

    let mut sums: BTreeMap<Uuid, f64> = BTreeMap::new();
    for (_, mut members) in buckets {
        members.sort_by_key(|r| (r.observed_at, r.external_id));
        for (rank, record) in members.iter().enumerate() {
            let points = cfg
                .rank_points
                .get(rank)
                .copied()
                .unwrap_or(cfg.late_bonus);
            *sums.entry(record.participant_id).or_default() += points;
        }
    }
    sums
}

/// Adjacent pairs only: a consecutive run of N identical observations
/// yields N-1 duplicate counts, never the full pairwise count.
fn count_adjacent_duplicates(time_ordered: &[&ScorableRecord], cfg: &ScoringConfig) -> usize {
    let window = Duration::seconds(cfg.duplicate_window_secs);
    let mut count = 0;
    for pair in time_ordered.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let (Some(ta), Some(tb)) = (a.observed_at, b.observed_at) else {
            continue;
        };
        if a.taxon_id.is_none() || a.taxon_id != b.taxon_id {
            continue;
        }
        if tb - ta > window {
            continue;
        }
        let same_spot = match (a.latitude, a.longitude, b.latitude, b.longitude) {
            (Some(alat), Some(alon), Some(blat), Some(blon)) => {
                rounded_coord(alat, cfg.coord_decimals) == rounded_coord(blat, cfg.coord_decimals)
                    && rounded_coord(alon, cfg.coord_decimals)
                        == rounded_coord(blon, cfg.coord_decimals)
            }
            _ => false,
        };
        if same_spot {
            count += 1;
        }
    }
    count
}

fn aggregate(
    rows: &[&ScorableRecord],
    novelty_sum: f64,
    duplicates: usize,
    cfg: &ScoringConfig,
) -> ScoreBreakdown {
    let observation_count = rows.len() as f64;
    let unique_taxa = rows
        .iter()
        .filter_map(|r| r.taxon_id)
        .collect::<BTreeSet<_>>()
        .len() as f64;
    let research_grade = rows
        .iter()
        .filter(|r| r.quality == QualityTier::Research)
        .count() as f64;
    let species_level = rows
        .iter()
        .filter(|r| r.taxon_rank.as_deref().is_some_and(is_species_or_finer))
        .count() as f64;

    // Day boundaries at a fixed offset from UTC so recomputation does
    // not depend on the host timezone.
    let offset = Duration::hours(cfg.day_offset_hours as i64);
    let distinct_days = rows
        .iter()
        .filter_map(|r| r.observed_at)
        .map(|t| (t + offset).date_naive())
        .collect::<BTreeSet<_>>()
        .len() as f64;

    ScoreBreakdown {
        volume: cfg.weights.volume * (1.0 + observation_count).ln(),
        unique_taxa: cfg.weights.unique * (1.0 + unique_taxa).ln(),
        quality: cfg.weights.quality * research_grade,
        rank_level: cfg.weights.rank * species_level,
        participation: cfg.weights.participation * distinct_days,
        novelty_bonus: novelty_sum,
        duplicate_penalty: duplicates as f64 * cfg.duplicate_penalty,
    }
}
