//! Normalization of upstream observation JSON into the canonical model.
//!
//! This is the single point of contact with the untyped external shape:
//! a pure function, no network, no store. Absent nested fields (taxon,
//! geometry, quality) become `None` rather than errors; only a missing
//! identity or watermark is fatal for a row.

use chrono::{DateTime, Utc};
use fieldscore_core::{Observation, QualityTier};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "fieldscore-adapters";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("observation is missing a numeric id")]
    MissingExternalId,
    #[error("observation {external_id} is missing a parseable updated_at")]
    MissingUpdatedAt { external_id: i64 },
}

/// Map one upstream JSON object to a canonical [`Observation`].
pub fn normalize_observation(raw: &JsonValue) -> Result<Observation, NormalizeError> {
    let external_id = raw
        .get("id")
        .and_then(JsonValue::as_i64)
        .ok_or(NormalizeError::MissingExternalId)?;

    let updated_at = raw
        .get("updated_at")
        .and_then(JsonValue::as_str)
        .and_then(parse_timestamp)
        .ok_or(NormalizeError::MissingUpdatedAt { external_id })?;

    let (latitude, longitude) = extract_coordinates(raw);

    Ok(Observation {
        external_id,
        observer_login: string_at(raw, &["user", "login"]),
        taxon_id: raw
            .pointer("/taxon/id")
            .and_then(JsonValue::as_i64),
        taxon_rank: string_at(raw, &["taxon", "rank"]),
        observed_at: string_at(raw, &["time_observed_at"])
            .as_deref()
            .and_then(parse_timestamp),
        created_at: string_at(raw, &["created_at"])
            .as_deref()
            .and_then(parse_timestamp),
        updated_at,
        latitude,
        longitude,
        quality_grade: QualityTier::from_upstream(
            raw.get("quality_grade").and_then(JsonValue::as_str),
        ),
        raw_payload: raw.clone(),
    })
}

fn string_at(raw: &JsonValue, segments: &[&str]) -> Option<String> {
    let mut cursor = raw;
    for segment in segments {
        cursor = cursor.get(segment)?;
    }
    cursor.as_str().map(ToString::to_string)
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Coordinate extraction prefers the structured geometry (`geojson` is
/// `[lon, lat]` order) and falls back to the delimited `location`
/// string (`"lat,lon"`). Non-finite values become `None`.
fn extract_coordinates(raw: &JsonValue) -> (Option<f64>, Option<f64>) {
    if let Some(coords) = raw
        .pointer("/geojson/coordinates")
        .and_then(JsonValue::as_array)
    {
        let lon = coords.first().and_then(JsonValue::as_f64);
        let lat = coords.get(1).and_then(JsonValue::as_f64);
        if let (Some(lat), Some(lon)) = (lat, lon) {
            return (finite(lat), finite(lon));
        }
    }

    if let Some(location) = raw.get("location").and_then(JsonValue::as_str) {
        let mut parts = location.splitn(2, ',');
        let lat = parts.next().and_then(|s| s.trim().parse::<f64>().ok());
        let lon = parts.next().and_then(|s| s.trim().parse::<f64>().ok());
        return (lat.and_then(finite), lon.and_then(finite));
    }

    (None, None)
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}
