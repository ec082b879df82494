// Location obfuscator: raw GPS fixes in, coarse zone identifiers out.
//
// This is the privacy boundary. A raw fix that enters here exists only for
// the duration of the call; everything downstream (monitoring, broadcast,
// audit) sees the zone cell and a coarsened timestamp.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ok, ApiError};
use crate::geo;
use crate::http::AppState;

/// Obfuscated timestamps are floored to this bucket.
const TIME_BUCKET_SECS: i64 = 300;

pub const DEFAULT_RESOLUTION: u8 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementState {
    Stationary,
    Moving,
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObfuscatedLocation {
    #[serde(rename = "zoneId")]
    pub zone_id: String,
    #[serde(rename = "approxTime")]
    pub approx_time: DateTime<Utc>,
    #[serde(rename = "movementState")]
    pub movement_state: MovementState,
    pub resolution: u8,
}

/// Pure transform from a raw fix to its zone cell. Movement state is
/// `unknown` at this layer; the security monitor fills it in from history.
pub fn obfuscate(
    lat: f64,
    lon: f64,
    resolution: u8,
    at: DateTime<Utc>,
) -> Result<ObfuscatedLocation, ApiError> {
    geo::validate_coords(lat, lon)?;
    let resolution = geo::clamp_resolution(resolution);
    let bucket = at.timestamp().div_euclid(TIME_BUCKET_SECS) * TIME_BUCKET_SECS;
    let approx_time = Utc
        .timestamp_opt(bucket, 0)
        .single()
        .ok_or_else(|| ApiError::Internal("timestamp out of range".into()))?;

    Ok(ObfuscatedLocation {
        zone_id: geo::zone_id(lat, lon, resolution),
        approx_time,
        movement_state: MovementState::Unknown,
        resolution,
    })
}

// --- HTTP surface ---------------------------------------------------------

#[derive(Deserialize)]
struct ObfuscateBody {
    latitude: f64,
    longitude: f64,
    resolution: Option<u8>,
}

async fn obfuscate_handler(
    State(state): State<AppState>,
    Json(body): Json<ObfuscateBody>,
) -> Result<Response, ApiError> {
    let resolution = body
        .resolution
        .unwrap_or_else(|| geo::resolution_for_grid_size(state.config.location_grid_size_meters));
    let fix = obfuscate(body.latitude, body.longitude, resolution, Utc::now())?;
    Ok(ok(fix))
}

#[derive(Serialize)]
struct ZoneCenter {
    #[serde(rename = "zoneId")]
    zone_id: String,
    latitude: f64,
    longitude: f64,
    #[serde(rename = "edgeMeters")]
    edge_meters: f64,
}

async fn zone_center_handler(Path(id): Path<String>) -> Result<Response, ApiError> {
    let (latitude, longitude) = geo::zone_center(&id).ok_or(ApiError::NotFound("zone"))?;
    let resolution: u8 = id[1..2].parse().unwrap_or(DEFAULT_RESOLUTION);
    Ok(ok(ZoneCenter {
        zone_id: id,
        latitude,
        longitude,
        edge_meters: geo::cell_edge_m(resolution),
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/obfuscate", post(obfuscate_handler))
        .route("/zones/:id/center", get(zone_center_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obfuscate_clamps_resolution_and_buckets_time() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 7, 42).unwrap();
        let fix = obfuscate(-1.286, 36.817, 15, at).unwrap();
        assert_eq!(fix.resolution, 9);
        assert_eq!(fix.movement_state, MovementState::Unknown);
        // 09:07:42 floors to the 09:05:00 bucket.
        assert_eq!(fix.approx_time, Utc.with_ymd_and_hms(2026, 3, 14, 9, 5, 0).unwrap());
    }

    #[test]
    fn test_obfuscate_rejects_out_of_range() {
        assert!(obfuscate(-91.0, 0.0, 8, Utc::now()).is_err());
        assert!(obfuscate(0.0, 181.0, 8, Utc::now()).is_err());
    }

    #[test]
    fn test_output_carries_no_raw_fields() {
        let fix = obfuscate(-1.286, 36.817, 8, Utc::now()).unwrap();
        let json = serde_json::to_string(&fix).unwrap();
        assert!(!json.contains("latitude"), "obfuscated fix leaked: {json}");
        assert!(!json.contains("36.817"), "obfuscated fix leaked: {json}");
    }

    #[test]
    fn test_obfuscation_is_deterministic() {
        let at = Utc::now();
        let a = obfuscate(-1.2865, 36.8172, 8, at).unwrap();
        let b = obfuscate(-1.2865, 36.8172, 8, at).unwrap();
        assert_eq!(a.zone_id, b.zone_id);
        assert_eq!(a.approx_time, b.approx_time);
    }
}
