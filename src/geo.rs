// Geo primitives: haversine distance, bearing, and the zone-cell grid used
// for location obfuscation.
//
// Cells are derived the integer-bucket way: scale degrees to e7 units and
// divide by the cell edge. Cell widths are computed at the equator; at
// courier latitudes the longitude error stays well under the privacy radius
// the grid is meant to provide.

use crate::error::ApiError;

/// WGS-84 mean sphere radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// 1 meter ≈ 90 e7-degree units of latitude.
const E7_UNITS_PER_METER: f64 = 90.0;

pub const MIN_RESOLUTION: u8 = 7;
pub const MAX_RESOLUTION: u8 = 9;

pub fn validate_coords(lat: f64, lon: f64) -> Result<(), ApiError> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(ApiError::Validation(format!(
            "coordinates out of range: ({lat}, {lon})"
        )));
    }
    Ok(())
}

/// Great-circle distance in meters.
pub fn haversine_m(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lon2) = (to.0.to_radians(), to.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let a = (dlat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * a.sqrt().asin() * EARTH_RADIUS_M
}

/// Initial bearing from `from` to `to`, degrees in [0, 360).
pub fn bearing_deg(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lon2) = (to.0.to_radians(), to.1.to_radians());
    let dlon = lon2 - lon1;

    let y = dlon.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

pub fn clamp_resolution(resolution: u8) -> u8 {
    resolution.clamp(MIN_RESOLUTION, MAX_RESOLUTION)
}

/// Cell edge length in meters per resolution (7 coarsest, 9 finest).
pub fn cell_edge_m(resolution: u8) -> f64 {
    match clamp_resolution(resolution) {
        7 => 1220.0,
        8 => 461.0,
        9 => 174.0,
        _ => unreachable!("resolution is clamped"),
    }
}

/// Resolution whose cell edge is closest to a target grid size in meters.
pub fn resolution_for_grid_size(meters: u32) -> u8 {
    let target = f64::from(meters);
    (MIN_RESOLUTION..=MAX_RESOLUTION)
        .min_by_key(|r| (cell_edge_m(*r) - target).abs() as u64)
        .unwrap_or(8)
}

fn divisor_e7(resolution: u8) -> i64 {
    (cell_edge_m(resolution) * E7_UNITS_PER_METER) as i64
}

/// Maps a raw fix to its zone cell id at the given (clamped) resolution.
/// The id encodes only the resolution and cell indices — the fix itself is
/// not recoverable, only the cell centre.
pub fn zone_id(lat: f64, lon: f64, resolution: u8) -> String {
    let resolution = clamp_resolution(resolution);
    let divisor = divisor_e7(resolution);
    let lat_e7 = (lat * 1e7) as i64;
    let lon_e7 = (lon * 1e7) as i64;
    // div_euclid keeps southern/western cells stable across zero.
    let x = lat_e7.div_euclid(divisor);
    let y = lon_e7.div_euclid(divisor);
    format!("z{resolution}-{x}-{y}")
}

/// Centre of a zone cell. `None` for ids this grid never produced.
pub fn zone_center(id: &str) -> Option<(f64, f64)> {
    let rest = id.strip_prefix('z')?;
    let (res_part, tail) = rest.split_once('-')?;
    let resolution: u8 = res_part.parse().ok()?;
    if !(MIN_RESOLUTION..=MAX_RESOLUTION).contains(&resolution) {
        return None;
    }
    // The indices may each carry a leading minus sign, so the x/y split is
    // the first '-' that is not a sign position.
    let (x, y) = split_signed_pair(tail)?;
    let divisor = divisor_e7(resolution) as f64;
    let lat = ((x as f64) + 0.5) * divisor / 1e7;
    let lon = ((y as f64) + 0.5) * divisor / 1e7;
    if validate_coords(lat, lon).is_err() {
        return None;
    }
    Some((lat, lon))
}

/// Splits "x-y" where either index may carry a leading minus sign.
fn split_signed_pair(tail: &str) -> Option<(i64, i64)> {
    // The separator is the first '-' that is not a sign position.
    let bytes = tail.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'-' && i != 0 {
            let x: i64 = tail[..i].parse().ok()?;
            let y: i64 = tail[i + 1..].parse().ok()?;
            return Some((x, y));
        }
    }
    None
}
