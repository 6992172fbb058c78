//! Station registry: resolve-or-create during ingestion and nearest-station lookup.

use sqlx::{SqliteConnection, SqlitePool};

use crate::db::models::WeatherStation;
use crate::db::queries;

/// Mean Earth radius in kilometres used for great-circle distances.
const EARTH_RADIUS_KM: f64 = 6373.0;

/// Return the registered station for `candidate.id`, inserting `candidate`
/// first when the code is unknown. Existing stations are never modified.
///
/// The flag is `true` when the station was created by this call.
pub async fn resolve_or_create(
    conn: &mut SqliteConnection,
    candidate: &WeatherStation,
) -> Result<(WeatherStation, bool), sqlx::Error> {
    if let Some(existing) = queries::get_station(&mut *conn, &candidate.id).await? {
        return Ok((existing, false));
    }
    queries::insert_station(&mut *conn, candidate).await?;
    tracing::debug!("Registered new station {} ({})", candidate.id, candidate.name);
    Ok((candidate.clone(), true))
}

/// Great-circle distance between two points, in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_KM * c
}

/// The registered station closest to a point, with its distance in km.
pub async fn nearest_station(
    pool: &SqlitePool,
    latitude: f64,
    longitude: f64,
) -> Result<Option<(WeatherStation, f64)>, sqlx::Error> {
    let stations = queries::list_stations(pool).await?;
    Ok(stations
        .into_iter()
        .map(|s| {
            let d = haversine_km(latitude, longitude, s.latitude, s.longitude);
            (s, d)
        })
        .min_by(|a, b| a.1.total_cmp(&b.1)))
}
