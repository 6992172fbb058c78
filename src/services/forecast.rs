//! Forecast ingestion runs and nearest-time lookup.
//!
//! Each `ingest_*` run discovers its download units, fans them out over the
//! worker pool, and applies the collected intents in one transaction. The
//! `update_from_*` wrappers log the outcome and reduce it to a success flag
//! for the scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{NaiveDateTime, Timelike, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::models::{ForecastDataPoint, NearestForecast};
use crate::db::queries;
use crate::errors::IngestError;
use crate::services::ascii::{self, Horizon};
use crate::services::fanout::{apply_batch, emit, fan_out, ApplySummary, IntentSender};
use crate::services::intents::WriteIntent;
use crate::services::kml::{self, Placemark, ProductHeader};
use crate::services::poi::{parse_poi, station_code_from_link};
use crate::services::transport::{file_name, FeedClient};

/// Shared handles for an ingestion run.
#[derive(Debug, Clone)]
pub struct IngestContext {
    pub pool: SqlitePool,
    pub client: FeedClient,
    pub workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    Poi,
    Ascii,
    Kml,
}

impl Feed {
    pub fn as_str(self) -> &'static str {
        match self {
            Feed::Poi => "POI",
            Feed::Ascii => "ASCII",
            Feed::Kml => "KML",
        }
    }
}

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub feed: Feed,
    /// Download units (files, or placemarks for KML) handed to workers.
    pub units: usize,
    /// Units skipped after a transport or format error.
    pub failed_units: usize,
    pub chunks: usize,
    /// Chunks whose worker failed or panicked; their remaining units are lost.
    pub failed_chunks: usize,
    pub intents: usize,
    pub applied: ApplySummary,
}

fn progress(verbose: bool, message: &str) {
    if verbose {
        tracing::info!("{}", message);
    } else {
        tracing::debug!("{}", message);
    }
}

impl IngestReport {
    fn summary(&self, url: &str) -> String {
        format!(
            "{} ingest from {} done: {} units ({} failed), {} of {} chunks failed, {} intents, \
             {} stations created, {} forecasts inserted, {} updated, {} orphaned",
            self.feed.as_str(),
            url,
            self.units,
            self.failed_units,
            self.failed_chunks,
            self.chunks,
            self.intents,
            self.applied.stations_created,
            self.applied.forecasts_inserted,
            self.applied.forecasts_updated,
            self.applied.orphaned_forecasts
        )
    }
}

fn finish(verbose: bool, result: Result<IngestReport, IngestError>, feed: Feed, url: &str) -> bool {
    match result {
        Ok(report) if report.failed_chunks > 0 => {
            tracing::warn!("{}", report.summary(url));
            true
        }
        Ok(report) => {
            progress(verbose, &report.summary(url));
            true
        }
        Err(e) => {
            tracing::error!("{} ingest from {} failed: {}", feed.as_str(), url, e);
            false
        }
    }
}

// ---------------------------------------------------------------------------
// POI
// ---------------------------------------------------------------------------

async fn poi_worker(
    client: FeedClient,
    chunk: Vec<(String, String)>,
    tx: IntentSender,
    verbose: bool,
    failed: Arc<AtomicUsize>,
) -> Result<(), IngestError> {
    for (code, link) in chunk {
        let bytes = match client.fetch_bytes(&link).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("POI {}: skipping file: {}", code, e);
                failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        let parsed = parse_poi(&code, &text);
        progress(
            verbose,
            &format!(
                "POI {}: {} rows, {} skipped rows, {} rejected cells",
                code,
                parsed.updates.len(),
                parsed.skipped_rows,
                parsed.rejected_cells
            ),
        );
        for update in parsed.updates {
            emit(&tx, WriteIntent::Forecast(update)).await?;
        }
    }
    Ok(())
}

/// Ingest every station file listed in the POI directory at `url`.
///
/// POI files carry no station metadata, so files for unregistered stations
/// are left out.
pub async fn ingest_poi(
    ctx: &IngestContext,
    url: &str,
    verbose: bool,
) -> Result<IngestReport, IngestError> {
    let links = ctx.client.list_links(url).await?;
    let known = queries::known_station_ids(&ctx.pool).await?;

    let mut unknown = 0;
    let targets: Vec<(String, String)> = links
        .into_iter()
        .filter_map(|link| station_code_from_link(&link).map(|code| (code, link)))
        .filter(|(code, _)| {
            let keep = known.contains(code);
            if !keep {
                unknown += 1;
            }
            keep
        })
        .collect();
    if unknown > 0 {
        tracing::debug!("POI: {} files for unregistered stations skipped", unknown);
    }

    let units = targets.len();
    let failed = Arc::new(AtomicUsize::new(0));
    let client = ctx.client.clone();
    let failed_in_workers = Arc::clone(&failed);
    let fanned = fan_out(targets, ctx.workers, move |_, chunk, tx| {
        poi_worker(client.clone(), chunk, tx, verbose, Arc::clone(&failed_in_workers))
    })
    .await;

    let intents = fanned.intents.len();
    let applied = apply_batch(&ctx.pool, fanned.intents).await?;
    Ok(IngestReport {
        feed: Feed::Poi,
        units,
        failed_units: failed.load(Ordering::Relaxed),
        chunks: fanned.chunks,
        failed_chunks: fanned.failed_chunks,
        intents,
        applied,
    })
}

pub async fn update_from_poi(ctx: &IngestContext, url: &str, verbose: bool) -> bool {
    finish(verbose, ingest_poi(ctx, url, verbose).await, Feed::Poi, url)
}

// ---------------------------------------------------------------------------
// ASCII
// ---------------------------------------------------------------------------

async fn ascii_worker(
    client: FeedClient,
    chunk: Vec<(String, Horizon)>,
    tx: IntentSender,
    verbose: bool,
    failed: Arc<AtomicUsize>,
) -> Result<(), IngestError> {
    for (link, horizon) in chunk {
        let name = file_name(&link).to_string();
        let bytes = match client.fetch_bytes(&link).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("ASCII {}: skipping bulletin: {}", name, e);
                failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        let parsed = tokio::task::spawn_blocking(move || {
            ascii::decompress(&bytes).and_then(|text| ascii::parse_bulletin(&text, horizon))
        })
        .await?;
        let bulletin = match parsed {
            Ok(bulletin) => bulletin,
            Err(e) => {
                tracing::warn!("ASCII {}: skipping bulletin: {}", name, e);
                failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        };
        progress(
            verbose,
            &format!(
                "ASCII {}: {} stations, {} forecasts, {} rejected tokens",
                name,
                bulletin.stations.len(),
                bulletin.updates.len(),
                bulletin.rejected_tokens
            ),
        );
        for station in bulletin.stations {
            emit(&tx, WriteIntent::Station(station)).await?;
        }
        for update in bulletin.updates {
            emit(&tx, WriteIntent::Forecast(update)).await?;
        }
    }
    Ok(())
}

/// Bulletins to ingest: `url` itself when it names a `.bz2` file, otherwise
/// the latest-run entries of the directory listing with a horizon marker.
async fn ascii_targets(
    client: &FeedClient,
    url: &str,
) -> Result<Vec<(String, Horizon)>, IngestError> {
    let candidates = if url.to_ascii_lowercase().ends_with(".bz2") {
        vec![url.to_string()]
    } else {
        client.list_links(url).await?
    };

    Ok(candidates
        .into_iter()
        .filter_map(|link| {
            let name = file_name(&link);
            if !ascii::is_latest(name) {
                return None;
            }
            match Horizon::from_file_name(name) {
                Some(horizon) => Some((link, horizon)),
                None => {
                    tracing::debug!("ASCII: no horizon marker in {}, skipping", name);
                    None
                }
            }
        })
        .collect())
}

pub async fn ingest_ascii(
    ctx: &IngestContext,
    url: &str,
    verbose: bool,
) -> Result<IngestReport, IngestError> {
    let targets = ascii_targets(&ctx.client, url).await?;
    let units = targets.len();
    let failed = Arc::new(AtomicUsize::new(0));
    let client = ctx.client.clone();
    let failed_in_workers = Arc::clone(&failed);
    let fanned = fan_out(targets, ctx.workers, move |_, chunk, tx| {
        ascii_worker(client.clone(), chunk, tx, verbose, Arc::clone(&failed_in_workers))
    })
    .await;

    let intents = fanned.intents.len();
    let applied = apply_batch(&ctx.pool, fanned.intents).await?;
    Ok(IngestReport {
        feed: Feed::Ascii,
        units,
        failed_units: failed.load(Ordering::Relaxed),
        chunks: fanned.chunks,
        failed_chunks: fanned.failed_chunks,
        intents,
        applied,
    })
}

pub async fn update_from_ascii(ctx: &IngestContext, url: &str, verbose: bool) -> bool {
    finish(verbose, ingest_ascii(ctx, url, verbose).await, Feed::Ascii, url)
}

// ---------------------------------------------------------------------------
// KML
// ---------------------------------------------------------------------------

async fn kml_worker(
    index: usize,
    chunk: Vec<(Arc<ProductHeader>, Placemark)>,
    tx: IntentSender,
    verbose: bool,
) -> Result<(), IngestError> {
    let placemarks = chunk.len();
    let intents = tokio::task::spawn_blocking(move || {
        chunk
            .iter()
            .flat_map(|(header, placemark)| kml::placemark_intents(header, placemark))
            .collect::<Vec<_>>()
    })
    .await?;
    progress(
        verbose,
        &format!(
            "KML chunk {}: {} placemarks, {} intents",
            index,
            placemarks,
            intents.len()
        ),
    );
    for intent in intents {
        emit(&tx, intent).await?;
    }
    Ok(())
}

/// Ingest one zipped KML bundle. Placemarks are spread over the workers.
pub async fn ingest_kml(
    ctx: &IngestContext,
    url: &str,
    verbose: bool,
) -> Result<IngestReport, IngestError> {
    let bytes = ctx.client.fetch_bytes(url).await?;
    let doc = tokio::task::spawn_blocking(move || {
        kml::unzip_kml(&bytes).and_then(|xml| kml::parse_kml(&xml))
    })
    .await??;

    if doc.header.timesteps.is_empty() {
        return Err(IngestError::Format(
            "KML document has no forecast time steps".to_string(),
        ));
    }
    progress(
        verbose,
        &format!(
            "KML {}: {} time steps, {} placemarks",
            file_name(url),
            doc.header.timesteps.len(),
            doc.placemarks.len()
        ),
    );

    let items = kml::into_work_items(doc);
    let units = items.len();
    let fanned = fan_out(items, ctx.workers, move |index, chunk, tx| {
        kml_worker(index, chunk, tx, verbose)
    })
    .await;

    let intents = fanned.intents.len();
    let applied = apply_batch(&ctx.pool, fanned.intents).await?;
    Ok(IngestReport {
        feed: Feed::Kml,
        units,
        failed_units: 0,
        chunks: fanned.chunks,
        failed_chunks: fanned.failed_chunks,
        intents,
        applied,
    })
}

pub async fn update_from_kml(ctx: &IngestContext, url: &str, verbose: bool) -> bool {
    finish(verbose, ingest_kml(ctx, url, verbose).await, Feed::Kml, url)
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// Move forecasts whose valid date lies before today (UTC) into the archive.
pub async fn archive_past_forecasts(pool: &SqlitePool) -> Result<u64, IngestError> {
    let today = Utc::now().date_naive();
    let moved = queries::archive_before(pool, today).await?;
    tracing::info!("Archived {} forecast rows dated before {}", moved, today);
    Ok(moved)
}

// ---------------------------------------------------------------------------
// Nearest forecast
// ---------------------------------------------------------------------------

/// How `nearest_forecast` picks a row on the target date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NearestPolicy {
    /// Smallest time-of-day distance; the first stored row wins ties.
    Simple,
    /// Closest of the last row at or before and the first row after the
    /// target; the earlier one wins ties.
    #[default]
    Bracket,
}

fn minutes_of_day(t: chrono::NaiveTime) -> i64 {
    i64::from(t.hour()) * 60 + i64::from(t.minute())
}

fn pick_simple(rows: Vec<ForecastDataPoint>, target: chrono::NaiveTime) -> Option<ForecastDataPoint> {
    let target = minutes_of_day(target);
    rows.into_iter()
        .min_by_key(|row| (minutes_of_day(row.time) - target).abs())
}

fn pick_bracket(
    before: Option<ForecastDataPoint>,
    after: Option<ForecastDataPoint>,
    target: chrono::NaiveTime,
) -> Option<ForecastDataPoint> {
    match (before, after) {
        (Some(before), Some(after)) => {
            if after.time - target < target - before.time {
                Some(after)
            } else {
                Some(before)
            }
        }
        (before, after) => before.or(after),
    }
}

/// Forecast for `station_id` closest in time to `at` (UTC) on the same date.
///
/// Returns `Ok(None)` when the station has nothing stored for that date.
pub async fn nearest_forecast(
    pool: &SqlitePool,
    station_id: &str,
    at: NaiveDateTime,
    include_station: bool,
    policy: NearestPolicy,
) -> Result<Option<NearestForecast>, IngestError> {
    let (date, time) = (at.date(), at.time());
    let found = match policy {
        NearestPolicy::Simple => {
            pick_simple(queries::forecasts_on_date(pool, station_id, date).await?, time)
        }
        NearestPolicy::Bracket => {
            let before = queries::last_forecast_at_or_before(pool, station_id, date, time).await?;
            let after = queries::first_forecast_after(pool, station_id, date, time).await?;
            pick_bracket(before, after, time)
        }
    };

    let Some(forecast) = found else {
        return Ok(None);
    };
    let station = if include_station {
        queries::get_station(pool, station_id).await?
    } else {
        None
    };
    Ok(Some(NearestForecast { forecast, station }))
}
