//! Parallel fan-out over download units and the single-writer apply phase.
//!
//! Workers get a chunk of units and a sender; they never see the database.
//! The coordinator drains the channel while they run, then applies everything
//! in one transaction.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::db::queries;
use crate::errors::IngestError;
use crate::services::intents::WriteIntent;
use crate::services::stations::resolve_or_create;

/// Capacity of the worker → coordinator channel.
const INTENT_CHANNEL_CAPACITY: usize = 1024;

pub type IntentSender = mpsc::Sender<WriteIntent>;

/// Send one intent, failing if the coordinator has gone away.
pub async fn emit(tx: &IntentSender, intent: WriteIntent) -> Result<(), IngestError> {
    tx.send(intent).await.map_err(|_| IngestError::ChannelClosed)
}

/// Split `items` into at most `workers` contiguous, non-empty chunks.
///
/// Concatenating the chunks gives back the input in order. Earlier chunks
/// take the remainder, so sizes differ by at most one.
pub fn partition<T>(items: Vec<T>, workers: usize) -> Vec<Vec<T>> {
    let n = items.len();
    if n == 0 {
        return Vec::new();
    }
    let k = workers.clamp(1, n);
    let base = n / k;
    let extra = n % k;

    let mut chunks = Vec::with_capacity(k);
    let mut iter = items.into_iter();
    for i in 0..k {
        let size = base + usize::from(i < extra);
        chunks.push(iter.by_ref().take(size).collect());
    }
    chunks
}

/// What the workers produced.
#[derive(Debug, Default)]
pub struct FanOutResult {
    /// Intents in drain order.
    pub intents: Vec<WriteIntent>,
    pub chunks: usize,
    /// Chunks whose worker returned an error or panicked.
    pub failed_chunks: usize,
}

/// Run `job` once per chunk of `items`, concurrently, and collect what the
/// jobs emit.
///
/// A failing or panicking job is logged; whatever it sent before failing is
/// kept and its siblings run to completion.
pub async fn fan_out<T, F, Fut>(items: Vec<T>, workers: usize, job: F) -> FanOutResult
where
    T: Send + 'static,
    F: Fn(usize, Vec<T>, IntentSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), IngestError>> + Send + 'static,
{
    let chunks = partition(items, workers);
    let mut result = FanOutResult {
        chunks: chunks.len(),
        ..Default::default()
    };

    let (tx, mut rx) = mpsc::channel(INTENT_CHANNEL_CAPACITY);
    let job = Arc::new(job);
    let mut set = JoinSet::new();
    for (index, chunk) in chunks.into_iter().enumerate() {
        let tx = tx.clone();
        let job = Arc::clone(&job);
        set.spawn(async move { (index, job(index, chunk, tx).await) });
    }
    // The channel closes once every worker has dropped its sender.
    drop(tx);

    while let Some(intent) = rx.recv().await {
        result.intents.push(intent);
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((index, Err(e))) => {
                tracing::warn!("Worker {} failed: {}", index, e);
                result.failed_chunks += 1;
            }
            Err(e) => {
                tracing::error!("Worker panicked or was cancelled: {}", e);
                result.failed_chunks += 1;
            }
        }
    }

    result
}

/// Counts from one apply phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ApplySummary {
    pub stations_created: usize,
    pub forecasts_inserted: usize,
    pub forecasts_updated: usize,
    /// Forecasts skipped because their station is not registered.
    pub orphaned_forecasts: usize,
}

/// Apply intents in order inside one transaction.
///
/// Station intents resolve-or-create; forecast intents insert a new row or
/// merge their present fields into the existing one. Any database error rolls
/// the whole batch back.
pub async fn apply_batch(
    pool: &SqlitePool,
    intents: Vec<WriteIntent>,
) -> Result<ApplySummary, sqlx::Error> {
    let mut summary = ApplySummary::default();
    let mut tx = pool.begin().await?;
    let mut known = queries::known_station_ids(&mut *tx).await?;

    for intent in intents {
        match intent {
            WriteIntent::Station(station) => {
                if known.contains(&station.id) {
                    continue;
                }
                let (_, created) = resolve_or_create(&mut tx, &station).await?;
                if created {
                    summary.stations_created += 1;
                }
                known.insert(station.id);
            }
            WriteIntent::Forecast(update) => {
                if !known.contains(&update.station_id) {
                    summary.orphaned_forecasts += 1;
                    continue;
                }
                let existing =
                    queries::find_forecast(&mut *tx, &update.station_id, update.date, update.time)
                        .await?;
                if existing.is_some() {
                    queries::update_forecast(&mut *tx, &update).await?;
                    summary.forecasts_updated += 1;
                } else {
                    queries::insert_forecast(&mut *tx, &update).await?;
                    summary.forecasts_inserted += 1;
                }
            }
        }
    }

    tx.commit().await?;
    Ok(summary)
}
