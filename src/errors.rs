use thiserror::Error;

/// Errors surfaced by an ingestion run or a query.
///
/// Transport and feed-format errors are scoped to one download unit and are
/// logged by the worker that hit them; database errors abort the whole batch.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("HTTP request failed for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned HTTP {status}")]
    HttpStatus {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("KML error: {0}")]
    Kml(#[from] crate::services::kml::KmlError),

    #[error("ASCII bulletin error: {0}")]
    Ascii(#[from] crate::services::ascii::AsciiError),

    #[error("Feed format error: {0}")]
    Format(String),

    #[error("Result channel closed before the worker finished")]
    ChannelClosed,

    #[error("Worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}
