// forecast-ingest v0.1
use chrono::DateTime;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

mod config;
mod db;
mod errors;
mod helpers;
mod services;

use config::{AppConfig, LogFormat};
use errors::IngestError;
use services::forecast::{self, IngestContext, NearestPolicy};
use services::stations;
use services::transport::FeedClient;

#[derive(Parser, Debug)]
#[command(name = "forecast-ingest")]
#[command(about = "Ingest POI, ASCII and KML point forecasts into the station forecast store")]
struct Cli {
    /// Log one line per processed file or placemark chunk
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending database migrations and exit
    Migrate,

    /// Ingest per-station POI CSV files from a directory listing
    UpdatePoi {
        /// Directory listing URL (defaults to POI_URL)
        url: Option<String>,
    },

    /// Ingest the latest ASCII MOS bulletins
    UpdateAscii {
        /// Directory listing or .bz2 URL (defaults to ASCII_URL)
        url: Option<String>,
    },

    /// Ingest a zipped KML bundle
    UpdateKml {
        /// .kmz URL (defaults to KML_URL)
        url: Option<String>,
    },

    /// Move forecasts dated before today into the archive table
    Archive,

    /// Print the forecast nearest in time to a UNIX timestamp
    Nearest {
        station_id: String,
        timestamp: i64,

        /// Use the plain smallest-distance policy instead of the before/after bracket
        #[arg(long)]
        simple: bool,

        /// Include the station record in the output
        #[arg(long)]
        with_station: bool,
    },

    /// Print the registered station closest to a point
    NearestStation { latitude: f64, longitude: f64 },
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "forecast_ingest=info".into());
    let layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
    };
    tracing_subscriber::registry().with(filter).with(layer).init();
}

async fn run(cli: Cli, config: AppConfig) -> Result<bool, IngestError> {
    let pool = db::connect(&config.database_url).await?;
    let verbose = cli.verbose;

    let ok = match cli.command {
        Command::Migrate => {
            tracing::info!("Database migrations completed");
            true
        }
        Command::UpdatePoi { url } => {
            let ctx = ingest_context(pool.clone(), &config)?;
            let url = url.unwrap_or(config.poi_url);
            forecast::update_from_poi(&ctx, &url, verbose).await
        }
        Command::UpdateAscii { url } => {
            let ctx = ingest_context(pool.clone(), &config)?;
            let url = url.unwrap_or(config.ascii_url);
            forecast::update_from_ascii(&ctx, &url, verbose).await
        }
        Command::UpdateKml { url } => {
            let ctx = ingest_context(pool.clone(), &config)?;
            let url = url.unwrap_or(config.kml_url);
            forecast::update_from_kml(&ctx, &url, verbose).await
        }
        Command::Archive => {
            forecast::archive_past_forecasts(&pool).await?;
            true
        }
        Command::Nearest {
            station_id,
            timestamp,
            simple,
            with_station,
        } => {
            let Some(at) = DateTime::from_timestamp(timestamp, 0) else {
                tracing::error!("Timestamp {} is out of range", timestamp);
                return Ok(false);
            };
            let policy = if simple {
                NearestPolicy::Simple
            } else {
                NearestPolicy::Bracket
            };
            match forecast::nearest_forecast(&pool, &station_id, at.naive_utc(), with_station, policy)
                .await?
            {
                Some(found) => {
                    println!("{}", serde_json::to_string_pretty(&found).unwrap_or_default());
                    true
                }
                None => {
                    tracing::warn!("No forecast for station {} on {}", station_id, at.date_naive());
                    false
                }
            }
        }
        Command::NearestStation {
            latitude,
            longitude,
        } => match stations::nearest_station(&pool, latitude, longitude).await? {
            Some((station, distance_km)) => {
                let out = serde_json::json!({ "station": station, "distance_km": distance_km });
                println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
                true
            }
            None => {
                tracing::warn!("Station registry is empty");
                false
            }
        },
    };

    pool.close().await;
    Ok(ok)
}

fn ingest_context(
    pool: sqlx::SqlitePool,
    config: &AppConfig,
) -> Result<IngestContext, IngestError> {
    Ok(IngestContext {
        pool,
        client: FeedClient::new(&config.user_agent, config.http_timeout)?,
        workers: config.workers,
    })
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(LogFormat::from_env());
    let config = AppConfig::from_env();

    match run(cli, config).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    }
}
