use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite://forecasts.db?mode=rwc";
const DEFAULT_POI_URL: &str = "https://opendata.dwd.de/weather/local_forecasts/poi/";
const DEFAULT_ASCII_URL: &str = "https://opendata.dwd.de/weather/local_forecasts/mos/";
const DEFAULT_KML_URL: &str =
    "https://opendata.dwd.de/weather/local_forecasts/mos/MOSMIX_L/all_stations/kml/MOSMIX_L_LATEST.kmz";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// `LOG_FORMAT=json` selects JSON lines; anything else is plain text.
    pub fn from_env() -> Self {
        match var_or("LOG_FORMAT", "text").to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Application configuration, parsed from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub poi_url: String,
    pub ascii_url: String,
    pub kml_url: String,
    /// Per-request timeout for feed downloads.
    pub http_timeout: Duration,
    /// Size of the fan-out worker pool.
    pub workers: usize,
    pub user_agent: String,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Parse a numeric variable, falling back to `default` when unset or invalid.
fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("{}='{}' is not valid, using the default", name, raw);
            default
        }),
        Err(_) => default,
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: var_or("DATABASE_URL", DEFAULT_DATABASE_URL),
            poi_url: var_or("POI_URL", DEFAULT_POI_URL),
            ascii_url: var_or("ASCII_URL", DEFAULT_ASCII_URL),
            kml_url: var_or("KML_URL", DEFAULT_KML_URL),
            http_timeout: Duration::from_secs(parse_var(
                "HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )),
            workers: parse_var("WORKERS", default_workers()).max(1),
            user_agent: var_or(
                "USER_AGENT",
                concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
            ),
        }
    }
}
