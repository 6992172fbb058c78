//! ASCII MOS bulletin parser.
//!
//! Bulletins are bzip2-compressed text with two parts. Lines starting with `*`
//! describe stations:
//!
//! ```text
//! * 10865 MUENCHEN-STADT          11.33  48.10   515
//! ```
//!
//! (code, name, longitude and latitude as `ddd.mm`, elevation). The forecast
//! block starts at `VERSION`, followed by a `MOS` line holding the creation time
//! as `yymmddHH`, then one line per station and lead time:
//!
//! ```text
//!  10865   6   8.4   6.1  230  10  18 1016.5  6  3  5  7  61 20000  0.4  120  140  980
//! ```
//!
//! Columns after code and lead hour: TT TD DD FF FX PPPP N NL NM NH WW VV, then
//! precipitation and three radiation sums whose accumulation window (1h or 3h)
//! is given by the file name. Wind speeds are in knots.

use std::io::Read;
use std::sync::OnceLock;

use bzip2::read::BzDecoder;
use chrono::{Duration, NaiveDate, NaiveDateTime};
use regex::Regex;
use thiserror::Error;

use crate::db::models::{Field, WeatherStation};
use crate::helpers::{parse_ascii_value, unpack_degrees_minutes, Conversion};
use crate::services::intents::ForecastUpdate;

/// Station code or lead hour marking a terminator line.
const TERMINATOR: &str = "99999";

#[derive(Debug, Error)]
pub enum AsciiError {
    #[error("bzip2 decode failed: {0}")]
    Decode(#[from] std::io::Error),
    #[error("forecast line before the MOS creation time line")]
    MissingCreationTime,
    #[error("invalid MOS creation time: '{0}'")]
    InvalidCreationTime(String),
}

/// Accumulation window of the precipitation and radiation columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Horizon {
    OneHour,
    ThreeHour,
}

fn horizon_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[^0-9])([13])h(?:[^a-z]|$)").expect("static regex is valid")
    })
}

impl Horizon {
    /// Read the horizon marker (`1h` / `3h`) from a bulletin file name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let caps = horizon_re().captures(&lower)?;
        match caps.get(1)?.as_str() {
            "1" => Some(Horizon::OneHour),
            "3" => Some(Horizon::ThreeHour),
            _ => None,
        }
    }

    /// Target fields for precipitation, short-wave, global and long-wave radiation.
    fn fields(self) -> [Field; 4] {
        match self {
            Horizon::OneHour => [Field::Rr1, Field::Qsw1, Field::Gss1, Field::Qlw1],
            Horizon::ThreeHour => [Field::Rr3, Field::Qsw3, Field::Gss3, Field::Qlw3],
        }
    }
}

/// Only bulletins marked as the latest run are ingested.
pub fn is_latest(name: &str) -> bool {
    name.to_ascii_lowercase().contains("latest")
}

/// Columns preceding the horizon-dependent ones, with their conversions.
const LEADING_COLUMNS: [(Field, Conversion); 12] = [
    (Field::Tt, Conversion::Identity),
    (Field::Td, Conversion::Identity),
    (Field::Dd, Conversion::Identity),
    (Field::Ff, Conversion::KnotsToKmh),
    (Field::Fx, Conversion::KnotsToKmh),
    (Field::Pppp, Conversion::Identity),
    (Field::N, Conversion::Identity),
    (Field::Nl, Conversion::Identity),
    (Field::Nm, Conversion::Identity),
    (Field::Nh, Conversion::Identity),
    (Field::Ww, Conversion::Identity),
    (Field::Vv, Conversion::Identity),
];

/// Content of one bulletin.
#[derive(Debug)]
pub struct AsciiBulletin {
    pub issued_at: Option<NaiveDateTime>,
    pub stations: Vec<WeatherStation>,
    pub updates: Vec<ForecastUpdate>,
    pub rejected_tokens: usize,
}

pub fn decompress(bytes: &[u8]) -> Result<String, AsciiError> {
    let mut decoder = BzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn parse_creation_time(token: &str) -> Option<NaiveDateTime> {
    if token.len() != 8 || !token.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let num = |range: std::ops::Range<usize>| token[range].parse::<u32>().ok();
    let year = 2000 + num(0..2)? as i32;
    NaiveDate::from_ymd_opt(year, num(2..4)?, num(4..6)?)?.and_hms_opt(num(6..8)?, 0, 0)
}

fn parse_station_line(line: &str) -> Option<WeatherStation> {
    let body = line.trim_start().strip_prefix('*')?;
    let tokens: Vec<&str> = body.split_whitespace().collect();
    if tokens.len() < 5 {
        return None;
    }
    let code = tokens[0];
    if code == TERMINATOR || code.len() > 5 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    let n = tokens.len();
    let longitude = unpack_degrees_minutes(tokens[n - 3])?;
    let latitude = unpack_degrees_minutes(tokens[n - 2])?;
    let amsl = parse_ascii_value(tokens[n - 1])
        .ok()
        .flatten()
        .map(|v| v.round() as i64);

    Some(WeatherStation {
        id: code.to_string(),
        name: tokens[1..n - 3].join(" "),
        latitude,
        longitude,
        amsl,
    })
}

/// Parse decompressed bulletin text.
pub fn parse_bulletin(text: &str, horizon: Horizon) -> Result<AsciiBulletin, AsciiError> {
    let horizon_fields = horizon.fields();
    let mut bulletin = AsciiBulletin {
        issued_at: None,
        stations: Vec::new(),
        updates: Vec::new(),
        rejected_tokens: 0,
    };
    let mut in_forecast_block = false;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('*') {
            if let Some(station) = parse_station_line(trimmed) {
                bulletin.stations.push(station);
            }
            continue;
        }
        if trimmed.starts_with("VERSION") {
            in_forecast_block = true;
            continue;
        }
        if trimmed.starts_with("MOS") {
            let token = trimmed
                .split_whitespace()
                .find(|t| t.len() == 8 && t.chars().all(|c| c.is_ascii_digit()))
                .ok_or_else(|| AsciiError::InvalidCreationTime(trimmed.to_string()))?;
            bulletin.issued_at = Some(
                parse_creation_time(token)
                    .ok_or_else(|| AsciiError::InvalidCreationTime(token.to_string()))?,
            );
            in_forecast_block = true;
            continue;
        }
        if !in_forecast_block {
            continue;
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        if tokens.len() < 2 || tokens[0] == TERMINATOR || tokens[1] == TERMINATOR {
            continue;
        }
        let issued_at = bulletin.issued_at.ok_or(AsciiError::MissingCreationTime)?;
        let Ok(lead_hours) = tokens[1].parse::<i64>() else {
            tracing::debug!("ASCII: skipping line with bad lead hour: {}", trimmed);
            continue;
        };

        let Some(valid_at) = Duration::try_hours(lead_hours)
            .and_then(|lead| issued_at.checked_add_signed(lead))
        else {
            tracing::debug!("ASCII: skipping line with out-of-range lead hour: {}", trimmed);
            continue;
        };
        let mut update = ForecastUpdate::new(tokens[0], valid_at).issued_at(Some(issued_at));

        let columns = LEADING_COLUMNS.iter().copied().chain(
            horizon_fields
                .iter()
                .map(|f| (*f, Conversion::Identity)),
        );
        for ((field, conversion), token) in columns.zip(tokens.iter().skip(2)) {
            match parse_ascii_value(token) {
                Ok(Some(v)) => update.set(field, conversion.apply(v)),
                Ok(None) => {}
                Err(_) => {
                    tracing::debug!(
                        "ASCII {} {}: column {} value '{}' rejected",
                        tokens[0],
                        valid_at,
                        field.column(),
                        token
                    );
                    bulletin.rejected_tokens += 1;
                }
            }
        }

        if !update.is_empty() {
            bulletin.updates.push(update);
        }
    }

    Ok(bulletin)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::FieldValue;
    use bzip2::write::BzEncoder;
    use bzip2::Compression;
    use chrono::NaiveTime;
    use std::io::Write;

    const SAMPLE: &str = "\
* 10865 MUENCHEN-STADT          11.33  48.10   515
* P0489 ZUGSPITZE GIPFEL        10.59  47.25  2964
*
VERSION 2.1
MOS     24101603
 10865   3   8.4   6.1  230  10  18 1016.5  6  3  5  7  61 20000  0.4  120  140  980
 10865   6   9.0   --  240  ---  --  1017.0  /  /  /  /  //  ////   ---  ---  ---  ---
 P0489   3  -4.5  -7.0  270  30  45  720.0  8  8  8  8  71 900  1.2  10  20  700
 99999  99999
";

    #[test]
    fn test_horizon_from_file_name() {
        assert_eq!(Horizon::from_file_name("MOS_ASCII_1h_latest.bz2"), Some(Horizon::OneHour));
        assert_eq!(Horizon::from_file_name("mos_3H_LATEST.bz2"), Some(Horizon::ThreeHour));
        assert_eq!(Horizon::from_file_name("mos_latest.bz2"), None);
        assert_eq!(Horizon::from_file_name("mos_11h_latest.bz2"), None);
    }

    #[test]
    fn test_is_latest() {
        assert!(is_latest("MOS_1h_LATEST.bz2"));
        assert!(!is_latest("MOS_1h_2024101603.bz2"));
    }

    #[test]
    fn test_stations_from_metadata_lines() {
        let bulletin = parse_bulletin(SAMPLE, Horizon::OneHour).unwrap();
        assert_eq!(bulletin.stations.len(), 2);

        let munich = &bulletin.stations[0];
        assert_eq!(munich.id, "10865");
        assert_eq!(munich.name, "MUENCHEN-STADT");
        assert!((munich.longitude - 11.55).abs() < 1e-9);
        assert!((munich.latitude - (48.0 + 10.0 / 60.0)).abs() < 1e-9);
        assert_eq!(munich.amsl, Some(515));

        assert_eq!(bulletin.stations[1].name, "ZUGSPITZE GIPFEL");
    }

    #[test]
    fn test_valid_time_is_creation_plus_lead() {
        let bulletin = parse_bulletin(SAMPLE, Horizon::OneHour).unwrap();
        let issued = NaiveDate::from_ymd_opt(2024, 10, 16)
            .unwrap()
            .and_hms_opt(3, 0, 0)
            .unwrap();
        assert_eq!(bulletin.issued_at, Some(issued));
        assert_eq!(bulletin.updates.len(), 3);
        assert_eq!(bulletin.updates[0].time, NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        assert_eq!(bulletin.updates[1].time, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(bulletin.updates[0].issuetime, Some(issued));
    }

    #[test]
    fn test_wind_knots_to_kmh() {
        let bulletin = parse_bulletin(SAMPLE, Horizon::OneHour).unwrap();
        match bulletin.updates[0].values[&Field::Ff] {
            FieldValue::Real(v) => assert!((v - 18.52).abs() < 1e-6),
            other => panic!("unexpected {:?}", other),
        }
        match bulletin.updates[2].values[&Field::Fx] {
            FieldValue::Real(v) => assert!((v - 83.34).abs() < 1e-6),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sentinels_are_absent() {
        let bulletin = parse_bulletin(SAMPLE, Horizon::OneHour).unwrap();
        let update = &bulletin.updates[1];
        assert_eq!(update.values[&Field::Tt], FieldValue::Real(9.0));
        assert_eq!(update.values[&Field::Dd], FieldValue::Integer(240));
        assert_eq!(update.values[&Field::Pppp], FieldValue::Real(1017.0));
        assert_eq!(update.values.len(), 3);
        assert_eq!(bulletin.rejected_tokens, 0);
    }

    #[test]
    fn test_horizon_selects_fields() {
        let one = parse_bulletin(SAMPLE, Horizon::OneHour).unwrap();
        assert_eq!(one.updates[0].values[&Field::Rr1], FieldValue::Real(0.4));
        assert_eq!(one.updates[0].values[&Field::Qlw1], FieldValue::Real(980.0));
        assert!(!one.updates[0].values.contains_key(&Field::Rr3));

        let three = parse_bulletin(SAMPLE, Horizon::ThreeHour).unwrap();
        assert_eq!(three.updates[0].values[&Field::Rr3], FieldValue::Real(0.4));
        assert_eq!(three.updates[0].values[&Field::Gss3], FieldValue::Real(140.0));
        assert!(!three.updates[0].values.contains_key(&Field::Rr1));
    }

    #[test]
    fn test_out_of_range_lead_hour_skips_only_that_line() {
        let text = "\
VERSION 2.1
MOS     24101603
 10865 99999999999999   8.4
 10865 2500000000   8.5
 10865   3   8.6
";
        let bulletin = parse_bulletin(text, Horizon::OneHour).unwrap();
        assert_eq!(bulletin.updates.len(), 1);
        assert_eq!(bulletin.updates[0].values[&Field::Tt], FieldValue::Real(8.6));
    }

    #[test]
    fn test_data_before_creation_time_is_an_error() {
        let text = "VERSION 2.1\n 10865 3 8.4\n";
        assert!(matches!(
            parse_bulletin(text, Horizon::OneHour),
            Err(AsciiError::MissingCreationTime)
        ));
    }

    #[test]
    fn test_decompress_round_trip() {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(SAMPLE.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(decompress(&compressed).unwrap(), SAMPLE);
    }
}
