//! KML (MOSMIX) bundle parser.
//!
//! A `.kmz` archive holds one KML document with a shared list of forecast
//! time steps and one placemark per station:
//!
//! ```xml
//! <kml:Placemark>
//!   <kml:name>10865</kml:name>
//!   <kml:description>MUENCHEN-STADT</kml:description>
//!   <kml:ExtendedData>
//!     <dwd:Forecast dwd:elementName="TTT">
//!       <dwd:value>  281.55  282.05  -  </dwd:value>
//!     </dwd:Forecast>
//!   </kml:ExtendedData>
//!   <kml:Point><kml:coordinates>11.55,48.17,515.0</kml:coordinates></kml:Point>
//! </kml:Placemark>
//! ```
//!
//! Value `i` of every array belongs to time step `i`. Parsing keeps document
//! order for both lists; conversion happens per placemark so it can be spread
//! across workers.

use std::io::{Cursor, Read};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::db::models::{Field, WeatherStation};
use crate::helpers::{parse_kml_value, Conversion};
use crate::services::intents::{ForecastUpdate, WriteIntent};

#[derive(Debug, Error)]
pub enum KmlError {
    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("IO error reading KML entry: {0}")]
    Io(#[from] std::io::Error),
    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("archive contains no .kml entry")]
    NoKmlEntry,
    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// Element code → target field and conversion. Codes not listed are ignored.
///
/// Temperatures arrive in Kelvin, wind in m/s, pressure in Pa, cloud cover in
/// percent and sunshine in seconds.
const KML_ELEMENTS: [(&str, Field, Conversion); 31] = [
    ("TTT", Field::Tt, Conversion::KelvinToCelsius),
    ("Td", Field::Td, Conversion::KelvinToCelsius),
    ("TX", Field::Tx, Conversion::KelvinToCelsius),
    ("TN", Field::Tn, Conversion::KelvinToCelsius),
    ("TG", Field::Tg, Conversion::KelvinToCelsius),
    ("DD", Field::Dd, Conversion::Identity),
    ("FF", Field::Ff, Conversion::MsToKmh),
    ("FX1", Field::Fx, Conversion::MsToKmh),
    ("FXh25", Field::Fx6, Conversion::Identity),
    ("FXh40", Field::Fx9, Conversion::Identity),
    ("FXh55", Field::Fx11, Conversion::Identity),
    ("RR1c", Field::Rr1, Conversion::Identity),
    ("RR3c", Field::Rr3, Conversion::Identity),
    ("RR6c", Field::Rr6, Conversion::Identity),
    ("RRdc", Field::Rr24, Conversion::Identity),
    ("R602", Field::Rrp6, Conversion::Identity),
    ("Rh02", Field::Rrp12, Conversion::Identity),
    ("Rd02", Field::Rrp24, Conversion::Identity),
    ("PEvap", Field::Ev, Conversion::Identity),
    ("ww", Field::Ww, Conversion::Identity),
    ("W1W2", Field::W, Conversion::Identity),
    ("VV", Field::Vv, Conversion::Identity),
    ("N", Field::N, Conversion::PercentToEighths),
    ("Neff", Field::Nf, Conversion::PercentToEighths),
    ("Nl", Field::Nl, Conversion::PercentToEighths),
    ("Nm", Field::Nm, Conversion::PercentToEighths),
    ("Nh", Field::Nh, Conversion::PercentToEighths),
    ("PPPP", Field::Pppp, Conversion::PaToHpa),
    ("SunD1", Field::Ss1, Conversion::SecondsToHours),
    ("SunD", Field::Ss24, Conversion::SecondsToHours),
    ("Rad1h", Field::Gss1, Conversion::Identity),
];

fn lookup_element(code: &str) -> Option<(Field, Conversion)> {
    KML_ELEMENTS
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, field, conversion)| (*field, *conversion))
}

/// Decode KML bytes using the encoding named in the XML declaration.
///
/// MOSMIX documents declare `ISO-8859-1`, where every byte is the code point
/// of the same value. Anything else is read as UTF-8, replacing invalid
/// sequences.
fn decode_kml(raw: &[u8]) -> String {
    let prolog_end = raw
        .iter()
        .position(|&b| b == b'>')
        .map_or(0, |i| i + 1);
    let prolog = String::from_utf8_lossy(&raw[..prolog_end]).to_ascii_lowercase();
    let latin1 = ["iso-8859-1", "iso8859-1", "latin1", "latin-1"]
        .iter()
        .any(|name| prolog.contains(name));
    if latin1 {
        raw.iter().map(|&b| char::from(b)).collect()
    } else {
        String::from_utf8_lossy(raw).into_owned()
    }
}

/// Shared header of a KML document.
#[derive(Debug, Clone, Default)]
pub struct ProductHeader {
    pub issued_at: Option<NaiveDateTime>,
    pub timesteps: Vec<NaiveDateTime>,
}

/// One station's raw, unconverted series.
#[derive(Debug, Clone, Default)]
pub struct Placemark {
    pub name: String,
    pub description: Option<String>,
    /// `(longitude, latitude, elevation)`
    pub coordinates: Option<(f64, f64, Option<f64>)>,
    /// `(element code, whitespace-separated values)` in document order.
    pub series: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct KmlDocument {
    pub header: ProductHeader,
    pub placemarks: Vec<Placemark>,
}

/// Extract the KML entry from a `.kmz` archive.
pub fn unzip_kml(bytes: &[u8]) -> Result<String, KmlError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.name().to_ascii_lowercase().ends_with(".kml") {
            let mut raw = Vec::new();
            entry.read_to_end(&mut raw)?;
            return Ok(decode_kml(&raw));
        }
    }
    Err(KmlError::NoKmlEntry)
}

fn local_name_str(full: &[u8]) -> String {
    let s = std::str::from_utf8(full).unwrap_or("");
    match s.rfind(':') {
        Some(pos) => s[pos + 1..].to_string(),
        None => s.to_string(),
    }
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime, KmlError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.naive_utc())
        .map_err(|_| KmlError::InvalidTimestamp(text.to_string()))
}

fn parse_coordinates(text: &str) -> Option<(f64, f64, Option<f64>)> {
    let mut parts = text.split(',').map(|p| p.trim().parse::<f64>());
    let lon = parts.next()?.ok()?;
    let lat = parts.next()?.ok()?;
    let elevation = parts.next().and_then(|p| p.ok());
    Some((lon, lat, elevation))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Capture {
    IssueTime,
    TimeStep,
    Name,
    Description,
    Coordinates,
    Value,
}

/// Parse a KML document into its header and placemarks.
pub fn parse_kml(xml: &str) -> Result<KmlDocument, KmlError> {
    let mut reader = Reader::from_str(xml);
    let mut doc = KmlDocument::default();

    let mut current: Option<Placemark> = None;
    let mut element_code: Option<String> = None;
    let mut capture: Option<Capture> = None;
    let mut text = String::new();

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(ref e) => {
                let local = local_name_str(e.name().as_ref());
                let in_placemark = current.is_some();
                capture = match local.as_str() {
                    "IssueTime" => Some(Capture::IssueTime),
                    "TimeStep" => Some(Capture::TimeStep),
                    "Placemark" => {
                        current = Some(Placemark::default());
                        None
                    }
                    "name" if in_placemark => Some(Capture::Name),
                    "description" if in_placemark => Some(Capture::Description),
                    "coordinates" if in_placemark => Some(Capture::Coordinates),
                    "Forecast" if in_placemark => {
                        element_code = e
                            .attributes()
                            .flatten()
                            .find(|a| local_name_str(a.key.as_ref()) == "elementName")
                            .and_then(|a| a.unescape_value().ok())
                            .map(|v| v.trim().to_string());
                        None
                    }
                    "value" if element_code.is_some() => Some(Capture::Value),
                    _ => None,
                };
                text.clear();
            }
            Event::Text(ref e) => {
                if capture.is_some() {
                    text.push_str(&e.unescape().unwrap_or_default());
                }
            }
            Event::CData(ref e) => {
                if capture.is_some() {
                    text.push_str(&String::from_utf8_lossy(&e[..]));
                }
            }
            Event::End(ref e) => {
                let local = local_name_str(e.name().as_ref());
                if let Some(what) = capture.take() {
                    let value = text.trim();
                    match what {
                        Capture::IssueTime => doc.header.issued_at = Some(parse_timestamp(value)?),
                        Capture::TimeStep => doc.header.timesteps.push(parse_timestamp(value)?),
                        Capture::Name => {
                            if let Some(p) = current.as_mut() {
                                p.name = value.to_string();
                            }
                        }
                        Capture::Description => {
                            if let Some(p) = current.as_mut() {
                                p.description = Some(value.to_string());
                            }
                        }
                        Capture::Coordinates => {
                            if let Some(p) = current.as_mut() {
                                p.coordinates = parse_coordinates(value);
                            }
                        }
                        Capture::Value => {
                            if let (Some(p), Some(code)) = (current.as_mut(), element_code.as_ref()) {
                                p.series.push((code.clone(), value.to_string()));
                            }
                        }
                    }
                }
                match local.as_str() {
                    "Forecast" => element_code = None,
                    "Placemark" => {
                        if let Some(p) = current.take() {
                            doc.placemarks.push(p);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(doc)
}

/// Station described by a placemark, if it carries usable metadata.
pub fn placemark_station(placemark: &Placemark) -> Option<WeatherStation> {
    let id = placemark.name.trim();
    if id.is_empty() || id.len() > 5 {
        return None;
    }
    let (longitude, latitude, elevation) = placemark.coordinates?;
    Some(WeatherStation {
        id: id.to_string(),
        name: placemark
            .description
            .clone()
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| id.to_string()),
        latitude,
        longitude,
        amsl: elevation.map(|e| e.round() as i64),
    })
}

/// Convert one placemark into write intents: the station first, then one
/// forecast update per time step that has at least one value.
///
/// A series whose length differs from the time-step list is dropped, since its
/// values can no longer be matched to time steps by index.
pub fn placemark_intents(header: &ProductHeader, placemark: &Placemark) -> Vec<WriteIntent> {
    let Some(station) = placemark_station(placemark) else {
        tracing::debug!("KML: placemark '{}' has no usable station metadata", placemark.name);
        return Vec::new();
    };

    let mut updates: Vec<ForecastUpdate> = header
        .timesteps
        .iter()
        .map(|t| ForecastUpdate::new(station.id.clone(), *t).issued_at(header.issued_at))
        .collect();

    for (code, raw) in &placemark.series {
        let Some((field, conversion)) = lookup_element(code) else {
            continue;
        };
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        if tokens.len() != updates.len() {
            tracing::warn!(
                "KML {}: element {} has {} values for {} time steps, skipping",
                station.id,
                code,
                tokens.len(),
                updates.len()
            );
            continue;
        }
        for (update, token) in updates.iter_mut().zip(tokens) {
            match parse_kml_value(token) {
                Ok(Some(v)) => update.set(field, conversion.apply(v)),
                Ok(None) => {}
                Err(_) => tracing::debug!(
                    "KML {} {}: element {} value '{}' rejected",
                    station.id,
                    update.date,
                    code,
                    token
                ),
            }
        }
    }

    let mut intents = Vec::with_capacity(updates.len() + 1);
    intents.push(WriteIntent::Station(station));
    intents.extend(
        updates
            .into_iter()
            .filter(|u| !u.is_empty())
            .map(WriteIntent::Forecast),
    );
    intents
}

/// Placemarks paired with a shared header, ready to be partitioned.
pub fn into_work_items(doc: KmlDocument) -> Vec<(Arc<ProductHeader>, Placemark)> {
    let header = Arc::new(doc.header);
    doc.placemarks
        .into_iter()
        .map(|p| (Arc::clone(&header), p))
        .collect()
}


#[cfg(test)]
mod tests {
    use super::test_support::{kmz, kmz_bytes, SAMPLE_KML};
    use super::*;
    use crate::db::models::FieldValue;
    use chrono::NaiveTime;

    fn forecasts(intents: &[WriteIntent]) -> Vec<&ForecastUpdate> {
        intents
            .iter()
            .filter_map(|i| match i {
                WriteIntent::Forecast(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_unzip_finds_kml_entry() {
        let text = unzip_kml(&kmz(SAMPLE_KML)).unwrap();
        assert_eq!(text, SAMPLE_KML);
    }

    #[test]
    fn test_unzip_decodes_latin1_description() {
        let mut raw = Vec::new();
        for (i, part) in SAMPLE_KML.split("ZUGSPITZE").enumerate() {
            if i > 0 {
                // "ZUGSPITZE Ü" with Ü as the single ISO-8859-1 byte 0xDC
                raw.extend_from_slice(b"ZUGSPITZE \xDC");
            }
            raw.extend_from_slice(part.as_bytes());
        }
        let text = unzip_kml(&kmz_bytes(&raw)).unwrap();

        let doc = parse_kml(&text).unwrap();
        assert_eq!(doc.placemarks.len(), 2);
        let station = placemark_station(&doc.placemarks[1]).unwrap();
        assert_eq!(station.name, "ZUGSPITZE Ü");
    }

    #[test]
    fn test_decode_utf8_without_latin1_declaration() {
        let raw = "<?xml version=\"1.0\" encoding=\"UTF-8\"?><a>Ü</a>".as_bytes();
        assert_eq!(decode_kml(raw), "<?xml version=\"1.0\" encoding=\"UTF-8\"?><a>Ü</a>");
    }

    #[test]
    fn test_unzip_rejects_garbage() {
        assert!(unzip_kml(b"not a zip").is_err());
    }

    #[test]
    fn test_parse_header_and_placemarks_in_order() {
        let doc = parse_kml(SAMPLE_KML).unwrap();
        assert_eq!(doc.header.timesteps.len(), 3);
        assert_eq!(
            doc.header.issued_at.unwrap().time(),
            NaiveTime::from_hms_opt(3, 0, 0).unwrap()
        );
        let names: Vec<&str> = doc.placemarks.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["10865", "P0489"]);
        assert_eq!(doc.placemarks[0].series.len(), 5);
        assert_eq!(doc.placemarks[0].series[0].0, "TTT");
        assert_eq!(doc.placemarks[0].coordinates, Some((11.55, 48.17, Some(515.0))));
    }

    #[test]
    fn test_station_from_placemark() {
        let doc = parse_kml(SAMPLE_KML).unwrap();
        let station = placemark_station(&doc.placemarks[1]).unwrap();
        assert_eq!(station.id, "P0489");
        assert_eq!(station.name, "ZUGSPITZE");
        assert_eq!(station.latitude, 47.42);
        assert_eq!(station.longitude, 10.98);
        assert_eq!(station.amsl, Some(2964));
    }

    #[test]
    fn test_values_are_converted_per_element() {
        let doc = parse_kml(SAMPLE_KML).unwrap();
        let intents = placemark_intents(&doc.header, &doc.placemarks[0]);
        assert!(matches!(intents[0], WriteIntent::Station(_)));

        let updates = forecasts(&intents);
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].time, NaiveTime::from_hms_opt(4, 0, 0).unwrap());
        assert_eq!(updates[0].values[&Field::Tt], FieldValue::Real(2.0));
        assert_eq!(updates[1].values[&Field::Tt], FieldValue::Real(3.0));
        assert_eq!(updates[0].values[&Field::Pppp], FieldValue::Real(1016.5));
        assert_eq!(updates[0].values[&Field::N], FieldValue::Integer(4));
        assert_eq!(updates[1].values[&Field::N], FieldValue::Integer(8));
    }

    #[test]
    fn test_dash_is_absent() {
        let doc = parse_kml(SAMPLE_KML).unwrap();
        let intents = placemark_intents(&doc.header, &doc.placemarks[0]);
        let last = forecasts(&intents)[2];
        assert!(!last.values.contains_key(&Field::Tt));
        assert!(!last.values.contains_key(&Field::N));
        assert_eq!(last.values[&Field::Pppp], FieldValue::Real(1016.3));
    }

    #[test]
    fn test_misaligned_series_is_dropped() {
        let doc = parse_kml(SAMPLE_KML).unwrap();
        let intents = placemark_intents(&doc.header, &doc.placemarks[0]);
        for update in forecasts(&intents) {
            assert!(!update.values.contains_key(&Field::Rr1));
        }
    }

    #[test]
    fn test_empty_time_steps_only_emit_station() {
        let doc = parse_kml(SAMPLE_KML).unwrap();
        let intents = placemark_intents(&doc.header, &doc.placemarks[1]);
        // FF only has a value at the first step; the others carry nothing.
        assert_eq!(intents.len(), 2);
        let update = forecasts(&intents)[0];
        assert_eq!(update.values[&Field::Ff], FieldValue::Real(18.0));
    }

    #[test]
    fn test_lookup_element_covers_sunshine_and_radiation() {
        assert_eq!(
            lookup_element("TTT"),
            Some((Field::Tt, Conversion::KelvinToCelsius))
        );
        assert_eq!(
            lookup_element("SunD1"),
            Some((Field::Ss1, Conversion::SecondsToHours))
        );
        assert_eq!(lookup_element("XYZ"), None);
    }
}
