//! Token-to-number helpers shared by the feed parsers.
//!
//! Each feed marks "not reported" differently:
//!
//! - POI CSV: the literal `---`
//! - ASCII bulletins: a run of one to four `-` or `/` filling the column
//! - KML value arrays: a bare `-`
//!
//! A sentinel always yields `Ok(None)`. A token that is neither a sentinel nor a
//! number yields `Err`, which callers downgrade to "field absent" after logging.

use std::num::ParseFloatError;
use std::sync::OnceLock;

use regex::Regex;

/// Conversion factor from knots to km/h.
pub(crate) const KNOTS_TO_KMH: f64 = 1.852;

/// Conversion factor from m/s to km/h.
pub(crate) const MS_TO_KMH: f64 = 3.6;

/// Offset between Kelvin and degrees Celsius.
pub(crate) const KELVIN_OFFSET: f64 = 273.15;

const POI_MISSING: &str = "---";
const KML_MISSING: &str = "-";

fn ascii_missing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:-{1,4}|/{1,4})$").expect("static regex is valid"))
}

/// Normalise a POI number: decimal comma to point, stray blanks removed.
pub(crate) fn normalize_number(raw: &str) -> String {
    raw.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect()
}

/// Parse a POI CSV cell.
pub(crate) fn parse_poi_value(raw: &str) -> Result<Option<f64>, ParseFloatError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == POI_MISSING {
        return Ok(None);
    }
    normalize_number(trimmed).parse().map(Some)
}

/// Whether an ASCII bulletin token is a missing-value marker.
pub(crate) fn is_ascii_missing(token: &str) -> bool {
    ascii_missing_re().is_match(token)
}

/// Parse an ASCII bulletin column.
pub(crate) fn parse_ascii_value(token: &str) -> Result<Option<f64>, ParseFloatError> {
    if is_ascii_missing(token) {
        return Ok(None);
    }
    token.parse().map(Some)
}

/// Parse one scalar of a KML value array.
pub(crate) fn parse_kml_value(token: &str) -> Result<Option<f64>, ParseFloatError> {
    if token == KML_MISSING {
        return Ok(None);
    }
    token.parse().map(Some)
}

/// Unpack a `ddd.mm` degrees-and-minutes coordinate into decimal degrees.
///
/// `11.33` is 11°33', i.e. 11.55. The minutes part is read as a whole number,
/// so it must hold two digits.
pub(crate) fn unpack_degrees_minutes(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let (negative, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (deg, min) = body.split_once('.').unwrap_or((body, "0"));
    let deg: f64 = deg.parse().ok()?;
    let min: f64 = min.parse().ok()?;
    if min >= 60.0 {
        return None;
    }
    let value = deg + min / 60.0;
    Some(if negative { -value } else { value })
}

/// Round to a fixed number of decimal places, hiding float noise left by
/// unit conversions (275.15 K - 273.15 is not exactly 2.0).
pub(crate) fn round_dp(v: f64, dp: i32) -> f64 {
    let factor = 10f64.powi(dp);
    (v * factor).round() / factor
}

/// A unit conversion applied to a raw feed value before storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Conversion {
    Identity,
    KnotsToKmh,
    MsToKmh,
    KelvinToCelsius,
    PaToHpa,
    SecondsToHours,
    PercentToEighths,
}

impl Conversion {
    pub(crate) fn apply(self, v: f64) -> f64 {
        let converted = match self {
            Conversion::Identity => return v,
            Conversion::KnotsToKmh => v * KNOTS_TO_KMH,
            Conversion::MsToKmh => v * MS_TO_KMH,
            Conversion::KelvinToCelsius => v - KELVIN_OFFSET,
            Conversion::PaToHpa => v / 100.0,
            Conversion::SecondsToHours => v / 3600.0,
            Conversion::PercentToEighths => v * 8.0 / 100.0,
        };
        round_dp(converted, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_number() {
        assert_eq!(normalize_number(" 1 013,2 "), "1013.2");
        assert_eq!(normalize_number("-3,5"), "-3.5");
    }

    #[test]
    fn test_parse_poi_value() {
        assert_eq!(parse_poi_value("12,4"), Ok(Some(12.4)));
        assert_eq!(parse_poi_value("---"), Ok(None));
        assert_eq!(parse_poi_value(""), Ok(None));
        assert_eq!(parse_poi_value("0"), Ok(Some(0.0)));
        assert!(parse_poi_value("n/a").is_err());
    }

    #[test]
    fn test_ascii_missing_markers() {
        for token in ["-", "--", "----", "/", "//", "////"] {
            assert!(is_ascii_missing(token), "{} should be missing", token);
        }
        for token in ["-5", "-----", "0", "/-", "12"] {
            assert!(!is_ascii_missing(token), "{} should not be missing", token);
        }
    }

    #[test]
    fn test_parse_ascii_value() {
        assert_eq!(parse_ascii_value("---"), Ok(None));
        assert_eq!(parse_ascii_value("-4.5"), Ok(Some(-4.5)));
        assert!(parse_ascii_value("-----").is_err());
    }

    #[test]
    fn test_parse_kml_value() {
        assert_eq!(parse_kml_value("-"), Ok(None));
        assert_eq!(parse_kml_value("101650.00"), Ok(Some(101650.0)));
        assert_eq!(parse_kml_value("-1.5"), Ok(Some(-1.5)));
    }

    #[test]
    fn test_unpack_degrees_minutes() {
        assert!((unpack_degrees_minutes("11.33").unwrap() - 11.55).abs() < 1e-9);
        assert!((unpack_degrees_minutes("48.10").unwrap() - 48.1666666).abs() < 1e-6);
        assert!((unpack_degrees_minutes("-8.40").unwrap() + 8.6666666).abs() < 1e-6);
        assert_eq!(unpack_degrees_minutes("7"), Some(7.0));
        assert_eq!(unpack_degrees_minutes("7.75"), None);
        assert_eq!(unpack_degrees_minutes("abc"), None);
    }

    #[test]
    fn test_knots_conversion() {
        assert!((Conversion::KnotsToKmh.apply(10.0) - 18.52).abs() < 1e-9);
    }

    #[test]
    fn test_kelvin_conversion_is_clean() {
        assert_eq!(Conversion::KelvinToCelsius.apply(275.15), 2.0);
        assert_eq!(Conversion::KelvinToCelsius.apply(273.15), 0.0);
    }

    #[test]
    fn test_other_conversions() {
        assert_eq!(Conversion::PaToHpa.apply(101650.0), 1016.5);
        assert_eq!(Conversion::SecondsToHours.apply(1800.0), 0.5);
        assert_eq!(Conversion::PercentToEighths.apply(50.0), 4.0);
        assert_eq!(Conversion::MsToKmh.apply(5.0), 18.0);
        assert_eq!(Conversion::Identity.apply(0.123456), 0.123456);
    }
}
