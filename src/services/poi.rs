//! POI CSV parser.
//!
//! One semicolon-separated file per station. Data rows look like
//!
//! ```text
//! 16.10.24;06:00;8,4;6,1;---;---;---;---;230;11;22;...
//! ```
//!
//! Anything whose first cell is not a `dd.mm.yy` date (the header lines) is
//! skipped. Times are UTC.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::db::models::Field;
use crate::helpers::parse_poi_value;
use crate::services::intents::ForecastUpdate;
use crate::services::transport::file_name;

/// Column order of the value cells following date and time.
pub const POI_COLUMNS: [Field; 33] = [
    Field::Tt,
    Field::Td,
    Field::Tx,
    Field::Tn,
    Field::Tm,
    Field::Tg,
    Field::Dd,
    Field::Ff,
    Field::Fx,
    Field::Fx6,
    Field::Fx9,
    Field::Fx11,
    Field::Rr1,
    Field::Rr3,
    Field::Rr6,
    Field::Rr12,
    Field::Rr24,
    Field::Rrp6,
    Field::Rrp12,
    Field::Rrp24,
    Field::Ev,
    Field::Ww,
    Field::W,
    Field::Vv,
    Field::N,
    Field::Nf,
    Field::Nl,
    Field::Nm,
    Field::Nh,
    Field::Pppp,
    Field::Ss1,
    Field::Ss24,
    Field::Gss1,
];

/// Result of parsing one POI file.
#[derive(Debug, Default)]
pub struct PoiParse {
    pub updates: Vec<ForecastUpdate>,
    /// Rows dropped because their date or time did not parse.
    pub skipped_rows: usize,
    /// Cells that were neither a number nor `---`; each became an absent field.
    pub rejected_cells: usize,
}

/// Station code encoded in a POI file name: the 4–5 alphanumeric prefix
/// before the first `-` or `_` (`10865-MOSMIX.csv` → `10865`).
pub fn station_code_from_link(link: &str) -> Option<String> {
    let name = file_name(link);
    if !name.to_ascii_lowercase().ends_with(".csv") {
        return None;
    }
    let (prefix, _) = name.split_once(['-', '_'])?;
    let valid = (4..=5).contains(&prefix.len()) && prefix.chars().all(|c| c.is_ascii_alphanumeric());
    valid.then(|| prefix.to_string())
}

fn parse_valid_time(date: &str, time: &str) -> Option<NaiveDateTime> {
    let date = NaiveDate::parse_from_str(date.trim(), "%d.%m.%y").ok()?;
    let time = NaiveTime::parse_from_str(time.trim(), "%H:%M").ok()?;
    Some(date.and_time(time))
}

/// Parse a POI file for `station_id`.
///
/// A malformed cell degrades to an absent field; a row with an unreadable
/// date or time is skipped. Neither aborts the file.
pub fn parse_poi(station_id: &str, text: &str) -> PoiParse {
    let mut out = PoiParse::default();

    for line in text.lines() {
        let cells: Vec<&str> = line.split(';').collect();
        if cells.len() < 2 {
            continue;
        }
        let Some(valid_at) = parse_valid_time(cells[0], cells[1]) else {
            // Header lines land here as well; only count lines that look like data.
            if cells[0].trim().chars().next().is_some_and(|c| c.is_ascii_digit()) {
                tracing::debug!("POI {}: skipping row with bad timestamp: {}", station_id, line);
                out.skipped_rows += 1;
            }
            continue;
        };

        let mut update = ForecastUpdate::new(station_id, valid_at);
        for (field, cell) in POI_COLUMNS.iter().zip(cells.iter().skip(2)) {
            match parse_poi_value(cell) {
                Ok(Some(v)) => update.set(*field, v),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(
                        "POI {} {}: column {} value '{}' rejected: {}",
                        station_id,
                        valid_at,
                        field.column(),
                        cell,
                        e
                    );
                    out.rejected_cells += 1;
                }
            }
        }

        if !update.is_empty() {
            out.updates.push(update);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::FieldValue;

    fn row(date: &str, time: &str, values: &[&str]) -> String {
        let mut cells = vec![date.to_string(), time.to_string()];
        cells.extend(values.iter().map(|v| v.to_string()));
        while cells.len() < POI_COLUMNS.len() + 2 {
            cells.push("---".to_string());
        }
        cells.join(";")
    }

    #[test]
    fn test_station_code_from_link() {
        assert_eq!(
            station_code_from_link("http://h/poi/10865-MOSMIX.csv"),
            Some("10865".to_string())
        );
        assert_eq!(station_code_from_link("P0489_MOSMIX.csv"), Some("P0489".to_string()));
        assert_eq!(station_code_from_link("10865-MOSMIX.txt"), None);
        assert_eq!(station_code_from_link("README.csv"), None);
        assert_eq!(station_code_from_link("toolong1-MOSMIX.csv"), None);
    }

    #[test]
    fn test_parse_values_in_column_order() {
        let text = format!(
            "Datum;Zeit;TT;Td\nparameter;;C;C\n{}\n",
            row("16.10.24", "06:00", &["8,4", "6,1", "---", "---", "---", "---", "230", "11"])
        );
        let parsed = parse_poi("10865", &text);

        assert_eq!(parsed.updates.len(), 1);
        assert_eq!(parsed.skipped_rows, 0);
        let update = &parsed.updates[0];
        assert_eq!(update.date, NaiveDate::from_ymd_opt(2024, 10, 16).unwrap());
        assert_eq!(update.time, NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        assert_eq!(update.values[&Field::Tt], FieldValue::Real(8.4));
        assert_eq!(update.values[&Field::Td], FieldValue::Real(6.1));
        assert_eq!(update.values[&Field::Dd], FieldValue::Integer(230));
        assert_eq!(update.values[&Field::Ff], FieldValue::Real(11.0));
    }

    #[test]
    fn test_sentinel_is_absent_not_zero() {
        let text = row("16.10.24", "07:00", &["---", "5,0"]);
        let parsed = parse_poi("10865", &text);

        let update = &parsed.updates[0];
        assert!(!update.values.contains_key(&Field::Tt));
        assert_eq!(update.values[&Field::Td], FieldValue::Real(5.0));
        assert_eq!(update.values.len(), 1);
    }

    #[test]
    fn test_bad_cell_only_drops_that_field() {
        let text = row("16.10.24", "08:00", &["abc", "3,5"]);
        let parsed = parse_poi("10865", &text);

        assert_eq!(parsed.rejected_cells, 1);
        let update = &parsed.updates[0];
        assert!(!update.values.contains_key(&Field::Tt));
        assert_eq!(update.values[&Field::Td], FieldValue::Real(3.5));
    }

    #[test]
    fn test_bad_timestamp_skips_row_not_file() {
        let text = format!(
            "{}\n{}\n{}\n",
            row("16.10.24", "09:00", &["1,0"]),
            row("32.10.24", "10:00", &["2,0"]),
            row("16.10.24", "11:00", &["3,0"]),
        );
        let parsed = parse_poi("10865", &text);

        assert_eq!(parsed.skipped_rows, 1);
        assert_eq!(parsed.updates.len(), 2);
        assert_eq!(parsed.updates[1].values[&Field::Tt], FieldValue::Real(3.0));
    }

    #[test]
    fn test_all_missing_row_emits_nothing() {
        let text = row("16.10.24", "12:00", &[]);
        assert!(parse_poi("10865", &text).updates.is_empty());
    }

    #[test]
    fn test_thousands_blank_and_decimal_comma() {
        let mut values = vec!["---"; 29];
        values.push("1 013,2");
        let text = row("16.10.24", "13:00", &values);
        let parsed = parse_poi("10865", &text);
        assert_eq!(parsed.updates[0].values[&Field::Pppp], FieldValue::Real(1013.2));
    }
}
