//! Write intents emitted by parser workers.
//!
//! Workers never hold a database connection. They describe what should be
//! written and send the description to the coordinator, which applies the
//! whole batch in one transaction.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::db::models::{Field, FieldValue, WeatherStation};

/// Parsed values for one (station, date, time) key.
///
/// A field missing from `values` is *absent*: merging leaves the stored value
/// untouched. There is no way to express an explicit null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastUpdate {
    pub station_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub issuetime: Option<NaiveDateTime>,
    pub values: BTreeMap<Field, FieldValue>,
}

impl ForecastUpdate {
    pub fn new(station_id: impl Into<String>, valid_at: NaiveDateTime) -> Self {
        Self {
            station_id: station_id.into(),
            date: valid_at.date(),
            time: valid_at.time(),
            issuetime: None,
            values: BTreeMap::new(),
        }
    }

    pub fn issued_at(mut self, issuetime: Option<NaiveDateTime>) -> Self {
        self.issuetime = issuetime;
        self
    }

    /// Record a present value, coerced to the field's storage class.
    pub fn set(&mut self, field: Field, value: f64) {
        self.values.insert(field, field.value(value));
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One unit of work for the apply phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WriteIntent {
    /// Create the station if the registry does not know it yet.
    Station(WeatherStation),
    /// Merge parsed values into the forecast row for this key.
    Forecast(ForecastUpdate),
}

#[cfg(test)]
impl WriteIntent {
    pub fn station_id(&self) -> &str {
        match self {
            WriteIntent::Station(s) => &s.id,
            WriteIntent::Forecast(f) => &f.station_id,
        }
    }
}
