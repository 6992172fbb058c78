use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A weather station from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct WeatherStation {
    /// Station code (up to five alphanumerics), e.g. "10865" or "P0489".
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Elevation above mean sea level in metres.
    pub amsl: Option<i64>,
}

/// Storage class of a forecast column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Real,
    Integer,
}

/// Every meteorological column of `forecast_data`.
///
/// The set is closed: parsers map their feed codes onto these variants through
/// static tables, so a typo in a column name cannot reach SQL.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Tt,
    Td,
    Tx,
    Tn,
    Tm,
    Tg,
    Dd,
    Ff,
    Fx,
    Fx6,
    Fx9,
    Fx11,
    Rr1,
    Rr3,
    Rr6,
    Rr12,
    Rr24,
    Rrp6,
    Rrp12,
    Rrp24,
    Ev,
    Ww,
    W,
    Vv,
    N,
    Nf,
    Nl,
    Nm,
    Nh,
    Pppp,
    Ss1,
    Ss24,
    Gss1,
    Gss3,
    Qsw1,
    Qsw3,
    Qlw1,
    Qlw3,
}

impl Field {
    pub const ALL: [Field; 38] = [
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
        Field::Gss3,
        Field::Qsw1,
        Field::Qsw3,
        Field::Qlw1,
        Field::Qlw3,
    ];

    /// Column name in `forecast_data` / `historical_data`.
    pub fn column(self) -> &'static str {
        match self {
            Field::Tt => "tt",
            Field::Td => "td",
            Field::Tx => "tx",
            Field::Tn => "tn",
            Field::Tm => "tm",
            Field::Tg => "tg",
            Field::Dd => "dd",
            Field::Ff => "ff",
            Field::Fx => "fx",
            Field::Fx6 => "fx6",
            Field::Fx9 => "fx9",
            Field::Fx11 => "fx11",
            Field::Rr1 => "rr1",
            Field::Rr3 => "rr3",
            Field::Rr6 => "rr6",
            Field::Rr12 => "rr12",
            Field::Rr24 => "rr24",
            Field::Rrp6 => "rrp6",
            Field::Rrp12 => "rrp12",
            Field::Rrp24 => "rrp24",
            Field::Ev => "ev",
            Field::Ww => "ww",
            Field::W => "w",
            Field::Vv => "vv",
            Field::N => "n",
            Field::Nf => "nf",
            Field::Nl => "nl",
            Field::Nm => "nm",
            Field::Nh => "nh",
            Field::Pppp => "pppp",
            Field::Ss1 => "ss1",
            Field::Ss24 => "ss24",
            Field::Gss1 => "gss1",
            Field::Gss3 => "gss3",
            Field::Qsw1 => "qsw1",
            Field::Qsw3 => "qsw3",
            Field::Qlw1 => "qlw1",
            Field::Qlw3 => "qlw3",
        }
    }

    pub fn kind(self) -> FieldKind {
        match self {
            Field::Dd
            | Field::Fx6
            | Field::Fx9
            | Field::Fx11
            | Field::Rrp6
            | Field::Rrp12
            | Field::Rrp24
            | Field::Ww
            | Field::W
            | Field::Vv
            | Field::N
            | Field::Nf
            | Field::Nl
            | Field::Nm
            | Field::Nh => FieldKind::Integer,
            _ => FieldKind::Real,
        }
    }

    /// Coerce an already unit-converted number into this column's storage class.
    /// Integer columns round half away from zero.
    pub fn value(self, v: f64) -> FieldValue {
        match self.kind() {
            FieldKind::Real => FieldValue::Real(v),
            FieldKind::Integer => FieldValue::Integer(v.round() as i64),
        }
    }
}

/// A parsed, present value for one field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Real(f64),
}

/// A forecast for one station at one valid date and time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, FromRow)]
pub struct ForecastDataPoint {
    pub station_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    /// When the bulletin that last touched this row was produced.
    pub issuetime: Option<NaiveDateTime>,
    pub tt: Option<f64>,
    pub td: Option<f64>,
    pub tx: Option<f64>,
    pub tn: Option<f64>,
    pub tm: Option<f64>,
    pub tg: Option<f64>,
    pub dd: Option<i64>,
    pub ff: Option<f64>,
    pub fx: Option<f64>,
    pub fx6: Option<i64>,
    pub fx9: Option<i64>,
    pub fx11: Option<i64>,
    pub rr1: Option<f64>,
    pub rr3: Option<f64>,
    pub rr6: Option<f64>,
    pub rr12: Option<f64>,
    pub rr24: Option<f64>,
    pub rrp6: Option<i64>,
    pub rrp12: Option<i64>,
    pub rrp24: Option<i64>,
    pub ev: Option<f64>,
    pub ww: Option<i64>,
    pub w: Option<i64>,
    pub vv: Option<i64>,
    pub n: Option<i64>,
    pub nf: Option<i64>,
    pub nl: Option<i64>,
    pub nm: Option<i64>,
    pub nh: Option<i64>,
    pub pppp: Option<f64>,
    pub ss1: Option<f64>,
    pub ss24: Option<f64>,
    pub gss1: Option<f64>,
    pub gss3: Option<f64>,
    pub qsw1: Option<f64>,
    pub qsw3: Option<f64>,
    pub qlw1: Option<f64>,
    pub qlw3: Option<f64>,
}

/// A forecast row plus, on request, the station it belongs to.
#[derive(Debug, Clone, Serialize)]
pub struct NearestForecast {
    pub forecast: ForecastDataPoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<WeatherStation>,
}
