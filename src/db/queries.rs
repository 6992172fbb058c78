use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveTime};
use sqlx::{QueryBuilder, Sqlite, SqliteExecutor, SqlitePool};

use super::models::{Field, FieldValue, ForecastDataPoint, WeatherStation};
use crate::services::intents::ForecastUpdate;

/// Every column of `forecast_data` (and `historical_data`), in table order.
fn forecast_columns() -> &'static str {
    static COLUMNS: OnceLock<String> = OnceLock::new();
    COLUMNS.get_or_init(|| {
        let mut columns = vec!["station_id", "date", "time", "issuetime"];
        columns.extend(Field::ALL.iter().map(|f| f.column()));
        columns.join(", ")
    })
}

// ---------------------------------------------------------------------------
// Stations
// ---------------------------------------------------------------------------

/// Get a station by its code.
pub async fn get_station<'e>(
    executor: impl SqliteExecutor<'e>,
    id: &str,
) -> Result<Option<WeatherStation>, sqlx::Error> {
    sqlx::query_as::<_, WeatherStation>(
        "SELECT id, name, latitude, longitude, amsl FROM weather_stations WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Insert a new station. Fails on a duplicate code.
pub async fn insert_station<'e>(
    executor: impl SqliteExecutor<'e>,
    station: &WeatherStation,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO weather_stations (id, name, latitude, longitude, amsl)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&station.id)
    .bind(&station.name)
    .bind(station.latitude)
    .bind(station.longitude)
    .bind(station.amsl)
    .execute(executor)
    .await?;
    Ok(())
}

/// List all stations, ordered by code.
pub async fn list_stations(pool: &SqlitePool) -> Result<Vec<WeatherStation>, sqlx::Error> {
    sqlx::query_as::<_, WeatherStation>(
        "SELECT id, name, latitude, longitude, amsl FROM weather_stations ORDER BY id",
    )
    .fetch_all(pool)
    .await
}

/// Codes of every registered station.
pub async fn known_station_ids<'e>(
    executor: impl SqliteExecutor<'e>,
) -> Result<HashSet<String>, sqlx::Error> {
    let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM weather_stations")
        .fetch_all(executor)
        .await?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

// ---------------------------------------------------------------------------
// Forecasts
// ---------------------------------------------------------------------------

/// Find the forecast row for a (station, date, time) key.
pub async fn find_forecast<'e>(
    executor: impl SqliteExecutor<'e>,
    station_id: &str,
    date: NaiveDate,
    time: NaiveTime,
) -> Result<Option<ForecastDataPoint>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM forecast_data WHERE station_id = ? AND date = ? AND time = ?",
        forecast_columns()
    );
    sqlx::query_as::<_, ForecastDataPoint>(&sql)
        .bind(station_id)
        .bind(date)
        .bind(time)
        .fetch_optional(executor)
        .await
}

fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: FieldValue) {
    match value {
        FieldValue::Integer(i) => builder.push_bind(i),
        FieldValue::Real(r) => builder.push_bind(r),
    };
}

/// Insert a fresh forecast row. Fields absent from the update are stored as NULL.
pub async fn insert_forecast<'e>(
    executor: impl SqliteExecutor<'e>,
    update: &ForecastUpdate,
) -> Result<(), sqlx::Error> {
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new("INSERT INTO forecast_data (station_id, date, time, issuetime");
    for field in update.values.keys() {
        builder.push(", ").push(field.column());
    }
    builder.push(") VALUES (");
    builder.push_bind(update.station_id.clone());
    builder.push(", ").push_bind(update.date);
    builder.push(", ").push_bind(update.time);
    builder.push(", ").push_bind(update.issuetime);
    for value in update.values.values() {
        builder.push(", ");
        push_value(&mut builder, *value);
    }
    builder.push(")");

    builder.build().execute(executor).await?;
    Ok(())
}

/// Overwrite only the fields present in `update` on an existing row.
///
/// The issue time follows the update when it carries one. Returns the number of
/// rows touched (0 or 1).
pub async fn update_forecast<'e>(
    executor: impl SqliteExecutor<'e>,
    update: &ForecastUpdate,
) -> Result<u64, sqlx::Error> {
    if update.values.is_empty() && update.issuetime.is_none() {
        return Ok(0);
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE forecast_data SET ");
    let mut first = true;
    if let Some(issuetime) = update.issuetime {
        builder.push("issuetime = ").push_bind(issuetime);
        first = false;
    }
    for (field, value) in &update.values {
        if !first {
            builder.push(", ");
        }
        builder.push(field.column()).push(" = ");
        push_value(&mut builder, *value);
        first = false;
    }
    builder.push(" WHERE station_id = ").push_bind(update.station_id.clone());
    builder.push(" AND date = ").push_bind(update.date);
    builder.push(" AND time = ").push_bind(update.time);

    let result = builder.build().execute(executor).await?;
    Ok(result.rows_affected())
}

/// All rows for a station on one date, in insertion order.
pub async fn forecasts_on_date(
    pool: &SqlitePool,
    station_id: &str,
    date: NaiveDate,
) -> Result<Vec<ForecastDataPoint>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM forecast_data WHERE station_id = ? AND date = ? ORDER BY rowid",
        forecast_columns()
    );
    sqlx::query_as::<_, ForecastDataPoint>(&sql)
        .bind(station_id)
        .bind(date)
        .fetch_all(pool)
        .await
}

/// Earliest row on `date` strictly after `time`, newest bulletin first on ties.
pub async fn first_forecast_after(
    pool: &SqlitePool,
    station_id: &str,
    date: NaiveDate,
    time: NaiveTime,
) -> Result<Option<ForecastDataPoint>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM forecast_data
         WHERE station_id = ? AND date = ? AND time > ?
         ORDER BY time ASC, issuetime DESC
         LIMIT 1",
        forecast_columns()
    );
    sqlx::query_as::<_, ForecastDataPoint>(&sql)
        .bind(station_id)
        .bind(date)
        .bind(time)
        .fetch_optional(pool)
        .await
}

/// Latest row on `date` at or before `time`, newest bulletin first on ties.
pub async fn last_forecast_at_or_before(
    pool: &SqlitePool,
    station_id: &str,
    date: NaiveDate,
    time: NaiveTime,
) -> Result<Option<ForecastDataPoint>, sqlx::Error> {
    let sql = format!(
        "SELECT {} FROM forecast_data
         WHERE station_id = ? AND date = ? AND time <= ?
         ORDER BY time DESC, issuetime DESC
         LIMIT 1",
        forecast_columns()
    );
    sqlx::query_as::<_, ForecastDataPoint>(&sql)
        .bind(station_id)
        .bind(date)
        .bind(time)
        .fetch_optional(pool)
        .await
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// Move every forecast row dated before `today` into `historical_data`.
/// Both statements run in one transaction. Returns the number of rows moved.
pub async fn archive_before(pool: &SqlitePool, today: NaiveDate) -> Result<u64, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let copy = format!(
        "INSERT INTO historical_data ({cols}) SELECT {cols} FROM forecast_data WHERE date < ?",
        cols = forecast_columns()
    );
    sqlx::query(&copy).bind(today).execute(&mut *tx).await?;

    let deleted = sqlx::query("DELETE FROM forecast_data WHERE date < ?")
        .bind(today)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(deleted.rows_affected())
}

/// Number of archived rows for a station.
#[cfg(test)]
pub async fn count_historical(pool: &SqlitePool, station_id: &str) -> Result<i64, sqlx::Error> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM historical_data WHERE station_id = ?")
            .bind(station_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::NaiveDateTime;

    fn station(id: &str) -> WeatherStation {
        WeatherStation {
            id: id.to_string(),
            name: format!("Station {}", id),
            latitude: 48.17,
            longitude: 11.55,
            amsl: Some(515),
        }
    }

    fn update(id: &str, at: &str) -> ForecastUpdate {
        let valid = NaiveDateTime::parse_from_str(at, "%Y-%m-%d %H:%M").unwrap();
        ForecastUpdate::new(id, valid)
    }

    #[tokio::test]
    async fn test_station_roundtrip() {
        let pool = test_pool().await;
        insert_station(&pool, &station("10865")).await.unwrap();

        let found = get_station(&pool, "10865").await.unwrap().unwrap();
        assert_eq!(found, station("10865"));
        assert!(get_station(&pool, "99999").await.unwrap().is_none());
        assert!(insert_station(&pool, &station("10865")).await.is_err());
        assert_eq!(known_station_ids(&pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_stores_absent_fields_as_null() {
        let pool = test_pool().await;
        insert_station(&pool, &station("10865")).await.unwrap();

        let mut u = update("10865", "2024-10-16 06:00");
        u.set(Field::Tt, 8.4);
        u.set(Field::Dd, 230.0);
        insert_forecast(&pool, &u).await.unwrap();

        let row = find_forecast(&pool, "10865", u.date, u.time)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.tt, Some(8.4));
        assert_eq!(row.dd, Some(230));
        assert_eq!(row.td, None);
        assert_eq!(row.issuetime, None);
    }

    #[tokio::test]
    async fn test_update_only_touches_present_fields() {
        let pool = test_pool().await;
        insert_station(&pool, &station("10865")).await.unwrap();

        let mut a = update("10865", "2024-10-16 06:00");
        a.set(Field::Tt, 8.4);
        a.set(Field::Td, 6.1);
        insert_forecast(&pool, &a).await.unwrap();

        let mut b = update("10865", "2024-10-16 06:00");
        b.set(Field::Rr1, 0.4);
        assert_eq!(update_forecast(&pool, &b).await.unwrap(), 1);

        let row = find_forecast(&pool, "10865", a.date, a.time)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.tt, Some(8.4));
        assert_eq!(row.td, Some(6.1));
        assert_eq!(row.rr1, Some(0.4));
        assert_eq!(row.ff, None);
    }

    #[tokio::test]
    async fn test_update_without_values_is_noop() {
        let pool = test_pool().await;
        let empty = update("10865", "2024-10-16 06:00");
        assert_eq!(update_forecast(&pool, &empty).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bracket_queries() {
        let pool = test_pool().await;
        insert_station(&pool, &station("10865")).await.unwrap();
        for at in ["2024-10-16 10:00", "2024-10-16 14:00"] {
            let mut u = update("10865", at);
            u.set(Field::Tt, 1.0);
            insert_forecast(&pool, &u).await.unwrap();
        }
        let date = NaiveDate::from_ymd_opt(2024, 10, 16).unwrap();
        let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
        let ten = NaiveTime::from_hms_opt(10, 0, 0).unwrap();

        let after = first_forecast_after(&pool, "10865", date, noon).await.unwrap().unwrap();
        assert_eq!(after.time, NaiveTime::from_hms_opt(14, 0, 0).unwrap());

        let before = last_forecast_at_or_before(&pool, "10865", date, noon)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.time, ten);

        let exact = last_forecast_at_or_before(&pool, "10865", date, ten)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exact.time, ten);

        let other_day = date.succ_opt().unwrap();
        assert!(first_forecast_after(&pool, "10865", other_day, noon)
            .await
            .unwrap()
            .is_none());
        assert_eq!(forecasts_on_date(&pool, "10865", date).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_archive_moves_only_past_dates() {
        let pool = test_pool().await;
        insert_station(&pool, &station("10865")).await.unwrap();
        for at in [
            "2024-10-14 06:00",
            "2024-10-15 06:00",
            "2024-10-16 06:00",
            "2024-10-17 06:00",
        ] {
            let mut u = update("10865", at);
            u.set(Field::Tt, 5.0);
            insert_forecast(&pool, &u).await.unwrap();
        }

        let today = NaiveDate::from_ymd_opt(2024, 10, 16).unwrap();
        assert_eq!(archive_before(&pool, today).await.unwrap(), 2);
        assert_eq!(count_historical(&pool, "10865").await.unwrap(), 2);

        let (past,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM forecast_data WHERE date < ?")
            .bind(today)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(past, 0);
        let (left,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM forecast_data")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(left, 2);

        // A second sweep finds nothing more to move.
        assert_eq!(archive_before(&pool, today).await.unwrap(), 0);
        assert_eq!(count_historical(&pool, "10865").await.unwrap(), 2);
    }
}
