//! Metric time series with incremental daily aggregation.
//!
//! Raw points are append-only; the matching daily aggregate row is
//! updated inside the same transaction, so a concurrent reader never
//! observes a half-updated aggregate.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// One raw metric observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub metric: String,
    pub entity: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Derived per-day statistics for a metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub metric: String,
    pub entity: String,
    pub date: NaiveDate,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub last: f64,
    pub count: i64,
}

/// Store for metric points and daily aggregates.
#[derive(Clone)]
pub struct TimeSeriesStore {
    conn: Arc<Mutex<Connection>>,
}

impl TimeSeriesStore {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Record a point now.
    pub fn record(&self, metric: &str, entity: &str, value: f64) -> Result<()> {
        self.record_at(metric, entity, value, Utc::now())
    }

    /// Record a point at an explicit timestamp. The daily aggregate
    /// for the point's UTC date is updated in the same transaction.
    pub fn record_at(
        &self,
        metric: &str,
        entity: &str,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let date = timestamp.format("%Y-%m-%d").to_string();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO timeseries_points (metric, entity, timestamp, value)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![metric, entity, timestamp.to_rfc3339(), value],
        )?;

        // Incremental aggregate update: min/max/last direct, avg from
        // the previous avg and count.
        tx.execute(
            r#"
            INSERT INTO daily_aggregates (metric, entity, date, min, max, avg, last, count)
            VALUES (?1, ?2, ?3, ?4, ?4, ?4, ?4, 1)
            ON CONFLICT(metric, entity, date) DO UPDATE SET
                min = MIN(min, excluded.min),
                max = MAX(max, excluded.max),
                avg = (avg * count + excluded.last) / (count + 1),
                last = excluded.last,
                count = count + 1
            "#,
            params![metric, entity, date, value],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Raw points for a metric since the cutoff, oldest first.
    pub fn points_since(
        &self,
        metric: &str,
        entity: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            r#"
            SELECT metric, entity, timestamp, value
            FROM timeseries_points
            WHERE metric = ?1 AND entity = ?2 AND timestamp >= ?3
            ORDER BY timestamp ASC, id ASC
            "#,
        )?;

        let points = stmt
            .query_map(params![metric, entity, since.to_rfc3339()], |row| {
                let ts_str: String = row.get(2)?;
                Ok(TimeSeriesPoint {
                    metric: row.get(0)?,
                    entity: row.get(1)?,
                    timestamp: DateTime::parse_from_rfc3339(&ts_str)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    value: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(points)
    }

    /// The most recent value for a metric, if any.
    pub fn latest_value(&self, metric: &str, entity: &str) -> Result<Option<f64>> {
        let conn = self.conn.lock().unwrap();

        let value: Option<f64> = conn
            .query_row(
                r#"
                SELECT value FROM timeseries_points
                WHERE metric = ?1 AND entity = ?2
                ORDER BY timestamp DESC, id DESC
                LIMIT 1
                "#,
                params![metric, entity],
                |row| row.get(0),
            )
            .optional()?;

        Ok(value)
    }

    /// Daily aggregates for a metric, newest first.
    pub fn daily_aggregates(
        &self,
        metric: &str,
        entity: &str,
        limit: usize,
    ) -> Result<Vec<DailyAggregate>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(
            r#"
            SELECT metric, entity, date, min, max, avg, last, count
            FROM daily_aggregates
            WHERE metric = ?1 AND entity = ?2
            ORDER BY date DESC
            LIMIT ?3
            "#,
        )?;

        let aggregates = stmt
            .query_map(params![metric, entity, limit as i64], |row| {
                let date_str: String = row.get(2)?;
                Ok(DailyAggregate {
                    metric: row.get(0)?,
                    entity: row.get(1)?,
                    date: NaiveDate::parse_from_str(&date_str, "%Y-%m-%d")
                        .unwrap_or_else(|_| Utc::now().date_naive()),
                    min: row.get(3)?,
                    max: row.get(4)?,
                    avg: row.get(5)?,
                    last: row.get(6)?,
                    count: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(aggregates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Database;

    fn store() -> TimeSeriesStore {
        Database::in_memory().unwrap().timeseries()
    }

    #[test]
    fn test_record_and_latest() {
        let store = store();
        assert!(store.latest_value("followers", "me").unwrap().is_none());

        store.record("followers", "me", 100.0).unwrap();
        store.record("followers", "me", 105.0).unwrap();

        assert_eq!(store.latest_value("followers", "me").unwrap(), Some(105.0));
    }

    #[test]
    fn test_daily_aggregate_incremental() {
        let store = store();
        let ts = Utc::now();

        for value in [10.0, 20.0, 30.0] {
            store.record_at("followers", "me", value, ts).unwrap();
        }

        let aggregates = store.daily_aggregates("followers", "me", 10).unwrap();
        assert_eq!(aggregates.len(), 1);

        let agg = &aggregates[0];
        assert_eq!(agg.min, 10.0);
        assert_eq!(agg.max, 30.0);
        assert_eq!(agg.last, 30.0);
        assert_eq!(agg.count, 3);
        assert!((agg.avg - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregates_bucketed_by_date() {
        let store = store();
        let today = Utc::now();
        let yesterday = today - chrono::Duration::days(1);

        store.record_at("followers", "me", 90.0, yesterday).unwrap();
        store.record_at("followers", "me", 100.0, today).unwrap();

        let aggregates = store.daily_aggregates("followers", "me", 10).unwrap();
        assert_eq!(aggregates.len(), 2);
        // Newest first
        assert_eq!(aggregates[0].last, 100.0);
        assert_eq!(aggregates[1].last, 90.0);
    }

    #[test]
    fn test_points_since() {
        let store = store();
        let now = Utc::now();

        store
            .record_at("followers", "me", 1.0, now - chrono::Duration::hours(2))
            .unwrap();
        store.record_at("followers", "me", 2.0, now).unwrap();

        let points = store
            .points_since("followers", "me", now - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 2.0);
    }

    #[test]
    fn test_metrics_isolated_by_entity() {
        let store = store();
        store.record("followers", "a", 1.0).unwrap();
        store.record("followers", "b", 2.0).unwrap();

        assert_eq!(store.latest_value("followers", "a").unwrap(), Some(1.0));
        assert_eq!(store.latest_value("followers", "b").unwrap(), Some(2.0));
    }
}
