//! Append-only attendance ledger with a per-identity dedup window.
//!
//! The dedup decision reads the last persisted observation, so it holds
//! across restarts. Day boundaries are UTC.

use crate::db::Database;
use crate::error::EngineError;
use crate::identity::Identity;
use crate::jobs::millis_to_utc;
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub identity: Identity,
    pub observed_at: DateTime<Utc>,
}

/// Aggregate of one identity's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceSummary {
    pub identity: Identity,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresentEntry {
    pub identity: Identity,
    pub first_seen: DateTime<Utc>,
}

/// Who was seen on one day and which enrolled identities were not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub present: Vec<PresentEntry>,
    pub absent: Vec<Identity>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyRow {
    pub identity: Identity,
    pub days_present: u32,
    /// Share of the month's recorded days on which the identity was seen.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyReport {
    pub year: i32,
    pub month: u32,
    /// Days of the month with at least one record from anyone.
    pub recorded_days: Vec<NaiveDate>,
    pub rows: Vec<MonthlyRow>,
}

pub struct AttendanceLedger {
    db: Database,
    window: Duration,
}

impl AttendanceLedger {
    pub fn new(db: Database, window: Duration) -> Self {
        Self { db, window }
    }

    /// Record `identity` at `observed_at` unless its last record is inside
    /// the dedup window. Returns whether a record was appended.
    pub fn record(&self, identity: &Identity, observed_at: DateTime<Utc>) -> Result<bool, EngineError> {
        let observed_ms = observed_at.timestamp_millis();
        let window_ms = self.window.num_milliseconds();

        let recorded = self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let last: Option<i64> = tx.query_row(
                "SELECT MAX(observed_at_ms) FROM attendance WHERE identity = ?1",
                params![identity.as_str()],
                |row| row.get(0),
            )?;
            if let Some(last) = last {
                if observed_ms - last < window_ms {
                    return Ok(false);
                }
            }
            tx.execute(
                "INSERT INTO attendance (identity, observed_at_ms) VALUES (?1, ?2)",
                params![identity.as_str(), observed_ms],
            )?;
            tx.commit()?;
            Ok(true)
        })?;

        if recorded {
            tracing::info!(identity = %identity, at = %observed_at, "attendance recorded");
        } else {
            tracing::debug!(identity = %identity, at = %observed_at, "attendance suppressed by dedup window");
        }
        Ok(recorded)
    }

    /// Per-identity count and first/last sighting, ordered by identity.
    pub fn list_attendance(&self) -> Result<Vec<AttendanceSummary>, EngineError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT identity, COUNT(*), MIN(observed_at_ms), MAX(observed_at_ms)
                 FROM attendance GROUP BY identity ORDER BY identity",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut summaries = Vec::new();
            for row in rows {
                let (identity, count, first, last) = row?;
                summaries.push(AttendanceSummary {
                    identity: Identity::try_from(identity)?,
                    count: count as u64,
                    first_seen: millis_to_utc(first)?,
                    last_seen: millis_to_utc(last)?,
                });
            }
            Ok(summaries)
        })
    }

    /// Records in `[from, to)`, oldest first.
    pub fn records_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT identity, observed_at_ms FROM attendance
                 WHERE observed_at_ms >= ?1 AND observed_at_ms < ?2
                 ORDER BY observed_at_ms, id",
            )?;
            let rows = stmt.query_map(params![from.timestamp_millis(), to.timestamp_millis()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (identity, at) = row?;
                records.push(AttendanceRecord {
                    identity: Identity::try_from(identity)?,
                    observed_at: millis_to_utc(at)?,
                });
            }
            Ok(records)
        })
    }

    /// Present and absent identities for one day. `enrolled` supplies the
    /// identities expected to attend.
    pub fn daily_summary(&self, date: NaiveDate, enrolled: &[Identity]) -> Result<DailySummary, EngineError> {
        let start = start_of(date)?;
        let records = self.records_between(start, start + Duration::days(1))?;

        let mut first_seen: BTreeMap<Identity, DateTime<Utc>> = BTreeMap::new();
        for record in records {
            first_seen.entry(record.identity).or_insert(record.observed_at);
        }

        let absent = enrolled
            .iter()
            .filter(|id| !first_seen.contains_key(*id))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let present = first_seen
            .into_iter()
            .map(|(identity, first_seen)| PresentEntry { identity, first_seen })
            .collect();

        Ok(DailySummary { date, present, absent })
    }

    /// Days present per identity over one month, as a share of the days in
    /// that month on which anyone was recorded.
    pub fn monthly_report(
        &self,
        year: i32,
        month: u32,
        enrolled: &[Identity],
    ) -> Result<MonthlyReport, EngineError> {
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or_else(|| EngineError::InvalidRequest(format!("no such month: {year}-{month:02}")))?;
        let next = first
            .checked_add_months(chrono::Months::new(1))
            .ok_or_else(|| EngineError::InvalidRequest(format!("month out of range: {year}-{month:02}")))?;
        let records = self.records_between(start_of(first)?, start_of(next)?)?;

        let mut recorded_days = BTreeSet::new();
        let mut days_by_identity: BTreeMap<Identity, BTreeSet<NaiveDate>> = enrolled
            .iter()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for record in records {
            let day = record.observed_at.date_naive();
            recorded_days.insert(day);
            days_by_identity.entry(record.identity).or_default().insert(day);
        }

        let total = recorded_days.len();
        let rows = days_by_identity
            .into_iter()
            .map(|(identity, days)| MonthlyRow {
                identity,
                days_present: days.len() as u32,
                percentage: if total == 0 {
                    0.0
                } else {
                    days.len() as f64 * 100.0 / total as f64
                },
            })
            .collect();

        Ok(MonthlyReport {
            year: first.year(),
            month: first.month(),
            recorded_days: recorded_days.into_iter().collect(),
            rows,
        })
    }
}

fn start_of(date: NaiveDate) -> Result<DateTime<Utc>, EngineError> {
    date.and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
        .ok_or_else(|| EngineError::InvalidRequest(format!("invalid date {date}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> AttendanceLedger {
        AttendanceLedger::new(Database::open_in_memory().unwrap(), Duration::seconds(60))
    }

    fn id(name: &str) -> Identity {
        Identity::parse(name).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).unwrap()
    }

    #[test]
    fn test_dedup_window() {
        let ledger = ledger();
        let t0 = at(2024, 3, 4, 9, 0, 0);
        assert!(ledger.record(&id("ana"), t0).unwrap());
        assert!(!ledger.record(&id("ana"), t0 + Duration::seconds(1)).unwrap());
        assert!(!ledger.record(&id("ana"), t0 + Duration::seconds(59)).unwrap());
        assert!(ledger.record(&id("ana"), t0 + Duration::seconds(61)).unwrap());

        let summary = ledger.list_attendance().unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].count, 2);
        assert_eq!(summary[0].first_seen, t0);
        assert_eq!(summary[0].last_seen, t0 + Duration::seconds(61));
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let ledger = ledger();
        let t0 = at(2024, 3, 4, 9, 0, 0);
        assert!(ledger.record(&id("ana"), t0).unwrap());
        assert!(ledger.record(&id("ana"), t0 + Duration::seconds(60)).unwrap());
    }

    #[test]
    fn test_dedup_is_per_identity() {
        let ledger = ledger();
        let t0 = at(2024, 3, 4, 9, 0, 0);
        assert!(ledger.record(&id("ana"), t0).unwrap());
        assert!(ledger.record(&id("bob"), t0).unwrap());
        let names: Vec<_> = ledger
            .list_attendance()
            .unwrap()
            .into_iter()
            .map(|s| s.identity.to_string())
            .collect();
        assert_eq!(names, vec!["ana", "bob"]);
    }

    #[test]
    fn test_dedup_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.db");
        let t0 = at(2024, 3, 4, 9, 0, 0);
        {
            let ledger = AttendanceLedger::new(Database::open(&path).unwrap(), Duration::seconds(60));
            assert!(ledger.record(&id("ana"), t0).unwrap());
        }
        let ledger = AttendanceLedger::new(Database::open(&path).unwrap(), Duration::seconds(60));
        assert!(!ledger.record(&id("ana"), t0 + Duration::seconds(5)).unwrap());
    }

    #[test]
    fn test_daily_summary() {
        let ledger = ledger();
        ledger.record(&id("bob"), at(2024, 3, 4, 8, 30, 0)).unwrap();
        ledger.record(&id("bob"), at(2024, 3, 4, 12, 0, 0)).unwrap();
        ledger.record(&id("ana"), at(2024, 3, 5, 8, 0, 0)).unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let summary = ledger
            .daily_summary(day, &[id("carla"), id("ana"), id("bob")])
            .unwrap();
        assert_eq!(summary.present.len(), 1);
        assert_eq!(summary.present[0].identity.as_str(), "bob");
        assert_eq!(summary.present[0].first_seen, at(2024, 3, 4, 8, 30, 0));
        let absent: Vec<_> = summary.absent.iter().map(Identity::as_str).collect();
        assert_eq!(absent, vec!["ana", "carla"]);
    }

    #[test]
    fn test_monthly_report_percentages() {
        let ledger = ledger();
        ledger.record(&id("ana"), at(2024, 2, 1, 9, 0, 0)).unwrap();
        ledger.record(&id("ana"), at(2024, 2, 2, 9, 0, 0)).unwrap();
        ledger.record(&id("bob"), at(2024, 2, 2, 9, 5, 0)).unwrap();
        ledger.record(&id("ana"), at(2024, 3, 1, 9, 0, 0)).unwrap();

        let report = ledger.monthly_report(2024, 2, &[id("ana"), id("bob"), id("carla")]).unwrap();
        assert_eq!(report.recorded_days.len(), 2);
        let row = |name: &str| report.rows.iter().find(|r| r.identity.as_str() == name).unwrap();
        assert_eq!(row("ana").days_present, 2);
        assert_eq!(row("ana").percentage, 100.0);
        assert_eq!(row("bob").percentage, 50.0);
        assert_eq!(row("carla").days_present, 0);
    }

    #[test]
    fn test_monthly_report_empty_month_and_bad_month() {
        let ledger = ledger();
        let report = ledger.monthly_report(2024, 12, &[id("ana")]).unwrap();
        assert!(report.recorded_days.is_empty());
        assert_eq!(report.rows[0].percentage, 0.0);
        assert!(matches!(
            ledger.monthly_report(2024, 13, &[]),
            Err(EngineError::InvalidRequest(_))
        ));
    }
}
