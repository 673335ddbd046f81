//! Calendar dimension. Static attributes are fixed per date; the
//! "relative to today" columns are rewritten on every run.

use anyhow::Result;
use chrono::{Datelike, NaiveDate, Weekday};
use common::types::{format_date, time_key};
use rusqlite::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarRow {
    pub time_key: i64,
    pub full_date: NaiveDate,
    pub year: i32,
    pub quarter: u32,
    pub month: u32,
    pub month_name: &'static str,
    pub iso_week: u32,
    pub day_of_month: u32,
    pub day_of_week: u32,
    pub day_name: &'static str,
    pub day_of_year: u32,
    pub is_weekend: bool,
    pub is_month_start: bool,
    pub is_month_end: bool,
    pub is_quarter_start: bool,
    pub is_quarter_end: bool,
    pub is_year_start: bool,
    pub is_year_end: bool,
    pub relative: RelativeFlags,
}

/// Columns that depend on the run date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeFlags {
    pub is_current_day: bool,
    pub is_current_week: bool,
    pub is_current_month: bool,
    pub is_current_quarter: bool,
    pub is_current_year: bool,
    pub days_ago: i64,
    pub weeks_ago: i64,
    pub months_ago: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DimTimeStats {
    pub inserted: u64,
    pub refreshed: u64,
}

const MONTH_NAMES: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

fn day_name(w: Weekday) -> &'static str {
    match w {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

fn quarter(d: NaiveDate) -> u32 {
    (d.month() - 1) / 3 + 1
}

fn week_start(d: NaiveDate) -> NaiveDate {
    d - chrono::Duration::days(i64::from(d.weekday().num_days_from_monday()))
}

fn month_index(d: NaiveDate) -> i64 {
    i64::from(d.year()) * 12 + i64::from(d.month0())
}

pub fn relative_flags(date: NaiveDate, today: NaiveDate) -> RelativeFlags {
    RelativeFlags {
        is_current_day: date == today,
        is_current_week: week_start(date) == week_start(today),
        is_current_month: month_index(date) == month_index(today),
        is_current_quarter: date.year() == today.year() && quarter(date) == quarter(today),
        is_current_year: date.year() == today.year(),
        days_ago: (today - date).num_days(),
        weeks_ago: (week_start(today) - week_start(date)).num_days() / 7,
        months_ago: month_index(today) - month_index(date),
    }
}

pub fn calendar_row(date: NaiveDate, today: NaiveDate) -> CalendarRow {
    let tomorrow = date.succ_opt();
    let is_month_end = tomorrow.is_none_or(|t| t.month() != date.month());
    let is_month_start = date.day() == 1;
    let quarter_month = (date.month() - 1) % 3;

    CalendarRow {
        time_key: time_key(date),
        full_date: date,
        year: date.year(),
        quarter: quarter(date),
        month: date.month(),
        month_name: MONTH_NAMES[date.month0() as usize],
        iso_week: date.iso_week().week(),
        day_of_month: date.day(),
        day_of_week: date.weekday().number_from_monday(),
        day_name: day_name(date.weekday()),
        day_of_year: date.ordinal(),
        is_weekend: matches!(date.weekday(), Weekday::Sat | Weekday::Sun),
        is_month_start,
        is_month_end,
        is_quarter_start: is_month_start && quarter_month == 0,
        is_quarter_end: is_month_end && quarter_month == 2,
        is_year_start: date.ordinal() == 1,
        is_year_end: date.month() == 12 && date.day() == 31,
        relative: relative_flags(date, today),
    }
}

/// Insert missing dates in `[start, end]` and rewrite the relative columns of existing ones.
pub fn refresh_dim_time(
    conn: &mut Connection,
    start: NaiveDate,
    end: NaiveDate,
    today: NaiveDate,
) -> Result<DimTimeStats> {
    anyhow::ensure!(start <= end, "dim_time range is empty: {start} > {end}");

    let tx = conn.transaction()?;
    let before: i64 = tx.query_row("SELECT COUNT(*) FROM dim_time", [], |r| r.get(0))?;
    let mut written = 0_u64;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO dim_time (
                time_key, full_date, year, quarter, month, month_name, iso_week,
                day_of_month, day_of_week, day_name, day_of_year, is_weekend,
                is_month_start, is_month_end, is_quarter_start, is_quarter_end,
                is_year_start, is_year_end,
                is_current_day, is_current_week, is_current_month, is_current_quarter,
                is_current_year, days_ago, weeks_ago, months_ago
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                       ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
             ON CONFLICT(time_key) DO UPDATE SET
                is_current_day = excluded.is_current_day,
                is_current_week = excluded.is_current_week,
                is_current_month = excluded.is_current_month,
                is_current_quarter = excluded.is_current_quarter,
                is_current_year = excluded.is_current_year,
                days_ago = excluded.days_ago,
                weeks_ago = excluded.weeks_ago,
                months_ago = excluded.months_ago",
        )?;
        for date in start.iter_days().take_while(|d| *d <= end) {
            let r = calendar_row(date, today);
            let rel = r.relative;
            stmt.execute(rusqlite::params![
                r.time_key,
                format_date(r.full_date),
                r.year,
                r.quarter,
                r.month,
                r.month_name,
                r.iso_week,
                r.day_of_month,
                r.day_of_week,
                r.day_name,
                r.day_of_year,
                r.is_weekend,
                r.is_month_start,
                r.is_month_end,
                r.is_quarter_start,
                r.is_quarter_end,
                r.is_year_start,
                r.is_year_end,
                rel.is_current_day,
                rel.is_current_week,
                rel.is_current_month,
                rel.is_current_quarter,
                rel.is_current_year,
                rel.days_ago,
                rel.weeks_ago,
                rel.months_ago,
            ])?;
            written += 1;
        }
    }
    let after: i64 = tx.query_row("SELECT COUNT(*) FROM dim_time", [], |r| r.get(0))?;
    tx.commit()?;

    let inserted = u64::try_from(after - before).unwrap_or(0);
    Ok(DimTimeStats {
        inserted,
        refreshed: written - inserted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::db::Database;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_calendar_row_static_attributes() {
        // 2024-03-31 is a Sunday and the last day of Q1.
        let r = calendar_row(d(2024, 3, 31), d(2024, 4, 2));
        assert_eq!(r.time_key, 20_240_331);
        assert_eq!(r.quarter, 1);
        assert_eq!(r.month_name, "March");
        assert_eq!(r.day_of_week, 7);
        assert_eq!(r.day_name, "Sunday");
        assert!(r.is_weekend);
        assert!(r.is_month_end);
        assert!(r.is_quarter_end);
        assert!(!r.is_year_end);
        assert_eq!(r.day_of_year, 91);
    }

    #[test]
    fn test_leap_day_and_year_boundaries() {
        let feb29 = calendar_row(d(2024, 2, 29), d(2024, 2, 29));
        assert!(feb29.is_month_end);
        assert!(!calendar_row(d(2024, 2, 28), d(2024, 2, 29)).is_month_end);

        let jan1 = calendar_row(d(2025, 1, 1), d(2025, 1, 1));
        assert!(jan1.is_year_start && jan1.is_quarter_start && jan1.is_month_start);
        // ISO week of 2025-01-01 is week 1.
        assert_eq!(jan1.iso_week, 1);
        assert!(calendar_row(d(2030, 12, 31), d(2025, 1, 1)).is_year_end);
    }

    #[test]
    fn test_relative_flags() {
        // Wednesday 2024-05-15
        let today = d(2024, 5, 15);
        let same_week = relative_flags(d(2024, 5, 13), today);
        assert!(same_week.is_current_week);
        assert!(!same_week.is_current_day);
        assert_eq!(same_week.days_ago, 2);
        assert_eq!(same_week.weeks_ago, 0);

        let last_week = relative_flags(d(2024, 5, 12), today);
        assert!(!last_week.is_current_week);
        assert_eq!(last_week.weeks_ago, 1);

        let prev_year = relative_flags(d(2023, 12, 31), today);
        assert!(!prev_year.is_current_year);
        assert_eq!(prev_year.months_ago, 5);

        let future = relative_flags(d(2024, 6, 1), today);
        assert_eq!(future.days_ago, -17);
        assert_eq!(future.months_ago, -1);
        assert!(future.is_current_quarter);
    }

    #[test]
    fn test_refresh_is_idempotent_and_only_moves_relative_columns() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();

        let (start, end) = (d(2024, 1, 1), d(2024, 12, 31));
        let first = refresh_dim_time(&mut db.conn, start, end, d(2024, 6, 1)).unwrap();
        assert_eq!(first.inserted, 366);
        assert_eq!(first.refreshed, 0);

        let snapshot = |conn: &Connection| -> Vec<(i64, String, i64)> {
            conn.prepare("SELECT time_key, day_name, days_ago FROM dim_time ORDER BY time_key")
                .unwrap()
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                .unwrap()
                .collect::<std::result::Result<_, _>>()
                .unwrap()
        };
        let once = snapshot(&db.conn);

        let second = refresh_dim_time(&mut db.conn, start, end, d(2024, 6, 1)).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.refreshed, 366);
        assert_eq!(snapshot(&db.conn), once);

        // A later run date shifts only the relative columns.
        refresh_dim_time(&mut db.conn, start, end, d(2024, 6, 2)).unwrap();
        let shifted = snapshot(&db.conn);
        assert_eq!(shifted.len(), 366);
        assert_eq!(shifted[0].1, once[0].1);
        assert_eq!(shifted[0].2, once[0].2 + 1);
    }

    #[test]
    fn test_refresh_extends_range() {
        let mut db = Database::open(":memory:").unwrap();
        db.run_migrations().unwrap();
        let today = d(2024, 1, 10);
        refresh_dim_time(&mut db.conn, d(2024, 1, 1), d(2024, 1, 10), today).unwrap();
        let s = refresh_dim_time(&mut db.conn, d(2024, 1, 1), d(2024, 1, 20), today).unwrap();
        assert_eq!(s.inserted, 10);
        assert_eq!(s.refreshed, 10);
    }
}
