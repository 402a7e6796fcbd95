//! Usage analytics: time bucketing, dense chart series and viewer keys.
//!
//! Views and downloads are stored as one row per (book, viewer, UTC day).
//! Charts group those rows by a bucket size derived from the requested
//! granularity and fill the buckets without events with zeros, so every
//! series has exactly one point per label in the range.

use crate::db::{AgeRange, Database, EventKind};
use crate::error::{AppError, Result};
use chrono::{Datelike, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Longest range served with daily buckets.
const MAX_DAY_BUCKETS: u64 = 366;

/// Longest range served with monthly buckets in custom mode.
const MAX_CUSTOM_MONTHS: i32 = 24;

/// Longest range served with monthly buckets.
const MAX_MONTH_BUCKETS: u64 = 1200;

/// Longest range served with yearly buckets.
const MAX_YEAR_BUCKETS: u64 = 200;

/// Requested chart granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One point per day.
    #[default]
    Day,
    /// One point per month.
    Month,
    /// One point per year.
    Year,
    /// Explicit range; the bucket size follows the span.
    Custom,
}

/// Effective bucket size of a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    /// `YYYY-MM-DD`.
    Day,
    /// `YYYY-MM`.
    Month,
    /// `YYYY`.
    Year,
}

impl Bucket {
    /// SQLite `strftime` pattern producing this bucket's labels.
    pub fn strftime(&self) -> &'static str {
        match self {
            Bucket::Day => "%Y-%m-%d",
            Bucket::Month => "%Y-%m",
            Bucket::Year => "%Y",
        }
    }
}

/// Resolved, validated date range with its bucket size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Bucket size.
    pub bucket: Bucket,
    /// First day included.
    pub start: NaiveDate,
    /// Last day included.
    pub end: NaiveDate,
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

fn months_before(date: NaiveDate, months: i32) -> Option<NaiveDate> {
    let index = date.year() * 12 + date.month0() as i32 - months;
    NaiveDate::from_ymd_opt(index.div_euclid(12), index.rem_euclid(12) as u32 + 1, 1)
}

fn month_index(date: NaiveDate) -> i32 {
    date.year() * 12 + date.month0() as i32
}

fn midnight_ts(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or_default()
}

impl TimeRange {
    /// Resolve query parameters into a concrete range.
    ///
    /// Without explicit bounds, `day` covers the last `default_days` days,
    /// `month` the last 12 months and `year` the last 5 years, all ending
    /// `today`. `custom` requires both bounds and picks daily buckets for
    /// spans up to 31 days, monthly buckets up to 24 months and yearly
    /// buckets beyond.
    pub fn resolve(
        granularity: Granularity,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        today: NaiveDate,
        default_days: u32,
    ) -> Result<Self> {
        let end = end.unwrap_or(today);
        let invalid = || AppError::Validation("Date range is out of bounds".to_string());

        let range = match granularity {
            Granularity::Day => {
                let start = match start {
                    Some(s) => s,
                    None => end
                        .checked_sub_days(Days::new(default_days.max(1) as u64 - 1))
                        .ok_or_else(invalid)?,
                };
                TimeRange {
                    bucket: Bucket::Day,
                    start,
                    end,
                }
            }
            Granularity::Month => {
                let start = match start {
                    Some(s) => first_of_month(s),
                    None => months_before(end, 11).ok_or_else(invalid)?,
                };
                TimeRange {
                    bucket: Bucket::Month,
                    start,
                    end,
                }
            }
            Granularity::Year => {
                let start = match start {
                    Some(s) => NaiveDate::from_ymd_opt(s.year(), 1, 1).ok_or_else(invalid)?,
                    None => NaiveDate::from_ymd_opt(end.year() - 4, 1, 1).ok_or_else(invalid)?,
                };
                TimeRange {
                    bucket: Bucket::Year,
                    start,
                    end,
                }
            }
            Granularity::Custom => {
                let start = start.ok_or_else(|| {
                    AppError::Validation("Custom range requires 'start' and 'end'".to_string())
                })?;
                let span_days = (end - start).num_days() + 1;
                let span_months = month_index(end) - month_index(start) + 1;
                let bucket = if span_days <= 31 {
                    Bucket::Day
                } else if span_months <= MAX_CUSTOM_MONTHS {
                    Bucket::Month
                } else {
                    Bucket::Year
                };
                TimeRange { bucket, start, end }
            }
        };

        if range.start > range.end {
            return Err(AppError::Validation(
                "'start' must not be after 'end'".to_string(),
            ));
        }

        let (limit, unit) = match range.bucket {
            Bucket::Day => (MAX_DAY_BUCKETS, "days"),
            Bucket::Month => (MAX_MONTH_BUCKETS, "months"),
            Bucket::Year => (MAX_YEAR_BUCKETS, "years"),
        };
        if range.bucket_count() > limit {
            return Err(AppError::Validation(format!(
                "Series are limited to {} {}, narrow the range or use a coarser granularity",
                limit, unit
            )));
        }

        Ok(range)
    }

    /// Number of buckets between `start` and `end`, both included.
    pub fn bucket_count(&self) -> u64 {
        let span = match self.bucket {
            Bucket::Day => (self.end - self.start).num_days(),
            Bucket::Month => (month_index(self.end) - month_index(self.start)) as i64,
            Bucket::Year => (self.end.year() - self.start.year()) as i64,
        };
        span.max(0) as u64 + 1
    }

    /// Inclusive lower bound as Unix seconds.
    pub fn start_ts(&self) -> i64 {
        midnight_ts(self.start)
    }

    /// Exclusive upper bound as Unix seconds (midnight after `end`).
    pub fn end_ts(&self) -> i64 {
        self.end
            .checked_add_days(Days::new(1))
            .map(midnight_ts)
            .unwrap_or(i64::MAX)
    }

    /// Every bucket label in the range, in order.
    pub fn labels(&self) -> Vec<String> {
        match self.bucket {
            Bucket::Day => self
                .start
                .iter_days()
                .take_while(|d| *d <= self.end)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .collect(),
            Bucket::Month => (month_index(self.start)..=month_index(self.end))
                .map(|i| format!("{:04}-{:02}", i.div_euclid(12), i.rem_euclid(12) + 1))
                .collect(),
            Bucket::Year => (self.start.year()..=self.end.year())
                .map(|y| format!("{:04}", y))
                .collect(),
        }
    }
}

/// One chart point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataPoint {
    /// Bucket label.
    pub bucket: String,
    /// Events in the bucket.
    pub count: i64,
}

/// Dense chart series.
#[derive(Debug, Clone, Serialize)]
pub struct Series {
    /// Event kind.
    pub metric: EventKind,
    /// Bucket size.
    pub bucket: Bucket,
    /// First day included.
    pub start: NaiveDate,
    /// Last day included.
    pub end: NaiveDate,
    /// One point per bucket.
    pub points: Vec<DataPoint>,
    /// Sum of all points.
    pub total: i64,
}

/// Merge sparse SQL rows into one point per label.
pub fn fill_series(labels: Vec<String>, rows: Vec<(String, i64)>) -> Vec<DataPoint> {
    let counts: HashMap<String, i64> = rows.into_iter().collect();
    labels
        .into_iter()
        .map(|bucket| DataPoint {
            count: counts.get(&bucket).copied().unwrap_or(0),
            bucket,
        })
        .collect()
}

/// Restriction applied to analytics queries.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Single book.
    pub book_id: Option<String>,
    /// Books uploaded by this user.
    pub uploader_id: Option<String>,
}

/// Build a dense view or download series.
pub fn event_series(
    db: &Database,
    metric: EventKind,
    range: &TimeRange,
    scope: &Scope,
) -> Result<Series> {
    let rows = db.event_counts(
        metric,
        range.bucket.strftime(),
        range.start_ts(),
        range.end_ts(),
        scope.book_id.as_deref(),
        scope.uploader_id.as_deref(),
    )?;

    let points = fill_series(range.labels(), rows);
    let total = points.iter().map(|p| p.count).sum();

    Ok(Series {
        metric,
        bucket: range.bucket,
        start: range.start,
        end: range.end,
        points,
        total,
    })
}

/// Reader count for one age bracket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgeBucket {
    /// Age range label, or `unknown`.
    pub age_range: String,
    /// Users in the bracket.
    pub count: i64,
}

/// Order age rows as the brackets are declared, then `unknown`, zero-filled.
pub fn fill_age_distribution(rows: Vec<(String, i64)>) -> Vec<AgeBucket> {
    let counts: HashMap<String, i64> = rows.into_iter().collect();
    AgeRange::ALL
        .iter()
        .map(|r| r.as_str())
        .chain(std::iter::once("unknown"))
        .map(|label| AgeBucket {
            age_range: label.to_string(),
            count: counts.get(label).copied().unwrap_or(0),
        })
        .collect()
}

/// Age distribution of all users, or of the readers of one book.
pub fn age_distribution(db: &Database, book_id: Option<&str>) -> Result<Vec<AgeBucket>> {
    Ok(fill_age_distribution(db.age_counts(book_id)?))
}

/// Fingerprint used to deduplicate daily views and downloads.
///
/// Signed-in readers are keyed by account; anonymous ones by a hash of
/// their IP address and user agent.
pub fn viewer_key(user_id: Option<&str>, ip: Option<&str>, user_agent: Option<&str>) -> String {
    if let Some(id) = user_id {
        return format!("usr:{}", id);
    }

    let mut hasher = Sha256::new();
    hasher.update(ip.unwrap_or("unknown").as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.unwrap_or("").as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    format!("anon:{}", &digest[..32])
}
