//! Aggregation queries behind the analytics endpoints.

use super::{Database, EventKind};
use crate::error::Result;
use rusqlite::params;
use serde::Serialize;

/// Library-wide totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Overview {
    /// Registered users.
    pub users: i64,
    /// Users with the author role.
    pub authors: i64,
    /// Books in the catalog.
    pub books: i64,
    /// Active comments.
    pub comments: i64,
    /// Deduplicated views, all time.
    pub views: i64,
    /// Deduplicated downloads, all time.
    pub downloads: i64,
    /// Views recorded today (UTC).
    pub views_today: i64,
    /// Downloads recorded today (UTC).
    pub downloads_today: i64,
}

/// A book with one of its counters.
#[derive(Debug, Clone, Serialize)]
pub struct BookMetricRow {
    /// Book ID.
    pub book_id: String,
    /// Title.
    pub title: String,
    /// Author.
    pub author: Option<String>,
    /// Counter value.
    pub count: i64,
}

impl Database {
    /// Count events grouped by `strftime(bucket_format)` within `[start, end)`.
    ///
    /// `book_id` restricts to one book, `uploader_id` to books uploaded by
    /// that user. Buckets without events are absent from the result.
    pub fn event_counts(
        &self,
        kind: EventKind,
        bucket_format: &str,
        start: i64,
        end: i64,
        book_id: Option<&str>,
        uploader_id: Option<&str>,
    ) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT strftime(?1, e.created_at, 'unixepoch') AS bucket, COUNT(*)
             FROM {} e
             JOIN books b ON b.id = e.book_id
             WHERE e.created_at >= ?2 AND e.created_at < ?3
               AND (?4 IS NULL OR e.book_id = ?4)
               AND (?5 IS NULL OR b.uploader_id = ?5)
             GROUP BY bucket
             ORDER BY bucket",
            kind.table()
        ))?;

        let rows = stmt
            .query_map(
                params![bucket_format, start, end, book_id, uploader_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Count users per age range.
    ///
    /// With `book_id`, only signed-in users who viewed or downloaded that
    /// book are counted. Users without an age range are reported as
    /// `unknown`.
    pub fn age_counts(&self, book_id: Option<&str>) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock();

        let sql = match book_id {
            None => {
                "SELECT COALESCE(age_range, 'unknown') AS bracket, COUNT(*)
                 FROM users
                 GROUP BY bracket"
            }
            Some(_) => {
                "SELECT COALESCE(u.age_range, 'unknown') AS bracket, COUNT(DISTINCT u.id)
                 FROM users u
                 JOIN (
                     SELECT user_id FROM book_views WHERE book_id = ?1 AND user_id IS NOT NULL
                     UNION
                     SELECT user_id FROM book_downloads WHERE book_id = ?1 AND user_id IS NOT NULL
                 ) r ON r.user_id = u.id
                 GROUP BY bracket"
            }
        };

        let mut stmt = conn.prepare(sql)?;
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, i64)> {
            Ok((row.get(0)?, row.get(1)?))
        };
        let rows = match book_id {
            None => stmt.query_map([], map_row)?,
            Some(id) => stmt.query_map(params![id], map_row)?,
        }
        .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Books ranked by a counter, optionally restricted to one uploader.
    pub fn top_books(
        &self,
        kind: EventKind,
        limit: u32,
        uploader_id: Option<&str>,
    ) -> Result<Vec<BookMetricRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, title, author, {col}
             FROM books
             WHERE (?1 IS NULL OR uploader_id = ?1)
             ORDER BY {col} DESC, title COLLATE NOCASE
             LIMIT ?2",
            col = kind.counter_column()
        ))?;

        let rows = stmt
            .query_map(params![uploader_id, limit], |row| {
                Ok(BookMetricRow {
                    book_id: row.get(0)?,
                    title: row.get(1)?,
                    author: row.get(2)?,
                    count: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    /// Library-wide totals; `today` is the current UTC day (`YYYY-MM-DD`).
    pub fn overview(&self, today: &str) -> Result<Overview> {
        let conn = self.conn.lock();
        let overview = conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM users),
                (SELECT COUNT(*) FROM users WHERE role = 'author'),
                (SELECT COUNT(*) FROM books),
                (SELECT COUNT(*) FROM book_comments WHERE status = 'active'),
                (SELECT COALESCE(SUM(view_count), 0) FROM books),
                (SELECT COALESCE(SUM(download_count), 0) FROM books),
                (SELECT COUNT(*) FROM book_views WHERE day = ?1),
                (SELECT COUNT(*) FROM book_downloads WHERE day = ?1)",
            params![today],
            |row| {
                Ok(Overview {
                    users: row.get(0)?,
                    authors: row.get(1)?,
                    books: row.get(2)?,
                    comments: row.get(3)?,
                    views: row.get(4)?,
                    downloads: row.get(5)?,
                    views_today: row.get(6)?,
                    downloads_today: row.get(7)?,
                })
            },
        )?;
        Ok(overview)
    }
}
