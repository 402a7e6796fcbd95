mod analytics;
mod schema;

pub use analytics::{BookMetricRow, Overview};
pub use schema::Database;

use crate::config::BookFormat;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Declares a string-backed enum stored as TEXT and exchanged as snake_case JSON.
macro_rules! text_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            /// All variants in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Database / wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::Validation(format!(
                        "Invalid {} '{}', expected one of: {}",
                        stringify!($name),
                        other,
                        [$($text),+].join(", ")
                    ))),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: AppError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum! {
    /// Account role.
    pub enum Role {
        /// Full access, including analytics and audit.
        Admin => "admin",
        /// May upload and manage own books.
        Author => "author",
        /// Reader.
        User => "user",
    }
}

text_enum! {
    /// Self-declared age bracket used for audience charts.
    pub enum AgeRange {
        /// Younger than 18.
        Under18 => "under_18",
        /// 18 to 24.
        From18To24 => "18_24",
        /// 25 to 34.
        From25To34 => "25_34",
        /// 35 to 44.
        From35To44 => "35_44",
        /// 45 to 54.
        From45To54 => "45_54",
        /// 55 and older.
        Over55 => "55_plus",
    }
}

text_enum! {
    /// Reading status on a user's shelf.
    pub enum ReadingStatus {
        /// Saved for later.
        WantToRead => "want_to_read",
        /// In progress.
        Reading => "reading",
        /// Completed.
        Finished => "finished",
    }
}

text_enum! {
    /// Comment visibility.
    pub enum CommentStatus {
        /// Visible.
        Active => "active",
        /// Soft-deleted.
        Deleted => "deleted",
    }
}

impl ToSql for BookFormat {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.extension()))
    }
}

impl FromSql for BookFormat {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: AppError| FromSqlError::Other(Box::new(e)))
    }
}

impl Role {
    /// Whether this role may upload books.
    pub fn can_publish(&self) -> bool {
        matches!(self, Role::Admin | Role::Author)
    }
}

/// User account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Unique user ID.
    pub id: String,
    /// Username for login.
    pub username: String,
    /// Email address.
    pub email: Option<String>,
    /// Argon2 password hash.
    #[serde(skip_serializing)]
    pub password_hash: String,
    /// Display name.
    pub display_name: Option<String>,
    /// User role.
    pub role: Role,
    /// Age bracket.
    pub age_range: Option<AgeRange>,
    /// Account creation timestamp.
    pub created_at: i64,
    /// Last login timestamp.
    pub last_login: Option<i64>,
}

impl User {
    /// Whether the user has the admin role.
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Editable profile fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfileUpdate {
    /// New display name.
    pub display_name: Option<String>,
    /// New email.
    pub email: Option<String>,
    /// New age bracket.
    pub age_range: Option<AgeRange>,
}

/// Book metadata (content and cover are loaded separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    /// Book ID.
    pub id: String,
    /// Title.
    pub title: String,
    /// Author name as printed.
    pub author: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Category / genre.
    pub category: Option<String>,
    /// ISBN.
    pub isbn: Option<String>,
    /// Language code.
    pub language: Option<String>,
    /// Publication year.
    pub published_year: Option<i32>,
    /// Uploading user.
    pub uploader_id: Option<String>,
    /// Original file name.
    pub file_name: String,
    /// E-book format.
    pub format: BookFormat,
    /// Content size in bytes.
    pub file_size: i64,
    /// Path of the content file when stored on disk.
    #[serde(skip_serializing)]
    pub content_path: Option<String>,
    /// Whether a cover image exists.
    pub has_cover: bool,
    /// Deduplicated view counter.
    pub view_count: i64,
    /// Deduplicated download counter.
    pub download_count: i64,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Book insert payload.
#[derive(Debug, Clone)]
pub struct NewBook {
    /// Book ID.
    pub id: String,
    /// Title.
    pub title: String,
    /// Author name.
    pub author: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Category.
    pub category: Option<String>,
    /// ISBN.
    pub isbn: Option<String>,
    /// Language code.
    pub language: Option<String>,
    /// Publication year.
    pub published_year: Option<i32>,
    /// Uploading user.
    pub uploader_id: Option<String>,
    /// Original file name.
    pub file_name: String,
    /// Format.
    pub format: BookFormat,
    /// Content size in bytes.
    pub file_size: i64,
    /// Content path (disk mode).
    pub content_path: Option<String>,
    /// Inline content (database mode).
    pub content: Option<Vec<u8>>,
    /// Cover as base64 data URL.
    pub cover_image: Option<String>,
}

/// Partial metadata update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookUpdate {
    /// Title.
    pub title: Option<String>,
    /// Author name.
    pub author: Option<String>,
    /// Description.
    pub description: Option<String>,
    /// Category.
    pub category: Option<String>,
    /// ISBN.
    pub isbn: Option<String>,
    /// Language.
    pub language: Option<String>,
    /// Publication year.
    pub published_year: Option<i32>,
}

/// Sort order for book listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookSort {
    /// Newest first.
    #[default]
    Newest,
    /// Alphabetical by title.
    Title,
    /// Most viewed first.
    Views,
    /// Most downloaded first.
    Downloads,
}

impl BookSort {
    pub(crate) fn order_by(&self) -> &'static str {
        match self {
            BookSort::Newest => "b.created_at DESC, b.id",
            BookSort::Title => "b.title COLLATE NOCASE, b.id",
            BookSort::Views => "b.view_count DESC, b.id",
            BookSort::Downloads => "b.download_count DESC, b.id",
        }
    }
}

/// Book listing filter.
#[derive(Debug, Clone, Default)]
pub struct BookQuery {
    /// Free-text search on title, author and description.
    pub search: Option<String>,
    /// Exact author match.
    pub author: Option<String>,
    /// Exact category match.
    pub category: Option<String>,
    /// Books uploaded by this user.
    pub uploader_id: Option<String>,
    /// Sort order.
    pub sort: BookSort,
    /// Page size.
    pub limit: u32,
    /// Rows to skip.
    pub offset: u32,
}

/// A page of results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T: Serialize> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Total matching rows.
    pub total: i64,
    /// Page size used.
    pub limit: u32,
    /// Offset used.
    pub offset: u32,
}

/// Per-user shelf entry for a book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserBook {
    /// User ID.
    pub user_id: String,
    /// Book ID.
    pub book_id: String,
    /// Reading status.
    pub status: ReadingStatus,
    /// Reading progress in percent (0.0 - 100.0).
    pub progress: f64,
    /// Rating 1-5.
    pub rating: Option<i64>,
    /// Favorite flag.
    pub is_favorite: bool,
    /// First time the book was opened.
    pub started_at: Option<i64>,
    /// Completion timestamp.
    pub finished_at: Option<i64>,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Shelf entry update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserBookUpdate {
    /// Reading status.
    pub status: Option<ReadingStatus>,
    /// Progress percentage.
    pub progress: Option<f64>,
    /// Rating 1-5.
    pub rating: Option<i64>,
    /// Favorite flag.
    pub is_favorite: Option<bool>,
}

impl UserBook {
    /// Fresh shelf entry.
    pub fn new(user_id: &str, book_id: &str, now: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            book_id: book_id.to_string(),
            status: ReadingStatus::WantToRead,
            progress: 0.0,
            rating: None,
            is_favorite: false,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    /// Apply an update, keeping status and progress consistent.
    ///
    /// Reaching 100 % marks the book finished; marking it finished sets
    /// progress to 100 %. Any progress above zero moves a saved book to
    /// `reading`.
    pub fn apply(&mut self, update: &UserBookUpdate, now: i64) {
        if let Some(progress) = update.progress {
            self.progress = progress.clamp(0.0, 100.0);
            if self.progress >= 100.0 {
                self.status = ReadingStatus::Finished;
            } else if self.progress > 0.0 {
                self.status = ReadingStatus::Reading;
            }
        }

        if let Some(status) = update.status {
            self.status = status;
            if status == ReadingStatus::Finished {
                self.progress = 100.0;
            }
        }

        if self.status != ReadingStatus::WantToRead && self.started_at.is_none() {
            self.started_at = Some(now);
        }

        match self.status {
            ReadingStatus::Finished => {
                if self.finished_at.is_none() {
                    self.finished_at = Some(now);
                }
            }
            _ => self.finished_at = None,
        }

        if let Some(rating) = update.rating {
            self.rating = Some(rating);
        }
        if let Some(favorite) = update.is_favorite {
            self.is_favorite = favorite;
        }

        self.updated_at = now;
    }
}

/// Shelf entry joined with book metadata.
#[derive(Debug, Clone, Serialize)]
pub struct ShelfEntry {
    /// Shelf state.
    #[serde(flatten)]
    pub entry: UserBook,
    /// Book title.
    pub title: String,
    /// Book author.
    pub author: Option<String>,
    /// Whether the book has a cover.
    pub has_cover: bool,
}

/// Comment on a book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    /// Comment ID.
    pub id: String,
    /// Book ID.
    pub book_id: String,
    /// Author user ID.
    pub user_id: String,
    /// Author username.
    pub username: String,
    /// Comment text.
    pub content: String,
    /// Optional rating 1-5.
    pub rating: Option<i64>,
    /// Visibility.
    pub status: CommentStatus,
    /// Creation timestamp.
    pub created_at: i64,
    /// Last update timestamp.
    pub updated_at: i64,
}

/// Comments listing with rating summary.
#[derive(Debug, Clone, Serialize)]
pub struct CommentThread {
    /// Active comments, newest first.
    pub comments: Vec<Comment>,
    /// Number of active comments.
    pub total: usize,
    /// Average of the ratings given in active comments.
    pub average_rating: Option<f64>,
}

/// Audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry ID (assigned on insert).
    pub id: i64,
    /// Acting user.
    pub user_id: Option<String>,
    /// Action name, e.g. `book.create`.
    pub action: String,
    /// Entity kind.
    pub entity_type: Option<String>,
    /// Entity ID.
    pub entity_id: Option<String>,
    /// JSON details.
    pub details: Option<String>,
    /// Client IP.
    pub ip: Option<String>,
    /// Client user agent.
    pub user_agent: Option<String>,
    /// Creation timestamp.
    pub created_at: i64,
}

/// Audit log filter.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Acting user.
    pub user_id: Option<String>,
    /// Action name.
    pub action: Option<String>,
    /// Entity kind.
    pub entity_type: Option<String>,
    /// Only entries at or after this timestamp.
    pub since: Option<i64>,
    /// Page size.
    pub limit: u32,
    /// Rows to skip.
    pub offset: u32,
}

/// Countable book event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Metadata or content opened.
    View,
    /// File downloaded.
    Download,
}

impl EventKind {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            EventKind::View => "book_views",
            EventKind::Download => "book_downloads",
        }
    }

    pub(crate) fn counter_column(&self) -> &'static str {
        match self {
            EventKind::View => "view_count",
            EventKind::Download => "download_count",
        }
    }
}

/// Timestamp helper.
pub fn now_timestamp() -> i64 {
    Utc::now().timestamp()
}

/// Convert timestamp to DateTime.
pub fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

/// UTC calendar day of a timestamp, as `YYYY-MM-DD`.
pub fn day_of(ts: i64) -> String {
    timestamp_to_datetime(ts).format("%Y-%m-%d").to_string()
}
