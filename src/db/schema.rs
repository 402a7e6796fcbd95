use crate::db::*;
use crate::error::{AppError, Result};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::Path;
use std::sync::Arc;

/// Database wrapper for thread-safe access.
#[derive(Clone)]
pub struct Database {
    pub(super) conn: Arc<Mutex<Connection>>,
}

const USER_COLUMNS: &str =
    "id, username, email, password_hash, display_name, role, age_range, created_at, last_login";

const BOOK_COLUMNS: &str = "b.id, b.title, b.author, b.description, b.category, b.isbn, \
     b.language, b.published_year, b.uploader_id, b.file_name, b.format, b.file_size, \
     b.content_path, b.cover_image IS NOT NULL, b.view_count, b.download_count, \
     b.created_at, b.updated_at";

const USER_BOOK_COLUMNS: &str = "ub.user_id, ub.book_id, ub.status, ub.progress, ub.rating, \
     ub.is_favorite, ub.started_at, ub.finished_at, ub.updated_at";

const COMMENT_COLUMNS: &str = "c.id, c.book_id, c.user_id, u.username, c.content, c.rating, \
     c.status, c.created_at, c.updated_at";

const AUDIT_COLUMNS: &str =
    "id, user_id, action, entity_type, entity_id, details, ip, user_agent, created_at";

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        email: row.get(2)?,
        password_hash: row.get(3)?,
        display_name: row.get(4)?,
        role: row.get(5)?,
        age_range: row.get(6)?,
        created_at: row.get(7)?,
        last_login: row.get(8)?,
    })
}

fn book_from_row(row: &Row<'_>) -> rusqlite::Result<Book> {
    Ok(Book {
        id: row.get(0)?,
        title: row.get(1)?,
        author: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        isbn: row.get(5)?,
        language: row.get(6)?,
        published_year: row.get(7)?,
        uploader_id: row.get(8)?,
        file_name: row.get(9)?,
        format: row.get(10)?,
        file_size: row.get(11)?,
        content_path: row.get(12)?,
        has_cover: row.get(13)?,
        view_count: row.get(14)?,
        download_count: row.get(15)?,
        created_at: row.get(16)?,
        updated_at: row.get(17)?,
    })
}

fn user_book_from_row(row: &Row<'_>) -> rusqlite::Result<UserBook> {
    Ok(UserBook {
        user_id: row.get(0)?,
        book_id: row.get(1)?,
        status: row.get(2)?,
        progress: row.get(3)?,
        rating: row.get(4)?,
        is_favorite: row.get(5)?,
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn comment_from_row(row: &Row<'_>) -> rusqlite::Result<Comment> {
    Ok(Comment {
        id: row.get(0)?,
        book_id: row.get(1)?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        content: row.get(4)?,
        rating: row.get(5)?,
        status: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        action: row.get(2)?,
        entity_type: row.get(3)?,
        entity_id: row.get(4)?,
        details: row.get(5)?,
        ip: row.get(6)?,
        user_agent: row.get(7)?,
        created_at: row.get(8)?,
    })
}

/// Map UNIQUE violations to a conflict with the given message.
fn unique_violation(e: rusqlite::Error, message: impl FnOnce() -> String) -> AppError {
    if e.to_string().contains("UNIQUE constraint") {
        AppError::Conflict(message())
    } else {
        AppError::Database(e)
    }
}

/// Escape LIKE wildcards in user-provided search text.
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

impl Database {
    /// Open or create database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Open in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::Internal(format!("Failed to open database: {}", e)))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize database schema.
    fn initialize_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Users table
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                email TEXT UNIQUE,
                password_hash TEXT NOT NULL,
                display_name TEXT,
                role TEXT NOT NULL DEFAULT 'user'
                    CHECK (role IN ('admin', 'author', 'user')),
                age_range TEXT
                    CHECK (age_range IS NULL OR age_range IN
                        ('under_18', '18_24', '25_34', '35_44', '45_54', '55_plus')),
                created_at INTEGER NOT NULL,
                last_login INTEGER
            );

            -- Books table
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                author TEXT,
                description TEXT,
                category TEXT,
                isbn TEXT,
                language TEXT,
                published_year INTEGER,
                uploader_id TEXT,
                file_name TEXT NOT NULL,
                format TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                content_path TEXT,
                content BLOB,
                cover_image TEXT,
                view_count INTEGER NOT NULL DEFAULT 0,
                download_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (uploader_id) REFERENCES users(id) ON DELETE SET NULL
            );

            -- Per-user shelf (reading status, progress, rating, favorite)
            CREATE TABLE IF NOT EXISTS user_books (
                user_id TEXT NOT NULL,
                book_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'want_to_read'
                    CHECK (status IN ('want_to_read', 'reading', 'finished')),
                progress REAL NOT NULL DEFAULT 0 CHECK (progress >= 0 AND progress <= 100),
                rating INTEGER CHECK (rating IS NULL OR (rating >= 1 AND rating <= 5)),
                is_favorite INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER,
                finished_at INTEGER,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, book_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Comments table
            CREATE TABLE IF NOT EXISTS book_comments (
                id TEXT PRIMARY KEY,
                book_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                rating INTEGER CHECK (rating IS NULL OR (rating >= 1 AND rating <= 5)),
                status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'deleted')),
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );

            -- Audit trail (kept after the acting user is deleted)
            CREATE TABLE IF NOT EXISTS audit_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT,
                action TEXT NOT NULL,
                entity_type TEXT,
                entity_id TEXT,
                details TEXT,
                ip TEXT,
                user_agent TEXT,
                created_at INTEGER NOT NULL
            );

            -- Views, one per viewer per book per day
            CREATE TABLE IF NOT EXISTS book_views (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                book_id TEXT NOT NULL,
                viewer_key TEXT NOT NULL,
                user_id TEXT,
                day TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (book_id, viewer_key, day),
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Downloads, one per viewer per book per day
            CREATE TABLE IF NOT EXISTS book_downloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                book_id TEXT NOT NULL,
                viewer_key TEXT NOT NULL,
                user_id TEXT,
                day TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (book_id, viewer_key, day),
                FOREIGN KEY (book_id) REFERENCES books(id) ON DELETE CASCADE
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_books_uploader ON books(uploader_id);
            CREATE INDEX IF NOT EXISTS idx_books_category ON books(category);
            CREATE INDEX IF NOT EXISTS idx_books_created ON books(created_at);
            CREATE INDEX IF NOT EXISTS idx_user_books_user ON user_books(user_id);
            CREATE INDEX IF NOT EXISTS idx_comments_book ON book_comments(book_id, status);
            CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_logs(created_at);
            CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_logs(user_id);
            CREATE INDEX IF NOT EXISTS idx_views_created ON book_views(created_at);
            CREATE INDEX IF NOT EXISTS idx_downloads_created ON book_downloads(created_at);
            "#,
        )
        .map_err(|e| AppError::Internal(format!("Failed to initialize schema: {}", e)))?;

        Ok(())
    }

    /// Check that the connection answers.
    pub fn ping(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // ========== USER OPERATIONS ==========

    /// Create a new user.
    pub fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, username, email, password_hash, display_name, role, age_range,
                                created_at, last_login)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                user.id,
                user.username,
                user.email,
                user.password_hash,
                user.display_name,
                user.role,
                user.age_range,
                user.created_at,
                user.last_login,
            ],
        )
        .map_err(|e| {
            unique_violation(e, || {
                format!("Username '{}' or email already exists", user.username)
            })
        })?;
        Ok(())
    }

    /// Get user by username.
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1"),
                params![username],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Get user by username or email.
    pub fn get_user_by_login(&self, login: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users
                     WHERE username = ?1 OR (email IS NOT NULL AND email = ?1 COLLATE NOCASE)
                     ORDER BY username = ?1 DESC LIMIT 1"
                ),
                params![login],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// Get user by ID.
    pub fn get_user_by_id(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY username"
        ))?;

        let users = stmt
            .query_map([], user_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(users)
    }

    /// Update user password.
    pub fn update_user_password(&self, user_id: &str, password_hash: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE users SET password_hash = ?1 WHERE id = ?2",
            params![password_hash, user_id],
        )?;
        Ok(rows > 0)
    }

    /// Update user role.
    pub fn update_user_role(&self, user_id: &str, role: Role) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE users SET role = ?1 WHERE id = ?2",
            params![role, user_id],
        )?;
        Ok(rows > 0)
    }

    /// Update profile fields that are present in `update`.
    pub fn update_user_profile(&self, user_id: &str, update: &ProfileUpdate) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE users SET
                    display_name = COALESCE(?1, display_name),
                    email = COALESCE(?2, email),
                    age_range = COALESCE(?3, age_range)
                 WHERE id = ?4",
                params![update.display_name, update.email, update.age_range, user_id],
            )
            .map_err(|e| unique_violation(e, || "Email already in use".to_string()))?;
        Ok(rows > 0)
    }

    /// Update user last login.
    pub fn update_user_last_login(&self, user_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE users SET last_login = ?1 WHERE id = ?2",
            params![now_timestamp(), user_id],
        )?;
        Ok(())
    }

    /// Delete user.
    pub fn delete_user(&self, user_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        Ok(rows > 0)
    }

    // ========== BOOK OPERATIONS ==========

    /// Insert a book.
    pub fn create_book(&self, book: &NewBook) -> Result<()> {
        let now = now_timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO books
             (id, title, author, description, category, isbn, language, published_year,
              uploader_id, file_name, format, file_size, content_path, content, cover_image,
              view_count, download_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                     0, 0, ?16, ?16)",
            params![
                book.id,
                book.title,
                book.author,
                book.description,
                book.category,
                book.isbn,
                book.language,
                book.published_year,
                book.uploader_id,
                book.file_name,
                book.format,
                book.file_size,
                book.content_path,
                book.content,
                book.cover_image,
                now,
            ],
        )?;
        Ok(())
    }

    /// Get book metadata by ID.
    pub fn get_book(&self, id: &str) -> Result<Option<Book>> {
        let conn = self.conn.lock();
        let book = conn
            .query_row(
                &format!("SELECT {BOOK_COLUMNS} FROM books b WHERE b.id = ?1"),
                params![id],
                book_from_row,
            )
            .optional()?;
        Ok(book)
    }

    /// Inline content of a book stored in the database.
    pub fn get_book_content(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let content = conn
            .query_row(
                "SELECT content FROM books WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?;
        Ok(content.flatten())
    }

    /// Cover data URL of a book.
    pub fn get_book_cover(&self, id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let cover = conn
            .query_row(
                "SELECT cover_image FROM books WHERE id = ?1",
                params![id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(cover.flatten())
    }

    /// List books matching a query.
    pub fn list_books(&self, query: &BookQuery) -> Result<Page<Book>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
            clauses.push(
                "(b.title LIKE ? ESCAPE '\\' OR b.author LIKE ? ESCAPE '\\' \
                 OR b.description LIKE ? ESCAPE '\\')",
            );
            let pattern = like_pattern(search);
            for _ in 0..3 {
                values.push(Value::Text(pattern.clone()));
            }
        }
        if let Some(author) = &query.author {
            clauses.push("b.author = ? COLLATE NOCASE");
            values.push(Value::Text(author.clone()));
        }
        if let Some(category) = &query.category {
            clauses.push("b.category = ? COLLATE NOCASE");
            values.push(Value::Text(category.clone()));
        }
        if let Some(uploader) = &query.uploader_id {
            clauses.push("b.uploader_id = ?");
            values.push(Value::Text(uploader.clone()));
        }

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let conn = self.conn.lock();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM books b {where_sql}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut page_values = values;
        page_values.push(Value::Integer(query.limit as i64));
        page_values.push(Value::Integer(query.offset as i64));

        let mut stmt = conn.prepare(&format!(
            "SELECT {BOOK_COLUMNS} FROM books b {where_sql} ORDER BY {} LIMIT ? OFFSET ?",
            query.sort.order_by()
        ))?;
        let items = stmt
            .query_map(params_from_iter(page_values.iter()), book_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total,
            limit: query.limit,
            offset: query.offset,
        })
    }

    /// Apply a metadata update. Returns false when the book does not exist.
    pub fn update_book(&self, id: &str, update: &BookUpdate) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE books SET
                title = COALESCE(?1, title),
                author = COALESCE(?2, author),
                description = COALESCE(?3, description),
                category = COALESCE(?4, category),
                isbn = COALESCE(?5, isbn),
                language = COALESCE(?6, language),
                published_year = COALESCE(?7, published_year),
                updated_at = ?8
             WHERE id = ?9",
            params![
                update.title,
                update.author,
                update.description,
                update.category,
                update.isbn,
                update.language,
                update.published_year,
                now_timestamp(),
                id,
            ],
        )?;
        Ok(rows > 0)
    }

    /// Delete a book (cascades to shelf entries, comments and events).
    pub fn delete_book(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM books WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    // ========== SHELF OPERATIONS ==========

    /// Get a user's shelf entry for a book.
    pub fn get_user_book(&self, user_id: &str, book_id: &str) -> Result<Option<UserBook>> {
        let conn = self.conn.lock();
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {USER_BOOK_COLUMNS} FROM user_books ub
                     WHERE ub.user_id = ?1 AND ub.book_id = ?2"
                ),
                params![user_id, book_id],
                user_book_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Insert or replace a shelf entry.
    pub fn save_user_book(&self, entry: &UserBook) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_books
             (user_id, book_id, status, progress, rating, is_favorite, started_at, finished_at,
              updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (user_id, book_id) DO UPDATE SET
                status = excluded.status,
                progress = excluded.progress,
                rating = excluded.rating,
                is_favorite = excluded.is_favorite,
                started_at = COALESCE(user_books.started_at, excluded.started_at),
                finished_at = excluded.finished_at,
                updated_at = excluded.updated_at",
            params![
                entry.user_id,
                entry.book_id,
                entry.status,
                entry.progress,
                entry.rating,
                entry.is_favorite,
                entry.started_at,
                entry.finished_at,
                entry.updated_at,
            ],
        )?;
        Ok(())
    }

    /// List a user's shelf, most recently updated first.
    pub fn list_shelf(
        &self,
        user_id: &str,
        status: Option<ReadingStatus>,
        favorites_only: bool,
    ) -> Result<Vec<ShelfEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_BOOK_COLUMNS}, b.title, b.author, b.cover_image IS NOT NULL
             FROM user_books ub
             JOIN books b ON b.id = ub.book_id
             WHERE ub.user_id = ?1
               AND (?2 IS NULL OR ub.status = ?2)
               AND (?3 = 0 OR ub.is_favorite = 1)
             ORDER BY ub.updated_at DESC, b.title"
        ))?;

        let entries = stmt
            .query_map(params![user_id, status, favorites_only], |row| {
                Ok(ShelfEntry {
                    entry: user_book_from_row(row)?,
                    title: row.get(9)?,
                    author: row.get(10)?,
                    has_cover: row.get(11)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(entries)
    }

    /// Remove a book from a user's shelf.
    pub fn delete_user_book(&self, user_id: &str, book_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM user_books WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
        )?;
        Ok(rows > 0)
    }

    // ========== COMMENT OPERATIONS ==========

    /// Insert a comment.
    pub fn create_comment(&self, comment: &Comment) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO book_comments
             (id, book_id, user_id, content, rating, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                comment.id,
                comment.book_id,
                comment.user_id,
                comment.content,
                comment.rating,
                comment.status,
                comment.created_at,
                comment.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a comment regardless of status.
    pub fn get_comment(&self, id: &str) -> Result<Option<Comment>> {
        let conn = self.conn.lock();
        let comment = conn
            .query_row(
                &format!(
                    "SELECT {COMMENT_COLUMNS} FROM book_comments c
                     JOIN users u ON u.id = c.user_id
                     WHERE c.id = ?1"
                ),
                params![id],
                comment_from_row,
            )
            .optional()?;
        Ok(comment)
    }

    /// Active comments for a book, newest first, with the rating average.
    pub fn list_comments(&self, book_id: &str) -> Result<CommentThread> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {COMMENT_COLUMNS} FROM book_comments c
             JOIN users u ON u.id = c.user_id
             WHERE c.book_id = ?1 AND c.status = 'active'
             ORDER BY c.created_at DESC, c.id"
        ))?;
        let comments = stmt
            .query_map(params![book_id], comment_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let average_rating: Option<f64> = conn.query_row(
            "SELECT AVG(rating) FROM book_comments
             WHERE book_id = ?1 AND status = 'active' AND rating IS NOT NULL",
            params![book_id],
            |row| row.get(0),
        )?;

        Ok(CommentThread {
            total: comments.len(),
            comments,
            average_rating,
        })
    }

    /// Edit an active comment.
    pub fn update_comment(
        &self,
        id: &str,
        content: Option<&str>,
        rating: Option<i64>,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE book_comments SET
                content = COALESCE(?1, content),
                rating = COALESCE(?2, rating),
                updated_at = ?3
             WHERE id = ?4 AND status = 'active'",
            params![content, rating, now_timestamp(), id],
        )?;
        Ok(rows > 0)
    }

    /// Soft-delete a comment.
    pub fn soft_delete_comment(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE book_comments SET status = 'deleted', updated_at = ?1
             WHERE id = ?2 AND status = 'active'",
            params![now_timestamp(), id],
        )?;
        Ok(rows > 0)
    }

    // ========== AUDIT OPERATIONS ==========

    /// Append an audit entry, returning its ID.
    pub fn append_audit(&self, entry: &AuditEntry) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_logs
             (user_id, action, entity_type, entity_id, details, ip, user_agent, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.user_id,
                entry.action,
                entry.entity_type,
                entry.entity_id,
                entry.details,
                entry.ip,
                entry.user_agent,
                entry.created_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List audit entries, newest first.
    pub fn list_audit(&self, query: &AuditQuery) -> Result<Page<AuditEntry>> {
        let conn = self.conn.lock();

        let filter = "WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR action = ?2)
               AND (?3 IS NULL OR entity_type = ?3)
               AND (?4 IS NULL OR created_at >= ?4)";

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM audit_logs {filter}"),
            params![query.user_id, query.action, query.entity_type, query.since],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs {filter}
             ORDER BY created_at DESC, id DESC LIMIT ?5 OFFSET ?6"
        ))?;
        let items = stmt
            .query_map(
                params![
                    query.user_id,
                    query.action,
                    query.entity_type,
                    query.since,
                    query.limit,
                    query.offset,
                ],
                audit_from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            total,
            limit: query.limit,
            offset: query.offset,
        })
    }

    /// Delete audit entries created before `before`.
    pub fn prune_audit(&self, before: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM audit_logs WHERE created_at < ?1",
            params![before],
        )?;
        Ok(rows)
    }

    // ========== EVENT OPERATIONS ==========

    /// Record a view or download.
    ///
    /// Returns true when this is the first event of its kind for the
    /// (book, viewer, day) triple, in which case the book's counter was
    /// incremented.
    pub fn record_event(
        &self,
        kind: EventKind,
        book_id: &str,
        viewer_key: &str,
        user_id: Option<&str>,
        at: i64,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO {} (book_id, viewer_key, user_id, day, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                kind.table()
            ),
            params![book_id, viewer_key, user_id, day_of(at), at],
        )?;

        if inserted > 0 {
            tx.execute(
                &format!(
                    "UPDATE books SET {col} = {col} + 1 WHERE id = ?1",
                    col = kind.counter_column()
                ),
                params![book_id],
            )?;
        }

        tx.commit()?;
        Ok(inserted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::like_pattern;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("rust"), "%rust%");
        assert_eq!(like_pattern("100%"), "%100\\%%");
        assert_eq!(like_pattern("a_b"), "%a\\_b%");
    }
}
