use crate::analytics::{self, Bucket, Granularity, Scope, TimeRange};
use crate::auth::{AuthService, NewAccount};
use crate::config::{BookFormat, Config, StorageMode};
use crate::db::{
    AgeRange, AuditEntry, AuditQuery, BookQuery, BookSort, BookUpdate, Comment, CommentStatus,
    Database, EventKind, NewBook, ReadingStatus, Role, User, UserBook, UserBookUpdate,
    now_timestamp,
};
use crate::error::AppError;
use crate::server::{AppState, create_router};
use axum::Router;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use chrono::NaiveDate;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tower::ServiceExt;

fn test_db() -> Database {
    Database::open_memory().unwrap()
}

fn create_user(db: &Database, id: &str, username: &str, role: Role) {
    let user = User {
        id: id.to_string(),
        username: username.to_string(),
        email: None,
        password_hash: "hash".to_string(),
        display_name: None,
        role,
        age_range: None,
        created_at: now_timestamp(),
        last_login: None,
    };
    db.create_user(&user).unwrap();
}

fn new_book(id: &str, title: &str, uploader: Option<&str>) -> NewBook {
    NewBook {
        id: id.to_string(),
        title: title.to_string(),
        author: Some("Jane Doe".to_string()),
        description: None,
        category: None,
        isbn: None,
        language: None,
        published_year: None,
        uploader_id: uploader.map(str::to_string),
        file_name: format!("{}.md", id),
        format: BookFormat::Md,
        file_size: 7,
        content_path: None,
        content: Some(b"# Hello".to_vec()),
        cover_image: None,
    }
}

fn create_book(db: &Database, id: &str, title: &str, uploader: Option<&str>) {
    db.create_book(&new_book(id, title, uploader)).unwrap();
}

fn setup_user_and_book(db: &Database) {
    create_user(db, "user-1", "testuser", Role::User);
    create_book(db, "book-1", "Test Book", None);
}

fn ts(y: i32, m: u32, d: u32) -> i64 {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp()
}

// ============================================================================
// DATABASE
// ============================================================================

#[test]
fn db_create_and_get_user() {
    let db = test_db();
    let user = User {
        id: "user-1".to_string(),
        username: "alice".to_string(),
        email: Some("alice@example.org".to_string()),
        password_hash: "hash".to_string(),
        display_name: Some("Alice".to_string()),
        role: Role::Author,
        age_range: Some(AgeRange::From25To34),
        created_at: now_timestamp(),
        last_login: None,
    };

    db.create_user(&user).unwrap();

    let found = db.get_user_by_username("alice").unwrap().unwrap();
    assert_eq!(found.id, "user-1");
    assert_eq!(found.role, Role::Author);
    assert_eq!(found.age_range, Some(AgeRange::From25To34));

    let by_email = db.get_user_by_login("ALICE@example.org").unwrap().unwrap();
    assert_eq!(by_email.username, "alice");
}

#[test]
fn db_duplicate_username_is_conflict() {
    let db = test_db();
    create_user(&db, "user-1", "alice", Role::User);

    let user2 = User {
        id: "user-2".to_string(),
        username: "alice".to_string(),
        email: None,
        password_hash: "hash2".to_string(),
        display_name: None,
        role: Role::User,
        age_range: None,
        created_at: now_timestamp(),
        last_login: None,
    };

    assert!(matches!(
        db.create_user(&user2),
        Err(AppError::Conflict(_))
    ));
}

#[test]
fn db_delete_user_keeps_books() {
    let db = test_db();
    create_user(&db, "author-1", "writer", Role::Author);
    create_book(&db, "book-1", "Mine", Some("author-1"));
    db.save_user_book(&UserBook::new("author-1", "book-1", now_timestamp()))
        .unwrap();

    assert!(db.delete_user("author-1").unwrap());
    assert!(db.get_user_by_id("author-1").unwrap().is_none());

    let book = db.get_book("book-1").unwrap().unwrap();
    assert_eq!(book.uploader_id, None);
    assert!(db.get_user_book("author-1", "book-1").unwrap().is_none());
}

#[test]
fn db_save_and_get_book() {
    let db = test_db();
    let mut book = new_book("book-1", "Dune", None);
    book.cover_image = Some("data:image/jpeg;base64,AAAA".to_string());
    db.create_book(&book).unwrap();

    let found = db.get_book("book-1").unwrap().unwrap();
    assert_eq!(found.title, "Dune");
    assert_eq!(found.format, BookFormat::Md);
    assert!(found.has_cover);
    assert_eq!(found.view_count, 0);

    assert_eq!(
        db.get_book_content("book-1").unwrap().as_deref(),
        Some(&b"# Hello"[..])
    );
    assert!(db.get_book("missing").unwrap().is_none());
}

#[test]
fn db_list_books_filters_and_paginates() {
    let db = test_db();
    create_user(&db, "author-1", "writer", Role::Author);
    create_book(&db, "b1", "Rust in Action", Some("author-1"));
    create_book(&db, "b2", "Programming Rust", None);
    create_book(&db, "b3", "Gardening", None);

    let page = db
        .list_books(&BookQuery {
            search: Some("rust".to_string()),
            sort: BookSort::Title,
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(page.items[0].title, "Programming Rust");

    let page = db
        .list_books(&BookQuery {
            uploader_id: Some("author-1".to_string()),
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.total, 1);

    let page = db
        .list_books(&BookQuery {
            sort: BookSort::Title,
            limit: 1,
            offset: 1,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].title, "Programming Rust");
}

#[test]
fn db_search_treats_wildcards_literally() {
    let db = test_db();
    create_book(&db, "b1", "100% Rust", None);
    create_book(&db, "b2", "1000 Recipes", None);

    let page = db
        .list_books(&BookQuery {
            search: Some("100%".to_string()),
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, "b1");
}

#[test]
fn db_update_book_is_partial() {
    let db = test_db();
    create_book(&db, "book-1", "Draft", None);

    let update = BookUpdate {
        title: Some("Final".to_string()),
        published_year: Some(2020),
        ..Default::default()
    };
    assert!(db.update_book("book-1", &update).unwrap());

    let book = db.get_book("book-1").unwrap().unwrap();
    assert_eq!(book.title, "Final");
    assert_eq!(book.author.as_deref(), Some("Jane Doe"));
    assert_eq!(book.published_year, Some(2020));

    assert!(!db.update_book("missing", &update).unwrap());
}

#[test]
fn db_delete_book_cascades() {
    let db = test_db();
    setup_user_and_book(&db);

    let now = now_timestamp();
    db.create_comment(&Comment {
        id: "c1".to_string(),
        book_id: "book-1".to_string(),
        user_id: "user-1".to_string(),
        username: "testuser".to_string(),
        content: "Nice".to_string(),
        rating: Some(4),
        status: CommentStatus::Active,
        created_at: now,
        updated_at: now,
    })
    .unwrap();
    db.record_event(EventKind::View, "book-1", "usr:user-1", Some("user-1"), now)
        .unwrap();

    assert!(db.delete_book("book-1").unwrap());
    assert!(db.get_comment("c1").unwrap().is_none());
    assert_eq!(db.overview("1970-01-01").unwrap().books, 0);
}

#[test]
fn db_shelf_upsert_keeps_started_at() {
    let db = test_db();
    setup_user_and_book(&db);

    let mut entry = UserBook::new("user-1", "book-1", 100);
    entry.apply(
        &UserBookUpdate {
            progress: Some(10.0),
            ..Default::default()
        },
        100,
    );
    db.save_user_book(&entry).unwrap();

    entry.apply(
        &UserBookUpdate {
            status: Some(ReadingStatus::Finished),
            rating: Some(5),
            ..Default::default()
        },
        200,
    );
    db.save_user_book(&entry).unwrap();

    let found = db.get_user_book("user-1", "book-1").unwrap().unwrap();
    assert_eq!(found.status, ReadingStatus::Finished);
    assert_eq!(found.progress, 100.0);
    assert_eq!(found.rating, Some(5));
    assert_eq!(found.started_at, Some(100));
    assert_eq!(found.finished_at, Some(200));
}

#[test]
fn db_list_shelf_filters() {
    let db = test_db();
    setup_user_and_book(&db);
    create_book(&db, "book-2", "Second", None);

    let mut reading = UserBook::new("user-1", "book-1", 1);
    reading.apply(
        &UserBookUpdate {
            progress: Some(50.0),
            is_favorite: Some(true),
            ..Default::default()
        },
        1,
    );
    db.save_user_book(&reading).unwrap();
    db.save_user_book(&UserBook::new("user-1", "book-2", 2))
        .unwrap();

    assert_eq!(db.list_shelf("user-1", None, false).unwrap().len(), 2);

    let favorites = db.list_shelf("user-1", None, true).unwrap();
    assert_eq!(favorites.len(), 1);
    assert_eq!(favorites[0].title, "Test Book");

    let saved = db
        .list_shelf("user-1", Some(ReadingStatus::WantToRead), false)
        .unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].entry.book_id, "book-2");

    assert!(db.delete_user_book("user-1", "book-2").unwrap());
    assert!(!db.delete_user_book("user-1", "book-2").unwrap());
}

#[test]
fn db_comments_average_and_soft_delete() {
    let db = test_db();
    setup_user_and_book(&db);
    create_user(&db, "user-2", "other", Role::User);

    let comments = [
        ("c1", "user-1", Some(5)),
        ("c2", "user-2", Some(2)),
        ("c3", "user-2", None),
    ];
    for (id, user, rating) in comments {
        db.create_comment(&Comment {
            id: id.to_string(),
            book_id: "book-1".to_string(),
            user_id: user.to_string(),
            username: String::new(),
            content: format!("comment {}", id),
            rating,
            status: CommentStatus::Active,
            created_at: now_timestamp(),
            updated_at: now_timestamp(),
        })
        .unwrap();
    }

    let thread = db.list_comments("book-1").unwrap();
    assert_eq!(thread.total, 3);
    assert_eq!(thread.average_rating, Some(3.5));
    assert!(thread.comments.iter().any(|c| c.username == "other"));

    assert!(db.soft_delete_comment("c1").unwrap());
    assert!(!db.soft_delete_comment("c1").unwrap());

    let thread = db.list_comments("book-1").unwrap();
    assert_eq!(thread.total, 2);
    assert_eq!(thread.average_rating, Some(2.0));

    // Still stored, just hidden
    let deleted = db.get_comment("c1").unwrap().unwrap();
    assert_eq!(deleted.status, CommentStatus::Deleted);
    assert!(!db.update_comment("c1", Some("edit"), None).unwrap());
}

#[test]
fn db_audit_filter_and_prune() {
    let db = test_db();

    for (action, at) in [("user.login", 100), ("book.create", 200), ("user.login", 300)] {
        db.append_audit(&AuditEntry {
            id: 0,
            user_id: Some("user-1".to_string()),
            action: action.to_string(),
            entity_type: None,
            entity_id: None,
            details: None,
            ip: Some("127.0.0.1".to_string()),
            user_agent: None,
            created_at: at,
        })
        .unwrap();
    }

    let logins = db
        .list_audit(&AuditQuery {
            action: Some("user.login".to_string()),
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(logins.total, 2);
    assert_eq!(logins.items[0].created_at, 300);

    assert_eq!(db.prune_audit(250).unwrap(), 2);
    let rest = db
        .list_audit(&AuditQuery {
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(rest.total, 1);
}

#[test]
fn db_events_dedup_per_viewer_per_day() {
    let db = test_db();
    setup_user_and_book(&db);

    let day1 = ts(2024, 3, 10);
    let day2 = ts(2024, 3, 11);

    let record = |kind, viewer, user, at| {
        db.record_event(kind, "book-1", viewer, user, at)
            .unwrap()
    };

    assert!(record(EventKind::View, "usr:user-1", Some("user-1"), day1));
    assert!(!record(EventKind::View, "usr:user-1", Some("user-1"), day1 + 60));
    assert!(record(EventKind::View, "anon:abc", None, day1));
    assert!(record(EventKind::View, "usr:user-1", Some("user-1"), day2));
    assert!(record(EventKind::Download, "usr:user-1", Some("user-1"), day1));

    let book = db.get_book("book-1").unwrap().unwrap();
    assert_eq!(book.view_count, 3);
    assert_eq!(book.download_count, 1);

    let overview = db.overview("2024-03-10").unwrap();
    assert_eq!(overview.views, 3);
    assert_eq!(overview.views_today, 2);
    assert_eq!(overview.downloads_today, 1);
}

#[test]
fn db_top_books_by_metric() {
    let db = test_db();
    create_user(&db, "author-1", "writer", Role::Author);
    create_book(&db, "b1", "Popular", Some("author-1"));
    create_book(&db, "b2", "Quiet", None);

    let at = ts(2024, 1, 1);
    for viewer in ["anon:1", "anon:2", "anon:3"] {
        db.record_event(EventKind::View, "b1", viewer, None, at).unwrap();
    }
    db.record_event(EventKind::View, "b2", "anon:1", None, at).unwrap();

    let top = db.top_books(EventKind::View, 10, None).unwrap();
    assert_eq!(top[0].book_id, "b1");
    assert_eq!(top[0].count, 3);

    let own = db.top_books(EventKind::View, 10, Some("author-1")).unwrap();
    assert_eq!(own.len(), 1);
}

// ============================================================================
// ANALYTICS
// ============================================================================

#[test]
fn analytics_series_is_dense() {
    let db = test_db();
    setup_user_and_book(&db);

    db.record_event(EventKind::View, "book-1", "anon:1", None, ts(2024, 3, 2)).unwrap();
    db.record_event(EventKind::View, "book-1", "anon:2", None, ts(2024, 3, 2)).unwrap();
    db.record_event(EventKind::View, "book-1", "anon:1", None, ts(2024, 3, 5)).unwrap();
    // Outside the range
    db.record_event(EventKind::View, "book-1", "anon:1", None, ts(2024, 3, 9)).unwrap();

    let range = TimeRange::resolve(
        Granularity::Day,
        NaiveDate::from_ymd_opt(2024, 3, 1),
        NaiveDate::from_ymd_opt(2024, 3, 7),
        NaiveDate::from_ymd_opt(2024, 3, 20).unwrap(),
        30,
    )
    .unwrap();

    let series = analytics::event_series(&db, EventKind::View, &range, &Scope::default()).unwrap();
    assert_eq!(series.points.len(), 7);
    assert_eq!(series.points[0].bucket, "2024-03-01");
    assert_eq!(series.points[0].count, 0);
    assert_eq!(series.points[1].count, 2);
    assert_eq!(series.points[4].count, 1);
    assert_eq!(series.total, 3);
}

#[test]
fn analytics_monthly_series_scoped_to_uploader() {
    let db = test_db();
    create_user(&db, "author-1", "writer", Role::Author);
    create_book(&db, "mine", "Mine", Some("author-1"));
    create_book(&db, "theirs", "Theirs", None);

    db.record_event(EventKind::Download, "mine", "anon:1", None, ts(2024, 1, 15)).unwrap();
    db.record_event(EventKind::Download, "mine", "anon:1", None, ts(2024, 3, 15)).unwrap();
    db.record_event(EventKind::Download, "theirs", "anon:1", None, ts(2024, 3, 15)).unwrap();

    let range = TimeRange::resolve(
        Granularity::Month,
        None,
        None,
        NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        30,
    )
    .unwrap();
    assert_eq!(range.bucket, Bucket::Month);

    let scope = Scope {
        book_id: None,
        uploader_id: Some("author-1".to_string()),
    };
    let series = analytics::event_series(&db, EventKind::Download, &range, &scope).unwrap();
    assert_eq!(series.points.len(), 12);
    assert_eq!(series.points[11].bucket, "2024-03");
    assert_eq!(series.points[11].count, 1);
    assert_eq!(series.points[9].bucket, "2024-01");
    assert_eq!(series.points[9].count, 1);
    assert_eq!(series.total, 2);
}

#[test]
fn analytics_age_distribution_of_readers() {
    let db = test_db();
    create_book(&db, "book-1", "Book", None);

    for (id, age) in [
        ("u1", Some(AgeRange::From18To24)),
        ("u2", Some(AgeRange::From18To24)),
        ("u3", None),
        ("u4", Some(AgeRange::Over55)),
    ] {
        db.create_user(&User {
            id: id.to_string(),
            username: id.to_string(),
            email: None,
            password_hash: "hash".to_string(),
            display_name: None,
            role: Role::User,
            age_range: age,
            created_at: 0,
            last_login: None,
        })
        .unwrap();
    }

    let at = ts(2024, 5, 1);
    for id in ["u1", "u2", "u3"] {
        db.record_event(EventKind::View, "book-1", &format!("usr:{}", id), Some(id), at)
            .unwrap();
    }
    db.record_event(EventKind::Download, "book-1", "usr:u1", Some("u1"), at)
        .unwrap();

    let all = analytics::age_distribution(&db, None).unwrap();
    assert_eq!(all.len(), AgeRange::ALL.len() + 1);
    assert_eq!(all.iter().map(|b| b.count).sum::<i64>(), 4);

    let readers = analytics::age_distribution(&db, Some("book-1")).unwrap();
    let count = |label: &str| {
        readers
            .iter()
            .find(|b| b.age_range == label)
            .map(|b| b.count)
            .unwrap()
    };
    assert_eq!(count("18_24"), 2);
    assert_eq!(count("unknown"), 1);
    assert_eq!(count("55_plus"), 0);
    assert_eq!(count("under_18"), 0);
}

// ============================================================================
// AUTH
// ============================================================================

fn account(username: &str, password: &str, role: Option<Role>) -> NewAccount {
    NewAccount {
        username: username.to_string(),
        password: password.to_string(),
        role,
        ..Default::default()
    }
}

#[test]
fn auth_create_user_and_login() {
    let db = test_db();
    let auth = AuthService::new(db, "secret", 24, true);

    let mut new = account("testuser", "password123", None);
    new.email = Some(" Test@Example.org ".to_string());
    let user = auth.create_user(new).unwrap();
    assert_eq!(user.role, Role::User);
    assert_eq!(user.email.as_deref(), Some("test@example.org"));

    let (logged_in, token) = auth.login("testuser", "password123").unwrap();
    assert_eq!(logged_in.id, user.id);
    assert_eq!(auth.authenticate(&token).unwrap().username, "testuser");

    let (by_email, _) = auth.login("test@example.org", "password123").unwrap();
    assert_eq!(by_email.id, user.id);
}

#[test]
fn auth_invalid_credentials() {
    let db = test_db();
    let auth = AuthService::new(db, "secret", 24, true);
    auth.create_user(account("user", "correct-horse", None))
        .unwrap();

    assert!(matches!(
        auth.login("user", "wrong-horse"),
        Err(AppError::Unauthorized(_))
    ));
    assert!(matches!(
        auth.login("nobody", "correct-horse"),
        Err(AppError::Unauthorized(_))
    ));
    assert!(matches!(
        auth.authenticate("not.a.jwt"),
        Err(AppError::Unauthorized(_))
    ));
}

#[test]
fn auth_registration_rules() {
    let db = test_db();
    let auth = AuthService::new(db.clone(), "secret", 24, true);

    assert!(matches!(
        auth.register(account("boss", "password123", Some(Role::Admin))),
        Err(AppError::Forbidden(_))
    ));
    let author = auth
        .register(account("writer", "password123", Some(Role::Author)))
        .unwrap();
    assert_eq!(author.role, Role::Author);

    let closed = AuthService::new(db, "secret", 24, false);
    assert!(closed
        .register(account("late", "password123", None))
        .is_err());
}

#[test]
fn auth_change_password() {
    let db = test_db();
    let auth = AuthService::new(db, "secret", 24, true);

    let user = auth.create_user(account("user", "oldpass123", None)).unwrap();
    assert!(matches!(
        auth.change_password(&user, "not-it", "newpass123"),
        Err(AppError::Unauthorized(_))
    ));
    auth.change_password(&user, "oldpass123", "newpass123")
        .unwrap();

    assert!(auth.login("user", "oldpass123").is_err());
    assert!(auth.login("user", "newpass123").is_ok());

    assert!(auth.reset_password("user", "resetpass123").unwrap());
    assert!(!auth.reset_password("ghost", "resetpass123").unwrap());
    assert!(auth.login("user", "resetpass123").is_ok());
}

#[test]
fn auth_rejects_bad_input() {
    let db = test_db();
    let auth = AuthService::new(db, "secret", 24, true);

    assert!(auth.create_user(account("user", "abc", None)).is_err());
    assert!(auth.create_user(account("user@email", "password", None)).is_err());
    assert!(auth.create_user(account("user name", "password", None)).is_err());
    assert!(auth.create_user(account("", "password", None)).is_err());

    let mut bad_email = account("user", "password", None);
    bad_email.email = Some("not-an-email".to_string());
    assert!(matches!(
        auth.create_user(bad_email),
        Err(AppError::Validation(_))
    ));
}

#[test]
fn auth_token_of_deleted_user_is_rejected() {
    let db = test_db();
    let auth = AuthService::new(db, "secret", 24, true);

    let user = auth.create_user(account("gone", "password123", None)).unwrap();
    let token = auth.issue_token(&user).unwrap();
    assert!(auth.delete_user(&user.id).unwrap());

    assert!(matches!(
        auth.authenticate(&token),
        Err(AppError::Unauthorized(_))
    ));
}

#[test]
fn auth_update_profile() {
    let db = test_db();
    let auth = AuthService::new(db, "secret", 24, true);
    let user = auth.create_user(account("reader", "password123", None)).unwrap();

    let updated = auth
        .update_profile(
            &user.id,
            crate::db::ProfileUpdate {
                display_name: Some("  <b>Reader</b> ".to_string()),
                email: None,
                age_range: Some(AgeRange::From35To44),
            },
        )
        .unwrap();
    assert_eq!(updated.display_name.as_deref(), Some("Reader"));
    assert_eq!(updated.age_range, Some(AgeRange::From35To44));
}

// ============================================================================
// CONFIG
// ============================================================================

#[test]
fn config_parse_toml() {
    let toml = r#"
[server]
bind = "127.0.0.1:9090"
environment = "production"

[database]
path = "/tmp/test.db"

[auth]
registration = "disabled"
token_hours = 2

[security]
cors_origins = ["https://books.example.org"]
rate_limit_per_second = 0
trust_proxy = true

[storage]
mode = "database"
"#;
    let config: Config = toml::from_str(toml).unwrap();
    assert_eq!(config.server.bind.port(), 9090);
    assert_eq!(
        config.server.environment,
        crate::config::Environment::Production
    );
    assert!(!config.auth.registration_enabled());
    assert_eq!(config.auth.token_hours, 2);
    assert!(!config.security.cors_any());
    assert_eq!(config.security.rate_limit_per_second, 0);
    assert!(config.security.trust_proxy);
    assert_eq!(config.storage.mode, StorageMode::Database);
    assert_eq!(config.analytics.default_days, 30);
}

#[test]
fn config_default_values() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 8080);
    assert!(config.auth.registration_enabled());
    assert!(config.security.cors_any());
    assert!(!config.security.trust_proxy);
    assert_eq!(config.storage.mode, StorageMode::Disk);
}

#[test]
fn config_generated_default_parses() {
    let text = Config::generate_default("s3cr3t");
    let config: Config = toml::from_str(&text).unwrap();
    assert_eq!(config.auth.jwt_secret, "s3cr3t");
    assert_eq!(config.storage.cover_max_size, 600);
}

#[test]
fn book_format_from_extension() {
    assert_eq!(BookFormat::from_extension("md"), Some(BookFormat::Md));
    assert_eq!(BookFormat::from_extension("Markdown"), Some(BookFormat::Md));
    assert_eq!(BookFormat::from_extension("PDF"), Some(BookFormat::Pdf));
    assert_eq!(BookFormat::from_file_name("a.b.epub"), Some(BookFormat::Epub));
    assert_eq!(BookFormat::from_extension("cbz"), None);
    assert!(BookFormat::Txt.is_text());
    assert!(!BookFormat::Pdf.is_text());
}

// ============================================================================
// HTTP
// ============================================================================

fn test_config() -> Config {
    let mut config = Config::default();
    config.auth.jwt_secret = "test-secret".to_string();
    config.security.rate_limit_per_second = 0;
    config.storage.mode = StorageMode::Database;
    config
}

fn test_state() -> AppState {
    AppState::new(test_config(), test_db())
}

fn test_app(state: &AppState) -> Router {
    create_router(state.clone()).unwrap()
}

/// Create an account and return (user id, token).
fn login_as(state: &AppState, username: &str, role: Role) -> (String, String) {
    let user = state
        .auth
        .create_user(account(username, "password123", Some(role)))
        .unwrap();
    let token = state.auth.issue_token(&user).unwrap();
    (user.id, token)
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::USER_AGENT, "test-agent");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

/// Multipart upload; fields are (name, file name, bytes).
fn upload_request(token: &str, fields: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
    let boundary = "bookshelf-test-boundary";
    let mut body = Vec::new();
    for (name, file_name, data) in fields {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        let disposition = match file_name {
            Some(f) => format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                name, f
            ),
            None => format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name),
        };
        body.extend_from_slice(disposition.as_bytes());
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/books")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", boundary),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn upload_book(app: &Router, token: &str, title: &str) -> Value {
    let (status, body) = send(
        app,
        upload_request(
            token,
            &[
                ("title", None, title.as_bytes()),
                ("author", None, b"Jane Doe"),
                ("file", Some("story.md"), b"# Chapter 1\n\nOnce upon a time."),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);
    body
}

#[tokio::test]
async fn http_health() {
    let state = test_state();
    let app = test_app(&state);

    let resp = app
        .clone()
        .oneshot(request("GET", "/health", None, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
        "nosniff"
    );
    assert_eq!(resp.headers().get(header::X_FRAME_OPTIONS).unwrap(), "DENY");
}

#[tokio::test]
async fn http_register_login_and_conflict() {
    let state = test_state();
    let app = test_app(&state);

    let payload = json!({ "username": "reader", "password": "password123", "age_range": "25_34" });
    let (status, body) = send(
        &app,
        request("POST", "/api/auth/register", None, Some(payload.clone())),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["user"]["role"], "user");
    assert!(body["user"].get("password_hash").is_none());
    let token = body["token"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        request("POST", "/api/auth/register", None, Some(payload)),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "conflict");

    let (status, body) = send(&app, request("GET", "/api/auth/me", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "reader");
    assert_eq!(body["age_range"], "25_34");

    let (status, _) = send(
        &app,
        request(
            "POST",
            "/api/auth/login",
            None,
            Some(json!({ "username": "reader", "password": "wrong-one" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/auth/login",
            None,
            Some(json!({ "login": "reader", "password": "password123" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "Bearer");

    let page = state
        .db
        .list_audit(&AuditQuery {
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    let actions: Vec<_> = page.items.iter().map(|e| e.action.as_str()).collect();
    assert!(actions.contains(&"user.register"));
    assert!(actions.contains(&"user.login"));
}

#[tokio::test]
async fn http_invalid_token_and_bad_json() {
    let state = test_state();
    let app = test_app(&state);

    let (status, body) = send(&app, request("GET", "/api/auth/me", Some("garbage"), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = send(&app, request("GET", "/api/auth/me", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = Request::builder()
        .method("POST")
        .uri("/api/auth/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn http_upload_requires_author_role() {
    let state = test_state();
    let app = test_app(&state);
    let (_, reader) = login_as(&state, "reader", Role::User);
    let (author_id, author) = login_as(&state, "writer", Role::Author);

    let fields: &[(&str, Option<&str>, &[u8])] =
        &[("title", None, b"Story"), ("file", Some("story.md"), b"# Story")];

    let (status, _) = send(&app, upload_request(&reader, fields)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, upload_request(&author, fields)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["uploader_id"], author_id.as_str());
    assert_eq!(body["format"], "md");
    assert_eq!(body["file_size"], 7);

    let (status, body) = send(
        &app,
        upload_request(&author, &[("file", Some("story.md"), b"# Story")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]["message"].as_str().unwrap().contains("title"));

    let (status, _) = send(
        &app,
        upload_request(&author, &[("title", None, b"Bin"), ("file", Some("tool.exe"), b"MZ")]),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn http_views_and_downloads_are_deduplicated() {
    let state = test_state();
    let app = test_app(&state);
    let (_, author) = login_as(&state, "writer", Role::Author);
    let (_, reader) = login_as(&state, "reader", Role::User);

    let book = upload_book(&app, &author, "Counted").await;
    let id = book["id"].as_str().unwrap().to_string();
    let uri = format!("/api/books/{}", id);

    let (status, body) = send(&app, request("GET", &uri, Some(&reader), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["view_count"], 1);

    let (_, body) = send(&app, request("GET", &uri, Some(&reader), None)).await;
    assert_eq!(body["view_count"], 1);

    // Anonymous visitor counts separately
    let (_, body) = send(&app, request("GET", &uri, None, None)).await;
    assert_eq!(body["view_count"], 2);

    let download = format!("/api/books/{}/download", id);
    for _ in 0..2 {
        let resp = app
            .clone()
            .oneshot(request("GET", &download, Some(&reader), None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let disposition = resp.headers().get(header::CONTENT_DISPOSITION).unwrap();
        assert!(disposition.to_str().unwrap().starts_with("attachment;"));
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"# Chapter 1\n\nOnce upon a time.");
    }

    let stored = state.db.get_book(&id).unwrap().unwrap();
    assert_eq!(stored.view_count, 2);
    assert_eq!(stored.download_count, 1);
}

#[tokio::test]
async fn http_content_update_and_delete() {
    let state = test_state();
    let app = test_app(&state);
    let (_, author) = login_as(&state, "writer", Role::Author);
    let (_, other) = login_as(&state, "other", Role::Author);
    let (_, admin) = login_as(&state, "boss", Role::Admin);

    let book = upload_book(&app, &author, "Editable").await;
    let id = book["id"].as_str().unwrap().to_string();

    let resp = app
        .clone()
        .oneshot(request("GET", &format!("/api/books/{}/content", id), None, None))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/markdown"));

    let uri = format!("/api/books/{}", id);
    let (status, _) = send(
        &app,
        request("PUT", &uri, Some(&other), Some(json!({ "title": "Hijacked" }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        request(
            "PUT",
            &uri,
            Some(&author),
            Some(json!({ "title": "  Revised <i>edition</i> ", "published_year": 2021 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Revised edition");
    assert_eq!(body["author"], "Jane Doe");
    assert_eq!(body["published_year"], 2021);

    let (status, _) = send(
        &app,
        request("PUT", &uri, Some(&author), Some(json!({ "title": "   " }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, request("DELETE", &uri, Some(&admin), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, request("GET", &uri, None, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn http_list_books() {
    let state = test_state();
    let app = test_app(&state);
    let (_, author) = login_as(&state, "writer", Role::Author);

    upload_book(&app, &author, "Alpha").await;
    upload_book(&app, &author, "Beta").await;
    upload_book(&app, &author, "Gamma").await;

    let (status, body) = send(
        &app,
        request("GET", "/api/books?sort=title&limit=2", None, None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["items"][0]["title"], "Alpha");

    let (_, body) = send(&app, request("GET", "/api/books?q=gam", None, None)).await;
    assert_eq!(body["total"], 1);

    let (status, _) = send(&app, request("GET", "/api/books?sort=bogus", None, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn http_shelf_progress_and_favorites() {
    let state = test_state();
    let app = test_app(&state);
    let (_, author) = login_as(&state, "writer", Role::Author);
    let (_, reader) = login_as(&state, "reader", Role::User);

    let book = upload_book(&app, &author, "Shelved").await;
    let id = book["id"].as_str().unwrap().to_string();
    let uri = format!("/api/user-books/{}", id);

    let (status, _) = send(&app, request("GET", &uri, Some(&reader), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        request("PUT", &uri, Some(&reader), Some(json!({ "progress": 40 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "reading");

    let (status, body) = send(
        &app,
        request("PUT", &uri, Some(&reader), Some(json!({ "progress": 100, "rating": 5 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "finished");
    assert!(body["finished_at"].is_i64());

    let (status, _) = send(
        &app,
        request("PUT", &uri, Some(&reader), Some(json!({ "rating": 9 }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(
        &app,
        request("POST", &format!("{}/favorite", uri), Some(&reader), None),
    )
    .await;
    assert_eq!(body["is_favorite"], true);

    let (_, body) = send(
        &app,
        request("GET", "/api/user-books?favorite=true", Some(&reader), None),
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["title"], "Shelved");

    let (_, body) = send(
        &app,
        request("POST", &format!("{}/favorite", uri), Some(&reader), None),
    )
    .await;
    assert_eq!(body["is_favorite"], false);

    let (status, _) = send(&app, request("DELETE", &uri, Some(&reader), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, request("DELETE", &uri, Some(&reader), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn http_comments_lifecycle() {
    let state = test_state();
    let app = test_app(&state);
    let (_, author) = login_as(&state, "writer", Role::Author);
    let (_, reader) = login_as(&state, "reader", Role::User);
    let (_, other) = login_as(&state, "other", Role::User);

    let book = upload_book(&app, &author, "Discussed").await;
    let id = book["id"].as_str().unwrap().to_string();
    let uri = format!("/api/comments/book/{}", id);

    let (status, _) = send(
        &app,
        request("POST", &uri, Some(&reader), Some(json!({ "content": "Great", "rating": 6 }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        request("POST", &uri, Some(&reader), Some(json!({ "content": "<p></p>" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, comment) = send(
        &app,
        request(
            "POST",
            &uri,
            Some(&reader),
            Some(json!({ "content": "Great <b>book</b>", "rating": 4 })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(comment["content"], "Great book");
    assert_eq!(comment["username"], "reader");
    let comment_id = comment["id"].as_str().unwrap().to_string();

    let (_, thread) = send(&app, request("GET", &uri, None, None)).await;
    assert_eq!(thread["total"], 1);
    assert_eq!(thread["average_rating"], 4.0);

    let comment_uri = format!("/api/comments/{}", comment_id);
    let (status, _) = send(
        &app,
        request("PUT", &comment_uri, Some(&other), Some(json!({ "content": "Mine now" }))),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, edited) = send(
        &app,
        request("PUT", &comment_uri, Some(&reader), Some(json!({ "rating": 5 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["rating"], 5);
    assert_eq!(edited["content"], "Great book");

    let (status, _) = send(&app, request("DELETE", &comment_uri, Some(&other), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, request("DELETE", &comment_uri, Some(&reader), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, thread) = send(&app, request("GET", &uri, None, None)).await;
    assert_eq!(thread["total"], 0);
    assert!(thread["average_rating"].is_null());

    let stored = state.db.get_comment(&comment_id).unwrap().unwrap();
    assert_eq!(stored.status, CommentStatus::Deleted);

    let (status, _) = send(&app, request("DELETE", &comment_uri, Some(&reader), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn http_analytics_access_rules() {
    let state = test_state();
    let app = test_app(&state);
    let (_, author) = login_as(&state, "writer", Role::Author);
    let (_, rival) = login_as(&state, "rival", Role::Author);
    let (_, reader) = login_as(&state, "reader", Role::User);
    let (_, admin) = login_as(&state, "boss", Role::Admin);

    let book = upload_book(&app, &author, "Charted").await;
    let id = book["id"].as_str().unwrap().to_string();
    send(&app, request("GET", &format!("/api/books/{}", id), Some(&reader), None)).await;

    let (status, _) = send(&app, request("GET", "/api/analytics/views", Some(&reader), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(
        &app,
        request("GET", "/api/analytics/overview", Some(&author), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let by_book = format!("/api/analytics/views?book_id={}", id);
    let (status, _) = send(&app, request("GET", &by_book, Some(&rival), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, series) = send(&app, request("GET", &by_book, Some(&author), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(series["bucket"], "day");
    assert_eq!(series["points"].as_array().unwrap().len(), 30);
    assert_eq!(series["total"], 1);

    // A rival's own-books series does not include this book
    let (_, series) = send(&app, request("GET", "/api/analytics/views", Some(&rival), None)).await;
    assert_eq!(series["total"], 0);

    let (status, series) = send(
        &app,
        request("GET", "/api/analytics/downloads?granularity=year", Some(&admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(series["bucket"], "year");
    assert_eq!(series["points"].as_array().unwrap().len(), 5);

    let (status, _) = send(
        &app,
        request("GET", "/api/analytics/views?granularity=custom", Some(&admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, series) = send(
        &app,
        request(
            "GET",
            "/api/analytics/views?granularity=custom&start=2024-01-01&end=2024-06-30",
            Some(&admin),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(series["bucket"], "month");
    assert_eq!(series["points"].as_array().unwrap().len(), 6);

    let (status, _) = send(
        &app,
        request("GET", "/api/analytics/age-distribution", Some(&author), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, ages) = send(
        &app,
        request(
            "GET",
            &format!("/api/analytics/age-distribution?book_id={}", id),
            Some(&author),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ages["buckets"].as_array().unwrap().len(), 7);
    assert_eq!(ages["total"], 1);

    let (status, top) = send(
        &app,
        request("GET", "/api/analytics/top-books?metric=view", Some(&author), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(top[0]["count"], 1);

    let (status, overview) = send(
        &app,
        request("GET", "/api/analytics/overview", Some(&admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(overview["books"], 1);
    assert_eq!(overview["views_today"], 1);
}

#[tokio::test]
async fn http_admin_user_management_and_audit() {
    let state = test_state();
    let app = test_app(&state);
    let (admin_id, admin) = login_as(&state, "boss", Role::Admin);
    let (reader_id, reader) = login_as(&state, "reader", Role::User);

    let (status, _) = send(&app, request("GET", "/api/auth/users", Some(&reader), None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, users) = send(&app, request("GET", "/api/auth/users", Some(&admin), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(users.as_array().unwrap().len(), 2);

    let role_uri = format!("/api/auth/users/{}/role", reader_id);
    let (status, user) = send(
        &app,
        request("PUT", &role_uri, Some(&admin), Some(json!({ "role": "author" }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["role"], "author");

    let (status, _) = send(
        &app,
        request("PUT", &role_uri, Some(&admin), Some(json!({ "role": "emperor" }))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let self_uri = format!("/api/auth/users/{}", admin_id);
    let (status, _) = send(&app, request("DELETE", &self_uri, Some(&admin), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        request("DELETE", &format!("/api/auth/users/{}", reader_id), Some(&admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Token of a deleted account no longer works
    let (status, _) = send(&app, request("GET", "/api/auth/me", Some(&reader), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, request("GET", "/api/audit", Some(&reader), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, page) = send(
        &app,
        request("GET", "/api/audit?action=user.role", Some(&admin), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["entity_id"], reader_id.as_str());
    assert_eq!(page["items"][0]["user_agent"], "test-agent");
}

#[tokio::test]
async fn http_password_change() {
    let state = test_state();
    let app = test_app(&state);
    let (_, token) = login_as(&state, "reader", Role::User);

    let (status, _) = send(
        &app,
        request(
            "PUT",
            "/api/auth/password",
            Some(&token),
            Some(json!({ "current_password": "nope-nope", "new_password": "brandnew123" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        request(
            "PUT",
            "/api/auth/password",
            Some(&token),
            Some(json!({ "current_password": "password123", "new_password": "brandnew123" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(state.auth.login("reader", "brandnew123").is_ok());
}

#[tokio::test]
async fn production_errors_hide_internal_details() {
    use axum::response::IntoResponse;

    crate::error::set_expose_internal_errors(false);
    let resp = AppError::Internal("secret table layout".to_string()).into_response();
    crate::error::set_expose_internal_errors(true);

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["error"]["message"], "Internal server error");
    assert!(body["error"].get("detail").is_none());
    assert!(!String::from_utf8_lossy(&bytes).contains("secret"));

    // Client errors keep their message
    let resp = AppError::Validation("title missing".to_string()).into_response();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("title missing"));
}

fn png_cover(width: u32, height: u32) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
        width,
        height,
        image::Rgba([30, 90, 160, 255]),
    ));
    let mut data = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut data), image::ImageFormat::Png)
        .unwrap();
    data
}

async fn read_bytes(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, bytes.to_vec())
}

#[tokio::test]
async fn http_cover_upload_and_fetch() {
    let state = test_state();
    let app = test_app(&state);
    let (_, author) = login_as(&state, "writer", Role::Author);
    let cover = png_cover(1200, 800);

    let (status, book) = send(
        &app,
        upload_request(
            &author,
            &[
                ("title", None, b"Illustrated"),
                ("file", Some("story.md"), b"# Story"),
                ("cover", Some("cover.png"), &cover),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(book["has_cover"], true);

    let uri = format!("/api/books/{}/cover", book["id"].as_str().unwrap());
    let (status, headers, bytes) = read_bytes(&app, request("GET", &uri, None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "image/jpeg");
    assert!(headers.contains_key(header::CACHE_CONTROL));
    let img = image::load_from_memory(&bytes).unwrap();
    assert_eq!((img.width(), img.height()), (600, 400));

    let plain = upload_book(&app, &author, "Plain").await;
    assert_eq!(plain["has_cover"], false);
    let uri = format!("/api/books/{}/cover", plain["id"].as_str().unwrap());
    let (status, body) = send(&app, request("GET", &uri, None, None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, _) = send(
        &app,
        upload_request(
            &author,
            &[
                ("title", None, b"Broken"),
                ("file", Some("story.md"), b"# Story"),
                ("cover", Some("cover.png"), b"not an image"),
            ],
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn http_disk_storage_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let ebooks_dir = dir.path().join("ebooks");
    let mut config = test_config();
    config.storage.mode = StorageMode::Disk;
    config.storage.ebooks_dir = ebooks_dir.clone();
    let state = AppState::new(config, test_db());
    let app = test_app(&state);
    let (_, author) = login_as(&state, "writer", Role::Author);

    let book = upload_book(&app, &author, "On Disk").await;
    let id = book["id"].as_str().unwrap().to_string();
    let path = ebooks_dir.join(format!("{}.md", id));
    assert_eq!(
        std::fs::read(&path).unwrap(),
        b"# Chapter 1\n\nOnce upon a time."
    );

    let uri = format!("/api/books/{}/download", id);
    let (status, headers, bytes) = read_bytes(&app, request("GET", &uri, None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, b"# Chapter 1\n\nOnce upon a time.");
    assert_eq!(
        headers[header::CONTENT_LENGTH].to_str().unwrap(),
        bytes.len().to_string()
    );
    assert!(headers.contains_key(header::CONTENT_DISPOSITION));

    let uri = format!("/api/books/{}", id);
    let (status, _) = send(&app, request("DELETE", &uri, Some(&author), None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(!path.exists());
}

#[tokio::test]
async fn http_update_own_profile() {
    let state = test_state();
    let app = test_app(&state);
    let (_, token) = login_as(&state, "reader", Role::User);

    let (status, user) = send(
        &app,
        request(
            "PUT",
            "/api/auth/me",
            Some(&token),
            Some(json!({ "display_name": "Avid Reader", "age_range": "25_34" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(user["display_name"], "Avid Reader");
    assert_eq!(user["age_range"], "25_34");
    assert!(user.get("password_hash").is_none());

    let (status, me) = send(&app, request("GET", "/api/auth/me", Some(&token), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["display_name"], "Avid Reader");
    assert_eq!(me["age_range"], "25_34");

    let (status, _) = send(
        &app,
        request(
            "PUT",
            "/api/auth/me",
            Some(&token),
            Some(json!({ "age_range": "ancient" })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        request("PUT", "/api/auth/me", None, Some(json!({ "display_name": "x" }))),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn http_analytics_rejects_oversized_ranges() {
    let state = test_state();
    let app = test_app(&state);
    let (_, admin) = login_as(&state, "boss", Role::Admin);

    for query in [
        "granularity=day&start=2000-01-01&end=2024-01-01",
        "granularity=month&start=0001-01-01",
        "granularity=year&start=0001-01-01",
        "granularity=custom&start=0001-01-01&end=9999-12-31",
    ] {
        let uri = format!("/api/analytics/views?{}", query);
        let (status, body) = send(&app, request("GET", &uri, Some(&admin), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", query);
        assert_eq!(body["error"]["code"], "validation_error");
    }
}

fn limited_app(per_second: u64, burst: u32, trust_proxy: bool) -> Router {
    let mut config = test_config();
    config.security.rate_limit_per_second = per_second;
    config.security.rate_limit_burst = burst;
    config.security.trust_proxy = trust_proxy;
    test_app(&AppState::new(config, test_db()))
}

/// Health request arriving from `peer` with an optional forwarding header.
fn health_from(peer: [u8; 4], forwarded_for: Option<&str>) -> Request<Body> {
    let mut req = request("GET", "/health", None, None);
    req.extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((peer, 40000))));
    if let Some(ip) = forwarded_for {
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_str(ip).unwrap());
    }
    req
}

#[tokio::test]
async fn http_rate_limit_refills_at_configured_rate() {
    let app = limited_app(2, 1, false);

    let (status, _) = send(&app, health_from([192, 0, 2, 1], None)).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, health_from([192, 0, 2, 1], None)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // Other clients have their own bucket
    let (status, _) = send(&app, health_from([192, 0, 2, 2], None)).await;
    assert_eq!(status, StatusCode::OK);

    // Two per second: one token is back after half a second
    tokio::time::sleep(Duration::from_millis(700)).await;
    let (status, _) = send(&app, health_from([192, 0, 2, 1], None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn http_rate_limit_ignores_forwarded_for_from_untrusted_peers() {
    let app = limited_app(1, 1, false);

    let (status, _) = send(&app, health_from([192, 0, 2, 1], Some("198.51.100.1"))).await;
    assert_eq!(status, StatusCode::OK);
    for n in 2..10 {
        let spoofed = format!("198.51.100.{}", n);
        let (status, _) = send(&app, health_from([192, 0, 2, 1], Some(&spoofed))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }

    // Behind a trusted proxy every forwarded client gets its own bucket
    let app = limited_app(1, 1, true);
    for n in 1..5 {
        let forwarded = format!("198.51.100.{}", n);
        let (status, _) = send(&app, health_from([192, 0, 2, 1], Some(&forwarded))).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = send(&app, health_from([192, 0, 2, 1], Some("198.51.100.1"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn http_cors_allows_only_configured_origins() {
    let mut config = test_config();
    config.security.cors_origins = vec!["https://books.example.org".to_string()];
    let app = test_app(&AppState::new(config, test_db()));

    let with_origin = |origin: &'static str| {
        let mut req = request("GET", "/health", None, None);
        req.headers_mut()
            .insert(header::ORIGIN, HeaderValue::from_static(origin));
        req
    };

    let (status, headers, _) = read_bytes(&app, with_origin("https://books.example.org")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://books.example.org"
    );

    let (status, headers, _) = read_bytes(&app, with_origin("https://evil.example.net")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));

    let preflight = Request::builder()
        .method("OPTIONS")
        .uri("/api/books")
        .header(header::ORIGIN, "https://books.example.org")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = read_bytes(&app, preflight).await;
    assert_eq!(status, StatusCode::OK);
    let methods = headers[header::ACCESS_CONTROL_ALLOW_METHODS].to_str().unwrap();
    assert!(methods.contains("POST"));
    assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "600");
}
