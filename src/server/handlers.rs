//! HTTP request handlers.

use crate::analytics::{self, AgeBucket, Granularity, Scope, Series, TimeRange};
use crate::auth::NewAccount;
use crate::config::BookFormat;
use crate::db::{
    AuditEntry, AuditQuery, Book, BookMetricRow, BookQuery, BookSort, BookUpdate, Comment,
    CommentStatus, CommentThread, EventKind, NewBook, Overview, Page, ProfileUpdate,
    ReadingStatus, Role, ShelfEntry, User, UserBook, UserBookUpdate, day_of, now_timestamp,
};
use crate::error::{AppError, Result};
use crate::server::{AppJson, AppMultipart, AppPath, AppQuery, AppState, ClientInfo};
use crate::storage::{self, ContentSource};
use crate::validate::{self, Validator};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::io::ReaderStream;

/// Default page size for listings.
const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page size a client may request.
const MAX_PAGE_SIZE: u32 = 100;

/// Build a response, returning 500 on error (which shouldn't happen).
fn build_response(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Internal error"))
                .unwrap_or_default()
        })
}

fn page_size(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
}

// ============================================================================
// HEALTH
// ============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    database: &'static str,
}

/// Liveness probe.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let (status, database) = match state.db.ping() {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::error!(error = %e, "Database health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    };

    (
        status,
        Json(HealthResponse {
            status: if status == StatusCode::OK { "ok" } else { "degraded" },
            version: env!("CARGO_PKG_VERSION"),
            database,
        }),
    )
}

// ============================================================================
// AUTH HANDLERS
// ============================================================================

/// Login request.
#[derive(Deserialize)]
pub struct LoginRequest {
    /// Username or email.
    #[serde(alias = "username", alias = "email")]
    login: String,
    password: String,
}

/// Token response for login and registration.
#[derive(Serialize)]
pub struct AuthResponse {
    token: String,
    token_type: &'static str,
    expires_in: u64,
    user: User,
}

impl AuthResponse {
    fn new(state: &AppState, token: String, user: User) -> Self {
        Self {
            token,
            token_type: "Bearer",
            expires_in: state.config.auth.token_hours as u64 * 3600,
            user,
        }
    }
}

/// Create an account and sign in.
pub async fn auth_register(
    State(state): State<AppState>,
    client: ClientInfo,
    AppJson(req): AppJson<NewAccount>,
) -> Result<(StatusCode, Json<AuthResponse>)> {
    let user = state.auth.register(req)?;
    let token = state.auth.issue_token(&user)?;

    tracing::info!(username = %user.username, role = %user.role, "User registered");
    state.audit(
        &client,
        Some(&user.id),
        "user.register",
        Some(("user", &user.id)),
        Some(json!({ "username": user.username, "role": user.role })),
    );

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse::new(&state, token, user)),
    ))
}

/// Login endpoint.
pub async fn auth_login(
    State(state): State<AppState>,
    client: ClientInfo,
    AppJson(req): AppJson<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    let (user, token) = state.auth.login(&req.login, &req.password)?;

    state.audit(
        &client,
        Some(&user.id),
        "user.login",
        Some(("user", &user.id)),
        None,
    );

    Ok(Json(AuthResponse::new(&state, token, user)))
}

/// Get current user info.
pub async fn auth_me(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<User>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(user))
}

/// Update own profile.
pub async fn auth_update_me(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppJson(update): AppJson<ProfileUpdate>,
) -> Result<Json<User>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let updated = state.auth.update_profile(&user.id, update)?;
    Ok(Json(updated))
}

/// Password change request.
#[derive(Deserialize)]
pub struct PasswordChangeRequest {
    current_password: String,
    new_password: String,
}

/// Change own password.
pub async fn auth_change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppJson(req): AppJson<PasswordChangeRequest>,
) -> Result<StatusCode> {
    let user = get_authenticated_user(&state, &headers).await?;
    state
        .auth
        .change_password(&user, &req.current_password, &req.new_password)?;

    state.audit(
        &client,
        Some(&user.id),
        "user.password",
        Some(("user", &user.id)),
        None,
    );

    Ok(StatusCode::NO_CONTENT)
}

/// List all users (admin).
pub async fn auth_list_users(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<User>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    require_admin(&user)?;
    Ok(Json(state.auth.list_users()?))
}

/// Role change request.
#[derive(Deserialize)]
pub struct RoleRequest {
    role: Role,
}

/// Change a user's role (admin).
pub async fn auth_set_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppPath(user_id): AppPath<String>,
    AppJson(req): AppJson<RoleRequest>,
) -> Result<Json<User>> {
    let admin = get_authenticated_user(&state, &headers).await?;
    require_admin(&admin)?;

    if admin.id == user_id {
        return Err(AppError::Validation(
            "Administrators cannot change their own role".to_string(),
        ));
    }

    let target = state
        .db
        .get_user_by_id(&user_id)?
        .ok_or_else(|| AppError::NotFound(format!("User not found: {}", user_id)))?;

    state.auth.set_role(&target.id, req.role)?;

    tracing::info!(
        username = %target.username,
        from = %target.role,
        to = %req.role,
        "Role changed"
    );
    state.audit(
        &client,
        Some(&admin.id),
        "user.role",
        Some(("user", &target.id)),
        Some(json!({ "from": target.role, "to": req.role })),
    );

    Ok(Json(User {
        role: req.role,
        ..target
    }))
}

/// Delete a user (admin).
pub async fn auth_delete_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppPath(user_id): AppPath<String>,
) -> Result<StatusCode> {
    let admin = get_authenticated_user(&state, &headers).await?;
    require_admin(&admin)?;

    if admin.id == user_id {
        return Err(AppError::Validation(
            "Administrators cannot delete their own account".to_string(),
        ));
    }

    let target = state
        .db
        .get_user_by_id(&user_id)?
        .ok_or_else(|| AppError::NotFound(format!("User not found: {}", user_id)))?;

    state.auth.delete_user(&target.id)?;

    tracing::info!(username = %target.username, "User deleted");
    state.audit(
        &client,
        Some(&admin.id),
        "user.delete",
        Some(("user", &target.id)),
        Some(json!({ "username": target.username })),
    );

    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// BOOK HANDLERS
// ============================================================================

/// Book listing query.
#[derive(Deserialize)]
pub struct BookListQuery {
    #[serde(alias = "search")]
    q: Option<String>,
    author: Option<String>,
    category: Option<String>,
    uploader_id: Option<String>,
    #[serde(default)]
    sort: BookSort,
    limit: Option<u32>,
    offset: Option<u32>,
}

/// Search, filter and paginate the catalog.
pub async fn books_list(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<BookListQuery>,
) -> Result<Json<Page<Book>>> {
    let query = BookQuery {
        search: validate::sanitize_opt(query.q),
        author: validate::sanitize_opt(query.author),
        category: validate::sanitize_opt(query.category),
        uploader_id: query.uploader_id.filter(|s| !s.is_empty()),
        sort: query.sort,
        limit: page_size(query.limit),
        offset: query.offset.unwrap_or(0),
    };

    Ok(Json(state.db.list_books(&query)?))
}

/// Raw multipart fields of a book upload.
#[derive(Default)]
struct BookUpload {
    file_name: Option<String>,
    file: Option<Vec<u8>>,
    cover: Option<Vec<u8>>,
    metadata: BookUpdate,
}

async fn read_upload(multipart: &mut Multipart, max_bytes: usize) -> Result<BookUpload> {
    let mut upload = BookUpload::default();
    let mut total = 0usize;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "file" => {
                upload.file_name = field.file_name().map(str::to_string);
                let data = field.bytes().await?;
                total += data.len();
                upload.file = Some(data.to_vec());
            }
            "cover" => {
                let data = field.bytes().await?;
                total += data.len();
                if !data.is_empty() {
                    upload.cover = Some(data.to_vec());
                }
            }
            "title" => upload.metadata.title = Some(field.text().await?),
            "author" => upload.metadata.author = Some(field.text().await?),
            "description" => upload.metadata.description = Some(field.text().await?),
            "category" => upload.metadata.category = Some(field.text().await?),
            "isbn" => upload.metadata.isbn = Some(field.text().await?),
            "language" => upload.metadata.language = Some(field.text().await?),
            "published_year" => {
                let text = field.text().await?;
                let text = text.trim();
                if !text.is_empty() {
                    upload.metadata.published_year = Some(text.parse().map_err(|_| {
                        AppError::Validation("'published_year' must be a number".to_string())
                    })?);
                }
            }
            other => tracing::debug!(field = other, "Ignoring unknown upload field"),
        }

        if total > max_bytes {
            return Err(AppError::PayloadTooLarge(format!(
                "Upload exceeds the limit of {} bytes",
                max_bytes
            )));
        }
    }

    Ok(upload)
}

/// Sanitize and validate metadata fields that are present.
fn clean_metadata(update: BookUpdate) -> Result<BookUpdate> {
    let update = BookUpdate {
        title: update.title.map(|t| validate::sanitize_text(&t)),
        author: validate::sanitize_opt(update.author),
        description: validate::sanitize_opt(update.description),
        category: validate::sanitize_opt(update.category),
        isbn: validate::sanitize_opt(update.isbn),
        language: validate::sanitize_opt(update.language),
        published_year: update.published_year,
    };

    let mut v = Validator::new();
    if let Some(title) = &update.title {
        v.required("title", title, validate::MAX_TITLE_LEN);
    }
    v.max_len("author", update.author.as_deref(), validate::MAX_SHORT_LEN)
        .max_len(
            "description",
            update.description.as_deref(),
            validate::MAX_DESCRIPTION_LEN,
        )
        .max_len("category", update.category.as_deref(), validate::MAX_SHORT_LEN)
        .max_len("isbn", update.isbn.as_deref(), 32)
        .max_len("language", update.language.as_deref(), 16)
        .year("published_year", update.published_year)
        .finish()?;

    Ok(update)
}

/// Keep only the last path component of a client-supplied file name.
fn clean_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    validate::sanitize_text(base)
}

/// Upload a book (author or admin).
pub async fn books_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppMultipart(mut multipart): AppMultipart,
) -> Result<(StatusCode, Json<Book>)> {
    let user = get_authenticated_user(&state, &headers).await?;
    if !user.role.can_publish() {
        return Err(AppError::Forbidden(
            "Only authors and administrators can upload books".to_string(),
        ));
    }

    let upload = read_upload(&mut multipart, state.config.storage.max_upload_bytes).await?;

    let data = upload
        .file
        .ok_or_else(|| AppError::Validation("'file' is required".to_string()))?;
    if data.is_empty() {
        return Err(AppError::Validation("Uploaded file is empty".to_string()));
    }

    let file_name = upload
        .file_name
        .map(|n| clean_file_name(&n))
        .filter(|n| !n.is_empty())
        .ok_or_else(|| AppError::Validation("Uploaded file has no name".to_string()))?;
    let format = BookFormat::from_file_name(&file_name).ok_or_else(|| {
        AppError::Validation(
            "Unsupported file type, expected md, txt, html, pdf or epub".to_string(),
        )
    })?;

    if upload.metadata.title.is_none() {
        return Err(AppError::Validation("'title' is required".to_string()));
    }
    let metadata = clean_metadata(upload.metadata)?;

    let cover_image = upload
        .cover
        .map(|c| state.storage.process_cover(&c))
        .transpose()?;

    let id = uuid::Uuid::new_v4().to_string();
    let file_size = data.len() as i64;
    let stored = state.storage.save(&id, format, data).await?;

    let new_book = NewBook {
        id: id.clone(),
        title: metadata.title.unwrap_or_default(),
        author: metadata.author,
        description: metadata.description,
        category: metadata.category,
        isbn: metadata.isbn,
        language: metadata.language,
        published_year: metadata.published_year,
        uploader_id: Some(user.id.clone()),
        file_name,
        format,
        file_size,
        content_path: stored.content_path.clone(),
        content: stored.content,
        cover_image,
    };

    if let Err(e) = state.db.create_book(&new_book) {
        if let Some(path) = &stored.content_path
            && let Err(io) = tokio::fs::remove_file(path).await
        {
            tracing::warn!(path = %path, error = %io, "Failed to clean up content file");
        }
        return Err(e);
    }

    let book = state
        .db
        .get_book(&id)?
        .ok_or_else(|| AppError::Internal(format!("Book vanished after insert: {}", id)))?;

    tracing::info!(book_id = %book.id, title = %book.title, format = ?book.format, "Book uploaded");
    state.audit(
        &client,
        Some(&user.id),
        "book.create",
        Some(("book", &book.id)),
        Some(json!({ "title": book.title, "format": book.format, "size": book.file_size })),
    );

    Ok((StatusCode::CREATED, Json(book)))
}

/// Book metadata; counts a view.
pub async fn books_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppPath(id): AppPath<String>,
) -> Result<Json<Book>> {
    let user = get_optional_user(&state, &headers).await?;
    let mut book = find_book(&state, &id)?;

    if record_event(&state, EventKind::View, &book.id, user.as_ref(), &client) {
        book.view_count += 1;
    }

    Ok(Json(book))
}

/// Update book metadata (uploader or admin).
pub async fn books_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppPath(id): AppPath<String>,
    AppJson(update): AppJson<BookUpdate>,
) -> Result<Json<Book>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let book = find_book(&state, &id)?;
    require_book_owner(&user, &book)?;

    let update = clean_metadata(update)?;
    state.db.update_book(&book.id, &update)?;
    let book = find_book(&state, &id)?;

    state.audit(
        &client,
        Some(&user.id),
        "book.update",
        Some(("book", &book.id)),
        Some(json!({ "title": book.title })),
    );

    Ok(Json(book))
}

/// Delete a book and its content (uploader or admin).
pub async fn books_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppPath(id): AppPath<String>,
) -> Result<StatusCode> {
    let user = get_authenticated_user(&state, &headers).await?;
    let book = find_book(&state, &id)?;
    require_book_owner(&user, &book)?;

    state.db.delete_book(&book.id)?;
    if let Err(e) = state.storage.remove(&book).await {
        tracing::warn!(book_id = %book.id, error = %e, "Failed to remove content file");
    }

    tracing::info!(book_id = %book.id, title = %book.title, "Book deleted");
    state.audit(
        &client,
        Some(&user.id),
        "book.delete",
        Some(("book", &book.id)),
        Some(json!({ "title": book.title })),
    );

    Ok(StatusCode::NO_CONTENT)
}

/// Text content for in-browser reading; counts a view.
pub async fn books_content(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppPath(id): AppPath<String>,
) -> Result<Response<Body>> {
    let user = get_optional_user(&state, &headers).await?;
    let book = find_book(&state, &id)?;

    if !book.format.is_text() {
        return Err(AppError::Validation(format!(
            "{} books can only be downloaded",
            book.format.extension()
        )));
    }

    let bytes = state.storage.read(&state.db, &book).await?;
    let text = String::from_utf8_lossy(&bytes).into_owned();

    record_event(&state, EventKind::View, &book.id, user.as_ref(), &client);

    Ok(build_response(StatusCode::OK, book.format.mime_type(), text))
}

/// `Content-Disposition` value with an ASCII fallback and a UTF-8 name.
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(file_name)
    )
}

/// Book download; counts a download.
pub async fn books_download(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppPath(id): AppPath<String>,
) -> Result<Response<Body>> {
    let user = get_optional_user(&state, &headers).await?;
    let book = find_book(&state, &id)?;

    let (body, size) = match state.storage.open(&state.db, &book).await? {
        ContentSource::File { path, size } => {
            let file = tokio::fs::File::open(&path).await?;
            (Body::from_stream(ReaderStream::new(file)), size)
        }
        ContentSource::Bytes(bytes) => {
            let size = bytes.len() as u64;
            (Body::from(bytes), size)
        }
    };

    record_event(&state, EventKind::Download, &book.id, user.as_ref(), &client);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, book.format.mime_type())
        .header(
            header::CONTENT_DISPOSITION,
            content_disposition(&book.file_name),
        )
        .header(header::CONTENT_LENGTH, size)
        .body(body)
        .unwrap_or_else(|_| Response::default()))
}

/// Book cover image.
pub async fn books_cover(
    State(state): State<AppState>,
    AppPath(id): AppPath<String>,
) -> Result<Response<Body>> {
    let cover = state
        .db
        .get_book_cover(&id)?
        .ok_or_else(|| AppError::NotFound(format!("No cover for book: {}", id)))?;

    let (mime, bytes) = storage::decode_cover(&cover)?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime)
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| Response::default()))
}

// ============================================================================
// SHELF HANDLERS
// ============================================================================

/// Shelf listing query.
#[derive(Deserialize)]
pub struct ShelfQuery {
    status: Option<ReadingStatus>,
    #[serde(default)]
    favorite: bool,
}

/// Own shelf.
pub async fn user_books_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<ShelfQuery>,
) -> Result<Json<Vec<ShelfEntry>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    Ok(Json(state.db.list_shelf(
        &user.id,
        query.status,
        query.favorite,
    )?))
}

/// Own shelf entry for a book.
pub async fn user_books_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(book_id): AppPath<String>,
) -> Result<Json<UserBook>> {
    let user = get_authenticated_user(&state, &headers).await?;
    state
        .db
        .get_user_book(&user.id, &book_id)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Book not on shelf: {}", book_id)))
}

/// Create or update a shelf entry.
pub async fn user_books_upsert(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(book_id): AppPath<String>,
    AppJson(update): AppJson<UserBookUpdate>,
) -> Result<Json<UserBook>> {
    let user = get_authenticated_user(&state, &headers).await?;

    Validator::new()
        .percentage("progress", update.progress)
        .rating("rating", update.rating)
        .finish()?;

    let book = find_book(&state, &book_id)?;
    let now = now_timestamp();

    let mut entry = state
        .db
        .get_user_book(&user.id, &book.id)?
        .unwrap_or_else(|| UserBook::new(&user.id, &book.id, now));
    entry.apply(&update, now);
    state.db.save_user_book(&entry)?;

    Ok(Json(entry))
}

/// Remove a book from the shelf.
pub async fn user_books_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(book_id): AppPath<String>,
) -> Result<StatusCode> {
    let user = get_authenticated_user(&state, &headers).await?;

    if state.db.delete_user_book(&user.id, &book_id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Book not on shelf: {}", book_id)))
    }
}

/// Flip the favorite flag, adding the book to the shelf if needed.
pub async fn user_books_toggle_favorite(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(book_id): AppPath<String>,
) -> Result<Json<UserBook>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let book = find_book(&state, &book_id)?;
    let now = now_timestamp();

    let mut entry = state
        .db
        .get_user_book(&user.id, &book.id)?
        .unwrap_or_else(|| UserBook::new(&user.id, &book.id, now));
    let update = UserBookUpdate {
        is_favorite: Some(!entry.is_favorite),
        ..Default::default()
    };
    entry.apply(&update, now);
    state.db.save_user_book(&entry)?;

    Ok(Json(entry))
}

// ============================================================================
// COMMENT HANDLERS
// ============================================================================

/// New comment.
#[derive(Deserialize)]
pub struct CommentRequest {
    content: String,
    rating: Option<i64>,
}

/// Comment edit; `None` keeps a field.
#[derive(Deserialize)]
pub struct CommentUpdateRequest {
    content: Option<String>,
    rating: Option<i64>,
}

/// Active comments of a book with the average rating.
pub async fn comments_list(
    State(state): State<AppState>,
    AppPath(book_id): AppPath<String>,
) -> Result<Json<CommentThread>> {
    let book = find_book(&state, &book_id)?;
    Ok(Json(state.db.list_comments(&book.id)?))
}

/// Comment on a book.
pub async fn comments_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppPath(book_id): AppPath<String>,
    AppJson(req): AppJson<CommentRequest>,
) -> Result<(StatusCode, Json<Comment>)> {
    let user = get_authenticated_user(&state, &headers).await?;
    let book = find_book(&state, &book_id)?;

    let content = validate::sanitize_text(&req.content);
    Validator::new()
        .required("content", &content, validate::MAX_COMMENT_LEN)
        .rating("rating", req.rating)
        .finish()?;

    let now = now_timestamp();
    let comment = Comment {
        id: uuid::Uuid::new_v4().to_string(),
        book_id: book.id.clone(),
        user_id: user.id.clone(),
        username: user.username.clone(),
        content,
        rating: req.rating,
        status: CommentStatus::Active,
        created_at: now,
        updated_at: now,
    };
    state.db.create_comment(&comment)?;

    state.audit(
        &client,
        Some(&user.id),
        "comment.create",
        Some(("comment", &comment.id)),
        Some(json!({ "book_id": book.id, "rating": comment.rating })),
    );

    Ok((StatusCode::CREATED, Json(comment)))
}

/// Edit own comment.
pub async fn comments_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppPath(id): AppPath<String>,
    AppJson(req): AppJson<CommentUpdateRequest>,
) -> Result<Json<Comment>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let comment = find_active_comment(&state, &id)?;

    if comment.user_id != user.id {
        return Err(AppError::Forbidden(
            "Only the author of a comment can edit it".to_string(),
        ));
    }

    let content = req.content.map(|c| validate::sanitize_text(&c));
    let mut v = Validator::new();
    if let Some(content) = &content {
        v.required("content", content, validate::MAX_COMMENT_LEN);
    }
    v.rating("rating", req.rating).finish()?;

    state
        .db
        .update_comment(&comment.id, content.as_deref(), req.rating)?;

    Ok(Json(find_active_comment(&state, &id)?))
}

/// Soft-delete a comment (author or admin).
pub async fn comments_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    client: ClientInfo,
    AppPath(id): AppPath<String>,
) -> Result<StatusCode> {
    let user = get_authenticated_user(&state, &headers).await?;
    let comment = find_active_comment(&state, &id)?;

    if comment.user_id != user.id && !user.is_admin() {
        return Err(AppError::Forbidden(
            "Only the author of a comment or an administrator can delete it".to_string(),
        ));
    }

    state.db.soft_delete_comment(&comment.id)?;

    state.audit(
        &client,
        Some(&user.id),
        "comment.delete",
        Some(("comment", &comment.id)),
        Some(json!({ "book_id": comment.book_id })),
    );

    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// ANALYTICS HANDLERS
// ============================================================================

/// Chart query.
#[derive(Deserialize)]
pub struct SeriesQuery {
    #[serde(default)]
    granularity: Granularity,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
    book_id: Option<String>,
}

/// Admins see everything; authors only the books they uploaded.
fn analytics_scope(state: &AppState, user: &User, book_id: Option<String>) -> Result<Scope> {
    require_role(user, &[Role::Admin, Role::Author])?;

    if let Some(id) = &book_id {
        let book = find_book(state, id)?;
        require_book_owner(user, &book)?;
    }

    let uploader_id = if user.is_admin() {
        None
    } else {
        Some(user.id.clone())
    };

    Ok(Scope {
        book_id,
        uploader_id,
    })
}

async fn series_for(
    state: &AppState,
    headers: &HeaderMap,
    metric: EventKind,
    query: SeriesQuery,
) -> Result<Json<Series>> {
    let user = get_authenticated_user(state, headers).await?;
    let scope = analytics_scope(state, &user, query.book_id)?;

    let range = TimeRange::resolve(
        query.granularity,
        query.start,
        query.end,
        chrono::Utc::now().date_naive(),
        state.config.analytics.default_days,
    )?;

    Ok(Json(analytics::event_series(
        &state.db, metric, &range, &scope,
    )?))
}

/// Views over time.
pub async fn analytics_views(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<SeriesQuery>,
) -> Result<Json<Series>> {
    series_for(&state, &headers, EventKind::View, query).await
}

/// Downloads over time.
pub async fn analytics_downloads(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<SeriesQuery>,
) -> Result<Json<Series>> {
    series_for(&state, &headers, EventKind::Download, query).await
}

/// Age chart query.
#[derive(Deserialize)]
pub struct AgeQuery {
    book_id: Option<String>,
}

/// Age chart response.
#[derive(Serialize)]
pub struct AgeDistributionResponse {
    book_id: Option<String>,
    total: i64,
    buckets: Vec<AgeBucket>,
}

/// Audience by age range, for all users (admin) or one book's readers.
pub async fn analytics_age_distribution(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<AgeQuery>,
) -> Result<Json<AgeDistributionResponse>> {
    let user = get_authenticated_user(&state, &headers).await?;

    if query.book_id.is_none() {
        require_admin(&user)?;
    }
    let scope = analytics_scope(&state, &user, query.book_id)?;

    let buckets = analytics::age_distribution(&state.db, scope.book_id.as_deref())?;
    let total = buckets.iter().map(|b| b.count).sum();

    Ok(Json(AgeDistributionResponse {
        book_id: scope.book_id,
        total,
        buckets,
    }))
}

fn default_metric() -> EventKind {
    EventKind::View
}

/// Top books query.
#[derive(Deserialize)]
pub struct TopBooksQuery {
    #[serde(default = "default_metric")]
    metric: EventKind,
    limit: Option<u32>,
}

/// Most viewed or downloaded books.
pub async fn analytics_top_books(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<TopBooksQuery>,
) -> Result<Json<Vec<BookMetricRow>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    let scope = analytics_scope(&state, &user, None)?;
    let limit = query.limit.unwrap_or(10).clamp(1, 50);

    Ok(Json(state.db.top_books(
        query.metric,
        limit,
        scope.uploader_id.as_deref(),
    )?))
}

/// Library-wide totals (admin).
pub async fn analytics_overview(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Overview>> {
    let user = get_authenticated_user(&state, &headers).await?;
    require_admin(&user)?;

    Ok(Json(state.db.overview(&day_of(now_timestamp()))?))
}

// ============================================================================
// AUDIT HANDLERS
// ============================================================================

/// Audit listing query.
#[derive(Deserialize)]
pub struct AuditListQuery {
    user_id: Option<String>,
    action: Option<String>,
    entity_type: Option<String>,
    since: Option<i64>,
    limit: Option<u32>,
    offset: Option<u32>,
}

/// Audit log (admin).
pub async fn audit_list(
    State(state): State<AppState>,
    headers: HeaderMap,
    AppQuery(query): AppQuery<AuditListQuery>,
) -> Result<Json<Page<AuditEntry>>> {
    let user = get_authenticated_user(&state, &headers).await?;
    require_admin(&user)?;

    let query = AuditQuery {
        user_id: query.user_id,
        action: query.action,
        entity_type: query.entity_type,
        since: query.since,
        limit: page_size(query.limit),
        offset: query.offset.unwrap_or(0),
    };

    Ok(Json(state.db.list_audit(&query)?))
}

// ============================================================================
// HELPERS
// ============================================================================

/// Extract bearer token from Authorization header.
fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
}

/// Get authenticated user from token.
async fn get_authenticated_user(state: &AppState, headers: &HeaderMap) -> Result<User> {
    let token = extract_token(headers)
        .ok_or_else(|| AppError::Unauthorized("Missing Authorization header".to_string()))?;

    state.auth.authenticate(&token)
}

/// Authenticated user when a token is sent; a bad token is still an error.
async fn get_optional_user(state: &AppState, headers: &HeaderMap) -> Result<Option<User>> {
    match extract_token(headers) {
        Some(token) => state.auth.authenticate(&token).map(Some),
        None => Ok(None),
    }
}

fn require_role(user: &User, allowed: &[Role]) -> Result<()> {
    if allowed.contains(&user.role) {
        Ok(())
    } else {
        Err(AppError::Forbidden(format!(
            "Role '{}' is not allowed to perform this action",
            user.role
        )))
    }
}

fn require_admin(user: &User) -> Result<()> {
    require_role(user, &[Role::Admin])
}

/// Uploader or admin.
fn require_book_owner(user: &User, book: &Book) -> Result<()> {
    if user.is_admin() || book.uploader_id.as_deref() == Some(user.id.as_str()) {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "Only the uploader or an administrator can manage this book".to_string(),
        ))
    }
}

fn find_book(state: &AppState, id: &str) -> Result<Book> {
    state
        .db
        .get_book(id)?
        .ok_or_else(|| AppError::NotFound(format!("Book not found: {}", id)))
}

fn find_active_comment(state: &AppState, id: &str) -> Result<Comment> {
    state
        .db
        .get_comment(id)?
        .filter(|c| c.status == CommentStatus::Active)
        .ok_or_else(|| AppError::NotFound(format!("Comment not found: {}", id)))
}

/// Count a view or download. Returns true when it was not a repeat today.
fn record_event(
    state: &AppState,
    kind: EventKind,
    book_id: &str,
    user: Option<&User>,
    client: &ClientInfo,
) -> bool {
    let user_id = user.map(|u| u.id.as_str());
    let key = analytics::viewer_key(
        user_id,
        client.ip.as_deref(),
        client.user_agent.as_deref(),
    );

    match state
        .db
        .record_event(kind, book_id, &key, user_id, now_timestamp())
    {
        Ok(counted) => counted,
        Err(e) => {
            tracing::warn!(book_id, kind = ?kind, error = %e, "Failed to record event");
            false
        }
    }
}
