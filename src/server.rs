//! HTTP server and routes.

mod extract;
mod handlers;
mod state;

pub use extract::{AppJson, AppMultipart, AppPath, AppQuery, ClientInfo};
pub use state::AppState;

use crate::config::SecurityConfig;
use crate::error::{AppError, Result};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue, Method, header},
    routing::{get, post, put},
};
use std::sync::Arc;
use std::time::Duration;
use tower_governor::{
    GovernorLayer,
    governor::GovernorConfigBuilder,
    key_extractor::{PeerIpKeyExtractor, SmartIpKeyExtractor},
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};

/// How often idle rate-limiter entries are dropped.
const LIMITER_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; img-src 'self' data:; frame-ancestors 'none'";

/// Highest rate the limiter can express: one token per nanosecond.
const MAX_RATE_PER_SECOND: u64 = 1_000_000_000;

/// Create the application router.
pub fn create_router(state: AppState) -> Result<Router> {
    let security = state.config.security.clone();
    let upload_limit = state.config.storage.max_upload_bytes;

    let auth_routes = Router::new()
        .route("/register", post(handlers::auth_register))
        .route("/login", post(handlers::auth_login))
        .route("/me", get(handlers::auth_me).put(handlers::auth_update_me))
        .route("/password", put(handlers::auth_change_password))
        .route("/users", get(handlers::auth_list_users))
        .route("/users/{id}/role", put(handlers::auth_set_role))
        .route("/users/{id}", axum::routing::delete(handlers::auth_delete_user));

    let book_routes = Router::new()
        .route(
            "/",
            get(handlers::books_list)
                .post(handlers::books_create)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/{id}",
            get(handlers::books_get)
                .put(handlers::books_update)
                .delete(handlers::books_delete),
        )
        .route("/{id}/content", get(handlers::books_content))
        .route("/{id}/download", get(handlers::books_download))
        .route("/{id}/cover", get(handlers::books_cover));

    let shelf_routes = Router::new()
        .route("/", get(handlers::user_books_list))
        .route(
            "/{book_id}",
            get(handlers::user_books_get)
                .put(handlers::user_books_upsert)
                .delete(handlers::user_books_delete),
        )
        .route(
            "/{book_id}/favorite",
            post(handlers::user_books_toggle_favorite),
        );

    let comment_routes = Router::new()
        .route(
            "/book/{book_id}",
            get(handlers::comments_list).post(handlers::comments_create),
        )
        .route(
            "/{id}",
            put(handlers::comments_update).delete(handlers::comments_delete),
        );

    let analytics_routes = Router::new()
        .route("/overview", get(handlers::analytics_overview))
        .route("/views", get(handlers::analytics_views))
        .route("/downloads", get(handlers::analytics_downloads))
        .route(
            "/age-distribution",
            get(handlers::analytics_age_distribution),
        )
        .route("/top-books", get(handlers::analytics_top_books));

    let api_routes = Router::new()
        .nest("/auth", auth_routes)
        .nest("/books", book_routes)
        .nest("/user-books", shelf_routes)
        .nest("/comments", comment_routes)
        .nest("/analytics", analytics_routes)
        .route("/audit", get(handlers::audit_list));

    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", api_routes)
        .layer(DefaultBodyLimit::max(security.max_body_bytes));

    if security.rate_limit_per_second > 0 {
        let period = rate_limit_period(security.rate_limit_per_second)?;
        let burst = security.rate_limit_burst.max(1);

        // Forwarding headers are only a usable key behind a trusted proxy;
        // otherwise every spoofed value would get its own bucket.
        router = if security.trust_proxy {
            let config = GovernorConfigBuilder::default()
                .period(period)
                .burst_size(burst)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
                .ok_or_else(invalid_rate_limit)?;
            let config = Arc::new(config);
            let limiter = config.limiter().clone();
            spawn_limiter_cleanup(move || {
                let clients = limiter.len();
                limiter.retain_recent();
                clients
            });
            router.layer(GovernorLayer::new(config))
        } else {
            let config = GovernorConfigBuilder::default()
                .period(period)
                .burst_size(burst)
                .key_extractor(PeerIpKeyExtractor)
                .finish()
                .ok_or_else(invalid_rate_limit)?;
            let config = Arc::new(config);
            let limiter = config.limiter().clone();
            spawn_limiter_cleanup(move || {
                let clients = limiter.len();
                limiter.retain_recent();
                clients
            });
            router.layer(GovernorLayer::new(config))
        };
    }

    Ok(router
        .layer(cors_layer(&security)?)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("no-referrer"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("cross-origin-resource-policy"),
            HeaderValue::from_static("cross-origin"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

/// Replenish interval for a sustained rate of `per_second` requests.
fn rate_limit_period(per_second: u64) -> Result<Duration> {
    if per_second == 0 || per_second > MAX_RATE_PER_SECOND {
        return Err(AppError::Config(format!(
            "rate_limit_per_second must be between 1 and {}",
            MAX_RATE_PER_SECOND
        )));
    }
    Ok(Duration::from_nanos(MAX_RATE_PER_SECOND / per_second))
}

fn invalid_rate_limit() -> AppError {
    AppError::Config("Invalid rate limit settings".to_string())
}

/// Periodically drop limiter state for clients that have gone quiet.
fn spawn_limiter_cleanup<F>(prune: F)
where
    F: Fn() -> usize + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LIMITER_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            let clients = prune();
            tracing::debug!(clients, "Pruned rate limiter state");
        }
    });
}

/// CORS from the configured origin list; `*` allows any origin.
fn cors_layer(security: &SecurityConfig) -> Result<CorsLayer> {
    if security.cors_any() {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any));
    }

    let origins = security
        .cors_origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o)
                .map_err(|_| AppError::Config(format!("Invalid CORS origin: {}", o)))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .max_age(Duration::from_secs(600)))
}
