//! Request extractors that reject with `AppError` bodies.

use super::AppState;
use crate::error::AppError;
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Multipart, Request};
use axum::http::{Extensions, HeaderMap, header, request::Parts};
use std::convert::Infallible;
use std::net::SocketAddr;

/// `axum::Json` with JSON error bodies on rejection.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);

/// `axum::extract::Query` with JSON error bodies on rejection.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct AppQuery<T>(pub T);

/// `axum::extract::Path` with JSON error bodies on rejection.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(AppError))]
pub struct AppPath<T>(pub T);

/// `Multipart` with JSON error bodies on rejection.
pub struct AppMultipart(pub Multipart);

impl<S> FromRequest<S> for AppMultipart
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        Multipart::from_request(req, state)
            .await
            .map(AppMultipart)
            .map_err(|rejection| AppError::Validation(rejection.body_text()))
    }
}

/// Caller address and user agent, for audit entries and viewer keys.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    /// Client IP: the socket peer, or the proxy headers when
    /// `security.trust_proxy` is set.
    pub ip: Option<String>,
    /// `User-Agent` header.
    pub user_agent: Option<String>,
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        })
        .map(str::to_string)
}

/// Resolve the caller address. Forwarding headers are client-controlled
/// and only honoured behind a trusted reverse proxy.
fn client_ip(headers: &HeaderMap, extensions: &Extensions, trust_proxy: bool) -> Option<String> {
    let peer = || {
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    };

    if trust_proxy {
        forwarded_ip(headers).or_else(peer)
    } else {
        peer()
    }
}

impl FromRequestParts<AppState> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let trust_proxy = state.config.security.trust_proxy;
        let ip = client_ip(&parts.headers, &parts.extensions, trust_proxy);

        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(Self { ip, user_agent })
    }
}
