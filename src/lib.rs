//! bookshelf-rs: a book and e-book library server.
//!
//! This crate provides a JSON REST API for a shared book library with
//! user accounts, uploads and usage analytics.
//!
//! # Features
//!
//! - Accounts with admin, author and reader roles (JWT bearer tokens)
//! - Markdown, text, HTML, PDF and EPUB uploads with cover images
//! - Content stored on disk or inline in SQLite
//! - Reading shelf with status, progress, ratings and favorites
//! - Comments with ratings and soft deletion
//! - Deduplicated view/download counters and chart-ready series
//! - Audit trail of account and catalog changes

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Usage analytics.
pub mod analytics;
/// Authentication and user management.
pub mod auth;
/// Configuration and CLI.
pub mod config;
/// Database operations.
pub mod db;
/// Error types.
pub mod error;
/// HTTP server.
pub mod server;
/// E-book content and cover storage.
pub mod storage;
/// Input validation.
pub mod validate;

#[cfg(test)]
mod tests;

pub use config::{Cli, Command, Config};
pub use db::Database;
pub use error::{AppError, Result};
pub use server::AppState;
