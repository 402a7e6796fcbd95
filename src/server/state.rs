//! Application state shared across handlers.

use crate::auth::AuthService;
use crate::config::Config;
use crate::db::{AuditEntry, Database, now_timestamp};
use crate::storage::ContentStore;
use std::sync::Arc;

use super::ClientInfo;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Database connection.
    pub db: Database,
    /// Authentication service.
    pub auth: Arc<AuthService>,
    /// E-book content store.
    pub storage: ContentStore,
}

impl AppState {
    /// Create new application state with database.
    pub fn new(config: Config, db: Database) -> Self {
        let auth = AuthService::new(
            db.clone(),
            &config.auth.jwt_secret,
            config.auth.token_hours,
            config.auth.registration_enabled(),
        );
        let storage = ContentStore::new(&config.storage);

        Self {
            config: Arc::new(config),
            db,
            auth: Arc::new(auth),
            storage,
        }
    }

    /// Append an audit entry. Failures are logged, never surfaced.
    pub fn audit(
        &self,
        client: &ClientInfo,
        user_id: Option<&str>,
        action: &str,
        entity: Option<(&str, &str)>,
        details: Option<serde_json::Value>,
    ) {
        let entry = AuditEntry {
            id: 0,
            user_id: user_id.map(str::to_string),
            action: action.to_string(),
            entity_type: entity.map(|(kind, _)| kind.to_string()),
            entity_id: entity.map(|(_, id)| id.to_string()),
            details: details.map(|d| d.to_string()),
            ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
            created_at: now_timestamp(),
        };

        if let Err(e) = self.db.append_audit(&entry) {
            tracing::warn!(action, error = %e, "Failed to write audit entry");
        }
    }
}
