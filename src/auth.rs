//! Authentication module.

use crate::db::{AgeRange, Database, ProfileUpdate, Role, User, now_timestamp};
use crate::error::{AppError, Result};
use crate::validate::{self, Validator};
use argon2::{
    Argon2,
    password_hash::{
        PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
        rand_core::{OsRng, RngCore},
    },
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

/// Hash a password using Argon2.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
}

/// Verify a password against a hash.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| AppError::Internal(format!("Invalid password hash: {}", e)))?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Generate a random secret suitable for signing tokens.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 48];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Bearer token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID.
    pub sub: String,
    /// Role at issue time (informational, authority comes from the database).
    pub role: Role,
    /// Issued at.
    pub iat: i64,
    /// Expiration.
    pub exp: i64,
}

/// Fields for creating an account.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewAccount {
    /// Login name.
    pub username: String,
    /// Plain password.
    pub password: String,
    /// Email address.
    pub email: Option<String>,
    /// Display name.
    pub display_name: Option<String>,
    /// Age bracket.
    pub age_range: Option<AgeRange>,
    /// Requested role (defaults to `user`).
    pub role: Option<Role>,
}

/// Authentication service.
pub struct AuthService {
    db: Database,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_hours: u32,
    registration_enabled: bool,
}

impl AuthService {
    /// Create a new auth service.
    pub fn new(
        db: Database,
        jwt_secret: &str,
        token_hours: u32,
        registration_enabled: bool,
    ) -> Self {
        Self {
            db,
            encoding_key: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
            token_hours,
            registration_enabled,
        }
    }

    /// Self-service registration; only `user` and `author` roles.
    pub fn register(&self, account: NewAccount) -> Result<User> {
        if !self.registration_enabled {
            return Err(AppError::Forbidden("Registration is disabled".to_string()));
        }

        if account.role == Some(Role::Admin) {
            return Err(AppError::Forbidden(
                "Admin accounts cannot be self-registered".to_string(),
            ));
        }

        self.create_user(account)
    }

    /// Create a new user with any role (admin function).
    pub fn create_user(&self, account: NewAccount) -> Result<User> {
        validate::validate_username(&account.username)?;
        validate::validate_password(&account.password)?;

        let email = account
            .email
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());
        let display_name = validate::sanitize_opt(account.display_name);

        Validator::new()
            .email("email", email.as_deref())
            .max_len("display_name", display_name.as_deref(), validate::MAX_SHORT_LEN)
            .finish()?;

        let password_hash = hash_password(&account.password)?;

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            username: account.username,
            email,
            password_hash,
            display_name,
            role: account.role.unwrap_or(Role::User),
            age_range: account.age_range,
            created_at: now_timestamp(),
            last_login: None,
        };

        self.db.create_user(&user)?;
        Ok(user)
    }

    /// Verify credentials (username or email) and issue a token.
    pub fn login(&self, login: &str, password: &str) -> Result<(User, String)> {
        let invalid = || AppError::Unauthorized("Invalid username or password".to_string());

        let user = self
            .db
            .get_user_by_login(login.trim())?
            .ok_or_else(invalid)?;

        if !verify_password(password, &user.password_hash)? {
            return Err(invalid());
        }

        self.db.update_user_last_login(&user.id)?;
        let token = self.issue_token(&user)?;

        Ok((user, token))
    }

    /// Sign a token for a user.
    pub fn issue_token(&self, user: &User) -> Result<String> {
        let iat = now_timestamp();
        let claims = Claims {
            sub: user.id.clone(),
            role: user.role,
            iat,
            exp: iat + self.token_hours as i64 * 60 * 60,
        };

        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    /// Decode and verify a token's signature and expiry.
    pub fn decode_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &Validation::new(Algorithm::HS256))
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Rejected bearer token");
                AppError::Unauthorized("Invalid or expired token".to_string())
            })
    }

    /// Resolve a token to its (still existing) user.
    pub fn authenticate(&self, token: &str) -> Result<User> {
        let claims = self.decode_token(token)?;
        self.db
            .get_user_by_id(&claims.sub)?
            .ok_or_else(|| AppError::Unauthorized("Account no longer exists".to_string()))
    }

    /// Change own password after checking the current one.
    pub fn change_password(&self, user: &User, current: &str, new_password: &str) -> Result<()> {
        if !verify_password(current, &user.password_hash)? {
            return Err(AppError::Unauthorized(
                "Current password is incorrect".to_string(),
            ));
        }

        validate::validate_password(new_password)?;
        let password_hash = hash_password(new_password)?;
        self.db.update_user_password(&user.id, &password_hash)?;
        Ok(())
    }

    /// Set a new password without the old one (admin function).
    pub fn reset_password(&self, username: &str, new_password: &str) -> Result<bool> {
        validate::validate_password(new_password)?;

        let Some(user) = self.db.get_user_by_username(username)? else {
            return Ok(false);
        };

        let password_hash = hash_password(new_password)?;
        self.db.update_user_password(&user.id, &password_hash)
    }

    /// Update own profile and return the refreshed user.
    pub fn update_profile(&self, user_id: &str, update: ProfileUpdate) -> Result<User> {
        let update = ProfileUpdate {
            display_name: validate::sanitize_opt(update.display_name),
            email: update
                .email
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty()),
            age_range: update.age_range,
        };

        Validator::new()
            .email("email", update.email.as_deref())
            .max_len(
                "display_name",
                update.display_name.as_deref(),
                validate::MAX_SHORT_LEN,
            )
            .finish()?;

        self.db.update_user_profile(user_id, &update)?;
        self.db
            .get_user_by_id(user_id)?
            .ok_or_else(|| AppError::NotFound(format!("User not found: {}", user_id)))
    }

    /// Change a user's role.
    pub fn set_role(&self, user_id: &str, role: Role) -> Result<bool> {
        self.db.update_user_role(user_id, role)
    }

    /// Delete a user.
    pub fn delete_user(&self, user_id: &str) -> Result<bool> {
        self.db.delete_user(user_id)
    }

    /// List all users.
    pub fn list_users(&self) -> Result<Vec<User>> {
        self.db.list_users()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_and_verify() {
        let password = "test_password_123";
        let hash = hash_password(password).unwrap();

        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_generate_secret() {
        let s1 = generate_secret();
        let s2 = generate_secret();

        assert_eq!(s1.len(), 64); // Base64 of 48 bytes
        assert_ne!(s1, s2);
    }

    #[test]
    fn test_token_signed_with_other_secret_is_rejected() {
        let db = Database::open_memory().unwrap();
        let issuer = AuthService::new(db.clone(), "secret-a", 1, true);
        let verifier = AuthService::new(db, "secret-b", 1, true);

        let user = issuer
            .create_user(NewAccount {
                username: "reader".to_string(),
                password: "password123".to_string(),
                ..Default::default()
            })
            .unwrap();
        let token = issuer.issue_token(&user).unwrap();

        assert!(issuer.decode_token(&token).is_ok());
        assert!(matches!(
            verifier.decode_token(&token),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let db = Database::open_memory().unwrap();
        let auth = AuthService::new(db, "secret", 1, true);

        let claims = Claims {
            sub: "someone".to_string(),
            role: Role::User,
            iat: now_timestamp() - 7200,
            exp: now_timestamp() - 3600,
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();

        assert!(auth.decode_token(&token).is_err());
    }
}
