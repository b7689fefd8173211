//! Authentication module
//!
//! Account credentials and permission levels. Passwords are hashed with
//! Argon2; account creation input is checked with `validator` before it
//! reaches the store. In development mode unknown accounts are created on
//! first login.

use std::net::IpAddr;
use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use validator::Validate;

use crate::error::{AuthError, GoreError, Result};
use crate::game::persistence::{AccountRecord, GameStore};

static USERNAME_REGEX: Lazy<regex::Regex> =
    Lazy::new(|| regex::Regex::new(r"^[a-zA-Z0-9_]+$").expect("valid username regex"));

/// Permission level of an account. Levels are ordered; a command requiring
/// `Moderator` is available to `Moderator`, `Admin` and `Owner`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UserPermissions {
    #[default]
    User,
    Moderator,
    Admin,
    Owner,
}

impl UserPermissions {
    /// Whether this level satisfies `required`
    pub fn includes(self, required: UserPermissions) -> bool {
        self >= required
    }

    pub fn name(self) -> &'static str {
        match self {
            UserPermissions::User => "user",
            UserPermissions::Moderator => "moderator",
            UserPermissions::Admin => "admin",
            UserPermissions::Owner => "owner",
        }
    }
}

/// Account creation input
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAccountRequest {
    #[validate(length(min = 3, max = 16, message = "Name must be 3-16 characters"))]
    #[validate(regex(
        path = "USERNAME_REGEX",
        message = "Name can only contain letters, numbers, and underscores"
    ))]
    pub name: String,

    #[validate(length(min = 6, max = 64, message = "Password must be 6-64 characters"))]
    pub password: String,

    #[validate(email(message = "Please enter a valid email address"))]
    pub email: String,
}

impl CreateAccountRequest {
    /// Validate the request, reporting the first offending field
    pub fn check(&self) -> std::result::Result<(), AuthError> {
        let errors = match self.validate() {
            Ok(()) => return Ok(()),
            Err(errors) => errors,
        };

        let fields = errors.field_errors();
        if fields.contains_key("name") {
            Err(AuthError::InvalidUsername)
        } else if fields.contains_key("password") {
            Err(AuthError::InvalidPassword)
        } else {
            Err(AuthError::InvalidEmail)
        }
    }
}

/// Credential checks and account creation against a [`GameStore`]
pub struct AccountService {
    store: Arc<dyn GameStore>,
    dev_mode: bool,
}

impl AccountService {
    pub fn new(store: Arc<dyn GameStore>, dev_mode: bool) -> Self {
        Self { store, dev_mode }
    }

    /// Check credentials and ban state, returning the account on success
    pub fn authenticate(&self, name: &str, password: &str) -> Result<AccountRecord> {
        let username = normalize_username(name);
        if username.is_empty() || !USERNAME_REGEX.is_match(&username) {
            return Err(AuthError::InvalidCredentials.into());
        }

        let account = match self.store.load_account(&username)? {
            Some(account) => account,
            None if self.dev_mode => self.create_dev_account(&username, password)?,
            None => {
                debug!(username = %username, "Login for unknown account");
                return Err(AuthError::InvalidCredentials.into());
            }
        };

        if !verify_password(password, &account.password_hash) {
            warn!(username = %username, "Failed login attempt");
            return Err(AuthError::InvalidCredentials.into());
        }

        if let Some(ban) = self.store.active_ban(account.id, Utc::now())? {
            info!(
                username = %username,
                expires_at = %ban.expires_at,
                reason = %ban.reason,
                "Login refused for banned account"
            );
            return Err(AuthError::Banned(ban.expires_at.to_rfc3339()).into());
        }

        Ok(account)
    }

    /// Validate and create a new account
    pub fn create_account(&self, request: &CreateAccountRequest, ip: IpAddr) -> Result<AccountRecord> {
        request.check()?;

        let password_hash = hash_password(&request.password)?;
        let created = self
            .store
            .try_create_account(&request.name, &password_hash, &request.email, ip)?;
        if !created {
            return Err(AuthError::AccountCreationFailed("Name already taken".to_string()).into());
        }

        let account = self
            .store
            .load_account(&request.name)?
            .ok_or_else(|| GoreError::Internal("account missing after creation".to_string()))?;

        info!(
            username = %account.name,
            account_id = %account.id,
            ip = %ip,
            "New account created"
        );
        Ok(account)
    }

    fn create_dev_account(&self, username: &str, password: &str) -> Result<AccountRecord> {
        let password_hash = hash_password(password)?;
        self.store.try_create_account(
            username,
            &password_hash,
            "",
            IpAddr::from([127, 0, 0, 1]),
        )?;
        debug!(username = %username, "Created dev account");

        self.store
            .load_account(username)?
            .ok_or_else(|| GoreError::Internal("dev account missing after creation".to_string()))
    }

    pub fn is_dev_mode(&self) -> bool {
        self.dev_mode
    }
}

/// Normalize a username (lowercase, trim, replace spaces with underscores)
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase().replace(' ', "_")
}

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| GoreError::Internal(format!("Failed to hash password: {}", e)))?
        .to_string();

    Ok(password_hash)
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::persistence::{BanRecord, MemoryStore};
    use chrono::Duration;

    fn request(name: &str, password: &str, email: &str) -> CreateAccountRequest {
        CreateAccountRequest {
            name: name.to_string(),
            password: password.to_string(),
            email: email.to_string(),
        }
    }

    fn ip() -> IpAddr {
        "192.168.1.20".parse().unwrap()
    }

    #[test]
    fn test_normalize_username() {
        assert_eq!(normalize_username("Player"), "player");
        assert_eq!(normalize_username("  Test User  "), "test_user");
    }

    #[test]
    fn test_permission_ordering() {
        assert!(UserPermissions::Admin.includes(UserPermissions::Moderator));
        assert!(UserPermissions::Moderator.includes(UserPermissions::Moderator));
        assert!(!UserPermissions::User.includes(UserPermissions::Moderator));
    }

    #[test]
    fn test_password_hashing() {
        let hash = hash_password("test_password_123").unwrap();
        assert!(verify_password("test_password_123", &hash));
        assert!(!verify_password("wrong_password", &hash));
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[test]
    fn test_request_validation() {
        assert!(request("hero_1", "secret1", "hero@example.com").check().is_ok());
        assert_eq!(
            request("a b", "secret1", "hero@example.com").check(),
            Err(AuthError::InvalidUsername)
        );
        assert_eq!(
            request("hero", "123", "hero@example.com").check(),
            Err(AuthError::InvalidPassword)
        );
        assert_eq!(
            request("hero", "secret1", "not-an-email").check(),
            Err(AuthError::InvalidEmail)
        );
    }

    #[test]
    fn test_create_and_authenticate() {
        let service = AccountService::new(Arc::new(MemoryStore::new()), false);
        let account = service
            .create_account(&request("Hero", "secret1", "hero@example.com"), ip())
            .unwrap();
        assert_eq!(account.name, "hero");

        assert!(service.authenticate("HERO", "secret1").is_ok());
        assert!(matches!(
            service.authenticate("hero", "nope"),
            Err(GoreError::Auth(AuthError::InvalidCredentials))
        ));
        assert!(matches!(
            service.create_account(&request("hero", "secret1", "hero@example.com"), ip()),
            Err(GoreError::Auth(AuthError::AccountCreationFailed(_)))
        ));
    }

    #[test]
    fn test_unknown_account_rejected_outside_dev_mode() {
        let service = AccountService::new(Arc::new(MemoryStore::new()), false);
        assert!(matches!(
            service.authenticate("ghost", "secret1"),
            Err(GoreError::Auth(AuthError::InvalidCredentials))
        ));
    }

    #[test]
    fn test_dev_mode_creates_account() {
        let service = AccountService::new(Arc::new(MemoryStore::new()), true);
        let account = service.authenticate("tester", "pw").unwrap();
        assert_eq!(account.name, "tester");
        assert!(service.authenticate("tester", "pw").is_ok());
    }

    #[test]
    fn test_banned_account_rejected() {
        let store = Arc::new(MemoryStore::new());
        let service = AccountService::new(store.clone(), false);
        let account = service
            .create_account(&request("rogue", "secret1", "rogue@example.com"), ip())
            .unwrap();

        let now = Utc::now();
        store
            .insert_ban(BanRecord {
                account: account.id,
                reason: "botting".to_string(),
                issued_by: "admin".to_string(),
                issued_at: now,
                expires_at: now + Duration::days(1),
            })
            .unwrap();

        assert!(matches!(
            service.authenticate("rogue", "secret1"),
            Err(GoreError::Auth(AuthError::Banned(_)))
        ));
    }

    #[test]
    fn test_store_outage_surfaces_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let service = AccountService::new(store, false);
        assert!(matches!(
            service.authenticate("hero", "secret1"),
            Err(GoreError::Persistence(_))
        ));
    }
}
