//! API-key domain types: key format, permission scopes, and key records.
//!
//! A raw key is shown exactly once at creation; only its SHA-256 digest is
//! ever stored. The record lives in the credential store; `api_key.generated`
//! and `api_key.revoked` events are published for audit and webhooks.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::event::{AggregateType, DomainEvent, EventType};
use crate::id::{ApiKeyId, MerchantId};

/// Hex length of the random key body (256 bits).
pub const RAW_KEY_BODY_LEN: usize = 64;

/// The scope string granting every permission.
pub const WILDCARD_SCOPE: &str = "*";

static RAW_KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^ck_(live|test)_[0-9a-f]{64}$").expect("Invalid raw key regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    Live,
    Test,
}

impl KeyType {
    /// The human-identifiable raw-key prefix for this key type.
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyType::Live => "ck_live_",
            KeyType::Test => "ck_test_",
        }
    }

    /// Identifies the key type from a raw bearer without validating the body.
    pub fn from_raw_key(raw: &str) -> Option<KeyType> {
        if raw.starts_with(KeyType::Live.prefix()) {
            Some(KeyType::Live)
        } else if raw.starts_with(KeyType::Test.prefix()) {
            Some(KeyType::Test)
        } else {
            None
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyType::Live => "live",
            KeyType::Test => "test",
        };
        write!(f, "{s}")
    }
}

/// Checks the full raw-key shape: prefix plus 64 lowercase hex characters.
pub fn is_valid_raw_key_format(raw: &str) -> bool {
    RAW_KEY_REGEX.is_match(raw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyStatus {
    Active,
    Revoked,
    Expired,
}

impl fmt::Display for ApiKeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApiKeyStatus::Active => "active",
            ApiKeyStatus::Revoked => "revoked",
            ApiKeyStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ApiKeyError {
    #[error("Permission set must not be empty")]
    EmptyPermissions,
    #[error("Permission scope must not be empty or whitespace")]
    BlankScope,
    #[error("Key name must not be empty")]
    EmptyName,
    #[error("Key is already revoked")]
    AlreadyRevoked,
    #[error("Expiry must lie in the future")]
    ExpiryInPast,
}

/// A non-empty set of permission scopes. `*` grants everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<String>);

impl PermissionSet {
    pub fn new<I, S>(scopes: I) -> Result<Self, ApiKeyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = BTreeSet::new();
        for scope in scopes {
            let scope = scope.into();
            if scope.trim().is_empty() {
                return Err(ApiKeyError::BlankScope);
            }
            set.insert(scope);
        }
        if set.is_empty() {
            return Err(ApiKeyError::EmptyPermissions);
        }
        Ok(PermissionSet(set))
    }

    pub fn wildcard() -> Self {
        PermissionSet(BTreeSet::from([WILDCARD_SCOPE.to_string()]))
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.contains(WILDCARD_SCOPE)
    }

    pub fn allows(&self, scope: &str) -> bool {
        self.is_wildcard() || self.0.contains(scope)
    }

    /// True when every requested scope is covered by this set.
    pub fn allows_all<'a, I>(&self, scopes: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        scopes.into_iter().all(|scope| self.allows(scope))
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for PermissionSet {
    type Err = ApiKeyError;

    /// Parses a space-separated scope list, e.g. `"invoices:read invoices:write"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PermissionSet::new(s.split_whitespace().map(str::to_string))
    }
}

/// The stored API-key record. The raw key itself is never part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub merchant_id: MerchantId,
    /// Hex SHA-256 digest of the raw key.
    pub key_hash: String,
    pub key_type: KeyType,
    pub permissions: PermissionSet,
    pub status: ApiKeyStatus,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Builds a new active key record around an already-computed digest.
    pub fn new(
        merchant_id: MerchantId,
        key_hash: String,
        key_type: KeyType,
        permissions: PermissionSet,
        name: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<ApiKey, ApiKeyError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ApiKeyError::EmptyName);
        }
        if permissions.is_empty() {
            return Err(ApiKeyError::EmptyPermissions);
        }
        let created_at = Utc::now();
        if let Some(expires_at) = expires_at {
            if expires_at <= created_at {
                return Err(ApiKeyError::ExpiryInPast);
            }
        }
        Ok(ApiKey {
            id: ApiKeyId::generate(),
            merchant_id,
            key_hash,
            key_type,
            permissions,
            status: ApiKeyStatus::Active,
            name,
            expires_at,
            last_used_at: None,
            revoked_reason: None,
            created_at,
        })
    }

    /// The status as observed at `now`: an `active` key past its expiry reads
    /// as `expired`. Revocation is terminal.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ApiKeyStatus {
        match self.status {
            ApiKeyStatus::Revoked => ApiKeyStatus::Revoked,
            ApiKeyStatus::Active | ApiKeyStatus::Expired => match self.expires_at {
                Some(expires_at) if expires_at <= now => ApiKeyStatus::Expired,
                _ => self.status,
            },
        }
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == ApiKeyStatus::Active
    }

    /// Revokes the key. Fails if already revoked; there is no un-revoke.
    pub fn revoke(&mut self, reason: impl Into<String>) -> Result<(), ApiKeyError> {
        if self.status == ApiKeyStatus::Revoked {
            return Err(ApiKeyError::AlreadyRevoked);
        }
        self.status = ApiKeyStatus::Revoked;
        self.revoked_reason = Some(reason.into());
        Ok(())
    }
}

/// Events published for key lifecycle changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApiKeyEvent {
    Generated {
        api_key_id: ApiKeyId,
        merchant_id: MerchantId,
        key_type: KeyType,
        name: String,
        at: DateTime<Utc>,
    },
    Revoked {
        api_key_id: ApiKeyId,
        merchant_id: MerchantId,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent for ApiKeyEvent {
    fn event_type(&self) -> EventType {
        match self {
            ApiKeyEvent::Generated { .. } => EventType::ApiKeyGenerated,
            ApiKeyEvent::Revoked { .. } => EventType::ApiKeyRevoked,
        }
    }

    fn aggregate_type() -> AggregateType {
        AggregateType::ApiKey
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(expires_at: Option<DateTime<Utc>>) -> ApiKey {
        ApiKey::new(
            MerchantId::generate(),
            "deadbeef".repeat(8),
            KeyType::Live,
            PermissionSet::new(["invoices:read", "invoices:write"]).unwrap(),
            "primary",
            expires_at,
        )
        .unwrap()
    }

    #[test]
    fn test_raw_key_format() {
        let raw = format!("ck_live_{}", "a1".repeat(32));
        assert!(is_valid_raw_key_format(&raw));
        assert_eq!(KeyType::from_raw_key(&raw), Some(KeyType::Live));
        assert_eq!(
            KeyType::from_raw_key(&format!("ck_test_{}", "a1".repeat(32))),
            Some(KeyType::Test)
        );
        // Uppercase hex, short body, unknown prefix.
        assert!(!is_valid_raw_key_format(&format!(
            "ck_live_{}",
            "A1".repeat(32)
        )));
        assert!(!is_valid_raw_key_format("ck_live_abcd"));
        assert!(!is_valid_raw_key_format(&format!(
            "sk_live_{}",
            "a1".repeat(32)
        )));
    }

    #[test]
    fn test_permission_set_requires_scopes() {
        assert_eq!(
            PermissionSet::new(Vec::<String>::new()).unwrap_err(),
            ApiKeyError::EmptyPermissions
        );
        assert_eq!(
            PermissionSet::new(["  "]).unwrap_err(),
            ApiKeyError::BlankScope
        );
    }

    #[test]
    fn test_wildcard_allows_everything() {
        let set = PermissionSet::wildcard();
        assert!(set.allows("invoices:read"));
        assert!(set.allows_all(["a", "b", "c"]));
    }

    #[test]
    fn test_scoped_set_allows_only_members() {
        let set = PermissionSet::new(["invoices:read", "webhooks:write"]).unwrap();
        assert!(set.allows("invoices:read"));
        assert!(!set.allows("invoices:write"));
        assert!(set.allows_all(["invoices:read", "webhooks:write"]));
        assert!(!set.allows_all(["invoices:read", "invoices:write"]));
    }

    #[test]
    fn test_parse_space_separated_scopes() {
        let set: PermissionSet = "invoices:read  invoices:write".parse().unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_expired_key_reads_expired() {
        let now = Utc::now();
        let key = key(Some(now + Duration::hours(1)));
        assert_eq!(key.effective_status(now), ApiKeyStatus::Active);
        assert!(key.is_usable(now));
        let later = now + Duration::hours(2);
        assert_eq!(key.effective_status(later), ApiKeyStatus::Expired);
        assert!(!key.is_usable(later));
    }

    #[test]
    fn test_revoke_is_terminal_and_idempotent_failure() {
        let mut key = key(None);
        key.revoke("rotation").unwrap();
        assert_eq!(key.status, ApiKeyStatus::Revoked);
        assert_eq!(key.revoked_reason.as_deref(), Some("rotation"));
        assert_eq!(key.revoke("again").unwrap_err(), ApiKeyError::AlreadyRevoked);
        // Revoked wins over expiry on read.
        assert_eq!(
            key.effective_status(Utc::now()),
            ApiKeyStatus::Revoked
        );
    }

    #[test]
    fn test_new_rejects_past_expiry() {
        let past = Utc::now() - Duration::hours(1);
        assert_eq!(
            ApiKey::new(
                MerchantId::generate(),
                "00".repeat(32),
                KeyType::Test,
                PermissionSet::wildcard(),
                "expired",
                Some(past),
            )
            .unwrap_err(),
            ApiKeyError::ExpiryInPast
        );
    }
}
