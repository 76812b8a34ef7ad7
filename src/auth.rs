//! Authentication and the API-key-to-JWT token exchange.
//!
//! Callers authenticate with either a raw API key or a bearer token minted by
//! the exchange. A token binds the key reference, the merchant, and the
//! granted scope under HMAC-SHA256; when a token is presented downstream,
//! authorization uses the token's scope, never the key's full permission set.

use chrono::Utc;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

use checkout_types::api_key::{KeyType, PermissionSet, is_valid_raw_key_format};
use checkout_types::id::{ApiKeyId, MerchantId};

use crate::services::ServiceError;
use crate::services::api_keys::ApiKeyService;

/// Token lifetime bounds in seconds.
pub const MIN_EXPIRES_IN: u64 = 1;
pub const MAX_EXPIRES_IN: u64 = 86_400;
pub const DEFAULT_EXPIRES_IN: u64 = 3_600;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Unsupported grant type: {0}")]
    InvalidGrant(String),
    #[error("Authentication failed")]
    Authentication,
    #[error("Requested scope exceeds the key's permissions")]
    InsufficientPermissions,
    #[error("expires_in must be within [{MIN_EXPIRES_IN}, {MAX_EXPIRES_IN}] seconds")]
    InvalidExpiry,
    #[error("Token encoding failed")]
    Encoding(#[source] jsonwebtoken::errors::Error),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

/// Signed claims carried by an issued token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// API-key reference.
    pub sub: String,
    /// Merchant reference.
    pub mid: String,
    /// Granted scopes, a subset of the key's permissions at issuance.
    pub scope: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

/// `POST /auth/token` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    pub api_key: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    DEFAULT_EXPIRES_IN
}

/// `POST /auth/token` response body.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    pub scope: Vec<String>,
}

/// The identity attached to an authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub api_key_id: ApiKeyId,
    pub merchant_id: MerchantId,
    pub key_type: KeyType,
    /// Effective scopes: the token's scope when a token was presented,
    /// otherwise the key's permissions.
    pub scopes: PermissionSet,
}

impl AuthContext {
    pub fn require_scope(&self, scope: &str) -> Result<(), AuthError> {
        if self.scopes.allows(scope) {
            Ok(())
        } else {
            Err(AuthError::InsufficientPermissions)
        }
    }
}

pub struct AuthService {
    api_keys: Arc<ApiKeyService>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthService {
    pub fn new(api_keys: Arc<ApiKeyService>, signing_secret: &str) -> Self {
        AuthService {
            api_keys,
            encoding_key: EncodingKey::from_secret(signing_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(signing_secret.as_bytes()),
        }
    }

    /// The token exchange. Validation order: grant type, key format, key
    /// validity, scope subset, expiry bounds.
    #[instrument(skip_all)]
    pub async fn exchange(&self, request: TokenRequest) -> Result<TokenResponse, AuthError> {
        if request.grant_type != "api_key" {
            return Err(AuthError::InvalidGrant(request.grant_type));
        }
        if !is_valid_raw_key_format(&request.api_key) {
            return Err(AuthError::Authentication);
        }
        let key = self
            .api_keys
            .validate(&request.api_key)
            .await
            .map_err(|_| AuthError::Authentication)?;
        if !key
            .permissions
            .allows_all(request.scope.iter().map(String::as_str))
        {
            return Err(AuthError::InsufficientPermissions);
        }
        if !(MIN_EXPIRES_IN..=MAX_EXPIRES_IN).contains(&request.expires_in) {
            return Err(AuthError::InvalidExpiry);
        }
        // An empty request inherits the key's full permission set.
        let scope: Vec<String> = if request.scope.is_empty() {
            key.permissions.iter().map(str::to_string).collect()
        } else {
            request.scope
        };

        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            sub: key.id.to_string(),
            mid: key.merchant_id.to_string(),
            scope: scope.clone(),
            iat: now,
            exp: now + request.expires_in as i64,
        };
        let access_token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(AuthError::Encoding)?;
        Ok(TokenResponse {
            access_token,
            token_type: "Bearer",
            expires_in: request.expires_in,
            scope,
        })
    }

    /// Verifies a minted token's signature and expiry.
    pub fn verify_token(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        decode::<TokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| AuthError::Authentication)
    }

    /// Authenticates a bearer credential: a raw API key (identified by its
    /// prefix) or an issued token.
    #[instrument(skip_all)]
    pub async fn authenticate(&self, bearer: &str) -> Result<AuthContext, AuthError> {
        if KeyType::from_raw_key(bearer).is_some() {
            let key = self
                .api_keys
                .validate(bearer)
                .await
                .map_err(|_| AuthError::Authentication)?;
            return Ok(AuthContext {
                api_key_id: key.id,
                merchant_id: key.merchant_id,
                key_type: key.key_type,
                scopes: key.permissions,
            });
        }

        let claims = self.verify_token(bearer)?;
        let api_key_id: ApiKeyId = claims.sub.parse().map_err(|_| AuthError::Authentication)?;
        // The key behind the token must still be usable; revocation after
        // issuance invalidates outstanding tokens.
        let key = self
            .api_keys
            .get(api_key_id)
            .await
            .map_err(|_| AuthError::Authentication)?;
        if !key.is_usable(Utc::now()) {
            return Err(AuthError::Authentication);
        }
        let scopes =
            PermissionSet::new(claims.scope.clone()).map_err(|_| AuthError::Authentication)?;
        Ok(AuthContext {
            api_key_id,
            merchant_id: key.merchant_id,
            key_type: key.key_type,
            scopes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::InMemoryCredentialStore;
    use crate::event_bus::{EventPublisher, InMemoryEventBus, TopicMap};
    use crate::event_store::InMemoryEventStore;
    use crate::services::merchants::MerchantService;
    use checkout_types::merchant::MerchantSettings;

    struct Fixture {
        auth: AuthService,
        api_keys: Arc<ApiKeyService>,
        merchant_id: MerchantId,
    }

    async fn setup() -> Fixture {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = Arc::new(InMemoryEventBus::new());
        let publisher = Arc::new(EventPublisher::new(store, bus, TopicMap::standard()));
        let credentials = Arc::new(InMemoryCredentialStore::new());
        let merchants = Arc::new(MerchantService::new(
            publisher.clone(),
            credentials.clone(),
        ));
        let merchant = merchants
            .create(
                "Acme Widgets".into(),
                "ops@acme.test".into(),
                MerchantSettings::default(),
            )
            .await
            .unwrap();
        merchants.activate(merchant.id).await.unwrap();
        let api_keys = Arc::new(ApiKeyService::new(publisher, credentials, merchants));
        Fixture {
            auth: AuthService::new(api_keys.clone(), "jwt-signing-secret-for-tests"),
            api_keys,
            merchant_id: merchant.id,
        }
    }

    async fn issue_key(fixture: &Fixture, scopes: &[&str]) -> String {
        fixture
            .api_keys
            .create(
                fixture.merchant_id,
                KeyType::Live,
                PermissionSet::new(scopes.iter().copied()).unwrap(),
                "test-key".into(),
                None,
            )
            .await
            .unwrap()
            .raw_key
    }

    fn token_request(api_key: &str, scope: &[&str], expires_in: u64) -> TokenRequest {
        TokenRequest {
            grant_type: "api_key".into(),
            api_key: api_key.into(),
            scope: scope.iter().map(|s| s.to_string()).collect(),
            expires_in,
        }
    }

    #[tokio::test]
    async fn test_exchange_and_authenticate_roundtrip() {
        let fixture = setup().await;
        let raw = issue_key(&fixture, &["invoices:read", "invoices:write"]).await;
        let response = fixture
            .auth
            .exchange(token_request(&raw, &["invoices:read"], 600))
            .await
            .unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.expires_in, 600);
        assert_eq!(response.scope, vec!["invoices:read".to_string()]);

        let context = fixture.auth.authenticate(&response.access_token).await.unwrap();
        assert_eq!(context.merchant_id, fixture.merchant_id);
        // Token scope governs, not the key's full permissions.
        assert!(context.require_scope("invoices:read").is_ok());
        assert!(context.require_scope("invoices:write").is_err());
    }

    #[tokio::test]
    async fn test_raw_key_authenticates_with_full_permissions() {
        let fixture = setup().await;
        let raw = issue_key(&fixture, &["invoices:read", "invoices:write"]).await;
        let context = fixture.auth.authenticate(&raw).await.unwrap();
        assert!(context.require_scope("invoices:read").is_ok());
        assert!(context.require_scope("invoices:write").is_ok());
        assert!(context.require_scope("merchants:admin").is_err());
    }

    #[tokio::test]
    async fn test_validation_order() {
        let fixture = setup().await;
        let raw = issue_key(&fixture, &["invoices:read"]).await;

        // 1. Wrong grant type wins over everything else.
        let err = fixture
            .auth
            .exchange(token_request("whatever", &[], 600))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidGrant(_)));

        // 2. Malformed key.
        let mut request = token_request("not-a-key", &[], 600);
        request.grant_type = "api_key".into();
        assert!(matches!(
            fixture.auth.exchange(request).await.unwrap_err(),
            AuthError::Authentication
        ));

        // 3. Well-formed but unknown key.
        let unknown = crate::credentials::generate_raw_key(KeyType::Live);
        assert!(matches!(
            fixture.auth.exchange(token_request(&unknown, &[], 600)).await.unwrap_err(),
            AuthError::Authentication
        ));

        // 4. Scope beyond the key's permissions.
        assert!(matches!(
            fixture
                .auth
                .exchange(token_request(&raw, &["invoices:read", "merchants:admin"], 600))
                .await
                .unwrap_err(),
            AuthError::InsufficientPermissions
        ));

        // 5. Expiry bounds.
        assert!(matches!(
            fixture
                .auth
                .exchange(token_request(&raw, &["invoices:read"], 0))
                .await
                .unwrap_err(),
            AuthError::InvalidExpiry
        ));
        assert!(matches!(
            fixture
                .auth
                .exchange(token_request(&raw, &["invoices:read"], MAX_EXPIRES_IN + 1))
                .await
                .unwrap_err(),
            AuthError::InvalidExpiry
        ));
    }

    #[tokio::test]
    async fn test_wildcard_key_grants_any_scope() {
        let fixture = setup().await;
        let raw = issue_key(&fixture, &["*"]).await;
        let response = fixture
            .auth
            .exchange(token_request(&raw, &["anything:at-all"], 600))
            .await
            .unwrap();
        let context = fixture.auth.authenticate(&response.access_token).await.unwrap();
        assert!(context.require_scope("anything:at-all").is_ok());
        assert!(context.require_scope("something:else").is_err());
    }

    #[tokio::test]
    async fn test_empty_scope_inherits_key_permissions() {
        let fixture = setup().await;
        let raw = issue_key(&fixture, &["invoices:read"]).await;
        let response = fixture.auth.exchange(token_request(&raw, &[], 600)).await.unwrap();
        assert_eq!(response.scope, vec!["invoices:read".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let fixture = setup().await;
        let raw = issue_key(&fixture, &["invoices:read"]).await;
        let response = fixture
            .auth
            .exchange(token_request(&raw, &["invoices:read"], 1))
            .await
            .unwrap();
        // jsonwebtoken applies a default decoding leeway; wait it out.
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        let claims = decode::<TokenClaims>(
            &response.access_token,
            &fixture.auth.decoding_key,
            &validation,
        )
        .unwrap()
        .claims;
        assert!(claims.exp <= Utc::now().timestamp() + 1);

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let result = decode::<TokenClaims>(
            &response.access_token,
            &fixture.auth.decoding_key,
            &validation,
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_revoked_key_invalidates_outstanding_tokens() {
        let fixture = setup().await;
        let created = fixture
            .api_keys
            .create(
                fixture.merchant_id,
                KeyType::Live,
                PermissionSet::wildcard(),
                "doomed".into(),
                None,
            )
            .await
            .unwrap();
        let response = fixture
            .auth
            .exchange(token_request(&created.raw_key, &[], 600))
            .await
            .unwrap();
        fixture
            .api_keys
            .revoke(created.key.id, "rotation".into())
            .await
            .unwrap();
        assert!(matches!(
            fixture
                .auth
                .authenticate(&response.access_token)
                .await
                .unwrap_err(),
            AuthError::Authentication
        ));
    }

    #[tokio::test]
    async fn test_tampered_token_rejected() {
        let fixture = setup().await;
        let raw = issue_key(&fixture, &["invoices:read"]).await;
        let response = fixture
            .auth
            .exchange(token_request(&raw, &["invoices:read"], 600))
            .await
            .unwrap();
        let mut tampered = response.access_token.clone();
        tampered.pop();
        tampered.push('A');
        assert!(fixture.auth.authenticate(&tampered).await.is_err());
    }
}
