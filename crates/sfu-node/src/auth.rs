//! User authentication for the gateway.
//!
//! [`Authenticator`] is the seam to the external auth collaborator. The
//! production implementation, [`JwtAuthenticator`], verifies Ed25519-signed
//! user tokens locally; [`StaticAuthenticator`] serves fixed tokens for
//! development and tests.
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only `EdDSA` is accepted
//! - Failures return one generic message; details go to debug logs

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use common::jwt::{check_token_shape, decode_ed25519_public_key_pem, validate_iat, UserClaims};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use tracing::{debug, instrument};

use crate::errors::SfuError;

const INVALID_TOKEN: &str = "The access token is invalid or expired";

/// Identity established by `authenticate`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub display_name: Option<String>,
    pub permissions: Vec<String>,
    pub organizations: Vec<String>,
}

impl AuthenticatedUser {
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

impl From<UserClaims> for AuthenticatedUser {
    fn from(claims: UserClaims) -> Self {
        Self {
            permissions: claims.scopes(),
            user_id: claims.sub,
            display_name: claims.name,
            organizations: claims.orgs,
        }
    }
}

/// External authentication collaborator.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// # Errors
    ///
    /// `SfuError::Authentication` for any bad, expired, or unverifiable token.
    async fn verify_token(&self, token: &str) -> Result<AuthenticatedUser, SfuError>;

    /// # Errors
    ///
    /// Implementations backed by a remote service may fail to answer.
    async fn verify_membership(
        &self,
        user: &AuthenticatedUser,
        organization_id: &str,
    ) -> Result<bool, SfuError>;
}

/// Verifies user tokens against a configured Ed25519 public key.
pub struct JwtAuthenticator {
    decoding_key: DecodingKey,
    clock_skew: Duration,
}

impl JwtAuthenticator {
    /// # Errors
    ///
    /// `SfuError::Config` if the PEM body is not valid base64.
    pub fn from_public_key_pem(pem: &str, clock_skew: Duration) -> Result<Self, SfuError> {
        let der = decode_ed25519_public_key_pem(pem)
            .map_err(|e| SfuError::Config(format!("invalid auth public key: {e}")))?;
        Ok(Self {
            decoding_key: DecodingKey::from_ed_der(&der),
            clock_skew,
        })
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    #[instrument(skip_all)]
    async fn verify_token(&self, token: &str) -> Result<AuthenticatedUser, SfuError> {
        check_token_shape(token).map_err(|e| {
            debug!(target: "sfu.auth", error = ?e, "Token shape check failed");
            SfuError::Authentication(INVALID_TOKEN.to_string())
        })?;

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();
        validation.required_spec_claims.insert("exp".to_string());
        validation.required_spec_claims.insert("sub".to_string());

        let data = decode::<UserClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            debug!(target: "sfu.auth", error = %e, "Token verification failed");
            SfuError::Authentication(INVALID_TOKEN.to_string())
        })?;

        validate_iat(data.claims.iat, self.clock_skew).map_err(|e| {
            debug!(target: "sfu.auth", error = ?e, "Token iat validation failed");
            SfuError::Authentication(INVALID_TOKEN.to_string())
        })?;

        Ok(data.claims.into())
    }

    async fn verify_membership(
        &self,
        user: &AuthenticatedUser,
        organization_id: &str,
    ) -> Result<bool, SfuError> {
        Ok(user.organizations.iter().any(|o| o == organization_id))
    }
}

/// Fixed token table.
#[derive(Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, AuthenticatedUser>,
}

impl StaticAuthenticator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `token` as `user`.
    #[must_use]
    pub fn with_user(mut self, token: impl Into<String>, user: AuthenticatedUser) -> Self {
        self.users.insert(token.into(), user);
        self
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn verify_token(&self, token: &str) -> Result<AuthenticatedUser, SfuError> {
        self.users
            .get(token)
            .cloned()
            .ok_or_else(|| SfuError::Authentication(INVALID_TOKEN.to_string()))
    }

    async fn verify_membership(
        &self,
        user: &AuthenticatedUser,
        organization_id: &str,
    ) -> Result<bool, SfuError> {
        Ok(user.organizations.iter().any(|o| o == organization_id))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sfu_test_utils::crypto::{TestKeypair, TokenBuilder};

    fn authenticator(keypair: &TestKeypair) -> JwtAuthenticator {
        JwtAuthenticator::from_public_key_pem(&keypair.public_key_pem(), Duration::from_secs(300))
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_yields_user() {
        let keypair = TestKeypair::new(1);
        let token = TokenBuilder::new("user-1")
            .scope("rooms:host rooms:join")
            .org("org-a")
            .name("Ada")
            .sign(&keypair);

        let user = authenticator(&keypair).verify_token(&token).await.unwrap();
        assert_eq!(user.user_id, "user-1");
        assert_eq!(user.display_name.as_deref(), Some("Ada"));
        assert!(user.has_permission("rooms:host"));
        assert!(!user.has_permission("rooms:moderate"));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let keypair = TestKeypair::new(1);
        let token = TokenBuilder::new("user-1").expires_in(-120).sign(&keypair);

        let err = authenticator(&keypair).verify_token(&token).await.unwrap_err();
        assert!(matches!(err, SfuError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_token_from_other_key_rejected() {
        let signer = TestKeypair::new(1);
        let other = TestKeypair::new(2);
        let token = TokenBuilder::new("user-1").sign(&signer);

        let err = authenticator(&other).verify_token(&token).await.unwrap_err();
        assert!(matches!(err, SfuError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_future_iat_rejected() {
        let keypair = TestKeypair::new(1);
        let token = TokenBuilder::new("user-1").issued_in(3600).sign(&keypair);

        let err = authenticator(&keypair).verify_token(&token).await.unwrap_err();
        assert!(matches!(err, SfuError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_malformed_token_rejected_before_decode() {
        let keypair = TestKeypair::new(1);
        let err = authenticator(&keypair)
            .verify_token("not-a-jwt")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "AUTH_FAILED");
    }

    #[tokio::test]
    async fn test_membership_follows_token_orgs() {
        let keypair = TestKeypair::new(1);
        let auth = authenticator(&keypair);
        let token = TokenBuilder::new("user-1").org("org-a").sign(&keypair);
        let user = auth.verify_token(&token).await.unwrap();

        assert!(auth.verify_membership(&user, "org-a").await.unwrap());
        assert!(!auth.verify_membership(&user, "org-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let user = AuthenticatedUser {
            user_id: "u".to_string(),
            display_name: None,
            permissions: vec![],
            organizations: vec!["o".to_string()],
        };
        let auth = StaticAuthenticator::new().with_user("tok", user.clone());

        assert_eq!(auth.verify_token("tok").await.unwrap(), user);
        assert!(auth.verify_token("other").await.is_err());
        assert!(auth.verify_membership(&user, "o").await.unwrap());
    }
}
