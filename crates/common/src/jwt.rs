//! JWT helpers shared by every crate that validates user tokens.
//!
//! The gateway verifies signatures with `jsonwebtoken`; this module holds the
//! pieces that are independent of the signing library:
//!
//! - size limits checked before any parsing
//! - `iat` validation with bounded clock skew
//! - the user claims structure (with `sub` redacted in `Debug`)
//! - Ed25519 public key decoding from PEM
//!
//! # Security
//!
//! - Tokens are size-checked BEFORE parsing
//! - Only `EdDSA` (Ed25519) is accepted by the validator built on these helpers
//! - Error messages are generic; details go to debug logs only

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Maximum allowed JWT size in bytes (8KB).
///
/// Typical user tokens are well under 1KB. Anything larger is rejected
/// before base64 decoding or signature verification.
pub const MAX_JWT_SIZE_BYTES: usize = 8192;

/// Default JWT clock skew tolerance (5 minutes).
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(300);

/// Maximum configurable clock skew tolerance (10 minutes).
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(600);

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur during JWT validation.
///
/// All variants render the same message so callers cannot probe which check
/// failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtValidationError {
    /// Token size exceeds maximum allowed.
    #[error("The access token is invalid or expired")]
    TokenTooLarge,

    /// Token is not a three-part JWT.
    #[error("The access token is invalid or expired")]
    MalformedToken,

    /// Token `iat` claim is too far in the future.
    #[error("The access token is invalid or expired")]
    IatTooFarInFuture,
}

// =============================================================================
// Claims
// =============================================================================

/// Claims carried by an end-user access token.
///
/// - `sub`: user id (redacted in `Debug`)
/// - `orgs`: organizations the user belongs to
/// - `scope`: space-separated permissions such as `rooms:host`
/// - `name`: optional display name hint
#[derive(Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// Subject (user id) - redacted in Debug output.
    pub sub: String,

    /// Expiration timestamp (Unix epoch seconds).
    pub exp: i64,

    /// Issued-at timestamp (Unix epoch seconds).
    pub iat: i64,

    /// Space-separated permissions granted to this token.
    #[serde(default)]
    pub scope: String,

    /// Organization memberships.
    #[serde(default)]
    pub orgs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl fmt::Debug for UserClaims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClaims")
            .field("sub", &"[REDACTED]")
            .field("exp", &self.exp)
            .field("iat", &self.iat)
            .field("scope", &self.scope)
            .field("orgs", &self.orgs.len())
            .field("name", &self.name)
            .finish()
    }
}

impl UserClaims {
    /// Check if the token grants a specific permission.
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scope.split_whitespace().any(|s| s == scope)
    }

    /// All permissions as owned strings.
    #[must_use]
    pub fn scopes(&self) -> Vec<String> {
        self.scope.split_whitespace().map(ToString::to_string).collect()
    }

    /// Whether the token lists `org_id` among its memberships.
    #[must_use]
    pub fn is_member_of(&self, org_id: &str) -> bool {
        self.orgs.iter().any(|o| o == org_id)
    }
}

// =============================================================================
// Functions
// =============================================================================

/// Reject tokens that are oversized or not shaped like a JWT.
///
/// Runs before any decoding work.
///
/// # Errors
///
/// - `TokenTooLarge` if the token exceeds [`MAX_JWT_SIZE_BYTES`]
/// - `MalformedToken` if it does not have exactly three non-empty parts
pub fn check_token_shape(token: &str) -> Result<(), JwtValidationError> {
    if token.len() > MAX_JWT_SIZE_BYTES {
        tracing::debug!(
            target: "common.jwt",
            token_size = token.len(),
            max_size = MAX_JWT_SIZE_BYTES,
            "Token rejected: size exceeds maximum allowed"
        );
        return Err(JwtValidationError::TokenTooLarge);
    }

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        tracing::debug!(
            target: "common.jwt",
            parts = parts.len(),
            "Token rejected: invalid JWT format"
        );
        return Err(JwtValidationError::MalformedToken);
    }

    Ok(())
}

/// Validate the `iat` (issued-at) claim with clock skew tolerance.
///
/// # Errors
///
/// Returns `IatTooFarInFuture` when `iat` is more than `clock_skew` ahead of now.
pub fn validate_iat(iat: i64, clock_skew: Duration) -> Result<(), JwtValidationError> {
    validate_iat_at(iat, clock_skew, chrono::Utc::now().timestamp())
}

pub(crate) fn validate_iat_at(
    iat: i64,
    clock_skew: Duration,
    now: i64,
) -> Result<(), JwtValidationError> {
    let skew = clock_skew.min(MAX_CLOCK_SKEW);
    // Bounded by MAX_CLOCK_SKEW (600 seconds)
    #[allow(clippy::cast_possible_wrap)]
    let max_iat = now + skew.as_secs() as i64;

    if iat > max_iat {
        tracing::debug!(
            target: "common.jwt",
            iat = iat,
            now = now,
            max_allowed = max_iat,
            "Token rejected: iat too far in the future"
        );
        return Err(JwtValidationError::IatTooFarInFuture);
    }

    Ok(())
}

/// Decode an Ed25519 public key from PEM format.
///
/// Strips header/footer lines and base64-decodes the rest. The result feeds
/// `jsonwebtoken::DecodingKey::from_ed_der`.
///
/// # Errors
///
/// Returns `base64::DecodeError` if the body is not valid base64.
pub fn decode_ed25519_public_key_pem(pem: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let b64: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("-----"))
        .collect();

    base64::engine::general_purpose::STANDARD.decode(b64)
}
