//! Deterministic Ed25519 fixtures and user token builder.
//!
//! The same seed always produces the same keypair, so tokens signed in one
//! test can be verified by a gateway configured in another.

use base64::engine::general_purpose;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde_json::json;

/// A deterministic signing keypair.
#[derive(Clone)]
pub struct TestKeypair {
    public_key_pem: String,
    pkcs8: Vec<u8>,
}

impl TestKeypair {
    /// Keypair derived from `seed`.
    ///
    /// # Panics
    ///
    /// Never in practice; ring accepts every 32-byte seed.
    #[must_use]
    pub fn new(seed: u8) -> Self {
        let mut seed_bytes = [0u8; 32];
        for (i, byte) in seed_bytes.iter_mut().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let i = i as u8;
            *byte = seed.wrapping_mul(i.wrapping_add(1)).wrapping_add(i);
        }

        let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed_bytes)
            .expect("32-byte seed is always accepted");
        let public_key_b64 = general_purpose::STANDARD.encode(key_pair.public_key().as_ref());

        Self {
            public_key_pem: format!(
                "-----BEGIN PUBLIC KEY-----\n{public_key_b64}\n-----END PUBLIC KEY-----"
            ),
            pkcs8: build_pkcs8_from_seed(&seed_bytes),
        }
    }

    /// Public key in the PEM form expected by `AUTH_PUBLIC_KEY_PEM`.
    #[must_use]
    pub fn public_key_pem(&self) -> String {
        self.public_key_pem.clone()
    }

    #[must_use]
    pub fn pkcs8(&self) -> &[u8] {
        &self.pkcs8
    }
}

/// PKCS#8 v1 document wrapping an Ed25519 seed.
fn build_pkcs8_from_seed(seed: &[u8; 32]) -> Vec<u8> {
    let mut pkcs8 = Vec::with_capacity(48);
    // SEQUENCE, 46 bytes
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    // version INTEGER 0
    pkcs8.extend_from_slice(&[0x02, 0x01, 0x00]);
    // AlgorithmIdentifier { OID 1.3.101.112 }
    pkcs8.extend_from_slice(&[0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70]);
    // privateKey OCTET STRING { OCTET STRING seed }
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(seed);
    pkcs8
}

/// Builder for signed user tokens.
///
/// ```rust,ignore
/// let token = TokenBuilder::new("alice")
///     .scope("rooms:host")
///     .org("org-1")
///     .sign(&TestKeypair::new(1));
/// ```
pub struct TokenBuilder {
    sub: String,
    scope: String,
    orgs: Vec<String>,
    name: Option<String>,
    exp_offset: i64,
    iat_offset: i64,
}

impl TokenBuilder {
    #[must_use]
    pub fn new(user_id: &str) -> Self {
        Self {
            sub: user_id.to_string(),
            scope: String::new(),
            orgs: Vec::new(),
            name: None,
            exp_offset: 3600,
            iat_offset: 0,
        }
    }

    /// Space-separated permissions.
    #[must_use]
    pub fn scope(mut self, scope: &str) -> Self {
        self.scope = scope.to_string();
        self
    }

    #[must_use]
    pub fn org(mut self, org_id: &str) -> Self {
        self.orgs.push(org_id.to_string());
        self
    }

    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Expiry relative to now, in seconds. Negative values make expired tokens.
    #[must_use]
    pub fn expires_in(mut self, seconds: i64) -> Self {
        self.exp_offset = seconds;
        self
    }

    /// Issued-at relative to now, in seconds.
    #[must_use]
    pub fn issued_in(mut self, seconds: i64) -> Self {
        self.iat_offset = seconds;
        self
    }

    /// Sign with EdDSA.
    ///
    /// # Panics
    ///
    /// If the fixture key cannot be loaded.
    #[must_use]
    pub fn sign(self, keypair: &TestKeypair) -> String {
        let now = Utc::now().timestamp();
        let mut claims = json!({
            "sub": self.sub,
            "exp": now + self.exp_offset,
            "iat": now + self.iat_offset,
            "scope": self.scope,
            "orgs": self.orgs,
        });
        if let (Some(name), Some(obj)) = (self.name, claims.as_object_mut()) {
            obj.insert("name".to_string(), json!(name));
        }

        let key = EncodingKey::from_ed_der(keypair.pkcs8());
        encode(&Header::new(Algorithm::EdDSA), &claims, &key).expect("fixture key signs")
    }
}
