//! Secret wrappers for values that must never reach a log line.
//!
//! Re-exports the [`secrecy`] types used across the workspace. Anything that
//! authenticates a caller or grants access to shared infrastructure belongs
//! in one of these:
//!
//! - the coordination store URL (it may embed a password)
//! - the cluster secret guarding the internal routing endpoint
//! - bearer tokens held while a request is in flight
//!
//! `SecretString` redacts itself in `Debug`, so deriving `Debug` on a struct
//! that holds one stays safe. Reading the value requires an explicit
//! [`ExposeSecret::expose_secret`] call, which makes every access greppable.
//!
//! ```rust
//! use common::secret::{ExposeSecret, SecretString};
//!
//! #[derive(Debug)]
//! struct PeerCredentials {
//!     node_id: String,
//!     cluster_secret: SecretString,
//! }
//!
//! let creds = PeerCredentials {
//!     node_id: "sfu-a".to_string(),
//!     cluster_secret: SecretString::from("s3cr3t"),
//! };
//!
//! assert!(!format!("{creds:?}").contains("s3cr3t"));
//! assert_eq!(creds.cluster_secret.expose_secret(), "s3cr3t");
//! ```

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SecretString::from("redis://:hunter2@store:6379");
        let debug = format!("{secret:?}");

        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_struct_with_secret_is_safe() {
        #[allow(dead_code)]
        #[derive(Debug)]
        struct StoreSettings {
            backend: String,
            url: SecretString,
        }

        let settings = StoreSettings {
            backend: "redis".to_string(),
            url: SecretString::from("redis://:pw@localhost"),
        };

        let debug_str = format!("{settings:?}");
        assert!(debug_str.contains("redis"));
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains(":pw@"));
    }

    #[test]
    fn test_deserialize_and_expose() {
        #[derive(Debug, Deserialize)]
        struct PeerAuth {
            secret: SecretString,
        }

        let auth: PeerAuth = serde_json::from_str(r#"{"secret": "cluster-key"}"#).unwrap();
        assert_eq!(auth.secret.expose_secret(), "cluster-key");
        assert!(!format!("{auth:?}").contains("cluster-key"));
    }
}
