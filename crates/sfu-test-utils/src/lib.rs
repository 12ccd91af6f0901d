//! Test utilities for the SFU node.
//!
//! - [`crypto`]: deterministic Ed25519 keys and a user token builder
//! - [`harness`]: in-process cluster, nodes, and channel-driven clients

pub mod crypto;
pub mod harness;

pub use crypto::{TestKeypair, TokenBuilder};
pub use harness::{receive_capabilities, vp8_params, TestClient, TestCluster, TestSfuNode, TEST_ORG};
