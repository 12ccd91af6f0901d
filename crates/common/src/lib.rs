//! Common utilities and types shared across the SFU crates.

#![warn(clippy::pedantic)]

/// Module for shared media and room vocabulary
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;

/// Module for JWT utilities (size limits, user claims, key decoding)
pub mod jwt;
