//! Content fingerprinting for cache addressing.
//!
//! A [`Fingerprint`] is the SHA-256 digest (lowercase hex) of an item's
//! normalized title and body joined by the ASCII unit separator `U+001F`.
//! Normalization trims, lowercases and collapses every whitespace run to a
//! single space, so items that differ only in casing or spacing share a
//! fingerprint and a cached classification.
//!
//! # Example
//!
//! ```rust
//! use prism_core::fingerprint::fingerprint;
//!
//! let a = fingerprint("Buy milk", "before  Friday");
//! let b = fingerprint("  buy MILK ", "before friday");
//! assert_eq!(a, b);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SEPARATOR: char = '\u{001F}';

/// Hex-encoded SHA-256 digest of normalized item content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log fields.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim, lowercase and collapse whitespace runs to one ASCII space.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compute the fingerprint of a title/body pair.
pub fn fingerprint(title: &str, body: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(normalize(title).as_bytes());
    let mut sep = [0u8; 4];
    hasher.update(SEPARATOR.encode_utf8(&mut sep).as_bytes());
    hasher.update(normalize(body).as_bytes());
    Fingerprint(format!("{:x}", hasher.finalize()))
}
