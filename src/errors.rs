//! Error types for prefix parsing and construction.
//!
//! Trie operations themselves are infallible: a lookup that finds nothing
//! is a normal empty result, and a structurally impossible state is a bug
//! in the trie, reported by panicking rather than by an error value.

use thiserror::Error;

/// Result type alias using PrefixError.
pub type Result<T> = std::result::Result<T, PrefixError>;

/// Errors that can occur while building an [`crate::Ipv4Prefix`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PrefixError {
    #[error("prefix length {0} exceeds 32 bits")]
    InvalidLength(u8),

    #[error("IPv6 addresses are not supported")]
    Ipv6Unsupported,

    #[error("unparsable IPv4 prefix: {0}")]
    Parse(String),
}
