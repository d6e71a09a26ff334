//! IPv4 prefix value type consumed by the trie.
//!
//! A prefix is stored left-aligned: the high bit of `bits` is the first
//! bit of the address, and everything below position `32 - length` is
//! zero. Left alignment lets the trie branch on a single comparison
//! against [`crate::constants::LEFTMOST_32_BIT`] and consume matched
//! bits with a shift.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use ipnet::IpNet;

use crate::constants::MAX_PREFIX_LENGTH;
use crate::errors::{PrefixError, Result};

/// An IPv4 prefix: up to 32 significant bits plus a length.
///
/// `Ipv4Prefix` is `Copy`; trie operations take it by value and shift a
/// local copy while descending. A zero-length prefix (the `Default`)
/// addresses the root of the trie.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Ipv4Prefix {
    bits: u32,
    length: u8,
}

impl Ipv4Prefix {
    /// Build a prefix from left-aligned bits. Host bits beyond `length`
    /// are masked off so stored prefixes are always canonical.
    pub fn new(bits: u32, length: u8) -> Result<Self> {
        if length > MAX_PREFIX_LENGTH {
            return Err(PrefixError::InvalidLength(length));
        }
        Ok(Self {
            bits: bits & mask(length),
            length,
        })
    }

    /// Build a prefix from an address and a length.
    pub fn from_addr(addr: Ipv4Addr, length: u8) -> Result<Self> {
        Self::new(u32::from(addr), length)
    }

    /// A /32 prefix covering exactly `addr`.
    pub fn host(addr: Ipv4Addr) -> Self {
        Self {
            bits: u32::from(addr),
            length: MAX_PREFIX_LENGTH,
        }
    }

    #[inline]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    #[inline]
    pub fn length(&self) -> u8 {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Consume the leading `n` bits. Caller guarantees `n <= length`.
    #[inline]
    pub(crate) fn shift_left(&mut self, n: u8) {
        debug_assert!(n <= self.length);
        // a shift by the full width must yield zero, not wrap
        self.bits = self.bits.checked_shl(u32::from(n)).unwrap_or(0);
        self.length -= n;
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.bits), self.length)
    }
}

impl From<Ipv4Addr> for Ipv4Prefix {
    fn from(addr: Ipv4Addr) -> Self {
        Self::host(addr)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = PrefixError;

    /// Accepts `"addr/prefix"` or a plain address (treated as /32).
    fn from_str(s: &str) -> Result<Self> {
        match s.parse::<IpNet>() {
            Ok(IpNet::V4(net)) => Self::new(u32::from(net.addr()), net.prefix_len()),
            Ok(IpNet::V6(_)) => Err(PrefixError::Ipv6Unsupported),
            Err(_) => match s.parse::<IpAddr>() {
                Ok(IpAddr::V4(v4)) => Ok(Self::host(v4)),
                Ok(IpAddr::V6(_)) => Err(PrefixError::Ipv6Unsupported),
                Err(_) => Err(PrefixError::Parse(s.to_string())),
            },
        }
    }
}

/// Bitmask selecting the leading `length` bits of a left-aligned prefix.
#[inline]
pub(crate) fn mask(length: u8) -> u32 {
    if length == 0 {
        0
    } else if length >= 32 {
        u32::MAX
    } else {
        !(u32::MAX >> length)
    }
}

/// Concatenate two left-aligned bitfields: `a`'s bits followed by `b`'s.
/// Total length must not exceed 32.
#[inline]
pub fn merge_prefixes(a_bits: u32, a_len: u8, b_bits: u32, b_len: u8) -> (u32, u8) {
    debug_assert!(a_len + b_len <= 32);
    (
        a_bits | b_bits.checked_shr(u32::from(a_len)).unwrap_or(0),
        a_len + b_len,
    )
}
