//! # Identifiers and Node References
//!
//! This module defines the addressing types shared by every other component:
//!
//! - [`Id`]: 160-bit identifier used for nodes and for stored keys alike
//! - [`NodeRef`]: an identifier paired with the transport address that reaches it
//!
//! ## Bit Layout
//!
//! An [`Id`] is 20 bytes in big-endian order. Bit 0 is the least significant
//! bit of the last byte, bit 159 the most significant bit of the first byte.
//! The derived ordering is unsigned lexicographic byte order, so comparing two
//! XOR distances compares them as 160-bit unsigned integers.
//!
//! ## Metric
//!
//! | Operation | Meaning |
//! |-----------|---------|
//! | `a ^ b` | XOR distance, itself an `Id` |
//! | `bitscan()` | 1-based index of the highest set bit, 0 when all-zero |
//! | `bit(n)` | value of bit `n` |
//!
//! `(a ^ b).bitscan()` is the routing bucket that `b` occupies relative to `a`.
//!
//! ## Invariants
//!
//! - `Id::from_bytes(b).as_bytes() == &b`
//! - `a ^ a == Id::zero()`, `a ^ b == b ^ a`
//! - `from_hex(to_hex(a)) == a`

use std::fmt;
use std::ops::{BitXor, BitXorAssign};
use std::str::FromStr;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

const ID_BYTES: usize = 20;

/// 160-bit identifier for nodes and stored keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Id([u8; ID_BYTES]);

impl Id {
    /// Width of an identifier in bits.
    pub const BITS: usize = ID_BYTES * 8;
    /// Width of an identifier in bytes.
    pub const BYTES: usize = ID_BYTES;

    #[inline]
    pub const fn zero() -> Self {
        Self([0u8; Self::BYTES])
    }

    #[inline]
    pub const fn from_bytes(bytes: [u8; Self::BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; Self::BYTES] {
        &self.0
    }

    /// Uniformly random identifier from the operating system RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; Self::BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Deterministic identifier derived from arbitrary content.
    ///
    /// Uses the BLAKE3 extendable output truncated to 160 bits, so equal
    /// inputs always map to the same key.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(data);
        let mut bytes = [0u8; Self::BYTES];
        hasher.finalize_xof().fill(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// XOR distance to `other`.
    #[inline]
    pub fn distance(&self, other: &Id) -> Id {
        *self ^ *other
    }

    /// Value of bit `n`, where bit 0 is the least significant bit.
    ///
    /// # Panics
    /// Panics if `n >= Id::BITS`.
    #[inline]
    pub fn bit(&self, n: usize) -> bool {
        assert!(n < Self::BITS, "bit index {n} out of range");
        self.0[Self::BYTES - 1 - n / 8] & (1 << (n % 8)) != 0
    }

    /// 1-based index of the highest set bit, or 0 for the all-zero id.
    pub fn bitscan(&self) -> usize {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let remaining_bytes = Self::BYTES - 1 - i;
                return remaining_bytes * 8 + (8 - byte.leading_zeros() as usize);
            }
        }
        0
    }

    /// Upper-case, zero-padded 40 digit hex rendering.
    pub fn to_hex(self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parse exactly 40 hex digits (either case).
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        if s.len() != Self::BYTES * 2 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut bytes = [0u8; Self::BYTES];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Overwrite this id with the parsed value of `s`.
    ///
    /// Returns `false` and leaves `self` untouched when `s` is not a valid
    /// 40 digit hex string.
    pub fn assign_hex(&mut self, s: &str) -> bool {
        match Self::from_hex(s) {
            Ok(parsed) => {
                *self = parsed;
                true
            }
            Err(_) => false,
        }
    }
}

impl BitXor for Id {
    type Output = Id;

    fn bitxor(mut self, rhs: Id) -> Id {
        self ^= rhs;
        self
    }
}

impl BitXorAssign for Id {
    fn bitxor_assign(&mut self, rhs: Id) {
        for (byte, other) in self.0.iter_mut().zip(rhs.0.iter()) {
            *byte ^= other;
        }
    }
}

impl FromStr for Id {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; Id::BYTES]> for Id {
    fn from(bytes: [u8; Id::BYTES]) -> Self {
        Self(bytes)
    }
}

impl From<Id> for [u8; Id::BYTES] {
    fn from(id: Id) -> Self {
        id.0
    }
}

/// A reachable peer: its identifier and the transport address serving it.
///
/// The address is opaque to routing and storage; only the transport
/// interprets it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub id: Id,
    pub addr: String,
}

impl NodeRef {
    pub fn new(id: Id, addr: impl Into<String>) -> Self {
        Self { id, addr: addr.into() }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", &self.id.to_hex()[..12], self.addr)
    }
}
