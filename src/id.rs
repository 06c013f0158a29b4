//! 160-bit identifier space and the XOR metric.
//!
//! Identifiers are stored big-endian so the derived ordering matches the
//! numeric ordering of the underlying unsigned integer. Bit helpers use
//! little-endian numbering: bit `0` is the least significant bit.

use std::fmt;
use std::str::FromStr;

use iroh_blake3::Hasher;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IdError;

/// Width of an identifier in bytes.
pub const ID_LEN: usize = 20;

/// Width of an identifier in bits.
pub const ID_BITS: usize = ID_LEN * 8;

/// A 160-bit unsigned identifier used for both node ids and stored keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Identifier([u8; ID_LEN]);

impl Identifier {
    /// The all-zero identifier.
    pub const ZERO: Identifier = Identifier([0u8; ID_LEN]);

    /// The largest representable identifier (`2^160 - 1`).
    pub const MAX: Identifier = Identifier([0xffu8; ID_LEN]);

    /// Build an identifier from exactly [`ID_LEN`] big-endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        let raw: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| IdError::InvalidIdentifier { len: bytes.len() })?;
        Ok(Self(raw))
    }

    /// Wrap a fixed-size array without validation.
    pub const fn from_array(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Deterministically hash arbitrary data into the identifier space.
    ///
    /// The identifier is the leading 160 bits of the BLAKE3 digest.
    ///
    /// ```
    /// use kadshare::Identifier;
    ///
    /// let a = Identifier::hash(b"report.pdf");
    /// assert_eq!(a, Identifier::hash(b"report.pdf"));
    /// assert_ne!(a, Identifier::hash(b"report.txt"));
    /// ```
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&digest.as_bytes()[..ID_LEN]);
        Self(out)
    }

    /// Hash a string key (file names, machine ids) into the space.
    pub fn from_key(key: &str) -> Self {
        Self::hash(key.as_bytes())
    }

    /// A uniformly random identifier.
    pub fn random() -> Self {
        let mut out = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut out);
        Self(out)
    }

    /// Raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// XOR distance to `other`, itself an identifier-sized unsigned value.
    ///
    /// # Properties
    /// - `a.distance(&a) == Identifier::ZERO`
    /// - `a.distance(&b) == b.distance(&a)`
    pub fn distance(&self, other: &Identifier) -> Identifier {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Identifier(out)
    }

    /// Value of bit `index` (0 = least significant).
    ///
    /// # Panics
    /// If `index >= ID_BITS`.
    pub fn bit(&self, index: usize) -> bool {
        let (byte, mask) = Self::locate(index);
        self.0[byte] & mask != 0
    }

    /// Set bit `index` (0 = least significant).
    ///
    /// # Panics
    /// If `index >= ID_BITS`.
    pub fn set_bit(&mut self, index: usize) {
        let (byte, mask) = Self::locate(index);
        self.0[byte] |= mask;
    }

    /// Clear bit `index` (0 = least significant).
    ///
    /// # Panics
    /// If `index >= ID_BITS`.
    pub fn clear_bit(&mut self, index: usize) {
        let (byte, mask) = Self::locate(index);
        self.0[byte] &= !mask;
    }

    fn locate(index: usize) -> (usize, u8) {
        assert!(index < ID_BITS, "bit index {index} out of range");
        (ID_LEN - 1 - index / 8, 1u8 << (index % 8))
    }

    /// Number of leading (most significant) bits shared with `other`.
    pub fn shared_prefix_len(&self, other: &Identifier) -> usize {
        let dist = self.distance(other);
        for (byte_idx, byte) in dist.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// Add `2^power` to this identifier, returning `None` on overflow past `2^160 - 1`.
    fn checked_add_pow2(&self, power: usize) -> Option<Identifier> {
        if power >= ID_BITS {
            return None;
        }
        let mut out = self.0;
        let mut byte = ID_LEN - 1 - power / 8;
        let mut carry = 1u16 << (power % 8);
        loop {
            let sum = out[byte] as u16 + carry;
            out[byte] = (sum & 0xff) as u8;
            carry = sum >> 8;
            if carry == 0 {
                return Some(Identifier(out));
            }
            if byte == 0 {
                return None;
            }
            byte -= 1;
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", &hex::encode(self.0)[..8])
    }
}

impl FromStr for Identifier {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex(s.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Identifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Identifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bucket Ranges
// ─────────────────────────────────────────────────────────────────────────────

/// A half-open range `[low, high)` of the identifier space.
///
/// Ranges only ever come from halving the full space, so each one is the set
/// of identifiers sharing the first `prefix_len` bits of `low`. The upper
/// bound of the topmost range is `2^160`, which has no [`Identifier`]
/// representation; [`BucketRange::high`] reports it as `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketRange {
    low: Identifier,
    prefix_len: usize,
}

impl BucketRange {
    /// The range covering the whole identifier space.
    pub fn full() -> Self {
        Self {
            low: Identifier::ZERO,
            prefix_len: 0,
        }
    }

    /// Inclusive lower bound.
    pub fn low(&self) -> Identifier {
        self.low
    }

    /// Exclusive upper bound, `None` when it is `2^160`.
    pub fn high(&self) -> Option<Identifier> {
        self.low.checked_add_pow2(ID_BITS - self.prefix_len)
    }

    /// Number of fixed leading bits.
    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    /// `low <= id < high`.
    pub fn contains(&self, id: &Identifier) -> bool {
        self.low.shared_prefix_len(id) >= self.prefix_len
    }

    /// The midpoint `(low + high) / 2`, `None` for a single-identifier range.
    pub fn midpoint(&self) -> Option<Identifier> {
        if self.prefix_len >= ID_BITS {
            return None;
        }
        let mut mid = self.low;
        mid.set_bit(ID_BITS - 1 - self.prefix_len);
        Some(mid)
    }

    /// Halve the range at its midpoint: `([low, mid), [mid, high))`.
    pub fn split(&self) -> Option<(BucketRange, BucketRange)> {
        let mid = self.midpoint()?;
        let lower = BucketRange {
            low: self.low,
            prefix_len: self.prefix_len + 1,
        };
        let upper = BucketRange {
            low: mid,
            prefix_len: self.prefix_len + 1,
        };
        Some((lower, upper))
    }

    /// A uniformly random identifier inside the range.
    ///
    /// The fixed prefix is copied from `low`; every bit after it is random.
    pub fn random_id(&self) -> Identifier {
        let mut out = Identifier::random();
        for msb_index in 0..self.prefix_len {
            let bit = ID_BITS - 1 - msb_index;
            if self.low.bit(bit) {
                out.set_bit(bit);
            } else {
                out.clear_bit(bit);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(byte: u8) -> Identifier {
        let mut raw = [0u8; ID_LEN];
        raw[0] = byte;
        Identifier::from_array(raw)
    }

    #[test]
    fn from_bytes_rejects_wrong_length() {
        assert!(Identifier::from_bytes(&[0u8; 19]).is_err());
        assert!(Identifier::from_bytes(&[0u8; 32]).is_err());
        assert!(Identifier::from_bytes(&[7u8; 20]).is_ok());
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let a = Identifier::hash(b"alpha");
        let b = Identifier::hash(b"beta");
        assert_eq!(a.distance(&b), b.distance(&a));
        assert_eq!(a.distance(&a), Identifier::ZERO);
    }

    #[test]
    fn bits_use_little_endian_numbering() {
        let mut id = Identifier::ZERO;
        id.set_bit(0);
        assert_eq!(id.as_bytes()[ID_LEN - 1], 1);
        id.set_bit(159);
        assert_eq!(id.as_bytes()[0], 0x80);
        assert!(id.bit(159));
        id.clear_bit(159);
        assert!(!id.bit(159));
        assert!(id.bit(0));
    }

    #[test]
    fn ordering_matches_numeric_value() {
        let small = id_with_first_byte(0x01);
        let mut big_low = Identifier::ZERO;
        big_low.set_bit(0);
        assert!(big_low < small);
        assert!(small < Identifier::MAX);
    }

    #[test]
    fn hex_round_trip_through_string() {
        let id = Identifier::random();
        let parsed: Identifier = id.to_string().parse().expect("valid hex");
        assert_eq!(parsed, id);
        assert!("zz".parse::<Identifier>().is_err());
    }

    #[test]
    fn full_range_has_unbounded_high() {
        let full = BucketRange::full();
        assert_eq!(full.low(), Identifier::ZERO);
        assert_eq!(full.high(), None);
        assert!(full.contains(&Identifier::MAX));
    }

    #[test]
    fn split_halves_range_at_midpoint() {
        let (lower, upper) = BucketRange::full().split().expect("splittable");
        assert_eq!(lower.high(), Some(id_with_first_byte(0x80)));
        assert_eq!(upper.low(), id_with_first_byte(0x80));
        assert_eq!(upper.high(), None);
        assert!(lower.contains(&id_with_first_byte(0x7f)));
        assert!(!lower.contains(&id_with_first_byte(0x80)));
        assert!(upper.contains(&id_with_first_byte(0x80)));

        let (ll, lu) = lower.split().expect("splittable");
        assert_eq!(ll.high(), Some(id_with_first_byte(0x40)));
        assert_eq!(lu.low(), id_with_first_byte(0x40));
        assert_eq!(lu.high(), Some(id_with_first_byte(0x80)));
    }

    #[test]
    fn random_id_stays_inside_range() {
        let (_, upper) = BucketRange::full().split().expect("splittable");
        let (upper_lower, _) = upper.split().expect("splittable");
        for _ in 0..64 {
            let id = upper_lower.random_id();
            assert!(upper_lower.contains(&id));
            assert!(id >= upper_lower.low());
            assert!(id < upper_lower.high().expect("bounded"));
        }
    }

    #[test]
    fn shared_prefix_counts_leading_bits() {
        let a = id_with_first_byte(0b1010_0000);
        let b = id_with_first_byte(0b1011_0000);
        assert_eq!(a.shared_prefix_len(&b), 3);
        assert_eq!(a.shared_prefix_len(&a), ID_BITS);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn bit_index_past_width_panics() {
        Identifier::ZERO.bit(ID_BITS);
    }
}
