//! Rotating hint derivation
//!
//! Radio packets never carry a plaintext address. Instead the sender puts a
//! 20-bit *hint* on the air, derived from the channel key and the current
//! time bucket. Receivers that know the key can compute the same hint and
//! narrow down which keys to trial-decode with. Hints collide by design and
//! are never treated as unique identifiers.
//!
//! The keystream comes from ChaCha20-Poly1305 keyed by the channel key and
//! nonced by the little-endian bucket number (zero-extended to the 12-byte
//! IETF nonce). Encrypting zeros exposes the keystream, starting at block 1.
//!
//! | bytes | meaning |
//! |-------|---------|
//! | 0..3  | hint |
//! | 3..6  | wake hint |

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::key::ChannelKey;

/// Hints are truncated to 20 bits
pub const HINT_MASK: u32 = 0x000F_FFFF;

/// Bucket width as a power of two in microseconds (2^24 µs ≈ 16.7 s)
pub const TIME_BUCKET_SHIFT: u32 = 24;

/// A 20-bit routing hint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hint(u32);

impl Hint {
    /// Build from a raw value, masking to 20 bits
    pub const fn new(value: u32) -> Self {
        Self(value & HINT_MASK)
    }

    /// Read the 3-byte little-endian wire form
    pub fn from_wire(bytes: [u8; 3]) -> Self {
        Self::new(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
    }

    /// 3-byte little-endian wire form
    pub fn to_wire(self) -> [u8; 3] {
        let b = self.0.to_le_bytes();
        [b[0], b[1], b[2]]
    }

    /// Numeric value
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05x}", self.0)
    }
}

/// One 2^24 µs window of wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeBucket(u32);

impl TimeBucket {
    /// Wrap a bucket number
    pub const fn new(number: u32) -> Self {
        Self(number)
    }

    /// Bucket containing a unix timestamp in microseconds
    pub fn from_unix_micros(micros: i64) -> Self {
        Self((micros.unsigned_abs() >> TIME_BUCKET_SHIFT) as u32)
    }

    /// Neighbouring bucket closest to `micros`: the next one in the upper
    /// half of the current window, the previous one in the lower half.
    pub fn nearest_alternate(micros: i64) -> Self {
        let current = Self::from_unix_micros(micros);
        let half = 1u64 << (TIME_BUCKET_SHIFT - 1);
        if micros.unsigned_abs() & half != 0 {
            current.next()
        } else {
            Self(current.0.wrapping_sub(1))
        }
    }

    /// Following bucket
    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Bucket number
    pub const fn number(self) -> u32 {
        self.0
    }

    fn nonce(self) -> [u8; 8] {
        u64::from(self.0).to_le_bytes()
    }
}

/// Every hint a key produces around one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintSet {
    /// Hint for the current bucket
    pub hint: Hint,
    /// Hint for the nearest alternate bucket
    pub alt_hint: Hint,
    /// Time-independent hint used for first-contact registration
    pub fixed_hint: Hint,
    /// Wake hint for the current bucket
    pub wake_hint: Hint,
    /// Wake hint for the nearest alternate bucket
    pub alt_wake_hint: Hint,
}

impl HintSet {
    /// The hints that route inbound data (wake hints excluded)
    pub fn routing_hints(&self) -> [Hint; 3] {
        [self.hint, self.alt_hint, self.fixed_hint]
    }
}

fn keystream(key: &ChannelKey, nonce8: [u8; 8], out: &mut [u8]) {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&nonce8);
    out.fill(0);
    // Only fails past the cipher's per-message length limit.
    let _ = cipher.encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", out);
}

fn hint_from(bytes: &[u8]) -> Hint {
    Hint::from_wire([bytes[0], bytes[1], bytes[2]])
}

/// Hint and wake hint of `key` for one bucket
pub fn derive_hint(key: &ChannelKey, bucket: TimeBucket) -> (Hint, Hint) {
    let mut stream = [0u8; 6];
    keystream(key, bucket.nonce(), &mut stream);
    (hint_from(&stream[0..3]), hint_from(&stream[3..6]))
}

/// Time-independent registration hint (all-zero nonce)
pub fn fixed_hint(key: &ChannelKey) -> Hint {
    let mut stream = [0u8; 3];
    keystream(key, [0u8; 8], &mut stream);
    hint_from(&stream)
}

/// Full hint set for `key` at a unix timestamp in microseconds
pub fn derive_hints(key: &ChannelKey, unix_micros: i64) -> HintSet {
    let (hint, wake_hint) = derive_hint(key, TimeBucket::from_unix_micros(unix_micros));
    let (alt_hint, alt_wake_hint) = derive_hint(key, TimeBucket::nearest_alternate(unix_micros));
    HintSet {
        hint,
        alt_hint,
        fixed_hint: fixed_hint(key),
        wake_hint,
        alt_wake_hint,
    }
}

/// Current wall-clock time in unix microseconds
pub fn unix_micros_now() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hint_wire_masks_to_20_bits() {
        let hint = Hint::from_wire([0xff, 0xff, 0xff]);
        assert_eq!(hint.value(), HINT_MASK);
        assert_eq!(Hint::new(0x12345).to_wire(), [0x45, 0x23, 0x01]);
    }

    #[test]
    fn test_derive_hint_is_stable() {
        let key = ChannelKey::new([7u8; 32]);
        let bucket = TimeBucket::new(104_729);
        assert_eq!(derive_hint(&key, bucket), derive_hint(&key, bucket));
        assert_eq!(fixed_hint(&key), fixed_hint(&key));
    }

    #[test]
    fn test_next_bucket_changes_hint() {
        // Over many keys, a 20-bit collision between adjacent buckets should
        // essentially never happen more than once.
        let mut same = 0;
        for i in 0..64u8 {
            let key = ChannelKey::new([i; 32]);
            let bucket = TimeBucket::new(90_000 + u32::from(i));
            if derive_hint(&key, bucket).0 == derive_hint(&key, bucket.next()).0 {
                same += 1;
            }
        }
        assert!(same <= 1);
    }

    #[test]
    fn test_different_keys_different_hints() {
        let a = ChannelKey::new([1u8; 32]);
        let b = ChannelKey::new([2u8; 32]);
        let bucket = TimeBucket::new(5);
        assert_ne!(derive_hint(&a, bucket), derive_hint(&b, bucket));
    }

    #[test]
    fn test_nearest_alternate_bucket() {
        let base: i64 = 100 << TIME_BUCKET_SHIFT;
        // lower half -> previous bucket
        assert_eq!(TimeBucket::nearest_alternate(base + 10).number(), 99);
        // upper half -> next bucket
        let upper = base + (1 << (TIME_BUCKET_SHIFT - 1)) + 10;
        assert_eq!(TimeBucket::from_unix_micros(upper).number(), 100);
        assert_eq!(TimeBucket::nearest_alternate(upper).number(), 101);
    }

    #[test]
    fn test_hint_set_uses_current_and_alternate() {
        let key = ChannelKey::new([9u8; 32]);
        let micros: i64 = (2000 << TIME_BUCKET_SHIFT) + 5;
        let set = derive_hints(&key, micros);
        assert_eq!(set.hint, derive_hint(&key, TimeBucket::new(2000)).0);
        assert_eq!(set.wake_hint, derive_hint(&key, TimeBucket::new(2000)).1);
        assert_eq!(set.alt_hint, derive_hint(&key, TimeBucket::new(1999)).0);
        assert_eq!(set.fixed_hint, fixed_hint(&key));
        assert_eq!(set.routing_hints(), [set.hint, set.alt_hint, set.fixed_hint]);
    }

    #[test]
    fn test_zero_bucket_hint_matches_fixed_hint() {
        // Bucket zero uses the all-zero nonce, same as the fixed hint.
        let key = ChannelKey::new([3u8; 32]);
        assert_eq!(derive_hint(&key, TimeBucket::new(0)).0, fixed_hint(&key));
    }
}
