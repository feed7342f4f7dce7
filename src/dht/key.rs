use std::fmt;
use std::ops::Add;
use std::ops::Neg;
use std::ops::Sub;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::de;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use sha2::Digest;
use sha2::Sha256;

use crate::consts::RING_BITS;
use crate::error::Error;
use crate::error::Result;

/// Key is a value in a finite ring R(P) where P = 2^256.
/// All peers and stored values live on the same ring, in the order of Key.
#[derive(Clone, Eq, Ord, PartialEq, PartialOrd, Debug, Hash, Default)]
pub struct Key(BigUint);

fn ring_size() -> BigUint {
    BigUint::from(1u8) << RING_BITS
}

impl Key {
    /// The zero key.
    pub fn zero() -> Self {
        Self(BigUint::default())
    }

    /// The largest key on the ring, 2^256 - 1.
    pub fn max() -> Self {
        Self(ring_size() - 1u8)
    }

    /// 2^exp reduced into the ring.
    pub fn two_pow(exp: usize) -> Self {
        Self::from(BigUint::from(1u8) << exp)
    }

    /// Derive a key from plaintext with a fixed hash. Every peer must use
    /// the same function or lookups will disagree about key placement.
    pub fn hash(plaintext: &str) -> Self {
        let digest = Sha256::digest(plaintext.as_bytes());
        Self(BigUint::from_bytes_be(&digest))
    }

    /// Parse a key from lower-case hex. An odd number of digits is padded
    /// on the left, matching [`Key::to_hex`] output.
    pub fn from_hex(s: &str) -> Result<Self> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let padded = if s.len() % 2 == 1 {
            format!("0{}", s)
        } else {
            s.to_string()
        };
        let bytes = hex::decode(padded).map_err(Error::KeyParse)?;
        Ok(Self::from(BigUint::from_bytes_be(&bytes)))
    }

    /// Canonical lower-case hex form without leading zeros.
    pub fn to_hex(&self) -> String {
        format!("{:x}", self.0)
    }

    /// Is this key on the clockwise arc from `lo` to `hi`?
    /// The ring wraps through zero when `lo > hi`. When `lo == hi` only the
    /// key equal to both bounds qualifies, regardless of `inclusive`.
    pub fn in_between(&self, lo: &Key, hi: &Key, inclusive: bool) -> bool {
        if lo == hi {
            return self == lo;
        }

        if lo < hi {
            if inclusive {
                lo <= self && self <= hi
            } else {
                lo < self && self < hi
            }
        } else {
            // The arc [lo, hi] wrapping through zero is the complement of
            // the non-wrapping arc between hi and lo.
            if inclusive {
                !(hi < self && self < lo)
            } else {
                !(hi <= self && self <= lo)
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<BigUint> for Key {
    fn from(v: BigUint) -> Self {
        Self(v % ring_size())
    }
}

impl From<&Key> for BigUint {
    fn from(key: &Key) -> BigUint {
        key.0.clone()
    }
}

impl From<Key> for BigUint {
    fn from(key: Key) -> BigUint {
        key.0
    }
}

impl From<u64> for Key {
    fn from(v: u64) -> Self {
        Self::from(BigUint::from(v))
    }
}

impl FromStr for Key {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Neg for Key {
    type Output = Self;
    fn neg(self) -> Self {
        Self::from(ring_size() - self.0)
    }
}

impl Neg for &Key {
    type Output = Key;
    fn neg(self) -> Key {
        self.clone().neg()
    }
}

impl Add for Key {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::from(self.0 + rhs.0)
    }
}

impl Add<&Key> for &Key {
    type Output = Key;
    fn add(self, rhs: &Key) -> Key {
        self.clone() + rhs.clone()
    }
}

impl Add<u64> for &Key {
    type Output = Key;
    fn add(self, rhs: u64) -> Key {
        self.clone() + Key::from(rhs)
    }
}

impl Sub for Key {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        self + (-rhs)
    }
}

impl Sub<&Key> for &Key {
    type Output = Key;
    fn sub(self, rhs: &Key) -> Key {
        self.clone() - rhs.clone()
    }
}

impl Sub<u64> for &Key {
    type Output = Key;
    fn sub(self, rhs: u64) -> Key {
        self.clone() - Key::from(rhs)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Key::from_hex(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        let key = Key::hash("some plaintext");
        let parsed = Key::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key, parsed);

        assert_eq!(Key::from_hex("0").unwrap(), Key::zero());
        assert_eq!(Key::from_hex("ff").unwrap(), Key::from(255u64));
        assert!(Key::from_hex("xyz").is_err());
    }

    #[test]
    fn test_hashing_is_deterministic() {
        assert_eq!(Key::hash("127.0.0.1:4000"), Key::hash("127.0.0.1:4000"));
        assert_ne!(Key::hash("127.0.0.1:4000"), Key::hash("127.0.0.1:4001"));
    }

    #[test]
    fn test_finite_ring_arithmetic() {
        let zero = Key::zero();
        let one = Key::from(1u64);
        let a = Key::hash("a");

        assert_eq!(-a.clone() + a.clone(), zero);
        assert_eq!(-(-a.clone()), a);

        // The ring wraps: MAX + 1 == 0 and 0 - 1 == MAX.
        assert_eq!(Key::max() + one.clone(), zero);
        assert_eq!(&zero - 1u64, Key::max());
        assert_eq!(Key::from(BigUint::from(1u8) << RING_BITS), zero);
    }

    #[test]
    fn test_in_between_simple() {
        let k = |v: u64| Key::from(v);

        assert!(k(50).in_between(&k(25), &k(75), true));
        assert!(!k(50).in_between(&k(75), &k(25), true));
        assert!(k(25).in_between(&k(25), &k(75), true));
        assert!(!k(25).in_between(&k(25), &k(75), false));
        assert!(k(75).in_between(&k(25), &k(75), true));
        assert!(!k(75).in_between(&k(25), &k(75), false));
    }

    #[test]
    fn test_in_between_wrap_around() {
        let k = |v: u64| Key::from(v);

        // Arcs that wrap through zero.
        assert!(k(1).in_between(&k(75), &k(25), true));
        assert!(!k(25).in_between(&k(75), &k(25), false));
        assert!(!k(99).in_between(&k(0), &k(99), false));
        assert!(k(99).in_between(&k(0), &k(99), true));
        assert!(Key::max().in_between(&k(75), &k(25), true));
        assert!(!k(50).in_between(&k(75), &k(25), true));

        // Degenerate arc: only the bound itself qualifies.
        assert!(k(7).in_between(&k(7), &k(7), false));
        assert!(!k(8).in_between(&k(7), &k(7), true));
    }

    #[test]
    fn test_in_between_translation_invariant() {
        // in_between(k, a, b) == in_between(k - x, a - x, b - x)
        let keys = [
            Key::hash("k1"),
            Key::hash("k2"),
            Key::from(3u64),
            Key::max(),
        ];
        let offsets = [Key::from(1u64), Key::hash("offset"), Key::max()];

        for k in &keys {
            for a in &keys {
                for b in &keys {
                    for x in &offsets {
                        for inclusive in [true, false] {
                            assert_eq!(
                                k.in_between(a, b, inclusive),
                                (k - x).in_between(&(a - x), &(b - x), inclusive),
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_serde_as_hex() {
        let key = Key::hash("serde");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.to_hex()));
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }
}
