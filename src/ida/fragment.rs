//! One share of an erasure-coded value.

use std::cmp::Ordering;
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;

use crate::error::Error;
use crate::error::Result;

/// Alphabet of the fixed-width base-64 wire encoding.
const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Digits required to represent any value in `[0, p)` in base 64.
pub fn digits_per_value(p: i64) -> usize {
    let mut digits = 1;
    let mut capacity = 64i64;
    while capacity < p {
        capacity *= 64;
        digits += 1;
    }
    digits
}

/// Encode values into fixed-width base-64, left-padded per value.
pub fn encode_base64(values: &[i64], digits: usize) -> Result<String> {
    let capacity = 64i64.pow(digits as u32);
    let mut out = String::with_capacity(values.len() * digits);
    for &value in values {
        if value < 0 || value >= capacity {
            return Err(Error::Codec(format!(
                "value {} exceeds the {}-digit encoding width",
                value, digits
            )));
        }
        let mut remainder = value;
        for i in (0..digits).rev() {
            let unit = 64i64.pow(i as u32);
            out.push(BASE64_ALPHABET[(remainder / unit) as usize] as char);
            remainder %= unit;
        }
    }
    Ok(out)
}

/// Decode a fixed-width base-64 string back into values.
pub fn decode_base64(encoded: &str, digits: usize) -> Result<Vec<i64>> {
    let bytes = encoded.as_bytes();
    if bytes.len() % digits != 0 {
        return Err(Error::Codec(format!(
            "encoded length {} is not a multiple of the digit width {}",
            bytes.len(),
            digits
        )));
    }

    let digit_of = |b: u8| -> Result<i64> {
        BASE64_ALPHABET
            .iter()
            .position(|&c| c == b)
            .map(|i| i as i64)
            .ok_or_else(|| Error::Codec(format!("invalid base-64 character {:?}", b as char)))
    };

    let mut values = Vec::with_capacity(bytes.len() / digits);
    for chunk in bytes.chunks(digits) {
        let mut value = 0i64;
        for &b in chunk {
            value = value * 64 + digit_of(b)?;
        }
        values.push(value);
    }
    Ok(values)
}

/// One of the `n` shares a value is dispersed into. Any `m` distinct
/// fragments reconstruct the value; the fragment carries its codec
/// parameters so a reader needs no out-of-band state.
#[derive(Debug, Clone)]
pub struct Fragment {
    /// 1-based row index in the encoding matrix.
    pub index: usize,
    /// Inner products of the encoding row with each segment, mod `p`.
    pub values: Vec<i64>,
    /// Total number of fragments produced for the value.
    pub n: usize,
    /// Fragments required to reconstruct the value.
    pub m: usize,
    /// Prime modulus of the codec arithmetic.
    pub p: i64,
}

impl Fragment {
    /// Write the fragment to a file in its JSON wire form.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_vec(self).map_err(Error::Serialize)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a fragment back from a file written by
    /// [`Fragment::write_to_file`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(Error::Deserialize)
    }
}

impl PartialEq for Fragment {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.values == other.values
    }
}

impl Eq for Fragment {}

impl PartialOrd for Fragment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Fragment {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

impl std::fmt::Display for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let values: Vec<String> = self.values.iter().map(|v| v.to_string()).collect();
        write!(
            f,
            "{} {} {} {}:{}",
            self.n,
            self.m,
            self.p,
            self.index,
            values.join(" ")
        )
    }
}

impl FromStr for Fragment {
    type Err = Error;

    /// Parse the plain-text form produced by `Display`:
    /// `"n m p index:v0 v1 ..."`.
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::Codec(format!("malformed fragment text {:?}", s));

        let (prefix, values) = s.split_once(':').ok_or_else(bad)?;
        let prefix: Vec<i64> = prefix
            .split_whitespace()
            .map(|part| part.parse().map_err(|_| bad()))
            .collect::<Result<_>>()?;
        let [n, m, p, index] = prefix.as_slice() else {
            return Err(bad());
        };

        let values = values
            .split_whitespace()
            .map(|part| part.parse().map_err(|_| bad()))
            .collect::<Result<_>>()?;

        Ok(Self {
            index: *index as usize,
            values,
            n: *n as usize,
            m: *m as usize,
            p: *p,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct FragmentWire {
    #[serde(rename = "N")]
    n: usize,
    #[serde(rename = "M")]
    m: usize,
    #[serde(rename = "P")]
    p: i64,
    #[serde(rename = "INDEX")]
    index: usize,
    #[serde(rename = "FRAGMENT")]
    fragment: String,
}

impl Serialize for Fragment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let encoded = encode_base64(&self.values, digits_per_value(self.p))
            .map_err(serde::ser::Error::custom)?;
        FragmentWire {
            n: self.n,
            m: self.m,
            p: self.p,
            index: self.index,
            fragment: encoded,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Fragment {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let wire = FragmentWire::deserialize(deserializer)?;
        let values = decode_base64(&wire.fragment, digits_per_value(wire.p))
            .map_err(serde::de::Error::custom)?;
        Ok(Fragment {
            index: wire.index,
            values,
            n: wire.n,
            m: wire.m,
            p: wire.p,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digits_per_value() {
        assert_eq!(digits_per_value(2), 1);
        assert_eq!(digits_per_value(64), 1);
        assert_eq!(digits_per_value(65), 2);
        assert_eq!(digits_per_value(257), 2);
        assert_eq!(digits_per_value(4097), 3);
    }

    #[test]
    fn test_base64_round_trip() {
        let values = vec![0, 1, 63, 64, 255, 256];
        let encoded = encode_base64(&values, 2).unwrap();
        assert_eq!(encoded.len(), values.len() * 2);
        assert_eq!(decode_base64(&encoded, 2).unwrap(), values);

        // Width-1 encoding holds only [0, 64).
        assert!(encode_base64(&[64], 1).is_err());
        assert!(decode_base64("A!", 2).is_err());
        assert!(decode_base64("ABC", 2).is_err());
    }

    #[test]
    fn test_wire_round_trip() {
        let fragment = Fragment {
            index: 3,
            values: vec![7, 0, 256, 19],
            n: 14,
            m: 10,
            p: 257,
        };

        let json = serde_json::to_value(&fragment).unwrap();
        assert_eq!(json["N"], 14);
        assert_eq!(json["M"], 10);
        assert_eq!(json["P"], 257);
        assert_eq!(json["INDEX"], 3);
        // ceil(log64(257)) digits per value, left-padded.
        assert_eq!(json["FRAGMENT"].as_str().unwrap().len(), 8);

        let back: Fragment = serde_json::from_value(json).unwrap();
        assert_eq!(back, fragment);
        assert_eq!(back.values, fragment.values);
    }

    #[test]
    fn test_text_form_round_trip() {
        let fragment = Fragment {
            index: 4,
            values: vec![12, 0, 200],
            n: 5,
            m: 3,
            p: 257,
        };

        let text = fragment.to_string();
        assert_eq!(text, "5 3 257 4:12 0 200");
        let back: Fragment = text.parse().unwrap();
        assert_eq!(back, fragment);
        assert_eq!((back.n, back.m, back.p), (5, 3, 257));

        assert!("not a fragment".parse::<Fragment>().is_err());
        assert!("1 2:3".parse::<Fragment>().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let fragment = Fragment {
            index: 2,
            values: vec![9, 8, 7],
            n: 4,
            m: 2,
            p: 11,
        };

        let path = std::env::temp_dir().join("ringstore-fragment-test.json");
        fragment.write_to_file(&path).unwrap();
        let back = Fragment::from_file(&path).unwrap();
        assert_eq!(back, fragment);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_fragments_order_by_index() {
        let a = Fragment {
            index: 1,
            values: vec![1],
            n: 4,
            m: 2,
            p: 7,
        };
        let b = Fragment {
            index: 2,
            values: vec![1],
            n: 4,
            m: 2,
            p: 7,
        };
        assert!(a < b);
        // Equality ignores the codec parameters.
        let mut c = a.clone();
        c.p = 11;
        assert_eq!(a, c);
    }
}
