use anyhow::{anyhow, Result};
use num_bigint::BigUint;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Cumulative proof-of-work, as reported by replicas in `chainwork` fields.
///
/// Replica lag and best-chain selection compare work, never height: a
/// lower-height chain can carry more work across a difficulty change.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainWork(BigUint);

impl ChainWork {
    pub fn zero() -> Self {
        Self(BigUint::default())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        BigUint::parse_bytes(s.as_bytes(), 16)
            .map(Self)
            .ok_or_else(|| anyhow!("invalid chainwork hex: {s}"))
    }

    pub fn to_hex(&self) -> String {
        format!("{:064x}", self.0)
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ChainWork({:x})", self.0)
    }
}

impl From<u64> for ChainWork {
    fn from(value: u64) -> Self {
        Self(BigUint::from(value))
    }
}

impl Serialize for ChainWork {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChainWork {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_work_not_string_length() {
        let small = ChainWork::from_hex("ff").unwrap();
        let big = ChainWork::from_hex("0100").unwrap();
        assert!(small < big);
    }

    #[test]
    fn round_trips_hex() {
        let work =
            ChainWork::from_hex("00000000000000000000000000000000000000005566d48b0e924a2b7e40ad42")
                .unwrap();
        assert_eq!(
            work.to_hex(),
            "00000000000000000000000000000000000000005566d48b0e924a2b7e40ad42"
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(ChainWork::from_hex("not-hex").is_err());
    }
}
