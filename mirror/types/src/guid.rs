// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Globally unique identity of an element. When both sides of a
/// synchronization carry the same guid, that match *is* the provenance.
///
/// Serializes as its hyphenated string form, which is how it appears in
/// persisted state and change rows.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FederationGuid([u8; 16]);

impl Serialize for FederationGuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FederationGuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

impl FederationGuid {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Mints a fresh random guid, used when an initial copy stamps identity
    /// onto elements that have none.
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for FederationGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12],
            b[13], b[14], b[15]
        )
    }
}

impl fmt::Debug for FederationGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for FederationGuid {
    type Err = ParseGuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| *c != '-').collect();
        if hex.len() != 32 {
            return Err(ParseGuidError(s.to_string()));
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| ParseGuidError(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid federation guid string: {0:?}")]
pub struct ParseGuidError(String);

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn guid_string_round_trip() {
        let mut rng = StdRng::from_seed([7; 32]);
        for _ in 0..32 {
            let guid = FederationGuid::random(&mut rng);
            let text = guid.to_string();
            assert_eq!(text.len(), 36);
            assert_eq!(text.parse::<FederationGuid>().unwrap(), guid);
        }
    }

    #[test]
    fn malformed_guid_is_rejected() {
        assert!("not-a-guid".parse::<FederationGuid>().is_err());
        assert!("".parse::<FederationGuid>().is_err());
    }

    #[test]
    fn serializes_as_its_string_form() {
        let guid = FederationGuid::from_bytes([0xab; 16]);
        let json = serde_json::to_string(&guid).unwrap();
        assert_eq!(json, format!("\"{guid}\""));
        assert_eq!(serde_json::from_str::<FederationGuid>(&json).unwrap(), guid);
    }
}
