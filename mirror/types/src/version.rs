// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Synchronization watermark: the changeset a prior run ended on.
///
/// The persisted string form is `"<changesetId>;<changesetIndex>"`. An empty
/// id with index -1 means "never synchronized".
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ChangesetVersion {
    pub id: String,
    pub index: i64,
}

impl ChangesetVersion {
    pub fn new(id: impl Into<String>, index: i64) -> Self {
        Self {
            id: id.into(),
            index,
        }
    }

    pub fn never() -> Self {
        Self {
            id: String::new(),
            index: -1,
        }
    }

    pub fn is_never(&self) -> bool {
        self.index < 0
    }
}

impl Default for ChangesetVersion {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Display for ChangesetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};{}", self.id, self.index)
    }
}

impl FromStr for ChangesetVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::never());
        }
        let (id, index) = s
            .rsplit_once(';')
            .ok_or_else(|| ParseVersionError(s.to_string()))?;
        let index = index
            .parse::<i64>()
            .map_err(|_| ParseVersionError(s.to_string()))?;
        Ok(Self::new(id, index))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid changeset version string: {0:?}")]
pub struct ParseVersionError(String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_round_trip() {
        let version = ChangesetVersion::new("a1b2c3", 17);
        assert_eq!(version.to_string(), "a1b2c3;17");
        assert_eq!(version.to_string().parse::<ChangesetVersion>().unwrap(), version);
    }

    #[test]
    fn never_round_trips_through_its_string_form() {
        let never = ChangesetVersion::never();
        assert!(never.is_never());
        assert_eq!(never.to_string(), ";-1");
        assert!(never.to_string().parse::<ChangesetVersion>().unwrap().is_never());
        assert!("".parse::<ChangesetVersion>().unwrap().is_never());
    }
}
