// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use mirror_store::StoreError;
use mirror_types::{EntityId, EntityRef};

pub type MirrorResult<T> = Result<T, MirrorError>;

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Missing entity during a delete. Change-driven runs swallow this; all
    /// other paths surface it.
    #[error("{0} not found")]
    NotFound(EntityRef),

    /// Reference to an entity that does not exist in the source at all.
    /// Fatal or ignored depending on the run's dangling-reference policy.
    #[error("{referencer} references {referenced}, which does not exist in the source")]
    DanglingReference {
        referencer: EntityRef,
        referenced: EntityRef,
    },

    #[error("changeset range gap or overlap: expected start {expected}, got {actual}")]
    ChangesetGap { expected: i64, actual: i64 },

    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl MirrorError {
    /// Whether a delete-path caller may treat the error as "already gone".
    pub fn is_not_found(&self) -> bool {
        match self {
            MirrorError::NotFound(_) => true,
            MirrorError::Store(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn invalid_id(what: &str, id: EntityId) -> Self {
        MirrorError::InvalidArgument(format!("{what}: invalid id {id}"))
    }
}

#[cfg(test)]
mod tests {
    use mirror_types::EntityKind;

    use super::*;

    #[test]
    fn not_found_is_inspectable_through_both_layers() {
        let direct = MirrorError::NotFound(EntityRef::element(EntityId(5)));
        assert!(direct.is_not_found());

        let from_store: MirrorError =
            StoreError::not_found(EntityKind::Model, EntityId(5)).into();
        assert!(from_store.is_not_found());

        assert!(!MirrorError::InvalidArgument("x".to_string()).is_not_found());
    }
}
