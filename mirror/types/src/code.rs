// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

use crate::EntityId;

/// Secondary identity of an element: a `(spec, scope, value)` triple unique
/// within its scope.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct Code {
    /// The code spec that defines how `value` is encoded and scoped.
    pub spec: EntityId,
    /// The element that scopes `value`.
    pub scope: EntityId,
    /// The human-readable code value. Empty means "no code".
    pub value: String,
}

impl Code {
    pub fn new(spec: EntityId, scope: EntityId, value: impl Into<String>) -> Self {
        Self {
            spec,
            scope,
            value: value.into(),
        }
    }

    /// A code with no value. Elements are allowed to carry one.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Lookup-by-code is only meaningful when the scope points at a real
    /// element.
    pub fn has_valid_scope(&self) -> bool {
        self.scope.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_code_has_no_valid_scope() {
        let code = Code::empty();
        assert!(code.is_empty());
        assert!(!code.has_valid_scope());
    }

    #[test]
    fn code_identity_is_the_full_triple() {
        let a = Code::new(EntityId(1), EntityId(2), "pump-1");
        let b = Code::new(EntityId(1), EntityId(3), "pump-1");
        assert_ne!(a, b);
        assert_eq!(a, Code::new(EntityId(1), EntityId(2), "pump-1"));
    }
}
