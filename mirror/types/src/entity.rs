// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The root subject element. Always maps to itself across databases.
pub const ROOT_SUBJECT: EntityId = EntityId(0x1);
/// The link partition element reserved by the base schema.
pub const LINK_PARTITION: EntityId = EntityId(0xe);
/// The dictionary model and its modeled element.
pub const DICTIONARY_MODEL: EntityId = EntityId(0x10);

/// Store-assigned integer identifier, unique per entity kind within one
/// database. Zero is the invalid id.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl EntityId {
    pub const INVALID: EntityId = EntityId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// All element ids the base schema reserves. These are identical in every
    /// database and are never remapped.
    pub fn reserved_element_ids() -> [EntityId; 3] {
        [ROOT_SUBJECT, LINK_PARTITION, DICTIONARY_MODEL]
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// Ids appear inside persisted identifier strings, so Debug must not carry
// struct formatting.
impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<u64> for EntityId {
    fn from(raw: u64) -> Self {
        EntityId(raw)
    }
}

impl FromStr for EntityId {
    type Err = ParseEntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            u64::from_str_radix(hex, 16)
        } else {
            s.parse::<u64>()
        };
        raw.map(EntityId)
            .map_err(|_| ParseEntityError(s.to_string()))
    }
}

/// The closed set of entity kinds the engine synchronizes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Element,
    Model,
    ElementAspect,
    Relationship,
    CodeSpec,
    Font,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Element,
        EntityKind::Model,
        EntityKind::ElementAspect,
        EntityKind::Relationship,
        EntityKind::CodeSpec,
        EntityKind::Font,
    ];

    /// Single-letter prefix used in persisted identifier strings.
    pub fn prefix(&self) -> char {
        match self {
            EntityKind::Element => 'e',
            EntityKind::Model => 'm',
            EntityKind::ElementAspect => 'a',
            EntityKind::Relationship => 'r',
            EntityKind::CodeSpec => 'c',
            EntityKind::Font => 'f',
        }
    }

    pub fn from_prefix(prefix: char) -> Option<EntityKind> {
        match prefix {
            'e' => Some(EntityKind::Element),
            'm' => Some(EntityKind::Model),
            'a' => Some(EntityKind::ElementAspect),
            'r' => Some(EntityKind::Relationship),
            'c' => Some(EntityKind::CodeSpec),
            'f' => Some(EntityKind::Font),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Element => "Element",
            EntityKind::Model => "Model",
            EntityKind::ElementAspect => "ElementAspect",
            EntityKind::Relationship => "Relationship",
            EntityKind::CodeSpec => "CodeSpec",
            EntityKind::Font => "Font",
        };
        f.write_str(name)
    }
}

impl fmt::Debug for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Typed entity identifier: the minimum info that uniquely identifies an
/// entity within one database.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: EntityId,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: EntityId) -> Self {
        Self { kind, id }
    }

    pub fn element(id: EntityId) -> Self {
        Self::new(EntityKind::Element, id)
    }

    pub fn model(id: EntityId) -> Self {
        Self::new(EntityKind::Model, id)
    }

    pub fn aspect(id: EntityId) -> Self {
        Self::new(EntityKind::ElementAspect, id)
    }

    pub fn relationship(id: EntityId) -> Self {
        Self::new(EntityKind::Relationship, id)
    }

    pub fn code_spec(id: EntityId) -> Self {
        Self::new(EntityKind::CodeSpec, id)
    }

    pub fn font(id: EntityId) -> Self {
        Self::new(EntityKind::Font, id)
    }

    pub fn is_valid(&self) -> bool {
        self.id.is_valid()
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.id)
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for EntityRef {
    type Err = ParseEntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        let kind = chars
            .next()
            .and_then(EntityKind::from_prefix)
            .ok_or_else(|| ParseEntityError(s.to_string()))?;
        let id = chars.as_str().parse::<EntityId>()?;
        Ok(EntityRef { kind, id })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid entity identifier string: {0:?}")]
pub struct ParseEntityError(String);
