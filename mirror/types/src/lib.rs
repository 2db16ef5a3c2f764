// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Shared identifier and identity types for the mirroring engine.

mod code;
mod entity;
mod guid;
mod version;

pub use code::Code;
pub use entity::{
    EntityId, EntityKind, EntityRef, ParseEntityError, DICTIONARY_MODEL, LINK_PARTITION,
    ROOT_SUBJECT,
};
pub use guid::FederationGuid;
pub use version::ChangesetVersion;
