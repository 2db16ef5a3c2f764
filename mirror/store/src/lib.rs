// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Storage contracts consumed by the mirroring engine, plus the in-memory
//! store used by tests and the snapshot-file tooling.
//!
//! The engine never speaks SQL; it sees entity records, a metadata catalog,
//! and changeset rows through the [`Store`] trait. Any relational backend
//! that can satisfy those contracts can sit behind it.

mod catalog;
mod changeset;
mod geometry;
mod mem_store;
mod records;
mod store;

pub use catalog::{classes, Catalog, ClassDef, SchemaDef};
pub use changeset::{
    unify_partial_changes, ChangeOp, ChangedEcInstance, ChangesetData, ChangesetHub,
    ChangesetInfo, DirectoryHub, EcChangeRow, StoreBackedHub,
};
pub use geometry::{
    remap_geometry_stream, strip_empty_blobs, GeometryStreamBuilder, RemappedGeometry,
};
pub use mem_store::MemStore;
pub use records::{
    AspectOwnership, AspectRecord, CodeSpecRecord, ElementRecord, ExternalSourceAspectData,
    FontRecord, FontType, ModelRecord, ProjectExtents, RelationshipRecord, ScopeProperties,
    EXTERNAL_SOURCE_ASPECT_CLASS, SCOPE_KIND_ELEMENT, SCOPE_KIND_RELATIONSHIP, SCOPE_KIND_SCOPE,
};
pub use store::{Store, StoreError, StoreResult};
