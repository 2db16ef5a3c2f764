// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The mirroring engine: clones one graph database into another while
//! rewriting every cross-entity identifier into the target's id space.
//!
//! A run is orchestrated by the [`Transformer`], which drives the
//! [`Exporter`] over the source in dependency order, remaps ids through the
//! [`CloneContext`], applies mutations through the [`Importer`], and records
//! durable provenance so later runs can synchronize deltas in either
//! direction.

mod changed;
mod clone_context;
mod context;
mod delta;
mod error;
mod exporter;
mod importer;
mod pending;
mod provenance;
mod range;
mod remap;
mod transformer;

#[cfg(test)]
mod tests;

pub use changed::{ChangedInstanceIds, DeletedRelationship};
pub use clone_context::{CloneContext, ClonedElement};
pub use context::{AspectStrategy, DanglingReferencePolicy, RunContext, RunOptions, SyncDirection};
pub use delta::{select_changeset_range, ChangesScope, DeltaSelection};
pub use error::{MirrorError, MirrorResult};
pub use exporter::{ExportObserver, Exporter, ExporterConfig};
pub use importer::Importer;
pub use pending::{PartiallyCommittedEntity, PendingReferenceMap};
pub use provenance::{ProvenanceReader, ProvenanceWriter, TargetScopeRecord};
pub use range::subtract_range;
pub use remap::{CompactRemapTable, Run};
pub use transformer::{TransformResult, Transformer, TransformerState};
