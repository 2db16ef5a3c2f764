// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use mirror_store::Store;
use mirror_types::{EntityId, ROOT_SUBJECT};

/// Which way provenance flows in this run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncDirection {
    /// Source changes flow into the target; the target stores provenance.
    Forward,
    /// Target changes flow back; the source stores provenance.
    Reverse,
}

/// What to do with a reference to an entity that does not exist in the
/// source at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DanglingReferencePolicy {
    #[default]
    Reject,
    Ignore,
}

/// How element aspects travel through the export.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AspectStrategy {
    /// Aspects flow with their owning element.
    #[default]
    Inline,
    /// Two sequential passes: unique aspects, then multi-aspects batched by
    /// owner.
    Detached,
}

/// Operational configuration of one run.
///
/// Defaults describe a plain forward synchronization; most callers should
/// not need to set any field.
#[derive(Clone, Debug)]
pub struct RunOptions {
    pub direction: SyncDirection,
    /// The target-side element all provenance from this source hangs off.
    pub target_scope_element: EntityId,
    /// Insert every element under its source id instead of letting the
    /// target assign ids.
    pub preserve_element_ids: bool,
    /// The target started life as a file copy of the source, so equal ids
    /// denote the same entity.
    pub was_source_copied_to_target: bool,
    /// Write external source aspects even where federation guids would
    /// carry the provenance.
    pub force_external_source_aspect_provenance: bool,
    /// Import the source's own external source aspects as data.
    pub include_source_provenance: bool,
    /// Record no provenance at all. The run cannot be resumed or reversed.
    pub no_provenance: bool,
    pub dangling_references: DanglingReferencePolicy,
    /// Accept a changeset range that does not line up with the recorded
    /// watermark.
    pub ignore_missing_changesets: bool,
    /// First changeset index to process, overriding the watermark-derived
    /// start.
    pub start_changeset_index: Option<i64>,
    /// Explicit inclusive index ranges to process instead of the
    /// watermark-derived range. Pending indices are still skipped.
    pub changeset_ranges: Option<Vec<(i64, i64)>>,
    pub aspect_strategy: AspectStrategy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            direction: SyncDirection::Forward,
            target_scope_element: ROOT_SUBJECT,
            preserve_element_ids: false,
            was_source_copied_to_target: false,
            force_external_source_aspect_provenance: false,
            include_source_provenance: false,
            no_provenance: false,
            dangling_references: DanglingReferencePolicy::default(),
            ignore_missing_changesets: false,
            start_changeset_index: None,
            changeset_ranges: None,
            aspect_strategy: AspectStrategy::default(),
        }
    }
}

/// Per-run state shared by the components of one transformer: the two store
/// handles and the options. Never shared across runs.
#[derive(Clone)]
pub struct RunContext {
    pub source: Arc<dyn Store>,
    pub target: Arc<dyn Store>,
    pub options: RunOptions,
}

impl RunContext {
    pub fn new(source: Arc<dyn Store>, target: Arc<dyn Store>, options: RunOptions) -> Self {
        Self {
            source,
            target,
            options,
        }
    }

    /// The database that stores provenance records for this run's direction.
    pub fn provenance_db(&self) -> &Arc<dyn Store> {
        match self.options.direction {
            SyncDirection::Forward => &self.target,
            SyncDirection::Reverse => &self.source,
        }
    }
}
