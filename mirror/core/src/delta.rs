// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use tracing::debug;

use mirror_types::ChangesetVersion;

use crate::context::SyncDirection;
use crate::error::{MirrorError, MirrorResult};
use crate::provenance::TargetScopeRecord;
use crate::range::subtract_range;

/// How much of the source this run has to look at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangesScope {
    /// No synchronization has ever been recorded; a full copy is required.
    Unconnected,
    /// The watermark is already at the source tip.
    NoChanges,
    /// At least one changeset needs processing.
    HasChanges,
}

/// The changeset ranges one run streams, derived from the recorded
/// synchronization versions and the pending indices.
#[derive(Clone, Debug)]
pub struct DeltaSelection {
    pub scope: ChangesScope,
    pub sync_version: ChangesetVersion,
    /// Inclusive index subranges to fetch, ascending and disjoint.
    pub subranges: Vec<(i64, i64)>,
}

impl DeltaSelection {
    pub fn first_index(&self) -> Option<i64> {
        self.subranges.first().map(|(a, _)| *a)
    }

    pub fn last_index(&self) -> Option<i64> {
        self.subranges.last().map(|(_, b)| *b)
    }
}

/// Derives the inclusive changeset range to process.
///
/// The sync version comes from the watermark field for the run's direction;
/// the skip set is the pending list the reciprocal direction produced (those
/// changesets are this engine's own echoes). An explicit start that leaves a
/// gap against the watermark fails unless the caller opted out.
pub fn select_changeset_range(
    scope_record: &TargetScopeRecord,
    direction: SyncDirection,
    explicit_start: Option<i64>,
    explicit_ranges: Option<&[(i64, i64)]>,
    source_tip_index: i64,
    ignore_missing_changesets: bool,
) -> MirrorResult<DeltaSelection> {
    let (sync_version, skip) = match direction {
        SyncDirection::Forward => (
            scope_record.version.clone(),
            &scope_record.properties.pending_reverse_sync_changeset_indices,
        ),
        SyncDirection::Reverse => (
            scope_record.properties.reverse_version(),
            &scope_record.properties.pending_sync_changeset_indices,
        ),
    };

    // Caller-chosen ranges bypass the watermark entirely; the gap they
    // introduce is theirs to own, but the pending skips still apply.
    if let Some(ranges) = explicit_ranges {
        let mut subranges = vec![];
        for (first, last) in ranges {
            subranges.extend(subtract_range(*first, *last, skip)?);
        }
        let scope = if subranges.is_empty() {
            ChangesScope::NoChanges
        } else {
            ChangesScope::HasChanges
        };
        return Ok(DeltaSelection {
            scope,
            sync_version,
            subranges,
        });
    }

    if sync_version.is_never() && explicit_start.is_none() {
        return Ok(DeltaSelection {
            scope: ChangesScope::Unconnected,
            sync_version,
            subranges: vec![],
        });
    }

    let start = explicit_start.unwrap_or(sync_version.index + 1);
    if start != sync_version.index + 1 && !sync_version.is_never() {
        if !ignore_missing_changesets {
            return Err(MirrorError::ChangesetGap {
                expected: sync_version.index + 1,
                actual: start,
            });
        }
        debug!(
            expected = sync_version.index + 1,
            actual = start,
            "accepting changeset gap on explicit request"
        );
    }

    if start > source_tip_index {
        return Ok(DeltaSelection {
            scope: ChangesScope::NoChanges,
            sync_version,
            subranges: vec![],
        });
    }

    let subranges = subtract_range(start, source_tip_index, skip)?;
    let scope = if subranges.is_empty() {
        ChangesScope::NoChanges
    } else {
        ChangesScope::HasChanges
    };
    Ok(DeltaSelection {
        scope,
        sync_version,
        subranges,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mirror_store::{MemStore, Store};
    use mirror_types::ROOT_SUBJECT;

    use super::*;

    fn scope_record() -> (Arc<dyn Store>, TargetScopeRecord) {
        let db: Arc<dyn Store> = Arc::new(MemStore::new("branch"));
        let record =
            TargetScopeRecord::load_or_create(db.as_ref(), ROOT_SUBJECT, "master").unwrap();
        (db, record)
    }

    #[test]
    fn never_synchronized_means_unconnected() {
        let (_db, record) = scope_record();
        let selection =
            select_changeset_range(&record, SyncDirection::Forward, None, None, 7, false).unwrap();
        assert_eq!(selection.scope, ChangesScope::Unconnected);
        assert!(selection.subranges.is_empty());
    }

    #[test]
    fn resumes_one_past_the_watermark() {
        let (_db, mut record) = scope_record();
        record.version = ChangesetVersion::new("cs3", 3);
        let selection =
            select_changeset_range(&record, SyncDirection::Forward, None, None, 7, false).unwrap();
        assert_eq!(selection.scope, ChangesScope::HasChanges);
        assert_eq!(selection.subranges, vec![(4, 7)]);
    }

    #[test]
    fn pending_reverse_indices_are_skipped_forward() {
        let (_db, mut record) = scope_record();
        record.version = ChangesetVersion::new("cs3", 3);
        record.properties.pending_reverse_sync_changeset_indices = vec![5, 6];
        let selection =
            select_changeset_range(&record, SyncDirection::Forward, None, None, 8, false).unwrap();
        assert_eq!(selection.subranges, vec![(4, 4), (7, 8)]);
    }

    #[test]
    fn reverse_uses_the_reciprocal_watermark_and_pending_list() {
        let (_db, mut record) = scope_record();
        record.version = ChangesetVersion::new("cs9", 9);
        record.properties.reverse_sync_version = ChangesetVersion::new("cs2", 2).to_string();
        record.properties.pending_sync_changeset_indices = vec![3];
        let selection =
            select_changeset_range(&record, SyncDirection::Reverse, None, None, 5, false).unwrap();
        assert_eq!(selection.sync_version, ChangesetVersion::new("cs2", 2));
        assert_eq!(selection.subranges, vec![(4, 5)]);
    }

    #[test]
    fn watermark_at_tip_means_no_changes() {
        let (_db, mut record) = scope_record();
        record.version = ChangesetVersion::new("cs7", 7);
        let selection =
            select_changeset_range(&record, SyncDirection::Forward, None, None, 7, false).unwrap();
        assert_eq!(selection.scope, ChangesScope::NoChanges);

        // Everything in range pending also collapses to no changes.
        let mut record = record;
        record.version = ChangesetVersion::new("cs6", 6);
        record.properties.pending_reverse_sync_changeset_indices = vec![7];
        let selection =
            select_changeset_range(&record, SyncDirection::Forward, None, None, 7, false).unwrap();
        assert_eq!(selection.scope, ChangesScope::NoChanges);
        assert!(selection.subranges.is_empty());
    }

    #[test]
    fn explicit_start_with_gap_fails_unless_overridden() {
        let (_db, mut record) = scope_record();
        record.version = ChangesetVersion::new("cs3", 3);

        let err = select_changeset_range(&record, SyncDirection::Forward, Some(6), None, 9, false)
            .unwrap_err();
        assert!(matches!(
            err,
            MirrorError::ChangesetGap {
                expected: 4,
                actual: 6
            }
        ));

        let selection =
            select_changeset_range(&record, SyncDirection::Forward, Some(6), None, 9, true).unwrap();
        assert_eq!(selection.subranges, vec![(6, 9)]);
    }

    #[test]
    fn explicit_ranges_bypass_the_watermark_but_not_the_skips() {
        let (_db, mut record) = scope_record();
        record.version = ChangesetVersion::new("cs9", 9);
        record.properties.pending_reverse_sync_changeset_indices = vec![4];

        let ranges = [(2, 5), (8, 8)];
        let selection = select_changeset_range(
            &record,
            SyncDirection::Forward,
            None,
            Some(&ranges),
            20,
            false,
        )
        .unwrap();
        assert_eq!(selection.scope, ChangesScope::HasChanges);
        assert_eq!(selection.subranges, vec![(2, 3), (5, 5), (8, 8)]);
    }

    #[test]
    fn explicit_start_on_a_fresh_record_forces_change_mode() {
        let (_db, record) = scope_record();
        let selection =
            select_changeset_range(&record, SyncDirection::Forward, Some(1), None, 4, false).unwrap();
        assert_eq!(selection.scope, ChangesScope::HasChanges);
        assert_eq!(selection.subranges, vec![(1, 4)]);
    }
}
