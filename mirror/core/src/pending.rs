// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::warn;

use mirror_types::EntityRef;

/// An entity whose target row exists but still carries references into
/// source-id space. It stays here until every missing reference acquires a
/// target mapping.
#[derive(Debug)]
pub struct PartiallyCommittedEntity {
    entity: EntityRef,
    missing_references: HashSet<EntityRef>,
}

impl PartiallyCommittedEntity {
    fn new(entity: EntityRef, missing_references: HashSet<EntityRef>) -> Self {
        Self {
            entity,
            missing_references,
        }
    }

    pub fn entity(&self) -> EntityRef {
        self.entity
    }

    pub fn missing_references(&self) -> impl Iterator<Item = &EntityRef> {
        self.missing_references.iter()
    }
}

/// Tracks entities awaiting yet-unmapped references and completes them when
/// the referenced entities arrive.
///
/// References are held by [`EntityRef`], never by pointer, so cycles among
/// entities resolve incrementally as mappings land.
#[derive(Debug, Default)]
pub struct PendingReferenceMap {
    /// Entities that cannot be finished yet, by their own ref.
    partially_committed: BTreeMap<EntityRef, PartiallyCommittedEntity>,
    /// Reverse index: for each missing reference, the entities waiting on it.
    /// A missing reference may itself be a partially committed entity.
    waiting_on: BTreeMap<EntityRef, BTreeSet<EntityRef>>,
}

impl PendingReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity whose `missing` references are not mapped yet.
    /// Re-registering replaces the previous missing set.
    pub fn defer(&mut self, referencer: EntityRef, missing: HashSet<EntityRef>) {
        debug_assert!(!missing.is_empty(), "deferring with nothing missing");
        self.forget(&referencer);
        for referenced in &missing {
            self.waiting_on
                .entry(*referenced)
                .or_default()
                .insert(referencer);
        }
        self.partially_committed
            .insert(referencer, PartiallyCommittedEntity::new(referencer, missing));
    }

    /// Marks `referenced` as mapped and returns every entity that became
    /// complete because of it. Each completed entity is returned exactly once
    /// and no longer tracked.
    pub fn resolve_reference(&mut self, referenced: EntityRef) -> Vec<EntityRef> {
        let Some(referencers) = self.waiting_on.remove(&referenced) else {
            return vec![];
        };

        let mut completed = vec![];
        for referencer in referencers {
            let record = self
                .partially_committed
                .get_mut(&referencer)
                .expect("referencer is tracked while its references are");
            record.missing_references.remove(&referenced);
            if record.missing_references.is_empty() {
                self.partially_committed.remove(&referencer);
                completed.push(referencer);
            }
        }
        completed
    }

    pub fn is_pending(&self, entity: &EntityRef) -> bool {
        self.partially_committed.contains_key(entity)
    }

    /// References that are still missing and block at least one entity.
    pub fn missing_references(&self) -> Vec<EntityRef> {
        self.waiting_on.keys().copied().collect()
    }

    pub fn pending_entities(&self) -> Vec<EntityRef> {
        self.partially_committed.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.partially_committed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.partially_committed.len()
    }

    /// Abandons all tracking and returns what was pending, for forced
    /// completion at finalization. Logs each survivor; a reject-policy run
    /// should have failed long before this.
    pub fn drain_for_force_complete(&mut self) -> Vec<EntityRef> {
        let survivors: Vec<EntityRef> = self.partially_committed.keys().copied().collect();
        for entity in &survivors {
            let record = &self.partially_committed[entity];
            warn!(
                entity = %entity,
                missing = ?record.missing_references,
                "forcing completion with unresolved references"
            );
        }
        self.partially_committed.clear();
        self.waiting_on.clear();
        survivors
    }

    /// Drops one entity from tracking, cleaning the reverse index.
    fn forget(&mut self, entity: &EntityRef) {
        let Some(record) = self.partially_committed.remove(entity) else {
            return;
        };
        for referenced in record.missing_references {
            if let Some(waiters) = self.waiting_on.get_mut(&referenced) {
                waiters.remove(entity);
                if waiters.is_empty() {
                    self.waiting_on.remove(&referenced);
                }
            }
        }
    }
}
