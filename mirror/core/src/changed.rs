// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use mirror_store::{classes, unify_partial_changes, Catalog, ChangeOp, ChangesetData};
use mirror_types::{EntityId, EntityKind, FederationGuid};

/// What a deleted relationship row used to look like. Deletion propagation
/// needs the endpoints and class after the source row is gone.
#[derive(Clone, Debug, PartialEq)]
pub struct DeletedRelationship {
    pub class_name: String,
    pub source_id: EntityId,
    pub target_id: EntityId,
}

/// Net changed-instance sets per entity kind, built by replaying changeset
/// rows in order. Deleted rows additionally retain the identity details the
/// deletion-propagation path needs, read from the rows' old values.
#[derive(Clone, Debug, Default)]
pub struct ChangedInstanceIds {
    by_kind: BTreeMap<EntityKind, KindChanges>,
    deleted_element_guids: BTreeMap<EntityId, FederationGuid>,
    deleted_relationships: BTreeMap<EntityId, DeletedRelationship>,
}

#[derive(Clone, Debug, Default)]
pub struct KindChanges {
    pub inserted: BTreeSet<EntityId>,
    pub updated: BTreeSet<EntityId>,
    pub deleted: BTreeSet<EntityId>,
}

impl ChangedInstanceIds {
    /// Replays the supplied changesets, oldest first. Each row's kind is
    /// looked up once from the catalog; rows of unknown classes and derived
    /// `ElementDrivesElement` relationships are dropped.
    pub fn from_changesets(catalog: &Catalog, changesets: &[ChangesetData]) -> Self {
        let mut result = ChangedInstanceIds::default();
        for changeset in changesets {
            for instance in unify_partial_changes(&changeset.rows) {
                let Some(kind) = catalog.kind_of(&instance.class_name) else {
                    debug!(
                        class = %instance.class_name,
                        "dropping change row of unknown class"
                    );
                    continue;
                };
                if kind == EntityKind::Relationship
                    && catalog.is_subclass_of(&instance.class_name, classes::ELEMENT_DRIVES_ELEMENT)
                {
                    continue;
                }
                if instance.op == ChangeOp::Deleted {
                    result.retain_deleted_details(kind, &instance);
                }
                result.absorb(kind, instance.instance_id, instance.op);
            }
        }
        result
    }

    fn retain_deleted_details(
        &mut self,
        kind: EntityKind,
        instance: &mirror_store::ChangedEcInstance,
    ) {
        let Some(old) = &instance.old_values else {
            return;
        };
        match kind {
            EntityKind::Element => {
                let guid = old
                    .get("federation_guid")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<FederationGuid>().ok());
                if let Some(guid) = guid {
                    self.deleted_element_guids.insert(instance.instance_id, guid);
                }
            }
            EntityKind::Relationship => {
                let endpoint = |key: &str| {
                    old.get(key)
                        .and_then(|v| v.as_u64())
                        .map(EntityId)
                        .filter(EntityId::is_valid)
                };
                if let (Some(source_id), Some(target_id)) =
                    (endpoint("source_id"), endpoint("target_id"))
                {
                    self.deleted_relationships.insert(
                        instance.instance_id,
                        DeletedRelationship {
                            class_name: instance.class_name.clone(),
                            source_id,
                            target_id,
                        },
                    );
                }
            }
            _ => {}
        }
    }

    /// The federation guid a deleted element used to carry.
    pub fn deleted_element_guid(&self, id: EntityId) -> Option<&FederationGuid> {
        self.deleted_element_guids.get(&id)
    }

    /// The endpoints and class a deleted relationship used to have.
    pub fn deleted_relationship(&self, id: EntityId) -> Option<&DeletedRelationship> {
        self.deleted_relationships.get(&id)
    }

    /// Folds one change op into the net sets.
    pub fn absorb(&mut self, kind: EntityKind, id: EntityId, op: ChangeOp) {
        let changes = self.by_kind.entry(kind).or_default();
        match op {
            ChangeOp::Inserted => {
                changes.inserted.insert(id);
                changes.deleted.remove(&id);
            }
            ChangeOp::Updated => {
                if !changes.inserted.contains(&id) {
                    changes.updated.insert(id);
                }
            }
            ChangeOp::Deleted => {
                if changes.inserted.remove(&id) {
                    // Inserted and deleted within the window: net nothing.
                    changes.updated.remove(&id);
                } else {
                    changes.updated.remove(&id);
                    changes.deleted.insert(id);
                }
            }
        }
    }

    pub fn inserted(&self, kind: EntityKind) -> impl Iterator<Item = EntityId> + '_ {
        self.set(kind, |c| &c.inserted)
    }

    pub fn updated(&self, kind: EntityKind) -> impl Iterator<Item = EntityId> + '_ {
        self.set(kind, |c| &c.updated)
    }

    pub fn deleted(&self, kind: EntityKind) -> impl Iterator<Item = EntityId> + '_ {
        self.set(kind, |c| &c.deleted)
    }

    pub fn is_inserted(&self, kind: EntityKind, id: EntityId) -> bool {
        self.by_kind
            .get(&kind)
            .is_some_and(|c| c.inserted.contains(&id))
    }

    pub fn is_updated(&self, kind: EntityKind, id: EntityId) -> bool {
        self.by_kind
            .get(&kind)
            .is_some_and(|c| c.updated.contains(&id))
    }

    pub fn is_deleted(&self, kind: EntityKind, id: EntityId) -> bool {
        self.by_kind
            .get(&kind)
            .is_some_and(|c| c.deleted.contains(&id))
    }

    /// Whether the entity should flow through a change-gated export, and if
    /// so whether as an update.
    pub fn export_disposition(&self, kind: EntityKind, id: EntityId) -> Option<bool> {
        if self.is_inserted(kind, id) {
            Some(false)
        } else if self.is_updated(kind, id) {
            Some(true)
        } else {
            None
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind
            .values()
            .all(|c| c.inserted.is_empty() && c.updated.is_empty() && c.deleted.is_empty())
    }

    fn set<'a>(
        &'a self,
        kind: EntityKind,
        pick: impl Fn(&'a KindChanges) -> &'a BTreeSet<EntityId>,
    ) -> impl Iterator<Item = EntityId> + 'a {
        self.by_kind
            .get(&kind)
            .map(pick)
            .into_iter()
            .flatten()
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use mirror_store::EcChangeRow;

    use super::*;

    #[test]
    fn insert_update_delete_nets_to_nothing() {
        let mut changed = ChangedInstanceIds::default();
        let id = EntityId(0xa);
        changed.absorb(EntityKind::Element, id, ChangeOp::Inserted);
        changed.absorb(EntityKind::Element, id, ChangeOp::Updated);
        changed.absorb(EntityKind::Element, id, ChangeOp::Deleted);

        assert!(!changed.is_inserted(EntityKind::Element, id));
        assert!(!changed.is_updated(EntityKind::Element, id));
        assert!(!changed.is_deleted(EntityKind::Element, id));
        assert!(changed.is_empty());
    }

    #[test]
    fn update_of_fresh_insert_stays_an_insert() {
        let mut changed = ChangedInstanceIds::default();
        let id = EntityId(0xa);
        changed.absorb(EntityKind::Element, id, ChangeOp::Inserted);
        changed.absorb(EntityKind::Element, id, ChangeOp::Updated);

        assert_eq!(changed.export_disposition(EntityKind::Element, id), Some(false));
    }

    #[test]
    fn delete_after_update_wins() {
        let mut changed = ChangedInstanceIds::default();
        let id = EntityId(0xa);
        changed.absorb(EntityKind::Element, id, ChangeOp::Updated);
        changed.absorb(EntityKind::Element, id, ChangeOp::Deleted);

        assert!(!changed.is_updated(EntityKind::Element, id));
        assert!(changed.is_deleted(EntityKind::Element, id));
    }

    #[test]
    fn delete_then_insert_is_a_same_id_recreation() {
        let mut changed = ChangedInstanceIds::default();
        let id = EntityId(0xa);
        changed.absorb(EntityKind::Element, id, ChangeOp::Deleted);
        changed.absorb(EntityKind::Element, id, ChangeOp::Inserted);

        assert!(changed.is_inserted(EntityKind::Element, id));
        assert!(!changed.is_deleted(EntityKind::Element, id));
    }

    #[test]
    fn derived_relationships_are_filtered_out() {
        let catalog = Catalog::base();
        let changesets = [ChangesetData {
            rows: vec![
                EcChangeRow {
                    class_name: classes::ELEMENT_DRIVES_ELEMENT.to_string(),
                    instance_id: EntityId(1),
                    op: ChangeOp::Inserted,
                    old_values: None,
                    new_values: None,
                },
                EcChangeRow {
                    class_name: classes::ELEMENT_GROUPS_MEMBERS.to_string(),
                    instance_id: EntityId(2),
                    op: ChangeOp::Inserted,
                    old_values: None,
                    new_values: None,
                },
            ],
            ..Default::default()
        }];
        let changed = ChangedInstanceIds::from_changesets(&catalog, &changesets);

        assert!(!changed.is_inserted(EntityKind::Relationship, EntityId(1)));
        assert!(changed.is_inserted(EntityKind::Relationship, EntityId(2)));
    }

    #[test]
    fn kinds_come_from_the_catalog() {
        let catalog = Catalog::base();
        let changesets = [ChangesetData {
            rows: vec![
                EcChangeRow {
                    class_name: classes::PHYSICAL_MODEL.to_string(),
                    instance_id: EntityId(0x20),
                    op: ChangeOp::Updated,
                    old_values: None,
                    new_values: None,
                },
                EcChangeRow {
                    class_name: "No.SuchClass".to_string(),
                    instance_id: EntityId(0x21),
                    op: ChangeOp::Inserted,
                    old_values: None,
                    new_values: None,
                },
            ],
            ..Default::default()
        }];
        let changed = ChangedInstanceIds::from_changesets(&catalog, &changesets);

        assert!(changed.is_updated(EntityKind::Model, EntityId(0x20)));
        // Unknown classes are dropped rather than misfiled.
        for kind in EntityKind::ALL {
            assert!(!changed.is_inserted(kind, EntityId(0x21)));
        }
    }
}
