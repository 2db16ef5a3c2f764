// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tracing::{debug, info};

use mirror_store::{
    strip_empty_blobs, AspectOwnership, AspectRecord, ElementRecord, ModelRecord, ProjectExtents,
    RelationshipRecord, Store, EXTERNAL_SOURCE_ASPECT_CLASS,
};
use mirror_types::{EntityId, ROOT_SUBJECT};

use crate::error::{MirrorError, MirrorResult};

/// Narrow mutation façade over the target store.
///
/// Records with an invalid id insert and return the newly assigned id;
/// records with a valid id update in place. Insert and update failures are
/// fatal; deletes surface an inspectable not-found the change-driven caller
/// swallows.
pub struct Importer {
    target: Arc<dyn Store>,
}

impl Importer {
    pub fn new(target: Arc<dyn Store>) -> Self {
        Self { target }
    }

    pub fn import_element(&self, record: ElementRecord) -> MirrorResult<EntityId> {
        if record.id == ROOT_SUBJECT {
            return Err(MirrorError::InvalidArgument(
                "the root subject cannot be imported directly".to_string(),
            ));
        }
        if record.id.is_valid() && self.target.element(record.id).is_some() {
            let id = record.id;
            self.target.update_element(record)?;
            debug!(element = %id, "updated element");
            Ok(id)
        } else {
            let id = self.target.insert_element(record)?;
            debug!(element = %id, "inserted element");
            Ok(id)
        }
    }

    pub fn import_model(&self, record: ModelRecord) -> MirrorResult<EntityId> {
        let id = record.id;
        if self.target.model(id).is_some() {
            self.target.update_model(record)?;
        } else {
            self.target.insert_model(record)?;
        }
        Ok(id)
    }

    /// Upserts a unique aspect, keyed by `(owner, class)`.
    pub fn import_element_unique_aspect(&self, mut record: AspectRecord) -> MirrorResult<EntityId> {
        record.ownership = AspectOwnership::Unique;
        let existing = self
            .target
            .aspects_of_element(record.element_id)
            .into_iter()
            .find(|a| a.class_name == record.class_name);
        match existing {
            Some(current) => {
                record.id = current.id;
                self.target.update_aspect(record)?;
                Ok(current.id)
            }
            None => {
                record.id = EntityId::INVALID;
                Ok(self.target.insert_aspect(record)?)
            }
        }
    }

    /// Replaces the owner's multi-aspects of the classes present in the
    /// batch. Provenance aspects are never touched here; they belong to the
    /// provenance writer.
    pub fn import_element_multi_aspects(
        &self,
        element_id: EntityId,
        records: Vec<AspectRecord>,
    ) -> MirrorResult<Vec<EntityId>> {
        let classes: Vec<String> = records
            .iter()
            .map(|r| r.class_name.clone())
            .filter(|c| c != EXTERNAL_SOURCE_ASPECT_CLASS)
            .collect();
        for stale in self.target.aspects_of_element(element_id) {
            if stale.ownership == AspectOwnership::Multi && classes.contains(&stale.class_name) {
                self.target.delete_aspect(stale.id)?;
            }
        }

        let mut inserted = vec![];
        for mut record in records {
            if record.class_name == EXTERNAL_SOURCE_ASPECT_CLASS {
                continue;
            }
            record.id = EntityId::INVALID;
            record.element_id = element_id;
            record.ownership = AspectOwnership::Multi;
            inserted.push(self.target.insert_aspect(record)?);
        }
        Ok(inserted)
    }

    /// Upserts a relationship, keyed by `(class, source, target)`.
    pub fn import_relationship(&self, mut record: RelationshipRecord) -> MirrorResult<EntityId> {
        let existing = self.target.find_relationship(
            &record.class_name,
            record.source_id,
            record.target_id,
        );
        match existing {
            Some(current) => {
                record.id = current.id;
                self.target.update_relationship(record)?;
                Ok(current.id)
            }
            None => {
                record.id = EntityId::INVALID;
                Ok(self.target.insert_relationship(record)?)
            }
        }
    }

    pub fn delete_element(&self, id: EntityId) -> MirrorResult<()> {
        self.target.delete_element(id)?;
        debug!(element = %id, "deleted element");
        Ok(())
    }

    /// Deletes an element tree, cascading through sub-models. Used when a
    /// model delete had to be deferred to its modeled partition.
    pub fn delete_element_tree(&self, id: EntityId) -> MirrorResult<()> {
        self.target.delete_element_tree(id)?;
        debug!(element = %id, "deleted element tree");
        Ok(())
    }

    pub fn delete_model(&self, id: EntityId) -> MirrorResult<()> {
        self.target.delete_model(id)?;
        Ok(())
    }

    pub fn delete_relationship(&self, id: EntityId) -> MirrorResult<()> {
        self.target.delete_relationship(id)?;
        Ok(())
    }

    pub fn delete_aspect(&self, id: EntityId) -> MirrorResult<()> {
        self.target.delete_aspect(id)?;
        Ok(())
    }

    /// Rewrites geometry streams that carry dead weight. Returns how many
    /// rows changed.
    pub fn optimize_geometry(&self) -> MirrorResult<usize> {
        let mut rewritten = 0;
        for model_id in self.target.model_ids() {
            for element_id in self.target.model_contents(model_id) {
                let Some(element) = self.target.element(element_id) else {
                    continue;
                };
                let Some(geometry) = &element.geometry else {
                    continue;
                };
                if let Some(optimized) = strip_empty_blobs(geometry)? {
                    let mut updated = element.clone();
                    updated.geometry = Some(optimized);
                    self.target.update_element(updated)?;
                    rewritten += 1;
                }
            }
        }
        if rewritten > 0 {
            info!(rewritten, "optimized geometry streams");
        }
        Ok(rewritten)
    }

    /// Recomputes the project volume from every geometric element's bounds.
    pub fn compute_project_extents(&self) -> MirrorResult<ProjectExtents> {
        let extents = ProjectExtents::from_extents(self.target.geometric_extents().iter());
        self.target.set_project_extents(extents);
        Ok(extents)
    }

    /// Whether a delete failure means the entity was already gone.
    pub fn is_ignorable_delete_error(error: &MirrorError) -> bool {
        error.is_not_found()
    }
}
