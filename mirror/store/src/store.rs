// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use mirror_types::{Code, EntityId, EntityKind, FederationGuid};

use crate::catalog::{Catalog, ClassDef, SchemaDef};
use crate::changeset::{ChangesetData, ChangesetInfo};
use crate::records::{
    AspectRecord, CodeSpecRecord, ElementRecord, FontRecord, FontType, ModelRecord,
    ProjectExtents, RelationshipRecord,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("duplicate: {0}")]
    Duplicate(String),
    #[error("changeset {0} not available")]
    ChangesetUnavailable(i64),
    #[error("i/o failure: {0}")]
    Io(String),
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(kind: EntityKind, id: EntityId) -> Self {
        StoreError::NotFound { kind, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The relational store the engine runs against.
///
/// Implementations take `&self` and guard their own state; the engine holds
/// stores behind `Arc<dyn Store>` and never shares one across runs. Inserts
/// with an invalid id assign the next free id and return it; inserts with a
/// valid id honor it (used by preserve-element-ids runs) or fail on
/// collision.
pub trait Store: Send + Sync {
    /// Stable identity of this database, used as the provenance scope
    /// identifier.
    fn db_id(&self) -> String;

    /// A point-in-time copy of the metadata catalog.
    fn catalog(&self) -> Catalog;

    /// Upserts a schema row and merges its class rows into the catalog. The
    /// caller decides version precedence.
    fn import_schema(&self, schema: &SchemaDef, classes: &[ClassDef]) -> StoreResult<()>;

    // --- elements ---

    fn element(&self, id: EntityId) -> Option<ElementRecord>;
    fn element_id_by_guid(&self, guid: &FederationGuid) -> Option<EntityId>;
    fn element_id_by_code(&self, code: &Code) -> Option<EntityId>;
    /// `(guid, element id)` pairs for every element carrying a federation
    /// guid, ascending by guid. Feeds the two-pointer provenance sweep.
    fn elements_with_guid_sorted(&self) -> Vec<(FederationGuid, EntityId)>;
    /// Direct children, ascending by id.
    fn child_elements(&self, parent: EntityId) -> Vec<EntityId>;
    fn element_count(&self) -> usize;
    fn insert_element(&self, record: ElementRecord) -> StoreResult<EntityId>;
    fn update_element(&self, record: ElementRecord) -> StoreResult<()>;
    /// Deletes one element and its owned aspects and children. Refuses while
    /// a model with the same id still exists.
    fn delete_element(&self, id: EntityId) -> StoreResult<()>;
    /// Deletes an element tree, cascading through sub-models and their
    /// contents.
    fn delete_element_tree(&self, id: EntityId) -> StoreResult<()>;

    // --- models ---

    fn model(&self, id: EntityId) -> Option<ModelRecord>;
    fn model_ids(&self) -> Vec<EntityId>;
    /// All elements contained in the model, ascending by id.
    fn model_contents(&self, model_id: EntityId) -> Vec<EntityId>;
    fn insert_model(&self, record: ModelRecord) -> StoreResult<()>;
    fn update_model(&self, record: ModelRecord) -> StoreResult<()>;
    /// Deletes the model row only. Refuses for a definition model that still
    /// contains elements.
    fn delete_model(&self, id: EntityId) -> StoreResult<()>;

    // --- aspects ---

    fn aspect(&self, id: EntityId) -> Option<AspectRecord>;
    /// Aspects owned by the element, ascending by id.
    fn aspects_of_element(&self, element_id: EntityId) -> Vec<AspectRecord>;
    /// All aspects of the class or a subclass, ascending by id. Feeds
    /// provenance lookups and polymorphic exclusion.
    fn aspects_by_class(&self, class_name: &str) -> Vec<AspectRecord>;
    fn insert_aspect(&self, record: AspectRecord) -> StoreResult<EntityId>;
    fn update_aspect(&self, record: AspectRecord) -> StoreResult<()>;
    fn delete_aspect(&self, id: EntityId) -> StoreResult<()>;

    // --- relationships ---

    fn relationship(&self, id: EntityId) -> Option<RelationshipRecord>;
    fn relationship_ids(&self) -> Vec<EntityId>;
    fn find_relationship(
        &self,
        class_name: &str,
        source_id: EntityId,
        target_id: EntityId,
    ) -> Option<RelationshipRecord>;
    fn insert_relationship(&self, record: RelationshipRecord) -> StoreResult<EntityId>;
    fn update_relationship(&self, record: RelationshipRecord) -> StoreResult<()>;
    fn delete_relationship(&self, id: EntityId) -> StoreResult<()>;

    // --- code specs and fonts ---

    fn code_spec(&self, id: EntityId) -> Option<CodeSpecRecord>;
    fn code_spec_by_name(&self, name: &str) -> Option<CodeSpecRecord>;
    fn code_spec_ids(&self) -> Vec<EntityId>;
    fn insert_code_spec(&self, record: CodeSpecRecord) -> StoreResult<EntityId>;

    fn font(&self, id: EntityId) -> Option<FontRecord>;
    fn font_by_identity(&self, font_type: FontType, name: &str) -> Option<FontRecord>;
    fn fonts(&self) -> Vec<FontRecord>;
    fn insert_font(&self, record: FontRecord) -> StoreResult<EntityId>;

    // --- changesets ---

    /// Identity of the newest changeset this store has applied or sealed.
    /// Index 0 with an empty id is the baseline.
    fn changeset(&self) -> ChangesetInfo;
    /// Applied changesets in the inclusive index range, ascending.
    fn changesets_in_range(&self, first: i64, last: i64) -> StoreResult<Vec<ChangesetData>>;
    /// Seals every mutation since the previous seal into a new changeset and
    /// advances the tip. This is the `saveChanges` boundary.
    fn seal_changeset(&self, id: &str, description: &str) -> StoreResult<ChangesetInfo>;
    /// Whether any mutation happened since the last seal.
    fn has_unsaved_changes(&self) -> bool;

    // --- change cache ---

    /// Makes change-stream queries available. Paired with
    /// [`Store::detach_change_cache`]; the engine wraps the pair in a guard.
    fn attach_change_cache(&self) -> StoreResult<()>;
    fn detach_change_cache(&self);
    fn is_change_cache_attached(&self) -> bool;

    // --- geometry bookkeeping ---

    fn project_extents(&self) -> ProjectExtents;
    fn set_project_extents(&self, extents: ProjectExtents);
    /// Bounds of every geometric element, for extents recomputation.
    fn geometric_extents(&self) -> Vec<[f64; 6]>;
}
