// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use mirror_types::{
    Code, EntityId, EntityKind, FederationGuid, DICTIONARY_MODEL, LINK_PARTITION, ROOT_SUBJECT,
};

use crate::catalog::{classes, Catalog, ClassDef, SchemaDef};
use crate::changeset::{ChangeOp, ChangesetData, ChangesetInfo, EcChangeRow};
use crate::records::{
    AspectOwnership, AspectRecord, CodeSpecRecord, ElementRecord, FontRecord, FontType,
    ModelRecord, ProjectExtents, RelationshipRecord,
};
use crate::store::{Store, StoreError, StoreResult};

/// In-memory store. Backs every test and the snapshot-file tooling; sealing
/// mutations into changesets makes it usable as its own changeset hub.
pub struct MemStore {
    inner: RwLock<Inner>,
}

#[derive(Serialize, Deserialize)]
struct Inner {
    db_id: String,
    catalog: Catalog,
    elements: BTreeMap<EntityId, ElementRecord>,
    models: BTreeMap<EntityId, ModelRecord>,
    aspects: BTreeMap<EntityId, AspectRecord>,
    relationships: BTreeMap<EntityId, RelationshipRecord>,
    code_specs: BTreeMap<EntityId, CodeSpecRecord>,
    fonts: BTreeMap<EntityId, FontRecord>,
    next_element_id: u64,
    next_aspect_id: u64,
    next_relationship_id: u64,
    next_code_spec_id: u64,
    next_font_id: u64,
    project_extents: ProjectExtents,
    mod_counter: u64,
    tip: ChangesetInfo,
    applied: Vec<ChangesetData>,
    pending_rows: Vec<EcChangeRow>,
    #[serde(skip)]
    change_cache_attached: bool,
}

impl MemStore {
    /// Creates a store seeded with the base structure every database has:
    /// the repository model, the root subject, the link partition, and the
    /// dictionary partition with its definition model.
    pub fn new(db_id: impl Into<String>) -> Self {
        let mut inner = Inner {
            db_id: db_id.into(),
            catalog: Catalog::base(),
            elements: BTreeMap::new(),
            models: BTreeMap::new(),
            aspects: BTreeMap::new(),
            relationships: BTreeMap::new(),
            code_specs: BTreeMap::new(),
            fonts: BTreeMap::new(),
            next_element_id: 0x11,
            next_aspect_id: 1,
            next_relationship_id: 1,
            next_code_spec_id: 1,
            next_font_id: 1,
            project_extents: ProjectExtents::default(),
            mod_counter: 0,
            tip: ChangesetInfo::default(),
            applied: vec![],
            pending_rows: vec![],
            change_cache_attached: false,
        };

        inner.models.insert(
            ROOT_SUBJECT,
            ModelRecord {
                id: ROOT_SUBJECT,
                class_name: classes::REPOSITORY_MODEL.to_string(),
                ..Default::default()
            },
        );
        inner.elements.insert(
            ROOT_SUBJECT,
            ElementRecord {
                id: ROOT_SUBJECT,
                class_name: classes::SUBJECT.to_string(),
                model_id: ROOT_SUBJECT,
                user_label: Some("root".to_string()),
                ..Default::default()
            },
        );
        inner.elements.insert(
            LINK_PARTITION,
            ElementRecord {
                id: LINK_PARTITION,
                class_name: classes::INFORMATION_PARTITION.to_string(),
                model_id: ROOT_SUBJECT,
                parent_id: Some(ROOT_SUBJECT),
                ..Default::default()
            },
        );
        inner.elements.insert(
            DICTIONARY_MODEL,
            ElementRecord {
                id: DICTIONARY_MODEL,
                class_name: classes::DEFINITION_PARTITION.to_string(),
                model_id: ROOT_SUBJECT,
                parent_id: Some(ROOT_SUBJECT),
                ..Default::default()
            },
        );
        inner.models.insert(
            DICTIONARY_MODEL,
            ModelRecord {
                id: DICTIONARY_MODEL,
                class_name: classes::DEFINITION_MODEL.to_string(),
                ..Default::default()
            },
        );

        Self {
            inner: RwLock::new(inner),
        }
    }

    /// Registers a domain schema in the catalog.
    pub fn register_schema(&self, name: &str, version: (u32, u32, u32)) {
        self.inner
            .write()
            .catalog
            .register_schema(name, version, false);
    }

    /// Registers a class in the catalog. Test and tooling entry point; real
    /// backends get their catalog from schema import.
    pub fn register_class(
        &self,
        name: &str,
        base: Option<&str>,
        kind: EntityKind,
        navigation_properties: &[&str],
    ) {
        self.inner
            .write()
            .catalog
            .register_class(name, base, kind, navigation_properties);
    }

    pub fn save_snapshot(&self, path: &Path) -> StoreResult<()> {
        let inner = self.inner.read();
        let text = serde_json::to_string_pretty(&*inner)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| StoreError::Io(e.to_string()))
    }

    pub fn load_snapshot(path: &Path) -> StoreResult<MemStore> {
        let text = std::fs::read_to_string(path).map_err(|e| StoreError::Io(e.to_string()))?;
        let mut inner: Inner =
            serde_json::from_str(&text).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        inner.catalog.reindex();
        Ok(MemStore {
            inner: RwLock::new(inner),
        })
    }
}

impl Inner {
    fn bump(&mut self) -> u64 {
        self.mod_counter += 1;
        self.mod_counter
    }

    fn record_op(
        &mut self,
        class_name: &str,
        instance_id: EntityId,
        op: ChangeOp,
        old: Option<serde_json::Value>,
        new: Option<serde_json::Value>,
    ) {
        self.pending_rows.push(EcChangeRow {
            class_name: class_name.to_string(),
            instance_id,
            op,
            old_values: old,
            new_values: new,
        });
    }

    fn delete_element_inner(&mut self, id: EntityId, cascade_models: bool) -> StoreResult<()> {
        let Some(element) = self.elements.get(&id).cloned() else {
            return Err(StoreError::not_found(EntityKind::Element, id));
        };

        if self.models.contains_key(&id) {
            if !cascade_models {
                return Err(StoreError::Constraint(format!(
                    "element {id} is modeled by an existing model"
                )));
            }
            // Empty the sub-model before dropping its row, contents first.
            let contents: Vec<EntityId> = self
                .elements
                .values()
                .filter(|e| e.model_id == id && e.id != id)
                .map(|e| e.id)
                .collect();
            for content_id in contents {
                if self.elements.contains_key(&content_id) {
                    self.delete_element_inner(content_id, true)?;
                }
            }
            let model = self.models.remove(&id).expect("model presence checked");
            let old = serde_json::to_value(&model).ok();
            self.record_op(&model.class_name, id, ChangeOp::Deleted, old, None);
        }

        let children: Vec<EntityId> = self
            .elements
            .values()
            .filter(|e| e.parent_id == Some(id))
            .map(|e| e.id)
            .collect();
        for child in children {
            if self.elements.contains_key(&child) {
                self.delete_element_inner(child, cascade_models)?;
            }
        }

        let owned: Vec<AspectRecord> = self
            .aspects
            .values()
            .filter(|a| a.element_id == id)
            .cloned()
            .collect();
        for aspect in owned {
            self.aspects.remove(&aspect.id);
            let old = serde_json::to_value(&aspect).ok();
            self.record_op(&aspect.class_name, aspect.id, ChangeOp::Deleted, old, None);
        }

        self.elements.remove(&id);
        let old = serde_json::to_value(&element).ok();
        self.record_op(&element.class_name, id, ChangeOp::Deleted, old, None);
        Ok(())
    }
}

impl Store for MemStore {
    fn db_id(&self) -> String {
        self.inner.read().db_id.clone()
    }

    fn catalog(&self) -> Catalog {
        self.inner.read().catalog.clone()
    }

    fn import_schema(&self, schema: &SchemaDef, classes: &[ClassDef]) -> StoreResult<()> {
        let mut inner = self.inner.write();
        inner.catalog.import_schema(schema);
        inner.catalog.import_classes(classes);
        Ok(())
    }

    fn element(&self, id: EntityId) -> Option<ElementRecord> {
        self.inner.read().elements.get(&id).cloned()
    }

    fn element_id_by_guid(&self, guid: &FederationGuid) -> Option<EntityId> {
        self.inner
            .read()
            .elements
            .values()
            .find(|e| e.federation_guid.as_ref() == Some(guid))
            .map(|e| e.id)
    }

    fn element_id_by_code(&self, code: &Code) -> Option<EntityId> {
        if code.is_empty() || !code.has_valid_scope() {
            return None;
        }
        self.inner
            .read()
            .elements
            .values()
            .find(|e| e.code == *code)
            .map(|e| e.id)
    }

    fn elements_with_guid_sorted(&self) -> Vec<(FederationGuid, EntityId)> {
        let inner = self.inner.read();
        let mut pairs: Vec<(FederationGuid, EntityId)> = inner
            .elements
            .values()
            .filter_map(|e| e.federation_guid.map(|guid| (guid, e.id)))
            .collect();
        pairs.sort();
        pairs
    }

    fn child_elements(&self, parent: EntityId) -> Vec<EntityId> {
        self.inner
            .read()
            .elements
            .values()
            .filter(|e| e.parent_id == Some(parent))
            .map(|e| e.id)
            .collect()
    }

    fn element_count(&self) -> usize {
        self.inner.read().elements.len()
    }

    fn insert_element(&self, mut record: ElementRecord) -> StoreResult<EntityId> {
        let mut inner = self.inner.write();
        if record.id.is_valid() {
            if inner.elements.contains_key(&record.id) {
                return Err(StoreError::Duplicate(format!("element id {}", record.id)));
            }
            inner.next_element_id = inner.next_element_id.max(record.id.0 + 1);
        } else {
            record.id = EntityId(inner.next_element_id);
            inner.next_element_id += 1;
        }
        if !record.code.is_empty() {
            if let Some(existing) = inner
                .elements
                .values()
                .find(|e| e.code == record.code)
                .map(|e| e.id)
            {
                return Err(StoreError::Duplicate(format!(
                    "code {:?} already used by element {existing}",
                    record.code.value
                )));
            }
        }
        record.last_modified = inner.bump();
        let new = serde_json::to_value(&record).ok();
        inner.record_op(&record.class_name, record.id, ChangeOp::Inserted, None, new);
        let id = record.id;
        inner.elements.insert(id, record);
        Ok(id)
    }

    fn update_element(&self, mut record: ElementRecord) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let Some(existing) = inner.elements.get(&record.id).cloned() else {
            return Err(StoreError::not_found(EntityKind::Element, record.id));
        };
        record.last_modified = inner.bump();
        let old = serde_json::to_value(&existing).ok();
        let new = serde_json::to_value(&record).ok();
        inner.record_op(&record.class_name, record.id, ChangeOp::Updated, old, new);
        inner.elements.insert(record.id, record);
        Ok(())
    }

    fn delete_element(&self, id: EntityId) -> StoreResult<()> {
        self.inner.write().delete_element_inner(id, false)
    }

    fn delete_element_tree(&self, id: EntityId) -> StoreResult<()> {
        self.inner.write().delete_element_inner(id, true)
    }

    fn model(&self, id: EntityId) -> Option<ModelRecord> {
        self.inner.read().models.get(&id).cloned()
    }

    fn model_ids(&self) -> Vec<EntityId> {
        self.inner.read().models.keys().copied().collect()
    }

    fn model_contents(&self, model_id: EntityId) -> Vec<EntityId> {
        self.inner
            .read()
            .elements
            .values()
            .filter(|e| e.model_id == model_id && e.id != model_id)
            .map(|e| e.id)
            .collect()
    }

    fn insert_model(&self, mut record: ModelRecord) -> StoreResult<()> {
        let mut inner = self.inner.write();
        if !record.id.is_valid() {
            return Err(StoreError::Constraint(
                "a model shares its id with its modeled element".to_string(),
            ));
        }
        if inner.models.contains_key(&record.id) {
            return Err(StoreError::Duplicate(format!("model id {}", record.id)));
        }
        record.last_modified = inner.bump();
        let new = serde_json::to_value(&record).ok();
        inner.record_op(&record.class_name, record.id, ChangeOp::Inserted, None, new);
        inner.models.insert(record.id, record);
        Ok(())
    }

    fn update_model(&self, mut record: ModelRecord) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let Some(existing) = inner.models.get(&record.id).cloned() else {
            return Err(StoreError::not_found(EntityKind::Model, record.id));
        };
        record.last_modified = inner.bump();
        let old = serde_json::to_value(&existing).ok();
        let new = serde_json::to_value(&record).ok();
        inner.record_op(&record.class_name, record.id, ChangeOp::Updated, old, new);
        inner.models.insert(record.id, record);
        Ok(())
    }

    fn delete_model(&self, id: EntityId) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let Some(model) = inner.models.get(&id).cloned() else {
            return Err(StoreError::not_found(EntityKind::Model, id));
        };
        let has_contents = inner
            .elements
            .values()
            .any(|e| e.model_id == id && e.id != id);
        if has_contents
            && inner
                .catalog
                .is_subclass_of(&model.class_name, classes::DEFINITION_MODEL)
        {
            return Err(StoreError::Constraint(format!(
                "definition model {id} still contains elements"
            )));
        }
        inner.models.remove(&id);
        let old = serde_json::to_value(&model).ok();
        inner.record_op(&model.class_name, id, ChangeOp::Deleted, old, None);
        Ok(())
    }

    fn aspect(&self, id: EntityId) -> Option<AspectRecord> {
        self.inner.read().aspects.get(&id).cloned()
    }

    fn aspects_of_element(&self, element_id: EntityId) -> Vec<AspectRecord> {
        self.inner
            .read()
            .aspects
            .values()
            .filter(|a| a.element_id == element_id)
            .cloned()
            .collect()
    }

    fn aspects_by_class(&self, class_name: &str) -> Vec<AspectRecord> {
        let inner = self.inner.read();
        inner
            .aspects
            .values()
            .filter(|a| inner.catalog.is_subclass_of(&a.class_name, class_name))
            .cloned()
            .collect()
    }

    fn insert_aspect(&self, mut record: AspectRecord) -> StoreResult<EntityId> {
        let mut inner = self.inner.write();
        if !inner.elements.contains_key(&record.element_id) {
            return Err(StoreError::Constraint(format!(
                "aspect owner {} does not exist",
                record.element_id
            )));
        }
        if record.ownership == AspectOwnership::Unique {
            let occupied = inner.aspects.values().any(|a| {
                a.element_id == record.element_id && a.class_name == record.class_name
            });
            if occupied {
                return Err(StoreError::Constraint(format!(
                    "element {} already carries a unique {} aspect",
                    record.element_id, record.class_name
                )));
            }
        }
        if record.id.is_valid() {
            if inner.aspects.contains_key(&record.id) {
                return Err(StoreError::Duplicate(format!("aspect id {}", record.id)));
            }
            inner.next_aspect_id = inner.next_aspect_id.max(record.id.0 + 1);
        } else {
            record.id = EntityId(inner.next_aspect_id);
            inner.next_aspect_id += 1;
        }
        record.last_modified = inner.bump();
        let new = serde_json::to_value(&record).ok();
        inner.record_op(&record.class_name, record.id, ChangeOp::Inserted, None, new);
        let id = record.id;
        inner.aspects.insert(id, record);
        Ok(id)
    }

    fn update_aspect(&self, mut record: AspectRecord) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let Some(existing) = inner.aspects.get(&record.id).cloned() else {
            return Err(StoreError::not_found(EntityKind::ElementAspect, record.id));
        };
        record.last_modified = inner.bump();
        let old = serde_json::to_value(&existing).ok();
        let new = serde_json::to_value(&record).ok();
        inner.record_op(&record.class_name, record.id, ChangeOp::Updated, old, new);
        inner.aspects.insert(record.id, record);
        Ok(())
    }

    fn delete_aspect(&self, id: EntityId) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let Some(aspect) = inner.aspects.remove(&id) else {
            return Err(StoreError::not_found(EntityKind::ElementAspect, id));
        };
        let old = serde_json::to_value(&aspect).ok();
        inner.record_op(&aspect.class_name, id, ChangeOp::Deleted, old, None);
        Ok(())
    }

    fn relationship(&self, id: EntityId) -> Option<RelationshipRecord> {
        self.inner.read().relationships.get(&id).cloned()
    }

    fn relationship_ids(&self) -> Vec<EntityId> {
        self.inner.read().relationships.keys().copied().collect()
    }

    fn find_relationship(
        &self,
        class_name: &str,
        source_id: EntityId,
        target_id: EntityId,
    ) -> Option<RelationshipRecord> {
        self.inner
            .read()
            .relationships
            .values()
            .find(|r| {
                r.class_name == class_name && r.source_id == source_id && r.target_id == target_id
            })
            .cloned()
    }

    fn insert_relationship(&self, mut record: RelationshipRecord) -> StoreResult<EntityId> {
        let mut inner = self.inner.write();
        for endpoint in [record.source_id, record.target_id] {
            if !inner.elements.contains_key(&endpoint) {
                return Err(StoreError::Constraint(format!(
                    "relationship endpoint {endpoint} does not exist"
                )));
            }
        }
        if record.id.is_valid() {
            if inner.relationships.contains_key(&record.id) {
                return Err(StoreError::Duplicate(format!(
                    "relationship id {}",
                    record.id
                )));
            }
            inner.next_relationship_id = inner.next_relationship_id.max(record.id.0 + 1);
        } else {
            record.id = EntityId(inner.next_relationship_id);
            inner.next_relationship_id += 1;
        }
        record.last_modified = inner.bump();
        let new = serde_json::to_value(&record).ok();
        inner.record_op(&record.class_name, record.id, ChangeOp::Inserted, None, new);
        let id = record.id;
        inner.relationships.insert(id, record);
        Ok(id)
    }

    fn update_relationship(&self, mut record: RelationshipRecord) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let Some(existing) = inner.relationships.get(&record.id).cloned() else {
            return Err(StoreError::not_found(EntityKind::Relationship, record.id));
        };
        record.last_modified = inner.bump();
        let old = serde_json::to_value(&existing).ok();
        let new = serde_json::to_value(&record).ok();
        inner.record_op(&record.class_name, record.id, ChangeOp::Updated, old, new);
        inner.relationships.insert(record.id, record);
        Ok(())
    }

    fn delete_relationship(&self, id: EntityId) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let Some(relationship) = inner.relationships.remove(&id) else {
            return Err(StoreError::not_found(EntityKind::Relationship, id));
        };
        let old = serde_json::to_value(&relationship).ok();
        inner.record_op(&relationship.class_name, id, ChangeOp::Deleted, old, None);
        Ok(())
    }

    fn code_spec(&self, id: EntityId) -> Option<CodeSpecRecord> {
        self.inner.read().code_specs.get(&id).cloned()
    }

    fn code_spec_by_name(&self, name: &str) -> Option<CodeSpecRecord> {
        self.inner
            .read()
            .code_specs
            .values()
            .find(|c| c.name == name)
            .cloned()
    }

    fn code_spec_ids(&self) -> Vec<EntityId> {
        self.inner.read().code_specs.keys().copied().collect()
    }

    fn insert_code_spec(&self, mut record: CodeSpecRecord) -> StoreResult<EntityId> {
        let mut inner = self.inner.write();
        if inner.code_specs.values().any(|c| c.name == record.name) {
            return Err(StoreError::Duplicate(format!(
                "code spec name {:?}",
                record.name
            )));
        }
        if record.id.is_valid() {
            if inner.code_specs.contains_key(&record.id) {
                return Err(StoreError::Duplicate(format!("code spec id {}", record.id)));
            }
            inner.next_code_spec_id = inner.next_code_spec_id.max(record.id.0 + 1);
        } else {
            record.id = EntityId(inner.next_code_spec_id);
            inner.next_code_spec_id += 1;
        }
        let new = serde_json::to_value(&record).ok();
        inner.record_op(classes::CODE_SPEC, record.id, ChangeOp::Inserted, None, new);
        let id = record.id;
        inner.code_specs.insert(id, record);
        Ok(id)
    }

    fn font(&self, id: EntityId) -> Option<FontRecord> {
        self.inner.read().fonts.get(&id).cloned()
    }

    fn font_by_identity(&self, font_type: FontType, name: &str) -> Option<FontRecord> {
        self.inner
            .read()
            .fonts
            .values()
            .find(|f| f.font_type == font_type && f.name == name)
            .cloned()
    }

    fn fonts(&self) -> Vec<FontRecord> {
        self.inner.read().fonts.values().cloned().collect()
    }

    fn insert_font(&self, mut record: FontRecord) -> StoreResult<EntityId> {
        let mut inner = self.inner.write();
        if inner
            .fonts
            .values()
            .any(|f| f.font_type == record.font_type && f.name == record.name)
        {
            return Err(StoreError::Duplicate(format!("font {:?}", record.name)));
        }
        if record.id.is_valid() {
            if inner.fonts.contains_key(&record.id) {
                return Err(StoreError::Duplicate(format!("font id {}", record.id)));
            }
            inner.next_font_id = inner.next_font_id.max(record.id.0 + 1);
        } else {
            record.id = EntityId(inner.next_font_id);
            inner.next_font_id += 1;
        }
        let new = serde_json::to_value(&record).ok();
        inner.record_op(classes::FONT, record.id, ChangeOp::Inserted, None, new);
        let id = record.id;
        inner.fonts.insert(id, record);
        Ok(id)
    }

    fn changeset(&self) -> ChangesetInfo {
        self.inner.read().tip.clone()
    }

    fn changesets_in_range(&self, first: i64, last: i64) -> StoreResult<Vec<ChangesetData>> {
        let inner = self.inner.read();
        let mut result = vec![];
        for index in first..=last {
            let Some(data) = inner.applied.iter().find(|c| c.info.index == index) else {
                return Err(StoreError::ChangesetUnavailable(index));
            };
            result.push(data.clone());
        }
        Ok(result)
    }

    fn seal_changeset(&self, id: &str, description: &str) -> StoreResult<ChangesetInfo> {
        let mut inner = self.inner.write();
        let info = ChangesetInfo {
            id: id.to_string(),
            index: inner.tip.index + 1,
            description: description.to_string(),
        };
        let rows = std::mem::take(&mut inner.pending_rows);
        debug!(id, index = info.index, rows = rows.len(), "sealed changeset");
        inner.applied.push(ChangesetData {
            info: info.clone(),
            rows,
        });
        inner.tip = info.clone();
        Ok(info)
    }

    fn has_unsaved_changes(&self) -> bool {
        !self.inner.read().pending_rows.is_empty()
    }

    fn attach_change_cache(&self) -> StoreResult<()> {
        self.inner.write().change_cache_attached = true;
        Ok(())
    }

    fn detach_change_cache(&self) {
        self.inner.write().change_cache_attached = false;
    }

    fn is_change_cache_attached(&self) -> bool {
        self.inner.read().change_cache_attached
    }

    fn project_extents(&self) -> ProjectExtents {
        self.inner.read().project_extents
    }

    fn set_project_extents(&self, extents: ProjectExtents) {
        self.inner.write().project_extents = extents;
    }

    fn geometric_extents(&self) -> Vec<[f64; 6]> {
        self.inner
            .read()
            .elements
            .values()
            .filter_map(|e| e.extent)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn physical_tree(store: &MemStore) -> (EntityId, EntityId) {
        let partition = store
            .insert_element(ElementRecord {
                class_name: classes::PHYSICAL_PARTITION.to_string(),
                model_id: ROOT_SUBJECT,
                parent_id: Some(ROOT_SUBJECT),
                ..Default::default()
            })
            .unwrap();
        store
            .insert_model(ModelRecord {
                id: partition,
                class_name: classes::PHYSICAL_MODEL.to_string(),
                ..Default::default()
            })
            .unwrap();
        let content = store
            .insert_element(ElementRecord {
                class_name: classes::GEOMETRIC_ELEMENT.to_string(),
                model_id: partition,
                ..Default::default()
            })
            .unwrap();
        (partition, content)
    }

    #[test]
    fn seeded_store_has_reserved_rows() {
        let store = MemStore::new("src");
        for id in EntityId::reserved_element_ids() {
            assert!(store.element(id).is_some(), "missing reserved element {id}");
        }
        assert!(store.model(ROOT_SUBJECT).is_some());
        assert!(store.model(DICTIONARY_MODEL).is_some());
    }

    #[test]
    fn insert_assigns_ascending_ids() {
        let store = MemStore::new("src");
        let first = store.insert_element(ElementRecord::default()).unwrap();
        let second = store.insert_element(ElementRecord::default()).unwrap();
        assert!(second > first);
    }

    #[test]
    fn explicit_id_is_honored_and_collision_rejected() {
        let store = MemStore::new("src");
        let id = store
            .insert_element(ElementRecord {
                id: EntityId(0x100),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(id, EntityId(0x100));
        assert!(store
            .insert_element(ElementRecord {
                id: EntityId(0x100),
                ..Default::default()
            })
            .is_err());
        // The id counter moved past the explicit id.
        assert!(store.insert_element(ElementRecord::default()).unwrap() > EntityId(0x100));
    }

    #[test]
    fn modeled_element_cannot_be_deleted_without_cascade() {
        let store = MemStore::new("src");
        let (partition, content) = physical_tree(&store);

        let err = store.delete_element(partition).unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));

        store.delete_element_tree(partition).unwrap();
        assert!(store.element(partition).is_none());
        assert!(store.model(partition).is_none());
        assert!(store.element(content).is_none());
    }

    #[test]
    fn definition_model_with_contents_refuses_delete() {
        let store = MemStore::new("src");
        let definition = store
            .insert_element(ElementRecord {
                class_name: classes::SPATIAL_CATEGORY.to_string(),
                model_id: DICTIONARY_MODEL,
                ..Default::default()
            })
            .unwrap();
        let err = store.delete_model(DICTIONARY_MODEL).unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));

        store.delete_element(definition).unwrap();
        store.delete_model(DICTIONARY_MODEL).unwrap();
    }

    #[test]
    fn unique_aspect_is_one_per_class_per_element() {
        let store = MemStore::new("src");
        let aspect = AspectRecord {
            id: EntityId::INVALID,
            element_id: ROOT_SUBJECT,
            class_name: "Test.StatusAspect".to_string(),
            ownership: AspectOwnership::Unique,
            properties: serde_json::Value::Null,
            last_modified: 0,
        };
        store.insert_aspect(aspect.clone()).unwrap();
        assert!(store.insert_aspect(aspect).is_err());
    }

    #[test]
    fn sealed_changesets_capture_the_op_log() {
        let store = MemStore::new("src");
        assert!(!store.has_unsaved_changes());

        let (partition, content) = physical_tree(&store);
        assert!(store.has_unsaved_changes());

        let info = store.seal_changeset("cs1", "seed").unwrap();
        assert_eq!(info.index, 1);
        assert!(!store.has_unsaved_changes());

        store.delete_element(content).unwrap();
        store.seal_changeset("cs2", "prune").unwrap();

        let sets = store.changesets_in_range(1, 2).unwrap();
        assert_eq!(sets.len(), 2);
        assert!(sets[0]
            .rows
            .iter()
            .any(|r| r.instance_id == partition && r.op == ChangeOp::Inserted));
        assert!(sets[1]
            .rows
            .iter()
            .any(|r| r.instance_id == content && r.op == ChangeOp::Deleted));

        assert!(matches!(
            store.changesets_in_range(1, 3).unwrap_err(),
            StoreError::ChangesetUnavailable(3)
        ));
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemStore::new("src");
        let (partition, _) = physical_tree(&store);
        store.seal_changeset("cs1", "seed").unwrap();
        store.save_snapshot(&path).unwrap();

        let restored = MemStore::load_snapshot(&path).unwrap();
        assert_eq!(restored.db_id(), "src");
        assert!(restored.element(partition).is_some());
        assert_eq!(restored.changeset().index, 1);
        // The catalog index survives the round trip.
        assert!(restored
            .catalog()
            .is_subclass_of(classes::PHYSICAL_MODEL, classes::MODEL));
    }

    #[test]
    fn code_lookup_requires_valid_scope_and_value() {
        let store = MemStore::new("src");
        let spec = store
            .insert_code_spec(CodeSpecRecord {
                id: EntityId::INVALID,
                name: "equipment".to_string(),
                properties: serde_json::Value::Null,
            })
            .unwrap();
        let code = Code::new(spec, ROOT_SUBJECT, "pump-1");
        let element = store
            .insert_element(ElementRecord {
                code: code.clone(),
                model_id: ROOT_SUBJECT,
                class_name: classes::GEOMETRIC_ELEMENT.to_string(),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(store.element_id_by_code(&code), Some(element));
        assert_eq!(store.element_id_by_code(&Code::empty()), None);
        // Duplicate codes are refused.
        assert!(store
            .insert_element(ElementRecord {
                code,
                ..Default::default()
            })
            .is_err());
    }
}
