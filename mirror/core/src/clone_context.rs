// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use mirror_store::{remap_geometry_stream, Catalog, ElementRecord, FontType, ModelRecord, Store};
use mirror_types::{EntityId, EntityKind, EntityRef};

use crate::error::{MirrorError, MirrorResult};
use crate::remap::CompactRemapTable;

/// Bidirectional remapping between source and target id spaces, for the four
/// kinds that get their ids rewritten. Model ids ride the element table,
/// since a model shares its id with its modeled element.
#[derive(Clone, Debug, Default)]
pub struct CloneContext {
    element_map: CompactRemapTable,
    reverse_element_map: CompactRemapTable,
    aspect_map: CompactRemapTable,
    code_spec_map: CompactRemapTable,
    font_map: CompactRemapTable,
    /// Target font rows by identity, lazily built and dropped on every font
    /// insert so the map is reread.
    target_font_cache: Option<HashMap<(FontType, String), EntityId>>,
    /// Opaque state carried for resumability alongside the tables.
    extra_state: Value,
}

/// Serialized form of the whole context.
#[derive(Serialize, Deserialize)]
struct SavedState {
    element_map: CompactRemapTable,
    reverse_element_map: CompactRemapTable,
    aspect_map: CompactRemapTable,
    code_spec_map: CompactRemapTable,
    font_map: CompactRemapTable,
    #[serde(default)]
    extra_state: Value,
}

/// A source element rewritten into target id space, plus the references that
/// could not be rewritten yet.
#[derive(Debug)]
pub struct ClonedElement {
    pub record: ElementRecord,
    pub missing_references: HashSet<EntityRef>,
}

impl CloneContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remap_element(&mut self, source: EntityId, target: EntityId) {
        self.element_map.remap(source.0, target.0);
        self.reverse_element_map.remap(target.0, source.0);
    }

    pub fn remap_aspect(&mut self, source: EntityId, target: EntityId) {
        self.aspect_map.remap(source.0, target.0);
    }

    pub fn remap_code_spec(&mut self, source: EntityId, target: EntityId) {
        self.code_spec_map.remap(source.0, target.0);
    }

    pub fn remap_font(&mut self, source: EntityId, target: EntityId) {
        self.font_map.remap(source.0, target.0);
    }

    /// The target id a source id maps to, if any.
    pub fn find_target(&self, kind: EntityKind, source: EntityId) -> Option<EntityId> {
        let table = match kind {
            EntityKind::Element | EntityKind::Model => &self.element_map,
            EntityKind::ElementAspect => &self.aspect_map,
            EntityKind::CodeSpec => &self.code_spec_map,
            EntityKind::Font => &self.font_map,
            EntityKind::Relationship => return None,
        };
        table.get(source.0).map(EntityId)
    }

    pub fn find_target_element(&self, source: EntityId) -> Option<EntityId> {
        self.element_map.get(source.0).map(EntityId)
    }

    /// Reverse lookup: the source element a target id came from.
    pub fn find_source_element(&self, target: EntityId) -> Option<EntityId> {
        self.reverse_element_map.get(target.0).map(EntityId)
    }

    /// Forgets one element mapping. In-database template cloning uses this
    /// to re-use the identity for the next instantiation.
    pub fn remove_element(&mut self, source: EntityId) {
        if let Some(target) = self.element_map.get(source.0) {
            self.reverse_element_map.unmap(target);
        }
        self.element_map.unmap(source.0);
    }

    /// Maps a source code spec into the target, merging by unique name and
    /// re-using the existing target row when present.
    pub fn import_code_spec(
        &mut self,
        source: &dyn Store,
        target: &dyn Store,
        id: EntityId,
    ) -> MirrorResult<EntityId> {
        if let Some(mapped) = self.code_spec_map.get(id.0) {
            return Ok(EntityId(mapped));
        }
        let spec = source
            .code_spec(id)
            .ok_or(MirrorError::NotFound(EntityRef::code_spec(id)))?;
        let target_id = match target.code_spec_by_name(&spec.name) {
            Some(existing) => existing.id,
            None => {
                let mut clone = spec.clone();
                clone.id = EntityId::INVALID;
                target.insert_code_spec(clone)?
            }
        };
        debug!(source = %id, target = %target_id, name = %spec.name, "mapped code spec");
        self.remap_code_spec(id, target_id);
        Ok(target_id)
    }

    /// Maps a source font number to a target font number, inserting the font
    /// when the target has no row with the same identity.
    pub fn import_font(
        &mut self,
        source: &dyn Store,
        target: &dyn Store,
        id: EntityId,
    ) -> MirrorResult<EntityId> {
        if let Some(mapped) = self.font_map.get(id.0) {
            return Ok(EntityId(mapped));
        }
        let font = source
            .font(id)
            .ok_or(MirrorError::NotFound(EntityRef::font(id)))?;

        let cache = self.target_font_cache.get_or_insert_with(|| {
            target
                .fonts()
                .into_iter()
                .map(|f| ((f.font_type, f.name), f.id))
                .collect()
        });

        let target_id = match cache.get(&(font.font_type, font.name.clone())) {
            Some(existing) => *existing,
            None => {
                let mut clone = font.clone();
                clone.id = EntityId::INVALID;
                let inserted = target.insert_font(clone)?;
                // Drop the cache so the font map is reread after the insert.
                self.target_font_cache = None;
                inserted
            }
        };
        self.remap_font(id, target_id);
        Ok(target_id)
    }

    /// Rewrites a source element into target id space. Unmapped references
    /// are collected rather than failing, so the caller can defer the
    /// element until they resolve.
    pub fn clone_element(
        &self,
        catalog: &Catalog,
        source_element: &ElementRecord,
        want_geometry: bool,
    ) -> MirrorResult<ClonedElement> {
        let mut missing = HashSet::new();
        let mut record = source_element.clone();
        record.id = self
            .find_target_element(source_element.id)
            .unwrap_or(EntityId::INVALID);
        record.last_modified = 0;

        match self.find_target_element(source_element.model_id) {
            Some(model) => record.model_id = model,
            None => {
                missing.insert(EntityRef::element(source_element.model_id));
            }
        }

        if let Some(parent) = source_element.parent_id {
            match self.find_target_element(parent) {
                Some(mapped) => record.parent_id = Some(mapped),
                None => {
                    missing.insert(EntityRef::element(parent));
                }
            }
        }

        if !record.code.is_empty() {
            match self.code_spec_map.get(record.code.spec.0) {
                Some(spec) => record.code.spec = EntityId(spec),
                None => {
                    missing.insert(EntityRef::code_spec(record.code.spec));
                }
            }
            if record.code.has_valid_scope() {
                match self.find_target_element(record.code.scope) {
                    Some(scope) => record.code.scope = scope,
                    None => {
                        missing.insert(EntityRef::element(record.code.scope));
                    }
                }
            }
        }

        for property in catalog.navigation_properties(&source_element.class_name) {
            let Some(referenced) = source_element.navigation_id(&property) else {
                continue;
            };
            if !referenced.is_valid() {
                return Err(MirrorError::InvalidArgument(format!(
                    "element {} carries a malformed {property} reference",
                    source_element.id
                )));
            }
            match self.find_target_element(referenced) {
                Some(mapped) => record.set_navigation_id(&property, Some(mapped)),
                None => {
                    missing.insert(EntityRef::element(referenced));
                }
            }
        }

        if want_geometry {
            if let Some(geometry) = &source_element.geometry {
                let remapped = remap_geometry_stream(
                    geometry,
                    &|id| self.element_map.get(id.0).map(EntityId),
                    &|id| self.font_map.get(id.0).map(EntityId),
                )?;
                for unresolved in remapped.unresolved_elements {
                    missing.insert(EntityRef::element(unresolved));
                }
                record.geometry = Some(remapped.bytes);
            }
        } else {
            record.geometry = None;
            record.extent = None;
        }

        Ok(ClonedElement {
            record,
            missing_references: missing,
        })
    }

    /// Rewrites a source model into target id space. The modeled element must
    /// already be mapped; models are emitted right after their container
    /// element.
    pub fn clone_model(&self, source_model: &ModelRecord) -> MirrorResult<ModelRecord> {
        let target_id = self.find_target_element(source_model.id).ok_or_else(|| {
            MirrorError::InvalidArgument(format!(
                "model {} cloned before its modeled element", source_model.id
            ))
        })?;
        let mut record = source_model.clone();
        record.id = target_id;
        record.last_modified = 0;
        Ok(record)
    }

    pub fn set_extra_state(&mut self, state: Value) {
        self.extra_state = state;
    }

    pub fn extra_state(&self) -> &Value {
        &self.extra_state
    }

    /// Persists all tables for a later resume.
    pub fn save(&self, path: &Path) -> MirrorResult<()> {
        let state = SavedState {
            element_map: self.element_map.clone(),
            reverse_element_map: self.reverse_element_map.clone(),
            aspect_map: self.aspect_map.clone(),
            code_spec_map: self.code_spec_map.clone(),
            font_map: self.font_map.clone(),
            extra_state: self.extra_state.clone(),
        };
        let text = serde_json::to_string(&state)
            .map_err(|e| MirrorError::InvalidArgument(e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| MirrorError::Store(mirror_store::StoreError::Io(e.to_string())))
    }

    pub fn load(path: &Path) -> MirrorResult<CloneContext> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| MirrorError::Store(mirror_store::StoreError::Io(e.to_string())))?;
        let state: SavedState = serde_json::from_str(&text)
            .map_err(|e| MirrorError::Store(mirror_store::StoreError::Corrupt(e.to_string())))?;
        Ok(CloneContext {
            element_map: state.element_map,
            reverse_element_map: state.reverse_element_map,
            aspect_map: state.aspect_map,
            code_spec_map: state.code_spec_map,
            font_map: state.font_map,
            target_font_cache: None,
            extra_state: state.extra_state,
        })
    }
}

#[cfg(test)]
mod tests {
    use mirror_store::{
        classes, CodeSpecRecord, FontRecord, GeometryStreamBuilder, MemStore,
    };
    use mirror_types::{Code, ROOT_SUBJECT};

    use super::*;

    #[test]
    fn element_and_reverse_maps_stay_in_step() {
        let mut context = CloneContext::new();
        context.remap_element(EntityId(0x20), EntityId(0x91));
        assert_eq!(context.find_target_element(EntityId(0x20)), Some(EntityId(0x91)));
        assert_eq!(context.find_source_element(EntityId(0x91)), Some(EntityId(0x20)));
        // Models resolve through the element table.
        assert_eq!(
            context.find_target(EntityKind::Model, EntityId(0x20)),
            Some(EntityId(0x91))
        );

        context.remove_element(EntityId(0x20));
        assert_eq!(context.find_target_element(EntityId(0x20)), None);
        assert_eq!(context.find_source_element(EntityId(0x91)), None);
    }

    #[test]
    fn code_spec_import_merges_by_name() {
        let source = MemStore::new("src");
        let target = MemStore::new("tgt");
        let mut context = CloneContext::new();

        let source_spec = source
            .insert_code_spec(CodeSpecRecord {
                id: EntityId::INVALID,
                name: "equipment".to_string(),
                properties: Value::Null,
            })
            .unwrap();
        let existing_target = target
            .insert_code_spec(CodeSpecRecord {
                id: EntityId::INVALID,
                name: "equipment".to_string(),
                properties: Value::Null,
            })
            .unwrap();

        let mapped = context
            .import_code_spec(&source, &target, source_spec)
            .unwrap();
        assert_eq!(mapped, existing_target);
        // Second call hits the table.
        assert_eq!(
            context
                .import_code_spec(&source, &target, source_spec)
                .unwrap(),
            existing_target
        );
    }

    #[test]
    fn font_import_reuses_identity_and_invalidates_cache() {
        let source = MemStore::new("src");
        let target = MemStore::new("tgt");
        let mut context = CloneContext::new();

        let arial = source
            .insert_font(FontRecord {
                id: EntityId::INVALID,
                font_type: FontType::TrueType,
                name: "arial".to_string(),
            })
            .unwrap();
        let script = source
            .insert_font(FontRecord {
                id: EntityId::INVALID,
                font_type: FontType::Rsc,
                name: "script".to_string(),
            })
            .unwrap();

        let mapped_arial = context.import_font(&source, &target, arial).unwrap();
        // New row in the target; cache was invalidated, so the second import
        // still sees a coherent map.
        let mapped_script = context.import_font(&source, &target, script).unwrap();
        assert_ne!(mapped_arial, mapped_script);
        assert_eq!(
            target.font(mapped_arial).unwrap().name,
            "arial".to_string()
        );
    }

    #[test]
    fn clone_collects_unmapped_references() {
        let source = MemStore::new("src");
        source.register_schema("Plant", (1, 0, 0));
        source.register_class(
            "Plant.Pump",
            Some(classes::GEOMETRIC_ELEMENT),
            EntityKind::Element,
            &["drivenBy"],
        );
        let catalog = source.catalog();

        let mut element = ElementRecord {
            id: EntityId(0x30),
            class_name: "Plant.Pump".to_string(),
            model_id: EntityId(0x20),
            parent_id: Some(EntityId(0x21)),
            code: Code::new(EntityId(1), ROOT_SUBJECT, "pump-1"),
            ..Default::default()
        };
        element.set_navigation_id("category", Some(EntityId(0x22)));
        element.set_navigation_id("drivenBy", Some(EntityId(0x23)));

        let mut context = CloneContext::new();
        context.remap_element(ROOT_SUBJECT, ROOT_SUBJECT);
        context.remap_element(EntityId(0x20), EntityId(0x80));
        context.remap_element(EntityId(0x22), EntityId(0x82));
        context.remap_code_spec(EntityId(1), EntityId(2));

        let cloned = context.clone_element(&catalog, &element, true).unwrap();
        assert_eq!(cloned.record.model_id, EntityId(0x80));
        assert_eq!(cloned.record.code.spec, EntityId(2));
        assert_eq!(
            cloned.record.navigation_id("category"),
            Some(EntityId(0x82))
        );
        // The two unmapped references are reported, not fatal.
        assert_eq!(
            cloned.missing_references,
            [EntityRef::element(EntityId(0x21)), EntityRef::element(EntityId(0x23))]
                .into_iter()
                .collect()
        );
    }

    #[test]
    fn clone_rewrites_geometry_and_defers_unmapped_embedded_ids() {
        let catalog = Catalog::base();
        let mut context = CloneContext::new();
        context.remap_element(EntityId(0x20), EntityId(0x80));
        context.remap_element(EntityId(0x40), EntityId(0x90));
        context.remap_font(EntityId(1), EntityId(3));

        let element = ElementRecord {
            id: EntityId(0x50),
            class_name: classes::GEOMETRIC_ELEMENT.to_string(),
            model_id: EntityId(0x20),
            geometry: Some(
                GeometryStreamBuilder::new()
                    .element_ref(EntityId(0x40))
                    .element_ref(EntityId(0x41))
                    .font_ref(EntityId(1))
                    .build(),
            ),
            ..Default::default()
        };

        let cloned = context.clone_element(&catalog, &element, true).unwrap();
        let expected = GeometryStreamBuilder::new()
            .element_ref(EntityId(0x90))
            .element_ref(EntityId(0x41))
            .font_ref(EntityId(3))
            .build();
        assert_eq!(cloned.record.geometry.as_deref(), Some(expected.as_slice()));
        assert!(cloned
            .missing_references
            .contains(&EntityRef::element(EntityId(0x41))));

        // Without geometry wanted, the stream is dropped entirely.
        let bare = context.clone_element(&catalog, &element, false).unwrap();
        assert!(bare.record.geometry.is_none());
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remap.json");

        let mut context = CloneContext::new();
        for i in 0..100u64 {
            context.remap_element(EntityId(0x100 + i), EntityId(0x500 + i));
        }
        context.remap_aspect(EntityId(7), EntityId(9));
        context.remap_code_spec(EntityId(1), EntityId(2));
        context.remap_font(EntityId(1), EntityId(1));
        context.set_extra_state(serde_json::json!({ "phase": "elements" }));
        context.save(&path).unwrap();

        let restored = CloneContext::load(&path).unwrap();
        assert_eq!(
            restored.find_target_element(EntityId(0x120)),
            Some(EntityId(0x520))
        );
        assert_eq!(restored.find_source_element(EntityId(0x520)), Some(EntityId(0x120)));
        assert_eq!(
            restored.find_target(EntityKind::ElementAspect, EntityId(7)),
            Some(EntityId(9))
        );
        assert_eq!(restored.extra_state()["phase"], "elements");
    }
}
