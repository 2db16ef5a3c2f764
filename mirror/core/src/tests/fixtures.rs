// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

use mirror_store::{
    classes, AspectOwnership, AspectRecord, CodeSpecRecord, ElementRecord, FontRecord, FontType,
    GeometryStreamBuilder, MemStore, ModelRecord, RelationshipRecord, Store,
};
use mirror_types::{Code, EntityId, EntityKind, FederationGuid, DICTIONARY_MODEL, ROOT_SUBJECT};

pub const PUMP_CLASS: &str = "Plant.Pump";
pub const NAME_PLATE_CLASS: &str = "Plant.NamePlate";
pub const MAINTENANCE_CLASS: &str = "Plant.MaintenanceRecord";

/// A small but complete source database: a domain schema, a code spec, a
/// font, a category, a physical partition with three pumps (one of which
/// references a later one), a relationship, and a few aspects. All elements
/// carry deterministic federation guids; the state is sealed as changeset 1.
pub struct PlantFixture {
    pub store: Arc<MemStore>,
    pub code_spec: EntityId,
    pub font: EntityId,
    pub category: EntityId,
    pub partition: EntityId,
    pub pump_a: EntityId,
    pub pump_b: EntityId,
    pub pump_c: EntityId,
    pub relationship: EntityId,
}

impl PlantFixture {
    pub fn build(db_id: &str) -> Self {
        let store = Arc::new(MemStore::new(db_id));
        let mut rng = StdRng::from_seed([42; 32]);
        let mut guid = || Some(FederationGuid::random(&mut rng));

        store.register_schema("Plant", (1, 0, 0));
        store.register_class(
            PUMP_CLASS,
            Some(classes::GEOMETRIC_ELEMENT),
            EntityKind::Element,
            &["drivenBy"],
        );
        store.register_class(
            NAME_PLATE_CLASS,
            Some(classes::ELEMENT_ASPECT),
            EntityKind::ElementAspect,
            &[],
        );
        store.register_class(
            MAINTENANCE_CLASS,
            Some(classes::ELEMENT_ASPECT),
            EntityKind::ElementAspect,
            &[],
        );

        let code_spec = store
            .insert_code_spec(CodeSpecRecord {
                id: EntityId::INVALID,
                name: "equipment".to_string(),
                properties: serde_json::Value::Null,
            })
            .unwrap();
        let font = store
            .insert_font(FontRecord {
                id: EntityId::INVALID,
                font_type: FontType::TrueType,
                name: "arial".to_string(),
            })
            .unwrap();

        let category = store
            .insert_element(ElementRecord {
                class_name: classes::SPATIAL_CATEGORY.to_string(),
                model_id: DICTIONARY_MODEL,
                code: Code::new(code_spec, ROOT_SUBJECT, "category-default"),
                federation_guid: guid(),
                ..Default::default()
            })
            .unwrap();

        let partition = store
            .insert_element(ElementRecord {
                class_name: classes::PHYSICAL_PARTITION.to_string(),
                model_id: ROOT_SUBJECT,
                parent_id: Some(ROOT_SUBJECT),
                code: Code::new(code_spec, ROOT_SUBJECT, "equipment-partition"),
                federation_guid: guid(),
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

        let pump = |code_value: &str, category: EntityId, guid: Option<FederationGuid>| {
            let mut record = ElementRecord {
                class_name: PUMP_CLASS.to_string(),
                model_id: partition,
                code: Code::new(code_spec, partition, code_value),
                federation_guid: guid,
                user_label: Some(code_value.to_string()),
                geometry: Some(
                    GeometryStreamBuilder::new()
                        .font_ref(font)
                        .blob(code_value.as_bytes())
                        .build(),
                ),
                extent: Some([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]),
                ..Default::default()
            };
            record.set_navigation_id("category", Some(category));
            record
        };

        let pump_a = store.insert_element(pump("pump-1", category, guid())).unwrap();
        let pump_b = store.insert_element(pump("pump-2", category, guid())).unwrap();
        let pump_c = store.insert_element(pump("pump-3", category, guid())).unwrap();

        // pump-2 drives through a forward reference to pump-3, which has a
        // higher id and is therefore visited later during export.
        let mut pump_b_record = store.element(pump_b).unwrap();
        pump_b_record.set_navigation_id("drivenBy", Some(pump_c));
        store.update_element(pump_b_record).unwrap();

        let relationship = store
            .insert_relationship(RelationshipRecord {
                id: EntityId::INVALID,
                class_name: classes::ELEMENT_GROUPS_MEMBERS.to_string(),
                source_id: pump_a,
                target_id: pump_b,
                properties: serde_json::Value::Null,
                last_modified: 0,
            })
            .unwrap();

        store
            .insert_aspect(AspectRecord {
                id: EntityId::INVALID,
                element_id: pump_a,
                class_name: NAME_PLATE_CLASS.to_string(),
                ownership: AspectOwnership::Unique,
                properties: json!({ "serial": "A-100" }),
                last_modified: 0,
            })
            .unwrap();
        for note in ["impeller swapped", "seals checked"] {
            store
                .insert_aspect(AspectRecord {
                    id: EntityId::INVALID,
                    element_id: pump_b,
                    class_name: MAINTENANCE_CLASS.to_string(),
                    ownership: AspectOwnership::Multi,
                    properties: json!({ "note": note }),
                    last_modified: 0,
                })
                .unwrap();
        }

        store.seal_changeset("cs1", "initial content").unwrap();

        Self {
            store,
            code_spec,
            font,
            category,
            partition,
            pump_a,
            pump_b,
            pump_c,
            relationship,
        }
    }
}

/// Element rows with ids and modification counters blanked, for whole-store
/// comparisons.
pub fn comparable_elements(store: &dyn Store) -> Vec<ElementRecord> {
    let mut elements = vec![];
    for model_id in store.model_ids() {
        for id in store.model_contents(model_id) {
            if let Some(mut element) = store.element(id) {
                element.last_modified = 0;
                elements.push(element);
            }
        }
    }
    elements.sort_by_key(|e| e.id);
    elements
}
