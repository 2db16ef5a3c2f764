// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use mirror_types::EntityKind;

/// One schema row. Row ids order schema export so that references hold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub row_id: u64,
    pub name: String,
    pub version: (u32, u32, u32),
    /// System schemas ship with every store and are filtered separately from
    /// domain schemas during export.
    #[serde(default)]
    pub is_system: bool,
}

/// One class row: single-inheritance metadata the engine needs to dispatch
/// on entity kind, walk class hierarchies, and find navigation references.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub row_id: u64,
    pub name: String,
    pub base: Option<String>,
    pub kind: EntityKind,
    /// Property names holding element references.
    #[serde(default)]
    pub navigation_properties: Vec<String>,
}

/// The metadata catalog: schemas and classes of one store.
///
/// The engine only queries it; schema authoring and upgrade happen outside.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    schemas: Vec<SchemaDef>,
    classes: Vec<ClassDef>,
    #[serde(skip)]
    by_name: HashMap<String, usize>,
}

/// Well-known class names of the base schema.
pub mod classes {
    pub const ELEMENT: &str = "Core.Element";
    pub const SUBJECT: &str = "Core.Subject";
    pub const INFORMATION_PARTITION: &str = "Core.InformationPartitionElement";
    pub const DEFINITION_PARTITION: &str = "Core.DefinitionPartition";
    pub const PHYSICAL_PARTITION: &str = "Core.PhysicalPartition";
    pub const DEFINITION_ELEMENT: &str = "Core.DefinitionElement";
    pub const RECIPE_DEFINITION_ELEMENT: &str = "Core.RecipeDefinitionElement";
    pub const SPATIAL_CATEGORY: &str = "Core.SpatialCategory";
    pub const GEOMETRIC_ELEMENT: &str = "Core.GeometricElement";
    pub const LINK_ELEMENT: &str = "Core.LinkElement";

    pub const MODEL: &str = "Core.Model";
    pub const REPOSITORY_MODEL: &str = "Core.RepositoryModel";
    pub const DEFINITION_MODEL: &str = "Core.DefinitionModel";
    pub const PHYSICAL_MODEL: &str = "Core.PhysicalModel";

    pub const ELEMENT_ASPECT: &str = "Core.ElementAspect";
    pub const EXTERNAL_SOURCE_ASPECT: &str = "Core.ExternalSourceAspect";

    pub const ELEMENT_REFERS_TO_ELEMENTS: &str = "Core.ElementRefersToElements";
    pub const ELEMENT_GROUPS_MEMBERS: &str = "Core.ElementGroupsMembers";
    /// Derived relationship, produced by dependency evaluation rather than
    /// authored, and therefore never synchronized.
    pub const ELEMENT_DRIVES_ELEMENT: &str = "Core.ElementDrivesElement";

    pub const CODE_SPEC: &str = "Core.CodeSpec";
    pub const FONT: &str = "Core.Font";
}

impl Catalog {
    /// The base catalog every store starts from.
    pub fn base() -> Self {
        let mut catalog = Catalog::default();
        catalog.register_schema("Core", (1, 0, 0), true);

        use classes::*;
        catalog.register_class(ELEMENT, None, EntityKind::Element, &[]);
        catalog.register_class(SUBJECT, Some(ELEMENT), EntityKind::Element, &[]);
        catalog.register_class(
            INFORMATION_PARTITION,
            Some(ELEMENT),
            EntityKind::Element,
            &[],
        );
        catalog.register_class(
            DEFINITION_PARTITION,
            Some(INFORMATION_PARTITION),
            EntityKind::Element,
            &[],
        );
        catalog.register_class(
            PHYSICAL_PARTITION,
            Some(INFORMATION_PARTITION),
            EntityKind::Element,
            &[],
        );
        catalog.register_class(DEFINITION_ELEMENT, Some(ELEMENT), EntityKind::Element, &[]);
        catalog.register_class(
            RECIPE_DEFINITION_ELEMENT,
            Some(DEFINITION_ELEMENT),
            EntityKind::Element,
            &[],
        );
        catalog.register_class(
            SPATIAL_CATEGORY,
            Some(DEFINITION_ELEMENT),
            EntityKind::Element,
            &[],
        );
        catalog.register_class(
            GEOMETRIC_ELEMENT,
            Some(ELEMENT),
            EntityKind::Element,
            &["category"],
        );
        catalog.register_class(LINK_ELEMENT, Some(ELEMENT), EntityKind::Element, &[]);

        catalog.register_class(MODEL, None, EntityKind::Model, &[]);
        catalog.register_class(REPOSITORY_MODEL, Some(MODEL), EntityKind::Model, &[]);
        catalog.register_class(DEFINITION_MODEL, Some(MODEL), EntityKind::Model, &[]);
        catalog.register_class(PHYSICAL_MODEL, Some(MODEL), EntityKind::Model, &[]);

        catalog.register_class(ELEMENT_ASPECT, None, EntityKind::ElementAspect, &[]);
        catalog.register_class(
            EXTERNAL_SOURCE_ASPECT,
            Some(ELEMENT_ASPECT),
            EntityKind::ElementAspect,
            &[],
        );

        catalog.register_class(
            ELEMENT_REFERS_TO_ELEMENTS,
            None,
            EntityKind::Relationship,
            &[],
        );
        catalog.register_class(
            ELEMENT_GROUPS_MEMBERS,
            Some(ELEMENT_REFERS_TO_ELEMENTS),
            EntityKind::Relationship,
            &[],
        );
        catalog.register_class(
            ELEMENT_DRIVES_ELEMENT,
            None,
            EntityKind::Relationship,
            &[],
        );

        catalog.register_class(CODE_SPEC, None, EntityKind::CodeSpec, &[]);
        catalog.register_class(FONT, None, EntityKind::Font, &[]);
        catalog
    }

    pub fn register_schema(&mut self, name: &str, version: (u32, u32, u32), is_system: bool) {
        let row_id = self.schemas.len() as u64 + 1;
        self.schemas.push(SchemaDef {
            row_id,
            name: name.to_string(),
            version,
            is_system,
        });
    }

    pub fn register_class(
        &mut self,
        name: &str,
        base: Option<&str>,
        kind: EntityKind,
        navigation_properties: &[&str],
    ) {
        debug_assert!(
            base.is_none() || self.by_name.contains_key(base.unwrap()),
            "base class must be registered first: {base:?}"
        );
        let row_id = self.classes.len() as u64 + 1;
        self.by_name.insert(name.to_string(), self.classes.len());
        self.classes.push(ClassDef {
            row_id,
            name: name.to_string(),
            base: base.map(str::to_string),
            kind,
            navigation_properties: navigation_properties
                .iter()
                .map(|p| p.to_string())
                .collect(),
        });
    }

    /// Schemas in row-id order, the order schema export uses.
    pub fn schemas(&self) -> &[SchemaDef] {
        &self.schemas
    }

    pub fn schema(&self, name: &str) -> Option<&SchemaDef> {
        self.schemas.iter().find(|s| s.name == name)
    }

    /// Upserts a schema definition, keeping its original row id on update.
    pub fn import_schema(&mut self, schema: &SchemaDef) {
        match self.schemas.iter_mut().find(|s| s.name == schema.name) {
            Some(existing) => existing.version = schema.version,
            None => self.register_schema(&schema.name, schema.version, schema.is_system),
        }
    }

    /// Merges class rows from another catalog, assigning local row ids.
    /// Classes must arrive base-before-subclass, which row-id order gives.
    pub fn import_classes(&mut self, classes: &[ClassDef]) {
        for class in classes {
            if self.class(&class.name).is_none() {
                let navigation: Vec<&str> = class
                    .navigation_properties
                    .iter()
                    .map(String::as_str)
                    .collect();
                self.register_class(&class.name, class.base.as_deref(), class.kind, &navigation);
            }
        }
    }

    /// All class rows, ascending by row id.
    pub fn classes(&self) -> &[ClassDef] {
        &self.classes
    }

    /// Class rows belonging to one schema, ascending by row id.
    pub fn classes_of_schema(&self, schema_name: &str) -> Vec<ClassDef> {
        let prefix = format!("{schema_name}.");
        self.classes
            .iter()
            .filter(|c| c.name.starts_with(&prefix))
            .cloned()
            .collect()
    }

    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.by_name.get(name).map(|idx| &self.classes[*idx])
    }

    pub fn class_by_row_id(&self, row_id: u64) -> Option<&ClassDef> {
        self.classes.iter().find(|c| c.row_id == row_id)
    }

    /// The entity kind a class row maps to, if the class is known.
    pub fn kind_of(&self, class_name: &str) -> Option<EntityKind> {
        self.class(class_name).map(|c| c.kind)
    }

    /// Walks the single-inheritance chain. A class is a subclass of itself.
    pub fn is_subclass_of(&self, class_name: &str, base_name: &str) -> bool {
        let mut current = Some(class_name);
        while let Some(name) = current {
            if name == base_name {
                return true;
            }
            current = self.class(name).and_then(|c| c.base.as_deref());
        }
        false
    }

    /// Navigation property names of a class, including inherited ones.
    pub fn navigation_properties(&self, class_name: &str) -> Vec<String> {
        let mut properties = vec![];
        let mut current = self.class(class_name);
        while let Some(class) = current {
            for property in &class.navigation_properties {
                if !properties.contains(property) {
                    properties.push(property.clone());
                }
            }
            current = class.base.as_deref().and_then(|b| self.class(b));
        }
        properties
    }

    /// Rebuilds the name index after deserialization.
    pub fn reindex(&mut self) {
        self.by_name = self
            .classes
            .iter()
            .enumerate()
            .map(|(idx, class)| (class.name.clone(), idx))
            .collect();
    }
}
