// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mirror_types::{ChangesetVersion, Code, EntityId, FederationGuid};

/// Class that persists provenance records.
pub const EXTERNAL_SOURCE_ASPECT_CLASS: &str = "Core.ExternalSourceAspect";

/// External-source-aspect kind for per-element provenance.
pub const SCOPE_KIND_ELEMENT: &str = "Element";
/// External-source-aspect kind for per-relationship provenance.
pub const SCOPE_KIND_RELATIONSHIP: &str = "Relationship";
/// External-source-aspect kind for the run-level target-scope record.
pub const SCOPE_KIND_SCOPE: &str = "Scope";

/// One element row. Navigation properties live inside `properties` as
/// hex-id strings under the names the catalog declares for the class.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementRecord {
    pub id: EntityId,
    pub class_name: String,
    /// The model containing this element.
    pub model_id: EntityId,
    /// Owning parent element, if any.
    pub parent_id: Option<EntityId>,
    pub code: Code,
    pub federation_guid: Option<FederationGuid>,
    pub user_label: Option<String>,
    /// Class-specific properties, including navigation references.
    #[serde(default)]
    pub properties: Value,
    /// Opaque binary geometry stream for geometric elements.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Vec<u8>>,
    /// Axis-aligned bounds of the geometry, when present: min xyz, max xyz.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extent: Option<[f64; 6]>,
    /// Monotonic per-store modification counter, store-assigned.
    #[serde(default)]
    pub last_modified: u64,
}

impl ElementRecord {
    /// Reads a navigation property as an entity id. Absent and null values
    /// read as `None`; a malformed value reads as the invalid id so callers
    /// surface it instead of silently dropping the reference.
    pub fn navigation_id(&self, property: &str) -> Option<EntityId> {
        match self.properties.get(property) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.parse::<EntityId>().unwrap_or(EntityId::INVALID)),
            Some(_) => Some(EntityId::INVALID),
        }
    }

    pub fn set_navigation_id(&mut self, property: &str, id: Option<EntityId>) {
        if !self.properties.is_object() {
            self.properties = Value::Object(Default::default());
        }
        let map = self.properties.as_object_mut().unwrap();
        match id {
            Some(id) => {
                map.insert(property.to_string(), Value::String(id.to_string()));
            }
            None => {
                map.remove(property);
            }
        }
    }
}

/// One model row. A model shares its id with the element it models.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: EntityId,
    pub class_name: String,
    /// Template models hold recipe geometry and are only synchronized when
    /// the exporter is configured to want them.
    #[serde(default)]
    pub is_template: bool,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub last_modified: u64,
}

/// Whether an aspect class allows one row per element or many.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectOwnership {
    Unique,
    Multi,
}

/// One element-aspect row, owned by exactly one element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AspectRecord {
    pub id: EntityId,
    pub element_id: EntityId,
    pub class_name: String,
    pub ownership: AspectOwnership,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub last_modified: u64,
}

impl AspectRecord {
    pub fn is_external_source(&self) -> bool {
        self.class_name == EXTERNAL_SOURCE_ASPECT_CLASS
    }

    /// Decodes the provenance payload carried by an external source aspect.
    pub fn external_source_data(&self) -> Option<ExternalSourceAspectData> {
        if !self.is_external_source() {
            return None;
        }
        serde_json::from_value(self.properties.clone()).ok()
    }
}

/// The payload of an external source aspect: the durable record of one
/// source-entity-to-target-entity mapping.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalSourceAspectData {
    /// The scope element all provenance from one source database hangs off.
    pub scope: EntityId,
    /// `"Element"`, `"Relationship"`, or `"Scope"`.
    pub kind: String,
    /// Source-side identity: an entity id string, or the source database id
    /// for the `"Scope"` record.
    pub identifier: String,
    /// Source-side version at the time the mapping was written. The `"Scope"`
    /// record stores the forward synchronization watermark here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub json_properties: Value,
}

impl ExternalSourceAspectData {
    pub fn into_aspect(self, element_id: EntityId) -> AspectRecord {
        AspectRecord {
            id: EntityId::INVALID,
            element_id,
            class_name: EXTERNAL_SOURCE_ASPECT_CLASS.to_string(),
            ownership: AspectOwnership::Multi,
            properties: serde_json::to_value(self).expect("aspect payload serializes"),
            last_modified: 0,
        }
    }
}

/// The run-level payload stored in the `jsonProperties` of the target-scope
/// provenance record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeProperties {
    /// Watermark of the last reverse synchronization.
    #[serde(default)]
    pub reverse_sync_version: String,
    /// Changeset indices this engine created in the target; a reverse sync
    /// must skip them.
    #[serde(default)]
    pub pending_sync_changeset_indices: Vec<i64>,
    /// Changeset indices this engine created in the source; a forward sync
    /// must skip them.
    #[serde(default)]
    pub pending_reverse_sync_changeset_indices: Vec<i64>,
}

impl ScopeProperties {
    pub fn reverse_version(&self) -> ChangesetVersion {
        self.reverse_sync_version
            .parse()
            .unwrap_or_else(|_| ChangesetVersion::never())
    }
}

/// One link-table relationship row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: EntityId,
    pub class_name: String,
    pub source_id: EntityId,
    pub target_id: EntityId,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub last_modified: u64,
}

/// One code-spec row. Names are unique per store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodeSpecRecord {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub properties: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FontType {
    TrueType,
    Rsc,
    Shx,
}

/// One font row. `(font_type, name)` is unique per store; the id is the font
/// number geometry streams embed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FontRecord {
    pub id: EntityId,
    pub font_type: FontType,
    pub name: String,
}

/// Axis-aligned project volume: min xyz, max xyz.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectExtents(pub [f64; 6]);

impl ProjectExtents {
    pub fn union_with(&mut self, extent: &[f64; 6]) {
        for axis in 0..3 {
            self.0[axis] = self.0[axis].min(extent[axis]);
            self.0[axis + 3] = self.0[axis + 3].max(extent[axis + 3]);
        }
    }

    pub fn from_extents<'a>(extents: impl Iterator<Item = &'a [f64; 6]>) -> Self {
        let mut result: Option<ProjectExtents> = None;
        for extent in extents {
            match &mut result {
                Some(total) => total.union_with(extent),
                None => result = Some(ProjectExtents(*extent)),
            }
        }
        result.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_property_round_trip() {
        let mut element = ElementRecord::default();
        assert_eq!(element.navigation_id("category"), None);

        element.set_navigation_id("category", Some(EntityId(0x22)));
        assert_eq!(element.navigation_id("category"), Some(EntityId(0x22)));

        element.set_navigation_id("category", None);
        assert_eq!(element.navigation_id("category"), None);
    }

    #[test]
    fn malformed_navigation_value_reads_as_invalid() {
        let mut element = ElementRecord::default();
        element.properties = serde_json::json!({ "category": 12 });
        assert_eq!(element.navigation_id("category"), Some(EntityId::INVALID));
    }

    #[test]
    fn external_source_payload_round_trip() {
        let data = ExternalSourceAspectData {
            scope: EntityId(0x1),
            kind: SCOPE_KIND_ELEMENT.to_string(),
            identifier: EntityId(0x55).to_string(),
            version: Some("12".to_string()),
            json_properties: Value::Null,
        };
        let aspect = data.clone().into_aspect(EntityId(0x99));
        assert!(aspect.is_external_source());
        assert_eq!(aspect.external_source_data().unwrap(), data);
    }

    #[test]
    fn extents_union() {
        let extents = [[0.0, 0.0, 0.0, 1.0, 1.0, 1.0], [-2.0, 0.5, 0.0, 0.5, 3.0, 1.0]];
        let total = ProjectExtents::from_extents(extents.iter());
        assert_eq!(total.0, [-2.0, 0.0, 0.0, 1.0, 3.0, 1.0]);
    }
}
