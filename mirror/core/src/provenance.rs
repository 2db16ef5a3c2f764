// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use mirror_store::{
    AspectRecord, ExternalSourceAspectData, ScopeProperties, Store,
    EXTERNAL_SOURCE_ASPECT_CLASS, SCOPE_KIND_ELEMENT, SCOPE_KIND_RELATIONSHIP, SCOPE_KIND_SCOPE,
};
use mirror_types::{ChangesetVersion, EntityId, ROOT_SUBJECT};

use crate::error::{MirrorError, MirrorResult};

/// The run-level provenance record: exactly one `Scope`-kind aspect on the
/// designated target scope element, keyed by the source database id. Holds
/// the synchronization watermarks and the pending changeset-index lists.
#[derive(Clone, Debug)]
pub struct TargetScopeRecord {
    aspect_id: EntityId,
    pub scope_element: EntityId,
    pub source_db_id: String,
    /// Forward watermark: where the target is up to, w.r.t. this source.
    pub version: ChangesetVersion,
    pub properties: ScopeProperties,
}

impl TargetScopeRecord {
    /// Opens the scope record, creating it on first synchronization. Fails
    /// when another source already occupies the scope element.
    pub fn load_or_create(
        db: &dyn Store,
        scope_element: EntityId,
        source_db_id: &str,
    ) -> MirrorResult<Self> {
        if !scope_element.is_valid() {
            return Err(MirrorError::invalid_id("target scope element", scope_element));
        }

        let existing = db
            .aspects_of_element(scope_element)
            .into_iter()
            .find_map(|aspect| {
                let data = aspect.external_source_data()?;
                (data.kind == SCOPE_KIND_SCOPE).then_some((aspect, data))
            });

        if let Some((aspect, data)) = existing {
            if data.identifier != source_db_id {
                return Err(MirrorError::PreconditionFailed(format!(
                    "target scope element {scope_element} already records provenance for \
                     source {:?}",
                    data.identifier
                )));
            }
            let version = data
                .version
                .as_deref()
                .unwrap_or("")
                .parse()
                .unwrap_or_else(|_| ChangesetVersion::never());
            let properties: ScopeProperties =
                serde_json::from_value(data.json_properties).unwrap_or_default();
            return Ok(Self {
                aspect_id: aspect.id,
                scope_element,
                source_db_id: source_db_id.to_string(),
                version,
                properties,
            });
        }

        let record = Self {
            aspect_id: EntityId::INVALID,
            scope_element,
            source_db_id: source_db_id.to_string(),
            version: ChangesetVersion::never(),
            properties: ScopeProperties::default(),
        };
        let mut created = record.clone();
        created.aspect_id = db.insert_aspect(record.to_aspect())?;
        debug!(scope = %scope_element, source = source_db_id, "created target scope record");
        Ok(created)
    }

    pub fn save(&self, db: &dyn Store) -> MirrorResult<()> {
        let mut aspect = self.to_aspect();
        aspect.id = self.aspect_id;
        db.update_aspect(aspect)?;
        Ok(())
    }

    fn to_aspect(&self) -> AspectRecord {
        ExternalSourceAspectData {
            scope: ROOT_SUBJECT,
            kind: SCOPE_KIND_SCOPE.to_string(),
            identifier: self.source_db_id.clone(),
            version: Some(self.version.to_string()),
            json_properties: serde_json::to_value(&self.properties)
                .expect("scope properties serialize"),
        }
        .into_aspect(self.scope_element)
    }
}

/// Writes per-entity provenance aspects into the provenance database.
pub struct ProvenanceWriter {
    db: Arc<dyn Store>,
    scope_element: EntityId,
}

impl ProvenanceWriter {
    pub fn new(db: Arc<dyn Store>, scope_element: EntityId) -> Self {
        Self { db, scope_element }
    }

    /// Upserts the `Element`-kind aspect mapping `source_id` onto the
    /// provenance-side element that carries the aspect.
    pub fn upsert_element_provenance(
        &self,
        element_id: EntityId,
        source_id: EntityId,
        source_version: &str,
    ) -> MirrorResult<EntityId> {
        let identifier = source_id.to_string();
        let existing = self.db.aspects_of_element(element_id).into_iter().find(|a| {
            a.external_source_data().is_some_and(|d| {
                d.scope == self.scope_element
                    && d.kind == SCOPE_KIND_ELEMENT
                    && d.identifier == identifier
            })
        });

        let data = ExternalSourceAspectData {
            scope: self.scope_element,
            kind: SCOPE_KIND_ELEMENT.to_string(),
            identifier,
            version: Some(source_version.to_string()),
            json_properties: serde_json::Value::Null,
        };
        match existing {
            Some(current) => {
                let mut aspect = data.into_aspect(element_id);
                aspect.id = current.id;
                self.db.update_aspect(aspect)?;
                Ok(current.id)
            }
            None => Ok(self.db.insert_aspect(data.into_aspect(element_id))?),
        }
    }

    /// Upserts the `Relationship`-kind aspect for one relationship mapping.
    /// Keyed on the source relationship instance id; the provenance-side
    /// instance id rides in `jsonProperties`.
    pub fn upsert_relationship_provenance(
        &self,
        anchor_element: EntityId,
        source_relationship: EntityId,
        provenance_relationship: EntityId,
    ) -> MirrorResult<EntityId> {
        let identifier = source_relationship.to_string();
        let existing = self
            .db
            .aspects_of_element(anchor_element)
            .into_iter()
            .find(|a| {
                a.external_source_data().is_some_and(|d| {
                    d.scope == self.scope_element
                        && d.kind == SCOPE_KIND_RELATIONSHIP
                        && d.identifier == identifier
                })
            });

        let data = ExternalSourceAspectData {
            scope: self.scope_element,
            kind: SCOPE_KIND_RELATIONSHIP.to_string(),
            identifier,
            version: None,
            json_properties: json!({
                "provenanceRelInstanceId": provenance_relationship.to_string(),
            }),
        };
        match existing {
            Some(current) => {
                let mut aspect = data.into_aspect(anchor_element);
                aspect.id = current.id;
                self.db.update_aspect(aspect)?;
                Ok(current.id)
            }
            None => Ok(self.db.insert_aspect(data.into_aspect(anchor_element))?),
        }
    }

    pub fn delete_aspect(&self, aspect_id: EntityId) -> MirrorResult<()> {
        self.db.delete_aspect(aspect_id)?;
        Ok(())
    }
}

/// Reads persisted provenance back out of the provenance database.
pub struct ProvenanceReader {
    db: Arc<dyn Store>,
    scope_element: EntityId,
}

impl ProvenanceReader {
    pub fn new(db: Arc<dyn Store>, scope_element: EntityId) -> Self {
        Self { db, scope_element }
    }

    fn scoped_aspects(&self, kind: &str) -> Vec<(AspectRecord, ExternalSourceAspectData)> {
        self.db
            .aspects_by_class(EXTERNAL_SOURCE_ASPECT_CLASS)
            .into_iter()
            .filter_map(|aspect| {
                let data = aspect.external_source_data()?;
                (data.scope == self.scope_element && data.kind == kind)
                    .then_some((aspect, data))
            })
            .collect()
    }

    /// The provenance-side element recorded for a source element id.
    pub fn find_element(&self, source_id: EntityId) -> Option<EntityId> {
        let identifier = source_id.to_string();
        self.scoped_aspects(SCOPE_KIND_ELEMENT)
            .into_iter()
            .find(|(_, data)| data.identifier == identifier)
            .map(|(aspect, _)| aspect.element_id)
    }

    /// The identifier recorded by the `Element`-kind aspect sitting on a
    /// provenance-side element. This is the reverse-direction lookup: the
    /// aspect's owner is the reverse run's source element and the identifier
    /// names the element in the run's target.
    pub fn identifier_of_element(&self, element_id: EntityId) -> Option<EntityId> {
        self.db
            .aspects_of_element(element_id)
            .into_iter()
            .find_map(|aspect| {
                let data = aspect.external_source_data()?;
                (data.scope == self.scope_element && data.kind == SCOPE_KIND_ELEMENT)
                    .then(|| data.identifier.parse().ok())
                    .flatten()
            })
    }

    /// Every persisted element mapping, as `(source id, provenance-side
    /// element id)` pairs. Feeds remap pre-population.
    pub fn element_mappings(&self) -> Vec<(EntityId, EntityId)> {
        self.scoped_aspects(SCOPE_KIND_ELEMENT)
            .into_iter()
            .filter_map(|(aspect, data)| {
                let source: EntityId = data.identifier.parse().ok()?;
                Some((source, aspect.element_id))
            })
            .collect()
    }

    /// The provenance-side relationship recorded for a source relationship
    /// instance id, with the aspect that carries it.
    ///
    /// Aspects written by the deprecated method are keyed the other way
    /// around: their identifier holds the provenance-side instance id and
    /// `provenanceRelInstanceId` the source one. Those are matched by the
    /// fallback arm and left untouched on disk.
    pub fn find_relationship(
        &self,
        source_relationship: EntityId,
    ) -> Option<(AspectRecord, EntityId)> {
        let identifier = source_relationship.to_string();
        let aspects = self.scoped_aspects(SCOPE_KIND_RELATIONSHIP);

        if let Some((aspect, data)) = aspects
            .iter()
            .find(|(_, data)| data.identifier == identifier)
        {
            let mapped = data
                .json_properties
                .get("provenanceRelInstanceId")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())?;
            return Some((aspect.clone(), mapped));
        }

        aspects
            .into_iter()
            .find(|(_, data)| {
                data.json_properties
                    .get("provenanceRelInstanceId")
                    .and_then(|v| v.as_str())
                    == Some(identifier.as_str())
            })
            .and_then(|(aspect, data)| {
                let mapped: EntityId = data.identifier.parse().ok()?;
                Some((aspect, mapped))
            })
    }
}

#[cfg(test)]
mod tests {
    use mirror_store::MemStore;

    use super::*;

    fn db() -> Arc<dyn Store> {
        Arc::new(MemStore::new("branch"))
    }

    #[test]
    fn scope_record_round_trip() {
        let db = db();
        let record = TargetScopeRecord::load_or_create(db.as_ref(), ROOT_SUBJECT, "master-db")
            .unwrap();
        assert!(record.version.is_never());

        let mut record = record;
        record.version = ChangesetVersion::new("cs9", 9);
        record.properties.pending_sync_changeset_indices = vec![4, 5];
        record.save(db.as_ref()).unwrap();

        let reloaded =
            TargetScopeRecord::load_or_create(db.as_ref(), ROOT_SUBJECT, "master-db").unwrap();
        assert_eq!(reloaded.version, ChangesetVersion::new("cs9", 9));
        assert_eq!(reloaded.properties.pending_sync_changeset_indices, vec![4, 5]);
    }

    #[test]
    fn scope_conflict_is_a_precondition_failure() {
        let db = db();
        TargetScopeRecord::load_or_create(db.as_ref(), ROOT_SUBJECT, "master-db").unwrap();
        let err = TargetScopeRecord::load_or_create(db.as_ref(), ROOT_SUBJECT, "other-db")
            .unwrap_err();
        assert!(matches!(err, MirrorError::PreconditionFailed(_)));
    }

    #[test]
    fn element_provenance_upserts_in_place() {
        let db = db();
        let writer = ProvenanceWriter::new(db.clone(), ROOT_SUBJECT);
        let reader = ProvenanceReader::new(db.clone(), ROOT_SUBJECT);

        let first = writer
            .upsert_element_provenance(ROOT_SUBJECT, EntityId(0x55), "3")
            .unwrap();
        let second = writer
            .upsert_element_provenance(ROOT_SUBJECT, EntityId(0x55), "7")
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(reader.find_element(EntityId(0x55)), Some(ROOT_SUBJECT));
        assert_eq!(reader.find_element(EntityId(0x56)), None);
        assert_eq!(
            reader.element_mappings(),
            vec![(EntityId(0x55), ROOT_SUBJECT)]
        );
    }

    #[test]
    fn relationship_provenance_reads_back_by_source_id() {
        let db = db();
        let writer = ProvenanceWriter::new(db.clone(), ROOT_SUBJECT);
        let reader = ProvenanceReader::new(db.clone(), ROOT_SUBJECT);

        writer
            .upsert_relationship_provenance(ROOT_SUBJECT, EntityId(0x70), EntityId(0x99))
            .unwrap();
        let (_, mapped) = reader.find_relationship(EntityId(0x70)).unwrap();
        assert_eq!(mapped, EntityId(0x99));
        assert!(reader.find_relationship(EntityId(0x71)).is_none());
    }

    #[test]
    fn deprecated_relationship_aspects_match_through_the_fallback() {
        let db = db();
        let reader = ProvenanceReader::new(db.clone(), ROOT_SUBJECT);

        // Old-method layout: identifier holds the provenance-side id, the
        // json payload holds the source-side id.
        db.insert_aspect(
            ExternalSourceAspectData {
                scope: ROOT_SUBJECT,
                kind: SCOPE_KIND_RELATIONSHIP.to_string(),
                identifier: EntityId(0x99).to_string(),
                version: None,
                json_properties: json!({
                    "provenanceRelInstanceId": EntityId(0x70).to_string(),
                }),
            }
            .into_aspect(ROOT_SUBJECT),
        )
        .unwrap();

        let (_, mapped) = reader.find_relationship(EntityId(0x70)).unwrap();
        assert_eq!(mapped, EntityId(0x99));
    }
}
