// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use tracing::{debug, info, warn};

use mirror_store::{
    AspectOwnership, AspectRecord, ChangesetData, ChangesetHub, ElementRecord, FontRecord, ModelRecord,
    RelationshipRecord, SchemaDef, Store, StoreBackedHub, StoreError,
    EXTERNAL_SOURCE_ASPECT_CLASS,
};
use mirror_types::{ChangesetVersion, Code, EntityId, EntityKind, EntityRef, FederationGuid};

use crate::changed::ChangedInstanceIds;
use crate::clone_context::CloneContext;
use crate::context::{DanglingReferencePolicy, RunContext, RunOptions, SyncDirection};
use crate::delta::{select_changeset_range, ChangesScope, DeltaSelection};
use crate::error::{MirrorError, MirrorResult};
use crate::exporter::{ExportObserver, Exporter, ExporterConfig};
use crate::importer::Importer;
use crate::pending::PendingReferenceMap;
use crate::provenance::{ProvenanceReader, ProvenanceWriter, TargetScopeRecord};

/// Minimum base-schema version the source must carry.
const CORE_SCHEMA_MIN: (u32, u32, u32) = (1, 0, 0);

/// Lifecycle of one transformer instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformerState {
    Constructed,
    Initialized,
    Processing,
    Finalized,
    Disposed,
}

/// What one run did, by mutation kind.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransformResult {
    pub elements_inserted: usize,
    pub elements_updated: usize,
    pub elements_deleted: usize,
    pub models_written: usize,
    pub models_deleted: usize,
    pub aspects_written: usize,
    pub relationships_written: usize,
    pub relationships_deleted: usize,
    pub forced_completions: usize,
}

/// Detaches the change cache when the run ends, on both success and error
/// paths.
struct ChangeCacheGuard {
    store: Arc<dyn Store>,
}

impl ChangeCacheGuard {
    fn attach(store: Arc<dyn Store>) -> MirrorResult<Self> {
        store.attach_change_cache()?;
        Ok(Self { store })
    }
}

impl Drop for ChangeCacheGuard {
    fn drop(&mut self) {
        self.store.detach_change_cache();
    }
}

/// The target relationship a deleted source relationship resolved to.
struct DeletedRelationshipTarget {
    target_relationship: EntityId,
    provenance_aspect: Option<EntityId>,
}

/// Orchestrates one synchronization run: owns the contexts, drives the
/// exporter, handles its events, and records provenance.
pub struct Transformer {
    context: RunContext,
    exporter_config: ExporterConfig,
    clone_context: CloneContext,
    pending: PendingReferenceMap,
    importer: Importer,
    provenance_writer: ProvenanceWriter,
    provenance_reader: ProvenanceReader,
    hub: Arc<dyn ChangesetHub>,
    state: TransformerState,
    scope_record: Option<TargetScopeRecord>,
    selection: Option<DeltaSelection>,
    changes: Option<ChangedInstanceIds>,
    change_cache_guard: Option<ChangeCacheGuard>,
    /// Target element ids inserted or updated this run. A source delete that
    /// resolves to one of these is an entity recreation and is suppressed.
    touched_targets: HashSet<EntityId>,
    deleted_relationship_targets: HashMap<EntityId, DeletedRelationshipTarget>,
    /// Target partitions whose model delete was refused; their element
    /// delete cascades the whole tree instead.
    deferred_tree_deletes: HashSet<EntityId>,
    exported_geometry: bool,
    stats: TransformResult,
}

impl Transformer {
    pub fn new(source: Arc<dyn Store>, target: Arc<dyn Store>, options: RunOptions) -> Self {
        let context = RunContext::new(source.clone(), target.clone(), options);
        let provenance_db = context.provenance_db().clone();
        let scope_element = context.options.target_scope_element;
        let mut exporter_config = ExporterConfig {
            aspect_strategy: context.options.aspect_strategy,
            ..ExporterConfig::default()
        };
        if !context.options.include_source_provenance {
            exporter_config
                .excluded_aspect_classes
                .push(EXTERNAL_SOURCE_ASPECT_CLASS.to_string());
        }
        Self {
            importer: Importer::new(target),
            provenance_writer: ProvenanceWriter::new(provenance_db.clone(), scope_element),
            provenance_reader: ProvenanceReader::new(provenance_db, scope_element),
            hub: Arc::new(StoreBackedHub::new(source)),
            exporter_config,
            context,
            clone_context: CloneContext::new(),
            pending: PendingReferenceMap::new(),
            state: TransformerState::Constructed,
            scope_record: None,
            selection: None,
            changes: None,
            change_cache_guard: None,
            touched_targets: HashSet::new(),
            deleted_relationship_targets: HashMap::new(),
            deferred_tree_deletes: HashSet::new(),
            exported_geometry: false,
            stats: TransformResult::default(),
        }
    }

    /// Replaces the default source-backed changeset hub.
    pub fn set_changeset_hub(&mut self, hub: Arc<dyn ChangesetHub>) {
        self.hub = hub;
    }

    pub fn exporter_config_mut(&mut self) -> &mut ExporterConfig {
        &mut self.exporter_config
    }

    pub fn state(&self) -> TransformerState {
        self.state
    }

    pub fn stats(&self) -> &TransformResult {
        &self.stats
    }

    /// Seeds the clone context from a prior run's saved state.
    pub fn set_clone_context(&mut self, clone_context: CloneContext) {
        self.clone_context = clone_context;
    }

    pub fn clone_context(&self) -> &CloneContext {
        &self.clone_context
    }

    /// Convenience wrapper: initialize, process whatever the delta selection
    /// calls for, finalize.
    pub async fn run(&mut self) -> MirrorResult<TransformResult> {
        let scope = self.initialize().await?;
        if scope != ChangesScope::NoChanges {
            self.process().await?;
        }
        self.finalize()?;
        Ok(self.stats.clone())
    }

    /// Opens the provenance scope, selects the changeset range, and
    /// pre-populates the element remap.
    pub async fn initialize(&mut self) -> MirrorResult<ChangesScope> {
        self.ensure_state(TransformerState::Constructed)?;

        let source_catalog = self.context.source.catalog();
        match source_catalog.schema("Core") {
            Some(schema) if schema.version >= CORE_SCHEMA_MIN => {}
            _ => {
                return Err(MirrorError::PreconditionFailed(
                    "source base schema is too old".to_string(),
                ));
            }
        }

        let scope = if self.context.options.no_provenance {
            ChangesScope::Unconnected
        } else {
            let other_db_id = match self.context.options.direction {
                SyncDirection::Forward => self.context.source.db_id(),
                SyncDirection::Reverse => self.context.target.db_id(),
            };
            let record = TargetScopeRecord::load_or_create(
                self.context.provenance_db().as_ref(),
                self.context.options.target_scope_element,
                &other_db_id,
            )?;
            let selection = select_changeset_range(
                &record,
                self.context.options.direction,
                self.context.options.start_changeset_index,
                self.context.options.changeset_ranges.as_deref(),
                self.context.source.changeset().index,
                self.context.options.ignore_missing_changesets,
            )?;
            let scope = selection.scope;
            self.scope_record = Some(record);
            self.selection = Some(selection);
            scope
        };

        if scope == ChangesScope::HasChanges {
            self.change_cache_guard =
                Some(ChangeCacheGuard::attach(self.context.source.clone())?);
            let selection = self.selection.as_ref().expect("selection set with changes");
            let mut changesets: Vec<ChangesetData> = vec![];
            for (first, last) in &selection.subranges {
                changesets.extend(self.hub.download_changesets(*first, *last).await?);
            }
            self.changes = Some(ChangedInstanceIds::from_changesets(
                &source_catalog,
                &changesets,
            ));
        }

        self.prepopulate_remaps();
        self.resolve_deleted_relationships();

        info!(?scope, "transformer initialized");
        self.state = TransformerState::Initialized;
        Ok(scope)
    }

    /// Drives the exporter over the source with this transformer as the
    /// event observer.
    pub async fn process(&mut self) -> MirrorResult<()> {
        if !matches!(
            self.state,
            TransformerState::Initialized | TransformerState::Processing
        ) {
            return Err(MirrorError::PreconditionFailed(format!(
                "process called in state {:?}",
                self.state
            )));
        }
        self.state = TransformerState::Processing;

        let mut exporter = Exporter::new(self.context.source.clone(), self.exporter_config.clone());
        if let Some(changes) = &self.changes {
            exporter.set_changes(changes.clone());
        }
        exporter.export(self).await
    }

    /// Writes the new watermark and pending lists, forces completion of
    /// anything still partially committed, and releases the change cache.
    pub fn finalize(&mut self) -> MirrorResult<()> {
        if !matches!(
            self.state,
            TransformerState::Initialized | TransformerState::Processing
        ) {
            return Err(MirrorError::PreconditionFailed(format!(
                "finalize called in state {:?}",
                self.state
            )));
        }

        for entity in self.pending.drain_for_force_complete() {
            self.complete_entity(entity, true)?;
            self.stats.forced_completions += 1;
        }

        if self.exported_geometry {
            self.importer.optimize_geometry()?;
            self.importer.compute_project_extents()?;
        }

        if let Some(mut record) = self.scope_record.take() {
            let before_version = record.version.clone();
            let before_properties = record.properties.clone();

            let source_tip = self.context.source.changeset();
            let tip_version = ChangesetVersion::new(source_tip.id, source_tip.index);
            match self.context.options.direction {
                SyncDirection::Forward => {
                    record.version = tip_version;
                    record.properties.pending_reverse_sync_changeset_indices.clear();
                }
                SyncDirection::Reverse => {
                    record.properties.reverse_sync_version = tip_version.to_string();
                    record.properties.pending_sync_changeset_indices.clear();
                }
            }
            if self.context.target.has_unsaved_changes() {
                let next_index = self.context.target.changeset().index + 1;
                let pending = match self.context.options.direction {
                    SyncDirection::Forward => {
                        &mut record.properties.pending_sync_changeset_indices
                    }
                    SyncDirection::Reverse => {
                        &mut record.properties.pending_reverse_sync_changeset_indices
                    }
                };
                if !pending.contains(&next_index) {
                    pending.push(next_index);
                }
            }

            if record.version != before_version || record.properties != before_properties {
                record.save(self.context.provenance_db().as_ref())?;
                info!(
                    version = %record.version,
                    "synchronization watermark advanced"
                );
            }
            self.scope_record = Some(record);
        }

        self.change_cache_guard = None;
        self.state = TransformerState::Finalized;
        Ok(())
    }

    /// Releases everything. The instance cannot be reused.
    pub fn dispose(&mut self) {
        self.change_cache_guard = None;
        self.state = TransformerState::Disposed;
    }

    /// Clones a template definition model and its elements into a new model
    /// within the same store, re-using the machinery with provenance
    /// disabled. References leaving the template map to themselves.
    pub fn clone_template(
        store: &Arc<dyn Store>,
        template_model: EntityId,
        new_partition_code: Code,
    ) -> MirrorResult<EntityId> {
        let catalog = store.catalog();
        let partition = store
            .element(template_model)
            .ok_or(MirrorError::NotFound(EntityRef::element(template_model)))?;
        let model = store
            .model(template_model)
            .ok_or(MirrorError::NotFound(EntityRef::model(template_model)))?;

        let mut new_partition = partition.clone();
        new_partition.id = EntityId::INVALID;
        new_partition.code = new_partition_code;
        new_partition.federation_guid = None;
        let new_root = store.insert_element(new_partition)?;
        store.insert_model(ModelRecord {
            id: new_root,
            is_template: false,
            last_modified: 0,
            ..model.clone()
        })?;

        let contents = store.model_contents(template_model);
        let content_set: HashSet<EntityId> = contents.iter().copied().collect();
        let mut clone_context = CloneContext::new();
        clone_context.remap_element(template_model, new_root);

        for id in &contents {
            let Some(element) = store.element(*id) else {
                continue;
            };
            let cloned = clone_context.clone_element(&catalog, &element, true)?;
            // Outside references keep their identity; this is one database.
            for missing in &cloned.missing_references {
                if !content_set.contains(&missing.id) {
                    clone_context.remap_element(missing.id, missing.id);
                }
            }
            let mut record = clone_context
                .clone_element(&catalog, &element, true)?
                .record;
            record.id = EntityId::INVALID;
            record.federation_guid = None;
            record.code = Code::empty();
            let new_id = store.insert_element(record)?;
            clone_context.remap_element(*id, new_id);
        }

        // Second pass completes references that pointed forward within the
        // template.
        for id in &contents {
            let Some(element) = store.element(*id) else {
                continue;
            };
            let cloned = clone_context.clone_element(&catalog, &element, true)?;
            if cloned.missing_references.is_empty() {
                if let Some(target) = clone_context.find_target_element(*id) {
                    let mut record = cloned.record;
                    record.id = target;
                    record.federation_guid = None;
                    record.code = Code::empty();
                    store.update_element(record)?;
                }
            }
        }

        // The template root's identity is released so the context could be
        // reused for the next instantiation.
        clone_context.remove_element(template_model);
        Ok(new_root)
    }

    fn ensure_state(&self, expected: TransformerState) -> MirrorResult<()> {
        if self.state != expected {
            return Err(MirrorError::PreconditionFailed(format!(
                "expected state {expected:?}, but the transformer is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Reserved ids, the federation-guid intersection, and persisted
    /// external-source aspects, in that order.
    fn prepopulate_remaps(&mut self) {
        for id in EntityId::reserved_element_ids() {
            self.clone_context.remap_element(id, id);
        }

        if self.context.options.was_source_copied_to_target {
            // Equal ids denote the same entity; per-element handling fills
            // the table lazily.
            debug!("source was copied to target; identity mapping assumed");
        }

        // Two-pointer sweep over both guid-sorted element lists.
        let source_guids = self.context.source.elements_with_guid_sorted();
        let target_guids = self.context.target.elements_with_guid_sorted();
        let mut matched = 0usize;
        for pair in source_guids
            .iter()
            .merge_join_by(target_guids.iter(), |(a, _), (b, _)| a.cmp(b))
        {
            if let itertools::EitherOrBoth::Both((_, source_id), (_, target_id)) = pair {
                self.clone_context.remap_element(*source_id, *target_id);
                matched += 1;
            }
        }
        debug!(matched, "federation guid sweep complete");

        if !self.context.options.no_provenance {
            for (identifier, element_id) in self.provenance_reader.element_mappings() {
                match self.context.options.direction {
                    // The aspect sits on the target-side element and its
                    // identifier names the source element.
                    SyncDirection::Forward => {
                        self.clone_context.remap_element(identifier, element_id);
                    }
                    // The aspect sits on this run's source element and its
                    // identifier names the element in the run's target.
                    SyncDirection::Reverse => {
                        self.clone_context.remap_element(element_id, identifier);
                    }
                }
            }
        }
    }

    /// Records, for every source-deleted relationship, which target
    /// relationship dies with it.
    fn resolve_deleted_relationships(&mut self) {
        let Some(changes) = &self.changes else { return };

        for source_rel in changes.deleted(EntityKind::Relationship) {
            let provenance = self.provenance_reader.find_relationship(source_rel);

            let by_endpoints = changes.deleted_relationship(source_rel).and_then(|info| {
                let source_end = self.clone_context.find_target_element(info.source_id)?;
                let target_end = self.clone_context.find_target_element(info.target_id)?;
                self.context
                    .target
                    .find_relationship(&info.class_name, source_end, target_end)
                    .map(|r| r.id)
            });

            let target_relationship =
                by_endpoints.or_else(|| provenance.as_ref().map(|(_, mapped)| *mapped));
            let Some(target_relationship) = target_relationship else {
                debug!(relationship = %source_rel, "deleted relationship has no target");
                continue;
            };
            self.deleted_relationship_targets.insert(
                source_rel,
                DeletedRelationshipTarget {
                    target_relationship,
                    provenance_aspect: provenance.map(|(aspect, _)| aspect.id),
                },
            );
        }
    }

    /// The per-element pipeline: resolve the target id, clone, defer missing
    /// references, import, remap, complete waiters, write provenance.
    fn transform_element(
        &mut self,
        element: &ElementRecord,
        _is_update: Option<bool>,
    ) -> MirrorResult<()> {
        if EntityId::reserved_element_ids().contains(&element.id) {
            return Ok(());
        }

        let target_id = self.resolve_element_target(element);
        if let Some(target_id) = target_id {
            self.clone_context.remap_element(element.id, target_id);
        }

        let source_catalog = self.context.source.catalog();
        let mut cloned = self.clone_context.clone_element(
            &source_catalog,
            element,
            self.exporter_config.want_geometry,
        )?;
        let missing = self.filter_dangling(EntityRef::element(element.id), cloned.missing_references)?;

        let existing = target_id.and_then(|id| self.context.target.element(id));
        match &existing {
            Some(existing_row) => {
                if cloned.record.federation_guid.is_none() {
                    cloned.record.federation_guid = existing_row.federation_guid;
                }
                let mut comparable = existing_row.clone();
                comparable.last_modified = 0;
                if cloned.record == comparable && missing.is_empty() {
                    // Nothing changed; the mapping alone satisfies waiters.
                    self.complete_waiters_of(EntityRef::element(element.id))?;
                    return Ok(());
                }
            }
            None => {
                if cloned.record.federation_guid.is_none() {
                    cloned.record.federation_guid =
                        Some(FederationGuid::random(&mut rand::thread_rng()));
                }
            }
        }

        let was_update = existing.is_some();
        let new_id = self.importer.import_element(cloned.record)?;
        if was_update {
            self.stats.elements_updated += 1;
        } else {
            self.stats.elements_inserted += 1;
        }
        if element.geometry.is_some() && self.exporter_config.want_geometry {
            self.exported_geometry = true;
        }

        self.clone_context.remap_element(element.id, new_id);
        self.touched_targets.insert(new_id);
        self.complete_waiters_of(EntityRef::element(element.id))?;

        if !missing.is_empty() {
            debug!(
                element = %element.id,
                missing = missing.len(),
                "element committed partially"
            );
            self.pending.defer(EntityRef::element(element.id), missing);
        }

        if !self.context.options.no_provenance {
            self.write_element_provenance(element, new_id)?;
        }
        Ok(())
    }

    /// Target-id resolution priority: preserved id, copy identity, existing
    /// remap, federation guid, code (class must agree).
    fn resolve_element_target(&self, element: &ElementRecord) -> Option<EntityId> {
        if self.context.options.preserve_element_ids
            || self.context.options.was_source_copied_to_target
        {
            return Some(element.id);
        }
        if let Some(mapped) = self.clone_context.find_target_element(element.id) {
            return Some(mapped);
        }
        if let Some(guid) = &element.federation_guid {
            if let Some(found) = self.context.target.element_id_by_guid(guid) {
                return Some(found);
            }
        }
        if !element.code.is_empty() && element.code.has_valid_scope() {
            let spec = self
                .clone_context
                .find_target(EntityKind::CodeSpec, element.code.spec);
            let scope = self.clone_context.find_target_element(element.code.scope);
            if let (Some(spec), Some(scope)) = (spec, scope) {
                let code = Code::new(spec, scope, element.code.value.clone());
                if let Some(found) = self.context.target.element_id_by_code(&code) {
                    let same_class = self
                        .context
                        .target
                        .element(found)
                        .is_some_and(|e| e.class_name == element.class_name);
                    if same_class {
                        return Some(found);
                    }
                }
            }
        }
        None
    }

    /// Applies the dangling-reference policy: references to entities that do
    /// not exist in the source at all are fatal or dropped.
    fn filter_dangling(
        &self,
        referencer: EntityRef,
        missing: HashSet<EntityRef>,
    ) -> MirrorResult<HashSet<EntityRef>> {
        let mut kept = HashSet::new();
        for reference in missing {
            let exists = match reference.kind {
                EntityKind::CodeSpec => {
                    self.context.source.code_spec(reference.id).is_some()
                }
                _ => self.context.source.element(reference.id).is_some(),
            };
            if exists {
                kept.insert(reference);
            } else {
                match self.context.options.dangling_references {
                    DanglingReferencePolicy::Reject => {
                        return Err(MirrorError::DanglingReference {
                            referencer,
                            referenced: reference,
                        });
                    }
                    DanglingReferencePolicy::Ignore => {
                        warn!(
                            referencer = %referencer,
                            referenced = %reference,
                            "ignoring dangling reference"
                        );
                    }
                }
            }
        }
        Ok(kept)
    }

    /// Re-transforms every entity that was waiting on this reference.
    fn complete_waiters_of(&mut self, referenced: EntityRef) -> MirrorResult<()> {
        for entity in self.pending.resolve_reference(referenced) {
            self.complete_entity(entity, false)?;
        }
        Ok(())
    }

    /// Re-clones a partially committed entity now that (ideally) all its
    /// references resolve, and updates the target row in place.
    fn complete_entity(&mut self, entity: EntityRef, force: bool) -> MirrorResult<()> {
        let Some(element) = self.context.source.element(entity.id) else {
            warn!(entity = %entity, "partially committed entity vanished from the source");
            return Ok(());
        };
        let source_catalog = self.context.source.catalog();
        let cloned = self.clone_context.clone_element(
            &source_catalog,
            &element,
            self.exporter_config.want_geometry,
        )?;
        let missing = self.filter_dangling(entity, cloned.missing_references)?;
        if !missing.is_empty() && !force {
            // Still incomplete; the remaining references keep it deferred.
            self.pending.defer(entity, missing);
            return Ok(());
        }

        let Some(target_id) = self.clone_context.find_target_element(entity.id) else {
            warn!(entity = %entity, "partially committed entity has no target mapping");
            return Ok(());
        };
        let mut record = cloned.record;
        record.id = target_id;
        if record.federation_guid.is_none() {
            record.federation_guid = self
                .context
                .target
                .element(target_id)
                .and_then(|e| e.federation_guid);
        }
        self.importer.import_element(record)?;
        debug!(entity = %entity, target = %target_id, "completed deferred entity");
        Ok(())
    }

    /// Provenance for one element: the federation guid where both sides have
    /// one, an external source aspect otherwise.
    fn write_element_provenance(
        &mut self,
        element: &ElementRecord,
        target_id: EntityId,
    ) -> MirrorResult<()> {
        if !self.context.options.force_external_source_aspect_provenance {
            let target_guid = self
                .context
                .target
                .element(target_id)
                .and_then(|e| e.federation_guid);
            if element.federation_guid.is_some() && target_guid.is_some() {
                return Ok(());
            }
        }

        let version = element.last_modified.to_string();
        match self.context.options.direction {
            SyncDirection::Forward => {
                self.provenance_writer
                    .upsert_element_provenance(target_id, element.id, &version)?;
            }
            SyncDirection::Reverse => {
                self.provenance_writer
                    .upsert_element_provenance(element.id, target_id, &version)?;
            }
        }
        Ok(())
    }

    /// Target resolution for a deleted source element: persisted aspect,
    /// then the guid the element used to carry, then the remap.
    fn resolve_deleted_element_target(&self, source_id: EntityId) -> Option<EntityId> {
        let by_provenance = match self.context.options.direction {
            SyncDirection::Forward => self.provenance_reader.find_element(source_id),
            SyncDirection::Reverse => self.provenance_reader.identifier_of_element(source_id),
        };
        if let Some(found) = by_provenance {
            return Some(found);
        }
        if let Some(guid) = self
            .changes
            .as_ref()
            .and_then(|c| c.deleted_element_guid(source_id))
        {
            if let Some(found) = self.context.target.element_id_by_guid(guid) {
                return Some(found);
            }
        }
        self.clone_context.find_target_element(source_id)
    }
}

#[async_trait]
impl ExportObserver for Transformer {
    async fn pre_export_element(&mut self, element: &ElementRecord) -> MirrorResult<()> {
        // Change-gated runs can reach an element whose code spec was never
        // exported this run; map it on demand.
        if !element.code.is_empty() {
            self.clone_context.import_code_spec(
                self.context.source.as_ref(),
                self.context.target.as_ref(),
                element.code.spec,
            )?;
        }
        Ok(())
    }

    async fn on_export_schema(&mut self, schema: &SchemaDef) -> MirrorResult<()> {
        let target_catalog = self.context.target.catalog();
        if let Some(existing) = target_catalog.schema(&schema.name) {
            if existing.version >= schema.version {
                return Ok(());
            }
        }
        debug!(schema = %schema.name, "importing schema");
        let classes = self
            .context
            .source
            .catalog()
            .classes_of_schema(&schema.name);
        self.context.target.import_schema(schema, &classes)?;
        Ok(())
    }

    async fn on_export_code_spec(&mut self, id: EntityId) -> MirrorResult<()> {
        self.clone_context.import_code_spec(
            self.context.source.as_ref(),
            self.context.target.as_ref(),
            id,
        )?;
        self.complete_waiters_of(EntityRef::code_spec(id))?;
        Ok(())
    }

    async fn on_export_font(&mut self, font: &FontRecord) -> MirrorResult<()> {
        self.clone_context.import_font(
            self.context.source.as_ref(),
            self.context.target.as_ref(),
            font.id,
        )?;
        Ok(())
    }

    async fn on_export_element(
        &mut self,
        element: &ElementRecord,
        is_update: Option<bool>,
    ) -> MirrorResult<()> {
        self.transform_element(element, is_update)
    }

    async fn on_export_model(
        &mut self,
        model: &ModelRecord,
        _is_update: Option<bool>,
    ) -> MirrorResult<()> {
        if self.clone_context.find_target_element(model.id).is_none() {
            // The modeled element was excluded or never mapped.
            debug!(model = %model.id, "skipping model with unmapped element");
            return Ok(());
        }
        let record = self.clone_context.clone_model(model)?;
        if let Some(existing) = self.context.target.model(record.id) {
            let mut comparable = existing;
            comparable.last_modified = 0;
            if comparable == record {
                return Ok(());
            }
        }
        self.importer.import_model(record)?;
        self.stats.models_written += 1;
        Ok(())
    }

    async fn on_export_unique_aspect(
        &mut self,
        aspect: &AspectRecord,
        _is_update: Option<bool>,
    ) -> MirrorResult<()> {
        let Some(owner) = self.clone_context.find_target_element(aspect.element_id) else {
            debug!(aspect = %aspect.id, "skipping aspect of unmapped element");
            return Ok(());
        };
        if let Some(existing) = self
            .context
            .target
            .aspects_of_element(owner)
            .into_iter()
            .find(|a| a.class_name == aspect.class_name)
        {
            if existing.properties == aspect.properties {
                self.clone_context.remap_aspect(aspect.id, existing.id);
                return Ok(());
            }
        }
        let mut record = aspect.clone();
        record.element_id = owner;
        record.last_modified = 0;
        let target_id = self.importer.import_element_unique_aspect(record)?;
        self.clone_context.remap_aspect(aspect.id, target_id);
        self.stats.aspects_written += 1;
        Ok(())
    }

    async fn on_export_multi_aspects(
        &mut self,
        owner: EntityId,
        aspects: &[AspectRecord],
    ) -> MirrorResult<()> {
        let Some(target_owner) = self.clone_context.find_target_element(owner) else {
            debug!(element = %owner, "skipping aspects of unmapped element");
            return Ok(());
        };

        // Source-side provenance aspects only reach this point when the run
        // asked to import them; they are copied as plain data, never through
        // the replace path, so the target's own provenance stays untouched.
        let (foreign_provenance, aspects): (Vec<&AspectRecord>, Vec<&AspectRecord>) = aspects
            .iter()
            .partition(|a| a.class_name == EXTERNAL_SOURCE_ASPECT_CLASS);
        for aspect in foreign_provenance {
            let already_present = self
                .context
                .target
                .aspects_of_element(target_owner)
                .iter()
                .any(|existing| {
                    existing.class_name == EXTERNAL_SOURCE_ASPECT_CLASS
                        && existing.properties == aspect.properties
                });
            if !already_present {
                let mut record = aspect.clone();
                record.id = EntityId::INVALID;
                record.element_id = target_owner;
                record.last_modified = 0;
                self.context.target.insert_aspect(record)?;
                self.stats.aspects_written += 1;
            }
        }
        if aspects.is_empty() {
            return Ok(());
        }

        // Replacing is only worth it when the batch differs from what the
        // target already carries for these classes.
        let batch_classes: HashSet<&str> = aspects.iter().map(|a| a.class_name.as_str()).collect();
        let key = |class: &str, properties: &serde_json::Value| {
            (class.to_string(), properties.to_string())
        };
        let mut existing: Vec<_> = self
            .context
            .target
            .aspects_of_element(target_owner)
            .into_iter()
            .filter(|a| {
                a.ownership == AspectOwnership::Multi
                    && batch_classes.contains(a.class_name.as_str())
            })
            .map(|a| key(&a.class_name, &a.properties))
            .collect();
        let mut incoming: Vec<_> = aspects
            .iter()
            .map(|a| key(&a.class_name, &a.properties))
            .collect();
        existing.sort();
        incoming.sort();
        if existing == incoming {
            return Ok(());
        }

        let mut records = vec![];
        for aspect in &aspects {
            let mut record = (*aspect).clone();
            record.element_id = target_owner;
            record.last_modified = 0;
            records.push(record);
        }
        let inserted = self
            .importer
            .import_element_multi_aspects(target_owner, records)?;
        for (aspect, target_id) in aspects.iter().zip(&inserted) {
            self.clone_context.remap_aspect(aspect.id, *target_id);
        }
        self.stats.aspects_written += inserted.len();
        Ok(())
    }

    async fn on_export_relationship(
        &mut self,
        relationship: &RelationshipRecord,
        _is_update: Option<bool>,
    ) -> MirrorResult<()> {
        let source_end = self
            .clone_context
            .find_target_element(relationship.source_id);
        let target_end = self
            .clone_context
            .find_target_element(relationship.target_id);
        let (Some(source_end), Some(target_end)) = (source_end, target_end) else {
            warn!(
                relationship = %relationship.id,
                "skipping relationship with unmapped endpoints"
            );
            return Ok(());
        };

        let record = RelationshipRecord {
            id: EntityId::INVALID,
            class_name: relationship.class_name.clone(),
            source_id: source_end,
            target_id: target_end,
            properties: relationship.properties.clone(),
            last_modified: 0,
        };
        if let Some(existing) = self.context.target.find_relationship(
            &record.class_name,
            source_end,
            target_end,
        ) {
            if existing.properties == record.properties {
                return Ok(());
            }
        }
        let target_relationship = self.importer.import_relationship(record)?;
        self.stats.relationships_written += 1;

        if !self.context.options.no_provenance {
            match self.context.options.direction {
                SyncDirection::Forward => {
                    self.provenance_writer.upsert_relationship_provenance(
                        source_end,
                        relationship.id,
                        target_relationship,
                    )?;
                }
                SyncDirection::Reverse => {
                    self.provenance_writer.upsert_relationship_provenance(
                        relationship.source_id,
                        relationship.id,
                        target_relationship,
                    )?;
                }
            }
        }
        Ok(())
    }

    async fn on_delete_element(&mut self, id: EntityId) -> MirrorResult<()> {
        let Some(target_id) = self.resolve_deleted_element_target(id) else {
            debug!(element = %id, "deleted element has no target");
            return Ok(());
        };
        if self.touched_targets.contains(&target_id) {
            // The entity was recreated under a new source id; the update
            // already flowed, so the delete is cancelled.
            debug!(element = %id, target = %target_id, "suppressing delete of recreated entity");
            return Ok(());
        }

        let result = if self.deferred_tree_deletes.remove(&target_id) {
            self.importer.delete_element_tree(target_id)
        } else {
            self.importer.delete_element(target_id)
        };
        match result {
            Ok(()) => {
                self.stats.elements_deleted += 1;
                self.clone_context.remove_element(id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(element = %target_id, "delete target already gone");
                self.clone_context.remove_element(id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_delete_model(&mut self, id: EntityId) -> MirrorResult<()> {
        let Some(target_id) = self.resolve_deleted_element_target(id) else {
            debug!(model = %id, "deleted model has no target");
            return Ok(());
        };
        if self.touched_targets.contains(&target_id) {
            return Ok(());
        }
        match self.importer.delete_model(target_id) {
            Ok(()) => {
                self.stats.models_deleted += 1;
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(MirrorError::Store(StoreError::Constraint(reason))) => {
                // A definition model that still has elements: defer to the
                // modeled partition element, whose tree delete cascades.
                debug!(model = %target_id, %reason, "model delete deferred to its partition");
                self.deferred_tree_deletes.insert(target_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_delete_aspect(&mut self, id: EntityId) -> MirrorResult<()> {
        let Some(target_id) = self
            .clone_context
            .find_target(EntityKind::ElementAspect, id)
        else {
            return Ok(());
        };
        match self.importer.delete_aspect(target_id) {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn on_delete_relationship(&mut self, id: EntityId) -> MirrorResult<()> {
        let Some(resolved) = self.deleted_relationship_targets.remove(&id) else {
            debug!(relationship = %id, "deleted relationship has no target");
            return Ok(());
        };
        match self
            .importer
            .delete_relationship(resolved.target_relationship)
        {
            Ok(()) => self.stats.relationships_deleted += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        if let Some(aspect_id) = resolved.provenance_aspect {
            // A missing provenance aspect is tolerated.
            match self.provenance_writer.delete_aspect(aspect_id) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn on_progress(&mut self, entities_visited: u64) {
        info!(entities_visited, "export progress");
    }
}
