// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use mirror_store::{
    classes, AspectOwnership, AspectRecord, Catalog, ElementRecord, FontRecord, ModelRecord,
    RelationshipRecord, SchemaDef, Store,
};
use mirror_types::{EntityId, EntityKind, ROOT_SUBJECT};

use crate::changed::ChangedInstanceIds;
use crate::context::AspectStrategy;
use crate::error::MirrorResult;

/// Export configuration. Defaults describe a complete export.
#[derive(Clone, Debug)]
pub struct ExporterConfig {
    pub want_geometry: bool,
    pub want_system_schemas: bool,
    pub want_template_models: bool,
    pub visit_elements: bool,
    pub visit_relationships: bool,
    /// Entities between progress events.
    pub progress_interval: u64,
    pub aspect_strategy: AspectStrategy,
    /// Elements excluded by id, together with their subtrees.
    pub excluded_element_ids: BTreeSet<EntityId>,
    /// Element classes excluded polymorphically.
    pub excluded_element_classes: Vec<String>,
    /// Categories whose geometric elements are excluded.
    pub excluded_categories: BTreeSet<EntityId>,
    /// Aspect classes excluded polymorphically.
    pub excluded_aspect_classes: Vec<String>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            want_geometry: true,
            want_system_schemas: true,
            want_template_models: true,
            visit_elements: true,
            visit_relationships: true,
            progress_interval: 1000,
            aspect_strategy: AspectStrategy::default(),
            excluded_element_ids: BTreeSet::new(),
            excluded_element_classes: vec![],
            excluded_categories: BTreeSet::new(),
            excluded_aspect_classes: vec![],
        }
    }
}

/// Receives the typed export events in dependency-correct order. Implemented
/// by the transformer; the `should_export_*` filters let callers reject
/// entities beyond the exporter's own exclusion rules.
///
/// `is_update` is `None` on a full export and carries the change-gate verdict
/// on a delta export.
#[async_trait]
pub trait ExportObserver: Send {
    fn should_export_schema(&mut self, _schema: &SchemaDef) -> bool {
        true
    }
    fn should_export_element(&mut self, _element: &ElementRecord) -> bool {
        true
    }
    fn should_export_model(&mut self, _model: &ModelRecord) -> bool {
        true
    }
    fn should_export_aspect(&mut self, _aspect: &AspectRecord) -> bool {
        true
    }
    fn should_export_relationship(&mut self, _relationship: &RelationshipRecord) -> bool {
        true
    }

    /// Runs before an element is emitted, while the traversal can still be
    /// influenced (e.g. lazy reference setup).
    async fn pre_export_element(&mut self, _element: &ElementRecord) -> MirrorResult<()> {
        Ok(())
    }

    async fn on_export_schema(&mut self, schema: &SchemaDef) -> MirrorResult<()>;
    async fn on_export_code_spec(&mut self, id: EntityId) -> MirrorResult<()>;
    async fn on_export_font(&mut self, font: &FontRecord) -> MirrorResult<()>;
    async fn on_export_element(
        &mut self,
        element: &ElementRecord,
        is_update: Option<bool>,
    ) -> MirrorResult<()>;
    async fn on_export_model(
        &mut self,
        model: &ModelRecord,
        is_update: Option<bool>,
    ) -> MirrorResult<()>;
    async fn on_export_unique_aspect(
        &mut self,
        aspect: &AspectRecord,
        is_update: Option<bool>,
    ) -> MirrorResult<()>;
    async fn on_export_multi_aspects(
        &mut self,
        owner: EntityId,
        aspects: &[AspectRecord],
    ) -> MirrorResult<()>;
    async fn on_export_relationship(
        &mut self,
        relationship: &RelationshipRecord,
        is_update: Option<bool>,
    ) -> MirrorResult<()>;

    async fn on_delete_element(&mut self, id: EntityId) -> MirrorResult<()>;
    async fn on_delete_model(&mut self, id: EntityId) -> MirrorResult<()>;
    async fn on_delete_aspect(&mut self, id: EntityId) -> MirrorResult<()>;
    async fn on_delete_relationship(&mut self, id: EntityId) -> MirrorResult<()>;

    fn on_progress(&mut self, _entities_visited: u64) {}
}

/// Walks the source in an order that guarantees every emitted entity's
/// dependencies were emitted earlier or are recognizable as already present
/// in the target.
pub struct Exporter {
    source: Arc<dyn Store>,
    catalog: Catalog,
    config: ExporterConfig,
    /// Set for a change-gated export.
    changes: Option<ChangedInstanceIds>,
    visited_elements: HashSet<EntityId>,
    entities_visited: u64,
}

impl Exporter {
    pub fn new(source: Arc<dyn Store>, config: ExporterConfig) -> Self {
        let catalog = source.catalog();
        Self {
            source,
            catalog,
            config,
            changes: None,
            visited_elements: HashSet::new(),
            entities_visited: 0,
        }
    }

    /// Switches the exporter into change-gated mode.
    pub fn set_changes(&mut self, changes: ChangedInstanceIds) {
        self.changes = Some(changes);
    }

    pub fn changes(&self) -> Option<&ChangedInstanceIds> {
        self.changes.as_ref()
    }

    /// Runs the ordered passes: schemas, code specs, fonts, the element
    /// tree, repository extras, relationships, and (in change mode) the
    /// delete pass.
    pub async fn export<O: ExportObserver>(&mut self, observer: &mut O) -> MirrorResult<()> {
        self.visited_elements.clear();
        self.entities_visited = 0;

        self.export_schemas(observer).await?;
        self.export_code_specs(observer).await?;
        self.export_fonts(observer).await?;

        if self.config.visit_elements {
            self.export_element_forest(observer).await?;
        }
        if self.config.visit_relationships {
            self.export_relationships(observer).await?;
        }
        if self.changes.is_some() {
            self.export_deletes(observer).await?;
        }

        observer.on_progress(self.entities_visited);
        Ok(())
    }

    /// Schemas in row-id ascending order, so references hold.
    async fn export_schemas<O: ExportObserver>(&mut self, observer: &mut O) -> MirrorResult<()> {
        let schemas: Vec<SchemaDef> = self.catalog.schemas().to_vec();
        for schema in schemas {
            if schema.is_system && !self.config.want_system_schemas {
                continue;
            }
            if !observer.should_export_schema(&schema) {
                continue;
            }
            observer.on_export_schema(&schema).await?;
            self.count_entity(observer).await;
        }
        Ok(())
    }

    async fn export_code_specs<O: ExportObserver>(&mut self, observer: &mut O) -> MirrorResult<()> {
        let mut ids = self.source.code_spec_ids();
        ids.sort();
        for id in ids {
            if let Some(changes) = &self.changes {
                if changes.export_disposition(EntityKind::CodeSpec, id).is_none() {
                    continue;
                }
            }
            observer.on_export_code_spec(id).await?;
            self.count_entity(observer).await;
        }
        Ok(())
    }

    /// Fonts are always re-exported, even under change gating: font rows are
    /// tiny and their deletes are not tracked.
    async fn export_fonts<O: ExportObserver>(&mut self, observer: &mut O) -> MirrorResult<()> {
        let mut fonts = self.source.fonts();
        fonts.sort_by_key(|f| f.id);
        for font in fonts {
            observer.on_export_font(&font).await?;
            self.count_entity(observer).await;
        }
        Ok(())
    }

    /// The root subject's children recursively, then the repository model's
    /// non-subject contents.
    async fn export_element_forest<O: ExportObserver>(
        &mut self,
        observer: &mut O,
    ) -> MirrorResult<()> {
        self.visited_elements.insert(ROOT_SUBJECT);
        for child in self.subject_children_ordered(ROOT_SUBJECT) {
            self.export_element_tree(observer, child).await?;
        }

        for id in self.source.model_contents(ROOT_SUBJECT) {
            if self.visited_elements.contains(&id) {
                continue;
            }
            let Some(element) = self.source.element(id) else {
                continue;
            };
            if self
                .catalog
                .is_subclass_of(&element.class_name, classes::SUBJECT)
            {
                continue;
            }
            self.export_element_tree(observer, id).await?;
        }

        if self.config.aspect_strategy == AspectStrategy::Detached {
            self.export_detached_aspects(observer).await?;
        }
        Ok(())
    }

    /// A subject's children with definition partitions ahead of every other
    /// partition kind, ascending by id within each group.
    fn subject_children_ordered(&self, subject: EntityId) -> Vec<EntityId> {
        let mut children = self.source.child_elements(subject);
        children.sort_by_key(|id| {
            let is_definition = self
                .source
                .element(*id)
                .map(|e| {
                    self.catalog
                        .is_subclass_of(&e.class_name, classes::DEFINITION_PARTITION)
                })
                .unwrap_or(false);
            (!is_definition, *id)
        });
        children
    }

    /// One element, its aspects, its sub-model and contents, and its child
    /// elements, in that order.
    fn export_element_tree<'a, O: ExportObserver>(
        &'a mut self,
        observer: &'a mut O,
        id: EntityId,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = MirrorResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if !self.visited_elements.insert(id) {
                return Ok(());
            }
            let Some(element) = self.source.element(id) else {
                return Ok(());
            };

            if self.is_element_excluded(&element) {
                debug!(element = %id, "excluding element subtree");
                return Ok(());
            }

            // Change gating decides whether this element itself is emitted;
            // the subtree is walked either way, since descendants change
            // independently of their ancestors.
            let disposition = self
                .changes
                .as_ref()
                .map(|changes| changes.export_disposition(EntityKind::Element, id));
            let emit = !matches!(disposition, Some(None));

            if emit {
                observer.pre_export_element(&element).await?;
                if observer.should_export_element(&element) {
                    observer
                        .on_export_element(&element, disposition.flatten())
                        .await?;

                    if self.config.aspect_strategy == AspectStrategy::Inline {
                        self.export_aspects_of(observer, &element).await?;
                    }
                }
            }
            self.count_entity(observer).await;

            if let Some(model) = self.source.model(id) {
                self.export_model_and_contents(observer, model).await?;
            }

            let children = if self
                .catalog
                .is_subclass_of(&element.class_name, classes::SUBJECT)
            {
                self.subject_children_ordered(id)
            } else {
                self.source.child_elements(id)
            };
            for child in children {
                self.export_element_tree(observer, child).await?;
            }
            Ok(())
        })
    }

    /// Emits the model right after its container element, then walks the
    /// model's top-level contents.
    async fn export_model_and_contents<O: ExportObserver>(
        &mut self,
        observer: &mut O,
        model: ModelRecord,
    ) -> MirrorResult<()> {
        if model.is_template && !self.config.want_template_models {
            debug!(model = %model.id, "skipping template model");
            return Ok(());
        }

        let disposition = self
            .changes
            .as_ref()
            .map(|changes| changes.export_disposition(EntityKind::Model, model.id));
        let emit = !matches!(disposition, Some(None));
        if emit && observer.should_export_model(&model) {
            observer
                .on_export_model(&model, disposition.flatten())
                .await?;
        }
        self.count_entity(observer).await;

        for content in self.source.model_contents(model.id) {
            let Some(element) = self.source.element(content) else {
                continue;
            };
            // Elements whose parent lives in the same model are reached
            // through that parent's tree.
            let top_level = match element.parent_id {
                None => true,
                Some(parent) => self
                    .source
                    .element(parent)
                    .map(|p| p.model_id != model.id)
                    .unwrap_or(true),
            };
            if top_level {
                self.export_element_tree(observer, content).await?;
            }
        }
        Ok(())
    }

    async fn export_aspects_of<O: ExportObserver>(
        &mut self,
        observer: &mut O,
        element: &ElementRecord,
    ) -> MirrorResult<()> {
        let aspects = self.source.aspects_of_element(element.id);
        let mut multi = vec![];
        for aspect in aspects {
            if self.is_aspect_excluded(&aspect) || !observer.should_export_aspect(&aspect) {
                continue;
            }
            if let Some(changes) = &self.changes {
                if changes
                    .export_disposition(EntityKind::ElementAspect, aspect.id)
                    .is_none()
                {
                    continue;
                }
            }
            match aspect.ownership {
                AspectOwnership::Unique => {
                    let is_update = self
                        .changes
                        .as_ref()
                        .and_then(|c| c.export_disposition(EntityKind::ElementAspect, aspect.id));
                    observer.on_export_unique_aspect(&aspect, is_update).await?;
                }
                AspectOwnership::Multi => multi.push(aspect),
            }
        }
        if !multi.is_empty() {
            observer.on_export_multi_aspects(element.id, &multi).await?;
        }
        Ok(())
    }

    /// The detached strategy: two sequential passes over every exported
    /// element, unique aspects first, then multi-aspects batched by owner.
    async fn export_detached_aspects<O: ExportObserver>(
        &mut self,
        observer: &mut O,
    ) -> MirrorResult<()> {
        let mut owners: Vec<EntityId> = self.visited_elements.iter().copied().collect();
        owners.sort();

        for owner in &owners {
            for aspect in self.source.aspects_of_element(*owner) {
                if aspect.ownership != AspectOwnership::Unique {
                    continue;
                }
                if self.is_aspect_excluded(&aspect) || !observer.should_export_aspect(&aspect) {
                    continue;
                }
                let is_update = match &self.changes {
                    Some(changes) => {
                        match changes.export_disposition(EntityKind::ElementAspect, aspect.id) {
                            None => continue,
                            disposition => disposition,
                        }
                    }
                    None => None,
                };
                observer.on_export_unique_aspect(&aspect, is_update).await?;
            }
            self.count_entity(observer).await;
        }

        for owner in &owners {
            let multi: Vec<AspectRecord> = self
                .source
                .aspects_of_element(*owner)
                .into_iter()
                .filter(|a| a.ownership == AspectOwnership::Multi)
                .filter(|a| !self.is_aspect_excluded(a))
                .filter(|a| observer.should_export_aspect(a))
                .filter(|a| match &self.changes {
                    Some(changes) => changes
                        .export_disposition(EntityKind::ElementAspect, a.id)
                        .is_some(),
                    None => true,
                })
                .collect();
            if !multi.is_empty() {
                observer.on_export_multi_aspects(*owner, &multi).await?;
            }
        }
        Ok(())
    }

    /// Link-table relationships whose endpoints both resolved during the
    /// element passes (full export) or that the change gate selected.
    async fn export_relationships<O: ExportObserver>(
        &mut self,
        observer: &mut O,
    ) -> MirrorResult<()> {
        let mut ids = self.source.relationship_ids();
        ids.sort();
        for id in ids {
            let Some(relationship) = self.source.relationship(id) else {
                continue;
            };
            if !self
                .catalog
                .is_subclass_of(&relationship.class_name, classes::ELEMENT_REFERS_TO_ELEMENTS)
            {
                continue;
            }
            let is_update = match &self.changes {
                Some(changes) => {
                    match changes.export_disposition(EntityKind::Relationship, id) {
                        None => continue,
                        disposition => disposition,
                    }
                }
                None => {
                    if !self.visited_elements.contains(&relationship.source_id)
                        || !self.visited_elements.contains(&relationship.target_id)
                    {
                        continue;
                    }
                    None
                }
            };
            if !observer.should_export_relationship(&relationship) {
                continue;
            }
            observer.on_export_relationship(&relationship, is_update).await?;
            self.count_entity(observer).await;
        }
        Ok(())
    }

    /// The delete pass: models before elements, then aspects, then
    /// relationships. "Already gone" failures are the observer's to swallow.
    async fn export_deletes<O: ExportObserver>(&mut self, observer: &mut O) -> MirrorResult<()> {
        let changes = self.changes.clone().expect("delete pass requires changes");

        for id in changes.deleted(EntityKind::Model) {
            observer.on_delete_model(id).await?;
            self.count_entity(observer).await;
        }
        for id in changes.deleted(EntityKind::Element) {
            observer.on_delete_element(id).await?;
            self.count_entity(observer).await;
        }
        for id in changes.deleted(EntityKind::ElementAspect) {
            observer.on_delete_aspect(id).await?;
            self.count_entity(observer).await;
        }
        for id in changes.deleted(EntityKind::Relationship) {
            observer.on_delete_relationship(id).await?;
            self.count_entity(observer).await;
        }
        Ok(())
    }

    fn is_element_excluded(&self, element: &ElementRecord) -> bool {
        if self.config.excluded_element_ids.contains(&element.id) {
            return true;
        }
        if self
            .config
            .excluded_element_classes
            .iter()
            .any(|class| self.catalog.is_subclass_of(&element.class_name, class))
        {
            return true;
        }
        if !self.config.want_template_models
            && self
                .catalog
                .is_subclass_of(&element.class_name, classes::RECIPE_DEFINITION_ELEMENT)
        {
            return true;
        }
        if self
            .catalog
            .is_subclass_of(&element.class_name, classes::GEOMETRIC_ELEMENT)
        {
            if let Some(category) = element.navigation_id("category") {
                if self.config.excluded_categories.contains(&category) {
                    return true;
                }
            }
        }
        false
    }

    fn is_aspect_excluded(&self, aspect: &AspectRecord) -> bool {
        self.config
            .excluded_aspect_classes
            .iter()
            .any(|class| self.catalog.is_subclass_of(&aspect.class_name, class))
    }

    /// Cooperative yield plus periodic progress, once per visited entity.
    async fn count_entity<O: ExportObserver>(&mut self, observer: &mut O) {
        self.entities_visited += 1;
        if self.entities_visited % self.config.progress_interval == 0 {
            observer.on_progress(self.entities_visited);
        }
        tokio::task::yield_now().await;
    }
}
