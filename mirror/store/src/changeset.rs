// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use mirror_types::EntityId;

use crate::store::{Store, StoreError, StoreResult};

/// Identity of one changeset: a stable string id plus a monotonic index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangesetInfo {
    pub id: String,
    pub index: i64,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    Inserted,
    Updated,
    Deleted,
}

/// One EC-level change row, as parsed out of a changeset file. A single
/// logical instance can be spread across several rows when its class maps to
/// several tables.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EcChangeRow {
    pub class_name: String,
    pub instance_id: EntityId,
    pub op: ChangeOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_values: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_values: Option<Value>,
}

/// A fully opened changeset: identity plus its EC-level rows.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesetData {
    pub info: ChangesetInfo,
    pub rows: Vec<EcChangeRow>,
}

/// One coalesced changed instance, after partial rows are unified.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangedEcInstance {
    pub class_name: String,
    pub instance_id: EntityId,
    pub op: ChangeOp,
    pub old_values: Option<Value>,
    pub new_values: Option<Value>,
}

/// Coalesces per-table fragments into one instance per `(class, id)`.
///
/// An insert fragment wins over updates; a delete fragment wins over
/// everything. Value maps merge with later fragments overriding earlier keys.
pub fn unify_partial_changes(rows: &[EcChangeRow]) -> Vec<ChangedEcInstance> {
    let mut unified: BTreeMap<(String, EntityId), ChangedEcInstance> = BTreeMap::new();
    for row in rows {
        let key = (row.class_name.clone(), row.instance_id);
        match unified.get_mut(&key) {
            None => {
                unified.insert(
                    key,
                    ChangedEcInstance {
                        class_name: row.class_name.clone(),
                        instance_id: row.instance_id,
                        op: row.op,
                        old_values: row.old_values.clone(),
                        new_values: row.new_values.clone(),
                    },
                );
            }
            Some(existing) => {
                existing.op = match (existing.op, row.op) {
                    (_, ChangeOp::Deleted) | (ChangeOp::Deleted, _) => ChangeOp::Deleted,
                    (ChangeOp::Inserted, _) | (_, ChangeOp::Inserted) => ChangeOp::Inserted,
                    _ => ChangeOp::Updated,
                };
                merge_values(&mut existing.old_values, &row.old_values);
                merge_values(&mut existing.new_values, &row.new_values);
            }
        }
    }
    unified.into_values().collect()
}

fn merge_values(into: &mut Option<Value>, from: &Option<Value>) {
    let Some(from) = from else { return };
    match into {
        None => *into = Some(from.clone()),
        Some(Value::Object(into_map)) => {
            if let Value::Object(from_map) = from {
                for (key, value) in from_map {
                    into_map.insert(key.clone(), value.clone());
                }
            }
        }
        Some(_) => {}
    }
}

/// Access to the hub that stores changeset files. Fetching suspends, so the
/// contract is async; everything else in the store layer is synchronous.
#[async_trait]
pub trait ChangesetHub: Send + Sync {
    /// Downloads the inclusive index range, ascending.
    async fn download_changesets(&self, first: i64, last: i64) -> StoreResult<Vec<ChangesetData>>;
}

/// Serves changesets straight from a store's applied-changeset log. Used when
/// source and "hub" are the same local database.
pub struct StoreBackedHub {
    store: Arc<dyn Store>,
}

impl StoreBackedHub {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChangesetHub for StoreBackedHub {
    async fn download_changesets(&self, first: i64, last: i64) -> StoreResult<Vec<ChangesetData>> {
        self.store.changesets_in_range(first, last)
    }
}

/// Serves changesets from a directory of `<index>.json` files, one per
/// changeset, the layout the snapshot tooling writes.
pub struct DirectoryHub {
    directory: PathBuf,
}

impl DirectoryHub {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl ChangesetHub for DirectoryHub {
    async fn download_changesets(&self, first: i64, last: i64) -> StoreResult<Vec<ChangesetData>> {
        let mut result = vec![];
        for index in first..=last {
            let path = self.directory.join(format!("{index}.json"));
            let text = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::Io(format!("{}: {e}", path.display())))?;
            let data: ChangesetData = serde_json::from_str(&text)
                .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))?;
            result.push(data);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(op: ChangeOp, values: Value) -> EcChangeRow {
        EcChangeRow {
            class_name: "Core.Element".to_string(),
            instance_id: EntityId(0xa),
            op,
            old_values: None,
            new_values: Some(values),
        }
    }

    #[test]
    fn fragments_coalesce_into_one_instance() {
        let rows = vec![
            row(ChangeOp::Inserted, json!({ "a": 1 })),
            row(ChangeOp::Updated, json!({ "b": 2 })),
        ];
        let unified = unify_partial_changes(&rows);
        assert_eq!(unified.len(), 1);
        assert_eq!(unified[0].op, ChangeOp::Inserted);
        assert_eq!(unified[0].new_values, Some(json!({ "a": 1, "b": 2 })));
    }

    #[test]
    fn delete_fragment_wins() {
        let rows = vec![
            row(ChangeOp::Updated, json!({ "a": 1 })),
            row(ChangeOp::Deleted, Value::Null),
        ];
        let unified = unify_partial_changes(&rows);
        assert_eq!(unified.len(), 1);
        assert_eq!(unified[0].op, ChangeOp::Deleted);
    }

    #[test]
    fn distinct_instances_stay_distinct() {
        let mut rows = vec![row(ChangeOp::Updated, json!({ "a": 1 }))];
        rows.push(EcChangeRow {
            instance_id: EntityId(0xb),
            ..rows[0].clone()
        });
        assert_eq!(unify_partial_changes(&rows).len(), 2);
    }

    #[tokio::test]
    async fn directory_hub_serves_indexed_files() {
        let dir = tempfile::tempdir().unwrap();
        for index in 1..=2 {
            let data = ChangesetData {
                info: ChangesetInfo {
                    id: format!("cs{index}"),
                    index,
                    description: String::new(),
                },
                rows: vec![],
            };
            std::fs::write(
                dir.path().join(format!("{index}.json")),
                serde_json::to_string(&data).unwrap(),
            )
            .unwrap();
        }

        let hub = DirectoryHub::new(dir.path());
        let sets = hub.download_changesets(1, 2).await.unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1].info.id, "cs2");
        // A hole in the range is an error, not a silent skip.
        assert!(hub.download_changesets(1, 3).await.is_err());
    }
}
