// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Opaque geometry stream handling.
//!
//! A stream is a sequence of tagged records. The engine never interprets the
//! geometry itself; the only operation it needs is rewriting the element and
//! font ids embedded in the stream through the remap tables.
//!
//! Wire format, little-endian:
//! - `0x01` + 8-byte element id
//! - `0x02` + 8-byte font id
//! - `0x03` + 4-byte length + raw bytes

use mirror_types::EntityId;

use crate::store::{StoreError, StoreResult};

const TAG_ELEMENT: u8 = 0x01;
const TAG_FONT: u8 = 0x02;
const TAG_BLOB: u8 = 0x03;

/// Assembles geometry streams for tests and snapshot tooling.
#[derive(Default)]
pub struct GeometryStreamBuilder {
    bytes: Vec<u8>,
}

impl GeometryStreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element_ref(mut self, id: EntityId) -> Self {
        self.bytes.push(TAG_ELEMENT);
        self.bytes.extend_from_slice(&id.0.to_le_bytes());
        self
    }

    pub fn font_ref(mut self, id: EntityId) -> Self {
        self.bytes.push(TAG_FONT);
        self.bytes.extend_from_slice(&id.0.to_le_bytes());
        self
    }

    pub fn blob(mut self, data: &[u8]) -> Self {
        self.bytes.push(TAG_BLOB);
        self.bytes
            .extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(data);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

/// Result of rewriting a stream: the new bytes, plus every element id that
/// had no mapping yet and was left in source space.
pub struct RemappedGeometry {
    pub bytes: Vec<u8>,
    pub unresolved_elements: Vec<EntityId>,
}

/// Rewrites embedded element and font ids through the supplied lookups.
/// Ids without a mapping are kept unchanged and reported, so the caller can
/// defer the element until its references resolve.
pub fn remap_geometry_stream(
    bytes: &[u8],
    element_lookup: &dyn Fn(EntityId) -> Option<EntityId>,
    font_lookup: &dyn Fn(EntityId) -> Option<EntityId>,
) -> StoreResult<RemappedGeometry> {
    let mut output = Vec::with_capacity(bytes.len());
    let mut unresolved_elements = vec![];
    let mut cursor = 0usize;

    let truncated = || StoreError::Corrupt("truncated geometry stream".to_string());

    while cursor < bytes.len() {
        let tag = bytes[cursor];
        cursor += 1;
        match tag {
            TAG_ELEMENT | TAG_FONT => {
                let raw = bytes
                    .get(cursor..cursor + 8)
                    .ok_or_else(truncated)?
                    .try_into()
                    .expect("slice length checked");
                cursor += 8;
                let id = EntityId(u64::from_le_bytes(raw));
                let mapped = if tag == TAG_ELEMENT {
                    let mapped = element_lookup(id);
                    if mapped.is_none() {
                        unresolved_elements.push(id);
                    }
                    mapped
                } else {
                    font_lookup(id)
                };
                output.push(tag);
                output.extend_from_slice(&mapped.unwrap_or(id).0.to_le_bytes());
            }
            TAG_BLOB => {
                let raw = bytes
                    .get(cursor..cursor + 4)
                    .ok_or_else(truncated)?
                    .try_into()
                    .expect("slice length checked");
                cursor += 4;
                let len = u32::from_le_bytes(raw) as usize;
                let data = bytes.get(cursor..cursor + len).ok_or_else(truncated)?;
                cursor += len;
                output.push(TAG_BLOB);
                output.extend_from_slice(&(len as u32).to_le_bytes());
                output.extend_from_slice(data);
            }
            other => {
                return Err(StoreError::Corrupt(format!(
                    "unknown geometry stream tag {other:#x}"
                )));
            }
        }
    }

    Ok(RemappedGeometry {
        bytes: output,
        unresolved_elements,
    })
}

/// Drops zero-length blob records. Returns `None` when the stream is already
/// optimal, so callers can skip the row update.
pub fn strip_empty_blobs(bytes: &[u8]) -> StoreResult<Option<Vec<u8>>> {
    let mut output = Vec::with_capacity(bytes.len());
    let mut cursor = 0usize;
    let mut changed = false;

    let truncated = || StoreError::Corrupt("truncated geometry stream".to_string());

    while cursor < bytes.len() {
        let tag = bytes[cursor];
        match tag {
            TAG_ELEMENT | TAG_FONT => {
                let record = bytes.get(cursor..cursor + 9).ok_or_else(truncated)?;
                output.extend_from_slice(record);
                cursor += 9;
            }
            TAG_BLOB => {
                let raw = bytes
                    .get(cursor + 1..cursor + 5)
                    .ok_or_else(truncated)?
                    .try_into()
                    .expect("slice length checked");
                let len = u32::from_le_bytes(raw) as usize;
                let record = bytes.get(cursor..cursor + 5 + len).ok_or_else(truncated)?;
                if len == 0 {
                    changed = true;
                } else {
                    output.extend_from_slice(record);
                }
                cursor += 5 + len;
            }
            other => {
                return Err(StoreError::Corrupt(format!(
                    "unknown geometry stream tag {other:#x}"
                )));
            }
        }
    }

    Ok(changed.then_some(output))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn remaps_embedded_ids_and_keeps_blobs() {
        let stream = GeometryStreamBuilder::new()
            .element_ref(EntityId(0x10))
            .blob(b"vertices")
            .font_ref(EntityId(2))
            .build();

        let element_map: HashMap<EntityId, EntityId> =
            [(EntityId(0x10), EntityId(0x99))].into_iter().collect();
        let font_map: HashMap<EntityId, EntityId> =
            [(EntityId(2), EntityId(5))].into_iter().collect();

        let remapped = remap_geometry_stream(
            &stream,
            &|id| element_map.get(&id).copied(),
            &|id| font_map.get(&id).copied(),
        )
        .unwrap();

        assert!(remapped.unresolved_elements.is_empty());
        let expected = GeometryStreamBuilder::new()
            .element_ref(EntityId(0x99))
            .blob(b"vertices")
            .font_ref(EntityId(5))
            .build();
        assert_eq!(remapped.bytes, expected);
    }

    #[test]
    fn unmapped_element_is_kept_and_reported() {
        let stream = GeometryStreamBuilder::new().element_ref(EntityId(0x10)).build();
        let remapped = remap_geometry_stream(&stream, &|_| None, &|_| None).unwrap();
        assert_eq!(remapped.unresolved_elements, vec![EntityId(0x10)]);
        assert_eq!(remapped.bytes, stream);
    }

    #[test]
    fn truncated_stream_is_corrupt() {
        let mut stream = GeometryStreamBuilder::new().element_ref(EntityId(0x10)).build();
        stream.truncate(stream.len() - 1);
        assert!(remap_geometry_stream(&stream, &|id| Some(id), &|id| Some(id)).is_err());
    }

    #[test]
    fn unknown_tag_is_corrupt() {
        assert!(remap_geometry_stream(&[0x7f], &|id| Some(id), &|id| Some(id)).is_err());
    }

    #[test]
    fn strip_drops_only_empty_blobs() {
        let stream = GeometryStreamBuilder::new()
            .blob(b"")
            .element_ref(EntityId(1))
            .blob(b"mesh")
            .blob(b"")
            .build();
        let stripped = strip_empty_blobs(&stream).unwrap().unwrap();
        let expected = GeometryStreamBuilder::new()
            .element_ref(EntityId(1))
            .blob(b"mesh")
            .build();
        assert_eq!(stripped, expected);

        // A second pass reports nothing to do.
        assert!(strip_empty_blobs(&stripped).unwrap().is_none());
    }
}
