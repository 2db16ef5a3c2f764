// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use crate::error::{MirrorError, MirrorResult};

/// Subtracts a skip-set from the inclusive range `[start, end]`, yielding the
/// ordered disjoint subranges that cover every remaining integer.
///
/// The skip list may be unsorted, contain duplicates, and contain values
/// outside the range; none of that affects the result. Rejects `start > end`.
pub fn subtract_range(start: i64, end: i64, skipped: &[i64]) -> MirrorResult<Vec<(i64, i64)>> {
    if start > end {
        return Err(MirrorError::InvalidArgument(format!(
            "range start {start} is past end {end}"
        )));
    }

    let mut skips: Vec<i64> = skipped
        .iter()
        .copied()
        .filter(|k| (start..=end).contains(k))
        .collect();
    skips.sort_unstable();
    skips.dedup();

    let mut result = vec![];
    let mut cursor = start;
    for skip in skips {
        if skip > cursor {
            result.push((cursor, skip - 1));
        }
        cursor = skip + 1;
    }
    if cursor <= end {
        result.push((cursor, end));
    }
    Ok(result)
}
