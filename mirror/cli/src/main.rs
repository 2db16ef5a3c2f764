// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Synchronizes one snapshot-file store into another.
//!
//! Snapshot stores are the JSON files [`MemStore`] saves; real deployments
//! put a relational backend behind the same `Store` trait. Both snapshots
//! are rewritten in place on success.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};

use mirror_core::{DanglingReferencePolicy, RunOptions, SyncDirection, Transformer};
use mirror_store::{MemStore, Store};
use mirror_types::EntityId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum DanglingReferences {
    Reject,
    Ignore,
}

#[derive(Parser, Debug)]
#[command(name = "mirror", about = "Synchronize one graph store into another")]
struct Args {
    /// Source snapshot file.
    #[arg(long)]
    source: PathBuf,

    /// Target snapshot file.
    #[arg(long)]
    target: PathBuf,

    /// First changeset to process, by index, overriding the recorded
    /// watermark.
    #[arg(long, value_name = "INDEX")]
    start_changeset: Option<i64>,

    /// Explicit inclusive index ranges, e.g. `2-5,8-8`.
    #[arg(long, value_name = "RANGES")]
    changeset_range: Option<String>,

    /// Synchronize in the reverse direction: provenance flows into the
    /// source.
    #[arg(long)]
    reverse: bool,

    /// Import the source's own provenance aspects as data.
    #[arg(long)]
    include_source_provenance: bool,

    /// Write provenance aspects even where federation guids match.
    #[arg(long)]
    force_external_source_aspect_provenance: bool,

    /// Keep source element ids in the target.
    #[arg(long)]
    preserve_element_ids: bool,

    /// How to treat references to entities missing from the source.
    #[arg(long, value_enum, default_value_t = DanglingReferences::Reject)]
    dangling_references: DanglingReferences,

    /// Record no provenance. The run cannot be resumed or reversed.
    #[arg(long)]
    no_provenance: bool,

    /// Accept a changeset range that does not line up with the recorded
    /// watermark.
    #[arg(long)]
    ignore_missing_changesets: bool,

    /// The target-side element provenance hangs off, as a hex id.
    #[arg(long, value_name = "ID")]
    target_scope_element: Option<String>,

    /// Description recorded on the changesets this run seals.
    #[arg(long, default_value = "mirror synchronization")]
    description: String,
}

/// Parses `a-b,c-d` into inclusive index ranges.
fn parse_changeset_ranges(text: &str) -> anyhow::Result<Vec<(i64, i64)>> {
    let mut ranges = vec![];
    for part in text.split(',') {
        let (first, last) = part
            .split_once('-')
            .with_context(|| format!("malformed range {part:?}, expected a-b"))?;
        let first: i64 = first.trim().parse().with_context(|| format!("range {part:?}"))?;
        let last: i64 = last.trim().parse().with_context(|| format!("range {part:?}"))?;
        if first > last {
            bail!("range {part:?} is inverted");
        }
        ranges.push((first, last));
    }
    Ok(ranges)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let source = Arc::new(
        MemStore::load_snapshot(&args.source)
            .with_context(|| format!("opening source {}", args.source.display()))?,
    );
    let target = Arc::new(
        MemStore::load_snapshot(&args.target)
            .with_context(|| format!("opening target {}", args.target.display()))?,
    );

    let mut options = RunOptions {
        direction: if args.reverse {
            SyncDirection::Reverse
        } else {
            SyncDirection::Forward
        },
        preserve_element_ids: args.preserve_element_ids,
        include_source_provenance: args.include_source_provenance,
        force_external_source_aspect_provenance: args.force_external_source_aspect_provenance,
        no_provenance: args.no_provenance,
        ignore_missing_changesets: args.ignore_missing_changesets,
        start_changeset_index: args.start_changeset,
        dangling_references: match args.dangling_references {
            DanglingReferences::Reject => DanglingReferencePolicy::Reject,
            DanglingReferences::Ignore => DanglingReferencePolicy::Ignore,
        },
        ..RunOptions::default()
    };
    if let Some(scope) = &args.target_scope_element {
        let id: EntityId = scope
            .parse()
            .map_err(|e| anyhow::anyhow!("--target-scope-element: {e}"))?;
        options.target_scope_element = id;
    }
    if let Some(ranges) = &args.changeset_range {
        options.changeset_ranges = Some(parse_changeset_ranges(ranges)?);
    }

    if args.reverse && args.no_provenance {
        bail!("--reverse requires provenance; --no-provenance cannot be combined with it");
    }

    let mut transformer = Transformer::new(source.clone(), target.clone(), options);
    let result = transformer.run().await?;
    info!(
        inserted = result.elements_inserted,
        updated = result.elements_updated,
        deleted = result.elements_deleted,
        relationships = result.relationships_written,
        "synchronization complete"
    );

    // The engine leaves the save boundary to its caller; seal and persist
    // both sides here.
    if target.has_unsaved_changes() {
        target.seal_changeset(&format!("mirror-{}", target.changeset().index + 1), &args.description)?;
    }
    if source.has_unsaved_changes() {
        source.seal_changeset(&format!("mirror-{}", source.changeset().index + 1), &args.description)?;
    }
    target
        .save_snapshot(&args.target)
        .with_context(|| format!("saving target {}", args.target.display()))?;
    source
        .save_snapshot(&args.source)
        .with_context(|| format!("saving source {}", args.source.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changeset_ranges_parse() {
        assert_eq!(
            parse_changeset_ranges("2-5,8-8").unwrap(),
            vec![(2, 5), (8, 8)]
        );
        assert!(parse_changeset_ranges("5-2").is_err());
        assert!(parse_changeset_ranges("nope").is_err());
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
