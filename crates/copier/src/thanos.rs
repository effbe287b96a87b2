//! Optional post-processor that decorates every produced block's `meta.json`
//! with a Thanos-compatible object-store descriptor: the appended labels, a
//! zero-resolution downsample marker, and a file inventory.

use std::{
    fs,
    path::Path,
};

use anyhow::Context;
use serde_json::{
    json,
    Map,
    Value,
};
use timeseries::Labels;
use walkdir::WalkDir;

use tsdb::{
    CHUNKS_DIRNAME,
    INDEX_FILENAME,
    META_FILENAME,
};

/// Rewrites the meta document of each block under `target_dir` (tenant
/// subdirectories included) with a `thanos` section carrying `labels`.
pub fn append_thanos_metadata(target_dir: &Path, labels: &Labels) -> anyhow::Result<()> {
    anyhow::ensure!(
        !labels.is_empty(),
        "thanos metadata requires at least one appended label",
    );
    // Blocks sit either directly under the target or one tenant level down.
    for entry in WalkDir::new(target_dir).min_depth(1).max_depth(2) {
        let entry = entry?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let block_dir = entry.path();
        if !block_dir.join(META_FILENAME).exists() {
            continue;
        }
        decorate_block(block_dir, labels)
            .with_context(|| format!("decorating {}", block_dir.display()))?;
    }
    Ok(())
}

fn decorate_block(block_dir: &Path, labels: &Labels) -> anyhow::Result<()> {
    let meta_path = block_dir.join(META_FILENAME);
    let mut meta: Map<String, Value> = serde_json::from_slice(&fs::read(&meta_path)?)?;

    let mut segment_files = Vec::new();
    let mut files = Vec::new();
    let chunks_dir = block_dir.join(CHUNKS_DIRNAME);
    let mut chunk_entries: Vec<_> = fs::read_dir(&chunks_dir)
        .with_context(|| format!("reading {}", chunks_dir.display()))?
        .collect::<Result<_, _>>()?;
    chunk_entries.sort_by_key(|e| e.file_name());
    for chunk in chunk_entries {
        let name = chunk.file_name().to_string_lossy().into_owned();
        files.push(json!({
            "rel_path": format!("{CHUNKS_DIRNAME}/{name}"),
            "size_bytes": chunk.metadata()?.len(),
        }));
        segment_files.push(name);
    }
    let index_len = fs::metadata(block_dir.join(INDEX_FILENAME))?.len();
    files.push(json!({ "rel_path": INDEX_FILENAME, "size_bytes": index_len }));
    files.push(json!({ "rel_path": META_FILENAME }));

    let label_map: Map<String, Value> = labels
        .iter()
        .map(|l| (l.name.clone(), Value::String(l.value.clone())))
        .collect();
    meta.insert(
        "thanos".to_owned(),
        json!({
            "labels": label_map,
            "downsample": { "resolution": 0 },
            "source": "compactor",
            "segment_files": segment_files,
            "files": files,
        }),
    );
    fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use timeseries::{
        Labels,
        Sample,
    };
    use tsdb::{
        block::write_block,
        meta::BlockCompaction,
    };

    use super::append_thanos_metadata;

    #[test]
    fn test_decorates_blocks_in_tenant_subdirs() -> anyhow::Result<()> {
        let target = tempfile::tempdir()?;
        let tenant_dir = target.path().join("prod");
        std::fs::create_dir(&tenant_dir)?;
        let mut series = BTreeMap::new();
        series.insert(
            Labels::from_pairs([("__name__", "up")]),
            vec![Sample::new(1_000, 1.0)],
        );
        let meta = write_block(&tenant_dir, &series, BlockCompaction::default())?;

        append_thanos_metadata(target.path(), &Labels::from_pairs([("replica", "a")]))?;

        let raw = std::fs::read(
            tenant_dir
                .join(meta.ulid.to_string())
                .join("meta.json"),
        )?;
        let doc: serde_json::Value = serde_json::from_slice(&raw)?;
        assert_eq!(doc["thanos"]["labels"]["replica"], "a");
        assert_eq!(doc["thanos"]["downsample"]["resolution"], 0);
        assert_eq!(doc["thanos"]["source"], "compactor");
        let files = doc["thanos"]["files"].as_array().unwrap();
        assert!(files.iter().any(|f| f["rel_path"] == "index"));
        assert!(files
            .iter()
            .any(|f| f["rel_path"] == "chunks/000001" && f["size_bytes"] == 16));
        // The original metadata survives the rewrite.
        assert_eq!(doc["minTime"], 1_000);
        Ok(())
    }

    #[test]
    fn test_requires_labels() {
        let target = tempfile::tempdir().unwrap();
        assert!(append_thanos_metadata(target.path(), &Labels::default()).is_err());
    }
}
