use std::{
    fs,
    io,
    path::Path,
};

use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};
use ulid::Ulid;

use crate::META_FILENAME;

pub const META_VERSION: u32 = 1;

/// Block metadata persisted as `meta.json`. Field names follow the
/// Prometheus/Thanos convention so external tooling can read the documents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub ulid: Ulid,
    /// Inclusive interval owned by the block, in UTC milliseconds.
    pub min_time: i64,
    pub max_time: i64,
    pub stats: BlockStats,
    pub compaction: BlockCompaction,
    pub version: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub num_samples: u64,
    pub num_series: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockCompaction {
    pub level: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Ulid>,
}

impl BlockMeta {
    /// Overlap predicate: `block.min <= maxt && block.max >= mint`.
    pub fn overlaps(&self, mint: i64, maxt: i64) -> bool {
        self.min_time <= maxt && self.max_time >= mint
    }
}

pub fn read_meta(block_dir: &Path) -> anyhow::Result<BlockMeta> {
    let path = block_dir.join(META_FILENAME);
    let raw = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let meta: BlockMeta =
        serde_json::from_slice(&raw).with_context(|| format!("decoding {}", path.display()))?;
    Ok(meta)
}

/// Reads a meta document if the block directory has one; `Ok(None)` when the
/// file is absent so callers can skip non-block directories.
pub fn try_read_meta(block_dir: &Path) -> anyhow::Result<Option<BlockMeta>> {
    let path = block_dir.join(META_FILENAME);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let meta: BlockMeta =
        serde_json::from_slice(&raw).with_context(|| format!("decoding {}", path.display()))?;
    Ok(Some(meta))
}

pub fn write_meta(block_dir: &Path, meta: &BlockMeta) -> anyhow::Result<()> {
    let path = block_dir.join(META_FILENAME);
    let raw = serde_json::to_vec_pretty(meta)?;
    fs::write(&path, raw).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::{
        read_meta,
        try_read_meta,
        write_meta,
        BlockCompaction,
        BlockMeta,
        BlockStats,
        META_VERSION,
    };

    #[test]
    fn test_meta_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let meta = BlockMeta {
            ulid: Ulid::new(),
            min_time: 1000,
            max_time: 1999,
            stats: BlockStats {
                num_samples: 42,
                num_series: 7,
            },
            compaction: BlockCompaction {
                level: 1,
                sources: vec![],
            },
            version: META_VERSION,
        };
        write_meta(dir.path(), &meta)?;
        assert_eq!(read_meta(dir.path())?, meta);
        Ok(())
    }

    #[test]
    fn test_meta_field_names_are_thanos_compatible() -> anyhow::Result<()> {
        let meta = BlockMeta {
            ulid: Ulid::new(),
            min_time: 0,
            max_time: 1,
            stats: BlockStats::default(),
            compaction: BlockCompaction::default(),
            version: META_VERSION,
        };
        let doc: serde_json::Value = serde_json::from_str(&serde_json::to_string(&meta)?)?;
        assert!(doc.get("minTime").is_some());
        assert!(doc.get("maxTime").is_some());
        assert!(doc["stats"].get("numSamples").is_some());
        Ok(())
    }

    #[test]
    fn test_try_read_meta_missing() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        assert_eq!(try_read_meta(dir.path())?, None);
        Ok(())
    }

    #[test]
    fn test_overlap_predicate() {
        let meta = BlockMeta {
            ulid: Ulid::new(),
            min_time: 100,
            max_time: 200,
            stats: BlockStats::default(),
            compaction: BlockCompaction::default(),
            version: META_VERSION,
        };
        assert!(meta.overlaps(150, 250));
        assert!(meta.overlaps(200, 300));
        assert!(meta.overlaps(0, 100));
        assert!(!meta.overlaps(201, 300));
        assert!(!meta.overlaps(0, 99));
    }
}
