use std::{
    collections::BTreeMap,
    fs,
    path::{
        Path,
        PathBuf,
    },
};

use anyhow::Context;
use timeseries::{
    Labels,
    Sample,
    Series,
};
use ulid::Ulid;

use crate::{
    chunks::{
        ChunkReader,
        ChunkWriter,
    },
    index::{
        read_index,
        write_index,
        IndexEntry,
    },
    meta::{
        read_meta,
        write_meta,
        BlockCompaction,
        BlockMeta,
        BlockStats,
        META_VERSION,
    },
    TOMBSTONES_FILENAME,
};

/// An opened immutable block: metadata and the in-memory series directory.
/// Sample runs stay on disk until a querier touches them.
pub struct Block {
    dir: PathBuf,
    meta: BlockMeta,
    index: Vec<IndexEntry>,
}

impl Block {
    pub fn open(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        let meta = read_meta(&dir)?;
        let index = read_index(&dir)?;
        Ok(Self { dir, meta, index })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    /// A cursor over the block's series overlapping `[mint, maxt]`, in label
    /// order, with samples clipped to the interval. The cursor owns its chunk
    /// reader and the relevant index entries, so it outlives the block handle.
    pub fn querier(&self, mint: i64, maxt: i64) -> anyhow::Result<BlockQuerier> {
        let reader = ChunkReader::open(&self.dir)?;
        let entries: Vec<IndexEntry> = self
            .index
            .iter()
            .filter(|e| e.overlaps(mint, maxt))
            .cloned()
            .collect();
        Ok(BlockQuerier {
            entries: entries.into_iter(),
            reader,
            mint,
            maxt,
        })
    }
}

pub struct BlockQuerier {
    entries: std::vec::IntoIter<IndexEntry>,
    reader: ChunkReader,
    mint: i64,
    maxt: i64,
}

impl Iterator for BlockQuerier {
    type Item = anyhow::Result<Series>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.entries.next()?;
            let samples = match self.reader.read_run(entry.chunk_offset, entry.num_samples) {
                Ok(samples) => samples,
                Err(e) => return Some(Err(e)),
            };
            let clipped: Vec<Sample> = samples
                .into_iter()
                .filter(|s| s.timestamp_ms >= self.mint && s.timestamp_ms <= self.maxt)
                .collect();
            if clipped.is_empty() {
                continue;
            }
            return Some(Ok(Series::new(entry.labels.clone(), clipped)));
        }
    }
}

/// Lays a finished block down on disk: chunk segment, index, empty
/// tombstones, then `meta.json`, all staged in a hidden sibling directory and
/// renamed into place so readers never observe a partial block.
pub fn write_block(
    parent_dir: &Path,
    series: &BTreeMap<Labels, Vec<Sample>>,
    compaction: BlockCompaction,
) -> anyhow::Result<BlockMeta> {
    anyhow::ensure!(!series.is_empty(), "refusing to write an empty block");
    let ulid = Ulid::new();
    let tmp_dir = parent_dir.join(format!(".tmp-{ulid}"));
    fs::create_dir_all(&tmp_dir)
        .with_context(|| format!("creating {}", tmp_dir.display()))?;

    let result = write_block_contents(&tmp_dir, series, ulid, compaction);
    match result {
        Ok(meta) => {
            let final_dir = parent_dir.join(ulid.to_string());
            fs::rename(&tmp_dir, &final_dir)
                .with_context(|| format!("renaming block into {}", final_dir.display()))?;
            Ok(meta)
        },
        Err(e) => {
            let _ = fs::remove_dir_all(&tmp_dir);
            Err(e)
        },
    }
}

fn write_block_contents(
    block_dir: &Path,
    series: &BTreeMap<Labels, Vec<Sample>>,
    ulid: Ulid,
    mut compaction: BlockCompaction,
) -> anyhow::Result<BlockMeta> {
    // A freshly written block is its own compaction source.
    if compaction.level == 0 {
        compaction.level = 1;
        compaction.sources = vec![ulid];
    }
    let mut chunk_writer = ChunkWriter::create(block_dir)?;
    let mut entries = Vec::with_capacity(series.len());
    let mut num_samples = 0u64;
    let mut min_time = i64::MAX;
    let mut max_time = i64::MIN;
    for (labels, samples) in series {
        debug_assert!(!samples.is_empty());
        debug_assert!(samples.windows(2).all(|w| w[0].timestamp_ms <= w[1].timestamp_ms));
        let chunk_offset = chunk_writer.write_run(samples)?;
        let series_min = samples[0].timestamp_ms;
        let series_max = samples[samples.len() - 1].timestamp_ms;
        min_time = min_time.min(series_min);
        max_time = max_time.max(series_max);
        num_samples += samples.len() as u64;
        entries.push(IndexEntry {
            labels: labels.clone(),
            chunk_offset,
            num_samples: samples.len() as u32,
            min_time: series_min,
            max_time: series_max,
        });
    }
    chunk_writer.finish()?;
    write_index(block_dir, &entries)?;
    fs::write(block_dir.join(TOMBSTONES_FILENAME), b"")?;
    let meta = BlockMeta {
        ulid,
        min_time,
        max_time,
        stats: BlockStats {
            num_samples,
            num_series: series.len() as u64,
        },
        compaction,
        version: META_VERSION,
    };
    write_meta(block_dir, &meta)?;
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use timeseries::{
        Labels,
        Sample,
    };

    use super::{
        write_block,
        Block,
    };
    use crate::meta::BlockCompaction;

    fn sample_series() -> BTreeMap<Labels, Vec<Sample>> {
        let mut series = BTreeMap::new();
        series.insert(
            Labels::from_pairs([("__name__", "up"), ("job", "node")]),
            vec![Sample::new(1_000, 1.0), Sample::new(61_000, 0.0)],
        );
        series.insert(
            Labels::from_pairs([("__name__", "up"), ("job", "prom")]),
            vec![Sample::new(31_000, 1.0)],
        );
        series
    }

    #[test]
    fn test_block_roundtrip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let meta = write_block(dir.path(), &sample_series(), BlockCompaction::default())?;
        assert_eq!(meta.min_time, 1_000);
        assert_eq!(meta.max_time, 61_000);
        assert_eq!(meta.stats.num_samples, 3);
        assert_eq!(meta.stats.num_series, 2);

        let block = Block::open(dir.path().join(meta.ulid.to_string()))?;
        let all: Vec<_> = block.querier(0, i64::MAX)?.collect::<anyhow::Result<_>>()?;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].samples.len(), 2);
        // tombstones marker exists until compaction removes it.
        assert!(block.dir().join("tombstones").exists());
        Ok(())
    }

    #[test]
    fn test_querier_clips_to_interval() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let meta = write_block(dir.path(), &sample_series(), BlockCompaction::default())?;
        let block = Block::open(dir.path().join(meta.ulid.to_string()))?;
        let got: Vec<_> = block.querier(0, 31_000)?.collect::<anyhow::Result<_>>()?;
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].samples, vec![Sample::new(1_000, 1.0)]);
        let got: Vec<_> = block
            .querier(62_000, i64::MAX)?
            .collect::<anyhow::Result<_>>()?;
        assert!(got.is_empty());
        Ok(())
    }

    #[test]
    fn test_empty_block_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(write_block(dir.path(), &BTreeMap::new(), BlockCompaction::default()).is_err());
    }
}
