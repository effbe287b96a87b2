use std::{
    fs,
    iter::Peekable,
    path::PathBuf,
};

use anyhow::Context;
use timeseries::{
    Labels,
    Sample,
    Series,
};

use crate::{
    block::{
        Block,
        BlockQuerier,
    },
    meta::BlockMeta,
    META_FILENAME,
};

/// A read-only view over every block in a directory. Non-block entries (a
/// `wal/` directory, lock files) are skipped.
pub struct Db {
    dir: PathBuf,
    blocks: Vec<Block>,
}

impl Db {
    pub fn open_read_only(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        let mut blocks = Vec::new();
        let entries =
            fs::read_dir(&dir).with_context(|| format!("opening {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if !entry.path().join(META_FILENAME).exists() {
                continue;
            }
            blocks.push(Block::open(entry.path())?);
        }
        blocks.sort_by_key(|b| (b.meta().min_time, b.meta().ulid));
        Ok(Self { dir, blocks })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    pub fn blocks(&self) -> Vec<BlockMeta> {
        self.blocks.iter().map(|b| b.meta().clone()).collect()
    }

    /// The union of the block intervals, or `None` for an empty database.
    pub fn time_bounds(&self) -> Option<(i64, i64)> {
        let mint = self.blocks.iter().map(|b| b.meta().min_time).min()?;
        let maxt = self.blocks.iter().map(|b| b.meta().max_time).max()?;
        Some((mint, maxt))
    }

    /// A merged cursor over every block overlapping `[mint, maxt]`. The
    /// cursor is self-contained; the database handle may be dropped while it
    /// is being drained.
    pub fn querier(&self, mint: i64, maxt: i64) -> anyhow::Result<MergedQuerier> {
        let queriers = self
            .blocks
            .iter()
            .filter(|b| b.meta().overlaps(mint, maxt))
            .map(|b| b.querier(mint, maxt))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(merge_queriers(queriers))
    }
}

pub fn merge_queriers(queriers: Vec<BlockQuerier>) -> MergedQuerier {
    MergedQuerier {
        cursors: queriers.into_iter().map(Iterator::peekable).collect(),
    }
}

/// Chained k-way merge over per-block cursors, each sorted by label set. When
/// several blocks carry the same series their samples are merged in time
/// order; on identical timestamps the first block encountered wins.
pub struct MergedQuerier {
    cursors: Vec<Peekable<BlockQuerier>>,
}

impl Iterator for MergedQuerier {
    type Item = anyhow::Result<Series>;

    fn next(&mut self) -> Option<Self::Item> {
        // Surface read errors eagerly, then pick the smallest label set among
        // the cursor heads.
        let mut min_labels: Option<Labels> = None;
        for cursor in &mut self.cursors {
            if matches!(cursor.peek(), Some(Err(_))) {
                return cursor.next();
            }
            if let Some(Ok(series)) = cursor.peek() {
                if min_labels.as_ref().map_or(true, |min| series.labels < *min) {
                    min_labels = Some(series.labels.clone());
                }
            }
        }
        let min_labels = min_labels?;

        let mut samples: Vec<Sample> = Vec::new();
        for cursor in &mut self.cursors {
            let matches = matches!(cursor.peek(), Some(Ok(s)) if s.labels == min_labels);
            if matches {
                let series = cursor
                    .next()
                    .expect("peeked cursor yields")
                    .expect("peeked Ok cursor yields Ok");
                samples.extend(series.samples);
            }
        }
        // Stable sort: ties keep the earlier block's sample, which is then
        // the survivor of the dedup below.
        samples.sort_by_key(|s| s.timestamp_ms);
        samples.dedup_by_key(|s| s.timestamp_ms);
        Some(Ok(Series::new(min_labels, samples)))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use timeseries::{
        Labels,
        Sample,
    };

    use super::Db;
    use crate::{
        block::write_block,
        meta::BlockCompaction,
    };

    fn series_map(job: &str, samples: Vec<Sample>) -> BTreeMap<Labels, Vec<Sample>> {
        let mut map = BTreeMap::new();
        map.insert(
            Labels::from_pairs([("__name__", "up"), ("job", job)]),
            samples,
        );
        map
    }

    #[test]
    fn test_open_skips_non_block_dirs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("wal"))?;
        write_block(
            dir.path(),
            &series_map("node", vec![Sample::new(1_000, 1.0)]),
            BlockCompaction::default(),
        )?;
        let db = Db::open_read_only(dir.path())?;
        assert_eq!(db.blocks().len(), 1);
        Ok(())
    }

    #[test]
    fn test_time_bounds() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_block(
            dir.path(),
            &series_map("node", vec![Sample::new(1_000, 1.0), Sample::new(5_000, 2.0)]),
            BlockCompaction::default(),
        )?;
        write_block(
            dir.path(),
            &series_map("node", vec![Sample::new(9_000, 3.0)]),
            BlockCompaction::default(),
        )?;
        let db = Db::open_read_only(dir.path())?;
        assert_eq!(db.time_bounds(), Some((1_000, 9_000)));
        Ok(())
    }

    #[test]
    fn test_merged_querier_concatenates_same_series() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_block(
            dir.path(),
            &series_map("node", vec![Sample::new(1_000, 1.0), Sample::new(2_000, 2.0)]),
            BlockCompaction::default(),
        )?;
        write_block(
            dir.path(),
            &series_map("node", vec![Sample::new(3_000, 3.0)]),
            BlockCompaction::default(),
        )?;
        let db = Db::open_read_only(dir.path())?;
        let got: Vec<_> = db.querier(0, i64::MAX)?.collect::<anyhow::Result<_>>()?;
        assert_eq!(got.len(), 1);
        assert_eq!(
            got[0].samples,
            vec![
                Sample::new(1_000, 1.0),
                Sample::new(2_000, 2.0),
                Sample::new(3_000, 3.0)
            ]
        );
        Ok(())
    }

    #[test]
    fn test_duplicate_timestamp_first_wins() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        // Blocks sort by (min_time, ulid); give the first block the earlier
        // start so the ordering is deterministic.
        write_block(
            dir.path(),
            &series_map("node", vec![Sample::new(1_000, 1.0), Sample::new(2_000, 42.0)]),
            BlockCompaction::default(),
        )?;
        write_block(
            dir.path(),
            &series_map("node", vec![Sample::new(2_000, 99.0)]),
            BlockCompaction::default(),
        )?;
        let db = Db::open_read_only(dir.path())?;
        let got: Vec<_> = db.querier(0, i64::MAX)?.collect::<anyhow::Result<_>>()?;
        assert_eq!(
            got[0].samples,
            vec![Sample::new(1_000, 1.0), Sample::new(2_000, 42.0)]
        );
        Ok(())
    }

    #[test]
    fn test_merge_across_disjoint_label_sets() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        write_block(
            dir.path(),
            &series_map("node", vec![Sample::new(1_000, 1.0)]),
            BlockCompaction::default(),
        )?;
        write_block(
            dir.path(),
            &series_map("prom", vec![Sample::new(1_000, 2.0)]),
            BlockCompaction::default(),
        )?;
        let db = Db::open_read_only(dir.path())?;
        let got: Vec<_> = db.querier(0, i64::MAX)?.collect::<anyhow::Result<_>>()?;
        assert_eq!(got.len(), 2);
        assert!(got[0].labels < got[1].labels);
        Ok(())
    }
}
