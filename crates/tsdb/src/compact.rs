use std::{
    collections::BTreeMap,
    path::{
        Path,
        PathBuf,
    },
};

use timeseries::{
    Labels,
    Sample,
};
use ulid::Ulid;

use crate::{
    block::{
        write_block,
        Block,
    },
    db::merge_queriers,
    meta::BlockCompaction,
};

/// Merges N source blocks into one output block within a range schedule. A
/// schedule of `[0]` places no bound on the merged span (single-level
/// compaction); otherwise the last entry caps how wide an output block may
/// grow.
pub struct LeveledCompactor {
    ranges: Vec<i64>,
}

impl LeveledCompactor {
    pub fn new(ranges: Vec<i64>) -> anyhow::Result<Self> {
        anyhow::ensure!(!ranges.is_empty(), "compactor needs at least one range");
        Ok(Self { ranges })
    }

    /// Merges `sources` into a single block under `dest` and returns its id.
    /// Sources are left in place; removal is the caller's decision.
    pub fn compact(&self, dest: &Path, sources: &[PathBuf]) -> anyhow::Result<Ulid> {
        anyhow::ensure!(!sources.is_empty(), "no source blocks to compact");
        let blocks = sources
            .iter()
            .map(Block::open)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mint = blocks.iter().map(|b| b.meta().min_time).min().expect("nonempty");
        let maxt = blocks.iter().map(|b| b.meta().max_time).max().expect("nonempty");
        let max_range = *self.ranges.last().expect("nonempty ranges");
        if max_range > 0 {
            anyhow::ensure!(
                maxt - mint < max_range,
                "merged block would span {}ms, over the {max_range}ms schedule",
                maxt - mint,
            );
        }

        let level = blocks
            .iter()
            .map(|b| b.meta().compaction.level)
            .max()
            .expect("nonempty")
            + 1;
        let mut parents: Vec<Ulid> = blocks
            .iter()
            .flat_map(|b| {
                let compaction = &b.meta().compaction;
                if compaction.sources.is_empty() {
                    vec![b.meta().ulid]
                } else {
                    compaction.sources.clone()
                }
            })
            .collect();
        parents.sort();
        parents.dedup();

        let queriers = blocks
            .iter()
            .map(|b| b.querier(mint, maxt))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut series: BTreeMap<Labels, Vec<Sample>> = BTreeMap::new();
        for merged in merge_queriers(queriers) {
            let merged = merged?;
            series.insert(merged.labels, merged.samples);
        }

        let meta = write_block(
            dest,
            &series,
            BlockCompaction {
                level,
                sources: parents,
            },
        )?;
        tracing::debug!(
            "compacted {} blocks into {} ({} samples)",
            sources.len(),
            meta.ulid,
            meta.stats.num_samples,
        );
        Ok(meta.ulid)
    }
}
