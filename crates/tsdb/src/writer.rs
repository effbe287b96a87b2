use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
};

use anyhow::Context;
use parking_lot::Mutex;
use timeseries::{
    Labels,
    Sample,
};
use ulid::Ulid;

use crate::{
    block::write_block,
    meta::BlockCompaction,
};

/// Accumulates committed series in memory and lays them down as one block on
/// `flush`. One writer produces at most one block; after `flush` or `close`
/// the writer accepts no further transactions.
pub struct BlockWriter {
    dir: PathBuf,
    block_duration_ms: i64,
    state: Mutex<WriterState>,
}

struct WriterState {
    series: BTreeMap<Labels, Vec<Sample>>,
    closed: bool,
}

impl BlockWriter {
    pub fn new(dir: impl Into<PathBuf>, block_duration_ms: i64) -> anyhow::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self {
            dir,
            block_duration_ms,
            state: Mutex::new(WriterState {
                series: BTreeMap::new(),
                closed: false,
            }),
        })
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// Opens a new append transaction. Transactions are independent; nothing
    /// is visible to `flush` until `commit`.
    pub fn appender(&self) -> Appender<'_> {
        Appender {
            writer: self,
            series: Vec::new(),
            by_labels: BTreeMap::new(),
        }
    }

    /// Writes the committed series out as a block and returns its id. The
    /// writer is closed afterwards.
    pub fn flush(&self) -> anyhow::Result<Ulid> {
        let mut state = self.state.lock();
        anyhow::ensure!(!state.closed, "flush on a closed block writer");
        state.closed = true;
        let series = std::mem::take(&mut state.series);
        drop(state);
        let meta = write_block(&self.dir, &series, BlockCompaction::default())?;
        if meta.max_time - meta.min_time >= self.block_duration_ms {
            tracing::warn!(
                "block {} spans {}ms, wider than the configured {}ms",
                meta.ulid,
                meta.max_time - meta.min_time,
                self.block_duration_ms,
            );
        }
        Ok(meta.ulid)
    }

    /// Drops any committed-but-unflushed state. Idempotent, and valid after
    /// `flush`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.series.clear();
    }

    /// Gives retired capacity back to the allocator. A memory/throughput
    /// trade for hosts where the copy's high-water mark matters more than
    /// wall clock.
    pub fn release_retired_capacity(&self) {
        let mut state = self.state.lock();
        for samples in state.series.values_mut() {
            samples.shrink_to_fit();
        }
    }

    fn commit_series(&self, series: Vec<(Labels, Vec<Sample>)>) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        anyhow::ensure!(!state.closed, "commit on a closed block writer");
        for (labels, samples) in series {
            let committed = state.series.entry(labels).or_default();
            let in_order = match (committed.last(), samples.first()) {
                (Some(last), Some(first)) => first.timestamp_ms >= last.timestamp_ms,
                _ => true,
            };
            if in_order {
                committed.extend(samples);
            } else {
                // Transactions for different query windows may commit in any
                // order; merge the two sorted runs, earlier commit winning on
                // timestamp ties.
                *committed = merge_sorted(std::mem::take(committed), samples);
            }
        }
        Ok(())
    }
}

fn merge_sorted(existing: Vec<Sample>, incoming: Vec<Sample>) -> Vec<Sample> {
    let mut merged = Vec::with_capacity(existing.len() + incoming.len());
    let mut incoming = incoming.into_iter().peekable();
    for sample in existing {
        while incoming
            .peek()
            .is_some_and(|s| s.timestamp_ms < sample.timestamp_ms)
        {
            merged.push(incoming.next().expect("peeked"));
        }
        merged.push(sample);
    }
    merged.extend(incoming);
    merged
}

/// An append transaction. `append` hands back a series reference that may be
/// passed to subsequent appends of the same series to skip the label lookup;
/// a zero reference always resolves by labels.
pub struct Appender<'a> {
    writer: &'a BlockWriter,
    series: Vec<(Labels, Vec<Sample>)>,
    by_labels: BTreeMap<Labels, usize>,
}

impl Appender<'_> {
    pub fn append(
        &mut self,
        ref_id: u64,
        labels: &Labels,
        timestamp_ms: i64,
        value: f64,
    ) -> anyhow::Result<u64> {
        let idx = if ref_id != 0 && ref_id as usize <= self.series.len() {
            ref_id as usize - 1
        } else {
            match self.by_labels.get(labels) {
                Some(&idx) => idx,
                None => {
                    self.series.push((labels.clone(), Vec::new()));
                    let idx = self.series.len() - 1;
                    self.by_labels.insert(labels.clone(), idx);
                    idx
                },
            }
        };
        let samples = &mut self.series[idx].1;
        if let Some(last) = samples.last() {
            anyhow::ensure!(
                timestamp_ms >= last.timestamp_ms,
                "out of order sample for {labels}: {timestamp_ms} after {}",
                last.timestamp_ms,
            );
        }
        samples.push(Sample::new(timestamp_ms, value));
        Ok(idx as u64 + 1)
    }

    pub fn commit(self) -> anyhow::Result<()> {
        let series = self
            .series
            .into_iter()
            .filter(|(_, samples)| !samples.is_empty())
            .collect();
        self.writer.commit_series(series)
    }
}

#[cfg(test)]
mod tests {
    use timeseries::Labels;

    use super::BlockWriter;
    use crate::{
        block::Block,
        NATIVE_BLOCK_DURATION_MS,
    };

    #[test]
    fn test_append_commit_flush() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = BlockWriter::new(dir.path(), NATIVE_BLOCK_DURATION_MS)?;
        let labels = Labels::from_pairs([("__name__", "up")]);

        let mut appender = writer.appender();
        let mut ref_id = 0;
        for i in 0..3 {
            ref_id = appender.append(ref_id, &labels, i * 1_000, i as f64)?;
        }
        appender.commit()?;

        let ulid = writer.flush()?;
        let block = Block::open(dir.path().join(ulid.to_string()))?;
        assert_eq!(block.meta().stats.num_samples, 3);
        assert_eq!(block.meta().stats.num_series, 1);
        assert_eq!(block.meta().min_time, 0);
        assert_eq!(block.meta().max_time, 2_000);
        Ok(())
    }

    #[test]
    fn test_uncommitted_appends_are_invisible() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = BlockWriter::new(dir.path(), NATIVE_BLOCK_DURATION_MS)?;
        let labels = Labels::from_pairs([("__name__", "up")]);

        let mut committed = writer.appender();
        committed.append(0, &labels, 1_000, 1.0)?;
        committed.commit()?;

        let mut abandoned = writer.appender();
        abandoned.append(0, &labels, 2_000, 2.0)?;
        drop(abandoned);

        let ulid = writer.flush()?;
        let block = Block::open(dir.path().join(ulid.to_string()))?;
        assert_eq!(block.meta().stats.num_samples, 1);
        Ok(())
    }

    #[test]
    fn test_out_of_order_append_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = BlockWriter::new(dir.path(), NATIVE_BLOCK_DURATION_MS)?;
        let labels = Labels::from_pairs([("__name__", "up")]);
        let mut appender = writer.appender();
        appender.append(0, &labels, 2_000, 1.0)?;
        assert!(appender.append(0, &labels, 1_000, 1.0).is_err());
        Ok(())
    }

    #[test]
    fn test_commits_merge_out_of_order_windows() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = BlockWriter::new(dir.path(), NATIVE_BLOCK_DURATION_MS)?;
        let labels = Labels::from_pairs([("__name__", "up")]);

        // The later window commits first.
        let mut late = writer.appender();
        late.append(0, &labels, 10_000, 2.0)?;
        late.commit()?;
        let mut early = writer.appender();
        early.append(0, &labels, 1_000, 1.0)?;
        early.commit()?;

        let ulid = writer.flush()?;
        let block = Block::open(dir.path().join(ulid.to_string()))?;
        let series: Vec<_> = block.querier(0, i64::MAX)?.collect::<anyhow::Result<_>>()?;
        let timestamps: Vec<i64> = series[0].samples.iter().map(|s| s.timestamp_ms).collect();
        assert_eq!(timestamps, vec![1_000, 10_000]);
        Ok(())
    }

    #[test]
    fn test_flush_closes_writer() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = BlockWriter::new(dir.path(), NATIVE_BLOCK_DURATION_MS)?;
        let labels = Labels::from_pairs([("__name__", "up")]);
        let mut appender = writer.appender();
        appender.append(0, &labels, 1_000, 1.0)?;
        appender.commit()?;
        writer.flush()?;

        let mut late = writer.appender();
        late.append(0, &labels, 2_000, 2.0)?;
        assert!(late.commit().is_err());
        Ok(())
    }

    #[test]
    fn test_empty_flush_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = BlockWriter::new(dir.path(), NATIVE_BLOCK_DURATION_MS)?;
        assert!(writer.flush().is_err());
        Ok(())
    }
}
