//! Post-copy compaction: fresh blocks are grouped into target-duration jobs
//! and merged. A single-block job is a rename plus tombstone removal; a
//! multi-block job goes through leveled compaction.

use std::{
    fs,
    io,
    path::{
        Path,
        PathBuf,
    },
    str::FromStr,
};

use anyhow::Context;
use tsdb::{
    meta::try_read_meta,
    BlockMeta,
    LeveledCompactor,
    Ulid,
    META_FILENAME,
    TOMBSTONES_FILENAME,
};

use crate::metrics;

const HOUR_MS: i64 = 3_600_000;

/// Compacts every block directory under `src_dir` into `dst_dir`. The
/// `compact` subcommand's entry point, where source and destination are the
/// same directory.
pub fn compact_directory(
    dst_dir: &Path,
    src_dir: &Path,
    clean: bool,
    block_split_ms: i64,
) -> anyhow::Result<Vec<Ulid>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(src_dir).with_context(|| format!("reading {}", src_dir.display()))? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if !entry.path().join(META_FILENAME).exists() {
            continue;
        }
        dirs.push(entry.path());
    }
    compact_dirs(dst_dir, dirs, clean, block_split_ms)
}

/// Compacts the named blocks of one tenant, as produced by a copy.
pub fn compact_blocks(
    dst_dir: &Path,
    src_dir: &Path,
    ulids: &[Ulid],
    clean: bool,
    block_split_ms: i64,
) -> anyhow::Result<Vec<Ulid>> {
    let dirs = ulids
        .iter()
        .map(|ulid| src_dir.join(ulid.to_string()))
        .collect();
    compact_dirs(dst_dir, dirs, clean, block_split_ms)
}

fn compact_dirs(
    dst_dir: &Path,
    dirs: Vec<PathBuf>,
    clean: bool,
    block_split_ms: i64,
) -> anyhow::Result<Vec<Ulid>> {
    let metas = read_dir_metas(dirs)?;
    let jobs = plan_jobs(metas, block_split_ms);
    let mut ulids = Vec::with_capacity(jobs.len());
    for job in jobs {
        if let Some(ulid) = compact_job(dst_dir, job, clean)? {
            ulids.push(ulid);
        }
    }
    Ok(ulids)
}

/// Reads each directory's meta document, logging and skipping entries whose
/// meta is missing or unreadable, and sorts the rest by start time.
fn read_dir_metas(dirs: Vec<PathBuf>) -> anyhow::Result<Vec<(PathBuf, BlockMeta)>> {
    let mut metas = Vec::with_capacity(dirs.len());
    for dir in dirs {
        match try_read_meta(&dir) {
            Ok(Some(meta)) => metas.push((dir, meta)),
            Ok(None) => {
                tracing::info!("skipping {}: no meta.json", dir.display());
            },
            Err(e) => {
                tracing::info!("skipping {}: {e:#}", dir.display());
            },
        }
    }
    metas.sort_by_key(|(_, meta)| meta.min_time);
    Ok(metas)
}

/// Greedy grouping: blocks accumulate into a job until their hour-quantized
/// spans reach the target split. A zero split puts everything in one job.
fn plan_jobs(metas: Vec<(PathBuf, BlockMeta)>, block_split_ms: i64) -> Vec<Vec<PathBuf>> {
    if block_split_ms == 0 {
        let all: Vec<PathBuf> = metas.into_iter().map(|(dir, _)| dir).collect();
        return if all.is_empty() { Vec::new() } else { vec![all] };
    }
    let mut jobs = Vec::new();
    let mut current = Vec::new();
    let mut span_ms = 0i64;
    for (dir, meta) in metas {
        current.push(dir);
        let width = meta.max_time - meta.min_time;
        span_ms += ((width as f64 / HOUR_MS as f64).round() as i64) * HOUR_MS;
        if span_ms >= block_split_ms {
            jobs.push(std::mem::take(&mut current));
            span_ms = 0;
        }
    }
    if !current.is_empty() {
        jobs.push(current);
    }
    jobs
}

/// Compacts one job into `dst_dir` and returns the resulting block id, if
/// any. The result block's tombstones marker is removed so downstream
/// consumers see no deletions pending.
fn compact_job(dst_dir: &Path, sources: Vec<PathBuf>, clean: bool) -> anyhow::Result<Option<Ulid>> {
    match sources.len() {
        0 => Ok(None),
        1 => {
            let src = &sources[0];
            let name = src
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("bad block directory name {}", src.display()))?;
            let ulid = Ulid::from_str(name)
                .with_context(|| format!("block directory {name} is not a ULID"))?;
            let dst = dst_dir.join(name);
            if *src != dst {
                fs::rename(src, &dst)
                    .with_context(|| format!("moving block into {}", dst.display()))?;
            }
            remove_tombstones(&dst)?;
            Ok(Some(ulid))
        },
        _ => {
            let timer = metrics::compact_timer();
            let compactor = LeveledCompactor::new(vec![0])?;
            let ulid = compactor.compact(dst_dir, &sources)?;
            drop(timer);
            if clean {
                for dir in &sources {
                    fs::remove_dir_all(dir)
                        .with_context(|| format!("removing source block {}", dir.display()))?;
                }
            }
            remove_tombstones(&dst_dir.join(ulid.to_string()))?;
            Ok(Some(ulid))
        },
    }
}

fn remove_tombstones(block_dir: &Path) -> anyhow::Result<()> {
    match fs::remove_file(block_dir.join(TOMBSTONES_FILENAME)) {
        Ok(()) => Ok(()),
        // Already gone on re-runs of the fast path.
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("removing tombstones in {}", block_dir.display()))
        },
    }
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
        Db,
    };

    use super::{
        compact_directory,
        plan_jobs,
        read_dir_metas,
    };

    const HOUR: i64 = 3_600_000;

    fn write_native_block(
        dir: &std::path::Path,
        mint: i64,
        samples_per_series: usize,
    ) -> anyhow::Result<tsdb::BlockMeta> {
        let mut series = BTreeMap::new();
        series.insert(
            Labels::from_pairs([("__name__", "up")]),
            (0..samples_per_series)
                .map(|i| Sample::new(mint + i as i64 * 60_000, i as f64))
                .collect::<Vec<_>>(),
        );
        // Pin the block's span to just under two hours.
        series
            .get_mut(&Labels::from_pairs([("__name__", "up")]))
            .unwrap()
            .push(Sample::new(mint + 2 * HOUR - 1, 0.0));
        write_block(dir, &series, BlockCompaction::default())
    }

    #[test]
    fn test_plan_jobs_groups_by_quantized_span() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut dirs = Vec::new();
        for i in 0..4 {
            let meta = write_native_block(dir.path(), i * 2 * HOUR, 10)?;
            dirs.push(dir.path().join(meta.ulid.to_string()));
        }
        let metas = read_dir_metas(dirs)?;
        // Four 2h blocks against a 4h split: two jobs of two blocks.
        let jobs = plan_jobs(metas, 4 * HOUR);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].len(), 2);
        assert_eq!(jobs[1].len(), 2);
        Ok(())
    }

    #[test]
    fn test_plan_jobs_zero_split_is_one_job() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut dirs = Vec::new();
        for i in 0..3 {
            let meta = write_native_block(dir.path(), i * 2 * HOUR, 5)?;
            dirs.push(dir.path().join(meta.ulid.to_string()));
        }
        let jobs = plan_jobs(read_dir_metas(dirs)?, 0);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].len(), 3);
        Ok(())
    }

    #[test]
    fn test_compact_directory_merges_and_cleans() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        for i in 0..4 {
            write_native_block(dir.path(), i * 2 * HOUR, 10)?;
        }
        let ulids = compact_directory(dir.path(), dir.path(), true, 4 * HOUR)?;
        assert_eq!(ulids.len(), 2);

        let db = Db::open_read_only(dir.path())?;
        let metas = db.blocks();
        assert_eq!(metas.len(), 2);
        for meta in &metas {
            assert_eq!(meta.stats.num_samples, 22);
            assert!(!dir
                .path()
                .join(meta.ulid.to_string())
                .join("tombstones")
                .exists());
        }
        Ok(())
    }

    #[test]
    fn test_single_block_fast_path_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let meta = write_native_block(dir.path(), 0, 10)?;
        // Native-width input against a native-width split: block id survives.
        let first = compact_directory(dir.path(), dir.path(), true, 2 * HOUR)?;
        assert_eq!(first, vec![meta.ulid]);
        assert!(!dir
            .path()
            .join(meta.ulid.to_string())
            .join("tombstones")
            .exists());
        // Re-running is a no-op.
        let second = compact_directory(dir.path(), dir.path(), true, 2 * HOUR)?;
        assert_eq!(second, vec![meta.ulid]);
        Ok(())
    }

    #[test]
    fn test_corrupt_meta_is_skipped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let meta = write_native_block(dir.path(), 0, 10)?;
        let bad = dir.path().join("not-a-block");
        std::fs::create_dir(&bad)?;
        std::fs::write(bad.join("meta.json"), b"{broken")?;
        let ulids = compact_directory(dir.path(), dir.path(), true, 2 * HOUR)?;
        assert_eq!(ulids, vec![meta.ulid]);
        Ok(())
    }
}
