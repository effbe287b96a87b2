use std::env;

use clap::Parser;
use cmd_util::env::config_service;
use copier::{
    compactor,
    pool::WorkerPool,
    thanos::append_thanos_metadata,
};
use timeseries::validate_block_split;
use tokio::sync::mpsc;
use tsdb::NATIVE_BLOCK_DURATION_MS;

mod args;

use args::{
    Cli,
    Command,
    CompactArgs,
};

/// Returned from `main` so failures exit non-zero with the error's `Display`
/// rather than its `Debug` noise.
struct MainError(anyhow::Error);

impl<T: Into<anyhow::Error>> From<T> for MainError {
    fn from(e: T) -> Self {
        Self(e.into())
    }
}

impl std::fmt::Debug for MainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

fn main() -> Result<(), MainError> {
    let _guard = config_service();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    match cli.command {
        Command::Copy(args) => {
            let opt = args.into_options()?;
            // Blocks are staged under the OS temp directory before the final
            // rename; keep that on the target's filesystem.
            env::set_var("TMPDIR", &opt.target_dir);
            let append_labels = opt.append_labels.clone();
            let thanos = opt.thanos_metadata;
            let target_dir = opt.target_dir.clone();
            let summary = runtime.block_on(copier::run_copy(opt))?;
            if thanos {
                append_thanos_metadata(&target_dir, &append_labels)?;
            }
            tracing::info!(
                "done: {} samples across {} tenants",
                summary.appended_samples,
                summary.tenant_blocks.len(),
            );
        },
        Command::Compact(args) => {
            runtime.block_on(run_compact(args))?;
        },
    }
    Ok(())
}

async fn run_compact(args: CompactArgs) -> anyhow::Result<()> {
    let block_split = validate_block_split(args.block_split, NATIVE_BLOCK_DURATION_MS)?;
    if args.multi_thread < 0 {
        for dir in &args.dirs {
            let ulids = compactor::compact_directory(dir, dir, true, block_split)?;
            tracing::info!("compacted {} into {} blocks", dir.display(), ulids.len());
        }
        return Ok(());
    }

    let threads = if args.multi_thread == 0 {
        num_cpus::get()
    } else {
        args.multi_thread as usize
    };
    let pool = WorkerPool::new("compact", threads);
    let (tx, mut rx) = mpsc::channel(args.dirs.len());
    for dir in args.dirs {
        let tx = tx.clone();
        pool.submit(async move {
            let result = tokio::task::spawn_blocking(move || {
                let ulids = compactor::compact_directory(&dir, &dir, true, block_split)?;
                Ok::<_, anyhow::Error>((dir, ulids))
            })
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);
            let _ = tx.send(result).await;
        })
        .await?;
    }
    drop(tx);
    while let Some(result) = rx.recv().await {
        let (dir, ulids) = result?;
        tracing::info!("compacted {} into {} blocks", dir.display(), ulids.len());
    }
    Ok(())
}
