//! The copy orchestrator: plans outer and inner ranges, fans append work out
//! to per-tenant writers through the bounded append pool, finalizes blocks
//! through flush jobs, then feeds the fresh blocks to the compactor and
//! optionally verifies the result.

use std::{
    collections::BTreeMap,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use futures::FutureExt;
use timeseries::{
    range::{
        block_ranges,
        query_ranges,
        validate_splits,
    },
    Labels,
    MatchType,
    Matcher,
};
use tokio::sync::mpsc;
use tsdb::{
    Db,
    Ulid,
    NATIVE_BLOCK_DURATION_MS,
};
use url::Url;

use crate::{
    compactor,
    pool::{
        WaitGroup,
        WorkerPool,
    },
    router::tenant_key,
    source::{
        is_remote,
        open_source,
        Source,
    },
    writer::{
        MultiTenantWriter,
        TenantResult,
        TenantWriter,
    },
};

pub const DEFAULT_COMMIT_COUNT: u64 = 10_240;

/// The immutable configuration of one end-to-end copy.
#[derive(Clone, Debug)]
pub struct CopyOptions {
    /// Block database directory, or an `http(s)://` remote read endpoint.
    pub source: String,
    pub target_dir: PathBuf,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub query_split_ms: i64,
    pub block_split_ms: i64,
    pub commit_count: u64,
    pub write_threads: usize,
    pub matchers: Vec<Matcher>,
    pub append_labels: Labels,
    pub tenant_label: String,
    pub default_tenant: String,
    pub label_api: Option<Url>,
    pub read_timeout: Duration,
    pub thanos_metadata: bool,
    pub manual_gc: bool,
    pub wait_each_block: bool,
    pub verify: bool,
}

impl CopyOptions {
    /// Normalizes splits against the native block duration and rejects
    /// configurations the pipeline cannot honor.
    pub fn validated(mut self) -> anyhow::Result<Self> {
        anyhow::ensure!(
            self.start_time_ms <= self.end_time_ms,
            "start time {} is after end time {}",
            self.start_time_ms,
            self.end_time_ms,
        );
        let (query_split, block_split) = validate_splits(
            self.query_split_ms,
            self.block_split_ms,
            NATIVE_BLOCK_DURATION_MS,
        )?;
        self.query_split_ms = query_split;
        self.block_split_ms = block_split;
        if self.matchers.is_empty() {
            self.matchers = vec![Matcher::match_all()];
        }
        if self.thanos_metadata {
            anyhow::ensure!(
                !self.append_labels.is_empty(),
                "--thanos-metadata requires at least one --label-append",
            );
        }
        if !self.tenant_label.is_empty() && is_remote(&self.source) {
            anyhow::ensure!(
                self.label_api.is_some(),
                "tenant-splitting a remote source requires --label-api",
            );
        }
        if self.write_threads == 0 {
            self.write_threads = num_cpus::get();
        }
        Ok(self)
    }
}

#[derive(Debug)]
pub struct CopySummary {
    pub appended_samples: u64,
    /// Post-compaction block ids per tenant.
    pub tenant_blocks: BTreeMap<String, Vec<Ulid>>,
}

pub async fn run_copy(opt: CopyOptions) -> anyhow::Result<CopySummary> {
    let source = open_source(&opt.source, opt.label_api.clone(), opt.read_timeout)?;
    let (db_mint, db_maxt) = source.time_bounds().await?;
    let mint = opt.start_time_ms.max(db_mint);
    // Source bounds are inclusive sample extremes; the planner's intervals
    // are half-open.
    let maxt = opt.end_time_ms.min(db_maxt.saturating_add(1));
    if mint >= maxt {
        tracing::info!("nothing to copy: effective interval [{mint}, {maxt}) is empty");
        return Ok(CopySummary {
            appended_samples: 0,
            tenant_blocks: BTreeMap::new(),
        });
    }
    tracing::info!(
        "copying [{mint}, {maxt}) from {} to {}",
        opt.source,
        opt.target_dir.display(),
    );

    let append_pool = WorkerPool::new("append", opt.write_threads);
    let flush_wg = WaitGroup::new();
    let failed = Arc::new(AtomicBool::new(false));
    let (results_tx, results_rx) = mpsc::channel(opt.write_threads.max(1));
    let collector = tokio::spawn(collect_results(results_rx, failed.clone()));

    for (bmint, bmaxt) in block_ranges(mint, maxt, opt.block_split_ms, NATIVE_BLOCK_DURATION_MS) {
        // Stop planning new work after the first error; in-flight work is
        // still drained below. copy_block's own setup failures (tenant
        // enumeration, writer creation) go through the result channel like
        // job failures, so already-submitted ranges still flush.
        if failed.load(Ordering::SeqCst) {
            break;
        }
        if let Err(e) = copy_block(
            source.clone(),
            &opt,
            &append_pool,
            &flush_wg,
            &results_tx,
            &failed,
            bmint,
            bmaxt,
        )
        .await
        {
            failed.store(true, Ordering::SeqCst);
            let _ = results_tx.send(Err(e)).await;
            break;
        }
        if opt.wait_each_block {
            flush_wg.wait().await;
        }
    }

    flush_wg.wait().await;
    append_pool.close();
    drop(results_tx);
    let (results, first_error) = collector.await.context("result collector")?;
    if let Some(e) = first_error {
        return Err(e);
    }

    let appended_samples: u64 = results.iter().map(|r| r.samples).sum();
    let mut fresh: BTreeMap<String, Vec<Ulid>> = BTreeMap::new();
    for result in results {
        fresh.entry(result.tenant).or_default().push(result.ulid);
    }

    // A zero split disables compaction; a native-width split leaves every
    // fresh block already at target duration.
    let tenant_blocks = if opt.block_split_ms == 0 || opt.block_split_ms == NATIVE_BLOCK_DURATION_MS
    {
        fresh
    } else {
        compact_tenants(
            &opt.target_dir,
            fresh,
            opt.block_split_ms,
            opt.write_threads,
        )
        .await?
    };

    if opt.verify {
        verify_target(&opt.target_dir, &tenant_blocks, appended_samples)?;
    }

    tracing::info!(
        "copied {appended_samples} samples into {} tenants",
        tenant_blocks.len(),
    );
    Ok(CopySummary {
        appended_samples,
        tenant_blocks,
    })
}

async fn collect_results(
    mut results_rx: mpsc::Receiver<anyhow::Result<TenantResult>>,
    failed: Arc<AtomicBool>,
) -> (Vec<TenantResult>, Option<anyhow::Error>) {
    let mut results = Vec::new();
    let mut first_error = None;
    while let Some(item) = results_rx.recv().await {
        match item {
            Ok(result) => {
                tracing::info!(
                    "tenant {:?} block {} [{}, {}) holds {} samples",
                    result.tenant,
                    result.ulid,
                    result.mint,
                    result.maxt,
                    result.samples,
                );
                results.push(result);
            },
            Err(e) => {
                failed.store(true, Ordering::SeqCst);
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    tracing::error!("further copy error: {e:#}");
                }
            },
        }
    }
    (results, first_error)
}

/// Copies one outer range: enqueues an append job per inner range (per tenant
/// for remote sources), then submits a flush job per active writer.
async fn copy_block(
    source: Arc<dyn Source>,
    opt: &CopyOptions,
    pool: &WorkerPool,
    flush_wg: &WaitGroup,
    results_tx: &mpsc::Sender<anyhow::Result<TenantResult>>,
    failed: &Arc<AtomicBool>,
    bmint: i64,
    bmaxt: i64,
) -> anyhow::Result<()> {
    tracing::debug!("outer range [{bmint}, {bmaxt})");
    // When labels go into Thanos metadata they stay off the series.
    let series_labels = if opt.thanos_metadata {
        Labels::default()
    } else {
        opt.append_labels.clone()
    };
    // Builders are sized to the block they produce: one outer range.
    let block_duration = if opt.block_split_ms == 0 {
        NATIVE_BLOCK_DURATION_MS
    } else {
        opt.block_split_ms
    };
    let registry = Arc::new(MultiTenantWriter::new(
        opt.target_dir.clone(),
        block_duration,
        series_labels,
        opt.commit_count,
        opt.manual_gc,
    ));

    if opt.tenant_label.is_empty() {
        let writer = registry.get("")?;
        for (qmint, qmaxt) in query_ranges(bmint, bmaxt, opt.query_split_ms) {
            enqueue_query_job(&writer, source.clone(), qmint, qmaxt, opt.matchers.clone());
            submit_write_job(pool, &writer, results_tx, failed).await?;
        }
    } else if is_remote(&opt.source) {
        // Tenants are enumerated up front, then each inner range issues one
        // filtered query per tenant plus one for series missing the label.
        let tenants = source
            .label_values(&opt.tenant_label, bmint, bmaxt - 1, &opt.matchers)
            .await?;
        tracing::info!(
            "outer range [{bmint}, {bmaxt}) splits into {} tenants",
            tenants.len(),
        );
        for (qmint, qmaxt) in query_ranges(bmint, bmaxt, opt.query_split_ms) {
            for tenant in &tenants {
                let writer = registry.get(tenant)?;
                let mut matchers = opt.matchers.clone();
                matchers.push(Matcher::new(
                    MatchType::Equal,
                    opt.tenant_label.clone(),
                    tenant.clone(),
                )?);
                enqueue_query_job(&writer, source.clone(), qmint, qmaxt, matchers);
                submit_write_job(pool, &writer, results_tx, failed).await?;
            }
            let writer = registry.get(&opt.default_tenant)?;
            let mut matchers = opt.matchers.clone();
            matchers.push(Matcher::new(MatchType::Equal, opt.tenant_label.clone(), "")?);
            enqueue_query_job(&writer, source.clone(), qmint, qmaxt, matchers);
            submit_write_job(pool, &writer, results_tx, failed).await?;
        }
    } else {
        // Local multi-tenant: one scan per inner range, each series routed to
        // its tenant's writer. Writers appear as the scan discovers tenants,
        // so flushes wait for the scans to drain.
        let scan_wg = WaitGroup::new();
        for (qmint, qmaxt) in query_ranges(bmint, bmaxt, opt.query_split_ms) {
            scan_wg.add(1);
            let source = source.clone();
            let registry = registry.clone();
            let tenant_label = opt.tenant_label.clone();
            let default_tenant = opt.default_tenant.clone();
            let matchers = opt.matchers.clone();
            let results = results_tx.clone();
            let failed = failed.clone();
            let scan_wg_task = scan_wg.clone();
            pool.submit(async move {
                let result = routed_scan(
                    source,
                    registry,
                    tenant_label,
                    default_tenant,
                    matchers,
                    qmint,
                    qmaxt,
                )
                .await;
                if let Err(e) = result {
                    failed.store(true, Ordering::SeqCst);
                    let _ = results.send(Err(e)).await;
                }
                scan_wg_task.done();
            })
            .await?;
        }
        scan_wg.wait().await;
    }

    for (tenant, writer) in registry.writers() {
        flush_wg.add(1);
        let flush_wg = flush_wg.clone();
        let results = results_tx.clone();
        tokio::spawn(async move {
            writer.flush_job(bmint, bmaxt, tenant, results).await;
            flush_wg.done();
        });
    }
    Ok(())
}

/// Queues a "open querier for this window" closure on the writer. The wire
/// interval is inclusive, so the window's exclusive end backs off by one
/// millisecond and boundary samples are read exactly once.
fn enqueue_query_job(
    writer: &TenantWriter,
    source: Arc<dyn Source>,
    qmint: i64,
    qmaxt: i64,
    matchers: Vec<Matcher>,
) {
    writer.append_fn(Box::new(move || {
        async move { source.querier(qmint, qmaxt - 1, &matchers).await }.boxed()
    }));
}

async fn submit_write_job(
    pool: &WorkerPool,
    writer: &TenantWriter,
    results_tx: &mpsc::Sender<anyhow::Result<TenantResult>>,
    failed: &Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let writer = writer.clone();
    let results = results_tx.clone();
    let failed = failed.clone();
    pool.submit(async move {
        if let Err(e) = writer.write_job().await {
            failed.store(true, Ordering::SeqCst);
            let _ = results.send(Err(e)).await;
        }
    })
    .await
}

async fn routed_scan(
    source: Arc<dyn Source>,
    registry: Arc<MultiTenantWriter>,
    tenant_label: String,
    default_tenant: String,
    matchers: Vec<Matcher>,
    qmint: i64,
    qmaxt: i64,
) -> anyhow::Result<()> {
    let cursor = source.querier(qmint, qmaxt - 1, &matchers).await?;
    for series in cursor {
        let series = series?;
        let tenant = tenant_key(&series.labels, &tenant_label, &default_tenant).to_owned();
        let writer = registry.get(&tenant)?;
        writer.append_routed(series)?;
    }
    Ok(())
}

async fn compact_tenants(
    target_dir: &Path,
    fresh: BTreeMap<String, Vec<Ulid>>,
    block_split_ms: i64,
    threads: usize,
) -> anyhow::Result<BTreeMap<String, Vec<Ulid>>> {
    let pool = WorkerPool::new("compact", threads.max(1));
    let (tx, mut rx) = mpsc::channel(fresh.len().max(1));
    for (tenant, ulids) in fresh {
        let dir = tenant_dir(target_dir, &tenant);
        let tx = tx.clone();
        pool.submit(async move {
            let result = tokio::task::spawn_blocking(move || {
                compactor::compact_blocks(&dir, &dir, &ulids, true, block_split_ms)
            })
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r);
            let _ = tx.send((tenant, result)).await;
        })
        .await?;
    }
    drop(tx);

    // Drain every tenant's outcome before failing: a compaction error is
    // fatal to its tenant only, and the other tenants' finished work stays
    // accounted for.
    let mut tenant_blocks = BTreeMap::new();
    let mut first_error = None;
    while let Some((tenant, result)) = rx.recv().await {
        match result {
            Ok(ulids) => {
                tenant_blocks.insert(tenant, ulids);
            },
            Err(e) => {
                let e = e.context(format!("compacting tenant {tenant:?}"));
                if first_error.is_none() {
                    first_error = Some(e);
                } else {
                    tracing::error!("further compaction error: {e:#}");
                }
            },
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }
    Ok(tenant_blocks)
}

/// Reopens the target and checks that the expected blocks hold exactly the
/// appended sample count. The target is left in place either way.
pub fn verify_target(
    target_dir: &Path,
    tenant_blocks: &BTreeMap<String, Vec<Ulid>>,
    appended_samples: u64,
) -> anyhow::Result<()> {
    let mut found = 0u64;
    for (tenant, ulids) in tenant_blocks {
        let db = Db::open_read_only(tenant_dir(target_dir, tenant))?;
        for meta in db.blocks() {
            if !ulids.contains(&meta.ulid) {
                continue;
            }
            tracing::info!(
                "tenant {:?} block {} verified with {} samples in {} series",
                tenant,
                meta.ulid,
                meta.stats.num_samples,
                meta.stats.num_series,
            );
            found += meta.stats.num_samples;
        }
    }
    anyhow::ensure!(
        found == appended_samples,
        "verification mismatch: target holds {found} samples, copy appended {appended_samples}",
    );
    tracing::info!("verification passed: {found} samples");
    Ok(())
}

fn tenant_dir(target_dir: &Path, tenant: &str) -> PathBuf {
    if tenant.is_empty() {
        target_dir.to_path_buf()
    } else {
        target_dir.join(tenant)
    }
}
