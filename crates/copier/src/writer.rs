//! Per-tenant block building. Each tenant writer owns one block builder per
//! outer range, fed either by queued cursor jobs (single-tenant and remote
//! modes) or by routed per-series appends (the local multi-tenant scan), and
//! is finalized exactly once by a flush job.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use timeseries::{
    Labels,
    Series,
};
use tokio::sync::mpsc;
use tsdb::{
    BlockWriter,
    Ulid,
};

use crate::{
    metrics,
    pool::WaitGroup,
    source::SeriesCursor,
};

/// A queued append job: opens its cursor when the writer gets to it.
pub type CursorFactory =
    Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<SeriesCursor>> + Send>;

/// Emitted once per (outer range, tenant) that committed at least one sample.
#[derive(Clone, Debug)]
pub struct TenantResult {
    pub mint: i64,
    pub maxt: i64,
    pub tenant: String,
    pub ulid: Ulid,
    pub samples: u64,
}

#[derive(Clone)]
pub struct TenantWriter {
    inner: Arc<TenantWriterInner>,
}

struct TenantWriterInner {
    builder: BlockWriter,
    queue: Mutex<std::collections::VecDeque<CursorFactory>>,
    pending: WaitGroup,
    // Held by at most one write job at a time.
    writing: tokio::sync::Mutex<()>,
    direct: Mutex<DirectState>,
    committed: AtomicU64,
    failed: AtomicBool,
    append_labels: Labels,
    commit_count: u64,
    manual_gc: bool,
}

#[derive(Default)]
struct DirectState {
    buffered: Vec<Series>,
    buffered_samples: u64,
}

impl TenantWriter {
    pub fn new(
        dir: PathBuf,
        block_duration_ms: i64,
        append_labels: Labels,
        commit_count: u64,
        manual_gc: bool,
    ) -> anyhow::Result<Self> {
        let builder = BlockWriter::new(dir, block_duration_ms)?;
        Ok(Self {
            inner: Arc::new(TenantWriterInner {
                builder,
                queue: Mutex::new(std::collections::VecDeque::new()),
                pending: WaitGroup::new(),
                writing: tokio::sync::Mutex::new(()),
                direct: Mutex::new(DirectState::default()),
                committed: AtomicU64::new(0),
                failed: AtomicBool::new(false),
                append_labels,
                commit_count,
                manual_gc,
            }),
        })
    }

    pub fn committed_samples(&self) -> u64 {
        self.inner.committed.load(Ordering::SeqCst)
    }

    /// Enqueues an append job. Non-blocking; the job runs when a write job
    /// drains the queue.
    pub fn append_fn(&self, factory: CursorFactory) {
        self.inner.pending.add(1);
        self.inner.queue.lock().push_back(factory);
    }

    /// Drains the job queue, at most one drainer appending at a time. On the
    /// first failed job the writer is marked failed and the rest of the queue
    /// is discarded so the flush handoff never hangs.
    pub async fn write_job(&self) -> anyhow::Result<()> {
        let _guard = self.inner.writing.lock().await;
        loop {
            let job = self.inner.queue.lock().pop_front();
            let Some(job) = job else {
                return Ok(());
            };
            let result = self.run_job(job).await;
            self.inner.pending.done();
            if let Err(e) = result {
                self.inner.failed.store(true, Ordering::SeqCst);
                let mut queue = self.inner.queue.lock();
                while queue.pop_front().is_some() {
                    self.inner.pending.done();
                }
                return Err(e);
            }
        }
    }

    async fn run_job(&self, job: CursorFactory) -> anyhow::Result<()> {
        let cursor = job().await?;
        let mut appender = self.inner.builder.appender();
        let mut batch = 0u64;
        for series in cursor {
            let mut series = series?;
            self.decorate(&mut series);
            let timer = metrics::series_copy_timer();
            let mut ref_id = 0;
            for sample in &series.samples {
                ref_id =
                    appender.append(ref_id, &series.labels, sample.timestamp_ms, sample.value)?;
            }
            drop(timer);
            batch += series.samples.len() as u64;
            // Commit on series boundaries once the batch is large enough,
            // bounding the uncommitted set without committing per series.
            if batch >= self.inner.commit_count {
                appender.commit()?;
                self.inner.committed.fetch_add(batch, Ordering::SeqCst);
                batch = 0;
                appender = self.inner.builder.appender();
            }
        }
        appender.commit()?;
        self.inner.committed.fetch_add(batch, Ordering::SeqCst);
        if self.inner.manual_gc {
            self.inner.builder.release_retired_capacity();
        }
        Ok(())
    }

    /// Routed ingestion for the local multi-tenant scan: series land here one
    /// at a time, batched up to `commit_count` samples before committing.
    pub fn append_routed(&self, mut series: Series) -> anyhow::Result<()> {
        self.decorate(&mut series);
        let mut direct = self.inner.direct.lock();
        direct.buffered_samples += series.samples.len() as u64;
        direct.buffered.push(series);
        if direct.buffered_samples >= self.inner.commit_count {
            self.commit_direct(&mut direct).inspect_err(|_| {
                self.inner.failed.store(true, Ordering::SeqCst);
            })?;
        }
        Ok(())
    }

    fn commit_direct(&self, direct: &mut DirectState) -> anyhow::Result<()> {
        let mut appender = self.inner.builder.appender();
        for series in &direct.buffered {
            let mut ref_id = 0;
            for sample in &series.samples {
                ref_id =
                    appender.append(ref_id, &series.labels, sample.timestamp_ms, sample.value)?;
            }
        }
        appender.commit()?;
        self.inner
            .committed
            .fetch_add(direct.buffered_samples, Ordering::SeqCst);
        direct.buffered = Vec::new();
        direct.buffered_samples = 0;
        Ok(())
    }

    fn decorate(&self, series: &mut Series) {
        if !self.inner.append_labels.is_empty() {
            series.labels.extend(&self.inner.append_labels);
        }
    }

    /// Waits for every append job, finalizes the block when at least one
    /// sample committed, and closes the builder regardless. A failed writer
    /// is closed without emitting a result; its partial block is not
    /// compacted.
    pub async fn flush_job(
        &self,
        mint: i64,
        maxt: i64,
        tenant: String,
        results: mpsc::Sender<anyhow::Result<TenantResult>>,
    ) {
        self.inner.pending.wait().await;

        let tail = {
            let mut direct = self.inner.direct.lock();
            if direct.buffered.is_empty() {
                Ok(())
            } else {
                self.commit_direct(&mut direct)
            }
        };
        if let Err(e) = tail {
            self.inner.failed.store(true, Ordering::SeqCst);
            let _ = results
                .send(Err(e.context(format!("committing tail for tenant {tenant:?}"))))
                .await;
        }

        let committed = self.inner.committed.load(Ordering::SeqCst);
        if !self.inner.failed.load(Ordering::SeqCst) && committed > 0 {
            let timer = metrics::db_flush_timer();
            match self.inner.builder.flush() {
                Ok(ulid) => {
                    drop(timer);
                    metrics::log_samples_copied(committed);
                    let _ = results
                        .send(Ok(TenantResult {
                            mint,
                            maxt,
                            tenant,
                            ulid,
                            samples: committed,
                        }))
                        .await;
                },
                Err(e) => {
                    let _ = results
                        .send(Err(e.context(format!("flushing block for tenant {tenant:?}"))))
                        .await;
                },
            }
        }
        self.inner.builder.close();
    }
}

/// Lazily creates one tenant writer per tenant key for a single outer range.
pub struct MultiTenantWriter {
    writers: Mutex<HashMap<String, TenantWriter>>,
    count: AtomicUsize,
    new_fn: Box<dyn Fn(&str) -> anyhow::Result<TenantWriter> + Send + Sync>,
}

impl MultiTenantWriter {
    pub fn new(
        target_dir: PathBuf,
        block_duration_ms: i64,
        append_labels: Labels,
        commit_count: u64,
        manual_gc: bool,
    ) -> Self {
        Self {
            writers: Mutex::new(HashMap::new()),
            count: AtomicUsize::new(0),
            new_fn: Box::new(move |tenant| {
                let dir = if tenant.is_empty() {
                    target_dir.clone()
                } else {
                    target_dir.join(tenant)
                };
                TenantWriter::new(
                    dir,
                    block_duration_ms,
                    append_labels.clone(),
                    commit_count,
                    manual_gc,
                )
            }),
        }
    }

    pub fn get(&self, tenant: &str) -> anyhow::Result<TenantWriter> {
        let mut writers = self.writers.lock();
        if let Some(writer) = writers.get(tenant) {
            return Ok(writer.clone());
        }
        let writer = (self.new_fn)(tenant)?;
        self.count.fetch_add(1, Ordering::SeqCst);
        writers.insert(tenant.to_owned(), writer.clone());
        Ok(writer)
    }

    /// Snapshot of the active writers, for flush submission.
    pub fn writers(&self) -> Vec<(String, TenantWriter)> {
        self.writers
            .lock()
            .iter()
            .map(|(tenant, writer)| (tenant.clone(), writer.clone()))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}
