//! Bounded task execution for the append and compaction stages, plus the
//! wait-group primitive that hands tenant writers between the append and
//! flush fleets.

use std::sync::{
    atomic::{
        AtomicUsize,
        Ordering,
    },
    Arc,
};

use futures::{
    channel::{
        mpsc,
        oneshot,
    },
    future::{
        self,
        BoxFuture,
    },
    select_biased,
    stream::FuturesUnordered,
    Future,
    FutureExt,
    SinkExt,
    StreamExt,
};
use tokio::sync::Notify;

struct Config {
    name: &'static str,
    max_workers: usize,
}

/// A bounded worker pool over tokio tasks. Workers are spawned lazily up to
/// the limit and reused most-recently-idle first. Submission awaits queue
/// space, so a saturated pool backpressures the submitter.
pub struct WorkerPool {
    sender: async_channel::Sender<Request>,
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl WorkerPool {
    pub fn new(name: &'static str, max_workers: usize) -> Self {
        assert!(max_workers > 0, "pool needs at least one worker");
        let (sender, receiver) = async_channel::bounded::<Request>(max_workers);
        let config = Config { name, max_workers };
        tokio::spawn(async move {
            let scheduler = Scheduler {
                worker_senders: Vec::new(),
                available_workers: Vec::new(),
                config,
            };
            scheduler.dispatch(receiver).await
        });
        Self { sender }
    }

    /// Queues a job, waiting for queue space when the pool is saturated.
    pub async fn submit<Fut>(&self, fut: Fut) -> anyhow::Result<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let request = Request { job: fut.boxed() };
        self.sender
            .send(request)
            .await
            .map_err(|_| anyhow::anyhow!("worker pool shut down"))?;
        Ok(())
    }

    /// Stops accepting new jobs. Queued and in-flight jobs still run.
    pub fn close(&self) {
        self.sender.close();
    }
}

struct Request {
    job: BoxFuture<'static, ()>,
}

struct Scheduler {
    // Channels for handing work to individual workers.
    worker_senders: Vec<mpsc::Sender<(Request, oneshot::Sender<usize>, usize)>>,

    // Stack of indexes into worker_senders holding exactly the idle workers.
    // LIFO so recently used workers (with warm caches) go first.
    available_workers: Vec<usize>,

    config: Config,
}

impl Scheduler {
    async fn get_available_worker(&mut self) -> usize {
        match self.available_workers.pop() {
            Some(value) => value,
            None => {
                // No available worker, create a new one if under the limit
                if self.worker_senders.len() < self.config.max_workers {
                    return self.create_worker();
                }
                // otherwise block indefinitely.
                future::pending().await
            },
        }
    }

    fn create_worker(&mut self) -> usize {
        let worker_index = self.worker_senders.len();
        let (work_sender, work_receiver) = mpsc::channel(1);
        self.worker_senders.push(work_sender);
        tokio::spawn(Self::service_requests(work_receiver));
        worker_index
    }

    async fn service_requests(
        mut work_receiver: mpsc::Receiver<(Request, oneshot::Sender<usize>, usize)>,
    ) {
        while let Some((request, done_sender, worker_index)) = work_receiver.next().await {
            request.job.await;
            // Tell the scheduler we're ready for another job.
            let _ = done_sender.send(worker_index);
        }
    }

    async fn dispatch(mut self, receiver: async_channel::Receiver<Request>) {
        let mut in_progress_workers = FuturesUnordered::new();

        loop {
            let next_worker = loop {
                select_biased! {
                    completed_worker = in_progress_workers.select_next_some() => {
                        let Ok(completed_worker) = completed_worker else {
                            tracing::warn!(
                                "Worker shut down. Shutting down {} scheduler.",
                                self.config.name,
                            );
                            return;
                        };
                        self.available_workers.push(completed_worker);
                    },
                    next_worker = self.get_available_worker().fuse() => {
                        break next_worker;
                    },
                }
            };
            let Ok(request) = receiver.recv().await else {
                // Request queue closed, shutting down.
                return;
            };
            let (done_sender, done_receiver) = oneshot::channel();
            if self.worker_senders[next_worker]
                .send((request, done_sender, next_worker))
                .await
                .is_err()
            {
                // An idle worker's channel has room, so a failure means it
                // shut down. We should shut down too.
                tracing::warn!(
                    "Worker sender dropped. Shutting down {} scheduler.",
                    self.config.name,
                );
                return;
            }
            in_progress_workers.push(done_receiver);
        }
    }
}

/// Counts outstanding work and wakes waiters when it drains, the handoff the
/// flush stage blocks on before finalizing a tenant's block.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

struct WaitGroupInner {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(WaitGroupInner {
                count: AtomicUsize::new(0),
                notify: Notify::new(),
            }),
        }
    }

    pub fn add(&self, n: usize) {
        self.inner.count.fetch_add(n, Ordering::SeqCst);
    }

    pub fn done(&self) {
        let previous = self.inner.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "done without matching add");
        if previous == 1 {
            self.inner.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
