//! Prioritized batch replay on a bounded worker pool.
//!
//! Flow points are replayed strictly one after another in [`FlowPoint::PRIORITY_ORDER`].
//! Within a flow point, batches run concurrently in no particular order, and the next
//! flow point is not submitted until every batch of the current one has reported back.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::join_all;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::classify::{CategoryMap, CategoryMaps, FlowPoint, RequestRecord};
use super::client::{ReplayOutcome, ReplayService};
use super::counters::RunCounters;
use crate::config::PoolConfig;
use crate::errors::ReplayError;

/// Unit of pool work: up to `batch_size` records of one flow point.
#[derive(Debug, Clone)]
pub struct Batch {
    pub flow_point: FlowPoint,
    pub index: usize,
    pub records: Vec<Arc<RequestRecord>>,
}

/// Splits a category map into `ceil(len / batch_size)` batches; only the last one may be short.
pub fn partition_batches(
    flow_point: FlowPoint,
    map: &CategoryMap,
    batch_size: usize,
) -> Vec<Batch> {
    let records: Vec<Arc<RequestRecord>> = map.values().cloned().collect();
    records
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(index, chunk)| Batch {
            flow_point,
            index,
            records: chunk.to_vec(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub success: usize,
    pub fail: usize,
}

struct Job {
    batch: Batch,
    done: oneshot::Sender<BatchReport>,
}

/// Worker pool shared by every flow point of a run.
///
/// Workers pull jobs from one bounded queue. When the queue is full a new worker is
/// started for the rejected batch, up to `max_workers`; past that, submission fails with
/// [`ReplayError::PoolSaturation`].
pub struct ReplayPool {
    tx: mpsc::Sender<Job>,
    rx: Arc<AsyncMutex<mpsc::Receiver<Job>>>,
    service: Arc<dyn ReplayService>,
    counters: Arc<RunCounters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    max_workers: usize,
    queue_capacity: usize,
}

impl ReplayPool {
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &PoolConfig,
        service: Arc<dyn ReplayService>,
        counters: Arc<RunCounters>,
    ) -> Self {
        let queue_capacity = config.queue_capacity.max(1);
        let min_workers = config.min_workers.max(1);
        let (tx, rx) = mpsc::channel(queue_capacity);

        let pool = Self {
            tx,
            rx: Arc::new(AsyncMutex::new(rx)),
            service,
            counters,
            workers: Mutex::new(Vec::with_capacity(min_workers)),
            max_workers: config.max_workers.max(min_workers),
            queue_capacity,
        };

        {
            let mut workers = pool.workers.lock();
            for id in 0..min_workers {
                workers.push(pool.spawn_worker(id, None));
            }
        }

        info!(
            min_workers,
            max_workers = pool.max_workers,
            queue_capacity,
            "Replay pool started"
        );
        pool
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Queues `batch`; the returned receiver resolves once the batch has finished.
    pub fn submit(&self, batch: Batch) -> Result<oneshot::Receiver<BatchReport>, ReplayError> {
        let (done, finished) = oneshot::channel();
        let job = Job { batch, done };

        // Held across the send so two submitters cannot both grow past max_workers.
        let mut workers = self.workers.lock();
        match self.tx.try_send(job) {
            Ok(()) => Ok(finished),
            Err(TrySendError::Full(job)) => {
                if workers.len() >= self.max_workers {
                    return Err(ReplayError::PoolSaturation {
                        queue_capacity: self.queue_capacity,
                        max_workers: self.max_workers,
                    });
                }
                let id = workers.len();
                debug!(worker = id, "Replay queue full, starting extra worker");
                workers.push(self.spawn_worker(id, Some(job)));
                Ok(finished)
            }
            Err(TrySendError::Closed(_)) => Err(ReplayError::PoolClosed),
        }
    }

    fn spawn_worker(&self, id: usize, first: Option<Job>) -> JoinHandle<()> {
        let rx = self.rx.clone();
        let service = self.service.clone();
        let counters = self.counters.clone();

        tokio::spawn(async move {
            if let Some(job) = first {
                run_batch(id, job, service.as_ref(), &counters).await;
            }
            loop {
                let job_opt = { rx.lock().await.recv().await };
                let Some(job) = job_opt else {
                    break;
                };
                run_batch(id, job, service.as_ref(), &counters).await;
            }
            debug!(worker = id, "Replay worker stopped");
        })
    }

    /// Closes the queue, lets workers drain it, and waits for all of them.
    pub async fn shutdown(self) {
        let Self { tx, workers, .. } = self;
        drop(tx);

        for handle in workers.into_inner() {
            if let Err(e) = handle.await {
                error!(error = %e, "Replay worker ended abnormally");
            }
        }
    }

    /// Stops every worker without draining the queue. Used when the run is aborted.
    pub fn abort(self) {
        for handle in self.workers.lock().drain(..) {
            handle.abort();
        }
    }
}

async fn run_batch(
    worker: usize,
    job: Job,
    service: &dyn ReplayService,
    counters: &RunCounters,
) {
    let Job { batch, done } = job;
    let started = Instant::now();
    debug!(
        worker,
        flow_point = %batch.flow_point,
        batch = batch.index,
        records = batch.records.len(),
        "Batch started"
    );

    let mut report = BatchReport::default();
    for record in &batch.records {
        // A panicking replay counts as a failed record; the worker keeps going.
        let outcome = match AssertUnwindSafe(service.replay(record)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(
                    worker,
                    flow_point = %batch.flow_point,
                    identity = %record.identity,
                    "Replay panicked"
                );
                ReplayOutcome {
                    identity: record.identity.clone(),
                    success: false,
                }
            }
        };
        counters.record(&outcome);
        if outcome.success {
            report.success += 1;
        } else {
            report.fail += 1;
        }
    }

    info!(
        worker,
        flow_point = %batch.flow_point,
        batch = batch.index,
        success = report.success,
        fail = report.fail,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Batch finished"
    );
    let _ = done.send(report);
}

/// Result of replaying one flow point.
#[derive(Debug, Clone, Serialize)]
pub struct CategoryReport {
    pub flow_point: FlowPoint,
    pub records: usize,
    pub batches: usize,
    pub success: usize,
    pub fail: usize,
    /// Batches whose worker stopped before reporting.
    pub lost_batches: usize,
    pub elapsed_ms: u64,
}

pub struct ReplayScheduler<'a> {
    pool: &'a ReplayPool,
    batch_size: usize,
}

impl<'a> ReplayScheduler<'a> {
    pub fn new(pool: &'a ReplayPool, batch_size: usize) -> Self {
        Self {
            pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Replays every flow point in priority order, one fully drained before the next.
    pub async fn replay_all(
        &self,
        maps: &CategoryMaps,
    ) -> Result<Vec<CategoryReport>, ReplayError> {
        let empty = CategoryMap::new();
        let mut reports = Vec::with_capacity(FlowPoint::PRIORITY_ORDER.len());

        for flow_point in FlowPoint::PRIORITY_ORDER {
            let map = maps.get(flow_point).unwrap_or(&empty);
            reports.push(self.replay_category(flow_point, map).await?);
        }
        Ok(reports)
    }

    /// Submits all batches of one flow point and waits until each has finished.
    pub async fn replay_category(
        &self,
        flow_point: FlowPoint,
        map: &CategoryMap,
    ) -> Result<CategoryReport, ReplayError> {
        let started = Instant::now();
        let batches = partition_batches(flow_point, map, self.batch_size);
        info!(
            %flow_point,
            records = map.len(),
            batches = batches.len(),
            "{} run start",
            flow_point
        );

        let mut report = CategoryReport {
            flow_point,
            records: map.len(),
            batches: batches.len(),
            success: 0,
            fail: 0,
            lost_batches: 0,
            elapsed_ms: 0,
        };

        let mut pending = Vec::with_capacity(batches.len());
        for batch in batches {
            let index = batch.index;
            match self.pool.submit(batch) {
                Ok(finished) => pending.push(finished),
                Err(e) => {
                    error!(%flow_point, batch = index, error = %e, "Batch submission rejected");
                    return Err(e);
                }
            }
        }

        for finished in join_all(pending).await {
            match finished {
                Ok(batch) => {
                    report.success += batch.success;
                    report.fail += batch.fail;
                }
                Err(_) => {
                    report.lost_batches += 1;
                    warn!(%flow_point, "Batch worker stopped before reporting");
                }
            }
        }

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            %flow_point,
            success = report.success,
            fail = report.fail,
            elapsed_ms = report.elapsed_ms,
            "{} run end",
            flow_point
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::classify::Category;
    use async_trait::async_trait;
    use rand::Rng;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn record(identity: &str, flow_point: FlowPoint) -> RequestRecord {
        RequestRecord {
            identity: identity.to_string(),
            category: Category::Known(flow_point),
            payload: format!(r#"{{"app_id":"{}"}}"#, identity),
        }
    }

    fn maps_with(af1001: usize, af1002: usize) -> CategoryMaps {
        let mut maps = CategoryMaps::new();
        for i in 0..af1001 {
            maps.insert(record(&format!("a-{}", i), FlowPoint::Af1001));
        }
        for i in 0..af1002 {
            maps.insert(record(&format!("b-{}", i), FlowPoint::Af1002));
        }
        maps
    }

    fn pool_config(min_workers: usize, max_workers: usize, queue_capacity: usize) -> PoolConfig {
        PoolConfig {
            min_workers,
            max_workers,
            queue_capacity,
            batch_size: 5,
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Start(FlowPoint),
        End(FlowPoint),
    }

    /// Sleeps a random few milliseconds per record and logs start/end order.
    struct RecordingService {
        events: Mutex<Vec<Event>>,
        failing: HashSet<String>,
        max_delay_ms: u64,
    }

    #[async_trait]
    impl ReplayService for RecordingService {
        async fn replay(&self, record: &RequestRecord) -> ReplayOutcome {
            let fp = record.flow_point().unwrap();
            self.events.lock().push(Event::Start(fp));
            let delay = {
                let mut rng = rand::thread_rng();
                rng.gen_range(0..=self.max_delay_ms)
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.events.lock().push(Event::End(fp));
            ReplayOutcome {
                identity: record.identity.clone(),
                success: !self.failing.contains(&record.identity),
            }
        }
    }

    /// Blocks every record until the gate gets a permit.
    struct GatedService {
        gate: Semaphore,
    }

    #[async_trait]
    impl ReplayService for GatedService {
        async fn replay(&self, record: &RequestRecord) -> ReplayOutcome {
            let _permit = self.gate.acquire().await.unwrap();
            ReplayOutcome {
                identity: record.identity.clone(),
                success: true,
            }
        }
    }

    /// Panics on the listed identities and accepts everything else.
    struct PanickingService {
        panic_on: HashSet<String>,
    }

    #[async_trait]
    impl ReplayService for PanickingService {
        async fn replay(&self, record: &RequestRecord) -> ReplayOutcome {
            if self.panic_on.contains(&record.identity) {
                panic!("decision service blew up on {}", record.identity);
            }
            ReplayOutcome {
                identity: record.identity.clone(),
                success: true,
            }
        }
    }

    #[test]
    fn test_batch_sizes() {
        let maps = maps_with(12, 0);
        let map = maps.get(FlowPoint::Af1001).unwrap();

        let batches = partition_batches(FlowPoint::Af1001, map, 5);
        let sizes: Vec<usize> = batches.iter().map(|b| b.records.len()).collect();
        assert_eq!(sizes, vec![5, 5, 2]);

        let identities: HashSet<&str> = batches
            .iter()
            .flat_map(|b| b.records.iter().map(|r| r.identity.as_str()))
            .collect();
        assert_eq!(identities.len(), 12);

        assert_eq!(partition_batches(FlowPoint::Af1001, map, 4).len(), 3);
        assert_eq!(partition_batches(FlowPoint::Af1001, map, 12).len(), 1);
        assert_eq!(partition_batches(FlowPoint::Af1001, map, 100).len(), 1);
        assert!(partition_batches(FlowPoint::Af1001, &CategoryMap::new(), 5).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_priority_barrier_under_random_interleaving() {
        for _ in 0..5 {
            let maps = maps_with(23, 17);
            let failing: HashSet<String> =
                ["a-3", "a-11", "b-0", "b-16"].iter().map(|s| s.to_string()).collect();
            let service = Arc::new(RecordingService {
                events: Mutex::new(Vec::new()),
                failing,
                max_delay_ms: 8,
            });
            let counters = Arc::new(RunCounters::new());
            let pool = ReplayPool::start(&pool_config(2, 4, 64), service.clone(), counters.clone());

            let reports = ReplayScheduler::new(&pool, 5).replay_all(&maps).await.unwrap();
            pool.shutdown().await;

            let events = service.events.lock().clone();
            let last_af1001_end = events
                .iter()
                .rposition(|e| *e == Event::End(FlowPoint::Af1001))
                .unwrap();
            let first_af1002_start = events
                .iter()
                .position(|e| *e == Event::Start(FlowPoint::Af1002))
                .unwrap();
            assert!(last_af1001_end < first_af1002_start);

            assert_eq!(reports.len(), 2);
            assert_eq!(reports[0].flow_point, FlowPoint::Af1001);
            assert_eq!(reports[0].batches, 5);
            assert_eq!(reports[1].batches, 4);

            let snapshot = counters.snapshot();
            assert_eq!(snapshot.total, 40);
            assert_eq!(snapshot.fail, 4);
            assert_eq!(snapshot.total, snapshot.success + snapshot.fail);
        }
    }

    #[tokio::test]
    async fn test_saturation_aborts_category() {
        let service = Arc::new(GatedService {
            gate: Semaphore::new(0),
        });
        let counters = Arc::new(RunCounters::new());
        let pool = ReplayPool::start(&pool_config(1, 1, 1), service, counters.clone());

        let maps = maps_with(3, 0);
        let result = ReplayScheduler::new(&pool, 1)
            .replay_category(FlowPoint::Af1001, maps.get(FlowPoint::Af1001).unwrap())
            .await;

        assert!(matches!(
            result,
            Err(ReplayError::PoolSaturation {
                queue_capacity: 1,
                max_workers: 1
            })
        ));
        pool.abort();
        assert_eq!(counters.snapshot().total, 0);
    }

    #[tokio::test]
    async fn test_pool_grows_only_when_queue_is_full() {
        let service = Arc::new(GatedService {
            gate: Semaphore::new(0),
        });
        let counters = Arc::new(RunCounters::new());
        let pool = ReplayPool::start(&pool_config(1, 3, 1), service.clone(), counters.clone());
        assert_eq!(pool.worker_count(), 1);

        let maps = maps_with(4, 0);
        let map = maps.get(FlowPoint::Af1001).unwrap();
        let mut batches = partition_batches(FlowPoint::Af1001, map, 1).into_iter();

        // First batch fits in the queue, the next two each get a new worker.
        let mut pending = Vec::new();
        for _ in 0..3 {
            pending.push(pool.submit(batches.next().unwrap()).unwrap());
        }
        assert_eq!(pool.worker_count(), 3);

        // Queue full and no room for another worker.
        assert!(matches!(
            pool.submit(batches.next().unwrap()),
            Err(ReplayError::PoolSaturation { .. })
        ));

        service.gate.add_permits(1);
        let done: usize = join_all(pending)
            .await
            .into_iter()
            .map(|r| r.unwrap().success)
            .sum();
        assert_eq!(done, 3);

        pool.shutdown().await;
        assert_eq!(counters.snapshot().success, 3);
    }

    #[tokio::test]
    async fn test_panicking_replay_counts_as_failure() {
        let service = Arc::new(PanickingService {
            panic_on: ["a-1".to_string()].into_iter().collect(),
        });
        let counters = Arc::new(RunCounters::new());
        // One worker, so the second flow point only completes if it survived the panic.
        let pool = ReplayPool::start(&pool_config(1, 1, 64), service, counters.clone());

        let reports = ReplayScheduler::new(&pool, 5)
            .replay_all(&maps_with(3, 2))
            .await
            .unwrap();
        pool.shutdown().await;

        assert_eq!(reports[0].success, 2);
        assert_eq!(reports[0].fail, 1);
        assert_eq!(reports[0].lost_batches, 0);
        assert_eq!(reports[1].success, 2);
        assert_eq!(reports[1].lost_batches, 0);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.total, 5);
        assert_eq!(snapshot.success, 4);
        assert_eq!(snapshot.fail, 1);
    }

    #[tokio::test]
    async fn test_empty_flow_points_complete() {
        let service = Arc::new(GatedService {
            gate: Semaphore::new(0),
        });
        let counters = Arc::new(RunCounters::new());
        let pool = ReplayPool::start(&PoolConfig::default(), service, counters.clone());

        let reports = ReplayScheduler::new(&pool, 5)
            .replay_all(&CategoryMaps::new())
            .await
            .unwrap();
        pool.shutdown().await;

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.batches == 0 && r.records == 0));
        assert_eq!(counters.snapshot().total, 0);
    }
}
