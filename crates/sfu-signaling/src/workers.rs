//! Media worker pool.
//!
//! Workers are started once at process start, each with a disjoint slice of
//! the RTC port range. The pool hands a worker to every new room router and
//! tracks how many live routers each worker hosts.
//!
//! A worker dying is fatal for the whole process: the pool publishes the
//! death on a watch channel and `main` exits non-zero so the supervisor can
//! restart it.

use crate::config::WorkerSelection;
use crate::engine::{EngineWorker, MediaEngine, WorkerSettings};
use crate::errors::SfuError;
use crate::observability::metrics;

use common::config::PortRange;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{error, info, instrument};

/// A running worker and the ports it owns.
#[derive(Clone)]
pub struct WorkerHandle {
    /// Position in the pool.
    pub index: usize,
    /// The engine worker.
    pub worker: Arc<dyn EngineWorker>,
    /// Ports this worker binds transports on.
    pub port_range: PortRange,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("index", &self.index)
            .field("worker_id", &self.worker.id())
            .field("port_range", &self.port_range)
            .finish()
    }
}

/// Details of an unexpected worker termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDeath {
    pub worker_index: usize,
    pub reason: String,
}

impl From<WorkerDeath> for SfuError {
    fn from(death: WorkerDeath) -> Self {
        SfuError::WorkerDied {
            worker_index: death.worker_index,
            reason: death.reason,
        }
    }
}

struct Assignment {
    loads: Vec<usize>,
    next: usize,
}

/// Fixed pool of media workers.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    selection: WorkerSelection,
    assignment: Mutex<Assignment>,
    death_tx: watch::Sender<Option<WorkerDeath>>,
}

impl WorkerPool {
    /// Start `num_workers` workers, splitting `base_range` evenly between them.
    ///
    /// Fails if the range cannot be split or any worker fails to start.
    #[instrument(skip_all, name = "sfu.workers.start", fields(num_workers = num_workers))]
    pub async fn start(
        engine: &dyn MediaEngine,
        num_workers: usize,
        base_range: PortRange,
        selection: WorkerSelection,
    ) -> Result<Arc<Self>, SfuError> {
        let slices = base_range
            .split(num_workers)
            .map_err(|e| SfuError::Config(format!("cannot split RTC port range: {e}")))?;

        let (death_tx, _) = watch::channel(None);
        let mut workers = Vec::with_capacity(num_workers);

        for (index, port_range) in slices.into_iter().enumerate() {
            let worker = engine
                .create_worker(WorkerSettings { index, port_range })
                .await
                .map_err(|e| {
                    error!(
                        target: "sfu.workers",
                        worker_index = index,
                        error = %e,
                        "Failed to start worker"
                    );
                    SfuError::Internal(format!("failed to start worker {index}: {e}"))
                })?;

            let tx = death_tx.clone();
            worker.on_died(Box::new(move |reason| {
                error!(
                    target: "sfu.workers",
                    worker_index = index,
                    reason = %reason,
                    "Media worker died, process must restart"
                );
                metrics::record_worker_death();
                tx.send_replace(Some(WorkerDeath {
                    worker_index: index,
                    reason,
                }));
            }));

            info!(
                target: "sfu.workers",
                worker_index = index,
                worker_id = %worker.id(),
                port_min = port_range.min,
                port_max = port_range.max,
                "Media worker started"
            );
            metrics::set_worker_load(index, 0);

            workers.push(WorkerHandle {
                index,
                worker,
                port_range,
            });
        }

        Ok(Arc::new(Self {
            assignment: Mutex::new(Assignment {
                loads: vec![0; workers.len()],
                next: 0,
            }),
            workers,
            selection,
            death_tx,
        }))
    }

    fn assignment(&self) -> MutexGuard<'_, Assignment> {
        self.assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of workers in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Pick a worker for a new router and count it against that worker.
    ///
    /// Least-loaded breaks ties on the lowest index.
    pub fn assign_worker(&self) -> Result<WorkerHandle, SfuError> {
        if let Some(death) = self.death() {
            return Err(death.into());
        }

        let mut assignment = self.assignment();
        let index = match self.selection {
            WorkerSelection::LeastLoaded => assignment
                .loads
                .iter()
                .enumerate()
                .min_by_key(|(index, load)| (**load, *index))
                .map(|(index, _)| index),
            WorkerSelection::RoundRobin => {
                let len = self.workers.len();
                (len > 0).then(|| {
                    let index = assignment.next % len;
                    assignment.next = (index + 1) % len;
                    index
                })
            }
        }
        .ok_or(SfuError::NoWorkers)?;

        let handle = self.workers.get(index).cloned().ok_or(SfuError::NoWorkers)?;
        if let Some(load) = assignment.loads.get_mut(index) {
            *load += 1;
            metrics::set_worker_load(index, *load);
        }
        Ok(handle)
    }

    /// Return a router slot to its worker.
    pub fn release_worker(&self, handle: &WorkerHandle) {
        let mut assignment = self.assignment();
        if let Some(load) = assignment.loads.get_mut(handle.index) {
            *load = load.saturating_sub(1);
            metrics::set_worker_load(handle.index, *load);
        }
    }

    /// Live routers per worker, by index.
    #[must_use]
    pub fn loads(&self) -> Vec<usize> {
        self.assignment().loads.clone()
    }

    /// The first recorded worker death, if any.
    #[must_use]
    pub fn death(&self) -> Option<WorkerDeath> {
        self.death_tx.borrow().clone()
    }

    /// Resolve once any worker dies.
    pub async fn wait_for_worker_death(&self) -> WorkerDeath {
        let mut rx = self.death_tx.subscribe();
        loop {
            if let Some(death) = rx.borrow_and_update().clone() {
                return death;
            }
            if rx.changed().await.is_err() {
                // Sender lives in self, so this only happens during teardown
                std::future::pending::<()>().await;
            }
        }
    }

    /// Close every worker.
    pub async fn close(&self) {
        for handle in &self.workers {
            handle.worker.close().await;
        }
        info!(target: "sfu.workers", count = self.workers.len(), "Media workers closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::LoopbackEngine;
    use std::time::Duration;

    fn range() -> PortRange {
        PortRange::new(10000, 10099).unwrap()
    }

    #[tokio::test]
    async fn test_workers_get_disjoint_port_slices() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(&engine, 4, range(), WorkerSelection::LeastLoaded)
            .await
            .unwrap();

        assert_eq!(pool.len(), 4);
        assert_eq!(engine.stats().workers_created, 4);
        for (i, a) in pool.workers.iter().enumerate() {
            for b in pool.workers.iter().skip(i + 1) {
                assert!(!a.port_range.overlaps(&b.port_range));
            }
        }
    }

    #[tokio::test]
    async fn test_start_fails_when_range_too_small() {
        let engine = LoopbackEngine::new();
        let result = WorkerPool::start(
            &engine,
            8,
            PortRange::new(10000, 10003).unwrap(),
            WorkerSelection::LeastLoaded,
        )
        .await;

        assert!(matches!(result, Err(SfuError::Config(_))));
    }

    #[tokio::test]
    async fn test_least_loaded_prefers_lowest_index_on_ties() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(&engine, 3, range(), WorkerSelection::LeastLoaded)
            .await
            .unwrap();

        assert_eq!(pool.assign_worker().unwrap().index, 0);
        assert_eq!(pool.assign_worker().unwrap().index, 1);
        assert_eq!(pool.assign_worker().unwrap().index, 2);
        assert_eq!(pool.loads(), vec![1, 1, 1]);

        let second = pool.workers[1].clone();
        pool.release_worker(&second);
        assert_eq!(pool.assign_worker().unwrap().index, 1);
    }

    #[tokio::test]
    async fn test_round_robin_ignores_load() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(&engine, 2, range(), WorkerSelection::RoundRobin)
            .await
            .unwrap();

        let first = pool.assign_worker().unwrap();
        pool.release_worker(&first);

        assert_eq!(first.index, 0);
        assert_eq!(pool.assign_worker().unwrap().index, 1);
        assert_eq!(pool.assign_worker().unwrap().index, 0);
    }

    #[tokio::test]
    async fn test_release_never_underflows() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(&engine, 1, range(), WorkerSelection::LeastLoaded)
            .await
            .unwrap();

        let handle = pool.workers[0].clone();
        pool.release_worker(&handle);
        assert_eq!(pool.loads(), vec![0]);
    }

    #[tokio::test]
    async fn test_worker_death_is_published() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(&engine, 2, range(), WorkerSelection::LeastLoaded)
            .await
            .unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.wait_for_worker_death().await })
        };

        assert!(engine.kill_worker(1, "out of memory"));

        let death = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("death should be published")
            .unwrap();
        assert_eq!(
            death,
            WorkerDeath {
                worker_index: 1,
                reason: "out of memory".to_string()
            }
        );
        assert!(matches!(
            pool.assign_worker(),
            Err(SfuError::WorkerDied { worker_index: 1, .. })
        ));
    }
}
