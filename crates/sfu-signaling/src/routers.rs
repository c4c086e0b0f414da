//! Per-room router registry.
//!
//! Guarantees at most one router per room even when many joins race: the
//! first caller creates the router while later callers await the same
//! `OnceCell`. A failed creation leaves the cell empty so the next caller
//! retries.

use crate::engine::EngineRouter;
use crate::errors::SfuError;
use crate::workers::{WorkerHandle, WorkerPool};

use common::types::RoomId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// A room's router and the worker hosting it.
#[derive(Clone)]
pub struct RoomRouter {
    pub router: Arc<dyn EngineRouter>,
    pub worker: WorkerHandle,
}

type RouterCell = Arc<OnceCell<RoomRouter>>;

/// Maps room ids to their routers.
pub struct RouterRegistry {
    pool: Arc<WorkerPool>,
    routers: Mutex<HashMap<RoomId, RouterCell>>,
}

impl RouterRegistry {
    #[must_use]
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            pool,
            routers: Mutex::new(HashMap::new()),
        }
    }

    fn routers(&self) -> MutexGuard<'_, HashMap<RoomId, RouterCell>> {
        self.routers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the room's router, creating it on a pool worker if needed.
    pub async fn get_or_create(&self, room_id: &RoomId) -> Result<RoomRouter, SfuError> {
        let cell = Arc::clone(self.routers().entry(room_id.clone()).or_default());

        let room_router = cell
            .get_or_try_init(|| self.create_router(room_id))
            .await?;

        Ok(room_router.clone())
    }

    async fn create_router(&self, room_id: &RoomId) -> Result<RoomRouter, SfuError> {
        let worker = self.pool.assign_worker()?;
        match worker.worker.create_router().await {
            Ok(router) => {
                info!(
                    target: "sfu.routers",
                    room_id = %room_id,
                    router_id = %router.id(),
                    worker_index = worker.index,
                    "Router created"
                );
                Ok(RoomRouter { router, worker })
            }
            Err(e) => {
                warn!(
                    target: "sfu.routers",
                    room_id = %room_id,
                    worker_index = worker.index,
                    error = %e,
                    "Router creation failed"
                );
                self.pool.release_worker(&worker);
                Err(e.into())
            }
        }
    }

    /// The room's router if it has been created.
    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<RoomRouter> {
        self.routers()
            .get(room_id)
            .and_then(|cell| cell.get().cloned())
    }

    /// Close the room's router and give its slot back to the worker.
    ///
    /// No-op for unknown rooms.
    pub async fn release(&self, room_id: &RoomId) {
        let cell = self.routers().remove(room_id);
        let Some(room_router) = cell.and_then(|c| c.get().cloned()) else {
            return;
        };

        room_router.router.close().await;
        self.pool.release_worker(&room_router.worker);
        debug!(
            target: "sfu.routers",
            room_id = %room_id,
            worker_index = room_router.worker.index,
            "Router released"
        );
    }

    /// Number of rooms with a live router.
    #[must_use]
    pub fn router_count(&self) -> usize {
        self.routers()
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// The pool routers are assigned from.
    #[must_use]
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::WorkerSelection;
    use crate::engine::LoopbackEngine;
    use common::config::PortRange;
    use std::time::Duration;

    async fn registry(engine: &LoopbackEngine, workers: usize) -> Arc<RouterRegistry> {
        let pool = WorkerPool::start(
            engine,
            workers,
            PortRange::new(20000, 20099).unwrap(),
            WorkerSelection::LeastLoaded,
        )
        .await
        .unwrap();
        Arc::new(RouterRegistry::new(pool))
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_yields_one_router() {
        let engine = LoopbackEngine::with_router_delay(Duration::from_millis(20));
        let registry = registry(&engine, 2).await;
        let room_id = RoomId::from("standup");

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            let room_id = room_id.clone();
            tasks.push(tokio::spawn(async move {
                registry.get_or_create(&room_id).await.unwrap().router.id()
            }));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.dedup();

        assert_eq!(ids.len(), 1, "every caller should see the same router");
        assert_eq!(engine.stats().routers_created, 1);
        assert_eq!(registry.pool().loads().iter().sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_rooms_spread_across_workers() {
        let engine = LoopbackEngine::new();
        let registry = registry(&engine, 2).await;

        let a = registry.get_or_create(&RoomId::from("a")).await.unwrap();
        let b = registry.get_or_create(&RoomId::from("b")).await.unwrap();

        assert_ne!(a.worker.index, b.worker.index);
        assert_eq!(registry.router_count(), 2);
    }

    #[tokio::test]
    async fn test_release_closes_router_and_frees_worker() {
        let engine = LoopbackEngine::new();
        let registry = registry(&engine, 1).await;
        let room_id = RoomId::from("retro");

        registry.get_or_create(&room_id).await.unwrap();
        assert_eq!(registry.pool().loads(), vec![1]);

        registry.release(&room_id).await;

        assert!(registry.get(&room_id).is_none());
        assert_eq!(registry.pool().loads(), vec![0]);
        assert_eq!(engine.stats().live_routers, 0);

        // Releasing twice is harmless
        registry.release(&room_id).await;
    }

    #[tokio::test]
    async fn test_creation_after_worker_death_fails() {
        let engine = LoopbackEngine::new();
        let registry = registry(&engine, 2).await;
        let room_id = RoomId::from("doomed");

        engine.kill_worker(0, "crashed");
        let result = registry.get_or_create(&room_id).await;

        assert!(matches!(result, Err(SfuError::WorkerDied { .. })));
        assert_eq!(registry.router_count(), 0);
        assert_eq!(registry.pool().loads(), vec![0, 0]);
    }
}
