//! Bounded runner for background pool work

use std::future::Future;
use std::sync::Arc;

use dbpool_core::PoolError;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// Kind of manager call a helper task makes
///
/// Each lane has its own permits, so a manager call that hangs only holds
/// up work of the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    /// `Manager::acquire`
    Acquire,
    /// Checkin refurbish and destroy
    Return,
    /// `Manager::refurbish_idle`
    IdleTest,
}

/// Spawns pool tasks onto the runtime the pool was created in
///
/// Helper tasks get `helpers` permits per lane so a burst of work cannot
/// flood the runtime.
#[derive(Clone)]
pub(crate) struct TaskRunner {
    handle: Handle,
    acquire: Arc<Semaphore>,
    returns: Arc<Semaphore>,
    idle_tests: Arc<Semaphore>,
}

impl TaskRunner {
    pub(crate) fn new(helpers: usize) -> Result<Self, PoolError> {
        let handle = Handle::try_current().map_err(|_| {
            PoolError::Configuration("a resource pool must be created inside a Tokio runtime".into())
        })?;
        Ok(Self {
            handle,
            acquire: Arc::new(Semaphore::new(helpers)),
            returns: Arc::new(Semaphore::new(helpers)),
            idle_tests: Arc::new(Semaphore::new(helpers)),
        })
    }

    fn permits(&self, lane: Lane) -> Arc<Semaphore> {
        match lane {
            Lane::Acquire => self.acquire.clone(),
            Lane::Return => self.returns.clone(),
            Lane::IdleTest => self.idle_tests.clone(),
        }
    }

    /// Run `task` once a permit of `lane` is free
    pub(crate) fn spawn<F>(&self, lane: Lane, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits(lane);
        self.handle.spawn(async move {
            // The semaphores are never closed
            let _permit = permits.acquire_owned().await;
            task.await;
        })
    }

    /// Run `task` on its own, outside the helper limit
    pub(crate) fn spawn_dedicated<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task)
    }

    /// Permits of `lane` not held by a running task
    #[cfg(test)]
    pub(crate) fn free_permits(&self, lane: Lane) -> usize {
        self.permits(lane).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_busy_lane_does_not_hold_up_others() {
        let runner = TaskRunner::new(1).unwrap();
        runner.spawn(Lane::Acquire, std::future::pending::<()>());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(runner.free_permits(Lane::Acquire), 0);

        let finished = runner.spawn(Lane::Return, async {});
        tokio::time::timeout(Duration::from_millis(10), finished)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(runner.free_permits(Lane::Return), 1);
    }

    #[test]
    fn test_requires_runtime() {
        assert!(matches!(
            TaskRunner::new(1),
            Err(PoolError::Configuration(_))
        ));
    }
}
