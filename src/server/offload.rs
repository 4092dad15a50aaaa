/*!
Offload of blocking manager calls.

Handlers run on the single dispatch thread; every manager call goes through
[`Offloader::run`], which waits for one of N worker slots, then executes the call on the
blocking pool and resumes the handler with its result. At most N calls run at once;
further calls queue on the semaphore without bound and without timeout.

Each call first pauses for the configured `offload_delay` inside its slot, so the delay
also throttles how quickly slots turn over.
*/

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::errors::ApiError;

#[derive(Debug, Clone)]
pub struct Offloader {
    slots: Arc<Semaphore>,
    delay: Duration,
}

impl Offloader {
    pub fn new(workers: usize, delay: Duration) -> Self {
        Offloader {
            slots: Arc::new(Semaphore::new(workers.max(1))),
            delay,
        }
    }

    /// Slots currently free.
    pub fn idle(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run `task` on a worker slot and await its result. A failing or panicking task
    /// surfaces as [`ApiError::Manager`].
    pub async fn run<T, F>(&self, task: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let slot = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ApiError::Manager(anyhow!("worker pool is shut down")))?;
        let delay = self.delay;
        let joined = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            if !delay.is_zero() {
                debug!(delay_ms = delay.as_millis() as u64, "offload delay");
                std::thread::sleep(delay);
            }
            task()
        })
        .await;
        match joined {
            Ok(res) => res.map_err(ApiError::Manager),
            Err(e) => Err(ApiError::Manager(anyhow!("background task failed: {e}"))),
        }
    }
}
