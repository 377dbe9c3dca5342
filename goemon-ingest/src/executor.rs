//! Bounded async executor shared across channel pipelines.
//!
//! A fixed number of permits bounds how many submitted units run at once;
//! excess submissions queue on the semaphore and wait. The pool is
//! process-wide: many concurrently-recovering channels share it without
//! unbounded memory growth.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use goemon_core::{Error, Result};

pub struct BoundedExecutor {
    permits: Arc<Semaphore>,
}

impl BoundedExecutor {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "executor needs at least one worker");
        Self {
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    /// Submit a unit of work. The returned handle can be awaited
    /// individually or in bulk via [`await_all`].
    pub fn spawn<F, T>(&self, fut: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.map_err(|_| Error::Internal {
                message: "executor pool closed".to_string(),
            })?;
            fut.await
        });
        TaskHandle { handle }
    }
}

/// Handle to one submitted unit of work
pub struct TaskHandle<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub async fn await_result(self) -> Result<T> {
        self.handle.await.map_err(|e| Error::Internal {
            message: format!("executor task panicked: {}", e),
        })?
    }
}

/// Await every handle; the first error fails the batch as a whole.
pub async fn await_all<T>(handles: Vec<TaskHandle<T>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(handles.len());
    let mut first_err = None;
    for handle in handles {
        match handle.await_result().await {
            Ok(v) => results.push(v),
            Err(e) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(results),
    }
}
