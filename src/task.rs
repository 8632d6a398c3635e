//! Spawned units of work with a single eventual result.
//!
//! [`TaskHandle`] is owned by one waiter; [`SharedTask`] can be joined from
//! any number of places and runs its work exactly once. Both start running as
//! soon as they are created.
//!
//! ```rust,ignore
//! let revision = TaskHandle::spawn("local-revision", async { repo.revision().await })
//!     .shared();
//!
//! let a = revision.clone();
//! let b = revision.clone();
//! let (a, b) = tokio::join!(a.join(), b.join());
//! ```

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::Instrument;

/// A spawned task ended without producing a value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task panicked.
    #[error("Task '{task}' panicked: {message}")]
    Panicked {
        /// Task name
        task: String,
        /// Panic payload, when it was a string
        message: String,
    },

    /// The task was aborted before finishing.
    #[error("Task '{0}' was cancelled")]
    Cancelled(String),
}

impl TaskError {
    fn from_join(task: &str, error: JoinError) -> Self {
        if error.is_cancelled() {
            return TaskError::Cancelled(task.to_string());
        }
        let message = match error.try_into_panic() {
            Ok(payload) => payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string()),
            Err(_) => "unknown failure".to_string(),
        };
        TaskError::Panicked {
            task: task.to_string(),
            message,
        }
    }
}

/// Handle to work running on the tokio runtime.
#[derive(Debug)]
pub struct TaskHandle<T, E> {
    name: String,
    handle: JoinHandle<Result<T, E>>,
}

impl<T, E> TaskHandle<T, E>
where
    T: Send + 'static,
    E: From<TaskError> + Send + 'static,
{
    /// Start `future` on the runtime, inside the caller's current span.
    pub fn spawn<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handle: tokio::spawn(future.in_current_span()),
        }
    }

    /// Task name, used in error messages
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the work has finished
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the result. A panic becomes [`TaskError::Panicked`].
    pub async fn join(self) -> Result<T, E> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(TaskError::from_join(&self.name, e).into()),
        }
    }

    /// Convert into a handle that many waiters can join.
    pub fn shared(self) -> SharedTask<T, E>
    where
        T: Clone + Sync,
        E: Sync,
    {
        let name = self.name.clone();
        let future: BoxFuture<'static, Result<T, Arc<E>>> =
            async move { self.join().await.map_err(Arc::new) }.boxed();
        SharedTask {
            name,
            inner: future.shared(),
        }
    }
}

/// A task result readable by many waiters.
///
/// The underlying work runs once; every [`SharedTask::join`] observes the same
/// value or the same error.
pub struct SharedTask<T, E>
where
    T: Clone,
{
    name: String,
    inner: Shared<BoxFuture<'static, Result<T, Arc<E>>>>,
}

impl<T, E> Clone for SharedTask<T, E>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T, E> SharedTask<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: From<TaskError> + Send + Sync + 'static,
{
    /// Spawn `future` and share its result.
    pub fn spawn<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        TaskHandle::spawn(name, future).shared()
    }

    /// Task name, used in error messages
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the shared result.
    pub async fn join(&self) -> Result<T, Arc<E>> {
        self.inner.clone().await
    }
}

impl<T: Clone, E> std::fmt::Debug for SharedTask<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTask")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
