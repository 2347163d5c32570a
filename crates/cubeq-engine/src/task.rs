//! Cooperative query tasks with parent-to-child cancellation

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::QbError;

/// A group of tasks sharing one cancellation token. Cancelling the scope
/// cancels every task it spawned and every child scope; dropping it aborts
/// tasks still running. Errors other than [`QbError`] convert from it so
/// cancellation and panics surface in the caller's error type.
pub struct TaskScope<T, E = QbError> {
    token: CancellationToken,
    tasks: JoinSet<Result<T, E>>,
}

impl<T, E> TaskScope<T, E>
where
    T: Send + 'static,
    E: From<QbError> + std::fmt::Display + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            tasks: JoinSet::new(),
        }
    }

    /// Scope cancelled together with this one
    pub fn child<U: Send + 'static>(&self) -> TaskScope<U, E> {
        TaskScope::with_token(self.token.child_token())
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn a task that receives a child token; the task ends with
    /// `Cancelled` as soon as the scope is cancelled
    pub fn spawn<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let token = self.token.child_token();
        let fut = task(token.clone());
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(E::from(QbError::Cancelled)),
                result = fut => result,
            }
        });
    }

    /// Wait for every task, in completion order. The first failure cancels
    /// the rest and is returned.
    pub async fn join_all(&mut self) -> Result<Vec<T>, E> {
        let mut out = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(E::from(QbError::Cancelled)),
                Err(e) => Err(E::from(QbError::TaskFailed(e.to_string()))),
            };
            match result {
                Ok(value) => out.push(value),
                Err(e) => {
                    debug!(error = %e, remaining = self.tasks.len(), "Cancelling sibling tasks");
                    self.token.cancel();
                    self.tasks.shutdown().await;
                    return Err(e);
                }
            }
        }
        if self.token.is_cancelled() {
            return Err(E::from(QbError::Cancelled));
        }
        Ok(out)
    }
}

impl<T, E> Default for TaskScope<T, E>
where
    T: Send + 'static,
    E: From<QbError> + std::fmt::Display + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Drop for TaskScope<T, E> {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Fail with `Cancelled` if the token has fired
pub fn checkpoint(token: &CancellationToken) -> Result<(), QbError> {
    if token.is_cancelled() {
        Err(QbError::Cancelled)
    } else {
        Ok(())
    }
}

/// Sleep unless cancelled first
pub async fn sleep(token: &CancellationToken, duration: Duration) -> Result<(), QbError> {
    tokio::select! {
        _ = token.cancelled() => Err(QbError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_join_all_collects_results() {
        let mut scope: TaskScope<u32> = TaskScope::new();
        for i in 0..4u32 {
            scope.spawn(move |_| async move { Ok(i * 2) });
        }
        let mut results = scope.join_all().await.unwrap();
        results.sort();
        assert_eq!(results, vec![0, 2, 4, 6]);
    }

    #[tokio::test]
    async fn test_cancel_reaches_children() {
        let parent: TaskScope<()> = TaskScope::new();
        let mut child: TaskScope<()> = parent.child();
        let finished = Arc::new(AtomicUsize::new(0));

        let counter = finished.clone();
        child.spawn(move |token| async move {
            sleep(&token, Duration::from_secs(60)).await?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        parent.cancel();
        let result = child.join_all().await;
        assert!(matches!(result, Err(QbError::Cancelled)));
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_cancels_siblings() {
        let mut scope: TaskScope<u32> = TaskScope::new();
        scope.spawn(|token| async move {
            sleep(&token, Duration::from_secs(60)).await?;
            Ok(1)
        });
        scope.spawn(|_| async { Err(QbError::TaskFailed("boom".to_string())) });

        let result = scope.join_all().await;
        assert!(matches!(result, Err(QbError::TaskFailed(msg)) if msg == "boom"));
        assert!(scope.is_cancelled());
    }

    #[test]
    fn test_checkpoint() {
        let token = CancellationToken::new();
        assert!(checkpoint(&token).is_ok());
        token.cancel();
        assert!(matches!(checkpoint(&token), Err(QbError::Cancelled)));
    }
}
