use core::future::Future;

use tokio::task::JoinHandle;

/// Aborts the running task when dropped.
///
/// Keeps background session tasks from outliving the [`crate::RdpClient`] that spawned them.
#[must_use]
pub(crate) struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub(crate) async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
