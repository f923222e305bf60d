//! A `tokio::spawn` that ties a task's lifetime to a value instead of letting it run free.
//!
//! Every long-lived operation in this codebase (a hole-punch probing burst, a server's refresh
//! loop, a single in-flight connector hop) owns a [`ScopedJoinHandle`] rather than a bare
//! `JoinHandle`, so cancellation falls out of ordinary `Drop` instead of being threaded through
//! every call site by hand.

use std::future::Future;
use tokio::task::JoinHandle;

/// Spawns `future` on the current tokio runtime and returns a handle that aborts the task when
/// dropped.
pub fn spawn<F>(future: F) -> ScopedJoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    ScopedJoinHandle(Some(tokio::spawn(future)))
}

/// Like [`spawn`] but for futures that must run on the thread that spawned them (`!Send`).
pub fn spawn_local<F>(future: F) -> ScopedJoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: 'static,
{
    ScopedJoinHandle(Some(tokio::task::spawn_local(future)))
}

/// A [`JoinHandle`] that aborts its task on drop instead of detaching it.
///
/// Unlike `JoinHandle`, this type is not `Clone`: exactly one owner controls the task's lifetime.
#[derive(Debug)]
pub struct ScopedJoinHandle<T>(Option<JoinHandle<T>>);

impl<T> ScopedJoinHandle<T> {
    /// Detaches the task, letting it run to completion independently of this handle.
    pub fn detach(mut self) {
        self.0.take();
    }

    /// Aborts the task immediately.
    pub fn abort(&self) {
        if let Some(handle) = &self.0 {
            handle.abort();
        }
    }
}

impl<T> Future for ScopedJoinHandle<T> {
    type Output = Result<T, tokio::task::JoinError>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        let handle = self
            .0
            .as_mut()
            .expect("polled a ScopedJoinHandle after it was detached");
        std::pin::Pin::new(handle).poll(cx)
    }
}

impl<T> Drop for ScopedJoinHandle<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}
