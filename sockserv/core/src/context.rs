//! Cancellation Context
//!
//! [`Context`] is the cancellation signal threaded through `listen`,
//! `shutdown` and every connection. Contexts form a tree: a child observes
//! its parent's cancellation, while cancelling a child leaves the parent
//! untouched.
//!
//! ```text
//!   listen ctx (caller)
//!       │
//!       ├── connection ctx #1 ── cancelled when both halves close
//!       ├── connection ctx #2
//!       └── ...
//! ```
//!
//! Cancellation is a close-once latch: cancelling twice is a no-op and never
//! blocks.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::watch;

/// Cloneable, hierarchical cancellation signal
#[derive(Clone, Debug)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: watch::Sender<bool>,
    parent: Option<Context>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// Create a root context that is only cancelled explicitly
    #[must_use]
    pub fn new() -> Self {
        Self::with_parent(None)
    }

    fn with_parent(parent: Option<Context>) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner { cancelled, parent }),
        }
    }

    /// Derive a child context cancelled together with `self`
    #[must_use]
    pub fn child(&self) -> Self {
        Self::with_parent(Some(self.clone()))
    }

    /// Cancel this context and all of its children
    pub fn cancel(&self) {
        self.inner.cancelled.send_replace(true);
    }

    /// Whether this context or one of its ancestors has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(Context::is_cancelled)
    }

    /// Future resolving once this context is cancelled
    ///
    /// The returned future owns a handle to the context, so it can be stored
    /// or moved into another task.
    pub fn cancelled(&self) -> BoxFuture<'static, ()> {
        let ctx = self.clone();
        Box::pin(async move {
            let own = wait_latch(ctx.inner.cancelled.subscribe());
            match ctx.inner.parent.clone() {
                Some(parent) => {
                    tokio::select! {
                        () = own => {}
                        () = parent.cancelled() => {}
                    }
                }
                None => own.await,
            }
        })
    }

    /// Run `fut` to completion unless the context is cancelled first
    ///
    /// Returns `None` when cancellation won.
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

async fn wait_latch(mut rx: watch::Receiver<bool>) {
    // The sender lives inside the context we hold, so this only errors if
    // the context itself is gone.
    let _ = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_context_not_cancelled() {
        let ctx = Context::new();
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let ctx = Context::new();
        ctx.cancel();
        ctx.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent_not_reverse() {
        let parent = Context::new();
        let child = parent.child();
        let grandchild = child.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
        assert!(!parent.is_cancelled());

        let sibling = parent.child();
        parent.cancel();
        assert!(sibling.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_wakes_on_parent_cancel() {
        let parent = Context::new();
        let child = parent.child();

        let waiter = tokio::spawn(child.cancelled());
        tokio::task::yield_now().await;
        parent.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("child should observe parent cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_future_pending_until_cancel() {
        let parent = Context::new();
        let mut waiter = tokio_test::task::spawn(parent.child().cancelled());
        tokio_test::assert_pending!(waiter.poll());

        parent.cancel();
        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_cancelled_future_ready_when_already_cancelled() {
        let ctx = Context::new();
        ctx.cancel();
        tokio::time::timeout(Duration::from_millis(100), ctx.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let ctx = Context::new();
        assert_eq!(ctx.run_until_cancelled(async { 7 }).await, Some(7));

        ctx.cancel();
        let out = ctx
            .run_until_cancelled(futures::future::pending::<()>())
            .await;
        assert!(out.is_none());
    }
}
