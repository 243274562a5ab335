//! Scheduler capability injected into the supervisor, consumer and publisher.
//!
//! Everything that waits or runs in the background goes through [`EventLoop`], so the
//! same reconnect and dispatch logic runs unchanged on tokio, on async-std, or on a
//! test clock. Running the loop itself stays with the application.

use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::FutureExt;
use std::time::Duration;
use tokio::sync::oneshot;

pub trait EventLoop: Send + Sync {
    /// A timer that completes after `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;

    /// Runs `task` in the background on this loop.
    fn spawn(&self, task: BoxFuture<'static, ()>) -> TaskHandle;
}

/// Handle to a spawned task: abort it, or wait for it to end.
#[derive(Debug)]
pub struct TaskHandle {
    abort: AbortHandle,
    done: oneshot::Receiver<()>,
}

impl TaskHandle {
    /// Wraps `task` so it can be aborted and joined independently of the executor.
    /// The returned future is what the executor must drive.
    pub fn wrap(task: BoxFuture<'static, ()>) -> (BoxFuture<'static, ()>, TaskHandle) {
        let (abort, registration) = AbortHandle::new_pair();
        let (done_tx, done) = oneshot::channel();

        let driven = async move {
            let _ = Abortable::new(task, registration).await;
            let _ = done_tx.send(());
        }
        .boxed();

        (driven, TaskHandle { abort, done })
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Completes once the task has finished or been aborted.
    pub async fn join(&mut self) {
        let _ = (&mut self.done).await;
    }
}

/// Event loop backed by the tokio runtime the caller is running on.
#[derive(Debug, Clone)]
pub struct TokioEventLoop {
    handle: tokio::runtime::Handle,
}

impl TokioEventLoop {
    /// Binds to the current runtime.
    ///
    /// # Panics
    /// When called outside a tokio runtime.
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl EventLoop for TokioEventLoop {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(duration).boxed()
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) -> TaskHandle {
        let (driven, handle) = TaskHandle::wrap(task);
        self.handle.spawn(driven);
        handle
    }
}

/// Event loop backed by the async-std global executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsyncStdEventLoop;

impl EventLoop for AsyncStdEventLoop {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        async_std::task::sleep(duration).boxed()
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) -> TaskHandle {
        let (driven, handle) = TaskHandle::wrap(task);
        async_std::task::spawn(driven);
        handle
    }
}
