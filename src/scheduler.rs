//! Deferred execution capability injected into the queue, forwarders and monitors.
//!
//! Every handoff out of the queue goes through [`Scheduler::run_soon`] so producers and
//! consumers never observe each other's state mid-call.
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::time::Duration;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Scheduler: Send + Sync + Debug {
    /// Run `job` on a later turn of the event loop, never on the caller's stack.
    fn run_soon(&self, job: Job);

    /// Run `job` once `delay` has elapsed.
    fn run_after(&self, delay: Duration, job: Job);

    /// Drive a future to completion in the background.
    fn spawn(&self, fut: BoxFuture<'static, ()>);
}

/// [`Scheduler`] backed by a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        TokioScheduler { handle }
    }

    /// Binds to the runtime the caller is running on.
    ///
    /// # Panics
    /// When called outside of a tokio runtime.
    pub fn current() -> Self {
        TokioScheduler {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn run_soon(&self, job: Job) {
        self.handle.spawn(async move {
            job();
        });
    }

    fn run_after(&self, delay: Duration, job: Job) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            job();
        });
    }

    fn spawn(&self, fut: BoxFuture<'static, ()>) {
        self.handle.spawn(fut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn run_soon_never_runs_inline() {
        let scheduler = TokioScheduler::current();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        scheduler.run_soon(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));

        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn run_after_waits_for_the_delay() {
        let scheduler = TokioScheduler::current();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        scheduler.run_after(
            Duration::from_secs(60),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        );

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(!ran.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(ran.load(Ordering::SeqCst));
    }
}
