use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Owns the shutdown signal for a queue system and tracks how much queue
/// machinery (workers, promoter and stalled-checker loops, event tails) is
/// still winding down.
///
/// Each background loop takes a [TaskGuard] from its [ShutdownListener]
/// for as long as it runs; [Shutdown::trigger_and_wait] returns only once
/// every guard has been dropped, i.e. once the queues have actually gone
/// quiet rather than merely been asked to.
pub struct Shutdown {
    signal: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
    tasks: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("triggered", &*self.receiver.borrow())
            .field("active_tasks", &self.tasks.load(Ordering::Acquire))
            .finish()
    }
}

impl Shutdown {
    pub fn new() -> Shutdown {
        let (signal_tx, signal_rx) = watch::channel(false);
        Shutdown {
            signal: Arc::new(signal_tx),
            receiver: signal_rx,
            tasks: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            signal: self.receiver.clone(),
            tasks: self.tasks.clone(),
        }
    }

    /// Background loops still holding a [TaskGuard].
    pub fn active_tasks(&self) -> usize {
        self.tasks.load(Ordering::Acquire)
    }

    /// Flip the signal. Safe to call more than once.
    pub fn trigger(&self) {
        self.signal.send(true).ok();
    }

    /// Trigger, then wait until every guard has been released. Workers
    /// finish their in-flight handlers and the maintenance loops complete
    /// their current pass before their guards drop, so this is the point
    /// after which it is safe to tear down the process or call
    /// `Queue::empty`.
    pub async fn trigger_and_wait(&self) {
        self.trigger();
        while self.tasks.load(Ordering::Acquire) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Also trigger on SIGINT. Opt-in so that embedded uses (tests, jobs
    /// spawned from a larger server) keep signal handling to themselves.
    pub fn trigger_on_ctrl_c(&self) -> JoinHandle<()> {
        let signal = self.signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.send(true).ok();
            }
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable view handed to every queue loop.
#[derive(Clone, Debug)]
pub struct ShutdownListener {
    signal: watch::Receiver<bool>,
    tasks: Arc<AtomicUsize>,
}

impl ShutdownListener {
    pub fn is_shutting_down(&self) -> bool {
        *self.signal.borrow()
    }

    pub async fn wait_for_shutdown(&mut self) {
        while !*self.signal.borrow() {
            // A closed channel means the owner is gone; treat it as a
            // shutdown too.
            if self.signal.changed().await.is_err() {
                return;
            }
        }
    }

    /// Register a unit of queue machinery that [Shutdown::trigger_and_wait]
    /// must wait for. Hold the guard for the lifetime of the loop.
    pub fn task_guard(&self) -> TaskGuard {
        self.tasks.fetch_add(1, Ordering::AcqRel);
        TaskGuard {
            tasks: self.tasks.clone(),
        }
    }
}

/// Releases its slot when dropped.
pub struct TaskGuard {
    tasks: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tasks.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn listener_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>(_value: T) {}

        let shutdown = Shutdown::new();
        assert_send_sync(shutdown.listener());
    }

    #[tokio::test]
    async fn listener_sees_trigger() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();
        assert!(!listener.is_shutting_down());

        let waiter = tokio::spawn(async move { listener.wait_for_shutdown().await });
        tokio::task::yield_now().await;

        shutdown.trigger();
        timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter must wake on trigger")
            .expect("waiter task");

        // Listeners created after the fact see the state immediately.
        let mut late = shutdown.listener();
        assert!(late.is_shutting_down());
        timeout(Duration::from_secs(2), late.wait_for_shutdown())
            .await
            .expect("already-triggered wait returns at once");
    }

    #[tokio::test]
    async fn dropping_the_owner_counts_as_shutdown() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();
        drop(shutdown);

        timeout(Duration::from_secs(2), listener.wait_for_shutdown())
            .await
            .expect("closed channel unblocks waiters");
    }

    #[tokio::test]
    async fn guards_are_counted() {
        let shutdown = Shutdown::new();
        let listener = shutdown.listener();
        assert_eq!(shutdown.active_tasks(), 0);

        let a = listener.task_guard();
        let b = listener.task_guard();
        assert_eq!(shutdown.active_tasks(), 2);

        drop(a);
        assert_eq!(shutdown.active_tasks(), 1);
        drop(b);
        assert_eq!(shutdown.active_tasks(), 0);
    }

    #[tokio::test]
    async fn trigger_and_wait_blocks_until_guards_release() {
        let shutdown = Shutdown::new();
        let mut listener = shutdown.listener();
        let guard = listener.task_guard();

        // A stand-in for a worker loop: notices the signal, drains for a
        // little while, then releases its guard.
        let drain = tokio::spawn(async move {
            listener.wait_for_shutdown().await;
            tokio::time::sleep(Duration::from_millis(80)).await;
            drop(guard);
        });

        timeout(Duration::from_secs(2), shutdown.trigger_and_wait())
            .await
            .expect("must return once the guard drops");
        assert_eq!(shutdown.active_tasks(), 0);
        drain.await.expect("drain task");
    }
}
