use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A named long-running unit of work.
#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;

    /// Runs until done or until `shutdown` fires. Not restarted when it returns.
    async fn run(&self, shutdown: CancellationToken);

    /// Called once during [`Scheduler::stop`], after `run` has returned.
    async fn stop(&self) {}
}

/// Runs registered tasks concurrently under one shared cancellation signal.
pub struct Scheduler {
    tasks: Mutex<BTreeMap<String, Arc<dyn Task>>>,
    handles: Mutex<Vec<(String, JoinHandle<()>)>>,
    shutdown: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            handles: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Adds `task`; a task already registered under the same name is replaced.
    pub async fn register(&self, task: Arc<dyn Task>) {
        let name = task.name().to_string();
        if self.tasks.lock().await.insert(name.clone(), task).is_some() {
            tracing::warn!(task = %name, "task re-registered, previous registration replaced");
        } else {
            tracing::info!(task = %name, "task registered");
        }
    }

    /// Spawns every registered task. Subsequent calls are no-ops.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("scheduler already started");
            return;
        }
        let tasks = self.tasks.lock().await;
        let mut handles = self.handles.lock().await;
        for (name, task) in tasks.iter() {
            let task = Arc::clone(task);
            let token = self.shutdown.clone();
            tracing::info!(task = %name, "starting task");
            handles.push((name.clone(), tokio::spawn(async move { task.run(token).await })));
        }
    }

    /// Cancels all tasks, waits for them to return, then calls each stop hook.
    /// Only the first call does anything.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        let (names, joins): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (name, res) in names.iter().zip(join_all(joins).await) {
            match res {
                Ok(()) => tracing::info!(task = %name, "task exited"),
                Err(e) => tracing::error!(task = %name, error = %e, "task aborted"),
            }
        }

        let tasks: Vec<_> = self.tasks.lock().await.values().cloned().collect();
        for task in tasks {
            task.stop().await;
        }
        tracing::info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Ticker {
        name: &'static str,
        ticks: AtomicUsize,
        stops: AtomicUsize,
    }

    impl Ticker {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                ticks: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Task for Ticker {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(&self, shutdown: CancellationToken) {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = interval.tick() => { self.ticks.fetch_add(1, Ordering::SeqCst); }
                }
            }
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_tasks_until_stop() {
        let scheduler = Scheduler::new();
        let a = Ticker::new("a");
        let b = Ticker::new("b");
        scheduler.register(a.clone()).await;
        scheduler.register(b.clone()).await;

        scheduler.start().await;
        tokio::time::sleep(Duration::from_millis(3500)).await;
        scheduler.stop().await;

        assert!(a.ticks.load(Ordering::SeqCst) >= 3);
        assert!(b.ticks.load(Ordering::SeqCst) >= 3);
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let scheduler = Scheduler::new();
        let a = Ticker::new("a");
        scheduler.register(a.clone()).await;
        scheduler.start().await;

        scheduler.stop().await;
        scheduler.stop().await;
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_overwrites_by_name() {
        let scheduler = Scheduler::new();
        let first = Ticker::new("sync");
        let second = Ticker::new("sync");
        scheduler.register(first.clone()).await;
        scheduler.register(second.clone()).await;

        assert_eq!(scheduler.tasks.lock().await.len(), 1);
        scheduler.start().await;
        scheduler.stop().await;

        assert_eq!(first.stops.load(Ordering::SeqCst), 0);
        assert_eq!(second.stops.load(Ordering::SeqCst), 1);
    }
}
