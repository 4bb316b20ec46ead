//! The background worker fabric: a set of cooperating periodic tasks
//! (deposit watcher, stream tick/stale-reaper, escrow auto-release,
//! negotiation deadline sweep, rate-limiter idle cleanup, ...) each run on
//! their own `tokio::time::interval`, racing a shared shutdown signal --
//! the same shape as the teacher's `WatcherManager::run` racing a
//! `JoinSet` against an `mpsc` shutdown receiver. A panicking task is
//! caught (`tokio::spawn` + `JoinHandle` join error) and logged rather than
//! taking the whole process down; a failing (but non-panicking) tick is
//! just a `warn!` and the loop continues at its next interval.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

pub type TickFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send>> + Send + Sync>;

pub struct PeriodicTask {
    pub name: &'static str,
    pub interval: Duration,
    pub run_once: bool,
    pub tick: TickFn,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration, tick: TickFn) -> Self {
        PeriodicTask {
            name,
            interval,
            run_once: false,
            tick,
        }
    }
}

pub struct Scheduler {
    tasks: Vec<PeriodicTask>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { tasks: Vec::new() }
    }

    pub fn register(&mut self, task: PeriodicTask) {
        self.tasks.push(task);
    }

    /// Runs every registered task until `shutdown` fires, then waits up to
    /// `SHUTDOWN_DRAIN` for in-flight ticks to finish before returning.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut set: JoinSet<()> = JoinSet::new();
        for task in self.tasks {
            let mut task_shutdown = shutdown.resubscribe();
            set.spawn(async move {
                run_task(task, &mut task_shutdown).await;
            });
        }
        let _ = shutdown.recv().await;
        info!("scheduler received shutdown signal, draining tasks");
        let drain = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            while set.join_next().await.is_some() {}
        });
        if drain.await.is_err() {
            warn!("scheduler drain timed out, abandoning remaining tasks");
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_task(task: PeriodicTask, shutdown: &mut broadcast::Receiver<()>) {
    info!(task = task.name, "starting periodic task");
    if task.run_once {
        if let Err(e) = (task.tick)().await {
            warn!(task = task.name, error = %e, "initial tick failed");
        }
    }
    let mut interval = tokio::time::interval(task.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(task = task.name, "stopping periodic task");
                break;
            }
            _ = interval.tick() => {
                let result = std::panic::AssertUnwindSafe((task.tick)()).catch_unwind().await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(task = task.name, error = %e, "tick failed"),
                    Err(_) => error!(task = task.name, "tick panicked, recovered by scheduler"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn task_ticks_until_shutdown() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = broadcast::channel(1);
        let mut scheduler = Scheduler::new();
        let counter_clone = counter.clone();
        scheduler.register(PeriodicTask::new(
            "counter",
            Duration::from_millis(10),
            Arc::new(move || {
                let counter = counter_clone.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        ));
        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(55)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn panicking_tick_does_not_kill_scheduler() {
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = broadcast::channel(1);
        let mut scheduler = Scheduler::new();
        let counter_clone = counter.clone();
        scheduler.register(PeriodicTask::new(
            "flaky",
            Duration::from_millis(10),
            Arc::new(move || {
                let counter = counter_clone.clone();
                Box::pin(async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        panic!("boom");
                    }
                    Ok(())
                })
            }),
        ));
        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(55)).await;
        tx.send(()).unwrap();
        handle.await.unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 2);
    }
}
