//! Named, individually cancellable timers.
//!
//! Each [`TimerKind`] has at most one pending task. Scheduling a kind that
//! is already pending replaces it. Every task owns a [`CancellationToken`],
//! so teardown is a single [`TaskScheduler::cancel_all`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Reconnect,
    DedupPrune,
    TypingStop,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reconnect => "reconnect",
            Self::DedupPrune => "dedup_prune",
            Self::TypingStop => "typing_stop",
        }
    }
}

struct ScheduledTask {
    seq: u64,
    token: CancellationToken,
}

type TaskTable = Arc<Mutex<HashMap<TimerKind, ScheduledTask>>>;

/// Must be used from within a tokio runtime.
#[derive(Default)]
pub struct TaskScheduler {
    tasks: TaskTable,
    next_seq: AtomicU64,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` once after `delay`, replacing any pending task of `kind`.
    /// The registration is removed before `f` runs.
    pub fn schedule_once<F, Fut>(&self, kind: TimerKind, delay: Duration, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let child = token.clone();
        let tasks = Arc::clone(&self.tasks);

        let mut table = self.tasks.lock();
        if let Some(previous) = table.insert(kind, ScheduledTask { seq, token }) {
            previous.token.cancel();
        }
        trace!(timer = kind.as_str(), delay_ms = delay.as_millis() as u64, "timer scheduled");

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = child.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            {
                let mut table = tasks.lock();
                if table.get(&kind).map(|t| t.seq) != Some(seq) {
                    return;
                }
                table.remove(&kind);
            }
            f().await;
        });
    }

    /// Run `f` every `period` (first run after one period) until cancelled.
    pub fn schedule_every<F>(&self, kind: TimerKind, period: Duration, mut f: F)
    where
        F: FnMut() + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let child = token.clone();

        let mut table = self.tasks.lock();
        if let Some(previous) = table.insert(kind, ScheduledTask { seq, token }) {
            previous.token.cancel();
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    biased;
                    _ = child.cancelled() => return,
                    _ = interval.tick() => f(),
                }
            }
        });
    }

    /// Cancel the pending task of `kind`. Returns whether one was pending.
    pub fn cancel(&self, kind: TimerKind) -> bool {
        match self.tasks.lock().remove(&kind) {
            Some(task) => {
                task.token.cancel();
                trace!(timer = kind.as_str(), "timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel everything. Returns how many tasks were pending.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        for (_, task) in &drained {
            task.token.cancel();
        }
        drained.len()
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.tasks.lock().contains_key(&kind)
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.lock().drain() {
            task.token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let reader = Arc::clone(&count);
        (count, move || reader.load(Ordering::SeqCst))
    }

    #[tokio::test(start_paused = true)]
    async fn once_fires_after_delay() {
        let scheduler = TaskScheduler::new();
        let (count, read) = counter();
        scheduler.schedule_once(TimerKind::Reconnect, Duration::from_secs(2), move || async move {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.is_pending(TimerKind::Reconnect));

        tokio::time::sleep(Duration::from_millis(1_999)).await;
        assert_eq!(read(), 0);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(read(), 1);
        assert!(!scheduler.is_pending(TimerKind::Reconnect));
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_task() {
        let scheduler = TaskScheduler::new();
        let (count, read) = counter();
        for _ in 0..3 {
            let count = Arc::clone(&count);
            scheduler.schedule_once(TimerKind::TypingStop, Duration::from_secs(3), move || async move {
                count.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(read(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_run() {
        let scheduler = TaskScheduler::new();
        let (count, read) = counter();
        scheduler.schedule_once(TimerKind::Reconnect, Duration::from_secs(1), move || async move {
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert!(scheduler.cancel(TimerKind::Reconnect));
        assert!(!scheduler.cancel(TimerKind::Reconnect));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(read(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_runs_until_cancelled() {
        let scheduler = TaskScheduler::new();
        let (count, read) = counter();
        scheduler.schedule_every(TimerKind::DedupPrune, Duration::from_secs(60), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(181)).await;
        assert_eq!(read(), 3);

        scheduler.cancel(TimerKind::DedupPrune);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(read(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_everything() {
        let scheduler = TaskScheduler::new();
        let (count, read) = counter();
        let c1 = Arc::clone(&count);
        scheduler.schedule_once(TimerKind::Reconnect, Duration::from_secs(1), move || async move {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        scheduler.schedule_once(TimerKind::TypingStop, Duration::from_secs(3), move || async move {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.schedule_every(TimerKind::DedupPrune, Duration::from_secs(1), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(scheduler.cancel_all(), 3);
        assert_eq!(scheduler.pending_count(), 0);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(read(), 0);
    }
}
