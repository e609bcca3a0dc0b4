//! Scheduled eviction of expired jobs

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Carries out the actual destruction when an entry comes due
///
/// The scheduler keeps no job pointers of its own; it hands (list, id)
/// pairs back to the service. Since destruction times can move after an
/// entry was queued, the callee re-checks the live time and may return a
/// later one, in which case the entry is re-queued instead of fired.
#[async_trait]
pub trait JobDestroyer: Send + Sync {
    async fn destroy_if_due(
        &self,
        job_list: &str,
        job_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    when: DateTime<Utc>,
    job_list: String,
    job_id: String,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.when
            .cmp(&other.when)
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue on destruction time with a background eviction task
pub struct DestructionScheduler {
    heap: Mutex<BinaryHeap<Reverse<Entry>>>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl DestructionScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Queue a job for destruction at `when`
    ///
    /// Entries are never removed eagerly; a stale entry is detected when
    /// it fires, by comparing against the live destruction time.
    pub async fn schedule(
        &self,
        job_list: impl Into<String>,
        job_id: impl Into<String>,
        when: DateTime<Utc>,
    ) {
        let mut heap = self.heap.lock().await;
        heap.push(Reverse(Entry {
            when,
            job_list: job_list.into(),
            job_id: job_id.into(),
        }));
        drop(heap);
        self.notify.notify_one();
    }

    pub async fn pending_count(&self) -> usize {
        self.heap.lock().await.len()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Start the eviction loop
    pub fn start(self: &Arc<Self>, destroyer: Arc<dyn JobDestroyer>) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("Destruction scheduler running");
            loop {
                let next = scheduler.heap.lock().await.peek().map(|Reverse(e)| e.clone());

                let wait = match next {
                    Some(ref entry) => {
                        let now = Utc::now();
                        if entry.when <= now {
                            Duration::ZERO
                        } else {
                            (entry.when - now)
                                .to_std()
                                .unwrap_or(Duration::ZERO)
                        }
                    }
                    // Nothing queued: wait for a schedule() call
                    None => Duration::from_secs(3600),
                };

                if !wait.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = scheduler.notify.notified() => continue,
                        _ = scheduler.shutdown.cancelled() => {
                            info!("Destruction scheduler stopped");
                            return;
                        }
                    }
                    continue;
                }

                // Head is due; pop and fire it
                let entry = {
                    let mut heap = scheduler.heap.lock().await;
                    match heap.pop() {
                        Some(Reverse(entry)) => entry,
                        None => continue,
                    }
                };

                if let Some(later) = destroyer
                    .destroy_if_due(&entry.job_list, &entry.job_id, entry.when)
                    .await
                {
                    debug!(
                        "Destruction of job {} postponed to {}",
                        entry.job_id,
                        later.to_rfc3339()
                    );
                    scheduler
                        .schedule(entry.job_list, entry.job_id, later)
                        .await;
                }

                if scheduler.shutdown.is_cancelled() {
                    info!("Destruction scheduler stopped");
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingDestroyer {
        destroyed: AsyncMutex<Vec<String>>,
        fired: AtomicUsize,
        postpone_once: AsyncMutex<Option<DateTime<Utc>>>,
    }

    impl RecordingDestroyer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                destroyed: AsyncMutex::new(Vec::new()),
                fired: AtomicUsize::new(0),
                postpone_once: AsyncMutex::new(None),
            })
        }
    }

    #[async_trait]
    impl JobDestroyer for RecordingDestroyer {
        async fn destroy_if_due(
            &self,
            _job_list: &str,
            job_id: &str,
            _scheduled_for: DateTime<Utc>,
        ) -> Option<DateTime<Utc>> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            if let Some(later) = self.postpone_once.lock().await.take() {
                return Some(later);
            }
            self.destroyed.lock().await.push(job_id.to_string());
            None
        }
    }

    #[tokio::test]
    async fn test_due_entries_fire_in_time_order() {
        let scheduler = DestructionScheduler::new();
        let destroyer = RecordingDestroyer::new();
        scheduler.start(destroyer.clone());

        let now = Utc::now();
        scheduler
            .schedule("async", "late", now + chrono::Duration::milliseconds(120))
            .await;
        scheduler
            .schedule("async", "early", now + chrono::Duration::milliseconds(40))
            .await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        let destroyed = destroyer.destroyed.lock().await.clone();
        assert_eq!(destroyed, vec!["early".to_string(), "late".to_string()]);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_postponed_entry_requeues() {
        let scheduler = DestructionScheduler::new();
        let destroyer = RecordingDestroyer::new();
        *destroyer.postpone_once.lock().await =
            Some(Utc::now() + chrono::Duration::milliseconds(80));
        scheduler.start(destroyer.clone());

        scheduler
            .schedule("async", "moved", Utc::now() + chrono::Duration::milliseconds(20))
            .await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        // Fired twice: once postponed, once destroyed
        assert_eq!(destroyer.fired.load(Ordering::SeqCst), 2);
        let destroyed = destroyer.destroyed.lock().await.clone();
        assert_eq!(destroyed, vec!["moved".to_string()]);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_past_time_fires_immediately() {
        let scheduler = DestructionScheduler::new();
        let destroyer = RecordingDestroyer::new();
        scheduler.start(destroyer.clone());

        scheduler
            .schedule("async", "overdue", Utc::now() - chrono::Duration::seconds(5))
            .await;

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(destroyer.destroyed.lock().await.len(), 1);
        scheduler.stop();
    }
}
