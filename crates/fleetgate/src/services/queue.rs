//! Bounded priority queue buffering requests when no candidate has free
//! capacity.
//!
//! The queue is passive: enqueuers receive a oneshot ticket that resolves
//! when the item is released (or fails with queue-full, queue-timeout, or
//! queue-closed), and the orchestrator's pump drives [`RequestQueue::tick`]
//! and [`RequestQueue::release_ready`] as capacity frees up.
//!
//! Ordering: higher priority first, FIFO within equal priority, and a
//! pause/resume cycle never reorders waiting items.

use crate::models::error::OrchestratorError;
use crate::models::settings::QueueSettings;
use crate::services::upstream::EndpointKind;
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::oneshot;

/// Introspection view of one queued item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItemView {
    pub id: u64,
    pub model: String,
    pub endpoint: EndpointKind,
    pub priority: i32,
    pub base_priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub waited_ms: u64,
    pub bypass: bool,
}

struct QueueItem {
    id: u64,
    model: String,
    endpoint: EndpointKind,
    priority: i32,
    base_priority: i32,
    enqueued_at: DateTime<Utc>,
    enqueued_instant: Instant,
    bypass: bool,
    waker: oneshot::Sender<Result<(), OrchestratorError>>,
}

impl QueueItem {
    fn view(&self) -> QueueItemView {
        QueueItemView {
            id: self.id,
            model: self.model.clone(),
            endpoint: self.endpoint,
            priority: self.priority,
            base_priority: self.base_priority,
            enqueued_at: self.enqueued_at,
            waited_ms: self.enqueued_instant.elapsed().as_millis() as u64,
            bypass: self.bypass,
        }
    }
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub paused: bool,
    pub total_enqueued: u64,
    pub total_released: u64,
    pub total_timed_out: u64,
    pub total_rejected: u64,
}

struct QueueInner {
    items: VecDeque<QueueItem>,
    seq: u64,
    paused: bool,
    accepting: bool,
    last_boost: Instant,
    total_enqueued: u64,
    total_released: u64,
    total_timed_out: u64,
    total_rejected: u64,
}

/// The bounded priority queue.
pub struct RequestQueue {
    settings: QueueSettings,
    inner: Mutex<QueueInner>,
}

impl RequestQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                seq: 0,
                paused: false,
                accepting: true,
                last_boost: Instant::now(),
                total_enqueued: 0,
                total_released: 0,
                total_timed_out: 0,
                total_rejected: 0,
            }),
        }
    }

    /// Admits an item, returning the ticket its awaiter resolves on.
    ///
    /// Fails immediately with [`OrchestratorError::QueueFull`] at capacity
    /// and [`OrchestratorError::QueueClosed`] during shutdown. Enqueues are
    /// admitted while paused; only release is halted.
    pub fn enqueue(
        &self,
        model: &str,
        endpoint: EndpointKind,
        priority: i32,
        bypass: bool,
    ) -> Result<oneshot::Receiver<Result<(), OrchestratorError>>, OrchestratorError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accepting {
            inner.total_rejected += 1;
            return Err(OrchestratorError::QueueClosed);
        }
        if inner.items.len() >= self.settings.max_size {
            inner.total_rejected += 1;
            return Err(OrchestratorError::QueueFull);
        }
        let (tx, rx) = oneshot::channel();
        inner.seq += 1;
        let id = inner.seq;
        inner.items.push_back(QueueItem {
            id,
            model: model.to_string(),
            endpoint,
            priority: priority.min(self.settings.max_priority),
            base_priority: priority,
            enqueued_at: Utc::now(),
            enqueued_instant: Instant::now(),
            bypass,
            waker: tx,
        });
        inner.total_enqueued += 1;
        debug!("queued request {} for model {} (depth {})", id, model, inner.items.len());
        Ok(rx)
    }

    /// Releases the best waiting item whose model the caller can currently
    /// serve. Returns the released view, or `None` when nothing is eligible
    /// or the queue is paused.
    ///
    /// Selection: highest priority, then earliest sequence number.
    pub fn release_ready<F>(&self, can_serve: F) -> Option<QueueItemView>
    where
        F: Fn(&QueueItemView) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.paused {
            return None;
        }
        let mut best: Option<(usize, i32, u64)> = None;
        for (index, item) in inner.items.iter().enumerate() {
            if !can_serve(&item.view()) {
                continue;
            }
            let better = match best {
                None => true,
                Some((_, priority, seq)) => {
                    item.priority > priority || (item.priority == priority && item.id < seq)
                }
            };
            if better {
                best = Some((index, item.priority, item.id));
            }
        }
        let (index, _, _) = best?;
        let item = inner.items.remove(index)?;
        inner.total_released += 1;
        let view = item.view();
        // A dropped receiver means the caller gave up; nothing to do.
        let _ = item.waker.send(Ok(()));
        Some(view)
    }

    /// Periodic maintenance: expires overdue items and applies priority
    /// aging. Meant to be called on the orchestrator pump cadence.
    pub fn tick(&self) {
        let mut inner = self.inner.lock().unwrap();
        let timeout_ms = self.settings.timeout as u128;

        let mut index = 0;
        while index < inner.items.len() {
            if inner.items[index].enqueued_instant.elapsed().as_millis() > timeout_ms {
                if let Some(item) = inner.items.remove(index) {
                    inner.total_timed_out += 1;
                    debug!("queue item {} timed out after {}ms", item.id, self.settings.timeout);
                    let _ = item.waker.send(Err(OrchestratorError::QueueTimeout));
                }
            } else {
                index += 1;
            }
        }

        if inner.last_boost.elapsed().as_millis()
            >= self.settings.priority_boost_interval as u128
        {
            inner.last_boost = Instant::now();
            let boost = self.settings.priority_boost_amount;
            let ceiling = self.settings.max_priority;
            for item in inner.items.iter_mut() {
                item.priority = (item.priority + boost).min(ceiling);
            }
        }
    }

    /// Halts release; enqueues stay admitted up to `max_size`.
    pub fn pause(&self) {
        self.inner.lock().unwrap().paused = true;
    }

    pub fn resume(&self) {
        self.inner.lock().unwrap().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().unwrap().paused
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fails every waiting item and rejects further enqueues. Used on
    /// shutdown.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.accepting = false;
        while let Some(item) = inner.items.pop_front() {
            let _ = item.waker.send(Err(OrchestratorError::QueueClosed));
        }
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats {
            size: inner.items.len(),
            max_size: self.settings.max_size,
            paused: inner.paused,
            total_enqueued: inner.total_enqueued,
            total_released: inner.total_released,
            total_timed_out: inner.total_timed_out,
            total_rejected: inner.total_rejected,
        }
    }

    /// All waiting items, queue order, without mutating queue state.
    pub fn items(&self) -> Vec<QueueItemView> {
        self.inner
            .lock()
            .unwrap()
            .items
            .iter()
            .map(|item| item.view())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(max_size: usize, timeout_ms: u64) -> RequestQueue {
        RequestQueue::new(QueueSettings {
            max_size,
            timeout: timeout_ms,
            priority_boost_interval: 10,
            priority_boost_amount: 1,
            max_priority: 5,
            ..QueueSettings::default()
        })
    }

    #[test]
    fn rejects_when_full() {
        let queue = queue(1, 1000);
        let _ticket = queue.enqueue("m", EndpointKind::Generate, 0, false).unwrap();
        let overflow = queue.enqueue("m", EndpointKind::Generate, 0, false);
        assert!(matches!(overflow, Err(OrchestratorError::QueueFull)));
        assert_eq!(queue.stats().total_rejected, 1);
    }

    #[test]
    fn releases_fifo_within_priority() {
        let queue = queue(10, 1000);
        let _a = queue.enqueue("m", EndpointKind::Generate, 0, false).unwrap();
        let _b = queue.enqueue("m", EndpointKind::Generate, 1, false).unwrap();
        let _c = queue.enqueue("m", EndpointKind::Generate, 1, false).unwrap();

        let first = queue.release_ready(|_| true).unwrap();
        let second = queue.release_ready(|_| true).unwrap();
        let third = queue.release_ready(|_| true).unwrap();
        // Priority 1 items first, in enqueue order; priority 0 last.
        assert_eq!(first.id, 2);
        assert_eq!(second.id, 3);
        assert_eq!(third.id, 1);
    }

    #[test]
    fn pause_resume_preserves_order() {
        let queue = queue(10, 1000);
        let _a = queue.enqueue("m", EndpointKind::Generate, 0, false).unwrap();
        let _b = queue.enqueue("m", EndpointKind::Generate, 0, false).unwrap();
        queue.pause();
        assert!(queue.release_ready(|_| true).is_none());
        queue.resume();
        assert_eq!(queue.release_ready(|_| true).unwrap().id, 1);
        assert_eq!(queue.release_ready(|_| true).unwrap().id, 2);
    }

    #[tokio::test]
    async fn timeout_fails_the_awaiter() {
        let queue = queue(10, 0);
        let ticket = queue.enqueue("m", EndpointKind::Generate, 0, false).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        queue.tick();
        let outcome = ticket.await.unwrap();
        assert!(matches!(outcome, Err(OrchestratorError::QueueTimeout)));
        assert_eq!(queue.stats().total_timed_out, 1);
    }

    #[test]
    fn aging_boosts_up_to_ceiling() {
        let queue = queue(10, 10_000);
        let _a = queue.enqueue("m", EndpointKind::Generate, 4, false).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(15));
        queue.tick();
        let items = queue.items();
        assert_eq!(items[0].priority, 5);
        std::thread::sleep(std::time::Duration::from_millis(15));
        queue.tick();
        assert_eq!(queue.items()[0].priority, 5); // clamped at max
    }
}
