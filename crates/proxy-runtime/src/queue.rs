use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use proxy_core::ProxyError;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout as tokio_timeout;
use uuid::Uuid;

/// Request type tag (C6 data model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    Message,
    Embedding,
}

#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub admitted: u64,
    pub timed_out: u64,
    pub rejected_cleared: u64,
    pub queue_full: u64,
    pub total_wait_ms: u64,
    pub total_process_ms: u64,
    pub completed: u64,
}

struct Pending {
    id: String,
    priority: i64,
    enqueued_at: std::time::Instant,
    admit_tx: oneshot::Sender<()>,
}

struct State {
    running: usize,
    pending: VecDeque<Pending>,
    paused: bool,
    metrics: QueueMetrics,
    max_concurrent: usize,
    max_queue_size: usize,
}

/// Sorts pending by priority descending, pops the head, increments running,
/// and signals admission — as long as capacity allows and the queue is not
/// paused. Self-contained on `State` so both the explicit `complete()` path
/// and the `Drop`-based release path can call it without a `RequestQueue`
/// reference.
fn try_admit_locked(state: &mut State) {
    if state.paused {
        return;
    }
    while state.running < state.max_concurrent {
        let Some(next_idx) = state
            .pending
            .iter()
            .enumerate()
            .max_by_key(|(_, p)| p.priority)
            .map(|(i, _)| i)
        else {
            break;
        };
        let next = state.pending.remove(next_idx).unwrap();
        let wait_ms = next.enqueued_at.elapsed().as_millis() as u64;
        state.running += 1;
        state.metrics.admitted += 1;
        state.metrics.total_wait_ms += wait_ms;
        // A dropped receiver (the caller already timed out) is not an
        // error here; the slot was claimed and is released through the
        // normal complete/drop path regardless.
        let _ = next.admit_tx.send(());
    }
}

/// Bounded concurrency gate with priority, timeout, pause/resume, and
/// metrics (C6). Every `enqueue` resolves to exactly one of {admitted,
/// timed out, rejected-by-clear, queue-full-rejected} — spec.md §8
/// invariant #1.
pub struct RequestQueue {
    state: Arc<Mutex<State>>,
    enabled: bool,
    item_timeout: Duration,
}

/// Held by the caller for the lifetime of an admitted request. Releasing it
/// (explicitly via `complete()`, or implicitly on drop) frees the
/// concurrency slot and admits the next eligible pending item.
pub struct QueueSlot {
    id: String,
    state: Arc<Mutex<State>>,
    started_at: std::time::Instant,
    completed: bool,
}

impl QueueSlot {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn complete(mut self) {
        self.completed = true;
        let process_ms = self.started_at.elapsed().as_millis() as u64;
        let mut state = self.state.lock().await;
        release_locked(&mut state, process_ms);
    }
}

fn release_locked(state: &mut State, process_ms: u64) {
    state.running = state.running.saturating_sub(1);
    state.metrics.total_process_ms += process_ms;
    state.metrics.completed += 1;
    try_admit_locked(state);
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // A slot dropped without an explicit `complete()` (e.g. an early
        // return via `?` in the orchestrator) must still release its
        // concurrency; the decrement itself needs the async mutex, so it is
        // spawned rather than blocking the dropping task.
        let state = self.state.clone();
        let process_ms = self.started_at.elapsed().as_millis() as u64;
        tokio::spawn(async move {
            let mut state = state.lock().await;
            release_locked(&mut state, process_ms);
        });
    }
}

impl RequestQueue {
    pub fn new(enabled: bool, max_concurrent: usize, max_queue_size: usize, item_timeout: Duration) -> Self {
        RequestQueue {
            state: Arc::new(Mutex::new(State {
                running: 0,
                pending: VecDeque::new(),
                paused: false,
                metrics: QueueMetrics::default(),
                max_concurrent,
                max_queue_size,
            })),
            enabled,
            item_timeout,
        }
    }

    /// Enqueues a request and waits for admission (or rejection/timeout).
    /// If the queue is disabled, admits immediately with a fresh id.
    pub async fn enqueue(&self, priority: i64) -> Result<QueueSlot, ProxyError> {
        if !self.enabled {
            let mut state = self.state.lock().await;
            state.running += 1;
            state.metrics.admitted += 1;
            return Ok(QueueSlot {
                id: Uuid::new_v4().to_string(),
                state: self.state.clone(),
                started_at: std::time::Instant::now(),
                completed: false,
            });
        }

        let (admit_tx, admit_rx) = oneshot::channel();
        let id = Uuid::new_v4().to_string();

        {
            let mut state = self.state.lock().await;
            if state.pending.len() >= state.max_queue_size {
                state.metrics.queue_full += 1;
                return Err(ProxyError::QueueFull("request queue is at capacity".into()));
            }
            state.pending.push_back(Pending {
                id: id.clone(),
                priority,
                enqueued_at: std::time::Instant::now(),
                admit_tx,
            });
            try_admit_locked(&mut state);
        }

        match tokio_timeout(self.item_timeout, admit_rx).await {
            Ok(Ok(())) => Ok(QueueSlot {
                id,
                state: self.state.clone(),
                started_at: std::time::Instant::now(),
                completed: false,
            }),
            Ok(Err(_)) => Err(ProxyError::QueueFull("request was cleared from the queue".into())),
            Err(_) => {
                let mut state = self.state.lock().await;
                state.pending.retain(|p| p.id != id);
                state.metrics.timed_out += 1;
                Err(ProxyError::QueueFull("timed out waiting in queue".into()))
            }
        }
    }

    /// Decrements running and admits the next eligible pending item.
    pub async fn complete(&self, slot: QueueSlot) {
        slot.complete().await;
    }

    /// Pauses admission; already-running requests are unaffected, but no
    /// new pending item is admitted until `resume`.
    pub async fn pause(&self) {
        self.state.lock().await.paused = true;
    }

    pub async fn resume(&self) {
        let mut state = self.state.lock().await;
        state.paused = false;
        try_admit_locked(&mut state);
    }

    /// Rejects every pending item with a clear-triggered error.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        let cleared = std::mem::take(&mut state.pending);
        state.metrics.rejected_cleared += cleared.len() as u64;
        // dropping each `admit_tx` signals `Err` to the waiting receiver
        drop(cleared);
    }

    pub async fn metrics(&self) -> QueueMetrics {
        self.state.lock().await.metrics.clone()
    }

    pub async fn running(&self) -> usize {
        self.state.lock().await.running
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_queue_admits_immediately() {
        let queue = RequestQueue::new(false, 1, 10, Duration::from_secs(1));
        let slot = queue.enqueue(0).await.unwrap();
        assert_eq!(queue.running().await, 1);
        queue.complete(slot).await;
        assert_eq!(queue.running().await, 0);
    }

    #[tokio::test]
    async fn running_never_exceeds_max_concurrent() {
        let queue = Arc::new(RequestQueue::new(true, 2, 10, Duration::from_secs(5)));
        let s1 = queue.enqueue(0).await.unwrap();
        let s2 = queue.enqueue(0).await.unwrap();
        assert_eq!(queue.running().await, 2);

        let q2 = queue.clone();
        let waiter = tokio::spawn(async move { q2.enqueue(0).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.pending_len().await, 1);

        queue.complete(s1).await;
        let s3 = waiter.await.unwrap().unwrap();
        assert_eq!(queue.running().await, 2);
        queue.complete(s2).await;
        queue.complete(s3).await;
        assert_eq!(queue.running().await, 0);
    }

    #[tokio::test]
    async fn queue_full_is_rejected_with_typed_error() {
        let queue = Arc::new(RequestQueue::new(true, 1, 1, Duration::from_secs(5)));
        let _slot = queue.enqueue(0).await.unwrap();
        let q2 = queue.clone();
        let _pending_waiter = tokio::spawn(async move { q2.enqueue(0).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = queue.enqueue(0).await.unwrap_err();
        assert!(matches!(err, ProxyError::QueueFull(_)));
    }

    #[tokio::test]
    async fn higher_priority_admitted_first() {
        let queue = Arc::new(RequestQueue::new(true, 1, 10, Duration::from_secs(5)));
        let s1 = queue.enqueue(0).await.unwrap();

        let q_low = queue.clone();
        let low = tokio::spawn(async move { q_low.enqueue(1).await });
        let q_high = queue.clone();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let high = tokio::spawn(async move { q_high.enqueue(5).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.complete(s1).await;
        let high_slot = high.await.unwrap().unwrap();
        assert_eq!(queue.running().await, 1);
        queue.complete(high_slot).await;
        let low_slot = low.await.unwrap().unwrap();
        queue.complete(low_slot).await;
    }

    #[tokio::test]
    async fn item_times_out_when_never_admitted() {
        let queue = RequestQueue::new(true, 0, 10, Duration::from_millis(30));
        let err = queue.enqueue(0).await.unwrap_err();
        assert!(matches!(err, ProxyError::QueueFull(_)));
        assert_eq!(queue.metrics().await.timed_out, 1);
    }

    #[tokio::test]
    async fn clear_rejects_all_pending() {
        let queue = Arc::new(RequestQueue::new(true, 0, 10, Duration::from_secs(5)));
        let q2 = queue.clone();
        let waiter = tokio::spawn(async move { q2.enqueue(0).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.clear().await;
        assert!(waiter.await.unwrap().is_err());
    }
}
