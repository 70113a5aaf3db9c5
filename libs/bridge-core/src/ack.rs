//! Read-acknowledgment coalescing.
//!
//! UI layers emit "mark as read" signals far more often than the upstream
//! needs to hear about them (scroll, focus, visibility all fire for the
//! same read position). Calls for one resource inside a debounce window
//! merge into a single write; a per-resource watermark suppresses writes
//! that would not advance anything.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::error::BridgeError;

/// One caller's contribution to a read acknowledgment.
#[derive(Debug, Clone, Default)]
pub struct AckUpdate {
    /// Highest message id the caller has read.
    pub last_ack_id: Option<i64>,
    /// When the caller last looked at the resource.
    pub seen_at: Option<DateTime<Utc>>,
    /// Explicit message ids to acknowledge, bypassing the watermark guard.
    pub id_set: Option<Vec<i64>>,
}

/// The merged batch flushed as a single write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AckBatch {
    pub last_ack_id: i64,
    pub seen_at: Option<DateTime<Utc>>,
    pub id_set: BTreeSet<i64>,
}

impl AckBatch {
    /// Merge rule: id = max, timestamp = most recent, id-set = union.
    fn merge(&mut self, update: &AckUpdate) {
        if let Some(id) = update.last_ack_id {
            self.last_ack_id = self.last_ack_id.max(id);
        }
        if let Some(seen) = update.seen_at {
            self.seen_at = Some(match self.seen_at {
                Some(current) if current >= seen => current,
                _ => seen,
            });
        }
        if let Some(ids) = &update.id_set {
            self.id_set.extend(ids.iter().copied());
        }
    }
}

/// Result of an acknowledged window: either the upstream response, or a
/// no-op marker when the watermark made the write redundant.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Written(Value),
    Skipped,
}

/// A write failure shared by every caller of the failed window. The
/// local watermark is not advanced, so a later call can retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct AckWriteError(pub Arc<BridgeError>);

/// The final write seam — the HTTP gateway in production, a recorder in
/// tests.
#[async_trait]
pub trait AckWriter: Send + Sync {
    async fn write(&self, resource_id: i64, batch: &AckBatch) -> crate::error::Result<Value>;
}

#[derive(Default)]
struct PendingWindow {
    batch: AckBatch,
    generation: u64,
    waiters: Vec<oneshot::Sender<Result<AckOutcome, AckWriteError>>>,
}

struct Inner {
    writer: Arc<dyn AckWriter>,
    debounce: Duration,
    watermarks: Mutex<HashMap<i64, i64>>,
    pending: Mutex<HashMap<i64, PendingWindow>>,
    write_locks: DashMap<i64, Arc<AsyncMutex<()>>>,
}

/// Per-resource debounced, idempotent write-merging queue.
#[derive(Clone)]
pub struct AckCoalescer {
    inner: Arc<Inner>,
}

impl AckCoalescer {
    pub fn new(writer: Arc<dyn AckWriter>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                writer,
                debounce,
                watermarks: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                write_locks: DashMap::new(),
            }),
        }
    }

    /// Record a read position. Calls within the debounce window merge
    /// into one batch and share the single write's result. Returns
    /// [`AckOutcome::Skipped`] immediately when the update cannot advance
    /// the watermark and carries no explicit id set.
    pub async fn mark_read(
        &self,
        resource_id: i64,
        update: AckUpdate,
    ) -> Result<AckOutcome, AckWriteError> {
        let next_id = update.last_ack_id.unwrap_or(0);
        let has_ids = update.id_set.as_ref().is_some_and(|ids| !ids.is_empty());
        if !has_ids && next_id > 0 && next_id <= self.watermark(resource_id) {
            return Ok(AckOutcome::Skipped);
        }

        let rx = {
            let mut pending = self.inner.pending.lock();
            let window = pending.entry(resource_id).or_default();
            window.batch.merge(&update);
            window.generation += 1;
            let generation = window.generation;

            let (tx, rx) = oneshot::channel();
            window.waiters.push(tx);

            // Start (or extend) the debounce window. Only the newest
            // timer generation flushes; superseded timers are no-ops.
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(this.inner.debounce).await;
                this.flush_if_current(resource_id, generation).await;
            });

            rx
        };

        rx.await.unwrap_or_else(|_| {
            Err(AckWriteError(Arc::new(BridgeError::ack_write(
                "acknowledgment window dropped before flush",
            ))))
        })
    }

    /// Highest acknowledged id for a resource.
    pub fn watermark(&self, resource_id: i64) -> i64 {
        self.inner
            .watermarks
            .lock()
            .get(&resource_id)
            .copied()
            .unwrap_or(0)
    }

    async fn flush_if_current(&self, resource_id: i64, generation: u64) {
        let window = {
            let mut pending = self.inner.pending.lock();
            match pending.get(&resource_id) {
                Some(current) if current.generation == generation => pending.remove(&resource_id),
                _ => None, // A newer call extended the window.
            }
        };
        let Some(window) = window else { return };

        // Flush-time guard: the watermark may have advanced while this
        // window was accumulating.
        if window.batch.id_set.is_empty() && window.batch.last_ack_id <= self.watermark(resource_id)
        {
            for waiter in window.waiters {
                let _ = waiter.send(Ok(AckOutcome::Skipped));
            }
            return;
        }

        // Writes for one resource are strictly sequential.
        let lock = self
            .inner
            .write_locks
            .entry(resource_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _write_guard = lock.lock().await;

        match self.inner.writer.write(resource_id, &window.batch).await {
            Ok(value) => {
                if window.batch.last_ack_id > 0 {
                    self.advance_watermark(resource_id, window.batch.last_ack_id);
                }
                for waiter in window.waiters {
                    let _ = waiter.send(Ok(AckOutcome::Written(value.clone())));
                }
            }
            Err(err) => {
                tracing::debug!(resource_id, error = %err, "acknowledgment write failed");
                let shared = AckWriteError(Arc::new(err));
                for waiter in window.waiters {
                    let _ = waiter.send(Err(shared.clone()));
                }
            }
        }
    }

    fn advance_watermark(&self, resource_id: i64, id: i64) {
        let mut watermarks = self.inner.watermarks.lock();
        let current = watermarks.entry(resource_id).or_insert(0);
        if id > *current {
            *current = id;
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP-backed writer
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    last_read_message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    message_ids: &'a BTreeSet<i64>,
}

/// Flushes batches as `PUT {base}/chats/{id}/read` through the gateway.
pub struct HttpAckWriter {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAckWriter {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { http, base_url }
    }
}

#[async_trait]
impl AckWriter for HttpAckWriter {
    async fn write(&self, resource_id: i64, batch: &AckBatch) -> crate::error::Result<Value> {
        let body = ReadBody {
            last_read_message_id: (batch.last_ack_id > 0).then_some(batch.last_ack_id),
            last_seen_at: batch.seen_at,
            message_ids: &batch.id_set,
        };

        let response = self
            .http
            .put(format!("{}/chats/{resource_id}/read", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::ack_write(format!(
                "upstream rejected read acknowledgment with {status}"
            )));
        }

        Ok(response.json().await.unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct RecordingWriter {
        calls: Mutex<Vec<(i64, AckBatch)>>,
        fail_next: AtomicBool,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        write_delay: Option<Duration>,
    }

    #[async_trait]
    impl AckWriter for RecordingWriter {
        async fn write(&self, resource_id: i64, batch: &AckBatch) -> crate::error::Result<Value> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.calls.lock().push((resource_id, batch.clone()));
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(BridgeError::ack_write("injected failure"));
            }
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    fn coalescer(writer: Arc<RecordingWriter>) -> AckCoalescer {
        AckCoalescer::new(writer, Duration::from_millis(250))
    }

    fn update(last_ack_id: i64) -> AckUpdate {
        AckUpdate {
            last_ack_id: Some(last_ack_id),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_produces_one_write_with_max_id() {
        let writer = Arc::new(RecordingWriter::default());
        let acks = coalescer(writer.clone());

        let mut handles = Vec::new();
        for id in [3, 5, 4, 5, 7] {
            let acks = acks.clone();
            handles.push(tokio::spawn(
                async move { acks.mark_read(1, update(id)).await },
            ));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap().unwrap());
        }

        let calls = writer.calls.lock();
        assert_eq!(calls.len(), 1, "five calls coalesced into one write");
        assert_eq!(calls[0].1.last_ack_id, 7);

        // Every caller in the window observed the same written result.
        for outcome in outcomes {
            assert_eq!(outcome, AckOutcome::Written(serde_json::json!({ "ok": true })));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_ack_of_same_position_is_a_no_op() {
        let writer = Arc::new(RecordingWriter::default());
        let acks = coalescer(writer.clone());

        let first = acks.mark_read(1, update(5)).await.unwrap();
        assert!(matches!(first, AckOutcome::Written(_)));
        assert_eq!(acks.watermark(1), 5);

        let second = acks.mark_read(1, update(5)).await.unwrap();
        assert_eq!(second, AckOutcome::Skipped);
        assert_eq!(writer.calls.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn merge_takes_latest_timestamp_and_id_union() {
        let writer = Arc::new(RecordingWriter::default());
        let acks = coalescer(writer.clone());

        let earlier = Utc::now() - chrono::Duration::seconds(30);
        let later = Utc::now();

        let a = acks.clone();
        let first = tokio::spawn(async move {
            a.mark_read(
                1,
                AckUpdate {
                    last_ack_id: Some(2),
                    seen_at: Some(later),
                    id_set: Some(vec![1, 2]),
                },
            )
            .await
        });
        let b = acks.clone();
        let second = tokio::spawn(async move {
            b.mark_read(
                1,
                AckUpdate {
                    last_ack_id: Some(1),
                    seen_at: Some(earlier),
                    id_set: Some(vec![2, 3]),
                },
            )
            .await
        });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let calls = writer.calls.lock();
        assert_eq!(calls.len(), 1);
        let batch = &calls[0].1;
        assert_eq!(batch.last_ack_id, 2);
        assert_eq!(batch.seen_at, Some(later));
        assert_eq!(batch.id_set, BTreeSet::from([1, 2, 3]));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_rejects_all_waiters_and_keeps_watermark() {
        let writer = Arc::new(RecordingWriter::default());
        writer.fail_next.store(true, Ordering::SeqCst);
        let acks = coalescer(writer.clone());

        let a = acks.clone();
        let first = tokio::spawn(async move { a.mark_read(1, update(9)).await });
        let b = acks.clone();
        let second = tokio::spawn(async move { b.mark_read(1, update(8)).await });

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
        assert_eq!(acks.watermark(1), 0, "failure must not advance watermark");

        // The same position can be retried and now succeeds.
        let retry = acks.mark_read(1, update(9)).await.unwrap();
        assert!(matches!(retry, AckOutcome::Written(_)));
        assert_eq!(acks.watermark(1), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_id_set_bypasses_watermark_guard() {
        let writer = Arc::new(RecordingWriter::default());
        let acks = coalescer(writer.clone());

        acks.mark_read(1, update(7)).await.unwrap();
        assert_eq!(writer.calls.lock().len(), 1);

        let outcome = acks
            .mark_read(
                1,
                AckUpdate {
                    last_ack_id: Some(5),
                    seen_at: None,
                    id_set: Some(vec![2]),
                },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, AckOutcome::Written(_)));
        assert_eq!(writer.calls.lock().len(), 2);
        // Watermark never decreases.
        assert_eq!(acks.watermark(1), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_for_one_resource_are_sequential() {
        let writer = Arc::new(RecordingWriter {
            write_delay: Some(Duration::from_secs(1)),
            ..Default::default()
        });
        let acks = coalescer(writer.clone());

        let a = acks.clone();
        let first = tokio::spawn(async move { a.mark_read(1, update(1)).await });
        // Let the first window flush and its (slow) write begin.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let b = acks.clone();
        let second = tokio::spawn(async move { b.mark_read(1, update(2)).await });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(writer.calls.lock().len(), 2);
        assert_eq!(writer.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_resources_do_not_share_windows() {
        let writer = Arc::new(RecordingWriter::default());
        let acks = coalescer(writer.clone());

        let a = acks.clone();
        let first = tokio::spawn(async move { a.mark_read(1, update(4)).await });
        let b = acks.clone();
        let second = tokio::spawn(async move { b.mark_read(2, update(6)).await });

        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        assert_eq!(writer.calls.lock().len(), 2);
        assert_eq!(acks.watermark(1), 4);
        assert_eq!(acks.watermark(2), 6);
    }
}
