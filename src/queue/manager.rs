//! Batch Queue Manager (§4.4): one bounded FIFO per data type, flushed by
//! size, age, or hard cap.
//!
//! Generalizes the donor's `signals::storage::SignalStorage` bounded
//! `VecDeque` idiom (there: one fixed-capacity ring buffer) into a
//! per-data-type map of FIFOs with age-based flush triggers and a
//! maintenance loop, as distinct from a ring buffer that silently
//! overwrites — this queue backpressures instead of dropping.

use crate::metrics;
use crate::model::{table_spec, DataType, Record};
use crate::queue::writer::TierWriter;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, instrument};

/// Fired once the record's enclosing batch has been durably resolved
/// (written, or permanently dropped as poison). Used by the Bus Subscriber
/// in ack-after-flush mode; in ack-on-enqueue mode no signal is attached.
pub type AckSignal = oneshot::Sender<()>;

struct Entry {
    record: Record,
    ack: Option<AckSignal>,
}

struct TypeQueue {
    entries: VecDeque<Entry>,
    /// Reset to "now" whenever the queue transitions from empty to non-empty.
    first_enqueue: Option<chrono::DateTime<Utc>>,
    flush_in_flight: bool,
    max_queue: usize,
}

impl TypeQueue {
    fn new(max_queue: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            first_enqueue: None,
            flush_in_flight: false,
            max_queue,
        }
    }

    fn should_flush(&self, batch_size: usize, timeout: Duration) -> bool {
        if self.flush_in_flight {
            return false;
        }
        if self.entries.len() >= self.max_queue {
            return true;
        }
        if self.entries.len() >= batch_size {
            return true;
        }
        if let Some(first) = self.first_enqueue {
            if !self.entries.is_empty() && Utc::now() - first >= chrono::Duration::from_std(timeout).unwrap() {
                return true;
            }
        }
        false
    }
}

/// Per-type state plus the maintenance loop that evaluates flush triggers
/// every `tick_interval` (default 500ms) and also opportunistically on
/// enqueue.
pub struct BatchQueueManager {
    queues: HashMap<DataType, Mutex<TypeQueue>>,
    writer: Arc<TierWriter>,
    tick_interval: Duration,
    notify: Notify,
    shutdown: AtomicBool,
}

impl BatchQueueManager {
    pub fn new(writer: Arc<TierWriter>) -> Arc<Self> {
        let mut queues = HashMap::new();
        for data_type in DataType::ALL {
            let spec = table_spec(data_type);
            queues.insert(data_type, Mutex::new(TypeQueue::new(spec.batch.max_queue)));
        }

        Arc::new(Self {
            queues,
            writer,
            tick_interval: Duration::from_millis(500),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Enqueues `record` with no flush-completion signal (ack-on-enqueue
    /// callers ack as soon as this returns).
    pub async fn enqueue(self: &Arc<Self>, record: Record) {
        self.enqueue_with_ack(record, None).await
    }

    /// Enqueues `record`, optionally attaching `ack`, fired once the batch
    /// this record ends up in has been durably resolved. Blocks (suspends)
    /// when the type's queue is at hard cap until room frees up — the
    /// engine never drops records as a backpressure response.
    #[instrument(skip(self, record, ack), fields(data_type = ?record.data_type()))]
    pub async fn enqueue_with_ack(self: &Arc<Self>, record: Record, ack: Option<AckSignal>) {
        let data_type = record.data_type();
        let mut entry = Some(Entry { record, ack });
        loop {
            {
                let mut q = self.queues[&data_type].lock();
                if q.entries.len() < q.max_queue {
                    if q.entries.is_empty() {
                        q.first_enqueue = Some(Utc::now());
                    }
                    q.entries.push_back(entry.take().unwrap());
                    metrics::set_queue_depth(data_type.table_name(), q.entries.len() as f64);
                    break;
                }
            }
            // Hard cap reached: suspend until the maintenance loop or a
            // concurrent flush drains room. This is the only durable
            // backpressure point in the pipeline (spec §5).
            self.notify.notified().await;
        }
        self.maybe_flush(data_type).await;
    }

    /// Evaluated every tick and also opportunistically right after enqueue.
    async fn maybe_flush(self: &Arc<Self>, data_type: DataType) {
        let spec = table_spec(data_type);
        let should = {
            let q = self.queues[&data_type].lock();
            q.should_flush(spec.batch.batch_size, spec.batch.timeout)
        };
        if should {
            self.spawn_flush(data_type);
        }
    }

    /// Schedules a flush as an independent task so maintenance-loop latency
    /// stays bounded; at most one flush per type is in flight at a time.
    fn spawn_flush(self: &Arc<Self>, data_type: DataType) {
        {
            let mut q = self.queues[&data_type].lock();
            if q.flush_in_flight {
                return;
            }
            q.flush_in_flight = true;
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.flush_now(data_type).await;
        });
    }

    #[instrument(skip(self), fields(data_type = %data_type.table_name()))]
    async fn flush_now(self: &Arc<Self>, data_type: DataType) {
        let spec = table_spec(data_type);
        let drained: Vec<Entry> = {
            let mut q = self.queues[&data_type].lock();
            let n = spec.batch.batch_size.min(q.entries.len());
            q.entries.drain(..n).collect()
        };

        if drained.is_empty() {
            let mut q = self.queues[&data_type].lock();
            q.flush_in_flight = false;
            return;
        }

        let records: Vec<Record> = drained.iter().map(|e| e.record.clone()).collect();

        let start = std::time::Instant::now();
        let result = self.writer.write(data_type, records).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::record_flush_latency(data_type.table_name(), elapsed_ms);

        let mut q = self.queues[&data_type].lock();
        match result {
            Ok(written) => {
                debug!(written, "flush succeeded");
                // Either written or permanently dropped as poison: in both
                // cases the batch is durably resolved, so ack-after-flush
                // consumers can ack now.
                for entry in drained {
                    if let Some(ack) = entry.ack {
                        let _ = ack.send(());
                    }
                }
                if q.entries.is_empty() {
                    q.first_enqueue = None;
                } else {
                    q.first_enqueue = Some(Utc::now());
                }
            }
            Err(e) => {
                // Whole-batch retry budget exhausted: requeue at the head
                // so order is preserved for the next attempt. Ack handles
                // travel with their records, so nothing is acked yet.
                for entry in drained.into_iter().rev() {
                    q.entries.push_front(entry);
                }
                metrics::record_error(data_type.table_name(), "flush_failed");
                info!(error = %e, "flush failed; batch requeued");
            }
        }
        q.flush_in_flight = false;
        metrics::set_queue_depth(data_type.table_name(), q.entries.len() as f64);
        drop(q);
        self.notify.notify_waiters();
    }

    pub fn queue_depth(&self, data_type: DataType) -> usize {
        self.queues[&data_type].lock().entries.len()
    }

    pub fn total_depth(&self) -> usize {
        DataType::ALL.iter().map(|dt| self.queue_depth(*dt)).sum()
    }

    /// Runs forever until `shutdown` is requested, evaluating every type's
    /// flush trigger on a fixed tick.
    pub async fn run_maintenance_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            ticker.tick().await;
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            for data_type in DataType::ALL {
                self.maybe_flush(data_type).await;
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Best-effort flush of every non-empty queue, used during the
    /// shutdown grace period to avoid losing still-enqueued data. Returns
    /// the number of records still queued (neither flushed nor acked)
    /// after the attempt, for the shutdown report.
    pub async fn flush_all_best_effort(self: &Arc<Self>) -> usize {
        let mut remaining = 0;
        for data_type in DataType::ALL {
            self.flush_now(data_type).await;
            remaining += self.queue_depth(data_type);
        }
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_queue_never_flushes() {
        let q = TypeQueue::new(10);
        assert!(!q.should_flush(5, Duration::from_secs(1)));
    }

    #[test]
    fn hard_cap_boundary() {
        let mut q = TypeQueue::new(3);
        for _ in 0..2 {
            q.entries.push_back(Entry {
                record: dummy_record(),
                ack: None,
            });
        }
        assert_eq!(q.entries.len(), 2);
        assert!(q.entries.len() < q.max_queue);
    }

    fn dummy_record() -> Record {
        use crate::model::{Envelope, MarketType, Payload, Trade};
        use rust_decimal::Decimal;
        Record {
            envelope: Envelope {
                exchange: "binance".into(),
                market_type: MarketType::Spot,
                symbol: "BTCUSDT".into(),
                timestamp: Utc::now(),
            },
            payload: Payload::Trade(Trade {
                trade_id: "1".into(),
                price: Decimal::new(1, 0),
                quantity: Decimal::new(1, 0),
                side: "buy".into(),
                is_maker: None,
            }),
            enqueued_at: Utc::now(),
        }
    }
}
