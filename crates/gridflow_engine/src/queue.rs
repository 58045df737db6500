//! Pipeline queue.
//!
//! One bounded FIFO of `DeviceDataMessage` shared by every worker and the
//! processing pool. Producers never block: past the high-water mark the queue
//! drops and counts. Consumers block on a condition variable with a bounded
//! wait. The critical section strictly covers enqueue/dequeue.

use gridflow_protocol::defaults::{DEFAULT_QUEUE_CAPACITY, QUEUE_HIGH_WATER_RATIO};
use gridflow_protocol::DeviceDataMessage;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

pub struct PipelineQueue {
    inner: Mutex<VecDeque<DeviceDataMessage>>,
    available: Condvar,
    capacity: usize,
    high_water: usize,
    total_received: AtomicU64,
    total_delivered: AtomicU64,
    total_dropped: AtomicU64,
}

/// Counters satisfying `received = delivered + dropped + len`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueStats {
    pub capacity: usize,
    pub high_water: usize,
    pub len: usize,
    pub total_received: u64,
    pub total_delivered: u64,
    pub total_dropped: u64,
}

impl PipelineQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            available: Condvar::new(),
            capacity,
            high_water: ((capacity as f64) * QUEUE_HIGH_WATER_RATIO) as usize,
            total_received: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }

    /// Enqueue one envelope. Returns `false` (and counts the drop) when the
    /// queue is at or above its high-water mark.
    pub fn send_device_data(&self, message: DeviceDataMessage) -> bool {
        self.total_received.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.inner.lock();
        if queue.len() >= self.high_water {
            drop(queue);
            let dropped = self.total_dropped.fetch_add(1, Ordering::Relaxed) + 1;
            crate::metrics::METRICS.messages_dropped.fetch_add(1, Ordering::Relaxed);
            if dropped % 1_000 == 1 {
                warn!(
                    "Pipeline queue above high-water mark ({}), dropping (total dropped: {dropped})",
                    self.high_water
                );
            }
            return false;
        }
        queue.push_back(message);
        drop(queue);
        crate::metrics::METRICS.messages_received.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
        true
    }

    /// Dequeue up to `max_batch` envelopes, blocking up to `timeout` while
    /// empty. Returns an empty batch on timeout or wake-for-shutdown.
    pub fn get_batch(&self, max_batch: usize, timeout: Duration) -> Vec<DeviceDataMessage> {
        let mut queue = self.inner.lock();
        if queue.is_empty() {
            self.available.wait_for(&mut queue, timeout);
        }
        let n = queue.len().min(max_batch.max(1));
        let batch: Vec<DeviceDataMessage> = queue.drain(..n).collect();
        drop(queue);
        self.total_delivered.fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch
    }

    /// Wake all blocked consumers (shutdown path).
    pub fn wake_all(&self) {
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            high_water: self.high_water,
            len: self.len(),
            total_received: self.total_received.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_dropped: self.total_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_protocol::{DeviceId, Protocol, TenantId};

    fn msg() -> DeviceDataMessage {
        DeviceDataMessage::new(
            DeviceId::new(1),
            TenantId::new(1),
            Protocol::ModbusTcp,
            vec![],
            "test",
        )
    }

    #[test]
    fn fifo_order() {
        let queue = PipelineQueue::new(100);
        for i in 0..5 {
            let mut m = msg();
            m.producer_id = format!("p{i}");
            assert!(queue.send_device_data(m));
        }
        let batch = queue.get_batch(3, Duration::from_millis(1));
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].producer_id, "p0");
        assert_eq!(batch[2].producer_id, "p2");
        let rest = queue.get_batch(10, Duration::from_millis(1));
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].producer_id, "p3");
    }

    #[test]
    fn high_water_drops_and_counts() {
        // Capacity 1000 -> high water 900.
        let queue = PipelineQueue::new(1_000);
        let mut accepted = 0;
        for _ in 0..1_200 {
            if queue.send_device_data(msg()) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 900);
        let stats = queue.stats();
        assert_eq!(stats.total_received, 1_200);
        assert!(stats.total_dropped >= 200);
        assert_eq!(stats.len, 900);

        // Still responsive: a consumer drains below high water and sends
        // succeed again.
        let drained = queue.get_batch(500, Duration::from_millis(1));
        assert_eq!(drained.len(), 500);
        assert!(queue.send_device_data(msg()));
    }

    #[test]
    fn conservation_law() {
        let queue = PipelineQueue::new(50);
        for _ in 0..120 {
            queue.send_device_data(msg());
        }
        let _ = queue.get_batch(17, Duration::from_millis(1));
        let stats = queue.stats();
        assert_eq!(
            stats.total_received,
            stats.total_delivered + stats.total_dropped + stats.len as u64
        );
    }

    #[test]
    fn get_batch_times_out_empty() {
        let queue = PipelineQueue::new(10);
        let start = std::time::Instant::now();
        let batch = queue.get_batch(10, Duration::from_millis(20));
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn producer_wakes_blocked_consumer() {
        let queue = std::sync::Arc::new(PipelineQueue::new(10));
        let q2 = std::sync::Arc::clone(&queue);
        let consumer = std::thread::spawn(move || q2.get_batch(10, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        queue.send_device_data(msg());
        let batch = consumer.join().unwrap();
        assert_eq!(batch.len(), 1);
    }
}
