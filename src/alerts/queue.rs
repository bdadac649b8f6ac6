//! In-process FIFO alert queue with subscriber fan-out.
//!
//! Notifications are not durable: a restart loses whatever was pending.
//! Consumers treat delivery as best-effort.

use super::types::Notification;
use crate::telemetry::{EventPayload, TelemetryHub};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Message delivered to queue subscribers on every push.
#[derive(Debug, Clone)]
pub enum AlertEvent {
    Available { notification: Notification },
}

struct QueueInner {
    pending: VecDeque<Notification>,
    subscribers: Vec<mpsc::UnboundedSender<AlertEvent>>,
}

pub struct AlertQueue {
    inner: Mutex<QueueInner>,
    telemetry: Arc<TelemetryHub>,
    /// Optional bound; oldest entries are dropped on overflow.
    capacity: Option<usize>,
}

impl AlertQueue {
    pub fn new(telemetry: Arc<TelemetryHub>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                subscribers: Vec::new(),
            }),
            telemetry,
            capacity: None,
        })
    }

    pub fn with_capacity(telemetry: Arc<TelemetryHub>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                subscribers: Vec::new(),
            }),
            telemetry,
            capacity: Some(capacity),
        })
    }

    /// Enqueue and notify every live subscriber. Subscribers whose receiver
    /// is gone are pruned here — termination doubles as unsubscription.
    pub fn push(&self, notification: Notification) {
        let dropped_len = {
            let mut inner = self.inner.lock();
            let mut dropped = None;
            if let Some(cap) = self.capacity {
                if inner.pending.len() >= cap {
                    inner.pending.pop_front();
                    dropped = Some(inner.pending.len());
                }
            }
            inner.pending.push_back(notification.clone());
            inner.subscribers.retain(|tx| {
                tx.send(AlertEvent::Available {
                    notification: notification.clone(),
                })
                .is_ok()
            });
            dropped
        };

        if let Some(queue_len) = dropped_len {
            self.telemetry
                .emit(None, EventPayload::AlertDropped { queue_len });
        }
        self.telemetry
            .emit(None, EventPayload::AlertFired { notification });
    }

    /// Atomic drain in FIFO order.
    pub fn take_all(&self) -> Vec<Notification> {
        self.inner.lock().pending.drain(..).collect()
    }

    pub fn pending(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<AlertEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::types::{NotificationBuilder, Severity};

    fn notification(anomaly_type: &str) -> Notification {
        NotificationBuilder::new("runtime", anomaly_type)
            .severity(Severity::Warning)
            .build()
    }

    #[tokio::test]
    async fn take_all_returns_pushes_in_fifo_order() {
        let queue = AlertQueue::new(TelemetryHub::new());
        let a = notification("memory_a");
        let b = notification("memory_b");
        let c = notification("memory_c");
        queue.push(a.clone());
        queue.push(b.clone());
        queue.push(c.clone());

        let drained = queue.take_all();
        assert_eq!(
            drained.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
            vec![a.id.as_str(), b.id.as_str(), c.id.as_str()]
        );
        assert!(!queue.pending());
        assert_eq!(queue.count(), 0);
        assert!(queue.take_all().is_empty());
    }

    #[tokio::test]
    async fn every_live_subscriber_sees_every_push() {
        let queue = AlertQueue::new(TelemetryHub::new());
        let mut rx1 = queue.subscribe();
        let mut rx2 = queue.subscribe();

        let n = notification("memory_high");
        queue.push(n.clone());

        for rx in [&mut rx1, &mut rx2] {
            let AlertEvent::Available { notification } = rx.recv().await.unwrap();
            assert_eq!(notification.id, n.id);
        }
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned_on_push() {
        let queue = AlertQueue::new(TelemetryHub::new());
        let rx = queue.subscribe();
        drop(rx);
        queue.push(notification("memory_high"));
        assert_eq!(queue.inner.lock().subscribers.len(), 0);
    }

    #[tokio::test]
    async fn bounded_queue_drops_oldest_on_overflow() {
        let queue = AlertQueue::with_capacity(TelemetryHub::new(), 2);
        let a = notification("a_1");
        queue.push(a.clone());
        queue.push(notification("b_1"));
        queue.push(notification("c_1"));

        let drained = queue.take_all();
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|n| n.id != a.id));
    }
}
