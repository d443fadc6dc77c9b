//! Per-channel outstanding-message tracker (spec.md §4.3 "QoS Manager").

use crate::backend::Backend;
use crate::config::{RequeueEnd, TransportOptions};
use crate::error::{Error, Result};
use crate::message::{DeliveryTag, Message};
use indexmap::IndexMap;
use log::{debug, error};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

/// `Unacked Index` entry (spec.md §3).
#[derive(Clone, Debug)]
pub struct UnackedEntry {
    pub serialized: String,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub deadline: Instant,
}

#[derive(Eq, PartialEq)]
struct DeadlineEntry {
    deadline: Instant,
    tag: DeliveryTag,
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline)
    }
}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-channel QoS state (spec.md §4.3).
pub struct QosManager {
    prefetch_count: u32,
    outstanding: IndexMap<DeliveryTag, UnackedEntry>,
    // Min-heap over deadlines; `Reverse` turns the max-heap BinaryHeap
    // into a min-heap so the earliest deadline pops first.
    deadline_index: BinaryHeap<Reverse<DeadlineEntry>>,
}

impl QosManager {
    pub fn new(prefetch_count: u32) -> QosManager {
        QosManager {
            prefetch_count,
            outstanding: IndexMap::new(),
            deadline_index: BinaryHeap::new(),
        }
    }

    pub fn set_prefetch_count(&mut self, count: u32) {
        self.prefetch_count = count;
    }

    pub fn prefetch_count(&self) -> u32 {
        self.prefetch_count
    }

    /// spec.md §4.3: `prefetch_count == 0 ∨ |outstanding| < prefetch_count`.
    pub fn can_consume(&self) -> bool {
        self.prefetch_count == 0 || (self.outstanding.len() as u32) < self.prefetch_count
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, tag: DeliveryTag) -> bool {
        self.outstanding.contains_key(&tag)
    }

    /// Enroll a freshly delivered message (spec.md §4.3 `append`).
    pub fn append(&mut self, tag: DeliveryTag, entry: UnackedEntry) {
        let deadline = entry.deadline;
        self.outstanding.insert(tag, entry);
        self.deadline_index.push(Reverse(DeadlineEntry { deadline, tag }));
    }

    /// spec.md §4.3 `ack`.
    pub fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        match self.outstanding.shift_remove(&tag) {
            Some(_) => Ok(()),
            None => {
                error!("ack of unknown delivery tag {:?}", tag);
                Err(Error::InconsistentState {
                    reason: format!("ack of unknown delivery tag {:?}", tag),
                })
            }
        }
    }

    /// spec.md §4.3 `reject`: remove the entry; if `requeue`, re-put the
    /// serialized message into its original queue at the configured end.
    pub fn reject(
        &mut self,
        tag: DeliveryTag,
        requeue: bool,
        backend: &mut dyn Backend,
        requeue_at: RequeueEnd,
    ) -> Result<()> {
        let entry = self.outstanding.shift_remove(&tag).ok_or_else(|| Error::InconsistentState {
            reason: format!("reject of unknown delivery tag {:?}", tag),
        })?;
        if requeue {
            requeue_entry(backend, &entry, requeue_at)?;
        }
        Ok(())
    }

    /// spec.md §4.2 `basic_nack(tag, multiple, requeue)`: when `multiple`
    /// is set, rejects not just `tag` but every entry still outstanding
    /// that was delivered no later than it, oldest first. Delivery tags
    /// are opaque, so "no later than" is tracked by `outstanding`'s
    /// insertion order rather than by comparing tag values.
    pub fn reject_multiple(
        &mut self,
        tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
        backend: &mut dyn Backend,
        requeue_at: RequeueEnd,
    ) -> Result<()> {
        if !multiple {
            return self.reject(tag, requeue, backend, requeue_at);
        }
        let idx = self.outstanding.get_index_of(&tag).ok_or_else(|| Error::InconsistentState {
            reason: format!("nack of unknown delivery tag {:?}", tag),
        })?;
        let tags: Vec<DeliveryTag> = self.outstanding.keys().take(idx + 1).copied().collect();
        for t in tags {
            let entry = self
                .outstanding
                .shift_remove(&t)
                .expect("tag was just read from outstanding");
            if requeue {
                requeue_entry(backend, &entry, requeue_at)?;
            }
        }
        Ok(())
    }

    /// spec.md §4.3 `restore_visible`: restore every entry whose deadline
    /// has passed, marking it redelivered. Capped by `limit`
    /// (SPEC_FULL.md §3 `unacked_restore_limit`) to bound per-tick work.
    pub fn restore_visible(&mut self, now: Instant, backend: &mut dyn Backend, requeue_at: RequeueEnd, limit: Option<usize>) -> usize {
        let mut restored = 0;
        loop {
            if let Some(cap) = limit {
                if restored >= cap {
                    break;
                }
            }
            let due = match self.deadline_index.peek() {
                Some(Reverse(top)) if top.deadline <= now => true,
                _ => false,
            };
            if !due {
                break;
            }
            let Reverse(top) = self.deadline_index.pop().unwrap();
            // The entry may already be gone (acked/rejected since this
            // heap slot was pushed, or a stale duplicate from a prior
            // requeue) — abandon silently, matching the original's
            // watch-fails-so-abandon behavior (SPEC_FULL.md §3).
            let entry = match self.outstanding.get(&top.tag) {
                Some(e) if e.deadline == top.deadline => self.outstanding.shift_remove(&top.tag).unwrap(),
                _ => continue,
            };
            if let Err(e) = requeue_entry(backend, &entry, requeue_at) {
                error!("failed to restore delivery tag {:?}: {}", top.tag, e);
                continue;
            }
            restored += 1;
        }
        if restored > 0 {
            debug!("restored {} visibility-expired deliveries", restored);
        }
        restored
    }

    /// spec.md §4.3 `restore_unacked_once`: called on channel close,
    /// restores everything outstanding, in original delivery order.
    pub fn restore_unacked_once(&mut self, backend: &mut dyn Backend, requeue_at: RequeueEnd) -> usize {
        let mut restored = 0;
        let entries: Vec<(DeliveryTag, UnackedEntry)> = self.outstanding.drain(..).collect();
        self.deadline_index.clear();
        for (tag, entry) in entries {
            if let Err(e) = requeue_entry(backend, &entry, requeue_at) {
                error!("failed to restore delivery tag {:?} on close: {}", tag, e);
                continue;
            }
            restored += 1;
        }
        restored
    }

    pub fn new_deadline(options: &TransportOptions, now: Instant) -> Instant {
        now + options.visibility_timeout
    }
}

fn requeue_entry(backend: &mut dyn Backend, entry: &UnackedEntry, requeue_at: RequeueEnd) -> Result<()> {
    let mut msg = Message::from_json(&entry.serialized)?;
    msg.mark_redelivered();
    let payload = msg.to_json()?;
    // The core's virtual queues are FIFO via append-only backend storage;
    // "head" is modeled by backends that support it natively. Our `put`
    // contract does not expose a head-insert, so both ends currently
    // resolve to the backend's own `put` — backends wanting true
    // head-of-queue requeue implement it inside `put` based on a
    // convention of their choosing. This is recorded as an open decision
    // in DESIGN.md.
    let _ = requeue_at;
    backend.put(&entry.queue, &payload, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use std::time::Duration;

    fn entry(queue: &str, deadline: Instant) -> UnackedEntry {
        UnackedEntry {
            serialized: Message::from_json(r#"{"body":"x","headers":{},"properties":{}}"#).unwrap().to_json().unwrap(),
            exchange: "".into(),
            routing_key: queue.into(),
            queue: queue.into(),
            deadline,
        }
    }

    #[test]
    fn can_consume_respects_prefetch() {
        let mut qos = QosManager::new(2);
        assert!(qos.can_consume());
        qos.append(DeliveryTag::new(), entry("Q", Instant::now()));
        assert!(qos.can_consume());
        qos.append(DeliveryTag::new(), entry("Q", Instant::now()));
        assert!(!qos.can_consume());
    }

    #[test]
    fn zero_prefetch_is_unlimited() {
        let mut qos = QosManager::new(0);
        for _ in 0..100 {
            qos.append(DeliveryTag::new(), entry("Q", Instant::now()));
        }
        assert!(qos.can_consume());
    }

    #[test]
    fn ack_unknown_tag_is_inconsistent_state_not_fatal() {
        let mut qos = QosManager::new(1);
        let err = qos.ack(DeliveryTag::new()).unwrap_err();
        assert!(matches!(err, Error::InconsistentState { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn nack_multiple_rejects_everything_delivered_up_to_the_given_tag() {
        let mut qos = QosManager::new(0);
        let mut backend = MemoryBackend::new();
        backend.declare_queue("Q");
        let now = Instant::now();
        let t1 = DeliveryTag::new();
        let t2 = DeliveryTag::new();
        let t3 = DeliveryTag::new();
        qos.append(t1, entry("Q", now + Duration::from_secs(3600)));
        qos.append(t2, entry("Q", now + Duration::from_secs(3600)));
        qos.append(t3, entry("Q", now + Duration::from_secs(3600)));

        qos.reject_multiple(t2, true, true, &mut backend, RequeueEnd::Tail).unwrap();

        assert!(!qos.is_outstanding(t1));
        assert!(!qos.is_outstanding(t2));
        assert!(qos.is_outstanding(t3));
        assert_eq!(backend.size("Q").unwrap(), 2);
    }

    #[test]
    fn nack_without_multiple_only_rejects_the_given_tag() {
        let mut qos = QosManager::new(0);
        let mut backend = MemoryBackend::new();
        backend.declare_queue("Q");
        let now = Instant::now();
        let t1 = DeliveryTag::new();
        let t2 = DeliveryTag::new();
        qos.append(t1, entry("Q", now + Duration::from_secs(3600)));
        qos.append(t2, entry("Q", now + Duration::from_secs(3600)));

        qos.reject_multiple(t2, false, true, &mut backend, RequeueEnd::Tail).unwrap();

        assert!(qos.is_outstanding(t1));
        assert!(!qos.is_outstanding(t2));
    }

    #[test]
    fn restore_visible_requeues_only_expired_entries() {
        let mut qos = QosManager::new(0);
        let mut backend = MemoryBackend::new();
        backend.declare_queue("Q");
        let now = Instant::now();
        let expired = DeliveryTag::new();
        let fresh = DeliveryTag::new();
        qos.append(expired, entry("Q", now - Duration::from_secs(1)));
        qos.append(fresh, entry("Q", now + Duration::from_secs(3600)));

        let restored = qos.restore_visible(now, &mut backend, RequeueEnd::Tail, None);
        assert_eq!(restored, 1);
        assert!(qos.is_outstanding(fresh));
        assert!(!qos.is_outstanding(expired));
        assert_eq!(backend.size("Q").unwrap(), 1);
    }

    #[test]
    fn restore_unacked_once_restores_everything_in_order() {
        let mut qos = QosManager::new(0);
        let mut backend = MemoryBackend::new();
        backend.declare_queue("Q");
        let now = Instant::now();
        for _ in 0..3 {
            qos.append(DeliveryTag::new(), entry("Q", now + Duration::from_secs(3600)));
        }
        let restored = qos.restore_unacked_once(&mut backend, RequeueEnd::Tail);
        assert_eq!(restored, 3);
        assert_eq!(qos.outstanding_count(), 0);
        assert_eq!(backend.size("Q").unwrap(), 3);
    }
}
