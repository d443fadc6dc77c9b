//! Multi-channel poller (spec.md §4.4 "Scheduler / Multi-Channel Poller").
//!
//! Aggregates every consuming channel of a transport behind one fair-share
//! cursor, the way amiquip's own `io_loop` module multiplexes all channels
//! of a connection over a single event loop (see `io_loop_handle.rs`) —
//! except here what is multiplexed is backend queue readiness rather than
//! AMQP wire frames, and `Transport::drain_events` drives the cursor with
//! direct, non-blocking backend pulls instead of OS-level readiness
//! notifications. A backend wanting true asynchronous wakeups registers
//! its own event source outside this crate and feeds `drain_events` at
//! whatever cadence that source produces.

use indexmap::IndexSet;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// One (channel, queue) pair currently eligible for a round-robin pull.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Candidate {
    pub channel_id: u16,
    pub queue: String,
}

/// The multi-channel poller (spec.md §4.4).
pub struct Scheduler {
    /// Fair-share cursor across all active (channel, queue) pairs
    /// (spec.md §4.4 `queue_cycle`).
    queue_cycle: VecDeque<Candidate>,
    known: IndexSet<Candidate>,

    last_restore: Instant,
    last_health_check: Instant,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        let now = Instant::now();
        Scheduler {
            queue_cycle: VecDeque::new(),
            known: IndexSet::new(),
            last_restore: now,
            last_health_check: now,
        }
    }

    /// Reconcile the cycle's membership for one channel against its
    /// current active-queue set (spec.md §4.4 `on_poll_start`: "for every
    /// channel with at least one active PULL queue... register").
    pub fn sync_active_queues(&mut self, channel_id: u16, active: &IndexSet<String>) {
        self.known.retain(|c| {
            let keep = c.channel_id != channel_id || active.contains(&c.queue);
            if !keep {
                self.queue_cycle.retain(|q| q != c);
            }
            keep
        });
        for queue in active {
            let candidate = Candidate {
                channel_id,
                queue: queue.clone(),
            };
            if self.known.insert(candidate.clone()) {
                self.queue_cycle.push_back(candidate);
            }
        }
    }

    pub fn remove_channel(&mut self, channel_id: u16) {
        self.known.retain(|c| c.channel_id != channel_id);
        self.queue_cycle.retain(|c| c.channel_id != channel_id);
    }

    /// Pop the next fair-share candidate. Caller must call
    /// `requeue(candidate)` after handling it to keep the cycle rotating
    /// (spec.md §4.4 "Rotates the queue cycle past the queue just served").
    pub fn next_candidate(&mut self) -> Option<Candidate> {
        self.queue_cycle.pop_front()
    }

    pub fn requeue(&mut self, candidate: Candidate) {
        if self.known.contains(&candidate) {
            self.queue_cycle.push_back(candidate);
        }
    }

    pub fn active_len(&self) -> usize {
        self.queue_cycle.len()
    }

    /// spec.md §4.4 `maybe_restore_messages`: fixed cadence, default 10s
    /// (the caller supplies the interval so it can come from
    /// `TransportOptions` rather than being hardcoded here).
    pub fn should_restore(&mut self, now: Instant, interval: Duration) -> bool {
        if now.duration_since(self.last_restore) >= interval {
            self.last_restore = now;
            true
        } else {
            false
        }
    }

    /// spec.md §4.4 `maybe_check_subclient_health`: configurable cadence,
    /// default 25s.
    pub fn should_health_check(&mut self, now: Instant, interval: Duration) -> bool {
        if now.duration_since(self.last_health_check) >= interval {
            self.last_health_check = now;
            true
        } else {
            false
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn set(items: &[&str]) -> IndexSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn fair_share_round_robins_across_queues() {
        let mut sched = Scheduler::new();
        sched.sync_active_queues(1, &set(&["A", "B", "C"]));
        let mut order = Vec::new();
        for _ in 0..9 {
            let c = sched.next_candidate().unwrap();
            order.push(c.queue.clone());
            sched.requeue(c);
        }
        let mut counts = HashMap::new();
        for q in &order {
            *counts.entry(q.clone()).or_insert(0) += 1;
        }
        for q in ["A", "B", "C"] {
            assert_eq!(*counts.get(q).unwrap(), 3);
        }
    }

    #[test]
    fn sync_removes_queues_no_longer_active() {
        let mut sched = Scheduler::new();
        sched.sync_active_queues(1, &set(&["A", "B"]));
        sched.sync_active_queues(1, &set(&["A"]));
        assert_eq!(sched.active_len(), 1);
        let c = sched.next_candidate().unwrap();
        assert_eq!(c.queue, "A");
    }

    #[test]
    fn restore_cadence_fires_once_per_interval() {
        let mut sched = Scheduler::new();
        let t0 = Instant::now();
        assert!(!sched.should_restore(t0, Duration::from_secs(10)));
        let t1 = t0 + Duration::from_secs(11);
        assert!(sched.should_restore(t1, Duration::from_secs(10)));
        assert!(!sched.should_restore(t1, Duration::from_secs(10)));
    }
}
