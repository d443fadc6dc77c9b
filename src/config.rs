//! Transport-level configuration knobs (spec.md §6 "Configuration").

use std::time::Duration;

/// How a message body is carried across the wire envelope (spec.md §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyEncoding {
    /// Body bytes are written as-is; only valid for UTF-8-safe payloads.
    Raw,
    /// Body bytes are base64-wrapped; `content_encoding` is set to `"base64"`.
    Base64,
}

impl Default for BodyEncoding {
    fn default() -> Self {
        BodyEncoding::Base64
    }
}

/// End to re-insert a requeued/restored message at, within its destination
/// queue. `amiquip`'s `Queue` exposes ack/nack/reject as simple booleans;
/// the virtual engine needs the extra axis because, unlike a real broker,
/// it owns the queue storage itself (see SPEC_FULL.md §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequeueEnd {
    Head,
    Tail,
}

impl Default for RequeueEnd {
    fn default() -> Self {
        RequeueEnd::Tail
    }
}

/// Per-transport configuration (spec.md §6).
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// Fallback poll interval for backends without async readiness.
    pub polling_interval: Duration,
    /// How long a delivery may stay un-acked before the scheduler restores it.
    pub visibility_timeout: Duration,
    /// Default per-channel prefetch; 0 means unlimited.
    pub prefetch_count: u32,
    /// How message bodies are carried on the wire.
    pub body_encoding: BodyEncoding,
    /// Ascending priority levels a queue's buckets clamp onto.
    pub priority_steps: Vec<u8>,
    /// Whether the core should emulate acks for backends lacking them.
    pub ack_emulation: bool,
    /// Prefix applied to fanout routing-table keys for prefix-oriented backends.
    pub fanout_prefix: Option<String>,
    /// Explicit fanout routing patterns for backends that need them precomputed.
    pub fanout_patterns: Vec<String>,
    /// Prefix prepended to every key a backend writes.
    pub global_keyprefix: String,
    /// Where a requeued/rejected/restored message re-enters its queue.
    pub requeue_at: RequeueEnd,
    /// Cap on how many entries a single `restore_visible` sweep processes.
    /// `None` means unlimited (SPEC_FULL.md §3, `unacked_restore_limit`).
    pub restore_limit: Option<usize>,
    /// Cadence for the scheduler's subscribe-connection health check.
    pub health_check_interval: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            polling_interval: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(3600),
            prefetch_count: 1,
            body_encoding: BodyEncoding::Base64,
            priority_steps: vec![0, 3, 6, 9],
            ack_emulation: true,
            fanout_prefix: None,
            fanout_patterns: Vec::new(),
            global_keyprefix: String::new(),
            requeue_at: RequeueEnd::Tail,
            restore_limit: None,
            health_check_interval: Duration::from_secs(25),
        }
    }
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn polling_interval(mut self, d: Duration) -> Self {
        self.polling_interval = d;
        self
    }

    pub fn visibility_timeout(mut self, d: Duration) -> Self {
        self.visibility_timeout = d;
        self
    }

    pub fn prefetch_count(mut self, count: u32) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn body_encoding(mut self, enc: BodyEncoding) -> Self {
        self.body_encoding = enc;
        self
    }

    pub fn priority_steps(mut self, steps: Vec<u8>) -> Self {
        assert!(!steps.is_empty(), "priority_steps must not be empty");
        self.priority_steps = steps;
        self
    }

    pub fn global_keyprefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.global_keyprefix = prefix.into();
        self
    }

    pub fn requeue_at(mut self, end: RequeueEnd) -> Self {
        self.requeue_at = end;
        self
    }

    pub fn restore_limit(mut self, limit: Option<usize>) -> Self {
        self.restore_limit = limit;
        self
    }

    /// Clamp a requested priority down to the nearest configured step
    /// (spec.md §3: "Priorities outside the configured range are clamped
    /// to the nearest valid step").
    pub fn clamp_priority(&self, requested: u8) -> u8 {
        let steps = &self.priority_steps;
        debug_assert!(!steps.is_empty());
        *steps
            .iter()
            .min_by_key(|&&step| (i32::from(step) - i32::from(requested)).abs())
            .unwrap_or(&0)
    }
}
