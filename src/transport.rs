//! The top-level transport object (spec.md §4 overview, §4.4 "Transport
//! owns the Scheduler and the set of open Channels").
//!
//! Mirrors the role amiquip's own `Connection` plays relative to its
//! `Channel`s and `IoLoop`: one shared backend connection, one shared
//! broker registry, many channels multiplexed by a single poller.

use crate::backend::Backend;
use crate::broker_state::BrokerState;
use crate::channel::{Channel, SharedBackend};
use crate::config::TransportOptions;
use crate::error::{Error, Result};
use crate::scheduler::Scheduler;
use indexmap::IndexMap;
use log::{debug, warn};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Grace period an auto-delete queue survives after its last consumer
/// cancels (spec.md §4.2: "design default 3 seconds").
const AUTO_DELETE_GRACE: Duration = Duration::from_secs(3);

/// Owns the backend connection, the shared broker registry, every open
/// `Channel`, and the `Scheduler` that fans delivery across them
/// (spec.md §4 "Transport").
pub struct Transport {
    state: BrokerState,
    backend: SharedBackend,
    options: Arc<TransportOptions>,
    channels: IndexMap<u16, Channel>,
    scheduler: Scheduler,
    next_channel_id: u16,
}

impl Transport {
    pub fn new(backend: Box<dyn Backend>) -> Result<Transport> {
        Transport::with_options(backend, TransportOptions::default())
    }

    pub fn with_options(backend: Box<dyn Backend>, options: TransportOptions) -> Result<Transport> {
        Ok(Transport {
            state: BrokerState::new(),
            backend: Arc::new(Mutex::new(backend)),
            options: Arc::new(options),
            channels: IndexMap::new(),
            scheduler: Scheduler::new(),
            next_channel_id: 0,
        })
    }

    /// spec.md §4 `open_channel`: allocate the next channel id and create
    /// a fresh `Channel` sharing this transport's backend and broker state.
    pub fn open_channel(&mut self) -> Result<u16> {
        self.next_channel_id += 1;
        let id = self.next_channel_id;
        let channel = Channel::new(id, self.state.clone(), Arc::clone(&self.backend), Arc::clone(&self.options));
        self.channels.insert(id, channel);
        debug!("transport: opened channel {}", id);
        Ok(id)
    }

    pub fn channel(&mut self, id: u16) -> Result<&mut Channel> {
        self.channels.get_mut(&id).ok_or_else(|| Error::ChannelError {
            reason: format!("no such channel: {}", id),
        })
    }

    /// spec.md §4.2 `close`, invoked per channel, plus scheduler cleanup.
    pub fn close_channel(&mut self, id: u16) -> Result<()> {
        if let Some(mut channel) = self.channels.shift_remove(&id) {
            channel.close()?;
        }
        self.scheduler.remove_channel(id);
        Ok(())
    }

    pub fn channel_ids(&self) -> Vec<u16> {
        self.channels.keys().copied().collect()
    }

    /// spec.md §9 Open Question, resolved in SPEC_FULL.md: `global = true`
    /// broadcasts the new prefetch to every channel on the transport;
    /// `global = false` affects only the addressed channel.
    pub fn basic_qos(&mut self, id: u16, prefetch_count: u32, global: bool) -> Result<()> {
        if global {
            for channel in self.channels.values_mut() {
                channel.basic_qos(prefetch_count);
            }
            Ok(())
        } else {
            self.channel(id)?.basic_qos(prefetch_count);
            Ok(())
        }
    }

    /// spec.md §4.4 "the multi-channel poller": reconciles each channel's
    /// active-consumer queues into the fair-share cycle, then rotates
    /// through it dispatching one record per queue per pass until a full
    /// pass makes no progress or `timeout` elapses, and finally runs the
    /// periodic restore/health-check/auto-delete maintenance. Returns the
    /// number of messages dispatched to consumer callbacks this call.
    pub fn drain_events(&mut self, timeout: Option<Duration>) -> Result<usize> {
        for (&id, channel) in &self.channels {
            self.scheduler.sync_active_queues(id, &channel.active_queues());
        }

        let deadline = timeout.map(|d| Instant::now() + d);
        let mut delivered = 0usize;

        // Keep rotating full passes over the active-queue cycle until one
        // entire pass makes no progress (every queue is either empty or
        // gated by its channel's prefetch) or the deadline is hit — the
        // fair-share rotation itself (spec.md §4.4) happens within each pass.
        loop {
            let pass_len = self.scheduler.active_len();
            if pass_len == 0 {
                break;
            }
            let mut progressed = false;
            for _ in 0..pass_len {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return Ok(delivered);
                    }
                }
                let candidate = match self.scheduler.next_candidate() {
                    Some(c) => c,
                    None => break,
                };
                if let Some(channel) = self.channels.get_mut(&candidate.channel_id) {
                    if channel.qos_can_consume() && channel.deliver_ready(&candidate.queue)? {
                        delivered += 1;
                        progressed = true;
                    }
                }
                self.scheduler.requeue(candidate);
            }
            if !progressed {
                break;
            }
        }

        let now = Instant::now();
        if self.scheduler.should_restore(now, self.options.polling_interval) {
            self.restore_all(now);
        }
        if self.scheduler.should_health_check(now, self.options.health_check_interval) {
            self.check_backend_health();
        }
        self.expire_auto_delete(now);

        Ok(delivered)
    }

    /// spec.md §4.4 `maybe_restore_messages`: sweep every channel's QoS
    /// manager for visibility-expired deliveries.
    fn restore_all(&mut self, now: Instant) {
        for channel in self.channels.values_mut() {
            let backend = channel.backend();
            let mut guard = backend.lock().unwrap();
            channel
                .qos_mut()
                .restore_visible(now, &mut **guard, self.options.requeue_at, self.options.restore_limit);
        }
    }

    /// spec.md §4.4 `maybe_check_subclient_health`: best-effort ping, only
    /// when the backend declares the `ping` capability.
    fn check_backend_health(&mut self) {
        let mut guard = self.backend.lock().unwrap();
        if guard.capabilities().ping {
            if let Err(e) = guard.ping() {
                warn!("backend health check failed: {}", e);
            }
        }
    }

    fn expire_auto_delete(&mut self, now: Instant) {
        for channel in self.channels.values_mut() {
            match channel.expire_auto_delete_queues(now, AUTO_DELETE_GRACE) {
                Ok(expired) => {
                    for queue in expired {
                        debug!("transport: auto-deleted queue {:?}", queue);
                    }
                }
                Err(e) => warn!("auto-delete sweep failed: {}", e),
            }
        }
    }
}
