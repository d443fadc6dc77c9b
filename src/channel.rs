//! The channel state machine (spec.md §4.2 "Channel").
//!
//! Mirrors amiquip's own `Channel`: declare entities, publish, consume,
//! track consumers by tag, own a QoS manager — just routed through the
//! virtual exchange/binding model instead of a real AMQP wire connection.

use crate::backend::Backend;
use crate::broker_state::BrokerState;
use crate::config::TransportOptions;
use crate::consumer::{Consumer, DeliverCallback};
use crate::error::{Error, Result};
use crate::exchange::ExchangeType;
use crate::message::{DeliveryInfo, DeliveryTag, Message, Properties};
use crate::qos::{QosManager, UnackedEntry};
use crate::queue::{Queue, QueueDeclareOptions};
use indexmap::{IndexMap, IndexSet};
use log::{debug, trace};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Outcome of `queue_declare` (spec.md §4.2).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueDeclareResult {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

pub(crate) type SharedBackend = Arc<Mutex<Box<dyn Backend>>>;

/// The per-connection state machine (spec.md §4.2).
pub struct Channel {
    id: u16,
    state: BrokerState,
    backend: SharedBackend,
    options: Arc<TransportOptions>,
    qos: QosManager,
    consumers: IndexMap<String, Consumer>,
    pending_auto_delete: IndexMap<String, Instant>,
    next_anon_tag: u64,
    closed: bool,
    /// Compiled topic-pattern cache keyed by pattern text, so a hot topic
    /// exchange doesn't recompile the same regex on every publish
    /// (spec.md §4.1).
    topic_cache: HashMap<String, Regex>,
}

impl Channel {
    pub(crate) fn new(id: u16, state: BrokerState, backend: SharedBackend, options: Arc<TransportOptions>) -> Channel {
        let prefetch = options.prefetch_count;
        Channel {
            id,
            state,
            backend,
            options,
            qos: QosManager::new(prefetch),
            consumers: IndexMap::new(),
            pending_auto_delete: IndexMap::new(),
            next_anon_tag: 0,
            closed: false,
            topic_cache: HashMap::new(),
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ChannelError {
                reason: format!("channel {} is closed", self.id),
            })
        } else {
            Ok(())
        }
    }

    // -- exchange operations --------------------------------------------

    pub fn exchange_declare(&mut self, name: &str, kind: &str, durable: bool, auto_delete: bool, passive: bool) -> Result<()> {
        self.check_open()?;
        let kind = ExchangeType::parse(kind)?;
        debug!("channel {}: exchange_declare {:?} ({:?})", self.id, name, kind);
        self.state.exchange_declare(name, kind, durable, auto_delete, passive)
    }

    pub fn exchange_delete(&mut self, name: &str, if_unused: bool) -> Result<()> {
        self.check_open()?;
        debug!("channel {}: exchange_delete {:?}", self.id, name);
        self.state.exchange_delete(name, if_unused)
    }

    // -- queue operations -------------------------------------------------

    /// Apply the configured `global_keyprefix` to a physical backend key
    /// (SPEC_FULL.md §3: applied once per key, not cached per-backend
    /// construction, since a `Channel` has no per-backend setup hook).
    fn backend_key(&self, name: &str) -> String {
        if self.options.global_keyprefix.is_empty() {
            name.to_owned()
        } else {
            format!("{}{}", self.options.global_keyprefix, name)
        }
    }

    fn physical_queues(&self, queue: &str) -> Vec<String> {
        match self.state.queue_max_priority(queue) {
            Some(_) => self
                .options
                .priority_steps
                .iter()
                .map(|p| self.backend_key(&format!("{}.{}", queue, p)))
                .collect(),
            None => vec![self.backend_key(queue)],
        }
    }

    fn queue_size(&self, queue: &str) -> Result<u32> {
        let mut backend = self.backend.lock().unwrap();
        let mut total = 0u64;
        for phys in self.physical_queues(queue) {
            total += backend.size(&phys)?;
        }
        Ok(total as u32)
    }

    pub fn queue_declare(
        &mut self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        passive: bool,
        max_priority: Option<u8>,
    ) -> Result<QueueDeclareResult> {
        self.check_open()?;
        if let Some(p) = max_priority {
            if p == 0 {
                return Err(Error::PreconditionFailed {
                    reason: "x-max-priority must be in [1,255]".to_owned(),
                });
            }
        }
        let (resolved, consumer_count) =
            self.state.queue_declare(name, durable, exclusive, auto_delete, passive, max_priority)?;
        debug!("channel {}: queue_declare {:?}", self.id, resolved);
        let message_count = self.queue_size(&resolved)?;
        Ok(QueueDeclareResult {
            name: resolved,
            message_count,
            consumer_count,
        })
    }

    /// Declare a queue and return an ergonomic `Queue` handle bound to
    /// this channel (spec.md §3 "Queue"), the way amiquip's own
    /// `Channel::queue_declare` hands back a `Queue<'a>`.
    pub fn queue(&mut self, name: &str, options: QueueDeclareOptions) -> Result<Queue<'_>> {
        Queue::declare(self, name, options)
    }

    pub fn queue_delete(&mut self, name: &str, if_unused: bool, if_empty: bool) -> Result<u32> {
        self.check_open()?;
        let size = self.queue_size(name)?;
        self.state.queue_delete(name, if_unused, if_empty, size == 0)?;
        let mut backend = self.backend.lock().unwrap();
        let mut purged = 0u64;
        for phys in self.physical_queues(name) {
            purged += backend.purge(&phys)?;
            backend.delete(&phys)?;
        }
        debug!("channel {}: queue_delete {:?} ({} messages)", self.id, name, purged);
        Ok(purged as u32)
    }

    pub fn queue_bind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.check_open()?;
        trace!("channel {}: queue_bind {:?} -> {:?} ({:?})", self.id, queue, exchange, routing_key);
        self.state.queue_bind(queue, exchange, routing_key)
    }

    pub fn queue_unbind(&mut self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.check_open()?;
        self.state.queue_unbind(queue, exchange, routing_key)
    }

    pub fn queue_purge(&mut self, name: &str) -> Result<u32> {
        self.check_open()?;
        let mut backend = self.backend.lock().unwrap();
        let mut count = 0u64;
        for phys in self.physical_queues(name) {
            count += backend.purge(&phys)?;
        }
        Ok(count as u32)
    }

    // -- publish ----------------------------------------------------------

    /// spec.md §4.2 "Publishing algorithm".
    pub fn basic_publish(
        &mut self,
        body: &[u8],
        content_type: Option<String>,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        properties: Option<Properties>,
    ) -> Result<()> {
        self.check_open()?;
        let tag = DeliveryTag::new();
        let mut message = Message::from_body(body, content_type, &self.options);
        if let Some(props) = properties {
            message.properties = props;
        }
        message.properties.delivery_tag = Some(tag);
        message.properties.delivery_info = Some(DeliveryInfo {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            consumer_tag: None,
        });

        let kind = if exchange.is_empty() {
            ExchangeType::Direct
        } else {
            self.state.exchange_kind(exchange)?
        };
        let bindings = self.state.bindings_snapshot(exchange);
        let queue_exists = self.state.queue_exists_fn();
        let destinations = kind.lookup_cached(exchange, &bindings, routing_key, &queue_exists, &mut self.topic_cache);

        if destinations.is_empty() {
            if mandatory {
                return Err(Error::NoRoute {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                });
            }
            return Ok(());
        }

        // Clamp and write the clamped value back onto the envelope itself:
        // `build_delivery` later re-derives the physical bucket a restored
        // message belongs to from `message.properties.priority`, so the
        // serialized priority and the bucket it is actually stored under
        // must agree (spec.md §3: a message is never in two places, and
        // never in neither).
        let priority = self.options.clamp_priority(message.properties.priority);
        message.properties.priority = priority;
        let payload = message.to_json()?;
        self.deliver_to_queues(kind, exchange, routing_key, &destinations, &payload, priority)
    }

    /// spec.md §4.1 "deliver ... stops on first per-queue failure and
    /// surfaces it ... with queues already delivered to remaining
    /// delivered" and §5 "Fanout publish to N queues is not atomic".
    fn deliver_to_queues(
        &self,
        kind: ExchangeType,
        exchange: &str,
        routing_key: &str,
        destinations: &IndexSet<String>,
        payload: &str,
        priority: u8,
    ) -> Result<()> {
        let mut backend = self.backend.lock().unwrap();
        // spec.md §4.5: a backend that declares `fanout_publish` offers a
        // single backend-native broadcast; use it for fanout exchanges
        // instead of looping `put` once per destination queue.
        if kind == ExchangeType::Fanout && backend.capabilities().fanout_publish {
            return backend.put_fanout(exchange, payload, routing_key);
        }
        for queue in destinations {
            let phys = self.route_to_priority_bucket(queue, priority);
            backend.put(&phys, payload, priority)?;
        }
        Ok(())
    }

    fn route_to_priority_bucket(&self, queue: &str, priority: u8) -> String {
        match self.state.queue_max_priority(queue) {
            Some(_) => self.backend_key(&format!("{}.{}", queue, priority)),
            None => self.backend_key(queue),
        }
    }

    // -- pull consumption ---------------------------------------------------

    /// spec.md §4.2 "Consumption algorithm (pull)".
    pub fn basic_get(&mut self, queue: &str, no_ack: bool) -> Result<Option<Message>> {
        self.check_open()?;
        let raw = self.pop_highest_priority(queue)?;
        let raw = match raw {
            Some(r) => r,
            None => return Ok(None),
        };
        Ok(Some(self.build_delivery(queue, raw, no_ack)?))
    }

    fn pop_highest_priority(&self, queue: &str) -> Result<Option<String>> {
        let mut backend = self.backend.lock().unwrap();
        match self.state.queue_max_priority(queue) {
            None => backend.get(&self.backend_key(queue)),
            Some(_) => {
                for p in self.options.priority_steps.iter().rev() {
                    let phys = self.backend_key(&format!("{}.{}", queue, p));
                    if let Some(rec) = backend.get(&phys)? {
                        return Ok(Some(rec));
                    }
                }
                Ok(None)
            }
        }
    }

    fn build_delivery(&mut self, queue: &str, raw: String, no_ack: bool) -> Result<Message> {
        let mut message = Message::from_json(&raw)?;
        let tag = DeliveryTag::new();
        let exchange = message
            .properties
            .delivery_info
            .as_ref()
            .map(|i| i.exchange.clone())
            .unwrap_or_default();
        let routing_key = message
            .properties
            .delivery_info
            .as_ref()
            .map(|i| i.routing_key.clone())
            .unwrap_or_else(|| queue.to_owned());
        message.properties.delivery_tag = Some(tag);

        if !no_ack {
            // Restoration must re-put into the exact physical bucket the
            // record was popped from (priority sub-queue + key prefix),
            // not the bare logical queue name.
            let physical_queue = self.route_to_priority_bucket(queue, message.properties.priority);
            let deadline = QosManager::new_deadline(&self.options, Instant::now());
            self.qos.append(
                tag,
                UnackedEntry {
                    serialized: raw,
                    exchange,
                    routing_key,
                    queue: physical_queue,
                    deadline,
                },
            );
        }
        Ok(message)
    }

    // -- async consumption --------------------------------------------------

    /// spec.md §4.2 `basic_consume`.
    pub fn basic_consume(
        &mut self,
        queue: &str,
        tag: Option<String>,
        no_ack: bool,
        exclusive: bool,
        callback: DeliverCallback,
    ) -> Result<String> {
        self.check_open()?;
        let tag = tag.unwrap_or_else(|| {
            self.next_anon_tag += 1;
            format!("ctag-{}.{}", self.id, self.next_anon_tag)
        });
        if self.consumers.contains_key(&tag) {
            return Err(Error::NotAllowed {
                reason: format!("consumer tag {:?} already in use on this channel", tag),
            });
        }
        self.pending_auto_delete.shift_remove(queue);
        self.state.incr_consumer_count(queue, 1);
        self.consumers.insert(
            tag.clone(),
            Consumer {
                tag: tag.clone(),
                queue: queue.to_owned(),
                no_ack,
                exclusive,
                callback,
            },
        );
        debug!("channel {}: basic_consume {:?} on {:?}", self.id, tag, queue);
        Ok(tag)
    }

    /// spec.md §4.2 `basic_cancel`: idempotent.
    pub fn basic_cancel(&mut self, tag: &str) -> Result<()> {
        if let Some(consumer) = self.consumers.shift_remove(tag) {
            self.state.incr_consumer_count(&consumer.queue, -1);
            if self.state.consumer_count(&consumer.queue) == 0 {
                self.pending_auto_delete.insert(consumer.queue, Instant::now());
            }
        }
        Ok(())
    }

    /// Queues this channel has an active consumer registered against
    /// (used by the scheduler for round-robin fan-in, spec.md §4.4).
    pub fn active_queues(&self) -> IndexSet<String> {
        self.consumers.values().map(|c| c.queue.clone()).collect()
    }

    pub fn qos_can_consume(&self) -> bool {
        self.qos.can_consume()
    }

    /// Pop one record for `queue` and dispatch it to whichever consumer(s)
    /// are registered on it (spec.md §4.4 "the reader... reads exactly one
    /// record... dispatches to the registered callback").
    pub fn deliver_ready(&mut self, queue: &str) -> Result<bool> {
        self.check_open()?;
        if !self.qos.can_consume() {
            return Ok(false);
        }
        let raw = match self.pop_highest_priority(queue)? {
            Some(r) => r,
            None => return Ok(false),
        };
        let tag_for_consumers: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.queue == queue)
            .map(|(t, _)| t.clone())
            .collect();
        let consumer_tag = tag_for_consumers.first().cloned();
        let no_ack = consumer_tag
            .as_ref()
            .and_then(|t| self.consumers.get(t))
            .map(|c| c.no_ack)
            .unwrap_or(false);

        let mut message = self.build_delivery(queue, raw, no_ack)?;
        if let Some(info) = message.properties.delivery_info.as_mut() {
            info.consumer_tag = consumer_tag.clone();
        }
        if let Some(tag) = consumer_tag {
            if let Some(consumer) = self.consumers.get_mut(&tag) {
                (consumer.callback)(message);
            }
        }
        Ok(true)
    }

    // -- acknowledgement ------------------------------------------------

    pub fn basic_ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.qos.ack(tag)
    }

    pub fn basic_reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        let mut backend = self.backend.lock().unwrap();
        self.qos.reject(tag, requeue, &mut **backend, self.options.requeue_at)
    }

    /// spec.md §4.2 `basic_nack(tag, multiple, requeue)`. `multiple=true`
    /// rejects every entry delivered no later than `tag`, in delivery
    /// order, not just `tag` itself.
    pub fn basic_nack(&mut self, tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<()> {
        let mut backend = self.backend.lock().unwrap();
        self.qos.reject_multiple(tag, multiple, requeue, &mut **backend, self.options.requeue_at)
    }

    pub fn basic_qos(&mut self, prefetch_count: u32) {
        self.qos.set_prefetch_count(prefetch_count);
    }

    pub(crate) fn qos_mut(&mut self) -> &mut QosManager {
        &mut self.qos
    }

    pub(crate) fn backend(&self) -> SharedBackend {
        Arc::clone(&self.backend)
    }

    /// Auto-delete queues whose last consumer left more than `grace` ago
    /// (spec.md §4.2: "design default 3 seconds").
    pub(crate) fn expire_auto_delete_queues(&mut self, now: Instant, grace: std::time::Duration) -> Result<Vec<String>> {
        let mut expired = Vec::new();
        let due: Vec<String> = self
            .pending_auto_delete
            .iter()
            .filter(|(_, since)| now.duration_since(**since) >= grace)
            .map(|(q, _)| q.clone())
            .collect();
        for queue in due {
            self.pending_auto_delete.shift_remove(&queue);
            if self.state.consumer_count(&queue) == 0 {
                self.queue_delete(&queue, false, false)?;
                expired.push(queue);
            }
        }
        Ok(expired)
    }

    /// spec.md §4.2 `close`: cancels all consumers, restores unacked
    /// messages, releases resources. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        self.close_and_restore()
    }

    fn close_and_restore(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        debug!("channel {}: closing, cancelling {} consumer(s)", self.id, self.consumers.len());
        for (_, consumer) in self.consumers.drain(..) {
            self.state.incr_consumer_count(&consumer.queue, -1);
        }
        let mut backend = self.backend.lock().unwrap();
        let restored = self.qos.restore_unacked_once(&mut **backend, self.options.requeue_at);
        debug!("channel {}: restored {} unacked message(s) on close", self.id, restored);
        Ok(())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let _ = self.close_and_restore();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryBackend;
    use std::sync::mpsc;

    fn new_channel() -> Channel {
        let state = BrokerState::new();
        let backend: SharedBackend = Arc::new(Mutex::new(Box::new(MemoryBackend::new())));
        Channel::new(1, state, backend, Arc::new(TransportOptions::default()))
    }

    #[test]
    fn s1_direct_routing() {
        let mut ch = new_channel();
        ch.exchange_declare("E", "direct", false, false, false).unwrap();
        ch.queue_declare("Q", false, false, false, false, None).unwrap();
        ch.queue_bind("Q", "E", "k").unwrap();
        ch.basic_publish(br#"{"n":1}"#, None, "E", "k", false, None).unwrap();
        let msg = ch.basic_get("Q", false).unwrap().unwrap();
        assert_eq!(msg.decoded_body(), br#"{"n":1}"#);
        let info = msg.properties.delivery_info.unwrap();
        assert_eq!(info.exchange, "E");
        assert_eq!(info.routing_key, "k");
    }

    #[test]
    fn s3_fanout_delivers_to_every_bound_queue() {
        let mut ch = new_channel();
        ch.exchange_declare("F", "fanout", false, false, false).unwrap();
        ch.queue_declare("Q1", false, false, false, false, None).unwrap();
        ch.queue_declare("Q2", false, false, false, false, None).unwrap();
        ch.queue_bind("Q1", "F", "").unwrap();
        ch.queue_bind("Q2", "F", "").unwrap();
        ch.basic_publish(b"x", None, "F", "ignored", false, None).unwrap();
        assert!(ch.basic_get("Q1", true).unwrap().is_some());
        assert!(ch.basic_get("Q2", true).unwrap().is_some());
    }

    #[test]
    fn s4_priority_strict_within_queue() {
        let mut ch = new_channel();
        ch.queue_declare("P", false, false, false, false, Some(9)).unwrap();
        let mut props = Properties::default();
        props.priority = 3;
        ch.basic_publish(b"a", None, "", "P", false, Some(props.clone())).unwrap();
        props.priority = 9;
        ch.basic_publish(b"b", None, "", "P", false, Some(props.clone())).unwrap();
        props.priority = 3;
        ch.basic_publish(b"c", None, "", "P", false, Some(props)).unwrap();

        let m1 = ch.basic_get("P", true).unwrap().unwrap();
        let m2 = ch.basic_get("P", true).unwrap().unwrap();
        let m3 = ch.basic_get("P", true).unwrap().unwrap();
        assert_eq!(m1.decoded_body(), b"b");
        assert_eq!(m2.decoded_body(), b"a");
        assert_eq!(m3.decoded_body(), b"c");
    }

    #[test]
    fn mandatory_publish_with_no_route_fails() {
        let mut ch = new_channel();
        ch.exchange_declare("E", "direct", false, false, false).unwrap();
        let err = ch.basic_publish(b"x", None, "E", "nowhere", true, None).unwrap_err();
        assert!(matches!(err, Error::NoRoute { .. }));
    }

    #[test]
    fn s6_close_restores_unacked_with_redelivered_flag() {
        let state = BrokerState::new();
        let backend: SharedBackend = Arc::new(Mutex::new(Box::new(MemoryBackend::new())));
        let options = Arc::new(TransportOptions::default());
        {
            let mut ch = Channel::new(1, state.clone(), Arc::clone(&backend), Arc::clone(&options));
            ch.queue_declare("Q", false, false, false, false, None).unwrap();
            for _ in 0..3 {
                ch.basic_publish(b"m", None, "", "Q", false, None).unwrap();
            }
            ch.basic_qos(10);
            for _ in 0..3 {
                ch.basic_get("Q", false).unwrap().unwrap();
            }
            ch.close().unwrap();
        }
        let mut ch2 = Channel::new(2, state, backend, options);
        let mut redelivered_count = 0;
        for _ in 0..3 {
            let msg = ch2.basic_get("Q", true).unwrap().unwrap();
            if msg.properties.delivery_info.unwrap().redelivered {
                redelivered_count += 1;
            }
        }
        assert_eq!(redelivered_count, 3);
    }

    #[test]
    fn deliver_ready_invokes_consumer_callback() {
        let mut ch = new_channel();
        ch.queue_declare("Q", false, false, false, false, None).unwrap();
        ch.basic_publish(b"hi", None, "", "Q", false, None).unwrap();

        let (tx, rx) = mpsc::channel();
        ch.basic_consume(
            "Q",
            None,
            true,
            false,
            Box::new(move |msg: Message| {
                tx.send(msg.decoded_body()).unwrap();
            }),
        )
        .unwrap();

        assert!(ch.deliver_ready("Q").unwrap());
        assert_eq!(rx.recv().unwrap(), b"hi".to_vec());
    }

    #[test]
    fn off_step_priority_survives_restore_instead_of_being_orphaned() {
        // Regression test: priority=5 against the default steps [0,3,6,9]
        // clamps to 6. The serialized envelope and the unacked-index entry
        // must agree on that clamped value, or restoration re-puts the
        // message into a bucket nothing ever scans again.
        let state = BrokerState::new();
        let backend: SharedBackend = Arc::new(Mutex::new(Box::new(MemoryBackend::new())));
        let options = Arc::new(TransportOptions::default());
        {
            let mut ch = Channel::new(1, state.clone(), Arc::clone(&backend), Arc::clone(&options));
            ch.queue_declare("P", false, false, false, false, Some(9)).unwrap();
            let mut props = Properties::default();
            props.priority = 5;
            ch.basic_publish(b"x", None, "", "P", false, Some(props)).unwrap();

            let msg = ch.basic_get("P", false).unwrap().unwrap();
            assert_eq!(msg.properties.priority, 6, "priority is clamped before being stored");
            ch.close().unwrap();
        }

        let mut ch2 = Channel::new(2, state, backend, options);
        let restored = ch2.basic_get("P", true).unwrap();
        assert!(restored.is_some(), "restored message must still be visible in its clamped bucket");
        assert_eq!(restored.unwrap().decoded_body(), b"x");
    }

    #[test]
    fn fanout_publish_uses_backend_native_broadcast_when_available() {
        use crate::backend::Capabilities;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct FanoutCapableBackend {
            inner: MemoryBackend,
            fanout_calls: Arc<AtomicUsize>,
        }

        impl Backend for FanoutCapableBackend {
            fn put(&mut self, queue: &str, payload: &str, priority: u8) -> Result<()> {
                self.inner.put(queue, payload, priority)
            }
            fn get(&mut self, queue: &str) -> Result<Option<String>> {
                self.inner.get(queue)
            }
            fn size(&mut self, queue: &str) -> Result<u64> {
                self.inner.size(queue)
            }
            fn purge(&mut self, queue: &str) -> Result<u64> {
                self.inner.purge(queue)
            }
            fn delete(&mut self, queue: &str) -> Result<()> {
                self.inner.delete(queue)
            }
            fn has_queue(&mut self, queue: &str) -> Result<bool> {
                self.inner.has_queue(queue)
            }
            fn capabilities(&self) -> Capabilities {
                Capabilities {
                    fanout_publish: true,
                    ping: false,
                }
            }
            fn put_fanout(&mut self, _exchange: &str, payload: &str, _routing_key: &str) -> Result<()> {
                self.fanout_calls.fetch_add(1, Ordering::SeqCst);
                // A real broadcast backend delivers to every bound queue
                // itself; the fixture fans out to the two test queues.
                self.inner.put("Q1", payload, 0)?;
                self.inner.put("Q2", payload, 0)
            }
        }

        let fanout_calls = Arc::new(AtomicUsize::new(0));
        let backend: SharedBackend = Arc::new(Mutex::new(Box::new(FanoutCapableBackend {
            inner: MemoryBackend::new(),
            fanout_calls: Arc::clone(&fanout_calls),
        })));
        let mut ch = Channel::new(1, BrokerState::new(), backend, Arc::new(TransportOptions::default()));
        ch.exchange_declare("F", "fanout", false, false, false).unwrap();
        ch.queue_declare("Q1", false, false, false, false, None).unwrap();
        ch.queue_declare("Q2", false, false, false, false, None).unwrap();
        ch.queue_bind("Q1", "F", "").unwrap();
        ch.queue_bind("Q2", "F", "").unwrap();

        ch.basic_publish(b"x", None, "F", "ignored", false, None).unwrap();

        assert_eq!(fanout_calls.load(Ordering::SeqCst), 1, "put_fanout is used instead of per-queue put");
        assert!(ch.basic_get("Q1", true).unwrap().is_some());
        assert!(ch.basic_get("Q2", true).unwrap().is_some());
    }

    #[test]
    fn basic_nack_multiple_rejects_every_tag_up_to_and_including_it() {
        let mut ch = new_channel();
        ch.queue_declare("Q", false, false, false, false, None).unwrap();
        ch.basic_qos(0);
        for i in 0..3u8 {
            ch.basic_publish(&[i], None, "", "Q", false, None).unwrap();
        }
        let m1 = ch.basic_get("Q", false).unwrap().unwrap();
        let m2 = ch.basic_get("Q", false).unwrap().unwrap();
        let m3 = ch.basic_get("Q", false).unwrap().unwrap();

        ch.basic_nack(m2.properties.delivery_tag.unwrap(), true, true).unwrap();

        // m1 and m2 were requeued; m3 is still outstanding.
        assert!(ch.basic_ack(m3.properties.delivery_tag.unwrap()).is_ok());
        assert!(ch.basic_ack(m1.properties.delivery_tag.unwrap()).is_err());
        assert!(ch.basic_ack(m2.properties.delivery_tag.unwrap()).is_err());

        let mut redelivered = 0;
        while let Some(msg) = ch.basic_get("Q", true).unwrap() {
            assert!(msg.properties.delivery_info.unwrap().redelivered);
            redelivered += 1;
        }
        assert_eq!(redelivered, 2);
    }
}
