//! In-memory registries of exchanges, bindings, and queues (spec.md §2
//! "Broker State"). Shared across all channels of the same logical
//! process-local transport (spec.md §5: "the `BrokerState` is shared
//! across all channels of a process-local transport... Shared mutation
//! must occur under an exclusive lock; reads may be concurrent").

use crate::error::{Error, Result};
use crate::exchange::{BindingTable, ExchangeType};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, RwLock};

/// `Exchange` metadata (spec.md §3).
#[derive(Clone, Debug, PartialEq)]
pub struct ExchangeEntry {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
}

/// `Queue` metadata (spec.md §3).
#[derive(Clone, Debug, PartialEq)]
pub struct QueueEntry {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub max_priority: Option<u8>,
    pub consumer_count: u32,
}

impl QueueEntry {
    fn matches_declare(&self, durable: bool, exclusive: bool, auto_delete: bool, max_priority: Option<u8>) -> bool {
        self.durable == durable
            && self.exclusive == exclusive
            && self.auto_delete == auto_delete
            && self.max_priority == max_priority
    }
}

/// The shared registry. `exchanges`/`queues` use `IndexMap` so iteration
/// order (used by server-generated-name counters and tests) is
/// deterministic, the way amiquip favors `indexmap` over `HashMap`
/// throughout its dependency stack.
#[derive(Default)]
struct Inner {
    exchanges: IndexMap<String, ExchangeEntry>,
    queues: IndexMap<String, QueueEntry>,
    bindings: BindingTable,
    generated_name_counter: u64,
}

/// Shared, lock-guarded broker state. Cloning a `BrokerState` clones the
/// `Arc`, not the data (spec.md §9: "a single owned registry held by the
/// Transport, passed to Channels as a dependency").
#[derive(Clone)]
pub struct BrokerState {
    inner: Arc<RwLock<Inner>>,
    // A single mutation mutex serializes all writers even though readers
    // may run concurrently under the RwLock; this mirrors the original's
    // WATCH/transaction discipline for the unacked index restoration path
    // (SPEC_FULL.md §3) applied here to exchange/queue/binding declares.
    write_lock: Arc<Mutex<()>>,
}

impl Default for BrokerState {
    fn default() -> Self {
        BrokerState::new()
    }
}

impl BrokerState {
    pub fn new() -> BrokerState {
        BrokerState {
            inner: Arc::new(RwLock::new(Inner::default())),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeType,
        durable: bool,
        auto_delete: bool,
        passive: bool,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.exchanges.get(name) {
            if passive {
                return Ok(());
            }
            if existing.kind == kind && existing.durable == durable && existing.auto_delete == auto_delete {
                return Ok(());
            }
            return Err(Error::PreconditionFailed {
                reason: format!("exchange {:?} redeclared with different parameters", name),
            });
        }
        if passive {
            return Err(Error::NotFound {
                what: format!("exchange {:?}", name),
            });
        }
        inner.exchanges.insert(
            name.to_owned(),
            ExchangeEntry {
                name: name.to_owned(),
                kind,
                durable,
                auto_delete,
            },
        );
        Ok(())
    }

    pub fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        if if_unused && inner.bindings.has_bindings(name) {
            return Err(Error::PreconditionFailed {
                reason: format!("exchange {:?} still has bindings", name),
            });
        }
        inner.bindings.remove_exchange(name);
        inner.exchanges.swap_remove(name);
        Ok(())
    }

    pub fn exchange_kind(&self, name: &str) -> Result<ExchangeType> {
        let inner = self.inner.read().unwrap();
        inner
            .exchanges
            .get(name)
            .map(|e| e.kind)
            .ok_or_else(|| Error::NotFound {
                what: format!("exchange {:?}", name),
            })
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        name.is_empty() || self.inner.read().unwrap().exchanges.contains_key(name)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn queue_declare(
        &self,
        name: &str,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        passive: bool,
        max_priority: Option<u8>,
    ) -> Result<(String, u32)> {
        let _guard = self.write_lock.lock().unwrap();
        let mut inner = self.inner.write().unwrap();

        let resolved_name = if name.is_empty() {
            if passive {
                return Err(Error::NotFound {
                    what: "queue with empty name".to_owned(),
                });
            }
            inner.generated_name_counter += 1;
            format!("amq.gen-{}", inner.generated_name_counter)
        } else {
            name.to_owned()
        };

        if let Some(existing) = inner.queues.get(&resolved_name) {
            if passive {
                return Ok((resolved_name, existing.consumer_count));
            }
            if existing.matches_declare(durable, exclusive, auto_delete, max_priority) {
                let count = existing.consumer_count;
                return Ok((resolved_name, count));
            }
            return Err(Error::PreconditionFailed {
                reason: format!("queue {:?} redeclared with different parameters", resolved_name),
            });
        }

        if passive {
            return Err(Error::NotFound {
                what: format!("queue {:?}", resolved_name),
            });
        }

        if let Some(p) = max_priority {
            if p == 0 {
                return Err(Error::PreconditionFailed {
                    reason: "x-max-priority must be in [1,255]".to_owned(),
                });
            }
        }

        inner.queues.insert(
            resolved_name.clone(),
            QueueEntry {
                name: resolved_name.clone(),
                durable,
                exclusive,
                auto_delete,
                max_priority,
                consumer_count: 0,
            },
        );
        Ok((resolved_name, 0))
    }

    pub fn queue_delete(&self, name: &str, if_unused: bool, if_empty: bool, is_empty: bool) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.queues.get(name) {
            if if_unused && entry.consumer_count > 0 {
                return Err(Error::PreconditionFailed {
                    reason: format!("queue {:?} has consumers", name),
                });
            }
        }
        if if_empty && !is_empty {
            return Err(Error::PreconditionFailed {
                reason: format!("queue {:?} is not empty", name),
            });
        }
        inner.queues.swap_remove(name);
        inner.bindings.remove_queue(name);
        Ok(())
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.read().unwrap().queues.contains_key(name)
    }

    pub fn queue_max_priority(&self, name: &str) -> Option<u8> {
        self.inner.read().unwrap().queues.get(name).and_then(|q| q.max_priority)
    }

    pub fn incr_consumer_count(&self, name: &str, delta: i32) {
        let _guard = self.write_lock.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        if let Some(entry) = inner.queues.get_mut(name) {
            entry.consumer_count = (entry.consumer_count as i32 + delta).max(0) as u32;
        }
    }

    pub fn consumer_count(&self, name: &str) -> u32 {
        self.inner
            .read()
            .unwrap()
            .queues
            .get(name)
            .map(|q| q.consumer_count)
            .unwrap_or(0)
    }

    pub fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let pattern = routing_key.to_owned();
        let _guard = self.write_lock.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        if !exchange.is_empty() && !inner.exchanges.contains_key(exchange) {
            return Err(Error::NotFound {
                what: format!("exchange {:?}", exchange),
            });
        }
        if !inner.queues.contains_key(queue) {
            return Err(Error::NotFound {
                what: format!("queue {:?}", queue),
            });
        }
        inner.bindings.bind(exchange, routing_key, &pattern, queue);
        Ok(())
    }

    pub fn queue_unbind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap();
        let mut inner = self.inner.write().unwrap();
        inner.bindings.unbind(exchange, routing_key, queue);
        Ok(())
    }

    /// Snapshot the binding table for a publish. spec.md §5: "the set of
    /// destination queues is the snapshot at publish time; concurrent
    /// bind/unbind during a single publish may or may not include the new
    /// binding, but will never corrupt the binding table" — a read-lock
    /// clone gives us exactly that.
    pub fn bindings_snapshot(&self, exchange: &str) -> Vec<crate::exchange::Binding> {
        self.inner.read().unwrap().bindings.bindings_for(exchange).to_vec()
    }

    pub fn queue_exists_fn(&self) -> impl Fn(&str) -> bool + '_ {
        move |name: &str| self.queue_exists(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redeclare_with_same_params_is_idempotent() {
        let state = BrokerState::new();
        state.exchange_declare("E", ExchangeType::Direct, false, false, false).unwrap();
        state.exchange_declare("E", ExchangeType::Direct, false, false, false).unwrap();
    }

    #[test]
    fn redeclare_with_different_params_fails() {
        let state = BrokerState::new();
        state.exchange_declare("E", ExchangeType::Direct, false, false, false).unwrap();
        let err = state.exchange_declare("E", ExchangeType::Topic, false, false, false);
        assert!(matches!(err, Err(Error::PreconditionFailed { .. })));
    }

    #[test]
    fn passive_declare_requires_existence() {
        let state = BrokerState::new();
        let err = state.exchange_declare("missing", ExchangeType::Direct, false, false, true);
        assert!(matches!(err, Err(Error::NotFound { .. })));
    }

    #[test]
    fn delete_exchange_cascades_bindings() {
        let state = BrokerState::new();
        state.exchange_declare("E", ExchangeType::Direct, false, false, false).unwrap();
        state.queue_declare("Q", false, false, false, false, None).unwrap();
        state.queue_bind("Q", "E", "k").unwrap();
        assert_eq!(state.bindings_snapshot("E").len(), 1);
        state.exchange_delete("E", false).unwrap();
        assert_eq!(state.bindings_snapshot("E").len(), 0);
    }

    #[test]
    fn generated_queue_names_are_unique() {
        let state = BrokerState::new();
        let (n1, _) = state.queue_declare("", false, true, true, false, None).unwrap();
        let (n2, _) = state.queue_declare("", false, true, true, false, None).unwrap();
        assert_ne!(n1, n2);
    }

    #[test]
    fn max_priority_zero_is_rejected() {
        let state = BrokerState::new();
        let err = state.queue_declare("Q", false, false, false, false, Some(0));
        assert!(matches!(err, Err(Error::PreconditionFailed { .. })));
    }
}
