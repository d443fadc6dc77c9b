//! Backend adaptor contract (spec.md §4.5).
//!
//! A concrete transport (Redis, SQS, filesystem, memory, ...) implements
//! this trait once; everything above it — exchange routing, QoS,
//! scheduling — is backend-agnostic. Optional operations are expressed as
//! a second, narrower capability query (spec.md §9: "capability
//! negotiation at attach time"), mirroring how amiquip's own channel
//! layer separates the always-available RPC path from the optional
//! content-collector path.

use crate::error::Result;

/// What a backend can do beyond the mandatory five operations.
///
/// The core downgrades to polling at `TransportOptions::polling_interval`
/// for whichever of these a backend lacks (spec.md §4.5).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub fanout_publish: bool,
    pub ping: bool,
}

/// The mandatory operation set every backend exposes (spec.md §4.5 table).
pub trait Backend: Send {
    /// Enqueue a serialized record onto `queue`, honoring `priority` if the
    /// backend has native priority support (otherwise the core's priority
    /// bucket layer has already rewritten `queue` to a sub-queue name).
    fn put(&mut self, queue: &str, payload: &str, priority: u8) -> Result<()>;

    /// Pop one record from `queue`, or report it empty.
    fn get(&mut self, queue: &str) -> Result<Option<String>>;

    /// Number of records currently stored in `queue`.
    fn size(&mut self, queue: &str) -> Result<u64>;

    /// Remove every record from `queue`, returning the count removed.
    fn purge(&mut self, queue: &str) -> Result<u64>;

    /// Drop a queue and any records in it.
    fn delete(&mut self, queue: &str) -> Result<()>;

    /// Whether a queue has been created on this backend (used for the
    /// direct exchange's default-exchange fallback, spec.md §4.1).
    fn has_queue(&mut self, queue: &str) -> Result<bool>;

    /// Declared capability set; used by the scheduler to decide whether a
    /// channel needs to fall back to polling (spec.md §4.5).
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Broadcast `payload` to every queue bound to `exchange` in a single
    /// backend-native operation, for backends that support it natively.
    /// Called by `Channel::basic_publish` in place of one `put` per
    /// destination queue whenever `capabilities().fanout_publish` is true.
    fn put_fanout(&mut self, _exchange: &str, _payload: &str, _routing_key: &str) -> Result<()> {
        unimplemented!("backend declared fanout_publish capability but did not implement put_fanout")
    }

    /// Best-effort liveness probe for a subscribe-style connection,
    /// invoked by `maybe_check_subclient_health` (spec.md §4.4). Only
    /// called when `capabilities().ping` is true.
    fn ping(&mut self) -> Result<()> {
        Ok(())
    }
}
