//! Stable error taxonomy for the virtual transport engine (spec.md §6/§7).

use snafu::Snafu;
use std::fmt;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Opaque wrapper around a backend adaptor's own error type.
///
/// Backends report failures through whatever error type is natural for
/// their wire protocol; the core only needs to know whether the failure
/// was fatal to the channel (see `Backend::is_fatal` in `backend.rs`).
pub struct BackendError(pub Box<dyn std::error::Error + Send + Sync>);

impl fmt::Debug for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for BackendError {}

impl BackendError {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        BackendError(Box::new(err))
    }
}

/// The stable, backend-independent error taxonomy from spec.md §6.
#[derive(Debug, Snafu)]
pub enum Error {
    /// An explicitly named entity (exchange, queue, binding) does not exist.
    #[snafu(display("not found: {}", what))]
    NotFound { what: String },

    /// A passive declare, or a redeclare with mismatched parameters, was rejected.
    #[snafu(display("not allowed: {}", reason))]
    NotAllowed { reason: String },

    /// The server refused to complete the method due to a precondition on the entity.
    #[snafu(display("precondition failed: {}", reason))]
    PreconditionFailed { reason: String },

    /// A mandatory publish found no destination queue.
    #[snafu(display("no route for routing key {:?} on exchange {:?}", routing_key, exchange))]
    NoRoute { exchange: String, routing_key: String },

    /// A non-blocking read found nothing available.
    #[snafu(display("queue empty"))]
    Empty,

    /// `drain_events` exceeded its wall-clock deadline.
    #[snafu(display("timed out waiting for events"))]
    Timeout,

    /// A channel-level protocol or state violation.
    #[snafu(display("channel error: {}", reason))]
    ChannelError { reason: String },

    /// A connection-level failure, potentially recoverable by the caller's retry policy.
    #[snafu(display("connection error: {}", reason))]
    ConnectionError { reason: String },

    /// The backend reports a capability/version incompatible with what the core requires.
    #[snafu(display("version mismatch: {}", reason))]
    VersionMismatch { reason: String },

    /// A non-fatal bookkeeping violation (ack of unknown tag, reject of acked tag, ...).
    #[snafu(display("inconsistent state: {}", reason))]
    InconsistentState { reason: String },

    /// A concrete backend adaptor failed; the core does not interpret the cause.
    #[snafu(display("backend error: {}", source))]
    Backend { source: BackendError },
}

impl Error {
    /// True if this error should mark the channel that produced it unusable
    /// (spec.md §7: "the channel is marked unusable only if the error is
    /// classified as fatal").
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConnectionError { .. } | Error::VersionMismatch { .. }
        )
    }

    pub fn backend<E: std::error::Error + Send + Sync + 'static>(err: E) -> Error {
        Error::Backend {
            source: BackendError::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_matches_spec() {
        assert!(Error::ConnectionError { reason: "x".into() }.is_fatal());
        assert!(Error::VersionMismatch { reason: "x".into() }.is_fatal());
        assert!(!Error::NotFound { what: "x".into() }.is_fatal());
        assert!(!Error::InconsistentState { reason: "x".into() }.is_fatal());
    }
}
