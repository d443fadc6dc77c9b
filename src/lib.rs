//! `junction` — a virtual message-broker engine: exchange routing, queue
//! storage, QoS/prefetch, and consumer scheduling implemented entirely in
//! the client process, talking to a pluggable storage `Backend` instead of
//! a real broker on the wire.
//!
//! The shape of the public API — `Transport` owns `Channel`s, a `Channel`
//! declares exchanges/queues and publishes/consumes, `Queue` is a thin
//! borrowed handle back onto its `Channel` — follows the same layering
//! amiquip uses for a real AMQP connection; only what sits underneath a
//! channel is different here.

mod backend;
pub mod backends;
mod broker_state;
mod channel;
mod codec;
mod config;
mod consumer;
mod error;
mod exchange;
mod message;
mod qos;
mod queue;
mod scheduler;
mod transport;

pub use crate::backend::{Backend, Capabilities};
pub use crate::channel::{Channel, QueueDeclareResult};
pub use crate::config::{BodyEncoding, RequeueEnd, TransportOptions};
pub use crate::consumer::DeliverCallback;
pub use crate::error::{Error, Result};
pub use crate::exchange::ExchangeType;
pub use crate::message::{DeliveryInfo, DeliveryTag, Message, Properties};
pub use crate::queue::{Queue, QueueDeclareOptions, QueueDeleteOptions};
pub use crate::transport::Transport;
