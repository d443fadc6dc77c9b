//! `Consumer` (spec.md §3 Data Model).

use crate::message::Message;

/// Callback invoked by the scheduler for each delivered message
/// (spec.md §9 Design Notes: for callback-based consumption, "model as
/// channel-owned closures").
pub type DeliverCallback = Box<dyn FnMut(Message) + Send>;

pub struct Consumer {
    pub tag: String,
    pub queue: String,
    pub no_ack: bool,
    pub exclusive: bool,
    pub callback: DeliverCallback,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .field("no_ack", &self.no_ack)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}
