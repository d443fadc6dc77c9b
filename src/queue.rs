//! `Queue` — an ergonomic handle bound to a channel (spec.md §3 "Queue").
//!
//! Mirrors amiquip's own `Queue<'a>`: a thin borrow over `Channel` so
//! callers don't have to repeat the queue name on every operation.

use crate::channel::{Channel, QueueDeclareResult};
use crate::consumer::DeliverCallback;
use crate::error::Result;
use crate::message::{DeliveryTag, Message};

#[derive(Clone, Debug, Default)]
pub struct QueueDeclareOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub passive: bool,
    pub max_priority: Option<u8>,
}

#[derive(Clone, Debug, Default)]
pub struct QueueDeleteOptions {
    pub if_unused: bool,
    pub if_empty: bool,
}

pub struct Queue<'a> {
    channel: &'a mut Channel,
    name: String,
    message_count: u32,
    consumer_count: u32,
}

impl<'a> Queue<'a> {
    pub(crate) fn declare(channel: &'a mut Channel, name: &str, options: QueueDeclareOptions) -> Result<Queue<'a>> {
        let QueueDeclareResult {
            name,
            message_count,
            consumer_count,
        } = channel.queue_declare(
            name,
            options.durable,
            options.exclusive,
            options.auto_delete,
            options.passive,
            options.max_priority,
        )?;
        Ok(Queue {
            channel,
            name,
            message_count,
            consumer_count,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn declared_message_count(&self) -> u32 {
        self.message_count
    }

    #[inline]
    pub fn declared_consumer_count(&self) -> u32 {
        self.consumer_count
    }

    #[inline]
    pub fn get(&mut self, no_ack: bool) -> Result<Option<Message>> {
        self.channel.basic_get(&self.name, no_ack)
    }

    #[inline]
    pub fn consume(&mut self, tag: Option<String>, no_ack: bool, exclusive: bool, callback: DeliverCallback) -> Result<String> {
        self.channel.basic_consume(&self.name, tag, no_ack, exclusive, callback)
    }

    #[inline]
    pub fn bind<S: Into<String>>(&mut self, exchange: &str, routing_key: S) -> Result<()> {
        self.channel.queue_bind(&self.name, exchange, &routing_key.into())
    }

    #[inline]
    pub fn unbind<S: Into<String>>(&mut self, exchange: &str, routing_key: S) -> Result<()> {
        self.channel.queue_unbind(&self.name, exchange, &routing_key.into())
    }

    #[inline]
    pub fn purge(&mut self) -> Result<u32> {
        self.channel.queue_purge(&self.name)
    }

    #[inline]
    pub fn delete(self, options: QueueDeleteOptions) -> Result<u32> {
        self.channel.queue_delete(&self.name, options.if_unused, options.if_empty)
    }

    #[inline]
    pub fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.channel.basic_ack(tag)
    }

    #[inline]
    pub fn nack(&mut self, tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<()> {
        self.channel.basic_nack(tag, multiple, requeue)
    }

    #[inline]
    pub fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.channel.basic_reject(tag, requeue)
    }
}
