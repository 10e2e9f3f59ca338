// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # AMQP Driver Seam
//!
//! This module defines the capabilities the connection-lifecycle and
//! delivery-pipeline core requires from the underlying AMQP implementation:
//! dialing an endpoint, multiplexing channels, the declaration and binding
//! operations, publishing, consuming and acknowledgement. The production
//! implementation wraps lapin (see the `amqp` module); tests substitute an
//! in-memory driver.
//!
//! Both connections and channels expose their close event as a `closed()`
//! future so supervision tasks can make lifecycles explicit.

use crate::endpoint::Endpoint;
use crate::errors::Result;
use crate::exchange::ExchangeKind;
use crate::message::{MessageProperties, PublishOptions};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Opaque declaration arguments, converted by the driver implementation.
pub type Arguments = BTreeMap<String, serde_json::Value>;

/// Flags of an exchange declaration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub passive: bool,
}

/// Flags of a queue declaration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub passive: bool,
}

/// The server's reply to a queue declaration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeclaredQueue {
    /// The declared name, server-generated when the request left it empty
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// One raw delivery as received from the driver.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub data: Vec<u8>,
}

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Delivery>;

/// Dials endpoints.
#[async_trait]
pub trait AmqpDriver: Send + Sync + 'static {
    /// Opens a connection to the given endpoint.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn AmqpConnection>>;
}

/// One open connection to a broker node.
#[async_trait]
pub trait AmqpConnection: Send + Sync + 'static {
    /// Allocates a new channel on this connection.
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>>;

    /// Closes the connection.
    async fn close(&self) -> Result<()>;

    /// Whether the connection is currently usable.
    fn is_open(&self) -> bool;

    /// Resolves once the connection closed, for supervision tasks.
    async fn closed(&self);
}

/// One channel multiplexed on a connection.
#[async_trait]
pub trait AmqpChannel: Send + Sync + 'static {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
        arguments: &Arguments,
    ) -> Result<()>;

    /// Passive declaration, failing when the exchange does not exist.
    async fn check_exchange(&self, name: &str) -> Result<()>;

    async fn delete_exchange(&self, name: &str) -> Result<()>;

    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()>;

    async fn unbind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()>;

    async fn assert_queue(
        &self,
        name: &str,
        options: &QueueOptions,
        arguments: &Arguments,
    ) -> Result<DeclaredQueue>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn purge_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        options: &PublishOptions,
    ) -> Result<()>;

    async fn send_to_queue(&self, queue: &str, data: &[u8], options: &PublishOptions) -> Result<()>;

    /// Starts a consumer with the given tag and returns its delivery stream.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Fetches a single message without starting a consumer.
    async fn get(&self, queue: &str) -> Result<Option<Delivery>>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Asks the server to redeliver every unacknowledged message.
    async fn recover(&self) -> Result<()>;

    /// Caps the number of unacknowledged deliveries on this channel.
    async fn prefetch(&self, count: u16) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Whether the channel is currently usable.
    fn is_open(&self) -> bool;

    /// Resolves once the channel closed, for supervision tasks.
    async fn closed(&self);
}
