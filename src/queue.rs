// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # Queue Specification and Facade
//!
//! This module defines the declarative queue specification, including the
//! dead-letter fields, and the lazy queue facade. Asserting a queue opens
//! the shared read channel, declares the queue and caps the channel at one
//! unacknowledged delivery, so a subscription processes messages strictly
//! one at a time.
//!
//! A subscription composes its handlers into a single chain and settles every
//! delivery exactly once: chain completion acknowledges, abortion or failure
//! rejects. Rejections requeue when the queue has no dead-letter exchange and
//! dead-letter otherwise.

use crate::channel::{ChannelRegistry, READ_CHANNEL};
use crate::connection::ConnectionManager;
use crate::driver::{AmqpChannel, Arguments, DeliveryStream, QueueOptions};
use crate::errors::{BrokerError, Result};
use crate::handler::{ChainOutcome, ConsumerHandler, HandlerChain};
use crate::message::{encode, InboundMessage, Payload, PublishOptions};
use crate::otel;
use futures_util::StreamExt;
use opentelemetry::global;
use opentelemetry::trace::{Span, Status};
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header field specifying a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Header field specifying a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Header field specifying message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field specifying queue expiry
pub const AMQP_HEADERS_EXPIRES: &str = "x-expires";
/// Header field specifying maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Declarative description of a queue.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueueSpec {
    /// Queue name, the configuration key when unset; empty requests a
    /// server-generated name
    pub name: Option<String>,
    /// Default true
    pub durable: Option<bool>,
    pub exclusive: Option<bool>,
    pub auto_delete: Option<bool>,
    /// Per-message TTL in milliseconds
    pub message_ttl: Option<i64>,
    /// Queue expiry in milliseconds
    pub expires: Option<i64>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub max_length: Option<i64>,
    pub arguments: BTreeMap<String, serde_json::Value>,
}

impl QueueSpec {
    /// Creates a specification with the given name.
    pub fn named(name: &str) -> QueueSpec {
        QueueSpec {
            name: Some(name.to_owned()),
            ..QueueSpec::default()
        }
    }

    /// Marks the queue non-durable.
    pub fn transient(mut self) -> Self {
        self.durable = Some(false);
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = Some(true);
        self
    }

    /// Sets the queue to auto-delete when unused.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = Some(true);
        self
    }

    /// Sets the per-message TTL in milliseconds.
    pub fn message_ttl(mut self, ttl: i64) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the queue expiry in milliseconds.
    pub fn expires(mut self, expires: i64) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Routes rejected and expired messages to the given exchange.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    /// Overrides the routing key used when dead-lettering.
    pub fn dead_letter_routing_key(mut self, routing_key: &str) -> Self {
        self.dead_letter_routing_key = Some(routing_key.to_owned());
        self
    }

    /// Caps the number of messages the queue holds.
    pub fn max_length(mut self, max: i64) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Adds a declaration argument.
    pub fn argument(mut self, key: &str, value: serde_json::Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    pub(crate) fn options(&self) -> QueueOptions {
        QueueOptions {
            durable: self.durable.unwrap_or(true),
            exclusive: self.exclusive.unwrap_or(false),
            auto_delete: self.auto_delete.unwrap_or(false),
            passive: false,
        }
    }

    pub(crate) fn argument_table(&self) -> Arguments {
        let mut arguments = self.arguments.clone();
        if let Some(ttl) = self.message_ttl {
            arguments.insert(AMQP_HEADERS_MESSAGE_TTL.to_owned(), ttl.into());
        }
        if let Some(expires) = self.expires {
            arguments.insert(AMQP_HEADERS_EXPIRES.to_owned(), expires.into());
        }
        if let Some(exchange) = &self.dead_letter_exchange {
            arguments.insert(
                AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
                exchange.clone().into(),
            );
        }
        if let Some(routing_key) = &self.dead_letter_routing_key {
            arguments.insert(
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY.to_owned(),
                routing_key.clone().into(),
            );
        }
        if let Some(max) = self.max_length {
            arguments.insert(AMQP_HEADERS_MAX_LENGTH.to_owned(), max.into());
        }
        arguments
    }
}

/// Lazy facade over one queue, holding at most one subscription.
pub struct Queue {
    name: String,
    spec: QueueSpec,
    manager: Arc<ConnectionManager>,
    channels: Arc<ChannelRegistry>,
    /// Connection epoch of the last successful assertion
    asserted: Mutex<Option<u64>>,
    /// Name reported by the server, relevant for server-generated names
    declared_name: RwLock<Option<String>>,
    consumer_tag: Mutex<Option<String>>,
}

impl Queue {
    pub(crate) fn new(
        name: &str,
        spec: QueueSpec,
        manager: Arc<ConnectionManager>,
        channels: Arc<ChannelRegistry>,
    ) -> Arc<Queue> {
        Arc::new(Queue {
            name: name.to_owned(),
            spec,
            manager,
            channels,
            asserted: Mutex::new(None),
            declared_name: RwLock::new(None),
            consumer_tag: Mutex::new(None),
        })
    }

    /// The configured queue name, possibly empty for server-generated names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name to address the queue by: the server-reported one when the
    /// declaration requested a generated name.
    pub async fn effective_name(&self) -> String {
        self.declared_name
            .read()
            .await
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }

    /// Declares the queue, once per entity per connection epoch.
    ///
    /// Opens the shared read channel and caps it at one unacknowledged
    /// delivery. Concurrent callers await the first assertion instead of
    /// issuing a second server call.
    pub async fn assert(&self) -> Result<()> {
        // Channel first: connecting may run the topology loader, which
        // asserts this very entity and must not find the lock held.
        let channel = self.read_channel().await?;
        let mut asserted = self.asserted.lock().await;
        let epoch = self.manager.epoch();
        if *asserted == Some(epoch) {
            return Ok(());
        }

        debug!(queue = %self.name, "creating queue");
        let declared = channel
            .assert_queue(&self.name, &self.spec.options(), &self.spec.argument_table())
            .await?;
        channel.prefetch(1).await?;

        *self.declared_name.write().await = Some(declared.name);
        *asserted = Some(epoch);
        Ok(())
    }

    /// Sends a payload directly to this queue.
    pub async fn send(&self, payload: impl Into<Payload>, options: PublishOptions) -> Result<()> {
        self.assert().await?;

        let mut options = options;
        otel::inject_context(&mut options.headers);
        let (data, options) = encode(payload.into(), options)?;

        let name = self.effective_name().await;
        self.read_channel()
            .await?
            .send_to_queue(&name, &data, &options)
            .await
    }

    /// Starts the subscription, composing the handlers into one chain.
    ///
    /// Each delivery is decoded, traced and settled exactly once: the chain
    /// outcome acks or nacks unless a handler settled explicitly first.
    /// Rejections requeue only when the queue has no dead-letter exchange.
    ///
    /// # Errors
    /// `A consumer already exists for that queue in that context` when the
    /// entity already holds a subscription.
    pub async fn subscribe(&self, handlers: Vec<Arc<dyn ConsumerHandler>>) -> Result<()> {
        let mut consumer_tag = self.consumer_tag.lock().await;
        if consumer_tag.is_some() {
            return Err(BrokerError::SubscriptionConflict);
        }

        self.assert().await?;
        let channel = self.read_channel().await?;
        let name = self.effective_name().await;
        let tag = format!("{}-{}", name, Uuid::new_v4());

        let stream = channel.consume(&name, &tag).await?;
        *consumer_tag = Some(tag);

        let chain = HandlerChain::new(handlers);
        let requeue_on_failure = self.spec.dead_letter_exchange.is_none();
        tokio::spawn(consume_loop(name, stream, chain, channel, requeue_on_failure));

        Ok(())
    }

    /// Cancels the subscription, releasing the consumer tag.
    ///
    /// Delivery stops, but a handler already running settles its message per
    /// its own outcome.
    pub async fn cancel(&self) -> Result<()> {
        let mut consumer_tag = self.consumer_tag.lock().await;
        if let Some(tag) = consumer_tag.take() {
            self.read_channel().await?.cancel(&tag).await?;
        }
        Ok(())
    }

    /// Fetches a single message without starting a consumer.
    pub async fn get(&self) -> Result<Option<InboundMessage>> {
        self.assert().await?;
        let channel = self.read_channel().await?;
        let name = self.effective_name().await;
        let requeue_on_failure = self.spec.dead_letter_exchange.is_none();

        Ok(channel.get(&name).await?.map(|delivery| {
            InboundMessage::from_delivery(delivery, Arc::clone(&channel), requeue_on_failure)
        }))
    }

    /// Removes a binding of this queue from the given exchange.
    pub async fn unbind(&self, exchange: &str, routing_key: &str) -> Result<()> {
        let name = self.effective_name().await;
        self.read_channel()
            .await?
            .unbind_queue(&name, exchange, routing_key)
            .await
    }

    /// Purges every ready message from the queue.
    pub async fn purge(&self) -> Result<()> {
        let name = self.effective_name().await;
        self.read_channel().await?.purge_queue(&name).await
    }

    /// Deletes the queue and forgets the assertion state.
    pub async fn delete(&self) -> Result<()> {
        let channel = self.read_channel().await?;
        let mut asserted = self.asserted.lock().await;
        let name = self.effective_name().await;
        channel.delete_queue(&name).await?;
        *asserted = None;
        Ok(())
    }

    async fn read_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let handle = self.channels.get(READ_CHANNEL).await;
        handle.connect().await?;
        handle.channel().await
    }
}

async fn consume_loop(
    queue: String,
    mut stream: DeliveryStream,
    chain: HandlerChain,
    channel: Arc<dyn AmqpChannel>,
    requeue_on_failure: bool,
) {
    let tracer = global::tracer("amqp consumer");

    while let Some(delivery) = stream.next().await {
        let (_ctx, mut span) = otel::consumer_span(&delivery.properties, &tracer, &queue);
        debug!(queue = %queue, exchange = %delivery.exchange, "received message");

        let msg = Arc::new(InboundMessage::from_delivery(
            delivery,
            Arc::clone(&channel),
            requeue_on_failure,
        ));

        match chain.run(Arc::clone(&msg)).await {
            ChainOutcome::Completed => match msg.ack().await {
                Ok(()) => span.set_status(Status::Ok),
                Err(err) => {
                    error!(error = err.to_string(), "error whiling ack msg");
                    span.record_error(&err);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                }
            },
            ChainOutcome::Aborted => {
                warn!(queue = %queue, "handler chain aborted, rejecting message");
                reject(&msg, &mut span).await;
            }
            ChainOutcome::Failed(reason) => {
                warn!(queue = %queue, reason, "handler chain failed, rejecting message");
                reject(&msg, &mut span).await;
            }
        }
    }

    debug!(queue = %queue, "consumer stream ended");
}

async fn reject(msg: &InboundMessage, span: &mut opentelemetry::global::BoxedSpan) {
    match msg.nack().await {
        Ok(()) => span.set_status(Status::Error {
            description: Cow::from("message rejected"),
        }),
        Err(err) => {
            error!(error = err.to_string(), "error whiling nack msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to nack msg"),
            });
        }
    }
}
