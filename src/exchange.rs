// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # Exchange Specification and Facade
//!
//! This module defines the declarative exchange specification and the lazy
//! exchange facade. A specification may carry routing shorthands: `fanout`
//! (queue names), `topics` and `direct` (routing key to queue maps) imply
//! both the exchange kind and the bindings installed by the topology loader.
//!
//! The facade asserts the exchange at most once per connection epoch, so a
//! reconnect re-declares it while steady-state calls stay no-ops. Publishes
//! go through the shared write channel and encode payloads with the message
//! codec.

use crate::channel::{ChannelRegistry, WRITE_CHANNEL};
use crate::connection::ConnectionManager;
use crate::driver::{AmqpChannel, Arguments, ExchangeOptions};
use crate::errors::Result;
use crate::message::{encode, Payload, PublishOptions};
use crate::otel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Argument key carrying the alternate exchange of a declaration.
pub const AMQP_HEADERS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Routing behavior of an exchange.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => write!(f, "direct"),
            ExchangeKind::Fanout => write!(f, "fanout"),
            ExchangeKind::Topic => write!(f, "topic"),
            ExchangeKind::Headers => write!(f, "headers"),
        }
    }
}

/// One or several queue names referenced by a routing shorthand.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum QueueRef {
    One(String),
    Many(Vec<String>),
}

impl QueueRef {
    /// The referenced queue names, in declaration order.
    pub fn names(&self) -> Vec<&str> {
        match self {
            QueueRef::One(name) => vec![name.as_str()],
            QueueRef::Many(names) => names.iter().map(String::as_str).collect(),
        }
    }
}

/// Declarative description of an exchange.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExchangeSpec {
    /// Exchange name, the configuration key when unset
    pub name: Option<String>,
    /// Explicit kind; inferred from the routing shorthands when unset
    #[serde(rename = "type")]
    pub kind: Option<ExchangeKind>,
    /// Default true
    pub durable: Option<bool>,
    pub internal: Option<bool>,
    pub auto_delete: Option<bool>,
    pub alternate_exchange: Option<String>,
    pub arguments: BTreeMap<String, serde_json::Value>,
    /// Queues bound without a routing key; implies a fanout exchange
    pub fanout: Option<Vec<String>>,
    /// Routing key to queue bindings; implies a topic exchange
    pub topics: Option<BTreeMap<String, QueueRef>>,
    /// Routing key to queue bindings; implies a direct exchange
    pub direct: Option<BTreeMap<String, QueueRef>>,
}

impl ExchangeSpec {
    /// Creates a specification with the given name.
    pub fn named(name: &str) -> ExchangeSpec {
        ExchangeSpec {
            name: Some(name.to_owned()),
            ..ExchangeSpec::default()
        }
    }

    /// Sets the kind explicitly.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Marks the exchange non-durable.
    pub fn transient(mut self) -> Self {
        self.durable = Some(false);
        self
    }

    /// Marks the exchange internal.
    pub fn internal(mut self) -> Self {
        self.internal = Some(true);
        self
    }

    /// Sets the exchange to auto-delete when unused.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = Some(true);
        self
    }

    /// Sets the alternate exchange.
    pub fn alternate_exchange(mut self, name: &str) -> Self {
        self.alternate_exchange = Some(name.to_owned());
        self
    }

    /// Adds a declaration argument.
    pub fn argument(mut self, key: &str, value: serde_json::Value) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }

    /// Fans every message out to the given queues.
    pub fn fanout_to(mut self, queues: &[&str]) -> Self {
        self.fanout = Some(queues.iter().map(|q| (*q).to_owned()).collect());
        self
    }

    /// Routes the topic pattern to the given queue.
    pub fn topic_binding(mut self, routing_key: &str, queue: &str) -> Self {
        self.topics
            .get_or_insert_with(BTreeMap::new)
            .insert(routing_key.to_owned(), QueueRef::One(queue.to_owned()));
        self
    }

    /// Routes the exact key to the given queue.
    pub fn direct_binding(mut self, routing_key: &str, queue: &str) -> Self {
        self.direct
            .get_or_insert_with(BTreeMap::new)
            .insert(routing_key.to_owned(), QueueRef::One(queue.to_owned()));
        self
    }

    /// The declared kind, inferred from the routing shorthands when implicit.
    ///
    /// Precedence: explicit kind, `topics`, `fanout`, `direct`, topic.
    pub fn effective_kind(&self) -> ExchangeKind {
        if let Some(kind) = self.kind {
            kind
        } else if self.topics.is_some() {
            ExchangeKind::Topic
        } else if self.fanout.is_some() {
            ExchangeKind::Fanout
        } else if self.direct.is_some() {
            ExchangeKind::Direct
        } else {
            ExchangeKind::Topic
        }
    }

    pub(crate) fn options(&self) -> ExchangeOptions {
        ExchangeOptions {
            durable: self.durable.unwrap_or(true),
            auto_delete: self.auto_delete.unwrap_or(false),
            internal: self.internal.unwrap_or(false),
            passive: false,
        }
    }

    pub(crate) fn argument_table(&self) -> Arguments {
        let mut arguments = self.arguments.clone();
        if let Some(alternate) = &self.alternate_exchange {
            arguments.insert(
                AMQP_HEADERS_ALTERNATE_EXCHANGE.to_owned(),
                serde_json::Value::String(alternate.clone()),
            );
        }
        arguments
    }
}

/// Lazy facade over one exchange.
pub struct Exchange {
    name: String,
    spec: ExchangeSpec,
    manager: Arc<ConnectionManager>,
    channels: Arc<ChannelRegistry>,
    /// Connection epoch of the last successful assertion
    asserted: Mutex<Option<u64>>,
}

impl Exchange {
    pub(crate) fn new(
        name: &str,
        spec: ExchangeSpec,
        manager: Arc<ConnectionManager>,
        channels: Arc<ChannelRegistry>,
    ) -> Arc<Exchange> {
        Arc::new(Exchange {
            name: name.to_owned(),
            spec,
            manager,
            channels,
            asserted: Mutex::new(None),
        })
    }

    /// The exchange name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The effective kind of this exchange.
    pub fn kind(&self) -> ExchangeKind {
        self.spec.effective_kind()
    }

    /// Declares the exchange, once per entity per connection epoch.
    ///
    /// Concurrent callers await the first assertion instead of issuing a
    /// second server call.
    pub async fn assert(&self) -> Result<()> {
        // Channel first: connecting may run the topology loader, which
        // asserts this very entity and must not find the lock held.
        let channel = self.write_channel().await?;
        let mut asserted = self.asserted.lock().await;
        let epoch = self.manager.epoch();
        if *asserted == Some(epoch) {
            return Ok(());
        }

        debug!(exchange = %self.name, kind = %self.spec.effective_kind(), "creating exchange");
        channel
            .assert_exchange(
                &self.name,
                self.spec.effective_kind(),
                &self.spec.options(),
                &self.spec.argument_table(),
            )
            .await?;

        *asserted = Some(epoch);
        Ok(())
    }

    /// Binds the named queue to this exchange.
    pub async fn bind(&self, queue: &str, routing_key: &str) -> Result<()> {
        debug!(
            queue,
            exchange = %self.name,
            routing_key,
            "binding queue to exchange"
        );
        self.write_channel()
            .await?
            .bind_queue(queue, &self.name, routing_key)
            .await
    }

    /// Removes a binding of the named queue from this exchange.
    pub async fn unbind(&self, queue: &str, routing_key: &str) -> Result<()> {
        self.write_channel()
            .await?
            .unbind_queue(queue, &self.name, routing_key)
            .await
    }

    /// Publishes a payload with the given routing key.
    ///
    /// Asserts the exchange lazily, encodes the payload and injects the
    /// current trace context into the message headers.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<()> {
        self.assert().await?;

        let mut options = options;
        otel::inject_context(&mut options.headers);
        let (data, options) = encode(payload.into(), options)?;

        self.write_channel()
            .await?
            .publish(&self.name, routing_key, &data, &options)
            .await
    }

    /// Checks existence without declaring.
    pub async fn check(&self) -> Result<()> {
        self.write_channel().await?.check_exchange(&self.name).await
    }

    /// Deletes the exchange and forgets the assertion state.
    pub async fn delete(&self) -> Result<()> {
        let channel = self.write_channel().await?;
        let mut asserted = self.asserted.lock().await;
        channel.delete_exchange(&self.name).await?;
        *asserted = None;
        Ok(())
    }

    async fn write_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let handle = self.channels.get(WRITE_CHANNEL).await;
        handle.connect().await?;
        handle.channel().await
    }
}
