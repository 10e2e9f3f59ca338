// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # coney
//!
//! Ergonomic RabbitMQ client: cluster-aware connection management with
//! round-robin failover and automatic reconnection, self-healing named
//! channels, declarative topology assertion, a JSON-first message codec and
//! composable consumer handler chains with automatic acknowledgement and
//! dead-letter semantics.
//!
//! ```ignore
//! use coney::{Broker, BrokerConfig, ExchangeSpec, QueueSpec, PublishOptions, handler_fn};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> coney::Result<()> {
//!     let config = BrokerConfig::new()
//!         .nodes("amqp://rabbit-1,amqp://rabbit-2")
//!         .exchange("orders", ExchangeSpec::default().direct_binding("created", "billing"))
//!         .queue("billing", QueueSpec::default().dead_letter_exchange("dlx"));
//!
//!     let broker = Broker::new(config)?;
//!     broker.connect().await?;
//!
//!     broker
//!         .queue("billing")
//!         .await
//!         .subscribe(vec![handler_fn(|msg, next| async move {
//!             tracing::info!(routing_key = %msg.routing_key, "billing order");
//!             next.proceed().await
//!         })])
//!         .await?;
//!
//!     broker
//!         .exchange("orders")
//!         .await
//!         .publish("created", json!({"order": 1}), PublishOptions::new())
//!         .await
//! }
//! ```

mod otel;
mod topology;

pub mod amqp;
pub mod broker;
pub mod channel;
pub mod config;
pub mod connection;
pub mod driver;
pub mod endpoint;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod queue;

#[cfg(test)]
pub(crate) mod support;

pub use broker::Broker;
pub use channel::Channel;
pub use config::{BrokerConfig, ConnectPolicy, ConnectionSpec, NestedConfig, NodeSpec, RetryPolicy};
pub use driver::{AmqpChannel, AmqpConnection, AmqpDriver};
pub use endpoint::{Endpoint, EndpointConfig, NodeList, Protocol};
pub use errors::{BrokerError, Result};
pub use exchange::{Exchange, ExchangeKind, ExchangeSpec};
pub use handler::{handler_fn, ChainOutcome, ConsumerHandler, HandlerError, Next};
pub use message::{Content, InboundMessage, Payload, PublishOptions};
pub use queue::{Queue, QueueSpec};
