// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # Lapin Driver
//!
//! Production implementation of the driver seam on top of lapin. This module
//! is a thin translation layer: it renders endpoints as AMQP URIs, maps the
//! crate's option and property types onto lapin's, and converts lapin's
//! delivery stream into the crate's [`DeliveryStream`].
//!
//! Close signals are derived from the connection and channel status, since
//! lapin exposes no public close event on channels.

use crate::driver::{
    AmqpChannel, AmqpConnection, AmqpDriver, Arguments, DeclaredQueue, Delivery, DeliveryStream,
    ExchangeOptions, QueueOptions,
};
use crate::endpoint::Endpoint;
use crate::errors::{BrokerError, Result};
use crate::exchange::ExchangeKind;
use crate::message::{MessageProperties, PublishOptions};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, BasicRecoverOptions, BasicRejectOptions,
    ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

const CLOSE_REPLY_SUCCESS: u16 = 200;
const STATUS_PROBE_INTERVAL: Duration = Duration::from_millis(50);

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        BrokerError::Transport(err.to_string())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

/// Driver dialing real brokers through lapin.
#[derive(Debug, Default)]
pub struct LapinDriver;

impl LapinDriver {
    pub fn new() -> LapinDriver {
        LapinDriver
    }
}

#[async_trait]
impl AmqpDriver for LapinDriver {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn AmqpConnection>> {
        debug!(endpoint = %endpoint, "creating amqp connection");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(format!("coney-{}", Uuid::new_v4())));

        let connection = Connection::connect(&endpoint.dial_uri(), options).await?;
        debug!(endpoint = %endpoint, "amqp connected");

        Ok(Arc::new(LapinConnection { inner: connection }))
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        debug!("creating amqp channel");
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner.close(CLOSE_REPLY_SUCCESS, "closed").await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn closed(&self) {
        while self.inner.status().connected() {
            tokio::time::sleep(STATUS_PROBE_INTERVAL).await;
        }
    }
}

struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: &ExchangeOptions,
        arguments: &Arguments,
    ) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    internal: options.internal,
                    nowait: false,
                },
                field_table(arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                BrokerError::from(err)
            })
    }

    async fn check_exchange(&self, name: &str) -> Result<()> {
        // Passive declaration: the kind argument is ignored by the server.
        self.inner
            .exchange_declare(
                name,
                lapin::ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.inner
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn bind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        self.inner
            .exchange_bind(
                destination,
                source,
                routing_key,
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn unbind_exchange(&self, destination: &str, source: &str, routing_key: &str) -> Result<()> {
        self.inner
            .exchange_unbind(
                destination,
                source,
                routing_key,
                ExchangeUnbindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn assert_queue(
        &self,
        name: &str,
        options: &QueueOptions,
        arguments: &Arguments,
    ) -> Result<DeclaredQueue> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: options.passive,
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    nowait: false,
                },
                field_table(arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the queue");
                BrokerError::from(err)
            })?;

        Ok(DeclaredQueue {
            name: queue.name().as_str().to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.inner
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<()> {
        self.inner
            .queue_purge(name, QueuePurgeOptions::default())
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                BrokerError::from(err)
            })
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        options: &PublishOptions,
    ) -> Result<()> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                data,
                basic_properties(options),
            )
            .await?
            .await?;
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, data: &[u8], options: &PublishOptions) -> Result<()> {
        self.publish("", queue, data, options).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                BrokerError::from(err)
            })?;

        let stream = consumer
            .filter_map(|result| async move {
                match result {
                    Ok(delivery) => Some(convert_delivery(delivery)),
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        None
                    }
                }
            })
            .boxed();

        Ok(stream)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let message = self.inner.basic_get(queue, BasicGetOptions::default()).await?;
        Ok(message.map(|m| convert_delivery(m.delivery)))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await?;
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn recover(&self) -> Result<()> {
        self.inner
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await?;
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                BrokerError::from(err)
            })
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner.close(CLOSE_REPLY_SUCCESS, "closed").await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn closed(&self) {
        while self.inner.status().connected() {
            tokio::time::sleep(STATUS_PROBE_INTERVAL).await;
        }
    }
}

fn basic_properties(options: &PublishOptions) -> BasicProperties {
    let mut properties = BasicProperties::default();

    if let Some(value) = &options.content_type {
        properties = properties.with_content_type(ShortString::from(value.as_str()));
    }
    if let Some(value) = &options.content_encoding {
        properties = properties.with_content_encoding(ShortString::from(value.as_str()));
    }
    if let Some(value) = &options.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(value.as_str()));
    }
    if let Some(value) = &options.reply_to {
        properties = properties.with_reply_to(ShortString::from(value.as_str()));
    }
    if let Some(value) = &options.message_id {
        properties = properties.with_message_id(ShortString::from(value.as_str()));
    }
    if let Some(value) = options.timestamp {
        properties = properties.with_timestamp(value);
    }
    if let Some(value) = &options.kind {
        properties = properties.with_type(ShortString::from(value.as_str()));
    }
    if let Some(value) = &options.app_id {
        properties = properties.with_app_id(ShortString::from(value.as_str()));
    }
    if let Some(value) = &options.expiration {
        properties = properties.with_expiration(ShortString::from(value.as_str()));
    }
    if let Some(value) = options.priority {
        properties = properties.with_priority(value);
    }
    if let Some(persistent) = options.persistent {
        properties = properties.with_delivery_mode(if persistent { 2 } else { 1 });
    }
    if !options.headers.is_empty() {
        let mut table = BTreeMap::new();
        for (key, value) in &options.headers {
            table.insert(
                ShortString::from(key.as_str()),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }
        properties = properties.with_headers(FieldTable::from(table));
    }

    properties
}

fn convert_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_owned(),
        routing_key: delivery.routing_key.as_str().to_owned(),
        redelivered: delivery.redelivered,
        properties: convert_properties(&delivery.properties),
        data: delivery.data,
    }
}

fn convert_properties(properties: &BasicProperties) -> MessageProperties {
    let short = |value: &Option<ShortString>| value.as_ref().map(|v| v.as_str().to_owned());

    let mut headers = BTreeMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            match value {
                AMQPValue::LongString(text) => {
                    if let Ok(text) = std::str::from_utf8(text.as_bytes()) {
                        headers.insert(key.as_str().to_owned(), text.to_owned());
                    }
                }
                AMQPValue::ShortString(text) => {
                    headers.insert(key.as_str().to_owned(), text.as_str().to_owned());
                }
                _ => {}
            }
        }
    }

    MessageProperties {
        content_type: short(properties.content_type()),
        content_encoding: short(properties.content_encoding()),
        correlation_id: short(properties.correlation_id()),
        reply_to: short(properties.reply_to()),
        message_id: short(properties.message_id()),
        timestamp: *properties.timestamp(),
        kind: short(properties.kind()),
        app_id: short(properties.app_id()),
        headers,
    }
}

fn field_table(arguments: &Arguments) -> FieldTable {
    let mut table = BTreeMap::new();
    for (key, value) in arguments {
        let amqp_value = match value {
            serde_json::Value::String(text) => {
                AMQPValue::LongString(LongString::from(text.as_str()))
            }
            serde_json::Value::Bool(flag) => AMQPValue::Boolean(*flag),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(int) => AMQPValue::LongLongInt(int),
                None => AMQPValue::Double(number.as_f64().unwrap_or(0.0)),
            },
            other => AMQPValue::LongString(LongString::from(other.to_string())),
        };
        table.insert(ShortString::from(key.as_str()), amqp_value);
    }
    FieldTable::from(table)
}
