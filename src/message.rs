// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # Message Codec
//!
//! This module encodes outbound payloads and decodes inbound deliveries.
//! Structured payloads are serialized as JSON and stamped with
//! `application/json` unless the caller chose another content type; raw byte
//! payloads pass through untouched. Missing publish properties receive
//! defaults: a 21-char URL-safe message id, the current epoch millisecond
//! timestamp and a process-identifier app id.
//!
//! Inbound deliveries whose content type is `application/json` are parsed
//! into structured values; anything else is exposed as raw bytes.

use crate::driver::{AmqpChannel, Delivery};
use crate::errors::{BrokerError, Result};
use nanoid::nanoid;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Content type stamped on payloads encoded by this crate.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// An outbound payload: raw bytes or a JSON value.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    /// Already-encoded bytes, passed through untouched
    Raw(Vec<u8>),
    /// A structured value serialized as JSON by the codec
    Json(serde_json::Value),
}

impl Payload {
    /// Serializes any `Serialize` value into a JSON payload.
    pub fn json<T: Serialize>(value: T) -> Result<Payload> {
        serde_json::to_value(value)
            .map(Payload::Json)
            .map_err(|err| BrokerError::EncodePayload(err.to_string()))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Raw(bytes.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Json(serde_json::Value::String(value.to_owned()))
    }
}

/// Properties attached to an outbound publish.
///
/// Everything is optional; the codec injects defaults for `message_id`,
/// `timestamp` and `app_id`, and sets `content_type` when it encoded the
/// payload itself. Caller-supplied values always win.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PublishOptions {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    /// Epoch milliseconds
    pub timestamp: Option<u64>,
    /// The AMQP `type` property
    pub kind: Option<String>,
    pub app_id: Option<String>,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub persistent: Option<bool>,
    pub headers: BTreeMap<String, String>,
}

impl PublishOptions {
    /// Creates empty options, every property defaulted by the codec.
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    /// Sets the content type.
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    /// Sets the correlation id.
    pub fn correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    /// Sets the reply-to queue.
    pub fn reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    /// Sets the message id.
    pub fn message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    /// Sets the AMQP `type` property.
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Marks the message persistent.
    pub fn persistent(mut self) -> Self {
        self.persistent = Some(true);
        self
    }

    /// Adds a header.
    pub fn header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_owned(), value.to_owned());
        self
    }
}

/// Properties observed on an inbound delivery.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    /// The AMQP `type` property
    pub kind: Option<String>,
    pub app_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Decoded content of an inbound delivery.
#[derive(Clone, Debug, PartialEq)]
pub enum Content {
    /// Parsed from an `application/json` body
    Json(serde_json::Value),
    /// Anything else, exposed as received
    Raw(Vec<u8>),
}

impl Content {
    /// Returns the parsed value when the content was JSON.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Content::Json(value) => Some(value),
            Content::Raw(_) => None,
        }
    }
}

/// Encodes an outbound payload.
///
/// Raw payloads pass through without touching the content type. JSON payloads
/// are serialized and stamped `application/json` unless the caller already
/// chose a content type, which is preserved as given.
///
/// # Returns
/// The wire bytes together with the completed options.
pub fn encode(payload: Payload, options: PublishOptions) -> Result<(Vec<u8>, PublishOptions)> {
    let mut options = options;

    let data = match payload {
        Payload::Raw(bytes) => bytes,
        Payload::Json(value) => {
            let bytes = serde_json::to_vec(&value)
                .map_err(|err| BrokerError::EncodePayload(err.to_string()))?;
            if options.content_type.is_none() {
                options.content_type = Some(JSON_CONTENT_TYPE.to_owned());
            }
            bytes
        }
    };

    if options.message_id.is_none() {
        options.message_id = Some(nanoid!());
    }
    if options.timestamp.is_none() {
        options.timestamp = Some(epoch_millis());
    }
    if options.app_id.is_none() {
        options.app_id = Some(process_app_id());
    }

    Ok((data, options))
}

/// Decodes an inbound body according to its content type.
///
/// A body that claims `application/json` but fails to parse is exposed raw.
pub fn decode(data: &[u8], properties: &MessageProperties) -> Content {
    if properties.content_type.as_deref() == Some(JSON_CONTENT_TYPE) {
        match serde_json::from_slice(data) {
            Ok(value) => return Content::Json(value),
            Err(err) => {
                tracing::warn!(error = err.to_string(), "failure to parse json body");
            }
        }
    }
    Content::Raw(data.to_vec())
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn process_app_id() -> String {
    let name = std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned());
    format!("{}:{}", name, std::process::id())
}

/// A delivery handed to consumer handlers.
///
/// Carries the decoded content, the delivery metadata and a one-shot
/// acknowledgement handle. The first settlement wins; the subscriber settles
/// automatically from the chain outcome when no handler did it explicitly.
pub struct InboundMessage {
    pub content: Content,
    pub properties: MessageProperties,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    acker: Acker,
}

impl InboundMessage {
    pub(crate) fn from_delivery(
        delivery: Delivery,
        channel: Arc<dyn AmqpChannel>,
        requeue_on_failure: bool,
    ) -> InboundMessage {
        let content = decode(&delivery.data, &delivery.properties);
        InboundMessage {
            content,
            properties: delivery.properties,
            exchange: delivery.exchange,
            routing_key: delivery.routing_key,
            redelivered: delivery.redelivered,
            acker: Acker {
                settled: AtomicBool::new(false),
                channel,
                delivery_tag: delivery.delivery_tag,
                requeue_on_failure,
            },
        }
    }

    /// Acknowledges the delivery. No-op when already settled.
    pub async fn ack(&self) -> Result<()> {
        self.acker.settle(true).await
    }

    /// Rejects the delivery. No-op when already settled.
    ///
    /// Messages from queues without a dead-letter exchange are requeued;
    /// messages from queues with one are dead-lettered.
    pub async fn nack(&self) -> Result<()> {
        self.acker.settle(false).await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("properties", &self.properties)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// One-shot acknowledgement state: the first settlement wins.
struct Acker {
    settled: AtomicBool,
    channel: Arc<dyn AmqpChannel>,
    delivery_tag: u64,
    requeue_on_failure: bool,
}

impl Acker {
    async fn settle(&self, success: bool) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if success {
            self.channel.ack(self.delivery_tag, false).await
        } else {
            self.channel
                .nack(self.delivery_tag, false, self.requeue_on_failure)
                .await
        }
    }
}
