// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! Test support: an in-memory driver implementing the full driver seam.
//!
//! Dial outcomes can be scripted per attempt, connections and channels can be
//! killed to simulate involuntary closes, and the shared broker state records
//! every declaration, binding, publish and settlement for assertions.

use crate::driver::{
    AmqpChannel, AmqpConnection, AmqpDriver, Arguments, DeclaredQueue, Delivery, DeliveryStream,
    ExchangeOptions, QueueOptions,
};
use crate::endpoint::Endpoint;
use crate::errors::{BrokerError, Result};
use crate::exchange::ExchangeKind;
use crate::message::{InboundMessage, MessageProperties, PublishOptions};
use crate::queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Notify;

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PublishedMessage {
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) data: Vec<u8>,
    pub(crate) options: PublishOptions,
}

#[derive(Default)]
struct QueueState {
    arguments: Arguments,
    pending: VecDeque<(Vec<u8>, MessageProperties, bool)>,
    consumer: Option<UnboundedSender<Delivery>>,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<(String, String)>,
}

struct Unacked {
    queue: String,
    routing_key: String,
    data: Vec<u8>,
    properties: MessageProperties,
}

#[derive(Default)]
struct StateInner {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<String, String>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    declared_exchanges: Vec<String>,
    declared_queues: Vec<String>,
    bindings: Vec<(String, String, String)>,
    prefetch_calls: Vec<u16>,
    cancelled: usize,
    acks: usize,
    nacks: Vec<bool>,
    published: Vec<PublishedMessage>,
}

/// Broker-side state shared by every connection of one mock driver.
#[derive(Default)]
pub(crate) struct MockState {
    inner: Mutex<StateInner>,
}

impl MockState {
    pub(crate) fn declared_exchanges(&self) -> Vec<String> {
        self.inner.lock().unwrap().declared_exchanges.clone()
    }

    pub(crate) fn declared_queues(&self) -> Vec<String> {
        self.inner.lock().unwrap().declared_queues.clone()
    }

    pub(crate) fn bindings(&self) -> Vec<(String, String, String)> {
        self.inner.lock().unwrap().bindings.clone()
    }

    pub(crate) fn prefetch_calls(&self) -> Vec<u16> {
        self.inner.lock().unwrap().prefetch_calls.clone()
    }

    pub(crate) fn cancelled_consumers(&self) -> usize {
        self.inner.lock().unwrap().cancelled
    }

    pub(crate) fn acks(&self) -> usize {
        self.inner.lock().unwrap().acks
    }

    pub(crate) fn nacks(&self) -> Vec<bool> {
        self.inner.lock().unwrap().nacks.clone()
    }

    pub(crate) fn published(&self) -> Vec<PublishedMessage> {
        self.inner.lock().unwrap().published.clone()
    }

    pub(crate) async fn queue_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().unwrap();
        inner
            .queues
            .get(queue)
            .map(|q| q.pending.iter().map(|(data, _, _)| data.clone()).collect())
            .unwrap_or_default()
    }

    /// Waits until `count` deliveries were acked or nacked.
    pub(crate) async fn wait_settled(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let inner = self.inner.lock().unwrap();
                    if inner.acks + inner.nacks.len() >= count {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("messages were not settled in time")
    }
}

fn properties_from(options: &PublishOptions) -> MessageProperties {
    MessageProperties {
        content_type: options.content_type.clone(),
        content_encoding: options.content_encoding.clone(),
        correlation_id: options.correlation_id.clone(),
        reply_to: options.reply_to.clone(),
        message_id: options.message_id.clone(),
        timestamp: options.timestamp,
        kind: options.kind.clone(),
        app_id: options.app_id.clone(),
        headers: options.headers.clone(),
    }
}

fn deliver(
    inner: &mut StateInner,
    queue: &str,
    routing_key: &str,
    data: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
) {
    let consumer = inner
        .queues
        .entry(queue.to_owned())
        .or_default()
        .consumer
        .clone();

    if let Some(consumer) = consumer {
        inner.next_tag += 1;
        let tag = inner.next_tag;
        inner.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_owned(),
                routing_key: routing_key.to_owned(),
                data: data.clone(),
                properties: properties.clone(),
            },
        );
        let delivery = Delivery {
            delivery_tag: tag,
            exchange: String::new(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            data,
        };
        match consumer.send(delivery) {
            Ok(()) => return,
            Err(failed) => {
                inner.unacked.remove(&tag);
                let delivery = failed.0;
                inner
                    .queues
                    .entry(queue.to_owned())
                    .or_default()
                    .pending
                    .push_back((delivery.data, delivery.properties, delivery.redelivered));
                return;
            }
        }
    }

    inner
        .queues
        .entry(queue.to_owned())
        .or_default()
        .pending
        .push_back((data, properties, redelivered));
}

fn route(
    inner: &mut StateInner,
    exchange: &str,
    routing_key: &str,
    data: &[u8],
    properties: &MessageProperties,
) {
    if exchange.is_empty() {
        deliver(inner, routing_key, routing_key, data.to_vec(), properties.clone(), false);
        return;
    }

    let targets: Vec<String> = match inner.exchanges.get(exchange) {
        None => Vec::new(),
        Some(state) => state
            .bindings
            .iter()
            .filter(|(_, key)| match state.kind {
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Direct | ExchangeKind::Topic => key == routing_key,
            })
            .map(|(queue, _)| queue.clone())
            .collect(),
    };

    for queue in targets {
        deliver(
            inner,
            &queue,
            routing_key,
            data.to_vec(),
            properties.clone(),
            false,
        );
    }
}

/// Scriptable in-memory driver.
pub(crate) struct MockDriver {
    state: Arc<MockState>,
    plan: Mutex<VecDeque<bool>>,
    default_outcome: Mutex<bool>,
    dials: Mutex<Vec<Endpoint>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
    channels: Arc<Mutex<Vec<Arc<MockChannel>>>>,
}

impl MockDriver {
    pub(crate) fn new() -> Arc<MockDriver> {
        Arc::new(MockDriver {
            state: Arc::new(MockState::default()),
            plan: Mutex::new(VecDeque::new()),
            default_outcome: Mutex::new(true),
            dials: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            channels: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub(crate) fn state(&self) -> Arc<MockState> {
        Arc::clone(&self.state)
    }

    /// Fails the next `count` dials.
    pub(crate) async fn fail_next(&self, count: usize) {
        let mut plan = self.plan.lock().unwrap();
        for _ in 0..count {
            plan.push_back(false);
        }
    }

    /// Fails every dial until further notice.
    pub(crate) async fn fail_always(&self) {
        *self.default_outcome.lock().unwrap() = false;
    }

    /// Scripts the outcome of the next dials, in order.
    pub(crate) async fn script(&self, outcomes: Vec<bool>) {
        let mut plan = self.plan.lock().unwrap();
        plan.extend(outcomes);
    }

    pub(crate) async fn dial_count(&self) -> usize {
        self.dials.lock().unwrap().len()
    }

    pub(crate) async fn dialed_hosts(&self) -> Vec<String> {
        self.dials.lock().unwrap().iter().map(|e| e.hostname.clone()).collect()
    }

    pub(crate) async fn dialed_ports(&self) -> Vec<u16> {
        self.dials.lock().unwrap().iter().map(|e| e.port).collect()
    }

    pub(crate) async fn channel_count(&self) -> usize {
        self.channels.lock().unwrap().len()
    }

    /// Kills every live connection, and its channels with it.
    pub(crate) async fn kill_connections(&self) {
        let connections: Vec<_> = self.connections.lock().unwrap().clone();
        for connection in connections {
            connection.kill();
        }
    }

    /// Kills the most recently created channel, leaving its connection alive.
    pub(crate) async fn kill_last_channel(&self) {
        let channel = self.channels.lock().unwrap().last().cloned();
        if let Some(channel) = channel {
            channel.kill();
        }
    }
}

#[async_trait]
impl AmqpDriver for MockDriver {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn AmqpConnection>> {
        self.dials.lock().unwrap().push(endpoint.clone());

        let outcome = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(*self.default_outcome.lock().unwrap());
        if !outcome {
            return Err(BrokerError::transport("connection refused"));
        }

        let connection = Arc::new(MockConnection {
            state: Arc::clone(&self.state),
            open: AtomicBool::new(true),
            close_signal: Notify::new(),
            channels: Mutex::new(Vec::new()),
            all_channels: Arc::clone(&self.channels),
        });
        self.connections.lock().unwrap().push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub(crate) struct MockConnection {
    state: Arc<MockState>,
    open: AtomicBool,
    close_signal: Notify,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    all_channels: Arc<Mutex<Vec<Arc<MockChannel>>>>,
}

impl MockConnection {
    pub(crate) fn kill(&self) {
        let channels: Vec<_> = self.channels.lock().unwrap().clone();
        for channel in channels {
            channel.kill();
        }
        self.open.store(false, Ordering::SeqCst);
        self.close_signal.notify_waiters();
    }
}

#[async_trait]
impl AmqpConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        if !self.is_open() {
            return Err(BrokerError::transport("connection closed"));
        }
        let channel = Arc::new(MockChannel {
            state: Arc::clone(&self.state),
            open: AtomicBool::new(true),
            close_signal: Notify::new(),
        });
        self.channels.lock().unwrap().push(Arc::clone(&channel));
        self.all_channels.lock().unwrap().push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        self.kill();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        let notified = self.close_signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_open() {
            return;
        }
        notified.await;
    }
}

pub(crate) struct MockChannel {
    state: Arc<MockState>,
    open: AtomicBool,
    close_signal: Notify,
}

impl MockChannel {
    pub(crate) fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.close_signal.notify_waiters();
    }
}

#[async_trait]
impl AmqpChannel for MockChannel {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        _options: &ExchangeOptions,
        _arguments: &Arguments,
    ) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        inner.declared_exchanges.push(name.to_owned());
        inner
            .exchanges
            .entry(name.to_owned())
            .or_insert_with(|| ExchangeState {
                kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn check_exchange(&self, name: &str) -> Result<()> {
        let inner = self.state.inner.lock().unwrap();
        if inner.exchanges.contains_key(name) {
            Ok(())
        } else {
            Err(BrokerError::transport("no exchange"))
        }
    }

    async fn delete_exchange(&self, name: &str) -> Result<()> {
        self.state.inner.lock().unwrap().exchanges.remove(name);
        Ok(())
    }

    async fn bind_exchange(&self, _destination: &str, _source: &str, _routing_key: &str) -> Result<()> {
        Ok(())
    }

    async fn unbind_exchange(&self, _destination: &str, _source: &str, _routing_key: &str) -> Result<()> {
        Ok(())
    }

    async fn assert_queue(
        &self,
        name: &str,
        _options: &QueueOptions,
        arguments: &Arguments,
    ) -> Result<DeclaredQueue> {
        let mut inner = self.state.inner.lock().unwrap();
        let name = if name.is_empty() {
            format!("amq.gen-{}", inner.declared_queues.len())
        } else {
            name.to_owned()
        };
        inner.declared_queues.push(name.clone());
        let entry = inner.queues.entry(name.clone()).or_default();
        entry.arguments = arguments.clone();
        Ok(DeclaredQueue {
            name,
            message_count: 0,
            consumer_count: 0,
        })
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.state.inner.lock().unwrap().queues.remove(name);
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        if let Some(queue) = inner.queues.get_mut(name) {
            queue.pending.clear();
        }
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        inner
            .bindings
            .push((queue.to_owned(), exchange.to_owned(), routing_key.to_owned()));
        if let Some(state) = inner.exchanges.get_mut(exchange) {
            state.bindings.push((queue.to_owned(), routing_key.to_owned()));
        }
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        if let Some(state) = inner.exchanges.get_mut(exchange) {
            state
                .bindings
                .retain(|(q, key)| !(q == queue && key == routing_key));
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        options: &PublishOptions,
    ) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        inner.published.push(PublishedMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.to_vec(),
            options: options.clone(),
        });
        let properties = properties_from(options);
        route(&mut inner, exchange, routing_key, data, &properties);
        Ok(())
    }

    async fn send_to_queue(&self, queue: &str, data: &[u8], options: &PublishOptions) -> Result<()> {
        self.publish("", queue, data, options).await
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut inner = self.state.inner.lock().unwrap();
            inner
                .consumers
                .insert(consumer_tag.to_owned(), queue.to_owned());
            let entry = inner.queues.entry(queue.to_owned()).or_default();
            entry.consumer = Some(sender);
            let pending: Vec<_> = entry.pending.drain(..).collect();
            for (data, properties, redelivered) in pending {
                deliver(&mut inner, queue, queue, data, properties, redelivered);
            }
        }
        let stream = futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
        .boxed();
        Ok(stream)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        if let Some(queue) = inner.consumers.remove(consumer_tag) {
            if let Some(state) = inner.queues.get_mut(&queue) {
                state.consumer = None;
            }
            inner.cancelled += 1;
        }
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>> {
        let mut inner = self.state.inner.lock().unwrap();
        let Some(entry) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some((data, properties, redelivered)) = entry.pending.pop_front() else {
            return Ok(None);
        };
        inner.next_tag += 1;
        let tag = inner.next_tag;
        inner.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_owned(),
                routing_key: queue.to_owned(),
                data: data.clone(),
                properties: properties.clone(),
            },
        );
        Ok(Some(Delivery {
            delivery_tag: tag,
            exchange: String::new(),
            routing_key: queue.to_owned(),
            redelivered,
            properties,
            data,
        }))
    }

    async fn ack(&self, delivery_tag: u64, _multiple: bool) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        inner.unacked.remove(&delivery_tag);
        inner.acks += 1;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, _multiple: bool, requeue: bool) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        inner.nacks.push(requeue);
        let Some(unacked) = inner.unacked.remove(&delivery_tag) else {
            return Ok(());
        };
        let Unacked {
            queue,
            routing_key,
            data,
            properties,
        } = unacked;

        if requeue {
            deliver(&mut inner, &queue, &routing_key, data, properties, true);
            return Ok(());
        }

        // Dead-letter per the queue's declaration arguments.
        let dlx = inner
            .queues
            .get(&queue)
            .and_then(|q| q.arguments.get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE))
            .and_then(|v| v.as_str().map(str::to_owned));
        if let Some(dlx) = dlx {
            let routing_key = inner
                .queues
                .get(&queue)
                .and_then(|q| q.arguments.get(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY))
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or(routing_key);
            route(&mut inner, &dlx, &routing_key, &data, &properties);
        }
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.nack(delivery_tag, false, requeue).await
    }

    async fn recover(&self) -> Result<()> {
        let mut inner = self.state.inner.lock().unwrap();
        let unacked: Vec<_> = inner.unacked.drain().map(|(_, u)| u).collect();
        for u in unacked {
            let Unacked {
                queue,
                routing_key,
                data,
                properties,
            } = u;
            deliver(&mut inner, &queue, &routing_key, data, properties, true);
        }
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        self.state.inner.lock().unwrap().prefetch_calls.push(count);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.kill();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        let notified = self.close_signal.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_open() {
            return;
        }
        notified.await;
    }
}

/// Builds a standalone inbound message for handler-chain tests.
pub(crate) fn inbound_message(data: &[u8]) -> Arc<InboundMessage> {
    let channel = Arc::new(MockChannel {
        state: Arc::new(MockState::default()),
        open: AtomicBool::new(true),
        close_signal: Notify::new(),
    });
    let delivery = Delivery {
        delivery_tag: 1,
        exchange: String::new(),
        routing_key: "test".to_owned(),
        redelivered: false,
        properties: MessageProperties::default(),
        data: data.to_vec(),
    };
    Arc::new(InboundMessage::from_delivery(delivery, channel, true))
}
