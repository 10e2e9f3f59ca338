// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # Named Channel Registry
//!
//! This module manages the long-lived named channels of a broker instance.
//! Accessors are lazy: the first access materializes an unborn entry, and
//! `connect()` opens it on the live connection, triggering the broker
//! connect first when necessary.
//!
//! Every open channel is watched by a supervision task. When the underlying
//! channel closes involuntarily while the connection is still alive, the
//! channel reopens itself on the same connection; when the whole connection
//! dropped, the channel stays closed and is resurrected by the connection
//! manager upon reconnect. A user-initiated `close()` sets the `closing`
//! flag first and keeps the channel closed.

use crate::connection::ConnectionManager;
use crate::driver::AmqpChannel;
use crate::errors::{BrokerError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

/// Channel used by queue facades for subscriptions, acks and prefetch.
pub const READ_CHANNEL: &str = "__read__";
/// Channel used by exchange facades for publishes and topology assertion.
pub const WRITE_CHANNEL: &str = "__write__";

/// A named channel slot surviving breakage of the underlying channel.
pub struct Channel {
    /// Back-reference handed to supervision tasks
    weak: Weak<Channel>,
    name: String,
    manager: Arc<ConnectionManager>,
    inner: RwLock<Option<Arc<dyn AmqpChannel>>>,
    closing: AtomicBool,
    generation: AtomicU64,
    connect_lock: Mutex<()>,
}

impl Channel {
    fn new(name: &str, manager: Arc<ConnectionManager>) -> Arc<Channel> {
        Arc::new_cyclic(|weak| Channel {
            weak: Weak::clone(weak),
            name: name.to_owned(),
            manager,
            inner: RwLock::new(None),
            closing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            connect_lock: Mutex::new(()),
        })
    }

    /// The registry name of this channel.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the underlying channel is currently open.
    pub async fn connected(&self) -> bool {
        self.inner
            .read()
            .await
            .as_ref()
            .map(|channel| channel.is_open())
            .unwrap_or(false)
    }

    /// The underlying channel.
    ///
    /// # Errors
    /// `Channel not opened` before `connect()` or after a close.
    pub async fn channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        self.inner
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(BrokerError::ChannelNotOpen)
    }

    /// Opens the channel, connecting the broker first when necessary.
    ///
    /// Idempotent: an already open channel is left untouched.
    ///
    /// Returns a boxed future rather than using `async fn` sugar: this
    /// method and `handle_close` recur into each other through the
    /// supervision task, and the compiler cannot resolve the resulting
    /// auto-trait cycle on an opaque `impl Future` return type.
    pub fn connect(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let _guard = self.connect_lock.lock().await;
            if self.connected().await {
                return Ok(());
            }

            self.closing.store(false, Ordering::SeqCst);

            // Reuse the held connection when there is one; a dead one surfaces as
            // a channel-allocation error and the reconnect supervisor takes over.
            let connection = match self.manager.connection().await {
                Ok(connection) => connection,
                Err(_) => {
                    self.manager.connect().await?;
                    self.manager.connection().await?
                }
            };

            debug!(channel = %self.name, "opening channel");
            let channel = connection.create_channel().await?;
            *self.inner.write().await = Some(Arc::clone(&channel));
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

            if let Some(slot) = self.weak.upgrade() {
                tokio::spawn(async move {
                    channel.closed().await;
                    slot.handle_close(generation).await;
                });
            }

            Ok(())
        })
    }

    async fn handle_close(&self, generation: u64) {
        // A newer underlying channel may already be open in this slot.
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        *self.inner.write().await = None;

        if self.closing.load(Ordering::SeqCst) {
            debug!(channel = %self.name, "channel closed");
            return;
        }

        if !self.manager.connected().await {
            // The connection dropped; the manager resurrects us on reconnect.
            debug!(channel = %self.name, "channel closed with the connection");
            return;
        }

        warn!(channel = %self.name, "channel closed unexpectedly, reopening");
        if let Some(slot) = self.weak.upgrade() {
            tokio::spawn(async move {
                if let Err(err) = slot.connect().await {
                    error!(error = err.to_string(), channel = %slot.name, "failure to reopen the channel");
                }
            });
        }
    }

    /// Closes the channel and keeps it closed.
    ///
    /// The entry stays in the registry and can be reopened with `connect()`.
    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        let channel = self.inner.write().await.take();
        if let Some(channel) = channel {
            channel.close().await?;
        }
        Ok(())
    }
}

/// Lazy map of named channels, owned by one broker instance.
pub struct ChannelRegistry {
    manager: Arc<ConnectionManager>,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    pub(crate) fn new(manager: Arc<ConnectionManager>) -> ChannelRegistry {
        ChannelRegistry {
            manager,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the named channel, materializing an unborn entry on first use.
    pub async fn get(&self, name: &str) -> Arc<Channel> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(name) {
            return Arc::clone(channel);
        }
        let channel = Channel::new(name, Arc::clone(&self.manager));
        channels.insert(name.to_owned(), Arc::clone(&channel));
        channel
    }

    /// Every registered channel, for resurrection after reconnect.
    pub async fn all(&self) -> Vec<Arc<Channel>> {
        self.channels.lock().await.values().cloned().collect()
    }
}
