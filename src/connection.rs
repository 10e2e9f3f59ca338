// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # Cluster Connection Management
//!
//! This module owns the single connection of a broker instance. Dialing walks
//! the node list round-robin: the cursor only advances on a failed dial, one
//! cluster attempt is one full pass over the list, and the retry policy
//! bounds how many passes are made with an optional pause between them.
//!
//! A supervision task waits on the close signal of every established
//! connection. An involuntary close triggers reconnection from the current
//! cursor position, which naturally fails over across a cluster; a
//! user-initiated close sets the `closing` flag first and wins the race.
//! After every successful connect the registered channels are resurrected and
//! the declarative topology is reinstalled through the connected hook.

use crate::config::RetryPolicy;
use crate::driver::{AmqpConnection, AmqpDriver};
use crate::endpoint::NodeList;
use crate::errors::{BrokerError, Result};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// Lifecycle state of the broker connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Hook invoked after every successful connect, once the manager reports
/// connected. Used to resurrect channels and reinstall the topology.
pub(crate) type ConnectedHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Cluster-aware connection manager with round-robin failover.
pub struct ConnectionManager {
    /// Back-reference handed to supervision tasks
    weak: Weak<ConnectionManager>,
    driver: Arc<dyn AmqpDriver>,
    nodes: NodeList,
    policy: RetryPolicy,
    state: RwLock<ConnectionState>,
    current: RwLock<Option<Arc<dyn AmqpConnection>>>,
    cursor: AtomicUsize,
    closing: AtomicBool,
    epoch: AtomicU64,
    connect_lock: Mutex<()>,
    on_connected: std::sync::OnceLock<ConnectedHook>,
}

impl ConnectionManager {
    pub(crate) fn new(
        driver: Arc<dyn AmqpDriver>,
        nodes: NodeList,
        policy: RetryPolicy,
    ) -> Arc<ConnectionManager> {
        Arc::new_cyclic(|weak| ConnectionManager {
            weak: Weak::clone(weak),
            driver,
            nodes,
            policy,
            state: RwLock::new(ConnectionState::Disconnected),
            current: RwLock::new(None),
            cursor: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            connect_lock: Mutex::new(()),
            on_connected: std::sync::OnceLock::new(),
        })
    }

    pub(crate) fn set_on_connected(&self, hook: ConnectedHook) {
        let _ = self.on_connected.set(hook);
    }

    /// The canonical endpoint list, in round-robin order.
    pub fn nodes(&self) -> &NodeList {
        &self.nodes
    }

    /// Monotonic counter bumped on every successful connect.
    ///
    /// Facades key their assertion state on it so topology entities are
    /// re-declared after a failover.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Whether a usable connection is currently established.
    pub async fn connected(&self) -> bool {
        if *self.state.read().await != ConnectionState::Connected {
            return false;
        }
        self.current
            .read()
            .await
            .as_ref()
            .map(|conn| conn.is_open())
            .unwrap_or(false)
    }

    /// The live connection.
    ///
    /// # Errors
    /// `Broker is not connected` while disconnected.
    pub async fn connection(&self) -> Result<Arc<dyn AmqpConnection>> {
        self.current
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(BrokerError::NotConnected)
    }

    /// Connects with the configured policy.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with(None, None).await
    }

    /// Connects, overriding the retry policy for this call.
    ///
    /// Endpoints are attempted round-robin starting at the cursor; the cursor
    /// advances only on failure. After a full failed pass over the cluster the
    /// retry budget is consumed: `retry` more passes are made with a pause of
    /// `frequency` milliseconds between them, and exhaustion surfaces the last
    /// dial error. A `retry` of `None` falls back to the policy, which may be
    /// unlimited.
    ///
    /// Returns a boxed future rather than using `async fn` sugar: this
    /// method and `handle_close` recur into each other through the
    /// supervision task, and the compiler cannot resolve the resulting
    /// auto-trait cycle on an opaque `impl Future` return type.
    pub fn connect_with(
        &self,
        retry: Option<u64>,
        frequency: Option<u64>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let _guard = self.connect_lock.lock().await;
            if self.connected().await {
                return Ok(());
            }

            self.closing.store(false, Ordering::SeqCst);
            *self.state.write().await = ConnectionState::Connecting;

            let mut retries_left = retry.or(self.policy.retry);
            let frequency_ms = frequency.unwrap_or(self.policy.frequency_ms);
            let total = self.nodes.len();

            loop {
                // A user-initiated close short-circuits an in-flight reconnect.
                if self.closing.load(Ordering::SeqCst) {
                    *self.state.write().await = ConnectionState::Disconnected;
                    return Err(BrokerError::NotConnected);
                }

                let mut last_error = None;

                for _ in 0..total {
                    let index = self.cursor.load(Ordering::SeqCst) % total;
                    let endpoint = &self.nodes.endpoints()[index];
                    debug!(endpoint = %endpoint, "dialing broker");

                    match self.driver.connect(endpoint).await {
                        Ok(connection) => {
                            info!(endpoint = %endpoint, "broker connected");
                            self.install(connection).await;
                            return Ok(());
                        }
                        Err(err) => {
                            warn!(error = err.to_string(), endpoint = %endpoint, "failure to connect");
                            self.cursor.store((index + 1) % total, Ordering::SeqCst);
                            last_error = Some(err);
                        }
                    }
                }

                match retries_left {
                    Some(0) => {
                        *self.state.write().await = ConnectionState::Disconnected;
                        error!("connection attempts exhausted");
                        return Err(last_error.unwrap_or(BrokerError::NotConnected));
                    }
                    Some(remaining) => {
                        if frequency_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(frequency_ms)).await;
                        }
                        retries_left = Some(remaining - 1);
                    }
                    None => {
                        if frequency_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(frequency_ms)).await;
                        }
                    }
                }
            }
        })
    }

    async fn install(&self, connection: Arc<dyn AmqpConnection>) {
        *self.current.write().await = Some(Arc::clone(&connection));
        *self.state.write().await = ConnectionState::Connected;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(manager) = self.weak.upgrade() {
            tokio::spawn(async move {
                connection.closed().await;
                manager.handle_close(epoch).await;
            });
        }

        if let Some(hook) = self.on_connected.get() {
            hook().await;
        }
    }

    async fn handle_close(&self, epoch: u64) {
        // A newer connection may already be installed; its supervisor owns it.
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }

        *self.current.write().await = None;
        *self.state.write().await = ConnectionState::Disconnected;

        if self.closing.load(Ordering::SeqCst) {
            debug!("broker closed");
            return;
        }

        warn!("connection lost, reconnecting");
        if let Some(manager) = self.weak.upgrade() {
            tokio::spawn(async move {
                if let Err(err) = manager.connect_with(None, None).await {
                    if !manager.closing.load(Ordering::SeqCst) {
                        error!(error = err.to_string(), "failure to reconnect");
                    }
                }
            });
        }
    }

    /// Closes the connection and suppresses reconnection.
    ///
    /// Registered channels stay in the registry and are reused by a future
    /// `connect()`, but report disconnected until then.
    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        let connection = self.current.write().await.take();
        *self.state.write().await = ConnectionState::Disconnected;
        if let Some(connection) = connection {
            connection.close().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("nodes", &self.nodes.to_string())
            .field("policy", &self.policy)
            .finish()
    }
}
