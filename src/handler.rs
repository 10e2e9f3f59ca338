// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # Consumer Handler Chain
//!
//! This module composes any number of consumer handlers into a single
//! pipeline. A handler receives the inbound message and a [`Next`]
//! continuation: calling `next.proceed().await` runs the rest of the chain,
//! returning without it ends the chain successfully, and returning an error
//! aborts the whole chain as a failure. Because `Next` is consumed by value a
//! handler cannot advance the chain twice, and a handler that awaits
//! `proceed` resumes for post-processing once everything downstream settled.
//!
//! The subscriber maps the chain outcome onto acknowledgements: completion
//! acks the delivery, abortion and failure nack it.

use crate::message::InboundMessage;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Outcome returned by a single handler.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// The failure signals a handler may raise.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The handler aborted the chain without an error value
    #[error("handler aborted the chain")]
    Abort,

    /// The handler failed with an error value
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Wraps any error value as a chain failure.
    pub fn failed<T: ToString>(err: T) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<crate::errors::BrokerError> for HandlerError {
    fn from(err: crate::errors::BrokerError) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

/// A single stage of the consumer pipeline.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one delivery.
    ///
    /// # Parameters
    /// * `msg` - The decoded inbound message
    /// * `next` - Continuation running the downstream handlers
    async fn handle(&self, msg: Arc<InboundMessage>, next: Next) -> HandlerResult;
}

/// Continuation into the rest of a handler chain.
///
/// Consumed by value; dropping it without calling [`Next::proceed`] ends the
/// chain at the current handler.
pub struct Next {
    handlers: Arc<[Arc<dyn ConsumerHandler>]>,
    index: usize,
    msg: Arc<InboundMessage>,
}

impl Next {
    /// Runs the downstream handlers and resolves once they settled.
    ///
    /// Past the last handler this is a no-op success. Errors from any
    /// downstream handler propagate back through this call.
    pub async fn proceed(self) -> HandlerResult {
        match self.handlers.get(self.index) {
            None => Ok(()),
            Some(handler) => {
                let handler = Arc::clone(handler);
                let next = Next {
                    handlers: Arc::clone(&self.handlers),
                    index: self.index + 1,
                    msg: Arc::clone(&self.msg),
                };
                handler.handle(Arc::clone(&self.msg), next).await
            }
        }
    }
}

/// Result of running a composed chain, consumed by the subscriber.
#[derive(Debug, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every invoked handler completed; the delivery is acknowledged
    Completed,
    /// A handler aborted without an error value; the delivery is rejected
    Aborted,
    /// A handler failed with the carried reason; the delivery is rejected
    Failed(String),
}

/// N handlers composed into one pipeline.
#[derive(Clone)]
pub struct HandlerChain {
    handlers: Arc<[Arc<dyn ConsumerHandler>]>,
}

impl HandlerChain {
    /// Composes the given handlers in order.
    pub fn new(handlers: Vec<Arc<dyn ConsumerHandler>>) -> HandlerChain {
        HandlerChain {
            handlers: handlers.into(),
        }
    }

    /// Runs the chain for one delivery and reports the outcome.
    pub async fn run(&self, msg: Arc<InboundMessage>) -> ChainOutcome {
        let next = Next {
            handlers: Arc::clone(&self.handlers),
            index: 0,
            msg,
        };
        match next.proceed().await {
            Ok(()) => ChainOutcome::Completed,
            Err(HandlerError::Abort) => ChainOutcome::Aborted,
            Err(HandlerError::Failed(reason)) => ChainOutcome::Failed(reason),
        }
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F> ConsumerHandler for FnHandler<F>
where
    F: Fn(Arc<InboundMessage>, Next) -> BoxFuture<'static, HandlerResult> + Send + Sync,
{
    async fn handle(&self, msg: Arc<InboundMessage>, next: Next) -> HandlerResult {
        (self.0)(msg, next).await
    }
}

/// Lifts an async closure into a [`ConsumerHandler`].
///
/// # Example
/// ```ignore
/// let handler = handler_fn(|msg, next| async move {
///     tracing::debug!(routing_key = %msg.routing_key, "received");
///     next.proceed().await
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(Arc<InboundMessage>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(move |msg, next| f(msg, next).boxed()))
}
