// Copyright (c) 2025, The Coney Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error enum shared by every fallible operation in
//! the crate. Configuration errors carry the offending value in their message
//! and are raised synchronously at construction time; transport errors wrap
//! whatever the underlying AMQP driver reported.

use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Represents every error surfaced by the broker client.
///
/// The message strings of the configuration variants are part of the public
/// contract: callers match on them to learn which field of a connection
/// specification was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The protocol of an endpoint was neither `amqp` nor `amqps`
    #[error("Invalid protocol '{0}'")]
    InvalidProtocol(String),

    /// The port was non-numeric or outside `[0, 65535]`
    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    /// The channelMax was non-numeric or outside `[0, 2^16-1]`
    #[error("Invalid channelMax '{0}'. Expected range between 0 and 2^16-1")]
    InvalidChannelMax(String),

    /// The frameMax was non-numeric or outside `[0, 2^32-1]`
    #[error("Invalid frameMax '{0}'. Expected range between 0 and 2^32-1")]
    InvalidFrameMax(String),

    /// The heartbeat was non-numeric or outside `[0, 2^32-1]`
    #[error("Invalid heartbeat '{0}'. Expected range between 0 and 2^32-1")]
    InvalidHeartbeat(String),

    /// The vhost did not begin with a slash
    #[error("Invalid vhost '{0}'. Must start with '/'")]
    InvalidVhost(String),

    /// A connection string could not be parsed as a URL at all
    #[error("Invalid connection string '{0}'")]
    MalformedUri(String),

    /// The live connection was requested while the broker is disconnected
    #[error("Broker is not connected")]
    NotConnected,

    /// The underlying channel of a named channel was requested before `connect()`
    #[error("Channel not opened")]
    ChannelNotOpen,

    /// A second subscription was requested on a queue entity that already has one
    #[error("A consumer already exists for that queue in that context")]
    SubscriptionConflict,

    /// Error serializing an outbound payload
    #[error("failure to encode payload: {0}")]
    EncodePayload(String),

    /// Error raised by the underlying AMQP driver
    #[error("transport failure: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Wraps a driver-level failure.
    pub fn transport<T: ToString>(message: T) -> Self {
        Self::Transport(message.to_string())
    }
}
