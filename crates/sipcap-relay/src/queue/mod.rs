// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Durable work queue delivery.
//!
//! [`QueueClient`] keeps one connection to the queue service and pushes
//! serialized trace records to the tail of a named list. Connection loss is
//! never fatal: [`QueueClient::reconnect_until_healthy`] blocks, backing off
//! between attempts, until the service answers its liveness check again or a
//! shutdown is requested.
//!
//! The wire protocol sits behind [`QueueTransport`]; [`resp::RedisTransport`]
//! speaks Redis RESP over TCP.

pub mod resp;

pub use resp::RedisTransport;

use crate::record::TraceRecord;
use crate::shutdown::ShutdownToken;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default list key records are pushed to.
pub const DEFAULT_QUEUE_KEY: &str = "sipcap:input";

/// Expected liveness check acknowledgement.
pub const ALIVE_TOKEN: &str = "PONG";

/// Backoff bounds (seconds).
pub const MIN_BACKOFF_SECS: u64 = 1;
pub const MAX_BACKOFF_SECS: u64 = 6;

/// Queue errors.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue connection error: {0}")]
    Connection(String),

    #[error("Queue push error: {0}")]
    Push(String),

    #[error("Not connected to queue")]
    NotConnected,

    #[error("Shutdown requested")]
    Shutdown,
}

/// Opens connections to the queue service.
pub trait QueueTransport {
    type Connection: QueueConnection;

    /// Establish a fresh connection.
    fn connect(&self) -> Result<Self::Connection, QueueError>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}

/// A live connection to the queue service.
///
/// Once any call fails the connection is considered unusable and is dropped
/// by the client.
pub trait QueueConnection {
    /// Send the liveness check and return the acknowledgement text.
    fn ping(&mut self) -> Result<String, QueueError>;

    /// Append `record` to the tail of the list named `key`.
    fn push(&mut self, key: &str, record: &[u8]) -> Result<(), QueueError>;
}

/// Backoff before the next reconnect attempt, in seconds.
///
/// Half the cumulative error count, rounded half-up, clamped to
/// `[MIN_BACKOFF_SECS, MAX_BACKOFF_SECS]`.
pub fn backoff_secs(connect_errors: u64, push_errors: u64) -> u64 {
    let total = connect_errors.saturating_add(push_errors);
    (total / 2 + total % 2).clamp(MIN_BACKOFF_SECS, MAX_BACKOFF_SECS)
}

/// Connection handle and error history, owned by the client.
#[derive(Debug)]
pub struct QueueConnectionState<C> {
    connection: Option<C>,
    connect_errors: u64,
    push_errors: u64,
}

impl<C> Default for QueueConnectionState<C> {
    fn default() -> Self {
        Self {
            connection: None,
            connect_errors: 0,
            push_errors: 0,
        }
    }
}

/// Resilient queue client.
pub struct QueueClient<T: QueueTransport> {
    transport: T,
    key: String,
    state: QueueConnectionState<T::Connection>,
    shutdown: ShutdownToken,
    backoff_unit: Duration,
}

impl<T: QueueTransport> QueueClient<T> {
    /// Create a disconnected client pushing to list `key`.
    pub fn new(transport: T, key: impl Into<String>, shutdown: ShutdownToken) -> Self {
        Self {
            transport,
            key: key.into(),
            state: QueueConnectionState::default(),
            shutdown,
            backoff_unit: Duration::from_secs(1),
        }
    }

    /// Scale the backoff sleep (one backoff "second" lasts `unit`).
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Open a new connection, replacing any current one.
    pub fn connect(&mut self) -> Result<(), QueueError> {
        self.disconnect();
        let connection = self.transport.connect()?;
        self.state.connection = Some(connection);
        debug!("Connected to queue at {}", self.transport.endpoint());
        Ok(())
    }

    /// Drop the current connection, if any.
    pub fn disconnect(&mut self) {
        self.state.connection = None;
    }

    pub fn is_connected(&self) -> bool {
        self.state.connection.is_some()
    }

    /// Check the connection; `true` only on the expected acknowledgement.
    pub fn is_alive(&mut self) -> bool {
        let Some(connection) = self.state.connection.as_mut() else {
            return false;
        };

        match connection.ping() {
            Ok(reply) => {
                let token = ALIVE_TOKEN.as_bytes();
                reply.len() >= token.len()
                    && reply.as_bytes()[..token.len()].eq_ignore_ascii_case(token)
            }
            Err(e) => {
                debug!("Liveness check failed: {}", e);
                false
            }
        }
    }

    /// Block until a healthy connection is established.
    ///
    /// Returns [`QueueError::Shutdown`] if shutdown is requested first.
    pub fn reconnect_until_healthy(&mut self) -> Result<(), QueueError> {
        self.disconnect();

        while !self.shutdown.is_requested() {
            match self.connect() {
                Ok(()) if self.is_alive() => {
                    info!("Connected to queue at {}", self.transport.endpoint());
                    return Ok(());
                }
                Ok(()) => warn!(
                    "Queue at {} did not answer the liveness check",
                    self.transport.endpoint()
                ),
                Err(e) => warn!("{}", e),
            }

            self.state.connect_errors += 1;
            self.disconnect();

            let delay = self.backoff_delay();
            debug!(
                "Retrying queue connection in {:?} ({} connect errors, {} push errors)",
                delay, self.state.connect_errors, self.state.push_errors
            );
            if self.shutdown.wait_timeout(delay) {
                break;
            }
        }

        Err(QueueError::Shutdown)
    }

    /// Push one record to the tail of the queue.
    ///
    /// On failure the connection is discarded and the client reconnects
    /// (blocking) before returning the error. The record itself is not
    /// retried.
    pub fn push(&mut self, record: &TraceRecord) -> Result<(), QueueError> {
        let result = match self.state.connection.as_mut() {
            Some(connection) => connection.push(&self.key, record.as_bytes()),
            None => Err(QueueError::NotConnected),
        };

        if let Err(e) = result {
            error!("{}", e);
            self.state.push_errors += 1;
            self.disconnect();
            if let Err(reconnect) = self.reconnect_until_healthy() {
                debug!("Reconnect abandoned: {}", reconnect);
            }
            return Err(e);
        }

        Ok(())
    }

    /// Delay before the next reconnect attempt.
    pub fn backoff_delay(&self) -> Duration {
        self.backoff_unit * backoff_secs(self.state.connect_errors, self.state.push_errors) as u32
    }

    pub fn connect_errors(&self) -> u64 {
        self.state.connect_errors
    }

    pub fn push_errors(&self) -> u64 {
        self.state.push_errors
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}
