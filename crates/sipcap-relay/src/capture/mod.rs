// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet capture sources.
//!
//! The dispatcher pulls packets through [`PacketSource`]. On Linux the
//! production source is [`NflogSource`], which receives IPv4 packets copied
//! by an iptables/nftables `NFLOG` rule.

#[cfg(target_os = "linux")]
mod nflog;

#[cfg(target_os = "linux")]
pub use nflog::NflogSource;

use std::io;
use thiserror::Error;

/// Default NFLOG group.
pub const DEFAULT_CAPTURE_GROUP: u16 = 10;

/// Default number of packet bytes copied to userspace.
pub const DEFAULT_COPY_RANGE: u32 = 0xffff;

/// Capture errors.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Capture setup failed at {step}: {source}")]
    Setup {
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Capture I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Packet capture is not supported on this platform")]
    Unsupported,
}

/// What a capture source produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// One captured packet (raw IPv4, starting at the IP header).
    Packet(Vec<u8>),
    /// No traffic within the receive timeout.
    Idle,
    /// The source is exhausted; no further packets will arrive.
    Closed,
}

/// A blocking source of captured packets.
pub trait PacketSource {
    /// Wait for the next event. Implementations return [`CaptureEvent::Idle`]
    /// at least about once per second so callers can observe shutdown.
    fn next_event(&mut self) -> Result<CaptureEvent, CaptureError>;
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn next_event(&mut self) -> Result<CaptureEvent, CaptureError> {
        (**self).next_event()
    }
}

/// Open the platform capture source.
#[cfg(target_os = "linux")]
pub fn open_default(group: u16, copy_range: u32) -> Result<NflogSource, CaptureError> {
    NflogSource::open(group, copy_range)
}

/// Open the platform capture source.
#[cfg(not(target_os = "linux"))]
pub fn open_default(
    _group: u16,
    _copy_range: u32,
) -> Result<Box<dyn PacketSource>, CaptureError> {
    Err(CaptureError::Unsupported)
}
