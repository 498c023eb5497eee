// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Trace record format.
//!
//! Every captured packet is wrapped into a pcap-style per-packet record
//! before it is classified and queued:
//!
//! ```text
//! +---------------------------------------------------------+
//! | ts_sec (4) | ts_usec (4) | incl_len (4) | orig_len (4)  |
//! +---------------------------------------------------------+
//! | payload (incl_len bytes, raw IPv4 packet)               |
//! +---------------------------------------------------------+
//! ```
//!
//! All header fields are little-endian `u32`. Downstream consumers prepend a
//! pcap global header (linktype 101, raw IP) and concatenate records to get a
//! readable capture file.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default record buffer capacity (header + payload).
pub const DEFAULT_BUFFER_CAPACITY: usize = 8192;

/// Record errors.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Record overflow: {needed} bytes needed, capacity is {capacity}")]
    Overflow { needed: usize, capacity: usize },

    #[error("Truncated record: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Wall-clock capture time with microsecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureTime {
    /// Seconds since the Unix epoch.
    pub secs: u32,
    /// Microseconds within the second.
    pub micros: u32,
}

impl CaptureTime {
    /// Read the process clock.
    ///
    /// The kernel timestamp attribute is not refreshed for every NFLOG
    /// message, so records are stamped at encode time instead.
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Self {
                secs: d.as_secs() as u32,
                micros: d.subsec_micros(),
            })
            .unwrap_or_default()
    }
}

/// Per-packet record header (16 bytes, fixed).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Capture time.
    pub time: CaptureTime,
    /// Payload bytes present in the record.
    pub included_length: u32,
    /// Payload bytes reported by the capture source.
    pub original_length: u32,
}

impl RecordHeader {
    pub const SIZE: usize = 16;

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.time.secs)?;
        w.write_u32::<LittleEndian>(self.time.micros)?;
        w.write_u32::<LittleEndian>(self.included_length)?;
        w.write_u32::<LittleEndian>(self.original_length)?;
        Ok(())
    }

    pub fn read<R: Read>(r: &mut R) -> io::Result<Self> {
        Ok(Self {
            time: CaptureTime {
                secs: r.read_u32::<LittleEndian>()?,
                micros: r.read_u32::<LittleEndian>()?,
            },
            included_length: r.read_u32::<LittleEndian>()?,
            original_length: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Byte buffer with a hard upper bound.
///
/// Appends that would cross the bound fail with [`RecordError::Overflow`]
/// and leave the buffer untouched.
#[derive(Debug)]
pub struct RecordBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl RecordBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Reserve room for `additional` more bytes or report overflow.
    pub fn ensure_room(&self, additional: usize) -> Result<(), RecordError> {
        let needed = self.bytes.len().saturating_add(additional);
        if needed > self.capacity {
            return Err(RecordError::Overflow {
                needed,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn append(&mut self, data: &[u8]) -> Result<(), RecordError> {
        self.ensure_room(data.len())?;
        self.bytes.extend_from_slice(data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// A serialized trace record (header followed by payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    header: RecordHeader,
    bytes: Vec<u8>,
}

impl TraceRecord {
    /// Record header.
    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    /// Captured payload (header-less).
    pub fn payload(&self) -> &[u8] {
        &self.bytes[RecordHeader::SIZE..]
    }

    /// Full serialized record, as pushed to the queue.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total serialized length.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Consume the record, returning its serialized bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Parse a serialized record.
    ///
    /// Bytes past the declared payload length are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, RecordError> {
        if bytes.len() < RecordHeader::SIZE {
            return Err(RecordError::Truncated {
                expected: RecordHeader::SIZE,
                got: bytes.len(),
            });
        }

        let header = RecordHeader::read(&mut &bytes[..RecordHeader::SIZE])?;
        let total = RecordHeader::SIZE + header.included_length as usize;
        if bytes.len() < total {
            return Err(RecordError::Truncated {
                expected: total,
                got: bytes.len(),
            });
        }

        Ok(Self {
            header,
            bytes: bytes[..total].to_vec(),
        })
    }
}

/// Builds trace records into a bounded buffer.
#[derive(Debug, Clone)]
pub struct RecordEncoder {
    capacity: usize,
}

impl RecordEncoder {
    /// Create an encoder whose records never exceed `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }

    /// Maximum serialized record size.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest payload that still fits.
    pub fn max_payload(&self) -> usize {
        self.capacity.saturating_sub(RecordHeader::SIZE)
    }

    /// Wrap `payload` into a record stamped with `time`.
    ///
    /// Oversized payloads are rejected rather than truncated: a cut payload
    /// would break header scanning downstream.
    pub fn encode(&self, payload: &[u8], time: CaptureTime) -> Result<TraceRecord, RecordError> {
        let mut buf = RecordBuffer::with_capacity(self.capacity);
        buf.ensure_room(RecordHeader::SIZE + payload.len())?;

        let length = u32::try_from(payload.len()).map_err(|_| RecordError::Overflow {
            needed: RecordHeader::SIZE + payload.len(),
            capacity: self.capacity,
        })?;
        let header = RecordHeader {
            time,
            included_length: length,
            original_length: length,
        };

        let mut header_bytes = [0u8; RecordHeader::SIZE];
        header.write(&mut &mut header_bytes[..])?;
        buf.append(&header_bytes)?;
        buf.append(payload)?;

        Ok(TraceRecord {
            header,
            bytes: buf.into_inner(),
        })
    }
}

impl Default for RecordEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
