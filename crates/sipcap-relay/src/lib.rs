// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SIP capture relay
//!
//! Captures IPv4 packets from a netfilter NFLOG group, keeps the SIP
//! messages that belong to a dialog worth tracing, and pushes each one as a
//! pcap-style record onto a Redis list for downstream consumers.
//!
//! # Pipeline
//!
//! ```text
//! NFLOG group ──> RecordEncoder ──> Classifier ──> QueueClient ──> RPUSH key
//!                 (16-byte header)  (Call-ID and    (reconnect with
//!                                    CSeq method)    backoff)
//! ```
//!
//! # Quick Start
//!
//! ```bash
//! # iptables -A INPUT -p udp --dport 5060 -j NFLOG --nflog-group 10
//! sipcap-relay --group 10 --queue-host 127.0.0.1 --queue-key sipcap:input
//! ```

pub mod capture;
pub mod classify;
pub mod config;
pub mod dispatch;
pub mod queue;
pub mod record;
pub mod shutdown;

pub use capture::{CaptureError, CaptureEvent, PacketSource};
pub use classify::{ClassificationVerdict, Classifier};
pub use config::{ConfigError, RelayConfig};
pub use dispatch::{DispatchOutcome, Dispatcher, PipelineCounters};
pub use queue::{QueueClient, QueueConnection, QueueError, QueueTransport, RedisTransport};
pub use record::{CaptureTime, RecordEncoder, RecordError, RecordHeader, TraceRecord};
pub use shutdown::ShutdownToken;

#[cfg(target_os = "linux")]
pub use capture::NflogSource;
