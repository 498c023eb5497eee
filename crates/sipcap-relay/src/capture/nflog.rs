// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! NFLOG capture over a raw nfnetlink socket.
//!
//! Packets matched by an `NFLOG --nflog-group N` rule are copied by the
//! kernel to every listener bound to group N. Setup is four config requests
//! (each acknowledged), after which the socket delivers `NFULNL_MSG_PACKET`
//! messages whose `NFULA_PAYLOAD` attribute holds the raw IP packet.

use super::{CaptureError, CaptureEvent, PacketSource};
use byteorder::{ByteOrder, NativeEndian};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use tracing::{debug, info, warn};

const NETLINK_NETFILTER: i32 = 12;

// Netlink control messages
const NLMSG_ERROR: u16 = 2;
const NLM_F_REQUEST: u16 = 1;
const NLM_F_ACK: u16 = 4;

// nfnetlink_log message types (subsystem in the high byte)
const NFNL_SUBSYS_ULOG: u16 = 4;
const NFULNL_MSG_PACKET: u16 = NFNL_SUBSYS_ULOG << 8;
const NFULNL_MSG_CONFIG: u16 = (NFNL_SUBSYS_ULOG << 8) | 1;

// Attributes
const NFULA_PAYLOAD: u16 = 9;
const NFULA_CFG_CMD: u16 = 1;
const NFULA_CFG_MODE: u16 = 2;
const NLA_TYPE_MASK: u16 = !(0x8000 | 0x4000);

// Config commands
const CMD_BIND: u8 = 1;
const CMD_UNBIND: u8 = 2;
const CMD_PF_BIND: u8 = 3;
const CMD_PF_UNBIND: u8 = 4;

const COPY_PACKET: u8 = 2;

const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;
const NFA_HDRLEN: usize = 4;

const RECV_BUFFER_SIZE: usize = 128 * 1024;

const AF_INET: u8 = libc::AF_INET as u8;
const AF_UNSPEC: u8 = libc::AF_UNSPEC as u8;

#[repr(C)]
struct SockaddrNl {
    nl_family: u16,
    nl_pad: u16,
    nl_pid: u32,
    nl_groups: u32,
}

impl SockaddrNl {
    fn kernel() -> Self {
        Self {
            nl_family: libc::AF_NETLINK as u16,
            nl_pad: 0,
            nl_pid: 0,
            nl_groups: 0,
        }
    }
}

/// Live NFLOG capture bound to one group.
pub struct NflogSource {
    fd: RawFd,
    group: u16,
    bound: bool,
    seq: u32,
    buf: Vec<u8>,
    /// Packets already received but not yet handed out.
    pending: VecDeque<Vec<u8>>,
}

impl NflogSource {
    /// Bind to `group`, copying up to `copy_range` bytes of each packet.
    ///
    /// Requires `CAP_NET_ADMIN`.
    pub fn open(group: u16, copy_range: u32) -> Result<Self, CaptureError> {
        let fd = create_netfilter_socket().map_err(|source| CaptureError::Setup {
            step: "open netlink socket",
            source,
        })?;

        let mut capture = Self {
            fd,
            group,
            bound: false,
            seq: 0,
            buf: vec![0u8; RECV_BUFFER_SIZE],
            pending: VecDeque::new(),
        };

        if let Err(e) =
            capture.request("unbind AF_INET", AF_INET, 0, NFULA_CFG_CMD, &[CMD_PF_UNBIND])
        {
            debug!("Ignoring {}", e);
        }
        capture.request("bind AF_INET", AF_INET, 0, NFULA_CFG_CMD, &[CMD_PF_BIND])?;
        capture.request("bind group", AF_UNSPEC, group, NFULA_CFG_CMD, &[CMD_BIND])?;
        capture.bound = true;
        capture.request(
            "set copy mode",
            AF_UNSPEC,
            group,
            NFULA_CFG_MODE,
            &mode_payload(copy_range),
        )?;

        info!("Capturing NFLOG group {} (copy range {})", group, copy_range);
        Ok(capture)
    }

    pub fn group(&self) -> u16 {
        self.group
    }

    /// Send one config request and wait for its acknowledgement.
    fn request(
        &mut self,
        step: &'static str,
        family: u8,
        res_id: u16,
        attr_type: u16,
        attr: &[u8],
    ) -> Result<(), CaptureError> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;

        let msg = config_message(seq, family, res_id, attr_type, attr);
        self.send(&msg)
            .map_err(|source| CaptureError::Setup { step, source })?;

        loop {
            let n = self
                .recv()
                .map_err(|source| CaptureError::Setup { step, source })?;

            let mut code = None;
            for msg in split_messages(&self.buf[..n]) {
                if msg.kind == NLMSG_ERROR && msg.seq == seq {
                    code = ack_code(&msg);
                } else if msg.kind == NFULNL_MSG_PACKET {
                    if let Some(payload) = packet_payload(msg.body) {
                        self.pending.push_back(payload.to_vec());
                    }
                }
            }

            match code {
                Some(0) => return Ok(()),
                Some(errno) => {
                    return Err(CaptureError::Setup {
                        step,
                        source: io::Error::from_raw_os_error(errno.saturating_neg()),
                    })
                }
                None => continue,
            }
        }
    }

    fn send(&self, msg: &[u8]) -> io::Result<()> {
        let addr = SockaddrNl::kernel();

        // SAFETY:
        // - fd is a valid netlink socket owned by self
        // - msg is a valid slice; sendto reads at most msg.len() bytes
        // - addr is a properly initialized SockaddrNl on the stack
        let ret = unsafe {
            libc::sendto(
                self.fd,
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<SockaddrNl>() as libc::socklen_t,
            )
        };

        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn recv(&mut self) -> io::Result<usize> {
        // SAFETY:
        // - fd is a valid netlink socket owned by self
        // - buf is a valid mutable buffer; recv writes at most buf.len() bytes
        let n = unsafe {
            libc::recv(
                self.fd,
                self.buf.as_mut_ptr() as *mut libc::c_void,
                self.buf.len(),
                0,
            )
        };

        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

impl PacketSource for NflogSource {
    fn next_event(&mut self) -> Result<CaptureEvent, CaptureError> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(CaptureEvent::Packet(packet));
        }

        let n = match self.recv() {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                return Ok(CaptureEvent::Idle);
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!("NFLOG socket overrun, kernel dropped packets");
                return Ok(CaptureEvent::Idle);
            }
            Err(e) => return Err(CaptureError::Io(e)),
        };

        self.pending.extend(parse_packets(&self.buf[..n]));

        Ok(match self.pending.pop_front() {
            Some(packet) => CaptureEvent::Packet(packet),
            None => CaptureEvent::Idle,
        })
    }
}

impl Drop for NflogSource {
    fn drop(&mut self) {
        if self.bound {
            self.seq = self.seq.wrapping_add(1);
            let msg = config_message(self.seq, AF_UNSPEC, self.group, NFULA_CFG_CMD, &[CMD_UNBIND]);
            if let Err(e) = self.send(&msg) {
                debug!("NFLOG unbind failed: {}", e);
            }
        }

        // SAFETY:
        // - fd is a valid file descriptor obtained from socket()
        // - The fd is only closed once (in Drop)
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Create and bind a nfnetlink socket.
fn create_netfilter_socket() -> io::Result<RawFd> {
    // SAFETY:
    // - AF_NETLINK, SOCK_RAW and NETLINK_NETFILTER are valid socket parameters
    // - socket() returns a valid fd or -1 on error
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            NETLINK_NETFILTER,
        )
    };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let addr = SockaddrNl::kernel();

    // SAFETY:
    // - fd is a valid netlink socket (checked above)
    // - addr is a properly initialized SockaddrNl; nl_pid 0 lets the kernel assign
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<SockaddrNl>() as libc::socklen_t,
        )
    };

    if ret < 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fd is a valid socket that needs cleanup on bind failure
        unsafe { libc::close(fd) };
        return Err(err);
    }

    // Receive timeout so the run loop can observe shutdown
    let timeout = libc::timeval {
        tv_sec: 1,
        tv_usec: 0,
    };

    // SAFETY:
    // - fd is a valid bound netlink socket
    // - timeout is a properly initialized timeval; the length matches
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &timeout as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };

    if ret < 0 {
        let err = io::Error::last_os_error();
        // SAFETY: fd is a valid socket that needs cleanup on failure
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Build a config request carrying a single attribute.
fn config_message(seq: u32, family: u8, res_id: u16, attr_type: u16, attr: &[u8]) -> Vec<u8> {
    let attr_len = NFA_HDRLEN + attr.len();
    let total = NLMSG_HDRLEN + NFGENMSG_LEN + align4(attr_len);

    let mut msg = Vec::with_capacity(total);
    // nlmsghdr
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&NFULNL_MSG_CONFIG.to_ne_bytes());
    msg.extend_from_slice(&(NLM_F_REQUEST | NLM_F_ACK).to_ne_bytes());
    msg.extend_from_slice(&seq.to_ne_bytes());
    msg.extend_from_slice(&0u32.to_ne_bytes());
    // nfgenmsg: family, version 0, resource id (big-endian)
    msg.push(family);
    msg.push(0);
    msg.extend_from_slice(&res_id.to_be_bytes());
    // nfattr
    msg.extend_from_slice(&(attr_len as u16).to_ne_bytes());
    msg.extend_from_slice(&attr_type.to_ne_bytes());
    msg.extend_from_slice(attr);
    msg.resize(total, 0);
    msg
}

/// `nfulnl_msg_config_mode`: copy range (big-endian), mode, padding.
fn mode_payload(copy_range: u32) -> [u8; 6] {
    let range = copy_range.to_be_bytes();
    [range[0], range[1], range[2], range[3], COPY_PACKET, 0]
}

/// One netlink message within a datagram.
struct NlMessage<'a> {
    kind: u16,
    seq: u32,
    /// Everything after the netlink header.
    body: &'a [u8],
}

fn split_messages(data: &[u8]) -> Vec<NlMessage<'_>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + NLMSG_HDRLEN <= data.len() {
        let len = NativeEndian::read_u32(&data[offset..]) as usize;
        if len < NLMSG_HDRLEN || offset + len > data.len() {
            break;
        }

        messages.push(NlMessage {
            kind: NativeEndian::read_u16(&data[offset + 4..]),
            seq: NativeEndian::read_u32(&data[offset + 8..]),
            body: &data[offset + NLMSG_HDRLEN..offset + len],
        });

        offset = align4(offset + len);
    }

    messages
}

/// Error code of an `NLMSG_ERROR` message (0 is a positive ACK).
fn ack_code(msg: &NlMessage<'_>) -> Option<i32> {
    (msg.body.len() >= 4).then(|| NativeEndian::read_i32(msg.body))
}

/// `NFULA_PAYLOAD` of a packet message body.
fn packet_payload(body: &[u8]) -> Option<&[u8]> {
    let mut offset = NFGENMSG_LEN;

    while offset + NFA_HDRLEN <= body.len() {
        let len = NativeEndian::read_u16(&body[offset..]) as usize;
        let kind = NativeEndian::read_u16(&body[offset + 2..]) & NLA_TYPE_MASK;
        if len < NFA_HDRLEN || offset + len > body.len() {
            return None;
        }

        if kind == NFULA_PAYLOAD {
            return Some(&body[offset + NFA_HDRLEN..offset + len]);
        }

        offset = align4(offset + len);
    }

    None
}

/// Extract every packet payload carried in one datagram.
fn parse_packets(data: &[u8]) -> Vec<Vec<u8>> {
    split_messages(data)
        .into_iter()
        .filter(|msg| msg.kind == NFULNL_MSG_PACKET)
        .filter_map(|msg| packet_payload(msg.body).map(<[u8]>::to_vec))
        .collect()
}
