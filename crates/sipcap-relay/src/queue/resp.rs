// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal Redis RESP client.
//!
//! Only what the relay needs: `PING` as the liveness check and `RPUSH` to
//! append records. Commands are sent as RESP arrays of bulk strings; replies
//! are read synchronously.

use super::{QueueConnection, QueueError, QueueTransport};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default queue service port.
pub const DEFAULT_PORT: u16 = 6379;

/// Default connect (and command) timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1900);

/// Nesting limit for array replies.
const MAX_REPLY_DEPTH: usize = 8;

/// Largest bulk string accepted from the peer.
pub const MAX_BULK_LEN: usize = 1024 * 1024;

/// Largest array element count accepted from the peer.
pub const MAX_ARRAY_LEN: usize = 1024;

/// A decoded RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Read one reply from `reader`.
pub fn read_reply<R: BufRead>(reader: &mut R) -> io::Result<Reply> {
    read_reply_nested(reader, 0)
}

fn read_reply_nested<R: BufRead>(reader: &mut R, depth: usize) -> io::Result<Reply> {
    if depth > MAX_REPLY_DEPTH {
        return Err(invalid("reply nested too deeply"));
    }

    let line = read_line(reader)?;
    let (kind, rest) = line.split_first().ok_or_else(|| invalid("empty reply line"))?;
    let text = String::from_utf8_lossy(rest).into_owned();

    match *kind {
        b'+' => Ok(Reply::Status(text)),
        b'-' => Ok(Reply::Error(text)),
        b':' => Ok(Reply::Integer(parse_int(&text)?)),
        b'$' => {
            let len = parse_int(&text)?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|&len| len <= MAX_BULK_LEN)
                .ok_or_else(|| invalid("bulk length out of range"))?;
            let mut data = vec![0u8; len + 2];
            reader.read_exact(&mut data)?;
            if !data.ends_with(b"\r\n") {
                return Err(invalid("bulk string not terminated by CRLF"));
            }
            data.truncate(len);
            Ok(Reply::Bulk(Some(data)))
        }
        b'*' => {
            let count = parse_int(&text)?;
            if count < 0 {
                return Ok(Reply::Array(None));
            }
            let count = usize::try_from(count)
                .ok()
                .filter(|&count| count <= MAX_ARRAY_LEN)
                .ok_or_else(|| invalid("array length out of range"))?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_reply_nested(reader, depth + 1)?);
            }
            Ok(Reply::Array(Some(items)))
        }
        other => Err(invalid(&format!("unknown reply type byte 0x{:02x}", other))),
    }
}

fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by server",
        ));
    }
    if !line.ends_with(b"\r\n") {
        return Err(invalid("reply line not terminated by CRLF"));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_int(text: &str) -> io::Result<i64> {
    text.parse()
        .map_err(|_| invalid(&format!("invalid integer {:?}", text)))
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

/// TCP transport to a Redis-compatible server.
#[derive(Debug, Clone)]
pub struct RedisTransport {
    host: String,
    port: u16,
    timeout: Duration,
}

impl RedisTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Bound connection establishment and every command round trip.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl QueueTransport for RedisTransport {
    type Connection = RedisConnection;

    fn connect(&self) -> Result<RedisConnection, QueueError> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| QueueError::Connection(format!("{}: {}", self.endpoint(), e)))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return RedisConnection::new(stream, self.timeout),
                Err(e) => last_err = Some(e),
            }
        }

        Err(QueueError::Connection(match last_err {
            Some(e) => format!("{}: {}", self.endpoint(), e),
            None => format!("{}: no address resolved", self.endpoint()),
        }))
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One RESP connection.
pub struct RedisConnection {
    stream: BufReader<TcpStream>,
}

impl RedisConnection {
    fn new(stream: TcpStream, timeout: Duration) -> Result<Self, QueueError> {
        let setup = |stream: &TcpStream| -> io::Result<()> {
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(timeout))?;
            stream.set_write_timeout(Some(timeout))?;
            Ok(())
        };
        setup(&stream).map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Send one command and wait for its reply.
    pub fn command(&mut self, args: &[&[u8]]) -> io::Result<Reply> {
        let writer = self.stream.get_mut();
        writer.write_all(&encode_command(args))?;
        writer.flush()?;
        read_reply(&mut self.stream)
    }
}

impl QueueConnection for RedisConnection {
    fn ping(&mut self) -> Result<String, QueueError> {
        match self.command(&[b"PING"]) {
            Ok(Reply::Status(s)) => Ok(s),
            Ok(Reply::Bulk(Some(b))) => Ok(String::from_utf8_lossy(&b).into_owned()),
            Ok(Reply::Error(e)) => Err(QueueError::Connection(e)),
            Ok(other) => Err(QueueError::Connection(format!(
                "unexpected PING reply: {:?}",
                other
            ))),
            Err(e) => Err(QueueError::Connection(e.to_string())),
        }
    }

    fn push(&mut self, key: &str, record: &[u8]) -> Result<(), QueueError> {
        match self.command(&[b"RPUSH", key.as_bytes(), record]) {
            Ok(Reply::Integer(_)) => Ok(()),
            Ok(Reply::Error(e)) => Err(QueueError::Push(e)),
            Ok(other) => Err(QueueError::Push(format!(
                "unexpected RPUSH reply: {:?}",
                other
            ))),
            Err(e) => Err(QueueError::Push(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::thread;

    fn parse(bytes: &[u8]) -> io::Result<Reply> {
        read_reply(&mut Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn test_encode_command() {
        let cmd = encode_command(&[b"RPUSH", b"sipcap:input", b"a\r\nb"]);
        assert_eq!(
            cmd,
            b"*3\r\n$5\r\nRPUSH\r\n$12\r\nsipcap:input\r\n$4\r\na\r\nb\r\n".to_vec()
        );
    }

    #[test]
    fn test_read_simple_replies() {
        assert_eq!(parse(b"+PONG\r\n").unwrap(), Reply::Status("PONG".into()));
        assert_eq!(
            parse(b"-WRONGTYPE bad\r\n").unwrap(),
            Reply::Error("WRONGTYPE bad".into())
        );
        assert_eq!(parse(b":42\r\n").unwrap(), Reply::Integer(42));
        assert_eq!(parse(b"$-1\r\n").unwrap(), Reply::Bulk(None));
        assert_eq!(
            parse(b"$3\r\na\r\n\r\n").unwrap(),
            Reply::Bulk(Some(b"a\r\n".to_vec()))
        );
    }

    #[test]
    fn test_read_array_reply() {
        let reply = parse(b"*2\r\n$5\r\nRPUSH\r\n:1\r\n").unwrap();
        assert_eq!(
            reply,
            Reply::Array(Some(vec![
                Reply::Bulk(Some(b"RPUSH".to_vec())),
                Reply::Integer(1)
            ]))
        );
    }

    #[test]
    fn test_read_malformed_replies() {
        assert!(parse(b"").is_err());
        assert!(parse(b"?what\r\n").is_err());
        assert!(parse(b":abc\r\n").is_err());
        assert!(parse(b"+PONG\n").is_err());
        assert!(parse(b"*1025\r\n").is_err());
        assert!(parse(b"$5\r\nab\r\n").is_err());
    }

    #[test]
    fn test_oversized_bulk_length_is_rejected() {
        for reply in [
            &b"$9223372036854775807\r\n"[..],
            &b"$4000000000\r\n"[..],
            &b"*9223372036854775807\r\n"[..],
        ] {
            let err = parse(reply).expect_err("oversized length must fail");
            assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        }

        let over_limit = format!("${}\r\n", MAX_BULK_LEN + 1);
        assert!(parse(over_limit.as_bytes()).is_err());
    }

    #[test]
    fn test_bulk_at_limit_is_accepted() {
        let mut reply = format!("${}\r\n", MAX_BULK_LEN).into_bytes();
        reply.resize(reply.len() + MAX_BULK_LEN, b'x');
        reply.extend_from_slice(b"\r\n");

        match parse(&reply).expect("parse") {
            Reply::Bulk(Some(data)) => assert_eq!(data.len(), MAX_BULK_LEN),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_oversized_ping_reply_is_connection_failure() {
        let (port, server) = spawn_server(b"$9223372036854775807\r\n", b":1\r\n");
        let mut conn = RedisTransport::new("127.0.0.1", port)
            .connect()
            .expect("connect");

        assert!(matches!(conn.ping(), Err(QueueError::Connection(_))));
        drop(conn);
        server.join().expect("server");
    }

    /// Answers PING with `ping_reply` and RPUSH with `push_reply`, recording
    /// every command received.
    fn spawn_server(
        ping_reply: &'static [u8],
        push_reply: &'static [u8],
    ) -> (u16, thread::JoinHandle<Vec<Vec<Vec<u8>>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut writer = stream;
            let mut seen = Vec::new();

            while let Ok(Reply::Array(Some(items))) = read_reply(&mut reader) {
                let args: Vec<Vec<u8>> = items
                    .into_iter()
                    .map(|item| match item {
                        Reply::Bulk(Some(b)) => b,
                        other => panic!("unexpected argument {:?}", other),
                    })
                    .collect();
                let reply = if args[0] == b"PING" {
                    ping_reply
                } else {
                    push_reply
                };
                writer.write_all(reply).expect("reply");
                seen.push(args);
            }
            seen
        });

        (port, handle)
    }

    #[test]
    fn test_ping_and_push_over_tcp() {
        let (port, server) = spawn_server(b"+PONG\r\n", b":1\r\n");
        let transport = RedisTransport::new("127.0.0.1", port);

        let mut conn = transport.connect().expect("connect");
        assert_eq!(conn.ping().expect("ping"), "PONG");
        conn.push("sipcap:input", b"\x00\x01record").expect("push");
        drop(conn);

        let seen = server.join().expect("server");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], vec![b"PING".to_vec()]);
        assert_eq!(
            seen[1],
            vec![
                b"RPUSH".to_vec(),
                b"sipcap:input".to_vec(),
                b"\x00\x01record".to_vec()
            ]
        );
    }

    #[test]
    fn test_error_reply_is_push_failure() {
        let (port, server) = spawn_server(b"+PONG\r\n", b"-OOM command not allowed\r\n");
        let mut conn = RedisTransport::new("127.0.0.1", port)
            .connect()
            .expect("connect");

        match conn.push("k", b"x") {
            Err(QueueError::Push(msg)) => assert!(msg.contains("OOM")),
            other => panic!("expected push error, got {:?}", other.err()),
        }
        drop(conn);
        server.join().expect("server");
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };

        let transport =
            RedisTransport::new("127.0.0.1", port).with_timeout(Duration::from_millis(200));
        assert!(matches!(
            transport.connect(),
            Err(QueueError::Connection(_))
        ));
        assert_eq!(transport.endpoint(), format!("127.0.0.1:{}", port));
    }
}
