// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Synchronous TCP client for the CXDB wire protocol.
//!
//! A single [`Client`] owns one connection behind a mutex: a request's write
//! and its matching read happen inside the same critical section, so callers
//! queue on the lock rather than interleave frames on the wire. `req_id`
//! round-trips unmodified and is used to detect a desynced stream, not to
//! multiplex out-of-order responses.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::protocol::{self, Frame, MSG_ERROR};

/// Per-request deadline and cancellation signal.
#[derive(Clone)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
}

impl RequestContext {
    /// A context with no deadline, analogous to Go's `context.Background()`.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn remaining(&self, default_timeout: Duration) -> Result<Duration> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout);
                }
                Ok(deadline - now)
            }
            None => Ok(default_timeout),
        }
    }
}

/// A functional option configuring a [`Client`] at dial time.
#[derive(Clone)]
pub struct ClientOption(ClientOptionKind);

#[derive(Clone)]
enum ClientOptionKind {
    DialTimeout(Duration),
    RequestTimeout(Duration),
    ClientTag(String),
}

pub fn with_dial_timeout(timeout: Duration) -> ClientOption {
    ClientOption(ClientOptionKind::DialTimeout(timeout))
}

pub fn with_request_timeout(timeout: Duration) -> ClientOption {
    ClientOption(ClientOptionKind::RequestTimeout(timeout))
}

pub fn with_client_tag(tag: impl Into<String>) -> ClientOption {
    ClientOption(ClientOptionKind::ClientTag(tag.into()))
}

struct ClientConfig {
    dial_timeout: Duration,
    request_timeout: Duration,
    client_tag: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            dial_timeout: protocol::DEFAULT_DIAL_TIMEOUT,
            request_timeout: protocol::DEFAULT_REQUEST_TIMEOUT,
            client_tag: String::new(),
        }
    }
}

fn apply_options(opts: Vec<ClientOption>) -> ClientConfig {
    let mut config = ClientConfig::default();
    for opt in opts {
        match opt.0 {
            ClientOptionKind::DialTimeout(timeout) => config.dial_timeout = timeout,
            ClientOptionKind::RequestTimeout(timeout) => config.request_timeout = timeout,
            ClientOptionKind::ClientTag(tag) => config.client_tag = tag,
        }
    }
    config
}

enum Transport {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

impl Transport {
    fn set_timeouts(&self, timeout: Duration) -> Result<()> {
        let stream = match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => &stream.sock,
        };
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(())
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.read(buf),
            Transport::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(buf),
            Transport::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush(),
            Transport::Tls(stream) => stream.flush(),
        }
    }
}

/// A connection to a CXDB server.
///
/// Cloning a [`Client`] is not supported; share one behind an `Arc` instead,
/// matching every call site in this workspace.
pub struct Client {
    transport: Mutex<Transport>,
    next_req_id: AtomicU64,
    config: ClientConfig,
}

impl Client {
    fn new(transport: Transport, config: ClientConfig) -> Self {
        Self {
            transport: Mutex::new(transport),
            next_req_id: AtomicU64::new(1),
            config,
        }
    }

    /// Sends a request frame and waits for the matching response, returning
    /// the server's [`Error::Server`] if it replied with `MSG_ERROR`.
    pub fn send_request(&self, ctx: &RequestContext, msg_type: u16, payload: &[u8]) -> Result<Frame> {
        self.send_request_with_flags(ctx, msg_type, 0, payload)
    }

    pub fn send_request_with_flags(
        &self,
        ctx: &RequestContext,
        msg_type: u16,
        flags: u16,
        payload: &[u8],
    ) -> Result<Frame> {
        let timeout = ctx.remaining(self.config.request_timeout)?;
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);

        let mut transport = self.transport.lock().map_err(|_| Error::ClientClosed)?;
        transport.set_timeouts(timeout)?;

        protocol::write_frame(&mut *transport, msg_type, flags, req_id, payload)?;
        transport.flush()?;

        let frame = protocol::read_frame(&mut *transport)?;
        if frame.header.req_id != req_id {
            return Err(Error::invalid_response(format!(
                "response req_id {} does not match request req_id {}",
                frame.header.req_id, req_id
            )));
        }

        if frame.header.msg_type == MSG_ERROR {
            return Err(parse_error_frame(&frame.payload));
        }

        Ok(frame)
    }

    pub fn client_tag(&self) -> &str {
        &self.config.client_tag
    }
}

fn parse_error_frame(payload: &[u8]) -> Error {
    use byteorder::{LittleEndian, ReadBytesExt};

    let mut cursor = std::io::Cursor::new(payload);
    let code = cursor.read_u32::<LittleEndian>().unwrap_or(0);
    let detail = String::from_utf8_lossy(&payload[cursor.position() as usize..]).into_owned();
    Error::server(code, detail)
}

fn send_hello(transport: &mut Transport, client_tag: &str) -> Result<()> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(client_tag.len() as u32).to_le_bytes());
    payload.extend_from_slice(client_tag.as_bytes());
    protocol::write_frame(transport, protocol::MSG_HELLO, 0, 0, &payload)?;
    transport.flush()?;
    let frame = protocol::read_frame(transport)?;
    if frame.header.msg_type == MSG_ERROR {
        return Err(parse_error_frame(&frame.payload));
    }
    Ok(())
}

fn connect_tcp(addr: &str, dial_timeout: Duration) -> Result<TcpStream> {
    use std::net::ToSocketAddrs;

    let socket_addr = addr
        .to_socket_addrs()
        .map_err(Error::Io)?
        .next()
        .ok_or_else(|| Error::invalid_response(format!("could not resolve address: {addr}")))?;
    let stream = TcpStream::connect_timeout(&socket_addr, dial_timeout)?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Dials a plaintext CXDB server at `addr` (e.g. `"127.0.0.1:9009"`).
pub fn dial(addr: &str, opts: Vec<ClientOption>) -> Result<Client> {
    let config = apply_options(opts);
    let stream = connect_tcp(addr, config.dial_timeout)?;
    let mut transport = Transport::Plain(stream);
    send_hello(&mut transport, &config.client_tag)?;
    Ok(Client::new(transport, config))
}

/// Dials a CXDB server over TLS, verifying the server against the platform's
/// native trust store.
pub fn dial_tls(addr: &str, opts: Vec<ClientOption>) -> Result<Client> {
    let config = apply_options(opts);
    let stream = connect_tcp(addr, config.dial_timeout)?;

    let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
    let server_name: rustls_pki_types::ServerName<'static> = host
        .to_string()
        .try_into()
        .map_err(|_| Error::Tls(format!("invalid server name: {addr}")))?;

    let tls_config = Arc::new(build_tls_config());
    let tls_conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|err| Error::Tls(err.to_string()))?;

    let mut transport = Transport::Tls(Box::new(rustls::StreamOwned::new(tls_conn, stream)));
    send_hello(&mut transport, &config.client_tag)?;
    Ok(Client::new(transport, config))
}

fn build_tls_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}
