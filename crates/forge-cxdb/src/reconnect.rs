// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! A reconnecting wrapper around [`Client`] with bounded exponential backoff.
//!
//! [`ReconnectingClient`] redials through a caller-supplied [`DialFunc`]
//! whenever a request fails with a connection-level error, up to
//! `max_retries` attempts, doubling the delay between attempts up to
//! `max_retry_delay`. Non-connection errors (e.g. a server-rejected request)
//! are returned immediately without triggering a reconnect.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::client::{Client, ClientOption, RequestContext};
use crate::error::{Error, Result};
use crate::protocol::Frame;

pub const DEFAULT_MAX_RETRIES: usize = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
pub const DEFAULT_QUEUE_SIZE: usize = 256;

/// A closure that (re)dials a fresh [`Client`].
pub type DialFunc = Arc<dyn Fn() -> Result<Client> + Send + Sync>;

/// Returns true when `err` indicates the underlying connection is unusable
/// and a redial is worth attempting, as opposed to a request the server
/// actively rejected.
pub fn is_connection_error(err: &Error) -> bool {
    matches!(
        err,
        Error::Io(_) | Error::Timeout | Error::ClientClosed | Error::QueueFull
    )
}

pub struct ReconnectOption(ReconnectOptionKind);

enum ReconnectOptionKind {
    MaxRetries(usize),
    RetryDelay(Duration),
    MaxRetryDelay(Duration),
}

pub fn with_max_retries(max_retries: usize) -> ReconnectOption {
    ReconnectOption(ReconnectOptionKind::MaxRetries(max_retries))
}

pub fn with_retry_delay(delay: Duration) -> ReconnectOption {
    ReconnectOption(ReconnectOptionKind::RetryDelay(delay))
}

pub fn with_max_retry_delay(delay: Duration) -> ReconnectOption {
    ReconnectOption(ReconnectOptionKind::MaxRetryDelay(delay))
}

struct ReconnectConfig {
    max_retries: usize,
    retry_delay: Duration,
    max_retry_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }
}

/// Wraps a [`Client`], transparently redialing on connection failure.
pub struct ReconnectingClient {
    current: Mutex<Option<Client>>,
    dial: DialFunc,
    config: ReconnectConfig,
}

impl ReconnectingClient {
    fn new(dial: DialFunc, opts: Vec<ReconnectOption>) -> Self {
        let mut config = ReconnectConfig::default();
        for opt in opts {
            match opt.0 {
                ReconnectOptionKind::MaxRetries(n) => config.max_retries = n,
                ReconnectOptionKind::RetryDelay(d) => config.retry_delay = d,
                ReconnectOptionKind::MaxRetryDelay(d) => config.max_retry_delay = d,
            }
        }
        Self {
            current: Mutex::new(None),
            dial,
            config,
        }
    }

    fn with_client<T>(&self, op: impl Fn(&Client) -> Result<T>) -> Result<T> {
        let mut delay = self.config.retry_delay;
        let mut attempt = 0;

        loop {
            {
                let mut guard = self.current.lock().map_err(|_| Error::ClientClosed)?;
                if guard.is_none() {
                    *guard = Some((self.dial)()?);
                }
                if let Some(client) = guard.as_ref() {
                    match op(client) {
                        Ok(value) => return Ok(value),
                        Err(err) if is_connection_error(&err) => {
                            *guard = None;
                        }
                        Err(err) => return Err(err),
                    }
                }
            }

            attempt += 1;
            if attempt > self.config.max_retries {
                return Err(Error::ClientClosed);
            }
            thread::sleep(delay);
            delay = std::cmp::min(delay * 2, self.config.max_retry_delay);
        }
    }

    pub fn send_request(&self, ctx: &RequestContext, msg_type: u16, payload: &[u8]) -> Result<Frame> {
        self.with_client(|client| client.send_request(ctx, msg_type, payload))
    }

    pub fn send_request_with_flags(
        &self,
        ctx: &RequestContext,
        msg_type: u16,
        flags: u16,
        payload: &[u8],
    ) -> Result<Frame> {
        self.with_client(|client| client.send_request_with_flags(ctx, msg_type, flags, payload))
    }
}

/// Builds a [`ReconnectingClient`] over a plaintext dial of `addr`.
pub fn dial_reconnecting(
    addr: impl Into<String>,
    client_opts: Vec<ClientOption>,
    reconnect_opts: Vec<ReconnectOption>,
) -> Result<ReconnectingClient> {
    let addr = addr.into();
    let dial: DialFunc = Arc::new(move || crate::client::dial(&addr, client_opts.clone()));
    let client = dial()?;
    let reconnecting = ReconnectingClient::new(dial, reconnect_opts);
    *reconnecting.current.lock().map_err(|_| Error::ClientClosed)? = Some(client);
    Ok(reconnecting)
}

/// Builds a [`ReconnectingClient`] over a TLS dial of `addr`.
pub fn dial_tls_reconnecting(
    addr: impl Into<String>,
    client_opts: Vec<ClientOption>,
    reconnect_opts: Vec<ReconnectOption>,
) -> Result<ReconnectingClient> {
    let addr = addr.into();
    let dial: DialFunc = Arc::new(move || crate::client::dial_tls(&addr, client_opts.clone()));
    let client = dial()?;
    let reconnecting = ReconnectingClient::new(dial, reconnect_opts);
    *reconnecting.current.lock().map_err(|_| Error::ClientClosed)? = Some(client);
    Ok(reconnecting)
}
