//! Outbound call driver: timeouts, retry over peer selection, typed errors
//! (§4.6, §7).

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tchannel_core::{
    CallArgs, CallHandle, CallRequestHead, ChecksumType, ConnectionError, ErrorCode, OutboundSlot,
    ResponseCode, Tracing,
};

use crate::peer::PeerPool;

/// A condition under which a failed call is eligible for retry (§4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryCondition {
    ConnectionError,
    Timeout,
    Declined,
    Unexpected,
}

/// How many attempts to make and under what conditions to retry (§4.6).
/// Default matches the spec's default set: `{connection-error, declined}`,
/// up to 4 additional attempts.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    conditions: HashSet<RetryCondition>,
    pub limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            conditions: [RetryCondition::ConnectionError, RetryCondition::Declined].into_iter().collect(),
            limit: 4,
        }
    }
}

impl RetryPolicy {
    /// No retries under any condition.
    pub fn never() -> Self {
        RetryPolicy { conditions: HashSet::new(), limit: 0 }
    }

    pub fn with_conditions(conditions: impl IntoIterator<Item = RetryCondition>, limit: u32) -> Self {
        RetryPolicy { conditions: conditions.into_iter().collect(), limit }
    }

    fn allows(&self, condition: RetryCondition) -> bool {
        self.conditions.contains(&condition)
    }
}

/// Per-call options (§6.2).
#[derive(Clone, Debug)]
pub struct CallOptions {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Send to this exact host:port, bypassing peer selection.
    pub hostport: Option<String>,
    /// Restrict peer selection to this set instead of every known peer.
    pub known_peers: Option<Vec<String>>,
    pub shard_key: Option<String>,
    pub trace: Option<Tracing>,
    pub checksum_type: ChecksumType,
}

impl Default for CallOptions {
    fn default() -> Self {
        CallOptions {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            hostport: None,
            known_peers: None,
            shard_key: None,
            trace: None,
            checksum_type: ChecksumType::Crc32,
        }
    }
}

/// Caller-visible outcome taxonomy (§7). `Timeout`/`Cancelled`/`Busy`/
/// `Declined`/`NetworkError` are the retry-eligible family; the rest are
/// surfaced without retrying.
#[derive(Debug)]
pub enum CallError {
    Timeout,
    Cancelled,
    Busy,
    Declined,
    NetworkError(String),
    BadRequest(String),
    UnexpectedError(String),
    ProtocolError(String),
    /// No peer was available to even attempt the call (no known peers, or
    /// all candidates excluded by a prior failed attempt).
    NoPeerAvailable,
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Timeout => write!(f, "timeout"),
            CallError::Cancelled => write!(f, "cancelled"),
            CallError::Busy => write!(f, "busy"),
            CallError::Declined => write!(f, "declined"),
            CallError::NetworkError(m) => write!(f, "network error: {m}"),
            CallError::BadRequest(m) => write!(f, "bad request: {m}"),
            CallError::UnexpectedError(m) => write!(f, "unexpected error: {m}"),
            CallError::ProtocolError(m) => write!(f, "protocol error: {m}"),
            CallError::NoPeerAvailable => write!(f, "no peer available"),
        }
    }
}

impl std::error::Error for CallError {}

impl CallError {
    fn from_connection_error(e: ConnectionError) -> Self {
        match e {
            ConnectionError::CallFailed { code, message } => match code {
                ErrorCode::Timeout => CallError::Timeout,
                ErrorCode::Cancelled => CallError::Cancelled,
                ErrorCode::Busy => CallError::Busy,
                ErrorCode::Declined => CallError::Declined,
                ErrorCode::NetworkError => CallError::NetworkError(message),
                ErrorCode::BadRequest => CallError::BadRequest(message),
                ErrorCode::UnexpectedError => CallError::UnexpectedError(message),
                ErrorCode::FatalProtocolError => CallError::ProtocolError(message),
            },
            ConnectionError::Closed => CallError::NetworkError("connection closed".to_string()),
            ConnectionError::PeerFatal(m) => CallError::ProtocolError(m),
            ConnectionError::InvalidMessage(e) => CallError::BadRequest(e.to_string()),
            other => CallError::NetworkError(other.to_string()),
        }
    }

    fn retry_condition(&self) -> Option<RetryCondition> {
        match self {
            CallError::NetworkError(_) => Some(RetryCondition::ConnectionError),
            CallError::Timeout => Some(RetryCondition::Timeout),
            CallError::Declined => Some(RetryCondition::Declined),
            CallError::Busy | CallError::UnexpectedError(_) => Some(RetryCondition::Unexpected),
            _ => None,
        }
    }
}

/// Result of a successful call: the response code, transport headers, and
/// the three response args (§3, §6.2).
pub struct CallResult {
    pub code: ResponseCode,
    pub headers: Vec<(String, String)>,
    pub args: CallArgs,
}

/// Applies timeouts and the retry policy over [`PeerPool`] selection
/// (§4.6). One `OutboundDriver` is shared by every call a runtime makes.
pub struct OutboundDriver {
    pool: Arc<PeerPool>,
    service_name: String,
}

impl OutboundDriver {
    pub fn new(pool: Arc<PeerPool>, service_name: String) -> Self {
        OutboundDriver { pool, service_name }
    }

    /// Send a call, retrying per `options.retry` across peer selection
    /// until it succeeds, exhausts the retry limit, or the deadline
    /// expires (§4.6). `args.arg1` is the endpoint name.
    pub async fn call(
        &self,
        service: &str,
        args: CallArgs,
        transport_headers: Vec<(String, String)>,
        options: CallOptions,
    ) -> Result<CallResult, CallError> {
        let deadline = Instant::now() + options.timeout;
        let mut excluded: Vec<String> = Vec::new();
        let mut last_err = CallError::NoPeerAvailable;

        for attempt in 0..=options.retry.limit {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CallError::Timeout);
            }

            let peer = match &options.hostport {
                Some(hostport) => {
                    self.pool.add_known(hostport.clone());
                    match self.pool.peer(hostport) {
                        Some(p) => p,
                        None => return Err(CallError::NoPeerAvailable),
                    }
                }
                None => {
                    let candidates: Vec<String> = match &options.known_peers {
                        Some(known) => known.clone(),
                        None => self.pool.known_peers().iter().map(|p| p.host_port.clone()).collect(),
                    };
                    match self.pool.select(&candidates, &excluded) {
                        Some(p) => p,
                        None => return Err(last_err),
                    }
                }
            };

            let result = self
                .attempt(&peer, service, &args, &transport_headers, remaining, &options)
                .await;

            match result {
                Ok(res) => {
                    peer.record_success();
                    return Ok(res);
                }
                Err(err) => {
                    peer.record_failure();
                    let retryable = err
                        .retry_condition()
                        .map(|c| options.retry.allows(c))
                        .unwrap_or(false);
                    tracing::warn!(
                        attempt,
                        peer = %peer.host_port,
                        error = %err,
                        retryable,
                        "tchannel call attempt failed"
                    );
                    if !retryable || attempt == options.retry.limit {
                        return Err(err);
                    }
                    excluded.push(peer.host_port.clone());
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Resolve a peer the same way [`OutboundDriver::call`]'s attempt loop
    /// does, for callers that want a single non-retried attempt.
    fn resolve_peer(
        &self,
        options: &CallOptions,
        excluded: &[String],
    ) -> Result<Arc<crate::peer::Peer>, CallError> {
        match &options.hostport {
            Some(hostport) => {
                self.pool.add_known(hostport.clone());
                self.pool.peer(hostport).ok_or(CallError::NoPeerAvailable)
            }
            None => {
                let candidates: Vec<String> = match &options.known_peers {
                    Some(known) => known.clone(),
                    None => self.pool.known_peers().iter().map(|p| p.host_port.clone()).collect(),
                };
                self.pool.select(&candidates, excluded).ok_or(CallError::NoPeerAvailable)
            }
        }
    }

    /// Single-attempt cancellable call (§4.6 cancellation): no retry across
    /// peers, since a cancellation issued mid-retry would be ambiguous
    /// about which attempt it targets. Returns a [`CallHandle`] the caller
    /// can cancel, and the raw receiver for the eventual result — callers
    /// needing scheme decoding do it themselves, the same way
    /// [`crate::runtime::Runtime::call`] does for the retrying path.
    pub async fn call_cancellable(
        &self,
        service: &str,
        args: CallArgs,
        transport_headers: Vec<(String, String)>,
        options: CallOptions,
    ) -> Result<(CallHandle, tokio::sync::oneshot::Receiver<OutboundSlot>), CallError> {
        let peer = self.resolve_peer(&options, &[])?;
        let conn = self
            .pool
            .connection_for(&peer)
            .await
            .map_err(CallError::from_connection_error)?;
        let head = CallRequestHead {
            ttl_ms: options.timeout.as_millis().min(u32::MAX as u128) as u32,
            tracing: options.trace.unwrap_or_default(),
            service: service.to_string(),
            headers: transport_headers,
            checksum_type: options.checksum_type,
        };
        conn.call_cancellable(head, args).await.map_err(CallError::from_connection_error)
    }

    async fn attempt(
        &self,
        peer: &Arc<crate::peer::Peer>,
        service: &str,
        args: &CallArgs,
        transport_headers: &[(String, String)],
        remaining: Duration,
        options: &CallOptions,
    ) -> Result<CallResult, CallError> {
        let conn = self
            .pool
            .connection_for(peer)
            .await
            .map_err(CallError::from_connection_error)?;

        let head = CallRequestHead {
            ttl_ms: remaining.as_millis().min(u32::MAX as u128) as u32,
            tracing: options.trace.unwrap_or_default(),
            service: service.to_string(),
            headers: transport_headers.to_vec(),
            checksum_type: options.checksum_type,
        };

        let call_fut = conn.call(head, args.clone());
        let (response_head, response_args) = match tokio::time::timeout(remaining, call_fut).await {
            Ok(Ok(ok)) => ok,
            Ok(Err(e)) => return Err(CallError::from_connection_error(e)),
            Err(_elapsed) => return Err(CallError::Timeout),
        };

        Ok(CallResult {
            code: response_head.code,
            headers: response_head.headers,
            args: response_args,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}
