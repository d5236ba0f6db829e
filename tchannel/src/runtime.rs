//! Runtime facade (§6.2): the programmatic surface applications use —
//! `new`, `listen`, `register`, `call`, `close` — wiring the peer pool,
//! dispatcher and outbound driver together.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tchannel_core::{CallArgs, Connection, ConnectionConfig, ErrorCode};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::call::{CallError, CallOptions, OutboundDriver};
use crate::dispatch::{CallContext, Dispatcher, HandlerOutcome};
use crate::peer::PeerPool;
use crate::scheme::Scheme;

/// Metadata handed to a typed handler alongside its decoded headers/body.
pub struct CallMeta {
    pub service: String,
    pub peer_host_port: String,
    pub cancel: tchannel_core::CancelSignal,
}

/// A typed handler's result: either a normal response or an
/// application-level error, both still scheme-encoded and delivered via
/// the standard `call res` envelope (§4.7, §7).
pub enum TypedOutcome<S: Scheme> {
    Ok { headers: S::Headers, body: S::Body },
    ApplicationError { headers: S::Headers, body: S::Body },
    /// The handler refuses to serve this call at all — e.g. overloaded
    /// (`Busy`) or routing the caller elsewhere (`Declined`) — sent as a
    /// wire `error` frame rather than a `call res` (§4.7, §4.8).
    Rejected { code: ErrorCode, message: String },
}

/// Builder/handle for a TChannel peer: owns the peer pool, dispatch table
/// and outbound driver for one service identity (§6.2).
pub struct Runtime {
    service_name: String,
    pool: Arc<PeerPool>,
    dispatcher: Arc<Dispatcher>,
    driver: OutboundDriver,
    listen_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Runtime {
    /// Create a runtime for `service_name`, optionally binding to a fixed
    /// `host:port` (used both for the `init` handshake's advertised
    /// `host_port` and for [`Runtime::listen`]), with an optional set of
    /// peers to pre-register (§6.2).
    pub fn new(
        service_name: impl Into<String>,
        bind_host_port: Option<String>,
        known_peers: impl IntoIterator<Item = String>,
    ) -> Arc<Self> {
        let service_name = service_name.into();
        let config = ConnectionConfig {
            host_port: bind_host_port.unwrap_or_else(|| "0.0.0.0:0".to_string()),
            process_name: service_name.clone(),
            ..ConnectionConfig::default()
        };
        let pool = Arc::new(PeerPool::new(config));
        let dispatcher = Arc::new(Dispatcher::new());

        let hook_dispatcher = dispatcher.clone();
        pool.set_on_connection(Arc::new(move |conn, events| {
            hook_dispatcher.clone().serve(conn, events);
        }));

        for peer in known_peers {
            pool.add_known(peer);
        }

        let driver = OutboundDriver::new(pool.clone(), service_name.clone());

        Arc::new(Runtime {
            service_name,
            pool,
            dispatcher,
            driver,
            listen_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Start accepting connections on the bound `host:port`, returning the
    /// actual bound address (useful when the configured port was 0).
    pub async fn listen(self: &Arc<Self>) -> std::io::Result<SocketAddr> {
        let bind_addr = self.pool.config().host_port.clone();
        let listener = TcpListener::bind(&bind_addr).await?;
        let local_addr = listener.local_addr()?;
        *self.listen_addr.lock() = Some(local_addr);

        let pool = self.pool.clone();
        let config = ConnectionConfig { host_port: local_addr.to_string(), ..self.pool.config().clone() };
        let task = tokio::spawn(async move {
            loop {
                let (stream, _peer_addr) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "tchannel accept failed");
                        continue;
                    }
                };
                let config = config.clone();
                let pool = pool.clone();
                tokio::spawn(async move {
                    match Connection::handshake_server(stream, config).await {
                        Ok((conn, events)) => pool.adopt_inbound(conn, events),
                        Err(e) => tracing::warn!(error = %e, "tchannel inbound handshake failed"),
                    }
                });
            }
        });
        *self.accept_task.lock() = Some(task);
        Ok(local_addr)
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock()
    }

    /// Register a typed handler for `endpoint` under scheme `S` (§4.7,
    /// §6.2, §6.3). `handler` receives the decoded headers/body plus call
    /// metadata and returns a (possibly application-error) typed outcome.
    pub fn register<S, F, Fut>(&self, endpoint: impl Into<String>, handler: F)
    where
        S: Scheme + Send + Sync + 'static,
        S::Headers: Send + 'static,
        S::Body: Send + 'static,
        F: Fn(S::Headers, S::Body, CallMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TypedOutcome<S>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let raw = move |ctx: CallContext| {
            let handler = handler.clone();
            async move {
                let headers = match S::deserialize_headers(ctx.headers) {
                    Ok(h) => h,
                    Err(e) => {
                        return HandlerOutcome::Rejected {
                            code: ErrorCode::BadRequest,
                            message: format!("bad {} headers: {e}", S::NAME),
                        }
                    }
                };
                let body = match S::deserialize_body(ctx.body) {
                    Ok(b) => b,
                    Err(e) => {
                        return HandlerOutcome::Rejected {
                            code: ErrorCode::BadRequest,
                            message: format!("bad {} body: {e}", S::NAME),
                        }
                    }
                };
                let meta = CallMeta {
                    service: ctx.service,
                    peer_host_port: ctx.peer_host_port,
                    cancel: ctx.cancel,
                };
                match handler(headers, body, meta).await {
                    TypedOutcome::Ok { headers, body } => encode_outcome::<S>(false, headers, body),
                    TypedOutcome::ApplicationError { headers, body } => encode_outcome::<S>(true, headers, body),
                    TypedOutcome::Rejected { code, message } => HandlerOutcome::Rejected { code, message },
                }
            }
        };

        fn encode_outcome<S: Scheme>(is_error: bool, headers: S::Headers, body: S::Body) -> HandlerOutcome {
            let headers = match S::serialize_headers(&headers) {
                Ok(h) => h,
                Err(e) => {
                    return HandlerOutcome::Rejected {
                        code: ErrorCode::UnexpectedError,
                        message: format!("failed to encode response headers: {e}"),
                    }
                }
            };
            let body = match S::serialize_body(&body) {
                Ok(b) => b,
                Err(e) => {
                    return HandlerOutcome::Rejected {
                        code: ErrorCode::UnexpectedError,
                        message: format!("failed to encode response body: {e}"),
                    }
                }
            };
            if is_error {
                HandlerOutcome::ApplicationError { headers, body }
            } else {
                HandlerOutcome::Ok { headers, body }
            }
        }

        self.dispatcher.register(endpoint, Arc::new(raw));
    }

    /// Issue a typed call (§6.2). `endpoint` is the arg1 bytes; `headers`
    /// and `body` are scheme-encoded before being sent as arg2/arg3, and
    /// the response is scheme-decoded the same way.
    pub async fn call<S>(
        &self,
        service: &str,
        endpoint: &str,
        headers: &S::Headers,
        body: &S::Body,
        options: CallOptions,
    ) -> Result<(tchannel_core::ResponseCode, S::Headers, S::Body), CallError>
    where
        S: Scheme,
    {
        let arg2 = S::serialize_headers(headers)
            .map_err(|e| CallError::BadRequest(format!("failed to encode {} headers: {e}", S::NAME)))?;
        let arg3 = S::serialize_body(body)
            .map_err(|e| CallError::BadRequest(format!("failed to encode {} body: {e}", S::NAME)))?;
        let args = CallArgs { arg1: Bytes::copy_from_slice(endpoint.as_bytes()), arg2, arg3 };
        let transport_headers = vec![
            ("cn".to_string(), self.service_name.clone()),
            ("as".to_string(), S::NAME.to_string()),
        ];

        let result = self.driver.call(service, args, transport_headers, options).await?;
        let headers = S::deserialize_headers(result.args.arg2)
            .map_err(|e| CallError::UnexpectedError(format!("failed to decode response headers: {e}")))?;
        let body = S::deserialize_body(result.args.arg3)
            .map_err(|e| CallError::UnexpectedError(format!("failed to decode response body: {e}")))?;
        Ok((result.code, headers, body))
    }

    /// Add a peer without calling it (useful to seed `knownPeers` after
    /// construction).
    pub fn add_peer(&self, host_port: impl Into<String>) {
        self.pool.add_known(host_port);
    }

    /// The underlying outbound driver, for callers that need
    /// [`OutboundDriver::call_cancellable`] — cancellation support that
    /// doesn't fit the retrying, scheme-typed [`Runtime::call`] surface.
    pub fn driver(&self) -> &OutboundDriver {
        &self.driver
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting new connections and close every known peer's
    /// connections (§5: "closing the top-level runtime closes all peers'
    /// connections").
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        for peer in self.pool.known_peers() {
            for conn in peer.connections() {
                conn.close();
            }
        }
    }
}
