//! Inbound dispatcher: route incoming calls to a registered handler by
//! endpoint, and adapt the handler's result back into response frames
//! (§4.7).
//!
//! Handler execution is concurrent: the dispatcher spawns one task per
//! inbound call and never serializes them against each other. Response
//! order on the wire is whatever order each handler task finishes in,
//! matching §5's ordering guarantees.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tchannel_core::{
    CallArgs, CallResponseHead, ChecksumType, Connection, ConnectionEvent, ConnectionEvents,
    ErrorCode, ResponseCode, Tracing,
};

/// Everything a handler needs about one inbound call.
pub struct CallContext {
    pub id: u32,
    pub service: String,
    pub transport_headers: Vec<(String, String)>,
    pub tracing: Tracing,
    /// Application headers (arg2), not yet scheme-decoded.
    pub headers: Bytes,
    /// Request body (arg3), not yet scheme-decoded.
    pub body: Bytes,
    pub peer_host_port: String,
    pub cancel: tchannel_core::CancelSignal,
}

/// What a handler produced, already scheme-encoded into bytes. Built by
/// the typed adapter `Runtime::register` installs (§6.3: the core never
/// sees a handler's typed request/response, only these bytes).
pub enum HandlerOutcome {
    /// `headers` is the scheme-serialized response arg2; `body` is arg3.
    Ok { headers: Bytes, body: Bytes },
    /// A handler-raised application error: still a normal `call res`
    /// envelope with `code=0x01` (§4.7, §7), not a wire `error` frame.
    ApplicationError { headers: Bytes, body: Bytes },
    /// The call never reached application code — e.g. the scheme failed to
    /// decode arg2/arg3. Sent as a wire `error` frame, not a `call res`.
    Rejected { code: ErrorCode, message: String },
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased endpoint handler the dispatcher actually stores. Built by
/// wrapping a typed handler plus its request/response schemes (§4.7,
/// §6.3); callers normally go through `Runtime::register` rather than
/// implementing this directly.
pub trait RawHandler: Send + Sync {
    fn call<'a>(&'a self, ctx: CallContext) -> BoxFuture<'a, HandlerOutcome>;
}

impl<F, Fut> RawHandler for F
where
    F: Fn(CallContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    fn call<'a>(&'a self, ctx: CallContext) -> BoxFuture<'a, HandlerOutcome> {
        Box::pin((self)(ctx))
    }
}

/// Maps endpoint name (arg1) to handler (§4.7). Registration happens up
/// front via `Runtime::register`; the spec's "builder producing an
/// immutable dispatch table" redesign note (§9) is satisfied by building
/// the map before `listen`, then only ever reading it afterwards — we keep
/// the `RwLock` for late registration rather than a hard split type, since
/// nothing here needs the extra type-state ceremony.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn RawHandler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher::default()
    }

    pub fn register(&self, endpoint: impl Into<String>, handler: Arc<dyn RawHandler>) {
        self.handlers.write().insert(endpoint.into(), handler);
    }

    fn lookup(&self, endpoint: &[u8]) -> Option<Arc<dyn RawHandler>> {
        let name = std::str::from_utf8(endpoint).ok()?;
        self.handlers.read().get(name).cloned()
    }

    /// Drive one connection's inbound events until it closes, dispatching
    /// each `call req` to its handler concurrently (§4.7, §5).
    pub fn serve(self: Arc<Self>, conn: Connection, mut events: ConnectionEvents) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ConnectionEvent::CallRequest { id, head, args } => {
                        let dispatcher = self.clone();
                        let conn = conn.clone();
                        tokio::spawn(async move { dispatcher.handle_call(conn, id, head, args).await });
                    }
                    ConnectionEvent::Cancel { .. } => {
                        // The connection's inbound registry already marked the
                        // handler's CancelSignal; nothing further to do here.
                    }
                    ConnectionEvent::Claim { .. } => {
                        // Claim (message ownership handoff between relays) has
                        // no core-level behavior to adapt; out of scope here.
                    }
                }
            }
        });
    }

    async fn handle_call(
        &self,
        conn: Connection,
        id: u32,
        head: tchannel_core::CallRequestHead,
        args: CallArgs,
    ) {
        let Some(handler) = self.lookup(&args.arg1) else {
            let endpoint = String::from_utf8_lossy(&args.arg1);
            tracing::warn!(id, endpoint = %endpoint, "no handler for endpoint");
            let _ = conn.respond_error(id, ErrorCode::BadRequest, "no such endpoint").await;
            return;
        };

        let cancel = conn.inbound_begin(id);
        let ctx = CallContext {
            id,
            service: head.service.clone(),
            transport_headers: head.headers.clone(),
            tracing: head.tracing,
            headers: args.arg2.clone(),
            body: args.arg3.clone(),
            peer_host_port: conn.peer_host_port(),
            cancel: cancel.clone(),
        };

        let outcome = handler.call(ctx).await;
        if cancel.is_cancelled() {
            // Best-effort cancellation (§4.7, §5): the peer already gave up
            // on this id, so don't bother writing a response it discarded.
            return;
        }

        let (code, arg2, arg3) = match outcome {
            HandlerOutcome::Ok { headers, body } => (ResponseCode::Ok, headers, body),
            HandlerOutcome::ApplicationError { headers, body } => {
                (ResponseCode::ApplicationError, headers, body)
            }
            HandlerOutcome::Rejected { code, message } => {
                let _ = conn.respond_error(id, code, &message).await;
                return;
            }
        };
        let response_head = CallResponseHead {
            code,
            tracing: head.tracing,
            headers: Vec::new(),
            checksum_type: ChecksumType::Crc32,
        };
        let response_args = CallArgs { arg1: Bytes::new(), arg2, arg3 };
        if let Err(e) = conn.respond(id, response_head, response_args).await {
            tracing::warn!(id, error = %e, "failed to send call response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_is_case_sensitive_and_absent_by_default() {
        let dispatcher = Dispatcher::new();
        assert!(dispatcher.lookup(b"echo").is_none());
        dispatcher.register(
            "echo",
            Arc::new(|ctx: CallContext| async move { HandlerOutcome::Ok { headers: Bytes::new(), body: ctx.body } }),
        );
        assert!(dispatcher.lookup(b"echo").is_some());
        assert!(dispatcher.lookup(b"Echo").is_none());
    }
}
