//! Connection state machine (§4.2): handshake, frame demultiplexing,
//! keepalive, and shutdown draining.
//!
//! Each connection owns one reader task and one writer task over split
//! stream halves. The writer task is the only thing that ever touches the
//! write half, fed by an mpsc queue, so frame writes are always whole and
//! serialized even when call req/res fragments interleave across ids.
//! Everything above this (peer selection, retries, dispatch) lives in the
//! application layer, not here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Notify};

use crate::assembler::{self, Reassembler};
use crate::checksum::ChecksumType;
use crate::error::{ConnectionError, ErrorCode};
use crate::frame::{Frame, FrameType};
use crate::message::{
    decode_header_list, encode_header_list, CallArgs, CallRequestHead, CallResponseHead, Tracing,
};
use crate::registry::{CancelSignal, InboundRegistry, OutboundRegistry};

/// Protocol version this implementation speaks (§4.2).
pub const PROTOCOL_VERSION: u16 = 2;

/// Message id reserved for the init handshake (§4.2, §4.4: "1 is reserved
/// for handshake"). Both `init req` and its `init res` use this id.
const HANDSHAKE_ID: u32 = 1;

/// Local identity sent in the init handshake and used to label frames
/// that otherwise carry no service-name field (ping, cancel, claim).
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    pub host_port: String,
    pub process_name: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host_port: "0.0.0.0:0".to_string(),
            process_name: "tchannel".to_string(),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

/// An inbound event the application layer must react to: a new call, or
/// a control signal about one already being handled.
#[derive(Debug)]
pub enum ConnectionEvent {
    CallRequest { id: u32, head: CallRequestHead, args: CallArgs },
    Cancel { id: u32 },
    Claim { id: u32 },
}

pub type OutboundSlot = Result<(CallResponseHead, CallArgs), ConnectionError>;

struct Shared {
    write_tx: Mutex<Option<mpsc::Sender<Frame>>>,
    outbound: OutboundRegistry<OutboundSlot>,
    inbound: InboundRegistry,
    ping_waiters: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    ping_ids: AtomicU32,
    closed: AtomicBool,
    shutdown: Notify,
    peer_host_port: Mutex<String>,
}

/// A live, handshaked TChannel connection. Cheap to clone; clones share
/// the same reader/writer tasks and in-flight registries.
#[derive(Clone)]
pub struct Connection(Arc<Shared>);

/// The inbound event stream for a [`Connection`]; owned separately so the
/// dispatcher loop can hold `&mut self` while callers still send on
/// [`Connection`] from other tasks.
pub struct ConnectionEvents {
    rx: mpsc::Receiver<ConnectionEvent>,
}

impl ConnectionEvents {
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        self.rx.recv().await
    }
}

impl Connection {
    /// Run the client side of the init handshake, then start the
    /// reader/writer/keepalive tasks.
    pub async fn handshake_client<S>(
        stream: S,
        config: ConnectionConfig,
    ) -> Result<(Connection, ConnectionEvents), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let init_payload = encode_init_payload(&config);
        Frame::new(FrameType::InitReq, HANDSHAKE_ID, init_payload)
            .map_err(ConnectionError::from)?
            .write_to(&mut write_half)
            .await
            .map_err(ConnectionError::from)?;

        let reply = Frame::read_from(&mut read_half).await.map_err(ConnectionError::from)?;
        if reply.frame_type != FrameType::InitRes {
            return Err(ConnectionError::UnexpectedHandshakeFrame);
        }
        let (peer_version, peer_headers) = decode_init_payload(reply.payload)?;
        if peer_version != PROTOCOL_VERSION {
            send_fatal_version_mismatch(&mut write_half).await;
            return Err(ConnectionError::VersionMismatch { got: peer_version, want: PROTOCOL_VERSION });
        }
        let peer_host_port = peer_headers
            .iter()
            .find(|(k, _)| k == "host_port")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();

        Ok(Self::spawn(read_half, write_half, config, peer_host_port))
    }

    /// Run the server side of the init handshake, then start the
    /// reader/writer/keepalive tasks.
    pub async fn handshake_server<S>(
        stream: S,
        config: ConnectionConfig,
    ) -> Result<(Connection, ConnectionEvents), ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        let request = Frame::read_from(&mut read_half).await.map_err(ConnectionError::from)?;
        if request.frame_type != FrameType::InitReq {
            return Err(ConnectionError::HandshakeNotReady);
        }
        let (peer_version, peer_headers) = decode_init_payload(request.payload)?;
        if peer_version != PROTOCOL_VERSION {
            send_fatal_version_mismatch(&mut write_half).await;
            return Err(ConnectionError::VersionMismatch { got: peer_version, want: PROTOCOL_VERSION });
        }
        let peer_host_port = peer_headers
            .iter()
            .find(|(k, _)| k == "host_port")
            .map(|(_, v)| v.clone())
            .unwrap_or_default();

        let reply_payload = encode_init_payload(&config);
        Frame::new(FrameType::InitRes, HANDSHAKE_ID, reply_payload)
            .map_err(ConnectionError::from)?
            .write_to(&mut write_half)
            .await
            .map_err(ConnectionError::from)?;

        Ok(Self::spawn(read_half, write_half, config, peer_host_port))
    }

    fn spawn<R, W>(
        read_half: R,
        write_half: W,
        config: ConnectionConfig,
        peer_host_port: String,
    ) -> (Connection, ConnectionEvents)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (write_tx, write_rx) = mpsc::channel::<Frame>(256);
        let (event_tx, event_rx) = mpsc::channel::<ConnectionEvent>(256);

        let shared = Arc::new(Shared {
            write_tx: Mutex::new(Some(write_tx.clone())),
            outbound: OutboundRegistry::new(),
            inbound: InboundRegistry::new(),
            ping_waiters: Mutex::new(HashMap::new()),
            ping_ids: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            peer_host_port: Mutex::new(peer_host_port),
        });

        tokio::spawn(writer_loop(write_half, write_rx));
        tokio::spawn(reader_loop(shared.clone(), read_half, event_tx, write_tx.clone()));
        tokio::spawn(keepalive_loop(shared.clone(), write_tx, config));

        (Connection(shared), ConnectionEvents { rx: event_rx })
    }

    /// The peer's advertised `host_port`, as seen during handshake.
    pub fn peer_host_port(&self) -> String {
        self.0.peer_host_port.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    pub fn in_flight_outbound(&self) -> usize {
        self.0.outbound.in_flight_count()
    }

    pub fn in_flight_inbound(&self) -> usize {
        self.0.inbound.in_flight_count()
    }

    /// Send a call request and await its response, fragmenting as needed.
    pub async fn call(
        &self,
        head: CallRequestHead,
        args: CallArgs,
    ) -> Result<(CallResponseHead, CallArgs), ConnectionError> {
        let (_handle, rx) = self.call_cancellable(head, args).await?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Like [`Connection::call`], but returns a [`CallHandle`] the caller
    /// can use to cancel the call before its response arrives (§4.6), plus
    /// the receiver to await the eventual result on.
    pub async fn call_cancellable(
        &self,
        head: CallRequestHead,
        args: CallArgs,
    ) -> Result<(CallHandle, oneshot::Receiver<OutboundSlot>), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let blob = head.encode_with_args(&args).map_err(ConnectionError::InvalidMessage)?;
        let (id, rx) = self.0.outbound.register();
        let frames = assembler::fragment(id, &blob, FrameType::CallReq, FrameType::CallReqContinue);
        self.enqueue_frames(frames).await?;
        Ok((CallHandle { conn: self.clone(), id }, rx))
    }

    /// Cancel an outbound call in flight: tells the peer, and locally
    /// fails the waiter immediately rather than waiting for a response.
    pub async fn cancel(&self, id: u32) -> Result<(), ConnectionError> {
        self.0.outbound.complete(id, Err(ConnectionError::CallFailed {
            code: ErrorCode::Cancelled,
            message: "cancelled locally".to_string(),
        }));
        let frame = Frame::new(FrameType::Cancel, id, Bytes::new())?;
        self.enqueue_frames(vec![frame]).await
    }

    /// Send a call response for an inbound call previously surfaced via
    /// [`ConnectionEvents::recv`].
    pub async fn respond(
        &self,
        id: u32,
        head: CallResponseHead,
        args: CallArgs,
    ) -> Result<(), ConnectionError> {
        let blob = head.encode_with_args(&args);
        let frames = assembler::fragment(id, &blob, FrameType::CallRes, FrameType::CallResContinue);
        self.0.inbound.end(id);
        self.enqueue_frames(frames).await
    }

    /// Send a call-scoped error frame for an inbound call (e.g. bad
    /// request, declined) instead of a normal response.
    pub async fn respond_error(
        &self,
        id: u32,
        code: ErrorCode,
        message: &str,
    ) -> Result<(), ConnectionError> {
        self.0.inbound.end(id);
        let mut payload = BytesMut::with_capacity(1 + message.len());
        payload.put_u8(code.as_u8());
        payload.put_slice(message.as_bytes());
        let frame = Frame::new(FrameType::Error, id, payload.freeze())?;
        self.enqueue_frames(vec![frame]).await
    }

    /// Register that a handler for `id` has started, returning its cancel
    /// signal. Called by the dispatcher right before invoking a handler.
    pub fn inbound_begin(&self, id: u32) -> CancelSignal {
        self.0.inbound.begin(id)
    }

    async fn enqueue_frames(&self, frames: Vec<Frame>) -> Result<(), ConnectionError> {
        let tx = self.0.write_tx.lock().clone();
        let Some(tx) = tx else { return Err(ConnectionError::Closed) };
        for frame in frames {
            tx.send(frame).await.map_err(|_| ConnectionError::Closed)?;
        }
        Ok(())
    }

    /// Close the connection: stop accepting new sends and fail every
    /// outbound waiter with [`ConnectionError::Closed`] (§4.2 shutdown
    /// draining). In-flight inbound handlers are left to finish; their
    /// responses will simply fail to send once the writer task exits.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.write_tx.lock().take();
        self.0.shutdown.notify_waiters();
        self.0.outbound.fail_all(|| Err(ConnectionError::Closed));
    }
}

/// A handle to one in-flight outbound call, letting the caller cancel it
/// (§4.6, §5): removes the registry entry, resolves the waiter locally with
/// `Cancelled`, and best-effort sends a `cancel` frame so the peer can stop
/// work early. Arriving responses for an id cancelled this way are simply
/// never delivered — the waiter they'd resolve is already gone.
#[derive(Clone)]
pub struct CallHandle {
    conn: Connection,
    id: u32,
}

impl CallHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn cancel(&self) -> Result<(), ConnectionError> {
        self.conn.cancel(self.id).await
    }
}

/// Send a connection-fatal `error` frame (type 0xFF, code 0xFF
/// `FatalProtocolError`) announcing a protocol version mismatch, before the
/// caller drops the socket (§4.2: "Mismatched version → send `error` frame
/// class `ProtocolError` and close"). Best-effort: a write failure here just
/// means the peer won't see why the connection closed, which is no worse
/// than not sending anything.
async fn send_fatal_version_mismatch<W>(write_half: &mut W)
where
    W: AsyncWrite + Unpin,
{
    let mut payload = BytesMut::new();
    payload.put_u8(ErrorCode::FatalProtocolError.as_u8());
    payload.put_slice(b"protocol version mismatch");
    if let Ok(frame) = Frame::new(FrameType::Error, HANDSHAKE_ID, payload.freeze()) {
        let _ = frame.write_to(write_half).await;
    }
}

fn encode_init_payload(config: &ConnectionConfig) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u16(PROTOCOL_VERSION);
    encode_header_list(
        &mut buf,
        &[
            ("host_port".to_string(), config.host_port.clone()),
            ("process_name".to_string(), config.process_name.clone()),
        ],
    );
    buf.freeze()
}

fn decode_init_payload(mut buf: Bytes) -> Result<(u16, Vec<(String, String)>), ConnectionError> {
    if buf.len() < 2 {
        return Err(ConnectionError::UnexpectedHandshakeFrame);
    }
    let version = buf.get_u16();
    let headers =
        decode_header_list(&mut buf).map_err(|_| ConnectionError::UnexpectedHandshakeFrame)?;
    Ok((version, headers))
}

async fn writer_loop<W>(mut write_half: W, mut rx: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(frame) = rx.recv().await {
        if let Err(e) = frame.write_to(&mut write_half).await {
            tracing::warn!(error = %e, "tchannel connection write failed, closing writer");
            break;
        }
    }
}

async fn reader_loop<R>(
    shared: Arc<Shared>,
    mut read_half: R,
    event_tx: mpsc::Sender<ConnectionEvent>,
    write_tx: mpsc::Sender<Frame>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut inbound_reasm = Reassembler::new();
    let mut outbound_reasm = Reassembler::new();

    loop {
        let frame = tokio::select! {
            _ = shared.shutdown.notified() => break,
            result = Frame::try_read_from(&mut read_half) => result,
        };

        let frame = match frame {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "tchannel frame decode error, closing connection");
                break;
            }
        };

        match frame.frame_type {
            FrameType::InitReq | FrameType::InitRes => {
                tracing::warn!(id = frame.id, "unexpected handshake frame after handshake");
                break;
            }
            FrameType::CallReq | FrameType::CallReqContinue => {
                match inbound_reasm.push(&frame) {
                    Ok(Some(blob)) => match CallRequestHead::decode(blob) {
                        Ok((head, args)) => {
                            let id = frame.id;
                            if event_tx
                                .send(ConnectionEvent::CallRequest { id, head, args })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(id = frame.id, error = %e, "bad call req, sending BadRequest");
                            let mut payload = BytesMut::new();
                            payload.put_u8(ErrorCode::BadRequest.as_u8());
                            payload.put_slice(e.to_string().as_bytes());
                            if let Ok(f) = Frame::new(FrameType::Error, frame.id, payload.freeze()) {
                                let _ = write_tx.send(f).await;
                            }
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(id = frame.id, error = %e, "call req assembly error");
                    }
                }
            }
            FrameType::CallRes | FrameType::CallResContinue => {
                match outbound_reasm.push(&frame) {
                    Ok(Some(blob)) => {
                        let result = CallResponseHead::decode(blob)
                            .map_err(|e| ConnectionError::CallFailed {
                                code: ErrorCode::BadRequest,
                                message: e.to_string(),
                            });
                        shared.outbound.complete(frame.id, result);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(id = frame.id, error = %e, "call res assembly error");
                        shared.outbound.complete(
                            frame.id,
                            Err(ConnectionError::CallFailed {
                                code: ErrorCode::BadRequest,
                                message: e.to_string(),
                            }),
                        );
                    }
                }
            }
            FrameType::Cancel => {
                shared.inbound.cancel(frame.id);
                let _ = event_tx.send(ConnectionEvent::Cancel { id: frame.id }).await;
            }
            FrameType::Claim => {
                let _ = event_tx.send(ConnectionEvent::Claim { id: frame.id }).await;
            }
            FrameType::PingReq => {
                if write_tx.send(Frame::new(FrameType::PingRes, frame.id, Bytes::new()).unwrap()).await.is_err() {
                    break;
                }
            }
            FrameType::PingRes => {
                if let Some(tx) = shared.ping_waiters.lock().remove(&frame.id) {
                    let _ = tx.send(());
                }
            }
            FrameType::Error => {
                let payload = frame.payload.clone();
                if payload.is_empty() {
                    continue;
                }
                let code_byte = payload[0];
                let message = String::from_utf8_lossy(&payload[1..]).to_string();
                match ErrorCode::from_u8(code_byte) {
                    Some(code) if code.is_connection_fatal() => {
                        tracing::error!(message = %message, "peer sent fatal protocol error, closing connection");
                        shared
                            .outbound
                            .fail_all(|| Err(ConnectionError::PeerFatal(message.clone())));
                        break;
                    }
                    Some(code) => {
                        shared
                            .outbound
                            .complete(frame.id, Err(ConnectionError::CallFailed { code, message: message.clone() }));
                    }
                    None => {
                        tracing::warn!(code = code_byte, "unknown error code in error frame");
                    }
                }
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
    shared.write_tx.lock().take();
    shared.outbound.fail_all(|| Err(ConnectionError::Closed));
}

async fn keepalive_loop(shared: Arc<Shared>, write_tx: mpsc::Sender<Frame>, config: ConnectionConfig) {
    let mut interval = tokio::time::interval(config.ping_interval);
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = shared.shutdown.notified() => return,
            _ = interval.tick() => {}
        }
        if shared.closed.load(Ordering::SeqCst) {
            return;
        }
        let id = shared.ping_ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        shared.ping_waiters.lock().insert(id, tx);
        if write_tx
            .send(Frame::new(FrameType::PingReq, id, Bytes::new()).unwrap())
            .await
            .is_err()
        {
            return;
        }
        match tokio::time::timeout(config.ping_timeout, rx).await {
            Ok(Ok(())) => {}
            _ => {
                tracing::warn!("ping timed out, closing connection");
                shared.ping_waiters.lock().remove(&id);
                shared.closed.store(true, Ordering::SeqCst);
                shared.write_tx.lock().take();
                shared.shutdown.notify_waiters();
                shared.outbound.fail_all(|| Err(ConnectionError::Closed));
                return;
            }
        }
    }
}
