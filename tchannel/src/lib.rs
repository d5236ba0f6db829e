//! Peer pool, retrying outbound call driver, inbound dispatcher and scheme
//! interface layered on `tchannel-core`'s wire format and connection state
//! machine.

pub mod call;
pub mod dispatch;
pub mod peer;
pub mod runtime;
pub mod scheme;

pub use call::{CallError, CallOptions, CallResult, OutboundDriver, RetryCondition, RetryPolicy};
pub use dispatch::{CallContext, Dispatcher, HandlerOutcome, RawHandler};
pub use peer::{Peer, PeerPool};
pub use runtime::{CallMeta, Runtime, TypedOutcome};
pub use scheme::json::JsonScheme;
pub use scheme::raw::RawScheme;
pub use scheme::Scheme;

pub use tchannel_core::{
    AssemblyError, CallArgs, CallHandle, CallRequestHead, CallResponseHead, ChecksumType,
    Connection, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionEvents, ErrorCode,
    Frame, FrameType, OutboundSlot, ResponseCode, Tracing,
};
