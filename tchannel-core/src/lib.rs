//! Wire format, connection state machine and in-flight call tracking for
//! TChannel, independent of any scheme, peer pool or retry policy — those
//! live in the `tchannel` crate, layered on top of this one.

pub mod assembler;
pub mod checksum;
pub mod connection;
pub mod error;
pub mod frame;
pub mod message;
pub mod registry;

pub use checksum::ChecksumType;
pub use connection::{
    CallHandle, Connection, ConnectionConfig, ConnectionEvent, ConnectionEvents, OutboundSlot,
    PROTOCOL_VERSION,
};
pub use error::{AssemblyError, ConnectionError, ErrorCode, FrameError, UnknownChecksumType, UnknownErrorCode};
pub use frame::{Frame, FrameType, HEADER_SIZE, MAX_FRAME_SIZE};
pub use message::{
    CallArgs, CallRequestHead, CallResponseHead, ResponseCode, Tracing, MAX_ARG1_SIZE,
    MAX_SERVICE_NAME_LEN,
};
pub use registry::{CancelSignal, IdAllocator, InboundRegistry, OutboundRegistry};
