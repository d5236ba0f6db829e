//! Protocol-level error taxonomy.
//!
//! Wire error codes (carried in `error` frames, type 0xFF) and the local
//! error types produced by the frame codec, the call assembler and the
//! connection state machine. None of these use `thiserror`/`anyhow`: errors
//! here are small, fixed sets of variants, so a hand-written `Display` +
//! `std::error::Error` impl is clearer than a derive.

use std::fmt;

/// Wire error codes from an `error` frame (type 0xFF).
///
/// `Timeout`, `Cancelled`, `Busy`, `Declined`, `NetworkError` are retry
/// eligible per the caller's retry policy. `BadRequest`, `UnexpectedError`
/// are surfaced, not retried. `FatalProtocolError` closes the connection.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Timeout = 0x01,
    Cancelled = 0x02,
    Busy = 0x03,
    Declined = 0x04,
    UnexpectedError = 0x05,
    BadRequest = 0x06,
    NetworkError = 0x07,
    FatalProtocolError = 0xFF,
}

impl ErrorCode {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0x01 => ErrorCode::Timeout,
            0x02 => ErrorCode::Cancelled,
            0x03 => ErrorCode::Busy,
            0x04 => ErrorCode::Declined,
            0x05 => ErrorCode::UnexpectedError,
            0x06 => ErrorCode::BadRequest,
            0x07 => ErrorCode::NetworkError,
            0xFF => ErrorCode::FatalProtocolError,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether this code is retry-eligible under *some* retry policy.
    ///
    /// This only says the code is in the retryable family (§7); whether a
    /// given call actually retries depends on the caller's
    /// `tchannel::call::RetryPolicy`, whose default set is narrower
    /// (`{connection-error, declined}`, see §4.6).
    pub fn retry_eligible(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout
                | ErrorCode::Busy
                | ErrorCode::Declined
                | ErrorCode::NetworkError
        )
    }

    /// Whether this error class is fatal to the whole connection.
    pub fn is_connection_fatal(self) -> bool {
        matches!(self, ErrorCode::FatalProtocolError)
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(val: u8) -> Result<Self, Self::Error> {
        ErrorCode::from_u8(val).ok_or(UnknownErrorCode(val))
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> u8 {
        code.as_u8()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::Busy => "busy",
            ErrorCode::Declined => "declined",
            ErrorCode::UnexpectedError => "unexpected error",
            ErrorCode::BadRequest => "bad request",
            ErrorCode::NetworkError => "network error",
            ErrorCode::FatalProtocolError => "fatal protocol error",
        };
        write!(f, "{} ({:#04x})", name, self.as_u8())
    }
}

/// Error when decoding an unrecognized wire error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownErrorCode(pub u8);

impl fmt::Display for UnknownErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown error code: {:#04x}", self.0)
    }
}

impl std::error::Error for UnknownErrorCode {}

/// Errors from the frame codec (§4.1). Any `FrameError` is fatal to the
/// connection it occurred on.
#[derive(Debug)]
pub enum FrameError {
    /// `size` field was below the 16-byte header minimum.
    TooSmall { size: u16 },
    /// `size` field exceeded the 64 KiB frame limit.
    TooLarge { size: u32 },
    /// The socket closed before a full frame's header/payload could be read.
    Truncated,
    /// `type` byte did not match a known frame type.
    UnknownType(u8),
    /// Underlying I/O failure.
    Io(std::io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TooSmall { size } => {
                write!(f, "frame size {} is below the 16-byte header minimum", size)
            }
            FrameError::TooLarge { size } => {
                write!(f, "frame size {} exceeds the 65535-byte limit", size)
            }
            FrameError::Truncated => write!(f, "connection closed mid-frame"),
            FrameError::UnknownType(t) => write!(f, "unknown frame type {:#04x}", t),
            FrameError::Io(e) => write!(f, "frame I/O error: {}", e),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(e: std::io::Error) -> Self {
        FrameError::Io(e)
    }
}

/// Errors from call assembly/reassembly (§4.3). An `AssemblyError` aborts
/// only the affected call; it never closes the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// A frame continuation arrived for an id with no in-progress message.
    NoSuchAssembly { id: u32 },
    /// An arg's length prefix claimed more bytes than the message contained.
    ArgLengthMismatch,
    /// Not all three args were present when the message was marked complete.
    MissingArgs { expected: usize, got: usize },
    /// Checksum verification failed.
    ChecksumMismatch,
    /// A field (service name, header string, ...) was not valid UTF-8.
    InvalidUtf8,
}

impl fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssemblyError::NoSuchAssembly { id } => {
                write!(f, "continuation frame for unknown message id {}", id)
            }
            AssemblyError::ArgLengthMismatch => {
                write!(f, "arg length prefix was not exactly consumed")
            }
            AssemblyError::MissingArgs { expected, got } => {
                write!(f, "expected {} args, assembled {}", expected, got)
            }
            AssemblyError::ChecksumMismatch => write!(f, "checksum verification failed"),
            AssemblyError::InvalidUtf8 => write!(f, "invalid utf-8 in string field"),
        }
    }
}

impl std::error::Error for AssemblyError {}

/// Errors surfaced by the connection state machine (§4.2).
#[derive(Debug)]
pub enum ConnectionError {
    /// Peer's `init` carried an unsupported protocol version.
    VersionMismatch { got: u16, want: u16 },
    /// A non-init frame arrived before the handshake completed.
    HandshakeNotReady,
    /// Peer sent `init res`/`init req` out of turn.
    UnexpectedHandshakeFrame,
    /// A fatal decode error on the wire.
    Frame(FrameError),
    /// The connection was closed (locally or by the peer).
    Closed,
    /// Peer sent a connection-fatal error frame.
    PeerFatal(String),
    /// Peer sent a call-scoped error frame (timeout, busy, declined, ...);
    /// the connection itself stays up.
    CallFailed { code: ErrorCode, message: String },
    /// The outgoing call could not even be encoded (e.g. arg1/service
    /// name too large); never sent to the peer.
    InvalidMessage(AssemblyError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::VersionMismatch { got, want } => {
                write!(f, "protocol version mismatch: peer sent {}, expected {}", got, want)
            }
            ConnectionError::HandshakeNotReady => {
                write!(f, "frame received before handshake completed")
            }
            ConnectionError::UnexpectedHandshakeFrame => {
                write!(f, "handshake frame received out of turn")
            }
            ConnectionError::Frame(e) => write!(f, "{}", e),
            ConnectionError::Closed => write!(f, "connection closed"),
            ConnectionError::PeerFatal(msg) => write!(f, "peer sent fatal protocol error: {}", msg),
            ConnectionError::CallFailed { code, message } => {
                write!(f, "call failed: {} ({})", code, message)
            }
            ConnectionError::InvalidMessage(e) => write!(f, "invalid outgoing message: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Frame(e) => Some(e),
            ConnectionError::InvalidMessage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FrameError> for ConnectionError {
    fn from(e: FrameError) -> Self {
        ConnectionError::Frame(e)
    }
}
