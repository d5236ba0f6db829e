//! Call fragmentation and reassembly (§4.3).
//!
//! Sending is buffered: a full logical message (head + all three args) is
//! encoded up front, then sliced into frame-sized chunks. Each chunk is
//! prefixed with its own `flags` byte carrying the more-fragments bit;
//! nothing else is repeated across continuation frames. Receiving walks
//! the inverse path: frames sharing an id accumulate into one buffer until
//! a frame arrives with the more-fragments bit clear.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::AssemblyError;
use crate::frame::{Frame, FrameType, HEADER_SIZE};
use crate::message::FLAG_MORE_FRAGMENTS;

/// Max bytes of logical-message blob that fit in one frame's payload,
/// after the mandatory 1-byte flags field.
fn chunk_budget() -> usize {
    crate::frame::MAX_FRAME_SIZE - HEADER_SIZE - 1
}

/// Split an encoded call head+args blob into frames sharing `id`.
///
/// `initial_type`/`continue_type` let this serve both call req (§3) and
/// call res: pass `(CallReq, CallReqContinue)` or `(CallRes,
/// CallResContinue)`.
pub fn fragment(
    id: u32,
    blob: &Bytes,
    initial_type: FrameType,
    continue_type: FrameType,
) -> Vec<Frame> {
    let budget = chunk_budget();
    if blob.is_empty() {
        let mut payload = BytesMut::with_capacity(1);
        payload.put_u8(0);
        return vec![Frame::new(initial_type, id, payload.freeze())
            .expect("single empty-blob frame is always within the size limit")];
    }

    let mut frames = Vec::new();
    let mut offset = 0usize;
    let mut first = true;
    while offset < blob.len() {
        let end = (offset + budget).min(blob.len());
        let more = end < blob.len();
        let mut payload = BytesMut::with_capacity(1 + (end - offset));
        payload.put_u8(if more { FLAG_MORE_FRAGMENTS } else { 0 });
        payload.put_slice(&blob[offset..end]);
        let frame_type = if first { initial_type } else { continue_type };
        frames.push(
            Frame::new(frame_type, id, payload.freeze())
                .expect("chunk size was computed to fit the frame budget"),
        );
        offset = end;
        first = false;
    }
    frames
}

/// One id's in-progress reassembly state.
struct Pending {
    buf: BytesMut,
}

/// Accumulates `call req`/`call res` (+ continuation) frames by id until a
/// complete logical message blob is available.
///
/// One `Reassembler` instance is owned per direction (inbound calls,
/// outbound responses) by the connection state machine.
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<u32, Pending>,
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler { pending: HashMap::new() }
    }

    /// Feed one frame in. Returns `Some(blob)` once the message for this
    /// id is complete (more-fragments bit clear), `None` if more
    /// continuation frames are still expected.
    pub fn push(&mut self, frame: &Frame) -> Result<Option<Bytes>, AssemblyError> {
        if frame.payload.is_empty() {
            return Err(AssemblyError::ArgLengthMismatch);
        }
        let flags = frame.payload[0];
        let chunk = &frame.payload[1..];
        let more = flags & FLAG_MORE_FRAGMENTS != 0;

        let entry = self.pending.entry(frame.id).or_insert_with(|| Pending { buf: BytesMut::new() });
        entry.buf.put_slice(chunk);

        if more {
            Ok(None)
        } else {
            let Pending { buf } = self.pending.remove(&frame.id).expect("just inserted above");
            Ok(Some(buf.freeze()))
        }
    }

    /// Drop any partial state for `id` (call cancelled/failed mid-assembly).
    pub fn abandon(&mut self, id: u32) {
        self.pending.remove(&id);
    }

    /// Whether reassembly is in progress for `id`. Used to distinguish a
    /// stray continuation frame (no matching call req/res ever started)
    /// from ordinary mid-stream continuations.
    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumType;
    use crate::message::{CallArgs, CallRequestHead, Tracing};

    fn big_args(arg3_len: usize) -> CallArgs {
        CallArgs {
            arg1: Bytes::from_static(b"endpoint"),
            arg2: Bytes::new(),
            arg3: Bytes::from(vec![0xAB; arg3_len]),
        }
    }

    #[test]
    fn single_frame_roundtrip() {
        let head = CallRequestHead {
            ttl_ms: 1000,
            tracing: Tracing::default(),
            service: "svc".to_string(),
            headers: vec![],
            checksum_type: ChecksumType::Crc32,
        };
        let args = big_args(100);
        let blob = head.encode_with_args(&args).unwrap();
        let frames = fragment(9, &blob, FrameType::CallReq, FrameType::CallReqContinue);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, FrameType::CallReq);

        let mut reasm = Reassembler::new();
        let reassembled = reasm.push(&frames[0]).unwrap().unwrap();
        let (decoded_head, decoded_args) = CallRequestHead::decode(reassembled).unwrap();
        assert_eq!(decoded_head, head);
        assert_eq!(decoded_args, args);
    }

    #[test]
    fn large_body_splits_into_many_frames_same_id() {
        let head = CallRequestHead {
            ttl_ms: 1000,
            tracing: Tracing::default(),
            service: "svc".to_string(),
            headers: vec![],
            checksum_type: ChecksumType::Crc32C,
        };
        let args = big_args(200 * 1024);
        let blob = head.encode_with_args(&args).unwrap();
        let frames = fragment(11, &blob, FrameType::CallReq, FrameType::CallReqContinue);
        assert!(frames.len() >= 4, "200KiB body should need several frames, got {}", frames.len());
        assert!(frames.iter().all(|f| f.id == 11));
        assert_eq!(frames[0].frame_type, FrameType::CallReq);
        assert!(frames[1..].iter().all(|f| f.frame_type == FrameType::CallReqContinue));
        for f in &frames {
            assert!(f.encoded_len() <= crate::frame::MAX_FRAME_SIZE);
        }

        let mut reasm = Reassembler::new();
        let mut result = None;
        for f in &frames {
            result = reasm.push(f).unwrap();
        }
        let blob = result.expect("last frame should complete the message");
        let (decoded_head, decoded_args) = CallRequestHead::decode(blob).unwrap();
        assert_eq!(decoded_head, head);
        assert_eq!(decoded_args, args);
    }

    #[test]
    fn interleaved_ids_reassemble_independently() {
        let head_a = CallRequestHead {
            ttl_ms: 1,
            tracing: Tracing::default(),
            service: "a".to_string(),
            headers: vec![],
            checksum_type: ChecksumType::None,
        };
        let head_b = CallRequestHead {
            ttl_ms: 2,
            tracing: Tracing::default(),
            service: "b".to_string(),
            headers: vec![],
            checksum_type: ChecksumType::None,
        };
        let args_a = big_args(150 * 1024);
        let args_b = big_args(150 * 1024);
        let blob_a = head_a.encode_with_args(&args_a).unwrap();
        let blob_b = head_b.encode_with_args(&args_b).unwrap();
        let frames_a = fragment(2, &blob_a, FrameType::CallReq, FrameType::CallReqContinue);
        let frames_b = fragment(4, &blob_b, FrameType::CallReq, FrameType::CallReqContinue);

        let mut reasm = Reassembler::new();
        let mut done_a = None;
        let mut done_b = None;
        let max_len = frames_a.len().max(frames_b.len());
        for i in 0..max_len {
            if let Some(f) = frames_a.get(i) {
                if let Some(blob) = reasm.push(f).unwrap() {
                    done_a = Some(blob);
                }
            }
            if let Some(f) = frames_b.get(i) {
                if let Some(blob) = reasm.push(f).unwrap() {
                    done_b = Some(blob);
                }
            }
        }
        let (decoded_a, _) = CallRequestHead::decode(done_a.unwrap()).unwrap();
        let (decoded_b, _) = CallRequestHead::decode(done_b.unwrap()).unwrap();
        assert_eq!(decoded_a.service, "a");
        assert_eq!(decoded_b.service, "b");
    }

    #[test]
    fn empty_payload_frame_is_rejected() {
        let frame = Frame::new(FrameType::CallReq, 1, Bytes::new()).unwrap();
        let mut reasm = Reassembler::new();
        assert_eq!(reasm.push(&frame).unwrap_err(), AssemblyError::ArgLengthMismatch);
    }

    #[test]
    fn abandon_clears_partial_state() {
        let head = CallRequestHead {
            ttl_ms: 1,
            tracing: Tracing::default(),
            service: "svc".to_string(),
            headers: vec![],
            checksum_type: ChecksumType::None,
        };
        let args = big_args(200 * 1024);
        let blob = head.encode_with_args(&args).unwrap();
        let frames = fragment(3, &blob, FrameType::CallReq, FrameType::CallReqContinue);
        assert!(frames.len() > 1);

        let mut reasm = Reassembler::new();
        reasm.push(&frames[0]).unwrap();
        assert!(reasm.is_pending(3));
        reasm.abandon(3);
        assert!(!reasm.is_pending(3));
        assert_eq!(reasm.pending_count(), 0);
    }
}
