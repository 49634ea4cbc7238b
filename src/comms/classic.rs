//! Fixed-length binary framing (Daum 8008 classic cockpits).
//!
//! A request is `[opcode, bike_number, payload...]`. The response length is
//! known per command and its first byte echoes the opcode.

use bytes::{BufMut, Bytes, BytesMut};

use super::{FrameCodec, FrameEvent};
use crate::error::{PedalError, Result};

/// Request together with the length of the response it produces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassicRequest {
    /// Bytes written to the wire, opcode first
    pub payload: Vec<u8>,
    /// Exact length of the response
    pub response_len: usize,
}

impl ClassicRequest {
    /// Create a request
    #[must_use]
    pub const fn new(payload: Vec<u8>, response_len: usize) -> Self {
        Self {
            payload,
            response_len,
        }
    }

    /// Opcode byte
    #[must_use]
    pub fn opcode(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Codec collecting exactly the declared number of response bytes
#[derive(Debug, Default)]
pub struct ClassicCodec {
    expected: Option<(u8, usize)>,
}

impl FrameCodec for ClassicCodec {
    type Request = ClassicRequest;
    type Response = Bytes;

    fn encode(&mut self, request: &ClassicRequest, dst: &mut BytesMut) -> Result<()> {
        let opcode = request
            .opcode()
            .ok_or_else(|| PedalError::InvalidArgument("empty request".to_string()))?;
        if request.response_len == 0 {
            return Err(PedalError::InvalidArgument(format!(
                "request {opcode:02X} expects no response"
            )));
        }

        self.expected = Some((opcode, request.response_len));
        dst.put_slice(&request.payload);
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut) -> Option<FrameEvent<Bytes>> {
        let (opcode, len) = self.expected?;
        if src.len() < len {
            return None;
        }

        self.expected = None;
        let frame = src.split_to(len).freeze();
        if frame[0] == opcode {
            Some(FrameEvent::Response(frame))
        } else {
            Some(FrameEvent::Illegal(PedalError::IllegalResponse(format!(
                "expected opcode {opcode:02X}, got {:02X?}",
                &frame[..]
            ))))
        }
    }
}
