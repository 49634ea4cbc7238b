//! Escaped binary framing with ACK/NAK handshake (Daum 8i premium cockpits).
//!
//! Frame layout: `STX cmd[3] payload… checksum[2] ETB`. The checksum is the
//! byte sum of command and payload modulo 100, as two ASCII digits. Reserved
//! bytes inside the payload are sent as `ESC, byte`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{FrameCodec, FrameEvent};
use crate::error::{PedalError, Result};

/// Start of frame
pub const STX: u8 = 0x01;
/// Positive acknowledgement
pub const ACK: u8 = 0x06;
/// Device control 1, reserved
pub const DC1: u8 = 0x11;
/// Negative acknowledgement
pub const NAK: u8 = 0x15;
/// End of frame
pub const ETB: u8 = 0x17;
/// Escape prefix
pub const ESC: u8 = 0x22;

const RESERVED: [u8; 6] = [STX, ACK, DC1, NAK, ETB, ESC];

/// Checksum over command and unescaped payload
#[must_use]
pub fn checksum(command: &[u8], payload: &[u8]) -> u8 {
    let sum = command
        .iter()
        .chain(payload)
        .fold(0u32, |acc, b| acc + u32::from(*b));
    #[allow(clippy::cast_possible_truncation)]
    let checksum = (sum % 100) as u8;
    checksum
}

/// Append `data` to `dst`, escaping reserved bytes
pub fn escape(data: &[u8], dst: &mut BytesMut) {
    for byte in data {
        if RESERVED.contains(byte) {
            dst.put_u8(ESC);
        }
        dst.put_u8(*byte);
    }
}

/// Undo [`escape`]
#[must_use]
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut bytes = data.iter();
    while let Some(byte) = bytes.next() {
        if *byte == ESC {
            if let Some(escaped) = bytes.next() {
                out.push(*escaped);
            }
        } else {
            out.push(*byte);
        }
    }
    out
}

/// Build a complete frame
#[must_use]
pub fn build_frame(command: [u8; 3], payload: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(payload.len() * 2 + 7);
    frame.put_u8(STX);
    frame.put_slice(&command);
    escape(payload, &mut frame);
    frame.put_slice(format!("{:02}", checksum(&command, payload)).as_bytes());
    frame.put_u8(ETB);
    frame
}

/// Premium request: three-letter command plus raw payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PremiumRequest {
    /// ASCII command, e.g. `X70`
    pub command: [u8; 3],
    /// Unescaped payload
    pub payload: Vec<u8>,
}

impl PremiumRequest {
    /// Create a request
    #[must_use]
    pub const fn new(command: [u8; 3], payload: Vec<u8>) -> Self {
        Self { command, payload }
    }
}

/// Validated, unescaped response frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PremiumFrame {
    /// ASCII command echoed by the device
    pub command: [u8; 3],
    /// Unescaped payload
    pub payload: Bytes,
}

/// Codec for premium frames and handshake bytes
#[derive(Debug, Default)]
pub struct PremiumCodec {
    expected: Option<[u8; 3]>,
}

impl PremiumCodec {
    fn parse_frame(&self, body: &[u8]) -> FrameEvent<PremiumFrame> {
        let body = unescape(body);
        if body.len() < 5 {
            return FrameEvent::Corrupt(PedalError::ParseError(format!(
                "frame too short: {body:02X?}"
            )));
        }

        let (content, digits) = body.split_at(body.len() - 2);
        let actual = match std::str::from_utf8(digits).ok().and_then(|d| d.parse::<u8>().ok()) {
            Some(actual) => actual,
            None => {
                return FrameEvent::Corrupt(PedalError::ParseError(format!(
                    "invalid checksum digits {digits:02X?}"
                )))
            }
        };

        let (command, payload) = content.split_at(3);
        let expected = checksum(command, payload);
        if expected != actual {
            return FrameEvent::Corrupt(PedalError::ChecksumMismatch { expected, actual });
        }

        let command = [command[0], command[1], command[2]];
        if self.expected.is_some_and(|sent| sent != command) {
            return FrameEvent::Illegal(PedalError::IllegalResponse(format!(
                "response {} to request {}",
                String::from_utf8_lossy(&command),
                String::from_utf8_lossy(&self.expected.unwrap_or_default()),
            )));
        }

        FrameEvent::Response(PremiumFrame {
            command,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

impl FrameCodec for PremiumCodec {
    type Request = PremiumRequest;
    type Response = PremiumFrame;

    fn encode(&mut self, request: &PremiumRequest, dst: &mut BytesMut) -> Result<()> {
        if !request.command.iter().all(u8::is_ascii_alphanumeric) {
            return Err(PedalError::InvalidArgument(format!(
                "invalid command {:02X?}",
                request.command
            )));
        }

        self.expected = Some(request.command);
        dst.extend_from_slice(&build_frame(request.command, &request.payload));
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut) -> Option<FrameEvent<PremiumFrame>> {
        loop {
            match *src.first()? {
                ACK => {
                    src.advance(1);
                    return Some(FrameEvent::Ack);
                }
                NAK => {
                    src.advance(1);
                    return Some(FrameEvent::Nak);
                }
                STX => {
                    let mut end = None;
                    let mut i = 1;
                    while i < src.len() {
                        match src[i] {
                            ESC => i += 2,
                            ETB => {
                                end = Some(i);
                                break;
                            }
                            _ => i += 1,
                        }
                    }

                    let end = end?;
                    let frame = src.split_to(end + 1);
                    return Some(self.parse_frame(&frame[1..end]));
                }
                _ => src.advance(1),
            }
        }
    }

    fn expects_ack(&self) -> bool {
        true
    }

    fn accept_reply(&self) -> Option<&'static [u8]> {
        Some(&[ACK])
    }

    fn reject_reply(&self) -> Option<&'static [u8]> {
        Some(&[NAK])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_decimal_sum_mod_100() {
        // 'V' + '0' + '0' = 86 + 48 + 48 = 182
        assert_eq!(checksum(b"V00", &[]), 82);
        assert_eq!(&build_frame(*b"V00", &[])[..], b"\x01V0082\x17");
        assert_eq!(checksum(b"S23", &[0x01, 0x00]), (83 + 50 + 51 + 1) % 100);
    }

    #[test]
    fn test_reserved_bytes_are_escaped() {
        let payload = [0x01, 0x06, 0x11, 0x15, 0x17, 0x22, 0x42];
        let mut escaped = BytesMut::new();
        escape(&payload, &mut escaped);
        assert_eq!(
            &escaped[..],
            &[0x22, 0x01, 0x22, 0x06, 0x22, 0x11, 0x22, 0x15, 0x22, 0x17, 0x22, 0x22, 0x42]
        );
        assert_eq!(unescape(&escaped), payload);
    }

    #[test]
    fn test_decodes_split_frames() {
        let mut codec = PremiumCodec::default();
        codec
            .encode(&PremiumRequest::new(*b"X70", vec![0x00]), &mut BytesMut::new())
            .unwrap();

        let frame = build_frame(*b"X70", &[0x17, 0x05]);
        let (head, tail) = frame.split_at(5);

        let mut buffer = BytesMut::new();
        buffer.put_u8(ACK);
        buffer.extend_from_slice(head);
        assert!(matches!(codec.decode(&mut buffer), Some(FrameEvent::Ack)));
        assert!(codec.decode(&mut buffer).is_none());

        buffer.extend_from_slice(tail);
        match codec.decode(&mut buffer) {
            Some(FrameEvent::Response(frame)) => {
                assert_eq!(&frame.command, b"X70");
                assert_eq!(&frame.payload[..], &[0x17, 0x05]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_bad_checksum_is_corrupt() {
        let mut codec = PremiumCodec::default();
        let mut frame = build_frame(*b"Y00", b"8i").to_vec();
        let digit = frame.len() - 3;
        frame[digit] = if frame[digit] == b'9' { b'0' } else { frame[digit] + 1 };

        let mut buffer = BytesMut::from(&frame[..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Some(FrameEvent::Corrupt(PedalError::ChecksumMismatch { .. }))
        ));
    }

    #[test]
    fn test_foreign_command_is_illegal() {
        let mut codec = PremiumCodec::default();
        codec
            .encode(&PremiumRequest::new(*b"V00", Vec::new()), &mut BytesMut::new())
            .unwrap();

        let mut buffer = build_frame(*b"Y00", b"1");
        assert!(matches!(
            codec.decode(&mut buffer),
            Some(FrameEvent::Illegal(PedalError::IllegalResponse(_)))
        ));
    }

    #[test]
    fn test_noise_and_handshake_bytes() {
        let mut codec = PremiumCodec::default();
        let mut buffer = BytesMut::from(&[0xFF, 0x00, NAK][..]);
        assert!(matches!(codec.decode(&mut buffer), Some(FrameEvent::Nak)));
        assert!(buffer.is_empty());
        assert!(codec.decode(&mut buffer).is_none());
    }
}
