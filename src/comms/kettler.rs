//! CRLF-delimited ASCII framing (Kettler ergometers).

use bytes::BytesMut;

use super::{FrameCodec, FrameEvent};
use crate::error::{PedalError, Result};

/// Line terminator on the wire
pub const LINE_END: &[u8] = b"\r\n";

/// Codec for one command line and one response line
#[derive(Debug, Default)]
pub struct KettlerCodec;

impl FrameCodec for KettlerCodec {
    type Request = String;
    type Response = String;

    fn encode(&mut self, request: &String, dst: &mut BytesMut) -> Result<()> {
        if request.is_empty() || !request.is_ascii() || request.contains(['\r', '\n']) {
            return Err(PedalError::InvalidArgument(format!(
                "invalid command {request:?}"
            )));
        }

        dst.extend_from_slice(request.as_bytes());
        dst.extend_from_slice(LINE_END);
        Ok(())
    }

    fn decode(&mut self, src: &mut BytesMut) -> Option<FrameEvent<String>> {
        loop {
            let end = src.iter().position(|b| *b == b'\n')?;
            let line = src.split_to(end + 1);
            let line = line.strip_suffix(b"\n").unwrap_or(&line[..]);
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }

            return Some(match std::str::from_utf8(line) {
                Ok(text) => FrameEvent::Response(text.to_string()),
                Err(e) => FrameEvent::Illegal(PedalError::ParseError(format!(
                    "non-text response {line:02X?}: {e}"
                ))),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodes_crlf_lines() {
        let mut out = BytesMut::new();
        KettlerCodec.encode(&"PW150".to_string(), &mut out).unwrap();
        assert_eq!(&out[..], b"PW150\r\n");

        assert!(KettlerCodec.encode(&String::new(), &mut out).is_err());
        assert!(KettlerCodec.encode(&"ST\r\n".to_string(), &mut out).is_err());
    }

    #[test]
    fn test_decodes_partial_lines() {
        let mut codec = KettlerCodec;
        let mut buffer = BytesMut::from(&b"\r\nACK"[..]);
        assert!(codec.decode(&mut buffer).is_none());

        buffer.extend_from_slice(b"\r\nRUN\n");
        match codec.decode(&mut buffer) {
            Some(FrameEvent::Response(line)) => assert_eq!(line, "ACK"),
            other => panic!("unexpected {other:?}"),
        }
        match codec.decode(&mut buffer) {
            Some(FrameEvent::Response(line)) => assert_eq!(line, "RUN"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(buffer.is_empty());
    }
}
