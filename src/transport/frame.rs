//! Frame encoding/decoding for the event transport
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |          Length (4B, BE)          |
//! +--------+--------+--------+--------+
//! |      JSON-encoded Envelope        |
//! +--------+--------+--------+--------+
//! ```

use crate::protocol::{Envelope, ProtocolError, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use std::io;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 4;

/// Encode an envelope into a single frame
pub fn encode_frame(envelope: &Envelope) -> Result<BytesMut, ProtocolError> {
    let payload = serde_json::to_vec(envelope)
        .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Fail with [`ProtocolError::FrameTooLarge`] if `envelope` would not fit in one frame.
///
/// Serializes into a byte counter, so nothing is buffered.
pub fn check_frame_size(envelope: &Envelope) -> Result<(), ProtocolError> {
    let mut counter = ByteCounter(0);
    serde_json::to_writer(&mut counter, envelope)
        .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
    if counter.0 > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(counter.0));
    }
    Ok(())
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` until a whole frame is buffered.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    if buf.len() < FRAME_HEADER_SIZE + len {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_SIZE);
    let payload = buf.split_to(len);

    serde_json::from_slice(&payload)
        .map(Some)
        .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_frame_waits_for_more() {
        let env = Envelope::new("register", vec![json!("client"), json!("c1")]);
        let encoded = encode_frame(&env).unwrap();

        let mut buf = BytesMut::from(&encoded[..encoded.len() - 3]);
        assert!(decode_frame(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[encoded.len() - 3..]);
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(env));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_back_to_back_frames() {
        let a = Envelope::new("a", vec![]);
        let b = Envelope::new("b", vec![json!({"x": 1})]);
        let mut buf = encode_frame(&a).unwrap();
        buf.extend_from_slice(&encode_frame(&b).unwrap());

        assert_eq!(decode_frame(&mut buf).unwrap(), Some(a));
        assert_eq!(decode_frame(&mut buf).unwrap(), Some(b));
        assert_eq!(decode_frame(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_escaped_body_over_frame_limit() {
        // Control characters expand sixfold when JSON-escaped
        let body = "\u{1}".repeat(MAX_FRAME_SIZE / 5);
        let env = Envelope::new("upstream_response", vec![json!(body)]);
        assert!(matches!(
            check_frame_size(&env),
            Err(ProtocolError::FrameTooLarge(n)) if n > MAX_FRAME_SIZE
        ));
        assert!(matches!(encode_frame(&env), Err(ProtocolError::FrameTooLarge(_))));

        let small = Envelope::new("upstream_response", vec![json!("ok")]);
        assert!(check_frame_size(&small).is_ok());
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(b"{{{");
        assert!(matches!(
            decode_frame(&mut buf),
            Err(ProtocolError::InvalidFrame(_))
        ));
    }
}
