//! Framing: length-prefix (4 bytes LE) + bincode payload.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::ChatFrame;

const LEN_SIZE: usize = 4;

/// Default ceiling on a declared payload length. Chat frames are small; anything larger is hostile or broken.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024;

/// Encode a payload into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameEncodeError> {
    encode_frame_with_limit(msg, DEFAULT_MAX_FRAME_LEN)
}

/// As [`encode_frame`], rejecting payloads longer than `max_len`.
pub fn encode_frame_with_limit<T: Serialize>(
    msg: &T,
    max_len: u32,
) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(msg).map_err(FrameEncodeError::Encode)?;
    if payload.len() > max_len as usize {
        return Err(FrameEncodeError::TooLarge {
            len: payload.len(),
            max: max_len,
        });
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a payload into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame of {len} bytes exceeds maximum {max}")]
    TooLarge { len: usize, max: u32 },
}

/// Decode one frame from the front of `bytes`. Returns the payload and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_len: u32,
) -> Result<(T, usize), FramingError> {
    let len = match declared_len(bytes) {
        Some(len) => len,
        None => return Err(FramingError::NeedMore),
    };
    if len > max_len as usize {
        return Err(FramingError::TooLarge { len, max: max_len });
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FramingError::NeedMore);
    }
    // Free-function bincode allows trailing bytes: fields appended by newer senders are skipped.
    let msg: T = bincode::deserialize(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((msg, LEN_SIZE + len))
}

fn declared_len(bytes: &[u8]) -> Option<usize> {
    let prefix: [u8; LEN_SIZE] = bytes.get(..LEN_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(prefix) as usize)
}

/// Error decoding a frame (need more bytes, too large, or malformed payload).
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("need more bytes")]
    NeedMore,
    #[error("declared frame length {len} exceeds maximum {max}")]
    TooLarge { len: usize, max: u32 },
    #[error("malformed frame: {0}")]
    Decode(#[from] bincode::Error),
}

/// Streaming decoder for one link: buffers partial frames across reads.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_len: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_len(max_len: u32) -> Self {
        Self {
            buf: Vec::new(),
            max_len,
        }
    }

    /// Append `bytes` and return every complete frame now available, in stream order.
    /// An oversized or malformed frame is an error; the buffer is discarded since the
    /// stream can no longer be trusted.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<ChatFrame>, FramingError> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        let mut consumed = 0;
        loop {
            match decode_frame::<ChatFrame>(&self.buf[consumed..], self.max_len) {
                Ok((frame, n)) => {
                    out.push(frame);
                    consumed += n;
                }
                Err(FramingError::NeedMore) => break,
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            }
        }
        self.buf.drain(..consumed);
        Ok(out)
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Advert, PROTOCOL_VERSION};
    use proptest::prelude::*;
    use serde::Serialize;
    use uuid::Uuid;

    fn chat(body: &str) -> ChatFrame {
        ChatFrame {
            body: body.to_string(),
            sent_at_ms: 1_700_000_000_123,
            id: Uuid::new_v4(),
        }
    }

    #[test]
    fn roundtrip_chat_frame() {
        let msg = chat("hello");
        let frame = encode_frame(&msg).unwrap();
        let (decoded, n) = decode_frame::<ChatFrame>(&frame, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn roundtrip_advert() {
        let advert = Advert {
            protocol_version: PROTOCOL_VERSION,
            address: "AA:BB".into(),
            display_name: "laptop".into(),
            link_port: 45691,
        };
        let frame = encode_frame(&advert).unwrap();
        let (decoded, _) = decode_frame::<Advert>(&frame, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert_eq!(decoded, advert);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&chat("hello")).unwrap();
        assert!(matches!(
            decode_frame::<ChatFrame>(&frame[..2], DEFAULT_MAX_FRAME_LEN),
            Err(FramingError::NeedMore)
        ));
        assert!(matches!(
            decode_frame::<ChatFrame>(&frame[..super::LEN_SIZE], DEFAULT_MAX_FRAME_LEN),
            Err(FramingError::NeedMore)
        ));
    }

    #[test]
    fn multiple_messages_in_one_read() {
        let a = chat("hello");
        let b = chat("world");
        let mut buf = encode_frame(&a).unwrap();
        buf.extend_from_slice(&encode_frame(&b).unwrap());
        let mut dec = FrameDecoder::new();
        let out = dec.feed(&buf).unwrap();
        assert_eq!(out, vec![a, b]);
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn oversized_declaration_rejected_without_payload() {
        let mut dec = FrameDecoder::with_max_len(1024);
        let header = 4096u32.to_le_bytes();
        assert!(matches!(
            dec.feed(&header),
            Err(FramingError::TooLarge { len: 4096, max: 1024 })
        ));
        assert_eq!(dec.buffered(), 0);
    }

    #[test]
    fn encode_refuses_oversized_payload() {
        let big = chat(&"x".repeat(2048));
        assert!(matches!(
            encode_frame_with_limit(&big, 1024),
            Err(FrameEncodeError::TooLarge { .. })
        ));
    }

    #[test]
    fn invalid_utf8_body_is_malformed() {
        // bincode string: u64 length then bytes
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u64.to_le_bytes());
        payload.extend_from_slice(&[0xff, 0xfe]);
        payload.extend_from_slice(&0i64.to_le_bytes());
        payload.extend_from_slice(&16u64.to_le_bytes());
        payload.extend_from_slice(&[0u8; 16]);
        let mut frame = (payload.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&payload);
        let mut dec = FrameDecoder::new();
        assert!(matches!(dec.feed(&frame), Err(FramingError::Decode(_))));
    }

    #[test]
    fn unknown_trailing_fields_ignored() {
        #[derive(Serialize)]
        struct FutureChatFrame {
            body: String,
            sent_at_ms: i64,
            id: Uuid,
            reply_to: Option<Uuid>,
            edited: bool,
        }
        let id = Uuid::new_v4();
        let future = FutureChatFrame {
            body: "from the future".into(),
            sent_at_ms: 42,
            id,
            reply_to: Some(Uuid::new_v4()),
            edited: true,
        };
        let frame = encode_frame(&future).unwrap();
        let mut dec = FrameDecoder::new();
        let out = dec.feed(&frame).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].body, "from the future");
        assert_eq!(out[0].id, id);
    }

    proptest! {
        #[test]
        fn split_at_any_boundary_yields_one_frame(body in "\\PC{0,200}", split in 0usize..512) {
            let msg = chat(&body);
            let frame = encode_frame(&msg).unwrap();
            let at = split % (frame.len() + 1);
            let mut dec = FrameDecoder::new();
            let mut out = dec.feed(&frame[..at]).unwrap();
            out.extend(dec.feed(&frame[at..]).unwrap());
            prop_assert_eq!(out, vec![msg]);
            prop_assert_eq!(dec.buffered(), 0);
        }

        #[test]
        fn byte_at_a_time_yields_one_frame(body in "\\PC{0,64}") {
            let msg = chat(&body);
            let frame = encode_frame(&msg).unwrap();
            let mut dec = FrameDecoder::new();
            let mut out = Vec::new();
            for b in &frame {
                out.extend(dec.feed(std::slice::from_ref(b)).unwrap());
            }
            prop_assert_eq!(out, vec![msg]);
        }
    }
}
