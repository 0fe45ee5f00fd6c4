//! Binary chunk format for backplane messages.
//!
//! ```text
//! chunk  := count:u32 record*count
//! record := len:u32 body[len]
//! body   := owner[16] action:u8 [change:u8 if Changed]
//!           key_len:u32 key[key_len] region_len:u32 region[region_len]
//! ```
//!
//! All integers are big-endian, strings UTF-8, and an empty region means none.
//! Each record is length-prefixed, so a record that fails to decode is skipped
//! without losing the rest of the chunk.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::message::{BackplaneAction, BackplaneMessage, ChangeAction, OwnerId};
use crate::key::CacheKey;

/// Records larger than this are treated as corruption.
pub const MAX_RECORD_LEN: u32 = 1024 * 1024;

/// A single record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown action byte {0}")]
    UnknownAction(u8),

    #[error("unknown change action byte {0}")]
    UnknownChangeAction(u8),

    #[error("record truncated")]
    Truncated,

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("record length {0} exceeds limit, chunk stream reset")]
    OversizedRecord(u32),
}

/// Encodes messages as one chunk.
pub fn encode_chunk(messages: &[BackplaneMessage]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + messages.len() * 48);
    buf.put_u32(messages.len() as u32);
    for message in messages {
        let body = encode_record(message);
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
    }
    buf.freeze()
}

fn encode_record(message: &BackplaneMessage) -> BytesMut {
    let mut body = BytesMut::with_capacity(48);
    body.put_slice(message.owner.as_bytes());
    body.put_u8(message.action.as_byte());

    let (key, region) = match &message.action {
        BackplaneAction::Changed { key, change } => {
            body.put_u8(change.as_byte());
            (key.key(), key.region())
        }
        BackplaneAction::Removed { key } => (key.key(), key.region()),
        BackplaneAction::Clear => ("", None),
        BackplaneAction::ClearRegion { region } => ("", Some(region.as_str())),
    };
    put_str(&mut body, key);
    put_str(&mut body, region.unwrap_or(""));
    body
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Messages and per-record errors from one complete chunk.
#[derive(Debug, Default)]
pub struct DecodedChunk {
    pub messages: Vec<BackplaneMessage>,
    pub errors: Vec<DecodeError>,
}

/// Decodes a complete chunk. Bad records are reported, the rest still decode.
pub fn decode_chunk(bytes: &[u8]) -> DecodedChunk {
    let mut decoder = ChunkDecoder::new();
    decoder.push(bytes);

    let mut decoded = DecodedChunk::default();
    while let Some(result) = decoder.next_message() {
        match result {
            Ok(message) => decoded.messages.push(message),
            Err(e) => decoded.errors.push(e),
        }
    }
    if decoder.has_partial() {
        decoded.errors.push(DecodeError::Truncated);
    }
    decoded
}

/// Incremental decoder for a stream of chunks.
///
/// Bytes may arrive in arbitrary pieces; `next_message` yields records as
/// soon as they are complete and `None` when more input is needed.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buf: BytesMut,
    remaining_in_chunk: Option<u32>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// True if buffered bytes or an unfinished chunk are pending.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || self.remaining_in_chunk.is_some_and(|n| n > 0)
    }

    pub fn next_message(&mut self) -> Option<Result<BackplaneMessage, DecodeError>> {
        loop {
            match self.remaining_in_chunk {
                None => {
                    if self.buf.len() < 4 {
                        return None;
                    }
                    self.remaining_in_chunk = Some(self.buf.get_u32());
                }
                Some(0) => {
                    self.remaining_in_chunk = None;
                }
                Some(n) => {
                    if self.buf.len() < 4 {
                        return None;
                    }
                    let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
                    if len > MAX_RECORD_LEN {
                        self.buf.clear();
                        self.remaining_in_chunk = None;
                        return Some(Err(DecodeError::OversizedRecord(len)));
                    }
                    if self.buf.len() < 4 + len as usize {
                        return None;
                    }
                    self.buf.advance(4);
                    let body = self.buf.split_to(len as usize).freeze();
                    self.remaining_in_chunk = Some(n - 1);
                    return Some(decode_record(body));
                }
            }
        }
    }
}

fn decode_record(mut body: Bytes) -> Result<BackplaneMessage, DecodeError> {
    if body.remaining() < 17 {
        return Err(DecodeError::Truncated);
    }
    let mut owner = [0u8; 16];
    body.copy_to_slice(&mut owner);
    let owner = OwnerId::from_bytes(owner);

    let action = body.get_u8();
    if !(BackplaneAction::CHANGED..=BackplaneAction::CLEAR_REGION).contains(&action) {
        return Err(DecodeError::UnknownAction(action));
    }
    let change = if action == BackplaneAction::CHANGED {
        if !body.has_remaining() {
            return Err(DecodeError::Truncated);
        }
        let b = body.get_u8();
        Some(ChangeAction::from_byte(b).ok_or(DecodeError::UnknownChangeAction(b))?)
    } else {
        None
    };

    let key = take_str(&mut body)?;
    let region = take_str(&mut body)?;
    let region = (!region.is_empty()).then_some(region);

    let action = match (action, change) {
        (BackplaneAction::CHANGED, Some(change)) => BackplaneAction::Changed {
            key: cache_key(key, region.as_deref())?,
            change,
        },
        (BackplaneAction::REMOVED, _) => BackplaneAction::Removed {
            key: cache_key(key, region.as_deref())?,
        },
        (BackplaneAction::CLEAR, _) => BackplaneAction::Clear,
        (BackplaneAction::CLEAR_REGION, _) => BackplaneAction::ClearRegion {
            region: region.ok_or_else(|| DecodeError::InvalidKey("clear region without region".into()))?,
        },
        (other, _) => return Err(DecodeError::UnknownAction(other)),
    };

    Ok(BackplaneMessage { owner, action })
}

fn take_str(body: &mut Bytes) -> Result<String, DecodeError> {
    if body.remaining() < 4 {
        return Err(DecodeError::Truncated);
    }
    let len = body.get_u32() as usize;
    if body.remaining() < len {
        return Err(DecodeError::Truncated);
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}

fn cache_key(key: String, region: Option<&str>) -> Result<CacheKey, DecodeError> {
    CacheKey::new(key, region).map_err(|e| DecodeError::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerId {
        OwnerId::from_bytes([7; 16])
    }

    fn mixed_messages() -> Vec<BackplaneMessage> {
        vec![
            BackplaneMessage::changed(
                owner(),
                CacheKey::plain("a").unwrap(),
                ChangeAction::Put,
            ),
            BackplaneMessage::removed(owner(), CacheKey::in_region("b", "users").unwrap()),
            BackplaneMessage::clear(owner()),
            BackplaneMessage::clear_region(owner(), "users"),
        ]
    }

    #[test]
    fn test_chunk_decodes_every_record() {
        let messages = mixed_messages();
        let decoded = decode_chunk(&encode_chunk(&messages));
        assert!(decoded.errors.is_empty());
        assert_eq!(decoded.messages, messages);
    }

    #[test]
    fn test_empty_chunk() {
        let decoded = decode_chunk(&encode_chunk(&[]));
        assert!(decoded.messages.is_empty());
        assert!(decoded.errors.is_empty());
    }

    #[test]
    fn test_unknown_action_skips_only_that_record() {
        let messages = mixed_messages();
        let mut bytes = encode_chunk(&messages).to_vec();
        // First record starts after count (4) and record length (4); action follows the owner.
        bytes[4 + 4 + 16] = 99;

        let decoded = decode_chunk(&bytes);
        assert_eq!(decoded.errors, vec![DecodeError::UnknownAction(99)]);
        assert_eq!(decoded.messages, messages[1..].to_vec());
    }

    #[test]
    fn test_unknown_change_action() {
        let mut bytes = encode_chunk(&mixed_messages()[..1]).to_vec();
        bytes[4 + 4 + 17] = 0;
        let decoded = decode_chunk(&bytes);
        assert_eq!(decoded.errors, vec![DecodeError::UnknownChangeAction(0)]);
    }

    #[test]
    fn test_streamed_input() {
        let messages = mixed_messages();
        let mut stream = encode_chunk(&messages[..2]).to_vec();
        stream.extend_from_slice(&encode_chunk(&messages[2..]));

        let mut decoder = ChunkDecoder::new();
        let mut out = Vec::new();
        for byte in &stream {
            decoder.push(std::slice::from_ref(byte));
            while let Some(result) = decoder.next_message() {
                out.push(result.unwrap());
            }
        }

        assert_eq!(out, messages);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_truncated_chunk_reports_error() {
        let bytes = encode_chunk(&mixed_messages());
        let decoded = decode_chunk(&bytes[..bytes.len() - 3]);
        assert_eq!(decoded.messages.len(), 3);
        assert_eq!(decoded.errors, vec![DecodeError::Truncated]);
    }

    #[test]
    fn test_oversized_record_resets_stream() {
        let mut decoder = ChunkDecoder::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&(MAX_RECORD_LEN + 1).to_be_bytes());
        decoder.push(&bytes);

        assert_eq!(
            decoder.next_message(),
            Some(Err(DecodeError::OversizedRecord(MAX_RECORD_LEN + 1)))
        );
        assert!(!decoder.has_partial());
    }
}
