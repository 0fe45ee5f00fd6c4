//! Cross-process invalidation protocol.
//!
//! Messages are pure invalidations: they name a key (or a region, or the whole
//! cache) and never carry a value. Receivers evict and re-fetch from the shared
//! tier, which is why duplicate or reordered delivery is harmless.

mod codec;
mod message;
mod transport;

pub use codec::{ChunkDecoder, DecodeError, DecodedChunk, MAX_RECORD_LEN, decode_chunk, encode_chunk};
pub use message::{BackplaneAction, BackplaneMessage, ChangeAction, OwnerId};
pub use transport::{BackplaneError, BackplaneTransport};
