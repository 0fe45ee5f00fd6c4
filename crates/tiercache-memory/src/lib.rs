//! In-process implementations of the tiercache contracts.
//!
//! - [`MemoryCacheHandle`]: a DashMap-backed tier with versions, expiration
//!   and an optional capacity bound
//! - [`MemoryBackplaneHub`]: a broadcast channel standing in for a shared
//!   backplane between caches living in the same process

mod handle;
mod transport;

pub use handle::{MemoryCacheHandle, MemoryHandleOptions};
pub use transport::{MemoryBackplaneHub, MemoryTransport};
