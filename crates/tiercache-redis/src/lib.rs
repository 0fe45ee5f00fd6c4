//! Redis implementations of the tiercache contracts.
//!
//! - [`RedisCacheHandle`]: a shared tier storing serialized items in Redis
//!   hashes, with script-based add and compare-and-swap
//! - [`RedisBackplaneTransport`]: the backplane channel on Redis pub/sub
//!
//! Both run on a `deadpool-redis` pool created with [`create_pool`].

mod handle;
mod keys;
mod pool;
mod transport;

pub use handle::{RedisCacheHandle, RedisHandleOptions};
pub use pool::{RedisPoolConfig, create_pool};
pub use transport::RedisBackplaneTransport;
