//! Window storage backends.
//!
//! The limiter talks to a [`WindowStore`](crate::ratelimit::WindowStore):
//! Redis when a shared store is configured, and the in-process
//! [`MemoryStore`] as fallback.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
