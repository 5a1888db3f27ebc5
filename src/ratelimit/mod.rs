//! Rate limiting logic and counter stores.

mod client_key;
mod limiter;
mod memory;
mod redis_store;
mod store;

pub use client_key::{resolve_client_ip, ClientKey};
pub use limiter::{Decision, RateLimiter, WindowPolicy};
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use store::{StoreError, WindowStore};
