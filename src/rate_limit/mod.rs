//! Shared rate limiting for external providers.
//!
//! Buckets live in the state store so every worker process draws from the
//! same budget. Refill is TTL-based: the bucket key expires at the end of
//! its window and the next acquire recreates it full.

mod redis_bucket;

pub use redis_bucket::{RateLimitConfig, RedisTokenBucket};
