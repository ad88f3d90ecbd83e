//! Steward queue: the work queue shared by event handlers and workers.
//!
//! Keys are coalesced while pending, never handed to two consumers at once,
//! and can be delayed either explicitly (`add_after`) or by a [`RateLimiter`]
//! tracking per-key failures (`add_rate_limited`).

#![forbid(unsafe_code)]

mod queue;
pub mod rate_limit;

pub use queue::WorkQueue;
pub use rate_limit::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter,
};
