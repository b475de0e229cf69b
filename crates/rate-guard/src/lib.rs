//! # rate-guard
//!
//! Multi-scope leaky-bucket admission control for the mcproxy project. One
//! [`RateLimiter`] is shared across every connection; each admission check
//! consumes the global, per-client, and (when configured) per-method buckets
//! in a fixed order and throttles on the first exhausted scope.
//!
//! ## Usage
//!
//! ```rust
//! use rate_guard::{RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! assert!(limiter.check("conn-1", Some("tools/call")).is_ok());
//! ```

mod limiter;

pub use limiter::{RateLimitConfig, RateLimitError, RateLimiter, RateScopeConfig};
