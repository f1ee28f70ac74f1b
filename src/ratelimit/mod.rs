//! Rate limiting primitives and the HTTP rate-limit multiplexer.

mod backend;
mod distributed;
mod key;
mod limiter;
mod mux;
mod pattern;
mod reservation;
mod setup;

pub use backend::{EventLimiter, EventLimiterFn, Limiter, LimiterFn};
pub use distributed::FixedWindowLimiter;
pub use key::{default_group_prefix, group_prefix, EventKey};
pub use limiter::{LocalEventLimiter, TokenBucket, DEFAULT_PRUNE_THRESHOLD};
pub use mux::{Decision, Fallback, HttpLimiter, MuxStats, ANONYMOUS_EVENT, DEFAULT_GROUP};
pub use pattern::{ApiPattern, PatternError};
pub use reservation::Reservation;
pub use setup::{setup_local_rate_limits, setup_rate_limits};
