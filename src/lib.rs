//! Ratemux - Grouped HTTP Admission Control
//!
//! This crate decides whether an incoming HTTP request may proceed. Requests
//! are routed to rate-limit groups by API pattern, each group derives an
//! event ID from the request with a template expression, and the group's
//! limiter spends one unit of that event's budget. Budgets live either in
//! process or in a shared Redis store, so every instance of a service can
//! enforce one quota.

pub mod config;
pub mod error;
pub mod expr;
pub mod ratelimit;
pub mod store;
