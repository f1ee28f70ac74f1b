//! Expression evaluation for rate limit groups and event keys.
//!
//! Expressions are compiled once at setup and evaluated against a
//! [`Request`] for every decision.

mod context;
mod template;

pub use context::{Identity, Request};
pub use template::{Template, TemplateError, ValueKind};
