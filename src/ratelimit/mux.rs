//! Routing of requests to rate limit groups.
//!
//! The [`HttpLimiter`] holds a default group, any number of named groups and
//! an ordered list of match rules. For every request the first rule whose
//! API pattern matches picks the group, the group's event expression picks
//! the budget inside it, and a token is reserved from that budget.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::backend::EventLimiter;
use super::pattern::ApiPattern;
use super::reservation::Reservation;
use crate::config::{RatelimitConfig, RatelimitParams};
use crate::error::{RatemuxError, Result};
use crate::expr::{Request, Template};

/// Name that group expressions use to select the default group.
pub const DEFAULT_GROUP: &str = "default";

/// Event ID used when an event expression renders empty, so anonymous
/// traffic shares one budget instead of bypassing the limiter.
pub const ANONYMOUS_EVENT: &str = "@anonymous";

struct RateLimitGroup {
    name: String,
    limiter: Arc<dyn EventLimiter>,
    event_expression: Template,
}

impl RateLimitGroup {
    fn event_id(&self, request: &Request) -> Result<String> {
        let rendered = self
            .event_expression
            .execute(request)
            .map_err(RatemuxError::Evaluate)?;
        let event_id = rendered.trim();
        Ok(if event_id.is_empty() {
            ANONYMOUS_EVENT.to_string()
        } else {
            event_id.to_string()
        })
    }
}

struct MatchRule {
    pattern: ApiPattern,
    group_expression: Template,
}

/// Why a matched request was served by the default group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fallback {
    /// The group expression named a group that is not registered.
    UnknownGroup(String),
    /// The group expression failed to evaluate.
    EvaluationFailed(String),
}

/// The outcome of [`HttpLimiter::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// The group that served the request
    pub group: String,
    /// The budget inside the group
    pub event_id: String,
    /// The reservation taken from that budget
    pub reservation: Reservation,
    /// Set when a matching rule could not be honoured
    pub fallback: Option<Fallback>,
}

impl Decision {
    pub fn is_ok(&self) -> bool {
        self.reservation.is_ok()
    }
}

/// Counters of configuration inconsistencies seen at request time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    /// Group expressions that resolved to an unregistered group
    pub unknown_group: u64,
    /// Group expressions that failed to evaluate
    pub evaluation_failed: u64,
}

/// Rate limit multiplexer for HTTP requests.
///
/// Build it with [`HttpLimiter::new`] and the `add_*` methods (or
/// [`HttpLimiter::from_config`]) and then share it; serving only needs
/// `&self`, so the configuration cannot change once requests flow.
/// Reconfiguration means building a new value and swapping it in.
pub struct HttpLimiter {
    default: RateLimitGroup,
    groups: HashMap<String, RateLimitGroup>,
    rules: Vec<MatchRule>,
    unknown_group: AtomicU64,
    evaluation_failed: AtomicU64,
}

impl HttpLimiter {
    /// Create a multiplexer with only the default group.
    pub fn new(default_limiter: Arc<dyn EventLimiter>, default_event_expression: &str) -> Result<Self> {
        let event_expression =
            Template::compile(default_event_expression).map_err(RatemuxError::Template)?;
        Ok(Self {
            default: RateLimitGroup {
                name: DEFAULT_GROUP.to_string(),
                limiter: default_limiter,
                event_expression,
            },
            groups: HashMap::new(),
            rules: Vec::new(),
            unknown_group: AtomicU64::new(0),
            evaluation_failed: AtomicU64::new(0),
        })
    }

    /// Register a named group.
    pub fn add_rate_limit_group(
        &mut self,
        limiter: Arc<dyn EventLimiter>,
        name: &str,
        event_expression: &str,
    ) -> Result<()> {
        if is_default(name) || self.groups.contains_key(name) {
            return Err(RatemuxError::DuplicateGroup(name.to_string()));
        }
        let event_expression = Template::compile(event_expression).map_err(RatemuxError::Template)?;
        self.groups.insert(
            name.to_string(),
            RateLimitGroup {
                name: name.to_string(),
                limiter,
                event_expression,
            },
        );
        Ok(())
    }

    /// Append a match rule. Rules are tried in registration order.
    ///
    /// A group expression without actions always names the same group, so
    /// it is checked against the registered groups here.
    pub fn add_match_expression(&mut self, api_pattern: &str, group_expression: &str) -> Result<()> {
        let pattern = ApiPattern::parse(api_pattern)?;
        let group_expression = Template::compile(group_expression).map_err(RatemuxError::Template)?;
        if let Some(name) = group_expression.constant() {
            let name = name.trim();
            if !is_default(name) && !self.groups.contains_key(name) {
                return Err(RatemuxError::UnknownGroup(name.to_string()));
            }
        }
        self.rules.push(MatchRule {
            pattern,
            group_expression,
        });
        Ok(())
    }

    /// Build a complete multiplexer from configuration.
    ///
    /// `make_limiter` is called once for the default group (with `None`) and
    /// once per named group.
    pub fn from_config<F>(config: &RatelimitConfig, mut make_limiter: F) -> Result<Self>
    where
        F: FnMut(Option<&str>, &RatelimitParams) -> Arc<dyn EventLimiter>,
    {
        config.validate()?;

        let default = &config.default_group;
        let mut mux = Self::new(make_limiter(None, default), &default.event_expression)?;

        for group in &config.groups {
            let params = group.params();
            let limiter = make_limiter(Some(group.name.as_str()), &params);
            mux.add_rate_limit_group(limiter, &group.name, &group.event_expression)?;
        }
        for rule in &config.match_expressions {
            mux.add_match_expression(&rule.api_pattern, &rule.group_expression)?;
        }

        debug!(
            groups = mux.groups.len(),
            rules = mux.rules.len(),
            "Rate limit multiplexer configured"
        );
        Ok(mux)
    }

    /// Decide whether `request` may proceed.
    ///
    /// Errors are infrastructure failures of the group's limiter
    /// ([`RatemuxError::is_infrastructure`]) or a failing event expression
    /// ([`RatemuxError::is_evaluation`]); the caller picks fail-open or
    /// fail-closed.
    pub async fn decide(&self, request: &Request) -> Result<Decision> {
        let (group, fallback) = self.select_group(request);
        let event_id = group.event_id(request)?;
        let reservation = group.limiter.reserve_event(&event_id).await?;

        trace!(
            method = %request.method(),
            path = %request.path(),
            group = %group.name,
            event_id = %event_id,
            ok = reservation.is_ok(),
            tokens = reservation.tokens(),
            "Rate limit decision"
        );

        Ok(Decision {
            group: group.name.clone(),
            event_id,
            reservation,
            fallback,
        })
    }

    /// Names of the registered groups, excluding the default.
    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Number of match rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn stats(&self) -> MuxStats {
        MuxStats {
            unknown_group: self.unknown_group.load(Ordering::Relaxed),
            evaluation_failed: self.evaluation_failed.load(Ordering::Relaxed),
        }
    }

    fn select_group(&self, request: &Request) -> (&RateLimitGroup, Option<Fallback>) {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.pattern.matches(request.method(), request.path()));
        let rule = match rule {
            Some(rule) => rule,
            None => return (&self.default, None),
        };

        match rule.group_expression.execute(request) {
            Ok(name) => {
                let name = name.trim();
                if is_default(name) {
                    return (&self.default, None);
                }
                match self.groups.get(name) {
                    Some(group) => (group, None),
                    None => {
                        self.unknown_group.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            pattern = %rule.pattern,
                            group = %name,
                            "Group expression resolved to an unknown rate limit group; using default"
                        );
                        (&self.default, Some(Fallback::UnknownGroup(name.to_string())))
                    }
                }
            }
            Err(err) => {
                self.evaluation_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    pattern = %rule.pattern,
                    error = %err,
                    "Failed to evaluate group expression; using default"
                );
                (&self.default, Some(Fallback::EvaluationFailed(err.to_string())))
            }
        }
    }
}

fn is_default(name: &str) -> bool {
    name.is_empty() || name == DEFAULT_GROUP
}
