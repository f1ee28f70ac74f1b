//! Building a multiplexer from configuration.

use std::sync::Arc;

use config::Config;
use tracing::{debug, info};

use super::backend::EventLimiter;
use super::distributed::FixedWindowLimiter;
use super::key::{default_group_prefix, group_prefix};
use super::limiter::LocalEventLimiter;
use super::mux::HttpLimiter;
use crate::config::{load_ratelimits, RatelimitConfig, SETTING_RATELIMITS_AUTH_ENABLE};
use crate::error::{RatemuxError, Result};
use crate::store::WindowStore;

/// Build a multiplexer whose groups are fixed-window limiters in `store`.
///
/// Keys are namespaced as `{key_prefix}:rate:default` for the default group
/// and `{key_prefix}:rate:g:{name}` for named groups. Returns
/// [`RatemuxError::Disabled`] when rate limiting is switched off, in which
/// case no limiter is built.
pub fn setup_rate_limits(
    store: Arc<dyn WindowStore>,
    key_prefix: &str,
    c: &Config,
) -> Result<HttpLimiter> {
    let lims = enabled_ratelimits(c)?;
    let timeout = lims.store_timeout;

    let mux = HttpLimiter::from_config(&lims, |group, params| {
        let prefix = match group {
            Some(name) => group_prefix(key_prefix, name),
            None => default_group_prefix(key_prefix),
        };
        let mut limiter =
            FixedWindowLimiter::new(store.clone(), &prefix, params.interval, params.quota);
        if let Some(timeout) = timeout {
            limiter = limiter.with_timeout(timeout);
        }
        Arc::new(limiter) as Arc<dyn EventLimiter>
    })?;

    info!(
        key_prefix = %key_prefix,
        groups = lims.groups.len(),
        rules = lims.match_expressions.len(),
        "Distributed rate limits configured"
    );
    Ok(mux)
}

/// Build a multiplexer whose groups are in-process token buckets.
///
/// Budgets are private to this process, which suits single-instance
/// deployments.
pub fn setup_local_rate_limits(c: &Config) -> Result<HttpLimiter> {
    let lims = enabled_ratelimits(c)?;

    let mux = HttpLimiter::from_config(&lims, |_, params| {
        Arc::new(LocalEventLimiter::new(params.quota, params.interval)) as Arc<dyn EventLimiter>
    })?;

    info!(
        groups = lims.groups.len(),
        rules = lims.match_expressions.len(),
        "Local rate limits configured"
    );
    Ok(mux)
}

fn enabled_ratelimits(c: &Config) -> Result<RatelimitConfig> {
    let lims = load_ratelimits(c)?.ok_or_else(|| RatemuxError::Disabled {
        path: SETTING_RATELIMITS_AUTH_ENABLE.to_string(),
    })?;
    debug!(config = ?lims, "Loaded rate limit configuration");
    Ok(lims)
}
