//! Configuration management for ratemux.
//!
//! Settings come from a hierarchical source (built-in defaults, an optional
//! YAML file, then `RATEMUX_` environment variables with `__` as the level
//! separator) under the `ratelimits.auth` prefix.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RatemuxError, Result};
use crate::ratelimit::DEFAULT_GROUP;

pub const SETTING_RATELIMITS_AUTH_ENABLE: &str = "ratelimits.auth.enable";
pub const SETTING_RATELIMITS_AUTH_GROUPS: &str = "ratelimits.auth.groups";
pub const SETTING_RATELIMITS_AUTH_MATCH: &str = "ratelimits.auth.match";
pub const SETTING_RATELIMITS_AUTH_STORE_TIMEOUT: &str = "ratelimits.auth.store_timeout";
pub const SETTING_RATELIMITS_AUTH_DEFAULT_QUOTA: &str = "ratelimits.auth.default.quota";
pub const SETTING_RATELIMITS_AUTH_DEFAULT_INTERVAL: &str = "ratelimits.auth.default.interval";
pub const SETTING_RATELIMITS_AUTH_DEFAULT_EVENT_EXPRESSION: &str =
    "ratelimits.auth.default.event_expression";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RATEMUX";

fn default_quota() -> u64 {
    120
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_event_expression() -> String {
    "{{with .Identity}}{{.Subject}}{{end}}".to_string()
}

/// Quota, interval and event expression of a rate limit group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitParams {
    /// Tokens per interval
    #[serde(default = "default_quota")]
    pub quota: u64,

    /// Window or refill interval
    #[serde(
        default = "default_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,

    /// Template producing the event ID
    #[serde(default = "default_event_expression")]
    pub event_expression: String,
}

impl Default for RatelimitParams {
    fn default() -> Self {
        Self {
            quota: default_quota(),
            interval: default_interval(),
            event_expression: default_event_expression(),
        }
    }
}

/// A named rate limit group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitGroup {
    pub name: String,

    #[serde(default = "default_quota")]
    pub quota: u64,

    #[serde(
        default = "default_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub interval: Duration,

    #[serde(default = "default_event_expression")]
    pub event_expression: String,
}

impl RatelimitGroup {
    pub fn params(&self) -> RatelimitParams {
        RatelimitParams {
            quota: self.quota,
            interval: self.interval,
            event_expression: self.event_expression.clone(),
        }
    }
}

/// A routing rule from an API pattern to a group expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchExpression {
    pub api_pattern: String,
    pub group_expression: String,
}

/// The complete rate limit configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatelimitConfig {
    /// Parameters of the default group
    #[serde(default, rename = "default")]
    pub default_group: RatelimitParams,

    /// Named groups, names unique
    #[serde(default)]
    pub groups: Vec<RatelimitGroup>,

    /// Routing rules, evaluated in order
    #[serde(default, rename = "match")]
    pub match_expressions: Vec<MatchExpression>,

    /// Deadline for a shared store round trip
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_duration",
        serialize_with = "serialize_optional_duration"
    )]
    pub store_timeout: Option<Duration>,
}

impl RatelimitConfig {
    /// Check the invariants the multiplexer relies on.
    pub fn validate(&self) -> Result<()> {
        validate_params(DEFAULT_GROUP, self.default_group.quota, self.default_group.interval)?;

        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.name.trim().is_empty() {
                return Err(RatemuxError::Config("rate limit group without a name".into()));
            }
            if group.name == DEFAULT_GROUP || !seen.insert(group.name.as_str()) {
                return Err(RatemuxError::DuplicateGroup(group.name.clone()));
            }
            validate_params(&group.name, group.quota, group.interval)?;
        }
        Ok(())
    }
}

fn validate_params(name: &str, quota: u64, interval: Duration) -> Result<()> {
    if quota == 0 {
        return Err(RatemuxError::Config(format!(
            "rate limit group \"{}\": quota must be positive",
            name
        )));
    }
    if interval.is_zero() {
        return Err(RatemuxError::Config(format!(
            "rate limit group \"{}\": interval must be positive",
            name
        )));
    }
    Ok(())
}

/// Build the layered configuration source.
///
/// Defaults are registered first, then `path` (if given and present), then
/// the environment.
pub fn load_settings(path: Option<&Path>) -> Result<Config> {
    let mut builder = Config::builder()
        .set_default(SETTING_RATELIMITS_AUTH_ENABLE, false)?
        .set_default(SETTING_RATELIMITS_AUTH_DEFAULT_QUOTA, default_quota() as i64)?
        .set_default(SETTING_RATELIMITS_AUTH_DEFAULT_INTERVAL, "1m")?
        .set_default(
            SETTING_RATELIMITS_AUTH_DEFAULT_EVENT_EXPRESSION,
            default_event_expression(),
        )?;

    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(false));
    }

    let config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(config)
}

/// Read the rate limit configuration. Returns `None` when rate limiting is
/// disabled.
///
/// Missing keys take the built-in defaults, so a bare
/// `ratelimits.auth.enable: true` yields a working configuration.
pub fn load_ratelimits(c: &Config) -> Result<Option<RatelimitConfig>> {
    if !enabled(c)? {
        return Ok(None);
    }

    let mut default_group = RatelimitParams::default();
    if let Some(quota) = optional(c.get::<u64>(SETTING_RATELIMITS_AUTH_DEFAULT_QUOTA))? {
        default_group.quota = quota;
    }
    if let Some(interval) = optional(c.get_string(SETTING_RATELIMITS_AUTH_DEFAULT_INTERVAL))? {
        default_group.interval = parse_duration(&interval).ok_or_else(|| {
            RatemuxError::Config(format!(
                "{}: invalid duration \"{}\"",
                SETTING_RATELIMITS_AUTH_DEFAULT_INTERVAL, interval
            ))
        })?;
    }
    if let Some(expr) = optional(c.get_string(SETTING_RATELIMITS_AUTH_DEFAULT_EVENT_EXPRESSION))? {
        default_group.event_expression = expr;
    }

    let groups = optional(c.get::<Vec<RatelimitGroup>>(SETTING_RATELIMITS_AUTH_GROUPS))
        .map_err(|e| RatemuxError::Config(format!("error loading rate limit groups: {}", e)))?
        .unwrap_or_default();

    let match_expressions = optional(c.get::<Vec<MatchExpression>>(SETTING_RATELIMITS_AUTH_MATCH))
        .map_err(|e| {
            RatemuxError::Config(format!("error loading rate limit match expressions: {}", e))
        })?
        .unwrap_or_default();

    let store_timeout = match optional(c.get_string(SETTING_RATELIMITS_AUTH_STORE_TIMEOUT))? {
        Some(raw) => Some(parse_duration(&raw).ok_or_else(|| {
            RatemuxError::Config(format!(
                "{}: invalid duration \"{}\"",
                SETTING_RATELIMITS_AUTH_STORE_TIMEOUT, raw
            ))
        })?),
        None => None,
    };

    Ok(Some(RatelimitConfig {
        default_group,
        groups,
        match_expressions,
        store_timeout,
    }))
}

/// Whether `ratelimits.auth.enable` is set.
pub fn enabled(c: &Config) -> Result<bool> {
    Ok(optional(c.get_bool(SETTING_RATELIMITS_AUTH_ENABLE))?.unwrap_or(false))
}

fn optional<T>(value: std::result::Result<T, ConfigError>) -> std::result::Result<Option<T>, ConfigError> {
    match value {
        Ok(value) => Ok(Some(value)),
        Err(ConfigError::NotFound(_)) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Parse a duration such as `1m`, `1m30s`, `250ms`, `1.5h` or a plain
/// number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let value: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total += value * nanos_per_unit;
    }

    if !total.is_finite() || total > u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(total.round() as u64))
}

/// Render a duration the way [`parse_duration`] reads it.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if d.subsec_nanos() % 1_000_000 != 0 {
        return format!("{}ns", d.as_nanos());
    }
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

struct DurationVisitor;

impl<'de> Visitor<'de> for DurationVisitor {
    type Value = Duration;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a duration such as \"1m\" or a number of seconds")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Duration, E> {
        parse_duration(v).ok_or_else(|| E::custom(format!("invalid duration \"{}\"", v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Duration, E> {
        Ok(Duration::from_secs(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Duration, E> {
        u64::try_from(v)
            .map(Duration::from_secs)
            .map_err(|_| E::custom("negative duration"))
    }
}

fn deserialize_duration<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
    d.deserialize_any(DurationVisitor)
}

fn serialize_duration<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

fn deserialize_optional_duration<'de, D: Deserializer<'de>>(
    d: D,
) -> std::result::Result<Option<Duration>, D::Error> {
    deserialize_duration(d).map(Some)
}

fn serialize_optional_duration<S: Serializer>(
    d: &Option<Duration>,
    s: S,
) -> std::result::Result<S::Ok, S::Error> {
    match d {
        Some(d) => serialize_duration(d, s),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn settings(yaml: &str) -> Config {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .unwrap()
    }

    #[test]
    fn test_disabled_by_default() {
        let c = settings("ratelimits: {}");
        assert!(!enabled(&c).unwrap());
        assert_eq!(load_ratelimits(&c).unwrap(), None);
    }

    #[test]
    fn test_defaults_apply_to_missing_fields() {
        let c = settings(
            r#"
ratelimits:
  auth:
    enable: true
"#,
        );
        let lims = load_ratelimits(&c).unwrap().unwrap();
        assert_eq!(lims.default_group, RatelimitParams::default());
        assert_eq!(lims.default_group.quota, 120);
        assert_eq!(lims.default_group.interval, Duration::from_secs(60));
        assert!(lims.groups.is_empty());
        assert!(lims.match_expressions.is_empty());
        assert_eq!(lims.store_timeout, None);
    }

    #[test]
    fn test_load_full_config() {
        let c = settings(
            r#"
ratelimits:
  auth:
    enable: true
    store_timeout: 250ms
    default:
      quota: 2
      interval: 1m
      event_expression: "{{.Subject}}"
    groups:
      - name: devices
        quota: 30
        interval: 10s
        event_expression: "{{.Identity.Subject}}"
      - name: login
        quota: 5
    match:
      - api_pattern: "/api/devices/{rest...}"
        group_expression: devices
      - api_pattern: "POST /api/management/v1/useradm/auth/login"
        group_expression: login
"#,
        );
        let lims = load_ratelimits(&c).unwrap().unwrap();

        assert_eq!(lims.default_group.quota, 2);
        assert_eq!(lims.default_group.event_expression, "{{.Subject}}");
        assert_eq!(lims.store_timeout, Some(Duration::from_millis(250)));

        assert_eq!(lims.groups.len(), 2);
        assert_eq!(lims.groups[0].name, "devices");
        assert_eq!(lims.groups[0].interval, Duration::from_secs(10));
        assert_eq!(lims.groups[1].interval, Duration::from_secs(60));
        assert_eq!(lims.groups[1].event_expression, default_event_expression());

        assert_eq!(lims.match_expressions.len(), 2);
        assert_eq!(lims.match_expressions[1].group_expression, "login");
        lims.validate().unwrap();
    }

    #[test]
    fn test_bad_interval_is_a_config_error() {
        let c = settings(
            r#"
ratelimits:
  auth:
    enable: true
    default:
      interval: soon
"#,
        );
        let err = load_ratelimits(&c).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_validate_rejects_bad_groups() {
        let mut lims = RatelimitConfig::default();
        lims.groups.push(RatelimitGroup {
            name: "a".into(),
            quota: 1,
            interval: Duration::from_secs(1),
            event_expression: String::new(),
        });
        lims.validate().unwrap();

        let mut dup = lims.clone();
        dup.groups.push(dup.groups[0].clone());
        assert!(matches!(dup.validate(), Err(RatemuxError::DuplicateGroup(_))));

        let mut reserved = lims.clone();
        reserved.groups[0].name = DEFAULT_GROUP.into();
        assert!(matches!(reserved.validate(), Err(RatemuxError::DuplicateGroup(_))));

        let mut zero = lims.clone();
        zero.groups[0].quota = 0;
        assert!(matches!(zero.validate(), Err(RatemuxError::Config(_))));

        let mut unnamed = lims;
        unnamed.groups[0].name = " ".into();
        assert!(matches!(unnamed.validate(), Err(RatemuxError::Config(_))));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("1.5h"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("10us"), Some(Duration::from_micros(10)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("m"), None);
        assert_eq!(parse_duration("5 minutes"), None);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(60)), "1m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_config_serializes_to_yaml() {
        let lims = RatelimitConfig::default();
        let yaml = serde_yaml::to_string(&lims).unwrap();
        assert!(yaml.contains("interval: 1m"));

        let back: RatelimitConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, lims);
    }

    #[test]
    fn test_environment_overrides_defaults() {
        // Only this test sets RATEMUX_ variables
        std::env::set_var("RATEMUX_RATELIMITS__AUTH__ENABLE", "true");
        std::env::set_var("RATEMUX_RATELIMITS__AUTH__DEFAULT__QUOTA", "7");
        let c = load_settings(None);
        std::env::remove_var("RATEMUX_RATELIMITS__AUTH__ENABLE");
        std::env::remove_var("RATEMUX_RATELIMITS__AUTH__DEFAULT__QUOTA");

        let c = c.unwrap();
        assert!(enabled(&c).unwrap());
        let lims = load_ratelimits(&c).unwrap().unwrap();
        assert_eq!(lims.default_group.quota, 7);
        assert_eq!(lims.default_group.interval, Duration::from_secs(60));
    }
}
