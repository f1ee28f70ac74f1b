//! API patterns used by match expressions.
//!
//! A pattern is an optional method followed by a path:
//!
//! - `/api/devices/v1/authentication/auth_requests` matches that path only
//! - `POST /api/management/v1/useradm/auth/login` also requires the method
//! - `*` or `{name}` matches exactly one segment
//! - a trailing `{name...}` matches the rest of the path, including nothing
//! - a trailing `/` matches every path below it, so `/` matches everything

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors raised while parsing an API pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("\"{0}\": path must start with '/'")]
    MissingLeadingSlash(String),

    #[error("\"{0}\": invalid method")]
    InvalidMethod(String),

    #[error("\"{0}\": empty path segment")]
    EmptySegment(String),

    #[error("\"{pattern}\": bad wildcard \"{segment}\"")]
    BadWildcard { pattern: String, segment: String },

    #[error("\"{0}\": rest wildcard must be the last segment")]
    RestNotLast(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Wildcard,
}

/// A compiled API pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiPattern {
    source: String,
    method: Option<String>,
    segments: Vec<Segment>,
    /// Whether the pattern also matches paths extending past its segments
    prefix: bool,
}

impl ApiPattern {
    /// Parse an API pattern.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let source = pattern.trim();
        let (method, path) = match source.split_once(char::is_whitespace) {
            Some((method, path)) => {
                let valid = !method.is_empty()
                    && method.chars().all(|c| c.is_ascii_alphabetic());
                if !valid {
                    return Err(PatternError::InvalidMethod(source.to_string()));
                }
                (Some(method.to_ascii_uppercase()), path.trim_start())
            }
            None => (None, source),
        };

        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| PatternError::MissingLeadingSlash(source.to_string()))?;

        let mut segments = Vec::new();
        let mut prefix = false;
        if !rest.is_empty() {
            let parts: Vec<&str> = rest.split('/').collect();
            let last = parts.len() - 1;
            for (i, part) in parts.iter().enumerate() {
                if part.is_empty() {
                    if i == last {
                        prefix = true;
                        break;
                    }
                    return Err(PatternError::EmptySegment(source.to_string()));
                }
                match parse_segment(part, source)? {
                    ParsedSegment::One(segment) => segments.push(segment),
                    ParsedSegment::Rest if i == last => prefix = true,
                    ParsedSegment::Rest => {
                        return Err(PatternError::RestNotLast(source.to_string()))
                    }
                }
            }
        } else {
            prefix = true;
        }

        Ok(Self {
            source: source.to_string(),
            method,
            segments,
            prefix,
        })
    }

    /// The pattern as written in configuration.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether a request with `method` and `path` matches this pattern.
    pub fn matches(&self, method: &str, path: &str) -> bool {
        if let Some(expected) = &self.method {
            if !expected.eq_ignore_ascii_case(method) {
                return false;
            }
        }

        let rest = match path.strip_prefix('/') {
            Some(rest) => rest,
            None => return false,
        };
        let mut parts = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split('/').collect::<Vec<_>>()
        };

        if self.prefix {
            if parts.len() < self.segments.len() {
                return false;
            }
            parts.truncate(self.segments.len());
        } else if parts.len() != self.segments.len() {
            return false;
        }

        self.segments
            .iter()
            .zip(parts)
            .all(|(segment, part)| match segment {
                Segment::Literal(literal) => literal == part,
                Segment::Wildcard => !part.is_empty(),
            })
    }
}

enum ParsedSegment {
    One(Segment),
    Rest,
}

fn parse_segment(part: &str, source: &str) -> Result<ParsedSegment, PatternError> {
    if part == "*" {
        return Ok(ParsedSegment::One(Segment::Wildcard));
    }
    if !part.contains(['{', '}', '*']) {
        return Ok(ParsedSegment::One(Segment::Literal(part.to_string())));
    }

    let bad = || PatternError::BadWildcard {
        pattern: source.to_string(),
        segment: part.to_string(),
    };
    let inner = part
        .strip_prefix('{')
        .and_then(|p| p.strip_suffix('}'))
        .ok_or_else(bad)?;
    let (name, rest) = match inner.strip_suffix("...") {
        Some(name) => (name, true),
        None => (inner, false),
    };
    let valid = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(bad());
    }
    Ok(if rest {
        ParsedSegment::Rest
    } else {
        ParsedSegment::One(Segment::Wildcard)
    })
}

impl FromStr for ApiPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ApiPattern::parse(s)
    }
}

impl fmt::Display for ApiPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, method: &str, path: &str) -> bool {
        ApiPattern::parse(pattern).unwrap().matches(method, path)
    }

    #[test]
    fn test_exact_path() {
        assert!(matches("/a/b", "GET", "/a/b"));
        assert!(!matches("/a/b", "GET", "/a/b/c"));
        assert!(!matches("/a/b", "GET", "/a"));
        assert!(!matches("/a/b", "GET", "/a/b/"));
    }

    #[test]
    fn test_single_segment_wildcards() {
        assert!(matches("/a/*", "GET", "/a/b"));
        assert!(!matches("/a/*", "GET", "/a/b/c"));
        assert!(!matches("/a/*", "GET", "/a/"));
        assert!(matches("/devices/{id}/auth", "PUT", "/devices/123/auth"));
    }

    #[test]
    fn test_rest_wildcard_and_prefix() {
        assert!(matches("/api/{rest...}", "GET", "/api"));
        assert!(matches("/api/{rest...}", "GET", "/api/a/b/c"));
        assert!(matches("/api/", "GET", "/api/x/y"));
        assert!(!matches("/api/", "GET", "/apix"));
        assert!(matches("/", "DELETE", "/anything/at/all"));
    }

    #[test]
    fn test_method_prefix() {
        assert!(matches("POST /auth/login", "POST", "/auth/login"));
        assert!(matches("post /auth/login", "POST", "/auth/login"));
        assert!(!matches("POST /auth/login", "GET", "/auth/login"));
    }

    #[test]
    fn test_malformed_patterns() {
        assert!(matches!(
            ApiPattern::parse("a/b"),
            Err(PatternError::MissingLeadingSlash(_))
        ));
        assert!(matches!(
            ApiPattern::parse("GE7 /a"),
            Err(PatternError::InvalidMethod(_))
        ));
        assert!(matches!(
            ApiPattern::parse("/a//b"),
            Err(PatternError::EmptySegment(_))
        ));
        assert!(matches!(
            ApiPattern::parse("/a/{}/b"),
            Err(PatternError::BadWildcard { .. })
        ));
        assert!(matches!(
            ApiPattern::parse("/a/b*"),
            Err(PatternError::BadWildcard { .. })
        ));
        assert!(matches!(
            ApiPattern::parse("/a/{rest...}/b"),
            Err(PatternError::RestNotLast(_))
        ));
    }

    #[test]
    fn test_display_round_trips_source() {
        let pattern: ApiPattern = " GET /a/* ".parse().unwrap();
        assert_eq!(pattern.to_string(), "GET /a/*");
    }
}
