//! Edge routing table
//!
//! A static, ordered list of prefix rules. Matching is plain string-prefix:
//! the longest matching prefix wins, ties go to the rule declared first.
//! This keeps `/api` ahead of the catch-all `/` regardless of declaration order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of the catch-all rule
pub const CATCH_ALL: &str = "/";

/// Prefix forwarded to the backend
pub const API_PREFIX: &str = "/api";

#[derive(Debug, Error, PartialEq)]
pub enum RouteTableError {
    #[error("routing table has no catch-all '/' rule")]
    MissingCatchAll,

    #[error("route prefix '{0}' must start with '/'")]
    InvalidPrefix(String),

    #[error("upstream '{0}' must be an http:// or https:// base URL")]
    InvalidUpstream(String),
}

/// Where a matched request goes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "address", rename_all = "snake_case")]
pub enum RouteTarget {
    /// Serve from the static file root (with index fallback)
    StaticRoot,
    /// Forward to an upstream base URL, e.g. `http://backend:3000`
    Upstream(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub prefix: String,
    pub target: RouteTarget,
}

impl RouteRule {
    pub fn new(prefix: impl Into<String>, target: RouteTarget) -> Self {
        Self {
            prefix: prefix.into(),
            target,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
    }
}

/// Ordered routing table
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: Vec<RouteRule>,
}

impl RoutingTable {
    pub fn new(rules: Vec<RouteRule>) -> Result<Self, RouteTableError> {
        if let Some(bad) = rules.iter().find(|r| !r.prefix.starts_with('/')) {
            return Err(RouteTableError::InvalidPrefix(bad.prefix.clone()));
        }
        for rule in &rules {
            if let RouteTarget::Upstream(ref url) = rule.target {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(RouteTableError::InvalidUpstream(url.clone()));
                }
            }
        }
        if !rules.iter().any(|r| r.prefix == CATCH_ALL) {
            return Err(RouteTableError::MissingCatchAll);
        }
        Ok(Self { rules })
    }

    /// `/api` → backend, everything else → static files
    pub fn standard(backend_url: &str) -> Result<Self, RouteTableError> {
        Self::new(vec![
            RouteRule::new(API_PREFIX, RouteTarget::Upstream(backend_url.to_string())),
            RouteRule::new(CATCH_ALL, RouteTarget::StaticRoot),
        ])
    }

    /// Most specific rule for `path`
    ///
    /// Always returns a rule: the catch-all matches every path that starts
    /// with `/`, and paths without a leading slash fall back to it too.
    pub fn resolve(&self, path: &str) -> &RouteRule {
        let mut best: Option<&RouteRule> = None;
        for rule in &self.rules {
            if !rule.matches(path) {
                continue;
            }
            // strict '>' keeps the earliest declared rule on ties
            if best.map_or(true, |b| rule.prefix.len() > b.prefix.len()) {
                best = Some(rule);
            }
        }
        best.unwrap_or_else(|| self.catch_all())
    }

    fn catch_all(&self) -> &RouteRule {
        // presence checked in new()
        self.rules
            .iter()
            .find(|r| r.prefix == CATCH_ALL)
            .unwrap_or(&self.rules[self.rules.len() - 1])
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream() -> RouteTarget {
        RouteTarget::Upstream("http://backend:3000".to_string())
    }

    #[test]
    fn test_api_paths_go_upstream() {
        let table = RoutingTable::standard("http://backend:3000").unwrap();
        for path in ["/api", "/api/", "/api/health", "/api/v1/items?x=1", "/apix"] {
            assert_eq!(table.resolve(path).target, upstream(), "path {}", path);
        }
    }

    #[test]
    fn test_other_paths_are_static() {
        let table = RoutingTable::standard("http://backend:3000").unwrap();
        for path in ["/", "/index.html", "/static/js/main.js", "/dashboard/settings", "/ap"] {
            assert_eq!(table.resolve(path).target, RouteTarget::StaticRoot, "path {}", path);
        }
    }

    #[test]
    fn test_declaration_order_does_not_shadow_api() {
        let table = RoutingTable::new(vec![
            RouteRule::new("/", RouteTarget::StaticRoot),
            RouteRule::new("/api", upstream()),
        ])
        .unwrap();
        assert_eq!(table.resolve("/api/users").target, upstream());
        assert_eq!(table.resolve("/users").target, RouteTarget::StaticRoot);
    }

    #[test]
    fn test_ties_resolve_to_first_declared() {
        let table = RoutingTable::new(vec![
            RouteRule::new("/api", RouteTarget::Upstream("http://first".to_string())),
            RouteRule::new("/api", RouteTarget::Upstream("http://second".to_string())),
            RouteRule::new("/", RouteTarget::StaticRoot),
        ])
        .unwrap();
        assert_eq!(
            table.resolve("/api/x").target,
            RouteTarget::Upstream("http://first".to_string())
        );
    }

    #[test]
    fn test_table_validation() {
        assert_eq!(
            RoutingTable::new(vec![RouteRule::new("/api", upstream())]).unwrap_err(),
            RouteTableError::MissingCatchAll
        );
        assert_eq!(
            RoutingTable::new(vec![
                RouteRule::new("api", upstream()),
                RouteRule::new("/", RouteTarget::StaticRoot),
            ])
            .unwrap_err(),
            RouteTableError::InvalidPrefix("api".to_string())
        );
    }

    #[test]
    fn test_standard_table_rejects_bare_backend_address() {
        assert_eq!(
            RoutingTable::standard("backend:3000").unwrap_err(),
            RouteTableError::InvalidUpstream("backend:3000".to_string())
        );
        assert!(RoutingTable::standard("https://api.internal").is_ok());
    }

    #[test]
    fn test_path_without_leading_slash_uses_catch_all() {
        let table = RoutingTable::standard("http://backend:3000").unwrap();
        assert_eq!(table.resolve("*").target, RouteTarget::StaticRoot);
    }
}
