//! Prefix routes and the path rewrite applied before forwarding.
//!
//! # Matching
//!
//! The longest matching prefix wins. A prefix matches at a path segment
//! boundary only: `/api` matches `/api` and `/api/users`, not `/apix`.
//! A prefix with a trailing slash (`/service-a/`) also matches the bare
//! `/service-a`.
//!
//! # Rewrite
//!
//! The prefix is stripped, one leading `/` of the remainder is dropped, and
//! the result is re-rooted at `/`. The target's base path is kept and the
//! query string is carried over unchanged:
//!
//! | Prefix | Target | Inbound | Outbound |
//! |--------|--------|---------|----------|
//! | `/service-a/` | `http://service-a:8080` | `/service-a/foo?x=1` | `http://service-a:8080/foo?x=1` |
//! | `/service-a/` | `http://service-a:8080` | `/service-a/` | `http://service-a:8080/` |
//! | `/api` | `http://api:9000/v1/` | `/api/users` | `http://api:9000/v1/users` |

use reqwest::Url;
use serde::Deserialize;

use crate::error::{GatewayError, GatewayResult};

/// One prefix → backend mapping, static for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProxyRoute {
    pub prefix: String,
    #[serde(alias = "target_url", alias = "target")]
    pub target_base_url: String,
}

impl ProxyRoute {
    pub fn new(prefix: impl Into<String>, target_base_url: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            target_base_url: target_base_url.into(),
        }
    }

    /// Check the prefix shape and that the target is an absolute http(s) URL.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` describing the offending route.
    pub fn validate(&self) -> GatewayResult<()> {
        self.target_url().map(|_| ())
    }

    fn target_url(&self) -> GatewayResult<Url> {
        if !self.prefix.starts_with('/') {
            return Err(GatewayError::ConfigError(format!(
                "Route prefix '{}' must start with '/'",
                self.prefix
            )));
        }

        let url = Url::parse(&self.target_base_url).map_err(|e| {
            GatewayError::ConfigError(format!(
                "Route '{}' has invalid target '{}': {e}",
                self.prefix, self.target_base_url
            ))
        })?;

        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(GatewayError::ConfigError(format!(
                "Route '{}' target '{}' must be an absolute http(s) URL",
                self.prefix, self.target_base_url
            )));
        }

        if url.query().is_some() || url.fragment().is_some() {
            return Err(GatewayError::ConfigError(format!(
                "Route '{}' target '{}' must not carry a query or fragment",
                self.prefix, self.target_base_url
            )));
        }

        Ok(url)
    }

    /// Whether this route's prefix covers `path`.
    pub fn matches(&self, path: &str) -> bool {
        rewrite_path(&self.prefix, path).is_some()
    }
}

/// Strip `prefix` from `path` and re-root the remainder at `/`.
///
/// Returns `None` when `prefix` does not match `path`.
pub fn rewrite_path(prefix: &str, path: &str) -> Option<String> {
    let rest = match path.strip_prefix(prefix) {
        Some(rest) => {
            // Segment boundary: "/api" must not match "/apix".
            if !prefix.ends_with('/') && !rest.is_empty() && !rest.starts_with('/') {
                return None;
            }
            rest
        }
        // "/service-a" under the prefix "/service-a/"
        None if prefix.len() > 1 && prefix.strip_suffix('/') == Some(path) => "",
        None => return None,
    };

    let rest = rest.strip_prefix('/').unwrap_or(rest);
    Some(format!("/{rest}"))
}

/// A resolved route: which prefix matched and the full backend URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch<'a> {
    pub route: &'a ProxyRoute,
    pub target: String,
}

#[derive(Debug, Clone)]
struct CompiledRoute {
    route: ProxyRoute,
    /// Target with any trailing `/` removed from its path
    base: String,
}

/// Ordered, immutable routing table with longest-prefix lookup.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<CompiledRoute>,
}

impl RouteTable {
    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` if any route is invalid.
    pub fn new(routes: Vec<ProxyRoute>) -> GatewayResult<Self> {
        let mut compiled = routes
            .into_iter()
            .map(|route| {
                let url = route.target_url()?;
                let base = url.as_str().trim_end_matches('/').to_string();
                Ok(CompiledRoute { route, base })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        // Longest prefix first; the sort is stable so equal lengths keep
        // declaration order.
        compiled.sort_by(|a, b| b.route.prefix.len().cmp(&a.route.prefix.len()));

        Ok(Self { routes: compiled })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Routes in lookup order (longest prefix first).
    pub fn routes(&self) -> impl Iterator<Item = &ProxyRoute> {
        self.routes.iter().map(|c| &c.route)
    }

    /// Find the route for `path` and build the backend URL.
    pub fn resolve(&self, path: &str, query: Option<&str>) -> Option<RouteMatch<'_>> {
        self.routes.iter().find_map(|compiled| {
            let rewritten = rewrite_path(&compiled.route.prefix, path)?;
            let mut target = format!("{}{}", compiled.base, rewritten);
            if let Some(query) = query {
                target.push('?');
                target.push_str(query);
            }
            Some(RouteMatch {
                route: &compiled.route,
                target,
            })
        })
    }
}
