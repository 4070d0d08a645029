//! Path to upstream resolution, run inside each worker.

use crate::{
    config::{Rule, Upstream},
    error::RouteError,
};

/// Resolves a request path to the upstream its first matching rule points at.
///
/// Rules are tried in declaration order. Only the first upstream id of the
/// matching rule is used; the remaining ids are not consulted.
pub fn resolve<'a>(
    path: &str,
    rules: &[Rule],
    upstreams: &'a [Upstream],
) -> Result<&'a Upstream, RouteError> {
    let rule = rules
        .iter()
        .find(|rule| path_matches(&rule.path, path))
        .ok_or_else(|| RouteError::RuleNotFound(path.to_string()))?;

    let id = rule
        .upstreams
        .first()
        .ok_or_else(|| RouteError::UpstreamNotFound(format!("<none> (rule {})", rule.path)))?;

    upstreams
        .iter()
        .find(|upstream| &upstream.id == id)
        .ok_or_else(|| RouteError::UpstreamNotFound(id.clone()))
}

/// Exact match, or prefix match ending on a `/` segment boundary.
/// The query string is ignored.
pub fn path_matches(pattern: &str, path: &str) -> bool {
    let path = path.split(['?', '#']).next().unwrap_or_default();

    match path.strip_prefix(pattern) {
        Some("") => true,
        Some(rest) => pattern.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}
