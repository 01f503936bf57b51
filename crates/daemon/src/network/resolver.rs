//! Session identity resolution.
//!
//! Maps a viewer's request path to the external session it wants and a
//! working-directory hint. Deployments with a metadata service can plug in
//! their own [`SessionResolver`]; the default [`PathResolver`] reads both
//! from the URL: `/sessions/<name>?cwd=<dir>`.

use std::path::PathBuf;

use thiserror::Error;
use url::form_urlencoded;

use crate::session::validate_session_name;

/// Query parameter carrying the working-directory hint.
pub const CWD_PARAM: &str = "cwd";

/// A resolved viewer request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    /// External session name.
    pub name: String,
    /// Working directory hint for a fresh attach.
    pub cwd: Option<PathBuf>,
}

/// Why a request could not be resolved.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The path does not address a session.
    #[error("no session at {0}")]
    NotFound(String),

    /// The path names a session that cannot exist.
    #[error("invalid session name: {0}")]
    InvalidName(String),
}

/// Supplies the session name and working directory for a request.
pub trait SessionResolver: Send + Sync + 'static {
    /// Resolves a request path and optional query string.
    fn resolve(&self, path: &str, query: Option<&str>) -> Result<SessionTarget, ResolveError>;
}

/// Resolves `<prefix>/<name>` paths.
#[derive(Debug, Clone)]
pub struct PathResolver {
    prefix: String,
}

impl PathResolver {
    /// Creates a resolver for paths under `prefix` (e.g. `/sessions`).
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    /// The path prefix, without a trailing slash.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl SessionResolver for PathResolver {
    fn resolve(&self, path: &str, query: Option<&str>) -> Result<SessionTarget, ResolveError> {
        let not_found = || ResolveError::NotFound(path.to_string());

        let segment = path
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(not_found)?;
        if segment.is_empty() || segment.contains('/') {
            return Err(not_found());
        }

        let name = decode_segment(segment);
        validate_session_name(&name).map_err(|e| ResolveError::InvalidName(e.to_string()))?;

        let cwd = query.and_then(|query| {
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, value)| key == CWD_PARAM && !value.is_empty())
                .map(|(_, value)| PathBuf::from(value.into_owned()))
        });

        Ok(SessionTarget { name, cwd })
    }
}

/// Percent-decodes one path segment.
///
/// `form_urlencoded` treats `+`, `&` and `=` specially; they are literal in
/// a path, so they are escaped before decoding.
fn decode_segment(raw: &str) -> String {
    let escaped = raw
        .replace('+', "%2B")
        .replace('&', "%26")
        .replace('=', "%3D");
    form_urlencoded::parse(escaped.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .unwrap_or_default()
}
