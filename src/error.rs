//! Error taxonomy for the proxy core.
//!
//! Transport, parse, and cancellation failures are distinct variants so the
//! request handler can branch on them with a `match` instead of re-inspecting
//! error strings. Cancellation (the user dismissing the quality chooser) is
//! deliberately NOT an `Upstream`/`Parse` error: it routes playback to the
//! stop sentinel, while ordinary failures route to the skip sentinel.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Upstream request failed. `via_proxy` records whether an explicit
    /// proxy server was in the path, so diagnostics can say which hop broke.
    #[error("upstream fetch failed (via_proxy={via_proxy}): {source}")]
    Upstream {
        via_proxy: bool,
        #[source]
        source: reqwest::Error,
    },

    /// No resolver (rewrite rule, custom resolver, system) produced an
    /// address for the host.
    #[error("DNS resolution failed for {host}")]
    Dns { host: String },

    /// Manifest could not be parsed (missing `#EXTM3U`, malformed XML, ...).
    #[error("manifest parse failed: {0}")]
    Parse(String),

    /// The user dismissed an interactive chooser.
    #[error("cancelled by user")]
    Cancelled,

    /// The inbound path could not be mapped to an upstream URL.
    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),

    /// An external collaborator did not answer within its bounded timeout.
    #[error("collaborator call timed out after {0:?}")]
    CollaboratorTimeout(std::time::Duration),

    /// A middleware step failed (bad regex, unreadable temp file, ...).
    #[error("middleware failed: {0}")]
    Middleware(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    /// Wrap a reqwest error, tagging whether a proxy server was configured
    /// for the destination.
    pub fn upstream(source: reqwest::Error, via_proxy: bool) -> Self {
        Self::Upstream { via_proxy, source }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProxyError::Upstream { .. } | ProxyError::Dns { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Parse(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Cancelled => StatusCode::GONE,
            ProxyError::InvalidTarget(_) => StatusCode::BAD_REQUEST,
            ProxyError::CollaboratorTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Middleware(_) | ProxyError::Io(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// Result of a manifest fetch-and-rewrite cycle.
///
/// The handler matches on this to decide between serving the rewritten body,
/// the stop sentinel (user cancelled), or the skip sentinel (hard failure).
#[derive(Debug)]
pub enum RewriteOutcome {
    /// Rewritten manifest body plus the content type to serve it under.
    Rewritten { body: String, content_type: String },
    /// The user dismissed the quality chooser; playback must stop cleanly.
    Cancelled,
    /// Fetch or rewrite failed; the player should skip to the next item.
    Failed(ProxyError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_not_an_upstream_error() {
        let outcome = RewriteOutcome::Cancelled;
        assert!(matches!(outcome, RewriteOutcome::Cancelled));
    }

    #[test]
    fn upstream_error_mentions_proxy_when_involved() {
        // A relative URL fails at request build time, yielding a reqwest::Error.
        let bad = reqwest::Client::new()
            .get("notaurl")
            .build()
            .expect_err("relative URL must not build");
        let e = ProxyError::upstream(bad, true);
        assert!(e.to_string().contains("via_proxy=true"));
    }

    #[test]
    fn invalid_target_maps_to_400() {
        let resp = ProxyError::InvalidTarget("x".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
