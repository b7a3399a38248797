//! Per-URL response middleware.
//!
//! A session may attach at most one middleware to a URL; it runs after the
//! raw fetch and before any manifest rewriting, so the format rewriters
//! always see post-middleware content. Entries are keyed by the *current*
//! URL — the handler rekeys them when the origin redirects.

use crate::collab::RewritePlugin;
use crate::error::{ProxyError, Result};
use crate::subtitle;
use axum::http::{HeaderMap, HeaderValue, header};
use regex::Regex;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, warn};

/// Middleware descriptor attached to a URL in session state.
#[derive(Debug, Clone, PartialEq)]
pub enum Middleware {
    /// Sniff the body among DFXP/TTML, SRT, WebVTT and convert to WebVTT.
    SubtitleConvert,
    /// Replace the body with the first capture group of `pattern`.
    RegexExtract { pattern: String },
    /// Hand the body to an external plugin for rewriting.
    PluginDelegate { url: String },
}

/// Apply a middleware to a fetched body, mutating headers in place.
pub async fn apply(
    middleware: &Middleware,
    body: Vec<u8>,
    headers: &mut HeaderMap,
    plugin: &dyn RewritePlugin,
    plugin_timeout: Duration,
) -> Result<Vec<u8>> {
    match middleware {
        Middleware::SubtitleConvert => {
            let text = String::from_utf8_lossy(&body);
            match subtitle::to_webvtt(&text) {
                Ok(vtt) => {
                    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/vtt"));
                    Ok(vtt.into_bytes())
                }
                Err(e) => {
                    // Unrecognized input passes through; the player may
                    // still understand it.
                    warn!("Subtitle conversion skipped: {}", e);
                    Ok(body)
                }
            }
        }
        Middleware::RegexExtract { pattern } => {
            let re = Regex::new(pattern)
                .map_err(|e| ProxyError::Middleware(format!("bad pattern {pattern:?}: {e}")))?;
            let text = String::from_utf8_lossy(&body).into_owned();
            let captured = re
                .captures(&text)
                .and_then(|c| c.get(1))
                .ok_or_else(|| {
                    ProxyError::Middleware(format!("pattern {pattern:?} matched nothing"))
                })?;
            debug!("Regex extraction: {} -> {} bytes", body.len(), captured.as_str().len());
            Ok(captured.as_str().as_bytes().to_vec())
        }
        Middleware::PluginDelegate { url } => {
            // The temp file is removed when `file` drops, on every exit path.
            let mut file = tempfile::NamedTempFile::new()?;
            file.write_all(&body)?;
            file.flush()?;

            let returned_headers =
                tokio::time::timeout(plugin_timeout, plugin.rewrite(url, file.path()))
                    .await
                    .map_err(|_| ProxyError::CollaboratorTimeout(plugin_timeout))?;

            let rewritten = std::fs::read(file.path())?;
            if let Some(extra) = returned_headers {
                for (name, value) in extra.iter() {
                    headers.insert(name, value.clone());
                }
            }
            Ok(rewritten)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::RewritePlugin;
    use async_trait::async_trait;
    use std::path::Path;

    struct UppercasePlugin;

    #[async_trait]
    impl RewritePlugin for UppercasePlugin {
        async fn rewrite(&self, _plugin_url: &str, body_path: &Path) -> Option<HeaderMap> {
            let body = std::fs::read_to_string(body_path).unwrap();
            std::fs::write(body_path, body.to_uppercase()).unwrap();
            let mut headers = HeaderMap::new();
            headers.insert("x-plugin", HeaderValue::from_static("ran"));
            Some(headers)
        }
    }

    struct InertPlugin;

    #[async_trait]
    impl RewritePlugin for InertPlugin {
        async fn rewrite(&self, _plugin_url: &str, _body_path: &Path) -> Option<HeaderMap> {
            None
        }
    }

    #[tokio::test]
    async fn regex_extract_replaces_body_with_capture() {
        let mut headers = HeaderMap::new();
        let body = br#"callback({"url": "https://real.example.com/x.m3u8"})"#.to_vec();
        let out = apply(
            &Middleware::RegexExtract { pattern: r#""url":\s*"([^"]+)""#.to_string() },
            body,
            &mut headers,
            &InertPlugin,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(out, b"https://real.example.com/x.m3u8");
    }

    #[tokio::test]
    async fn regex_extract_without_match_errors() {
        let mut headers = HeaderMap::new();
        let result = apply(
            &Middleware::RegexExtract { pattern: "(never)".to_string() },
            b"nope".to_vec(),
            &mut headers,
            &InertPlugin,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(ProxyError::Middleware(_))));
    }

    #[tokio::test]
    async fn subtitle_convert_sets_content_type() {
        let mut headers = HeaderMap::new();
        let srt = b"1\n00:00:01,000 --> 00:00:02,000\nhi\n".to_vec();
        let out = apply(
            &Middleware::SubtitleConvert,
            srt,
            &mut headers,
            &InertPlugin,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("WEBVTT"));
        assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "text/vtt");
    }

    #[tokio::test]
    async fn subtitle_convert_passes_unknown_through() {
        let mut headers = HeaderMap::new();
        let body = b"binary \x00 payload".to_vec();
        let out = apply(
            &Middleware::SubtitleConvert,
            body.clone(),
            &mut headers,
            &InertPlugin,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(out, body);
        assert!(headers.get(header::CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn plugin_delegate_roundtrips_temp_file() {
        let mut headers = HeaderMap::new();
        let out = apply(
            &Middleware::PluginDelegate { url: "plugin://rewriter".to_string() },
            b"hello".to_vec(),
            &mut headers,
            &UppercasePlugin,
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(out, b"HELLO");
        assert_eq!(headers.get("x-plugin").unwrap(), "ran");
    }
}
