//! The proxy request handler.
//!
//! One state machine per inbound request:
//! resolve target → fetch → surface redirect → middleware → classify →
//! rewrite → respond. Segment-sized responses stream straight through;
//! manifest failures degrade to a synthetic manifest with HTTP 200 because
//! players hard-fail the whole session on a non-200 manifest fetch.

use crate::dash::{self, DashContext};
use crate::error::{ProxyError, RewriteOutcome};
use crate::hls::{self, HlsContext};
use crate::metrics;
use crate::middleware;
use crate::quality::QualityContext;
use crate::server::handlers::sentinel;
use crate::server::state::AppState;
use crate::session::{ManifestKind, Session};
use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use std::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

/// Hop-by-hop request headers never forwarded upstream.
const STRIP_REQUEST_HEADERS: &[&str] = &["host", "upgrade", "accept-encoding", "content-length"];

/// Response headers never returned to the player. Cookies live inside the
/// transport's own store and must not leak.
const STRIP_RESPONSE_HEADERS: &[&str] = &[
    "date",
    "server",
    "transfer-encoding",
    "keep-alive",
    "connection",
    "set-cookie",
    "content-length",
];

/// Targets in this scheme are opaque and go through the external resolver.
const OPAQUE_SCHEME: &str = "plugin://";

/// Single entry point for GET/HEAD/POST; everything else is 405.
pub async fn proxy_any(
    State(state): State<AppState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method == Method::GET || method == Method::HEAD {
        handle(state, method, uri, headers, None).await
    } else if method == Method::POST {
        handle(state, Method::POST, uri, headers, Some(body.to_vec())).await
    } else {
        StatusCode::METHOD_NOT_ALLOWED.into_response()
    }
}

/// Decode the inbound path into an upstream target.
///
/// The target is normally embedded raw (`/https://origin/...`) so relative
/// URIs in rewritten playlists resolve through the player untouched; a
/// fully URL-encoded form is also accepted and decoded exactly once.
fn decode_target(raw: &str) -> String {
    let raw = raw.trim_start_matches('/');
    if raw.starts_with("http://") || raw.starts_with("https://") || raw.starts_with(OPAQUE_SCHEME)
    {
        return raw.to_string();
    }
    match urlencoding::decode(raw) {
        Ok(decoded)
            if decoded.starts_with("http://")
                || decoded.starts_with("https://")
                || decoded.starts_with(OPAQUE_SCHEME) =>
        {
            decoded.into_owned()
        }
        _ => raw.to_string(),
    }
}

async fn handle(
    state: AppState,
    method: Method,
    uri: Uri,
    inbound: HeaderMap,
    body: Option<Vec<u8>>,
) -> Response {
    let start = Instant::now();
    let raw = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());
    let mut target = decode_target(raw);

    // The redirect flag covers exactly one follow-up request cycle.
    let mut was_redirecting = false;
    state.session.update(|s| {
        was_redirecting = s.redirecting;
        s.redirecting = false;
    });

    // Path substitution: short local paths map to full origin URLs.
    if let Some(session) = state.session.snapshot() {
        if let Some(mapped) = session.path_substitutions.get(target.as_str()) {
            debug!("Path substitution: {} -> {}", target, mapped);
            target = mapped.clone();
        }
    }

    // Opaque references block on the external resolver, bounded.
    let mut extra_headers = HeaderMap::new();
    if target.starts_with(OPAQUE_SCHEME) {
        let resolved = match tokio::time::timeout(
            state.config.collaborator_timeout,
            state.collab.resolver.resolve(&target),
        )
        .await
        {
            Err(_) => {
                return ProxyError::CollaboratorTimeout(state.config.collaborator_timeout)
                    .into_response();
            }
            Ok(None) => {
                return ProxyError::InvalidTarget(format!("unresolvable reference {target}"))
                    .into_response();
            }
            Ok(Some(resolved)) => resolved,
        };
        info!("Resolved {} -> {}", target, resolved.url);
        state.session.update(|s| s.on_redirect(&target, &resolved.url));
        extra_headers = resolved.headers;
        target = resolved.url;
    }

    if !target.starts_with("http://") && !target.starts_with("https://") {
        return ProxyError::InvalidTarget(target).into_response();
    }

    let mut outbound = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if STRIP_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if was_redirecting && name == &header::REFERER {
            continue;
        }
        outbound.insert(name.clone(), value.clone());
    }
    for (name, value) in extra_headers.iter() {
        outbound.insert(name.clone(), value.clone());
    }

    let is_post = method == Method::POST;
    let upstream = match state
        .transport()
        .request(method.clone(), &target, outbound, body)
        .await
    {
        Ok(response) => response,
        Err(error) => return fetch_failure(&state, &target, error, start).await,
    };

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let final_url = upstream.url().to_string();

    // Surface redirects to the session instead of following them.
    if status.is_redirection() {
        if let Some(location) = upstream
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
        {
            let absolute = Url::parse(&final_url)
                .ok()
                .and_then(|base| base.join(location).ok())
                .map(String::from)
                .unwrap_or_else(|| location.to_string());
            info!("Upstream redirect: {} -> {}", target, absolute);
            state.session.update(|s| {
                s.on_redirect(&target, &absolute);
                s.redirecting = true;
            });
            let proxied = format!(
                "{}/{}",
                state.config.base_url.trim_end_matches('/'),
                absolute
            );
            let mut headers = copy_response_headers(upstream.headers());
            if let Ok(value) = HeaderValue::from_str(&proxied) {
                headers.insert(header::LOCATION, value);
            }
            metrics::record_request("redirect", status.as_u16());
            return (status, headers, Body::empty()).into_response();
        }
    }

    let response_headers = copy_response_headers(upstream.headers());

    if method == Method::HEAD {
        metrics::record_request("head", status.as_u16());
        return (status, response_headers, Body::empty()).into_response();
    }

    if is_post {
        return finish_post(&state, &target, status, response_headers, upstream, start).await;
    }

    // Segment-sized responses and the post-redirect cycle stream through
    // untouched; content-length exactly at the threshold already bypasses.
    let session = state.session.snapshot();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let over_threshold = upstream
        .content_length()
        .is_some_and(|len| len >= state.config.rewrite_threshold as u64);
    let is_manifest = session
        .as_ref()
        .is_some_and(|s| s.manifest_url == target || s.manifest_url == final_url);
    let has_middleware = session.as_ref().is_some_and(|s| {
        s.middleware.contains_key(&final_url) || s.middleware.contains_key(&target)
    });
    let looks_like_hls = ManifestKind::sniff(content_type.as_deref(), &final_url)
        == ManifestKind::Hls;

    let eligible = !was_redirecting
        && !over_threshold
        && (is_manifest || has_middleware || looks_like_hls);

    if !eligible {
        metrics::record_request("passthrough", status.as_u16());
        metrics::record_duration("passthrough", start);
        let body = Body::from_stream(upstream.bytes_stream());
        return (status, response_headers, body).into_response();
    }

    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(error) => {
            return fetch_failure(&state, &target, ProxyError::upstream(error, false), start)
                .await;
        }
    };

    rewrite_and_respond(
        &state,
        session,
        target,
        final_url,
        status,
        response_headers,
        content_type,
        bytes,
        is_manifest,
        start,
    )
    .await
}

/// Buffered POST passthrough, with the license-acquisition 406 hook: a 406
/// for the session's license URL on a non-Android platform triggers the DRM
/// reinstall collaborator exactly once; the response itself is unchanged.
async fn finish_post(
    state: &AppState,
    target: &str,
    status: StatusCode,
    headers: HeaderMap,
    upstream: reqwest::Response,
    start: Instant,
) -> Response {
    let is_license = state
        .session
        .snapshot()
        .and_then(|s| s.license_url)
        .is_some_and(|license| license == target);

    if status == StatusCode::NOT_ACCEPTABLE && is_license && !state.config.platform_android {
        warn!("License server answered 406; requesting DRM component reinstall");
        state.collab.drm.reinstall().await;
    }

    let bytes = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(error) => return ProxyError::upstream(error, false).into_response(),
    };
    metrics::record_request("post", status.as_u16());
    metrics::record_duration("post", start);
    (status, headers, Body::from(bytes)).into_response()
}

/// Middleware, classification, and format rewriting over a buffered body.
#[allow(clippy::too_many_arguments)]
async fn rewrite_and_respond(
    state: &AppState,
    session: Option<Session>,
    target: String,
    final_url: String,
    status: StatusCode,
    mut response_headers: HeaderMap,
    content_type: Option<String>,
    mut bytes: Vec<u8>,
    is_manifest: bool,
    start: Instant,
) -> Response {
    // Middleware first: format rewriters always see post-middleware content.
    if let Some(session) = &session {
        let descriptor = session
            .middleware
            .get(&final_url)
            .or_else(|| session.middleware.get(&target));
        if let Some(descriptor) = descriptor {
            match middleware::apply(
                descriptor,
                bytes,
                &mut response_headers,
                state.collab.plugin.as_ref(),
                state.config.collaborator_timeout,
            )
            .await
            {
                Ok(rewritten) => bytes = rewritten,
                Err(error) if is_manifest => {
                    warn!("Middleware failed on manifest: {}", error);
                    return manifest_fallback(state, session.kind, false);
                }
                Err(error) => return error.into_response(),
            }
        }
    }

    // A session that hasn't seen its manifest yet passes everything through.
    let Some(session) = session else {
        metrics::record_request("passthrough", status.as_u16());
        return (status, response_headers, Body::from(bytes)).into_response();
    };

    // Classify once: the first manifest response pins the session kind.
    let mut kind = session.kind;
    if kind == ManifestKind::None && is_manifest {
        kind = ManifestKind::sniff(content_type.as_deref(), &final_url);
        if kind != ManifestKind::None {
            info!("Session classified as {:?}", kind);
            state.session.update(|s| {
                if s.kind == ManifestKind::None {
                    s.kind = kind;
                }
            });
        }
    }

    let rewrite_hls_media = kind == ManifestKind::Hls
        && !is_manifest
        && ManifestKind::sniff(content_type.as_deref(), &final_url) == ManifestKind::Hls;

    if rewrite_hls_media {
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let ctx = HlsContext {
            session: &session,
            proxy_base: &state.config.base_url,
            response_url: &final_url,
        };
        // Media playlists contain URIs too; masters reached indirectly
        // (audio/subtitle group playlists) take the master path.
        let result = if text.contains("#EXT-X-STREAM-INF") {
            master_rewrite(state, &session, &text, &ctx).await
        } else {
            hls::rewrite_media(&text, &ctx)
        };
        return match result {
            Ok(body) => {
                metrics::record_request("hls-media", status.as_u16());
                metrics::record_duration("hls-media", start);
                respond_rewritten(status, response_headers, body, "application/vnd.apple.mpegurl")
            }
            // No fallback for non-manifest URLs: the player retries media
            // playlists itself.
            Err(error) => error.into_response(),
        };
    }

    if !is_manifest || kind == ManifestKind::None {
        metrics::record_request("passthrough", status.as_u16());
        metrics::record_duration("passthrough", start);
        return (status, response_headers, Body::from(bytes)).into_response();
    }

    let text = String::from_utf8_lossy(&bytes).into_owned();
    let outcome = rewrite_manifest(state, &session, kind, &text, &final_url).await;
    match outcome {
        RewriteOutcome::Rewritten { body, content_type } => {
            state.session.reset_failures();
            metrics::record_request("manifest", status.as_u16());
            metrics::record_duration("manifest", start);
            respond_rewritten(status, response_headers, body, &content_type)
        }
        RewriteOutcome::Cancelled => {
            info!("Manifest rewrite cancelled by user");
            manifest_fallback(state, kind, true)
        }
        RewriteOutcome::Failed(error) => {
            warn!("Manifest rewrite failed: {}", error);
            manifest_fallback(state, kind, false)
        }
    }
}

/// Full manifest rewrite, folded into the explicit outcome sum type.
async fn rewrite_manifest(
    state: &AppState,
    session: &Session,
    kind: ManifestKind,
    text: &str,
    final_url: &str,
) -> RewriteOutcome {
    let policy = session.quality.unwrap_or(state.config.quality);
    let quality = QualityContext::new(
        policy,
        session.manifest_url.clone(),
        state.collab.chooser.clone(),
        state.quality_memory.clone(),
        state.config.collaborator_timeout,
    )
    .with_cached(session.resolved_quality);

    let result = match kind {
        ManifestKind::Hls => {
            let ctx = HlsContext {
                session,
                proxy_base: &state.config.base_url,
                response_url: final_url,
            };
            hls::rewrite_master(text, &ctx, &quality)
                .await
                .map(|body| (body, "application/vnd.apple.mpegurl".to_string()))
        }
        ManifestKind::Dash => {
            let ctx = DashContext {
                session,
                proxy_base: &state.config.base_url,
                response_url: final_url,
                now: chrono::Utc::now(),
            };
            dash::rewrite_mpd(text, &ctx, &quality)
                .await
                .map(|body| (body, "application/dash+xml".to_string()))
        }
        ManifestKind::None => Err(ProxyError::Parse("session kind still undecided".into())),
    };

    match result {
        Ok((body, content_type)) => {
            if let Some(resolved) = quality.take_resolution() {
                state.session.update(|s| {
                    s.resolved_quality = Some(resolved);
                    s.quality_asked = true;
                });
            }
            RewriteOutcome::Rewritten { body, content_type }
        }
        Err(ProxyError::Cancelled) => RewriteOutcome::Cancelled,
        Err(error) => RewriteOutcome::Failed(error),
    }
}

/// Master rewrite reached via a non-manifest URL (rare, but group
/// playlists can nest) — same machinery, same session state.
async fn master_rewrite(
    state: &AppState,
    session: &Session,
    text: &str,
    ctx: &HlsContext<'_>,
) -> crate::error::Result<String> {
    let policy = session.quality.unwrap_or(state.config.quality);
    let quality = QualityContext::new(
        policy,
        session.manifest_url.clone(),
        state.collab.chooser.clone(),
        state.quality_memory.clone(),
        state.config.collaborator_timeout,
    )
    .with_cached(session.resolved_quality);
    let body = hls::rewrite_master(text, ctx, &quality).await?;
    if let Some(resolved) = quality.take_resolution() {
        state.session.update(|s| {
            s.resolved_quality = Some(resolved);
            s.quality_asked = true;
        });
    }
    Ok(body)
}

/// Transport-level failure: the manifest URL degrades to a synthetic
/// manifest; anything else propagates as an error response.
async fn fetch_failure(
    state: &AppState,
    target: &str,
    error: ProxyError,
    start: Instant,
) -> Response {
    metrics::record_upstream_error();
    metrics::record_duration("error", start);
    let session = state.session.snapshot();
    let is_manifest = session.as_ref().is_some_and(|s| s.manifest_url == target);
    if is_manifest {
        warn!("Manifest fetch failed: {}", error);
        let kind = session.map(|s| s.kind).unwrap_or(ManifestKind::None);
        return manifest_fallback(state, kind, false);
    }
    error.into_response()
}

/// Serve the HTTP-200 synthetic manifest. Cancellation goes straight to
/// the stop sentinel; repeated hard failures escalate to stop once the
/// consecutive-error threshold is reached.
fn manifest_fallback(state: &AppState, kind: ManifestKind, cancelled: bool) -> Response {
    let stop = if cancelled {
        true
    } else {
        let failures = state.session.record_failure();
        if failures >= state.config.error_threshold {
            warn!("{} consecutive playback failures; forcing stop", failures);
            true
        } else {
            false
        }
    };
    metrics::record_fallback(if stop { "stop" } else { "next" });
    let (body, content_type) = sentinel::fallback_manifest(kind, &state.config.base_url, stop);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        body,
    )
        .into_response()
}

fn respond_rewritten(
    status: StatusCode,
    mut headers: HeaderMap,
    body: String,
    content_type: &str,
) -> Response {
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    (status, headers, Body::from(body)).into_response()
}

fn copy_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.iter() {
        if STRIP_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.insert(name.clone(), value.clone());
    }
    headers
}
