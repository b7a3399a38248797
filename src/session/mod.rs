//! Per-playback session state.
//!
//! One session is active at a time, created when the player-item builder
//! hands over a descriptor and consulted by every proxied request. Segment
//! fetches may run concurrently with the manifest rewrite, so readers take
//! cheap snapshots and must tolerate `ManifestKind::None` (partially
//! initialized session) by falling back to passthrough.

use crate::middleware::Middleware;
use crate::quality::{QualityPolicy, Resolved};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Manifest family, decided once per session from the first manifest
/// response and authoritative afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManifestKind {
    #[default]
    None,
    Hls,
    Dash,
}

impl ManifestKind {
    /// Classify from content type and/or path extension.
    pub fn sniff(content_type: Option<&str>, url: &str) -> Self {
        let ct = content_type.unwrap_or("").to_ascii_lowercase();
        let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
        if ct.contains("mpegurl") || path.ends_with(".m3u8") {
            Self::Hls
        } else if ct.contains("dash+xml") || path.ends_with(".mpd") {
            Self::Dash
        } else {
            Self::None
        }
    }

    pub fn content_type(self) -> Option<&'static str> {
        match self {
            Self::Hls => Some("application/vnd.apple.mpegurl"),
            Self::Dash => Some("application/dash+xml"),
            Self::None => None,
        }
    }
}

/// Caller-supplied subtitle track served through the proxy via a path
/// substitution instead of an origin fetch.
#[derive(Debug, Clone)]
pub struct ExternalSubtitle {
    /// Short local path, e.g. `en.srt`; also the path-substitution key.
    pub path: String,
    pub language: String,
    pub label: Option<String>,
    pub forced: bool,
    /// Hearing-impaired (CC) track.
    pub impaired: bool,
}

/// The session descriptor plus mutable per-playback state.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: String,
    pub manifest_url: String,
    pub license_url: Option<String>,
    pub kind: ManifestKind,

    /// Per-session quality policy override (otherwise config applies).
    pub quality: Option<QualityPolicy>,
    /// Set once the interactive chooser has run for this session.
    pub quality_asked: bool,
    /// Cached selection so live playlist refreshes never re-prompt.
    pub resolved_quality: Option<Resolved>,

    // Filtering policy snapshot, taken when playback starts.
    pub audio_whitelist: Vec<String>,
    pub subtitle_whitelist: Vec<String>,
    pub default_languages: Vec<String>,
    pub default_subtitles: Vec<String>,
    pub include_forced: bool,
    pub include_non_forced: bool,
    pub audio_description: bool,
    pub original_language: Option<String>,
    pub remove_framerate: bool,

    /// DRM key-id override written into `cenc:default_KID`.
    pub default_kid: Option<String>,

    /// Middleware per URL, keyed by the *current* (post-redirect) URL.
    pub middleware: HashMap<String, Middleware>,
    /// Short local path → full origin URL.
    pub path_substitutions: HashMap<String, String>,
    /// External subtitle tracks to inject into the manifest.
    pub subtitles: Vec<ExternalSubtitle>,

    /// True only while one redirect response is being handled; controls
    /// referer forwarding and disables rewriting for the cycle.
    pub redirecting: bool,
}

impl Session {
    pub fn new(manifest_url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            manifest_url: manifest_url.into(),
            include_forced: true,
            include_non_forced: true,
            audio_description: true,
            ..Default::default()
        }
    }

    /// Rewire every piece of session state that still references `old_url`
    /// after the origin redirected it to `new_url`.
    pub fn on_redirect(&mut self, old_url: &str, new_url: &str) {
        if self.manifest_url == old_url {
            debug!("Manifest URL moved: {} -> {}", old_url, new_url);
            self.manifest_url = new_url.to_string();
        }
        if self.license_url.as_deref() == Some(old_url) {
            self.license_url = Some(new_url.to_string());
        }
        if let Some(mw) = self.middleware.remove(old_url) {
            self.middleware.insert(new_url.to_string(), mw);
        }
    }
}

/// Shared handle to the (single) active session.
///
/// The consecutive-error counter lives outside the lock so failure paths
/// never contend with readers.
#[derive(Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<Option<Session>>>,
    failures: Arc<AtomicU32>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new playback session, replacing any previous one. The id is
    /// regenerated even if the caller filled one in.
    pub fn start(&self, mut session: Session) -> String {
        session.id = Uuid::new_v4().to_string();
        let id = session.id.clone();
        info!("Session {} started for {}", id, session.manifest_url);
        *self.inner.write().unwrap_or_else(|p| p.into_inner()) = Some(session);
        self.failures.store(0, Ordering::SeqCst);
        id
    }

    pub fn end(&self) {
        if let Some(session) = self.inner.write().unwrap_or_else(|p| p.into_inner()).take() {
            info!("Session {} ended", session.id);
        }
    }

    /// Cheap read snapshot; `None` when no playback is active.
    pub fn snapshot(&self) -> Option<Session> {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Mutate the active session in place. Returns false when none exists.
    pub fn update(&self, f: impl FnOnce(&mut Session)) -> bool {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        match guard.as_mut() {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    /// Record one playback failure; returns the new consecutive count.
    pub fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_failures(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}
