//! Collaborator interfaces.
//!
//! The proxy does not know which streaming service it serves, how to draw a
//! dialog, or how to reinstall a DRM component. Those concerns live behind
//! these traits; `main.rs` wires inert defaults and an embedding application
//! injects real implementations through [`Collaborators`].

use async_trait::async_trait;
use axum::http::HeaderMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Resolves an opaque reference (e.g. `plugin://...`) into a fetchable URL
/// plus extra request headers.
#[async_trait]
pub trait ReferenceResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Option<ResolvedReference>;
}

#[derive(Debug, Clone)]
pub struct ResolvedReference {
    pub url: String,
    pub headers: HeaderMap,
}

/// Interactive quality chooser. `None` means the dialog was dismissed.
#[async_trait]
pub trait QualityChooser: Send + Sync {
    async fn choose(&self, options: &[String], preselected: Option<usize>) -> Option<usize>;
}

/// Out-of-band playback notifications (the HTTP response itself stays a
/// valid 200 manifest; the user learns of failures through here).
pub trait PlaybackNotifier: Send + Sync {
    fn playback_failed(&self);
    fn playback_stopped(&self);
}

/// DRM component maintenance, consulted when license acquisition returns 406.
#[async_trait]
pub trait DrmAgent: Send + Sync {
    /// Ask the user and, if confirmed, reinstall the DRM component.
    async fn reinstall(&self);
}

/// External rewrite plugin: receives the path of a temp file holding the
/// response body, may rewrite it in place, and returns headers to merge.
#[async_trait]
pub trait RewritePlugin: Send + Sync {
    async fn rewrite(&self, plugin_url: &str, body_path: &Path) -> Option<HeaderMap>;
}

/// The full collaborator set shared through [`crate::server::state::AppState`].
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn ReferenceResolver>,
    pub chooser: Arc<dyn QualityChooser>,
    pub notifier: Arc<dyn PlaybackNotifier>,
    pub drm: Arc<dyn DrmAgent>,
    pub plugin: Arc<dyn RewritePlugin>,
}

impl Collaborators {
    /// Inert defaults: nothing resolves, the chooser picks the preselected
    /// (or best) entry, notifications only log.
    pub fn inert() -> Self {
        Self {
            resolver: Arc::new(NoResolver),
            chooser: Arc::new(AutoChooser),
            notifier: Arc::new(LogNotifier),
            drm: Arc::new(LogDrmAgent),
            plugin: Arc::new(NoPlugin),
        }
    }
}

struct NoResolver;

#[async_trait]
impl ReferenceResolver for NoResolver {
    async fn resolve(&self, _reference: &str) -> Option<ResolvedReference> {
        None
    }
}

/// Headless chooser: keeps the remembered choice, falls back to the first
/// (best) entry. Never blocks on a dialog.
struct AutoChooser;

#[async_trait]
impl QualityChooser for AutoChooser {
    async fn choose(&self, _options: &[String], preselected: Option<usize>) -> Option<usize> {
        Some(preselected.unwrap_or(0))
    }
}

struct LogNotifier;

impl PlaybackNotifier for LogNotifier {
    fn playback_failed(&self) {
        info!("Playback failed");
    }
    fn playback_stopped(&self) {
        info!("Playback stopped");
    }
}

struct LogDrmAgent;

#[async_trait]
impl DrmAgent for LogDrmAgent {
    async fn reinstall(&self) {
        info!("DRM component reinstall requested");
    }
}

struct NoPlugin;

#[async_trait]
impl RewritePlugin for NoPlugin {
    async fn rewrite(&self, _plugin_url: &str, _body_path: &Path) -> Option<HeaderMap> {
        None
    }
}
