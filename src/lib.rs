//! manifold — a local HTTP proxy that rewrites adaptive-streaming
//! manifests and media segments on the fly.
//!
//! The proxy sits between a media player and upstream CDNs. Every playlist,
//! manifest, segment, and subtitle request loops through it; HLS and DASH
//! manifests are filtered, quality-selected, and URI-rewritten before the
//! player sees them, while segments stream through untouched.

pub mod collab;
pub mod config;
pub mod dash;
pub mod error;
pub mod hls;
pub mod language;
pub mod metrics;
pub mod middleware;
pub mod quality;
pub mod server;
pub mod session;
pub mod subtitle;
pub mod transport;
