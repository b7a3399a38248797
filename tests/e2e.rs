//! End-to-end tests against a wiremock origin.
//!
//! Each test builds the real router around real state, starts a playback
//! session the way the player-item builder would, and drives requests
//! through tower::ServiceExt::oneshot.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use manifold::collab::Collaborators;
use manifold::config::Config;
use manifold::middleware::Middleware;
use manifold::quality::QualityPolicy;
use manifold::server::build_router_with;
use manifold::server::state::AppState;
use manifold::session::{ManifestKind, Session};
use manifold::transport::dns::IpMode;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BASE: &str = "http://127.0.0.1:52104";

fn test_config() -> Config {
    Config {
        port: 0,
        base_url: BASE.to_string(),
        is_dev: true,
        audio_whitelist: vec![],
        subtitle_whitelist: vec![],
        default_languages: vec!["original".to_string()],
        default_subtitles: vec![],
        include_forced_subs: true,
        include_non_forced_subs: true,
        audio_description: true,
        remove_framerate: false,
        quality: QualityPolicy::Disabled,
        quality_history: 10,
        rewrite_threshold: 1024 * 1024,
        timeout: Duration::from_secs(5),
        verify_tls: true,
        proxy_server: None,
        client_cert: None,
        dns_rewrites: None,
        ip_mode: IpMode::PreferV4,
        error_threshold: 10,
        collaborator_timeout: Duration::from_secs(5),
        platform_android: false,
        drm_security_level: "L3".to_string(),
    }
}

fn state_with(config: Config) -> AppState {
    AppState::new(config).expect("state builds")
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(resp: axum::response::Response) -> String {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=5000000,RESOLUTION=1920x1080,CODECS=\"avc1.640028\"\n\
1080p.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=2500000,RESOLUTION=1280x720,CODECS=\"avc1.64001f\"\n\
720p.m3u8\n";

// ── HLS manifest flow ───────────────────────────────────────────────────────

#[tokio::test]
async fn hls_master_is_classified_and_rewritten() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/master.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(MASTER)
                .insert_header("content-type", "application/x-mpegURL")
                .insert_header("set-cookie", "secret=1"),
        )
        .mount(&origin)
        .await;

    let manifest_url = format!("{}/live/master.m3u8", origin.uri());
    let state = state_with(test_config());
    state.start_session(Session::new(&manifest_url), None);
    let app = build_router_with(state.clone());

    let resp = app.oneshot(get(&format!("/{manifest_url}"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(
        resp.headers().get("set-cookie").is_none(),
        "cookies never reach the player"
    );

    let text = body_text(resp).await;
    assert!(text.starts_with("#EXTM3U"));
    // Relative variant URIs stay relative; they resolve through the proxied
    // playlist URL. The playlist itself must still parse.
    assert!(m3u8_rs::parse_master_playlist_res(text.as_bytes()).is_ok());

    let session = state.session.snapshot().unwrap();
    assert_eq!(session.kind, ManifestKind::Hls);
}

#[tokio::test]
async fn quality_best_leaves_one_variant() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/master.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(MASTER)
                .insert_header("content-type", "application/x-mpegURL"),
        )
        .mount(&origin)
        .await;

    let manifest_url = format!("{}/live/master.m3u8", origin.uri());
    let mut config = test_config();
    config.quality = QualityPolicy::Best;
    let state = state_with(config);
    state.start_session(Session::new(&manifest_url), None);
    let app = build_router_with(state.clone());

    let resp = app.oneshot(get(&format!("/{manifest_url}"))).await.unwrap();
    let text = body_text(resp).await;
    assert_eq!(text.matches("#EXT-X-STREAM-INF").count(), 1);
    assert!(text.contains("1080p.m3u8"));

    // The resolution is cached on the session for live refreshes.
    let session = state.session.snapshot().unwrap();
    assert!(session.resolved_quality.is_some());
    assert!(session.quality_asked);
}

// ── Redirect handling ───────────────────────────────────────────────────────

#[tokio::test]
async fn redirects_update_session_and_rekey_middleware() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/a.m3u8"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/live/b.m3u8"))
        .mount(&origin)
        .await;
    Mock::given(method("GET"))
        .and(path("/live/b.m3u8"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/live/c.m3u8"))
        .mount(&origin)
        .await;

    let url_a = format!("{}/live/a.m3u8", origin.uri());
    let url_b = format!("{}/live/b.m3u8", origin.uri());
    let url_c = format!("{}/live/c.m3u8", origin.uri());

    let state = state_with(test_config());
    let mut session = Session::new(&url_a);
    session
        .middleware
        .insert(url_a.clone(), Middleware::SubtitleConvert);
    state.start_session(session, None);
    let app = build_router_with(state.clone());

    // First redirect.
    let resp = app
        .clone()
        .oneshot(get(&format!("/{url_a}")))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);
    let location = resp.headers().get("location").unwrap().to_str().unwrap();
    assert_eq!(location, format!("{BASE}/{url_b}"));
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty(), "redirect responses carry no body");

    let session = state.session.snapshot().unwrap();
    assert_eq!(session.manifest_url, url_b);
    assert!(session.middleware.contains_key(&url_b));
    assert!(session.redirecting);

    // Second redirect in a row: state tracks the latest location.
    let resp = app.oneshot(get(&format!("/{url_b}"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::FOUND);

    let session = state.session.snapshot().unwrap();
    assert_eq!(session.manifest_url, url_c);
    assert!(
        session.middleware.contains_key(&url_c),
        "middleware keyed to the pre-redirect URL must be found under the final URL"
    );
}

// ── Manifest fallback ───────────────────────────────────────────────────────

#[tokio::test]
async fn manifest_parse_error_returns_200_fallback() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/bad.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("this is not a playlist")
                .insert_header("content-type", "application/x-mpegURL"),
        )
        .mount(&origin)
        .await;

    let manifest_url = format!("{}/live/bad.m3u8", origin.uri());
    let state = state_with(test_config());
    state.start_session(Session::new(&manifest_url), None);
    let app = build_router_with(state);

    let resp = app.oneshot(get(&format!("/{manifest_url}"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK, "fallback is never a 5xx");

    let text = body_text(resp).await;
    assert!(
        m3u8_rs::parse_master_playlist_res(text.as_bytes()).is_ok(),
        "fallback must be a parseable master playlist: {text}"
    );
    assert!(text.contains("/.sentinel/next.m3u8"));
}

#[tokio::test]
async fn repeated_failures_escalate_to_stop() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/bad.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("still not a playlist")
                .insert_header("content-type", "application/x-mpegURL"),
        )
        .mount(&origin)
        .await;

    let manifest_url = format!("{}/live/bad.m3u8", origin.uri());
    let mut config = test_config();
    config.error_threshold = 2;
    let state = state_with(config);
    state.start_session(Session::new(&manifest_url), None);
    let app = build_router_with(state);

    let first = app
        .clone()
        .oneshot(get(&format!("/{manifest_url}")))
        .await
        .unwrap();
    assert!(body_text(first).await.contains("/.sentinel/next.m3u8"));

    let second = app.oneshot(get(&format!("/{manifest_url}"))).await.unwrap();
    assert!(
        body_text(second).await.contains("/.sentinel/stop.m3u8"),
        "reaching the threshold forces a hard stop"
    );
}

// ── Segment handling ────────────────────────────────────────────────────────

#[tokio::test]
async fn segment_errors_pass_through_without_fallback() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/live/seg1.ts"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&origin)
        .await;

    let state = state_with(test_config());
    state.start_session(
        Session::new(format!("{}/live/master.m3u8", origin.uri())),
        None,
    );
    let app = build_router_with(state);

    let resp = app
        .oneshot(get(&format!("/{}/live/seg1.ts", origin.uri())))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn threshold_boundary_bypasses_rewriting() {
    let origin = MockServer::start().await;
    let media = format!(
        "#EXTM3U\n#EXT-X-TARGETDURATION:6\n#EXTINF:6.0,\n{}/live/seg1.ts\n",
        origin.uri()
    );
    Mock::given(method("GET"))
        .and(path("/live/chunks.m3u8"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(media.clone())
                .insert_header("content-type", "application/vnd.apple.mpegurl"),
        )
        .mount(&origin)
        .await;

    let manifest_url = format!("{}/live/master.m3u8", origin.uri());
    let media_url = format!("{}/live/chunks.m3u8", origin.uri());

    // Content-length exactly at the threshold: NOT rewritten.
    let mut config = test_config();
    config.rewrite_threshold = media.len();
    let state = state_with(config);
    let mut session = Session::new(&manifest_url);
    session.kind = ManifestKind::Hls;
    state.start_session(session, None);
    let app = build_router_with(state);

    let resp = app.oneshot(get(&format!("/{media_url}"))).await.unwrap();
    let text = body_text(resp).await;
    assert!(
        !text.contains(BASE),
        "at-threshold responses stream through unchanged: {text}"
    );

    // One byte under the threshold: rewritten.
    let mut config = test_config();
    config.rewrite_threshold = media.len() + 1;
    let state = state_with(config);
    let mut session = Session::new(&manifest_url);
    session.kind = ManifestKind::Hls;
    state.start_session(session, None);
    let app = build_router_with(state);

    let resp = app.oneshot(get(&format!("/{media_url}"))).await.unwrap();
    let text = body_text(resp).await;
    assert!(
        text.contains(&format!("{BASE}/{}/live/seg1.ts", origin.uri())),
        "under-threshold playlists are rewritten: {text}"
    );
}

#[tokio::test]
async fn head_requests_pass_through_without_body() {
    let origin = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/live/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).insert_header("content-type", "application/x-mpegURL"))
        .mount(&origin)
        .await;

    let manifest_url = format!("{}/live/master.m3u8", origin.uri());
    let state = state_with(test_config());
    state.start_session(Session::new(&manifest_url), None);
    let app = build_router_with(state);

    let req = Request::builder()
        .method("HEAD")
        .uri(format!("/{manifest_url}"))
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert!(body.is_empty());
}

// ── DASH manifest flow ──────────────────────────────────────────────────────

#[tokio::test]
async fn dash_manifest_is_rewritten() {
    let origin = MockServer::start().await;
    let mpd = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" publishTime="2026-01-01T00:00:00Z" mediaPresentationDuration="PT60S">
  <Period id="p0">
    <BaseURL>https://cdn.example.com/vod/</BaseURL>
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <Representation id="v1" bandwidth="1000000" width="1280" height="720"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    Mock::given(method("GET"))
        .and(path("/vod/manifest.mpd"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(mpd)
                .insert_header("content-type", "application/dash+xml"),
        )
        .mount(&origin)
        .await;

    let manifest_url = format!("{}/vod/manifest.mpd", origin.uri());
    let state = state_with(test_config());
    state.start_session(Session::new(&manifest_url), None);
    let app = build_router_with(state.clone());

    let resp = app.oneshot(get(&format!("/{manifest_url}"))).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "application/dash+xml"
    );

    let text = body_text(resp).await;
    assert!(!text.contains("publishTime"));
    assert!(text.contains(&format!("{BASE}/https://cdn.example.com/vod/")));
    dash_mpd::parse(&text).expect("rewritten MPD parses");
    assert_eq!(state.session.snapshot().unwrap().kind, ManifestKind::Dash);
}

// ── Path substitutions + middleware ─────────────────────────────────────────

#[tokio::test]
async fn path_substitution_serves_converted_subtitles() {
    let origin = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/subs/en.srt"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("1\n00:00:01,000 --> 00:00:02,000\nhello\n")
                .insert_header("content-type", "text/plain"),
        )
        .mount(&origin)
        .await;

    let subtitle_url = format!("{}/subs/en.srt", origin.uri());
    let state = state_with(test_config());
    let mut session = Session::new(format!("{}/live/master.m3u8", origin.uri()));
    session
        .path_substitutions
        .insert("en.srt".to_string(), subtitle_url.clone());
    session
        .middleware
        .insert(subtitle_url, Middleware::SubtitleConvert);
    state.start_session(session, None);
    let app = build_router_with(state);

    let resp = app.oneshot(get("/en.srt")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers().get("content-type").unwrap().to_str().unwrap(),
        "text/vtt"
    );
    let text = body_text(resp).await;
    assert!(text.starts_with("WEBVTT"));
    assert!(text.contains("00:00:01.000 --> 00:00:02.000"));
}

// ── License acquisition ─────────────────────────────────────────────────────

struct CountingDrmAgent(AtomicUsize);

#[async_trait]
impl manifold::collab::DrmAgent for CountingDrmAgent {
    async fn reinstall(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn license_406_invokes_drm_agent_once() {
    let origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/license"))
        .respond_with(ResponseTemplate::new(406).set_body_string("upgrade required"))
        .mount(&origin)
        .await;

    let license_url = format!("{}/license", origin.uri());
    let agent = Arc::new(CountingDrmAgent(AtomicUsize::new(0)));
    let mut collab = Collaborators::inert();
    collab.drm = agent.clone();

    let state = AppState::with_collaborators(test_config(), collab).unwrap();
    let mut session = Session::new(format!("{}/live/master.m3u8", origin.uri()));
    session.license_url = Some(license_url.clone());
    state.start_session(session, None);
    let app = build_router_with(state);

    let req = Request::builder()
        .method("POST")
        .uri(format!("/{license_url}"))
        .body(Body::from("challenge-bytes"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE, "response is unchanged");
    assert_eq!(body_text(resp).await, "upgrade required");
    assert_eq!(agent.0.load(Ordering::SeqCst), 1, "agent invoked exactly once");
}
