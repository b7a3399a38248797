//! HLS playlist rewriting.
//!
//! Master playlists get the full treatment: rendition filtering, Atmos
//! relabeling, central default-language reassignment, variant dedup,
//! quality selection, and URI rewriting. Media playlists are a line copy
//! with beacon-redirect resolution and incompatible key-line stripping.
//!
//! Rewriting is line-oriented on purpose: a structural parse-serialize
//! round-trip loses unknown tags and attribute quoting, and the output must
//! stay byte-faithful for everything the rewriter doesn't touch. m3u8-rs is
//! still used up front to reject playlists a real parser would choke on.

pub mod tags;

use crate::error::{ProxyError, Result};
use crate::language;
use crate::quality::{Candidate, QualityContext, Resolved};
use crate::session::Session;
use tags::{AttrList, split_tag};
use tracing::debug;
use url::Url;

/// The Apple sample-AES key-delivery KEYFORMAT, incompatible with the
/// player's decryptor; key lines carrying it are removed.
const SAMPLE_AES_KEYFORMAT: &str = "com.apple.streamingkeydelivery";

/// Query parameters treated as beacon redirects in media playlists.
const REDIRECT_PARAMS: &[&str] = &["redirect", "redirect_url"];

/// Audio-description characteristic marker.
const DESCRIBES_VIDEO: &str = "public.accessibility.describes-video";

pub struct HlsContext<'a> {
    pub session: &'a Session,
    /// The proxy's own base URL.
    pub proxy_base: &'a str,
    /// Final (post-redirect) URL the playlist was fetched from.
    pub response_url: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum MediaKind {
    Audio,
    Subtitles,
    Other,
}

/// One processed playlist line. `StreamInf` owns its following URI line.
enum Line {
    Media { attrs: AttrList, kind: MediaKind },
    StreamInf { attrs: AttrList, uri: String },
    Verbatim(String),
    Dropped,
}

/// Rewrite a master playlist.
pub async fn rewrite_master(
    content: &str,
    ctx: &HlsContext<'_>,
    quality: &QualityContext,
) -> Result<String> {
    validate(content)?;

    let mut lines = classify_lines(content);

    let session = ctx.session;
    let mut audio_langs: Vec<String> = Vec::new();
    let mut subtitle_langs: Vec<String> = Vec::new();
    let mut implied_defaults: Vec<String> = Vec::new();

    // Rendition filtering + Atmos relabeling + DEFAULT clearing.
    for line in &mut lines {
        let Line::Media { attrs, kind } = line else {
            continue;
        };
        let lang = attrs.get("LANGUAGE").unwrap_or("").to_string();
        match kind {
            MediaKind::Audio => {
                if !language::matches_whitelist(&lang, &session.audio_whitelist) {
                    *line = Line::Dropped;
                    continue;
                }
                if !session.audio_description
                    && attrs.get("CHARACTERISTICS").is_some_and(|c| c.contains(DESCRIBES_VIDEO))
                {
                    *line = Line::Dropped;
                    continue;
                }
                if let Some(channels) = attrs.get("CHANNELS").map(str::to_string) {
                    if channels.contains("JOC") {
                        let name = attrs.get("NAME").unwrap_or("").to_string();
                        attrs.set_quoted("NAME", &format!("{name} Atmos"));
                        let base = channels.split('/').next().unwrap_or(&channels).to_string();
                        attrs.set("CHANNELS", &base);
                    }
                }
            }
            MediaKind::Subtitles => {
                if !language::matches_whitelist(&lang, &session.subtitle_whitelist) {
                    *line = Line::Dropped;
                    continue;
                }
                let forced = attrs.get("FORCED").is_some_and(|f| f.eq_ignore_ascii_case("YES"));
                if forced && !session.include_forced {
                    *line = Line::Dropped;
                    continue;
                }
                if !forced && !session.include_non_forced {
                    *line = Line::Dropped;
                    continue;
                }
            }
            MediaKind::Other => {}
        }

        // Survivors contribute to default resolution; origin-declared
        // defaults are cleared and reassigned centrally below.
        if attrs.get("DEFAULT").is_some_and(|d| d.eq_ignore_ascii_case("YES")) {
            if !lang.is_empty() {
                implied_defaults.push(lang.clone());
            }
            attrs.set("DEFAULT", "NO");
        }
        if !lang.is_empty() {
            match kind {
                MediaKind::Audio => audio_langs.push(lang),
                MediaKind::Subtitles => subtitle_langs.push(lang),
                MediaKind::Other => {}
            }
        }
    }

    // Variant dedup: identical URI plus identical attribute line.
    let mut seen_pairs: Vec<(String, String)> = Vec::new();
    for line in &mut lines {
        let Line::StreamInf { attrs, uri } = line else {
            continue;
        };
        let key = (uri.clone(), attrs.to_line("#EXT-X-STREAM-INF"));
        if seen_pairs.contains(&key) {
            *line = Line::Dropped;
        } else {
            seen_pairs.push(key);
        }
    }

    // Central default reassignment, audio and subtitles independently.
    let original = session
        .original_language
        .clone()
        .or_else(|| implied_defaults.first().cloned());
    assign_default(
        &mut lines,
        MediaKind::Audio,
        &session.default_languages,
        original.as_deref(),
        &audio_langs,
    );
    assign_default(
        &mut lines,
        MediaKind::Subtitles,
        &session.default_subtitles,
        original.as_deref(),
        &subtitle_langs,
    );

    // Quality selection over the surviving variant pairs.
    let candidates: Vec<Candidate> = lines
        .iter()
        .filter_map(|line| match line {
            Line::StreamInf { attrs, .. } => Some(attrs),
            _ => None,
        })
        .enumerate()
        .map(|(position, attrs)| Candidate {
            position,
            bandwidth: attrs.get("BANDWIDTH").and_then(|b| b.parse().ok()).unwrap_or(0),
            resolution: attrs.get("RESOLUTION").and_then(parse_resolution),
            frame_rate: attrs.get("FRAME-RATE").and_then(|f| f.parse().ok()),
            codecs: attrs
                .get("CODECS")
                .map(|c| c.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
        })
        .collect();

    if let Resolved::Pick(selected) = quality.select(&candidates).await? {
        let mut position = 0usize;
        for line in &mut lines {
            if matches!(line, Line::StreamInf { .. }) {
                if position != selected {
                    *line = Line::Dropped;
                }
                position += 1;
            }
        }
        debug!("Quality selection kept variant {}", selected);
    }

    if session.remove_framerate {
        for line in &mut lines {
            if let Line::StreamInf { attrs, .. } = line {
                attrs.remove("FRAME-RATE");
            }
        }
    }

    let serialized = serialize_lines(lines);
    Ok(rewrite_urls(&serialized, ctx))
}

/// Rewrite a media (sub) playlist.
pub fn rewrite_media(content: &str, ctx: &HlsContext<'_>) -> Result<String> {
    validate(content)?;

    let mut output = String::with_capacity(content.len() + 512);
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("#EXT-X-KEY")
            && trimmed.contains(&format!("KEYFORMAT=\"{SAMPLE_AES_KEYFORMAT}\""))
        {
            debug!("Stripping sample-AES key line");
            continue;
        }
        if !trimmed.starts_with('#') && !trimmed.is_empty() {
            if let Some(target) = beacon_redirect_target(trimmed) {
                debug!("Resolved beacon redirect to {}", target);
                output.push_str(&target);
                output.push('\n');
                continue;
            }
        }
        output.push_str(line);
        output.push('\n');
    }

    Ok(rewrite_urls(&output, ctx))
}

/// Reject content no HLS parser would accept before investing in a rewrite.
fn validate(content: &str) -> Result<()> {
    if !content.trim_start_matches('\u{feff}').trim_start().starts_with("#EXTM3U") {
        return Err(ProxyError::Parse("playlist missing #EXTM3U header".into()));
    }
    m3u8_rs::parse_playlist_res(content.as_bytes())
        .map_err(|e| ProxyError::Parse(format!("playlist rejected: {e:?}")))?;
    Ok(())
}

fn classify_lines(content: &str) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut pending_inf: Option<AttrList> = None;

    for raw in content.lines() {
        let line = raw.trim_end();
        if let Some(attrs) = pending_inf.take() {
            if line.starts_with('#') || line.trim().is_empty() {
                // Variant URI not adjacent; keep scanning for it.
                pending_inf = Some(attrs);
                lines.push(Line::Verbatim(line.to_string()));
                continue;
            }
            lines.push(Line::StreamInf { attrs, uri: line.trim().to_string() });
            continue;
        }

        match split_tag(line) {
            Some(("#EXT-X-MEDIA", attr_text)) => {
                let attrs = AttrList::parse(attr_text);
                let kind = match attrs.get("TYPE") {
                    Some(t) if t.eq_ignore_ascii_case("AUDIO") => MediaKind::Audio,
                    Some(t) if t.eq_ignore_ascii_case("SUBTITLES") => MediaKind::Subtitles,
                    _ => MediaKind::Other,
                };
                lines.push(Line::Media { attrs, kind });
            }
            Some(("#EXT-X-STREAM-INF", attr_text)) => {
                pending_inf = Some(AttrList::parse(attr_text));
            }
            _ => lines.push(Line::Verbatim(line.to_string())),
        }
    }

    lines
}

/// Set `DEFAULT=YES` on the first surviving entry matching the resolved
/// default language; everyone else stays `NO`.
fn assign_default(
    lines: &mut [Line],
    target_kind: MediaKind,
    configured: &[String],
    original: Option<&str>,
    available: &[String],
) {
    let Some(default_lang) = language::resolve_default(configured, original, available) else {
        return;
    };
    let normalized = language::normalize(&default_lang);
    for line in lines.iter_mut() {
        if let Line::Media { attrs, kind } = line {
            if *kind == target_kind
                && attrs
                    .get("LANGUAGE")
                    .is_some_and(|l| language::normalize(l) == normalized)
            {
                attrs.set("DEFAULT", "YES");
                return;
            }
        }
    }
}

fn serialize_lines(lines: Vec<Line>) -> String {
    let mut output = String::new();
    for line in lines {
        match line {
            Line::Media { attrs, .. } => {
                output.push_str(&attrs.to_line("#EXT-X-MEDIA"));
                output.push('\n');
            }
            Line::StreamInf { attrs, uri } => {
                output.push_str(&attrs.to_line("#EXT-X-STREAM-INF"));
                output.push('\n');
                output.push_str(&uri);
                output.push('\n');
            }
            Line::Verbatim(text) => {
                output.push_str(&text);
                output.push('\n');
            }
            Line::Dropped => {}
        }
    }
    output
}

fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once(['x', 'X'])?;
    Some((w.parse().ok()?, h.parse().ok()?))
}

/// Extract the decoded redirect target from a beacon URI, if present.
fn beacon_redirect_target(uri: &str) -> Option<String> {
    let parsed = Url::parse(uri).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| REDIRECT_PARAMS.contains(&k.as_ref()))
        .map(|(_, v)| v.into_owned())
        .filter(|v| v.starts_with("http://") || v.starts_with("https://"))
}

/// Route a single URI back through the proxy.
///
/// Absolute URLs are prefixed with the proxy base; rooted paths are first
/// resolved against the fetched playlist's own origin. Relative URIs are
/// untouched — they resolve correctly through the proxied playlist URL.
fn proxy_uri(value: &str, ctx: &HlsContext<'_>) -> String {
    let base = ctx.proxy_base.trim_end_matches('/');
    if value.starts_with("http://") || value.starts_with("https://") {
        return format!("{base}/{value}");
    }
    if value.starts_with('/') {
        if let Ok(url) = Url::parse(ctx.response_url) {
            let origin = url.origin().ascii_serialization();
            return format!("{base}/{origin}{value}");
        }
    }
    value.to_string()
}

/// Shared URL rewriting over serialized playlist text: URI lines and every
/// `URI="..."` attribute value loop back through the proxy.
fn rewrite_urls(text: &str, ctx: &HlsContext<'_>) -> String {
    let mut output = String::with_capacity(text.len() + 512);
    for line in text.lines() {
        if line.starts_with('#') {
            output.push_str(&rewrite_uri_attributes(line, ctx));
        } else if !line.trim().is_empty() {
            output.push_str(&proxy_uri(line.trim(), ctx));
        } else {
            output.push_str(line);
        }
        output.push('\n');
    }
    output
}

/// Rewrite every `URI="..."` value in a tag line.
fn rewrite_uri_attributes(line: &str, ctx: &HlsContext<'_>) -> String {
    let mut result = String::with_capacity(line.len());
    let mut rest = line;
    while let Some(pos) = rest.find("URI=\"") {
        let value_start = pos + 5;
        let Some(close) = rest[value_start..].find('"') else {
            break;
        };
        let value = &rest[value_start..value_start + close];
        result.push_str(&rest[..value_start]);
        result.push_str(&proxy_uri(value, ctx));
        result.push('"');
        rest = &rest[value_start + close + 1..];
    }
    result.push_str(rest);
    result
}
