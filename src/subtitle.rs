//! Subtitle format detection and WebVTT conversion.
//!
//! Detection is by content sniffing, never by file extension — origins
//! routinely serve TTML under `.xml`, `.dfxp`, or no extension at all.

use crate::error::{ProxyError, Result};
use quick_xml::Reader;
use quick_xml::events::Event;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleFormat {
    WebVtt,
    Srt,
    /// TTML / DFXP (`<tt>` document).
    Ttml,
}

/// Sniff the subtitle format from the body text.
pub fn sniff(content: &str) -> Option<SubtitleFormat> {
    let trimmed = content.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with("WEBVTT") {
        return Some(SubtitleFormat::WebVtt);
    }
    if trimmed.starts_with('<') && (trimmed.contains("<tt") || trimmed.contains(":tt")) {
        return Some(SubtitleFormat::Ttml);
    }
    // SRT: an index line followed by a comma-decimal timing line.
    let mut lines = trimmed.lines().filter(|l| !l.trim().is_empty());
    if let (Some(first), Some(second)) = (lines.next(), lines.next()) {
        if first.trim().parse::<u64>().is_ok() && second.contains("-->") {
            return Some(SubtitleFormat::Srt);
        }
    }
    None
}

/// Convert a recognized subtitle body to WebVTT.
///
/// Returns `Err(Parse)` when the format is not recognized; the middleware
/// layer passes the body through unchanged in that case.
pub fn to_webvtt(content: &str) -> Result<String> {
    match sniff(content) {
        Some(SubtitleFormat::WebVtt) => Ok(content.to_string()),
        Some(SubtitleFormat::Srt) => Ok(srt_to_vtt(content)),
        Some(SubtitleFormat::Ttml) => ttml_to_vtt(content),
        None => Err(ProxyError::Parse("unrecognized subtitle format".into())),
    }
}

fn srt_timing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d{2}:\d{2}:\d{2}),(\d{3})").expect("static regex"))
}

/// SRT → VTT: prepend the magic header and switch comma decimals to dots.
/// Numeric cue indexes are legal VTT cue identifiers, so they stay.
fn srt_to_vtt(content: &str) -> String {
    let body = srt_timing_re().replace_all(content, "$1.$2");
    format!("WEBVTT\n\n{}", body.trim_start_matches('\u{feff}'))
}

/// TTML `begin`/`end` attribute → seconds.
///
/// Supports clock times (`HH:MM:SS.mmm`, `HH:MM:SS`) and offset times
/// (`12.5s`, `300ms`, `2m`, `1h`).
fn parse_ttml_time(value: &str) -> Option<f64> {
    let value = value.trim();
    if let Some(rest) = value.strip_suffix("ms") {
        return rest.parse::<f64>().ok().map(|v| v / 1000.0);
    }
    for (suffix, scale) in [("s", 1.0), ("m", 60.0), ("h", 3600.0)] {
        if let Some(rest) = value.strip_suffix(suffix) {
            return rest.parse::<f64>().ok().map(|v| v * scale);
        }
    }
    let parts: Vec<&str> = value.split(':').collect();
    if let [h, m, s] = parts.as_slice() {
        let h: f64 = h.parse().ok()?;
        let m: f64 = m.parse().ok()?;
        let s: f64 = s.parse().ok()?;
        return Some(h * 3600.0 + m * 60.0 + s);
    }
    None
}

fn format_vtt_time(seconds: f64) -> String {
    let total_ms = (seconds * 1000.0).round() as u64;
    let h = total_ms / 3_600_000;
    let m = (total_ms / 60_000) % 60;
    let s = (total_ms / 1000) % 60;
    let ms = total_ms % 1000;
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

/// TTML → VTT via a streaming pass over the XML events.
///
/// Collects `<p begin=".." end="..">` cues; `<br/>` becomes a line break.
/// Cues missing a usable begin/end are skipped rather than failing the
/// whole document.
fn ttml_to_vtt(content: &str) -> Result<String> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut output = String::from("WEBVTT\n");
    let mut current: Option<(f64, f64, String)> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"p" => {
                let mut begin = None;
                let mut end = None;
                for attr in e.attributes().flatten() {
                    let key = attr.key.local_name();
                    let value = String::from_utf8_lossy(&attr.value).into_owned();
                    match key.as_ref() {
                        b"begin" => begin = parse_ttml_time(&value),
                        b"end" => end = parse_ttml_time(&value),
                        _ => {}
                    }
                }
                if let (Some(b), Some(e)) = (begin, end) {
                    current = Some((b, e, String::new()));
                }
            }
            Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"br" && current.is_some() =>
            {
                if let Some((_, _, text)) = current.as_mut() {
                    text.push('\n');
                }
            }
            Ok(Event::Text(t)) => {
                if let Some((_, _, text)) = current.as_mut() {
                    let decoded = t
                        .unescape()
                        .map_err(|e| ProxyError::Parse(format!("bad TTML text: {e}")))?;
                    text.push_str(&decoded);
                }
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"p" => {
                if let Some((begin, end, text)) = current.take() {
                    let text = text.trim();
                    if !text.is_empty() {
                        output.push('\n');
                        output.push_str(&format!(
                            "{} --> {}\n{}\n",
                            format_vtt_time(begin),
                            format_vtt_time(end),
                            text
                        ));
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ProxyError::Parse(format!("bad TTML document: {e}"))),
        }
        buf.clear();
    }

    Ok(output)
}
