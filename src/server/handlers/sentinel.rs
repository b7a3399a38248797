//! Fixed sentinel endpoints, served without any upstream fetch.
//!
//! Players hard-fail a session on a non-200 manifest, so terminal playback
//! states are signaled *in band*: a one-segment VOD playlist whose single
//! segment is a minimal valid transport stream. Two playlist paths exist
//! because the player-side handling differs — stop ends playback for good,
//! next lets the player try the following item.

use crate::server::state::AppState;
use crate::session::ManifestKind;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::sync::OnceLock;
use tracing::info;

pub const STOP_PLAYLIST_PATH: &str = "/.sentinel/stop.m3u8";
pub const NEXT_PLAYLIST_PATH: &str = "/.sentinel/next.m3u8";
pub const EMPTY_TS_PATH: &str = "/.sentinel/empty.ts";

const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// One-segment VOD playlist pointing at the sentinel segment.
fn sentinel_playlist(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:1\n#EXT-X-MEDIA-SEQUENCE:0\n\
         #EXTINF:1.0,\n{base}{EMPTY_TS_PATH}\n#EXT-X-ENDLIST\n"
    )
}

/// Synthetic manifest served with HTTP 200 when the real manifest could not
/// be fetched or rewritten. `stop` picks the hard-stop sentinel; otherwise
/// the player is steered to skip to the next item.
pub fn fallback_manifest(kind: ManifestKind, base_url: &str, stop: bool) -> (String, &'static str) {
    let base = base_url.trim_end_matches('/');
    let path = if stop { STOP_PLAYLIST_PATH } else { NEXT_PLAYLIST_PATH };
    match kind {
        ManifestKind::Dash => {
            let body = format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT1S" profiles="urn:mpeg:dash:profile:isoff-main:2011">
  <Period id="p0">
    <AdaptationSet contentType="video" mimeType="video/mp2t">
      <Representation id="sentinel" bandwidth="1">
        <BaseURL>{base}{EMPTY_TS_PATH}</BaseURL>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#
            );
            (body, "application/dash+xml")
        }
        // HLS covers the undecided case too: any player that got this far
        // speaks HLS enough to read a one-variant playlist.
        _ => {
            let body = format!(
                "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-STREAM-INF:BANDWIDTH=1\n{base}{path}\n"
            );
            (body, HLS_CONTENT_TYPE)
        }
    }
}

pub async fn stop_playlist(State(state): State<AppState>) -> Response {
    info!("Serving stop sentinel");
    state.collab.notifier.playback_stopped();
    playlist_response(&state)
}

pub async fn next_playlist(State(state): State<AppState>) -> Response {
    info!("Serving next sentinel");
    state.collab.notifier.playback_failed();
    playlist_response(&state)
}

fn playlist_response(state: &AppState) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, HLS_CONTENT_TYPE)],
        sentinel_playlist(&state.config.base_url),
    )
        .into_response()
}

pub async fn empty_segment() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "video/MP2T")],
        empty_transport_stream().to_vec(),
    )
        .into_response()
}

/// Three packets: PAT, PMT, and one stuffed PES — the smallest stream a
/// demuxer accepts without complaint.
pub fn empty_transport_stream() -> &'static [u8] {
    static STREAM: OnceLock<Vec<u8>> = OnceLock::new();
    STREAM.get_or_init(|| {
        let mut out = Vec::with_capacity(188 * 3);
        out.extend_from_slice(&psi_packet(0x0000, &pat_section()));
        out.extend_from_slice(&psi_packet(0x1000, &pmt_section()));
        out.extend_from_slice(&pes_packet());
        out
    })
}

/// CRC32/MPEG-2: poly 0x04C11DB7, init all-ones, no reflection or xor-out.
fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn with_crc(body: &[u8]) -> Vec<u8> {
    let mut section = body.to_vec();
    section.extend_from_slice(&crc32_mpeg2(body).to_be_bytes());
    section
}

/// PAT: single program 1 mapped to PMT PID 0x1000.
fn pat_section() -> Vec<u8> {
    with_crc(&[
        0x00, 0xB0, 0x0D, // table_id, section_syntax, length 13
        0x00, 0x01, // transport_stream_id
        0xC1, 0x00, 0x00, // version/current_next, section numbers
        0x00, 0x01, 0xF0, 0x00, // program 1 -> PID 0x1000
    ])
}

/// PMT: program 1, PCR and a single H.264 stream on PID 0x0100.
fn pmt_section() -> Vec<u8> {
    with_crc(&[
        0x02, 0xB0, 0x12, // table_id, section_syntax, length 18
        0x00, 0x01, // program_number
        0xC1, 0x00, 0x00, // version/current_next, section numbers
        0xE1, 0x00, // PCR PID 0x0100
        0xF0, 0x00, // program_info_length 0
        0x1B, 0xE1, 0x00, 0xF0, 0x00, // H.264 on PID 0x0100
    ])
}

/// Wrap a PSI section into one packet, 0xFF-stuffed.
fn psi_packet(pid: u16, section: &[u8]) -> [u8; 188] {
    let mut packet = [0xFFu8; 188];
    packet[0] = 0x47;
    packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F); // payload_unit_start
    packet[2] = (pid & 0xFF) as u8;
    packet[3] = 0x10; // payload only, continuity 0
    packet[4] = 0x00; // pointer_field
    packet[5..5 + section.len()].copy_from_slice(section);
    packet
}

/// A PES header with no timestamps, padded out with an adaptation field.
fn pes_packet() -> [u8; 188] {
    const PES_HEADER: [u8; 9] = [0x00, 0x00, 0x01, 0xE0, 0x00, 0x00, 0x80, 0x00, 0x00];
    let mut packet = [0xFFu8; 188];
    packet[0] = 0x47;
    packet[1] = 0x41; // payload_unit_start, PID 0x0100 high bits
    packet[2] = 0x00;
    packet[3] = 0x30; // adaptation field + payload, continuity 0
    let adaptation_len = 188 - 4 - 1 - PES_HEADER.len(); // 174
    packet[4] = adaptation_len as u8;
    packet[5] = 0x00; // no flags; remaining adaptation bytes are stuffing
    let payload_at = 4 + 1 + adaptation_len;
    packet[payload_at..].copy_from_slice(&PES_HEADER);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_is_whole_packets_with_sync_bytes() {
        let ts = empty_transport_stream();
        assert_eq!(ts.len() % 188, 0);
        assert_eq!(ts.len() / 188, 3);
        for packet in ts.chunks(188) {
            assert_eq!(packet[0], 0x47, "every packet starts with the sync byte");
        }
    }

    #[test]
    fn pat_crc_is_valid() {
        // CRC over the full section (body + stored CRC) must be zero for
        // the MPEG variant.
        let section = pat_section();
        assert_eq!(crc32_mpeg2(&section), 0);
        let pmt = pmt_section();
        assert_eq!(crc32_mpeg2(&pmt), 0);
    }

    #[test]
    fn pat_points_at_pmt_pid() {
        let ts = empty_transport_stream();
        let pat = &ts[..188];
        assert_eq!(pat[1] & 0x1F, 0, "PAT rides PID 0");
        let pmt = &ts[188..376];
        let pid = ((pmt[1] as u16 & 0x1F) << 8) | pmt[2] as u16;
        assert_eq!(pid, 0x1000);
    }

    #[test]
    fn sentinel_playlist_is_vod_and_points_at_segment() {
        let playlist = sentinel_playlist("http://127.0.0.1:52104/");
        assert!(playlist.starts_with("#EXTM3U"));
        assert!(playlist.contains("http://127.0.0.1:52104/.sentinel/empty.ts"));
        assert!(playlist.trim_end().ends_with("#EXT-X-ENDLIST"));
        assert!(m3u8_rs::parse_media_playlist_res(playlist.as_bytes()).is_ok());
    }

    #[test]
    fn fallback_hls_targets_requested_sentinel() {
        let (stop, ct) = fallback_manifest(ManifestKind::Hls, "http://p", true);
        assert!(stop.contains(STOP_PLAYLIST_PATH));
        assert_eq!(ct, "application/vnd.apple.mpegurl");
        let (next, _) = fallback_manifest(ManifestKind::Hls, "http://p", false);
        assert!(next.contains(NEXT_PLAYLIST_PATH));
        assert!(m3u8_rs::parse_master_playlist_res(next.as_bytes()).is_ok());
    }

    #[test]
    fn fallback_mpd_is_parseable() {
        let (body, ct) = fallback_manifest(ManifestKind::Dash, "http://p", false);
        assert_eq!(ct, "application/dash+xml");
        dash_mpd::parse(&body).expect("fallback MPD must parse");
    }
}
