//! Quality selection policy.
//!
//! Pure ranking plus a small amount of per-session / cross-session state:
//! the interactive chooser runs at most once per playback session, and the
//! last choice per content id is remembered in a bounded LRU owned by one
//! long-lived [`QualityMemory`] constructed at startup (never a module-level
//! global).

use crate::collab::QualityChooser;
use crate::error::{ProxyError, Result};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// One selectable rendition, built fresh on every manifest parse.
///
/// `position` is the candidate's stable index in the caller's own structure
/// (variant pair index for HLS, representation position for DASH) — the
/// rewriter uses it to know which nodes to keep.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub position: usize,
    pub bandwidth: u64,
    /// `(width, height)` when the manifest declares a resolution.
    pub resolution: Option<(u32, u32)>,
    pub frame_rate: Option<f64>,
    pub codecs: Vec<String>,
}

/// Fixed codec preference order used as the second sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CodecRank {
    Unknown,
    Mpeg4,
    H264,
    H265,
    Hdr,
    DolbyVision,
}

fn codec_rank(codecs: &[String]) -> CodecRank {
    let mut best = CodecRank::Unknown;
    for codec in codecs {
        let c = codec.to_ascii_lowercase();
        let rank = if c.starts_with("dvh1") || c.starts_with("dvhe") {
            CodecRank::DolbyVision
        } else if c.starts_with("hvc1.2") || c.starts_with("hev1.2") {
            // HEVC profile space 2 signals a 10-bit HDR encode.
            CodecRank::Hdr
        } else if c.starts_with("hvc1") || c.starts_with("hev1") || c.starts_with("hevc") {
            CodecRank::H265
        } else if c.starts_with("avc1") || c.starts_with("avc3") || c.starts_with("h264") {
            CodecRank::H264
        } else if c.starts_with("mp4v") {
            CodecRank::Mpeg4
        } else {
            CodecRank::Unknown
        };
        if rank > best {
            best = rank;
        }
    }
    best
}

impl Candidate {
    fn width(&self) -> u32 {
        self.resolution.map(|(w, _)| w).unwrap_or(0)
    }

    /// Human label for the chooser dialog, e.g. `"1920x1080 h265 8.0Mbps 50fps"`.
    pub fn label(&self) -> String {
        let mut parts = Vec::new();
        if let Some((w, h)) = self.resolution {
            parts.push(format!("{w}x{h}"));
        }
        if let Some(codec) = self.codecs.first() {
            parts.push(codec.clone());
        }
        parts.push(format!("{:.1}Mbps", self.bandwidth as f64 / 1_000_000.0));
        if let Some(fps) = self.frame_rate {
            parts.push(format!("{fps:.0}fps"));
        }
        parts.join(" ")
    }
}

/// Descending comparison: best candidate first.
///
/// Keys in order: resolution width, codec rank, bandwidth, frame rate.
/// Missing values sort as equal-not-greater (zero).
fn compare_desc(a: &Candidate, b: &Candidate) -> Ordering {
    b.width()
        .cmp(&a.width())
        .then_with(|| codec_rank(&b.codecs).cmp(&codec_rank(&a.codecs)))
        .then_with(|| b.bandwidth.cmp(&a.bandwidth))
        .then_with(|| {
            b.frame_rate
                .unwrap_or(0.0)
                .partial_cmp(&a.frame_rate.unwrap_or(0.0))
                .unwrap_or(Ordering::Equal)
        })
}

/// Sort candidates best-first and return them with their original positions
/// intact.
pub fn sort_candidates(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(compare_desc);
    candidates
}

/// Quality policy, either configured globally or handed in per session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityPolicy {
    /// Present the interactive chooser (at most once per session).
    Ask,
    Best,
    Lowest,
    /// Don't choose this request; ask again next time the manifest is fetched.
    Skip,
    /// Quality selection is switched off for the session.
    Disabled,
    /// A previously chosen candidate index (into the sorted list).
    Index(usize),
    /// Pick the candidate closest to this bandwidth without exceeding it.
    MaxBandwidth(u64),
}

impl QualityPolicy {
    /// Parse the configuration string form (`ask`, `best`, `lowest`,
    /// `disabled`, or a number treated as a bandwidth cap in bits/sec).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ask" => Some(Self::Ask),
            "best" => Some(Self::Best),
            "lowest" => Some(Self::Lowest),
            "skip" => Some(Self::Skip),
            "disabled" | "none" => Some(Self::Disabled),
            other => other.parse::<u64>().ok().map(Self::MaxBandwidth),
        }
    }
}

/// Outcome of a selection pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolved {
    /// No filtering: every candidate stays in the manifest.
    Keep,
    /// Keep only the candidate at this `position` (the caller's index).
    Pick(usize),
}

/// Bounded most-recent-N memory of interactive choices, keyed by content id.
///
/// Constructed once at startup and shared; eviction order is strictly
/// least-recently-used.
#[derive(Debug)]
pub struct QualityMemory {
    entries: Mutex<VecDeque<(String, usize)>>,
    capacity: usize,
}

impl QualityMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Remember `index` as the last choice for `content_id`.
    pub fn remember(&self, content_id: &str, index: usize) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|(id, _)| id != content_id);
        entries.push_front((content_id.to_string(), index));
        entries.truncate(self.capacity);
    }

    /// Recall the last choice for `content_id`, refreshing its recency.
    pub fn recall(&self, content_id: &str) -> Option<usize> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let pos = entries.iter().position(|(id, _)| id == content_id)?;
        let entry = entries.remove(pos)?;
        let index = entry.1;
        entries.push_front(entry);
        Some(index)
    }
}

/// Everything a rewriter needs to run one selection pass.
///
/// Built by the request handler from session + config state; the handler
/// writes `take_resolution()` back into the session afterwards so live
/// playlist refreshes never re-prompt.
pub struct QualityContext {
    pub policy: QualityPolicy,
    pub content_id: String,
    pub chooser: Arc<dyn QualityChooser>,
    pub memory: Arc<QualityMemory>,
    pub chooser_timeout: Duration,
    /// Resolution cached on the session from an earlier pass; short-circuits
    /// selection so live refreshes never re-rank or re-prompt.
    cached: Option<Resolved>,
    resolution: Mutex<Option<Resolved>>,
}

impl QualityContext {
    pub fn new(
        policy: QualityPolicy,
        content_id: String,
        chooser: Arc<dyn QualityChooser>,
        memory: Arc<QualityMemory>,
        chooser_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            content_id,
            chooser,
            memory,
            chooser_timeout,
            cached: None,
            resolution: Mutex::new(None),
        }
    }

    /// Reuse a resolution already cached on the session.
    pub fn with_cached(mut self, cached: Option<Resolved>) -> Self {
        self.cached = cached;
        self
    }

    /// The resolution produced by [`select`], if one should be cached on the
    /// session. `Skip` never caches (live playlists re-evaluate per fetch).
    pub fn take_resolution(&self) -> Option<Resolved> {
        self.resolution.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn record(&self, resolved: Resolved) {
        *self.resolution.lock().unwrap_or_else(|p| p.into_inner()) = Some(resolved);
    }

    /// Run the selection policy over `candidates`.
    ///
    /// Returns [`Resolved::Pick`] with the chosen candidate's `position`, or
    /// [`Resolved::Keep`] when no filtering applies. A dismissed chooser is
    /// [`ProxyError::Cancelled`].
    pub async fn select(&self, candidates: &[Candidate]) -> Result<Resolved> {
        if let Some(cached) = self.cached {
            return Ok(cached);
        }
        // Degenerate inputs decide the effective policy before anything else.
        let policy = if candidates.is_empty() {
            QualityPolicy::Disabled
        } else if candidates.len() == 1 {
            QualityPolicy::Best
        } else {
            self.policy
        };

        let sorted = sort_candidates(candidates.to_vec());

        let resolved = match policy {
            QualityPolicy::Disabled => Resolved::Keep,
            QualityPolicy::Skip => {
                // Applies to this request only; nothing is cached.
                return Ok(Resolved::Keep);
            }
            QualityPolicy::Best => Resolved::Pick(sorted[0].position),
            QualityPolicy::Lowest => Resolved::Pick(sorted[sorted.len() - 1].position),
            QualityPolicy::Index(i) => match sorted.get(i) {
                Some(c) => Resolved::Pick(c.position),
                // Remembered index fell out of range; keep everything rather
                // than guess.
                None => Resolved::Keep,
            },
            QualityPolicy::MaxBandwidth(cap) => {
                let pick = sorted
                    .iter()
                    .filter(|c| c.bandwidth <= cap)
                    .max_by_key(|c| c.bandwidth)
                    .or_else(|| sorted.iter().min_by_key(|c| c.bandwidth));
                match pick {
                    Some(c) => Resolved::Pick(c.position),
                    None => Resolved::Keep,
                }
            }
            QualityPolicy::Ask => self.ask(&sorted).await?,
        };

        self.record(resolved);
        Ok(resolved)
    }

    /// Present the sorted list plus synthetic BEST / LOWEST / SKIP entries.
    async fn ask(&self, sorted: &[Candidate]) -> Result<Resolved> {
        let mut options: Vec<String> = sorted.iter().map(Candidate::label).collect();
        let best_at = options.len();
        options.push("Best".to_string());
        options.push("Lowest".to_string());
        options.push("Skip".to_string());

        let preselected = self
            .memory
            .recall(&self.content_id)
            .filter(|i| *i < options.len());

        debug!(
            "Asking quality chooser: {} candidates, preselected {:?}",
            sorted.len(),
            preselected
        );

        let chosen = tokio::time::timeout(
            self.chooser_timeout,
            self.chooser.choose(&options, preselected),
        )
        .await
        .map_err(|_| ProxyError::CollaboratorTimeout(self.chooser_timeout))?;

        let Some(chosen) = chosen else {
            info!("Quality chooser dismissed; cancelling playback");
            return Err(ProxyError::Cancelled);
        };

        // Persist only when the user actually changed the selection.
        if preselected != Some(chosen) {
            self.memory.remember(&self.content_id, chosen);
        }

        if chosen == best_at {
            return Ok(Resolved::Pick(sorted[0].position));
        }
        if chosen == best_at + 1 {
            return Ok(Resolved::Pick(sorted[sorted.len() - 1].position));
        }
        if chosen == best_at + 2 {
            // Skip: keep everything, and don't cache so the next manifest
            // fetch asks again.
            return Ok(Resolved::Keep);
        }
        match sorted.get(chosen) {
            Some(c) => Ok(Resolved::Pick(c.position)),
            None => Ok(Resolved::Keep),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::QualityChooser;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn cand(position: usize, bw: u64, res: Option<(u32, u32)>, codec: &str) -> Candidate {
        Candidate {
            position,
            bandwidth: bw,
            resolution: res,
            frame_rate: None,
            codecs: vec![codec.to_string()],
        }
    }

    struct FixedChooser {
        answer: Option<usize>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QualityChooser for FixedChooser {
        async fn choose(&self, _options: &[String], _preselected: Option<usize>) -> Option<usize> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.answer
        }
    }

    fn ctx(policy: QualityPolicy, chooser: Arc<FixedChooser>) -> QualityContext {
        QualityContext::new(
            policy,
            "content-1".to_string(),
            chooser,
            Arc::new(QualityMemory::new(10)),
            Duration::from_secs(5),
        )
    }

    // ── ranking ─────────────────────────────────────────────────────────────

    #[test]
    fn width_dominates_bandwidth() {
        let sorted = sort_candidates(vec![
            cand(0, 9_000_000, Some((1280, 720)), "avc1.64001f"),
            cand(1, 4_000_000, Some((1920, 1080)), "avc1.640028"),
        ]);
        assert_eq!(sorted[0].position, 1);
    }

    #[test]
    fn codec_breaks_width_ties() {
        let sorted = sort_candidates(vec![
            cand(0, 8_000_000, Some((1920, 1080)), "avc1.640028"),
            cand(1, 5_000_000, Some((1920, 1080)), "hvc1.1.6.L120.90"),
            cand(2, 5_000_000, Some((1920, 1080)), "dvh1.05.06"),
        ]);
        assert_eq!(sorted[0].position, 2, "Dolby Vision ranks above HEVC");
        assert_eq!(sorted[1].position, 1, "HEVC ranks above H.264");
    }

    #[test]
    fn hdr_profile_ranks_between_hevc_and_dovi() {
        assert!(codec_rank(&["hvc1.2.4.L123".into()]) > codec_rank(&["hvc1.1.6.L93".into()]));
        assert!(codec_rank(&["dvhe.08.07".into()]) > codec_rank(&["hvc1.2.4.L123".into()]));
    }

    #[test]
    fn missing_resolution_sorts_last() {
        let sorted = sort_candidates(vec![
            cand(0, 9_000_000, None, "avc1"),
            cand(1, 1_000_000, Some((640, 360)), "avc1"),
        ]);
        assert_eq!(sorted[0].position, 1);
    }

    // ── policy resolution ───────────────────────────────────────────────────

    #[tokio::test]
    async fn best_picks_first_sorted() {
        let chooser = Arc::new(FixedChooser { answer: None, calls: AtomicUsize::new(0) });
        let ctx = ctx(QualityPolicy::Best, chooser);
        let resolved = ctx
            .select(&[
                cand(0, 1_000_000, Some((640, 360)), "avc1"),
                cand(1, 5_000_000, Some((1920, 1080)), "avc1"),
            ])
            .await
            .unwrap();
        assert_eq!(resolved, Resolved::Pick(1));
    }

    #[tokio::test]
    async fn single_candidate_never_asks() {
        let chooser = Arc::new(FixedChooser { answer: Some(0), calls: AtomicUsize::new(0) });
        let ctx = ctx(QualityPolicy::Ask, chooser.clone());
        let resolved = ctx
            .select(&[cand(0, 1_000_000, Some((640, 360)), "avc1")])
            .await
            .unwrap();
        assert_eq!(resolved, Resolved::Pick(0));
        assert_eq!(chooser.calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_candidates_keep_everything() {
        let chooser = Arc::new(FixedChooser { answer: None, calls: AtomicUsize::new(0) });
        let ctx = ctx(QualityPolicy::Best, chooser);
        assert_eq!(ctx.select(&[]).await.unwrap(), Resolved::Keep);
    }

    #[tokio::test]
    async fn max_bandwidth_picks_at_or_below() {
        let chooser = Arc::new(FixedChooser { answer: None, calls: AtomicUsize::new(0) });
        let ctx = ctx(QualityPolicy::MaxBandwidth(4_000_000), chooser);
        let resolved = ctx
            .select(&[
                cand(0, 1_000_000, Some((640, 360)), "avc1"),
                cand(1, 3_500_000, Some((1280, 720)), "avc1"),
                cand(2, 8_000_000, Some((1920, 1080)), "avc1"),
            ])
            .await
            .unwrap();
        assert_eq!(resolved, Resolved::Pick(1));
    }

    #[tokio::test]
    async fn max_bandwidth_falls_back_to_lowest() {
        let chooser = Arc::new(FixedChooser { answer: None, calls: AtomicUsize::new(0) });
        let ctx = ctx(QualityPolicy::MaxBandwidth(500_000), chooser);
        let resolved = ctx
            .select(&[
                cand(0, 1_000_000, Some((640, 360)), "avc1"),
                cand(1, 3_500_000, Some((1280, 720)), "avc1"),
            ])
            .await
            .unwrap();
        assert_eq!(resolved, Resolved::Pick(0));
    }

    #[tokio::test]
    async fn dismissed_chooser_is_cancelled() {
        let chooser = Arc::new(FixedChooser { answer: None, calls: AtomicUsize::new(0) });
        let ctx = ctx(QualityPolicy::Ask, chooser);
        let err = ctx
            .select(&[
                cand(0, 1_000_000, Some((640, 360)), "avc1"),
                cand(1, 3_500_000, Some((1280, 720)), "avc1"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Cancelled));
    }

    #[tokio::test]
    async fn skip_does_not_cache_resolution() {
        let chooser = Arc::new(FixedChooser { answer: None, calls: AtomicUsize::new(0) });
        let ctx = ctx(QualityPolicy::Skip, chooser);
        let resolved = ctx
            .select(&[
                cand(0, 1_000_000, Some((640, 360)), "avc1"),
                cand(1, 3_500_000, Some((1280, 720)), "avc1"),
            ])
            .await
            .unwrap();
        assert_eq!(resolved, Resolved::Keep);
        assert!(ctx.take_resolution().is_none());
    }

    #[tokio::test]
    async fn ask_synthetic_best_option() {
        // Two candidates → options are [c0, c1, Best, Lowest, Skip]; index 2 = Best.
        let chooser = Arc::new(FixedChooser { answer: Some(2), calls: AtomicUsize::new(0) });
        let ctx = ctx(QualityPolicy::Ask, chooser);
        let resolved = ctx
            .select(&[
                cand(0, 1_000_000, Some((640, 360)), "avc1"),
                cand(1, 3_500_000, Some((1280, 720)), "avc1"),
            ])
            .await
            .unwrap();
        assert_eq!(resolved, Resolved::Pick(1));
    }

    #[tokio::test]
    async fn choice_is_remembered_for_content_id() {
        let memory = Arc::new(QualityMemory::new(10));
        let chooser = Arc::new(FixedChooser { answer: Some(1), calls: AtomicUsize::new(0) });
        let ctx = QualityContext::new(
            QualityPolicy::Ask,
            "show-42".to_string(),
            chooser,
            memory.clone(),
            Duration::from_secs(5),
        );
        ctx.select(&[
            cand(0, 1_000_000, Some((640, 360)), "avc1"),
            cand(1, 3_500_000, Some((1280, 720)), "avc1"),
        ])
        .await
        .unwrap();
        assert_eq!(memory.recall("show-42"), Some(1));
    }

    #[tokio::test]
    async fn cached_resolution_skips_the_chooser() {
        let chooser = Arc::new(FixedChooser { answer: Some(0), calls: AtomicUsize::new(0) });
        let candidates = [
            cand(0, 1_000_000, Some((640, 360)), "avc1"),
            cand(1, 3_500_000, Some((1280, 720)), "avc1"),
        ];

        let first = ctx(QualityPolicy::Ask, chooser.clone());
        let resolved = first.select(&candidates).await.unwrap();
        assert_eq!(chooser.calls.load(AtomicOrdering::SeqCst), 1);

        // Second pass with the session-cached resolution: same answer, no
        // second prompt.
        let second = ctx(QualityPolicy::Ask, chooser.clone()).with_cached(Some(resolved));
        assert_eq!(second.select(&candidates).await.unwrap(), resolved);
        assert_eq!(chooser.calls.load(AtomicOrdering::SeqCst), 1);
    }

    // ── memory ──────────────────────────────────────────────────────────────

    #[test]
    fn memory_evicts_least_recent() {
        let memory = QualityMemory::new(2);
        memory.remember("a", 0);
        memory.remember("b", 1);
        memory.remember("c", 2);
        assert_eq!(memory.recall("a"), None, "oldest entry evicted");
        assert_eq!(memory.recall("b"), Some(1));
        assert_eq!(memory.recall("c"), Some(2));
    }

    #[test]
    fn memory_recall_refreshes_recency() {
        let memory = QualityMemory::new(2);
        memory.remember("a", 0);
        memory.remember("b", 1);
        memory.recall("a");
        memory.remember("c", 2);
        assert_eq!(memory.recall("b"), None, "stale entry evicted, not the recalled one");
        assert_eq!(memory.recall("a"), Some(0));
    }
}
