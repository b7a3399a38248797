//! MPD transformation passes.
//!
//! Each pass is an isolated function over the arena tree with its
//! pre/post conditions documented; `dash::rewrite_mpd` runs them in a fixed
//! order that later passes depend on (Atmos extraction must precede
//! reordering, BaseURL normalization must precede SegmentTemplate fixups,
//! quality selection runs last before cleanup).

use super::DashContext;
use super::xml::{NodeId, XmlTree};
use crate::error::Result;
use crate::language;
use crate::quality::{Candidate, QualityContext, Resolved};
use tracing::debug;

/// Dolby JOC (Atmos) supplemental-property scheme.
const EC3_JOC_SCHEME: &str = "tag:dolby.com,2018:dash:EC3_ExtensionType:2018";
/// Dolby JOC complexity-index supplemental-property scheme.
const EC3_COMPLEXITY_SCHEME: &str = "tag:dolby.com,2018:dash:EC3_ExtensionComplexityIndex:2018";
/// Standard MPEG channel-configuration scheme written onto extracted
/// Atmos representations.
const MPEG_CHANNEL_SCHEME: &str = "urn:mpeg:dash:23003:3:audio_channel_configuration:2011";
/// Audio-description accessibility scheme.
const AUDIO_PURPOSE_SCHEME: &str = "urn:tva:metadata:cs:AudioPurposeCS:2007";
/// DASH role scheme for synthesized subtitle sets.
const ROLE_SCHEME: &str = "urn:mpeg:dash:role:2011";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum SetKind {
    Video,
    Audio,
    Text,
    Other,
}

pub(super) fn set_kind(tree: &XmlTree, set: NodeId) -> SetKind {
    let mime = |value: Option<&str>| -> Option<SetKind> {
        let value = value?;
        if value.starts_with("video/") {
            Some(SetKind::Video)
        } else if value.starts_with("audio/") {
            Some(SetKind::Audio)
        } else if value.starts_with("text/") || value.contains("ttml") {
            Some(SetKind::Text)
        } else {
            None
        }
    };

    match tree.attr(set, "contentType") {
        Some("video") => return SetKind::Video,
        Some("audio") => return SetKind::Audio,
        Some("text") => return SetKind::Text,
        _ => {}
    }
    if let Some(kind) = mime(tree.attr(set, "mimeType")) {
        return kind;
    }
    if let Some(rep) = tree.child_named(set, "Representation") {
        if let Some(kind) = mime(tree.attr(rep, "mimeType")) {
            return kind;
        }
    }
    SetKind::Other
}

/// Trick-play sets are excluded from video selection and language logic.
fn is_trick_play(tree: &XmlTree, set: NodeId) -> bool {
    if tree.attr(set, "maxPlayoutRate").is_some_and(|r| r != "1") {
        return true;
    }
    tree.children_named(set, "Representation")
        .iter()
        .any(|&rep| tree.attr(rep, "maxPlayoutRate").is_some_and(|r| r != "1"))
}

fn periods(tree: &XmlTree) -> Vec<NodeId> {
    tree.children_named(tree.root(), "Period")
}

fn max_bandwidth(tree: &XmlTree, set: NodeId) -> u64 {
    tree.children_named(set, "Representation")
        .iter()
        .filter_map(|&rep| tree.attr(rep, "bandwidth"))
        .filter_map(|b| b.parse().ok())
        .max()
        .unwrap_or(0)
}

// ── passes ──────────────────────────────────────────────────────────────────

/// Remove the top-level `publishTime` attribute (player-compatibility fix).
pub(super) fn strip_publish_time(tree: &mut XmlTree) {
    tree.remove_attr(tree.root(), "publishTime");
}

/// Dynamic manifests missing both `timeShiftBufferDepth` and
/// `mediaPresentationDuration` get a synthesized duration — elapsed time
/// since `availabilityStartTime` — so players don't assume zero duration.
pub(super) fn synthesize_duration(tree: &mut XmlTree, ctx: &DashContext<'_>) {
    let root = tree.root();
    if tree.attr(root, "type") != Some("dynamic") {
        return;
    }
    if tree.attr(root, "timeShiftBufferDepth").is_some()
        || tree.attr(root, "mediaPresentationDuration").is_some()
    {
        return;
    }
    let Some(start) = tree
        .attr(root, "availabilityStartTime")
        .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
    else {
        return;
    };
    let elapsed = (ctx.now - start.with_timezone(&chrono::Utc)).num_seconds().max(0);
    debug!("Synthesized mediaPresentationDuration PT{}S", elapsed);
    tree.set_attr(root, "mediaPresentationDuration", &format!("PT{elapsed}S"));
}

/// Extract JOC-flagged audio representations into their own sibling
/// adaptation set per period.
///
/// Post: no audio set mixes Atmos and non-Atmos representations; every new
/// set's id ends in `-atmos` with `name="ATMOS"`, and moved representations
/// carry a standard MPEG `AudioChannelConfiguration`.
pub(super) fn split_atmos(tree: &mut XmlTree, _ctx: &DashContext<'_>) {
    for period in periods(tree) {
        for (set_index, set) in tree.children_named(period, "AdaptationSet").into_iter().enumerate()
        {
            if set_kind(tree, set) != SetKind::Audio {
                continue;
            }
            let atmos_reps: Vec<NodeId> = tree
                .children_named(set, "Representation")
                .into_iter()
                .filter(|&rep| {
                    tree.children_named(rep, "SupplementalProperty").iter().any(|&sp| {
                        tree.attr(sp, "schemeIdUri") == Some(EC3_JOC_SCHEME)
                            && tree.attr(sp, "value").is_some_and(|v| v.eq_ignore_ascii_case("JOC"))
                    })
                })
                .collect();
            if atmos_reps.is_empty() {
                continue;
            }

            let base_id = tree
                .attr(set, "id")
                .map(str::to_string)
                .unwrap_or_else(|| format!("audio{set_index}"));
            let lang = tree.attr(set, "lang").map(str::to_string);

            let atmos_set = tree.create("AdaptationSet");
            for (k, v) in tree.node(set).attrs.clone() {
                tree.set_attr(atmos_set, &k, &v);
            }
            tree.set_attr(atmos_set, "id", &format!("{base_id}-atmos"));
            tree.set_attr(atmos_set, "name", "ATMOS");
            if let Some(lang) = &lang {
                tree.set_attr(atmos_set, "label", &format!("{lang} Atmos"));
            }

            // Set-level template and protection apply to the moved
            // representations too.
            for name in ["SegmentTemplate", "ContentProtection"] {
                for shared in tree.children_named(set, name) {
                    let copy = tree.clone_subtree(shared);
                    tree.append_child(atmos_set, copy);
                }
            }

            for rep in atmos_reps {
                let complexity = tree
                    .children_named(rep, "SupplementalProperty")
                    .into_iter()
                    .find(|&sp| tree.attr(sp, "schemeIdUri") == Some(EC3_COMPLEXITY_SCHEME))
                    .and_then(|sp| tree.attr(sp, "value").map(str::to_string));

                for acc in tree.children_named(rep, "AudioChannelConfiguration") {
                    tree.set_attr(acc, "schemeIdUri", MPEG_CHANNEL_SCHEME);
                    if let Some(value) = &complexity {
                        tree.set_attr(acc, "value", value);
                    }
                }
                tree.append_child(atmos_set, rep);
            }

            debug!("Extracted Atmos set {base_id}-atmos");
            tree.insert_after(period, set, atmos_set);
        }
    }
}

/// Re-append adaptation sets in descending max-bandwidth order: video sets
/// first, then audio, then everything else. Decoders that blindly pick the
/// first listed set get the best one.
pub(super) fn reorder_by_bandwidth(tree: &mut XmlTree) {
    for period in periods(tree) {
        let children = tree.node(period).children.clone();
        let mut non_sets = Vec::new();
        let mut video = Vec::new();
        let mut audio = Vec::new();
        let mut rest = Vec::new();

        for child in children {
            if tree.node(child).local_name() != "AdaptationSet" {
                non_sets.push(child);
                continue;
            }
            match set_kind(tree, child) {
                SetKind::Video if !is_trick_play(tree, child) => video.push(child),
                SetKind::Audio => audio.push(child),
                _ => rest.push(child),
            }
        }

        video.sort_by_key(|&set| std::cmp::Reverse(max_bandwidth(tree, set)));
        audio.sort_by_key(|&set| std::cmp::Reverse(max_bandwidth(tree, set)));

        let mut ordered = non_sets;
        ordered.extend(video);
        ordered.extend(audio);
        ordered.extend(rest);
        tree.set_children(period, ordered);
    }
}

/// Replace origin text tracks with caller-supplied subtitles, one
/// adaptation set per track, each pointing at a local proxy path.
pub(super) fn inject_subtitles(tree: &mut XmlTree, ctx: &DashContext<'_>) {
    if ctx.session.subtitles.is_empty() {
        return;
    }
    let proxy_base = ctx.proxy_base.trim_end_matches('/');
    for period in periods(tree) {
        for set in tree.children_named(period, "AdaptationSet") {
            if set_kind(tree, set) == SetKind::Text {
                tree.detach(set);
            }
        }
        for (index, subtitle) in ctx.session.subtitles.iter().enumerate() {
            let set = tree.create("AdaptationSet");
            tree.set_attr(set, "id", &format!("caption-{index}"));
            tree.set_attr(set, "contentType", "text");
            tree.set_attr(set, "mimeType", "text/vtt");
            tree.set_attr(set, "lang", &language::normalize(&subtitle.language));
            if let Some(label) = &subtitle.label {
                tree.set_attr(set, "label", label);
            }

            let role = tree.create("Role");
            tree.set_attr(role, "schemeIdUri", ROLE_SCHEME);
            tree.set_attr(
                role,
                "value",
                if subtitle.forced { "forced-subtitle" } else { "subtitle" },
            );
            tree.append_child(set, role);

            if subtitle.impaired {
                let accessibility = tree.create("Accessibility");
                tree.set_attr(accessibility, "schemeIdUri", ROLE_SCHEME);
                tree.set_attr(accessibility, "value", "caption");
                tree.append_child(set, accessibility);
            }

            let rep = tree.create("Representation");
            tree.set_attr(rep, "id", &format!("caption-rep-{index}"));
            tree.set_attr(rep, "bandwidth", "0");
            let base = tree.create("BaseURL");
            tree.node_mut(base).text = Some(format!("{proxy_base}/{}", subtitle.path));
            tree.append_child(rep, base);
            tree.append_child(set, rep);

            tree.append_child(period, set);
        }
    }
}

/// Language normalization, whitelist filtering, `original` tagging, and
/// central default reassignment (audio and subtitles independently).
pub(super) fn apply_language_policy(tree: &mut XmlTree, ctx: &DashContext<'_>) {
    let session = ctx.session;
    let mut audio_langs = Vec::new();
    let mut text_langs = Vec::new();
    let mut implied_defaults = Vec::new();

    for period in periods(tree) {
        for set in tree.children_named(period, "AdaptationSet") {
            let kind = set_kind(tree, set);
            if is_trick_play(tree, set) {
                continue;
            }
            let Some(lang) = tree.attr(set, "lang").map(str::to_string) else {
                continue;
            };
            let normalized = language::normalize(&lang);
            tree.set_attr(set, "lang", &normalized);

            match kind {
                SetKind::Audio => {
                    if !language::matches_whitelist(&normalized, &session.audio_whitelist) {
                        tree.detach(set);
                        continue;
                    }
                }
                SetKind::Text => {
                    if !language::matches_whitelist(&normalized, &session.subtitle_whitelist) {
                        tree.detach(set);
                        continue;
                    }
                    let forced = tree.children_named(set, "Role").iter().any(|&role| {
                        tree.attr(role, "value")
                            .is_some_and(|v| v.replace('_', "-") == "forced-subtitle")
                    });
                    if forced && !session.include_forced {
                        tree.detach(set);
                        continue;
                    }
                    if !forced && !session.include_non_forced {
                        tree.detach(set);
                        continue;
                    }
                }
                _ => {}
            }

            if let Some(original) = &session.original_language {
                if kind == SetKind::Audio && language::normalize(original) == normalized {
                    tree.set_attr(set, "original", "true");
                }
            }
            if tree.attr(set, "default") == Some("true") {
                implied_defaults.push(normalized.clone());
                tree.remove_attr(set, "default");
            }
            match kind {
                SetKind::Audio => audio_langs.push(normalized),
                SetKind::Text => text_langs.push(normalized),
                _ => {}
            }
        }
    }

    let original = session
        .original_language
        .clone()
        .or_else(|| implied_defaults.first().cloned());

    let mut assign = |tree: &mut XmlTree, wanted_kind: SetKind, lang: &str| {
        let normalized = language::normalize(lang);
        for period in periods(tree) {
            for set in tree.children_named(period, "AdaptationSet") {
                if set_kind(tree, set) == wanted_kind
                    && !is_trick_play(tree, set)
                    && tree.attr(set, "lang") == Some(normalized.as_str())
                {
                    tree.set_attr(set, "default", "true");
                    return;
                }
            }
        }
    };

    if let Some(lang) =
        language::resolve_default(&session.default_languages, original.as_deref(), &audio_langs)
    {
        assign(tree, SetKind::Audio, &lang);
    }
    if let Some(lang) =
        language::resolve_default(&session.default_subtitles, original.as_deref(), &text_langs)
    {
        assign(tree, SetKind::Text, &lang);
    }
}

/// Remove audio-description sets when the session disables them.
pub(super) fn strip_audio_description(tree: &mut XmlTree, ctx: &DashContext<'_>) {
    if ctx.session.audio_description {
        return;
    }
    for period in periods(tree) {
        for set in tree.children_named(period, "AdaptationSet") {
            if set_kind(tree, set) != SetKind::Audio {
                continue;
            }
            let is_description = tree.children_named(set, "Accessibility").iter().any(|&acc| {
                tree.attr(acc, "schemeIdUri")
                    .is_some_and(|s| s.contains(AUDIO_PURPOSE_SCHEME))
                    && tree.attr(acc, "value") == Some("1")
            });
            if is_description {
                debug!("Removing audio-description set");
                tree.detach(set);
            }
        }
    }
}

/// BaseURL normalization: one BaseURL per parent (ISO 23009-1 only uses
/// the first, and duplicates confuse players), absolutized against the
/// response URL, then routed through the proxy.
pub(super) fn normalize_base_urls(tree: &mut XmlTree, ctx: &DashContext<'_>) -> Result<()> {
    let proxy_base = ctx.proxy_base.trim_end_matches('/');
    let response_url = url::Url::parse(ctx.response_url)
        .map_err(|e| crate::error::ProxyError::Internal(format!("bad response URL: {e}")))?;

    let all = tree.descendants_named(tree.root(), "BaseURL");
    let mut seen_parents = Vec::new();
    for base in all {
        let parent = tree.node(base).parent;
        if seen_parents.contains(&parent) {
            tree.detach(base);
            continue;
        }
        seen_parents.push(parent);

        let Some(text) = tree.node(base).text.clone() else {
            continue;
        };
        let text = text.trim().to_string();
        if text.starts_with(proxy_base) {
            continue;
        }
        let absolute = if text.starts_with("http://") || text.starts_with("https://") {
            text
        } else {
            match response_url.join(&text) {
                Ok(joined) => joined.to_string(),
                Err(_) => continue,
            }
        };
        tree.node_mut(base).text = Some(format!("{proxy_base}/{absolute}"));
    }
    Ok(())
}

/// SegmentTemplate/SegmentURL fixups.
///
/// Pre: BaseURLs are already absolute and proxied. Post: absolute
/// `initialization`/`media` attributes are proxied, relative ones have a
/// `/`-terminated ancestor BaseURL to concatenate onto, duplicate ancestor
/// templates are merged away, and `presentationTimeOffset` is gone.
pub(super) fn fix_segment_templates(tree: &mut XmlTree, ctx: &DashContext<'_>) {
    let proxy_base = ctx.proxy_base.trim_end_matches('/');

    let templates = tree.descendants_named(tree.root(), "SegmentTemplate");

    // Merge a duplicate template two levels up (AdaptationSet template
    // shadowed by a Representation template), then delete the duplicate.
    // Merge everything before detaching so sibling representations still
    // see the duplicate.
    let mut duplicates = Vec::new();
    for &template in &templates {
        let Some(parent) = tree.node(template).parent else {
            continue;
        };
        let Some(grandparent) = tree.node(parent).parent else {
            continue;
        };
        let Some(ancestor) = tree
            .children_named(grandparent, "SegmentTemplate")
            .into_iter()
            .next()
        else {
            continue;
        };
        if ancestor == template {
            continue;
        }
        for (k, v) in tree.node(ancestor).attrs.clone() {
            if tree.attr(template, k.rsplit(':').next().unwrap_or(&k)).is_none() {
                tree.set_attr(template, &k, &v);
            }
        }
        if !duplicates.contains(&ancestor) {
            duplicates.push(ancestor);
        }
    }
    for duplicate in duplicates {
        debug!("Removing duplicate ancestor SegmentTemplate");
        tree.detach(duplicate);
    }

    let mut nodes = tree.descendants_named(tree.root(), "SegmentTemplate");
    nodes.extend(tree.descendants_named(tree.root(), "SegmentURL"));

    for node in nodes {
        tree.remove_attr(node, "presentationTimeOffset");
        for attr_name in ["initialization", "media", "index"] {
            let Some(value) = tree.attr(node, attr_name).map(str::to_string) else {
                continue;
            };
            if value.starts_with(proxy_base) {
                continue;
            }
            if value.starts_with("http://") || value.starts_with("https://") {
                tree.set_attr(node, attr_name, &format!("{proxy_base}/{value}"));
            } else {
                ensure_ancestor_base_slash(tree, node);
            }
        }
    }
}

/// Relative segment paths concatenate onto the nearest ancestor BaseURL;
/// that URL must end in `/` or the join corrupts the last path segment.
fn ensure_ancestor_base_slash(tree: &mut XmlTree, node: NodeId) {
    let mut current = tree.node(node).parent;
    while let Some(ancestor) = current {
        if let Some(base) = tree.child_named(ancestor, "BaseURL") {
            if let Some(text) = tree.node_mut(base).text.as_mut() {
                if !text.ends_with('/') {
                    text.push('/');
                }
            }
            return;
        }
        current = tree.node(ancestor).parent;
    }
}

/// DRM content-protection rewriting: apply the session's key-id override
/// and collapse duplicate ContentProtection elements under one parent.
pub(super) fn rewrite_content_protection(tree: &mut XmlTree, ctx: &DashContext<'_>) {
    let nodes = tree.descendants_named(tree.root(), "ContentProtection");

    let mut seen: Vec<(Option<NodeId>, String, String)> = Vec::new();
    for node in &nodes {
        let parent = tree.node(*node).parent;
        let scheme = tree.attr(*node, "schemeIdUri").unwrap_or("").to_string();
        let value = tree.attr(*node, "value").unwrap_or("").to_string();
        let key = (parent, scheme, value);
        if seen.contains(&key) {
            tree.detach(*node);
        } else {
            seen.push(key);
        }
    }

    if let Some(kid) = &ctx.session.default_kid {
        for node in nodes {
            if tree.attr(node, "default_KID").is_some() {
                tree.set_attr(node, "default_KID", kid);
            }
        }
    }
}

fn parse_frame_rate(value: &str) -> Option<f64> {
    if let Some((num, den)) = value.split_once('/') {
        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        return Some(num / den);
    }
    value.parse().ok()
}

/// Enumerate video representations of a period in stable position order.
fn video_positions(tree: &XmlTree, period: NodeId) -> Vec<NodeId> {
    let mut reps = Vec::new();
    for set in tree.children_named(period, "AdaptationSet") {
        if set_kind(tree, set) != SetKind::Video || is_trick_play(tree, set) {
            continue;
        }
        reps.extend(tree.children_named(set, "Representation"));
    }
    reps
}

/// Quality selection: candidates come from the first period; the chosen
/// position index is applied across all periods.
pub(super) async fn select_quality(tree: &mut XmlTree, quality: &QualityContext) -> Result<()> {
    let Some(first_period) = periods(tree).first().copied() else {
        return Ok(());
    };

    let reps = video_positions(tree, first_period);
    let candidates: Vec<Candidate> = reps
        .iter()
        .enumerate()
        .map(|(position, &rep)| {
            let set = tree.node(rep).parent;
            let codecs = tree
                .attr(rep, "codecs")
                .or_else(|| set.and_then(|s| tree.attr(s, "codecs")))
                .map(|c| c.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            let width = tree.attr(rep, "width").and_then(|w| w.parse().ok());
            let height = tree.attr(rep, "height").and_then(|h| h.parse().ok());
            Candidate {
                position,
                bandwidth: tree.attr(rep, "bandwidth").and_then(|b| b.parse().ok()).unwrap_or(0),
                resolution: width.zip(height),
                frame_rate: tree
                    .attr(rep, "frameRate")
                    .or_else(|| set.and_then(|s| tree.attr(s, "frameRate")))
                    .and_then(parse_frame_rate),
                codecs,
            }
        })
        .collect();

    let Resolved::Pick(selected) = quality.select(&candidates).await? else {
        return Ok(());
    };

    for period in periods(tree) {
        let reps = video_positions(tree, period);
        // A period with fewer video representations than the selected
        // position is left alone rather than stripped bare.
        if selected >= reps.len() {
            continue;
        }
        for (position, rep) in reps.into_iter().enumerate() {
            if position != selected {
                tree.detach(rep);
            }
        }
    }
    debug!("Quality selection kept video representation {}", selected);
    Ok(())
}

/// Drop adaptation sets left without representations by earlier passes.
pub(super) fn drop_empty_sets(tree: &mut XmlTree) {
    for period in periods(tree) {
        for set in tree.children_named(period, "AdaptationSet") {
            if tree.children_named(set, "Representation").is_empty() {
                tree.detach(set);
            }
        }
    }
}
