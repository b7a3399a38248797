//! DASH manifest rewriting.
//!
//! The MPD is parsed into an arena tree and pushed through a fixed pipeline
//! of passes (see [`passes`]); the order is load-bearing and documented on
//! each pass. Two textual fixups run before parsing because they repair
//! namespace problems that would otherwise break the parse itself.

pub mod passes;
pub mod xml;

use crate::error::{ProxyError, Result};
use crate::quality::QualityContext;
use crate::session::Session;
use xml::XmlTree;

/// Known non-compliant URN spellings, replaced before parsing.
const URN_FIXUPS: &[(&str, &str)] = &[
    // Legacy Dolby channel-configuration URN → registered tag: form.
    (
        "urn:dolby:dash:audio_channel_configuration:2011",
        "tag:dolby.com,2014:dash:audio_channel_configuration:2011",
    ),
    // CICP EC-3 channel-configuration → ISO 23003-3 form players accept.
    (
        "urn:mpeg:mpegB:cicp:ChannelConfiguration",
        "urn:mpeg:dash:23003:3:audio_channel_configuration:2011",
    ),
];

pub struct DashContext<'a> {
    pub session: &'a Session,
    /// The proxy's own base URL.
    pub proxy_base: &'a str,
    /// Final (post-redirect) URL the manifest was fetched from.
    pub response_url: &'a str,
    /// Injected clock so duration synthesis is testable.
    pub now: chrono::DateTime<chrono::Utc>,
}

/// Repair known origin quirks that no conforming parser survives: bad URN
/// spellings and an undeclared `dvb:` prefix.
fn apply_text_fixups(content: &str) -> String {
    let mut fixed = content.to_string();
    for (from, to) in URN_FIXUPS {
        fixed = fixed.replace(from, to);
    }
    fixed = fixed.replace("<dvb:", "<").replace("</dvb:", "</").replace(" dvb:", " ");
    fixed
}

/// Rewrite an MPD end to end.
pub async fn rewrite_mpd(
    content: &str,
    ctx: &DashContext<'_>,
    quality: &QualityContext,
) -> Result<String> {
    let cleaned = apply_text_fixups(content);
    let mut tree = XmlTree::parse(&cleaned)?;
    if tree.node(tree.root()).local_name() != "MPD" {
        return Err(ProxyError::Parse("document root is not <MPD>".into()));
    }

    passes::strip_publish_time(&mut tree);
    passes::synthesize_duration(&mut tree, ctx);
    passes::split_atmos(&mut tree, ctx);
    passes::reorder_by_bandwidth(&mut tree);
    passes::inject_subtitles(&mut tree, ctx);
    passes::apply_language_policy(&mut tree, ctx);
    passes::strip_audio_description(&mut tree, ctx);
    passes::normalize_base_urls(&mut tree, ctx)?;
    passes::fix_segment_templates(&mut tree, ctx);
    passes::rewrite_content_protection(&mut tree, ctx);
    passes::select_quality(&mut tree, quality).await?;
    passes::drop_empty_sets(&mut tree);

    Ok(tree.serialize())
}
