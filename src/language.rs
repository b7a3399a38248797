//! Language tag handling shared by the HLS and DASH rewriters.
//!
//! Whitelist filtering, forced-subtitle policy, and default-language
//! resolution behave identically for both manifest formats; only the
//! node surgery differs, so the policy lives here.

/// Normalize a language tag for comparison: lowercase, `_` → `-`, trimmed.
///
/// `"en_US "` and `"en-us"` normalize to the same string. The primary
/// subtag is kept intact so prefix matching still distinguishes `"en"`
/// from `"es"`.
pub fn normalize(tag: &str) -> String {
    tag.trim().to_ascii_lowercase().replace('_', "-")
}

/// Whitelist check: an empty whitelist passes everything; otherwise the
/// normalized language must start with one of the whitelist tags.
pub fn matches_whitelist(lang: &str, whitelist: &[String]) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    let lang = normalize(lang);
    whitelist.iter().any(|w| lang.starts_with(&normalize(w)))
}

/// The special configured-default value that stands for "whatever the
/// stream's tagged original audio language is".
pub const ORIGINAL: &str = "original";

/// Resolve which collected language becomes the default track.
///
/// Tries each configured default in order; `"original"` is substituted with
/// the stream's tagged original language before comparison. The first
/// configured default that prefix-matches any available language wins, and
/// the matched available language is returned. If nothing matches, the
/// original language is treated as an implicit last default.
pub fn resolve_default(
    configured: &[String],
    original_language: Option<&str>,
    available: &[String],
) -> Option<String> {
    let try_match = |wanted: &str| -> Option<String> {
        let wanted = normalize(wanted);
        available
            .iter()
            .find(|a| normalize(a).starts_with(&wanted))
            .cloned()
    };

    for configured_default in configured {
        let wanted = if normalize(configured_default) == ORIGINAL {
            match original_language {
                Some(orig) => orig.to_string(),
                None => continue,
            }
        } else {
            configured_default.clone()
        };
        if let Some(hit) = try_match(&wanted) {
            return Some(hit);
        }
    }

    // Implicit fallback: the original language, when it is available.
    original_language.and_then(try_match)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalize_lowercases_and_fixes_separator() {
        assert_eq!(normalize("en_US "), "en-us");
        assert_eq!(normalize("PT-br"), "pt-br");
    }

    #[test]
    fn empty_whitelist_passes_everything() {
        assert!(matches_whitelist("sv", &[]));
        assert!(matches_whitelist("", &[]));
    }

    #[test]
    fn whitelist_is_prefix_and_case_insensitive() {
        let wl = v(&["en", "es"]);
        assert!(matches_whitelist("en-US", &wl));
        assert!(matches_whitelist("ES", &wl));
        assert!(!matches_whitelist("de", &wl));
        // "es" matches "es-419" but "e" alone is not a configured tag
        assert!(matches_whitelist("es-419", &wl));
    }

    #[test]
    fn first_configured_default_wins() {
        let resolved = resolve_default(&v(&["fr", "de"]), Some("en"), &v(&["en", "fr", "de"]));
        assert_eq!(resolved.as_deref(), Some("fr"));
    }

    #[test]
    fn original_resolves_before_comparison() {
        // "original" maps to "en", which is available, so "en" wins over "fr".
        let resolved = resolve_default(
            &v(&["original", "fr"]),
            Some("en"),
            &v(&["en", "fr", "de"]),
        );
        assert_eq!(resolved.as_deref(), Some("en"));
    }

    #[test]
    fn unavailable_defaults_fall_back_to_original() {
        let resolved = resolve_default(&v(&["ja", "ko"]), Some("de"), &v(&["en", "de"]));
        assert_eq!(resolved.as_deref(), Some("de"));
    }

    #[test]
    fn no_match_and_no_original_yields_none() {
        let resolved = resolve_default(&v(&["ja"]), None, &v(&["en", "de"]));
        assert_eq!(resolved, None);
    }

    #[test]
    fn regional_variant_matches_primary_default() {
        let resolved = resolve_default(&v(&["pt"]), None, &v(&["pt-BR", "en"]));
        assert_eq!(resolved.as_deref(), Some("pt-BR"));
    }
}
