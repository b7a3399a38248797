//! HLS tag attribute-list parsing and re-serialization.
//!
//! m3u8-rs drops unknown tags and normalizes attribute order on a
//! parse-serialize round-trip, so the rewriter works on raw lines and uses
//! this module for attribute surgery. Quoting is preserved per attribute:
//! a value parsed from quotes is written back in quotes.

/// How an attribute value was written in the source line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrValue {
    Quoted(String),
    Plain(String),
}

/// An ordered attribute list from a `#EXT-X-*:<attrs>` line.
#[derive(Debug, Clone, PartialEq)]
pub struct AttrList {
    entries: Vec<(String, AttrValue)>,
}

impl AttrList {
    /// Parse the attribute portion of a tag line (everything after `:`).
    ///
    /// Commas inside quoted values do not split; malformed trailing garbage
    /// is kept as a valueless attribute rather than dropped.
    pub fn parse(attr_text: &str) -> Self {
        let mut entries = Vec::new();
        let mut rest = attr_text;

        while !rest.is_empty() {
            let Some(eq) = rest.find('=') else {
                let name = rest.trim();
                if !name.is_empty() {
                    entries.push((name.to_string(), AttrValue::Plain(String::new())));
                }
                break;
            };
            let name = rest[..eq].trim().to_string();
            rest = &rest[eq + 1..];

            if let Some(stripped) = rest.strip_prefix('"') {
                let close = stripped.find('"').unwrap_or(stripped.len());
                let value = stripped[..close].to_string();
                entries.push((name, AttrValue::Quoted(value)));
                rest = stripped[close..].strip_prefix('"').unwrap_or("");
                rest = rest.strip_prefix(',').unwrap_or(rest);
            } else {
                let end = rest.find(',').unwrap_or(rest.len());
                let value = rest[..end].trim().to_string();
                entries.push((name, AttrValue::Plain(value)));
                rest = rest.get(end + 1..).unwrap_or("");
            }
        }

        Self { entries }
    }

    /// Unquoted value of `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| match v {
                AttrValue::Quoted(s) | AttrValue::Plain(s) => s.as_str(),
            })
    }

    /// Replace or append a value, keeping the original quoting when the
    /// attribute already exists.
    pub fn set(&mut self, name: &str, value: &str) {
        for (n, v) in &mut self.entries {
            if n.eq_ignore_ascii_case(name) {
                *v = match v {
                    AttrValue::Quoted(_) => AttrValue::Quoted(value.to_string()),
                    AttrValue::Plain(_) => AttrValue::Plain(value.to_string()),
                };
                return;
            }
        }
        self.entries
            .push((name.to_string(), AttrValue::Plain(value.to_string())));
    }

    /// Append a quoted attribute (used for values that may contain commas).
    pub fn set_quoted(&mut self, name: &str, value: &str) {
        for (n, v) in &mut self.entries {
            if n.eq_ignore_ascii_case(name) {
                *v = AttrValue::Quoted(value.to_string());
                return;
            }
        }
        self.entries
            .push((name.to_string(), AttrValue::Quoted(value.to_string())));
    }

    /// Remove an attribute; returns whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.entries.len() != before
    }

    /// Serialize back to a full tag line.
    pub fn to_line(&self, tag: &str) -> String {
        let attrs: Vec<String> = self
            .entries
            .iter()
            .map(|(n, v)| match v {
                AttrValue::Quoted(s) => format!("{n}=\"{s}\""),
                AttrValue::Plain(s) => format!("{n}={s}"),
            })
            .collect();
        format!("{tag}:{}", attrs.join(","))
    }
}

/// Split a tag line into `(tag, attribute text)`, e.g.
/// `#EXT-X-MEDIA:TYPE=AUDIO` → `("#EXT-X-MEDIA", "TYPE=AUDIO")`.
pub fn split_tag(line: &str) -> Option<(&str, &str)> {
    if !line.starts_with('#') {
        return None;
    }
    let colon = line.find(':')?;
    Some((&line[..colon], &line[colon + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MEDIA_LINE: &str = r#"TYPE=AUDIO,GROUP-ID="aac",NAME="English",LANGUAGE="en",DEFAULT=YES,CHANNELS="16/JOC",URI="audio/en.m3u8""#;

    #[test]
    fn parse_handles_quoted_commas() {
        let attrs = AttrList::parse(r#"CODECS="avc1.64001f,mp4a.40.2",BANDWIDTH=5000000"#);
        assert_eq!(attrs.get("CODECS"), Some("avc1.64001f,mp4a.40.2"));
        assert_eq!(attrs.get("BANDWIDTH"), Some("5000000"));
    }

    #[test]
    fn get_is_case_insensitive() {
        let attrs = AttrList::parse(MEDIA_LINE);
        assert_eq!(attrs.get("language"), Some("en"));
        assert_eq!(attrs.get("TYPE"), Some("AUDIO"));
    }

    #[test]
    fn roundtrip_preserves_quoting_and_order() {
        let attrs = AttrList::parse(MEDIA_LINE);
        assert_eq!(attrs.to_line("#EXT-X-MEDIA"), format!("#EXT-X-MEDIA:{MEDIA_LINE}"));
    }

    #[test]
    fn set_keeps_existing_quoting() {
        let mut attrs = AttrList::parse(MEDIA_LINE);
        attrs.set("CHANNELS", "16");
        attrs.set("DEFAULT", "NO");
        let line = attrs.to_line("#EXT-X-MEDIA");
        assert!(line.contains(r#"CHANNELS="16""#), "quoted stays quoted: {line}");
        assert!(line.contains("DEFAULT=NO"), "plain stays plain: {line}");
    }

    #[test]
    fn remove_deletes_attribute() {
        let mut attrs = AttrList::parse("BANDWIDTH=5000000,FRAME-RATE=50.000");
        assert!(attrs.remove("FRAME-RATE"));
        assert_eq!(attrs.to_line("#EXT-X-STREAM-INF"), "#EXT-X-STREAM-INF:BANDWIDTH=5000000");
        assert!(!attrs.remove("FRAME-RATE"));
    }

    #[test]
    fn split_tag_extracts_parts() {
        assert_eq!(
            split_tag("#EXT-X-MEDIA:TYPE=AUDIO"),
            Some(("#EXT-X-MEDIA", "TYPE=AUDIO"))
        );
        assert_eq!(split_tag("segment.ts"), None);
        assert_eq!(split_tag("#EXTM3U"), None);
    }
}
