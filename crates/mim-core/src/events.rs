//! Inbound event channel: the typed messages the kernel accepts from the
//! messaging runtime (or from the spool directory the CLI drops into), and
//! the out-of-band signals.

use serde::{Deserialize, Serialize};

use crate::task::MediaKind;

/// One inbound message, already stripped to what intake needs. `fetch_url`
/// is how the payload is materialized; attachment handles from a messaging
/// runtime surface as URLs its adapter can serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Attached document (archives arrive this way).
    Document {
        name: String,
        size: u64,
        #[serde(default)]
        mime: Option<String>,
        fetch_url: String,
        #[serde(default)]
        source_ref: Option<String>,
    },
    /// Attached photo or video.
    Media {
        kind: MediaKind,
        name: String,
        size: u64,
        fetch_url: String,
        #[serde(default)]
        source_ref: Option<String>,
    },
    /// Plain text, possibly carrying external CDN/WebDAV links.
    Text {
        text: String,
        #[serde(default)]
        source_ref: Option<String>,
        #[serde(default)]
        auth_token: Option<String>,
    },
}

impl InboundEvent {
    pub fn source_ref(&self) -> Option<&str> {
        match self {
            InboundEvent::Document { source_ref, .. }
            | InboundEvent::Media { source_ref, .. }
            | InboundEvent::Text { source_ref, .. } => source_ref.as_deref(),
        }
    }
}

/// Out-of-band control signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// Network interface changed; gates download admission under a
    /// wifi-only policy.
    NetworkChanged { on_wifi: bool },
    /// Secret for the archive currently blocked awaiting one.
    ArchiveSecret { archive_name: String, secret: String },
    /// Operator canceled the currently running task.
    CancelCurrent,
    /// Adapter re-authenticated; the upload stage may resume.
    AuthRestored,
}

/// Pull `http(s)://` links out of a plain-text message, in order, deduped.
pub fn extract_links(text: &str) -> Vec<String> {
    let re = regex::Regex::new(r#"https?://[^\s<>"']+"#).expect("static regex");
    let mut seen = std::collections::HashSet::new();
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ')', ']']).to_string())
        .filter(|l| seen.insert(l.clone()))
        .collect()
}

/// Collection-shaped links get crawled rather than fetched.
pub fn looks_like_collection(url: &str) -> bool {
    match url::Url::parse(url) {
        Ok(u) => u.path().ends_with('/') || u.path().is_empty(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_links_in_order_without_duplicates() {
        let text = "grab https://cdn.example/a.zip and https://dav.example/share/, \
                    also https://cdn.example/a.zip again";
        let links = extract_links(text);
        assert_eq!(
            links,
            vec![
                "https://cdn.example/a.zip".to_string(),
                "https://dav.example/share/".to_string(),
            ]
        );
    }

    #[test]
    fn trailing_punctuation_is_stripped() {
        let links = extract_links("see https://cdn.example/file.mp4.");
        assert_eq!(links, vec!["https://cdn.example/file.mp4".to_string()]);
    }

    #[test]
    fn collection_detection() {
        assert!(looks_like_collection("https://dav.example/share/"));
        assert!(!looks_like_collection("https://cdn.example/a.zip"));
        assert!(!looks_like_collection("not-a-url"));
    }

    #[test]
    fn event_json_roundtrip() {
        let event = InboundEvent::Document {
            name: "A.zip".into(),
            size: 123,
            mime: Some("application/zip".into()),
            fetch_url: "https://cdn.example/A.zip".into(),
            source_ref: Some("msg:42".into()),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: InboundEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.source_ref(), Some("msg:42"));
        assert!(json.contains("\"type\":\"document\""));
    }
}
