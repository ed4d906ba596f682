use serde_json::Value;
use sha2::{Digest, Sha256};

/// Stable, machine-readable marker. Dashboards and IDE integrations grep for
/// it; never change the shape.
const MARKER_TAG: &str = "KIMI_PROXY_OBSERVATION_MASKED";

#[derive(Debug, Clone, Copy)]
pub struct MaskPolicy {
    pub threshold: usize,
    pub head: usize,
    pub tail: usize,
}

impl Default for MaskPolicy {
    fn default() -> Self {
        Self {
            threshold: 4000,
            head: 2000,
            tail: 2000,
        }
    }
}

/// A string the sanitizer replaced, with enough context to persist the
/// original as a hash-addressed blob.
#[derive(Debug, Clone)]
pub struct MaskedString {
    pub content_hash: String,
    pub original: String,
    pub original_chars: usize,
    pub preview: String,
}

/// Mask one string. Returns `None` when the text is at or under the
/// threshold; lengths are measured in characters, not bytes.
pub fn mask_text(text: &str, policy: &MaskPolicy) -> Option<(String, MaskedString)> {
    let original_chars = text.chars().count();
    if original_chars <= policy.threshold {
        return None;
    }

    let head: String = text.chars().take(policy.head).collect();
    let tail_start = original_chars.saturating_sub(policy.tail);
    let tail: String = text.chars().skip(tail_start).collect();

    let masked = format!(
        "{head} ⟦{MARKER_TAG} original_chars={original_chars} head={} tail={}⟧ {tail}",
        policy.head.min(original_chars),
        policy.tail.min(original_chars),
    );

    let record = MaskedString {
        content_hash: sha256_hex(text.as_bytes()),
        original: text.to_string(),
        original_chars,
        preview: head.chars().take(120).collect(),
    };
    Some((masked, record))
}

/// Recursively mask every string field reachable from `value`. Used on the
/// `result` and `error.data` subtrees of gateway replies.
pub fn mask_json_strings(value: &mut Value, policy: &MaskPolicy, masked: &mut Vec<MaskedString>) {
    match value {
        Value::String(text) => {
            if let Some((replacement, record)) = mask_text(text, policy) {
                masked.push(record);
                *text = replacement;
            }
        }
        Value::Array(items) => {
            for item in items {
                mask_json_strings(item, policy, masked);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                mask_json_strings(item, policy, masked);
            }
        }
        _ => {}
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> MaskPolicy {
        MaskPolicy::default()
    }

    #[test]
    fn under_threshold_is_untouched() {
        let text = "A".repeat(3999);
        assert!(mask_text(&text, &policy()).is_none());
        let exactly = "A".repeat(4000);
        assert!(mask_text(&exactly, &policy()).is_none());
    }

    #[test]
    fn over_threshold_masks_with_exact_counts() {
        let text = "A".repeat(4001);
        let (masked, record) = mask_text(&text, &policy()).unwrap();
        assert!(masked.contains("⟦KIMI_PROXY_OBSERVATION_MASKED original_chars=4001 head=2000 tail=2000⟧"));
        assert!(masked.starts_with(&"A".repeat(2000)));
        assert!(masked.ends_with(&"A".repeat(2000)));
        assert_eq!(record.original_chars, 4001);
        assert_eq!(record.content_hash.len(), 64);
    }

    #[test]
    fn masked_length_is_head_marker_tail() {
        let text = "B".repeat(5000);
        let (masked, record) = mask_text(&text, &policy()).unwrap();
        let marker = format!("⟦{MARKER_TAG} original_chars=5000 head=2000 tail=2000⟧");
        assert_eq!(
            masked.chars().count(),
            2000 + 1 + marker.chars().count() + 1 + 2000
        );
        assert_eq!(record.preview.chars().count(), 120);
    }

    #[test]
    fn char_counting_is_not_byte_counting() {
        // Multibyte characters: 4001 chars but far more bytes.
        let text = "é".repeat(4001);
        let (masked, record) = mask_text(&text, &policy()).unwrap();
        assert_eq!(record.original_chars, 4001);
        assert!(masked.contains("original_chars=4001"));
    }

    #[test]
    fn recursive_masking_walks_nested_structures() {
        let mut value = serde_json::json!({
            "text": "C".repeat(5000),
            "nested": {"inner": ["short", "D".repeat(4500)]},
            "count": 7,
        });
        let mut masked = Vec::new();
        mask_json_strings(&mut value, &policy(), &mut masked);
        assert_eq!(masked.len(), 2);
        assert!(value["text"].as_str().unwrap().contains(MARKER_TAG));
        assert_eq!(value["nested"]["inner"][0], "short");
        assert!(value["nested"]["inner"][1].as_str().unwrap().contains(MARKER_TAG));
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
