//! Reversible label/annotation codec.
//!
//! The backend `labels` property is a flat `K:V;K:V;…` string over a
//! restricted alphabet, so every CRI key and value is base64-encoded
//! (URL-safe, no padding) before storage. Keys additionally carry a
//! namespace prefix separating labels from annotations:
//! stored key = `<prefix>.<b64(k)>`, stored value = `<b64(v)>`.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Namespace prefix for CRI labels.
pub const LABEL_PREFIX: &str = "LABEL";

/// Namespace prefix for CRI annotations.
pub const ANNOTATION_PREFIX: &str = "ANNOTATION";

fn convert_base64(src: &str, encode: bool) -> String {
    if encode {
        return URL_SAFE_NO_PAD.encode(src.as_bytes());
    }
    // Tolerate alien labels foreign to the shim: return them unchanged.
    match URL_SAFE_NO_PAD.decode(src.as_bytes()) {
        Ok(bytes) => String::from_utf8(bytes).unwrap_or_else(|_| src.to_string()),
        Err(_) => src.to_string(),
    }
}

/// Convert one key or value between CRI form and stored form.
///
/// `to_porto = true` encodes (and prefixes, when `prefix` is non-empty);
/// `false` strips the prefix and decodes.
pub fn convert_label(src: &str, to_porto: bool, prefix: &str) -> String {
    if to_porto {
        let encoded = convert_base64(src, true);
        if prefix.is_empty() {
            encoded
        } else {
            format!("{}.{}", prefix, encoded)
        }
    } else {
        let stripped = if prefix.is_empty() {
            src
        } else {
            src.strip_prefix(&format!("{}.", prefix)).unwrap_or(src)
        };
        convert_base64(stripped, false)
    }
}

/// Render a CRI map into the stored `K:V;…` form. Keys are emitted in
/// sorted order so the property value is deterministic.
pub fn render(labels: &HashMap<String, String>, prefix: &str) -> String {
    let mut pairs: Vec<(&String, &String)> = labels.iter().collect();
    pairs.sort_by_key(|(k, _)| k.as_str());

    let mut out = String::new();
    for (key, value) in pairs {
        out.push_str(&convert_label(key, true, prefix));
        out.push(':');
        out.push_str(&convert_label(value, true, ""));
        out.push(';');
    }
    out
}

/// Parse a stored `labels` property back into the CRI map, keeping only
/// entries under `prefix`.
pub fn parse(raw: &str, prefix: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in raw.split(';') {
        let Some((key, value)) = pair.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if !prefix.is_empty() && !key.starts_with(prefix) {
            continue;
        }
        out.insert(
            convert_label(key, false, prefix),
            convert_label(value, false, ""),
        );
    }
    out
}

/// Backend indexed-property key for one label: `labels[<stored key>]`.
/// Reading through the index avoids parsing the whole string.
pub fn indexed_property(label: &str, prefix: &str) -> String {
    format!("labels[{}]", convert_label(label, true, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_all_prefixes() {
        for prefix in [LABEL_PREFIX, ANNOTATION_PREFIX, ""] {
            for src in [
                "io.kubernetes.pod.uid",
                "u-1",
                "",
                "with spaces & symbols: ;/=",
                "кириллица",
            ] {
                let stored = convert_label(src, true, prefix);
                assert_eq!(convert_label(&stored, false, prefix), src);
            }
        }
    }

    #[test]
    fn test_decode_failure_returns_input() {
        // '!' is outside the base64 alphabet.
        assert_eq!(convert_label("not!base64!", false, ""), "not!base64!");
    }

    #[test]
    fn test_stored_form_shape() {
        let mut labels = HashMap::new();
        labels.insert("io.kubernetes.pod.uid".to_string(), "u-1".to_string());
        let raw = render(&labels, LABEL_PREFIX);

        let key_b64 = URL_SAFE_NO_PAD.encode("io.kubernetes.pod.uid");
        let value_b64 = URL_SAFE_NO_PAD.encode("u-1");
        assert_eq!(raw, format!("LABEL.{}:{};", key_b64, value_b64));
    }

    #[test]
    fn test_parse_filters_by_prefix() {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "web".to_string());
        let mut annotations = HashMap::new();
        annotations.insert("note".to_string(), "x".to_string());

        let raw = format!(
            "{}{}",
            render(&labels, LABEL_PREFIX),
            render(&annotations, ANNOTATION_PREFIX)
        );

        let parsed_labels = parse(&raw, LABEL_PREFIX);
        assert_eq!(parsed_labels.len(), 1);
        assert_eq!(parsed_labels.get("app").unwrap(), "web");

        let parsed_annotations = parse(&raw, ANNOTATION_PREFIX);
        assert_eq!(parsed_annotations.len(), 1);
        assert_eq!(parsed_annotations.get("note").unwrap(), "x");
    }

    #[test]
    fn test_parse_tolerates_junk() {
        let parsed = parse("nocolon;also-bad", LABEL_PREFIX);
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_render_sorted_and_parse_roundtrip() {
        let mut labels = HashMap::new();
        labels.insert("b".to_string(), "2".to_string());
        labels.insert("a".to_string(), "1".to_string());
        labels.insert("c".to_string(), "3".to_string());

        let raw = render(&labels, LABEL_PREFIX);
        assert_eq!(parse(&raw, LABEL_PREFIX), labels);

        // Sorted keys: the encoded form of "a" must appear first.
        let first = raw.split(';').next().unwrap();
        assert!(first.starts_with(&format!("LABEL.{}", URL_SAFE_NO_PAD.encode("a"))));
    }

    #[test]
    fn test_indexed_property() {
        let prop = indexed_property("io.kubernetes.pod.namespace", LABEL_PREFIX);
        let encoded = URL_SAFE_NO_PAD.encode("io.kubernetes.pod.namespace");
        assert_eq!(prop, format!("labels[LABEL.{}]", encoded));
    }
}
