//! Markup and control-character stripping for text crossing the wire.
//!
//! Everything the user or the server can inject into the UI passes through
//! here: outbound envelope keys and values, reply text, room titles, access
//! ids and transcript fragments.

use serde_json::{Map, Value};

/// Elements whose content is dropped together with the tags.
const RAW_TEXT_ELEMENTS: [&str; 2] = ["script", "style"];

/// Strip markup tags and control characters from `input`.
///
/// A `<` only opens a tag when followed by a letter, `/`, `!` or `?`, so
/// plain comparisons like `a < b` survive. Newlines and tabs are kept.
#[must_use]
pub fn sanitize_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = find_tag_start(rest) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find('>') else {
            // Unterminated tag: nothing after it can be trusted as text.
            rest = "";
            break;
        };
        let tag = &tail[1..end];
        rest = &tail[end + 1..];

        if let Some(element) = raw_text_element(tag) {
            rest = skip_past_closing(rest, element);
        }
    }
    out.push_str(rest);

    out.retain(|c| !c.is_control() || c == '\n' || c == '\t');
    out
}

/// Recursively sanitize every string key and value of a JSON value.
#[must_use]
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_text(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(sanitize_map(map)),
        other => other,
    }
}

/// Sanitize the keys and values of a JSON object.
#[must_use]
pub fn sanitize_map(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .map(|(k, v)| (sanitize_text(&k), sanitize_value(v)))
        .collect()
}

fn find_tag_start(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    s.match_indices('<').map(|(i, _)| i).find(|&i| {
        bytes
            .get(i + 1)
            .is_some_and(|b| b.is_ascii_alphabetic() || matches!(b, b'/' | b'!' | b'?'))
    })
}

fn raw_text_element(tag: &str) -> Option<&'static str> {
    if tag.starts_with('/') || tag.ends_with('/') {
        return None;
    }
    let name: String = tag
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    RAW_TEXT_ELEMENTS.into_iter().find(|e| *e == name)
}

fn skip_past_closing<'a>(rest: &'a str, element: &str) -> &'a str {
    let closing = format!("</{element}");
    // ASCII lowercasing keeps byte offsets aligned with `rest`.
    let lowered = rest.to_ascii_lowercase();
    match lowered.find(&closing) {
        Some(i) => match rest[i..].find('>') {
            Some(end) => &rest[i + end + 1..],
            None => "",
        },
        None => "",
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    #[test]
    fn strips_tags_and_keeps_text() {
        assert_eq!(sanitize_text("<b>hello</b> world"), "hello world");
        assert_eq!(sanitize_text("<img src=x onerror=alert(1)>hi"), "hi");
    }

    #[test]
    fn drops_script_bodies() {
        assert_eq!(
            sanitize_text("before<SCRIPT>alert('x')</Script>after"),
            "beforeafter"
        );
    }

    #[test]
    fn keeps_comparisons_and_non_ascii() {
        assert_eq!(sanitize_text("1 < 2 and 3 > 2"), "1 < 2 and 3 > 2");
        assert_eq!(sanitize_text("こんにちは<br/>世界"), "こんにちは世界");
    }

    #[test]
    fn removes_control_characters_but_not_newlines() {
        assert_eq!(sanitize_text("a\u{0}b\u{7}c\nd\te"), "abc\nd\te");
    }

    #[test]
    fn unterminated_tag_is_discarded() {
        assert_eq!(sanitize_text("safe<script src="), "safe");
    }

    #[test]
    fn sanitizes_nested_values_and_keys() {
        let value = json!({
            "<i>message</i>": "<b>hi</b>",
            "list": ["<p>one</p>", 2, null],
            "nested": {"text": "x\u{1b}y"}
        });
        let clean = sanitize_value(value);
        assert_eq!(
            clean,
            json!({
                "message": "hi",
                "list": ["one", 2, null],
                "nested": {"text": "xy"}
            })
        );
    }
}
