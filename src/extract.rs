use serde_json::Value;

use crate::error::ScrapeError;

/// A balanced JSON object located inside a larger document.
/// `doc[start..end]` is the exact payload text; `value` is its decoded form.
pub struct ExtractedPayload {
    pub start: usize,
    pub end: usize,
    pub value: Value,
}

/// Locate and decode the JSON payload attached to `marker` in `doc`.
pub fn payload(doc: &str, marker: &str) -> Result<ExtractedPayload, ScrapeError> {
    let start = payload_start(doc, marker)?;
    let end = balanced_end(doc, start)?;
    let value: Value = serde_json::from_str(&doc[start..end])?;
    Ok(ExtractedPayload { start, end, value })
}

/// Find the offset of the `{` opening the payload that follows `marker`.
///
/// Sites embed the payload either as a script-tag body
/// (`<script id="...">{...}`) or as an assignment (`window.X = {...}`), so
/// after each marker occurrence we skip whitespace and at most one `=`
/// before requiring `{`. An occurrence followed by anything else (the marker
/// quoted inside an attribute value, mentioned in inline JS, etc.) is not a
/// payload; we move on to the next occurrence.
pub fn payload_start(doc: &str, marker: &str) -> Result<usize, ScrapeError> {
    let bytes = doc.as_bytes();
    let mut from = 0;
    while let Some(found) = doc[from..].find(marker) {
        let mut i = from + found + marker.len();
        let mut seen_eq = false;
        loop {
            match bytes.get(i) {
                Some(b' ' | b'\t' | b'\r' | b'\n') => i += 1,
                Some(b'=') if !seen_eq => {
                    seen_eq = true;
                    i += 1;
                }
                Some(b'{') => return Ok(i),
                _ => break,
            }
        }
        from += found + marker.len();
    }
    Err(ScrapeError::MarkerAbsent)
}

/// Given `doc` with an opening `{` at `start`, return the offset one past
/// the brace that closes it.
///
/// A plain bracket count misfires on payloads whose string values contain
/// literal braces (addresses, descriptions), so the scan tracks string
/// state: an unescaped `"` toggles in-string, a backslash escapes exactly
/// the next byte, and brackets only count outside strings. All state bytes
/// are ASCII, so scanning raw bytes is safe for UTF-8 content.
pub fn balanced_end(doc: &str, start: usize) -> Result<usize, ScrapeError> {
    debug_assert_eq!(doc.as_bytes().get(start), Some(&b'{'));
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in doc.as_bytes().iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' => escaped = true,
            b'"' => in_string = !in_string,
            b'{' | b'[' if !in_string => depth += 1,
            b'}' | b']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Ok(i + 1);
                }
            }
            _ => {}
        }
    }
    Err(ScrapeError::UnterminatedPayload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignment_form() {
        let doc = r#"<script>window.__INITIAL_DATA__ = {"a": 1};</script>"#;
        let p = payload(doc, "__INITIAL_DATA__").unwrap();
        assert_eq!(&doc[p.start..p.end], r#"{"a": 1}"#);
        assert_eq!(p.value["a"], 1);
    }

    #[test]
    fn script_tag_form() {
        let doc = r#"<script id="__NEXT_DATA__" type="application/json">{"props":{}}</script>"#;
        let marker = r#"<script id="__NEXT_DATA__" type="application/json">"#;
        let p = payload(doc, marker).unwrap();
        assert_eq!(&doc[p.start..p.end], r#"{"props":{}}"#);
    }

    #[test]
    fn braces_inside_strings() {
        let doc = r#"X = {"address": "Suite {4B}", "note": "[sic]", "n": [1, 2]}"#;
        let p = payload(doc, "X").unwrap();
        assert_eq!(p.end, doc.len());
        assert_eq!(p.value["address"], "Suite {4B}");
    }

    #[test]
    fn escaped_quotes_inside_strings() {
        let doc = r#"X = {"desc": "he said \"{\" and \\", "k": 2} trailing"#;
        let p = payload(doc, "X").unwrap();
        assert_eq!(p.value["k"], 2);
        assert_eq!(p.value["desc"], r#"he said "{" and \"#);
    }

    #[test]
    fn marker_only_in_attribute_skipped() {
        // First occurrence is quoted inside an attribute; the real payload
        // follows the second occurrence.
        let doc = r#"<div data-x="__DATA__">ignore</div><script>__DATA__={"ok":true}</script>"#;
        let p = payload(doc, "__DATA__").unwrap();
        assert_eq!(p.value["ok"], true);
    }

    #[test]
    fn marker_never_followed_by_object() {
        let doc = r#"<div data-x="__DATA__">no payload here</div>"#;
        assert!(matches!(
            payload_start(doc, "__DATA__"),
            Err(ScrapeError::MarkerAbsent)
        ));
    }

    #[test]
    fn marker_missing_entirely() {
        assert!(matches!(
            payload_start("<html></html>", "__DATA__"),
            Err(ScrapeError::MarkerAbsent)
        ));
    }

    #[test]
    fn truncated_document() {
        let doc = r#"X = {"a": {"b": 1}"#;
        assert!(matches!(
            payload(doc, "X"),
            Err(ScrapeError::UnterminatedPayload)
        ));
    }

    #[test]
    fn unterminated_string() {
        let doc = r#"X = {"a": "never closes}"#;
        assert!(matches!(
            payload(doc, "X"),
            Err(ScrapeError::UnterminatedPayload)
        ));
    }

    #[test]
    fn balanced_but_invalid_json() {
        let doc = "X = {not json}";
        assert!(matches!(payload(doc, "X"), Err(ScrapeError::Decode(_))));
    }

    #[test]
    fn nested_arrays_and_objects() {
        let doc = r#"pre X = {"media": [{"url": "a.jpg"}, {"url": "b{}.jpg"}]} post"#;
        let p = payload(doc, "X").unwrap();
        assert!(doc[p.start..p.end].ends_with('}'));
        assert_eq!(p.value["media"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn utf8_content_in_strings() {
        let doc = r#"X = {"address": "Övre Husargatan 27 — café"}"#;
        let p = payload(doc, "X").unwrap();
        assert_eq!(p.value["address"], "Övre Husargatan 27 — café");
    }
}
