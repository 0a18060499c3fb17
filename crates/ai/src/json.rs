//! Lenient extraction of JSON from model output.

use serde::de::DeserializeOwned;

use crate::error::{AiError, AiResult};

/// Slice of `raw` from the first `{`/`[` to the last `}`/`]`.
///
/// Models wrap JSON in code fences or a sentence of prose often enough that
/// parsing the raw answer directly is not an option.
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let start = trimmed.find(['{', '[']);
    let end = trimmed.rfind(['}', ']']);
    match (start, end) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    }
}

/// Deserialize a model answer; `what` names the payload in the error.
pub fn parse_json<T: DeserializeOwned>(raw: &str, what: &str) -> AiResult<T> {
    serde_json::from_str(extract_json(raw))
        .map_err(|e| AiError::Parse(format!("invalid {what} response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Verdict {
        consistent: bool,
    }

    #[test]
    fn strips_code_fences_and_prose() {
        let raw = "Sure, here you go:\n```json\n{\"consistent\": true}\n```\n";
        assert_eq!(extract_json(raw), "{\"consistent\": true}");
        let v: Verdict = parse_json(raw, "verdict").unwrap();
        assert!(v.consistent);
    }

    #[test]
    fn plain_json_is_untouched() {
        assert_eq!(extract_json(" [1, 2] "), "[1, 2]");
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let err = parse_json::<Verdict>("I cannot help with that.", "verdict").unwrap_err();
        assert!(matches!(err, AiError::Parse(msg) if msg.contains("verdict")));
    }
}
