use crate::util::truncate;
use serde::de::DeserializeOwned;

/// How much of the offending model text an extraction error carries
const ERROR_EXCERPT_CHARS: usize = 500;

/// Locate the first JSON object in free-form model output.
///
/// Scans from the first `{`, tracking brace depth and skipping over string
/// literals (escaped quotes included), and returns the slice up to the
/// matching `}`. Code fences and prose on either side are ignored. When the
/// object never closes, everything from the first `{` onward is returned so
/// the decode error points at the real problem; with no `{` at all, the
/// trimmed input comes back unchanged.
pub fn extract_json_object(text: &str) -> &str {
    let Some(start) = text.find('{') else {
        return text.trim();
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return &text[start..start + offset + 1];
                }
            }
            _ => {}
        }
    }

    &text[start..]
}

/// Extract and decode a JSON object of type `T` from model output.
///
/// `what` names the expected result in the error ("diagnosis", "fix").
pub fn decode_structured<T: DeserializeOwned>(text: &str, what: &str) -> anyhow::Result<T> {
    let candidate = extract_json_object(text);
    serde_json::from_str(candidate).map_err(|e| {
        anyhow::anyhow!(
            "Failed to parse {} from model output: {}\n--- model output ---\n{}",
            what,
            e,
            truncate(text, ERROR_EXCERPT_CHARS)
        )
    })
}
