//! Helpers for pulling JSON out of free-form model output.
//!
//! Models asked for "JSON only" still wrap it in code fences or lead with a
//! sentence of preamble. These helpers recover the object without trusting
//! the framing.

/// Strip markdown code fences from text. Removes leading/trailing
/// ` ```json ` / ` ``` ` markers that models sometimes wrap JSON in.
pub(crate) fn strip_markdown_fences(text: &str) -> String {
    let mut s = text.to_owned();
    if let Some(start) = s.find("```") {
        let fence_end = s[start + 3..]
            .find('\n')
            .map(|i| start + 3 + i + 1)
            .unwrap_or(start + 3);
        s.replace_range(start..fence_end, "");
    }
    if let Some(end) = s.rfind("```") {
        s.replace_range(end..end + 3, "");
    }
    s
}

/// Extract the outermost `{...}` JSON object from `text`, accounting
/// for nested braces and quoted strings. Returns the slice if balanced
/// braces are found, `None` otherwise.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Fence-strip then extract, returning an owned object string.
pub(crate) fn find_json_object(text: &str) -> Option<String> {
    let stripped = strip_markdown_fences(text);
    extract_json_object(stripped.trim()).map(str::to_owned)
}
