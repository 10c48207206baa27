//! Text helpers shared by the oracle adapter and the audit pass.

/// Strips control characters and collapses runs of whitespace.
pub fn sanitize_string(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_control() && !c.is_whitespace() { '\0' } else { c })
        .filter(|&c| c != '\0')
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rejects blank text and the junk placeholders oracles tend to emit.
pub fn is_valid_string(text: &str) -> bool {
    let cleaned = text.trim();
    if cleaned.chars().count() < 2 {
        return false;
    }

    let lowered = cleaned.to_lowercase();
    if matches!(lowered.as_str(), "null" | "undefined" | "none" | "n/a" | "\"\"" | "''") {
        return false;
    }

    // only quotes, brackets, commas or escaped newlines
    !cleaned
        .chars()
        .all(|c| matches!(c, '"' | '\'' | '{' | '}' | '[' | ']' | ',' | '\\' | 'n' | ' '))
}

/// Like [`is_valid_string`] but for extracted values, which may be a single
/// character ("2" rack units, "4" fan modules).
pub fn is_valid_value(text: &str) -> bool {
    let cleaned = text.trim();
    if cleaned.is_empty() {
        return false;
    }

    let lowered = cleaned.to_lowercase();
    if matches!(lowered.as_str(), "null" | "undefined" | "none" | "n/a" | "\"\"" | "''") {
        return false;
    }

    !cleaned
        .chars()
        .all(|c| matches!(c, '"' | '\'' | '{' | '}' | '[' | ']' | ',' | '\\' | ' '))
}

/// First `max_chars` characters, with an ellipsis when truncated.
pub fn content_preview(text: &str, max_chars: usize) -> String {
    let sanitized = sanitize_string(text);
    if sanitized.chars().count() <= max_chars {
        return sanitized;
    }
    let truncated: String = sanitized.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

/// Extracts the JSON payload from a reply that may be wrapped in prose or code fences.
pub fn clean_json_output(raw: &str) -> String {
    let object = raw.find('{').zip(raw.rfind('}'));
    let array = raw.find('[').zip(raw.rfind(']'));

    let span = match (object, array) {
        (Some(o), Some(a)) => Some(if a.0 < o.0 { a } else { o }),
        (Some(o), None) => Some(o),
        (None, Some(a)) => Some(a),
        (None, None) => None,
    };

    match span {
        Some((start, end)) if start < end => raw[start..=end].to_string(),
        _ => raw.trim().to_string(),
    }
}

/// Lower-cased ASCII alphanumerics only, used for tolerant value lookup.
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Finds `value` in `body` and returns it with `radius` characters of context on each side.
///
/// Exact (case-insensitive) matches are tried first; otherwise the normalized
/// forms are compared and the surrounding window of the first normalized hit
/// is returned.
pub fn locate_snippet(body: &str, value: &str, radius: usize) -> Option<String> {
    let needle = value.trim();
    if needle.is_empty() {
        return None;
    }

    let chars: Vec<char> = body.chars().collect();
    let lowered: Vec<char> = chars.iter().flat_map(|c| c.to_lowercase()).collect();
    let needle_lower: Vec<char> = needle.chars().flat_map(|c| c.to_lowercase()).collect();

    // lowering can change length for some scripts; only trust exact search when it didn't
    if lowered.len() == chars.len() {
        if let Some(start) = find_subslice(&lowered, &needle_lower) {
            return Some(window(&chars, start, start + needle_lower.len(), radius));
        }
    }

    let normalized_needle = normalize(needle);
    if normalized_needle.is_empty() {
        return None;
    }

    // map each normalized character back to its position in the original text
    let mut positions = Vec::new();
    let mut normalized_body = String::new();
    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_alphanumeric() {
            normalized_body.push(c.to_ascii_lowercase());
            positions.push(i);
        }
    }

    let hit = normalized_body.find(&normalized_needle)?;
    let start = positions[hit];
    let end = positions[hit + normalized_needle.len() - 1] + 1;
    Some(window(&chars, start, end, radius))
}

fn find_subslice(haystack: &[char], needle: &[char]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn window(chars: &[char], start: usize, end: usize, radius: usize) -> String {
    let from = start.saturating_sub(radius);
    let to = (end + radius).min(chars.len());
    chars[from..to].iter().collect::<String>().trim().to_string()
}
