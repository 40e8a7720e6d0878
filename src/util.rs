//! Shared utility functions for the Nimbus crate.

/// Keep at most `max_chars` characters from the end of `text`, respecting
/// char boundaries. Used for log tails everywhere a bounded excerpt is
/// needed (live streaming, error context, archives).
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

/// Strip a surrounding triple-backtick fence (optionally tagged `json`)
/// from LLM output. Content without a fence is returned trimmed.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    match body.rfind("```") {
        Some(idx) => body[..idx].trim(),
        None => body.trim(),
    }
}

/// Number of newline characters in a file body; the pipeline sums this
/// across generated files to report lines of code.
pub fn count_newlines(content: &str) -> i64 {
    content.bytes().filter(|b| *b == b'\n').count() as i64
}

/// Truncate a prompt for list projections: at most `max` characters, with a
/// single `…` appended when anything was cut.
pub fn truncate_prompt(prompt: &str, max: usize) -> String {
    if prompt.chars().count() <= max {
        return prompt.to_string();
    }
    let mut out: String = prompt.chars().take(max).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_chars_short_input() {
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("", 10), "");
    }

    #[test]
    fn test_tail_chars_keeps_the_tail() {
        assert_eq!(tail_chars("abcdef", 3), "def");
    }

    #[test]
    fn test_tail_chars_respects_char_boundaries() {
        let text = "héllo wörld";
        let tail = tail_chars(text, 5);
        assert_eq!(tail, "wörld");
    }

    #[test]
    fn test_strip_code_fences_bare_json() {
        assert_eq!(strip_code_fences(r#"{"files": []}"#), r#"{"files": []}"#);
    }

    #[test]
    fn test_strip_code_fences_tagged() {
        let fenced = "```json\n{\"files\": []}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"files\": []}");
    }

    #[test]
    fn test_strip_code_fences_untagged() {
        let fenced = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"a\": 1}");
    }

    #[test]
    fn test_strip_code_fences_with_surrounding_whitespace() {
        let fenced = "  ```json\n{}\n```  ";
        assert_eq!(strip_code_fences(fenced), "{}");
    }

    #[test]
    fn test_count_newlines() {
        assert_eq!(count_newlines(""), 0);
        assert_eq!(count_newlines("one line, no terminator"), 0);
        assert_eq!(count_newlines("a\nb\nc\n"), 3);
    }

    #[test]
    fn test_truncate_prompt_boundary() {
        let exactly_100: String = "x".repeat(100);
        assert_eq!(truncate_prompt(&exactly_100, 100), exactly_100);

        let one_oh_one: String = "x".repeat(101);
        let truncated = truncate_prompt(&one_oh_one, 100);
        assert_eq!(truncated.chars().count(), 101);
        assert!(truncated.ends_with('…'));
        assert!(truncated.starts_with(&"x".repeat(100)));
    }
}
