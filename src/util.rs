//! Utility functions shared by the chat and history modules.

/// Keep at most `max_chars` characters of `s`, cutting on a character boundary.
///
/// Used for conversation previews, which are a plain prefix with no marker.
///
/// # Examples
/// ```
/// use chatrelay::util::truncate_chars;
///
/// assert_eq!(truncate_chars("hello world", 5), "hello");
/// assert_eq!(truncate_chars("Hello 🦀 World", 7), "Hello 🦀");
/// assert_eq!(truncate_chars("", 10), "");
/// ```
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// Truncate a string to at most `max_chars` characters, appending "..." if truncated.
///
/// Safe for multi-byte UTF-8 input. Used to keep prompts short in log lines.
///
/// # Examples
/// ```
/// use chatrelay::util::truncate_with_ellipsis;
///
/// assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
/// assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
/// assert_eq!(truncate_with_ellipsis("😀😀😀😀", 2), "😀😀...");
/// ```
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}
