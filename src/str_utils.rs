/// Safely returns a prefix of the string with at most `max_chars` characters.
/// This respects UTF-8 character boundaries.
pub fn prefix_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Safely returns a suffix of the string with at most `max_chars` characters.
pub fn suffix_chars(s: &str, max_chars: usize) -> &str {
    let char_count = s.chars().count();
    if char_count <= max_chars {
        return s;
    }
    match s.char_indices().nth(char_count - max_chars) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Truncates to `max_chars` characters, appending `...` when anything was cut.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    let prefix = prefix_chars(s, max_chars);
    if prefix.len() == s.len() {
        s.to_string()
    } else {
        format!("{}...", prefix)
    }
}

/// Collapses every run of whitespace (including newlines) into a single space.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Masks a secret for display: first and last four characters only.
pub fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= 8 {
        return "****".to_string();
    }
    format!("{}…{}", prefix_chars(secret, 4), suffix_chars(secret, 4))
}

/// Returns the largest char boundary that is `<= idx`.
pub fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    let mut i = idx;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_and_suffix_respect_utf8() {
        assert_eq!(prefix_chars("héllo", 2), "hé");
        assert_eq!(suffix_chars("héllo", 3), "llo");
        assert_eq!(prefix_chars("abc", 10), "abc");
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(truncate_with_ellipsis("short", 10), "short");
        assert_eq!(truncate_with_ellipsis("abcdefghij", 4), "abcd...");
        assert_eq!(truncate_with_ellipsis("日本語テキスト", 3), "日本語...");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk-1234567890abcd"), "sk-1…abcd");
        assert_eq!(mask_secret("tiny"), "****");
        assert_eq!(mask_secret("12345678"), "****");
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "aé";
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 3), 3);
        assert_eq!(floor_char_boundary(s, 99), 3);
    }
}
