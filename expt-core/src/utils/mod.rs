pub mod id;
pub mod retries;

/// Truncates `s` to at most `max_chars` characters without splitting a code point.
pub fn clamp_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_chars() {
        assert_eq!(clamp_chars("hello", 10), "hello");
        assert_eq!(clamp_chars("hello", 3), "hel");
        assert_eq!(clamp_chars("你好世界", 2), "你好");
        assert_eq!(clamp_chars("", 0), "");
    }
}
