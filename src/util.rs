use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// First few characters of a caller key or token, for log lines.
pub fn key_prefix(k: &str) -> &str {
    let mut end = k.len().min(8);
    while !k.is_char_boundary(end) {
        end -= 1;
    }
    &k[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_prefix_truncates() {
        assert_eq!(key_prefix("sk-abcdefghij"), "sk-abcde");
        assert_eq!(key_prefix("short"), "short");
    }
}
