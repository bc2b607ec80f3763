//! Shared utility functions used across multiple modules.

use uuid::Uuid;

/// Alphabet for share codes; ambiguous glyphs (0/O, 1/I) are left out.
const SHARE_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const SHARE_CODE_LEN: usize = 6;

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a short, human-typeable share code.
pub fn generate_share_code() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(SHARE_CODE_LEN)
        .map(|byte| char::from(SHARE_CODE_ALPHABET[usize::from(*byte) % SHARE_CODE_ALPHABET.len()]))
        .collect()
}

/// Normalize a share code typed by a user (case and surrounding whitespace).
pub fn normalize_share_code(value: &str) -> Option<String> {
    normalize_text_option(Some(value.to_string())).map(|code| code.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" Spring Cup ".to_string())),
            Some("Spring Cup".to_string())
        );
    }

    #[test]
    fn share_codes_use_restricted_alphabet() {
        let code = generate_share_code();
        assert_eq!(code.len(), SHARE_CODE_LEN);
        assert!(code.bytes().all(|byte| SHARE_CODE_ALPHABET.contains(&byte)));
    }

    #[test]
    fn normalize_share_code_uppercases() {
        assert_eq!(normalize_share_code(" ab3xyz "), Some("AB3XYZ".to_string()));
        assert_eq!(normalize_share_code("  "), None);
    }
}
