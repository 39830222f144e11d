//! Content fingerprints used as metadata keys.
//!
//! Only case and surrounding whitespace are normalised. Internal whitespace
//! and diacritics (kahakō, ʻokina) are significant.

pub fn normalize_sentence(text: &str) -> String { text.trim().to_lowercase() }

/// Lowercase hex BLAKE3 digest of the normalised sentence text.
pub fn fingerprint(text: &str) -> String {
    blake3::hash(normalize_sentence(text).as_bytes()).to_hex().to_string()
}
