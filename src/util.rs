//! Content digesting helpers shared by the step engine and fingerprints.

use sha2::{Digest, Sha256};

pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn digest_str(s: &str) -> String {
    digest_bytes(s.as_bytes())
}

/// Digest a JSON value through its canonical serialization.
///
/// `serde_json` keeps map ordering stable for `BTreeMap`-backed structures,
/// which is what every digested type in this crate serializes through.
pub fn digest_json(value: &serde_json::Value) -> String {
    digest_str(&value.to_string())
}

/// First `max` characters of `s` with newlines collapsed, for log excerpts.
pub fn excerpt(s: &str, max: usize) -> String {
    let flat: String = s
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    let trimmed = flat.trim();
    if trimmed.chars().count() <= max {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(max).collect();
        format!("{}…", cut.trim_end())
    }
}
