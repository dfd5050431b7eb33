//! Secret redaction for outward-facing views
//!
//! Values under sensitive key names are replaced with [`MASK`] at any depth.
//! Stored records keep the original values.

use serde_json::Value;

/// Replacement for masked values
pub const MASK: &str = "***";

/// Key fragments treated as sensitive (matched case-insensitively as substrings)
const SENSITIVE_KEYS: &[&str] = &[
    "password",
    "passwd",
    "token",
    "secret",
    "auth",
    "api_key",
    "apikey",
    "access_key",
    "private_key",
    "credential",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|s| key.contains(s))
}

/// Masked copy of `value`
pub fn redact(value: &Value) -> Value {
    let mut out = value.clone();
    redact_in_place(&mut out);
    out
}

pub fn redact_in_place(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, v) in map.iter_mut() {
                if is_sensitive_key(key) {
                    if !v.is_null() {
                        *v = Value::String(MASK.to_string());
                    }
                } else {
                    redact_in_place(v);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_in_place),
        _ => {}
    }
}

/// Replace every occurrence of the given secret strings in free text
pub fn mask_secrets(text: &str, secrets: &[&str]) -> String {
    secrets
        .iter()
        .filter(|s| !s.is_empty())
        .fold(text.to_string(), |acc, secret| acc.replace(secret, MASK))
}
