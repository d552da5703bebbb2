//! Masking of credentials before values reach logs and reports
//!
//! Keys are matched case-insensitively with `-` folded to `_`, so
//! `Set-Cookie` and `set_cookie` are the same key.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Replacement for every masked value
pub const MASK: &str = "***";

/// Keys whose values are never shown
pub const SENSITIVE_KEYS: [&str; 16] = [
    "password",
    "pwd",
    "passwd",
    "secret",
    "token",
    "access_token",
    "refresh_token",
    "api_key",
    "apikey",
    "private_key",
    "session_id",
    "cookie",
    "set_cookie",
    "authorization",
    "proxy_authorization",
    "auth",
];

/// Fragments that mark a key as sensitive wherever they appear in it
const SENSITIVE_FRAGMENTS: [&str; 3] = ["password", "secret", "token"];

static BEARER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(bearer|basic)\s+[^\s,;]+").expect("bearer pattern is valid"));

static ASSIGNMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(password|pwd|passwd|token|access_token|secret|api_key|apikey)=[^&\s]*")
        .expect("assignment pattern is valid")
});

/// True if values stored under `key` must be masked
pub fn is_sensitive(key: &str) -> bool {
    let key = key.to_ascii_lowercase().replace('-', "_");
    SENSITIVE_KEYS.contains(&key.as_str())
        || SENSITIVE_FRAGMENTS.iter().any(|fragment| key.contains(fragment))
}

/// The value bound to `key`, masked when the key is sensitive
///
/// `null` stays `null` so a missing credential is still visible as missing.
pub fn redact(key: &str, value: &Value) -> Value {
    if is_sensitive(key) && !value.is_null() {
        return Value::String(MASK.to_string());
    }
    redact_value(value)
}

/// Mask sensitive keys at any depth and credentials embedded in strings
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), redact(key, item)))
                .collect::<Map<String, Value>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::String(s) => Value::String(redact_text(s)),
        other => other.clone(),
    }
}

/// Mask `Bearer <credential>` and `password=<value>` style fragments in free text
pub fn redact_text(text: &str) -> String {
    let text = BEARER.replace_all(text, format!("${{1}} {}", MASK).as_str());
    ASSIGNMENT
        .replace_all(&text, format!("${{1}}={}", MASK).as_str())
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sensitive_keys() {
        assert!(is_sensitive("Authorization"));
        assert!(is_sensitive("set-cookie"));
        assert!(is_sensitive("refresh_token"));
        assert!(is_sensitive("db_password"));
        assert!(is_sensitive("X-Auth-Token"));
        assert!(!is_sensitive("username"));
        assert!(!is_sensitive("content-type"));
    }

    #[test]
    fn test_redact_by_key() {
        assert_eq!(redact("password", &json!("s3cret")), json!(MASK));
        assert_eq!(redact("token", &json!(12345)), json!(MASK));
        assert_eq!(redact("token", &Value::Null), Value::Null);
        assert_eq!(redact("user", &json!("alice")), json!("alice"));
    }

    #[test]
    fn test_redact_nested_value() {
        let body = json!({
            "user": "alice",
            "auth": {"token": "abc"},
            "data": {"access_token": "xyz", "items": [{"secret": 1, "id": 7}]},
        });
        assert_eq!(
            redact_value(&body),
            json!({
                "user": "alice",
                "auth": MASK,
                "data": {"access_token": MASK, "items": [{"secret": MASK, "id": 7}]},
            })
        );
    }

    #[test]
    fn test_redact_text() {
        assert_eq!(redact_text("Bearer abc.def"), "Bearer ***");
        assert_eq!(
            redact_text("/login?user=alice&password=hunter2&next=/home"),
            "/login?user=alice&password=***&next=/home"
        );
        assert_eq!(redact_text("nothing to hide"), "nothing to hide");
    }
}
