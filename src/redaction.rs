use serde::{Deserialize, Serialize};
use serde_json::Value;

const SECRET_KEY_MARKERS: &[&str] = &["key", "auth", "token", "secret", "password", "cookie"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RedactionLevel {
    Strict,  // secrets + message content
    Normal,  // secrets + long message content truncated
    Minimal, // secrets only
}

impl Default for RedactionLevel {
    fn default() -> Self {
        match std::env::var("LUMEN_REDACTION_LEVEL")
            .unwrap_or_else(|_| "normal".to_string())
            .to_lowercase()
            .as_str()
        {
            "strict" => RedactionLevel::Strict,
            "minimal" => RedactionLevel::Minimal,
            _ => RedactionLevel::Normal,
        }
    }
}

fn is_secret_key(key: &str) -> bool {
    let k = key.to_lowercase();
    // `max_tokens` is a sampling knob, not a credential.
    k != "max_tokens" && SECRET_KEY_MARKERS.iter().any(|m| k.contains(m))
}

/// Scrubs a JSON payload in place before it is logged.
pub fn redact_value(v: &mut Value, level: RedactionLevel) {
    match v {
        Value::Object(map) => {
            for (k, val) in map.iter_mut() {
                if is_secret_key(k) {
                    *val = Value::String("[REDACTED]".to_string());
                    continue;
                }

                let is_content = k.eq_ignore_ascii_case("content") || k.eq_ignore_ascii_case("diff");
                match level {
                    RedactionLevel::Strict if is_content => {
                        *val = Value::String("[REDACTED-STRICT]".to_string());
                    }
                    RedactionLevel::Normal if is_content => {
                        if let Some(s) = val.as_str() {
                            if s.chars().count() > 200 {
                                *val = Value::String(format!(
                                    "{}... [{} chars]",
                                    crate::str_utils::prefix_chars(s, 200),
                                    s.chars().count()
                                ));
                            }
                        } else {
                            redact_value(val, level);
                        }
                    }
                    _ => redact_value(val, level),
                }
            }
        }
        Value::Array(arr) => {
            for val in arr {
                redact_value(val, level);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_secrets_always_redacted() {
        let mut v = json!({
            "api_key": "sk-abc",
            "nested": { "Authorization": "Bearer x", "refresh_token": "t" },
            "max_tokens": 128
        });
        redact_value(&mut v, RedactionLevel::Minimal);
        assert_eq!(v["api_key"], "[REDACTED]");
        assert_eq!(v["nested"]["Authorization"], "[REDACTED]");
        assert_eq!(v["nested"]["refresh_token"], "[REDACTED]");
        assert_eq!(v["max_tokens"], 128);
    }

    #[test]
    fn test_strict_hides_message_content() {
        let mut v = json!({ "messages": [{ "role": "user", "content": "hello" }] });
        redact_value(&mut v, RedactionLevel::Strict);
        assert_eq!(v["messages"][0]["content"], "[REDACTED-STRICT]");
        assert_eq!(v["messages"][0]["role"], "user");
    }

    #[test]
    fn test_normal_truncates_long_content() {
        let long = "a".repeat(500);
        let mut v = json!({ "messages": [{ "content": long }, { "content": "short" }] });
        redact_value(&mut v, RedactionLevel::Normal);
        let first = v["messages"][0]["content"].as_str().unwrap();
        assert!(first.ends_with("[500 chars]"));
        assert_eq!(v["messages"][1]["content"], "short");
    }
}
