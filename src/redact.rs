// Metadata scrubbing for logs and the audit sink. Any key matching the
// sensitive-name list is replaced at every depth of a JSON tree, so a raw
// fix or secret buried three objects deep still never reaches a log line.

use serde_json::Value;

const REDACTED: &str = "[REDACTED]";

const SENSITIVE_FRAGMENTS: &[&str] = &[
    "password",
    "secret",
    "apikey",
    "token",
    "_private",
    "coordinates",
    "latitude",
    "longitude",
    "_raw",
];

pub fn is_sensitive_key(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    SENSITIVE_FRAGMENTS.iter().any(|f| lowered.contains(f))
}

/// Returns a copy of `value` with every sensitive field replaced.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, inner) in map {
                if is_sensitive_key(key) {
                    out.insert(key.clone(), Value::String(REDACTED.into()));
                } else {
                    out.insert(key.clone(), redact_value(inner));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_top_level_keys() {
        let v = redact_value(&json!({"password": "hunter2", "name": "aisha"}));
        assert_eq!(v["password"], "[REDACTED]");
        assert_eq!(v["name"], "aisha");
    }

    #[test]
    fn test_redacts_nested_and_array_values() {
        let v = redact_value(&json!({
            "driver": {"latitude": -1.29, "longitude": 36.82, "zone": "z8-1-2"},
            "history": [{"apiKey": "k"}, {"note": "fine"}],
        }));
        assert_eq!(v["driver"]["latitude"], "[REDACTED]");
        assert_eq!(v["driver"]["longitude"], "[REDACTED]");
        assert_eq!(v["driver"]["zone"], "z8-1-2");
        assert_eq!(v["history"][0]["apiKey"], "[REDACTED]");
        assert_eq!(v["history"][1]["note"], "fine");
    }

    #[test]
    fn test_matches_name_fragments_case_insensitively() {
        assert!(is_sensitive_key("authToken"));
        assert!(is_sensitive_key("RAW_COORDINATES"));
        assert!(is_sensitive_key("gps_raw"));
        assert!(is_sensitive_key("location_private"));
        assert!(!is_sensitive_key("zone_id"));
        assert!(!is_sensitive_key("resolution"));
    }
}
