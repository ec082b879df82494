// Themed hand-off codes. The code is a pure function of
// (delivery, generator, theme, secret): two generations with the same
// inputs produce the same string, so a reissued code never surprises a
// recipient who already wrote the first one down.

use std::sync::Arc;

use axum::extract::State;
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::auth::AuthContext;
use crate::crypto::{constant_time_eq, hmac_sha256};
use crate::error::{ok, ApiError};
use crate::http::AppState;

const MIN_TTL_MINUTES: i64 = 5;
const MAX_TTL_MINUTES: i64 = 24 * 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeTheme {
    Classic,
    Safari,
    Landmarks,
}

impl CodeTheme {
    pub fn parse_or_default(raw: Option<&str>) -> Self {
        match raw.map(str::trim).map(str::to_ascii_lowercase).as_deref() {
            Some("safari") => CodeTheme::Safari,
            Some("landmarks") => CodeTheme::Landmarks,
            // Unknown themes fall back rather than failing the hand-off.
            _ => CodeTheme::Classic,
        }
    }

    fn words(&self) -> &'static [&'static str] {
        match self {
            CodeTheme::Classic => &[
                "amber", "bridge", "candle", "delta", "ember", "falcon", "garnet", "harbor",
                "indigo", "jasper", "kettle", "lantern", "marble", "nickel", "opal", "pepper",
            ],
            CodeTheme::Safari => &[
                "acacia", "buffalo", "cheetah", "duiker", "eland", "flamingo", "gazelle", "hippo",
                "impala", "jackal", "kudu", "leopard", "mamba", "nyala", "oryx", "pangolin",
            ],
            CodeTheme::Landmarks => &[
                "archway", "bazaar", "causeway", "depot", "esplanade", "fountain", "gateway",
                "junction", "kiosk", "lighthouse", "market", "obelisk", "plaza", "quay",
                "terrace", "viaduct",
            ],
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DeliveryCode {
    pub id: String,
    #[serde(rename = "deliveryId")]
    pub delivery_id: String,
    pub code: String,
    pub theme: CodeTheme,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "usedAt", skip_serializing_if = "Option::is_none")]
    pub used_at: Option<DateTime<Utc>>,
    #[serde(rename = "generatedBy")]
    pub generated_by: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

pub struct CodeGenerator {
    hmac_secret: Vec<u8>,
    default_ttl: Duration,
    issued: DashMap<String, DeliveryCode>,
}

impl CodeGenerator {
    pub fn new(hmac_secret: &str, default_ttl: Duration) -> Self {
        Self {
            hmac_secret: hmac_secret.as_bytes().to_vec(),
            default_ttl,
            issued: DashMap::new(),
        }
    }

    /// Deterministic code text for (delivery, generator, theme).
    fn code_text(&self, delivery_id: &str, user_id: &str, theme: CodeTheme) -> String {
        let digest = hmac_sha256(
            &self.hmac_secret,
            format!("{delivery_id}:{user_id}").as_bytes(),
        );
        let words = theme.words();
        let first = u16::from_be_bytes([digest[0], digest[1]]) as usize % words.len();
        let second = u16::from_be_bytes([digest[2], digest[3]]) as usize % words.len();
        format!("{}-{}-{}", words[first], words[second], hex::encode(&digest[4..6]))
    }

    pub fn generate(
        &self,
        delivery_id: &str,
        user_id: &str,
        theme: CodeTheme,
        ttl_minutes: Option<i64>,
    ) -> DeliveryCode {
        let ttl = ttl_minutes
            .map(|m| Duration::minutes(m.clamp(MIN_TTL_MINUTES, MAX_TTL_MINUTES)))
            .unwrap_or(self.default_ttl);
        let now = Utc::now();
        let record = DeliveryCode {
            id: Uuid::new_v4().to_string(),
            delivery_id: delivery_id.to_string(),
            code: self.code_text(delivery_id, user_id, theme),
            theme,
            expires_at: now + ttl,
            used_at: None,
            generated_by: user_id.to_string(),
            created_at: now,
        };
        self.issued.insert(record.id.clone(), record.clone());
        record
    }

    /// Case-insensitive, whitespace-trimmed, constant-time code comparison.
    pub fn validate(presented: &str, expected: &str) -> bool {
        let presented = presented.trim().to_ascii_lowercase();
        let expected = expected.trim().to_ascii_lowercase();
        constant_time_eq(presented.as_bytes(), expected.as_bytes())
    }

    /// Marks the live code for a delivery as used. `false` when no live
    /// unexpired code matches.
    pub fn redeem(&self, delivery_id: &str, presented: &str) -> bool {
        let now = Utc::now();
        for mut entry in self.issued.iter_mut() {
            let code = entry.value_mut();
            if code.delivery_id == delivery_id
                && code.used_at.is_none()
                && code.expires_at > now
                && Self::validate(presented, &code.code)
            {
                code.used_at = Some(now);
                return true;
            }
        }
        false
    }

    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.issued.len();
        self.issued.retain(|_, code| code.expires_at > now);
        before - self.issued.len()
    }
}

// --- HTTP surface ---------------------------------------------------------

#[derive(Deserialize)]
struct GenerateBody {
    #[serde(rename = "deliveryId")]
    delivery_id: String,
    theme: Option<String>,
    #[serde(rename = "ttlMinutes")]
    ttl_minutes: Option<i64>,
}

async fn generate_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<GenerateBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    require_delivery_id(&body.delivery_id)?;

    let theme = CodeTheme::parse_or_default(body.theme.as_deref());
    let record = state
        .codes
        .generate(&body.delivery_id, &identity.user_id, theme, body.ttl_minutes);

    audit_generated(&state.audit, identity, &record);
    Ok(ok(record))
}

fn require_delivery_id(id: &str) -> Result<(), ApiError> {
    if id.trim().is_empty() || id.len() > 128 {
        return Err(ApiError::InvalidDeliveryId);
    }
    Ok(())
}

fn audit_generated(audit: &Arc<AuditSink>, identity: &crate::auth::Identity, record: &DeliveryCode) {
    audit.success(
        &identity.user_id,
        identity.role.as_str(),
        "code.generate",
        "delivery_code",
        Some(record.id.clone()),
        json!({"delivery_id": record.delivery_id, "theme": record.theme}),
    );
}

pub fn router() -> Router<AppState> {
    Router::new().route("/generate", post(generate_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> CodeGenerator {
        CodeGenerator::new("code-secret-0123456789abcdef0123456789", Duration::hours(24))
    }

    #[test]
    fn test_generation_is_deterministic() {
        let g = generator();
        let a = g.generate("d-100", "driver-1", CodeTheme::Safari, None);
        let b = g.generate("d-100", "driver-1", CodeTheme::Safari, None);
        assert_eq!(a.code, b.code);
        assert_ne!(a.id, b.id, "records are distinct even when codes match");
    }

    #[test]
    fn test_code_varies_by_inputs() {
        let g = generator();
        let base = g.generate("d-100", "driver-1", CodeTheme::Classic, None).code;
        assert_ne!(base, g.generate("d-101", "driver-1", CodeTheme::Classic, None).code);
        assert_ne!(base, g.generate("d-100", "driver-2", CodeTheme::Classic, None).code);
    }

    #[test]
    fn test_code_shape() {
        let g = generator();
        let code = g.generate("d-1", "u-1", CodeTheme::Classic, None).code;
        let parts: Vec<&str> = code.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(CodeTheme::Classic.words().contains(&parts[0]));
        assert!(CodeTheme::Classic.words().contains(&parts[1]));
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_unknown_theme_falls_back() {
        assert_eq!(CodeTheme::parse_or_default(Some("neon")), CodeTheme::Classic);
        assert_eq!(CodeTheme::parse_or_default(None), CodeTheme::Classic);
        assert_eq!(CodeTheme::parse_or_default(Some(" SAFARI ")), CodeTheme::Safari);
    }

    #[test]
    fn test_validate_is_case_and_whitespace_insensitive() {
        assert!(CodeGenerator::validate("  Falcon-Harbor-0A1B ", "falcon-harbor-0a1b"));
        assert!(!CodeGenerator::validate("falcon-harbor-0a1b", "falcon-harbor-0a1c"));
        assert!(!CodeGenerator::validate("short", "falcon-harbor-0a1b"));
    }

    #[test]
    fn test_ttl_clamped() {
        let g = generator();
        let quick = g.generate("d-1", "u-1", CodeTheme::Classic, Some(1));
        let span = quick.expires_at - quick.created_at;
        assert_eq!(span, Duration::minutes(5));

        let long = g.generate("d-1", "u-1", CodeTheme::Classic, Some(10_000));
        assert_eq!(long.expires_at - long.created_at, Duration::hours(24));
    }

    #[test]
    fn test_redeem_marks_used_once() {
        let g = generator();
        let record = g.generate("d-7", "driver-1", CodeTheme::Safari, None);
        assert!(g.redeem("d-7", &record.code));
        // Consumed: a second redemption of the same code fails.
        assert!(!g.redeem("d-7", &record.code));
        assert!(!g.redeem("d-8", &record.code));
    }

    #[test]
    fn test_evict_expired() {
        let g = generator();
        g.generate("d-1", "u-1", CodeTheme::Classic, None);
        assert_eq!(g.evict_expired(), 0);
        assert_eq!(g.issued.len(), 1);
    }
}
