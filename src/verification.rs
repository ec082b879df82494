// Multi-factor delivery verification: time-based OTP, proof photo, signature,
// geofence, and the operator fallback code.
//
// Completion is monotone. Each factor lands in `completed` at most once and a
// verification that has gone complete never reverts, whatever arrives later.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::auth::AuthContext;
use crate::crypto::{constant_time_eq, hmac_sha256, random_bytes, sha256_hex, CryptoService};
use crate::error::{ok, ApiError};
use crate::geo;
use crate::http::AppState;
use crate::metrics::Metrics;
use crate::realtime::{Audience, Broadcaster, RealtimeEvent};

pub const MAX_OTP_ATTEMPTS: u32 = 5;
const MAX_PHOTO_BYTES: usize = 5 * 1024 * 1024;
const DEFAULT_GEOFENCE_RADIUS_M: f64 = 100.0;
const OTP_SECRET_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Otp,
    Photo,
    Signature,
    Geofence,
    Code,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeliveryVerification {
    pub id: String,
    #[serde(rename = "deliveryId")]
    pub delivery_id: String,
    pub required: Vec<Method>,
    pub completed: Vec<Method>,
    pub complete: bool,
    #[serde(rename = "completedAt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryVerification {
    fn new(delivery_id: &str, required: Vec<Method>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            delivery_id: delivery_id.to_string(),
            required,
            completed: Vec::new(),
            complete: false,
            completed_at: None,
        }
    }

    fn pending(&self) -> Vec<Method> {
        self.required
            .iter()
            .filter(|m| !self.completed.contains(m))
            .copied()
            .collect()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct OtpRecord {
    pub id: String,
    #[serde(rename = "deliveryId")]
    pub delivery_id: String,
    #[serde(rename = "recipientId")]
    pub recipient_id: String,
    #[serde(rename = "otpCiphertext")]
    pub otp_ciphertext: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
    #[serde(rename = "attemptCount")]
    pub attempt_count: u32,
    pub verified: bool,
    #[serde(rename = "verifiedAt", skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhotoMeta {
    pub width: u32,
    pub height: u32,
    pub mime: String,
    pub bytes: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeliveryPhoto {
    pub id: String,
    #[serde(rename = "deliveryId")]
    pub delivery_id: String,
    #[serde(skip_serializing)]
    pub photo_ciphertext: String,
    pub meta: PhotoMeta,
    #[serde(rename = "capturedAt")]
    pub captured_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeliverySignature {
    pub id: String,
    #[serde(rename = "deliveryId")]
    pub delivery_id: String,
    #[serde(skip_serializing)]
    pub sig_ciphertext: String,
    #[serde(rename = "sigHash")]
    pub sig_hash: String,
    #[serde(skip_serializing)]
    pub signer_name_ciphertext: Option<String>,
    #[serde(rename = "capturedAt")]
    pub captured_at: DateTime<Utc>,
}

/// Verifier-level outcome. These are success-shaped responses, not HTTP
/// errors: a wrong token is a `200 {valid:false}`.
#[derive(Clone, Debug, Serialize)]
pub struct OtpOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
}

impl OtpOutcome {
    fn rejected(reason: &'static str) -> Self {
        Self {
            valid: false,
            reason: Some(reason),
            remaining: None,
        }
    }
}

pub struct VerificationService {
    crypto: Arc<CryptoService>,
    audit: Arc<AuditSink>,
    metrics: Arc<Metrics>,
    realtime: Arc<Broadcaster>,
    hmac_secret: Vec<u8>,
    otp_digits: u32,
    otp_step: StdDuration,
    max_fallback_attempts: u32,

    verifications: DashMap<String, DeliveryVerification>,
    otp_secrets: DashMap<String, Vec<u8>>,
    otps: DashMap<String, OtpRecord>,
    photos: DashMap<String, Vec<DeliveryPhoto>>,
    signatures: DashMap<String, DeliverySignature>,
    fallback_attempts: DashMap<String, u32>,
}

impl VerificationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        crypto: Arc<CryptoService>,
        audit: Arc<AuditSink>,
        metrics: Arc<Metrics>,
        realtime: Arc<Broadcaster>,
        hmac_secret: &str,
        otp_digits: u32,
        otp_step: StdDuration,
        max_fallback_attempts: u32,
    ) -> Self {
        Self {
            crypto,
            audit,
            metrics,
            realtime,
            hmac_secret: hmac_secret.as_bytes().to_vec(),
            otp_digits,
            otp_step,
            max_fallback_attempts,
            verifications: DashMap::new(),
            otp_secrets: DashMap::new(),
            otps: DashMap::new(),
            photos: DashMap::new(),
            signatures: DashMap::new(),
            fallback_attempts: DashMap::new(),
        }
    }

    pub fn initialize(
        &self,
        actor: (&str, &str),
        delivery_id: &str,
        required: Vec<Method>,
    ) -> DeliveryVerification {
        let record = self
            .verifications
            .entry(delivery_id.to_string())
            .or_insert_with(|| DeliveryVerification::new(delivery_id, required.clone()))
            .clone();
        self.audit.success(
            actor.0,
            actor.1,
            "verification.initialize",
            "delivery_verification",
            Some(delivery_id.to_string()),
            json!({"required": record.required}),
        );
        record
    }

    pub fn status(&self, delivery_id: &str) -> Option<DeliveryVerification> {
        self.verifications.get(delivery_id).map(|v| v.clone())
    }

    pub fn pending(&self, delivery_id: &str) -> Option<Vec<Method>> {
        self.verifications.get(delivery_id).map(|v| v.pending())
    }

    // --- OTP --------------------------------------------------------------

    /// Issues a fresh time-based token for the delivery. The per-delivery
    /// secret is created on first use and never leaves the process; callers
    /// only ever see individual tokens.
    pub fn generate_otp(
        &self,
        actor: (&str, &str),
        delivery_id: &str,
        recipient_id: &str,
    ) -> Result<(String, DateTime<Utc>), ApiError> {
        let secret = self
            .otp_secrets
            .entry(delivery_id.to_string())
            .or_insert_with(|| random_bytes(OTP_SECRET_LEN))
            .clone();

        let now = Utc::now();
        let token = totp_token(&secret, now.timestamp(), self.otp_step.as_secs(), self.otp_digits);
        let expires_at = now + chrono::Duration::seconds(self.otp_step.as_secs() as i64);

        let record = OtpRecord {
            id: Uuid::new_v4().to_string(),
            delivery_id: delivery_id.to_string(),
            recipient_id: recipient_id.to_string(),
            otp_ciphertext: self.crypto.encrypt(token.as_bytes(), delivery_id)?,
            expires_at,
            attempt_count: 0,
            verified: false,
            verified_at: None,
        };
        self.otps.insert(delivery_id.to_string(), record);

        self.audit.success(
            actor.0,
            actor.1,
            "otp.generate",
            "otp_record",
            Some(delivery_id.to_string()),
            json!({"recipient_id": recipient_id}),
        );
        Ok((token, expires_at))
    }

    pub fn verify_otp(&self, actor: (&str, &str), delivery_id: &str, token: &str) -> OtpOutcome {
        let secret = match self.otp_secrets.get(delivery_id) {
            Some(secret) => secret.clone(),
            None => return self.reject_otp(actor, delivery_id, "no_otp_generated"),
        };

        let now = Utc::now();
        let outcome = {
            let mut record = match self.otps.get_mut(delivery_id) {
                Some(record) => record,
                None => return self.reject_otp(actor, delivery_id, "no_pending_otp"),
            };
            if record.verified {
                return self.reject_otp(actor, delivery_id, "already_verified");
            }
            if record.attempt_count >= MAX_OTP_ATTEMPTS {
                return self.reject_otp(actor, delivery_id, "max_attempts_exceeded");
            }
            // Every decision below is an attempt, the successful one
            // included, so the bound stays auditable.
            record.attempt_count += 1;
            let remaining = MAX_OTP_ATTEMPTS - record.attempt_count;

            if now > record.expires_at {
                OtpOutcome {
                    valid: false,
                    reason: Some("otp_expired"),
                    remaining: Some(remaining),
                }
            } else if totp_matches(
                &secret,
                token,
                now.timestamp(),
                self.otp_step.as_secs(),
                self.otp_digits,
            ) {
                record.verified = true;
                record.verified_at = Some(now);
                OtpOutcome {
                    valid: true,
                    reason: None,
                    remaining: Some(remaining),
                }
            } else {
                OtpOutcome {
                    valid: false,
                    reason: Some("invalid_otp"),
                    remaining: Some(remaining),
                }
            }
        };

        if outcome.valid {
            Metrics::bump(&self.metrics.otp_verified);
            self.audit.success(
                actor.0,
                actor.1,
                "otp.verify",
                "otp_record",
                Some(delivery_id.to_string()),
                json!({"method": "otp"}),
            );
            self.complete(delivery_id, Method::Otp);
        } else {
            Metrics::bump(&self.metrics.otp_rejected);
            self.audit.failure(
                actor.0,
                actor.1,
                "otp.verify",
                "otp_record",
                Some(delivery_id.to_string()),
                json!({"reason": outcome.reason}),
            );
        }
        outcome
    }

    fn reject_otp(&self, actor: (&str, &str), delivery_id: &str, reason: &'static str) -> OtpOutcome {
        Metrics::bump(&self.metrics.otp_rejected);
        self.audit.failure(
            actor.0,
            actor.1,
            "otp.verify",
            "otp_record",
            Some(delivery_id.to_string()),
            json!({"reason": reason}),
        );
        OtpOutcome::rejected(reason)
    }

    // --- Photo / signature -------------------------------------------------

    pub fn store_photo(
        &self,
        actor: (&str, &str),
        delivery_id: &str,
        bytes: &[u8],
        meta: PhotoMeta,
    ) -> Result<DeliveryPhoto, ApiError> {
        if bytes.len() > MAX_PHOTO_BYTES {
            return Err(ApiError::PhotoTooLarge);
        }
        let photo = DeliveryPhoto {
            id: Uuid::new_v4().to_string(),
            delivery_id: delivery_id.to_string(),
            photo_ciphertext: self.crypto.encrypt(bytes, delivery_id)?,
            meta: PhotoMeta {
                bytes: bytes.len(),
                ..meta
            },
            captured_at: Utc::now(),
        };
        self.photos
            .entry(delivery_id.to_string())
            .or_default()
            .push(photo.clone());

        self.audit.success(
            actor.0,
            actor.1,
            "photo.store",
            "delivery_photo",
            Some(delivery_id.to_string()),
            json!({"bytes": photo.meta.bytes, "mime": photo.meta.mime}),
        );
        self.complete(delivery_id, Method::Photo);
        Ok(photo)
    }

    pub fn store_signature(
        &self,
        actor: (&str, &str),
        delivery_id: &str,
        data: &[u8],
        signer_name: Option<&str>,
    ) -> Result<DeliverySignature, ApiError> {
        let signature = DeliverySignature {
            id: Uuid::new_v4().to_string(),
            delivery_id: delivery_id.to_string(),
            sig_hash: sha256_hex(data),
            sig_ciphertext: self.crypto.encrypt(data, delivery_id)?,
            signer_name_ciphertext: signer_name
                .map(|name| self.crypto.encrypt(name.as_bytes(), delivery_id))
                .transpose()?,
            captured_at: Utc::now(),
        };
        self.signatures
            .insert(delivery_id.to_string(), signature.clone());

        self.audit.success(
            actor.0,
            actor.1,
            "signature.store",
            "delivery_signature",
            Some(delivery_id.to_string()),
            json!({"has_signer_name": signature.signer_name_ciphertext.is_some()}),
        );
        self.complete(delivery_id, Method::Signature);
        Ok(signature)
    }

    // --- Geofence / fallback ------------------------------------------------

    /// One audit entry regardless of outcome: an out-of-fence attempt is as
    /// interesting to the trail as a success.
    pub fn verify_geofence(
        &self,
        actor: (&str, &str),
        delivery_id: &str,
        driver: (f64, f64),
        delivery_loc: (f64, f64),
        radius_m: Option<f64>,
    ) -> Result<GeofenceOutcome, ApiError> {
        geo::validate_coords(driver.0, driver.1)?;
        geo::validate_coords(delivery_loc.0, delivery_loc.1)?;
        let radius = radius_m.unwrap_or(DEFAULT_GEOFENCE_RADIUS_M);
        let distance = geo::haversine_m(driver, delivery_loc);
        let within = distance <= radius;

        let metadata = json!({"distance_m": distance.round(), "radius_m": radius});
        if within {
            self.audit.success(
                actor.0,
                actor.1,
                "geofence.verify",
                "delivery_verification",
                Some(delivery_id.to_string()),
                metadata,
            );
            self.complete(delivery_id, Method::Geofence);
        } else {
            self.audit.failure(
                actor.0,
                actor.1,
                "geofence.verify",
                "delivery_verification",
                Some(delivery_id.to_string()),
                metadata,
            );
        }
        Ok(GeofenceOutcome {
            within,
            distance_m: distance,
            radius_m: radius,
        })
    }

    /// Operator fallback. The expected value is derived from the delivery id
    /// alone, so dispatch can read it out over the phone without any state
    /// having been provisioned.
    pub fn fallback(&self, actor: (&str, &str), delivery_id: &str, code: &str) -> OtpOutcome {
        let mut attempts = self
            .fallback_attempts
            .entry(delivery_id.to_string())
            .or_insert(0);
        if *attempts >= self.max_fallback_attempts {
            drop(attempts);
            return self.reject_fallback(actor, delivery_id, "max_attempts_exceeded");
        }
        *attempts += 1;
        drop(attempts);

        let digest = hmac_sha256(&self.hmac_secret, delivery_id.as_bytes());
        let expected = hex::encode(&digest)[..8].to_uppercase();
        let presented = code.trim().to_uppercase();

        if constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
            self.force_complete(delivery_id, Method::Code);
            self.audit.success(
                actor.0,
                actor.1,
                "fallback.verify",
                "delivery_verification",
                Some(delivery_id.to_string()),
                json!({"method": "code"}),
            );
            OtpOutcome {
                valid: true,
                reason: None,
                remaining: None,
            }
        } else {
            self.reject_fallback(actor, delivery_id, "invalid_code")
        }
    }

    fn reject_fallback(
        &self,
        actor: (&str, &str),
        delivery_id: &str,
        reason: &'static str,
    ) -> OtpOutcome {
        self.audit.failure(
            actor.0,
            actor.1,
            "fallback.verify",
            "delivery_verification",
            Some(delivery_id.to_string()),
            json!({"reason": reason}),
        );
        OtpOutcome::rejected(reason)
    }

    // --- Completion ---------------------------------------------------------

    /// Records a completed factor and flips the verification to complete
    /// once every required method is in. Monotone: a complete verification
    /// is never reopened.
    fn complete(&self, delivery_id: &str, method: Method) {
        let newly_complete = {
            let mut verification = match self.verifications.get_mut(delivery_id) {
                Some(v) => v,
                None => return,
            };
            if verification.complete {
                return;
            }
            if !verification.completed.contains(&method) {
                verification.completed.push(method);
            }
            let done = !verification.required.is_empty()
                && verification
                    .required
                    .iter()
                    .all(|m| verification.completed.contains(m));
            if done {
                verification.complete = true;
                verification.completed_at = Some(Utc::now());
            }
            done
        };
        if newly_complete {
            self.announce_complete(delivery_id);
        }
    }

    /// Fallback path: completes the verification outright with the single
    /// method that was used.
    fn force_complete(&self, delivery_id: &str, method: Method) {
        let newly_complete = {
            let mut verification = self
                .verifications
                .entry(delivery_id.to_string())
                .or_insert_with(|| DeliveryVerification::new(delivery_id, Vec::new()));
            if verification.complete {
                false
            } else {
                verification.completed = vec![method];
                verification.complete = true;
                verification.completed_at = Some(Utc::now());
                true
            }
        };
        if newly_complete {
            self.announce_complete(delivery_id);
        }
    }

    fn announce_complete(&self, delivery_id: &str) {
        Metrics::bump(&self.metrics.verifications_completed);
        self.realtime.broadcast(RealtimeEvent::new(
            "verification:completed",
            json!({"deliveryId": delivery_id}),
            Audience::delivery(delivery_id),
        ));
    }

    /// Reads back a stored signature and proves integrity against its hash.
    pub fn signature_matches_hash(&self, delivery_id: &str) -> Result<bool, ApiError> {
        let signature = self
            .signatures
            .get(delivery_id)
            .map(|s| s.clone())
            .ok_or(ApiError::NotFound("signature"))?;
        let plaintext = self.crypto.decrypt(&signature.sig_ciphertext, delivery_id)?;
        Ok(sha256_hex(&plaintext) == signature.sig_hash)
    }

    /// Drops expired OTP state and artefacts for deliveries completed
    /// before the retention cutoff.
    pub fn evict(&self, delivery_cutoff: DateTime<Utc>) -> usize {
        let now = Utc::now();
        let mut removed = 0;

        let stale: Vec<String> = self
            .otps
            .iter()
            .filter(|e| !e.verified && e.expires_at < now - chrono::Duration::hours(1))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.otps.remove(&key);
            self.otp_secrets.remove(&key);
            removed += 1;
        }

        let expired_deliveries: Vec<String> = self
            .verifications
            .iter()
            .filter(|v| v.complete && v.completed_at.is_some_and(|at| at < delivery_cutoff))
            .map(|v| v.key().clone())
            .collect();
        for key in expired_deliveries {
            self.verifications.remove(&key);
            self.photos.remove(&key);
            self.signatures.remove(&key);
            self.fallback_attempts.remove(&key);
            removed += 1;
        }
        removed
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct GeofenceOutcome {
    pub within: bool,
    #[serde(rename = "distanceMeters")]
    pub distance_m: f64,
    #[serde(rename = "radiusMeters")]
    pub radius_m: f64,
}

// --- TOTP -------------------------------------------------------------------

/// RFC 6238 token over HMAC-SHA256: counter = unix_time / step, dynamic
/// truncation, zero-padded to `digits`.
fn totp_token(secret: &[u8], unix_time: i64, step_secs: u64, digits: u32) -> String {
    let counter = (unix_time / step_secs as i64).max(0) as u64;
    let digest = hmac_sha256(secret, &counter.to_be_bytes());
    let offset = (digest[31] & 0x0f) as usize;
    let code = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    let modulus = 10u32.pow(digits);
    format!("{:0width$}", code % modulus, width = digits as usize)
}

/// Constant-time match over a ±1 step window.
fn totp_matches(secret: &[u8], token: &str, unix_time: i64, step_secs: u64, digits: u32) -> bool {
    let mut matched = false;
    for step_offset in [-1i64, 0, 1] {
        let shifted = unix_time + step_offset * step_secs as i64;
        let candidate = totp_token(secret, shifted, step_secs, digits);
        // No early exit: every window is checked so timing does not reveal
        // which step matched.
        matched |= constant_time_eq(candidate.as_bytes(), token.trim().as_bytes());
    }
    matched
}

// --- HTTP surface -----------------------------------------------------------

#[derive(Deserialize)]
struct InitializeBody {
    #[serde(rename = "deliveryId")]
    delivery_id: String,
    required: Vec<Method>,
}

#[derive(Deserialize)]
struct OtpGenerateBody {
    #[serde(rename = "deliveryId")]
    delivery_id: String,
    #[serde(rename = "recipientId")]
    recipient_id: String,
}

#[derive(Deserialize)]
struct OtpVerifyBody {
    #[serde(rename = "deliveryId")]
    delivery_id: String,
    token: String,
}

#[derive(Deserialize)]
struct PhotoBody {
    #[serde(rename = "deliveryId")]
    delivery_id: String,
    #[serde(rename = "photoBase64")]
    photo_base64: String,
    meta: PhotoMeta,
}

#[derive(Deserialize)]
struct SignatureBody {
    #[serde(rename = "deliveryId")]
    delivery_id: String,
    #[serde(rename = "signatureBase64")]
    signature_base64: String,
    #[serde(rename = "signerName")]
    signer_name: Option<String>,
}

#[derive(Deserialize)]
struct GeofencePoint {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct GeofenceBody {
    #[serde(rename = "deliveryId")]
    delivery_id: String,
    driver: GeofencePoint,
    delivery: GeofencePoint,
    #[serde(rename = "radiusMeters")]
    radius_meters: Option<f64>,
}

#[derive(Deserialize)]
struct FallbackBody {
    #[serde(rename = "deliveryId")]
    delivery_id: String,
    code: String,
}

fn valid_delivery_id(id: &str) -> Result<(), ApiError> {
    if id.trim().is_empty() || id.len() > 128 {
        return Err(ApiError::InvalidDeliveryId);
    }
    Ok(())
}

async fn initialize_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<InitializeBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    valid_delivery_id(&body.delivery_id)?;
    if body.required.is_empty() {
        return Err(ApiError::Validation("required methods must be non-empty".into()));
    }
    let record = state.verification.initialize(
        (&identity.user_id, identity.role.as_str()),
        &body.delivery_id,
        body.required,
    );
    Ok(ok(record))
}

async fn otp_generate_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<OtpGenerateBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    valid_delivery_id(&body.delivery_id)?;
    let (otp, expires_at) = state.verification.generate_otp(
        (&identity.user_id, identity.role.as_str()),
        &body.delivery_id,
        &body.recipient_id,
    )?;
    Ok(ok(json!({"otp": otp, "expiresAt": expires_at})))
}

/// Budget for a verify call end to end. The comparison itself is pure CPU;
/// this guards the request if the state maps are ever backed by real IO.
const OTP_VERIFY_TIMEOUT_SECS: u64 = 2;

async fn otp_verify_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<OtpVerifyBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    valid_delivery_id(&body.delivery_id)?;
    let outcome = tokio::time::timeout(
        StdDuration::from_secs(OTP_VERIFY_TIMEOUT_SECS),
        async {
            state.verification.verify_otp(
                (&identity.user_id, identity.role.as_str()),
                &body.delivery_id,
                &body.token,
            )
        },
    )
    .await
    .map_err(|_| ApiError::Internal("otp verification timed out".into()))?;
    Ok(ok(outcome))
}

async fn photo_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<PhotoBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    valid_delivery_id(&body.delivery_id)?;
    let bytes = BASE64
        .decode(body.photo_base64.as_bytes())
        .map_err(|_| ApiError::Validation("photo must be base64".into()))?;
    let photo = state.verification.store_photo(
        (&identity.user_id, identity.role.as_str()),
        &body.delivery_id,
        &bytes,
        body.meta,
    )?;
    Ok(ok(photo))
}

async fn signature_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<SignatureBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    valid_delivery_id(&body.delivery_id)?;
    let data = BASE64
        .decode(body.signature_base64.as_bytes())
        .map_err(|_| ApiError::Validation("signature must be base64".into()))?;
    let signature = state.verification.store_signature(
        (&identity.user_id, identity.role.as_str()),
        &body.delivery_id,
        &data,
        body.signer_name.as_deref(),
    )?;
    Ok(ok(signature))
}

async fn geofence_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<GeofenceBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    valid_delivery_id(&body.delivery_id)?;
    let outcome = state.verification.verify_geofence(
        (&identity.user_id, identity.role.as_str()),
        &body.delivery_id,
        (body.driver.latitude, body.driver.longitude),
        (body.delivery.latitude, body.delivery.longitude),
        body.radius_meters,
    )?;
    Ok(ok(outcome))
}

async fn status_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(delivery_id): Path<String>,
) -> Result<Response, ApiError> {
    auth.require_auth()?;
    let record = state
        .verification
        .status(&delivery_id)
        .ok_or(ApiError::NotFound("verification"))?;
    Ok(ok(record))
}

async fn pending_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(delivery_id): Path<String>,
) -> Result<Response, ApiError> {
    auth.require_auth()?;
    let pending = state
        .verification
        .pending(&delivery_id)
        .ok_or(ApiError::NotFound("verification"))?;
    Ok(ok(json!({"pending": pending})))
}

async fn fallback_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<FallbackBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    valid_delivery_id(&body.delivery_id)?;
    let outcome = state.verification.fallback(
        (&identity.user_id, identity.role.as_str()),
        &body.delivery_id,
        &body.code,
    );
    Ok(ok(outcome))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/initialize", post(initialize_handler))
        .route("/otp/generate", post(otp_generate_handler))
        .route("/otp/verify", post(otp_verify_handler))
        .route("/photo", post(photo_handler))
        .route("/signature", post(signature_handler))
        .route("/geofence", post(geofence_handler))
        .route("/status/:delivery_id", get(status_handler))
        .route("/pending/:delivery_id", get(pending_handler))
        .route("/fallback", post(fallback_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACTOR: (&str, &str) = ("driver-1", "driver");

    fn service() -> VerificationService {
        let metrics = Arc::new(Metrics::new());
        VerificationService::new(
            Arc::new(CryptoService::new("verify-master-key-0123456789abcdef")),
            Arc::new(AuditSink::new(metrics.clone())),
            metrics.clone(),
            Arc::new(Broadcaster::new(metrics)),
            "verify-hmac-secret-0123456789abcdef",
            6,
            StdDuration::from_secs(300),
            5,
        )
    }

    fn expected_fallback(service: &VerificationService, delivery_id: &str) -> String {
        let digest = hmac_sha256(&service.hmac_secret, delivery_id.as_bytes());
        hex::encode(&digest)[..8].to_uppercase()
    }

    #[test]
    fn test_happy_path_otp_photo_geofence() {
        let s = service();
        s.initialize(ACTOR, "d1", vec![Method::Otp, Method::Photo, Method::Geofence]);

        let (otp, expires_at) = s.generate_otp(ACTOR, "d1", "r1").unwrap();
        assert!(expires_at > Utc::now());

        let photo = s
            .store_photo(ACTOR, "d1", &vec![0xFFu8; 1024], PhotoMeta {
                width: 640,
                height: 480,
                mime: "image/jpeg".into(),
                bytes: 0,
            })
            .unwrap();
        assert_eq!(photo.meta.bytes, 1024);

        let fence = s
            .verify_geofence(ACTOR, "d1", (-1.286, 36.817), (-1.2861, 36.8171), Some(100.0))
            .unwrap();
        assert!(fence.within, "~16 m is inside a 100 m fence");

        let outcome = s.verify_otp(ACTOR, "d1", &otp);
        assert!(outcome.valid, "got {:?}", outcome.reason);

        let status = s.status("d1").unwrap();
        assert!(status.complete);
        assert!(status.completed_at.is_some());
        assert!(s.pending("d1").unwrap().is_empty());
    }

    #[test]
    fn test_otp_bruteforce_lockout() {
        let s = service();
        s.initialize(ACTOR, "d2", vec![Method::Otp]);
        let (otp, _) = s.generate_otp(ACTOR, "d2", "r1").unwrap();

        for expected_remaining in (0..5).rev() {
            let outcome = s.verify_otp(ACTOR, "d2", "000000");
            assert!(!outcome.valid);
            assert_eq!(outcome.reason, Some("invalid_otp"));
            assert_eq!(outcome.remaining, Some(expected_remaining));
        }
        let sixth = s.verify_otp(ACTOR, "d2", "000000");
        assert_eq!(sixth.reason, Some("max_attempts_exceeded"));

        // Even the correct token is refused once the bound is hit.
        let with_real_token = s.verify_otp(ACTOR, "d2", &otp);
        assert_eq!(with_real_token.reason, Some("max_attempts_exceeded"));
        assert!(!s.status("d2").unwrap().complete);
    }

    #[test]
    fn test_otp_rejects_before_generation() {
        let s = service();
        s.initialize(ACTOR, "d3", vec![Method::Otp]);
        let outcome = s.verify_otp(ACTOR, "d3", "123456");
        assert_eq!(outcome.reason, Some("no_otp_generated"));
    }

    #[test]
    fn test_otp_replay_after_success_is_not_a_second_success() {
        let s = service();
        s.initialize(ACTOR, "d4", vec![Method::Otp]);
        let (otp, _) = s.generate_otp(ACTOR, "d4", "r1").unwrap();
        assert!(s.verify_otp(ACTOR, "d4", &otp).valid);

        let replay = s.verify_otp(ACTOR, "d4", &otp);
        assert!(!replay.valid);
        assert_eq!(replay.reason, Some("already_verified"));
        // The attempt counter did not move for the replay.
        assert_eq!(s.otps.get("d4").unwrap().attempt_count, 1);
    }

    #[test]
    fn test_expired_otp() {
        let s = service();
        s.initialize(ACTOR, "d5", vec![Method::Otp]);
        let (otp, _) = s.generate_otp(ACTOR, "d5", "r1").unwrap();
        s.otps.get_mut("d5").unwrap().expires_at = Utc::now() - chrono::Duration::seconds(1);

        let outcome = s.verify_otp(ACTOR, "d5", &otp);
        assert_eq!(outcome.reason, Some("otp_expired"));
    }

    #[test]
    fn test_photo_size_cap() {
        let s = service();
        s.initialize(ACTOR, "d6", vec![Method::Photo]);
        let oversized = vec![0u8; MAX_PHOTO_BYTES + 1];
        let err = s
            .store_photo(ACTOR, "d6", &oversized, PhotoMeta {
                width: 1,
                height: 1,
                mime: "image/jpeg".into(),
                bytes: 0,
            })
            .unwrap_err();
        assert!(matches!(err, ApiError::PhotoTooLarge));
        assert!(!s.status("d6").unwrap().complete);
    }

    #[test]
    fn test_signature_hash_roundtrip() {
        let s = service();
        s.initialize(ACTOR, "d7", vec![Method::Signature]);
        let stroke_data = b"M 10 80 C 40 10, 65 10, 95 80";
        let stored = s
            .store_signature(ACTOR, "d7", stroke_data, Some("Wanjiku O."))
            .unwrap();
        assert_eq!(stored.sig_hash, sha256_hex(stroke_data));
        assert!(s.signature_matches_hash("d7").unwrap());
        assert!(s.status("d7").unwrap().complete);
    }

    #[test]
    fn test_geofence_outside_radius_does_not_complete() {
        let s = service();
        s.initialize(ACTOR, "d8", vec![Method::Geofence]);
        // ~2 km away from the delivery point.
        let outcome = s
            .verify_geofence(ACTOR, "d8", (-1.304, 36.817), (-1.286, 36.817), None)
            .unwrap();
        assert!(!outcome.within);
        assert!(!s.status("d8").unwrap().complete);
    }

    #[test]
    fn test_fallback_code() {
        let s = service();
        s.initialize(ACTOR, "d9", vec![Method::Otp, Method::Photo]);
        let expected = expected_fallback(&s, "d9");

        let wrong = s.fallback(ACTOR, "d9", "AAAAAAAA");
        assert!(!wrong.valid);

        let outcome = s.fallback(ACTOR, "d9", &expected.to_lowercase());
        assert!(outcome.valid, "fallback is case-insensitive");

        let status = s.status("d9").unwrap();
        assert!(status.complete);
        assert_eq!(status.completed, vec![Method::Code]);
    }

    #[test]
    fn test_fallback_attempts_bounded() {
        let s = service();
        s.initialize(ACTOR, "d10", vec![Method::Otp]);
        for _ in 0..5 {
            assert_eq!(s.fallback(ACTOR, "d10", "XXXXXXXX").reason, Some("invalid_code"));
        }
        let expected = expected_fallback(&s, "d10");
        let locked = s.fallback(ACTOR, "d10", &expected);
        assert_eq!(locked.reason, Some("max_attempts_exceeded"));
    }

    #[test]
    fn test_completion_is_monotone() {
        let s = service();
        s.initialize(ACTOR, "d11", vec![Method::Geofence]);
        s.verify_geofence(ACTOR, "d11", (-1.286, 36.817), (-1.286, 36.817), None)
            .unwrap();
        assert!(s.status("d11").unwrap().complete);
        let completed_at = s.status("d11").unwrap().completed_at;

        // A later failing factor does not reopen the verification.
        let _ = s.verify_otp(ACTOR, "d11", "999999");
        s.verify_geofence(ACTOR, "d11", (-1.4, 36.9), (-1.286, 36.817), None)
            .unwrap();
        let status = s.status("d11").unwrap();
        assert!(status.complete);
        assert_eq!(status.completed_at, completed_at);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let s = service();
        let first = s.initialize(ACTOR, "d12", vec![Method::Otp]);
        let second = s.initialize(ACTOR, "d12", vec![Method::Photo, Method::Signature]);
        assert_eq!(first.id, second.id);
        assert_eq!(second.required, vec![Method::Otp], "required set is fixed at first init");
    }

    #[test]
    fn test_totp_token_shape_and_window() {
        let secret = b"otp-secret-0123456789";
        let token = totp_token(secret, 1_700_000_000, 300, 6);
        assert_eq!(token.len(), 6);
        assert!(token.chars().all(|c| c.is_ascii_digit()));

        // Same step → same token; adjacent step still matches via window.
        assert_eq!(token, totp_token(secret, 1_700_000_100, 300, 6));
        assert!(totp_matches(secret, &token, 1_700_000_300, 300, 6));
        assert!(!totp_matches(secret, &token, 1_700_001_000, 300, 6));
        assert!(!totp_matches(secret, "000000", 1_700_000_000, 300, 6));
    }
}
