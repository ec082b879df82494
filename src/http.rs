// Composition of the HTTP surface: shared state, request-meta and rate-limit
// middleware, and the per-component routers nested under /api.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::auth::{self, AuthContext};
use crate::codes::CodeGenerator;
use crate::config::Config;
use crate::crypto::CryptoService;
use crate::emergency::EmergencyService;
use crate::error::{ok, ApiError, REQUEST_ID};
use crate::metrics::Metrics;
use crate::notify::NotificationService;
use crate::realtime::Broadcaster;
use crate::security::SecurityMonitor;
use crate::verification::VerificationService;
use crate::{codes, emergency, location, notify, realtime, security, verification};

struct HttpRateEntry {
    count: u32,
    window_start: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    pub crypto: Arc<CryptoService>,
    pub audit: Arc<AuditSink>,
    pub codes: Arc<CodeGenerator>,
    pub verification: Arc<VerificationService>,
    pub security: Arc<SecurityMonitor>,
    pub emergency: Arc<EmergencyService>,
    pub notify: Arc<NotificationService>,
    pub realtime: Arc<Broadcaster>,
    http_rate: Arc<DashMap<String, HttpRateEntry>>,
}

impl AppState {
    pub fn build(config: Config) -> Self {
        let config = Arc::new(config);
        let metrics = Arc::new(Metrics::new());
        let audit = Arc::new(AuditSink::new(metrics.clone()));
        let crypto = Arc::new(CryptoService::new(&config.encryption_key));
        let realtime = Arc::new(Broadcaster::new(metrics.clone()));
        let codes = Arc::new(CodeGenerator::new(&config.hmac_secret, config.code_ttl()));
        let verification = Arc::new(VerificationService::new(
            crypto.clone(),
            audit.clone(),
            metrics.clone(),
            realtime.clone(),
            &config.hmac_secret,
            config.otp_digits(),
            config.otp_step(),
            config.code_max_attempts,
        ));
        let security = Arc::new(SecurityMonitor::new(
            audit.clone(),
            metrics.clone(),
            realtime.clone(),
        ));
        let notify = Arc::new(NotificationService::new(
            crypto.clone(),
            audit.clone(),
            metrics.clone(),
        ));
        let emergency = Arc::new(EmergencyService::new(
            audit.clone(),
            metrics.clone(),
            notify.clone(),
            realtime.clone(),
        ));

        Self {
            config,
            metrics,
            crypto,
            audit,
            codes,
            verification,
            security,
            emergency,
            notify,
            realtime,
            http_rate: Arc::new(DashMap::new()),
        }
    }

    /// Periodic housekeeping used by the eviction loop in `main`.
    pub fn http_rate_evict(&self) -> usize {
        let window = chrono::Duration::milliseconds(self.config.rate_limit_window_ms as i64);
        let now = Utc::now();
        let before = self.http_rate.len();
        self.http_rate
            .retain(|_, e| now - e.window_start < window * 2);
        before - self.http_rate.len()
    }
}

/// Generates the request id, scopes it for envelope builders, and echoes it
/// back in the response header.
async fn request_meta(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

/// Coarse request limiter keyed by bearer token (shared bucket for
/// anonymous traffic). Window resets lazily, teacher-style.
async fn http_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    let allowed = {
        let now = Utc::now();
        let window = chrono::Duration::milliseconds(state.config.rate_limit_window_ms as i64);
        let mut entry = state.http_rate.entry(key).or_insert(HttpRateEntry {
            count: 0,
            window_start: now,
        });
        if now - entry.window_start > window {
            entry.count = 1;
            entry.window_start = now;
            true
        } else if entry.count < state.config.rate_limit_max_requests {
            entry.count += 1;
            true
        } else {
            false
        }
    };

    if !allowed {
        Metrics::bump(&state.metrics.rate_limited);
        return ApiError::RateLimited.into_response();
    }
    next.run(request).await
}

async fn health_handler() -> Response {
    Json(json!({
        "status": "healthy",
        "service": "salama-core",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
    .into_response()
}

/// The fixed role→permission matrix, plus the caller's own grants when a
/// token was presented.
async fn permissions_handler(auth: AuthContext) -> Response {
    let matrix: serde_json::Map<String, serde_json::Value> = auth::Role::ALL
        .iter()
        .map(|role| {
            (
                role.as_str().to_string(),
                json!(auth::permissions(*role)),
            )
        })
        .collect();
    let own = auth.0.as_ref().map(|identity| {
        json!({
            "userId": identity.user_id,
            "role": identity.role,
            "grants": auth::permissions(identity.role),
        })
    });
    ok(json!({"matrix": matrix, "identity": own}))
}

pub fn build_router(state: AppState) -> Router {
    let cors = match &state.config.cors_origin {
        Some(origin) => {
            let allowed = origin
                .parse::<HeaderValue>()
                .map(tower_http::cors::AllowOrigin::exact)
                .unwrap_or_else(|_| tower_http::cors::AllowOrigin::any());
            CorsLayer::new()
                .allow_origin(allowed)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    };

    let api = Router::new()
        .nest("/location", location::router())
        .nest("/codes", codes::router())
        .nest("/verification", verification::router())
        .nest("/security", security::router())
        .nest("/emergency", emergency::router())
        .nest("/notifications", notify::router())
        .nest("/realtime", realtime::router())
        .route("/privacy/permissions", get(permissions_handler));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/api", api)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(request_meta))
                .layer(middleware::from_fn_with_state(
                    state.clone(),
                    http_rate_limit,
                ))
                .layer(cors)
                .layer(CompressionLayer::new()),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_state() -> AppState {
        AppState::build(Config {
            host: "127.0.0.1".into(),
            port: 0,
            production: false,
            jwt_secret: "jwt-secret-for-http-tests-0123456789".into(),
            encryption_key: "encryption-key-for-http-tests-012345".into(),
            hmac_secret: "hmac-secret-for-http-tests-0123456789".into(),
            location_grid_size_meters: 500,
            code_ttl_minutes: 30,
            code_max_attempts: 5,
            otp_ttl_seconds: 300,
            otp_length: 6,
            retention_days_location: 30,
            retention_days_delivery: 365,
            retention_days_audit: 2555,
            rate_limit_window_ms: 60_000,
            rate_limit_max_requests: 3,
            cors_origin: None,
        })
    }

    #[tokio::test]
    async fn test_state_builds_and_router_assembles() {
        let state = test_state();
        let _router = build_router(state.clone());
        assert_eq!(state.audit.len(), 0);
        assert_eq!(state.metrics.snapshot().rate_limited, 0);
    }

    #[tokio::test]
    async fn test_http_rate_entries_evict() {
        let state = test_state();
        state.http_rate.insert(
            "stale-token".into(),
            HttpRateEntry {
                count: 3,
                window_start: Utc::now() - chrono::Duration::minutes(10),
            },
        );
        assert_eq!(state.http_rate_evict(), 1);
    }
}
