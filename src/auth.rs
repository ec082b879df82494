// Identity model: fixed role→permission matrix, signed bearer tokens, and
// the request guards every protected handler goes through.
//
// A request with no token is allowed through the extractor as anonymous;
// each mutating or sensitive route declares its own guard, and a denial is
// what writes the audit trail.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::audit::AuditSink;
use crate::error::ApiError;
use crate::http::AppState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Driver,
    Dispatcher,
    SecurityOfficer,
    Admin,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::Driver => "driver",
            Role::Dispatcher => "dispatcher",
            Role::SecurityOfficer => "security_officer",
            Role::Admin => "admin",
            Role::System => "system",
        }
    }

    pub const ALL: [Role; 6] = [
        Role::Customer,
        Role::Driver,
        Role::Dispatcher,
        Role::SecurityOfficer,
        Role::Admin,
        Role::System,
    ];
}

/// Fixed grant table. `*` is the wildcard grant.
pub fn permissions(role: Role) -> &'static [&'static str] {
    match role {
        Role::Customer => &[
            "read:own_delivery",
            "write:own_delivery_consent",
            "read:own_notification",
        ],
        Role::Driver => &[
            "read:assigned_delivery",
            "write:delivery_status",
            "read:emergency",
            "write:emergency",
        ],
        Role::Dispatcher => &[
            "read:all_delivery",
            "write:delivery_assignment",
            "read:emergency",
            "read:audit",
        ],
        Role::SecurityOfficer => &[
            "read:security_alert",
            "write:security_alert",
            "read:emergency",
            "read:audit",
            "read:location_history",
        ],
        Role::Admin | Role::System => &["*"],
    }
}

pub fn has_permission(role: Role, permission: &str) -> bool {
    let grants = permissions(role);
    grants.contains(&"*") || grants.contains(&permission)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: i64,
}

#[derive(Clone, Debug)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
}

pub fn issue_token(
    secret: &str,
    user_id: &str,
    role: Role,
    ttl: chrono::Duration,
) -> Result<String, ApiError> {
    let claims = Claims {
        sub: user_id.to_string(),
        role,
        exp: (Utc::now() + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(e.to_string()))
}

pub fn decode_token(secret: &str, token: &str) -> Result<Identity, ApiError> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|_| ApiError::InvalidToken)?;
    Ok(Identity {
        user_id: data.claims.sub,
        role: data.claims.role,
    })
}

/// Per-request identity: `None` when no bearer token was presented.
#[derive(Clone, Debug)]
pub struct AuthContext(pub Option<Identity>);

impl AuthContext {
    pub fn require_auth(&self) -> Result<&Identity, ApiError> {
        self.0.as_ref().ok_or(ApiError::Unauthorized)
    }

    /// Enforces a named permission; a holder of the wildcard grant passes.
    /// Denials land in the audit log with `result=denied`.
    pub fn require_permission(
        &self,
        permission: &str,
        audit: &AuditSink,
        action: &str,
        resource_type: &str,
    ) -> Result<&Identity, ApiError> {
        let identity = match self.0.as_ref() {
            Some(identity) => identity,
            None => {
                audit.denied("anonymous", "anonymous", action, resource_type);
                return Err(ApiError::Unauthorized);
            }
        };
        if !has_permission(identity.role, permission) {
            audit.denied(&identity.user_id, identity.role.as_str(), action, resource_type);
            return Err(ApiError::Forbidden);
        }
        Ok(identity)
    }

    pub fn require_role(
        &self,
        allowed: &[Role],
        audit: &AuditSink,
        action: &str,
        resource_type: &str,
    ) -> Result<&Identity, ApiError> {
        let identity = match self.0.as_ref() {
            Some(identity) => identity,
            None => {
                audit.denied("anonymous", "anonymous", action, resource_type);
                return Err(ApiError::Unauthorized);
            }
        };
        if !allowed.contains(&identity.role)
            && identity.role != Role::Admin
            && identity.role != Role::System
        {
            audit.denied(&identity.user_id, identity.role.as_str(), action, resource_type);
            return Err(ApiError::Forbidden);
        }
        Ok(identity)
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|h| h.to_str().ok());
        let token = match header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            // No token is not an error; downstream guards decide.
            _ => return Ok(AuthContext(None)),
        };
        let identity = decode_token(&state.config.jwt_secret, token)?;
        Ok(AuthContext(Some(identity)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::sync::Arc;

    const SECRET: &str = "jwt-unit-test-secret-0123456789abcdef";

    #[test]
    fn test_wildcard_grants_everything() {
        assert!(has_permission(Role::Admin, "read:audit"));
        assert!(has_permission(Role::System, "write:anything_at_all"));
    }

    #[test]
    fn test_named_grants_are_exact() {
        assert!(has_permission(Role::Driver, "write:emergency"));
        assert!(!has_permission(Role::Driver, "read:audit"));
        assert!(has_permission(Role::SecurityOfficer, "read:location_history"));
        assert!(!has_permission(Role::Customer, "read:security_alert"));
        assert!(has_permission(Role::Dispatcher, "read:audit"));
    }

    #[test]
    fn test_token_roundtrip() {
        let token =
            issue_token(SECRET, "driver-7", Role::Driver, chrono::Duration::minutes(5)).unwrap();
        let identity = decode_token(SECRET, &token).unwrap();
        assert_eq!(identity.user_id, "driver-7");
        assert_eq!(identity.role, Role::Driver);
    }

    #[test]
    fn test_expired_token_rejected() {
        let token =
            issue_token(SECRET, "driver-7", Role::Driver, chrono::Duration::minutes(-10)).unwrap();
        assert!(matches!(decode_token(SECRET, &token), Err(ApiError::InvalidToken)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token =
            issue_token(SECRET, "driver-7", Role::Driver, chrono::Duration::minutes(5)).unwrap();
        let other = "another-secret-entirely-0123456789abcdef";
        assert!(matches!(decode_token(other, &token), Err(ApiError::InvalidToken)));
    }

    #[test]
    fn test_guard_denies_and_audits() {
        let audit = AuditSink::new(Arc::new(Metrics::new()));
        let ctx = AuthContext(Some(Identity {
            user_id: "cust-1".into(),
            role: Role::Customer,
        }));
        let err = ctx
            .require_permission("read:audit", &audit, "audit.read", "audit_log")
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden));
        assert_eq!(audit.len(), 1);

        let anon = AuthContext(None);
        let err = anon
            .require_permission("read:audit", &audit, "audit.read", "audit_log")
            .unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        assert_eq!(audit.len(), 2);
    }

    #[test]
    fn test_role_guard_admits_admin_everywhere() {
        let audit = AuditSink::new(Arc::new(Metrics::new()));
        let ctx = AuthContext(Some(Identity {
            user_id: "root".into(),
            role: Role::Admin,
        }));
        assert!(ctx
            .require_role(&[Role::SecurityOfficer], &audit, "alerts.read", "security_alert")
            .is_ok());
        assert!(audit.is_empty());
    }
}
