// Emergency orchestrator: panic button and impact detection.
//
// This is the privacy exception. Raw coordinates are stored on the
// emergency record and travel in its notifications and broadcasts, because
// first responders need a position, not a zone. Nothing outside this module
// handles a raw fix beyond the transient obfuscator input.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::auth::{AuthContext, Role};
use crate::error::{ok, ApiError};
use crate::geo;
use crate::http::AppState;
use crate::metrics::Metrics;
use crate::notify::{Channel, NotificationService, Priority};
use crate::realtime::{Audience, Broadcaster, RealtimeEvent};

/// Impact threshold in g. A phone dropped on a seat peaks around 2–3 g;
/// a collision reads well past 4.
const G_FORCE_THRESHOLD: f64 = 4.0;
const ACCEL_WINDOW: usize = 30;
const MAX_CONTACTS: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    PanicButton,
    AccidentDetected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyStatus {
    Triggered,
    Responding,
    Acknowledged,
    Resolved,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RawCoordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct AccelReading {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelReading {
    pub fn g_force(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmergencyContact {
    pub name: String,
    pub channel: Channel,
    /// Phone number / device token / address for the channel.
    pub address: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct EmergencyRecord {
    pub id: String,
    #[serde(rename = "driverId")]
    pub driver_id: String,
    #[serde(rename = "deliveryId", skip_serializing_if = "Option::is_none")]
    pub delivery_id: Option<String>,
    #[serde(rename = "type")]
    pub emergency_type: EmergencyType,
    pub location: RawCoordinates,
    #[serde(rename = "triggeredAt")]
    pub triggered_at: DateTime<Utc>,
    pub status: EmergencyStatus,
    /// Ids of the notifications fanned out for this emergency.
    pub notifications: Vec<String>,
    #[serde(rename = "acknowledgedBy", skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(rename = "acknowledgedAt", skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(rename = "resolvedBy", skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(rename = "resolvedAt", skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

pub struct EmergencyService {
    audit: Arc<AuditSink>,
    metrics: Arc<Metrics>,
    notify: Arc<NotificationService>,
    realtime: Arc<Broadcaster>,

    records: DashMap<String, EmergencyRecord>,
    active: DashMap<String, String>,
    accel: DashMap<String, VecDeque<AccelReading>>,
    contacts: DashMap<String, Vec<EmergencyContact>>,
}

impl EmergencyService {
    pub fn new(
        audit: Arc<AuditSink>,
        metrics: Arc<Metrics>,
        notify: Arc<NotificationService>,
        realtime: Arc<Broadcaster>,
    ) -> Self {
        Self {
            audit,
            metrics,
            notify,
            realtime,
            records: DashMap::new(),
            active: DashMap::new(),
            accel: DashMap::new(),
            contacts: DashMap::new(),
        }
    }

    /// Panic button. Idempotent while an emergency is open for the driver:
    /// a second press returns the existing record instead of forking a
    /// parallel response.
    pub fn panic(
        &self,
        actor: (&str, &str),
        driver_id: &str,
        location: RawCoordinates,
        delivery_id: Option<String>,
    ) -> Result<EmergencyRecord, ApiError> {
        geo::validate_coords(location.latitude, location.longitude)?;
        if let Some(existing) = self.active_for(driver_id) {
            return Ok(existing);
        }
        Ok(self.open_emergency(actor, driver_id, EmergencyType::PanicButton, location, delivery_id))
    }

    /// Impact detection over the rolling accelerometer window.
    pub fn accelerometer(
        &self,
        actor: (&str, &str),
        driver_id: &str,
        reading: AccelReading,
        location: RawCoordinates,
        delivery_id: Option<String>,
    ) -> Result<Option<EmergencyRecord>, ApiError> {
        geo::validate_coords(location.latitude, location.longitude)?;
        {
            let mut window = self.accel.entry(driver_id.to_string()).or_default();
            window.push_back(reading);
            if window.len() > ACCEL_WINDOW {
                window.pop_front();
            }
        }

        if reading.g_force() < G_FORCE_THRESHOLD {
            return Ok(None);
        }
        if let Some(existing) = self.active_for(driver_id) {
            return Ok(Some(existing));
        }
        Ok(Some(self.open_emergency(
            actor,
            driver_id,
            EmergencyType::AccidentDetected,
            location,
            delivery_id,
        )))
    }

    fn open_emergency(
        &self,
        actor: (&str, &str),
        driver_id: &str,
        emergency_type: EmergencyType,
        location: RawCoordinates,
        delivery_id: Option<String>,
    ) -> EmergencyRecord {
        let record = EmergencyRecord {
            id: Uuid::new_v4().to_string(),
            driver_id: driver_id.to_string(),
            delivery_id,
            emergency_type,
            location,
            triggered_at: Utc::now(),
            status: EmergencyStatus::Triggered,
            notifications: Vec::new(),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
        };
        self.records.insert(record.id.clone(), record.clone());
        self.active.insert(driver_id.to_string(), record.id.clone());
        Metrics::bump(&self.metrics.emergencies_triggered);

        // Coordinates stay out of the audit trail even on this path; the
        // record itself is where responders read the position from.
        self.audit.success(
            actor.0,
            actor.1,
            "emergency.trigger",
            "emergency",
            Some(record.id.clone()),
            json!({"type": emergency_type, "driver_id": driver_id}),
        );

        self.initiate_response(record)
    }

    /// Moves the record to `responding`, fans out critical notifications to
    /// the driver's contacts, and broadcasts to response roles. The broadcast
    /// payload carries the raw position; this is the one sanctioned leak.
    fn initiate_response(&self, mut snapshot: EmergencyRecord) -> EmergencyRecord {
        let mut notification_ids = Vec::new();
        let contact_list = self
            .contacts
            .get(&snapshot.driver_id)
            .map(|c| c.clone())
            .unwrap_or_default();
        for contact in &contact_list {
            let content = json!({
                "driverId": snapshot.driver_id,
                "type": snapshot.emergency_type,
                "latitude": snapshot.location.latitude,
                "longitude": snapshot.location.longitude,
                "triggeredAt": snapshot.triggered_at,
            })
            .to_string();
            match self.notify.send(
                ("system", "system"),
                &contact.address,
                contact.channel,
                "emergency_alert",
                &content,
                Priority::Critical,
            ) {
                Ok(notification) => notification_ids.push(notification.id),
                Err(error) => {
                    warn!(emergency = %snapshot.id, contact = %contact.name, %error, "emergency_contact_notify_failed");
                }
            }
        }

        snapshot.status = EmergencyStatus::Responding;
        snapshot.notifications = notification_ids;
        if let Some(mut record) = self.records.get_mut(&snapshot.id) {
            *record = snapshot.clone();
        }

        self.realtime.broadcast(RealtimeEvent::new(
            "alert:emergency",
            json!({"emergency": snapshot}),
            Audience::roles(vec![Role::SecurityOfficer, Role::Admin, Role::Dispatcher]),
        ));
        snapshot
    }

    pub fn acknowledge(&self, id: &str, by: (&str, &str)) -> Result<EmergencyRecord, ApiError> {
        let updated = {
            let mut record = self.records.get_mut(id).ok_or(ApiError::NotFound("emergency"))?;
            match record.status {
                EmergencyStatus::Triggered | EmergencyStatus::Responding => {
                    record.status = EmergencyStatus::Acknowledged;
                    record.acknowledged_by = Some(by.0.to_string());
                    record.acknowledged_at = Some(Utc::now());
                    record.clone()
                }
                EmergencyStatus::Acknowledged => record.clone(),
                EmergencyStatus::Resolved => {
                    return Err(ApiError::Validation("emergency already resolved".into()))
                }
            }
        };
        self.audit.success(
            by.0,
            by.1,
            "emergency.acknowledge",
            "emergency",
            Some(id.to_string()),
            json!({"status": updated.status}),
        );
        Ok(updated)
    }

    pub fn resolve(&self, id: &str, by: (&str, &str)) -> Result<EmergencyRecord, ApiError> {
        let updated = {
            let mut record = self.records.get_mut(id).ok_or(ApiError::NotFound("emergency"))?;
            if record.status == EmergencyStatus::Resolved {
                return Err(ApiError::Validation("emergency already resolved".into()));
            }
            record.status = EmergencyStatus::Resolved;
            record.resolved_by = Some(by.0.to_string());
            record.resolved_at = Some(Utc::now());
            record.clone()
        };
        // The driver may trigger again from here on.
        self.active.remove(&updated.driver_id);

        self.audit.success(
            by.0,
            by.1,
            "emergency.resolve",
            "emergency",
            Some(id.to_string()),
            json!({"driver_id": updated.driver_id}),
        );
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Option<EmergencyRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn active_for(&self, driver_id: &str) -> Option<EmergencyRecord> {
        let id = self.active.get(driver_id)?.clone();
        let record = self.records.get(&id)?.clone();
        if record.status == EmergencyStatus::Resolved {
            return None;
        }
        Some(record)
    }

    pub fn list(&self) -> Vec<EmergencyRecord> {
        let mut all: Vec<EmergencyRecord> = self.records.iter().map(|r| r.clone()).collect();
        all.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        all
    }

    pub fn set_contacts(
        &self,
        driver_id: &str,
        contacts: Vec<EmergencyContact>,
    ) -> Result<(), ApiError> {
        if contacts.len() > MAX_CONTACTS {
            return Err(ApiError::Validation(format!(
                "at most {MAX_CONTACTS} emergency contacts"
            )));
        }
        self.contacts.insert(driver_id.to_string(), contacts);
        Ok(())
    }

    pub fn contacts_for(&self, driver_id: &str) -> Vec<EmergencyContact> {
        self.contacts
            .get(driver_id)
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

// --- HTTP surface -----------------------------------------------------------

#[derive(Deserialize)]
struct PanicBody {
    #[serde(rename = "driverId")]
    driver_id: String,
    latitude: f64,
    longitude: f64,
    #[serde(rename = "deliveryId")]
    delivery_id: Option<String>,
}

async fn panic_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<PanicBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "write:emergency",
        &state.audit,
        "emergency.trigger",
        "emergency",
    )?;
    let record = state.emergency.panic(
        (&identity.user_id, identity.role.as_str()),
        &body.driver_id,
        RawCoordinates {
            latitude: body.latitude,
            longitude: body.longitude,
        },
        body.delivery_id,
    )?;
    Ok(ok(record))
}

#[derive(Deserialize)]
struct AccelerometerBody {
    #[serde(rename = "driverId")]
    driver_id: String,
    reading: AccelReading,
    latitude: f64,
    longitude: f64,
    #[serde(rename = "deliveryId")]
    delivery_id: Option<String>,
}

async fn accelerometer_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<AccelerometerBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "write:emergency",
        &state.audit,
        "emergency.impact",
        "emergency",
    )?;
    let triggered = state.emergency.accelerometer(
        (&identity.user_id, identity.role.as_str()),
        &body.driver_id,
        body.reading,
        RawCoordinates {
            latitude: body.latitude,
            longitude: body.longitude,
        },
        body.delivery_id,
    )?;
    Ok(ok(json!({"triggered": triggered.is_some(), "emergency": triggered})))
}

/// Reading an emergency exposes raw coordinates; every read lands in the
/// audit trail.
fn audit_emergency_read(state: &AppState, identity: &crate::auth::Identity, resource: &str) {
    state.audit.success(
        &identity.user_id,
        identity.role.as_str(),
        "emergency.read",
        "emergency",
        Some(resource.to_string()),
        json!({}),
    );
}

async fn get_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "read:emergency",
        &state.audit,
        "emergency.read",
        "emergency",
    )?;
    let record = state.emergency.get(&id).ok_or(ApiError::NotFound("emergency"))?;
    audit_emergency_read(&state, identity, &id);
    Ok(ok(record))
}

async fn active_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(driver_id): Path<String>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "read:emergency",
        &state.audit,
        "emergency.read",
        "emergency",
    )?;
    let record = state.emergency.active_for(&driver_id);
    audit_emergency_read(&state, identity, &driver_id);
    Ok(ok(json!({"active": record})))
}

async fn list_handler(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "read:emergency",
        &state.audit,
        "emergency.read",
        "emergency",
    )?;
    audit_emergency_read(&state, identity, "all");
    Ok(ok(state.emergency.list()))
}

async fn acknowledge_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "write:emergency",
        &state.audit,
        "emergency.acknowledge",
        "emergency",
    )?;
    let record = state
        .emergency
        .acknowledge(&id, (&identity.user_id, identity.role.as_str()))?;
    Ok(ok(record))
}

async fn resolve_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "write:emergency",
        &state.audit,
        "emergency.resolve",
        "emergency",
    )?;
    let record = state
        .emergency
        .resolve(&id, (&identity.user_id, identity.role.as_str()))?;
    Ok(ok(record))
}

#[derive(Deserialize)]
struct ContactsBody {
    contacts: Vec<EmergencyContact>,
}

async fn set_contacts_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(driver_id): Path<String>,
    Json(body): Json<ContactsBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "write:emergency",
        &state.audit,
        "emergency.contacts.update",
        "emergency_contacts",
    )?;
    state.emergency.set_contacts(&driver_id, body.contacts.clone())?;
    state.audit.success(
        &identity.user_id,
        identity.role.as_str(),
        "emergency.contacts.update",
        "emergency_contacts",
        Some(driver_id.clone()),
        json!({"count": body.contacts.len()}),
    );
    Ok(ok(json!({"driverId": driver_id, "count": body.contacts.len()})))
}

async fn get_contacts_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(driver_id): Path<String>,
) -> Result<Response, ApiError> {
    auth.require_permission(
        "read:emergency",
        &state.audit,
        "emergency.contacts.read",
        "emergency_contacts",
    )?;
    Ok(ok(state.emergency.contacts_for(&driver_id)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/panic", post(panic_handler))
        .route("/accelerometer", post(accelerometer_handler))
        .route("/", get(list_handler))
        .route("/active/:driver_id", get(active_handler))
        .route("/contacts/:driver_id", post(set_contacts_handler).get(get_contacts_handler))
        .route("/:id", get(get_handler))
        .route("/:id/acknowledge", post(acknowledge_handler))
        .route("/:id/resolve", post(resolve_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CryptoService;

    const ACTOR: (&str, &str) = ("driver-u1", "driver");
    const NAIROBI: RawCoordinates = RawCoordinates {
        latitude: -1.300,
        longitude: 36.800,
    };

    fn service() -> EmergencyService {
        let metrics = Arc::new(Metrics::new());
        let audit = Arc::new(AuditSink::new(metrics.clone()));
        let notify = Arc::new(NotificationService::new(
            Arc::new(CryptoService::new("emergency-master-key-0123456789ab")),
            audit.clone(),
            metrics.clone(),
        ));
        EmergencyService::new(audit, metrics.clone(), notify, Arc::new(Broadcaster::new(metrics)))
    }

    #[tokio::test]
    async fn test_panic_is_idempotent_until_resolved() {
        let s = service();
        let first = s.panic(ACTOR, "u1", NAIROBI, Some("d3".into())).unwrap();
        assert_eq!(first.status, EmergencyStatus::Responding);
        assert_eq!(first.location.latitude, -1.300);
        assert_eq!(first.location.longitude, 36.800);

        let second = s.panic(ACTOR, "u1", NAIROBI, Some("d3".into())).unwrap();
        assert_eq!(first.id, second.id, "second press returns the open record");

        let resolved = s.resolve(&first.id, ("admin-1", "admin")).unwrap();
        assert_eq!(resolved.status, EmergencyStatus::Resolved);
        assert!(s.active_for("u1").is_none());

        let third = s.panic(ACTOR, "u1", NAIROBI, None).unwrap();
        assert_ne!(third.id, first.id, "a resolved emergency does not absorb new panics");
    }

    #[tokio::test]
    async fn test_impact_detection_threshold() {
        let s = service();
        // Normal driving vibration.
        for _ in 0..29 {
            let none = s
                .accelerometer(ACTOR, "u2", AccelReading { x: 0.4, y: 0.3, z: 1.0 }, NAIROBI, None)
                .unwrap();
            assert!(none.is_none());
        }
        assert_eq!(s.accel.get("u2").unwrap().len(), 29);

        // 4.5 g impact.
        let triggered = s
            .accelerometer(ACTOR, "u2", AccelReading { x: 4.0, y: 2.0, z: 0.5 }, NAIROBI, Some("d1".into()))
            .unwrap()
            .expect("impact should open an emergency");
        assert_eq!(triggered.emergency_type, EmergencyType::AccidentDetected);

        // A follow-up spike while active returns the same record.
        let again = s
            .accelerometer(ACTOR, "u2", AccelReading { x: 5.0, y: 0.0, z: 0.0 }, NAIROBI, None)
            .unwrap()
            .unwrap();
        assert_eq!(again.id, triggered.id);
    }

    #[tokio::test]
    async fn test_accel_window_bounded() {
        let s = service();
        for _ in 0..40 {
            s.accelerometer(ACTOR, "u3", AccelReading { x: 0.1, y: 0.1, z: 1.0 }, NAIROBI, None)
                .unwrap();
        }
        assert_eq!(s.accel.get("u3").unwrap().len(), ACCEL_WINDOW);
    }

    #[test]
    fn test_g_force_magnitude() {
        let reading = AccelReading { x: 3.0, y: 4.0, z: 0.0 };
        assert!((reading.g_force() - 5.0).abs() < 1e-9);
        assert!(AccelReading { x: 0.0, y: 0.0, z: 1.0 }.g_force() < G_FORCE_THRESHOLD);
    }

    #[tokio::test]
    async fn test_contacts_are_notified_critically() {
        let s = service();
        s.set_contacts(
            "u4",
            vec![
                EmergencyContact {
                    name: "Akinyi".into(),
                    channel: Channel::Sms,
                    address: "+254700000001".into(),
                },
                EmergencyContact {
                    name: "Ops desk".into(),
                    channel: Channel::Email,
                    address: "ops@salama.example".into(),
                },
            ],
        )
        .unwrap();

        let record = s.panic(ACTOR, "u4", NAIROBI, None).unwrap();
        assert_eq!(record.notifications.len(), 2);
        for id in &record.notifications {
            let notification = s.notify.get(id).unwrap();
            assert_eq!(notification.priority, Priority::Critical);
            assert_eq!(notification.template_id, "emergency_alert");
        }
    }

    #[tokio::test]
    async fn test_contact_cap() {
        let s = service();
        let too_many = (0..6)
            .map(|i| EmergencyContact {
                name: format!("c{i}"),
                channel: Channel::Sms,
                address: format!("+2547000000{i:02}"),
            })
            .collect();
        assert!(s.set_contacts("u5", too_many).is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_and_not_found() {
        let s = service();
        let record = s.panic(ACTOR, "u6", NAIROBI, None).unwrap();

        let acked = s.acknowledge(&record.id, ("officer-1", "security_officer")).unwrap();
        assert_eq!(acked.status, EmergencyStatus::Acknowledged);

        let resolved = s.resolve(&record.id, ("officer-1", "security_officer")).unwrap();
        assert_eq!(resolved.status, EmergencyStatus::Resolved);
        assert!(s.resolve(&record.id, ("officer-1", "security_officer")).is_err());

        assert!(matches!(
            s.acknowledge("missing", ("x", "admin")),
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_audit_trail_never_carries_coordinates() {
        let s = service();
        s.panic(ACTOR, "u7", NAIROBI, None).unwrap();
        for entry in s.audit.recent(100) {
            let serialised = serde_json::to_string(&entry).unwrap();
            assert!(!serialised.contains("-1.3"), "audit leaked a coordinate: {serialised}");
            assert!(!serialised.contains("36.8"), "audit leaked a coordinate: {serialised}");
        }
    }
}
