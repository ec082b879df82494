// Cargo-security monitor: a bounded location history per driver and three
// anomaly detectors over it, plus out-of-band communication-loss checks.
//
// Everything in here sees zone cells only. A raw fix never reaches this
// module; the obfuscator runs first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::auth::{AuthContext, Role};
use crate::error::{ok, ApiError};
use crate::http::AppState;
use crate::location::{self, MovementState, ObfuscatedLocation};
use crate::metrics::Metrics;
use crate::realtime::{Audience, Broadcaster, RealtimeEvent};

const HISTORY_CAP: usize = 100;

const STOP_WINDOW: usize = 10;
const STOP_MIN_STATIONARY: usize = 3;
const STOP_MIN_SPAN_MIN: i64 = 15;
const STOP_SUPPRESS_MIN: i64 = 30;

const RAPID_WINDOW: usize = 5;
const RAPID_MIN_ZONES: usize = 5;
const RAPID_SPAN_MIN: i64 = 5;

const COMM_LOSS_MIN: i64 = 10;
const COMM_LOSS_ESCALATE_MIN: i64 = 30;
const COMM_SUPPRESS_MIN: i64 = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    RouteDeviation,
    UnusualStop,
    TamperingDetected,
    CommunicationLost,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    FalsePositive,
    Investigated,
    Escalated,
    Resolved,
}

#[derive(Clone, Debug, Serialize)]
pub struct Resolution {
    pub status: ResolutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(rename = "resolvedBy")]
    pub resolved_by: String,
    #[serde(rename = "resolvedAt")]
    pub resolved_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SecurityAlert {
    pub id: String,
    #[serde(rename = "deliveryId")]
    pub delivery_id: String,
    #[serde(rename = "driverId")]
    pub driver_id: String,
    #[serde(rename = "vehicleId", skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(rename = "anomalyType")]
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    #[serde(rename = "zoneId")]
    pub zone_id: String,
    #[serde(rename = "detectedAt")]
    pub detected_at: DateTime<Utc>,
    pub description: String,
    pub acknowledged: bool,
    #[serde(rename = "acknowledgedAt", skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(rename = "acknowledgedBy", skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

#[derive(Clone, Debug)]
struct LocationEntry {
    zone_id: String,
    at: DateTime<Utc>,
    movement: MovementState,
}

pub struct SecurityMonitor {
    audit: Arc<AuditSink>,
    metrics: Arc<Metrics>,
    realtime: Arc<Broadcaster>,

    history: DashMap<String, VecDeque<LocationEntry>>,
    expected_routes: DashMap<String, Vec<String>>,
    alerts: DashMap<String, SecurityAlert>,
    last_alert_at: DashMap<(String, AnomalyType), DateTime<Utc>>,
    last_seen: DashMap<String, (String, DateTime<Utc>)>,
}

impl SecurityMonitor {
    pub fn new(audit: Arc<AuditSink>, metrics: Arc<Metrics>, realtime: Arc<Broadcaster>) -> Self {
        Self {
            audit,
            metrics,
            realtime,
            history: DashMap::new(),
            expected_routes: DashMap::new(),
            alerts: DashMap::new(),
            last_alert_at: DashMap::new(),
            last_seen: DashMap::new(),
        }
    }

    pub fn register_expected_route(&self, delivery_id: &str, zone_sequence: Vec<String>) {
        self.expected_routes
            .insert(delivery_id.to_string(), zone_sequence);
    }

    /// Appends a fix to the driver's history, classifies movement against
    /// the previous entry, and runs the detectors.
    pub fn process_location_update(
        &self,
        delivery_id: &str,
        driver_id: &str,
        fix: &ObfuscatedLocation,
        vehicle_id: Option<String>,
    ) -> (MovementState, Vec<SecurityAlert>) {
        Metrics::bump(&self.metrics.location_updates);
        let now = Utc::now();

        let (movement, window) = {
            let mut history = self.history.entry(driver_id.to_string()).or_default();
            let movement = match history.back() {
                None => MovementState::Unknown,
                Some(previous) if previous.zone_id == fix.zone_id => MovementState::Stationary,
                Some(_) => MovementState::Moving,
            };
            history.push_back(LocationEntry {
                zone_id: fix.zone_id.clone(),
                at: now,
                movement,
            });
            if history.len() > HISTORY_CAP {
                history.pop_front();
            }
            (movement, history.iter().cloned().collect::<Vec<_>>())
        };
        self.last_seen
            .insert(driver_id.to_string(), (delivery_id.to_string(), now));

        let mut alerts = Vec::new();
        if let Some(alert) =
            self.detect_route_deviation(delivery_id, driver_id, &fix.zone_id, vehicle_id.clone())
        {
            alerts.push(alert);
        }
        if let Some(alert) =
            self.detect_unusual_stop(delivery_id, driver_id, &window, vehicle_id.clone())
        {
            alerts.push(alert);
        }
        if let Some(alert) =
            self.detect_rapid_zone_changes(delivery_id, driver_id, &window, vehicle_id)
        {
            alerts.push(alert);
        }
        (movement, alerts)
    }

    fn detect_route_deviation(
        &self,
        delivery_id: &str,
        driver_id: &str,
        zone_id: &str,
        vehicle_id: Option<String>,
    ) -> Option<SecurityAlert> {
        let route = self.expected_routes.get(delivery_id)?;
        if route.iter().any(|z| z == zone_id) {
            return None;
        }
        drop(route);
        Some(self.raise(
            delivery_id,
            driver_id,
            vehicle_id,
            AnomalyType::RouteDeviation,
            Severity::Medium,
            zone_id,
            format!("driver left the registered corridor at {zone_id}"),
        ))
    }

    fn detect_unusual_stop(
        &self,
        delivery_id: &str,
        driver_id: &str,
        window: &[LocationEntry],
        vehicle_id: Option<String>,
    ) -> Option<SecurityAlert> {
        let recent: Vec<&LocationEntry> = window
            .iter()
            .rev()
            .take(STOP_WINDOW)
            .collect();
        let stationary: Vec<&&LocationEntry> = recent
            .iter()
            .filter(|e| e.movement == MovementState::Stationary)
            .collect();
        if stationary.len() < STOP_MIN_STATIONARY {
            return None;
        }
        // `recent` is newest-first.
        let newest = stationary.first()?.at;
        let oldest = stationary.last()?.at;
        if newest - oldest < Duration::minutes(STOP_MIN_SPAN_MIN) {
            return None;
        }
        if self.suppressed(driver_id, AnomalyType::UnusualStop, STOP_SUPPRESS_MIN) {
            return None;
        }
        let zone_id = window.last()?.zone_id.clone();
        Some(self.raise(
            delivery_id,
            driver_id,
            vehicle_id,
            AnomalyType::UnusualStop,
            Severity::Low,
            &zone_id,
            format!(
                "vehicle stationary in {zone_id} for over {STOP_MIN_SPAN_MIN} minutes"
            ),
        ))
    }

    fn detect_rapid_zone_changes(
        &self,
        delivery_id: &str,
        driver_id: &str,
        window: &[LocationEntry],
        vehicle_id: Option<String>,
    ) -> Option<SecurityAlert> {
        if window.len() < RAPID_WINDOW {
            return None;
        }
        let recent = &window[window.len() - RAPID_WINDOW..];
        let span = recent.last()?.at - recent.first()?.at;
        if span > Duration::minutes(RAPID_SPAN_MIN) {
            return None;
        }
        let distinct: std::collections::HashSet<&str> =
            recent.iter().map(|e| e.zone_id.as_str()).collect();
        if distinct.len() < RAPID_MIN_ZONES {
            return None;
        }
        let zone_id = recent.last()?.zone_id.clone();
        Some(self.raise(
            delivery_id,
            driver_id,
            vehicle_id,
            AnomalyType::TamperingDetected,
            Severity::High,
            &zone_id,
            format!(
                "{} distinct zones inside {RAPID_SPAN_MIN} minutes; GPS spoofing suspected",
                distinct.len()
            ),
        ))
    }

    /// Out-of-band check driven by the sweeper. Escalates past 30 minutes
    /// of silence; a fresh alert is withheld for 15 minutes after the last.
    pub fn check_communication_loss(
        &self,
        delivery_id: &str,
        driver_id: &str,
        last_seen_at: DateTime<Utc>,
    ) -> Option<SecurityAlert> {
        let silent_for = Utc::now() - last_seen_at;
        if silent_for < Duration::minutes(COMM_LOSS_MIN) {
            return None;
        }
        if self.suppressed(driver_id, AnomalyType::CommunicationLost, COMM_SUPPRESS_MIN) {
            return None;
        }
        let severity = if silent_for >= Duration::minutes(COMM_LOSS_ESCALATE_MIN) {
            Severity::High
        } else {
            Severity::Medium
        };
        let zone_id = self
            .history
            .get(driver_id)
            .and_then(|h| h.back().map(|e| e.zone_id.clone()))
            .unwrap_or_else(|| "unknown".to_string());
        Some(self.raise(
            delivery_id,
            driver_id,
            None,
            AnomalyType::CommunicationLost,
            severity,
            &zone_id,
            format!("no location fix for {} minutes", silent_for.num_minutes()),
        ))
    }

    /// Runs the communication-loss check across every tracked driver.
    pub fn sweep_communication_loss(&self) -> usize {
        let tracked: Vec<(String, String, DateTime<Utc>)> = self
            .last_seen
            .iter()
            .map(|e| (e.key().clone(), e.value().0.clone(), e.value().1))
            .collect();
        tracked
            .into_iter()
            .filter_map(|(driver, delivery, at)| {
                self.check_communication_loss(&delivery, &driver, at)
            })
            .count()
    }

    fn suppressed(&self, driver_id: &str, anomaly: AnomalyType, window_min: i64) -> bool {
        self.last_alert_at
            .get(&(driver_id.to_string(), anomaly))
            .is_some_and(|at| Utc::now() - *at < Duration::minutes(window_min))
    }

    fn raise(
        &self,
        delivery_id: &str,
        driver_id: &str,
        vehicle_id: Option<String>,
        anomaly_type: AnomalyType,
        severity: Severity,
        zone_id: &str,
        description: String,
    ) -> SecurityAlert {
        let alert = SecurityAlert {
            id: Uuid::new_v4().to_string(),
            delivery_id: delivery_id.to_string(),
            driver_id: driver_id.to_string(),
            vehicle_id,
            anomaly_type,
            severity,
            zone_id: zone_id.to_string(),
            detected_at: Utc::now(),
            description,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            resolution: None,
        };
        self.alerts.insert(alert.id.clone(), alert.clone());
        self.last_alert_at
            .insert((driver_id.to_string(), anomaly_type), alert.detected_at);
        Metrics::bump(&self.metrics.alerts_raised);

        self.audit.success(
            "system",
            "system",
            "alert.raise",
            "security_alert",
            Some(alert.id.clone()),
            json!({"anomaly": anomaly_type, "severity": severity, "zone_id": zone_id}),
        );
        self.realtime.broadcast(RealtimeEvent::new(
            "alert:security",
            json!({"alert": alert}),
            Audience::roles(vec![Role::SecurityOfficer, Role::Admin]),
        ));
        alert
    }

    pub fn acknowledge(&self, id: &str, by: (&str, &str)) -> Result<SecurityAlert, ApiError> {
        let updated = {
            let mut alert = self.alerts.get_mut(id).ok_or(ApiError::NotFound("alert"))?;
            if alert.resolution.is_some() {
                return Err(ApiError::Validation("alert already resolved".into()));
            }
            if !alert.acknowledged {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(Utc::now());
                alert.acknowledged_by = Some(by.0.to_string());
            }
            alert.clone()
        };
        self.audit.success(
            by.0,
            by.1,
            "alert.acknowledge",
            "security_alert",
            Some(id.to_string()),
            json!({"anomaly": updated.anomaly_type}),
        );
        Ok(updated)
    }

    pub fn resolve(
        &self,
        id: &str,
        by: (&str, &str),
        status: ResolutionStatus,
        notes: Option<String>,
    ) -> Result<SecurityAlert, ApiError> {
        let updated = {
            let mut alert = self.alerts.get_mut(id).ok_or(ApiError::NotFound("alert"))?;
            if alert.resolution.is_some() {
                return Err(ApiError::Validation("alert already resolved".into()));
            }
            alert.resolution = Some(Resolution {
                status,
                notes,
                resolved_by: by.0.to_string(),
                resolved_at: Utc::now(),
            });
            alert.clone()
        };
        self.audit.success(
            by.0,
            by.1,
            "alert.resolve",
            "security_alert",
            Some(id.to_string()),
            json!({"status": status}),
        );
        Ok(updated)
    }

    pub fn query(
        &self,
        severity: Option<Severity>,
        unacknowledged_only: bool,
        delivery_id: Option<&str>,
    ) -> Vec<SecurityAlert> {
        let mut found: Vec<SecurityAlert> = self
            .alerts
            .iter()
            .filter(|a| severity.map_or(true, |s| a.severity == s))
            .filter(|a| !unacknowledged_only || !a.acknowledged)
            .filter(|a| delivery_id.map_or(true, |d| a.delivery_id == d))
            .map(|a| a.clone())
            .collect();
        found.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        found
    }

    pub fn stats(&self) -> SecurityStats {
        let mut by_severity: HashMap<Severity, usize> = HashMap::new();
        let mut by_type: HashMap<AnomalyType, usize> = HashMap::new();
        let mut unacknowledged = 0;
        for alert in self.alerts.iter() {
            *by_severity.entry(alert.severity).or_default() += 1;
            *by_type.entry(alert.anomaly_type).or_default() += 1;
            if !alert.acknowledged {
                unacknowledged += 1;
            }
        }
        SecurityStats {
            total: self.alerts.len(),
            unacknowledged,
            by_severity,
            by_type,
            tracked_drivers: self.history.len(),
        }
    }

    /// Retention: drops history entries older than the cutoff.
    pub fn evict_history(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for mut entry in self.history.iter_mut() {
            let before = entry.len();
            entry.retain(|e| e.at >= cutoff);
            removed += before - entry.len();
        }
        self.history.retain(|_, h| !h.is_empty());
        removed
    }
}

#[derive(Serialize)]
pub struct SecurityStats {
    pub total: usize,
    pub unacknowledged: usize,
    #[serde(rename = "bySeverity")]
    pub by_severity: HashMap<Severity, usize>,
    #[serde(rename = "byType")]
    pub by_type: HashMap<AnomalyType, usize>,
    #[serde(rename = "trackedDrivers")]
    pub tracked_drivers: usize,
}

// --- HTTP surface -----------------------------------------------------------

#[derive(Deserialize)]
struct LocationUpdateBody {
    #[serde(rename = "deliveryId")]
    delivery_id: String,
    #[serde(rename = "driverId")]
    driver_id: String,
    latitude: f64,
    longitude: f64,
    #[serde(rename = "vehicleId")]
    vehicle_id: Option<String>,
    resolution: Option<u8>,
}

async fn location_update_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<LocationUpdateBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "write:delivery_status",
        &state.audit,
        "location.update",
        "location_update",
    )?;

    // The raw fix lives exactly as long as this call.
    let resolution = body.resolution.unwrap_or_else(|| {
        crate::geo::resolution_for_grid_size(state.config.location_grid_size_meters)
    });
    let mut fix = location::obfuscate(body.latitude, body.longitude, resolution, Utc::now())?;

    let (movement, alerts) = state.security.process_location_update(
        &body.delivery_id,
        &body.driver_id,
        &fix,
        body.vehicle_id,
    );
    fix.movement_state = movement;

    state.audit.success(
        &identity.user_id,
        identity.role.as_str(),
        "location.update",
        "location_update",
        Some(body.delivery_id.clone()),
        json!({"zone_id": fix.zone_id, "movement": movement}),
    );
    state.realtime.broadcast(RealtimeEvent::new(
        "location:update",
        json!({"deliveryId": body.delivery_id, "location": fix}),
        Audience::delivery(&body.delivery_id),
    ));

    Ok(ok(json!({"location": fix, "alerts": alerts})))
}

#[derive(Deserialize)]
struct ExpectedRouteBody {
    #[serde(rename = "deliveryId")]
    delivery_id: String,
    #[serde(rename = "zoneSequence")]
    zone_sequence: Vec<String>,
}

async fn expected_route_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<ExpectedRouteBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "write:delivery_assignment",
        &state.audit,
        "route.register",
        "expected_route",
    )?;
    if body.zone_sequence.is_empty() {
        return Err(ApiError::Validation("zone sequence must be non-empty".into()));
    }
    state
        .security
        .register_expected_route(&body.delivery_id, body.zone_sequence.clone());
    state.audit.success(
        &identity.user_id,
        identity.role.as_str(),
        "route.register",
        "expected_route",
        Some(body.delivery_id.clone()),
        json!({"zones": body.zone_sequence.len()}),
    );
    Ok(ok(json!({"deliveryId": body.delivery_id, "zones": body.zone_sequence.len()})))
}

#[derive(Deserialize)]
struct AlertsQuery {
    severity: Option<Severity>,
    #[serde(rename = "unacknowledgedOnly", default)]
    unacknowledged_only: bool,
    #[serde(rename = "deliveryId")]
    delivery_id: Option<String>,
}

async fn alerts_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<AlertsQuery>,
) -> Result<Response, ApiError> {
    auth.require_permission(
        "read:security_alert",
        &state.audit,
        "alerts.read",
        "security_alert",
    )?;
    let alerts = state.security.query(
        query.severity,
        query.unacknowledged_only,
        query.delivery_id.as_deref(),
    );
    Ok(ok(alerts))
}

async fn acknowledge_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "write:security_alert",
        &state.audit,
        "alert.acknowledge",
        "security_alert",
    )?;
    let alert = state
        .security
        .acknowledge(&id, (&identity.user_id, identity.role.as_str()))?;
    Ok(ok(alert))
}

#[derive(Deserialize)]
struct ResolveBody {
    status: ResolutionStatus,
    notes: Option<String>,
}

async fn resolve_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
    Json(body): Json<ResolveBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_permission(
        "write:security_alert",
        &state.audit,
        "alert.resolve",
        "security_alert",
    )?;
    let alert = state.security.resolve(
        &id,
        (&identity.user_id, identity.role.as_str()),
        body.status,
        body.notes,
    )?;
    Ok(ok(alert))
}

async fn stats_handler(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Response, ApiError> {
    auth.require_permission(
        "read:security_alert",
        &state.audit,
        "alerts.stats",
        "security_alert",
    )?;
    Ok(ok(state.security.stats()))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/location-update", post(location_update_handler))
        .route("/expected-route", post(expected_route_handler))
        .route("/alerts", get(alerts_handler))
        .route("/alerts/:id/acknowledge", post(acknowledge_handler))
        .route("/alerts/:id/resolve", post(resolve_handler))
        .route("/stats", get(stats_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> SecurityMonitor {
        let metrics = Arc::new(Metrics::new());
        SecurityMonitor::new(
            Arc::new(AuditSink::new(metrics.clone())),
            metrics.clone(),
            Arc::new(Broadcaster::new(metrics)),
        )
    }

    fn fix(zone: &str) -> ObfuscatedLocation {
        ObfuscatedLocation {
            zone_id: zone.to_string(),
            approx_time: Utc::now(),
            movement_state: MovementState::Unknown,
            resolution: 8,
        }
    }

    fn seed_history(m: &SecurityMonitor, driver: &str, entries: Vec<(&str, i64, MovementState)>) {
        let mut queue = VecDeque::new();
        for (zone, minutes_ago, movement) in entries {
            queue.push_back(LocationEntry {
                zone_id: zone.to_string(),
                at: Utc::now() - Duration::minutes(minutes_ago),
                movement,
            });
        }
        m.history.insert(driver.to_string(), queue);
    }

    #[test]
    fn test_rapid_zone_changes_raise_tampering() {
        let m = monitor();
        let mut raised = Vec::new();
        for zone in ["z8-1-1", "z8-2-2", "z8-3-3", "z8-4-4", "z8-5-5"] {
            let (_, alerts) = m.process_location_update("d3", "u1", &fix(zone), None);
            raised.extend(alerts);
        }
        assert_eq!(raised.len(), 1, "exactly one alert for the burst");
        assert_eq!(raised[0].anomaly_type, AnomalyType::TamperingDetected);
        assert_eq!(raised[0].severity, Severity::High);
    }

    #[test]
    fn test_distinct_zone_revisits_do_not_trip_tampering() {
        let m = monitor();
        let mut raised = Vec::new();
        for zone in ["z8-1-1", "z8-2-2", "z8-1-1", "z8-2-2", "z8-1-1", "z8-2-2"] {
            let (_, alerts) = m.process_location_update("d3", "u2", &fix(zone), None);
            raised.extend(alerts);
        }
        assert!(raised.is_empty(), "ping-ponging between two zones is not spoofing");
    }

    #[test]
    fn test_movement_classification() {
        let m = monitor();
        let (first, _) = m.process_location_update("d1", "u3", &fix("z8-1-1"), None);
        assert_eq!(first, MovementState::Unknown);
        let (second, _) = m.process_location_update("d1", "u3", &fix("z8-1-1"), None);
        assert_eq!(second, MovementState::Stationary);
        let (third, _) = m.process_location_update("d1", "u3", &fix("z8-9-9"), None);
        assert_eq!(third, MovementState::Moving);
    }

    #[test]
    fn test_unusual_stop_needs_span_and_count() {
        let m = monitor();
        seed_history(
            &m,
            "u4",
            vec![
                ("z8-1-1", 40, MovementState::Moving),
                ("z8-2-2", 25, MovementState::Stationary),
                ("z8-2-2", 18, MovementState::Stationary),
                ("z8-2-2", 2, MovementState::Stationary),
            ],
        );
        // The next stationary fix makes 4 stationary entries spanning >15 min.
        let (_, alerts) = m.process_location_update("d4", "u4", &fix("z8-2-2"), None);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].anomaly_type, AnomalyType::UnusualStop);
        assert_eq!(alerts[0].severity, Severity::Low);

        // A similar alert inside 30 minutes is suppressed.
        let (_, again) = m.process_location_update("d4", "u4", &fix("z8-2-2"), None);
        assert!(again.is_empty());
    }

    #[test]
    fn test_brief_stop_is_fine() {
        let m = monitor();
        seed_history(
            &m,
            "u5",
            vec![
                ("z8-2-2", 5, MovementState::Stationary),
                ("z8-2-2", 3, MovementState::Stationary),
            ],
        );
        let (_, alerts) = m.process_location_update("d5", "u5", &fix("z8-2-2"), None);
        assert!(alerts.is_empty(), "a short stop at a gate is not an anomaly");
    }

    #[test]
    fn test_route_deviation() {
        let m = monitor();
        m.register_expected_route("d6", vec!["z8-1-1".into(), "z8-2-2".into()]);
        let (_, on_route) = m.process_location_update("d6", "u6", &fix("z8-2-2"), None);
        assert!(on_route.is_empty());
        let (_, off_route) =
            m.process_location_update("d6", "u6", &fix("z8-9-9"), Some("KDA-441X".into()));
        assert_eq!(off_route.len(), 1);
        assert_eq!(off_route[0].anomaly_type, AnomalyType::RouteDeviation);
        assert_eq!(off_route[0].vehicle_id.as_deref(), Some("KDA-441X"));
    }

    #[test]
    fn test_communication_loss_escalates_and_suppresses() {
        let m = monitor();
        let alert = m
            .check_communication_loss("d7", "u7", Utc::now() - Duration::minutes(12))
            .expect("12 minutes of silence alerts");
        assert_eq!(alert.severity, Severity::Medium);

        // Within the 15-minute suppression window nothing new fires.
        assert!(m
            .check_communication_loss("d7", "u7", Utc::now() - Duration::minutes(35))
            .is_none());

        let late = m
            .check_communication_loss("d7", "u8", Utc::now() - Duration::minutes(35))
            .expect("35 minutes of silence alerts");
        assert_eq!(late.severity, Severity::High);

        assert!(m
            .check_communication_loss("d7", "u9", Utc::now() - Duration::minutes(5))
            .is_none());
    }

    #[test]
    fn test_alert_lifecycle() {
        let m = monitor();
        let (_, alerts) = {
            m.register_expected_route("d8", vec!["z8-1-1".into()]);
            m.process_location_update("d8", "u10", &fix("z8-7-7"), None)
        };
        let id = alerts[0].id.clone();

        let acked = m.acknowledge(&id, ("officer-1", "security_officer")).unwrap();
        assert!(acked.acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("officer-1"));

        let resolved = m
            .resolve(&id, ("officer-1", "security_officer"), ResolutionStatus::FalsePositive, Some("known depot".into()))
            .unwrap();
        assert_eq!(resolved.resolution.as_ref().unwrap().status, ResolutionStatus::FalsePositive);

        // Resolution is terminal.
        assert!(m.acknowledge(&id, ("officer-1", "security_officer")).is_err());
        assert!(m
            .resolve(&id, ("officer-1", "security_officer"), ResolutionStatus::Resolved, None)
            .is_err());
    }

    #[test]
    fn test_unknown_alert_is_not_found() {
        let m = monitor();
        assert!(matches!(
            m.acknowledge("missing", ("o", "security_officer")),
            Err(ApiError::NotFound(_))
        ));
    }

    #[test]
    fn test_history_bounded_at_cap() {
        let m = monitor();
        for i in 0..120 {
            let zone = format!("z8-{}-{}", i / 10, i / 10);
            m.process_location_update("d9", "u11", &fix(&zone), None);
        }
        assert_eq!(m.history.get("u11").unwrap().len(), HISTORY_CAP);
    }

    #[test]
    fn test_query_filters_and_stats() {
        let m = monitor();
        m.register_expected_route("d10", vec!["z8-1-1".into()]);
        m.process_location_update("d10", "u12", &fix("z8-5-5"), None);
        let _ = m.check_communication_loss("d11", "u13", Utc::now() - Duration::minutes(40));

        assert_eq!(m.query(None, false, None).len(), 2);
        assert_eq!(m.query(Some(Severity::Medium), false, None).len(), 1);
        assert_eq!(m.query(None, false, Some("d10")).len(), 1);

        let stats = m.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.unacknowledged, 2);
        assert_eq!(stats.by_type[&AnomalyType::RouteDeviation], 1);
        assert_eq!(stats.by_severity[&Severity::High], 1);
    }
}
