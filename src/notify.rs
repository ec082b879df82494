// Outbound notifications: per-recipient token bucket, encrypted content at
// rest, a closed set of channel adapters, and bounded retry with backoff on
// a background task per dispatch.
//
// Delivery is at-least-once. A record is identified by its id end to end,
// so a re-dispatch of an already-sent id is a no-op, not a duplicate.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::auth::{AuthContext, Role};
use crate::crypto::CryptoService;
use crate::error::{ok, ok_paginated, ApiError, Pagination};
use crate::http::AppState;
use crate::metrics::Metrics;

/// Token bucket: at most 10 sends per recipient per channel per minute.
const RATE_MAX_SENDS: u32 = 10;
const RATE_WINDOW_SECS: i64 = 60;

const RETRY_SCHEDULE_SECS: [u64; 5] = [1, 5, 30, 60, 300];
const MAX_RETRIES: u32 = 5;
const ADAPTER_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Push,
    Whatsapp,
    Ussd,
    Email,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct NotificationRecord {
    pub id: String,
    #[serde(rename = "recipientId")]
    pub recipient_id: String,
    pub channel: Channel,
    pub priority: Priority,
    #[serde(rename = "templateId")]
    pub template_id: String,
    #[serde(skip_serializing)]
    pub content_ciphertext: String,
    #[serde(rename = "scheduledAt")]
    pub scheduled_at: DateTime<Utc>,
    #[serde(rename = "sentAt", skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(rename = "deliveredAt", skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(rename = "readAt", skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    #[serde(rename = "maxRetries")]
    pub max_retries: u32,
    #[serde(rename = "failureReason", skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuietHours {
    /// Local hour [0, 24) at which the quiet window opens.
    pub start: u32,
    /// Local hour [0, 24) at which it closes; may wrap past midnight.
    pub end: u32,
}

impl QuietHours {
    fn covers(&self, at: DateTime<Utc>) -> bool {
        if self.start == self.end {
            return false;
        }
        let hour = at.hour();
        if self.start < self.end {
            (self.start..self.end).contains(&hour)
        } else {
            hour >= self.start || hour < self.end
        }
    }

    fn next_end(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let today_end = from
            .date_naive()
            .and_hms_opt(self.end, 0, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(from);
        if today_end > from {
            today_end
        } else {
            today_end + Duration::days(1)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Preferences {
    pub channels: Vec<Channel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiet: Option<QuietHours>,
}

struct RateEntry {
    count: u32,
    window_start: DateTime<Utc>,
}

/// What the dispatch loop should do after one adapter attempt.
#[derive(Debug, PartialEq)]
enum AttemptDisposition {
    Sent,
    RetryAfter(std::time::Duration),
    Failed,
    Abandoned,
}

pub struct NotificationService {
    crypto: Arc<CryptoService>,
    audit: Arc<AuditSink>,
    metrics: Arc<Metrics>,
    records: DashMap<String, NotificationRecord>,
    prefs: DashMap<String, Preferences>,
    rate: DashMap<(String, Channel), RateEntry>,
}

impl NotificationService {
    pub fn new(crypto: Arc<CryptoService>, audit: Arc<AuditSink>, metrics: Arc<Metrics>) -> Self {
        Self {
            crypto,
            audit,
            metrics,
            records: DashMap::new(),
            prefs: DashMap::new(),
            rate: DashMap::new(),
        }
    }

    /// Queues a notification and spawns its dispatch task. Preference and
    /// rate-limit checks happen here, before anything is persisted.
    pub fn send(
        self: &Arc<Self>,
        actor: (&str, &str),
        recipient_id: &str,
        channel: Channel,
        template_id: &str,
        content: &str,
        priority: Priority,
    ) -> Result<NotificationRecord, ApiError> {
        // Critical traffic overrides both channel preferences and quiet
        // hours; an emergency does not wait for morning.
        let mut scheduled_at = Utc::now();
        if let Some(prefs) = self.prefs.get(recipient_id) {
            if priority != Priority::Critical {
                if !prefs.channels.contains(&channel) {
                    return Err(ApiError::Validation(format!(
                        "recipient does not accept {channel:?} notifications"
                    )));
                }
                if let Some(quiet) = &prefs.quiet {
                    if quiet.covers(scheduled_at) {
                        scheduled_at = quiet.next_end(scheduled_at);
                    }
                }
            }
        }

        if !self.check_rate(recipient_id, channel) {
            Metrics::bump(&self.metrics.rate_limited);
            return Err(ApiError::RateLimited);
        }

        let record = NotificationRecord {
            id: Uuid::new_v4().to_string(),
            recipient_id: recipient_id.to_string(),
            channel,
            priority,
            template_id: template_id.to_string(),
            content_ciphertext: self.crypto.encrypt(content.as_bytes(), recipient_id)?,
            scheduled_at,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            status: NotificationStatus::Pending,
            retry_count: 0,
            max_retries: MAX_RETRIES,
            failure_reason: None,
        };
        self.records.insert(record.id.clone(), record.clone());

        self.audit.success(
            actor.0,
            actor.1,
            "notification.send",
            "notification",
            Some(record.id.clone()),
            json!({"channel": channel, "priority": priority, "template": template_id}),
        );

        let service = Arc::clone(self);
        let id = record.id.clone();
        tokio::spawn(async move {
            service.dispatch(&id).await;
        });
        Ok(record)
    }

    /// Teacher-style token bucket: the window resets lazily on the first
    /// access past its boundary.
    fn check_rate(&self, recipient_id: &str, channel: Channel) -> bool {
        let now = Utc::now();
        let mut entry = self
            .rate
            .entry((recipient_id.to_string(), channel))
            .or_insert(RateEntry {
                count: 0,
                window_start: now,
            });
        if now - entry.window_start > Duration::seconds(RATE_WINDOW_SECS) {
            entry.count = 1;
            entry.window_start = now;
            true
        } else if entry.count < RATE_MAX_SENDS {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    async fn dispatch(self: Arc<Self>, id: &str) {
        let scheduled_at = match self.records.get(id) {
            Some(record) => record.scheduled_at,
            None => return,
        };
        let defer = (scheduled_at - Utc::now()).to_std().unwrap_or_default();
        if !defer.is_zero() {
            debug!(notification = id, defer_secs = defer.as_secs(), "notification_deferred");
            sleep(defer).await;
        }

        loop {
            let channel = match self.records.get(id) {
                Some(record) if record.status == NotificationStatus::Pending => record.channel,
                // Already sent, failed, or gone; nothing to dispatch.
                _ => return,
            };

            let attempt = timeout(
                std::time::Duration::from_secs(ADAPTER_TIMEOUT_SECS),
                transport_send(channel, id),
            )
            .await
            .unwrap_or_else(|_| Err("adapter timed out".to_string()));

            match self.apply_attempt_outcome(id, attempt) {
                AttemptDisposition::Sent | AttemptDisposition::Failed | AttemptDisposition::Abandoned => return,
                AttemptDisposition::RetryAfter(delay) => sleep(delay).await,
            }
        }
    }

    /// Advances a record's state machine after one adapter attempt.
    fn apply_attempt_outcome(
        &self,
        id: &str,
        outcome: Result<(), String>,
    ) -> AttemptDisposition {
        let mut record = match self.records.get_mut(id) {
            Some(record) => record,
            None => return AttemptDisposition::Abandoned,
        };
        if record.status != NotificationStatus::Pending {
            return AttemptDisposition::Abandoned;
        }

        match outcome {
            Ok(()) => {
                record.status = NotificationStatus::Sent;
                record.sent_at = Some(Utc::now());
                Metrics::bump(&self.metrics.notifications_sent);
                AttemptDisposition::Sent
            }
            Err(reason) => {
                if record.retry_count < record.max_retries {
                    record.retry_count += 1;
                    Metrics::bump(&self.metrics.notification_retries);
                    let delay = RETRY_SCHEDULE_SECS[(record.retry_count - 1) as usize];
                    debug!(notification = id, retry = record.retry_count, delay_secs = delay, "notification_retry");
                    AttemptDisposition::RetryAfter(std::time::Duration::from_secs(delay))
                } else {
                    record.status = NotificationStatus::Failed;
                    record.failure_reason = Some(reason.clone());
                    Metrics::bump(&self.metrics.notifications_failed);
                    warn!(notification = id, reason = %reason, "notification_failed");
                    let recipient = record.recipient_id.clone();
                    drop(record);
                    self.audit.failure(
                        "system",
                        "system",
                        "notification.dispatch",
                        "notification",
                        Some(id.to_string()),
                        json!({"recipient_id": recipient, "reason": reason}),
                    );
                    AttemptDisposition::Failed
                }
            }
        }
    }

    pub fn mark_delivered(&self, id: &str) -> Result<NotificationRecord, ApiError> {
        let mut record = self.records.get_mut(id).ok_or(ApiError::NotFound("notification"))?;
        match record.status {
            NotificationStatus::Sent => {
                record.status = NotificationStatus::Delivered;
                record.delivered_at = Some(Utc::now());
                Ok(record.clone())
            }
            NotificationStatus::Delivered | NotificationStatus::Read => Ok(record.clone()),
            _ => Err(ApiError::Validation(
                "notification has not been sent yet".into(),
            )),
        }
    }

    pub fn mark_read(&self, id: &str) -> Result<NotificationRecord, ApiError> {
        let mut record = self.records.get_mut(id).ok_or(ApiError::NotFound("notification"))?;
        match record.status {
            NotificationStatus::Delivered => {
                record.status = NotificationStatus::Read;
                record.read_at = Some(Utc::now());
                Ok(record.clone())
            }
            NotificationStatus::Read => Ok(record.clone()),
            _ => Err(ApiError::Validation(
                "notification has not been delivered yet".into(),
            )),
        }
    }

    pub fn get(&self, id: &str) -> Option<NotificationRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    pub fn for_user(&self, recipient_id: &str) -> Vec<NotificationRecord> {
        let mut found: Vec<NotificationRecord> = self
            .records
            .iter()
            .filter(|r| r.recipient_id == recipient_id)
            .map(|r| r.clone())
            .collect();
        found.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        found
    }

    pub fn set_preferences(&self, user_id: &str, preferences: Preferences) {
        self.prefs.insert(user_id.to_string(), preferences);
    }

    pub fn preferences(&self, user_id: &str) -> Option<Preferences> {
        self.prefs.get(user_id).map(|p| p.clone())
    }

    /// Drops stale rate windows; the sweeper runs this periodically.
    pub fn evict_rate_windows(&self) -> usize {
        let now = Utc::now();
        let before = self.rate.len();
        self.rate
            .retain(|_, e| now - e.window_start < Duration::seconds(RATE_WINDOW_SECS * 2));
        before - self.rate.len()
    }
}

/// Stub transports. The closed enumeration is the integration seam: a real
/// provider replaces one arm without touching the dispatch machinery.
async fn transport_send(channel: Channel, notification_id: &str) -> Result<(), String> {
    // Simulated provider round-trip.
    sleep(std::time::Duration::from_millis(5)).await;
    match channel {
        Channel::Sms => {
            debug!(notification = notification_id, "sms_adapter_send");
            Ok(())
        }
        Channel::Push => {
            debug!(notification = notification_id, "push_adapter_send");
            Ok(())
        }
        Channel::Whatsapp => {
            debug!(notification = notification_id, "whatsapp_adapter_send");
            Ok(())
        }
        Channel::Ussd => {
            debug!(notification = notification_id, "ussd_adapter_send");
            Ok(())
        }
        Channel::Email => {
            debug!(notification = notification_id, "email_adapter_send");
            Ok(())
        }
    }
}

// --- HTTP surface -----------------------------------------------------------

#[derive(Deserialize)]
struct SendBody {
    #[serde(rename = "recipientId")]
    recipient_id: String,
    channel: Channel,
    #[serde(rename = "templateId")]
    template_id: String,
    content: String,
    #[serde(default)]
    priority: Priority,
}

async fn send_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(body): Json<SendBody>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    let record = state.notify.send(
        (&identity.user_id, identity.role.as_str()),
        &body.recipient_id,
        body.channel,
        &body.template_id,
        &body.content,
        body.priority,
    )?;
    Ok(ok(record))
}

fn require_recipient_or_admin(
    state: &AppState,
    auth: &AuthContext,
    recipient_id: &str,
    action: &str,
) -> Result<(), ApiError> {
    let identity = auth.require_auth()?;
    let allowed = identity.user_id == recipient_id
        || identity.role == Role::Admin
        || identity.role == Role::System
        || identity.role == Role::Dispatcher;
    if !allowed {
        state
            .audit
            .denied(&identity.user_id, identity.role.as_str(), action, "notification");
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

async fn get_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let record = state.notify.get(&id).ok_or(ApiError::NotFound("notification"))?;
    require_recipient_or_admin(&state, &auth, &record.recipient_id, "notification.read")?;
    Ok(ok(record))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    offset: usize,
    limit: Option<usize>,
}

async fn for_user_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(user_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Response, ApiError> {
    require_recipient_or_admin(&state, &auth, &user_id, "notification.read")?;
    let all = state.notify.for_user(&user_id);
    let total = all.len();
    let limit = page.limit.unwrap_or(50);
    let slice: Vec<NotificationRecord> = all.into_iter().skip(page.offset).take(limit).collect();
    Ok(ok_paginated(
        slice,
        Pagination {
            total,
            offset: page.offset,
            limit,
        },
    ))
}

async fn put_preferences_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(preferences): Json<Preferences>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    if preferences.channels.is_empty() {
        return Err(ApiError::Validation("at least one channel is required".into()));
    }
    if let Some(quiet) = &preferences.quiet {
        if quiet.start >= 24 || quiet.end >= 24 {
            return Err(ApiError::Validation("quiet hours must be within 0..24".into()));
        }
    }
    state.notify.set_preferences(&identity.user_id, preferences.clone());
    state.audit.success(
        &identity.user_id,
        identity.role.as_str(),
        "preferences.update",
        "notification_preferences",
        Some(identity.user_id.clone()),
        json!({"channels": preferences.channels}),
    );
    Ok(ok(preferences))
}

async fn get_preferences_handler(
    State(state): State<AppState>,
    auth: AuthContext,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    let preferences = state
        .notify
        .preferences(&identity.user_id)
        .ok_or(ApiError::NotFound("preferences"))?;
    Ok(ok(preferences))
}

async fn delivered_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    let record = state.notify.mark_delivered(&id)?;
    state.audit.success(
        &identity.user_id,
        identity.role.as_str(),
        "notification.delivered",
        "notification",
        Some(id),
        json!({"channel": record.channel}),
    );
    Ok(ok(record))
}

async fn read_handler(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let identity = auth.require_auth()?;
    let record = state.notify.mark_read(&id)?;
    state.audit.success(
        &identity.user_id,
        identity.role.as_str(),
        "notification.read_receipt",
        "notification",
        Some(id),
        json!({"channel": record.channel}),
    );
    Ok(ok(record))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/send", post(send_handler))
        .route("/preferences", put(put_preferences_handler).get(get_preferences_handler))
        .route("/user/:user_id", get(for_user_handler))
        .route("/:id", get(get_handler))
        .route("/:id/delivered", post(delivered_handler))
        .route("/:id/read", post(read_handler))
}
