// Tamper-evident access log. Entries form a monotonic append-only sequence
// hash-chained with SHA-256; metadata is scrubbed before it is stored, so
// the sink can never leak a raw fix or a secret even under `read:audit`.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::crypto::sha256_hex;
use crate::metrics::Metrics;
use crate::redact::redact_value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Denied,
    Failure,
}

#[derive(Clone, Debug, Serialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub actor_id: String,
    pub actor_role: String,
    pub action: String,
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub metadata: Value,
    pub result: AuditResult,
    pub at: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

struct Chain {
    next_seq: u64,
    head: String,
    entries: Vec<AuditEntry>,
}

pub struct AuditSink {
    chain: Mutex<Chain>,
    metrics: Arc<Metrics>,
}

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

impl AuditSink {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            chain: Mutex::new(Chain {
                next_seq: 0,
                head: GENESIS_HASH.to_string(),
                entries: Vec::new(),
            }),
            metrics,
        }
    }

    pub fn record(
        &self,
        actor_id: &str,
        actor_role: &str,
        action: &str,
        resource_type: &str,
        resource_id: Option<String>,
        metadata: Value,
        result: AuditResult,
    ) {
        let metadata = redact_value(&metadata);
        let at = Utc::now();

        let mut chain = self.chain.lock().expect("audit chain lock");
        let seq = chain.next_seq;
        let prev_hash = chain.head.clone();
        let digest_input = format!(
            "{prev_hash}|{seq}|{actor_id}|{actor_role}|{action}|{resource_type}|{rid}|{result:?}|{at}|{metadata}",
            rid = resource_id.as_deref().unwrap_or("-"),
        );
        let hash = sha256_hex(digest_input.as_bytes());

        let entry = AuditEntry {
            seq,
            actor_id: actor_id.to_string(),
            actor_role: actor_role.to_string(),
            action: action.to_string(),
            resource_type: resource_type.to_string(),
            resource_id,
            metadata,
            result,
            at,
            prev_hash,
            hash: hash.clone(),
        };
        chain.next_seq += 1;
        chain.head = hash;
        chain.entries.push(entry);
        drop(chain);

        Metrics::bump(&self.metrics.audit_entries);
        info!(
            actor = actor_id,
            action = action,
            resource = resource_type,
            result = ?result,
            "audit_entry"
        );
    }

    pub fn success(
        &self,
        actor_id: &str,
        actor_role: &str,
        action: &str,
        resource_type: &str,
        resource_id: Option<String>,
        metadata: Value,
    ) {
        self.record(
            actor_id,
            actor_role,
            action,
            resource_type,
            resource_id,
            metadata,
            AuditResult::Success,
        );
    }

    pub fn denied(&self, actor_id: &str, actor_role: &str, action: &str, resource_type: &str) {
        Metrics::bump(&self.metrics.access_denied);
        self.record(
            actor_id,
            actor_role,
            action,
            resource_type,
            None,
            Value::Null,
            AuditResult::Denied,
        );
    }

    pub fn failure(
        &self,
        actor_id: &str,
        actor_role: &str,
        action: &str,
        resource_type: &str,
        resource_id: Option<String>,
        metadata: Value,
    ) {
        self.record(
            actor_id,
            actor_role,
            action,
            resource_type,
            resource_id,
            metadata,
            AuditResult::Failure,
        );
    }

    pub fn len(&self) -> usize {
        self.chain.lock().expect("audit chain lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> Vec<AuditEntry> {
        let chain = self.chain.lock().expect("audit chain lock");
        let skip = chain.entries.len().saturating_sub(n);
        chain.entries[skip..].to_vec()
    }

    /// Checks that every retained entry links to its predecessor.
    pub fn verify_chain(&self) -> bool {
        let chain = self.chain.lock().expect("audit chain lock");
        let mut prev: Option<&str> = None;
        for entry in &chain.entries {
            if let Some(expected) = prev {
                if entry.prev_hash != expected {
                    return false;
                }
            }
            prev = Some(&entry.hash);
        }
        true
    }

    /// Drops entries older than the retention cutoff. The head hash is kept,
    /// so the chain stays verifiable over the retained suffix.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut chain = self.chain.lock().expect("audit chain lock");
        let before = chain.entries.len();
        chain.entries.retain(|e| e.at >= cutoff);
        before - chain.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sink() -> AuditSink {
        AuditSink::new(Arc::new(Metrics::new()))
    }

    #[test]
    fn test_entries_are_sequenced_and_chained() {
        let s = sink();
        s.success("u1", "driver", "delivery.update", "delivery", Some("d1".into()), json!({}));
        s.success("u2", "dispatcher", "alert.ack", "security_alert", Some("a1".into()), json!({}));
        s.denied("u3", "customer", "audit.read", "audit_log");

        let entries = s.recent(10);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].seq, 0);
        assert_eq!(entries[2].seq, 2);
        assert_eq!(entries[0].prev_hash, GENESIS_HASH);
        assert_eq!(entries[1].prev_hash, entries[0].hash);
        assert!(s.verify_chain());
    }

    #[test]
    fn test_metadata_is_redacted_before_storage() {
        let s = sink();
        s.success(
            "u1",
            "driver",
            "emergency.trigger",
            "emergency",
            Some("e1".into()),
            json!({"latitude": -1.3, "longitude": 36.8, "emergency_id": "e1"}),
        );
        let entry = &s.recent(1)[0];
        assert_eq!(entry.metadata["latitude"], "[REDACTED]");
        assert_eq!(entry.metadata["longitude"], "[REDACTED]");
        assert_eq!(entry.metadata["emergency_id"], "e1");
    }

    #[test]
    fn test_denied_counts_into_metrics() {
        let metrics = Arc::new(Metrics::new());
        let s = AuditSink::new(metrics.clone());
        s.denied("anon", "anonymous", "alerts.read", "security_alert");
        assert_eq!(metrics.snapshot().access_denied, 1);
        assert_eq!(metrics.snapshot().audit_entries, 1);
    }

    #[test]
    fn test_eviction_keeps_chain_verifiable() {
        let s = sink();
        for i in 0..5 {
            s.success("u", "system", "tick", "system", Some(format!("r{i}")), json!({}));
        }
        // Nothing is old enough to evict yet.
        assert_eq!(s.evict_older_than(Utc::now() - chrono::Duration::hours(1)), 0);
        assert_eq!(s.len(), 5);
        assert!(s.verify_chain());
    }
}
