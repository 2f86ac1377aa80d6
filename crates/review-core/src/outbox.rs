use crate::ParseError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    FailedPermanent,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Sent => "sent",
            OutboxStatus::FailedPermanent => "failed_permanent",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "sent" => Ok(OutboxStatus::Sent),
            "failed_permanent" => Ok(OutboxStatus::FailedPermanent),
            other => Err(ParseError::OutboxStatus(other.to_owned())),
        }
    }
}

/// The unique identity of a delivery intent. The store enforces uniqueness
/// over this tuple, which is what makes reruns produce disjoint outbox rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutboxKey {
    pub changelist_id: i64,
    pub recipient: String,
    pub review_version: i64,
}

impl OutboxKey {
    pub fn new(changelist_id: i64, recipient: impl Into<String>, review_version: i64) -> Self {
        Self {
            changelist_id,
            recipient: recipient.into(),
            review_version,
        }
    }

    pub fn idempotency_token(&self) -> String {
        idempotency_token(self.changelist_id, &self.recipient, self.review_version)
    }
}

impl fmt::Display for OutboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/v{}",
            self.changelist_id, self.recipient, self.review_version
        )
    }
}

/// Deterministic provider idempotency token for an outbox key. Replaying the
/// same token at a compliant provider yields the same message id.
pub fn idempotency_token(changelist_id: i64, recipient: &str, review_version: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(changelist_id.to_be_bytes());
    hasher.update([0u8]);
    hasher.update(recipient.as_bytes());
    hasher.update([0u8]);
    hasher.update(review_version.to_be_bytes());
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// A durable per-recipient delivery intent.
///
/// Invariants: `notified_at` set implies `status = sent` and `notification_id`
/// set; `notification_id` is written before or together with `notified_at`,
/// never after it.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub key: OutboxKey,
    pub job_id: Uuid,
    pub status: OutboxStatus,

    /// Provider message id, once known.
    pub notification_id: Option<String>,
    pub notified_at: Option<DateTime<Utc>>,

    /// Sentinel: a send attempt started but its success write has not landed.
    pub send_started_at: Option<DateTime<Utc>>,

    /// When a `sent` row was last checked against provider-side truth.
    pub provider_verified_at: Option<DateTime<Utc>>,

    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// A row whose provider-side truth is unknown: either the message id is
    /// recorded without a delivery marker, or a send started and never
    /// resolved. Reconciliation consults the provider for these.
    pub fn is_ambiguous(&self) -> bool {
        self.notified_at.is_none()
            && (self.notification_id.is_some() || self.send_started_at.is_some())
    }
}

/// Materialization request: one row per recipient under the job's key space.
#[derive(Debug, Clone)]
pub struct NewOutboxBatch {
    pub job_id: Uuid,
    pub changelist_id: i64,
    pub review_version: i64,
    pub recipients: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_deterministic_and_key_sensitive() {
        let a = idempotency_token(42, "alice", 1);
        let b = idempotency_token(42, "alice", 1);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        assert_ne!(a, idempotency_token(42, "alice", 2));
        assert_ne!(a, idempotency_token(42, "bob", 1));
        assert_ne!(a, idempotency_token(43, "alice", 1));
    }

    #[test]
    fn ambiguity_covers_id_without_marker_and_dangling_sentinel() {
        let base = OutboxEntry {
            key: OutboxKey::new(42, "alice", 1),
            job_id: Uuid::new_v4(),
            status: OutboxStatus::Pending,
            notification_id: None,
            notified_at: None,
            send_started_at: None,
            provider_verified_at: None,
            attempt_count: 0,
            last_error: None,
            updated_at: Utc::now(),
        };
        assert!(!base.is_ambiguous());

        let mut with_id = base.clone();
        with_id.notification_id = Some("m-99".to_string());
        assert!(with_id.is_ambiguous());

        let mut with_sentinel = base.clone();
        with_sentinel.send_started_at = Some(Utc::now());
        assert!(with_sentinel.is_ambiguous());

        // A sent row leaves the unsent-ambiguity class; it is covered by the
        // provider-truth verification scan over sent rows instead.
        let mut delivered = with_id.clone();
        delivered.notified_at = Some(Utc::now());
        delivered.status = OutboxStatus::Sent;
        assert!(!delivered.is_ambiguous());
    }
}
