//! Stage payload shapes carried through the work queue.
//!
//! The queue treats payloads as opaque JSON; these are the shapes the worker
//! reads and writes as stages hand off.

use review_core::ChangeSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPayload {
    pub changelist_id: i64,
    pub review_version: i64,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmPayload {
    pub changelist_id: i64,
    pub review_version: i64,
    pub recipients: Vec<String>,
    pub change_set: ChangeSet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub changelist_id: i64,
    pub review_version: i64,
    pub recipients: Vec<String>,
    pub finding_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}
