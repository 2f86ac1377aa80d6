//! Test doubles for the review pipeline: an in-memory store implementing the
//! full persistence contract, and scriptable fakes for the external
//! collaborators.
//!
//! `MemoryStore` serializes every operation behind a single async mutex, which
//! provides the same mutual-exclusion guarantees the Postgres store gets from
//! row locks and conditional updates: each trait call is one atomic critical
//! section against the whole state.

mod fakes;
mod store;

pub use fakes::{FakeFetcher, FakeModelClient, RecordingProvider};
pub use store::{AuditRecord, MemoryStore};
