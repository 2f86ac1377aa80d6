//! Review pipeline dispatcher.
//!
//! Hosts job dispatch with idempotency-key dedupe and versioned rerun gating,
//! the lease-based worker loop over the durable work queue, outbox delivery
//! with send-then-mark semantics, the failure pipeline (classification, retry
//! budgeting, dead-lettering, replay), and the background sweeper and
//! reconciler. The store is the only coordination medium; everything here
//! survives process restart.

pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod failure;
pub mod payloads;
pub mod service;
pub mod sweeper;
pub mod worker;

pub use config::DispatcherConfig;
pub use delivery::{DeliveryReport, OutboxDelivery};
pub use dispatch::{JobDispatch, RerunOutcome};
pub use failure::FailurePipeline;
pub use service::{Pipeline, ReviewService};
pub use worker::Worker;
