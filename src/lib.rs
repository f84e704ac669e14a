//! Story Admission
//!
//! Admission control for a backend that fronts a downstream LLM provider.
//! Every inbound request is checked against three fixed-window limits, in
//! order: whole-server, per-client and per-operation-class. Counters live in
//! process memory and reset on aligned 60 second boundaries.

pub mod classifier;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod response;
pub mod store;
pub mod utils;

// Re-export main types
pub use classifier::{classify, OperationClass};
pub use config::{AdmissionSettings, LimitPolicy};
pub use error::{AdmissionError, Result};
pub use limiter::{AdmissionController, AdmissionDecision, ClassifiedRequest, LimitType};
pub use middleware::AdmissionLayer;
pub use store::{CounterStore, InMemoryCounterStore, Tier};
