//! espace-core — domain types and configuration for the execution-space
//! provider.
//!
//! A *checkout* reserves a number of test-runner executors on behalf of one
//! test run. Each executor is described by an [`ExecutorSpec`]: the
//! instructions for launching its workload plus the callback contract the
//! test controller uses to start it. Both types are persisted as JSON in the
//! shared state store; the `executors` field of a checkout is never stored,
//! it is re-joined from the executor records on every read.

pub mod config;
pub mod types;

pub use config::{ConfigError, ProviderConfig, SseConfig};
pub use types::{Checkout, CheckoutStatus, ExecutorSpec, Instructions, Request, RequestData};
