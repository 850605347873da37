//! espace-provider — the execution-space provider itself.
//!
//! [`Provider`] owns the checkout lifecycle: a checkout is written PENDING,
//! its executor specs are fanned out and persisted one by one, and the
//! record ends DONE or FAILED — every transition is persisted so the status
//! endpoint is a pure read. The same object runs the synchronous executor
//! start flow: create the workload, wait for readiness, persist the
//! orchestrator handle, then hold at the started-sub-suite barrier until the
//! event repository confirms the runner entered its execution phase.
//!
//! Everything long-running is counted on one task tracker so shutdown can
//! wait for outstanding checkouts, check-ins and cleanups to finish.

mod provider;
mod supervisor;

pub use provider::{CheckoutRequest, Provider, ProviderError, ProviderResult};
pub use supervisor::StartError;
