// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Payflow reconciliation core
//!
//! Post-payment reconciliation for the billing platform: given a confirmed
//! payment, deterministically materialize the dependent records (invoice,
//! subscription, member workspace) exactly once.
//!
//! ## Components
//!
//! - **Event Receiver** ([`webhook`]): signature verification, typed event
//!   decode, dispatch to the engine
//! - **Reconciliation Engine** ([`engine`]): the idempotent state machine
//! - **Workflow Store** ([`store`]): narrow persistence façade, Postgres
//!   backed in production
//! - **Invariants** ([`invariants`]): runnable read-only consistency checks

pub mod engine;
#[cfg(test)]
mod engine_tests;
pub mod error;
pub mod invariants;
pub mod numbering;
pub mod store;
pub mod webhook;

// Engine
pub use engine::{FailureKind, ReconcileOutcome, ReconcileStep, ReconciliationEngine};

// Error
pub use error::{StoreError, WebhookError};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Store
pub use store::{
    NewInvoice, NewSubscription, PgWorkflowStore, ReconcileRunRecord, WorkflowStore,
};

// Webhook
pub use webhook::{
    CheckoutSession, PaymentConfirmation, WebhookDisposition, WebhookEvent, WebhookReceiver,
};
