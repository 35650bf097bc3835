#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Payflow shared types
//!
//! Configuration, database pool construction, and the domain model shared
//! by the reconciliation core and the binaries.

pub mod config;
pub mod db;
pub mod models;

pub use config::{Config, ConfigError};
pub use db::{create_pool, run_migrations};
pub use models::{
    Client, ClientStatus, Company, CompanyPaymentStatus, CompanyStatus, Invoice, InvoiceStatus,
    Membership, Payment, PaymentPayload, PaymentStatus, Plan, Subscription, SubscriptionStatus,
};
