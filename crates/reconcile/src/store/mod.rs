//! Workflow store
//!
//! Narrow persistence façade used only by the reconciliation engine. Each
//! engine read/write corresponds to one operation here. The contract that
//! matters: `confirm_payment` and the insert operations are atomic at the
//! store level (conditional update / unique-constraint rejection), so the
//! engine's idempotency holds under concurrent invocation.

pub mod pg;

#[cfg(test)]
pub(crate) mod memory;

use std::collections::BTreeMap;

use time::Date;
use uuid::Uuid;

use payflow_shared::{
    Client, Company, Invoice, InvoiceStatus, Membership, Payment, Plan, Subscription,
};

use crate::error::StoreError;

pub use pg::PgWorkflowStore;

/// Invoice to insert. The store assigns the row id; the uniqueness of
/// `payment_id` and `number` is enforced by constraints, not by the caller.
#[derive(Debug, Clone)]
pub struct NewInvoice {
    pub company_id: Uuid,
    pub client_id: Uuid,
    pub payment_id: Uuid,
    pub number: String,
    pub amount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub status: InvoiceStatus,
    pub plan_id: Option<Uuid>,
}

/// Subscription to insert. At most one active row per (company, plan) is
/// enforced by a partial unique index.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub company_id: Uuid,
    pub client_id: Uuid,
    pub plan_id: Uuid,
    pub started_on: Date,
    pub next_payment_on: Date,
    pub monthly_amount_cents: i64,
    pub payment_mode: String,
}

/// Audit row recorded per terminal engine outcome.
#[derive(Debug, Clone)]
pub struct ReconcileRunRecord {
    pub payment_id: Uuid,
    pub step: &'static str,
    pub success: bool,
    pub invoice_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub membership_id: Option<Uuid>,
    pub message: Option<String>,
}

/// Persistence operations the engine depends on.
///
/// Production uses [`PgWorkflowStore`]; engine tests run against an
/// in-memory double with the same atomicity semantics.
#[allow(async_fn_in_trait)]
pub trait WorkflowStore {
    /// Load the payment and transition it to paid if it is not already.
    ///
    /// The transition is conditional ("update where status != paid") so
    /// only one concurrent caller performs it; everyone else observes the
    /// already-paid row. Returns `None` if the payment does not exist.
    /// Paid status is monotonic: this never reverts an existing paid row,
    /// and `paid_at` is stamped only on the first transition.
    async fn confirm_payment(
        &self,
        payment_id: Uuid,
        provider_ref: Option<&str>,
    ) -> Result<Option<Payment>, StoreError>;

    /// Backfill linkage recovered from the payload blob onto the payment
    /// row. Only fills columns that are currently NULL.
    async fn persist_payment_linkage(
        &self,
        payment_id: Uuid,
        company_id: Option<Uuid>,
        client_id: Option<Uuid>,
        plan_id: Option<Uuid>,
    ) -> Result<(), StoreError>;

    async fn load_company(&self, company_id: Uuid) -> Result<Option<Company>, StoreError>;

    async fn load_client(&self, client_id: Uuid) -> Result<Option<Client>, StoreError>;

    /// The company's oldest client, used when the payment carries no
    /// explicit client reference. Deterministic across retries.
    async fn first_client_of_company(
        &self,
        company_id: Uuid,
    ) -> Result<Option<Client>, StoreError>;

    async fn load_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, StoreError>;

    /// Plan of the company's most recent subscription, if any. Last-resort
    /// plan fallback before the engine gives up.
    async fn latest_subscription_plan(
        &self,
        company_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn find_invoice_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Option<Invoice>, StoreError>;

    /// Insert an invoice. A uniqueness rejection (payment already invoiced,
    /// or invoice number collision) surfaces as `StoreError::Conflict`.
    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, StoreError>;

    async fn find_active_subscription(
        &self,
        company_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Insert an active subscription. `StoreError::Conflict` means another
    /// active subscription for (company, plan) won the race.
    async fn insert_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> Result<Subscription, StoreError>;

    /// Create the membership for (client, company) or reactivate the
    /// existing one. Module grants are unioned in, never replaced: a
    /// module enabled manually stays enabled.
    async fn upsert_membership(
        &self,
        client_id: Uuid,
        company_id: Uuid,
        modules: &BTreeMap<String, bool>,
    ) -> Result<Membership, StoreError>;

    /// Project the membership's module grants into the per-module grant
    /// table. Convenience projection only; callers may swallow failures.
    async fn sync_module_grants(
        &self,
        membership_id: Uuid,
        modules: &[String],
    ) -> Result<(), StoreError>;

    /// Set company status to active and payment status to paid. No-op if
    /// already so.
    async fn activate_company(&self, company_id: Uuid) -> Result<(), StoreError>;

    async fn activate_client(&self, client_id: Uuid) -> Result<(), StoreError>;

    /// Record a terminal engine outcome for audit/replay tooling.
    async fn record_run(&self, run: &ReconcileRunRecord) -> Result<(), StoreError>;
}
