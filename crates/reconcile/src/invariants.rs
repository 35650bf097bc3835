//! Runnable consistency checks for reconciled workflow state.
//!
//! Each check is a plain SQL query against the workflow tables. They only
//! read, so they are safe to run after any webhook burst or replay, and each
//! violation carries enough context to find the offending rows.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::StoreError;

/// One violation found by a single check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which check flagged this
    pub invariant: String,
    /// Rows involved
    pub entity_ids: Vec<Uuid>,
    /// Human-readable description
    pub description: String,
    /// Extra fields for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or entitlements may be wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Should investigate, not urgent
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of a full check run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateInvoiceRow {
    payment_id: Uuid,
    invoice_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    company_id: Uuid,
    plan_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleMembershipsRow {
    client_id: Uuid,
    company_id: Uuid,
    membership_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceAmountsRow {
    invoice_id: Uuid,
    number: String,
    amount_cents: i64,
    tax_cents: i64,
    total_cents: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UninvoicedPaymentRow {
    payment_id: Uuid,
    company_id: Option<Uuid>,
    paid_at: Option<OffsetDateTime>,
}

/// Service for running workflow invariant checks.
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and return a summary.
    pub async fn run_all_checks(&self) -> Result<InvariantCheckSummary, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_one_invoice_per_payment().await?);
        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_single_membership().await?);
        violations.extend(self.check_invoice_amounts().await?);
        violations.extend(self.check_paid_payment_invoiced().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one invoice per payment.
    ///
    /// The unique constraint should make this impossible; a violation means
    /// the constraint was dropped or rows were written around it.
    async fn check_one_invoice_per_payment(&self) -> Result<Vec<InvariantViolation>, StoreError> {
        let rows: Vec<DuplicateInvoiceRow> = sqlx::query_as(
            r#"
            SELECT payment_id, COUNT(*) AS invoice_count
            FROM invoices
            GROUP BY payment_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "one_invoice_per_payment".to_string(),
                entity_ids: vec![row.payment_id],
                description: format!(
                    "Payment has {} invoices (expected at most 1)",
                    row.invoice_count
                ),
                context: serde_json::json!({
                    "invoice_count": row.invoice_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// At most one active subscription per (company, plan).
    async fn check_single_active_subscription(
        &self,
    ) -> Result<Vec<InvariantViolation>, StoreError> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT company_id, plan_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status = 'active'
            GROUP BY company_id, plan_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                entity_ids: vec![row.company_id, row.plan_id],
                description: format!(
                    "Company has {} active subscriptions for the same plan (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "company_id": row.company_id,
                    "plan_id": row.plan_id,
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// At most one membership per (client, company).
    async fn check_single_membership(&self) -> Result<Vec<InvariantViolation>, StoreError> {
        let rows: Vec<MultipleMembershipsRow> = sqlx::query_as(
            r#"
            SELECT client_id, company_id, COUNT(*) AS membership_count
            FROM memberships
            GROUP BY client_id, company_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_membership".to_string(),
                entity_ids: vec![row.client_id, row.company_id],
                description: format!(
                    "Client has {} memberships in the same company (expected 1)",
                    row.membership_count
                ),
                context: serde_json::json!({
                    "client_id": row.client_id,
                    "company_id": row.company_id,
                    "membership_count": row.membership_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invoice line amounts add up: |amount + tax - total| <= 1 cent.
    async fn check_invoice_amounts(&self) -> Result<Vec<InvariantViolation>, StoreError> {
        let rows: Vec<InvoiceAmountsRow> = sqlx::query_as(
            r#"
            SELECT id AS invoice_id, number, amount_cents, tax_cents, total_cents
            FROM invoices
            WHERE ABS(amount_cents + tax_cents - total_cents) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "invoice_amounts_consistent".to_string(),
                entity_ids: vec![row.invoice_id],
                description: format!(
                    "Invoice {} amounts do not add up: {} + {} != {}",
                    row.number, row.amount_cents, row.tax_cents, row.total_cents
                ),
                context: serde_json::json!({
                    "number": row.number,
                    "amount_cents": row.amount_cents,
                    "tax_cents": row.tax_cents,
                    "total_cents": row.total_cents,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Every settled payment gets an invoice eventually.
    ///
    /// Payments paid within the last 5 minutes are excluded so an in-flight
    /// reconciliation does not show up as a violation.
    async fn check_paid_payment_invoiced(&self) -> Result<Vec<InvariantViolation>, StoreError> {
        let rows: Vec<UninvoicedPaymentRow> = sqlx::query_as(
            r#"
            SELECT p.id AS payment_id, p.company_id, p.paid_at
            FROM payments p
            WHERE p.status = 'paid'
              AND p.paid_at < NOW() - INTERVAL '5 minutes'
              AND NOT EXISTS (
                  SELECT 1 FROM invoices i WHERE i.payment_id = p.id
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_payment_invoiced".to_string(),
                entity_ids: vec![row.payment_id],
                description: "Settled payment has no invoice".to_string(),
                context: serde_json::json!({
                    "company_id": row.company_id,
                    "paid_at": row.paid_at.map(|t| t.unix_timestamp()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single check by name. Unknown names report nothing.
    pub async fn run_check(&self, name: &str) -> Result<Vec<InvariantViolation>, StoreError> {
        match name {
            "one_invoice_per_payment" => self.check_one_invoice_per_payment().await,
            "single_active_subscription" => self.check_single_active_subscription().await,
            "single_membership" => self.check_single_membership().await,
            "invoice_amounts_consistent" => self.check_invoice_amounts().await,
            "paid_payment_invoiced" => self.check_paid_payment_invoiced().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "one_invoice_per_payment",
            "single_active_subscription",
            "single_membership",
            "invoice_amounts_consistent",
            "paid_payment_invoiced",
        ]
    }
}
