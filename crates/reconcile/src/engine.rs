//! Reconciliation engine
//!
//! The state machine that turns a confirmed payment into its dependent
//! records: invoice, subscription, member workspace. Keyed by payment id,
//! safe to invoke any number of times (at-least-once webhook delivery,
//! manual operator replay) and concurrently across payment ids.
//!
//! A run walks `received -> payment_confirmed -> invoice_created ->
//! subscription_created -> membership_ready -> done`; on failure the
//! outcome carries the last completed step and a classification. The
//! engine never lets an error escape its boundary: every exit path is a
//! structured [`ReconcileOutcome`].

use std::collections::BTreeMap;

use serde::Serialize;
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use payflow_shared::{Client, Invoice, InvoiceStatus, Payment};

use crate::error::StoreError;
use crate::numbering::{generate_invoice_number, MAX_NUMBER_ATTEMPTS};
use crate::store::{NewInvoice, NewSubscription, ReconcileRunRecord, WorkflowStore};

/// Payment mode stamped on subscriptions created by reconciliation.
/// The triggering payment always arrives through provider checkout.
const PAYMENT_MODE: &str = "card";

/// Stages of a reconciliation run. On failure the outcome names the last
/// stage that completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStep {
    Received,
    PaymentConfirmed,
    InvoiceCreated,
    SubscriptionCreated,
    MembershipReady,
    Done,
}

impl ReconcileStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileStep::Received => "received",
            ReconcileStep::PaymentConfirmed => "payment_confirmed",
            ReconcileStep::InvoiceCreated => "invoice_created",
            ReconcileStep::SubscriptionCreated => "subscription_created",
            ReconcileStep::MembershipReady => "membership_ready",
            ReconcileStep::Done => "done",
        }
    }
}

impl std::fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classification, driving what the caller does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Requires manual data correction before a re-invocation can succeed
    /// (payment/company/client missing, plan unresolvable).
    UnrecoverableData,
    /// Safe to retry the whole invocation (store timeout, lost race the
    /// engine could not resolve, transient database failure).
    Transient,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::UnrecoverableData => "unrecoverable_data",
            FailureKind::Transient => "transient",
        }
    }
}

/// Structured outcome of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Completed {
        payment_id: Uuid,
        invoice_id: Uuid,
        subscription_id: Uuid,
        membership_id: Uuid,
    },
    Failed {
        payment_id: Uuid,
        /// Last step that completed before the failure.
        step: ReconcileStep,
        kind: FailureKind,
        message: String,
    },
}

impl ReconcileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ReconcileOutcome::Completed { .. })
    }
}

struct ReconciledIds {
    invoice_id: Uuid,
    subscription_id: Uuid,
    membership_id: Uuid,
}

struct StepFailure {
    step: ReconcileStep,
    kind: FailureKind,
    message: String,
}

fn fatal(step: ReconcileStep, message: impl Into<String>) -> StepFailure {
    StepFailure {
        step,
        kind: FailureKind::UnrecoverableData,
        message: message.into(),
    }
}

/// Map a store failure to a step failure. Decode errors need manual data
/// correction; everything else is retryable by re-invoking the engine.
fn store_failure(step: ReconcileStep) -> impl FnOnce(StoreError) -> StepFailure {
    move |e| {
        let kind = match e {
            StoreError::Decode(_) => FailureKind::UnrecoverableData,
            StoreError::Conflict(_) | StoreError::Timeout(_) | StoreError::Database(_) => {
                FailureKind::Transient
            }
        };
        StepFailure {
            step,
            kind,
            message: e.to_string(),
        }
    }
}

/// The reconciliation engine. Generic over the workflow store so the
/// state machine is exercised against an in-memory double in tests.
#[derive(Clone)]
pub struct ReconciliationEngine<S: WorkflowStore> {
    store: S,
}

impl<S: WorkflowStore> ReconciliationEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Entry point. Invoked by the webhook receiver and by manual replay
    /// tooling; both get the same idempotent behavior.
    ///
    /// Re-running after a full prior success is a no-op returning the same
    /// ids; re-running after a partial failure resumes where it left off.
    pub async fn reconcile(
        &self,
        payment_id: Uuid,
        provider_ref: Option<&str>,
    ) -> ReconcileOutcome {
        let outcome = match self.run(payment_id, provider_ref).await {
            Ok(ids) => {
                tracing::info!(
                    payment_id = %payment_id,
                    invoice_id = %ids.invoice_id,
                    subscription_id = %ids.subscription_id,
                    membership_id = %ids.membership_id,
                    "Reconciliation complete"
                );
                ReconcileOutcome::Completed {
                    payment_id,
                    invoice_id: ids.invoice_id,
                    subscription_id: ids.subscription_id,
                    membership_id: ids.membership_id,
                }
            }
            Err(failure) => {
                tracing::error!(
                    payment_id = %payment_id,
                    step = %failure.step,
                    kind = failure.kind.as_str(),
                    message = %failure.message,
                    "Reconciliation failed"
                );
                ReconcileOutcome::Failed {
                    payment_id,
                    step: failure.step,
                    kind: failure.kind,
                    message: failure.message,
                }
            }
        };

        self.record(&outcome).await;
        outcome
    }

    async fn run(
        &self,
        payment_id: Uuid,
        provider_ref: Option<&str>,
    ) -> Result<ReconciledIds, StepFailure> {
        // Step 1: load & confirm. The conditional update inside
        // confirm_payment makes the pending -> paid transition single-winner;
        // a concurrent loser continues with the already-paid row.
        let payment = self
            .store
            .confirm_payment(payment_id, provider_ref)
            .await
            .map_err(store_failure(ReconcileStep::Received))?
            .ok_or_else(|| fatal(ReconcileStep::Received, "payment not found"))?;

        let step = ReconcileStep::PaymentConfirmed;
        tracing::debug!(payment_id = %payment_id, "Payment confirmed as paid");

        // Step 2: resolve linkage, normalized columns first, payload blob
        // as fallback.
        let decoded = payment.decoded_payload();

        let company_id = payment.company_id.or(decoded.company_id).ok_or_else(|| {
            fatal(
                step,
                "company reference unresolvable from payment or payload",
            )
        })?;

        let mut plan_id = payment.plan_id.or(decoded.plan_id);
        if plan_id.is_none() {
            // Last resort: the company's most recent subscription.
            plan_id = self
                .store
                .latest_subscription_plan(company_id)
                .await
                .map_err(store_failure(step))?;
        }
        let plan_id = plan_id.ok_or_else(|| {
            fatal(
                step,
                "plan reference unresolvable from payment, payload, or prior subscriptions",
            )
        })?;

        let company = self
            .store
            .load_company(company_id)
            .await
            .map_err(store_failure(step))?
            .ok_or_else(|| fatal(step, format!("company {company_id} not found")))?;

        let plan = self
            .store
            .load_plan(plan_id)
            .await
            .map_err(store_failure(step))?
            .ok_or_else(|| fatal(step, format!("plan {plan_id} not in catalog")))?;

        // Step 3: resolve client. Explicit reference wins; otherwise the
        // company's oldest client. A company with no clients is an
        // upstream invariant violation, not something to patch here.
        let client = self
            .resolve_client(&payment, &decoded.client_id, company_id, step)
            .await?;

        // Backfill recovered linkage so future reads skip the fallback
        // path entirely.
        if payment.company_id.is_none()
            || payment.client_id.is_none()
            || payment.plan_id.is_none()
        {
            self.store
                .persist_payment_linkage(
                    payment_id,
                    Some(company_id),
                    Some(client.id),
                    Some(plan_id),
                )
                .await
                .map_err(store_failure(step))?;
            tracing::debug!(
                payment_id = %payment_id,
                company_id = %company_id,
                "Normalized payload-recovered linkage onto payment"
            );
        }

        // Step 4: invoice, exactly once per payment.
        let invoice = match self
            .store
            .find_invoice_for_payment(payment_id)
            .await
            .map_err(store_failure(step))?
        {
            Some(existing) => {
                tracing::debug!(
                    payment_id = %payment_id,
                    invoice_id = %existing.id,
                    "Invoice already exists for payment, reusing"
                );
                existing
            }
            None => self.create_invoice(&payment, company_id, client.id, plan_id).await?,
        };

        // Step 5: subscription, at most one active per (company, plan).
        let step = ReconcileStep::InvoiceCreated;
        let subscription = match self
            .store
            .find_active_subscription(company_id, plan_id)
            .await
            .map_err(store_failure(step))?
        {
            Some(existing) => existing,
            None => {
                let today = OffsetDateTime::now_utc().date();
                let new_subscription = NewSubscription {
                    company_id,
                    client_id: client.id,
                    plan_id,
                    started_on: today,
                    next_payment_on: next_monthly_date(today),
                    monthly_amount_cents: payment.amount_cents,
                    payment_mode: PAYMENT_MODE.to_string(),
                };
                match self.store.insert_subscription(&new_subscription).await {
                    Ok(subscription) => subscription,
                    Err(StoreError::Conflict(_)) => {
                        // A concurrent run created the active subscription
                        // between our check and insert. Reload and reuse.
                        self.store
                            .find_active_subscription(company_id, plan_id)
                            .await
                            .map_err(store_failure(step))?
                            .ok_or_else(|| StepFailure {
                                step,
                                kind: FailureKind::Transient,
                                message: "subscription insert conflicted but no active row found"
                                    .to_string(),
                            })?
                    }
                    Err(e) => return Err(store_failure(step)(e)),
                }
            }
        };

        // Step 6: member workspace, created-or-updated, never duplicated.
        // The module set is unioned with the plan's modules; manual grants
        // survive.
        let step = ReconcileStep::SubscriptionCreated;
        let plan_modules: BTreeMap<String, bool> = plan
            .modules
            .iter()
            .map(|code| (code.clone(), true))
            .collect();
        let membership = self
            .store
            .upsert_membership(client.id, company_id, &plan_modules)
            .await
            .map_err(store_failure(step))?;

        // Step 7: module-grant projection. Convenience output only; a
        // failure here must not roll back steps 4-6.
        if let Err(e) = self
            .store
            .sync_module_grants(membership.id, &plan.modules)
            .await
        {
            tracing::warn!(
                membership_id = %membership.id,
                error = %e,
                "Module grant sync failed, continuing"
            );
        }

        // Step 8: finalize entity statuses.
        let step = ReconcileStep::MembershipReady;
        self.store
            .activate_company(company_id)
            .await
            .map_err(store_failure(step))?;
        self.store
            .activate_client(client.id)
            .await
            .map_err(store_failure(step))?;

        tracing::debug!(
            payment_id = %payment_id,
            company = %company.name,
            "Company and client activated"
        );

        Ok(ReconciledIds {
            invoice_id: invoice.id,
            subscription_id: subscription.id,
            membership_id: membership.id,
        })
    }

    async fn resolve_client(
        &self,
        payment: &Payment,
        payload_client_id: &Option<Uuid>,
        company_id: Uuid,
        step: ReconcileStep,
    ) -> Result<Client, StepFailure> {
        let client = match payment.client_id.or(*payload_client_id) {
            Some(client_id) => self
                .store
                .load_client(client_id)
                .await
                .map_err(store_failure(step))?
                .ok_or_else(|| fatal(step, format!("client {client_id} not found")))?,
            None => self
                .store
                .first_client_of_company(company_id)
                .await
                .map_err(store_failure(step))?
                .ok_or_else(|| {
                    fatal(step, "company has no clients, cannot reconcile payment")
                })?,
        };

        if client.company_id != company_id {
            return Err(fatal(
                step,
                format!(
                    "client {} belongs to company {}, not {}",
                    client.id, client.company_id, company_id
                ),
            ));
        }

        Ok(client)
    }

    /// Insert the invoice with a freshly generated number, retrying on
    /// collision. A conflict that turns out to be "payment already
    /// invoiced" resolves to the winner's row.
    async fn create_invoice(
        &self,
        payment: &Payment,
        company_id: Uuid,
        client_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Invoice, StepFailure> {
        let step = ReconcileStep::PaymentConfirmed;
        let today = OffsetDateTime::now_utc().date();

        for attempt in 1..=MAX_NUMBER_ATTEMPTS {
            let new_invoice = NewInvoice {
                company_id,
                client_id,
                payment_id: payment.id,
                number: generate_invoice_number(today),
                amount_cents: payment.amount_cents,
                tax_cents: payment.tax_cents,
                total_cents: payment.total_cents,
                status: InvoiceStatus::Paid,
                plan_id: Some(plan_id),
            };

            match self.store.insert_invoice(&new_invoice).await {
                Ok(invoice) => return Ok(invoice),
                Err(StoreError::Conflict(reason)) => {
                    if let Some(existing) = self
                        .store
                        .find_invoice_for_payment(payment.id)
                        .await
                        .map_err(store_failure(step))?
                    {
                        tracing::info!(
                            payment_id = %payment.id,
                            invoice_id = %existing.id,
                            "Lost invoice insert race, reusing winner's row"
                        );
                        return Ok(existing);
                    }
                    tracing::warn!(
                        payment_id = %payment.id,
                        attempt,
                        reason = %reason,
                        "Invoice number collision, regenerating"
                    );
                }
                Err(e) => return Err(store_failure(step)(e)),
            }
        }

        Err(StepFailure {
            step,
            kind: FailureKind::Transient,
            message: format!(
                "could not allocate a unique invoice number in {MAX_NUMBER_ATTEMPTS} attempts"
            ),
        })
    }

    /// Persist the terminal outcome for audit and replay tooling. Failure
    /// to write the audit row never changes the outcome.
    async fn record(&self, outcome: &ReconcileOutcome) {
        let run = match outcome {
            ReconcileOutcome::Completed {
                payment_id,
                invoice_id,
                subscription_id,
                membership_id,
            } => ReconcileRunRecord {
                payment_id: *payment_id,
                step: ReconcileStep::Done.as_str(),
                success: true,
                invoice_id: Some(*invoice_id),
                subscription_id: Some(*subscription_id),
                membership_id: Some(*membership_id),
                message: None,
            },
            ReconcileOutcome::Failed {
                payment_id,
                step,
                kind,
                message,
            } => ReconcileRunRecord {
                payment_id: *payment_id,
                step: step.as_str(),
                success: false,
                invoice_id: None,
                subscription_id: None,
                membership_id: None,
                message: Some(format!("{}: {}", kind.as_str(), message)),
            },
        };

        if let Err(e) = self.store.record_run(&run).await {
            tracing::warn!(
                payment_id = %run.payment_id,
                error = %e,
                "Failed to record reconciliation run"
            );
        }
    }
}

/// The same day one month later, clamped to the target month's length
/// (Jan 31 -> Feb 28/29).
fn next_monthly_date(date: Date) -> Date {
    let (year, month) = match date.month() {
        Month::December => (date.year() + 1, Month::January),
        m => (date.year(), m.next()),
    };
    let day = date.day().min(time::util::days_in_year_month(year, month));
    Date::from_calendar_date(year, month, day).unwrap_or(date)
}
