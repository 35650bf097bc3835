//! Engine scenarios against the in-memory store: idempotent re-delivery,
//! payload fallback linkage, partial resume, and concurrent duplicates.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::Barrier;
use uuid::Uuid;

use payflow_shared::{
    ClientStatus, CompanyPaymentStatus, CompanyStatus, InvoiceStatus, Payment, PaymentStatus,
    SubscriptionStatus,
};

use crate::engine::{FailureKind, ReconcileOutcome, ReconcileStep, ReconciliationEngine};
use crate::numbering::MAX_NUMBER_ATTEMPTS;
use crate::store::memory::MemoryStore;
use crate::store::{NewInvoice, WorkflowStore};

struct Fixture {
    store: MemoryStore,
    engine: ReconciliationEngine<MemoryStore>,
    company_id: Uuid,
    client_id: Uuid,
    plan_id: Uuid,
}

fn fixture() -> Fixture {
    let store = MemoryStore::new();
    let company_id = store.seed_company("Acme GmbH");
    let client_id = store.seed_client(company_id, "Ada");
    let plan_id = store.seed_plan("core", 9900, &["crm", "billing"]);
    let engine = ReconciliationEngine::new(store.clone());
    Fixture {
        store,
        engine,
        company_id,
        client_id,
        plan_id,
    }
}

fn pending_payment(
    company_id: Option<Uuid>,
    client_id: Option<Uuid>,
    plan_id: Option<Uuid>,
    payload: serde_json::Value,
) -> Payment {
    Payment {
        id: Uuid::new_v4(),
        company_id,
        client_id,
        plan_id,
        amount_cents: 9900,
        tax_cents: 1881,
        total_cents: 11781,
        status: PaymentStatus::Pending,
        provider_ref: None,
        payload,
        paid_at: None,
    }
}

fn completed_ids(outcome: &ReconcileOutcome) -> (Uuid, Uuid, Uuid) {
    match outcome {
        ReconcileOutcome::Completed {
            invoice_id,
            subscription_id,
            membership_id,
            ..
        } => (*invoice_id, *subscription_id, *membership_id),
        ReconcileOutcome::Failed { step, message, .. } => {
            panic!("expected completion, failed at {step}: {message}")
        }
    }
}

#[tokio::test]
async fn happy_path_creates_all_downstream_records() {
    let f = fixture();
    let payment = pending_payment(
        Some(f.company_id),
        Some(f.client_id),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    let outcome = f.engine.reconcile(payment_id, Some("pi_test_123")).await;
    let (_, _, membership_id) = completed_ids(&outcome);

    let payment = f.store.payment(payment_id).unwrap();
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert!(payment.paid_at.is_some());
    assert_eq!(payment.provider_ref.as_deref(), Some("pi_test_123"));

    assert_eq!(f.store.invoice_count(), 1);
    assert_eq!(f.store.subscription_count(), 1);
    assert_eq!(f.store.membership_count(), 1);
    assert_eq!(f.store.module_grant_count(), 2);

    let company = f.store.company(f.company_id).unwrap();
    assert_eq!(company.status, CompanyStatus::Active);
    assert_eq!(company.payment_status, CompanyPaymentStatus::Paid);
    assert_eq!(
        f.store.client(f.client_id).unwrap().status,
        ClientStatus::Active
    );

    let membership = f.store.membership(f.client_id, f.company_id).unwrap();
    assert_eq!(membership.id, membership_id);
    assert!(membership.active);
    assert_eq!(membership.modules.get("crm"), Some(&true));
    assert_eq!(membership.modules.get("billing"), Some(&true));
}

#[tokio::test]
async fn redelivery_returns_same_ids_without_duplicates() {
    let f = fixture();
    let payment = pending_payment(
        Some(f.company_id),
        Some(f.client_id),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    let first = f.engine.reconcile(payment_id, None).await;
    let second = f.engine.reconcile(payment_id, None).await;
    let third = f.engine.reconcile(payment_id, None).await;

    assert_eq!(completed_ids(&first), completed_ids(&second));
    assert_eq!(completed_ids(&second), completed_ids(&third));
    assert_eq!(f.store.invoice_count(), 1);
    assert_eq!(f.store.subscription_count(), 1);
    assert_eq!(f.store.membership_count(), 1);
}

#[tokio::test]
async fn redelivery_keeps_original_paid_at() {
    let f = fixture();
    let payment = pending_payment(
        Some(f.company_id),
        Some(f.client_id),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    f.engine.reconcile(payment_id, None).await;
    let first_paid_at = f.store.payment(payment_id).unwrap().paid_at;
    f.engine.reconcile(payment_id, None).await;

    assert_eq!(f.store.payment(payment_id).unwrap().paid_at, first_paid_at);
}

#[tokio::test]
async fn payload_fallback_resolves_and_backfills_linkage() {
    let f = fixture();
    let payment = pending_payment(
        None,
        None,
        None,
        json!({
            "company_id": f.company_id,
            "client_id": f.client_id,
            "plan_id": f.plan_id,
            "promo": "SPRING24",
        }),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    let outcome = f.engine.reconcile(payment_id, None).await;
    assert!(outcome.is_success());

    // Recovered references are written back to the normalized columns.
    let payment = f.store.payment(payment_id).unwrap();
    assert_eq!(payment.company_id, Some(f.company_id));
    assert_eq!(payment.client_id, Some(f.client_id));
    assert_eq!(payment.plan_id, Some(f.plan_id));
}

#[tokio::test]
async fn missing_client_reference_falls_back_to_oldest_client() {
    let f = fixture();
    let newer_client = f.store.seed_client(f.company_id, "Grace");
    let payment = pending_payment(Some(f.company_id), None, Some(f.plan_id), json!({}));
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    let outcome = f.engine.reconcile(payment_id, None).await;
    assert!(outcome.is_success());

    assert_eq!(
        f.store.client(f.client_id).unwrap().status,
        ClientStatus::Active
    );
    assert_eq!(
        f.store.client(newer_client).unwrap().status,
        ClientStatus::Inactive
    );
}

#[tokio::test]
async fn plan_falls_back_to_latest_subscription() {
    let f = fixture();
    f.store.seed_subscription(
        f.company_id,
        f.client_id,
        f.plan_id,
        SubscriptionStatus::Canceled,
    );
    let payment = pending_payment(Some(f.company_id), Some(f.client_id), None, json!({}));
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    let outcome = f.engine.reconcile(payment_id, None).await;
    assert!(outcome.is_success());

    // The canceled row only donated its plan; a fresh active one is created.
    assert_eq!(f.store.subscription_count(), 2);
    assert_eq!(
        f.store.payment(payment_id).unwrap().plan_id,
        Some(f.plan_id)
    );
}

#[tokio::test]
async fn unresolvable_company_is_unrecoverable() {
    let f = fixture();
    let payment = pending_payment(None, None, None, json!({"note": "no linkage at all"}));
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    let outcome = f.engine.reconcile(payment_id, None).await;
    match outcome {
        ReconcileOutcome::Failed { step, kind, .. } => {
            assert_eq!(step, ReconcileStep::PaymentConfirmed);
            assert_eq!(kind, FailureKind::UnrecoverableData);
        }
        ReconcileOutcome::Completed { .. } => panic!("expected failure"),
    }

    assert_eq!(f.store.invoice_count(), 0);
    assert_eq!(f.store.subscription_count(), 0);
    assert_eq!(f.store.membership_count(), 0);
}

#[tokio::test]
async fn company_without_clients_is_unrecoverable() {
    let store = MemoryStore::new();
    let company_id = store.seed_company("Empty Co");
    let plan_id = store.seed_plan("core", 9900, &["crm"]);
    let engine = ReconciliationEngine::new(store.clone());

    let payment = pending_payment(Some(company_id), None, Some(plan_id), json!({}));
    let payment_id = payment.id;
    store.seed_payment(payment);

    let outcome = engine.reconcile(payment_id, None).await;
    match outcome {
        ReconcileOutcome::Failed { kind, message, .. } => {
            assert_eq!(kind, FailureKind::UnrecoverableData);
            assert!(message.contains("no clients"));
        }
        ReconcileOutcome::Completed { .. } => panic!("expected failure"),
    }
}

#[tokio::test]
async fn client_of_other_company_is_rejected() {
    let f = fixture();
    let other_company = f.store.seed_company("Other GmbH");
    let foreign_client = f.store.seed_client(other_company, "Mallory");

    let payment = pending_payment(
        Some(f.company_id),
        Some(foreign_client),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    let outcome = f.engine.reconcile(payment_id, None).await;
    match outcome {
        ReconcileOutcome::Failed { kind, message, .. } => {
            assert_eq!(kind, FailureKind::UnrecoverableData);
            assert!(message.contains("belongs to company"));
        }
        ReconcileOutcome::Completed { .. } => panic!("expected failure"),
    }
    assert_eq!(f.store.invoice_count(), 0);
}

#[tokio::test]
async fn unknown_payment_fails_at_received() {
    let f = fixture();

    let outcome = f.engine.reconcile(Uuid::new_v4(), None).await;
    match outcome {
        ReconcileOutcome::Failed { step, kind, .. } => {
            assert_eq!(step, ReconcileStep::Received);
            assert_eq!(kind, FailureKind::UnrecoverableData);
        }
        ReconcileOutcome::Completed { .. } => panic!("expected failure"),
    }

    let runs = f.store.runs();
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].success);
}

#[tokio::test]
async fn resumes_past_preexisting_invoice() {
    let f = fixture();
    let payment = pending_payment(
        Some(f.company_id),
        Some(f.client_id),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    // A previous run got as far as the invoice and then died.
    let existing = f
        .store
        .insert_invoice(&NewInvoice {
            company_id: f.company_id,
            client_id: f.client_id,
            payment_id,
            number: "R-202608-000042".to_string(),
            amount_cents: 9900,
            tax_cents: 1881,
            total_cents: 11781,
            status: InvoiceStatus::Paid,
            plan_id: Some(f.plan_id),
        })
        .await
        .unwrap();

    let outcome = f.engine.reconcile(payment_id, None).await;
    let (invoice_id, _, _) = completed_ids(&outcome);

    assert_eq!(invoice_id, existing.id);
    assert_eq!(f.store.invoice_count(), 1);
    assert_eq!(f.store.subscription_count(), 1);
}

#[tokio::test]
async fn manual_module_grants_survive_reconciliation() {
    let f = fixture();
    f.store.seed_membership(f.client_id, f.company_id, &["beta"]);
    let payment = pending_payment(
        Some(f.company_id),
        Some(f.client_id),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    let outcome = f.engine.reconcile(payment_id, None).await;
    assert!(outcome.is_success());

    assert_eq!(f.store.membership_count(), 1);
    let membership = f.store.membership(f.client_id, f.company_id).unwrap();
    assert!(membership.active);
    assert_eq!(membership.modules.get("beta"), Some(&true));
    assert_eq!(membership.modules.get("crm"), Some(&true));
    assert_eq!(membership.modules.get("billing"), Some(&true));
}

#[tokio::test]
async fn invoice_number_collisions_are_retried() {
    let f = fixture();
    let payment = pending_payment(
        Some(f.company_id),
        Some(f.client_id),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);
    f.store.fail_next_invoice_inserts(2);

    let outcome = f.engine.reconcile(payment_id, None).await;
    assert!(outcome.is_success());
    assert_eq!(f.store.invoice_count(), 1);
}

#[tokio::test]
async fn exhausted_number_attempts_fail_transiently() {
    let f = fixture();
    let payment = pending_payment(
        Some(f.company_id),
        Some(f.client_id),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);
    f.store.fail_next_invoice_inserts(MAX_NUMBER_ATTEMPTS as usize);

    let outcome = f.engine.reconcile(payment_id, None).await;
    match outcome {
        ReconcileOutcome::Failed { kind, .. } => assert_eq!(kind, FailureKind::Transient),
        ReconcileOutcome::Completed { .. } => panic!("expected failure"),
    }
    assert_eq!(f.store.invoice_count(), 0);
}

#[tokio::test]
async fn module_sync_failure_does_not_fail_the_run() {
    let f = fixture();
    let payment = pending_payment(
        Some(f.company_id),
        Some(f.client_id),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);
    f.store.fail_module_sync(true);

    let outcome = f.engine.reconcile(payment_id, None).await;
    assert!(outcome.is_success());
    assert_eq!(f.store.module_grant_count(), 0);
    assert_eq!(f.store.membership_count(), 1);
}

#[tokio::test]
async fn audit_run_recorded_per_invocation() {
    let f = fixture();
    let payment = pending_payment(
        Some(f.company_id),
        Some(f.client_id),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    f.engine.reconcile(payment_id, None).await;
    f.engine.reconcile(payment_id, None).await;

    let runs = f.store.runs();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.success && r.step == "done"));
    assert!(runs.iter().all(|r| r.invoice_id.is_some()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_deliveries_converge() {
    let f = fixture();
    let payment = pending_payment(
        Some(f.company_id),
        Some(f.client_id),
        Some(f.plan_id),
        json!({}),
    );
    let payment_id = payment.id;
    f.store.seed_payment(payment);

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let engine = f.engine.clone();
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.reconcile(payment_id, None).await
        }));
    }

    let mut ids = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        ids.push(completed_ids(&outcome));
    }

    assert_eq!(ids[0], ids[1]);
    assert_eq!(f.store.invoice_count(), 1);
    assert_eq!(f.store.subscription_count(), 1);
    assert_eq!(f.store.membership_count(), 1);
}
