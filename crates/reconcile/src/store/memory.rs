//! In-memory workflow store used by engine tests.
//!
//! Mirrors the atomicity semantics of the Postgres store: each operation
//! holds the state lock for its whole duration, the paid transition is
//! conditional, and the insert operations reject duplicates with
//! `StoreError::Conflict` the way unique constraints do.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use uuid::Uuid;

use payflow_shared::{
    Client, ClientStatus, Company, CompanyPaymentStatus, CompanyStatus, Invoice, Membership,
    Payment, PaymentStatus, Plan, Subscription, SubscriptionStatus,
};

use crate::error::StoreError;
use crate::store::{NewInvoice, NewSubscription, ReconcileRunRecord, WorkflowStore};

#[derive(Default)]
struct MemoryState {
    payments: HashMap<Uuid, Payment>,
    companies: HashMap<Uuid, Company>,
    // Insertion order doubles as created_at order.
    clients: Vec<Client>,
    plans: HashMap<Uuid, Plan>,
    invoices: Vec<Invoice>,
    subscriptions: Vec<Subscription>,
    memberships: Vec<Membership>,
    module_grants: HashSet<(Uuid, String)>,
    runs: Vec<ReconcileRunRecord>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<MemoryState>,
    fail_invoice_inserts: AtomicUsize,
    fail_module_sync: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.inner.state.lock().unwrap()
    }

    // ---- seeding -----------------------------------------------------

    pub fn seed_company(&self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state().companies.insert(
            id,
            Company {
                id,
                name: name.to_string(),
                status: CompanyStatus::InCreation,
                payment_status: CompanyPaymentStatus::Unpaid,
            },
        );
        id
    }

    pub fn seed_client(&self, company_id: Uuid, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.state().clients.push(Client {
            id,
            company_id,
            name: name.to_string(),
            email: None,
            status: ClientStatus::Inactive,
        });
        id
    }

    pub fn seed_plan(&self, code: &str, monthly_amount_cents: i64, modules: &[&str]) -> Uuid {
        let id = Uuid::new_v4();
        self.state().plans.insert(
            id,
            Plan {
                id,
                code: code.to_string(),
                name: code.to_string(),
                monthly_amount_cents,
                modules: modules.iter().map(|m| m.to_string()).collect(),
            },
        );
        id
    }

    pub fn seed_payment(&self, payment: Payment) {
        self.state().payments.insert(payment.id, payment);
    }

    pub fn seed_membership(&self, client_id: Uuid, company_id: Uuid, modules: &[&str]) -> Uuid {
        let id = Uuid::new_v4();
        self.state().memberships.push(Membership {
            id,
            client_id,
            company_id,
            identity_ref: None,
            active: false,
            modules: modules.iter().map(|m| (m.to_string(), true)).collect(),
        });
        id
    }

    pub fn seed_subscription(
        &self,
        company_id: Uuid,
        client_id: Uuid,
        plan_id: Uuid,
        status: SubscriptionStatus,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let today = OffsetDateTime::now_utc().date();
        self.state().subscriptions.push(Subscription {
            id,
            company_id,
            client_id,
            plan_id,
            status,
            started_on: today,
            next_payment_on: today,
            monthly_amount_cents: 0,
            payment_mode: "card".to_string(),
        });
        id
    }

    // ---- fault injection ---------------------------------------------

    /// Make the next `n` invoice inserts fail with a unique-constraint
    /// conflict, as a colliding invoice number would.
    pub fn fail_next_invoice_inserts(&self, n: usize) {
        self.inner.fail_invoice_inserts.store(n, Ordering::SeqCst);
    }

    pub fn fail_module_sync(&self, fail: bool) {
        self.inner.fail_module_sync.store(fail, Ordering::SeqCst);
    }

    // ---- inspection --------------------------------------------------

    pub fn payment(&self, id: Uuid) -> Option<Payment> {
        self.state().payments.get(&id).cloned()
    }

    pub fn company(&self, id: Uuid) -> Option<Company> {
        self.state().companies.get(&id).cloned()
    }

    pub fn client(&self, id: Uuid) -> Option<Client> {
        self.state().clients.iter().find(|c| c.id == id).cloned()
    }

    pub fn invoice_count(&self) -> usize {
        self.state().invoices.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.state().subscriptions.len()
    }

    pub fn membership_count(&self) -> usize {
        self.state().memberships.len()
    }

    pub fn membership(&self, client_id: Uuid, company_id: Uuid) -> Option<Membership> {
        self.state()
            .memberships
            .iter()
            .find(|m| m.client_id == client_id && m.company_id == company_id)
            .cloned()
    }

    pub fn module_grant_count(&self) -> usize {
        self.state().module_grants.len()
    }

    pub fn runs(&self) -> Vec<ReconcileRunRecord> {
        self.state().runs.clone()
    }
}

impl WorkflowStore for MemoryStore {
    async fn confirm_payment(
        &self,
        payment_id: Uuid,
        provider_ref: Option<&str>,
    ) -> Result<Option<Payment>, StoreError> {
        let mut state = self.state();
        let Some(payment) = state.payments.get_mut(&payment_id) else {
            return Ok(None);
        };
        if payment.status != PaymentStatus::Paid {
            payment.status = PaymentStatus::Paid;
            payment.paid_at.get_or_insert(OffsetDateTime::now_utc());
            if let Some(provider_ref) = provider_ref {
                payment.provider_ref = Some(provider_ref.to_string());
            }
        }
        Ok(Some(payment.clone()))
    }

    async fn persist_payment_linkage(
        &self,
        payment_id: Uuid,
        company_id: Option<Uuid>,
        client_id: Option<Uuid>,
        plan_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        if let Some(payment) = state.payments.get_mut(&payment_id) {
            payment.company_id = payment.company_id.or(company_id);
            payment.client_id = payment.client_id.or(client_id);
            payment.plan_id = payment.plan_id.or(plan_id);
        }
        Ok(())
    }

    async fn load_company(&self, company_id: Uuid) -> Result<Option<Company>, StoreError> {
        Ok(self.state().companies.get(&company_id).cloned())
    }

    async fn load_client(&self, client_id: Uuid) -> Result<Option<Client>, StoreError> {
        Ok(self.state().clients.iter().find(|c| c.id == client_id).cloned())
    }

    async fn first_client_of_company(
        &self,
        company_id: Uuid,
    ) -> Result<Option<Client>, StoreError> {
        Ok(self
            .state()
            .clients
            .iter()
            .find(|c| c.company_id == company_id)
            .cloned())
    }

    async fn load_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, StoreError> {
        Ok(self.state().plans.get(&plan_id).cloned())
    }

    async fn latest_subscription_plan(
        &self,
        company_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        Ok(self
            .state()
            .subscriptions
            .iter()
            .rev()
            .find(|s| s.company_id == company_id)
            .map(|s| s.plan_id))
    }

    async fn find_invoice_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Option<Invoice>, StoreError> {
        Ok(self
            .state()
            .invoices
            .iter()
            .find(|i| i.payment_id == payment_id)
            .cloned())
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, StoreError> {
        if self
            .inner
            .fail_invoice_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Conflict("injected invoice conflict".to_string()));
        }

        let mut state = self.state();
        if state
            .invoices
            .iter()
            .any(|i| i.payment_id == invoice.payment_id)
        {
            return Err(StoreError::Conflict(
                "invoices_payment_id_key duplicate".to_string(),
            ));
        }
        if state.invoices.iter().any(|i| i.number == invoice.number) {
            return Err(StoreError::Conflict(
                "invoices_number_key duplicate".to_string(),
            ));
        }

        let row = Invoice {
            id: Uuid::new_v4(),
            company_id: invoice.company_id,
            client_id: invoice.client_id,
            payment_id: invoice.payment_id,
            number: invoice.number.clone(),
            amount_cents: invoice.amount_cents,
            tax_cents: invoice.tax_cents,
            total_cents: invoice.total_cents,
            status: invoice.status,
            plan_id: invoice.plan_id,
        };
        state.invoices.push(row.clone());
        Ok(row)
    }

    async fn find_active_subscription(
        &self,
        company_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self
            .state()
            .subscriptions
            .iter()
            .find(|s| {
                s.company_id == company_id
                    && s.plan_id == plan_id
                    && s.status == SubscriptionStatus::Active
            })
            .cloned())
    }

    async fn insert_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> Result<Subscription, StoreError> {
        let mut state = self.state();
        if state.subscriptions.iter().any(|s| {
            s.company_id == subscription.company_id
                && s.plan_id == subscription.plan_id
                && s.status == SubscriptionStatus::Active
        }) {
            return Err(StoreError::Conflict(
                "subscriptions_active_company_plan_key duplicate".to_string(),
            ));
        }

        let row = Subscription {
            id: Uuid::new_v4(),
            company_id: subscription.company_id,
            client_id: subscription.client_id,
            plan_id: subscription.plan_id,
            status: SubscriptionStatus::Active,
            started_on: subscription.started_on,
            next_payment_on: subscription.next_payment_on,
            monthly_amount_cents: subscription.monthly_amount_cents,
            payment_mode: subscription.payment_mode.clone(),
        };
        state.subscriptions.push(row.clone());
        Ok(row)
    }

    async fn upsert_membership(
        &self,
        client_id: Uuid,
        company_id: Uuid,
        modules: &BTreeMap<String, bool>,
    ) -> Result<Membership, StoreError> {
        let mut state = self.state();
        if let Some(existing) = state
            .memberships
            .iter_mut()
            .find(|m| m.client_id == client_id && m.company_id == company_id)
        {
            existing.active = true;
            for (code, enabled) in modules {
                existing.modules.insert(code.clone(), *enabled);
            }
            return Ok(existing.clone());
        }

        let row = Membership {
            id: Uuid::new_v4(),
            client_id,
            company_id,
            identity_ref: None,
            active: true,
            modules: modules.clone(),
        };
        state.memberships.push(row.clone());
        Ok(row)
    }

    async fn sync_module_grants(
        &self,
        membership_id: Uuid,
        modules: &[String],
    ) -> Result<(), StoreError> {
        if self.inner.fail_module_sync.load(Ordering::SeqCst) {
            return Err(StoreError::Database(
                "injected module sync failure".to_string(),
            ));
        }
        let mut state = self.state();
        for module in modules {
            state.module_grants.insert((membership_id, module.clone()));
        }
        Ok(())
    }

    async fn activate_company(&self, company_id: Uuid) -> Result<(), StoreError> {
        if let Some(company) = self.state().companies.get_mut(&company_id) {
            company.status = CompanyStatus::Active;
            company.payment_status = CompanyPaymentStatus::Paid;
        }
        Ok(())
    }

    async fn activate_client(&self, client_id: Uuid) -> Result<(), StoreError> {
        if let Some(client) = self
            .state()
            .clients
            .iter_mut()
            .find(|c| c.id == client_id)
        {
            client.status = ClientStatus::Active;
        }
        Ok(())
    }

    async fn record_run(&self, run: &ReconcileRunRecord) -> Result<(), StoreError> {
        self.state().runs.push(run.clone());
        Ok(())
    }
}
