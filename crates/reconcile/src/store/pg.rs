//! PostgreSQL workflow store
//!
//! Single-statement atomic SQL throughout: the paid transition is a
//! conditional UPDATE, the create operations rely on uniqueness
//! constraints (`ON CONFLICT` where the reuse semantics are fixed,
//! plain INSERT where the engine decides how to handle the conflict).

use std::collections::BTreeMap;

use sqlx::PgPool;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use payflow_shared::{
    Client, ClientStatus, Company, CompanyPaymentStatus, CompanyStatus, Invoice, InvoiceStatus,
    Membership, Payment, PaymentStatus, Plan, Subscription, SubscriptionStatus,
};

use crate::error::StoreError;
use crate::store::{NewInvoice, NewSubscription, ReconcileRunRecord, WorkflowStore};

const PAYMENT_COLUMNS: &str = "id, company_id, client_id, plan_id, amount_cents, tax_cents, \
     total_cents, status, provider_ref, payload, paid_at";

const INVOICE_COLUMNS: &str = "id, company_id, client_id, payment_id, number, amount_cents, \
     tax_cents, total_cents, status, plan_id";

const SUBSCRIPTION_COLUMNS: &str = "id, company_id, client_id, plan_id, status, started_on, \
     next_payment_on, monthly_amount_cents, payment_mode";

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    company_id: Option<Uuid>,
    client_id: Option<Uuid>,
    plan_id: Option<Uuid>,
    amount_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    status: String,
    provider_ref: Option<String>,
    payload: serde_json::Value,
    paid_at: Option<OffsetDateTime>,
}

impl PaymentRow {
    fn into_model(self) -> Result<Payment, StoreError> {
        Ok(Payment {
            id: self.id,
            company_id: self.company_id,
            client_id: self.client_id,
            plan_id: self.plan_id,
            amount_cents: self.amount_cents,
            tax_cents: self.tax_cents,
            total_cents: self.total_cents,
            status: parse_status("payments.status", &self.status, PaymentStatus::parse)?,
            provider_ref: self.provider_ref,
            payload: self.payload,
            paid_at: self.paid_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CompanyRow {
    id: Uuid,
    name: String,
    status: String,
    payment_status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ClientRow {
    id: Uuid,
    company_id: Uuid,
    name: String,
    email: Option<String>,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    code: String,
    name: String,
    monthly_amount_cents: i64,
    modules: Vec<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    company_id: Uuid,
    client_id: Uuid,
    payment_id: Uuid,
    number: String,
    amount_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    status: String,
    plan_id: Option<Uuid>,
}

impl InvoiceRow {
    fn into_model(self) -> Result<Invoice, StoreError> {
        Ok(Invoice {
            id: self.id,
            company_id: self.company_id,
            client_id: self.client_id,
            payment_id: self.payment_id,
            number: self.number,
            amount_cents: self.amount_cents,
            tax_cents: self.tax_cents,
            total_cents: self.total_cents,
            status: parse_status("invoices.status", &self.status, InvoiceStatus::parse)?,
            plan_id: self.plan_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    company_id: Uuid,
    client_id: Uuid,
    plan_id: Uuid,
    status: String,
    started_on: Date,
    next_payment_on: Date,
    monthly_amount_cents: i64,
    payment_mode: String,
}

impl SubscriptionRow {
    fn into_model(self) -> Result<Subscription, StoreError> {
        Ok(Subscription {
            id: self.id,
            company_id: self.company_id,
            client_id: self.client_id,
            plan_id: self.plan_id,
            status: parse_status(
                "subscriptions.status",
                &self.status,
                SubscriptionStatus::parse,
            )?,
            started_on: self.started_on,
            next_payment_on: self.next_payment_on,
            monthly_amount_cents: self.monthly_amount_cents,
            payment_mode: self.payment_mode,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MembershipRow {
    id: Uuid,
    client_id: Uuid,
    company_id: Uuid,
    identity_ref: Option<String>,
    active: bool,
    modules: serde_json::Value,
}

impl MembershipRow {
    fn into_model(self) -> Membership {
        let modules: BTreeMap<String, bool> =
            serde_json::from_value(self.modules).unwrap_or_default();
        Membership {
            id: self.id,
            client_id: self.client_id,
            company_id: self.company_id,
            identity_ref: self.identity_ref,
            active: self.active,
            modules,
        }
    }
}

fn parse_status<T>(
    column: &'static str,
    raw: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, StoreError> {
    parse(raw).ok_or_else(|| StoreError::Decode(format!("{column} holds unknown value '{raw}'")))
}

/// Postgres-backed [`WorkflowStore`].
#[derive(Clone)]
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl WorkflowStore for PgWorkflowStore {
    async fn confirm_payment(
        &self,
        payment_id: Uuid,
        provider_ref: Option<&str>,
    ) -> Result<Option<Payment>, StoreError> {
        // Conditional update: only one concurrent caller performs the
        // pending -> paid transition; the loser falls through to the
        // re-read below and continues with the already-paid row.
        let updated: Option<PaymentRow> = sqlx::query_as(&format!(
            r#"
            UPDATE payments
            SET status = 'paid',
                paid_at = COALESCE(paid_at, NOW()),
                provider_ref = COALESCE($2, provider_ref),
                updated_at = NOW()
            WHERE id = $1 AND status <> 'paid'
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment_id)
        .bind(provider_ref)
        .fetch_optional(&self.pool)
        .await?;

        let row = match updated {
            Some(row) => Some(row),
            None => {
                sqlx::query_as(&format!(
                    "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
                ))
                .bind(payment_id)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.map(PaymentRow::into_model).transpose()
    }

    async fn persist_payment_linkage(
        &self,
        payment_id: Uuid,
        company_id: Option<Uuid>,
        client_id: Option<Uuid>,
        plan_id: Option<Uuid>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE payments
            SET company_id = COALESCE(company_id, $2),
                client_id = COALESCE(client_id, $3),
                plan_id = COALESCE(plan_id, $4),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .bind(company_id)
        .bind(client_id)
        .bind(plan_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_company(&self, company_id: Uuid) -> Result<Option<Company>, StoreError> {
        let row: Option<CompanyRow> =
            sqlx::query_as("SELECT id, name, status, payment_status FROM companies WHERE id = $1")
                .bind(company_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(|row| {
            Ok(Company {
                id: row.id,
                name: row.name,
                status: parse_status("companies.status", &row.status, CompanyStatus::parse)?,
                payment_status: parse_status(
                    "companies.payment_status",
                    &row.payment_status,
                    CompanyPaymentStatus::parse,
                )?,
            })
        })
        .transpose()
    }

    async fn load_client(&self, client_id: Uuid) -> Result<Option<Client>, StoreError> {
        let row: Option<ClientRow> =
            sqlx::query_as("SELECT id, company_id, name, email, status FROM clients WHERE id = $1")
                .bind(client_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(client_from_row).transpose()
    }

    async fn first_client_of_company(
        &self,
        company_id: Uuid,
    ) -> Result<Option<Client>, StoreError> {
        let row: Option<ClientRow> = sqlx::query_as(
            r#"
            SELECT id, company_id, name, email, status
            FROM clients
            WHERE company_id = $1
            ORDER BY created_at, id
            LIMIT 1
            "#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(client_from_row).transpose()
    }

    async fn load_plan(&self, plan_id: Uuid) -> Result<Option<Plan>, StoreError> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, code, name, monthly_amount_cents, modules FROM plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Plan {
            id: row.id,
            code: row.code,
            name: row.name,
            monthly_amount_cents: row.monthly_amount_cents,
            modules: row.modules,
        }))
    }

    async fn latest_subscription_plan(
        &self,
        company_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let row: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT plan_id FROM subscriptions
            WHERE company_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(company_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(plan_id,)| plan_id))
    }

    async fn find_invoice_for_payment(
        &self,
        payment_id: Uuid,
    ) -> Result<Option<Invoice>, StoreError> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(InvoiceRow::into_model).transpose()
    }

    async fn insert_invoice(&self, invoice: &NewInvoice) -> Result<Invoice, StoreError> {
        // Plain INSERT: a unique violation (payment already invoiced by a
        // concurrent run, or a number collision) surfaces as Conflict and
        // the engine decides whether to reload or regenerate.
        let row: InvoiceRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO invoices
                (id, company_id, client_id, payment_id, number,
                 amount_cents, tax_cents, total_cents, status, plan_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(invoice.company_id)
        .bind(invoice.client_id)
        .bind(invoice.payment_id)
        .bind(&invoice.number)
        .bind(invoice.amount_cents)
        .bind(invoice.tax_cents)
        .bind(invoice.total_cents)
        .bind(invoice.status.as_str())
        .bind(invoice.plan_id)
        .fetch_one(&self.pool)
        .await?;

        row.into_model()
    }

    async fn find_active_subscription(
        &self,
        company_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<Subscription>, StoreError> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
            WHERE company_id = $1 AND plan_id = $2 AND status = 'active'
            LIMIT 1
            "#
        ))
        .bind(company_id)
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionRow::into_model).transpose()
    }

    async fn insert_subscription(
        &self,
        subscription: &NewSubscription,
    ) -> Result<Subscription, StoreError> {
        let row: SubscriptionRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO subscriptions
                (id, company_id, client_id, plan_id, status, started_on,
                 next_payment_on, monthly_amount_cents, payment_mode)
            VALUES ($1, $2, $3, $4, 'active', $5, $6, $7, $8)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(subscription.company_id)
        .bind(subscription.client_id)
        .bind(subscription.plan_id)
        .bind(subscription.started_on)
        .bind(subscription.next_payment_on)
        .bind(subscription.monthly_amount_cents)
        .bind(&subscription.payment_mode)
        .fetch_one(&self.pool)
        .await?;

        row.into_model()
    }

    async fn upsert_membership(
        &self,
        client_id: Uuid,
        company_id: Uuid,
        modules: &BTreeMap<String, bool>,
    ) -> Result<Membership, StoreError> {
        let modules_json = serde_json::to_value(modules)
            .map_err(|e| StoreError::Decode(format!("module map not serializable: {e}")))?;

        // The jsonb || union keeps manually granted modules: incoming keys
        // are added, existing keys the plan doesn't know about survive.
        let row: MembershipRow = sqlx::query_as(
            r#"
            INSERT INTO memberships (id, client_id, company_id, active, modules)
            VALUES ($1, $2, $3, TRUE, $4)
            ON CONFLICT (client_id, company_id) DO UPDATE SET
                active = TRUE,
                modules = memberships.modules || EXCLUDED.modules,
                updated_at = NOW()
            RETURNING id, client_id, company_id, identity_ref, active, modules
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(client_id)
        .bind(company_id)
        .bind(modules_json)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_model())
    }

    async fn sync_module_grants(
        &self,
        membership_id: Uuid,
        modules: &[String],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO module_grants (membership_id, module_code)
            SELECT $1, UNNEST($2::TEXT[])
            ON CONFLICT (membership_id, module_code) DO NOTHING
            "#,
        )
        .bind(membership_id)
        .bind(modules)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn activate_company(&self, company_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE companies
            SET status = 'active', payment_status = 'paid', updated_at = NOW()
            WHERE id = $1
              AND (status <> 'active' OR payment_status <> 'paid')
            "#,
        )
        .bind(company_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn activate_client(&self, client_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE clients SET status = 'active', updated_at = NOW() WHERE id = $1 AND status <> 'active'",
        )
        .bind(client_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_run(&self, run: &ReconcileRunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_runs
                (id, payment_id, step, success, invoice_id, subscription_id,
                 membership_id, message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run.payment_id)
        .bind(run.step)
        .bind(run.success)
        .bind(run.invoice_id)
        .bind(run.subscription_id)
        .bind(run.membership_id)
        .bind(run.message.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn client_from_row(row: ClientRow) -> Result<Client, StoreError> {
    Ok(Client {
        id: row.id,
        company_id: row.company_id,
        name: row.name,
        email: row.email,
        status: parse_status("clients.status", &row.status, ClientStatus::parse)?,
    })
}
