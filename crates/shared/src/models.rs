//! Domain model
//!
//! Entities and status domains for the reconciliation workflow. Statuses
//! are stored as TEXT in PostgreSQL (with CHECK constraints) and mapped
//! through `as_str`/`parse` here; the engine only ever sees the enums.
//!
//! All monetary amounts are integer cents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

/// Lifecycle of a payment. Once `Paid`, the status is monotonic and is
/// never reverted by any workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "paid" => Some(PaymentStatus::Paid),
            "failed" => Some(PaymentStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyStatus {
    InCreation,
    Active,
    Suspended,
    Deregistered,
}

impl CompanyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanyStatus::InCreation => "in_creation",
            CompanyStatus::Active => "active",
            CompanyStatus::Suspended => "suspended",
            CompanyStatus::Deregistered => "deregistered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_creation" => Some(CompanyStatus::InCreation),
            "active" => Some(CompanyStatus::Active),
            "suspended" => Some(CompanyStatus::Suspended),
            "deregistered" => Some(CompanyStatus::Deregistered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyPaymentStatus {
    Unpaid,
    Paid,
}

impl CompanyPaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompanyPaymentStatus::Unpaid => "unpaid",
            CompanyPaymentStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(CompanyPaymentStatus::Unpaid),
            "paid" => Some(CompanyPaymentStatus::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Inactive,
    Active,
}

impl ClientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientStatus::Inactive => "inactive",
            ClientStatus::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(ClientStatus::Inactive),
            "active" => Some(ClientStatus::Active),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Open,
    Paid,
    Canceled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Open => "open",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(InvoiceStatus::Open),
            "paid" => Some(InvoiceStatus::Paid),
            "canceled" => Some(InvoiceStatus::Canceled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Canceled,
    Unpaid,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            _ => None,
        }
    }
}

/// A payment submitted at company registration time.
///
/// `company_id`/`client_id`/`plan_id` are nullable legacy columns; when
/// absent, the same linkage may still be recoverable from `payload`
/// (see [`PaymentPayload`]). The engine normalizes recovered linkage back
/// onto the row so later reads skip the fallback.
#[derive(Debug, Clone, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub company_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
    pub amount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub status: PaymentStatus,
    /// Provider-side confirmation reference (e.g. a payment intent id),
    /// stored for audit only.
    pub provider_ref: Option<String>,
    /// Legacy free-form linkage blob.
    pub payload: serde_json::Value,
    pub paid_at: Option<OffsetDateTime>,
}

impl Payment {
    /// Decode the legacy payload blob. Unknown keys and malformed values
    /// are ignored; absent linkage simply stays `None`.
    pub fn decoded_payload(&self) -> PaymentPayload {
        serde_json::from_value(self.payload.clone()).unwrap_or_default()
    }
}

/// Typed view of the redundant linkage carried in the payment payload
/// blob. Fallback only; normalized foreign keys win when present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentPayload {
    pub company_id: Option<Uuid>,
    pub client_id: Option<Uuid>,
    pub plan_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub status: CompanyStatus,
    pub payment_status: CompanyPaymentStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Client {
    pub id: Uuid,
    pub company_id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub status: ClientStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct Invoice {
    pub id: Uuid,
    pub company_id: Uuid,
    pub client_id: Uuid,
    /// Originating payment. Real UNIQUE foreign key: one invoice per payment.
    pub payment_id: Uuid,
    /// Unique human-readable invoice number.
    pub number: String,
    pub amount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub status: InvoiceStatus,
    pub plan_id: Option<Uuid>,
}

impl Invoice {
    /// `amount + tax = total`, within one cent of rounding tolerance.
    pub fn amounts_consistent(&self) -> bool {
        (self.amount_cents + self.tax_cents - self.total_cents).abs() <= 1
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub company_id: Uuid,
    pub client_id: Uuid,
    pub plan_id: Uuid,
    pub status: SubscriptionStatus,
    pub started_on: Date,
    pub next_payment_on: Date,
    pub monthly_amount_cents: i64,
    pub payment_mode: String,
}

/// Per-client member workspace granting portal access and module
/// entitlements within a company. At most one per (client, company).
#[derive(Debug, Clone, Serialize)]
pub struct Membership {
    pub id: Uuid,
    pub client_id: Uuid,
    pub company_id: Uuid,
    pub identity_ref: Option<String>,
    pub active: bool,
    /// Module code -> enabled. Grants are additive: workflow steps union
    /// into this map and never remove entries.
    pub modules: BTreeMap<String, bool>,
}

/// Static catalog row describing a subscription tier.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub monthly_amount_cents: i64,
    pub modules: Vec<String>,
}
