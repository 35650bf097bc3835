//! Manual reconciliation replay tool
//!
//! Re-runs the reconciliation engine for specific payments, or runs the
//! read-only consistency checks. Replaying an already-completed payment is
//! a harmless no-op, so this is the first tool to reach for when a webhook
//! delivery failed partway.
//!
//! Usage:
//!   payflow-replay <payment-id> [<payment-id> ...]
//!   payflow-replay --check [check-name]

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use payflow_reconcile::store::PgWorkflowStore;
use payflow_reconcile::{InvariantChecker, ReconcileOutcome, ReconciliationEngine};
use payflow_shared::{create_pool, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,payflow_reconcile=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("Usage: payflow-replay <payment-id> [<payment-id> ...]");
        eprintln!("       payflow-replay --check [check-name]");
        anyhow::bail!("no arguments given");
    }

    let config = Config::from_env()?;
    let pool = create_pool(&config).await?;

    if args[0] == "--check" {
        return run_checks(pool, args.get(1).map(String::as_str)).await;
    }

    let payment_ids: Vec<Uuid> = args
        .iter()
        .map(|raw| {
            Uuid::parse_str(raw).with_context(|| format!("'{raw}' is not a payment id"))
        })
        .collect::<Result<_, _>>()?;

    let engine = ReconciliationEngine::new(PgWorkflowStore::new(pool));

    let mut failures = 0usize;
    for payment_id in &payment_ids {
        match engine.reconcile(*payment_id, None).await {
            ReconcileOutcome::Completed {
                invoice_id,
                subscription_id,
                ..
            } => {
                println!(
                    "{payment_id}: reconciled (invoice {invoice_id}, subscription {subscription_id})"
                );
            }
            ReconcileOutcome::Failed {
                step,
                kind,
                message,
                ..
            } => {
                failures += 1;
                println!(
                    "{payment_id}: FAILED after {step} [{}]: {message}",
                    kind.as_str()
                );
            }
        }
    }

    println!("{} replayed, {} failed", payment_ids.len(), failures);
    if failures > 0 {
        anyhow::bail!("{failures} replay(s) failed");
    }
    Ok(())
}

async fn run_checks(pool: sqlx::PgPool, name: Option<&str>) -> anyhow::Result<()> {
    let checker = InvariantChecker::new(pool);

    let violations = match name {
        Some(name) => {
            if !InvariantChecker::available_checks().contains(&name) {
                anyhow::bail!(
                    "unknown check '{name}', available: {}",
                    InvariantChecker::available_checks().join(", ")
                );
            }
            checker.run_check(name).await?
        }
        None => {
            let summary = checker.run_all_checks().await?;
            println!(
                "{}/{} checks passed",
                summary.checks_passed, summary.checks_run
            );
            summary.violations
        }
    };

    for violation in &violations {
        println!(
            "[{}] {}: {}",
            violation.severity, violation.invariant, violation.description
        );
    }

    if violations.is_empty() {
        println!("no violations");
        Ok(())
    } else {
        anyhow::bail!("{} violation(s) found", violations.len())
    }
}
