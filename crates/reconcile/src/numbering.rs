//! Invoice number generation
//!
//! Human-readable, unique-by-constraint invoice numbers of the form
//! `R-YYYYMM-NNNNNN`. The random component keeps concurrent runs from
//! trampling each other, but uniqueness is owed to the database
//! constraint: generation is retried when an insert reports a collision.

use rand::Rng;
use time::Date;

/// Number of insert attempts before a run gives up and reports a
/// transient failure. Collisions at 10^6 numbers per month are rare
/// enough that hitting this bound means something else is wrong.
pub const MAX_NUMBER_ATTEMPTS: u32 = 5;

/// Generate a candidate invoice number for the given issue date.
pub fn generate_invoice_number(issued_on: Date) -> String {
    let serial: u32 = rand::rng().random_range(0..1_000_000);
    format!(
        "R-{:04}{:02}-{:06}",
        issued_on.year(),
        issued_on.month() as u8,
        serial
    )
}
