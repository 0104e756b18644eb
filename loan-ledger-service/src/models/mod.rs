//! Domain models for loan-ledger-service.

mod event;
mod loan;
mod money;
mod posting;
mod schedule;

pub use event::{EventDirection, EventStatus, NewPaymentEvent, PaymentEvent, PaymentEventKind};
pub use loan::{
    Cadence, InterestModel, LoanAccount, LoanStatus, LoanStatusChange, LoanTerms, NewLoan,
};
pub use money::Money;
pub use posting::{Account, Direction, LedgerPosting, NewPosting, PostingBatch, PostingType};
pub use schedule::{RepaymentScheduleRow, ScheduleStatus};

/// A stored enum column held a value outside the closed set.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub(crate) fn new(kind: &'static str, value: String) -> Self {
        Self { kind, value }
    }
}
