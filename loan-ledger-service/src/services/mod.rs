pub mod database;
pub mod event_store;
pub mod gateway;
pub mod ledger;
pub mod ledger_store;
pub mod loan_store;
pub mod loans;
pub mod metrics;
pub mod reconciliation;
pub mod schedule_store;
pub mod sweep;

pub use database::Database;
pub use gateway::{DisbursementGateway, HttpDisbursementGateway, PayoutAccepted, PayoutRequest};
pub use ledger::LoanLedger;
pub use loans::{DisbursementInitiated, LoanApplication, LoanFinancials};
pub use metrics::{get_metrics, init_metrics};
pub use reconciliation::{
    CallbackOutcome, CollectionNotice, DisbursementResult, RepaymentReceipt,
};
pub use sweep::{spawn_sweeper, SweepReport};
