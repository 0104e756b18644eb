//! The loan ledger service handle shared by handlers and background tasks.

use sqlx::PgConnection;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::PolicyConfig;
use crate::engine::{reduce, FinancialState, LedgerSums};
use crate::error::LedgerError;
use crate::models::LoanAccount;
use crate::services::database::{commit, Database};
use crate::services::gateway::DisbursementGateway;
use crate::services::{ledger_store, loan_store};

#[derive(Clone)]
pub struct LoanLedger {
    pub(crate) db: Database,
    pub(crate) gateway: Arc<dyn DisbursementGateway>,
    pub(crate) policy: PolicyConfig,
}

impl LoanLedger {
    pub fn new(db: Database, gateway: Arc<dyn DisbursementGateway>, policy: PolicyConfig) -> Self {
        Self {
            db,
            gateway,
            policy,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Recompute a loan's cached totals and status from its postings.
    /// Safe to call at any time; a no-op when the cache is already correct.
    #[instrument(skip(self))]
    pub async fn recompute_financials(&self, loan_id: Uuid) -> Result<FinancialState, LedgerError> {
        let mut tx = self.db.begin().await?;
        let loan = loan_store::lock_loan(&mut tx, loan_id).await?;
        let state = apply_reducer(&mut tx, &loan).await?;
        commit(tx).await?;

        if state.total_paid != loan.total_paid_cents || state.outstanding != loan.outstanding_cents {
            info!(
                loan_id = %loan_id,
                cached_total_paid_cents = loan.total_paid_cents.cents(),
                total_paid_cents = state.total_paid.cents(),
                "Cached loan totals corrected"
            );
        }
        Ok(state)
    }
}

/// Run the reducer for a locked loan and persist its result.
///
/// Always the last step of a posting transaction.
pub(crate) async fn apply_reducer(
    conn: &mut PgConnection,
    loan: &LoanAccount,
) -> Result<FinancialState, LedgerError> {
    let postings = ledger_store::postings_for_loan(conn, loan.loan_id).await?;
    let sums = LedgerSums::from_postings(&postings);
    let state = reduce(loan.total_due_cents, loan.status, &sums);

    loan_store::write_financials(conn, loan.loan_id, &state).await?;
    if state.status != loan.status {
        loan_store::transition(conn, loan, state.status, None, "balance settled").await?;
    }

    Ok(state)
}
