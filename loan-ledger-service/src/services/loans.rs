//! Loan lifecycle operations and read models.

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::{reduce, LedgerSums};
use crate::error::LedgerError;
use crate::models::{
    Cadence, EventStatus, InterestModel, LedgerPosting, LoanAccount, LoanStatus, LoanStatusChange,
    LoanTerms, Money, NewLoan, NewPaymentEvent, PaymentEvent, PaymentEventKind,
    RepaymentScheduleRow,
};
use crate::services::database::commit;
use crate::services::event_store;
use crate::services::gateway::PayoutRequest;
use crate::services::ledger::LoanLedger;
use crate::services::{ledger_store, loan_store, schedule_store};
use crate::utils::{disbursement_idempotency_key, normalize_msisdn};

/// Longest term accepted, in installments.
pub const MAX_TERM: i32 = 104;

/// Loan origination request.
#[derive(Debug, Clone)]
pub struct LoanApplication {
    pub borrower_msisdn: String,
    pub principal: Money,
    pub interest_rate_bps: i32,
    pub interest_model: InterestModel,
    pub term: i32,
    pub cadence: Cadence,
}

/// Result of a disbursement initiation.
#[derive(Debug, Clone, Serialize)]
pub struct DisbursementInitiated {
    pub event_id: Uuid,
    pub correlation_ref: Option<String>,
    /// The call picked up an earlier initiation that never reached the gateway.
    pub resumed: bool,
}

/// Ledger-derived view of a loan.
#[derive(Debug, Clone, Serialize)]
pub struct LoanFinancials {
    pub loan_id: Uuid,
    pub status: LoanStatus,
    pub principal_cents: Money,
    pub interest_cents: Money,
    pub total_due_cents: Money,
    pub total_paid_cents: Money,
    pub outstanding_cents: Money,
    pub overpaid_cents: Money,
    pub disbursed_utc: Option<chrono::DateTime<chrono::Utc>>,
    pub due_date: Option<chrono::NaiveDate>,
    /// Whether the cached totals on the loan row equal the ledger totals.
    pub cache_in_sync: bool,
    pub schedule: Vec<RepaymentScheduleRow>,
}

impl LoanApplication {
    fn validate(&self) -> Result<(), LedgerError> {
        if !self.principal.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "principal must be positive, got {}",
                self.principal
            )));
        }
        if self.principal.cents() % 100 != 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "principal must be whole currency units, got {}",
                self.principal
            )));
        }
        if !(1..=MAX_TERM).contains(&self.term) {
            return Err(LedgerError::Validation(format!(
                "term must be between 1 and {}, got {}",
                MAX_TERM, self.term
            )));
        }
        if self.interest_rate_bps < 0 {
            return Err(LedgerError::Validation(format!(
                "interest rate must not be negative, got {} bps",
                self.interest_rate_bps
            )));
        }
        Ok(())
    }

    fn terms(&self) -> LoanTerms {
        LoanTerms {
            principal: self.principal,
            interest_rate_bps: self.interest_rate_bps,
            interest_model: self.interest_model,
            term: self.term,
            cadence: self.cadence,
        }
    }
}

impl LoanLedger {
    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Open a loan in `initiated` with its total due fixed.
    #[instrument(skip(self, application), fields(principal_cents = application.principal.cents(), term = application.term))]
    pub async fn create_loan(
        &self,
        application: LoanApplication,
        actor_id: Uuid,
    ) -> Result<LoanAccount, LedgerError> {
        application.validate()?;
        let terms = application.terms();
        match terms.expected_installment() {
            Some(installment) if installment.is_positive() => {}
            _ => {
                return Err(LedgerError::Validation(format!(
                    "principal {} is too small for {} installments",
                    application.principal, application.term
                )))
            }
        }

        let msisdn = normalize_msisdn(
            &application.borrower_msisdn,
            &self.policy.msisdn_country_code,
        )?;

        let mut tx = self.db.begin().await?;
        let loan = loan_store::insert_loan(
            &mut tx,
            &NewLoan {
                borrower_msisdn: msisdn,
                terms,
                created_by: actor_id,
            },
        )
        .await?;
        commit(tx).await?;

        Ok(loan)
    }

    /// `initiated -> approved`. The approver must not be the loan's creator.
    #[instrument(skip(self))]
    pub async fn approve_loan(&self, loan_id: Uuid, actor_id: Uuid) -> Result<LoanAccount, LedgerError> {
        let mut tx = self.db.begin().await?;
        let loan = loan_store::lock_loan(&mut tx, loan_id).await?;

        if loan.created_by == actor_id {
            return Err(LedgerError::ApprovalConflict(loan_id));
        }
        loan_store::transition(&mut tx, &loan, LoanStatus::Approved, Some(actor_id), "approved").await?;

        let loan = loan_store::lock_loan(&mut tx, loan_id).await?;
        commit(tx).await?;
        Ok(loan)
    }

    /// Cancel a loan that has not started disbursement.
    #[instrument(skip(self, reason))]
    pub async fn cancel_loan(
        &self,
        loan_id: Uuid,
        actor_id: Uuid,
        reason: Option<String>,
    ) -> Result<LoanAccount, LedgerError> {
        let mut tx = self.db.begin().await?;
        let loan = loan_store::lock_loan(&mut tx, loan_id).await?;

        if event_store::disbursement_for_loan(&mut tx, loan_id).await?.is_some() {
            return Err(LedgerError::AlreadyInitiated(loan_id));
        }

        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "cancelled".to_string());
        loan_store::transition(&mut tx, &loan, LoanStatus::Cancelled, Some(actor_id), &reason).await?;

        let loan = loan_store::lock_loan(&mut tx, loan_id).await?;
        commit(tx).await?;
        Ok(loan)
    }

    /// Create the outbound disbursement event, move the loan to
    /// `disbursement_pending` and send the payout.
    ///
    /// A retry after a timeout resumes the same event as long as the gateway
    /// never acknowledged it. Any other repeat is `AlreadyInitiated`.
    #[instrument(skip(self))]
    pub async fn initiate_disbursement(
        &self,
        loan_id: Uuid,
        actor_id: Uuid,
    ) -> Result<DisbursementInitiated, LedgerError> {
        let mut tx = self.db.begin().await?;
        let loan = loan_store::lock_loan(&mut tx, loan_id).await?;
        let key =
            disbursement_idempotency_key(loan.loan_id, loan.principal_cents, &loan.borrower_msisdn);

        let (event, resumed) = match loan.status {
            LoanStatus::Approved => {
                let event = event_store::insert_event(
                    &mut tx,
                    &NewPaymentEvent {
                        loan_id: Some(loan.loan_id),
                        kind: PaymentEventKind::Disbursement,
                        amount: loan.principal_cents,
                        status: EventStatus::Pending,
                        receipt_ref: None,
                        idempotency_key: Some(key.clone()),
                        msisdn: Some(loan.borrower_msisdn.clone()),
                        raw_payload: None,
                        initiated_by: Some(actor_id),
                    },
                )
                .await
                .map_err(|e| match e {
                    LedgerError::DuplicateEvent(_) => LedgerError::AlreadyInitiated(loan_id),
                    other => other,
                })?;

                loan_store::transition(
                    &mut tx,
                    &loan,
                    LoanStatus::DisbursementPending,
                    Some(actor_id),
                    "disbursement initiated",
                )
                .await?;
                (event, false)
            }
            LoanStatus::DisbursementPending => {
                let event = event_store::disbursement_for_loan(&mut tx, loan_id)
                    .await?
                    .filter(|e| is_resumable(e, &key))
                    .ok_or(LedgerError::AlreadyInitiated(loan_id))?;
                (event, true)
            }
            actual => {
                return Err(LedgerError::InvalidState {
                    loan_id,
                    expected: LoanStatus::Approved.as_str(),
                    actual,
                })
            }
        };
        commit(tx).await?;

        if resumed {
            info!(event_id = %event.event_id, "Resuming unacknowledged disbursement");
        }

        let accepted = self
            .gateway
            .send_payout(&PayoutRequest {
                event_id: event.event_id,
                loan_id,
                msisdn: loan.borrower_msisdn.clone(),
                amount: event.amount_cents,
                idempotency_key: key,
            })
            .await
            .map_err(LedgerError::Gateway)?;

        let mut conn = self.db.pool().acquire().await?;
        if !event_store::set_correlation(&mut conn, event.event_id, &accepted.correlation_ref).await? {
            warn!(
                event_id = %event.event_id,
                correlation_id = %accepted.correlation_ref,
                "Disbursement event no longer open for a correlation reference"
            );
        }

        info!(
            event_id = %event.event_id,
            loan_id = %loan_id,
            correlation_id = %accepted.correlation_ref,
            amount_cents = event.amount_cents.cents(),
            "Disbursement sent to gateway"
        );

        Ok(DisbursementInitiated {
            event_id: event.event_id,
            correlation_ref: Some(accepted.correlation_ref),
            resumed,
        })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Totals derived from the ledger at call time, with the schedule.
    #[instrument(skip(self))]
    pub async fn get_loan_financials(&self, loan_id: Uuid) -> Result<LoanFinancials, LedgerError> {
        let mut tx = self.db.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let loan = loan_store::get_loan(&mut tx, loan_id)
            .await?
            .ok_or(LedgerError::LoanNotFound(loan_id))?;
        let postings = ledger_store::postings_for_loan(&mut tx, loan_id).await?;
        let schedule = schedule_store::rows_for_loan(&mut tx, loan_id, false).await?;
        tx.commit().await?;

        let sums = LedgerSums::from_postings(&postings);
        let derived = reduce(loan.total_due_cents, loan.status, &sums);
        let cache_in_sync = derived.total_paid == loan.total_paid_cents
            && derived.outstanding == loan.outstanding_cents
            && derived.status == loan.status;

        if !cache_in_sync {
            warn!(
                loan_id = %loan_id,
                cached_total_paid_cents = loan.total_paid_cents.cents(),
                total_paid_cents = derived.total_paid.cents(),
                "Cached loan totals differ from ledger"
            );
        }

        Ok(LoanFinancials {
            loan_id,
            status: derived.status,
            principal_cents: loan.principal_cents,
            interest_cents: loan.total_interest(),
            total_due_cents: loan.total_due_cents,
            total_paid_cents: derived.total_paid,
            outstanding_cents: derived.outstanding,
            overpaid_cents: sums.overpaid,
            disbursed_utc: loan.disbursed_utc,
            due_date: loan.due_date,
            cache_in_sync,
            schedule,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_loan_postings(&self, loan_id: Uuid) -> Result<Vec<LedgerPosting>, LedgerError> {
        let mut conn = self.db.pool().acquire().await?;
        self.require_loan(&mut conn, loan_id).await?;
        ledger_store::postings_for_loan(&mut conn, loan_id).await
    }

    #[instrument(skip(self))]
    pub async fn get_loan_events(&self, loan_id: Uuid) -> Result<Vec<PaymentEvent>, LedgerError> {
        let mut conn = self.db.pool().acquire().await?;
        self.require_loan(&mut conn, loan_id).await?;
        event_store::events_for_loan(&mut conn, loan_id).await
    }

    #[instrument(skip(self))]
    pub async fn get_loan_history(
        &self,
        loan_id: Uuid,
    ) -> Result<Vec<LoanStatusChange>, LedgerError> {
        let mut conn = self.db.pool().acquire().await?;
        self.require_loan(&mut conn, loan_id).await?;
        loan_store::status_history(&mut conn, loan_id).await
    }

    async fn require_loan(
        &self,
        conn: &mut sqlx::PgConnection,
        loan_id: Uuid,
    ) -> Result<LoanAccount, LedgerError> {
        loan_store::get_loan(conn, loan_id)
            .await?
            .ok_or(LedgerError::LoanNotFound(loan_id))
    }
}

/// An initiation may be re-sent only while the gateway has never acknowledged it.
fn is_resumable(event: &PaymentEvent, key: &str) -> bool {
    event.status == EventStatus::Pending
        && event.correlation_ref.is_none()
        && event.idempotency_key.as_deref() == Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventDirection;
    use chrono::Utc;

    fn application() -> LoanApplication {
        LoanApplication {
            borrower_msisdn: "0712345678".to_string(),
            principal: Money::from_cents(1_000_000),
            interest_rate_bps: 500,
            interest_model: InterestModel::Flat,
            term: 4,
            cadence: Cadence::Weekly,
        }
    }

    fn pending_event(key: &str) -> PaymentEvent {
        PaymentEvent {
            event_id: Uuid::new_v4(),
            loan_id: Some(Uuid::new_v4()),
            kind: PaymentEventKind::Disbursement,
            direction: EventDirection::Out,
            amount_cents: Money::from_cents(1_000_000),
            status: EventStatus::Pending,
            correlation_ref: None,
            receipt_ref: None,
            idempotency_key: Some(key.to_string()),
            msisdn: Some("254712345678".to_string()),
            result_code: None,
            result_desc: None,
            raw_payload: None,
            initiated_by: None,
            created_utc: Utc::now(),
            finalized_utc: None,
        }
    }

    #[test]
    fn valid_application_passes() {
        assert!(application().validate().is_ok());
    }

    #[test]
    fn application_bounds_are_enforced() {
        let mut app = application();
        app.principal = Money::ZERO;
        assert!(matches!(app.validate(), Err(LedgerError::InvalidAmount(_))));

        let mut app = application();
        app.principal = Money::from_cents(1_000_050);
        assert!(matches!(app.validate(), Err(LedgerError::InvalidAmount(_))));

        let mut app = application();
        app.term = 0;
        assert!(matches!(app.validate(), Err(LedgerError::Validation(_))));
        app.term = MAX_TERM + 1;
        assert!(matches!(app.validate(), Err(LedgerError::Validation(_))));

        let mut app = application();
        app.interest_rate_bps = -1;
        assert!(matches!(app.validate(), Err(LedgerError::Validation(_))));
    }

    #[test]
    fn only_unacknowledged_pending_disbursements_resume() {
        let event = pending_event("k1");
        assert!(is_resumable(&event, "k1"));
        assert!(!is_resumable(&event, "k2"));

        let mut acknowledged = pending_event("k1");
        acknowledged.correlation_ref = Some("AG_1".to_string());
        assert!(!is_resumable(&acknowledged, "k1"));

        let mut failed = pending_event("k1");
        failed.status = EventStatus::Failed;
        assert!(!is_resumable(&failed, "k1"));
    }
}
