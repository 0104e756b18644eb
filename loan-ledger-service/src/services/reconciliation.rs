//! Callback reconciliation and repayment application.
//!
//! Each inbound payment is reconciled in a single transaction: event record,
//! balanced postings, schedule update and reducer either all commit or none do.
//! Lock order is always loan row, then event row.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::{
    allocate, apply, project, Allocation, FinancialState, LedgerSums, Outstanding, ProjectionInput,
};
use crate::error::LedgerError;
use crate::models::{
    EventStatus, LoanAccount, LoanStatus, Money, NewPaymentEvent, PaymentEvent, PaymentEventKind,
    PostingBatch,
};
use crate::services::database::commit;
use crate::services::event_store::{self, Finalization};
use crate::services::ledger::{apply_reducer, LoanLedger};
use crate::services::{ledger_store, loan_store, schedule_store};

/// Disbursement result as reported by the payment network.
#[derive(Debug, Clone)]
pub struct DisbursementResult {
    pub result_code: i32,
    pub correlation_id: String,
    pub external_transaction_id: Option<String>,
    pub result_desc: Option<String>,
    pub raw: serde_json::Value,
}

/// Collection confirmation as reported by the payment network.
#[derive(Debug, Clone)]
pub struct CollectionNotice {
    pub external_receipt_id: String,
    pub payer_msisdn: Option<String>,
    pub amount: String,
    pub account_reference: String,
    pub raw: serde_json::Value,
}

/// What a callback did to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Postings were written.
    Applied,
    /// The outbound payment failed; event closed, no postings.
    Rejected,
    /// Already processed earlier; nothing changed.
    Duplicate,
    /// Nothing to reconcile against.
    Ignored,
}

impl CallbackOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Rejected => "rejected",
            Self::Duplicate => "duplicate",
            Self::Ignored => "ignored",
        }
    }
}

/// Result of applying one repayment.
#[derive(Debug, Clone, Serialize)]
pub struct RepaymentReceipt {
    pub event_id: Uuid,
    pub loan_id: Uuid,
    pub amount_cents: Money,
    pub allocation: Allocation,
    pub financials: FinancialState,
}

/// Repayment to apply, from any channel.
struct RepaymentInput {
    loan_id: Uuid,
    kind: PaymentEventKind,
    amount: Money,
    receipt_ref: Option<String>,
    idempotency_key: Option<String>,
    msisdn: Option<String>,
    raw_payload: Option<serde_json::Value>,
    actor_id: Option<Uuid>,
}

impl LoanLedger {
    /// Resolve a pending disbursement from its result callback.
    #[instrument(skip(self, result), fields(correlation_id = %result.correlation_id, result_code = result.result_code))]
    pub async fn handle_disbursement_result(
        &self,
        result: DisbursementResult,
    ) -> Result<CallbackOutcome, LedgerError> {
        if result.correlation_id.trim().is_empty() {
            return Err(LedgerError::Validation("correlation id is required".into()));
        }

        let mut tx = self.db.begin().await?;

        // The network echoes our idempotency key as the originator id, so a
        // callback that beats the correlation write still finds its event.
        let found = match event_store::find_by_correlation(
            &mut tx,
            PaymentEventKind::Disbursement,
            &result.correlation_id,
        )
        .await?
        {
            Some(event) => Some(event),
            None => {
                event_store::find_by_idempotency_key(
                    &mut tx,
                    PaymentEventKind::Disbursement,
                    &result.correlation_id,
                )
                .await?
            }
        };

        let Some(found) = found else {
            info!("No disbursement matches correlation id");
            return Ok(CallbackOutcome::Ignored);
        };
        let Some(loan_id) = found.loan_id else {
            return Err(LedgerError::ConsistencyViolation(format!(
                "disbursement event {} has no loan",
                found.event_id
            )));
        };

        let loan = loan_store::lock_loan(&mut tx, loan_id).await?;
        let event = event_store::lock_event(&mut tx, found.event_id).await?;
        if event.status.is_final() {
            info!(event_id = %event.event_id, status = %event.status, "Disbursement already finalized");
            return Ok(CallbackOutcome::Duplicate);
        }

        if result.result_code != 0 {
            event_store::finalize(
                &mut tx,
                event.event_id,
                &Finalization {
                    status: EventStatus::Failed,
                    receipt_ref: None,
                    result_code: Some(result.result_code),
                    result_desc: result.result_desc,
                    raw_payload: result.raw,
                },
            )
            .await?;
            commit(tx).await?;

            warn!(event_id = %event.event_id, loan_id = %loan_id, "Disbursement failed at the network");
            return Ok(CallbackOutcome::Rejected);
        }

        let event = event_store::finalize(
            &mut tx,
            event.event_id,
            &Finalization {
                status: EventStatus::Success,
                receipt_ref: result.external_transaction_id,
                result_code: Some(result.result_code),
                result_desc: result.result_desc,
                raw_payload: result.raw,
            },
        )
        .await?;

        finalize_disbursement(&mut tx, &event, &loan, Utc::now()).await?;

        let loan = loan_store::lock_loan(&mut tx, loan_id).await?;
        apply_reducer(&mut tx, &loan).await?;
        commit(tx).await?;

        info!(
            event_id = %event.event_id,
            loan_id = %loan_id,
            amount_cents = event.amount_cents.cents(),
            "Disbursement reconciled"
        );
        Ok(CallbackOutcome::Applied)
    }

    /// Apply a network collection. Duplicates by receipt are a no-op.
    #[instrument(skip(self, notice), fields(receipt_id = %notice.external_receipt_id, account_reference = %notice.account_reference))]
    pub async fn handle_collection(
        &self,
        notice: CollectionNotice,
    ) -> Result<CallbackOutcome, LedgerError> {
        let receipt = notice.external_receipt_id.trim();
        if receipt.is_empty() {
            return Err(LedgerError::Validation("receipt id is required".into()));
        }

        {
            let mut conn = self.db.pool().acquire().await?;
            if event_store::receipt_exists(&mut conn, PaymentEventKind::Collection, receipt).await? {
                info!("Collection already recorded");
                return Ok(CallbackOutcome::Duplicate);
            }
        }

        let amount = Money::parse_decimal(&notice.amount)?;
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "collection amount must be positive, got {}",
                amount
            )));
        }
        let loan_id = Uuid::parse_str(notice.account_reference.trim()).map_err(|_| {
            LedgerError::Validation(format!(
                "account reference '{}' is not a loan id",
                notice.account_reference
            ))
        })?;

        let input = RepaymentInput {
            loan_id,
            kind: PaymentEventKind::Collection,
            amount,
            receipt_ref: Some(receipt.to_string()),
            idempotency_key: None,
            msisdn: notice
                .payer_msisdn
                .map(|m| m.trim().to_string())
                .filter(|m| !m.is_empty()),
            raw_payload: Some(notice.raw),
            actor_id: None,
        };

        match self.apply_repayment(input).await {
            Ok(_) => Ok(CallbackOutcome::Applied),
            // Lost the insert race against a concurrent delivery of the same receipt.
            Err(LedgerError::DuplicateEvent(_)) => Ok(CallbackOutcome::Duplicate),
            Err(e) => Err(e),
        }
    }

    /// Record a repayment keyed in by staff. `reference`, when given, makes the call idempotent.
    #[instrument(skip(self), fields(amount_cents = amount.cents()))]
    pub async fn record_manual_repayment(
        &self,
        loan_id: Uuid,
        amount: Money,
        actor_id: Uuid,
        reference: Option<String>,
    ) -> Result<RepaymentReceipt, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "repayment amount must be positive, got {}",
                amount
            )));
        }

        let reference = reference
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        self.apply_repayment(RepaymentInput {
            loan_id,
            kind: PaymentEventKind::Manual,
            amount,
            receipt_ref: None,
            idempotency_key: reference,
            msisdn: None,
            raw_payload: None,
            actor_id: Some(actor_id),
        })
        .await
    }

    async fn apply_repayment(&self, input: RepaymentInput) -> Result<RepaymentReceipt, LedgerError> {
        let mut tx = self.db.begin().await?;

        let loan = loan_store::lock_loan(&mut tx, input.loan_id).await?;
        if !loan.status.accepts_repayment() {
            return Err(LedgerError::InvalidState {
                loan_id: loan.loan_id,
                expected: LoanStatus::Disbursed.as_str(),
                actual: loan.status,
            });
        }

        let event = event_store::insert_event(
            &mut tx,
            &NewPaymentEvent {
                loan_id: Some(loan.loan_id),
                kind: input.kind,
                amount: input.amount,
                status: EventStatus::Success,
                receipt_ref: input.receipt_ref,
                idempotency_key: input.idempotency_key,
                msisdn: input.msisdn,
                raw_payload: input.raw_payload,
                initiated_by: input.actor_id,
            },
        )
        .await?;

        let postings = ledger_store::postings_for_loan(&mut tx, loan.loan_id).await?;
        let owed = Outstanding::from_ledger(
            loan.principal_cents,
            loan.total_interest(),
            &LedgerSums::from_postings(&postings),
        );
        let allocation = allocate(owed, input.amount)?;

        ledger_store::insert_batch(
            &mut tx,
            &PostingBatch::repayment(loan.loan_id, event.event_id, &allocation),
        )
        .await?;

        apply_to_schedule(&mut tx, loan.loan_id, allocation.scheduled(), Utc::now()).await?;

        let financials = apply_reducer(&mut tx, &loan).await?;
        commit(tx).await?;

        info!(
            event_id = %event.event_id,
            loan_id = %loan.loan_id,
            kind = %input.kind,
            amount_cents = input.amount.cents(),
            interest_cents = allocation.interest.cents(),
            principal_cents = allocation.principal.cents(),
            overpayment_cents = allocation.overpayment.cents(),
            outstanding_cents = financials.outstanding.cents(),
            "Repayment applied"
        );

        Ok(RepaymentReceipt {
            event_id: event.event_id,
            loan_id: loan.loan_id,
            amount_cents: input.amount,
            allocation,
            financials,
        })
    }
}

/// Postings, status change and schedule for a successful disbursement.
async fn finalize_disbursement(
    conn: &mut PgConnection,
    event: &PaymentEvent,
    loan: &LoanAccount,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let loan_id = loan.loan_id;
    // Guards against two deliveries racing past the status check.
    if ledger_store::count_for_event(conn, event.event_id).await? == 0 {
        ledger_store::insert_batch(
            conn,
            &PostingBatch::disbursement(loan_id, event.event_id, event.amount_cents),
        )
        .await?;
    }

    let rows = if schedule_store::row_count(conn, loan_id).await? == 0 {
        let rows = project(ProjectionInput {
            loan_id,
            total_due: loan.total_due_cents,
            term: loan.term,
            cadence: loan.cadence,
            start: now.date_naive(),
        })?;
        schedule_store::insert_rows(conn, &rows).await?;
        rows
    } else {
        schedule_store::rows_for_loan(conn, loan_id, false).await?
    };

    let final_due = rows.last().map(|r| r.due_date);
    loan_store::mark_disbursed(conn, loan, event.event_id, now, final_due).await
}

/// Settle schedule rows with the interest and principal part of a repayment.
async fn apply_to_schedule(
    conn: &mut PgConnection,
    loan_id: Uuid,
    amount: Money,
    now: DateTime<Utc>,
) -> Result<(), LedgerError> {
    if !amount.is_positive() {
        return Ok(());
    }

    let rows = schedule_store::rows_for_loan(conn, loan_id, true).await?;
    let applied = apply(&rows, amount, now);
    schedule_store::update_payments(conn, &applied.changed).await?;

    if applied.unapplied.is_positive() {
        warn!(
            loan_id = %loan_id,
            unapplied_cents = applied.unapplied.cents(),
            "Repayment exceeded remaining schedule"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(CallbackOutcome::Applied.as_str(), "applied");
        assert_eq!(CallbackOutcome::Rejected.as_str(), "rejected");
        assert_eq!(CallbackOutcome::Duplicate.as_str(), "duplicate");
        assert_eq!(CallbackOutcome::Ignored.as_str(), "ignored");
    }
}
