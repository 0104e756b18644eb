//! Loan account persistence.
//!
//! Every function takes the caller's connection so it runs inside the caller's
//! transaction. Status changes always append to `loan_status_history`.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::engine::FinancialState;
use crate::error::LedgerError;
use crate::models::{LoanAccount, LoanStatus, LoanStatusChange, NewLoan};
use crate::services::metrics::DB_QUERY_DURATION;

const LOAN_COLUMNS: &str = "loan_id, borrower_msisdn, cadence, principal_cents, interest_rate_bps, \
     interest_model, term, total_due_cents, expected_installment_cents, total_paid_cents, \
     outstanding_cents, status, disbursed_utc, due_date, disbursement_event_id, created_by, \
     created_utc, updated_utc";

/// Insert a new loan in `initiated` with nothing paid.
#[instrument(skip(conn, input), fields(msisdn = %input.borrower_msisdn))]
pub async fn insert_loan(conn: &mut PgConnection, input: &NewLoan) -> Result<LoanAccount, LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_loan"])
        .start_timer();

    let terms = input.terms;
    let total_due = terms
        .total_due()
        .ok_or_else(|| LedgerError::Validation("total due overflows".into()))?;
    let installment = terms
        .expected_installment()
        .ok_or_else(|| LedgerError::Validation("term must be positive".into()))?;

    let loan_id = Uuid::new_v4();
    let sql = format!(
        r#"
        INSERT INTO loan_accounts (loan_id, borrower_msisdn, cadence, principal_cents, interest_rate_bps,
            interest_model, term, total_due_cents, expected_installment_cents, total_paid_cents,
            outstanding_cents, status, created_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $8, $10, $11)
        RETURNING {LOAN_COLUMNS}
        "#
    );
    let loan = sqlx::query_as::<_, LoanAccount>(&sql)
        .bind(loan_id)
        .bind(&input.borrower_msisdn)
        .bind(terms.cadence.as_str())
        .bind(terms.principal)
        .bind(terms.interest_rate_bps)
        .bind(terms.interest_model.as_str())
        .bind(terms.term)
        .bind(total_due)
        .bind(installment)
        .bind(LoanStatus::Initiated.as_str())
        .bind(input.created_by)
        .fetch_one(&mut *conn)
        .await
        .map_err(LedgerError::from_db)?;

    append_history(
        conn,
        loan_id,
        None,
        LoanStatus::Initiated,
        Some(input.created_by),
        "loan created",
    )
    .await?;

    timer.observe_duration();

    info!(loan_id = %loan.loan_id, total_due_cents = loan.total_due_cents.cents(), "Loan created");

    Ok(loan)
}

#[instrument(skip(conn))]
pub async fn get_loan(conn: &mut PgConnection, loan_id: Uuid) -> Result<Option<LoanAccount>, LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["get_loan"])
        .start_timer();

    let sql = format!("SELECT {LOAN_COLUMNS} FROM loan_accounts WHERE loan_id = $1");
    let loan = sqlx::query_as::<_, LoanAccount>(&sql)
        .bind(loan_id)
        .fetch_optional(&mut *conn)
        .await?;

    timer.observe_duration();
    Ok(loan)
}

/// Fetch and row-lock a loan for the rest of the transaction.
#[instrument(skip(conn))]
pub async fn lock_loan(conn: &mut PgConnection, loan_id: Uuid) -> Result<LoanAccount, LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["lock_loan"])
        .start_timer();

    let sql = format!("SELECT {LOAN_COLUMNS} FROM loan_accounts WHERE loan_id = $1 FOR UPDATE");
    let loan = sqlx::query_as::<_, LoanAccount>(&sql)
        .bind(loan_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(LedgerError::LoanNotFound(loan_id))?;

    timer.observe_duration();
    Ok(loan)
}

/// Move a locked loan along one lifecycle edge.
#[instrument(skip(conn, loan), fields(loan_id = %loan.loan_id, from = %loan.status, to = %to))]
pub async fn transition(
    conn: &mut PgConnection,
    loan: &LoanAccount,
    to: LoanStatus,
    actor_id: Option<Uuid>,
    reason: &str,
) -> Result<(), LedgerError> {
    if !loan.status.can_transition_to(to) {
        return Err(LedgerError::InvalidState {
            loan_id: loan.loan_id,
            expected: expected_source(to),
            actual: loan.status,
        });
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["transition_loan"])
        .start_timer();

    sqlx::query("UPDATE loan_accounts SET status = $2, updated_utc = NOW() WHERE loan_id = $1")
        .bind(loan.loan_id)
        .bind(to.as_str())
        .execute(&mut *conn)
        .await
        .map_err(LedgerError::from_db)?;

    append_history(conn, loan.loan_id, Some(loan.status), to, actor_id, reason).await?;

    timer.observe_duration();

    info!("Loan status changed");
    Ok(())
}

/// `disbursement_pending -> disbursed`, stamping the disbursement time and final due date.
#[instrument(skip(conn, loan), fields(loan_id = %loan.loan_id, event_id = %event_id))]
pub async fn mark_disbursed(
    conn: &mut PgConnection,
    loan: &LoanAccount,
    event_id: Uuid,
    disbursed_utc: DateTime<Utc>,
    due_date: Option<NaiveDate>,
) -> Result<(), LedgerError> {
    transition(conn, loan, LoanStatus::Disbursed, None, "disbursement confirmed").await?;

    sqlx::query(
        r#"
        UPDATE loan_accounts
        SET disbursed_utc = $2, due_date = $3, disbursement_event_id = $4, updated_utc = NOW()
        WHERE loan_id = $1
        "#,
    )
    .bind(loan.loan_id)
    .bind(disbursed_utc)
    .bind(due_date)
    .bind(event_id)
    .execute(&mut *conn)
    .await
    .map_err(LedgerError::from_db)?;

    Ok(())
}

/// Write reducer output. Nothing else writes `total_paid_cents` or `outstanding_cents`.
pub(crate) async fn write_financials(
    conn: &mut PgConnection,
    loan_id: Uuid,
    state: &FinancialState,
) -> Result<(), LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["write_financials"])
        .start_timer();

    sqlx::query(
        r#"
        UPDATE loan_accounts
        SET total_paid_cents = $2, outstanding_cents = $3, updated_utc = NOW()
        WHERE loan_id = $1
        "#,
    )
    .bind(loan_id)
    .bind(state.total_paid)
    .bind(state.outstanding)
    .execute(&mut *conn)
    .await
    .map_err(LedgerError::from_db)?;

    timer.observe_duration();
    Ok(())
}

#[instrument(skip(conn))]
pub async fn status_history(
    conn: &mut PgConnection,
    loan_id: Uuid,
) -> Result<Vec<LoanStatusChange>, LedgerError> {
    let history = sqlx::query_as::<_, LoanStatusChange>(
        r#"
        SELECT change_id, loan_id, from_status, to_status, actor_id, reason, changed_utc
        FROM loan_status_history
        WHERE loan_id = $1
        ORDER BY changed_utc, change_id
        "#,
    )
    .bind(loan_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(history)
}

async fn append_history(
    conn: &mut PgConnection,
    loan_id: Uuid,
    from: Option<LoanStatus>,
    to: LoanStatus,
    actor_id: Option<Uuid>,
    reason: &str,
) -> Result<(), LedgerError> {
    sqlx::query(
        r#"
        INSERT INTO loan_status_history (change_id, loan_id, from_status, to_status, actor_id, reason)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(loan_id)
    .bind(from.map(|s| s.as_str()))
    .bind(to.as_str())
    .bind(actor_id)
    .bind(reason)
    .execute(&mut *conn)
    .await
    .map_err(LedgerError::from_db)?;

    Ok(())
}

/// Status a loan must be in to move to `to`, for error messages.
fn expected_source(to: LoanStatus) -> &'static str {
    match to {
        LoanStatus::Initiated => "new",
        LoanStatus::Approved => "initiated",
        LoanStatus::DisbursementPending => "approved",
        LoanStatus::Disbursed => "disbursement_pending",
        LoanStatus::Repaid | LoanStatus::Defaulted => "disbursed",
        LoanStatus::Cancelled => "initiated or approved",
    }
}
