//! Repayment schedule persistence.

use chrono::NaiveDate;
use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{RepaymentScheduleRow, ScheduleStatus};
use crate::services::metrics::DB_QUERY_DURATION;

const ROW_COLUMNS: &str =
    "loan_id, installment_no, due_date, amount_due_cents, paid_cents, status, paid_utc";

#[instrument(skip(conn))]
pub async fn row_count(conn: &mut PgConnection, loan_id: Uuid) -> Result<i64, LedgerError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM repayment_schedule WHERE loan_id = $1")
            .bind(loan_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count)
}

#[instrument(skip(conn, rows), fields(rows = rows.len()))]
pub async fn insert_rows(
    conn: &mut PgConnection,
    rows: &[RepaymentScheduleRow],
) -> Result<(), LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_schedule"])
        .start_timer();

    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO repayment_schedule (loan_id, installment_no, due_date, amount_due_cents, paid_cents, status)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.loan_id)
        .bind(row.installment_no)
        .bind(row.due_date)
        .bind(row.amount_due_cents)
        .bind(row.paid_cents)
        .bind(row.status.as_str())
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            LedgerError::from_insert(e, || {
                LedgerError::ConsistencyViolation(format!(
                    "schedule row {} already exists for loan {}",
                    row.installment_no, row.loan_id
                ))
            })
        })?;
    }

    timer.observe_duration();
    Ok(())
}

/// Rows in installment order. `lock` holds them for the rest of the transaction.
#[instrument(skip(conn))]
pub async fn rows_for_loan(
    conn: &mut PgConnection,
    loan_id: Uuid,
    lock: bool,
) -> Result<Vec<RepaymentScheduleRow>, LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["schedule_for_loan"])
        .start_timer();

    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM repayment_schedule WHERE loan_id = $1 ORDER BY installment_no{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let rows = sqlx::query_as::<_, RepaymentScheduleRow>(&sql)
        .bind(loan_id)
        .fetch_all(&mut *conn)
        .await?;

    timer.observe_duration();
    Ok(rows)
}

/// Persist the paid amount and status of rows changed by the applier.
#[instrument(skip(conn, rows), fields(rows = rows.len()))]
pub async fn update_payments(
    conn: &mut PgConnection,
    rows: &[RepaymentScheduleRow],
) -> Result<(), LedgerError> {
    for row in rows {
        sqlx::query(
            r#"
            UPDATE repayment_schedule
            SET paid_cents = $3, status = $4, paid_utc = $5
            WHERE loan_id = $1 AND installment_no = $2
            "#,
        )
        .bind(row.loan_id)
        .bind(row.installment_no)
        .bind(row.paid_cents)
        .bind(row.status.as_str())
        .bind(row.paid_utc)
        .execute(&mut *conn)
        .await
        .map_err(LedgerError::from_db)?;
    }
    Ok(())
}

/// Flag unpaid pending rows of disbursed loans that are past due. Returns rows changed.
#[instrument(skip(conn))]
pub async fn mark_overdue(conn: &mut PgConnection, today: NaiveDate) -> Result<u64, LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["mark_overdue"])
        .start_timer();

    let result = sqlx::query(
        r#"
        UPDATE repayment_schedule rs
        SET status = 'overdue'
        FROM loan_accounts la
        WHERE la.loan_id = rs.loan_id
          AND la.status = 'disbursed'
          AND rs.status = 'pending'
          AND rs.due_date < $1
          AND rs.paid_cents < rs.amount_due_cents
        "#,
    )
    .bind(today)
    .execute(&mut *conn)
    .await
    .map_err(LedgerError::from_db)?;

    timer.observe_duration();

    if result.rows_affected() > 0 {
        info!(rows = result.rows_affected(), "Schedule rows marked overdue");
    }
    Ok(result.rows_affected())
}

/// Disbursed loans with an overdue row due on or before the cadence's cutoff.
#[instrument(skip(conn))]
pub async fn default_candidates(
    conn: &mut PgConnection,
    weekly_cutoff: NaiveDate,
    monthly_cutoff: NaiveDate,
) -> Result<Vec<Uuid>, LedgerError> {
    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT la.loan_id
        FROM loan_accounts la
        JOIN repayment_schedule rs ON rs.loan_id = la.loan_id
        WHERE la.status = 'disbursed'
          AND rs.status = 'overdue'
          AND rs.due_date <= CASE la.cadence WHEN 'weekly' THEN $1::DATE ELSE $2::DATE END
        ORDER BY la.loan_id
        "#,
    )
    .bind(weekly_cutoff)
    .bind(monthly_cutoff)
    .fetch_all(&mut *conn)
    .await?;

    Ok(ids)
}

/// Whether the loan still has an overdue row due on or before `cutoff`.
///
/// Re-checked under the loan lock, since a repayment may have settled the rows
/// after the loan was picked as a default candidate.
#[instrument(skip(conn))]
pub async fn has_overdue_on_or_before(
    conn: &mut PgConnection,
    loan_id: Uuid,
    cutoff: NaiveDate,
) -> Result<bool, LedgerError> {
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT 1
            FROM repayment_schedule
            WHERE loan_id = $1
              AND status = 'overdue'
              AND paid_cents < amount_due_cents
              AND due_date <= $2
        )
        "#,
    )
    .bind(loan_id)
    .bind(cutoff)
    .fetch_one(&mut *conn)
    .await?;

    Ok(exists)
}

/// Close out the unpaid rows of a defaulted loan.
#[instrument(skip(conn))]
pub async fn mark_unpaid_defaulted(conn: &mut PgConnection, loan_id: Uuid) -> Result<u64, LedgerError> {
    let result = sqlx::query(
        r#"
        UPDATE repayment_schedule
        SET status = $2
        WHERE loan_id = $1 AND status IN ('pending', 'overdue')
        "#,
    )
    .bind(loan_id)
    .bind(ScheduleStatus::Defaulted.as_str())
    .execute(&mut *conn)
    .await
    .map_err(LedgerError::from_db)?;

    Ok(result.rows_affected())
}
