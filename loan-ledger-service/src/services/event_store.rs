//! Payment event persistence.
//!
//! Unique indexes on (kind, receipt_ref), (kind, idempotency_key),
//! (kind, correlation_ref) and one disbursement per loan are the dedup
//! mechanism; a violation on insert surfaces as `DuplicateEvent`.

use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{EventStatus, NewPaymentEvent, PaymentEvent, PaymentEventKind};
use crate::services::metrics::DB_QUERY_DURATION;

const EVENT_COLUMNS: &str = "event_id, loan_id, kind, direction, amount_cents, status, \
     correlation_ref, receipt_ref, idempotency_key, msisdn, result_code, result_desc, \
     raw_payload, initiated_by, created_utc, finalized_utc";

/// Outcome written when a pending event is finalized.
#[derive(Debug, Clone)]
pub struct Finalization {
    pub status: EventStatus,
    pub receipt_ref: Option<String>,
    pub result_code: Option<i32>,
    pub result_desc: Option<String>,
    pub raw_payload: serde_json::Value,
}

#[instrument(skip(conn, input), fields(kind = %input.kind, loan_id = ?input.loan_id, amount_cents = input.amount.cents()))]
pub async fn insert_event(
    conn: &mut PgConnection,
    input: &NewPaymentEvent,
) -> Result<PaymentEvent, LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_event"])
        .start_timer();

    let event_id = Uuid::new_v4();
    let dedup_key = input
        .receipt_ref
        .clone()
        .or_else(|| input.idempotency_key.clone())
        .unwrap_or_else(|| event_id.to_string());

    let sql = format!(
        r#"
        INSERT INTO payment_events (event_id, loan_id, kind, direction, amount_cents, status,
            receipt_ref, idempotency_key, msisdn, raw_payload, initiated_by, finalized_utc)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
            CASE WHEN $6 = 'pending' THEN NULL ELSE NOW() END)
        RETURNING {EVENT_COLUMNS}
        "#
    );
    let event = sqlx::query_as::<_, PaymentEvent>(&sql)
        .bind(event_id)
        .bind(input.loan_id)
        .bind(input.kind.as_str())
        .bind(input.kind.direction().as_str())
        .bind(input.amount)
        .bind(input.status.as_str())
        .bind(&input.receipt_ref)
        .bind(&input.idempotency_key)
        .bind(&input.msisdn)
        .bind(&input.raw_payload)
        .bind(input.initiated_by)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| LedgerError::from_insert(e, || LedgerError::DuplicateEvent(dedup_key)))?;

    timer.observe_duration();

    info!(event_id = %event.event_id, status = %event.status, "Payment event recorded");
    Ok(event)
}

/// Find the event a callback refers to. Not locked; callers lock the loan first.
#[instrument(skip(conn))]
pub async fn find_by_correlation(
    conn: &mut PgConnection,
    kind: PaymentEventKind,
    correlation_ref: &str,
) -> Result<Option<PaymentEvent>, LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["find_event_by_correlation"])
        .start_timer();

    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM payment_events WHERE kind = $1 AND correlation_ref = $2"
    );
    let event = sqlx::query_as::<_, PaymentEvent>(&sql)
        .bind(kind.as_str())
        .bind(correlation_ref)
        .fetch_optional(&mut *conn)
        .await?;

    timer.observe_duration();
    Ok(event)
}

/// Re-read and row-lock an event for the rest of the transaction.
#[instrument(skip(conn))]
pub async fn lock_event(conn: &mut PgConnection, event_id: Uuid) -> Result<PaymentEvent, LedgerError> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM payment_events WHERE event_id = $1 FOR UPDATE");
    sqlx::query_as::<_, PaymentEvent>(&sql)
        .bind(event_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| LedgerError::EventNotFound(event_id.to_string()))
}

/// Cheap existence check ahead of any inbound processing.
#[instrument(skip(conn))]
pub async fn receipt_exists(
    conn: &mut PgConnection,
    kind: PaymentEventKind,
    receipt_ref: &str,
) -> Result<bool, LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["receipt_exists"])
        .start_timer();

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM payment_events WHERE kind = $1 AND receipt_ref = $2)",
    )
    .bind(kind.as_str())
    .bind(receipt_ref)
    .fetch_one(&mut *conn)
    .await?;

    timer.observe_duration();
    Ok(exists)
}

#[instrument(skip(conn))]
pub async fn find_by_idempotency_key(
    conn: &mut PgConnection,
    kind: PaymentEventKind,
    key: &str,
) -> Result<Option<PaymentEvent>, LedgerError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM payment_events WHERE kind = $1 AND idempotency_key = $2"
    );
    Ok(sqlx::query_as::<_, PaymentEvent>(&sql)
        .bind(kind.as_str())
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?)
}

/// The loan's disbursement event, if one was ever created.
#[instrument(skip(conn))]
pub async fn disbursement_for_loan(
    conn: &mut PgConnection,
    loan_id: Uuid,
) -> Result<Option<PaymentEvent>, LedgerError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM payment_events WHERE loan_id = $1 AND kind = 'disbursement'"
    );
    Ok(sqlx::query_as::<_, PaymentEvent>(&sql)
        .bind(loan_id)
        .fetch_optional(&mut *conn)
        .await?)
}

/// Attach the gateway's correlation reference. Only a pending event without one is updated.
#[instrument(skip(conn))]
pub async fn set_correlation(
    conn: &mut PgConnection,
    event_id: Uuid,
    correlation_ref: &str,
) -> Result<bool, LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["set_correlation"])
        .start_timer();

    let result = sqlx::query(
        r#"
        UPDATE payment_events
        SET correlation_ref = $2
        WHERE event_id = $1 AND status = 'pending' AND correlation_ref IS NULL
        "#,
    )
    .bind(event_id)
    .bind(correlation_ref)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        LedgerError::from_insert(e, || {
            LedgerError::DuplicateEvent(format!("correlation {}", correlation_ref))
        })
    })?;

    timer.observe_duration();
    Ok(result.rows_affected() == 1)
}

/// Move a pending event to its final status exactly once.
#[instrument(skip(conn, outcome), fields(status = %outcome.status))]
pub async fn finalize(
    conn: &mut PgConnection,
    event_id: Uuid,
    outcome: &Finalization,
) -> Result<PaymentEvent, LedgerError> {
    if !outcome.status.is_final() {
        return Err(LedgerError::Validation(
            "an event can only be finalized as success or failed".into(),
        ));
    }

    let timer = DB_QUERY_DURATION
        .with_label_values(&["finalize_event"])
        .start_timer();

    let sql = format!(
        r#"
        UPDATE payment_events
        SET status = $2, receipt_ref = COALESCE($3, receipt_ref), result_code = $4,
            result_desc = $5, raw_payload = $6, finalized_utc = NOW()
        WHERE event_id = $1 AND status = 'pending'
        RETURNING {EVENT_COLUMNS}
        "#
    );
    let event = sqlx::query_as::<_, PaymentEvent>(&sql)
        .bind(event_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.receipt_ref)
        .bind(outcome.result_code)
        .bind(&outcome.result_desc)
        .bind(&outcome.raw_payload)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| {
            LedgerError::from_insert(e, || {
                LedgerError::DuplicateEvent(outcome.receipt_ref.clone().unwrap_or_default())
            })
        })?
        .ok_or(LedgerError::AlreadyFinalized(event_id))?;

    timer.observe_duration();

    info!(event_id = %event_id, "Payment event finalized");
    Ok(event)
}

#[instrument(skip(conn))]
pub async fn events_for_loan(
    conn: &mut PgConnection,
    loan_id: Uuid,
) -> Result<Vec<PaymentEvent>, LedgerError> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM payment_events WHERE loan_id = $1 ORDER BY created_utc, event_id"
    );
    Ok(sqlx::query_as::<_, PaymentEvent>(&sql)
        .bind(loan_id)
        .fetch_all(&mut *conn)
        .await?)
}
