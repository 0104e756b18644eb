//! Append-only posting store.

use sqlx::PgConnection;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{LedgerPosting, PostingBatch};
use crate::services::metrics::{DB_QUERY_DURATION, POSTED_CENTS_TOTAL, POSTINGS_TOTAL};

const POSTING_COLUMNS: &str =
    "posting_id, seq, loan_id, event_id, account, direction, amount_cents, posting_type, posted_utc";

/// Number of postings already written for an event.
#[instrument(skip(conn))]
pub async fn count_for_event(conn: &mut PgConnection, event_id: Uuid) -> Result<i64, LedgerError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ledger_postings WHERE event_id = $1")
        .bind(event_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count)
}

/// Write a balanced batch. The batch is validated before any row is inserted,
/// and the deferred balance trigger checks it again at commit.
#[instrument(skip(conn, batch), fields(loan_id = %batch.loan_id, event_id = %batch.event_id, lines = batch.lines.len()))]
pub async fn insert_batch(
    conn: &mut PgConnection,
    batch: &PostingBatch,
) -> Result<Vec<LedgerPosting>, LedgerError> {
    batch.validate()?;

    let timer = DB_QUERY_DURATION
        .with_label_values(&["insert_postings"])
        .start_timer();

    let sql = format!(
        r#"
        INSERT INTO ledger_postings (posting_id, loan_id, event_id, account, direction, amount_cents, posting_type)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {POSTING_COLUMNS}
        "#
    );

    let mut inserted = Vec::with_capacity(batch.lines.len());
    for line in &batch.lines {
        let posting = sqlx::query_as::<_, LedgerPosting>(&sql)
            .bind(Uuid::new_v4())
            .bind(batch.loan_id)
            .bind(batch.event_id)
            .bind(line.account.as_str())
            .bind(line.direction.as_str())
            .bind(line.amount)
            .bind(batch.posting_type.as_str())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                LedgerError::from_insert(e, || {
                    LedgerError::DuplicateEvent(format!("postings for event {}", batch.event_id))
                })
            })?;
        inserted.push(posting);
    }

    timer.observe_duration();

    let label = batch.posting_type.as_str();
    POSTINGS_TOTAL
        .with_label_values(&[label])
        .inc_by(inserted.len() as f64);
    POSTED_CENTS_TOTAL
        .with_label_values(&[label])
        .inc_by(batch.total_debits().cents() as f64);

    info!(
        posting_type = label,
        amount_cents = batch.total_debits().cents(),
        "Postings written"
    );

    Ok(inserted)
}

/// All postings for a loan in posting order.
#[instrument(skip(conn))]
pub async fn postings_for_loan(
    conn: &mut PgConnection,
    loan_id: Uuid,
) -> Result<Vec<LedgerPosting>, LedgerError> {
    let timer = DB_QUERY_DURATION
        .with_label_values(&["postings_for_loan"])
        .start_timer();

    let sql = format!("SELECT {POSTING_COLUMNS} FROM ledger_postings WHERE loan_id = $1 ORDER BY seq");
    let postings = sqlx::query_as::<_, LedgerPosting>(&sql)
        .bind(loan_id)
        .fetch_all(&mut *conn)
        .await?;

    timer.observe_duration();
    Ok(postings)
}

/// Events of a loan whose postings do not balance. Empty unless something bypassed the store.
#[instrument(skip(conn))]
pub async fn unbalanced_events(
    conn: &mut PgConnection,
    loan_id: Uuid,
) -> Result<Vec<Uuid>, LedgerError> {
    let events: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT event_id
        FROM ledger_postings
        WHERE loan_id = $1
        GROUP BY event_id
        HAVING COALESCE(SUM(amount_cents) FILTER (WHERE direction = 'debit'), 0)::BIGINT
            <> COALESCE(SUM(amount_cents) FILTER (WHERE direction = 'credit'), 0)::BIGINT
        "#,
    )
    .bind(loan_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(events)
}
