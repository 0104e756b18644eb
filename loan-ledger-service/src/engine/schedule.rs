//! Schedule projection and repayment application.

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{Cadence, Money, RepaymentScheduleRow, ScheduleStatus};

/// Inputs needed to lay out installments for a disbursed loan.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionInput {
    pub loan_id: Uuid,
    pub total_due: Money,
    pub term: i32,
    pub cadence: Cadence,
    pub start: NaiveDate,
}

/// Lay out `term` installments of floor(total_due / term). The final row also
/// carries the division remainder, so the rows always sum to `total_due`.
pub fn project(input: ProjectionInput) -> Result<Vec<RepaymentScheduleRow>, LedgerError> {
    let (share, remainder) = input.total_due.split_floor(input.term).ok_or_else(|| {
        LedgerError::Validation(format!("term must be positive, got {}", input.term))
    })?;

    let mut rows = Vec::with_capacity(input.term as usize);
    for n in 1..=input.term {
        let due_date = input
            .cadence
            .due_date(input.start, n as u32)
            .ok_or_else(|| {
                LedgerError::Validation(format!("installment {} due date out of range", n))
            })?;
        let amount = if n == input.term {
            share + remainder
        } else {
            share
        };
        rows.push(RepaymentScheduleRow {
            loan_id: input.loan_id,
            installment_no: n,
            due_date,
            amount_due_cents: amount,
            paid_cents: Money::ZERO,
            status: ScheduleStatus::Pending,
            paid_utc: None,
        });
    }

    let scheduled: Money = rows.iter().map(|r| r.amount_due_cents).sum();
    if scheduled != input.total_due {
        return Err(LedgerError::ConsistencyViolation(format!(
            "schedule for loan {} sums to {}, total due is {}",
            input.loan_id, scheduled, input.total_due
        )));
    }

    Ok(rows)
}

/// Result of applying an amount to a schedule.
#[derive(Debug, Default)]
pub struct Application {
    /// Rows whose paid amount changed, in installment order.
    pub changed: Vec<RepaymentScheduleRow>,
    /// Amount left after every row was settled.
    pub unapplied: Money,
}

/// Apply `amount` to the earliest unsettled rows. `rows` must be in installment order.
pub fn apply(rows: &[RepaymentScheduleRow], amount: Money, now: DateTime<Utc>) -> Application {
    let mut remaining = amount;
    let mut changed = Vec::new();

    for row in rows {
        if !remaining.is_positive() {
            break;
        }
        if row.is_settled() {
            continue;
        }

        let portion = remaining.min(row.remaining());
        remaining = remaining - portion;

        let mut updated = row.clone();
        updated.paid_cents += portion;
        if updated.is_settled() {
            updated.status = ScheduleStatus::Paid;
            updated.paid_utc = Some(now);
        }
        changed.push(updated);
    }

    Application {
        changed,
        unapplied: remaining,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weekly(total_due: i64, term: i32) -> Vec<RepaymentScheduleRow> {
        project(ProjectionInput {
            loan_id: Uuid::nil(),
            total_due: Money::from_cents(total_due),
            term,
            cadence: Cadence::Weekly,
            start: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
        })
        .unwrap()
    }

    /// Merge applied changes back, the way the store does.
    fn merge(rows: &mut [RepaymentScheduleRow], app: &Application) {
        for c in &app.changed {
            let slot = rows
                .iter_mut()
                .find(|r| r.installment_no == c.installment_no)
                .unwrap();
            *slot = c.clone();
        }
    }

    #[test]
    fn even_split_has_equal_rows_on_weekly_dates() {
        let rows = weekly(1_050_000, 4);
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.amount_due_cents == Money::from_cents(262_500)));
        assert_eq!(rows[0].due_date, NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());
        assert_eq!(rows[3].due_date, NaiveDate::from_ymd_opt(2026, 3, 30).unwrap());
        assert!(rows.iter().all(|r| r.status == ScheduleStatus::Pending));
    }

    #[test]
    fn remainder_lands_on_final_row() {
        let rows = weekly(1_000, 3);
        let amounts: Vec<i64> = rows.iter().map(|r| r.amount_due_cents.cents()).collect();
        assert_eq!(amounts, vec![333, 333, 334]);
        let total: Money = rows.iter().map(|r| r.amount_due_cents).sum();
        assert_eq!(total, Money::from_cents(1_000));
    }

    #[test]
    fn monthly_rows_step_by_calendar_month() {
        let rows = project(ProjectionInput {
            loan_id: Uuid::nil(),
            total_due: Money::from_cents(600),
            term: 3,
            cadence: Cadence::Monthly,
            start: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
        })
        .unwrap();
        let dates: Vec<NaiveDate> = rows.iter().map(|r| r.due_date).collect();
        assert_eq!(
            dates,
            vec![
                NaiveDate::from_ymd_opt(2026, 2, 15).unwrap(),
                NaiveDate::from_ymd_opt(2026, 3, 15).unwrap(),
                NaiveDate::from_ymd_opt(2026, 4, 15).unwrap(),
            ]
        );
    }

    #[test]
    fn zero_term_is_rejected() {
        let result = project(ProjectionInput {
            loan_id: Uuid::nil(),
            total_due: Money::from_cents(100),
            term: 0,
            cadence: Cadence::Weekly,
            start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
        });
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[test]
    fn payment_settles_rows_in_order() {
        let rows = weekly(1_050_000, 4);
        let app = apply(&rows, Money::from_cents(300_000), Utc::now());

        assert_eq!(app.unapplied, Money::ZERO);
        assert_eq!(app.changed.len(), 2);
        assert_eq!(app.changed[0].installment_no, 1);
        assert_eq!(app.changed[0].paid_cents, Money::from_cents(262_500));
        assert_eq!(app.changed[0].status, ScheduleStatus::Paid);
        assert!(app.changed[0].paid_utc.is_some());
        assert_eq!(app.changed[1].installment_no, 2);
        assert_eq!(app.changed[1].paid_cents, Money::from_cents(37_500));
        assert_eq!(app.changed[1].status, ScheduleStatus::Pending);
    }

    #[test]
    fn settled_rows_are_skipped() {
        let mut rows = weekly(1_050_000, 4);
        let first = apply(&rows, Money::from_cents(300_000), Utc::now());
        merge(&mut rows, &first);

        let second = apply(&rows, Money::from_cents(225_000), Utc::now());
        assert_eq!(second.changed.len(), 1);
        assert_eq!(second.changed[0].installment_no, 2);
        assert_eq!(second.changed[0].status, ScheduleStatus::Paid);
    }

    #[test]
    fn overdue_row_becomes_paid() {
        let mut rows = weekly(1_000, 2);
        rows[0].status = ScheduleStatus::Overdue;
        let app = apply(&rows, Money::from_cents(500), Utc::now());
        assert_eq!(app.changed[0].status, ScheduleStatus::Paid);
    }

    #[test]
    fn exhausting_total_due_pays_every_row() {
        let mut rows = weekly(1_000, 3);
        for chunk in [100, 450, 449, 1] {
            let app = apply(&rows, Money::from_cents(chunk), Utc::now());
            assert_eq!(app.unapplied, Money::ZERO);
            merge(&mut rows, &app);
        }
        assert!(rows.iter().all(|r| r.status == ScheduleStatus::Paid));
        assert!(rows.iter().all(|r| r.paid_cents <= r.amount_due_cents));

        let extra = apply(&rows, Money::from_cents(5), Utc::now());
        assert!(extra.changed.is_empty());
        assert_eq!(extra.unapplied, Money::from_cents(5));
    }
}
