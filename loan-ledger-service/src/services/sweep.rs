//! Overdue sweep: flags late installments and defaults loans past their grace period.

use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::models::{Cadence, LoanStatus};
use crate::services::database::commit;
use crate::services::ledger::LoanLedger;
use crate::services::metrics::SWEEP_TOTAL;
use crate::services::{loan_store, schedule_store};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub rows_overdue: u64,
    pub loans_defaulted: u64,
    pub errors: u64,
}

impl LoanLedger {
    /// Run one sweep as of `today`.
    ///
    /// Each default is its own transaction; a failure on one loan is counted and
    /// the sweep moves on.
    #[instrument(skip(self))]
    pub async fn run_sweep(&self, today: NaiveDate) -> Result<SweepReport, LedgerError> {
        let mut report = SweepReport::default();

        let mut tx = self.db.begin().await?;
        report.rows_overdue = schedule_store::mark_overdue(&mut tx, today).await?;
        commit(tx).await?;

        let cutoffs = GraceCutoffs {
            weekly: grace_cutoff(today, self.policy.grace_days_weekly),
            monthly: grace_cutoff(today, self.policy.grace_days_monthly),
        };

        let candidates = {
            let mut conn = self.db.pool().acquire().await?;
            schedule_store::default_candidates(&mut conn, cutoffs.weekly, cutoffs.monthly).await?
        };

        for loan_id in candidates {
            match self.default_loan(loan_id, &cutoffs).await {
                Ok(true) => report.loans_defaulted += 1,
                Ok(false) => {}
                Err(e) => {
                    report.errors += 1;
                    error!(loan_id = %loan_id, error = %e, "Failed to default loan");
                }
            }
        }

        SWEEP_TOTAL
            .with_label_values(&["rows_overdue"])
            .inc_by(report.rows_overdue as f64);
        SWEEP_TOTAL
            .with_label_values(&["loans_defaulted"])
            .inc_by(report.loans_defaulted as f64);
        SWEEP_TOTAL
            .with_label_values(&["errors"])
            .inc_by(report.errors as f64);

        info!(
            rows_overdue = report.rows_overdue,
            loans_defaulted = report.loans_defaulted,
            errors = report.errors,
            "Overdue sweep finished"
        );
        Ok(report)
    }

    /// Returns false when the loan changed state or caught up since it was selected.
    async fn default_loan(
        &self,
        loan_id: Uuid,
        cutoffs: &GraceCutoffs,
    ) -> Result<bool, LedgerError> {
        let mut tx = self.db.begin().await?;
        let loan = loan_store::lock_loan(&mut tx, loan_id).await?;
        if loan.status != LoanStatus::Disbursed {
            return Ok(false);
        }

        let cutoff = cutoffs.for_cadence(loan.cadence);
        if !schedule_store::has_overdue_on_or_before(&mut tx, loan_id, cutoff).await? {
            info!(loan_id = %loan_id, "Loan caught up before default; skipped");
            return Ok(false);
        }

        let reason = format!("overdue beyond {} grace period", loan.cadence.as_str());
        loan_store::transition(&mut tx, &loan, LoanStatus::Defaulted, None, &reason).await?;
        let rows = schedule_store::mark_unpaid_defaulted(&mut tx, loan_id).await?;
        commit(tx).await?;

        warn!(
            loan_id = %loan_id,
            outstanding_cents = loan.outstanding_cents.cents(),
            rows_defaulted = rows,
            "Loan defaulted"
        );
        Ok(true)
    }
}

/// Start the periodic sweep. Returns `None` when the interval is zero.
pub fn spawn_sweeper(ledger: LoanLedger) -> Option<JoinHandle<()>> {
    let seconds = ledger.policy.sweep_interval_seconds;
    if seconds == 0 {
        info!("Overdue sweep disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = ledger.run_sweep(Utc::now().date_naive()).await {
                error!(error = %e, "Overdue sweep failed");
            }
        }
    }))
}

/// Latest due date, per cadence, of an overdue row that is past its grace period.
#[derive(Debug, Clone, Copy)]
struct GraceCutoffs {
    weekly: NaiveDate,
    monthly: NaiveDate,
}

impl GraceCutoffs {
    fn for_cadence(&self, cadence: Cadence) -> NaiveDate {
        match cadence {
            Cadence::Weekly => self.weekly,
            Cadence::Monthly => self.monthly,
        }
    }
}

/// Overdue rows due on or before this date are past the grace period.
fn grace_cutoff(today: NaiveDate, grace_days: i64) -> NaiveDate {
    today
        .checked_sub_days(Days::new(grace_days.max(0) as u64))
        .unwrap_or(NaiveDate::MIN)
}
