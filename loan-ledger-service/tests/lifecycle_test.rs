//! Loan lifecycle and disbursement initiation integration tests.
//!
//! Run with: TEST_DATABASE_URL=postgres://... cargo test -p loan-ledger-service -- --ignored

mod common;

use std::time::Duration;

use chrono::{Days, NaiveDate, Utc};
use common::{
    approved_loan, disbursed_loan, spawn_ledger, standard_application, success_result,
};
use loan_ledger_service::engine;
use loan_ledger_service::error::LedgerError;
use loan_ledger_service::models::{
    Cadence, EventStatus, LoanAccount, LoanStatus, Money, PaymentEventKind, ScheduleStatus,
};
use loan_ledger_service::services::{
    loan_store, schedule_store, CallbackOutcome, DisbursementResult, LoanApplication, LoanLedger,
};
use serde_json::json;
use serial_test::serial;
use uuid::Uuid;

#[tokio::test]
#[ignore]
#[serial]
async fn create_loan_fixes_total_due_and_normalizes_msisdn() {
    let t = spawn_ledger().await;

    let loan = t
        .ledger
        .create_loan(standard_application(), Uuid::new_v4())
        .await
        .unwrap();

    assert_eq!(loan.status, LoanStatus::Initiated);
    assert_eq!(loan.borrower_msisdn, "254712345678");
    assert_eq!(loan.total_due_cents, Money::from_cents(1_050_000));
    assert_eq!(loan.expected_installment_cents, Money::from_cents(262_500));
    assert_eq!(loan.total_paid_cents, Money::ZERO);
    assert_eq!(loan.outstanding_cents, loan.total_due_cents);

    let history = t.ledger.get_loan_history(loan.loan_id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].to_status, "initiated");
    assert!(history[0].from_status.is_none());
}

#[tokio::test]
#[ignore]
#[serial]
async fn creator_cannot_approve_their_own_loan() {
    let t = spawn_ledger().await;
    let maker = Uuid::new_v4();
    let loan = t.ledger.create_loan(standard_application(), maker).await.unwrap();

    let err = t.ledger.approve_loan(loan.loan_id, maker).await.unwrap_err();
    assert!(matches!(err, LedgerError::ApprovalConflict(_)));

    let approved = t.ledger.approve_loan(loan.loan_id, Uuid::new_v4()).await.unwrap();
    assert_eq!(approved.status, LoanStatus::Approved);
}

#[tokio::test]
#[ignore]
#[serial]
async fn disbursement_requires_an_approved_loan() {
    let t = spawn_ledger().await;
    let loan = t
        .ledger
        .create_loan(standard_application(), Uuid::new_v4())
        .await
        .unwrap();

    let err = t
        .ledger
        .initiate_disbursement(loan.loan_id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::InvalidState {
            actual: LoanStatus::Initiated,
            ..
        }
    ));
    assert_eq!(t.gateway.sent_count(), 0);
}

#[tokio::test]
#[ignore]
#[serial]
async fn second_initiation_is_rejected() {
    let t = spawn_ledger().await;
    let loan = approved_loan(&t.ledger, standard_application()).await;

    let first = t
        .ledger
        .initiate_disbursement(loan.loan_id, Uuid::new_v4())
        .await
        .unwrap();
    assert!(!first.resumed);

    let err = t
        .ledger
        .initiate_disbursement(loan.loan_id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyInitiated(_)));
    assert_eq!(t.gateway.sent_count(), 1);
}

#[tokio::test]
#[ignore]
#[serial]
async fn initiation_resumes_after_gateway_failure() {
    let t = spawn_ledger().await;
    let loan = approved_loan(&t.ledger, standard_application()).await;

    t.gateway.fail_next(1);
    let err = t
        .ledger
        .initiate_disbursement(loan.loan_id, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Gateway(_)));
    assert!(err.is_retryable());

    let events = t.ledger.get_loan_events(loan.loan_id).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, EventStatus::Pending);
    assert!(events[0].correlation_ref.is_none());

    let retry = t
        .ledger
        .initiate_disbursement(loan.loan_id, Uuid::new_v4())
        .await
        .unwrap();
    assert!(retry.resumed);
    assert_eq!(retry.event_id, events[0].event_id);

    let sent = t.gateway.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].idempotency_key, sent[1].idempotency_key);
}

#[tokio::test]
#[ignore]
#[serial]
async fn cancel_is_refused_once_disbursement_exists() {
    let t = spawn_ledger().await;

    let loan = approved_loan(&t.ledger, standard_application()).await;
    let cancelled = t
        .ledger
        .cancel_loan(loan.loan_id, Uuid::new_v4(), Some("client withdrew".into()))
        .await
        .unwrap();
    assert_eq!(cancelled.status, LoanStatus::Cancelled);

    let loan = approved_loan(&t.ledger, standard_application()).await;
    t.gateway.fail_next(1);
    let _ = t
        .ledger
        .initiate_disbursement(loan.loan_id, Uuid::new_v4())
        .await;

    let err = t
        .ledger
        .cancel_loan(loan.loan_id, Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyInitiated(_)));
}

#[tokio::test]
#[ignore]
#[serial]
async fn successful_disbursement_posts_and_projects_schedule() {
    let t = spawn_ledger().await;
    let loan = disbursed_loan(&t.ledger, standard_application()).await;

    assert_eq!(loan.status, LoanStatus::Disbursed);
    assert!(loan.disbursed_utc.is_some());

    let financials = t.ledger.get_loan_financials(loan.loan_id).await.unwrap();
    assert_eq!(financials.schedule.len(), 4);
    let scheduled: Money = financials.schedule.iter().map(|r| r.amount_due_cents).sum();
    assert_eq!(scheduled, loan.total_due_cents);
    assert!(financials
        .schedule
        .iter()
        .all(|r| r.status == ScheduleStatus::Pending && r.paid_cents == Money::ZERO));
    assert_eq!(loan.due_date, Some(financials.schedule[3].due_date));

    let postings = t.ledger.get_loan_postings(loan.loan_id).await.unwrap();
    assert_eq!(postings.len(), 2);
    assert!(postings
        .iter()
        .all(|p| p.amount_cents == Money::from_cents(1_000_000)));
}

#[tokio::test]
#[ignore]
#[serial]
async fn failed_disbursement_leaves_loan_pending_without_postings() {
    let t = spawn_ledger().await;
    let loan = approved_loan(&t.ledger, standard_application()).await;
    let initiated = t
        .ledger
        .initiate_disbursement(loan.loan_id, Uuid::new_v4())
        .await
        .unwrap();
    let correlation = initiated.correlation_ref.unwrap();

    let outcome = t
        .ledger
        .handle_disbursement_result(DisbursementResult {
            result_code: 2001,
            correlation_id: correlation.clone(),
            external_transaction_id: None,
            result_desc: Some("The initiator information is invalid.".into()),
            raw: json!({ "Result": { "ResultCode": 2001 } }),
        })
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Rejected);

    let financials = t.ledger.get_loan_financials(loan.loan_id).await.unwrap();
    assert_eq!(financials.status, LoanStatus::DisbursementPending);
    assert!(financials.schedule.is_empty());
    assert!(t.ledger.get_loan_postings(loan.loan_id).await.unwrap().is_empty());

    let events = t.ledger.get_loan_events(loan.loan_id).await.unwrap();
    assert_eq!(events[0].kind, PaymentEventKind::Disbursement);
    assert_eq!(events[0].status, EventStatus::Failed);
    assert_eq!(events[0].result_code, Some(2001));

    // A late success for the same event changes nothing.
    let replay = t
        .ledger
        .handle_disbursement_result(success_result(&correlation))
        .await
        .unwrap();
    assert_eq!(replay, CallbackOutcome::Duplicate);
    assert!(t.ledger.get_loan_postings(loan.loan_id).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
#[serial]
async fn sweep_marks_overdue_and_defaults_past_grace() {
    let t = spawn_ledger().await;
    let loan = disbursed_loan(&t.ledger, standard_application()).await;

    // Last installment is 4 weeks out; 60 days later all rows are past the 14 day grace.
    let today = Utc::now()
        .date_naive()
        .checked_add_days(Days::new(28 + 60))
        .unwrap();
    let report = t.ledger.run_sweep(today).await.unwrap();
    assert!(report.rows_overdue >= 4);
    assert!(report.loans_defaulted >= 1);
    assert_eq!(report.errors, 0);

    let financials = t.ledger.get_loan_financials(loan.loan_id).await.unwrap();
    assert_eq!(financials.status, LoanStatus::Defaulted);
    assert!(financials
        .schedule
        .iter()
        .all(|r| r.status == ScheduleStatus::Defaulted));

    // Defaulted loans take no more repayments.
    let err = t
        .ledger
        .record_manual_repayment(loan.loan_id, Money::from_cents(10_000), Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidState { .. }));
}

fn days_after(date: NaiveDate, days: u64) -> NaiveDate {
    date.checked_add_days(Days::new(days)).unwrap()
}

fn disbursement_date(loan: &LoanAccount) -> NaiveDate {
    loan.disbursed_utc.unwrap().date_naive()
}

#[tokio::test]
#[ignore]
#[serial]
async fn sweep_leaves_loan_within_grace_disbursed() {
    let t = spawn_ledger().await;
    let loan = disbursed_loan(&t.ledger, standard_application()).await;

    // First installment is 10 days late, inside the 14 day weekly grace.
    let today = days_after(disbursement_date(&loan), 7 + 10);
    t.ledger.run_sweep(today).await.unwrap();

    let financials = t.ledger.get_loan_financials(loan.loan_id).await.unwrap();
    assert_eq!(financials.status, LoanStatus::Disbursed);
    assert_eq!(financials.schedule[0].status, ScheduleStatus::Overdue);
    assert_eq!(financials.schedule[2].status, ScheduleStatus::Pending);
}

#[tokio::test]
#[ignore]
#[serial]
async fn sweep_applies_grace_by_cadence() {
    let t = spawn_ledger().await;
    let weekly = disbursed_loan(&t.ledger, standard_application()).await;
    let monthly = disbursed_loan(
        &t.ledger,
        LoanApplication {
            term: 2,
            cadence: Cadence::Monthly,
            ..standard_application()
        },
    )
    .await;

    let schedule = t.ledger.get_loan_financials(monthly.loan_id).await.unwrap().schedule;
    let first_monthly_due = schedule[0].due_date;

    // 29 days late: past the weekly grace, one day short of the monthly one.
    t.ledger
        .run_sweep(days_after(first_monthly_due, 29))
        .await
        .unwrap();
    let weekly_state = t.ledger.get_loan_financials(weekly.loan_id).await.unwrap();
    let monthly_state = t.ledger.get_loan_financials(monthly.loan_id).await.unwrap();
    assert_eq!(weekly_state.status, LoanStatus::Defaulted);
    assert_eq!(monthly_state.status, LoanStatus::Disbursed);
    assert_eq!(monthly_state.schedule[0].status, ScheduleStatus::Overdue);

    // Exactly the grace period late is enough to default.
    t.ledger
        .run_sweep(days_after(first_monthly_due, 30))
        .await
        .unwrap();
    let monthly_state = t.ledger.get_loan_financials(monthly.loan_id).await.unwrap();
    assert_eq!(monthly_state.status, LoanStatus::Defaulted);
}

async fn wait_for_lock_waiter(ledger: &LoanLedger) {
    for _ in 0..100 {
        let waiting: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_locks WHERE NOT granted)")
                .fetch_one(ledger.db().pool())
                .await
                .unwrap();
        if waiting {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("sweep never waited on the loan lock");
}

#[tokio::test]
#[ignore]
#[serial]
async fn sweep_skips_loan_that_caught_up_while_it_waited() {
    let t = spawn_ledger().await;
    let loan = disbursed_loan(&t.ledger, standard_application()).await;

    // Rows 1-3 become overdue and rows 1-2 are past grace, so the loan is a candidate.
    let today = days_after(disbursement_date(&loan), 28);

    let mut holder = t.ledger.db().begin().await.unwrap();
    loan_store::lock_loan(&mut holder, loan.loan_id).await.unwrap();

    let sweeper = {
        let ledger = t.ledger.clone();
        tokio::spawn(async move { ledger.run_sweep(today).await })
    };
    wait_for_lock_waiter(&t.ledger).await;

    // Settle every overdue row while the sweep waits on the loan.
    let rows = schedule_store::rows_for_loan(&mut holder, loan.loan_id, true)
        .await
        .unwrap();
    let applied = engine::apply(&rows, Money::from_cents(787_500), Utc::now());
    schedule_store::update_payments(&mut holder, &applied.changed)
        .await
        .unwrap();
    holder.commit().await.unwrap();

    let report = sweeper.await.unwrap().unwrap();
    assert_eq!(report.errors, 0);

    let financials = t.ledger.get_loan_financials(loan.loan_id).await.unwrap();
    assert_eq!(financials.status, LoanStatus::Disbursed);
    let statuses: Vec<ScheduleStatus> = financials.schedule.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            ScheduleStatus::Paid,
            ScheduleStatus::Paid,
            ScheduleStatus::Paid,
            ScheduleStatus::Pending
        ]
    );
}

#[tokio::test]
#[ignore]
#[serial]
async fn unknown_loan_is_not_found() {
    let t = spawn_ledger().await;
    let err = t
        .ledger
        .get_loan_financials(Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::LoanNotFound(_)));
}
