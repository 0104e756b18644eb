use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    Cadence, InterestModel, LedgerPosting, LoanAccount, LoanStatus, LoanStatusChange, Money,
    PaymentEvent,
};

/// Amounts on the internal API are decimal strings in major units ("1500.00").
#[derive(Debug, Deserialize, Validate)]
pub struct CreateLoanRequest {
    #[validate(length(min = 9, max = 20, message = "borrower_msisdn must be 9-20 characters"))]
    pub borrower_msisdn: String,
    #[validate(length(min = 1, max = 24, message = "principal is required"))]
    pub principal: String,
    #[validate(range(min = 0, max = 100_000, message = "interest_rate_bps must be 0-100000"))]
    pub interest_rate_bps: i32,
    #[serde(default = "default_interest_model")]
    pub interest_model: InterestModel,
    #[validate(range(min = 1, max = 104, message = "term must be 1-104 installments"))]
    pub term: i32,
    pub cadence: Cadence,
}

fn default_interest_model() -> InterestModel {
    InterestModel::Flat
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct CancelLoanRequest {
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ManualRepaymentRequest {
    #[validate(length(min = 1, max = 24, message = "amount is required"))]
    pub amount: String,
    /// Caller-supplied reference; a repeat with the same reference is rejected.
    #[validate(length(min = 1, max = 128))]
    pub reference: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LoanResponse {
    pub loan_id: Uuid,
    pub borrower_msisdn: String,
    pub status: LoanStatus,
    pub cadence: Cadence,
    pub interest_model: InterestModel,
    pub term: i32,
    pub interest_rate_bps: i32,
    pub principal_cents: Money,
    pub total_due_cents: Money,
    pub expected_installment_cents: Money,
    pub total_paid_cents: Money,
    pub outstanding_cents: Money,
    pub disbursed_utc: Option<chrono::DateTime<chrono::Utc>>,
    pub due_date: Option<chrono::NaiveDate>,
    pub created_by: Uuid,
    pub created_utc: chrono::DateTime<chrono::Utc>,
}

impl From<LoanAccount> for LoanResponse {
    fn from(loan: LoanAccount) -> Self {
        Self {
            loan_id: loan.loan_id,
            borrower_msisdn: loan.borrower_msisdn,
            status: loan.status,
            cadence: loan.cadence,
            interest_model: loan.interest_model,
            term: loan.term,
            interest_rate_bps: loan.interest_rate_bps,
            principal_cents: loan.principal_cents,
            total_due_cents: loan.total_due_cents,
            expected_installment_cents: loan.expected_installment_cents,
            total_paid_cents: loan.total_paid_cents,
            outstanding_cents: loan.outstanding_cents,
            disbursed_utc: loan.disbursed_utc,
            due_date: loan.due_date,
            created_by: loan.created_by,
            created_utc: loan.created_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PostingsResponse {
    pub loan_id: Uuid,
    pub postings: Vec<LedgerPosting>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub loan_id: Uuid,
    pub events: Vec<PaymentEvent>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub loan_id: Uuid,
    pub history: Vec<LoanStatusChange>,
}

/// Acknowledgement returned to the payment network for every callback.
#[derive(Debug, Serialize)]
pub struct CallbackAck {
    #[serde(rename = "ResultCode")]
    pub result_code: i32,
    #[serde(rename = "ResultDesc")]
    pub result_desc: &'static str,
}

impl CallbackAck {
    pub fn accepted() -> Self {
        Self {
            result_code: 0,
            result_desc: "Accepted",
        }
    }
}
