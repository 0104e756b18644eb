//! Loan account aggregate and lifecycle.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use super::{Money, ParseEnumError};

/// Loan lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    Initiated,
    Approved,
    DisbursementPending,
    Disbursed,
    Repaid,
    Defaulted,
    Cancelled,
}

impl LoanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Approved => "approved",
            Self::DisbursementPending => "disbursement_pending",
            Self::Disbursed => "disbursed",
            Self::Repaid => "repaid",
            Self::Defaulted => "defaulted",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Repaid | Self::Defaulted | Self::Cancelled)
    }

    /// Allowed edges of the lifecycle graph.
    pub fn can_transition_to(&self, next: LoanStatus) -> bool {
        use LoanStatus::*;
        matches!(
            (self, next),
            (Initiated, Approved)
                | (Approved, DisbursementPending)
                | (DisbursementPending, Disbursed)
                | (Disbursed, Repaid)
                | (Disbursed, Defaulted)
                | (Initiated, Cancelled)
                | (Approved, Cancelled)
        )
    }

    pub fn accepts_repayment(&self) -> bool {
        matches!(self, Self::Disbursed)
    }
}

impl TryFrom<String> for LoanStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "initiated" => Ok(Self::Initiated),
            "approved" => Ok(Self::Approved),
            "disbursement_pending" => Ok(Self::DisbursementPending),
            "disbursed" => Ok(Self::Disbursed),
            "repaid" => Ok(Self::Repaid),
            "defaulted" => Ok(Self::Defaulted),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseEnumError::new("loan status", value)),
        }
    }
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Installment cadence. Weekly for short emergency products, monthly for business lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Weekly,
    Monthly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }

    /// Due date of installment `n` (1-based) for a loan disbursed on `start`.
    pub fn due_date(&self, start: NaiveDate, n: u32) -> Option<NaiveDate> {
        match self {
            Self::Weekly => start.checked_add_days(chrono::Days::new(7 * n as u64)),
            Self::Monthly => start.checked_add_months(chrono::Months::new(n)),
        }
    }
}

impl TryFrom<String> for Cadence {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            _ => Err(ParseEnumError::new("cadence", value)),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How interest accrues at origination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterestModel {
    /// Rate charged once over the whole term.
    Flat,
    /// Rate charged for every period of the term.
    PerPeriod,
}

impl InterestModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::PerPeriod => "per_period",
        }
    }

    pub fn charged_periods(&self, term: i32) -> i32 {
        match self {
            Self::Flat => 1,
            Self::PerPeriod => term,
        }
    }
}

impl TryFrom<String> for InterestModel {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "flat" => Ok(Self::Flat),
            "per_period" => Ok(Self::PerPeriod),
            _ => Err(ParseEnumError::new("interest model", value)),
        }
    }
}

/// Fixed financial terms of a loan, settled at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoanTerms {
    pub principal: Money,
    pub interest_rate_bps: i32,
    pub interest_model: InterestModel,
    pub term: i32,
    pub cadence: Cadence,
}

impl LoanTerms {
    pub fn interest(&self) -> Option<Money> {
        self.principal.apply_bps(
            self.interest_rate_bps,
            self.interest_model.charged_periods(self.term),
        )
    }

    pub fn total_due(&self) -> Option<Money> {
        self.interest()
            .and_then(|interest| self.principal.checked_add(interest))
    }

    /// Floored per-installment amount. The remainder lands on the final installment.
    pub fn expected_installment(&self) -> Option<Money> {
        self.total_due()
            .and_then(|total| total.split_floor(self.term))
            .map(|(share, _)| share)
    }
}

/// Loan account row.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LoanAccount {
    pub loan_id: Uuid,
    pub borrower_msisdn: String,
    #[sqlx(try_from = "String")]
    pub cadence: Cadence,
    pub principal_cents: Money,
    pub interest_rate_bps: i32,
    #[sqlx(try_from = "String")]
    pub interest_model: InterestModel,
    pub term: i32,
    pub total_due_cents: Money,
    pub expected_installment_cents: Money,
    pub total_paid_cents: Money,
    pub outstanding_cents: Money,
    #[sqlx(try_from = "String")]
    pub status: LoanStatus,
    pub disbursed_utc: Option<DateTime<Utc>>,
    pub due_date: Option<NaiveDate>,
    pub disbursement_event_id: Option<Uuid>,
    pub created_by: Uuid,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl LoanAccount {
    /// Interest fixed at origination.
    pub fn total_interest(&self) -> Money {
        self.total_due_cents.saturating_sub(self.principal_cents)
    }
}

/// Input for opening a loan account.
#[derive(Debug, Clone)]
pub struct NewLoan {
    pub borrower_msisdn: String,
    pub terms: LoanTerms,
    pub created_by: Uuid,
}

/// One entry of the append-only status history.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LoanStatusChange {
    pub change_id: Uuid,
    pub loan_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: String,
    pub actor_id: Option<Uuid>,
    pub reason: String,
    pub changed_utc: DateTime<Utc>,
}
