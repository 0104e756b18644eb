//! Repayment schedule rows.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{Money, ParseEnumError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Overdue,
    Paid,
    Defaulted,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Overdue => "overdue",
            Self::Paid => "paid",
            Self::Defaulted => "defaulted",
        }
    }
}

impl TryFrom<String> for ScheduleStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "overdue" => Ok(Self::Overdue),
            "paid" => Ok(Self::Paid),
            "defaulted" => Ok(Self::Defaulted),
            _ => Err(ParseEnumError::new("schedule status", value)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RepaymentScheduleRow {
    pub loan_id: Uuid,
    pub installment_no: i32,
    pub due_date: NaiveDate,
    pub amount_due_cents: Money,
    pub paid_cents: Money,
    #[sqlx(try_from = "String")]
    pub status: ScheduleStatus,
    pub paid_utc: Option<DateTime<Utc>>,
}

impl RepaymentScheduleRow {
    pub fn remaining(&self) -> Money {
        self.amount_due_cents.saturating_sub(self.paid_cents)
    }

    pub fn is_settled(&self) -> bool {
        self.paid_cents >= self.amount_due_cents
    }
}
