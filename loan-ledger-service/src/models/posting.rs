//! Immutable double-entry postings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

use super::{Money, ParseEnumError};
use crate::engine::Allocation;
use crate::error::LedgerError;

/// Ledger accounts. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Account {
    Cash,
    LoansReceivable,
    InterestIncome,
    OverpaymentSuspense,
}

impl Account {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::LoansReceivable => "loans_receivable",
            Self::InterestIncome => "interest_income",
            Self::OverpaymentSuspense => "overpayment_suspense",
        }
    }
}

impl TryFrom<String> for Account {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "cash" => Ok(Self::Cash),
            "loans_receivable" => Ok(Self::LoansReceivable),
            "interest_income" => Ok(Self::InterestIncome),
            "overpayment_suspense" => Ok(Self::OverpaymentSuspense),
            _ => Err(ParseEnumError::new("account", value)),
        }
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Entry direction (debit or credit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "debit",
            Self::Credit => "credit",
        }
    }
}

impl TryFrom<String> for Direction {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "debit" => Ok(Self::Debit),
            "credit" => Ok(Self::Credit),
            _ => Err(ParseEnumError::new("direction", value)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostingType {
    Disbursement,
    Repayment,
}

impl PostingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disbursement => "disbursement",
            Self::Repayment => "repayment",
        }
    }
}

impl TryFrom<String> for PostingType {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "disbursement" => Ok(Self::Disbursement),
            "repayment" => Ok(Self::Repayment),
            _ => Err(ParseEnumError::new("posting type", value)),
        }
    }
}

/// A stored posting. Always written in its final state.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LedgerPosting {
    pub posting_id: Uuid,
    pub seq: i64,
    pub loan_id: Uuid,
    pub event_id: Uuid,
    #[sqlx(try_from = "String")]
    pub account: Account,
    #[sqlx(try_from = "String")]
    pub direction: Direction,
    pub amount_cents: Money,
    #[sqlx(try_from = "String")]
    pub posting_type: PostingType,
    pub posted_utc: DateTime<Utc>,
}

/// One line of a batch before it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewPosting {
    pub account: Account,
    pub direction: Direction,
    pub amount: Money,
}

impl NewPosting {
    fn debit(account: Account, amount: Money) -> Self {
        Self {
            account,
            direction: Direction::Debit,
            amount,
        }
    }

    fn credit(account: Account, amount: Money) -> Self {
        Self {
            account,
            direction: Direction::Credit,
            amount,
        }
    }
}

/// The complete set of postings for one payment event.
#[derive(Debug, Clone)]
pub struct PostingBatch {
    pub loan_id: Uuid,
    pub event_id: Uuid,
    pub posting_type: PostingType,
    pub lines: Vec<NewPosting>,
}

impl PostingBatch {
    /// DEBIT loans_receivable / CREDIT cash for the disbursed principal.
    pub fn disbursement(loan_id: Uuid, event_id: Uuid, amount: Money) -> Self {
        Self {
            loan_id,
            event_id,
            posting_type: PostingType::Disbursement,
            lines: vec![
                NewPosting::debit(Account::LoansReceivable, amount),
                NewPosting::credit(Account::Cash, amount),
            ],
        }
    }

    /// DEBIT cash for the full amount, one credit per non-zero allocation bucket.
    pub fn repayment(loan_id: Uuid, event_id: Uuid, allocation: &Allocation) -> Self {
        let mut lines = vec![NewPosting::debit(Account::Cash, allocation.total())];
        if allocation.interest.is_positive() {
            lines.push(NewPosting::credit(Account::InterestIncome, allocation.interest));
        }
        if allocation.principal.is_positive() {
            lines.push(NewPosting::credit(
                Account::LoansReceivable,
                allocation.principal,
            ));
        }
        if allocation.overpayment.is_positive() {
            lines.push(NewPosting::credit(
                Account::OverpaymentSuspense,
                allocation.overpayment,
            ));
        }
        Self {
            loan_id,
            event_id,
            posting_type: PostingType::Repayment,
            lines,
        }
    }

    pub fn total_debits(&self) -> Money {
        self.sum(Direction::Debit)
    }

    pub fn total_credits(&self) -> Money {
        self.sum(Direction::Credit)
    }

    fn sum(&self, direction: Direction) -> Money {
        self.lines
            .iter()
            .filter(|l| l.direction == direction)
            .map(|l| l.amount)
            .sum()
    }

    /// Reject batches that would break conservation or the per-event line uniqueness.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.lines.len() < 2 {
            return Err(LedgerError::ConsistencyViolation(format!(
                "event {} has {} posting(s), need at least 2",
                self.event_id,
                self.lines.len()
            )));
        }

        let mut seen = HashSet::with_capacity(self.lines.len());
        for line in &self.lines {
            if !line.amount.is_positive() {
                return Err(LedgerError::ConsistencyViolation(format!(
                    "event {} has non-positive {} {} posting",
                    self.event_id, line.direction, line.account
                )));
            }
            if !seen.insert((line.account, line.direction)) {
                return Err(LedgerError::ConsistencyViolation(format!(
                    "event {} posts {} {} twice",
                    self.event_id, line.direction, line.account
                )));
            }
        }

        let (debits, credits) = (self.total_debits(), self.total_credits());
        if debits != credits {
            return Err(LedgerError::ConsistencyViolation(format!(
                "event {} does not balance: debits {} != credits {}",
                self.event_id, debits, credits
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(interest: i64, principal: i64, overpayment: i64) -> Allocation {
        Allocation {
            interest: Money::from_cents(interest),
            principal: Money::from_cents(principal),
            overpayment: Money::from_cents(overpayment),
        }
    }

    #[test]
    fn disbursement_batch_balances() {
        let batch = PostingBatch::disbursement(Uuid::new_v4(), Uuid::new_v4(), Money::from_cents(1_000_000));
        assert!(batch.validate().is_ok());
        assert_eq!(batch.lines[0].account, Account::LoansReceivable);
        assert_eq!(batch.lines[0].direction, Direction::Debit);
        assert_eq!(batch.lines[1].account, Account::Cash);
        assert_eq!(batch.lines[1].direction, Direction::Credit);
    }

    #[test]
    fn repayment_batch_skips_empty_buckets() {
        let batch = PostingBatch::repayment(Uuid::new_v4(), Uuid::new_v4(), &alloc(50_000, 250_000, 0));
        assert!(batch.validate().is_ok());
        assert_eq!(batch.lines.len(), 3);
        assert_eq!(batch.total_debits(), Money::from_cents(300_000));
        assert!(batch
            .lines
            .iter()
            .all(|l| l.account != Account::OverpaymentSuspense));
    }

    #[test]
    fn repayment_batch_with_all_buckets_balances() {
        let batch = PostingBatch::repayment(Uuid::new_v4(), Uuid::new_v4(), &alloc(10, 20, 5));
        assert_eq!(batch.lines.len(), 4);
        assert_eq!(batch.total_debits(), batch.total_credits());
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn unbalanced_batch_is_a_consistency_violation() {
        let mut batch = PostingBatch::disbursement(Uuid::new_v4(), Uuid::new_v4(), Money::from_cents(100));
        batch.lines[1].amount = Money::from_cents(99);
        assert!(matches!(
            batch.validate(),
            Err(LedgerError::ConsistencyViolation(_))
        ));
    }

    #[test]
    fn duplicate_account_direction_is_rejected() {
        let mut batch = PostingBatch::disbursement(Uuid::new_v4(), Uuid::new_v4(), Money::from_cents(100));
        batch.lines.push(NewPosting::debit(Account::LoansReceivable, Money::from_cents(1)));
        batch.lines.push(NewPosting::credit(Account::InterestIncome, Money::from_cents(1)));
        assert!(batch.validate().is_err());
    }
}
