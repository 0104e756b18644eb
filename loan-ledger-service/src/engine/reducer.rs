//! Loan financial state, derived from postings.
//!
//! This is the only computation allowed to produce `total_paid`, `outstanding`
//! and the repaid transition. It always starts from zero, so replaying the same
//! posting set in any order yields the same state.

use serde::Serialize;

use crate::models::{Account, Direction, LedgerPosting, LoanStatus, Money, PostingType};

/// Per-account sums of a loan's completed postings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerSums {
    /// Repayment credits to interest_income.
    pub interest_paid: Money,
    /// Repayment credits to loans_receivable.
    pub principal_paid: Money,
    /// Repayment credits to overpayment_suspense.
    pub overpaid: Money,
    /// Disbursement debits to loans_receivable.
    pub disbursed: Money,
}

impl LedgerSums {
    pub fn from_postings<'a>(postings: impl IntoIterator<Item = &'a LedgerPosting>) -> Self {
        let mut sums = Self::default();
        for p in postings {
            match (p.posting_type, p.account, p.direction) {
                (PostingType::Repayment, Account::InterestIncome, Direction::Credit) => {
                    sums.interest_paid += p.amount_cents
                }
                (PostingType::Repayment, Account::LoansReceivable, Direction::Credit) => {
                    sums.principal_paid += p.amount_cents
                }
                (PostingType::Repayment, Account::OverpaymentSuspense, Direction::Credit) => {
                    sums.overpaid += p.amount_cents
                }
                (PostingType::Disbursement, Account::LoansReceivable, Direction::Debit) => {
                    sums.disbursed += p.amount_cents
                }
                _ => {}
            }
        }
        sums
    }

    /// Money applied to the loan. Overpayment is held in suspense, not counted.
    pub fn total_paid(&self) -> Money {
        self.interest_paid + self.principal_paid
    }
}

/// Recomputed totals and status for one loan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FinancialState {
    pub total_paid: Money,
    pub outstanding: Money,
    pub status: LoanStatus,
}

/// Derive the loan's cached state from its ledger sums.
///
/// Only a disbursed loan moves, and only to `repaid`. Terminal and
/// pre-disbursement states pass through unchanged.
pub fn reduce(total_due: Money, current: LoanStatus, sums: &LedgerSums) -> FinancialState {
    let total_paid = sums.total_paid();
    let outstanding = total_due.saturating_sub(total_paid);

    let status = if current == LoanStatus::Disbursed && !outstanding.is_positive() {
        LoanStatus::Repaid
    } else {
        current
    };

    FinancialState {
        total_paid,
        outstanding,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn posting(
        posting_type: PostingType,
        account: Account,
        direction: Direction,
        cents: i64,
    ) -> LedgerPosting {
        LedgerPosting {
            posting_id: Uuid::new_v4(),
            seq: 0,
            loan_id: Uuid::nil(),
            event_id: Uuid::new_v4(),
            account,
            direction,
            amount_cents: Money::from_cents(cents),
            posting_type,
            posted_utc: Utc::now(),
        }
    }

    fn history() -> Vec<LedgerPosting> {
        use Account::*;
        use Direction::*;
        use PostingType::*;
        vec![
            posting(Disbursement, LoansReceivable, Debit, 1_000_000),
            posting(Disbursement, Cash, Credit, 1_000_000),
            posting(Repayment, Cash, Debit, 300_000),
            posting(Repayment, InterestIncome, Credit, 50_000),
            posting(Repayment, LoansReceivable, Credit, 250_000),
            posting(Repayment, Cash, Debit, 100_000),
            posting(Repayment, LoansReceivable, Credit, 100_000),
        ]
    }

    #[test]
    fn sums_only_count_repayment_credits_as_paid() {
        let sums = LedgerSums::from_postings(&history());
        assert_eq!(sums.interest_paid, Money::from_cents(50_000));
        assert_eq!(sums.principal_paid, Money::from_cents(350_000));
        assert_eq!(sums.disbursed, Money::from_cents(1_000_000));
        assert_eq!(sums.total_paid(), Money::from_cents(400_000));
    }

    #[test]
    fn reduction_is_order_independent() {
        let forward = history();
        let mut backward = history();
        backward.reverse();
        let mut rotated = history();
        rotated.rotate_left(3);

        let due = Money::from_cents(1_050_000);
        let a = reduce(due, LoanStatus::Disbursed, &LedgerSums::from_postings(&forward));
        let b = reduce(due, LoanStatus::Disbursed, &LedgerSums::from_postings(&backward));
        let c = reduce(due, LoanStatus::Disbursed, &LedgerSums::from_postings(&rotated));
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.outstanding, Money::from_cents(650_000));
        assert_eq!(a.status, LoanStatus::Disbursed);
    }

    #[test]
    fn reducing_twice_is_a_fixed_point() {
        let sums = LedgerSums::from_postings(&history());
        let due = Money::from_cents(1_050_000);
        let first = reduce(due, LoanStatus::Disbursed, &sums);
        let second = reduce(due, first.status, &sums);
        assert_eq!(first, second);
    }

    #[test]
    fn fully_paid_disbursed_loan_is_repaid() {
        let sums = LedgerSums {
            interest_paid: Money::from_cents(500),
            principal_paid: Money::from_cents(10_000),
            overpaid: Money::from_cents(70),
            ..Default::default()
        };
        let state = reduce(Money::from_cents(10_500), LoanStatus::Disbursed, &sums);
        assert_eq!(state.outstanding, Money::ZERO);
        assert_eq!(state.total_paid, Money::from_cents(10_500));
        assert_eq!(state.status, LoanStatus::Repaid);
    }

    #[test]
    fn terminal_and_pending_states_are_untouched() {
        let paid = LedgerSums {
            principal_paid: Money::from_cents(100),
            ..Default::default()
        };
        for status in [
            LoanStatus::Defaulted,
            LoanStatus::Cancelled,
            LoanStatus::DisbursementPending,
            LoanStatus::Approved,
        ] {
            assert_eq!(reduce(Money::from_cents(100), status, &paid).status, status);
        }
    }
}
