//! Repayment allocation.
//!
//! Every channel that receives money (network collections and manual entries)
//! splits it here: interest first, then principal, then overpayment suspense.

use serde::Serialize;

use crate::error::LedgerError;
use crate::models::Money;

use super::reducer::LedgerSums;

/// What the borrower still owes, split by account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Outstanding {
    pub interest: Money,
    pub principal: Money,
}

impl Outstanding {
    /// Fixed origination totals minus repayment credits already posted.
    pub fn from_ledger(principal: Money, total_interest: Money, sums: &LedgerSums) -> Self {
        Self {
            interest: total_interest.saturating_sub(sums.interest_paid),
            principal: principal.saturating_sub(sums.principal_paid),
        }
    }

    pub fn total(&self) -> Money {
        self.interest + self.principal
    }
}

/// Split of one incoming amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Allocation {
    pub interest: Money,
    pub principal: Money,
    pub overpayment: Money,
}

impl Allocation {
    pub fn total(&self) -> Money {
        self.interest + self.principal + self.overpayment
    }

    /// Portion that settles schedule installments.
    pub fn scheduled(&self) -> Money {
        self.interest + self.principal
    }
}

/// Allocate `amount` against `outstanding`. The parts always sum to `amount`.
pub fn allocate(outstanding: Outstanding, amount: Money) -> Result<Allocation, LedgerError> {
    if amount.is_negative() || outstanding.interest.is_negative() || outstanding.principal.is_negative()
    {
        return Err(LedgerError::InvalidAmount(format!(
            "cannot allocate {} against interest {} / principal {}",
            amount, outstanding.interest, outstanding.principal
        )));
    }

    let interest = amount.min(outstanding.interest);
    let after_interest = amount - interest;
    let principal = after_interest.min(outstanding.principal);
    let overpayment = after_interest - principal;

    Ok(Allocation {
        interest,
        principal,
        overpayment,
    })
}
