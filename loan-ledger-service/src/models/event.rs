//! Payment events: one row per interaction with the payment network or a manual entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

use super::{Money, ParseEnumError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentEventKind {
    /// Outbound payout to the borrower.
    Disbursement,
    /// Inbound payment pushed by the network.
    Collection,
    /// Cash or bank repayment keyed in by staff.
    Manual,
}

impl PaymentEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disbursement => "disbursement",
            Self::Collection => "collection",
            Self::Manual => "manual",
        }
    }

    pub fn direction(&self) -> EventDirection {
        match self {
            Self::Disbursement => EventDirection::Out,
            Self::Collection | Self::Manual => EventDirection::In,
        }
    }
}

impl TryFrom<String> for PaymentEventKind {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "disbursement" => Ok(Self::Disbursement),
            "collection" => Ok(Self::Collection),
            "manual" => Ok(Self::Manual),
            _ => Err(ParseEnumError::new("payment event kind", value)),
        }
    }
}

impl fmt::Display for PaymentEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventDirection {
    In,
    Out,
}

impl EventDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

impl TryFrom<String> for EventDirection {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            _ => Err(ParseEnumError::new("event direction", value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Success,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Finalized events are immutable.
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl TryFrom<String> for EventStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseEnumError::new("event status", value)),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub event_id: Uuid,
    pub loan_id: Option<Uuid>,
    #[sqlx(try_from = "String")]
    pub kind: PaymentEventKind,
    #[sqlx(try_from = "String")]
    pub direction: EventDirection,
    pub amount_cents: Money,
    #[sqlx(try_from = "String")]
    pub status: EventStatus,
    pub correlation_ref: Option<String>,
    pub receipt_ref: Option<String>,
    pub idempotency_key: Option<String>,
    pub msisdn: Option<String>,
    pub result_code: Option<i32>,
    pub result_desc: Option<String>,
    pub raw_payload: Option<serde_json::Value>,
    pub initiated_by: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub finalized_utc: Option<DateTime<Utc>>,
}

/// Input for recording a payment event.
#[derive(Debug, Clone)]
pub struct NewPaymentEvent {
    pub loan_id: Option<Uuid>,
    pub kind: PaymentEventKind,
    pub amount: Money,
    pub status: EventStatus,
    pub receipt_ref: Option<String>,
    pub idempotency_key: Option<String>,
    pub msisdn: Option<String>,
    pub raw_payload: Option<serde_json::Value>,
    pub initiated_by: Option<Uuid>,
}
