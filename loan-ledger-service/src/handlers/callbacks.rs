//! Payment network callbacks.
//!
//! The network delivers at least once and retries anything that is not a
//! 200, so every callback is acknowledged with the same body whatever
//! happened inside. Failures are logged and counted for follow-up.

use axum::{body::Bytes, extract::State, Json};
use serde_json::Value;

use crate::dtos::CallbackAck;
use crate::error::LedgerError;
use crate::services::metrics::{CALLBACKS_TOTAL, RECONCILIATION_FAILURES};
use crate::services::{CallbackOutcome, CollectionNotice, DisbursementResult};
use crate::AppState;

const DISBURSEMENT: &str = "disbursement";
const COLLECTION: &str = "collection";

#[tracing::instrument(skip(state, body), fields(kind = DISBURSEMENT))]
pub async fn disbursement_result(State(state): State<AppState>, body: Bytes) -> Json<CallbackAck> {
    let outcome = match parse_body(&body).and_then(|v| parse_disbursement_result(&v)) {
        Ok(result) => state.ledger.handle_disbursement_result(result).await,
        Err(e) => Err(e),
    };
    record(DISBURSEMENT, outcome);
    Json(CallbackAck::accepted())
}

/// The network gave up waiting on its own queue. The payout outcome still
/// arrives on the result callback, or the event stays pending for follow-up.
#[tracing::instrument(skip(body))]
pub async fn disbursement_timeout(body: Bytes) -> Json<CallbackAck> {
    let correlation_id = parse_body(&body)
        .ok()
        .and_then(|v| disbursement_fields(&v).1.map(str::to_string));
    tracing::warn!(correlation_id = ?correlation_id, "Disbursement queue timeout reported");
    CALLBACKS_TOTAL
        .with_label_values(&["disbursement_timeout", "ignored"])
        .inc();
    Json(CallbackAck::accepted())
}

#[tracing::instrument(skip(state, body), fields(kind = COLLECTION))]
pub async fn collection_confirmation(
    State(state): State<AppState>,
    body: Bytes,
) -> Json<CallbackAck> {
    let outcome = match parse_body(&body).and_then(|v| parse_collection_notice(&v)) {
        Ok(notice) => state.ledger.handle_collection(notice).await,
        Err(e) => Err(e),
    };
    record(COLLECTION, outcome);
    Json(CallbackAck::accepted())
}

/// Pre-payment validation hook. Every payment is accepted; checks happen on confirmation.
pub async fn collection_validation() -> Json<CallbackAck> {
    Json(CallbackAck::accepted())
}

fn record(kind: &str, outcome: Result<CallbackOutcome, LedgerError>) {
    match outcome {
        Ok(outcome) => {
            CALLBACKS_TOTAL
                .with_label_values(&[kind, outcome.as_str()])
                .inc();
        }
        Err(e) => {
            let class = e.class();
            CALLBACKS_TOTAL.with_label_values(&[kind, "failed"]).inc();
            RECONCILIATION_FAILURES
                .with_label_values(&[kind, class.as_str()])
                .inc();
            tracing::error!(
                kind = kind,
                class = class.as_str(),
                error = %e,
                "Callback processing failed; acknowledged anyway"
            );
        }
    }
}

fn parse_body(body: &[u8]) -> Result<Value, LedgerError> {
    serde_json::from_slice(body)
        .map_err(|e| LedgerError::Validation(format!("callback body is not JSON: {}", e)))
}

/// (result code, correlation id, transaction id, description) from either
/// the flat form or the network's nested `Result` envelope.
fn disbursement_fields(body: &Value) -> (Option<i64>, Option<&str>, Option<&str>, Option<&str>) {
    let nested = body.get("Result");
    let pick = |flat: &str, native: &str| {
        body.get(flat)
            .or_else(|| nested.and_then(|r| r.get(native)))
            .filter(|v| !v.is_null())
    };

    let code = pick("resultCode", "ResultCode").and_then(as_i64);
    let correlation = pick("correlationId", "OriginatorConversationID")
        .or_else(|| nested.and_then(|r| r.get("ConversationID")))
        .and_then(Value::as_str);
    let transaction = pick("externalTransactionId", "TransactionID").and_then(Value::as_str);
    let desc = pick("resultDesc", "ResultDesc").and_then(Value::as_str);
    (code, correlation, transaction, desc)
}

pub(crate) fn parse_disbursement_result(body: &Value) -> Result<DisbursementResult, LedgerError> {
    let (code, correlation, transaction, desc) = disbursement_fields(body);

    let result_code = code
        .and_then(|c| i32::try_from(c).ok())
        .ok_or_else(|| LedgerError::Validation("resultCode is required".into()))?;
    let correlation_id = correlation
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| LedgerError::Validation("correlationId is required".into()))?;

    Ok(DisbursementResult {
        result_code,
        correlation_id: correlation_id.to_string(),
        external_transaction_id: transaction
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string),
        result_desc: desc.map(str::to_string),
        raw: body.clone(),
    })
}

pub(crate) fn parse_collection_notice(body: &Value) -> Result<CollectionNotice, LedgerError> {
    let pick = |flat: &str, native: &str| {
        body.get(flat)
            .or_else(|| body.get(native))
            .filter(|v| !v.is_null())
    };

    let receipt = pick("externalReceiptId", "TransID")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .ok_or_else(|| LedgerError::Validation("externalReceiptId is required".into()))?;
    let amount = pick("amount", "TransAmount")
        .and_then(as_decimal_string)
        .ok_or_else(|| LedgerError::Validation("amount is required".into()))?;
    let account_reference = pick("accountReference", "BillRefNumber")
        .and_then(Value::as_str)
        .ok_or_else(|| LedgerError::Validation("accountReference is required".into()))?;
    let payer_msisdn = pick("payerMsisdn", "MSISDN").and_then(|v| match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });

    Ok(CollectionNotice {
        external_receipt_id: receipt.to_string(),
        payer_msisdn,
        amount,
        account_reference: account_reference.to_string(),
        raw: body.clone(),
    })
}

/// Codes arrive as numbers or numeric strings.
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_decimal_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_flat_disbursement_result() {
        let result = parse_disbursement_result(&json!({
            "resultCode": 0,
            "correlationId": "AG_20260301_1",
            "externalTransactionId": "QKA1B2C3"
        }))
        .unwrap();
        assert_eq!(result.result_code, 0);
        assert_eq!(result.correlation_id, "AG_20260301_1");
        assert_eq!(result.external_transaction_id.as_deref(), Some("QKA1B2C3"));
    }

    #[test]
    fn parses_network_envelope() {
        let result = parse_disbursement_result(&json!({
            "Result": {
                "ResultType": 0,
                "ResultCode": 2001,
                "ResultDesc": "The initiator information is invalid.",
                "OriginatorConversationID": "abc123",
                "ConversationID": "AG_1",
                "TransactionID": "QKA1B2C3"
            }
        }))
        .unwrap();
        assert_eq!(result.result_code, 2001);
        assert_eq!(result.correlation_id, "abc123");
        assert_eq!(
            result.result_desc.as_deref(),
            Some("The initiator information is invalid.")
        );
    }

    #[test]
    fn string_result_code_is_accepted() {
        let result = parse_disbursement_result(&json!({
            "resultCode": "0",
            "correlationId": "abc123"
        }))
        .unwrap();
        assert_eq!(result.result_code, 0);
        assert!(result.external_transaction_id.is_none());
    }

    #[test]
    fn missing_correlation_is_a_validation_error() {
        let err = parse_disbursement_result(&json!({ "resultCode": 0 })).unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn parses_native_collection_confirmation() {
        let loan_id = uuid::Uuid::new_v4();
        let notice = parse_collection_notice(&json!({
            "TransactionType": "Pay Bill",
            "TransID": "RKTQDM7W6S",
            "TransAmount": "3000.00",
            "BusinessShortCode": "600638",
            "BillRefNumber": loan_id.to_string(),
            "MSISDN": 254712345678u64
        }))
        .unwrap();
        assert_eq!(notice.external_receipt_id, "RKTQDM7W6S");
        assert_eq!(notice.amount, "3000.00");
        assert_eq!(notice.account_reference, loan_id.to_string());
        assert_eq!(notice.payer_msisdn.as_deref(), Some("254712345678"));
    }

    #[test]
    fn numeric_collection_amount_is_accepted() {
        let notice = parse_collection_notice(&json!({
            "externalReceiptId": "R1",
            "amount": 3000,
            "accountReference": "x"
        }))
        .unwrap();
        assert_eq!(notice.amount, "3000");
        assert!(notice.payer_msisdn.is_none());
    }

    #[test]
    fn collection_without_receipt_is_rejected() {
        let err = parse_collection_notice(&json!({
            "amount": "10",
            "accountReference": "x"
        }))
        .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn malformed_body_is_a_validation_error() {
        assert!(matches!(
            parse_body(b"not json"),
            Err(LedgerError::Validation(_))
        ));
    }
}
