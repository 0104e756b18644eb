//! Internal loan API used by the back office.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{
    CancelLoanRequest, CreateLoanRequest, EventsResponse, HistoryResponse, LoanResponse,
    ManualRepaymentRequest, PostingsResponse,
};
use crate::engine::FinancialState;
use crate::middleware::ActorContext;
use crate::models::Money;
use crate::services::{DisbursementInitiated, LoanApplication, LoanFinancials, RepaymentReceipt};
use crate::AppState;

#[tracing::instrument(skip(state, payload))]
pub async fn create_loan(
    State(state): State<AppState>,
    actor: ActorContext,
    Json(payload): Json<CreateLoanRequest>,
) -> Result<(StatusCode, Json<LoanResponse>), AppError> {
    payload.validate()?;
    let principal = Money::parse_decimal(&payload.principal)?;

    let loan = state
        .ledger
        .create_loan(
            LoanApplication {
                borrower_msisdn: payload.borrower_msisdn,
                principal,
                interest_rate_bps: payload.interest_rate_bps,
                interest_model: payload.interest_model,
                term: payload.term,
                cadence: payload.cadence,
            },
            actor.actor_id,
        )
        .await?;

    tracing::info!(
        loan_id = %loan.loan_id,
        principal_cents = loan.principal_cents.cents(),
        total_due_cents = loan.total_due_cents.cents(),
        "Loan created"
    );

    Ok((StatusCode::CREATED, Json(LoanResponse::from(loan))))
}

#[tracing::instrument(skip(state))]
pub async fn approve_loan(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(loan_id): Path<Uuid>,
) -> Result<Json<LoanResponse>, AppError> {
    let loan = state.ledger.approve_loan(loan_id, actor.actor_id).await?;
    Ok(Json(LoanResponse::from(loan)))
}

#[tracing::instrument(skip(state, payload))]
pub async fn cancel_loan(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(loan_id): Path<Uuid>,
    payload: Option<Json<CancelLoanRequest>>,
) -> Result<Json<LoanResponse>, AppError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    payload.validate()?;

    let loan = state
        .ledger
        .cancel_loan(loan_id, actor.actor_id, payload.reason)
        .await?;
    Ok(Json(LoanResponse::from(loan)))
}

#[tracing::instrument(skip(state))]
pub async fn initiate_disbursement(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(loan_id): Path<Uuid>,
) -> Result<(StatusCode, Json<DisbursementInitiated>), AppError> {
    let initiated = state
        .ledger
        .initiate_disbursement(loan_id, actor.actor_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(initiated)))
}

#[tracing::instrument(skip(state, payload))]
pub async fn record_repayment(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(loan_id): Path<Uuid>,
    Json(payload): Json<ManualRepaymentRequest>,
) -> Result<(StatusCode, Json<RepaymentReceipt>), AppError> {
    payload.validate()?;
    let amount = Money::parse_decimal(&payload.amount)?;

    let receipt = state
        .ledger
        .record_manual_repayment(loan_id, amount, actor.actor_id, payload.reference)
        .await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

pub async fn get_financials(
    State(state): State<AppState>,
    Path(loan_id): Path<Uuid>,
) -> Result<Json<LoanFinancials>, AppError> {
    Ok(Json(state.ledger.get_loan_financials(loan_id).await?))
}

#[tracing::instrument(skip(state))]
pub async fn recompute_financials(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(loan_id): Path<Uuid>,
) -> Result<Json<FinancialState>, AppError> {
    tracing::info!(loan_id = %loan_id, actor_id = %actor.actor_id, "Recompute requested");
    Ok(Json(state.ledger.recompute_financials(loan_id).await?))
}

pub async fn get_postings(
    State(state): State<AppState>,
    Path(loan_id): Path<Uuid>,
) -> Result<Json<PostingsResponse>, AppError> {
    let postings = state.ledger.get_loan_postings(loan_id).await?;
    Ok(Json(PostingsResponse { loan_id, postings }))
}

pub async fn get_events(
    State(state): State<AppState>,
    Path(loan_id): Path<Uuid>,
) -> Result<Json<EventsResponse>, AppError> {
    let events = state.ledger.get_loan_events(loan_id).await?;
    Ok(Json(EventsResponse { loan_id, events }))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(loan_id): Path<Uuid>,
) -> Result<Json<HistoryResponse>, AppError> {
    let history = state.ledger.get_loan_history(loan_id).await?;
    Ok(Json(HistoryResponse { loan_id, history }))
}
