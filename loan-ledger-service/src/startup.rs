//! Application startup and lifecycle management.

use crate::config::LoanLedgerConfig;
use crate::handlers;
use crate::services::{
    init_metrics, spawn_sweeper, Database, DisbursementGateway, HttpDisbursementGateway,
    LoanLedger,
};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::metrics::metrics_middleware;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: LoanLedgerConfig,
    pub ledger: LoanLedger,
}

/// Build the HTTP router over the given state.
pub fn build_router(state: AppState) -> Router {
    let callbacks = Router::new()
        .route(
            "/callbacks/disbursement/result",
            post(handlers::callbacks::disbursement_result),
        )
        .route(
            "/callbacks/disbursement/timeout",
            post(handlers::callbacks::disbursement_timeout),
        )
        .route(
            "/callbacks/collection/confirmation",
            post(handlers::callbacks::collection_confirmation),
        )
        .route(
            "/callbacks/collection/validation",
            post(handlers::callbacks::collection_validation),
        );

    let loans = Router::new()
        .route("/loans", post(handlers::loans::create_loan))
        .route("/loans/:id/approve", post(handlers::loans::approve_loan))
        .route("/loans/:id/cancel", post(handlers::loans::cancel_loan))
        .route(
            "/loans/:id/disbursements",
            post(handlers::loans::initiate_disbursement),
        )
        .route(
            "/loans/:id/repayments",
            post(handlers::loans::record_repayment),
        )
        .route("/loans/:id/financials", get(handlers::loans::get_financials))
        .route(
            "/loans/:id/financials/recompute",
            post(handlers::loans::recompute_financials),
        )
        .route("/loans/:id/postings", get(handlers::loans::get_postings))
        .route("/loans/:id/events", get(handlers::loans::get_events))
        .route("/loans/:id/history", get(handlers::loans::get_history));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics))
        .merge(callbacks)
        .merge(loans)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .with_state(state)
}

/// Application container for managing server lifecycle.
pub struct Application {
    http_port: u16,
    http_listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: LoanLedgerConfig) -> Result<Self, AppError> {
        let gateway = Arc::new(HttpDisbursementGateway::new(config.gateway.clone()));
        if gateway.is_configured() {
            tracing::info!(base_url = %config.gateway.base_url, "Disbursement gateway configured");
        } else {
            tracing::warn!("Gateway credentials not configured - disbursements will fail");
        }
        Self::build_with_gateway(config, gateway, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: LoanLedgerConfig) -> Result<Self, AppError> {
        let gateway = Arc::new(HttpDisbursementGateway::new(config.gateway.clone()));
        Self::build_with_gateway(config, gateway, false).await
    }

    /// Build with a caller-supplied payout gateway.
    pub async fn build_with_gateway(
        config: LoanLedgerConfig,
        gateway: Arc<dyn DisbursementGateway>,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let db = Database::new(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        if run_migrations {
            db.run_migrations().await.map_err(|e| {
                tracing::error!(error = %e, "Failed to run migrations");
                e
            })?;
        }

        let ledger = LoanLedger::new(db, gateway, config.policy.clone());
        let state = AppState {
            config: config.clone(),
            ledger,
        };

        let http_addr = SocketAddr::from(([0, 0, 0, 0], config.common.port));
        let http_listener = TcpListener::bind(http_addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %http_addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let http_port = http_listener.local_addr()?.port();

        tracing::info!(http_port = http_port, "Loan ledger service listener bound");

        Ok(Self {
            http_port,
            http_listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    /// Get the application state.
    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serve HTTP and run the overdue sweeper until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let sweeper = spawn_sweeper(self.state.ledger.clone());
        let router = build_router(self.state);

        let result = axum::serve(self.http_listener, router).await;

        if let Some(handle) = sweeper {
            handle.abort();
        }
        result.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
