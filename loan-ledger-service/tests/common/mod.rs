//! Common test utilities for loan-ledger-service integration tests.

#![allow(dead_code)]

use loan_ledger_service::config::{DatabaseConfig, GatewayConfig, LoanLedgerConfig, PolicyConfig};
use loan_ledger_service::models::{Cadence, InterestModel, LoanAccount, Money};
use loan_ledger_service::services::{
    Database, DisbursementGateway, DisbursementResult, LoanApplication, LoanLedger,
    PayoutAccepted, PayoutRequest,
};
use loan_ledger_service::startup::Application;
use secrecy::Secret;
use serde_json::json;
use service_core::config::Config as CommonConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,loan_ledger_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn database_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set to run database tests")
}

/// Payout gateway that accepts everything unless told to fail.
#[derive(Default)]
pub struct FakeGateway {
    failures_remaining: AtomicUsize,
    pub sent: Mutex<Vec<PayoutRequest>>,
}

impl FakeGateway {
    /// Fail the next `n` payouts.
    pub fn fail_next(&self, n: usize) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl DisbursementGateway for FakeGateway {
    async fn send_payout(&self, request: &PayoutRequest) -> anyhow::Result<PayoutAccepted> {
        self.sent.lock().unwrap().push(request.clone());
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("gateway timed out");
        }
        Ok(PayoutAccepted {
            correlation_ref: format!("AG_{}", request.event_id.simple()),
            description: Some("Accept the service request successfully.".to_string()),
        })
    }
}

pub struct TestLedger {
    pub ledger: LoanLedger,
    pub gateway: Arc<FakeGateway>,
}

/// Connect to the test database, apply migrations and build a ledger over a fake gateway.
pub async fn spawn_ledger() -> TestLedger {
    init_tracing();

    let db = Database::new(&database_url(), 5, 1)
        .await
        .expect("Failed to connect to test database");
    db.run_migrations().await.expect("Failed to run migrations");

    let gateway = Arc::new(FakeGateway::default());
    let ledger = LoanLedger::new(db, gateway.clone(), PolicyConfig::default());
    TestLedger { ledger, gateway }
}

pub fn test_config() -> LoanLedgerConfig {
    test_config_for(&database_url())
}

/// Test configuration pointing at `url`. Nothing is connected here.
pub fn test_config_for(url: &str) -> LoanLedgerConfig {
    LoanLedgerConfig {
        common: CommonConfig { port: 0 },
        service_name: "loan-ledger-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: DatabaseConfig {
            url: Secret::new(url.to_string()),
            max_connections: 2,
            min_connections: 1,
        },
        gateway: GatewayConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            consumer_key: String::new(),
            consumer_secret: Secret::new(String::new()),
            shortcode: "600000".to_string(),
            initiator_name: "test".to_string(),
            security_credential: Secret::new(String::new()),
            result_url: String::new(),
            timeout_url: String::new(),
        },
        policy: PolicyConfig {
            sweep_interval_seconds: 0,
            ..PolicyConfig::default()
        },
    }
}

/// Start the HTTP server on a random port and return its base address.
pub async fn spawn_app() -> (String, Arc<FakeGateway>) {
    init_tracing();

    let gateway = Arc::new(FakeGateway::default());
    let app = Application::build_with_gateway(test_config(), gateway.clone(), true)
        .await
        .expect("Failed to build application");
    let address = format!("http://127.0.0.1:{}", app.http_port());

    tokio::spawn(async move {
        app.run_until_stopped().await.ok();
    });

    (address, gateway)
}

/// A 10,000.00 loan at 5% flat interest over 4 weekly installments: total due 10,500.00.
pub fn standard_application() -> LoanApplication {
    LoanApplication {
        borrower_msisdn: "0712345678".to_string(),
        principal: Money::from_cents(1_000_000),
        interest_rate_bps: 500,
        interest_model: InterestModel::Flat,
        term: 4,
        cadence: Cadence::Weekly,
    }
}

/// Create and approve a loan using two distinct actors.
pub async fn approved_loan(ledger: &LoanLedger, application: LoanApplication) -> LoanAccount {
    let maker = Uuid::new_v4();
    let checker = Uuid::new_v4();
    let loan = ledger
        .create_loan(application, maker)
        .await
        .expect("Failed to create loan");
    ledger
        .approve_loan(loan.loan_id, checker)
        .await
        .expect("Failed to approve loan")
}

/// Successful network result for a correlation reference.
pub fn success_result(correlation_id: &str) -> DisbursementResult {
    let transaction_id = format!("TX{}", &Uuid::new_v4().simple().to_string()[..10]);
    DisbursementResult {
        result_code: 0,
        correlation_id: correlation_id.to_string(),
        external_transaction_id: Some(transaction_id.clone()),
        result_desc: Some("The service request is processed successfully.".to_string()),
        raw: json!({
            "Result": {
                "ResultCode": 0,
                "OriginatorConversationID": correlation_id,
                "TransactionID": transaction_id
            }
        }),
    }
}

/// Create, approve, initiate and confirm a disbursement.
pub async fn disbursed_loan(ledger: &LoanLedger, application: LoanApplication) -> LoanAccount {
    let loan = approved_loan(ledger, application).await;
    let initiated = ledger
        .initiate_disbursement(loan.loan_id, Uuid::new_v4())
        .await
        .expect("Failed to initiate disbursement");
    let correlation = initiated
        .correlation_ref
        .expect("Gateway should return a correlation reference");

    ledger
        .handle_disbursement_result(success_result(&correlation))
        .await
        .expect("Failed to reconcile disbursement");

    let mut conn = ledger.db().pool().acquire().await.unwrap();
    loan_ledger_service::services::loan_store::get_loan(&mut conn, loan.loan_id)
        .await
        .unwrap()
        .expect("Loan should exist")
}

/// A unique network receipt id.
pub fn receipt() -> String {
    format!("R{}", &Uuid::new_v4().simple().to_string()[..12].to_uppercase())
}
