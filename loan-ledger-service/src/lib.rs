//! Loan Ledger Service - loan servicing ledger with payment network reconciliation.

pub mod config;
pub mod dtos;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod utils;

pub use startup::{build_router, AppState, Application};
