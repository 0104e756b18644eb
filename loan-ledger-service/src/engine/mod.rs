//! Pure ledger computations. Nothing here touches storage.

pub mod allocator;
pub mod reducer;
pub mod schedule;

pub use allocator::{allocate, Allocation, Outstanding};
pub use reducer::{reduce, FinancialState, LedgerSums};
pub use schedule::{apply, project, Application, ProjectionInput};
