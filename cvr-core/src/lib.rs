//! CVR Ledger Core
//!
//! Cost Value Reconciliation ledger for construction projects: what has been
//! committed (contracts, variations, purchase orders) and what has actually
//! been incurred (invoices, payment certificates, direct costs) against each
//! budget line.
//!
//! # Components
//!
//! - **Ledger store** ([`Ledger`]): idempotent commitment / actual writes
//!   and budget vs committed vs actual aggregation
//! - **Lifecycle hooks** ([`hooks`]): keep the ledger in step with upstream
//!   business transitions, never failing the transition itself
//! - **Matching engine** ([`matching`]): scores invoices against purchase
//!   orders and payment certificates, confirms matches
//! - **Period reporter** ([`reporting`]): frozen monthly snapshots with a
//!   review workflow
//!
//! # Invariants
//!
//! - At most one active entry per (tenant, source type, source id)
//! - Cancelled commitments and reversed actuals never count toward totals
//! - Actual lifecycle only moves forward; REVERSED is terminal
//! - Money is fixed-point [`rust_decimal::Decimal`] throughout
//! - A write is visible only after RocksDB has accepted its batch

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod config;
pub mod error;
pub mod hooks;
pub mod ledger;
pub mod matching;
pub mod metrics;
pub mod reporting;
pub mod sources;
pub mod storage;
pub mod telemetry;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use hooks::{BackfillReport, BackfillSources, HookOutcome, LifecycleHooks};
pub use ledger::Ledger;
pub use matching::{
    AutoMatchReport, MatchCandidate, MatchClassification, MatchingEngine, PoMatchResult,
};
pub use reporting::{
    NewReport, PeriodReport, PeriodReporter, PeriodScheduler, ReportComparison, ReportStatus,
    ReportUpdate,
};
pub use storage::Storage;
pub use types::{
    Actual, ActualSource, ActualStatus, BudgetLine, BudgetLineId, BudgetLineSummary, Commitment,
    CommitmentSource, CommitmentStatus, Currency, EntryKind, LedgerSummary, NewActual,
    NewCommitment, PackageId, ProjectId, SourceBreakdown, SupplierId, TenantId,
};
