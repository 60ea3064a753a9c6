//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)
//! - Tenant scoping (every row carries its tenant)

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Wrap an existing UUID
            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Generate a new time-ordered ID
            pub fn generate() -> Self {
                Self(Uuid::now_v7())
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Tenant (company) scoping every query and write
    TenantId
);
id_type!(
    /// Construction project
    ProjectId
);
id_type!(
    /// Planned-spend line within a project budget
    BudgetLineId
);
id_type!(
    /// Supplier / subcontractor
    SupplierId
);
id_type!(
    /// Procurement package
    PackageId
);

/// ISO 4217 currency code
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum Currency {
    /// British Pound
    #[default]
    GBP,
    /// Euro
    EUR,
    /// US Dollar
    USD,
}

impl Currency {
    /// ISO 4217 code
    pub fn code(&self) -> &'static str {
        match self {
            Currency::GBP => "GBP",
            Currency::EUR => "EUR",
            Currency::USD => "USD",
        }
    }

    /// Parse from string
    pub fn from_code(s: &str) -> Option<Self> {
        match s {
            "GBP" => Some(Currency::GBP),
            "EUR" => Some(Currency::EUR),
            "USD" => Some(Currency::USD),
            _ => None,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Upstream record that obligates spend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitmentSource {
    /// Signed contract
    Contract,
    /// Approved variation
    Variation,
    /// Approved purchase order
    PurchaseOrder,
}

impl CommitmentSource {
    /// All source types, in reporting order
    pub const ALL: [CommitmentSource; 3] = [
        CommitmentSource::Contract,
        CommitmentSource::Variation,
        CommitmentSource::PurchaseOrder,
    ];

    /// Stable code
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentSource::Contract => "CONTRACT",
            CommitmentSource::Variation => "VARIATION",
            CommitmentSource::PurchaseOrder => "PURCHASE_ORDER",
        }
    }
}

/// Upstream record that incurs spend
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActualSource {
    /// Supplier invoice
    Invoice,
    /// Certified application for payment
    PaymentApplication,
    /// Direct cost (labour, plant, sundries)
    DirectCost,
}

impl ActualSource {
    /// All source types, in reporting order
    pub const ALL: [ActualSource; 3] = [
        ActualSource::Invoice,
        ActualSource::PaymentApplication,
        ActualSource::DirectCost,
    ];

    /// Stable code
    pub fn as_str(&self) -> &'static str {
        match self {
            ActualSource::Invoice => "INVOICE",
            ActualSource::PaymentApplication => "PAYMENT_APPLICATION",
            ActualSource::DirectCost => "DIRECT_COST",
        }
    }
}

/// Commitment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitmentStatus {
    /// Counts toward committed totals
    Committed,
    /// Excluded from every aggregate (terminal)
    Cancelled,
}

impl CommitmentStatus {
    /// Stable code
    pub fn as_str(&self) -> &'static str {
        match self {
            CommitmentStatus::Committed => "COMMITTED",
            CommitmentStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for CommitmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actual status
///
/// Forward-only lifecycle `Recorded -> Certified -> Paid`; any state may move to
/// `Reversed`, which is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActualStatus {
    /// Claim received
    Recorded,
    /// Claim certified / approved
    Certified,
    /// Paid out
    Paid,
    /// Reversed (terminal, excluded from aggregates)
    Reversed,
}

impl ActualStatus {
    /// Stable code
    pub fn as_str(&self) -> &'static str {
        match self {
            ActualStatus::Recorded => "RECORDED",
            ActualStatus::Certified => "CERTIFIED",
            ActualStatus::Paid => "PAID",
            ActualStatus::Reversed => "REVERSED",
        }
    }

    /// Whether the actual counts toward aggregates
    pub fn is_active(&self) -> bool {
        !matches!(self, ActualStatus::Reversed)
    }

    fn rank(&self) -> u8 {
        match self {
            ActualStatus::Recorded => 0,
            ActualStatus::Certified => 1,
            ActualStatus::Paid => 2,
            ActualStatus::Reversed => 3,
        }
    }

    /// Check whether moving to `next` follows the lifecycle.
    ///
    /// Same-state moves are not transitions; callers treat them as no-ops.
    pub fn can_transition_to(&self, next: ActualStatus) -> bool {
        match (self, next) {
            (ActualStatus::Reversed, _) => false,
            (_, ActualStatus::Reversed) => true,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl fmt::Display for ActualStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the ledger a query addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// Commitments
    Commitment,
    /// Actuals
    Actual,
}

/// Planned-spend line item (read-only to the core)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLine {
    /// Budget line ID
    pub id: BudgetLineId,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Owning project
    pub project_id: ProjectId,
    /// Unique code within the project (e.g. "03-200")
    pub code: String,
    /// Description
    pub description: String,
    /// Budgeted amount
    pub budget: Decimal,
    /// Forecast final cost
    pub forecast_final_cost: Option<Decimal>,
    /// Forecast cost to complete
    pub forecast_to_complete: Option<Decimal>,
    /// Forecast variance against budget
    pub forecast_variance: Option<Decimal>,
}

/// Idempotency key of a commitment
///
/// `source_line` distinguishes several entries raised by one source record
/// (contract line items); it is 0 for single-entry sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitmentKey {
    /// Tenant
    pub tenant_id: TenantId,
    /// Source type
    pub source_type: CommitmentSource,
    /// Upstream record ID
    pub source_id: Uuid,
    /// Line discriminator within the source
    pub source_line: u32,
}

/// Idempotency key of an actual
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActualKey {
    /// Tenant
    pub tenant_id: TenantId,
    /// Source type
    pub source_type: ActualSource,
    /// Upstream record ID
    pub source_id: Uuid,
}

/// Money contractually promised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commitment {
    /// Commitment ID
    pub id: Uuid,
    /// Tenant
    pub tenant_id: TenantId,
    /// Project
    pub project_id: ProjectId,
    /// Budget line (None for unallocated commitments)
    pub budget_line_id: Option<BudgetLineId>,
    /// Source type
    pub source_type: CommitmentSource,
    /// Upstream record ID
    pub source_id: Uuid,
    /// Line discriminator within the source
    pub source_line: u32,
    /// Amount (immutable once created)
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Status
    pub status: CommitmentStatus,
    /// Date the obligation took effect
    pub effective_date: NaiveDate,
    /// Date the commitment was cancelled
    pub cancelled_date: Option<NaiveDate>,
    /// Description
    pub description: String,
    /// External reference (contract / PO number)
    pub reference: Option<String>,
    /// Cost code
    pub cost_code: Option<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl Commitment {
    /// Idempotency key
    pub fn key(&self) -> CommitmentKey {
        CommitmentKey {
            tenant_id: self.tenant_id,
            source_type: self.source_type,
            source_id: self.source_id,
            source_line: self.source_line,
        }
    }

    /// Whether the commitment counts toward aggregates
    pub fn is_active(&self) -> bool {
        self.status == CommitmentStatus::Committed
    }
}

/// Request to record a commitment
#[derive(Debug, Clone, PartialEq)]
pub struct NewCommitment {
    /// Tenant
    pub tenant_id: TenantId,
    /// Project
    pub project_id: ProjectId,
    /// Budget line
    pub budget_line_id: Option<BudgetLineId>,
    /// Source type
    pub source_type: CommitmentSource,
    /// Upstream record ID
    pub source_id: Uuid,
    /// Line discriminator within the source
    pub source_line: u32,
    /// Amount
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Effective date
    pub effective_date: NaiveDate,
    /// Description
    pub description: String,
    /// External reference
    pub reference: Option<String>,
    /// Cost code
    pub cost_code: Option<String>,
}

impl NewCommitment {
    /// Idempotency key
    pub fn key(&self) -> CommitmentKey {
        CommitmentKey {
            tenant_id: self.tenant_id,
            source_type: self.source_type,
            source_id: self.source_id,
            source_line: self.source_line,
        }
    }
}

/// Money actually incurred
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actual {
    /// Actual ID
    pub id: Uuid,
    /// Tenant
    pub tenant_id: TenantId,
    /// Project
    pub project_id: ProjectId,
    /// Budget line (None until allocated)
    pub budget_line_id: Option<BudgetLineId>,
    /// Source type
    pub source_type: ActualSource,
    /// Upstream record ID
    pub source_id: Uuid,
    /// Amount (immutable once created)
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Status
    pub status: ActualStatus,
    /// Date the cost was incurred
    pub incurred_date: NaiveDate,
    /// Date certified
    pub certified_date: Option<NaiveDate>,
    /// Date paid
    pub paid_date: Option<NaiveDate>,
    /// Date reversed
    pub reversed_date: Option<NaiveDate>,
    /// Description
    pub description: String,
    /// External reference (invoice / application number)
    pub reference: Option<String>,
    /// Cost code
    pub cost_code: Option<String>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl Actual {
    /// Idempotency key
    pub fn key(&self) -> ActualKey {
        ActualKey {
            tenant_id: self.tenant_id,
            source_type: self.source_type,
            source_id: self.source_id,
        }
    }

    /// Whether the actual counts toward aggregates
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// Request to record an actual
#[derive(Debug, Clone, PartialEq)]
pub struct NewActual {
    /// Tenant
    pub tenant_id: TenantId,
    /// Project
    pub project_id: ProjectId,
    /// Budget line
    pub budget_line_id: Option<BudgetLineId>,
    /// Source type
    pub source_type: ActualSource,
    /// Upstream record ID
    pub source_id: Uuid,
    /// Amount
    pub amount: Decimal,
    /// Currency
    pub currency: Currency,
    /// Date incurred
    pub incurred_date: NaiveDate,
    /// Date certified, if already certified
    pub certified_date: Option<NaiveDate>,
    /// Date paid, if already paid
    pub paid_date: Option<NaiveDate>,
    /// Description
    pub description: String,
    /// External reference
    pub reference: Option<String>,
    /// Cost code
    pub cost_code: Option<String>,
}

impl NewActual {
    /// Idempotency key
    pub fn key(&self) -> ActualKey {
        ActualKey {
            tenant_id: self.tenant_id,
            source_type: self.source_type,
            source_id: self.source_id,
        }
    }

    /// Initial status derived from the supplied dates
    pub fn initial_status(&self) -> ActualStatus {
        if self.paid_date.is_some() {
            ActualStatus::Paid
        } else if self.certified_date.is_some() {
            ActualStatus::Certified
        } else {
            ActualStatus::Recorded
        }
    }
}

/// Budget vs committed vs actual totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    /// Budgeted amount
    pub budget: Decimal,
    /// Sum of active commitments
    pub committed: Decimal,
    /// Sum of active actuals
    pub actual: Decimal,
    /// `budget - committed - actual` (may be negative on overspend)
    pub remaining: Decimal,
    /// `budget - committed`
    pub variance: Decimal,
    /// Committed as a percentage of budget (0 when budget is 0)
    pub percent_committed: Decimal,
    /// Actual as a percentage of budget (0 when budget is 0)
    pub percent_actual: Decimal,
}

impl LedgerSummary {
    /// Derive the summary fields from the three base totals
    pub fn compute(budget: Decimal, committed: Decimal, actual: Decimal) -> Self {
        Self {
            budget,
            committed,
            actual,
            remaining: budget - committed - actual,
            variance: budget - committed,
            percent_committed: percent_of(committed, budget),
            percent_actual: percent_of(actual, budget),
        }
    }
}

/// `part / whole * 100`, rounded to 2 dp; 0 when `whole` is 0
pub fn percent_of(part: Decimal, whole: Decimal) -> Decimal {
    if whole.is_zero() {
        return Decimal::ZERO;
    }
    (part / whole * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Totals for a single budget line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLineSummary {
    /// Budget line ID
    pub budget_line_id: BudgetLineId,
    /// Budget line code
    pub code: String,
    /// Budget line description
    pub description: String,
    /// Totals
    pub totals: LedgerSummary,
    /// Forecast final cost (passed through)
    pub forecast_final_cost: Option<Decimal>,
    /// Forecast cost to complete (passed through)
    pub forecast_to_complete: Option<Decimal>,
    /// Forecast variance (passed through)
    pub forecast_variance: Option<Decimal>,
}

/// Count and amount per source type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBreakdown {
    /// Source type code
    pub source_type: String,
    /// Number of active entries
    pub count: u64,
    /// Sum of active amounts
    pub amount: Decimal,
}
