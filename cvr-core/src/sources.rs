//! Read models of upstream business objects
//!
//! These records are owned by their own workflows (contracts, procurement,
//! accounts payable). The ledger only reads them, and stamps a match
//! back-reference on invoices (see [`MatchStamp`]).

use crate::types::{BudgetLineId, Currency, PackageId, ProjectId, SupplierId, TenantId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priced line of a contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractLineItem {
    /// Budget line the item is allocated to
    pub budget_line_id: Option<BudgetLineId>,
    /// Line total
    pub total: Decimal,
    /// Line description
    pub description: String,
}

/// Subcontract / supply contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    /// Contract ID
    pub id: Uuid,
    /// Tenant
    pub tenant_id: TenantId,
    /// Project
    pub project_id: ProjectId,
    /// Contract reference (e.g. "SC-014")
    pub reference: String,
    /// Overall contract value
    pub value: Decimal,
    /// Currency
    pub currency: Currency,
    /// Procurement package the contract was let under
    pub package_id: Option<PackageId>,
    /// Priced line items
    pub line_items: Vec<ContractLineItem>,
    /// Date signed
    pub signed_date: Option<NaiveDate>,
}

/// Link between a procurement package and a budget line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageBudgetLink {
    /// Tenant
    pub tenant_id: TenantId,
    /// Package
    pub package_id: PackageId,
    /// Budget line
    pub budget_line_id: BudgetLineId,
}

/// Contract variation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    /// Variation ID
    pub id: Uuid,
    /// Tenant
    pub tenant_id: TenantId,
    /// Project
    pub project_id: ProjectId,
    /// Budget line
    pub budget_line_id: Option<BudgetLineId>,
    /// Variation reference (e.g. "VO-007")
    pub reference: String,
    /// Description
    pub description: String,
    /// Approved value
    pub approved_value: Option<Decimal>,
    /// Estimated value
    pub estimated_value: Option<Decimal>,
    /// Raw amount as submitted
    pub amount: Option<Decimal>,
    /// Currency
    pub currency: Currency,
    /// Date approved
    pub approved_date: Option<NaiveDate>,
}

impl Variation {
    /// Committed value: approved, else estimated, else raw amount
    pub fn committed_value(&self) -> Option<Decimal> {
        self.approved_value.or(self.estimated_value).or(self.amount)
    }
}

/// Purchase order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseOrderStatus {
    /// Being prepared
    Draft,
    /// Awaiting approval
    PendingApproval,
    /// Approved
    Approved,
    /// Issued to supplier
    Issued,
    /// Sent to supplier
    Sent,
    /// Goods received
    Received,
    /// Closed out
    Closed,
    /// Cancelled
    Cancelled,
}

impl PurchaseOrderStatus {
    /// Whether invoices may still be matched against the order
    pub fn is_matchable(&self) -> bool {
        matches!(
            self,
            PurchaseOrderStatus::Approved | PurchaseOrderStatus::Issued | PurchaseOrderStatus::Sent
        )
    }
}

/// Purchase order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseOrder {
    /// PO ID
    pub id: Uuid,
    /// Tenant
    pub tenant_id: TenantId,
    /// Project
    pub project_id: ProjectId,
    /// Supplier
    pub supplier_id: Option<SupplierId>,
    /// Budget line
    pub budget_line_id: Option<BudgetLineId>,
    /// PO code (e.g. "PO-2026-0042")
    pub code: String,
    /// Header description
    pub description: String,
    /// Line descriptions
    pub line_descriptions: Vec<String>,
    /// PO total
    pub total: Decimal,
    /// Currency
    pub currency: Currency,
    /// Status
    pub status: PurchaseOrderStatus,
    /// Order date
    pub order_date: Option<NaiveDate>,
}

/// Supplier invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Invoice ID
    pub id: Uuid,
    /// Tenant
    pub tenant_id: TenantId,
    /// Project, if known
    pub project_id: Option<ProjectId>,
    /// Supplier, if known
    pub supplier_id: Option<SupplierId>,
    /// Budget line, if coded on receipt
    pub budget_line_id: Option<BudgetLineId>,
    /// Supplier's invoice number
    pub number: String,
    /// Free-text reference
    pub reference: Option<String>,
    /// Description
    pub description: Option<String>,
    /// PO reference quoted on the invoice
    pub po_reference: Option<String>,
    /// Extracted document text
    pub raw_text: Option<String>,
    /// Gross amount (including tax)
    pub gross: Decimal,
    /// Net amount (excluding tax)
    pub net: Decimal,
    /// Currency
    pub currency: Currency,
    /// Issue date
    pub issue_date: Option<NaiveDate>,
    /// Approval date
    pub approved_date: Option<NaiveDate>,
    /// Payment date
    pub paid_date: Option<NaiveDate>,
    /// Excluded from automatic matching
    pub match_exempt: bool,
}

impl Invoice {
    /// Reference and description, the text an issuer controls
    pub fn own_text(&self) -> String {
        [self.reference.as_deref(), self.description.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// All free text available for keyword scoring
    pub fn free_text(&self) -> String {
        [
            self.reference.as_deref(),
            self.description.as_deref(),
            self.raw_text.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Application for payment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationStatus {
    /// Being prepared
    Draft,
    /// Submitted by the subcontractor
    Submitted,
    /// Certified by the QS
    Certified,
    /// Payment notice sent
    PaymentNoticeSent,
    /// Approved for payment
    Approved,
    /// Paid
    Paid,
    /// Rejected
    Rejected,
}

impl ApplicationStatus {
    /// Whether an invoice may be matched against the application
    pub fn is_matchable(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Certified
                | ApplicationStatus::PaymentNoticeSent
                | ApplicationStatus::Approved
        )
    }
}

/// Subcontractor application for payment (payment certificate)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentApplication {
    /// Application ID
    pub id: Uuid,
    /// Tenant
    pub tenant_id: TenantId,
    /// Project
    pub project_id: ProjectId,
    /// Supplier
    pub supplier_id: Option<SupplierId>,
    /// Budget line
    pub budget_line_id: Option<BudgetLineId>,
    /// Sequential application number
    pub application_number: u32,
    /// Application code (e.g. "AFP-SC014-07")
    pub code: Option<String>,
    /// Status
    pub status: ApplicationStatus,
    /// Certified this period
    pub certified_this_period: Option<Decimal>,
    /// Claimed this period
    pub claimed_this_period: Option<Decimal>,
    /// Currency
    pub currency: Currency,
    /// Application date
    pub application_date: NaiveDate,
    /// Certification date
    pub certified_date: Option<NaiveDate>,
    /// Payment date
    pub paid_date: Option<NaiveDate>,
}

impl PaymentApplication {
    /// Amount due this period: certified, else claimed
    pub fn period_amount(&self) -> Option<Decimal> {
        self.certified_this_period.or(self.claimed_this_period)
    }

    /// Whether the application has already been paid
    pub fn is_paid(&self) -> bool {
        self.status == ApplicationStatus::Paid || self.paid_date.is_some()
    }
}

/// Kind of source an invoice was matched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchedSource {
    /// Purchase order
    PurchaseOrder(Uuid),
    /// Application for payment
    PaymentApplication(Uuid),
}

impl MatchedSource {
    /// Source record ID
    pub fn id(&self) -> Uuid {
        match self {
            MatchedSource::PurchaseOrder(id) | MatchedSource::PaymentApplication(id) => *id,
        }
    }
}

/// How a match was established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchKind {
    /// Explicit PO reference on the invoice
    Direct,
    /// Weighted PO scoring
    Fuzzy,
    /// Certificate scoring
    Certificate,
}

/// Back-reference stamped on an invoice when a match is confirmed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchStamp {
    /// Invoice ID
    pub invoice_id: Uuid,
    /// Tenant
    pub tenant_id: TenantId,
    /// Matched source
    pub source: MatchedSource,
    /// Match kind
    pub kind: MatchKind,
    /// Confidence (0-100)
    pub confidence: f64,
    /// User or process that confirmed
    pub matched_by: String,
    /// Confirmation timestamp
    pub matched_at: DateTime<Utc>,
}
