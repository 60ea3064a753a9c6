//! Lifecycle hooks
//!
//! One function per upstream transition (contract signed, PO approved,
//! invoice paid, ...). Hooks are:
//!
//! - **Idempotent**: a repeated call finds the source key already taken and
//!   reports [`HookOutcome::AlreadyRecorded`].
//! - **Non-fatal**: errors are logged and returned as
//!   [`HookOutcome::Failed`]; they never propagate into the business
//!   transition the hook is attached to.

use crate::{
    ledger::Ledger,
    sources::{
        ApplicationStatus, Contract, Invoice, PaymentApplication, PurchaseOrder,
        PurchaseOrderStatus, Variation,
    },
    types::{
        ActualSource, ActualStatus, CommitmentKey, CommitmentSource, NewActual, NewCommitment,
        TenantId,
    },
    Error, Result,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// Result of running a hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HookOutcome {
    /// New ledger rows were written
    Created(usize),
    /// An existing row changed status
    Updated,
    /// Nothing to do; the ledger already reflects the transition
    AlreadyRecorded,
    /// Nothing written, by rule (no value, no budget line, no prior entry)
    Skipped(String),
    /// The hook failed; the error was logged and swallowed
    Failed(String),
}

impl HookOutcome {
    /// Whether the hook failed
    pub fn is_failure(&self) -> bool {
        matches!(self, HookOutcome::Failed(_))
    }
}

/// Lifecycle hooks bound to a ledger
#[derive(Clone, Debug)]
pub struct LifecycleHooks {
    ledger: Ledger,
}

impl LifecycleHooks {
    /// Create hooks over a ledger
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    fn guard(
        &self,
        hook: &'static str,
        source_id: Uuid,
        run: impl FnOnce() -> Result<HookOutcome>,
    ) -> HookOutcome {
        match run() {
            Ok(outcome) => {
                tracing::debug!(hook, source_id = %source_id, ?outcome, "Lifecycle hook completed");
                outcome
            }
            Err(e) if e.is_duplicate() => {
                tracing::debug!(hook, source_id = %source_id, "Lifecycle hook already applied");
                HookOutcome::AlreadyRecorded
            }
            Err(Error::BudgetLineUnresolved(reason)) => {
                tracing::info!(hook, source_id = %source_id, %reason, "Skipping ledger write");
                HookOutcome::Skipped(reason)
            }
            Err(e) => {
                self.ledger.metrics().hook_failures.inc();
                tracing::warn!(hook, source_id = %source_id, error = %e, "Lifecycle hook failed");
                HookOutcome::Failed(e.to_string())
            }
        }
    }

    // Commitments

    /// Contract signed: one commitment per allocated line item, or one for the
    /// whole value through the contract's package when there are no line items
    pub fn on_contract_signed(&self, contract: &Contract) -> HookOutcome {
        self.guard("contract_signed", contract.id, || {
            let effective_date = contract.signed_date.unwrap_or_else(today);

            if contract.line_items.is_empty() {
                if contract.value <= Decimal::ZERO {
                    return Ok(HookOutcome::Skipped(format!(
                        "contract {} has no value",
                        contract.reference
                    )));
                }
                let budget_line_id = contract
                    .package_id
                    .and_then(|p| self.ledger.storage().package_budget_line(contract.tenant_id, p))
                    .ok_or_else(|| {
                        Error::BudgetLineUnresolved(format!(
                            "contract {} has no line items and no package budget line",
                            contract.reference
                        ))
                    })?;

                self.ledger.create_commitment(NewCommitment {
                    tenant_id: contract.tenant_id,
                    project_id: contract.project_id,
                    budget_line_id: Some(budget_line_id),
                    source_type: CommitmentSource::Contract,
                    source_id: contract.id,
                    source_line: 0,
                    amount: contract.value,
                    currency: contract.currency,
                    effective_date,
                    description: format!("Contract {}", contract.reference),
                    reference: Some(contract.reference.clone()),
                    cost_code: None,
                })?;
                return Ok(HookOutcome::Created(1));
            }

            // All allocated lines land in one batch
            let entries: Vec<NewCommitment> = contract
                .line_items
                .iter()
                .enumerate()
                .filter(|(_, item)| item.total > Decimal::ZERO)
                .filter_map(|(index, item)| {
                    let budget_line_id = item.budget_line_id?;
                    Some(NewCommitment {
                        tenant_id: contract.tenant_id,
                        project_id: contract.project_id,
                        budget_line_id: Some(budget_line_id),
                        source_type: CommitmentSource::Contract,
                        source_id: contract.id,
                        source_line: index as u32,
                        amount: item.total,
                        currency: contract.currency,
                        effective_date,
                        description: format!("{} - {}", contract.reference, item.description),
                        reference: Some(contract.reference.clone()),
                        cost_code: None,
                    })
                })
                .collect();

            if entries.is_empty() {
                return Err(Error::BudgetLineUnresolved(format!(
                    "contract {} has no allocated line items",
                    contract.reference
                )));
            }

            let created = self.ledger.create_commitments(entries)?.len();
            Ok(if created > 0 {
                HookOutcome::Created(created)
            } else {
                HookOutcome::AlreadyRecorded
            })
        })
    }

    /// Variation approved: commitment for the approved (else estimated, else raw) value
    pub fn on_variation_approved(&self, variation: &Variation) -> HookOutcome {
        self.guard("variation_approved", variation.id, || {
            let amount = match variation.committed_value() {
                Some(value) if !value.is_zero() => value,
                _ => {
                    return Ok(HookOutcome::Skipped(format!(
                        "variation {} has no value",
                        variation.reference
                    )))
                }
            };

            self.ledger.create_commitment(NewCommitment {
                tenant_id: variation.tenant_id,
                project_id: variation.project_id,
                budget_line_id: variation.budget_line_id,
                source_type: CommitmentSource::Variation,
                source_id: variation.id,
                source_line: 0,
                amount,
                currency: variation.currency,
                effective_date: variation.approved_date.unwrap_or_else(today),
                description: format!("{} - {}", variation.reference, variation.description),
                reference: Some(variation.reference.clone()),
                cost_code: None,
            })?;
            Ok(HookOutcome::Created(1))
        })
    }

    /// Purchase order approved: commitment for the PO total
    pub fn on_purchase_order_approved(&self, po: &PurchaseOrder) -> HookOutcome {
        self.guard("purchase_order_approved", po.id, || {
            if po.total <= Decimal::ZERO {
                return Ok(HookOutcome::Skipped(format!("PO {} has no value", po.code)));
            }

            self.ledger.create_commitment(NewCommitment {
                tenant_id: po.tenant_id,
                project_id: po.project_id,
                budget_line_id: po.budget_line_id,
                source_type: CommitmentSource::PurchaseOrder,
                source_id: po.id,
                source_line: 0,
                amount: po.total,
                currency: po.currency,
                effective_date: po.order_date.unwrap_or_else(today),
                description: if po.description.is_empty() {
                    format!("Purchase order {}", po.code)
                } else {
                    format!("{} - {}", po.code, po.description)
                },
                reference: Some(po.code.clone()),
                cost_code: None,
            })?;
            Ok(HookOutcome::Created(1))
        })
    }

    /// Purchase order cancelled: cancel its commitment, if any
    pub fn on_purchase_order_cancelled(&self, po: &PurchaseOrder) -> HookOutcome {
        self.guard("purchase_order_cancelled", po.id, || {
            let key = CommitmentKey {
                tenant_id: po.tenant_id,
                source_type: CommitmentSource::PurchaseOrder,
                source_id: po.id,
                source_line: 0,
            };
            let existing = self
                .ledger
                .storage()
                .read(|t| t.commitment_by_key(&key).cloned());

            match existing {
                None => Ok(HookOutcome::Skipped(format!(
                    "PO {} has no commitment",
                    po.code
                ))),
                Some(c) if !c.is_active() => Ok(HookOutcome::AlreadyRecorded),
                Some(c) => {
                    self.ledger.cancel_commitment(c.id, today())?;
                    Ok(HookOutcome::Updated)
                }
            }
        })
    }

    /// Upstream source deleted: remove the commitments it raised
    pub fn on_source_deleted(
        &self,
        tenant_id: TenantId,
        source_type: CommitmentSource,
        source_id: Uuid,
    ) -> HookOutcome {
        self.guard("source_deleted", source_id, || {
            let removed = self
                .ledger
                .delete_commitments_for_source(tenant_id, source_type, source_id)?;
            Ok(if removed > 0 {
                HookOutcome::Updated
            } else {
                HookOutcome::Skipped(format!("{} {} has no commitment", source_type.as_str(), source_id))
            })
        })
    }

    // Actuals

    /// Invoice received: recorded actual for the net amount
    pub fn on_invoice_created(&self, invoice: &Invoice) -> HookOutcome {
        self.guard("invoice_created", invoice.id, || {
            self.record_invoice(invoice, None, None)
        })
    }

    /// Invoice approved: advance its actual to certified
    pub fn on_invoice_approved(&self, invoice: &Invoice) -> HookOutcome {
        self.guard("invoice_approved", invoice.id, || {
            let certified = invoice.approved_date.unwrap_or_else(today);
            self.advance_or_record_invoice(invoice, ActualStatus::Certified, Some(certified), None)
        })
    }

    /// Invoice paid: advance its actual to paid
    pub fn on_invoice_paid(&self, invoice: &Invoice) -> HookOutcome {
        self.guard("invoice_paid", invoice.id, || {
            let paid = invoice.paid_date.unwrap_or_else(today);
            self.advance_or_record_invoice(
                invoice,
                ActualStatus::Paid,
                invoice.approved_date,
                Some(paid),
            )
        })
    }

    /// Invoice cancelled: reverse its actual
    pub fn on_invoice_cancelled(&self, invoice: &Invoice) -> HookOutcome {
        self.guard("invoice_cancelled", invoice.id, || {
            let existing =
                self.ledger
                    .actual_for_source(invoice.tenant_id, ActualSource::Invoice, invoice.id);
            match existing {
                None => Ok(HookOutcome::Skipped(format!(
                    "invoice {} has no actual",
                    invoice.number
                ))),
                Some(actual) if actual.status == ActualStatus::Reversed => {
                    Ok(HookOutcome::AlreadyRecorded)
                }
                Some(actual) => {
                    self.ledger
                        .advance_actual_status(actual.id, ActualStatus::Reversed, None, None)?;
                    Ok(HookOutcome::Updated)
                }
            }
        })
    }

    /// Application certified: certified (or paid) actual for the period amount
    pub fn on_payment_application_certified(&self, application: &PaymentApplication) -> HookOutcome {
        self.guard("payment_application_certified", application.id, || {
            self.record_application(application)
        })
    }

    /// Application paid: advance its actual to paid
    pub fn on_payment_application_paid(&self, application: &PaymentApplication) -> HookOutcome {
        self.guard("payment_application_paid", application.id, || {
            let existing = self.ledger.actual_for_source(
                application.tenant_id,
                ActualSource::PaymentApplication,
                application.id,
            );
            match existing {
                None => {
                    let mut paid = application.clone();
                    paid.paid_date = Some(application.paid_date.unwrap_or_else(today));
                    self.record_application(&paid)
                }
                Some(actual) => self.advance(
                    actual.id,
                    actual.status,
                    ActualStatus::Paid,
                    application.certified_date,
                    Some(application.paid_date.unwrap_or_else(today)),
                ),
            }
        })
    }

    fn record_invoice(
        &self,
        invoice: &Invoice,
        certified_date: Option<NaiveDate>,
        paid_date: Option<NaiveDate>,
    ) -> Result<HookOutcome> {
        let Some(project_id) = invoice.project_id else {
            return Ok(HookOutcome::Skipped(format!(
                "invoice {} is not coded to a project",
                invoice.number
            )));
        };
        if invoice.net.is_zero() {
            return Ok(HookOutcome::Skipped(format!(
                "invoice {} has no net amount",
                invoice.number
            )));
        }
        if let Some(outcome) =
            self.recorded(invoice.tenant_id, ActualSource::Invoice, invoice.id)
        {
            return Ok(outcome);
        }

        self.ledger.create_actual(NewActual {
            tenant_id: invoice.tenant_id,
            project_id,
            budget_line_id: invoice.budget_line_id,
            source_type: ActualSource::Invoice,
            source_id: invoice.id,
            amount: invoice.net,
            currency: invoice.currency,
            incurred_date: invoice.issue_date.unwrap_or_else(today),
            certified_date,
            paid_date,
            description: invoice
                .description
                .clone()
                .unwrap_or_else(|| format!("Invoice {}", invoice.number)),
            reference: Some(invoice.number.clone()),
            cost_code: None,
        })?;
        Ok(HookOutcome::Created(1))
    }

    fn advance_or_record_invoice(
        &self,
        invoice: &Invoice,
        target: ActualStatus,
        certified_date: Option<NaiveDate>,
        paid_date: Option<NaiveDate>,
    ) -> Result<HookOutcome> {
        match self
            .ledger
            .actual_for_source(invoice.tenant_id, ActualSource::Invoice, invoice.id)
        {
            None => self.record_invoice(invoice, certified_date, paid_date),
            Some(actual) => self.advance(actual.id, actual.status, target, certified_date, paid_date),
        }
    }

    // A reversed actual is terminal for its source: replays never record it again.
    fn recorded(
        &self,
        tenant_id: TenantId,
        source_type: ActualSource,
        source_id: Uuid,
    ) -> Option<HookOutcome> {
        let existing = self.ledger.actual_for_source(tenant_id, source_type, source_id)?;
        Some(if existing.status == ActualStatus::Reversed {
            HookOutcome::Skipped(format!("actual {} is reversed", existing.id))
        } else {
            HookOutcome::AlreadyRecorded
        })
    }

    fn advance(
        &self,
        actual_id: Uuid,
        current: ActualStatus,
        target: ActualStatus,
        certified_date: Option<NaiveDate>,
        paid_date: Option<NaiveDate>,
    ) -> Result<HookOutcome> {
        if current == ActualStatus::Reversed {
            return Ok(HookOutcome::Skipped(format!("actual {} is reversed", actual_id)));
        }
        // Late or repeated events for a state already passed are no-ops.
        if current == target || !current.can_transition_to(target) {
            return Ok(HookOutcome::AlreadyRecorded);
        }
        self.ledger
            .advance_actual_status(actual_id, target, certified_date, paid_date)?;
        Ok(HookOutcome::Updated)
    }

    fn record_application(&self, application: &PaymentApplication) -> Result<HookOutcome> {
        if let Some(outcome) = self.recorded(
            application.tenant_id,
            ActualSource::PaymentApplication,
            application.id,
        ) {
            return Ok(outcome);
        }
        let amount = match application.period_amount() {
            Some(amount) if !amount.is_zero() => amount,
            _ => {
                return Ok(HookOutcome::Skipped(format!(
                    "application {} has nothing due this period",
                    application.application_number
                )))
            }
        };

        let certified_date = application.certified_date.unwrap_or_else(today);
        let paid_date = application
            .is_paid()
            .then(|| application.paid_date.unwrap_or_else(today));

        self.ledger.create_actual(NewActual {
            tenant_id: application.tenant_id,
            project_id: application.project_id,
            budget_line_id: application.budget_line_id,
            source_type: ActualSource::PaymentApplication,
            source_id: application.id,
            amount,
            currency: application.currency,
            incurred_date: application.application_date,
            certified_date: Some(certified_date),
            paid_date,
            description: format!("Application for payment #{}", application.application_number),
            reference: application.code.clone(),
            cost_code: None,
        })?;
        Ok(HookOutcome::Created(1))
    }

    // Backfill

    /// Replay hooks over existing upstream records
    ///
    /// Restartable: every write is idempotent, so a re-run only touches
    /// records the previous run did not reach. Per-record failures are
    /// collected, never fatal.
    pub fn backfill(&self, sources: &BackfillSources) -> BackfillReport {
        let mut report = BackfillReport::default();

        for contract in &sources.contracts {
            report.tally(contract.id, self.on_contract_signed(contract));
        }
        for variation in &sources.variations {
            report.tally(variation.id, self.on_variation_approved(variation));
        }
        for po in &sources.purchase_orders {
            match po.status {
                PurchaseOrderStatus::Approved
                | PurchaseOrderStatus::Issued
                | PurchaseOrderStatus::Sent
                | PurchaseOrderStatus::Received
                | PurchaseOrderStatus::Closed => {
                    report.tally(po.id, self.on_purchase_order_approved(po))
                }
                PurchaseOrderStatus::Cancelled => {
                    report.tally(po.id, self.on_purchase_order_cancelled(po))
                }
                PurchaseOrderStatus::Draft | PurchaseOrderStatus::PendingApproval => {
                    report.tally(po.id, HookOutcome::Skipped(format!("PO {} not approved", po.code)))
                }
            }
        }
        for invoice in &sources.invoices {
            let outcome = if invoice.paid_date.is_some() {
                self.on_invoice_paid(invoice)
            } else if invoice.approved_date.is_some() {
                self.on_invoice_approved(invoice)
            } else {
                self.on_invoice_created(invoice)
            };
            report.tally(invoice.id, outcome);
        }
        for application in &sources.applications {
            let outcome = match application.status {
                ApplicationStatus::Paid => self.on_payment_application_paid(application),
                status if status.is_matchable() => {
                    self.on_payment_application_certified(application)
                }
                _ => HookOutcome::Skipped(format!(
                    "application {} not certified",
                    application.application_number
                )),
            };
            report.tally(application.id, outcome);
        }

        tracing::info!(
            created = report.created,
            updated = report.updated,
            already_recorded = report.already_recorded,
            skipped = report.skipped,
            failed = report.errors.len(),
            "Ledger backfill finished"
        );
        report
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

/// Upstream records to replay through [`LifecycleHooks::backfill`]
#[derive(Debug, Clone, Default)]
pub struct BackfillSources {
    /// Signed contracts
    pub contracts: Vec<Contract>,
    /// Approved variations
    pub variations: Vec<Variation>,
    /// Purchase orders (routed by status)
    pub purchase_orders: Vec<PurchaseOrder>,
    /// Invoices (routed by approval / payment dates)
    pub invoices: Vec<Invoice>,
    /// Applications for payment (routed by status)
    pub applications: Vec<PaymentApplication>,
}

/// Summary of a backfill run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    /// Ledger rows written
    pub created: usize,
    /// Rows whose status changed
    pub updated: usize,
    /// Records already reflected in the ledger
    pub already_recorded: usize,
    /// Records skipped by rule
    pub skipped: usize,
    /// Per-record failures
    pub errors: Vec<(Uuid, String)>,
}

impl BackfillReport {
    fn tally(&mut self, source_id: Uuid, outcome: HookOutcome) {
        match outcome {
            HookOutcome::Created(n) => self.created += n,
            HookOutcome::Updated => self.updated += 1,
            HookOutcome::AlreadyRecorded => self.already_recorded += 1,
            HookOutcome::Skipped(_) => self.skipped += 1,
            HookOutcome::Failed(message) => self.errors.push((source_id, message)),
        }
    }
}
