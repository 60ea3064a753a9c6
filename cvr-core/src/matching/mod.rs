//! Invoice matching engine
//!
//! Proposes purchase orders and payment certificates for supplier invoices,
//! confirms matches and runs the certificate auto-match batch.
//!
//! Scoring is pure and reads one consistent view of the store. The only
//! writes are [`MatchingEngine::confirm_match`] and
//! [`MatchingEngine::unmatch`], each committed as a single atomic batch.
//! All confidences are on the 0-100 scale.

mod certificate;
mod purchase_order;
pub mod scoring;

use crate::{
    ledger::{build_actual, Ledger},
    sources::{Invoice, MatchKind, MatchStamp, MatchedSource, PurchaseOrder},
    storage::{WriteBatch, WriteOp},
    types::{ActualKey, ActualSource, ActualStatus, NewActual, TenantId},
    Error, Result,
};
use chrono::Utc;
use scoring::ScoreFactor;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Proposed match for an invoice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    /// Purchase order or application for payment
    pub source: MatchedSource,
    /// Strategy that produced the candidate
    pub kind: MatchKind,
    /// PO code or application code
    pub reference: String,
    /// Confidence (0-100, 2 dp)
    pub confidence: f64,
    /// Signals behind the score
    pub factors: Vec<ScoreFactor>,
    /// Points a reviewer should check
    pub warnings: Vec<String>,
}

impl MatchCandidate {
    /// Explanations of the signals, in scoring order
    pub fn reasons(&self) -> Vec<&str> {
        self.factors.iter().map(|f| f.reason.as_str()).collect()
    }

    /// Points of the named signal, if it was recorded
    pub fn points_for(&self, name: &str) -> Option<f64> {
        self.factors.iter().find(|f| f.name == name).map(|f| f.points)
    }
}

/// What to do with the best PO candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchClassification {
    /// Confident enough to confirm without review
    Auto,
    /// Plausible, needs a reviewer
    Review,
    /// No usable candidate
    None,
}

/// Ranked purchase order candidates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoMatchResult {
    /// Candidates, best first (a direct match is returned alone)
    pub candidates: Vec<MatchCandidate>,
    /// Classification of the best candidate
    pub classification: MatchClassification,
}

impl PoMatchResult {
    /// Best candidate
    pub fn best(&self) -> Option<&MatchCandidate> {
        self.candidates.first()
    }
}

/// Outcome of an auto-match run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AutoMatchReport {
    /// Invoices matched by this run
    pub auto_matched: usize,
    /// Invoices whose best candidate fell below the threshold
    pub needs_review: usize,
    /// Invoices without any candidate
    pub no_match: usize,
    /// Per-invoice failures
    pub errors: Vec<(Uuid, String)>,
}

/// Matching engine bound to a ledger
#[derive(Clone, Debug)]
pub struct MatchingEngine {
    ledger: Ledger,
}

impl MatchingEngine {
    /// Create engine
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Rank purchase orders for an invoice
    ///
    /// A quoted PO reference that resolves short-circuits scoring. Fuzzy
    /// scope is the invoice project when known, otherwise its supplier.
    pub fn find_po_matches(&self, invoice: &Invoice) -> PoMatchResult {
        let timer = self.ledger.metrics().scoring_duration.start_timer();
        let config = &self.ledger.config().matching;

        let orders: Vec<PurchaseOrder> = self.ledger.storage().read(|t| {
            t.purchase_orders
                .values()
                .filter(|po| po.tenant_id == invoice.tenant_id && po.status.is_matchable())
                .cloned()
                .collect()
        });

        if let Some(reference) = invoice.po_reference.as_deref() {
            if let Some(po) = purchase_order::resolve_reference(reference, &orders) {
                let direct = purchase_order::score_direct(invoice, po);
                timer.observe_duration();
                tracing::debug!(
                    invoice_id = %invoice.id,
                    po_code = %po.code,
                    confidence = direct.confidence,
                    "Direct PO match"
                );
                return PoMatchResult {
                    classification: self.classify(direct.confidence),
                    candidates: vec![direct],
                };
            }
        }

        let in_scope: Vec<PurchaseOrder> = orders
            .into_iter()
            .filter(|po| match (invoice.project_id, invoice.supplier_id) {
                (Some(project), _) => po.project_id == project,
                (None, Some(supplier)) => po.supplier_id == Some(supplier),
                (None, None) => false,
            })
            .collect();

        let scored = in_scope
            .iter()
            .map(|po| purchase_order::score_fuzzy(invoice, po))
            .filter(|c| c.confidence >= config.candidate_floor)
            .collect();
        let candidates = purchase_order::rank(invoice, &in_scope, scored);
        timer.observe_duration();

        let classification = candidates
            .first()
            .map(|c| self.classify(c.confidence))
            .unwrap_or(MatchClassification::None);

        tracing::debug!(
            invoice_id = %invoice.id,
            scope = in_scope.len(),
            candidates = candidates.len(),
            ?classification,
            "Fuzzy PO matching finished"
        );

        PoMatchResult {
            candidates,
            classification,
        }
    }

    /// Rank certified applications for payment from the invoice supplier
    pub fn find_certificate_matches(&self, invoice: &Invoice) -> Vec<MatchCandidate> {
        let Some(supplier) = invoice.supplier_id else {
            return Vec::new();
        };
        let timer = self.ledger.metrics().scoring_duration.start_timer();
        let stale_after = self.ledger.config().matching.stale_certificate_days;

        let mut candidates: Vec<MatchCandidate> = self.ledger.storage().read(|t| {
            t.applications
                .values()
                .filter(|a| {
                    a.tenant_id == invoice.tenant_id
                        && a.supplier_id == Some(supplier)
                        && a.status.is_matchable()
                        && t
                            .stamp_for_source(&MatchedSource::PaymentApplication(a.id))
                            .is_none()
                })
                .map(|a| certificate::score_certificate(invoice, a, stale_after))
                .collect()
        });
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.reference.cmp(&b.reference))
        });
        timer.observe_duration();

        tracing::debug!(
            invoice_id = %invoice.id,
            candidates = candidates.len(),
            "Certificate matching finished"
        );
        candidates
    }

    /// Confirm a candidate for an invoice
    ///
    /// Stamps the invoice and, for purchase orders with a budget line,
    /// records (or allocates) the invoice actual in the same batch.
    pub fn confirm_match(
        &self,
        invoice_id: Uuid,
        candidate: &MatchCandidate,
        matched_by: &str,
    ) -> Result<MatchStamp> {
        let storage = self.ledger.storage();
        let invoice = storage.invoice(invoice_id)?;

        let stamp = MatchStamp {
            invoice_id,
            tenant_id: invoice.tenant_id,
            source: candidate.source,
            kind: candidate.kind,
            confidence: candidate.confidence,
            matched_by: matched_by.to_string(),
            matched_at: Utc::now(),
        };

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::StampInvoice(stamp.clone()));
        let mut actual_created = false;

        match candidate.source {
            MatchedSource::PurchaseOrder(po_id) => {
                let po = storage.purchase_order(po_id)?;
                if po.tenant_id != invoice.tenant_id || !po.status.is_matchable() {
                    return Err(Error::NotMatchable(format!(
                        "PO {} is not open for matching",
                        po.code
                    )));
                }
                actual_created = self.stage_invoice_actual(&invoice, &po, &mut batch)?;
            }
            MatchedSource::PaymentApplication(application_id) => {
                let application = storage.payment_application(application_id)?;
                if application.tenant_id != invoice.tenant_id || !application.status.is_matchable()
                {
                    return Err(Error::NotMatchable(format!(
                        "application #{} is not open for matching",
                        application.application_number
                    )));
                }
            }
        }

        storage.commit(batch)?;
        self.ledger.metrics().matches_confirmed.inc();
        if actual_created {
            self.ledger.metrics().actuals_created.inc();
        }

        tracing::info!(
            invoice_id = %invoice_id,
            source_id = %candidate.source.id(),
            kind = ?candidate.kind,
            confidence = candidate.confidence,
            matched_by,
            "Match confirmed"
        );
        Ok(stamp)
    }

    // Returns whether a new actual row was staged.
    fn stage_invoice_actual(
        &self,
        invoice: &Invoice,
        po: &PurchaseOrder,
        batch: &mut WriteBatch,
    ) -> Result<bool> {
        let existing =
            self.ledger
                .actual_for_source(invoice.tenant_id, ActualSource::Invoice, invoice.id);
        if existing
            .as_ref()
            .is_some_and(|a| a.status == ActualStatus::Reversed)
        {
            return Err(Error::NotMatchable(format!(
                "invoice {} actual was reversed",
                invoice.number
            )));
        }

        let Some(budget_line_id) = po.budget_line_id else {
            tracing::debug!(po_code = %po.code, "PO has no budget line, stamp only");
            return Ok(false);
        };

        match existing {
            Some(actual) if actual.budget_line_id.is_none() => {
                batch.push(WriteOp::AllocateActual {
                    id: actual.id,
                    budget_line_id,
                });
                Ok(false)
            }
            Some(_) => Ok(false),
            None if invoice.net.is_zero() => Ok(false),
            None => {
                batch.push(WriteOp::InsertActual(build_actual(NewActual {
                    tenant_id: invoice.tenant_id,
                    project_id: po.project_id,
                    budget_line_id: Some(budget_line_id),
                    source_type: ActualSource::Invoice,
                    source_id: invoice.id,
                    amount: invoice.net,
                    currency: invoice.currency,
                    incurred_date: invoice
                        .issue_date
                        .unwrap_or_else(|| Utc::now().date_naive()),
                    certified_date: invoice.approved_date,
                    paid_date: invoice.paid_date,
                    description: invoice
                        .description
                        .clone()
                        .unwrap_or_else(|| format!("Invoice {}", invoice.number)),
                    reference: Some(invoice.number.clone()),
                    cost_code: None,
                })));
                Ok(true)
            }
        }
    }

    /// Remove an invoice's match stamp
    ///
    /// The invoice actual stays unless `reverse_actual_on_unmatch` is set,
    /// in which case it is reversed in the same batch.
    pub fn unmatch(&self, invoice_id: Uuid) -> Result<MatchStamp> {
        let storage = self.ledger.storage();
        let stamp = storage
            .match_stamp(invoice_id)
            .ok_or_else(|| Error::not_found("Match", invoice_id))?;

        let mut batch = WriteBatch::new();
        batch.push(WriteOp::ClearStamp { invoice_id });

        let mut reversed = None;
        if self.ledger.config().matching.reverse_actual_on_unmatch {
            let key = ActualKey {
                tenant_id: stamp.tenant_id,
                source_type: ActualSource::Invoice,
                source_id: invoice_id,
            };
            if let Some(actual) = storage.read(|t| {
                t.actual_keys
                    .get(&key)
                    .and_then(|id| t.actuals.get(id))
                    .cloned()
            }) {
                batch.push(WriteOp::UpdateActualStatus {
                    id: actual.id,
                    expected: actual.status,
                    next: ActualStatus::Reversed,
                    certified_date: actual.certified_date,
                    paid_date: actual.paid_date,
                    reversed_date: Some(Utc::now().date_naive()),
                });
                reversed = Some(actual.id);
            }
        }

        storage.commit(batch)?;
        if reversed.is_some() {
            self.ledger.metrics().status_transitions.inc();
        }

        tracing::info!(
            invoice_id = %invoice_id,
            source_id = %stamp.source.id(),
            reversed_actual = ?reversed,
            "Match removed"
        );
        Ok(stamp)
    }

    /// Confirm the best certificate for every open invoice of a tenant
    ///
    /// Open means unmatched and not exempt. Candidates at or above
    /// `threshold` (default: `auto_match_threshold`) are confirmed; the rest
    /// are left for review. Re-running only touches invoices still open.
    pub fn auto_match(&self, tenant_id: TenantId, threshold: Option<f64>) -> AutoMatchReport {
        let config = &self.ledger.config().matching;
        let threshold = threshold.unwrap_or(config.auto_match_threshold);

        let open: Vec<Invoice> = self.ledger.storage().read(|t| {
            t.invoices
                .values()
                .filter(|i| {
                    i.tenant_id == tenant_id
                        && !i.match_exempt
                        && !t.match_stamps.contains_key(&i.id)
                })
                .cloned()
                .collect()
        });

        let mut report = AutoMatchReport::default();
        for invoice in &open {
            let candidates = self.find_certificate_matches(invoice);
            match candidates.first() {
                None => report.no_match += 1,
                Some(best) if best.confidence >= threshold => {
                    match self.confirm_match(invoice.id, best, &config.system_user) {
                        Ok(_) => report.auto_matched += 1,
                        Err(e) => {
                            tracing::warn!(
                                invoice_id = %invoice.id,
                                error = %e,
                                "Auto-match confirmation failed"
                            );
                            report.errors.push((invoice.id, e.to_string()));
                        }
                    }
                }
                Some(_) => report.needs_review += 1,
            }
        }

        tracing::info!(
            tenant_id = %tenant_id,
            threshold,
            invoices = open.len(),
            auto_matched = report.auto_matched,
            needs_review = report.needs_review,
            no_match = report.no_match,
            errors = report.errors.len(),
            "Auto-match finished"
        );
        report
    }

    fn classify(&self, confidence: f64) -> MatchClassification {
        let config = &self.ledger.config().matching;
        if confidence >= config.auto_threshold {
            MatchClassification::Auto
        } else if confidence >= config.review_threshold {
            MatchClassification::Review
        } else {
            MatchClassification::None
        }
    }
}
