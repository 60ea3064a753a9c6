//! Invoice to purchase order scoring
//!
//! Two strategies, tried in order:
//!
//! 1. **Direct**: the invoice quotes a PO reference that resolves to a
//!    matchable order (exact code, then case-insensitive substring). The
//!    resolved order is the only candidate.
//! 2. **Fuzzy**: every order in scope is scored on supplier, amount, date and
//!    shared keywords.

use super::{
    scoring::{
        days_between, keyword_overlap, percent_difference, percent_label, round2, ScoreCard,
    },
    MatchCandidate,
};
use crate::sources::{Invoice, MatchKind, MatchedSource, PurchaseOrder};
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// Baseline confidence of a quoted PO reference
const DIRECT_BASELINE: f64 = 70.0;

/// Upper bound of the keyword signal
const KEYWORD_POINTS: f64 = 15.0;

/// Resolve a quoted PO reference among matchable orders
pub(crate) fn resolve_reference<'a>(
    reference: &str,
    orders: &'a [PurchaseOrder],
) -> Option<&'a PurchaseOrder> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }

    if let Some(po) = orders.iter().find(|po| po.code == reference) {
        return Some(po);
    }

    let needle = reference.to_lowercase();
    orders
        .iter()
        .filter(|po| !po.code.is_empty())
        .filter(|po| {
            let code = po.code.to_lowercase();
            needle.contains(&code) || code.contains(&needle)
        })
        .min_by(|a, b| a.code.cmp(&b.code))
}

/// Score a direct (quoted reference) match
pub(crate) fn score_direct(invoice: &Invoice, po: &PurchaseOrder) -> MatchCandidate {
    let mut card = ScoreCard::new();
    card.add(
        "Reference",
        DIRECT_BASELINE,
        format!("Invoice quotes PO {}", po.code),
    );

    if same_supplier(invoice, po) {
        card.add("Supplier", 15.0, "Same supplier");
    }

    match percent_difference(invoice.gross, po.total) {
        Some(diff) if diff <= Decimal::new(5, 0) => card.add(
            "Amount",
            15.0,
            format!("Gross within {}% of PO total", percent_label(diff)),
        ),
        Some(diff) if diff <= Decimal::TEN => card.add(
            "Amount",
            8.0,
            format!("Gross within {}% of PO total", percent_label(diff)),
        ),
        Some(diff) => card.warn(format!(
            "Gross differs from PO total by {}%",
            percent_label(diff)
        )),
        None => card.warn(format!("PO {} has no total", po.code)),
    }

    candidate(po, MatchKind::Direct, card)
}

/// Score an order by weighted signals
pub(crate) fn score_fuzzy(invoice: &Invoice, po: &PurchaseOrder) -> MatchCandidate {
    let mut card = ScoreCard::new();

    match invoice.supplier_id {
        Some(_) if same_supplier(invoice, po) => card.add("Supplier", 40.0, "Same supplier"),
        Some(_) => card.add("Supplier", -20.0, "Different supplier"),
        None => card.add("Supplier", 0.0, "Invoice supplier unknown"),
    }

    match percent_difference(invoice.gross, po.total) {
        Some(diff) => {
            let points = if diff <= Decimal::new(5, 0) {
                30.0
            } else if diff <= Decimal::TEN {
                20.0
            } else if diff <= Decimal::new(20, 0) {
                10.0
            } else {
                0.0
            };
            let reason = format!("Gross {}% from PO total", percent_label(diff));
            card.add("Amount", points, reason);
        }
        None => card.warn(format!("PO {} has no total", po.code)),
    }

    if let (Some(issued), Some(ordered)) = (invoice.issue_date, po.order_date) {
        let days = days_between(issued, ordered);
        let points = match days {
            0..=30 => 15.0,
            31..=60 => 10.0,
            61..=90 => 5.0,
            _ => 0.0,
        };
        card.add("Date", points, format!("Invoice dated {} days from order", days));
    }

    let (fraction, shared) = keyword_overlap(&invoice.free_text(), &order_text(po));
    if !shared.is_empty() {
        card.add(
            "Keywords",
            round2(KEYWORD_POINTS * fraction),
            format!("Shared keywords: {}", shared.join(", ")),
        );
    }

    candidate(po, MatchKind::Fuzzy, card)
}

/// Descending score, then closer amount, then PO code
pub(crate) fn rank(
    invoice: &Invoice,
    orders: &[PurchaseOrder],
    mut candidates: Vec<MatchCandidate>,
) -> Vec<MatchCandidate> {
    let distance = |c: &MatchCandidate| {
        orders
            .iter()
            .find(|po| MatchedSource::PurchaseOrder(po.id) == c.source)
            .map(|po| (invoice.gross - po.total).abs())
            .unwrap_or(Decimal::MAX)
    };
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| distance(a).cmp(&distance(b)))
            .then_with(|| a.reference.cmp(&b.reference))
    });
    candidates
}

fn same_supplier(invoice: &Invoice, po: &PurchaseOrder) -> bool {
    matches!((invoice.supplier_id, po.supplier_id), (Some(a), Some(b)) if a == b)
}

fn order_text(po: &PurchaseOrder) -> String {
    let mut text = po.description.clone();
    for line in &po.line_descriptions {
        text.push(' ');
        text.push_str(line);
    }
    text
}

fn candidate(po: &PurchaseOrder, kind: MatchKind, card: ScoreCard) -> MatchCandidate {
    let (confidence, factors, warnings) = card.finish();
    MatchCandidate {
        source: MatchedSource::PurchaseOrder(po.id),
        kind,
        reference: po.code.clone(),
        confidence,
        factors,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::PurchaseOrderStatus;
    use crate::types::{Currency, ProjectId, SupplierId, TenantId};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn po(code: &str, supplier: Option<SupplierId>, total: Decimal) -> PurchaseOrder {
        PurchaseOrder {
            id: Uuid::now_v7(),
            tenant_id: TenantId::generate(),
            project_id: ProjectId::generate(),
            supplier_id: supplier,
            budget_line_id: None,
            code: code.to_string(),
            description: "Ready-mix concrete".to_string(),
            line_descriptions: vec!["C32/40 concrete pour, ground floor slab".to_string()],
            total,
            currency: Currency::GBP,
            status: PurchaseOrderStatus::Issued,
            order_date: NaiveDate::from_ymd_opt(2026, 3, 2),
        }
    }

    fn invoice(supplier: Option<SupplierId>, gross: Decimal) -> Invoice {
        Invoice {
            id: Uuid::now_v7(),
            tenant_id: TenantId::generate(),
            project_id: None,
            supplier_id: supplier,
            budget_line_id: None,
            number: "7781".to_string(),
            reference: None,
            description: Some("Concrete pour ground floor slab".to_string()),
            po_reference: None,
            raw_text: None,
            gross,
            net: gross,
            currency: Currency::GBP,
            issue_date: NaiveDate::from_ymd_opt(2026, 3, 2),
            approved_date: None,
            paid_date: None,
            match_exempt: false,
        }
    }

    #[test]
    fn test_resolve_reference_exact_then_substring() {
        let orders = vec![
            po("PO-0042", None, dec!(100)),
            po("PO-0420", None, dec!(100)),
        ];

        assert_eq!(
            resolve_reference("PO-0420", &orders).map(|p| p.code.as_str()),
            Some("PO-0420")
        );
        assert_eq!(
            resolve_reference("our ref po-0042 / site b", &orders).map(|p| p.code.as_str()),
            Some("PO-0042")
        );
        assert!(resolve_reference("  ", &orders).is_none());
        assert!(resolve_reference("PO-9999", &orders).is_none());
    }

    #[test]
    fn test_direct_score() {
        let supplier = SupplierId::generate();
        let order = po("PO-0042", Some(supplier), dec!(10000));

        let exact = score_direct(&invoice(Some(supplier), dec!(10000)), &order);
        assert_eq!(exact.confidence, 100.0);
        assert_eq!(exact.kind, MatchKind::Direct);

        let near = score_direct(&invoice(None, dec!(10800)), &order);
        assert_eq!(near.confidence, 78.0);

        let far = score_direct(&invoice(None, dec!(20000)), &order);
        assert_eq!(far.confidence, 70.0);
        assert_eq!(far.warnings.len(), 1);
    }

    #[test]
    fn test_fuzzy_amount_bands() {
        let supplier = SupplierId::generate();
        let order = po("PO-0042", Some(supplier), dec!(15000));

        let scored = score_fuzzy(&invoice(Some(supplier), dec!(14400)), &order);
        assert_eq!(scored.points_for("Amount"), Some(30.0));

        let scored = score_fuzzy(&invoice(Some(supplier), dec!(13800)), &order);
        assert_eq!(scored.points_for("Amount"), Some(20.0));

        let scored = score_fuzzy(&invoice(Some(supplier), dec!(12500)), &order);
        assert_eq!(scored.points_for("Amount"), Some(10.0));
    }

    #[test]
    fn test_amount_bands_use_exact_difference() {
        let supplier = SupplierId::generate();
        let order = po("PO-0042", Some(supplier), dec!(10000));

        // 5.004%, 10.004% and 20.004% each fall into the next band
        let scored = score_fuzzy(&invoice(Some(supplier), dec!(10500.40)), &order);
        assert_eq!(scored.points_for("Amount"), Some(20.0));

        let scored = score_fuzzy(&invoice(Some(supplier), dec!(11000.40)), &order);
        assert_eq!(scored.points_for("Amount"), Some(10.0));

        let scored = score_fuzzy(&invoice(Some(supplier), dec!(12000.40)), &order);
        assert_eq!(scored.points_for("Amount"), Some(0.0));

        let direct = score_direct(&invoice(None, dec!(10500.40)), &order);
        assert_eq!(direct.points_for("Amount"), Some(8.0));

        let direct = score_direct(&invoice(None, dec!(11000.40)), &order);
        assert_eq!(direct.points_for("Amount"), None);
        assert_eq!(direct.warnings.len(), 1);
    }

    #[test]
    fn test_fuzzy_supplier_mismatch_penalty() {
        let order = po("PO-0042", Some(SupplierId::generate()), dec!(10000));
        let scored = score_fuzzy(&invoice(Some(SupplierId::generate()), dec!(10000)), &order);

        assert_eq!(scored.points_for("Supplier"), Some(-20.0));
        // -20 + 30 amount + 15 date + keywords
        assert!(scored.confidence < 60.0);
    }

    #[test]
    fn test_rank_breaks_ties_on_amount_then_code() {
        let inv = invoice(None, dec!(1000));
        let orders = vec![
            po("PO-B", None, dec!(1010)),
            po("PO-A", None, dec!(1010)),
            po("PO-C", None, dec!(1001)),
        ];
        let candidates = orders
            .iter()
            .map(|o| {
                let mut c = score_direct(&inv, o);
                c.confidence = 80.0;
                c
            })
            .collect();

        let ranked = rank(&inv, &orders, candidates);
        let codes: Vec<&str> = ranked.iter().map(|c| c.reference.as_str()).collect();
        assert_eq!(codes, vec!["PO-C", "PO-A", "PO-B"]);
    }
}
