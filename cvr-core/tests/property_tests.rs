//! Property-based tests for ledger invariants
//!
//! - Aggregation exclusion: cancelled / reversed rows never count
//! - Remaining is `budget - committed - actual`, never floored
//! - Monotonic lifecycle: actual status never moves backward
//! - Scoring determinism: same inputs, same candidates
//! - Idempotency: repeated hooks write one row

use chrono::NaiveDate;
use cvr_core::{
    sources::{Invoice, PurchaseOrder, PurchaseOrderStatus},
    types::{BudgetLine, NewActual, NewCommitment},
    ActualSource, ActualStatus, BudgetLineId, CommitmentSource, Config, Currency, Ledger,
    ProjectId, SupplierId, TenantId,
};
use proptest::prelude::*;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Strategy for non-zero amounts (may be negative, like credit variations)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    prop_oneof![
        (1i64..10_000_000i64).prop_map(|cents| Decimal::new(cents, 2)),
        (1i64..1_000_000i64).prop_map(|cents| Decimal::new(-cents, 2)),
    ]
}

/// Strategy for positive amounts
fn positive_amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..10_000_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

fn status_strategy() -> impl Strategy<Value = ActualStatus> {
    prop_oneof![
        Just(ActualStatus::Recorded),
        Just(ActualStatus::Certified),
        Just(ActualStatus::Paid),
        Just(ActualStatus::Reversed),
    ]
}

fn rank(status: ActualStatus) -> u8 {
    match status {
        ActualStatus::Recorded => 0,
        ActualStatus::Certified => 1,
        ActualStatus::Paid => 2,
        ActualStatus::Reversed => 3,
    }
}

struct Project {
    ledger: Ledger,
    tenant: TenantId,
    project: ProjectId,
    line: BudgetLineId,
}

fn project(budget: Decimal) -> Project {
    let ledger = Ledger::open(Config::default()).unwrap();
    let tenant = TenantId::generate();
    let project = ProjectId::generate();
    let line = BudgetLineId::generate();
    ledger.storage().put_budget_line(BudgetLine {
        id: line,
        tenant_id: tenant,
        project_id: project,
        code: "01-000".to_string(),
        description: "Preliminaries".to_string(),
        budget,
        forecast_final_cost: None,
        forecast_to_complete: None,
        forecast_variance: None,
    }).unwrap();
    Project {
        ledger,
        tenant,
        project,
        line,
    }
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 10).unwrap()
}

fn commitment(p: &Project, amount: Decimal) -> NewCommitment {
    NewCommitment {
        tenant_id: p.tenant,
        project_id: p.project,
        budget_line_id: Some(p.line),
        source_type: CommitmentSource::PurchaseOrder,
        source_id: Uuid::now_v7(),
        source_line: 0,
        amount,
        currency: Currency::GBP,
        effective_date: date(),
        description: "Site cabins".to_string(),
        reference: None,
        cost_code: None,
    }
}

fn actual(p: &Project, amount: Decimal) -> NewActual {
    NewActual {
        tenant_id: p.tenant,
        project_id: p.project,
        budget_line_id: Some(p.line),
        source_type: ActualSource::DirectCost,
        source_id: Uuid::now_v7(),
        amount,
        currency: Currency::GBP,
        incurred_date: date(),
        certified_date: None,
        paid_date: None,
        description: "Skip hire".to_string(),
        reference: None,
        cost_code: None,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: totals only include active rows
    #[test]
    fn prop_aggregation_excludes_inactive(
        commitments in prop::collection::vec((amount_strategy(), any::<bool>()), 0..12),
        actuals in prop::collection::vec((amount_strategy(), any::<bool>()), 0..12),
    ) {
        let p = project(Decimal::new(100_000, 0));
        let mut expected_committed = Decimal::ZERO;
        let mut expected_actual = Decimal::ZERO;

        for (amount, cancel) in &commitments {
            let row = p.ledger.create_commitment(commitment(&p, *amount)).unwrap();
            if *cancel {
                p.ledger.cancel_commitment(row.id, date()).unwrap();
            } else {
                expected_committed += *amount;
            }
        }
        for (amount, reverse) in &actuals {
            let row = p.ledger.create_actual(actual(&p, *amount)).unwrap();
            if *reverse {
                p.ledger
                    .advance_actual_status(row.id, ActualStatus::Reversed, None, None)
                    .unwrap();
            } else {
                expected_actual += *amount;
            }
        }

        let summary = p.ledger.summary(p.tenant, p.project, None).unwrap();
        prop_assert_eq!(summary.committed, expected_committed);
        prop_assert_eq!(summary.actual, expected_actual);

        let line = p.ledger.summary(p.tenant, p.project, Some(p.line)).unwrap();
        prop_assert_eq!(line, summary);
    }

    /// Property: remaining follows the formula, overspend goes negative
    #[test]
    fn prop_remaining_formula(
        budget in positive_amount_strategy(),
        committed in positive_amount_strategy(),
        spent in positive_amount_strategy(),
    ) {
        let p = project(budget);
        p.ledger.create_commitment(commitment(&p, committed)).unwrap();
        p.ledger.create_actual(actual(&p, spent)).unwrap();

        let summary = p.ledger.summary(p.tenant, p.project, None).unwrap();
        prop_assert_eq!(summary.remaining, budget - committed - spent);
        prop_assert_eq!(summary.variance, budget - committed);
    }

    /// Property: an actual never moves backward, REVERSED is terminal
    #[test]
    fn prop_lifecycle_is_monotonic(targets in prop::collection::vec(status_strategy(), 1..10)) {
        let p = project(Decimal::new(1_000, 0));
        let row = p.ledger.create_actual(actual(&p, Decimal::new(250, 0))).unwrap();
        let mut current = row.status;

        for target in targets {
            let result = p.ledger.advance_actual_status(row.id, target, None, None);
            let after = p.ledger.get_actual(row.id).unwrap().status;

            if target == current || current.can_transition_to(target) {
                prop_assert!(result.is_ok());
                prop_assert_eq!(after, target);
            } else {
                prop_assert!(result.is_err());
                prop_assert_eq!(after, current);
            }
            prop_assert!(rank(after) >= rank(current));
            current = after;
        }
    }

    /// Property: PO scoring is deterministic and bounded
    #[test]
    fn prop_po_scoring_is_deterministic(
        gross in positive_amount_strategy(),
        totals in prop::collection::vec(positive_amount_strategy(), 1..6),
        offsets in prop::collection::vec(0i64..120, 6),
        same_supplier in any::<bool>(),
    ) {
        let p = project(Decimal::new(1_000_000, 0));
        let supplier = SupplierId::generate();

        for (i, total) in totals.iter().enumerate() {
            p.ledger.storage().put_purchase_order(PurchaseOrder {
                id: Uuid::now_v7(),
                tenant_id: p.tenant,
                project_id: p.project,
                supplier_id: Some(if same_supplier { supplier } else { SupplierId::generate() }),
                budget_line_id: Some(p.line),
                code: format!("PO-{:04}", i),
                description: "Temporary works".to_string(),
                line_descriptions: vec!["Propping and shoring".to_string()],
                total: *total,
                currency: Currency::GBP,
                status: PurchaseOrderStatus::Issued,
                order_date: date().checked_add_signed(chrono::Duration::days(offsets[i])),
            }).unwrap();
        }

        let invoice = Invoice {
            id: Uuid::now_v7(),
            tenant_id: p.tenant,
            project_id: Some(p.project),
            supplier_id: Some(supplier),
            budget_line_id: None,
            number: "INV-1".to_string(),
            reference: None,
            description: Some("Shoring to basement".to_string()),
            po_reference: None,
            raw_text: None,
            gross,
            net: gross,
            currency: Currency::GBP,
            issue_date: Some(date()),
            approved_date: None,
            paid_date: None,
            match_exempt: false,
        };

        let engine = p.ledger.matcher();
        let first = engine.find_po_matches(&invoice);
        let second = engine.find_po_matches(&invoice);
        prop_assert_eq!(&first, &second);

        let floor = p.ledger.config().matching.candidate_floor;
        for pair in first.candidates.windows(2) {
            prop_assert!(pair[0].confidence >= pair[1].confidence);
        }
        for candidate in &first.candidates {
            prop_assert!(candidate.confidence >= floor);
            prop_assert!(candidate.confidence <= 100.0);
        }
    }

    /// Property: repeated invoice hooks record exactly one actual
    #[test]
    fn prop_invoice_hook_is_idempotent(net in positive_amount_strategy(), repeats in 1usize..5) {
        let p = project(Decimal::new(1_000_000, 0));
        let hooks = p.ledger.hooks();
        let invoice = Invoice {
            id: Uuid::now_v7(),
            tenant_id: p.tenant,
            project_id: Some(p.project),
            supplier_id: None,
            budget_line_id: Some(p.line),
            number: "INV-2".to_string(),
            reference: None,
            description: None,
            po_reference: None,
            raw_text: None,
            gross: net,
            net,
            currency: Currency::GBP,
            issue_date: Some(date()),
            approved_date: None,
            paid_date: None,
            match_exempt: false,
        };

        for _ in 0..repeats {
            prop_assert!(!hooks.on_invoice_created(&invoice).is_failure());
        }

        prop_assert_eq!(p.ledger.storage().stats().actuals, 1);
        let summary = p.ledger.summary(p.tenant, p.project, None).unwrap();
        prop_assert_eq!(summary.actual, net);
    }
}
