//! Invoice to payment certificate scoring
//!
//! Applications are pre-filtered to the invoice supplier, so the supplier
//! signal is always awarded.

use super::{
    scoring::{days_between, percent_difference, percent_label, ScoreCard},
    MatchCandidate,
};
use crate::sources::{Invoice, MatchKind, MatchedSource, PaymentApplication};
use rust_decimal::Decimal;

/// Score an application for payment against an invoice
///
/// Compares the invoice net amount with the amount certified this period
/// (claimed when nothing is certified yet).
pub(crate) fn score_certificate(
    invoice: &Invoice,
    application: &PaymentApplication,
    stale_after_days: i64,
) -> MatchCandidate {
    let mut card = ScoreCard::new();

    match application
        .period_amount()
        .and_then(|amount| percent_difference(invoice.net, amount))
    {
        Some(diff) => {
            let points = if diff.is_zero() {
                40.0
            } else if diff <= Decimal::new(2, 0) {
                35.0
            } else if diff <= Decimal::new(5, 0) {
                25.0
            } else if diff <= Decimal::TEN {
                10.0
            } else {
                0.0
            };
            let reason = format!("Net {}% from certified amount", percent_label(diff));
            card.add("Amount", points, reason);
        }
        None => card.warn(format!(
            "Application #{} has no certified amount",
            application.application_number
        )),
    }

    card.add("Supplier", 30.0, "Same supplier");

    match reference_mention(invoice, application) {
        Mention::Full => card.add("Reference", 20.0, "Invoice quotes the application code"),
        Mention::Partial => card.add(
            "Reference",
            15.0,
            format!(
                "Invoice mentions application #{}",
                application.application_number
            ),
        ),
        Mention::None => {}
    }

    if let (Some(issued), Some(certified)) = (invoice.issue_date, application.certified_date) {
        let days = days_between(issued, certified);
        let points = match days {
            0..=7 => 10.0,
            8..=14 => 7.0,
            15..=30 => 3.0,
            _ => 0.0,
        };
        card.add("Date", points, format!("Invoice dated {} days from certificate", days));
        if days > stale_after_days {
            card.warn(format!("Certificate is {} days from the invoice date", days));
        }
    }

    let (confidence, factors, warnings) = card.finish();
    MatchCandidate {
        source: MatchedSource::PaymentApplication(application.id),
        kind: MatchKind::Certificate,
        reference: application
            .code
            .clone()
            .unwrap_or_else(|| format!("#{}", application.application_number)),
        confidence,
        factors,
        warnings,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Mention {
    Full,
    Partial,
    None,
}

// Only text the issuer wrote counts; extracted document text is too noisy.
fn reference_mention(invoice: &Invoice, application: &PaymentApplication) -> Mention {
    let text = invoice.own_text().to_lowercase();
    if text.is_empty() {
        return Mention::None;
    }

    if let Some(code) = application.code.as_deref() {
        let code = code.trim().to_lowercase();
        if !code.is_empty() && text.contains(&code) {
            return Mention::Full;
        }
    }

    let number = application.application_number.to_string();
    let mentions_number = text
        .split(|c: char| !c.is_alphanumeric())
        .any(|token| token.trim_start_matches('0') == number);
    if mentions_number {
        Mention::Partial
    } else {
        Mention::None
    }
}
