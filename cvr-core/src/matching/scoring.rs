//! Shared scoring primitives
//!
//! Every signal contributes a bounded number of points on the 0-100 scale
//! and leaves a [`ScoreFactor`] behind so reviewers can see why a candidate
//! scored the way it did. Everything here is pure.

use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Maximum confidence
pub const MAX_SCORE: f64 = 100.0;

/// Tokens ignored by keyword scoring
const STOP_WORDS: [&str; 32] = [
    "about", "above", "after", "again", "against", "amount", "before", "being", "below",
    "between", "could", "during", "goods", "invoice", "items", "order", "other", "payment",
    "please", "purchase", "services", "should", "their", "there", "these", "those", "through",
    "total", "under", "where", "which", "would",
];

/// Tokens up to this many characters never count as keywords
const MIN_KEYWORD_LEN: usize = 4;

/// One weighted signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreFactor {
    /// Signal name ("Supplier", "Amount", ...)
    pub name: String,
    /// Points contributed (negative for penalties)
    pub points: f64,
    /// Human-readable explanation
    pub reason: String,
}

/// Accumulates factors and warnings for one candidate
#[derive(Debug, Default, Clone)]
pub struct ScoreCard {
    factors: Vec<ScoreFactor>,
    warnings: Vec<String>,
}

impl ScoreCard {
    /// Empty card
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a signal (zero-point signals are kept for the explanation)
    pub fn add(&mut self, name: &str, points: f64, reason: impl Into<String>) {
        self.factors.push(ScoreFactor {
            name: name.to_string(),
            points,
            reason: reason.into(),
        });
    }

    /// Record a warning for the reviewer
    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Points of the named factor, if recorded
    pub fn points_for(&self, name: &str) -> Option<f64> {
        self.factors.iter().find(|f| f.name == name).map(|f| f.points)
    }

    /// Clamped, rounded total
    pub fn total(&self) -> f64 {
        let raw: f64 = self.factors.iter().map(|f| f.points).sum();
        round2(raw.clamp(0.0, MAX_SCORE))
    }

    /// Consume into (score, factors, warnings)
    pub fn finish(self) -> (f64, Vec<ScoreFactor>, Vec<String>) {
        (self.total(), self.factors, self.warnings)
    }
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `|amount - reference|` as a percentage of `reference`, unrounded
///
/// `None` when the reference is zero. Band checks compare this exact value;
/// round only for display with [`percent_label`].
pub fn percent_difference(amount: Decimal, reference: Decimal) -> Option<Decimal> {
    if reference.is_zero() {
        return None;
    }
    Some((amount - reference).abs() / reference.abs() * Decimal::ONE_HUNDRED)
}

/// Percentage rounded to 2 dp for reason text
pub fn percent_label(percent: Decimal) -> Decimal {
    percent
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .normalize()
}

/// Absolute distance in days
pub fn days_between(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days().abs()
}

/// Stop-word filtered keywords longer than four characters
pub fn keywords(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > MIN_KEYWORD_LEN)
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Fraction (0-1) of `text` keywords that also appear in `reference_text`
pub fn keyword_overlap(text: &str, reference_text: &str) -> (f64, Vec<String>) {
    let ours = keywords(text);
    if ours.is_empty() {
        return (0.0, Vec::new());
    }
    let theirs = keywords(reference_text);
    let shared: Vec<String> = ours.intersection(&theirs).cloned().collect();
    (shared.len() as f64 / ours.len() as f64, shared)
}
