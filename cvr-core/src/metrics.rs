//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `cvr_commitments_created_total` - Commitments recorded
//! - `cvr_actuals_created_total` - Actuals recorded
//! - `cvr_status_transitions_total` - Commitment/actual status changes
//! - `cvr_hook_failures_total` - Lifecycle hook failures (swallowed)
//! - `cvr_matches_confirmed_total` - Confirmed invoice matches
//! - `cvr_match_scoring_duration_seconds` - Candidate scoring latency
//! - `cvr_reports_created_total` - Period reports frozen

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::fmt;
use std::sync::Arc;

/// Metrics collector
///
/// Collectors are registered on a private registry so several ledgers can
/// live in one process (tests, multi-tenant hosts).
#[derive(Clone)]
pub struct Metrics {
    /// Commitments recorded
    pub commitments_created: IntCounter,

    /// Actuals recorded
    pub actuals_created: IntCounter,

    /// Status changes
    pub status_transitions: IntCounter,

    /// Hook failures
    pub hook_failures: IntCounter,

    /// Confirmed matches
    pub matches_confirmed: IntCounter,

    /// Scoring latency
    pub scoring_duration: Histogram,

    /// Reports frozen
    pub reports_created: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let commitments_created = IntCounter::new(
            "cvr_commitments_created_total",
            "Total number of commitments recorded",
        )?;
        registry.register(Box::new(commitments_created.clone()))?;

        let actuals_created =
            IntCounter::new("cvr_actuals_created_total", "Total number of actuals recorded")?;
        registry.register(Box::new(actuals_created.clone()))?;

        let status_transitions = IntCounter::new(
            "cvr_status_transitions_total",
            "Total number of commitment and actual status changes",
        )?;
        registry.register(Box::new(status_transitions.clone()))?;

        let hook_failures = IntCounter::new(
            "cvr_hook_failures_total",
            "Total number of lifecycle hook failures",
        )?;
        registry.register(Box::new(hook_failures.clone()))?;

        let matches_confirmed = IntCounter::new(
            "cvr_matches_confirmed_total",
            "Total number of confirmed invoice matches",
        )?;
        registry.register(Box::new(matches_confirmed.clone()))?;

        let scoring_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cvr_match_scoring_duration_seconds",
                "Histogram of candidate scoring latencies",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.010, 0.050, 0.100, 0.500]),
        )?;
        registry.register(Box::new(scoring_duration.clone()))?;

        let reports_created = IntCounter::new(
            "cvr_reports_created_total",
            "Total number of period reports frozen",
        )?;
        registry.register(Box::new(reports_created.clone()))?;

        Ok(Self {
            commitments_created,
            actuals_created,
            status_transitions,
            hook_failures,
            matches_confirmed,
            scoring_duration,
            reports_created,
            registry,
        })
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics")
            .field("commitments_created", &self.commitments_created.get())
            .field("actuals_created", &self.actuals_created.get())
            .field("matches_confirmed", &self.matches_confirmed.get())
            .finish_non_exhaustive()
    }
}
