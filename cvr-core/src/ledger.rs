//! Ledger store: commitment / actual writes and aggregation queries
//!
//! This module ties together storage, configuration and metrics into the
//! high-level API used by controllers, lifecycle hooks, the matching engine
//! and the period reporter.
//!
//! # Example
//!
//! ```no_run
//! use cvr_core::{Config, Ledger, ProjectId, TenantId};
//!
//! fn main() -> cvr_core::Result<()> {
//!     let ledger = Ledger::open(Config::default())?;
//!     let summary = ledger.summary(TenantId::generate(), ProjectId::generate(), None)?;
//!     println!("remaining: {}", summary.remaining);
//!     Ok(())
//! }
//! ```

use crate::{
    hooks::LifecycleHooks,
    matching::MatchingEngine,
    metrics::Metrics,
    reporting::PeriodReporter,
    storage::{Storage, Tables, WriteBatch, WriteOp},
    types::{
        Actual, ActualKey, ActualSource, ActualStatus, BudgetLineId, BudgetLineSummary,
        Commitment, CommitmentSource, CommitmentStatus, EntryKind, LedgerSummary, NewActual,
        NewCommitment, ProjectId, SourceBreakdown, TenantId,
    },
    Config, Error, Result,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Attempts before a status change gives up against concurrent writers
const MAX_CAS_ATTEMPTS: usize = 8;

/// Main ledger interface
#[derive(Clone, Debug)]
pub struct Ledger {
    storage: Arc<Storage>,
    metrics: Arc<Metrics>,
    config: Arc<Config>,
}

impl Ledger {
    /// Open ledger with configuration
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = Arc::new(Storage::open(&config.storage)?);
        Self::with_storage(storage, config)
    }

    /// Build a ledger over an existing store handle
    pub fn with_storage(storage: Arc<Storage>, config: Config) -> Result<Self> {
        Ok(Self {
            storage,
            metrics: Arc::new(Metrics::new()?),
            config: Arc::new(config),
        })
    }

    /// Store handle
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lifecycle hooks bound to this ledger
    pub fn hooks(&self) -> LifecycleHooks {
        LifecycleHooks::new(self.clone())
    }

    /// Matching engine bound to this ledger
    pub fn matcher(&self) -> MatchingEngine {
        MatchingEngine::new(self.clone())
    }

    /// Period reporter bound to this ledger
    pub fn reporter(&self) -> PeriodReporter {
        PeriodReporter::new(self.clone())
    }

    // Commitments

    /// Record a commitment
    ///
    /// Fails with [`Error::DuplicateSource`] when an active commitment already
    /// holds the source key.
    pub fn create_commitment(&self, entry: NewCommitment) -> Result<Commitment> {
        self.validate_commitment(&entry)?;

        // Best-effort pre-check; the storage index decides.
        let key = entry.key();
        if let Some(existing) = self.storage.read(|t| t.commitment_keys.get(&key).copied()) {
            return Err(Error::DuplicateSource {
                source_type: key.source_type.as_str().to_string(),
                source_id: key.source_id,
                existing_id: existing,
            });
        }

        let row = build_commitment(entry);
        self.storage
            .commit(WriteOp::InsertCommitment(row.clone()).into())?;
        self.metrics.commitments_created.inc();
        log_commitment(&row);

        Ok(row)
    }

    /// Record several commitments in one batch
    ///
    /// Entries whose key is already active are left out; the rest land
    /// together or not at all. Returns the rows written.
    pub fn create_commitments(&self, entries: Vec<NewCommitment>) -> Result<Vec<Commitment>> {
        for entry in &entries {
            self.validate_commitment(entry)?;
        }

        let rows: Vec<Commitment> = self.storage.read(|t| {
            entries
                .into_iter()
                .filter(|e| !t.commitment_keys.contains_key(&e.key()))
                .map(build_commitment)
                .collect()
        });
        if rows.is_empty() {
            return Ok(rows);
        }

        let mut batch = WriteBatch::new();
        for row in &rows {
            batch.push(WriteOp::InsertCommitment(row.clone()));
        }
        self.storage.commit(batch)?;
        self.metrics.commitments_created.inc_by(rows.len() as u64);
        for row in &rows {
            log_commitment(row);
        }

        Ok(rows)
    }

    fn validate_commitment(&self, entry: &NewCommitment) -> Result<()> {
        if entry.amount.is_zero() {
            return Err(Error::InvalidInput(format!(
                "commitment for {} {} has zero amount",
                entry.source_type.as_str(),
                entry.source_id
            )));
        }
        self.check_budget_line(entry.tenant_id, entry.project_id, entry.budget_line_id)
    }

    /// Cancel a commitment (idempotent)
    pub fn cancel_commitment(&self, id: Uuid, cancelled_date: NaiveDate) -> Result<Commitment> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_commitment(id)?;
            if current.status == CommitmentStatus::Cancelled {
                return Ok(current);
            }

            let op = WriteOp::CancelCommitment {
                id,
                expected: current.status,
                cancelled_date,
            };
            match self.storage.commit(op.into()) {
                Ok(()) => {
                    self.metrics.status_transitions.inc();
                    tracing::info!(commitment_id = %id, "Commitment cancelled");
                    return self.get_commitment(id);
                }
                Err(Error::Conflict(reason)) => {
                    tracing::debug!(commitment_id = %id, %reason, "Retrying cancellation");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict(format!(
            "commitment {} kept changing during cancellation",
            id
        )))
    }

    /// Remove every commitment raised by a deleted source record
    ///
    /// Returns the number of rows removed.
    pub fn delete_commitments_for_source(
        &self,
        tenant_id: TenantId,
        source_type: CommitmentSource,
        source_id: Uuid,
    ) -> Result<usize> {
        let ids: Vec<Uuid> = self
            .commitments_for_source(tenant_id, source_type, source_id)
            .into_iter()
            .map(|c| c.id)
            .collect();

        let mut batch = WriteBatch::new();
        for id in &ids {
            batch.push(WriteOp::DeleteCommitment { id: *id });
        }
        self.storage.commit(batch)?;

        if !ids.is_empty() {
            tracing::info!(
                tenant_id = %tenant_id,
                source_type = source_type.as_str(),
                source_id = %source_id,
                removed = ids.len(),
                "Commitments removed with their source"
            );
        }
        Ok(ids.len())
    }

    /// Get commitment by ID
    pub fn get_commitment(&self, id: Uuid) -> Result<Commitment> {
        self.storage
            .read(|t| t.commitments.get(&id).cloned())
            .ok_or_else(|| Error::not_found("Commitment", id))
    }

    /// All commitments raised by a source record (every line, any status)
    pub fn commitments_for_source(
        &self,
        tenant_id: TenantId,
        source_type: CommitmentSource,
        source_id: Uuid,
    ) -> Vec<Commitment> {
        self.storage.read(|t| {
            t.commitments
                .values()
                .filter(|c| {
                    c.tenant_id == tenant_id
                        && c.source_type == source_type
                        && c.source_id == source_id
                })
                .cloned()
                .collect()
        })
    }

    /// Commitments of a project, oldest first
    pub fn commitments(&self, tenant_id: TenantId, project_id: ProjectId) -> Vec<Commitment> {
        let mut rows: Vec<Commitment> = self.storage.read(|t| {
            t.commitments
                .values()
                .filter(|c| c.tenant_id == tenant_id && c.project_id == project_id)
                .cloned()
                .collect()
        });
        rows.sort_by_key(|c| c.created_at);
        rows
    }

    // Actuals

    /// Record an actual
    ///
    /// The initial status follows the supplied dates: paid, else certified,
    /// else recorded.
    pub fn create_actual(&self, entry: NewActual) -> Result<Actual> {
        if entry.amount.is_zero() {
            return Err(Error::InvalidInput(format!(
                "actual for {} {} has zero amount",
                entry.source_type.as_str(),
                entry.source_id
            )));
        }
        self.check_budget_line(entry.tenant_id, entry.project_id, entry.budget_line_id)?;

        let key = entry.key();
        if let Some(existing) = self.storage.read(|t| t.actual_keys.get(&key).copied()) {
            return Err(Error::DuplicateSource {
                source_type: key.source_type.as_str().to_string(),
                source_id: key.source_id,
                existing_id: existing,
            });
        }

        let row = build_actual(entry);
        self.storage.commit(WriteOp::InsertActual(row.clone()).into())?;
        self.metrics.actuals_created.inc();

        tracing::info!(
            actual_id = %row.id,
            tenant_id = %row.tenant_id,
            source_type = row.source_type.as_str(),
            source_id = %row.source_id,
            status = %row.status,
            amount = %row.amount,
            "Actual recorded"
        );

        Ok(row)
    }

    /// Move an actual along its lifecycle
    ///
    /// Re-applying the current status is a no-op. Dates already on the row
    /// are kept unless a new one is supplied.
    pub fn advance_actual_status(
        &self,
        id: Uuid,
        status: ActualStatus,
        certified_date: Option<NaiveDate>,
        paid_date: Option<NaiveDate>,
    ) -> Result<Actual> {
        let today = Utc::now().date_naive();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get_actual(id)?;
            if current.status == status {
                return Ok(current);
            }
            if !current.status.can_transition_to(status) {
                return Err(Error::invalid_transition(current.status, status));
            }

            let certified_date = certified_date
                .or(current.certified_date)
                .or_else(|| (status == ActualStatus::Certified).then_some(today));
            let paid_date = paid_date
                .or(current.paid_date)
                .or_else(|| (status == ActualStatus::Paid).then_some(today));
            let reversed_date = if status == ActualStatus::Reversed {
                Some(today)
            } else {
                current.reversed_date
            };

            let op = WriteOp::UpdateActualStatus {
                id,
                expected: current.status,
                next: status,
                certified_date,
                paid_date,
                reversed_date,
            };
            match self.storage.commit(op.into()) {
                Ok(()) => {
                    self.metrics.status_transitions.inc();
                    tracing::info!(
                        actual_id = %id,
                        from = %current.status,
                        to = %status,
                        "Actual status advanced"
                    );
                    return self.get_actual(id);
                }
                Err(Error::Conflict(reason)) => {
                    tracing::debug!(actual_id = %id, %reason, "Retrying status change");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict(format!(
            "actual {} kept changing during status update",
            id
        )))
    }

    /// Allocate an unallocated actual to a budget line
    pub fn allocate_actual(&self, id: Uuid, budget_line_id: BudgetLineId) -> Result<Actual> {
        let current = self.get_actual(id)?;
        match current.budget_line_id {
            Some(existing) if existing == budget_line_id => return Ok(current),
            Some(existing) => {
                return Err(Error::InvalidInput(format!(
                    "actual {} is already allocated to budget line {}",
                    id, existing
                )))
            }
            None => {}
        }
        self.check_budget_line(current.tenant_id, current.project_id, Some(budget_line_id))?;

        self.storage
            .commit(WriteOp::AllocateActual { id, budget_line_id }.into())?;
        tracing::info!(actual_id = %id, budget_line_id = %budget_line_id, "Actual allocated");
        self.get_actual(id)
    }

    /// Get actual by ID
    pub fn get_actual(&self, id: Uuid) -> Result<Actual> {
        self.storage
            .read(|t| t.actuals.get(&id).cloned())
            .ok_or_else(|| Error::not_found("Actual", id))
    }

    /// Actual raised by a source record: the active one, else the latest reversed one
    pub fn actual_for_source(
        &self,
        tenant_id: TenantId,
        source_type: ActualSource,
        source_id: Uuid,
    ) -> Option<Actual> {
        let key = ActualKey {
            tenant_id,
            source_type,
            source_id,
        };
        self.storage.read(|t| t.actual_by_key(&key).cloned())
    }

    /// Actuals of a project, oldest first
    pub fn actuals(&self, tenant_id: TenantId, project_id: ProjectId) -> Vec<Actual> {
        let mut rows: Vec<Actual> = self.storage.read(|t| {
            t.actuals
                .values()
                .filter(|a| a.tenant_id == tenant_id && a.project_id == project_id)
                .cloned()
                .collect()
        });
        rows.sort_by_key(|a| a.created_at);
        rows
    }

    // Aggregation

    /// Budget / committed / actual summary for a project or one of its lines
    pub fn summary(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        budget_line_id: Option<BudgetLineId>,
    ) -> Result<LedgerSummary> {
        if let Some(line_id) = budget_line_id {
            self.check_budget_line(tenant_id, project_id, Some(line_id))?;
        }
        Ok(self.storage.read(|t| {
            let totals = ProjectTotals::scan(t, tenant_id, project_id, None);
            match budget_line_id {
                Some(line_id) => totals.line_summary(t, line_id),
                None => totals.project_summary(),
            }
        }))
    }

    /// Active entry count and amount per source type
    pub fn breakdown_by_source_type(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        kind: EntryKind,
    ) -> Vec<SourceBreakdown> {
        self.storage.read(|t| match kind {
            EntryKind::Commitment => {
                let mut groups: BTreeMap<CommitmentSource, (u64, Decimal)> = BTreeMap::new();
                for c in t.commitments.values().filter(|c| {
                    c.tenant_id == tenant_id && c.project_id == project_id && c.is_active()
                }) {
                    let group = groups.entry(c.source_type).or_default();
                    group.0 += 1;
                    group.1 += c.amount;
                }
                CommitmentSource::ALL
                    .iter()
                    .filter_map(|s| {
                        groups.get(s).map(|(count, amount)| SourceBreakdown {
                            source_type: s.as_str().to_string(),
                            count: *count,
                            amount: *amount,
                        })
                    })
                    .collect()
            }
            EntryKind::Actual => {
                let mut groups: BTreeMap<ActualSource, (u64, Decimal)> = BTreeMap::new();
                for a in t.actuals.values().filter(|a| {
                    a.tenant_id == tenant_id && a.project_id == project_id && a.is_active()
                }) {
                    let group = groups.entry(a.source_type).or_default();
                    group.0 += 1;
                    group.1 += a.amount;
                }
                ActualSource::ALL
                    .iter()
                    .filter_map(|s| {
                        groups.get(s).map(|(count, amount)| SourceBreakdown {
                            source_type: s.as_str().to_string(),
                            count: *count,
                            amount: *amount,
                        })
                    })
                    .collect()
            }
        })
    }

    /// Per budget line totals, ordered by line code
    pub fn by_budget_line(&self, tenant_id: TenantId, project_id: ProjectId) -> Vec<BudgetLineSummary> {
        self.storage.read(|t| {
            ProjectTotals::scan(t, tenant_id, project_id, None).line_summaries(t)
        })
    }

    /// Project totals restricted to entries dated on or before `as_of`
    pub(crate) fn totals_as_of(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        as_of: NaiveDate,
    ) -> (LedgerSummary, Vec<BudgetLineSummary>, UnallocatedTotals) {
        self.storage.read(|t| {
            let totals = ProjectTotals::scan(t, tenant_id, project_id, Some(as_of));
            (
                totals.project_summary(),
                totals.line_summaries(t),
                totals.unallocated(),
            )
        })
    }

    fn check_budget_line(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
        budget_line_id: Option<BudgetLineId>,
    ) -> Result<()> {
        let Some(line_id) = budget_line_id else {
            return Ok(());
        };
        // Lines the store has never seen are accepted; budgets are owned upstream.
        let foreign = self.storage.read(|t| {
            t.budget_lines
                .get(&line_id)
                .map(|l| l.tenant_id != tenant_id || l.project_id != project_id)
                .unwrap_or(false)
        });
        if foreign {
            return Err(Error::InvalidInput(format!(
                "budget line {} does not belong to project {}",
                line_id, project_id
            )));
        }
        Ok(())
    }
}

fn build_commitment(entry: NewCommitment) -> Commitment {
    Commitment {
        id: Uuid::now_v7(),
        tenant_id: entry.tenant_id,
        project_id: entry.project_id,
        budget_line_id: entry.budget_line_id,
        source_type: entry.source_type,
        source_id: entry.source_id,
        source_line: entry.source_line,
        amount: entry.amount,
        currency: entry.currency,
        status: CommitmentStatus::Committed,
        effective_date: entry.effective_date,
        cancelled_date: None,
        description: entry.description,
        reference: entry.reference,
        cost_code: entry.cost_code,
        created_at: Utc::now(),
    }
}

fn log_commitment(row: &Commitment) {
    tracing::info!(
        commitment_id = %row.id,
        tenant_id = %row.tenant_id,
        source_type = row.source_type.as_str(),
        source_id = %row.source_id,
        source_line = row.source_line,
        amount = %row.amount,
        "Commitment recorded"
    );
}

pub(crate) fn build_actual(entry: NewActual) -> Actual {
    let status = entry.initial_status();
    Actual {
        id: Uuid::now_v7(),
        tenant_id: entry.tenant_id,
        project_id: entry.project_id,
        budget_line_id: entry.budget_line_id,
        source_type: entry.source_type,
        source_id: entry.source_id,
        amount: entry.amount,
        currency: entry.currency,
        status,
        incurred_date: entry.incurred_date,
        certified_date: entry.certified_date,
        paid_date: entry.paid_date,
        reversed_date: None,
        description: entry.description,
        reference: entry.reference,
        cost_code: entry.cost_code,
        created_at: Utc::now(),
    }
}

/// Committed / actual amounts not allocated to any budget line
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct UnallocatedTotals {
    pub(crate) committed: Decimal,
    pub(crate) actual: Decimal,
}

/// One pass over the ledger tables for a project
struct ProjectTotals {
    budget: Decimal,
    committed: BTreeMap<Option<BudgetLineId>, Decimal>,
    actual: BTreeMap<Option<BudgetLineId>, Decimal>,
    tenant_id: TenantId,
    project_id: ProjectId,
}

impl ProjectTotals {
    fn scan(t: &Tables, tenant_id: TenantId, project_id: ProjectId, as_of: Option<NaiveDate>) -> Self {
        let in_scope = |date: NaiveDate| as_of.map_or(true, |cutoff| date <= cutoff);

        let budget = t
            .project_budget_lines(tenant_id, project_id)
            .iter()
            .map(|l| l.budget)
            .sum();

        let mut committed: BTreeMap<Option<BudgetLineId>, Decimal> = BTreeMap::new();
        for c in t.commitments.values() {
            if c.tenant_id == tenant_id
                && c.project_id == project_id
                && c.is_active()
                && in_scope(c.effective_date)
            {
                *committed.entry(c.budget_line_id).or_default() += c.amount;
            }
        }

        let mut actual: BTreeMap<Option<BudgetLineId>, Decimal> = BTreeMap::new();
        for a in t.actuals.values() {
            if a.tenant_id == tenant_id
                && a.project_id == project_id
                && a.is_active()
                && in_scope(a.incurred_date)
            {
                *actual.entry(a.budget_line_id).or_default() += a.amount;
            }
        }

        Self {
            budget,
            committed,
            actual,
            tenant_id,
            project_id,
        }
    }

    fn project_summary(&self) -> LedgerSummary {
        LedgerSummary::compute(
            self.budget,
            self.committed.values().copied().sum(),
            self.actual.values().copied().sum(),
        )
    }

    fn line_summary(&self, t: &Tables, line_id: BudgetLineId) -> LedgerSummary {
        let budget = t
            .budget_lines
            .get(&line_id)
            .map(|l| l.budget)
            .unwrap_or_default();
        LedgerSummary::compute(
            budget,
            self.committed.get(&Some(line_id)).copied().unwrap_or_default(),
            self.actual.get(&Some(line_id)).copied().unwrap_or_default(),
        )
    }

    fn line_summaries(&self, t: &Tables) -> Vec<BudgetLineSummary> {
        t.project_budget_lines(self.tenant_id, self.project_id)
            .into_iter()
            .map(|line| BudgetLineSummary {
                budget_line_id: line.id,
                code: line.code.clone(),
                description: line.description.clone(),
                totals: self.line_summary(t, line.id),
                forecast_final_cost: line.forecast_final_cost,
                forecast_to_complete: line.forecast_to_complete,
                forecast_variance: line.forecast_variance,
            })
            .collect()
    }

    fn unallocated(&self) -> UnallocatedTotals {
        UnallocatedTotals {
            committed: self.committed.get(&None).copied().unwrap_or_default(),
            actual: self.actual.get(&None).copied().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BudgetLine, Currency};
    use rust_decimal_macros::dec;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    struct Fixture {
        ledger: Ledger,
        tenant: TenantId,
        project: ProjectId,
        line: BudgetLineId,
    }

    fn fixture(budget: Decimal) -> Fixture {
        let ledger = Ledger::open(Config::default()).unwrap();
        let tenant = TenantId::generate();
        let project = ProjectId::generate();
        let line = BudgetLineId::generate();
        ledger.storage().put_budget_line(BudgetLine {
            id: line,
            tenant_id: tenant,
            project_id: project,
            code: "02-100".to_string(),
            description: "Groundworks".to_string(),
            budget,
            forecast_final_cost: Some(dec!(95000)),
            forecast_to_complete: None,
            forecast_variance: Some(dec!(5000)),
        }).unwrap();
        Fixture {
            ledger,
            tenant,
            project,
            line,
        }
    }

    fn commitment(f: &Fixture, source_type: CommitmentSource, amount: Decimal) -> NewCommitment {
        NewCommitment {
            tenant_id: f.tenant,
            project_id: f.project,
            budget_line_id: Some(f.line),
            source_type,
            source_id: Uuid::now_v7(),
            source_line: 0,
            amount,
            currency: Currency::GBP,
            effective_date: date(1),
            description: "Groundworks subcontract".to_string(),
            reference: None,
            cost_code: None,
        }
    }

    fn actual(f: &Fixture, source_type: ActualSource, amount: Decimal) -> NewActual {
        NewActual {
            tenant_id: f.tenant,
            project_id: f.project,
            budget_line_id: Some(f.line),
            source_type,
            source_id: Uuid::now_v7(),
            amount,
            currency: Currency::GBP,
            incurred_date: date(5),
            certified_date: None,
            paid_date: None,
            description: "Valuation".to_string(),
            reference: None,
            cost_code: None,
        }
    }

    #[test]
    fn test_duplicate_commitment_rejected() {
        let f = fixture(dec!(100000));
        let entry = commitment(&f, CommitmentSource::PurchaseOrder, dec!(5000));

        let first = f.ledger.create_commitment(entry.clone()).unwrap();
        let err = f.ledger.create_commitment(entry).unwrap_err();
        match err {
            Error::DuplicateSource { existing_id, .. } => assert_eq!(existing_id, first.id),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cancel_then_recreate() {
        let f = fixture(dec!(100000));
        let entry = commitment(&f, CommitmentSource::PurchaseOrder, dec!(5000));

        let first = f.ledger.create_commitment(entry.clone()).unwrap();
        let cancelled = f.ledger.cancel_commitment(first.id, date(10)).unwrap();
        assert_eq!(cancelled.status, CommitmentStatus::Cancelled);
        assert_eq!(cancelled.cancelled_date, Some(date(10)));

        // Idempotent
        let again = f.ledger.cancel_commitment(first.id, date(11)).unwrap();
        assert_eq!(again.cancelled_date, Some(date(10)));

        let mut corrected = entry;
        corrected.amount = dec!(5500);
        let second = f.ledger.create_commitment(corrected).unwrap();
        assert_ne!(second.id, first.id);

        let summary = f.ledger.summary(f.tenant, f.project, None).unwrap();
        assert_eq!(summary.committed, dec!(5500));
    }

    #[test]
    fn test_actual_initial_status_and_lifecycle() {
        let f = fixture(dec!(100000));
        let recorded = f
            .ledger
            .create_actual(actual(&f, ActualSource::Invoice, dec!(1000)))
            .unwrap();
        assert_eq!(recorded.status, ActualStatus::Recorded);

        let certified = f
            .ledger
            .advance_actual_status(recorded.id, ActualStatus::Certified, Some(date(7)), None)
            .unwrap();
        assert_eq!(certified.status, ActualStatus::Certified);
        assert_eq!(certified.certified_date, Some(date(7)));

        let paid = f
            .ledger
            .advance_actual_status(recorded.id, ActualStatus::Paid, None, Some(date(20)))
            .unwrap();
        assert_eq!(paid.certified_date, Some(date(7)));
        assert_eq!(paid.paid_date, Some(date(20)));

        let err = f
            .ledger
            .advance_actual_status(recorded.id, ActualStatus::Certified, None, None)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid transition: cannot move from PAID to CERTIFIED"
        );
    }

    #[test]
    fn test_reversal_is_idempotent_and_terminal() {
        let f = fixture(dec!(100000));
        let row = f
            .ledger
            .create_actual(actual(&f, ActualSource::DirectCost, dec!(300)))
            .unwrap();

        let reversed = f
            .ledger
            .advance_actual_status(row.id, ActualStatus::Reversed, None, None)
            .unwrap();
        assert_eq!(reversed.status, ActualStatus::Reversed);
        assert!(reversed.reversed_date.is_some());

        let again = f
            .ledger
            .advance_actual_status(row.id, ActualStatus::Reversed, None, None)
            .unwrap();
        assert_eq!(again.status, ActualStatus::Reversed);

        assert!(matches!(
            f.ledger
                .advance_actual_status(row.id, ActualStatus::Paid, None, None),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_summary_excludes_cancelled_and_reversed() {
        let f = fixture(dec!(100000));
        f.ledger
            .create_commitment(commitment(&f, CommitmentSource::Contract, dec!(40000)))
            .unwrap();
        let cancelled = f
            .ledger
            .create_commitment(commitment(&f, CommitmentSource::PurchaseOrder, dec!(9999)))
            .unwrap();
        f.ledger.cancel_commitment(cancelled.id, date(2)).unwrap();

        f.ledger
            .create_actual(actual(&f, ActualSource::Invoice, dec!(15000)))
            .unwrap();
        let reversed = f
            .ledger
            .create_actual(actual(&f, ActualSource::Invoice, dec!(7777)))
            .unwrap();
        f.ledger
            .advance_actual_status(reversed.id, ActualStatus::Reversed, None, None)
            .unwrap();

        let summary = f.ledger.summary(f.tenant, f.project, None).unwrap();
        assert_eq!(summary.budget, dec!(100000));
        assert_eq!(summary.committed, dec!(40000));
        assert_eq!(summary.actual, dec!(15000));
        assert_eq!(summary.remaining, dec!(45000));
        assert_eq!(summary.variance, dec!(60000));
        assert_eq!(summary.percent_committed, dec!(40));
        assert_eq!(summary.percent_actual, dec!(15));

        let line = f.ledger.summary(f.tenant, f.project, Some(f.line)).unwrap();
        assert_eq!(line, summary);
    }

    #[test]
    fn test_breakdown_by_source_type() {
        let f = fixture(dec!(100000));
        f.ledger
            .create_commitment(commitment(&f, CommitmentSource::Contract, dec!(40000)))
            .unwrap();
        f.ledger
            .create_commitment(commitment(&f, CommitmentSource::Variation, dec!(2000)))
            .unwrap();
        f.ledger
            .create_commitment(commitment(&f, CommitmentSource::Variation, dec!(-500)))
            .unwrap();

        let groups = f
            .ledger
            .breakdown_by_source_type(f.tenant, f.project, EntryKind::Commitment);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].source_type, "CONTRACT");
        assert_eq!(groups[1].source_type, "VARIATION");
        assert_eq!(groups[1].count, 2);
        assert_eq!(groups[1].amount, dec!(1500));

        assert!(f
            .ledger
            .breakdown_by_source_type(f.tenant, f.project, EntryKind::Actual)
            .is_empty());
    }

    #[test]
    fn test_by_budget_line_passes_forecast_through() {
        let f = fixture(dec!(100000));
        f.ledger
            .create_commitment(commitment(&f, CommitmentSource::Contract, dec!(25000)))
            .unwrap();

        let lines = f.ledger.by_budget_line(f.tenant, f.project);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].code, "02-100");
        assert_eq!(lines[0].totals.committed, dec!(25000));
        assert_eq!(lines[0].totals.remaining, dec!(75000));
        assert_eq!(lines[0].forecast_final_cost, Some(dec!(95000)));
        assert_eq!(lines[0].forecast_variance, Some(dec!(5000)));
    }

    #[test]
    fn test_budget_line_from_another_project_rejected() {
        let f = fixture(dec!(100000));
        let mut entry = commitment(&f, CommitmentSource::Contract, dec!(100));
        entry.project_id = ProjectId::generate();
        assert!(matches!(
            f.ledger.create_commitment(entry),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_allocate_actual_once() {
        let f = fixture(dec!(100000));
        let mut entry = actual(&f, ActualSource::Invoice, dec!(800));
        entry.budget_line_id = None;
        let row = f.ledger.create_actual(entry).unwrap();

        let allocated = f.ledger.allocate_actual(row.id, f.line).unwrap();
        assert_eq!(allocated.budget_line_id, Some(f.line));
        assert!(f.ledger.allocate_actual(row.id, f.line).is_ok());
        assert!(f
            .ledger
            .allocate_actual(row.id, BudgetLineId::generate())
            .is_err());
    }

    #[test]
    fn test_create_commitments_is_one_batch() {
        let f = fixture(dec!(100000));
        let kept = commitment(&f, CommitmentSource::Contract, dec!(30000));
        f.ledger.create_commitment(kept.clone()).unwrap();

        let mut foreign = commitment(&f, CommitmentSource::Contract, dec!(5000));
        foreign.project_id = ProjectId::generate();
        let err = f
            .ledger
            .create_commitments(vec![
                commitment(&f, CommitmentSource::Contract, dec!(10000)),
                foreign,
            ])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(f.ledger.storage().stats().commitments, 1);

        // Keys already active are left out
        let rows = f
            .ledger
            .create_commitments(vec![
                kept,
                commitment(&f, CommitmentSource::Contract, dec!(10000)),
            ])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(f.ledger.metrics().commitments_created.get(), 2);
    }

    #[test]
    fn test_concurrent_creates_on_one_key() {
        let f = fixture(dec!(100000));
        let entry = commitment(&f, CommitmentSource::PurchaseOrder, dec!(5000));

        let ledger = &f.ledger;
        let results: Vec<Result<Commitment>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let entry = entry.clone();
                    scope.spawn(move || ledger.create_commitment(entry))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(Error::is_duplicate));

        let stats = f.ledger.storage().stats();
        assert_eq!(stats.commitments, 1);
        assert_eq!(stats.active_commitments, 1);
        let summary = f.ledger.summary(f.tenant, f.project, None).unwrap();
        assert_eq!(summary.committed, dec!(5000));
    }

    #[test]
    fn test_concurrent_advances_settle_on_valid_status() {
        let f = fixture(dec!(100000));
        let row = f
            .ledger
            .create_actual(actual(&f, ActualSource::Invoice, dec!(1200)))
            .unwrap();
        let before = f.ledger.metrics().status_transitions.get();

        let targets = [
            ActualStatus::Certified,
            ActualStatus::Paid,
            ActualStatus::Reversed,
            ActualStatus::Reversed,
            ActualStatus::Certified,
            ActualStatus::Paid,
        ];
        let ledger = &f.ledger;
        let id = row.id;
        let results: Vec<Result<Actual>> = std::thread::scope(|scope| {
            let handles: Vec<_> = targets
                .iter()
                .map(|&target| {
                    scope.spawn(move || ledger.advance_actual_status(id, target, None, None))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // Losers only ever see a refused backward move
        for result in &results {
            if let Err(e) = result {
                assert!(matches!(e, Error::InvalidTransition { .. }), "{e}");
            }
        }

        let after = f.ledger.get_actual(row.id).unwrap();
        assert_eq!(after.status, ActualStatus::Reversed);
        assert!(after.reversed_date.is_some());
        // Recorded -> at most Certified -> Paid -> Reversed
        let transitions = f.ledger.metrics().status_transitions.get() - before;
        assert!((1..=3).contains(&transitions), "{transitions} transitions");

        let summary = f.ledger.summary(f.tenant, f.project, None).unwrap();
        assert_eq!(summary.actual, Decimal::ZERO);
    }

    #[test]
    fn test_summary_under_concurrent_writes() {
        let f = fixture(dec!(100000));
        let amount = dec!(250);
        let shared = actual(&f, ActualSource::DirectCost, amount);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        f.ledger
                            .create_actual(actual(&f, ActualSource::DirectCost, amount))
                            .unwrap();
                    }
                    // Every writer also races on one shared source
                    let _ = f.ledger.create_actual(shared.clone());
                });
            }
            scope.spawn(|| {
                for _ in 0..50 {
                    let summary = f.ledger.summary(f.tenant, f.project, None).unwrap();
                    assert!(summary.actual <= dec!(81) * amount);
                    assert_eq!(summary.actual % amount, Decimal::ZERO);
                    assert_eq!(summary.remaining, summary.budget - summary.actual);
                }
            });
        });

        let summary = f.ledger.summary(f.tenant, f.project, None).unwrap();
        assert_eq!(summary.actual, dec!(81) * amount);
        assert_eq!(f.ledger.storage().stats().actuals, 81);
    }
}
