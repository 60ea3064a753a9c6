//! Period snapshot reporter
//!
//! Freezes the ledger state of a project at a period end and moves the
//! resulting report through its review workflow:
//!
//! ```text
//! IN_PROGRESS -> SUBMITTED -> APPROVED
//!      ^             |
//!      |             v
//!      +-------- REJECTED
//! ```
//!
//! Reports can only be edited while IN_PROGRESS. Snapshots are immutable;
//! a refresh replaces the whole snapshot.

mod scheduler;
mod snapshot;

pub use scheduler::{PeriodScheduler, SchedulerRun};
pub use snapshot::{PeriodSnapshot, SNAPSHOT_VERSION};

use crate::{
    ledger::Ledger,
    storage::WriteOp,
    types::{BudgetLineId, LedgerSummary, ProjectId, TenantId},
    Error, Result,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Attempts before an update gives up against concurrent writers
const MAX_CAS_ATTEMPTS: usize = 8;

/// Report workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    /// Being prepared (editable)
    InProgress,
    /// Awaiting review
    Submitted,
    /// Signed off
    Approved,
    /// Sent back for rework
    Rejected,
}

impl ReportStatus {
    /// Status code
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::InProgress => "IN_PROGRESS",
            ReportStatus::Submitted => "SUBMITTED",
            ReportStatus::Approved => "APPROVED",
            ReportStatus::Rejected => "REJECTED",
        }
    }

    /// Check whether the workflow allows moving to `next`
    pub fn can_transition_to(&self, next: ReportStatus) -> bool {
        matches!(
            (self, next),
            (ReportStatus::InProgress, ReportStatus::Submitted)
                | (ReportStatus::Submitted, ReportStatus::Approved)
                | (ReportStatus::Submitted, ReportStatus::Rejected)
                | (ReportStatus::Rejected, ReportStatus::InProgress)
        )
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frozen period report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodReport {
    /// Report ID
    pub id: Uuid,
    /// Tenant
    pub tenant_id: TenantId,
    /// Project
    pub project_id: ProjectId,
    /// Period label (unique per project, e.g. "2026-03")
    pub period: String,
    /// Last day covered
    pub period_end: NaiveDate,
    /// Workflow status
    pub status: ReportStatus,
    /// Frozen ledger state
    pub snapshot: PeriodSnapshot,
    /// Commentary
    pub notes: Option<String>,
    /// Author
    pub created_by: String,
    /// Created at
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// Last submitter
    pub submitted_by: Option<String>,
    /// Last submission
    pub submitted_at: Option<DateTime<Utc>>,
    /// Last approver or rejecter
    pub reviewed_by: Option<String>,
    /// Last review
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Reason given on rejection
    pub rejection_reason: Option<String>,
}

/// Request to create a report
#[derive(Debug, Clone, PartialEq)]
pub struct NewReport {
    /// Tenant
    pub tenant_id: TenantId,
    /// Project
    pub project_id: ProjectId,
    /// Period label
    pub period: String,
    /// Last day covered
    pub period_end: NaiveDate,
    /// Commentary
    pub notes: Option<String>,
    /// Author
    pub created_by: String,
}

/// Edit to an in-progress report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportUpdate {
    /// Replace the commentary
    pub notes: Option<String>,
    /// Recapture the snapshot from current ledger state
    pub refresh_snapshot: bool,
}

/// Field-by-field change between two summaries (`to - from`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryDelta {
    /// Budget change
    pub budget: Decimal,
    /// Committed change
    pub committed: Decimal,
    /// Actual change
    pub actual: Decimal,
    /// Remaining change
    pub remaining: Decimal,
    /// Variance change
    pub variance: Decimal,
    /// Percent committed change (points)
    pub percent_committed: Decimal,
    /// Percent actual change (points)
    pub percent_actual: Decimal,
}

/// Change on one budget line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLineDelta {
    /// Budget line
    pub budget_line_id: BudgetLineId,
    /// Line code
    pub code: String,
    /// Totals change
    pub delta: SummaryDelta,
}

/// Comparison of two reports of one project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportComparison {
    /// Baseline report
    pub from_id: Uuid,
    /// Baseline period
    pub from_period: String,
    /// Compared report
    pub to_id: Uuid,
    /// Compared period
    pub to_period: String,
    /// Project totals change
    pub summary: SummaryDelta,
    /// Per line change, ordered by code (lines missing on one side count as zero)
    pub lines: Vec<BudgetLineDelta>,
    /// Unallocated committed change
    pub unallocated_committed: Decimal,
    /// Unallocated actual change
    pub unallocated_actual: Decimal,
}

/// Period reporter bound to a ledger
#[derive(Clone, Debug)]
pub struct PeriodReporter {
    ledger: Ledger,
}

impl PeriodReporter {
    /// Create reporter
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Freeze a new IN_PROGRESS report
    ///
    /// Fails with [`Error::DuplicateReport`] if the project already has a
    /// report for the period.
    pub fn create_report(&self, request: NewReport) -> Result<PeriodReport> {
        let period = request.period.trim().to_string();
        if period.is_empty() {
            return Err(Error::InvalidInput("report period is empty".to_string()));
        }

        let snapshot = PeriodSnapshot::capture(
            &self.ledger,
            request.tenant_id,
            request.project_id,
            request.period_end,
        )?;
        let now = Utc::now();
        let report = PeriodReport {
            id: Uuid::now_v7(),
            tenant_id: request.tenant_id,
            project_id: request.project_id,
            period,
            period_end: request.period_end,
            status: ReportStatus::InProgress,
            snapshot,
            notes: request.notes,
            created_by: request.created_by,
            created_at: now,
            updated_at: now,
            submitted_by: None,
            submitted_at: None,
            reviewed_by: None,
            reviewed_at: None,
            rejection_reason: None,
        };

        self.ledger.storage().commit(
            WriteOp::PutReport {
                report: report.clone(),
                expected: None,
            }
            .into(),
        )?;
        self.ledger.metrics().reports_created.inc();

        tracing::info!(
            report_id = %report.id,
            tenant_id = %report.tenant_id,
            project_id = %report.project_id,
            period = %report.period,
            committed = %report.snapshot.summary.committed,
            actual = %report.snapshot.summary.actual,
            "Period report created"
        );
        Ok(report)
    }

    /// Edit an IN_PROGRESS report
    pub fn update_report(&self, id: Uuid, update: ReportUpdate) -> Result<PeriodReport> {
        self.modify(id, |report| {
            if report.status != ReportStatus::InProgress {
                return Err(Error::ReportLocked {
                    id,
                    status: report.status.to_string(),
                });
            }
            if let Some(notes) = &update.notes {
                report.notes = Some(notes.clone());
            }
            if update.refresh_snapshot {
                report.snapshot = PeriodSnapshot::capture(
                    &self.ledger,
                    report.tenant_id,
                    report.project_id,
                    report.period_end,
                )?;
            }
            Ok(())
        })
    }

    /// Move a report through its workflow
    ///
    /// `reason` is recorded on rejection.
    pub fn update_report_status(
        &self,
        id: Uuid,
        next: ReportStatus,
        changed_by: &str,
        reason: Option<String>,
    ) -> Result<PeriodReport> {
        let report = self.modify(id, |report| {
            if !report.status.can_transition_to(next) {
                return Err(Error::invalid_transition(report.status, next));
            }
            let now = Utc::now();
            match next {
                ReportStatus::Submitted => {
                    report.submitted_by = Some(changed_by.to_string());
                    report.submitted_at = Some(now);
                }
                ReportStatus::Approved => {
                    report.reviewed_by = Some(changed_by.to_string());
                    report.reviewed_at = Some(now);
                }
                ReportStatus::Rejected => {
                    report.reviewed_by = Some(changed_by.to_string());
                    report.reviewed_at = Some(now);
                    report.rejection_reason = reason.clone();
                }
                ReportStatus::InProgress => {}
            }
            report.status = next;
            Ok(())
        })?;

        tracing::info!(report_id = %id, status = %next, changed_by, "Report status changed");
        Ok(report)
    }

    /// Change between two frozen reports of the same project (`to - from`)
    pub fn compare_reports(&self, from_id: Uuid, to_id: Uuid) -> Result<ReportComparison> {
        let from = self.get_report(from_id)?;
        let to = self.get_report(to_id)?;
        if from.tenant_id != to.tenant_id || from.project_id != to.project_id {
            return Err(Error::CrossProjectCompare {
                from: from.project_id.as_uuid(),
                to: to.project_id.as_uuid(),
            });
        }

        let (a, b) = (&from.snapshot, &to.snapshot);

        let mut codes: BTreeMap<BudgetLineId, String> = BTreeMap::new();
        let mut before = BTreeMap::new();
        let mut after = BTreeMap::new();
        for line in &a.lines {
            codes.insert(line.budget_line_id, line.code.clone());
            before.insert(line.budget_line_id, &line.totals);
        }
        for line in &b.lines {
            codes.insert(line.budget_line_id, line.code.clone());
            after.insert(line.budget_line_id, &line.totals);
        }

        let zero = LedgerSummary::default();
        let mut lines: Vec<BudgetLineDelta> = codes
            .into_iter()
            .map(|(budget_line_id, code)| BudgetLineDelta {
                budget_line_id,
                code,
                delta: summary_delta(
                    before.get(&budget_line_id).copied().unwrap_or(&zero),
                    after.get(&budget_line_id).copied().unwrap_or(&zero),
                ),
            })
            .collect();
        lines.sort_by(|x, y| x.code.cmp(&y.code));

        Ok(ReportComparison {
            from_id,
            from_period: from.period.clone(),
            to_id,
            to_period: to.period.clone(),
            summary: summary_delta(&a.summary, &b.summary),
            lines,
            unallocated_committed: b.unallocated_committed - a.unallocated_committed,
            unallocated_actual: b.unallocated_actual - a.unallocated_actual,
        })
    }

    /// Get a report, checking its snapshot digest
    pub fn get_report(&self, id: Uuid) -> Result<PeriodReport> {
        let report = self
            .ledger
            .storage()
            .read(|t| t.reports.get(&id).cloned())
            .ok_or_else(|| Error::not_found("Report", id))?;
        if !report.snapshot.verify() {
            tracing::error!(report_id = %id, "Report snapshot failed digest verification");
            return Err(Error::CorruptSnapshot(id));
        }
        Ok(report)
    }

    /// Reports of a project, by period end
    pub fn list_reports(&self, tenant_id: TenantId, project_id: ProjectId) -> Vec<PeriodReport> {
        let mut reports: Vec<PeriodReport> = self.ledger.storage().read(|t| {
            t.reports
                .values()
                .filter(|r| r.tenant_id == tenant_id && r.project_id == project_id)
                .cloned()
                .collect()
        });
        reports.sort_by(|a, b| {
            a.period_end
                .cmp(&b.period_end)
                .then_with(|| a.period.cmp(&b.period))
        });
        reports
    }

    pub(crate) fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // Read, edit, compare-and-swap on the observed status.
    fn modify(
        &self,
        id: Uuid,
        mut edit: impl FnMut(&mut PeriodReport) -> Result<()>,
    ) -> Result<PeriodReport> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut report = self.get_report(id)?;
            let expected = report.status;
            edit(&mut report)?;
            report.updated_at = Utc::now();

            let op = WriteOp::PutReport {
                report: report.clone(),
                expected: Some(expected),
            };
            match self.ledger.storage().commit(op.into()) {
                Ok(()) => return Ok(report),
                Err(Error::Conflict(reason)) => {
                    tracing::debug!(report_id = %id, %reason, "Retrying report update");
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!(
            "report {} kept changing during update",
            id
        )))
    }
}

fn summary_delta(from: &LedgerSummary, to: &LedgerSummary) -> SummaryDelta {
    SummaryDelta {
        budget: to.budget - from.budget,
        committed: to.committed - from.committed,
        actual: to.actual - from.actual,
        remaining: to.remaining - from.remaining,
        variance: to.variance - from.variance,
        percent_committed: to.percent_committed - from.percent_committed,
        percent_actual: to.percent_actual - from.percent_actual,
    }
}
