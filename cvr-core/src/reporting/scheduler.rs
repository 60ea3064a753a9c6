//! Month-end snapshot scheduler
//!
//! On every tick each registered project gets a report for the last
//! completed calendar month (label `YYYY-MM`, period end = last day of that
//! month). A period that is already frozen is left alone, so ticks can run
//! as often as configured.

use super::{NewReport, PeriodReporter};
use crate::{
    types::{ProjectId, TenantId},
    Error,
};
use chrono::{Datelike, NaiveDate, Utc};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Outcome of one scheduler tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulerRun {
    /// Reports frozen by this tick
    pub created: usize,
    /// Projects whose period was already frozen
    pub already_frozen: usize,
    /// Per-project failures
    pub errors: Vec<(ProjectId, String)>,
}

/// Periodic report freezer
#[derive(Debug)]
pub struct PeriodScheduler {
    reporter: PeriodReporter,
    projects: RwLock<BTreeSet<(TenantId, ProjectId)>>,
}

impl PeriodScheduler {
    /// Create scheduler (no projects registered)
    pub fn new(reporter: PeriodReporter) -> Self {
        Self {
            reporter,
            projects: RwLock::new(BTreeSet::new()),
        }
    }

    /// Start freezing reports for a project
    pub fn register(&self, tenant_id: TenantId, project_id: ProjectId) {
        self.projects.write().insert((tenant_id, project_id));
    }

    /// Stop freezing reports for a project
    pub fn unregister(&self, tenant_id: TenantId, project_id: ProjectId) {
        self.projects.write().remove(&(tenant_id, project_id));
    }

    /// Freeze the last completed month for every registered project
    pub fn run_once(&self, today: NaiveDate) -> SchedulerRun {
        let mut run = SchedulerRun::default();
        let projects: Vec<(TenantId, ProjectId)> = self.projects.read().iter().copied().collect();

        let Some(period_end) = today.with_day(1).and_then(|first| first.pred_opt()) else {
            warn!(%today, "Cannot derive previous period end");
            return run;
        };
        let period = format!("{:04}-{:02}", period_end.year(), period_end.month());
        let created_by = self.reporter.ledger().config().reporting.system_user.clone();

        for (tenant_id, project_id) in projects {
            let request = NewReport {
                tenant_id,
                project_id,
                period: period.clone(),
                period_end,
                notes: None,
                created_by: created_by.clone(),
            };
            match self.reporter.create_report(request) {
                Ok(_) => run.created += 1,
                Err(Error::DuplicateReport(_)) => run.already_frozen += 1,
                Err(e) => {
                    warn!(
                        tenant_id = %tenant_id,
                        project_id = %project_id,
                        %period,
                        error = %e,
                        "Scheduled snapshot failed"
                    );
                    run.errors.push((project_id, e.to_string()));
                }
            }
        }

        debug!(
            %period,
            created = run.created,
            already_frozen = run.already_frozen,
            errors = run.errors.len(),
            "Scheduler tick finished"
        );
        run
    }

    /// Run on the configured interval until `shutdown` flips to true
    ///
    /// Returns `None` when reporting is disabled in the configuration.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let config = self.reporter.ledger().config().reporting.clone();
        if !config.enabled {
            info!("Period scheduler disabled");
            return None;
        }

        info!(interval_secs = config.interval_secs, "Starting period scheduler");
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let run = self.run_once(Utc::now().date_naive());
                        if run.created > 0 {
                            info!(created = run.created, "Period reports frozen");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Period scheduler stopped");
                            break;
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Ledger};

    #[test]
    fn test_run_once_freezes_previous_month_once() {
        let ledger = Ledger::open(Config::default()).unwrap();
        let scheduler = PeriodScheduler::new(ledger.reporter());
        let tenant = TenantId::generate();
        let project = ProjectId::generate();
        scheduler.register(tenant, project);

        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let first = scheduler.run_once(today);
        assert_eq!(first.created, 1);

        let second = scheduler.run_once(today.succ_opt().unwrap());
        assert_eq!(second.created, 0);
        assert_eq!(second.already_frozen, 1);

        let reports = ledger.reporter().list_reports(tenant, project);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].period, "2026-02");
        assert_eq!(
            reports[0].period_end,
            NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()
        );
        assert_eq!(reports[0].created_by, "system:period-scheduler");
    }

    #[test]
    fn test_january_rolls_back_a_year() {
        let ledger = Ledger::open(Config::default()).unwrap();
        let scheduler = PeriodScheduler::new(ledger.reporter());
        let tenant = TenantId::generate();
        let project = ProjectId::generate();
        scheduler.register(tenant, project);

        scheduler.run_once(NaiveDate::from_ymd_opt(2027, 1, 15).unwrap());
        let reports = ledger.reporter().list_reports(tenant, project);
        assert_eq!(reports[0].period, "2026-12");
    }

    #[tokio::test]
    async fn test_spawned_scheduler_ticks_and_stops() {
        let mut config = Config::default();
        config.reporting.enabled = true;
        config.reporting.interval_secs = 3600;
        let ledger = Ledger::open(config).unwrap();

        let scheduler = Arc::new(PeriodScheduler::new(ledger.reporter()));
        let tenant = TenantId::generate();
        let project = ProjectId::generate();
        scheduler.register(tenant, project);

        let (tx, rx) = watch::channel(false);
        let handle = scheduler.clone().spawn(rx).expect("scheduler enabled");

        // The first tick fires immediately
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(ledger.reporter().list_reports(tenant, project).len(), 1);
    }

    #[test]
    fn test_disabled_scheduler_does_not_spawn() {
        let ledger = Ledger::open(Config::default()).unwrap();
        let scheduler = Arc::new(PeriodScheduler::new(ledger.reporter()));
        let (_tx, rx) = watch::channel(false);
        assert!(scheduler.spawn(rx).is_none());
    }
}
