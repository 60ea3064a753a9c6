//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `commitments` / `actuals` - Ledger rows (key: row id)
//! - `indices` - Unique source index over *active* rows
//!   (key: tag || source key, value: row id)
//! - `budget_lines`, `package_links` - Budget read models
//! - `purchase_orders`, `invoices`, `applications` - Upstream read models
//! - `match_stamps` - Invoice back-references (key: invoice id)
//! - `reports` - Frozen period reports
//!
//! All ledger writes go through [`Storage::commit`]. A [`WriteBatch`] is
//! validated in full under the write lock, then the touched rows and index
//! entries land in one RocksDB write batch, so a batch either lands
//! completely or not at all and the unique source index is the
//! authoritative idempotency guard. The in-memory tables are a read cache
//! of the database.

use crate::{
    config::StorageConfig,
    error::{Error, Result},
    reporting::{PeriodReport, ReportStatus},
    sources::{
        Invoice, MatchStamp, MatchedSource, PackageBudgetLink, PaymentApplication, PurchaseOrder,
    },
    types::{
        Actual, ActualKey, ActualStatus, BudgetLine, BudgetLineId, Commitment, CommitmentKey,
        CommitmentStatus, ProjectId, TenantId,
    },
};
use chrono::NaiveDate;
use parking_lot::RwLock;
use rocksdb::{
    BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, IteratorMode,
    Options, WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use uuid::Uuid;

/// Column family names
const CF_COMMITMENTS: &str = "commitments";
const CF_ACTUALS: &str = "actuals";
const CF_INDICES: &str = "indices";
const CF_BUDGET_LINES: &str = "budget_lines";
const CF_PACKAGE_LINKS: &str = "package_links";
const CF_PURCHASE_ORDERS: &str = "purchase_orders";
const CF_INVOICES: &str = "invoices";
const CF_APPLICATIONS: &str = "applications";
const CF_MATCH_STAMPS: &str = "match_stamps";
const CF_REPORTS: &str = "reports";

const COLUMN_FAMILIES: [&str; 10] = [
    CF_COMMITMENTS,
    CF_ACTUALS,
    CF_INDICES,
    CF_BUDGET_LINES,
    CF_PACKAGE_LINKS,
    CF_PURCHASE_ORDERS,
    CF_INVOICES,
    CF_APPLICATIONS,
    CF_MATCH_STAMPS,
    CF_REPORTS,
];

/// Index entry tags
const INDEX_COMMITMENT: u8 = b'c';
const INDEX_ACTUAL: u8 = b'a';

/// Cached tables
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) budget_lines: BTreeMap<BudgetLineId, BudgetLine>,
    pub(crate) package_links: Vec<PackageBudgetLink>,
    pub(crate) commitments: BTreeMap<Uuid, Commitment>,
    pub(crate) commitment_keys: BTreeMap<CommitmentKey, Uuid>,
    pub(crate) actuals: BTreeMap<Uuid, Actual>,
    pub(crate) actual_keys: BTreeMap<ActualKey, Uuid>,
    pub(crate) purchase_orders: BTreeMap<Uuid, PurchaseOrder>,
    pub(crate) invoices: BTreeMap<Uuid, Invoice>,
    pub(crate) applications: BTreeMap<Uuid, PaymentApplication>,
    pub(crate) match_stamps: BTreeMap<Uuid, MatchStamp>,
    pub(crate) reports: BTreeMap<Uuid, PeriodReport>,
}

impl Tables {
    /// Commitment holding `key`: the active row, else the most recent inactive one
    pub(crate) fn commitment_by_key(&self, key: &CommitmentKey) -> Option<&Commitment> {
        if let Some(id) = self.commitment_keys.get(key) {
            return self.commitments.get(id);
        }
        self.commitments
            .values()
            .filter(|c| c.key() == *key)
            .max_by_key(|c| c.created_at)
    }

    /// Actual holding `key`: the active row, else the most recent reversed one
    pub(crate) fn actual_by_key(&self, key: &ActualKey) -> Option<&Actual> {
        if let Some(id) = self.actual_keys.get(key) {
            return self.actuals.get(id);
        }
        self.actuals
            .values()
            .filter(|a| a.key() == *key)
            .max_by_key(|a| a.created_at)
    }

    /// Stamp linking some invoice to `source`, if any
    pub(crate) fn stamp_for_source(&self, source: &MatchedSource) -> Option<&MatchStamp> {
        self.match_stamps.values().find(|s| s.source == *source)
    }

    /// Budget lines of a project, ordered by code
    pub(crate) fn project_budget_lines(
        &self,
        tenant_id: TenantId,
        project_id: ProjectId,
    ) -> Vec<&BudgetLine> {
        let mut lines: Vec<&BudgetLine> = self
            .budget_lines
            .values()
            .filter(|l| l.tenant_id == tenant_id && l.project_id == project_id)
            .collect();
        lines.sort_by(|a, b| a.code.cmp(&b.code));
        lines
    }

    fn check(&self, op: &WriteOp, pending: &mut Pending) -> Result<()> {
        match op {
            WriteOp::InsertCommitment(row) => {
                let key = row.key();
                if let Some(existing_id) = self.commitment_keys.get(&key) {
                    return Err(duplicate(key.source_type.as_str(), key.source_id, *existing_id));
                }
                if !pending.commitment_keys.insert(key) || self.commitments.contains_key(&row.id) {
                    return Err(duplicate(key.source_type.as_str(), key.source_id, row.id));
                }
            }
            WriteOp::CancelCommitment { id, expected, .. } => {
                let row = self
                    .commitments
                    .get(id)
                    .ok_or_else(|| Error::not_found("Commitment", *id))?;
                if row.status != *expected {
                    return Err(Error::Conflict(format!(
                        "commitment {} is {}, expected {}",
                        id, row.status, expected
                    )));
                }
            }
            WriteOp::DeleteCommitment { id } => {
                if !self.commitments.contains_key(id) {
                    return Err(Error::not_found("Commitment", *id));
                }
            }
            WriteOp::InsertActual(row) => {
                let key = row.key();
                if let Some(existing_id) = self.actual_keys.get(&key) {
                    return Err(duplicate(key.source_type.as_str(), key.source_id, *existing_id));
                }
                if !pending.actual_keys.insert(key) || self.actuals.contains_key(&row.id) {
                    return Err(duplicate(key.source_type.as_str(), key.source_id, row.id));
                }
            }
            WriteOp::UpdateActualStatus { id, expected, .. } => {
                let row = self
                    .actuals
                    .get(id)
                    .ok_or_else(|| Error::not_found("Actual", *id))?;
                if row.status != *expected {
                    return Err(Error::Conflict(format!(
                        "actual {} is {}, expected {}",
                        id, row.status, expected
                    )));
                }
            }
            WriteOp::AllocateActual { id, .. } => {
                let row = self
                    .actuals
                    .get(id)
                    .ok_or_else(|| Error::not_found("Actual", *id))?;
                if row.budget_line_id.is_some() {
                    return Err(Error::Conflict(format!("actual {} is already allocated", id)));
                }
            }
            WriteOp::StampInvoice(stamp) => {
                if !self.invoices.contains_key(&stamp.invoice_id) {
                    return Err(Error::not_found("Invoice", stamp.invoice_id));
                }
                if self.match_stamps.contains_key(&stamp.invoice_id)
                    || !pending.stamped_invoices.insert(stamp.invoice_id)
                {
                    return Err(Error::NotMatchable(format!(
                        "invoice {} is already matched",
                        stamp.invoice_id
                    )));
                }
                if let MatchedSource::PaymentApplication(application_id) = stamp.source {
                    if self.stamp_for_source(&stamp.source).is_some()
                        || !pending.linked_applications.insert(application_id)
                    {
                        return Err(Error::NotMatchable(format!(
                            "application {} is already linked to an invoice",
                            application_id
                        )));
                    }
                }
            }
            WriteOp::ClearStamp { invoice_id } => {
                if !self.match_stamps.contains_key(invoice_id) {
                    return Err(Error::not_found("Match", *invoice_id));
                }
            }
            WriteOp::PutReport { report, expected } => match expected {
                None => {
                    let period_taken = self.reports.values().any(|r| {
                        r.tenant_id == report.tenant_id
                            && r.project_id == report.project_id
                            && r.period == report.period
                    });
                    if period_taken
                        || self.reports.contains_key(&report.id)
                        || !pending
                            .report_periods
                            .insert((report.tenant_id, report.project_id, report.period.clone()))
                    {
                        return Err(Error::DuplicateReport(report.period.clone()));
                    }
                }
                Some(status) => {
                    let current = self
                        .reports
                        .get(&report.id)
                        .ok_or_else(|| Error::not_found("Report", report.id))?;
                    if current.status != *status {
                        return Err(Error::Conflict(format!(
                            "report {} is {}, expected {}",
                            report.id, current.status, status
                        )));
                    }
                }
            },
        }
        Ok(())
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::InsertCommitment(row) => {
                if row.is_active() {
                    self.commitment_keys.insert(row.key(), row.id);
                }
                self.commitments.insert(row.id, row);
            }
            WriteOp::CancelCommitment {
                id, cancelled_date, ..
            } => {
                if let Some(row) = self.commitments.get_mut(&id) {
                    row.status = CommitmentStatus::Cancelled;
                    row.cancelled_date = Some(cancelled_date);
                    let key = row.key();
                    if self.commitment_keys.get(&key) == Some(&id) {
                        self.commitment_keys.remove(&key);
                    }
                }
            }
            WriteOp::DeleteCommitment { id } => {
                if let Some(row) = self.commitments.remove(&id) {
                    let key = row.key();
                    if self.commitment_keys.get(&key) == Some(&id) {
                        self.commitment_keys.remove(&key);
                    }
                }
            }
            WriteOp::InsertActual(row) => {
                if row.is_active() {
                    self.actual_keys.insert(row.key(), row.id);
                }
                self.actuals.insert(row.id, row);
            }
            WriteOp::UpdateActualStatus {
                id,
                next,
                certified_date,
                paid_date,
                reversed_date,
                ..
            } => {
                if let Some(row) = self.actuals.get_mut(&id) {
                    row.status = next;
                    row.certified_date = certified_date;
                    row.paid_date = paid_date;
                    row.reversed_date = reversed_date;
                    if !next.is_active() {
                        let key = row.key();
                        if self.actual_keys.get(&key) == Some(&id) {
                            self.actual_keys.remove(&key);
                        }
                    }
                }
            }
            WriteOp::AllocateActual { id, budget_line_id } => {
                if let Some(row) = self.actuals.get_mut(&id) {
                    row.budget_line_id = Some(budget_line_id);
                }
            }
            WriteOp::StampInvoice(stamp) => {
                self.match_stamps.insert(stamp.invoice_id, stamp);
            }
            WriteOp::ClearStamp { invoice_id } => {
                self.match_stamps.remove(&invoice_id);
            }
            WriteOp::PutReport { report, .. } => {
                self.reports.insert(report.id, report);
            }
        }
    }
}

fn duplicate(source_type: &str, source_id: Uuid, existing_id: Uuid) -> Error {
    Error::DuplicateSource {
        source_type: source_type.to_string(),
        source_id,
        existing_id,
    }
}

/// Keys claimed by earlier operations of the batch being validated
#[derive(Default)]
struct Pending {
    commitment_keys: HashSet<CommitmentKey>,
    actual_keys: HashSet<ActualKey>,
    stamped_invoices: HashSet<Uuid>,
    linked_applications: HashSet<Uuid>,
    report_periods: HashSet<(TenantId, ProjectId, String)>,
}

/// Single write operation
///
/// Status-changing operations carry the status the caller observed; the
/// batch is rejected with [`Error::Conflict`] when another writer moved the
/// row first.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a commitment (unique on its source key while active)
    InsertCommitment(Commitment),
    /// Cancel a commitment
    CancelCommitment {
        /// Commitment ID
        id: Uuid,
        /// Status observed by the caller
        expected: CommitmentStatus,
        /// Cancellation date
        cancelled_date: NaiveDate,
    },
    /// Remove a commitment whose source was deleted
    DeleteCommitment {
        /// Commitment ID
        id: Uuid,
    },
    /// Insert an actual (unique on its source key while active)
    InsertActual(Actual),
    /// Move an actual through its lifecycle
    UpdateActualStatus {
        /// Actual ID
        id: Uuid,
        /// Status observed by the caller
        expected: ActualStatus,
        /// New status
        next: ActualStatus,
        /// Certified date after the update
        certified_date: Option<NaiveDate>,
        /// Paid date after the update
        paid_date: Option<NaiveDate>,
        /// Reversed date after the update
        reversed_date: Option<NaiveDate>,
    },
    /// Allocate an unallocated actual to a budget line
    AllocateActual {
        /// Actual ID
        id: Uuid,
        /// Budget line
        budget_line_id: BudgetLineId,
    },
    /// Stamp a match back-reference on an invoice
    StampInvoice(MatchStamp),
    /// Remove an invoice's match back-reference
    ClearStamp {
        /// Invoice ID
        invoice_id: Uuid,
    },
    /// Insert (`expected: None`) or replace a period report
    PutReport {
        /// Report
        report: PeriodReport,
        /// Status observed by the caller
        expected: Option<ReportStatus>,
    },
}

/// All-or-nothing group of write operations
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation
    pub fn push(&mut self, op: WriteOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

impl From<WriteOp> for WriteBatch {
    fn from(op: WriteOp) -> Self {
        Self { ops: vec![op] }
    }
}

/// Rows touched by a batch, captured before it is applied
#[derive(Default)]
struct Touched {
    commitments: BTreeSet<Uuid>,
    actuals: BTreeSet<Uuid>,
    match_stamps: BTreeSet<Uuid>,
    reports: BTreeSet<Uuid>,
    commitment_keys: BTreeSet<CommitmentKey>,
    actual_keys: BTreeSet<ActualKey>,
}

impl Touched {
    fn record(&mut self, tables: &Tables, op: &WriteOp) {
        match op {
            WriteOp::InsertCommitment(row) => {
                self.commitments.insert(row.id);
                self.commitment_keys.insert(row.key());
            }
            WriteOp::CancelCommitment { id, .. } | WriteOp::DeleteCommitment { id } => {
                self.commitments.insert(*id);
                if let Some(row) = tables.commitments.get(id) {
                    self.commitment_keys.insert(row.key());
                }
            }
            WriteOp::InsertActual(row) => {
                self.actuals.insert(row.id);
                self.actual_keys.insert(row.key());
            }
            WriteOp::UpdateActualStatus { id, .. } | WriteOp::AllocateActual { id, .. } => {
                self.actuals.insert(*id);
                if let Some(row) = tables.actuals.get(id) {
                    self.actual_keys.insert(row.key());
                }
            }
            WriteOp::StampInvoice(stamp) => {
                self.match_stamps.insert(stamp.invoice_id);
            }
            WriteOp::ClearStamp { invoice_id } => {
                self.match_stamps.insert(*invoice_id);
            }
            WriteOp::PutReport { report, .. } => {
                self.reports.insert(report.id);
            }
        }
    }

    fn capture(&self, tables: &Tables) -> Undo {
        Undo {
            commitments: saved(&self.commitments, &tables.commitments),
            actuals: saved(&self.actuals, &tables.actuals),
            match_stamps: saved(&self.match_stamps, &tables.match_stamps),
            reports: saved(&self.reports, &tables.reports),
            commitment_keys: saved(&self.commitment_keys, &tables.commitment_keys),
            actual_keys: saved(&self.actual_keys, &tables.actual_keys),
        }
    }
}

/// Prior values of touched rows (`None` = row did not exist)
struct Undo {
    commitments: Vec<(Uuid, Option<Commitment>)>,
    actuals: Vec<(Uuid, Option<Actual>)>,
    match_stamps: Vec<(Uuid, Option<MatchStamp>)>,
    reports: Vec<(Uuid, Option<PeriodReport>)>,
    commitment_keys: Vec<(CommitmentKey, Option<Uuid>)>,
    actual_keys: Vec<(ActualKey, Option<Uuid>)>,
}

impl Undo {
    fn restore(self, tables: &mut Tables) {
        restore(&mut tables.commitments, self.commitments);
        restore(&mut tables.actuals, self.actuals);
        restore(&mut tables.match_stamps, self.match_stamps);
        restore(&mut tables.reports, self.reports);
        restore(&mut tables.commitment_keys, self.commitment_keys);
        restore(&mut tables.actual_keys, self.actual_keys);
    }
}

fn saved<K: Ord + Clone, V: Clone>(
    keys: &BTreeSet<K>,
    table: &BTreeMap<K, V>,
) -> Vec<(K, Option<V>)> {
    keys.iter().map(|k| (k.clone(), table.get(k).cloned())).collect()
}

fn restore<K: Ord, V>(table: &mut BTreeMap<K, V>, saved: Vec<(K, Option<V>)>) {
    for (key, value) in saved {
        match value {
            Some(value) => {
                table.insert(key, value);
            }
            None => {
                table.remove(&key);
            }
        }
    }
}

/// Shared store handle
///
/// RocksDB is the durable copy; the tables behind the lock are a cache
/// loaded at open. One `Arc<Storage>` is injected into every component;
/// nothing in the crate reaches for a process-wide store.
pub struct Storage {
    tables: RwLock<Tables>,
    db: Option<DB>,
    config: StorageConfig,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("persistent", &self.db.is_some())
            .field("data_dir", &self.config.data_dir)
            .field("read_only", &self.config.read_only)
            .finish()
    }
}

impl Storage {
    /// Volatile store (tests, embedding callers that persist elsewhere)
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            db: None,
            config: StorageConfig::default(),
        }
    }

    /// Open the store
    ///
    /// With persistence enabled the RocksDB database under `data_dir` is
    /// opened (created if missing) and its rows loaded into the cache.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        if !config.persistent {
            return Ok(Self {
                tables: RwLock::new(Tables::default()),
                db: None,
                config: config.clone(),
            });
        }

        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let db_opts = Self::db_options(config);
        let db = if config.read_only {
            DB::open_cf_for_read_only(&db_opts, path, COLUMN_FAMILIES, false)?
        } else {
            let descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
                .iter()
                .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
                .collect();
            DB::open_cf_descriptors(&db_opts, path, descriptors)?
        };

        let tables = load_tables(&db)?;
        tracing::info!(
            path = %path.display(),
            read_only = config.read_only,
            commitments = tables.commitments.len(),
            actuals = tables.actuals.len(),
            reports = tables.reports.len(),
            "Opened ledger database"
        );

        Ok(Self {
            tables: RwLock::new(tables),
            db: Some(db),
            config: config.clone(),
        })
    }

    fn db_options(config: &StorageConfig) -> Options {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        if config.rocksdb.enable_statistics {
            opts.enable_statistics();
        }
        opts
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Lz4);
        if name == CF_INDICES {
            // Point lookups on source keys
            let mut block_opts = BlockBasedOptions::default();
            block_opts.set_bloom_filter(10.0, false);
            opts.set_block_based_table_factory(&block_opts);
        }
        opts
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Run a read-only closure against a consistent view of the tables
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> T {
        let tables = self.tables.read();
        f(&tables)
    }

    /// Apply a batch atomically
    ///
    /// Every operation is validated before the first one is applied, and the
    /// touched rows and index entries go to RocksDB in one write batch. If
    /// that write fails the cache is rolled back and the error returned, so
    /// nothing is reported as written that is not on disk.
    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write();
        let mut pending = Pending::default();
        for op in &batch.ops {
            tables.check(op, &mut pending)?;
        }

        let mut touched = Touched::default();
        for op in &batch.ops {
            touched.record(&tables, op);
        }
        let undo = touched.capture(&tables);

        let op_count = batch.ops.len();
        for op in batch.ops {
            tables.apply(op);
        }

        if let Err(e) = self.write_through(&tables, &touched) {
            undo.restore(&mut tables);
            tracing::error!(error = %e, op_count, "Write batch not persisted, rolled back");
            return Err(e);
        }

        tracing::trace!(op_count, "Write batch committed");
        Ok(())
    }

    fn write_through(&self, tables: &Tables, touched: &Touched) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };

        let mut batch = rocksdb::WriteBatch::default();
        let cf = cf_handle(db, CF_COMMITMENTS)?;
        stage_rows(&mut batch, cf, &touched.commitments, &tables.commitments)?;
        let cf = cf_handle(db, CF_ACTUALS)?;
        stage_rows(&mut batch, cf, &touched.actuals, &tables.actuals)?;
        let cf = cf_handle(db, CF_MATCH_STAMPS)?;
        stage_rows(&mut batch, cf, &touched.match_stamps, &tables.match_stamps)?;
        let cf = cf_handle(db, CF_REPORTS)?;
        stage_rows(&mut batch, cf, &touched.reports, &tables.reports)?;

        let cf_indices = cf_handle(db, CF_INDICES)?;
        for key in &touched.commitment_keys {
            let entry = index_key(INDEX_COMMITMENT, key)?;
            match tables.commitment_keys.get(key) {
                Some(id) => batch.put_cf(cf_indices, &entry, id.as_bytes()),
                None => batch.delete_cf(cf_indices, &entry),
            }
        }
        for key in &touched.actual_keys {
            let entry = index_key(INDEX_ACTUAL, key)?;
            match tables.actual_keys.get(key) {
                Some(id) => batch.put_cf(cf_indices, &entry, id.as_bytes()),
                None => batch.delete_cf(cf_indices, &entry),
            }
        }

        db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn put_row<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let cf = cf_handle(db, cf_name)?;
        db.put_cf_opt(cf, key, bincode::serialize(value)?, &self.write_options())?;
        Ok(())
    }

    // Read model registration (owned by upstream workflows)

    /// Insert or replace a budget line
    pub fn put_budget_line(&self, line: BudgetLine) -> Result<()> {
        let mut tables = self.tables.write();
        self.put_row(CF_BUDGET_LINES, line.id.as_uuid().as_bytes(), &line)?;
        tables.budget_lines.insert(line.id, line);
        Ok(())
    }

    /// Register a package to budget line link
    pub fn put_package_link(&self, link: PackageBudgetLink) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.package_links.contains(&link) {
            return Ok(());
        }
        let mut key = link.tenant_id.as_uuid().as_bytes().to_vec();
        key.extend_from_slice(link.package_id.as_uuid().as_bytes());
        key.extend_from_slice(link.budget_line_id.as_uuid().as_bytes());
        self.put_row(CF_PACKAGE_LINKS, &key, &link)?;
        tables.package_links.push(link);
        Ok(())
    }

    /// Insert or replace a purchase order
    pub fn put_purchase_order(&self, po: PurchaseOrder) -> Result<()> {
        let mut tables = self.tables.write();
        self.put_row(CF_PURCHASE_ORDERS, po.id.as_bytes(), &po)?;
        tables.purchase_orders.insert(po.id, po);
        Ok(())
    }

    /// Insert or replace an invoice
    pub fn put_invoice(&self, invoice: Invoice) -> Result<()> {
        let mut tables = self.tables.write();
        self.put_row(CF_INVOICES, invoice.id.as_bytes(), &invoice)?;
        tables.invoices.insert(invoice.id, invoice);
        Ok(())
    }

    /// Insert or replace an application for payment
    pub fn put_payment_application(&self, application: PaymentApplication) -> Result<()> {
        let mut tables = self.tables.write();
        self.put_row(CF_APPLICATIONS, application.id.as_bytes(), &application)?;
        tables.applications.insert(application.id, application);
        Ok(())
    }

    /// Get a budget line
    pub fn budget_line(&self, id: BudgetLineId) -> Result<BudgetLine> {
        self.read(|t| t.budget_lines.get(&id).cloned())
            .ok_or_else(|| Error::not_found("BudgetLine", id.as_uuid()))
    }

    /// Get an invoice
    pub fn invoice(&self, id: Uuid) -> Result<Invoice> {
        self.read(|t| t.invoices.get(&id).cloned())
            .ok_or_else(|| Error::not_found("Invoice", id))
    }

    /// Get a purchase order
    pub fn purchase_order(&self, id: Uuid) -> Result<PurchaseOrder> {
        self.read(|t| t.purchase_orders.get(&id).cloned())
            .ok_or_else(|| Error::not_found("PurchaseOrder", id))
    }

    /// Get an application for payment
    pub fn payment_application(&self, id: Uuid) -> Result<PaymentApplication> {
        self.read(|t| t.applications.get(&id).cloned())
            .ok_or_else(|| Error::not_found("PaymentApplication", id))
    }

    /// Match stamp on an invoice, if any
    pub fn match_stamp(&self, invoice_id: Uuid) -> Option<MatchStamp> {
        self.read(|t| t.match_stamps.get(&invoice_id).cloned())
    }

    /// First budget line linked to a package
    pub fn package_budget_line(
        &self,
        tenant_id: TenantId,
        package_id: crate::types::PackageId,
    ) -> Option<BudgetLineId> {
        self.read(|t| {
            t.package_links
                .iter()
                .find(|l| l.tenant_id == tenant_id && l.package_id == package_id)
                .map(|l| l.budget_line_id)
        })
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        self.read(|t| StorageStats {
            commitments: t.commitments.len() as u64,
            active_commitments: t.commitment_keys.len() as u64,
            actuals: t.actuals.len() as u64,
            active_actuals: t.actual_keys.len() as u64,
            match_stamps: t.match_stamps.len() as u64,
            reports: t.reports.len() as u64,
        })
    }
}

// Column family helpers

fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
}

fn stage_rows<T: Serialize>(
    batch: &mut rocksdb::WriteBatch,
    cf: &ColumnFamily,
    ids: &BTreeSet<Uuid>,
    table: &BTreeMap<Uuid, T>,
) -> Result<()> {
    for id in ids {
        match table.get(id) {
            Some(row) => batch.put_cf(cf, id.as_bytes(), bincode::serialize(row)?),
            None => batch.delete_cf(cf, id.as_bytes()),
        }
    }
    Ok(())
}

// Index key: tag || bincode(source key)
fn index_key<K: Serialize>(tag: u8, key: &K) -> Result<Vec<u8>> {
    let mut bytes = vec![tag];
    bytes.extend(bincode::serialize(key)?);
    Ok(bytes)
}

fn scan<T: DeserializeOwned>(db: &DB, name: &str) -> Result<Vec<T>> {
    let cf = cf_handle(db, name)?;
    let mut rows = Vec::new();
    for item in db.iterator_cf(cf, IteratorMode::Start) {
        let (_, value) = item?;
        rows.push(bincode::deserialize(&value)?);
    }
    Ok(rows)
}

fn load_tables(db: &DB) -> Result<Tables> {
    let mut tables = Tables::default();

    for line in scan::<BudgetLine>(db, CF_BUDGET_LINES)? {
        tables.budget_lines.insert(line.id, line);
    }
    tables.package_links = scan(db, CF_PACKAGE_LINKS)?;
    for row in scan::<Commitment>(db, CF_COMMITMENTS)? {
        tables.commitments.insert(row.id, row);
    }
    for row in scan::<Actual>(db, CF_ACTUALS)? {
        tables.actuals.insert(row.id, row);
    }
    for po in scan::<PurchaseOrder>(db, CF_PURCHASE_ORDERS)? {
        tables.purchase_orders.insert(po.id, po);
    }
    for invoice in scan::<Invoice>(db, CF_INVOICES)? {
        tables.invoices.insert(invoice.id, invoice);
    }
    for application in scan::<PaymentApplication>(db, CF_APPLICATIONS)? {
        tables.applications.insert(application.id, application);
    }
    for stamp in scan::<MatchStamp>(db, CF_MATCH_STAMPS)? {
        tables.match_stamps.insert(stamp.invoice_id, stamp);
    }
    for report in scan::<PeriodReport>(db, CF_REPORTS)? {
        tables.reports.insert(report.id, report);
    }

    let cf_indices = cf_handle(db, CF_INDICES)?;
    for item in db.iterator_cf(cf_indices, IteratorMode::Start) {
        let (key, value) = item?;
        let id = Uuid::from_slice(&value)
            .map_err(|e| Error::Storage(format!("Corrupt index entry: {}", e)))?;
        match key.split_first() {
            Some((&INDEX_COMMITMENT, rest)) => {
                tables.commitment_keys.insert(bincode::deserialize(rest)?, id);
            }
            Some((&INDEX_ACTUAL, rest)) => {
                tables.actual_keys.insert(bincode::deserialize(rest)?, id);
            }
            _ => return Err(Error::Storage("Unknown index entry".to_string())),
        }
    }

    Ok(tables)
}

/// Storage statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// All commitment rows
    pub commitments: u64,
    /// Commitments counting toward totals
    pub active_commitments: u64,
    /// All actual rows
    pub actuals: u64,
    /// Actuals counting toward totals
    pub active_actuals: u64,
    /// Matched invoices
    pub match_stamps: u64,
    /// Period reports
    pub reports: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CommitmentSource, Currency};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn test_commitment(tenant_id: TenantId, source_id: Uuid) -> Commitment {
        Commitment {
            id: Uuid::now_v7(),
            tenant_id,
            project_id: ProjectId::generate(),
            budget_line_id: None,
            source_type: CommitmentSource::PurchaseOrder,
            source_id,
            source_line: 0,
            amount: dec!(2500),
            currency: Currency::GBP,
            status: CommitmentStatus::Committed,
            effective_date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
            cancelled_date: None,
            description: "Scaffold hire".to_string(),
            reference: Some("PO-0001".to_string()),
            cost_code: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_unique_source_key() {
        let storage = Storage::in_memory();
        let tenant = TenantId::generate();
        let source_id = Uuid::now_v7();

        storage
            .commit(WriteOp::InsertCommitment(test_commitment(tenant, source_id)).into())
            .unwrap();

        let err = storage
            .commit(WriteOp::InsertCommitment(test_commitment(tenant, source_id)).into())
            .unwrap_err();
        assert!(err.is_duplicate());

        // Same source under another tenant is a different key
        storage
            .commit(WriteOp::InsertCommitment(test_commitment(TenantId::generate(), source_id)).into())
            .unwrap();

        assert_eq!(storage.stats().commitments, 2);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let storage = Storage::in_memory();
        let tenant = TenantId::generate();
        let source_id = Uuid::now_v7();

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::InsertCommitment(test_commitment(tenant, Uuid::now_v7())))
            .push(WriteOp::InsertCommitment(test_commitment(tenant, source_id)))
            .push(WriteOp::InsertCommitment(test_commitment(tenant, source_id)));

        assert!(storage.commit(batch).is_err());
        assert_eq!(storage.stats().commitments, 0);
    }

    #[test]
    fn test_cancel_releases_key() {
        let storage = Storage::in_memory();
        let tenant = TenantId::generate();
        let source_id = Uuid::now_v7();
        let row = test_commitment(tenant, source_id);
        let id = row.id;

        storage.commit(WriteOp::InsertCommitment(row).into()).unwrap();
        storage
            .commit(
                WriteOp::CancelCommitment {
                    id,
                    expected: CommitmentStatus::Committed,
                    cancelled_date: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
                }
                .into(),
            )
            .unwrap();

        // Stale expectation loses
        let err = storage
            .commit(
                WriteOp::CancelCommitment {
                    id,
                    expected: CommitmentStatus::Committed,
                    cancelled_date: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
                }
                .into(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        storage
            .commit(WriteOp::InsertCommitment(test_commitment(tenant, source_id)).into())
            .unwrap();
        let stats = storage.stats();
        assert_eq!(stats.commitments, 2);
        assert_eq!(stats.active_commitments, 1);
    }

    fn persistent_config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            persistent: true,
            data_dir: dir.path().to_path_buf(),
            sync_writes: false,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn test_persist_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let config = persistent_config(&temp_dir);

        let tenant = TenantId::generate();
        let source_id = Uuid::now_v7();
        let cancelled_source = Uuid::now_v7();
        {
            let storage = Storage::open(&config).unwrap();
            storage
                .commit(WriteOp::InsertCommitment(test_commitment(tenant, source_id)).into())
                .unwrap();

            let cancelled = test_commitment(tenant, cancelled_source);
            let id = cancelled.id;
            storage.commit(WriteOp::InsertCommitment(cancelled).into()).unwrap();
            storage
                .commit(
                    WriteOp::CancelCommitment {
                        id,
                        expected: CommitmentStatus::Committed,
                        cancelled_date: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
                    }
                    .into(),
                )
                .unwrap();
        }

        let reopened = Storage::open(&config).unwrap();
        let stats = reopened.stats();
        assert_eq!(stats.commitments, 2);
        assert_eq!(stats.active_commitments, 1);

        let err = reopened
            .commit(WriteOp::InsertCommitment(test_commitment(tenant, source_id)).into())
            .unwrap_err();
        assert!(err.is_duplicate());

        // The released key stays released after reopen
        reopened
            .commit(WriteOp::InsertCommitment(test_commitment(tenant, cancelled_source)).into())
            .unwrap();
    }

    #[test]
    fn test_failed_write_is_rolled_back() {
        let temp_dir = TempDir::new().unwrap();
        let config = persistent_config(&temp_dir);
        let tenant = TenantId::generate();
        let first = test_commitment(tenant, Uuid::now_v7());
        let first_id = first.id;
        {
            let storage = Storage::open(&config).unwrap();
            storage.commit(WriteOp::InsertCommitment(first).into()).unwrap();
        }

        let read_only = Storage::open(&StorageConfig {
            read_only: true,
            ..config.clone()
        })
        .unwrap();
        let before = read_only.stats();

        let mut batch = WriteBatch::new();
        batch
            .push(WriteOp::InsertCommitment(test_commitment(tenant, Uuid::now_v7())))
            .push(WriteOp::CancelCommitment {
                id: first_id,
                expected: CommitmentStatus::Committed,
                cancelled_date: NaiveDate::from_ymd_opt(2026, 2, 1).unwrap(),
            });
        let err = read_only.commit(batch).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        // Nothing the database refused is visible in the cache
        assert_eq!(read_only.stats(), before);
        assert_eq!(before.active_commitments, 1);
        let status = read_only.read(|t| t.commitments.get(&first_id).map(|c| c.status));
        assert_eq!(status, Some(CommitmentStatus::Committed));

        let line = BudgetLine {
            id: BudgetLineId::generate(),
            tenant_id: tenant,
            project_id: ProjectId::generate(),
            code: "02-100".to_string(),
            description: "Demolition".to_string(),
            budget: dec!(5000),
            forecast_final_cost: None,
            forecast_to_complete: None,
            forecast_variance: None,
        };
        let line_id = line.id;
        assert!(read_only.put_budget_line(line).is_err());
        assert!(read_only.budget_line(line_id).is_err());
    }
}
