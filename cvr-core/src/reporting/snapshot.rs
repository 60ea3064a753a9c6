//! Frozen period snapshots
//!
//! A snapshot is captured once and never recomputed in place. The SHA-256
//! digest covers the bincode encoding of every other field, so a report read
//! back from disk can be checked with [`PeriodSnapshot::verify`].

use crate::{
    ledger::Ledger,
    types::{BudgetLineSummary, LedgerSummary, ProjectId, TenantId},
    Result,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Snapshot format version
pub const SNAPSHOT_VERSION: u16 = 1;

/// Ledger state of a project as of a period end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSnapshot {
    /// Format version
    pub version: u16,
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
    /// Entries dated after this day are excluded
    pub period_end: NaiveDate,
    /// Project totals
    pub summary: LedgerSummary,
    /// Per budget line totals, ordered by code
    pub lines: Vec<BudgetLineSummary>,
    /// Active commitments without a budget line
    pub unallocated_committed: Decimal,
    /// Active actuals without a budget line
    pub unallocated_actual: Decimal,
    /// SHA-256 over the fields above
    pub digest: [u8; 32],
}

#[derive(Serialize)]
struct DigestInput<'a> {
    version: u16,
    captured_at: &'a DateTime<Utc>,
    period_end: NaiveDate,
    summary: &'a LedgerSummary,
    lines: &'a [BudgetLineSummary],
    unallocated_committed: Decimal,
    unallocated_actual: Decimal,
}

impl PeriodSnapshot {
    /// Capture the ledger state of a project as of `period_end`
    pub fn capture(
        ledger: &Ledger,
        tenant_id: TenantId,
        project_id: ProjectId,
        period_end: NaiveDate,
    ) -> Result<Self> {
        let (summary, lines, unallocated) = ledger.totals_as_of(tenant_id, project_id, period_end);

        let mut snapshot = Self {
            version: SNAPSHOT_VERSION,
            captured_at: Utc::now(),
            period_end,
            summary,
            lines,
            unallocated_committed: unallocated.committed,
            unallocated_actual: unallocated.actual,
            digest: [0u8; 32],
        };
        snapshot.digest = snapshot.compute_digest()?;

        tracing::debug!(
            tenant_id = %tenant_id,
            project_id = %project_id,
            %period_end,
            lines = snapshot.lines.len(),
            digest = %snapshot.digest_hex(),
            "Period snapshot captured"
        );
        Ok(snapshot)
    }

    /// Whether the stored digest still matches the contents
    pub fn verify(&self) -> bool {
        self.compute_digest()
            .map(|digest| digest == self.digest)
            .unwrap_or(false)
    }

    /// Digest as lowercase hex
    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    fn compute_digest(&self) -> Result<[u8; 32]> {
        let bytes = bincode::serialize(&DigestInput {
            version: self.version,
            captured_at: &self.captured_at,
            period_end: self.period_end,
            summary: &self.summary,
            lines: &self.lines,
            unallocated_committed: self.unallocated_committed,
            unallocated_actual: self.unallocated_actual,
        })?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(&bytes));
        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tampering_breaks_digest() {
        let ledger = Ledger::open(Config::default()).unwrap();
        let mut snapshot = PeriodSnapshot::capture(
            &ledger,
            TenantId::generate(),
            ProjectId::generate(),
            NaiveDate::from_ymd_opt(2026, 3, 31).unwrap(),
        )
        .unwrap();

        assert!(snapshot.verify());
        assert_eq!(snapshot.digest_hex().len(), 64);
        assert_eq!(hex::decode(snapshot.digest_hex()).unwrap(), snapshot.digest.to_vec());

        snapshot.summary.committed = dec!(1);
        assert!(!snapshot.verify());
    }
}
