#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use assignment_recon_core::{
    batch_timestamp, format_ledger_timestamp, format_shift_date, now_utc, parse_ledger_timestamp,
    parse_shift_date, plan_candidates, reconcile_amounts, sum_contributions, AssignmentId,
    AssignmentRecord, Candidate, CandidateFilter, DateRange, DefaultPassBranch,
    ExternalContribution, FacilitySet, NewAssignment, ReconStatus, SelectionMode,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use rust_decimal::Decimal;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

const RECON_MIGRATION_VERSION: i64 = 1;

/// Upper bound on bound parameters per `IN (...)` statement.
const MAX_IN_PARAMS: usize = 500;

const ASSIGNMENT_COLUMNS: &str =
    "assignment_id, total, status, outstanding, shift_date, facility, created_at";

const SCHEMA_RECON_V1: &str = r"
CREATE TABLE IF NOT EXISTS assignments (
  assignment_id TEXT PRIMARY KEY,
  total TEXT NOT NULL,
  status TEXT CHECK (status IN ('Matched', 'Pending') OR status IS NULL),
  outstanding TEXT,
  shift_date TEXT NOT NULL,
  facility TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_assignments_status
  ON assignments(status);
CREATE INDEX IF NOT EXISTS idx_assignments_shift_date_facility
  ON assignments(shift_date, facility);
CREATE INDEX IF NOT EXISTS idx_assignments_created_at
  ON assignments(created_at);

CREATE TABLE IF NOT EXISTS agency_contributions (
  contribution_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  contribution_id TEXT NOT NULL UNIQUE,
  assignment_id TEXT NOT NULL REFERENCES assignments(assignment_id),
  total TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agency_contributions_assignment
  ON agency_contributions(assignment_id, contribution_seq);

CREATE TRIGGER IF NOT EXISTS trg_agency_contributions_no_update
BEFORE UPDATE ON agency_contributions
BEGIN
  SELECT RAISE(FAIL, 'agency_contributions is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_agency_contributions_no_delete
BEFORE DELETE ON agency_contributions
BEGIN
  SELECT RAISE(FAIL, 'agency_contributions is append-only');
END;
";

/// Both ledgers in one `SQLite` database.
///
/// Every reconciliation entry point runs inside a single transaction: all
/// candidate rows are written and committed together, or none are.
pub struct SqliteReconStore {
    conn: Connection,
}

impl SqliteReconStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RECON_V1)
            .context("failed to apply reconciliation schema")?;

        let now = format_ledger_timestamp(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RECON_MIGRATION_VERSION, now],
            )
            .context("failed to register reconciliation schema migration")?;

        Ok(())
    }

    /// Inserts one Unset row. A missing `created_at` defaults to the current
    /// whole second.
    pub fn insert_assignment(&self, input: &NewAssignment) -> Result<AssignmentRecord> {
        insert_assignment_row(&self.conn, input, batch_timestamp())
    }

    /// Inserts a batch atomically. Rows without `created_at` share one stamp,
    /// so the default pass treats them as the latest batch together.
    pub fn insert_assignments(
        &mut self,
        inputs: &[NewAssignment],
    ) -> Result<Vec<AssignmentRecord>> {
        let stamp = batch_timestamp();
        let tx = self
            .conn
            .transaction()
            .context("failed to start assignment batch transaction")?;

        let mut records = Vec::with_capacity(inputs.len());
        for input in inputs {
            records.push(insert_assignment_row(&tx, input, stamp)?);
        }

        tx.commit()
            .context("failed to commit assignment batch transaction")?;
        info!(inserted = records.len(), "ingested assignment batch");
        Ok(records)
    }

    pub fn append_contribution(
        &mut self,
        assignment_id: &AssignmentId,
        total: Decimal,
    ) -> Result<ExternalContribution> {
        let contribution_id = Ulid::new();
        let recorded_at = now_utc();

        let tx = self
            .conn
            .transaction()
            .context("failed to start contribution transaction")?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM assignments WHERE assignment_id = ?1",
                params![assignment_id.as_str()],
                |_| Ok(()),
            )
            .optional()
            .context("failed to look up assignment for contribution")?
            .is_some();
        if !exists {
            return Err(anyhow!("assignment not found: {assignment_id}"));
        }

        tx.execute(
            "INSERT INTO agency_contributions(contribution_id, assignment_id, total, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                contribution_id.to_string(),
                assignment_id.as_str(),
                total.to_string(),
                format_ledger_timestamp(recorded_at).map_err(|err| anyhow!(err.to_string()))?,
            ],
        )
        .context("failed to append agency contribution")?;

        let contribution_seq = tx.last_insert_rowid();
        tx.commit()
            .context("failed to commit contribution transaction")?;

        Ok(ExternalContribution {
            contribution_seq,
            contribution_id,
            assignment_id: assignment_id.clone(),
            total,
            recorded_at,
        })
    }

    pub fn get_assignment(&self, assignment_id: &AssignmentId) -> Result<Option<AssignmentRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE assignment_id = ?1"
        ))?;

        let record = stmt
            .query_row(params![assignment_id.as_str()], parse_assignment_row)
            .optional()?;

        Ok(record)
    }

    pub fn list_contributions(
        &self,
        assignment_id: &AssignmentId,
    ) -> Result<Vec<ExternalContribution>> {
        let mut stmt = self.conn.prepare(
            "SELECT contribution_seq, contribution_id, assignment_id, total, recorded_at
             FROM agency_contributions
             WHERE assignment_id = ?1
             ORDER BY contribution_seq ASC",
        )?;

        let rows = stmt.query_map(params![assignment_id.as_str()], parse_contribution_row)?;
        collect_rows(rows)
    }

    /// Runs whichever entry point `mode` names.
    pub fn reconcile(&mut self, mode: &SelectionMode) -> Result<Vec<AssignmentRecord>> {
        debug!(mode = mode.name(), "dispatching reconciliation");
        match mode {
            SelectionMode::Default => self.reconcile_all(),
            SelectionMode::DateRange(range) => self.reconcile_by_date(*range),
            SelectionMode::DateRangeAndFacility(range, facilities) => {
                self.reconcile_by_date_and_facility(*range, facilities)
            }
        }
    }

    /// Default pass: the unreconciled backlog plus everything still Pending,
    /// or, once the backlog is empty, the latest ingested batch plus Pending.
    ///
    /// Returns the full records of every processed assignment, ordered by id.
    pub fn reconcile_all(&mut self) -> Result<Vec<AssignmentRecord>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start reconciliation transaction")?;

        let unset = query_candidates(&tx, &CandidateFilter::Unset)?;
        let pending = query_candidates(&tx, &CandidateFilter::Pending)?;

        let (branch, primary) = if unset.is_empty() {
            let branch = DefaultPassBranch::LatestBatch;
            (branch, query_candidates(&tx, &branch.primary_filter())?)
        } else {
            (DefaultPassBranch::Backlog, unset)
        };

        info!(
            mode = "default",
            branch = branch.as_str(),
            primary = primary.len(),
            pending = pending.len(),
            "selected default pass candidates"
        );

        let candidates = plan_candidates(primary, pending);
        let processed = reconcile_candidates(&tx, "default", &candidates)?;
        tx.commit()
            .context("failed to commit reconciliation transaction")?;

        fetch_full_records(&self.conn, &processed)
    }

    /// Re-reconciles every row with a shift date in `range`, whatever its
    /// current status.
    pub fn reconcile_by_date(&mut self, range: DateRange) -> Result<Vec<AssignmentRecord>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start reconciliation transaction")?;

        let candidates = query_candidates(&tx, &CandidateFilter::DateRange(range))?;
        info!(
            mode = "date_range",
            start = %range.start,
            end = %range.end,
            candidates = candidates.len(),
            "selected date range candidates"
        );

        let processed = reconcile_candidates(&tx, "date_range", &candidates)?;
        tx.commit()
            .context("failed to commit reconciliation transaction")?;

        fetch_full_records(&self.conn, &processed)
    }

    /// Reconciles only Unset and Pending rows inside the window and
    /// facilities, then returns every row in that window and those
    /// facilities ordered by shift date. Rows already Matched are returned
    /// as stored without being recomputed.
    pub fn reconcile_by_date_and_facility(
        &mut self,
        range: DateRange,
        facilities: &FacilitySet,
    ) -> Result<Vec<AssignmentRecord>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start reconciliation transaction")?;

        let candidates = query_candidates(
            &tx,
            &CandidateFilter::OpenInDateRangeAndFacility(range, facilities.clone()),
        )?;
        info!(
            mode = "date_range_and_facility",
            start = %range.start,
            end = %range.end,
            facilities = facilities.len(),
            candidates = candidates.len(),
            "selected facility candidates"
        );

        reconcile_candidates(&tx, "date_range_and_facility", &candidates)?;
        tx.commit()
            .context("failed to commit reconciliation transaction")?;

        fetch_full_records_by_date_and_facility(&self.conn, range, facilities)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn insert_assignment_row(
    conn: &Connection,
    input: &NewAssignment,
    default_created_at: OffsetDateTime,
) -> Result<AssignmentRecord> {
    input
        .validate()
        .map_err(|err| anyhow!("assignment validation failed: {err}"))?;

    let created_at = input.created_at.unwrap_or(default_created_at);
    let record = AssignmentRecord {
        assignment_id: input.assignment_id.clone(),
        total: input.total,
        status: ReconStatus::Unset,
        outstanding: None,
        shift_date: input.shift_date,
        facility: input.facility.trim().to_string(),
        created_at,
    };

    conn.execute(
        "INSERT INTO assignments(
            assignment_id, total, status, outstanding, shift_date, facility, created_at
         ) VALUES (?1, ?2, NULL, NULL, ?3, ?4, ?5)",
        params![
            record.assignment_id.as_str(),
            record.total.to_string(),
            format_shift_date(record.shift_date).map_err(|err| anyhow!(err.to_string()))?,
            record.facility,
            format_ledger_timestamp(created_at).map_err(|err| anyhow!(err.to_string()))?,
        ],
    )
    .with_context(|| format!("failed to insert assignment {}", record.assignment_id))?;

    Ok(record)
}

fn reconcile_candidates(
    conn: &Connection,
    mode: &str,
    candidates: &[Candidate],
) -> Result<Vec<AssignmentId>> {
    let mut processed = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let assignment_id = reconcile_row(conn, candidate).inspect_err(|err| {
            warn!(
                mode,
                assignment_id = %candidate.assignment_id,
                completed = processed.len(),
                error = %err,
                "reconciliation batch aborted"
            );
        })?;
        processed.push(assignment_id);
    }

    info!(mode, processed = processed.len(), "reconciled candidates");
    Ok(processed)
}

/// Reconciles one assignment against its agency contributions and writes
/// the resulting status and outstanding amount.
///
/// Issues exactly one UPDATE. Commit is left to the caller.
pub fn reconcile_row(conn: &Connection, candidate: &Candidate) -> Result<AssignmentId> {
    let agency_sum = sum_external_contributions(conn, &candidate.assignment_id)?;
    let outcome = reconcile_amounts(candidate.total, agency_sum)
        .map_err(|err| anyhow!("failed reconciling {}: {err}", candidate.assignment_id))?;

    update_assignment_status(
        conn,
        &candidate.assignment_id,
        outcome.status,
        outcome.outstanding,
    )?;

    debug!(
        assignment_id = %candidate.assignment_id,
        internal_total = %candidate.total,
        agency_sum = %outcome.agency_sum,
        status = outcome.status.as_str(),
        outstanding = %outcome.outstanding,
        "reconciled assignment"
    );

    Ok(candidate.assignment_id.clone())
}

/// Sum of agency totals for one assignment; zero when none exist.
pub fn sum_external_contributions(
    conn: &Connection,
    assignment_id: &AssignmentId,
) -> Result<Decimal> {
    let mut stmt = conn.prepare_cached(
        "SELECT total FROM agency_contributions WHERE assignment_id = ?1",
    )?;

    let rows = stmt.query_map(params![assignment_id.as_str()], |row| {
        parse_decimal_column(row, 0)
    })?;
    let totals = collect_rows(rows)
        .with_context(|| format!("failed to read agency contributions for {assignment_id}"))?;

    sum_contributions(totals).map_err(|err| anyhow!("{assignment_id}: {err}"))
}

pub fn update_assignment_status(
    conn: &Connection,
    assignment_id: &AssignmentId,
    status: ReconStatus,
    outstanding: Decimal,
) -> Result<()> {
    let updated = conn
        .prepare_cached(
            "UPDATE assignments
             SET status = ?1,
                 outstanding = ?2
             WHERE assignment_id = ?3",
        )?
        .execute(params![
            status.as_sql(),
            outstanding.to_string(),
            assignment_id.as_str()
        ])
        .with_context(|| format!("failed to update reconciliation status for {assignment_id}"))?;

    if updated == 0 {
        return Err(anyhow!("assignment not found: {assignment_id}"));
    }

    Ok(())
}

/// Selects `(assignment_id, total)` pairs matching `filter`, ordered by id.
pub fn query_candidates(conn: &Connection, filter: &CandidateFilter) -> Result<Vec<Candidate>> {
    let mut values: Vec<String> = Vec::new();
    let predicate = match filter {
        CandidateFilter::Unset => "status IS NULL".to_string(),
        CandidateFilter::Pending => "status = 'Pending'".to_string(),
        CandidateFilter::LatestBatch => {
            "created_at = (SELECT MAX(created_at) FROM assignments)".to_string()
        }
        CandidateFilter::DateRange(range) => {
            push_date_range(&mut values, *range)?;
            "shift_date BETWEEN ?1 AND ?2".to_string()
        }
        CandidateFilter::OpenInDateRangeAndFacility(range, facilities) => {
            push_date_range(&mut values, *range)?;
            let placeholders = numbered_placeholders(values.len() + 1, facilities.len());
            values.extend(facilities.iter().map(str::to_string));
            format!(
                "(status IS NULL OR status = 'Pending')
                 AND shift_date BETWEEN ?1 AND ?2
                 AND facility IN ({placeholders})"
            )
        }
    };

    let mut stmt = conn.prepare(&format!(
        "SELECT assignment_id, total
         FROM assignments
         WHERE {predicate}
         ORDER BY assignment_id ASC"
    ))?;

    let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
        Ok(Candidate {
            assignment_id: parse_assignment_id(&row.get::<_, String>(0)?)?,
            total: parse_decimal_column(row, 1)?,
        })
    })?;

    collect_rows(rows).with_context(|| format!("failed to query candidates for {filter:?}"))
}

/// Full rows for the given ids, ordered by id. Ids are bound in chunks so
/// arbitrarily large batches stay under the engine's parameter limit.
pub fn fetch_full_records(
    conn: &Connection,
    assignment_ids: &[AssignmentId],
) -> Result<Vec<AssignmentRecord>> {
    let mut records = Vec::with_capacity(assignment_ids.len());

    for chunk in assignment_ids.chunks(MAX_IN_PARAMS) {
        let placeholders = numbered_placeholders(1, chunk.len());
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSIGNMENT_COLUMNS}
             FROM assignments
             WHERE assignment_id IN ({placeholders})"
        ))?;

        let rows = stmt.query_map(
            params_from_iter(chunk.iter().map(AssignmentId::as_str)),
            parse_assignment_row,
        )?;
        records.extend(collect_rows(rows).context("failed to fetch reconciled assignments")?);
    }

    records.sort_by(|lhs, rhs| lhs.assignment_id.cmp(&rhs.assignment_id));
    Ok(records)
}

/// Every row in the window and facilities, any status, by shift date.
pub fn fetch_full_records_by_date_and_facility(
    conn: &Connection,
    range: DateRange,
    facilities: &FacilitySet,
) -> Result<Vec<AssignmentRecord>> {
    let mut values = Vec::with_capacity(facilities.len() + 2);
    push_date_range(&mut values, range)?;
    let placeholders = numbered_placeholders(values.len() + 1, facilities.len());
    values.extend(facilities.iter().map(str::to_string));

    let mut stmt = conn.prepare(&format!(
        "SELECT {ASSIGNMENT_COLUMNS}
         FROM assignments
         WHERE shift_date BETWEEN ?1 AND ?2
           AND facility IN ({placeholders})
         ORDER BY shift_date ASC, assignment_id ASC"
    ))?;

    let rows = stmt.query_map(params_from_iter(values.iter()), parse_assignment_row)?;
    collect_rows(rows).context("failed to fetch assignments by date and facility")
}

/// `?start, ?start+1, ...` for `count` bound values. `count` must be non-zero.
fn numbered_placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_date_range(values: &mut Vec<String>, range: DateRange) -> Result<()> {
    values.push(format_shift_date(range.start).map_err(|err| anyhow!(err.to_string()))?);
    values.push(format_shift_date(range.end).map_err(|err| anyhow!(err.to_string()))?);
    Ok(())
}

fn parse_assignment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssignmentRecord> {
    let status_raw: Option<String> = row.get(2)?;
    let status = ReconStatus::from_sql(status_raw.as_deref()).ok_or_else(|| {
        conversion_error(
            2,
            rusqlite::types::Type::Text,
            format!("invalid status value: {status_raw:?}"),
        )
    })?;

    let outstanding = row
        .get::<_, Option<String>>(3)?
        .map(|raw| parse_decimal_text(3, &raw))
        .transpose()?;

    let shift_date_raw: String = row.get(4)?;
    let created_at_raw: String = row.get(6)?;

    Ok(AssignmentRecord {
        assignment_id: parse_assignment_id(&row.get::<_, String>(0)?)?,
        total: parse_decimal_column(row, 1)?,
        status,
        outstanding,
        shift_date: parse_shift_date(&shift_date_raw)
            .map_err(|err| conversion_error(4, rusqlite::types::Type::Text, err.to_string()))?,
        facility: row.get(5)?,
        created_at: parse_ledger_timestamp(&created_at_raw)
            .map_err(|err| conversion_error(6, rusqlite::types::Type::Text, err.to_string()))?,
    })
}

fn parse_contribution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExternalContribution> {
    let contribution_id_raw: String = row.get(1)?;
    let contribution_id = Ulid::from_string(&contribution_id_raw).map_err(|_| {
        conversion_error(
            1,
            rusqlite::types::Type::Text,
            format!("invalid ULID: {contribution_id_raw}"),
        )
    })?;
    let recorded_at_raw: String = row.get(4)?;

    Ok(ExternalContribution {
        contribution_seq: row.get(0)?,
        contribution_id,
        assignment_id: parse_assignment_id(&row.get::<_, String>(2)?)?,
        total: parse_decimal_column(row, 3)?,
        recorded_at: parse_ledger_timestamp(&recorded_at_raw)
            .map_err(|err| conversion_error(4, rusqlite::types::Type::Text, err.to_string()))?,
    })
}

fn parse_assignment_id(raw: &str) -> rusqlite::Result<AssignmentId> {
    AssignmentId::parse(raw)
        .map_err(|err| conversion_error(0, rusqlite::types::Type::Text, err.to_string()))
}

fn parse_decimal_column(row: &rusqlite::Row<'_>, index: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(index)?;
    parse_decimal_text(index, &raw)
}

fn parse_decimal_text(index: usize, raw: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(raw).map_err(|err| {
        conversion_error(
            index,
            rusqlite::types::Type::Text,
            format!("invalid decimal {raw:?}: {err}"),
        )
    })
}

fn conversion_error(index: usize, ty: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;
    use time::macros::{date, datetime};
    use time::{Date, OffsetDateTime};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteReconStore {
        let store = must(SqliteReconStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn id(raw: &str) -> AssignmentId {
        match AssignmentId::parse(raw) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture id: {err}"),
        }
    }

    fn facilities(values: &[&str]) -> FacilitySet {
        let owned = values
            .iter()
            .map(|value| (*value).to_string())
            .collect::<Vec<_>>();
        match FacilitySet::normalize(owned) {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture facilities: {err}"),
        }
    }

    const BATCH_ONE: OffsetDateTime = datetime!(2026-01-05 06:00:00 UTC);
    const BATCH_TWO: OffsetDateTime = datetime!(2026-01-12 06:00:00 UTC);

    fn seed(
        store: &SqliteReconStore,
        raw_id: &str,
        total: Decimal,
        shift_date: Date,
        facility: &str,
        created_at: OffsetDateTime,
    ) {
        must(store.insert_assignment(&NewAssignment {
            assignment_id: id(raw_id),
            total,
            shift_date,
            facility: facility.to_string(),
            created_at: Some(created_at),
        }));
    }

    fn seed_simple(store: &SqliteReconStore, raw_id: &str, total: Decimal) {
        seed(store, raw_id, total, date!(2026 - 01 - 01), "north", BATCH_ONE);
    }

    fn force_status(
        store: &SqliteReconStore,
        raw_id: &str,
        status: ReconStatus,
        outstanding: Decimal,
    ) {
        must(update_assignment_status(
            store.connection(),
            &id(raw_id),
            status,
            outstanding,
        ));
    }

    fn contribute(store: &mut SqliteReconStore, raw_id: &str, total: Decimal) {
        must(store.append_contribution(&id(raw_id), total));
    }

    fn fetch(store: &SqliteReconStore, raw_id: &str) -> AssignmentRecord {
        match must(store.get_assignment(&id(raw_id))) {
            Some(record) => record,
            None => panic!("missing assignment {raw_id}"),
        }
    }

    fn returned_ids(records: &[AssignmentRecord]) -> Vec<&str> {
        records
            .iter()
            .map(|record| record.assignment_id.as_str())
            .collect()
    }

    fn reconcile_one(store: &SqliteReconStore, raw_id: &str) -> AssignmentRecord {
        let record = fetch(store, raw_id);
        must(reconcile_row(
            store.connection(),
            &Candidate {
                assignment_id: record.assignment_id,
                total: record.total,
            },
        ));
        fetch(store, raw_id)
    }

    #[test]
    fn row_reconciler_applies_status_table() {
        let mut store = fixture_store();
        let fixtures = [
            ("EQ", Some(dec!(100))),
            ("OVER", Some(dec!(120))),
            ("UNDER", Some(dec!(80))),
            ("NONE", None),
        ];
        for (raw_id, agency) in fixtures {
            seed_simple(&store, raw_id, dec!(100));
            if let Some(total) = agency {
                contribute(&mut store, raw_id, total);
            }
        }

        let eq = reconcile_one(&store, "EQ");
        assert_eq!(eq.status, ReconStatus::Matched);
        assert_eq!(eq.outstanding, Some(dec!(0.00)));

        let over = reconcile_one(&store, "OVER");
        assert_eq!(over.status, ReconStatus::Matched);
        assert_eq!(over.outstanding, Some(dec!(20.00)));

        let under = reconcile_one(&store, "UNDER");
        assert_eq!(under.status, ReconStatus::Pending);
        assert_eq!(under.outstanding, Some(dec!(-20.00)));

        let none = reconcile_one(&store, "NONE");
        assert_eq!(none.status, ReconStatus::Pending);
        assert_eq!(none.outstanding, Some(dec!(-100.00)));
    }

    #[test]
    fn row_reconciler_sums_every_contribution_exactly() {
        let mut store = fixture_store();
        seed_simple(&store, "A1", dec!(100));
        contribute(&mut store, "A1", dec!(33.33));
        contribute(&mut store, "A1", dec!(33.33));
        contribute(&mut store, "A1", dec!(33.345));

        let sum = must(sum_external_contributions(store.connection(), &id("A1")));
        assert_eq!(sum, dec!(100.005));

        let record = reconcile_one(&store, "A1");
        assert_eq!(record.status, ReconStatus::Matched);
        assert_eq!(record.outstanding, Some(dec!(0.00)));
    }

    #[test]
    fn row_reconciler_is_idempotent() {
        let mut store = fixture_store();
        seed_simple(&store, "A1", dec!(250.10));
        contribute(&mut store, "A1", dec!(200));

        let first = reconcile_one(&store, "A1");
        let second = reconcile_one(&store, "A1");
        assert_eq!(first, second);
        assert_eq!(second.outstanding, Some(dec!(-50.10)));
    }

    #[test]
    fn row_reconciler_rejects_unknown_assignment() {
        let store = fixture_store();
        let result = reconcile_row(
            store.connection(),
            &Candidate {
                assignment_id: id("GHOST"),
                total: dec!(1),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn default_pass_with_backlog_takes_unset_and_pending_only() {
        let mut store = fixture_store();
        seed(&store, "U1", dec!(10), date!(2026 - 01 - 01), "north", BATCH_ONE);
        seed(&store, "U2", dec!(20), date!(2026 - 01 - 02), "north", BATCH_TWO);
        seed(&store, "P1", dec!(30), date!(2026 - 01 - 03), "north", BATCH_ONE);
        seed(&store, "M1", dec!(40), date!(2026 - 01 - 04), "north", BATCH_TWO);
        force_status(&store, "P1", ReconStatus::Pending, dec!(-30));
        force_status(&store, "M1", ReconStatus::Matched, dec!(0));
        contribute(&mut store, "P1", dec!(30));
        contribute(&mut store, "M1", dec!(1));

        let records = must(store.reconcile_all());
        assert_eq!(returned_ids(&records), vec!["P1", "U1", "U2"]);

        let p1 = fetch(&store, "P1");
        assert_eq!(p1.status, ReconStatus::Matched);
        assert_eq!(p1.outstanding, Some(dec!(0.00)));

        // Matched rows outside the backlog are left alone even with new agency data.
        let m1 = fetch(&store, "M1");
        assert_eq!(m1.status, ReconStatus::Matched);
        assert_eq!(m1.outstanding, Some(dec!(0)));
    }

    #[test]
    fn default_pass_without_backlog_takes_latest_batch_and_pending() {
        let mut store = fixture_store();
        seed(&store, "OLD-M", dec!(10), date!(2026 - 01 - 01), "north", BATCH_ONE);
        seed(&store, "OLD-P", dec!(10), date!(2026 - 01 - 01), "north", BATCH_ONE);
        seed(&store, "NEW-M", dec!(10), date!(2026 - 01 - 08), "north", BATCH_TWO);
        seed(&store, "NEW-P", dec!(10), date!(2026 - 01 - 08), "north", BATCH_TWO);
        force_status(&store, "OLD-M", ReconStatus::Matched, dec!(0));
        force_status(&store, "OLD-P", ReconStatus::Pending, dec!(-10));
        force_status(&store, "NEW-M", ReconStatus::Matched, dec!(0));
        force_status(&store, "NEW-P", ReconStatus::Pending, dec!(-10));
        contribute(&mut store, "OLD-M", dec!(5));
        contribute(&mut store, "NEW-M", dec!(5));

        let records = must(store.reconcile_all());
        assert_eq!(returned_ids(&records), vec!["NEW-M", "NEW-P", "OLD-P"]);

        let new_m = fetch(&store, "NEW-M");
        assert_eq!(new_m.status, ReconStatus::Pending);
        assert_eq!(new_m.outstanding, Some(dec!(-5.00)));

        let old_m = fetch(&store, "OLD-M");
        assert_eq!(old_m.status, ReconStatus::Matched);
        assert_eq!(old_m.outstanding, Some(dec!(0)));
    }

    #[test]
    fn default_pass_reconciles_first_ingest_then_rechecks_latest_batch() {
        let mut store = fixture_store();
        seed(&store, "A1", dec!(100), date!(2026 - 01 - 01), "north", BATCH_ONE);
        seed(&store, "A2", dec!(100), date!(2026 - 01 - 01), "north", BATCH_ONE);
        contribute(&mut store, "A1", dec!(100));

        let first = must(store.reconcile_all());
        assert_eq!(returned_ids(&first), vec!["A1", "A2"]);

        // No backlog now: A1 and A2 are the latest batch, A2 is also Pending.
        let second = must(store.reconcile_all());
        assert_eq!(returned_ids(&second), vec!["A1", "A2"]);
        assert_eq!(first, second);
    }

    #[test]
    fn default_pass_on_empty_ledger_returns_nothing() {
        let mut store = fixture_store();
        let records = must(store.reconcile_all());
        assert!(records.is_empty());
    }

    #[test]
    fn date_range_pass_rechecks_every_status_inclusively() {
        let mut store = fixture_store();
        seed(&store, "BEFORE", dec!(10), date!(2026 - 01 - 31), "north", BATCH_ONE);
        seed(&store, "FIRST", dec!(10), date!(2026 - 02 - 01), "north", BATCH_ONE);
        seed(&store, "MATCHED", dec!(10), date!(2026 - 02 - 14), "south", BATCH_ONE);
        seed(&store, "LAST", dec!(10), date!(2026 - 02 - 28), "north", BATCH_ONE);
        seed(&store, "AFTER", dec!(10), date!(2026 - 03 - 01), "north", BATCH_ONE);
        force_status(&store, "MATCHED", ReconStatus::Matched, dec!(0));

        let records = must(store.reconcile_by_date(DateRange::new(
            date!(2026 - 02 - 01),
            date!(2026 - 02 - 28),
        )));
        assert_eq!(returned_ids(&records), vec!["FIRST", "LAST", "MATCHED"]);

        let matched = fetch(&store, "MATCHED");
        assert_eq!(matched.status, ReconStatus::Pending);
        assert_eq!(matched.outstanding, Some(dec!(-10.00)));

        assert_eq!(fetch(&store, "BEFORE").status, ReconStatus::Unset);
        assert_eq!(fetch(&store, "AFTER").status, ReconStatus::Unset);
    }

    #[test]
    fn date_range_pass_with_no_rows_returns_nothing() {
        let mut store = fixture_store();
        seed_simple(&store, "A1", dec!(10));

        let records = must(store.reconcile_by_date(DateRange::new(
            date!(2025 - 01 - 01),
            date!(2025 - 12 - 31),
        )));
        assert!(records.is_empty());

        let inverted = must(store.reconcile_by_date(DateRange::new(
            date!(2026 - 12 - 31),
            date!(2026 - 01 - 01),
        )));
        assert!(inverted.is_empty());
        assert_eq!(fetch(&store, "A1").status, ReconStatus::Unset);
    }

    #[test]
    fn facility_pass_skips_matched_rows_but_returns_them() {
        let mut store = fixture_store();
        seed(&store, "LATE", dec!(50), date!(2026 - 02 - 20), "north", BATCH_ONE);
        seed(&store, "DONE", dec!(50), date!(2026 - 02 - 05), "north", BATCH_ONE);
        seed(&store, "OPEN", dec!(50), date!(2026 - 02 - 10), "east", BATCH_ONE);
        seed(&store, "OTHER", dec!(50), date!(2026 - 02 - 10), "south", BATCH_ONE);
        seed(&store, "OUTSIDE", dec!(50), date!(2026 - 03 - 10), "north", BATCH_ONE);
        force_status(&store, "DONE", ReconStatus::Matched, dec!(0));
        force_status(&store, "OPEN", ReconStatus::Pending, dec!(-50));

        // Agency data arrives after DONE was matched; the facility pass must not recompute it.
        contribute(&mut store, "DONE", dec!(10));
        contribute(&mut store, "OPEN", dec!(50));
        contribute(&mut store, "LATE", dec!(20));

        let records = must(store.reconcile_by_date_and_facility(
            DateRange::new(date!(2026 - 02 - 01), date!(2026 - 02 - 28)),
            &facilities(&["north", "east"]),
        ));

        assert_eq!(returned_ids(&records), vec!["DONE", "OPEN", "LATE"]);

        let done = &records[0];
        assert_eq!(done.status, ReconStatus::Matched);
        assert_eq!(done.outstanding, Some(dec!(0)));

        let open = &records[1];
        assert_eq!(open.status, ReconStatus::Matched);
        assert_eq!(open.outstanding, Some(dec!(0.00)));

        let late = &records[2];
        assert_eq!(late.status, ReconStatus::Pending);
        assert_eq!(late.outstanding, Some(dec!(-30.00)));

        assert_eq!(fetch(&store, "OTHER").status, ReconStatus::Unset);
        assert_eq!(fetch(&store, "OUTSIDE").status, ReconStatus::Unset);
    }

    #[test]
    fn facility_pass_accepts_single_facility() {
        let mut store = fixture_store();
        seed(&store, "A1", dec!(5), date!(2026 - 02 - 02), "north", BATCH_ONE);
        seed(&store, "A2", dec!(5), date!(2026 - 02 - 02), "south", BATCH_ONE);

        let single = match FacilitySet::normalize("north") {
            Ok(value) => value,
            Err(err) => panic!("invalid facility: {err}"),
        };
        let records = must(store.reconcile_by_date_and_facility(
            DateRange::new(date!(2026 - 02 - 01), date!(2026 - 02 - 28)),
            &single,
        ));
        assert_eq!(returned_ids(&records), vec!["A1"]);
        assert_eq!(records[0].status, ReconStatus::Pending);
    }

    #[test]
    fn facility_pass_with_no_rows_returns_nothing() {
        let mut store = fixture_store();
        seed_simple(&store, "A1", dec!(10));

        let records = must(store.reconcile_by_date_and_facility(
            DateRange::new(date!(2026 - 01 - 01), date!(2026 - 01 - 31)),
            &facilities(&["nowhere"]),
        ));
        assert!(records.is_empty());
    }

    #[test]
    fn failed_update_rolls_back_whole_batch() {
        let mut store = fixture_store();
        for raw_id in ["A1", "A2", "A3", "A4"] {
            seed_simple(&store, raw_id, dec!(10));
            contribute(&mut store, raw_id, dec!(10));
        }

        let trigger = store.connection().execute_batch(
            "CREATE TRIGGER trg_fail_a3 BEFORE UPDATE ON assignments
             WHEN NEW.assignment_id = 'A3'
             BEGIN
               SELECT RAISE(ABORT, 'simulated write failure');
             END;",
        );
        if let Err(err) = trigger {
            panic!("test failure: {err}");
        }

        let result = store.reconcile_all();
        assert!(result.is_err());

        for raw_id in ["A1", "A2", "A3", "A4"] {
            let record = fetch(&store, raw_id);
            assert_eq!(record.status, ReconStatus::Unset, "{raw_id} leaked a write");
            assert_eq!(record.outstanding, None);
        }
    }

    #[test]
    fn mode_dispatch_matches_entry_points() {
        let mut store = fixture_store();
        seed(&store, "A1", dec!(5), date!(2026 - 02 - 02), "north", BATCH_ONE);

        let range = DateRange::new(date!(2026 - 02 - 01), date!(2026 - 02 - 28));
        let by_mode = must(store.reconcile(&SelectionMode::DateRange(range)));
        let direct = must(store.reconcile_by_date(range));
        assert_eq!(by_mode, direct);

        let by_facility = must(store.reconcile(&SelectionMode::DateRangeAndFacility(
            range,
            facilities(&["north"]),
        )));
        assert_eq!(returned_ids(&by_facility), vec!["A1"]);

        let default = must(store.reconcile(&SelectionMode::Default));
        assert_eq!(returned_ids(&default), vec!["A1"]);
    }

    #[test]
    fn large_batches_are_fetched_across_parameter_chunks() {
        let mut store = fixture_store();
        let count = MAX_IN_PARAMS * 2 + 7;
        for index in 0..count {
            seed_simple(&store, &format!("A{index:05}"), dec!(1));
        }

        let records = must(store.reconcile_all());
        assert_eq!(records.len(), count);
        assert!(records.windows(2).all(|pair| pair[0].assignment_id < pair[1].assignment_id));
        assert!(records
            .iter()
            .all(|record| record.status == ReconStatus::Pending));
    }

    #[test]
    fn placeholders_are_numbered_from_offset() {
        assert_eq!(numbered_placeholders(1, 1), "?1");
        assert_eq!(numbered_placeholders(3, 3), "?3, ?4, ?5");
    }

    #[test]
    fn facility_values_are_bound_not_interpolated() {
        let mut store = fixture_store();
        seed(&store, "A1", dec!(5), date!(2026 - 02 - 02), "north", BATCH_ONE);

        let records = must(store.reconcile_by_date_and_facility(
            DateRange::new(date!(2026 - 02 - 01), date!(2026 - 02 - 28)),
            &facilities(&["x') OR 1=1 --"]),
        ));
        assert!(records.is_empty());
        assert_eq!(fetch(&store, "A1").status, ReconStatus::Unset);
    }

    fn unstamped(raw_id: &str, total: Decimal) -> NewAssignment {
        NewAssignment {
            assignment_id: id(raw_id),
            total,
            shift_date: date!(2026 - 01 - 01),
            facility: "north".to_string(),
            created_at: None,
        }
    }

    #[test]
    fn unstamped_batch_is_rechecked_together_as_latest_batch() {
        let mut store = fixture_store();
        let inputs = [
            unstamped("B1", dec!(10)),
            unstamped("B2", dec!(10)),
            unstamped("B3", dec!(10)),
        ];
        let inserted = must(store.insert_assignments(&inputs));
        assert!(inserted
            .iter()
            .all(|record| record.created_at == inserted[0].created_at));

        for raw_id in ["B1", "B2", "B3"] {
            contribute(&mut store, raw_id, dec!(10));
        }
        let first = must(store.reconcile_all());
        assert!(first
            .iter()
            .all(|record| record.status == ReconStatus::Matched));

        for raw_id in ["B1", "B2", "B3"] {
            contribute(&mut store, raw_id, dec!(-4));
        }
        let second = must(store.reconcile_all());
        assert_eq!(returned_ids(&second), vec!["B1", "B2", "B3"]);
        for record in &second {
            assert_eq!(record.status, ReconStatus::Pending);
            assert_eq!(record.outstanding, Some(dec!(-4.00)));
        }
    }

    #[test]
    fn unstamped_single_insert_defaults_to_whole_second() {
        let store = fixture_store();
        let record = must(store.insert_assignment(&unstamped("S1", dec!(1))));
        assert_eq!(record.created_at.nanosecond(), 0);
        assert_eq!(fetch(&store, "S1").created_at, record.created_at);
    }

    #[test]
    fn failed_batch_insert_leaves_no_rows() {
        let mut store = fixture_store();
        seed_simple(&store, "DUP", dec!(1));

        let result =
            store.insert_assignments(&[unstamped("NEW", dec!(1)), unstamped("DUP", dec!(2))]);
        assert!(result.is_err());
        assert!(must(store.get_assignment(&id("NEW"))).is_none());
    }

    #[test]
    fn contribution_for_unknown_assignment_is_rejected() {
        let mut store = fixture_store();
        let result = store.append_contribution(&id("TYPO"), dec!(10));
        let Err(err) = result else {
            panic!("expected orphan contribution to be rejected");
        };
        assert!(err.to_string().contains("assignment not found"));
        assert!(must(store.list_contributions(&id("TYPO"))).is_empty());

        let direct = store.connection().execute(
            "INSERT INTO agency_contributions(contribution_id, assignment_id, total, recorded_at)
             VALUES ('orphan', 'TYPO', '1', '2026-01-01T00:00:00.000000Z')",
            [],
        );
        assert!(direct.is_err(), "foreign key should reject orphan rows");
    }

    #[test]
    fn contributions_are_append_only() {
        let mut store = fixture_store();
        seed_simple(&store, "A1", dec!(10));
        let contribution = must(store.append_contribution(&id("A1"), dec!(4.20)));

        let update_result = store.connection().execute(
            "UPDATE agency_contributions SET total = '0' WHERE contribution_seq = ?1",
            params![contribution.contribution_seq],
        );
        assert!(update_result.is_err());

        let listed = must(store.list_contributions(&id("A1")));
        assert_eq!(listed, vec![contribution]);
    }

    #[test]
    fn duplicate_assignment_insert_is_rejected() {
        let store = fixture_store();
        seed_simple(&store, "A1", dec!(10));
        let result = store.insert_assignment(&NewAssignment {
            assignment_id: id("A1"),
            total: dec!(11),
            shift_date: date!(2026 - 01 - 01),
            facility: "north".to_string(),
            created_at: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let store = fixture_store();
        seed_simple(&store, "A1", dec!(10));
        must(store.migrate());
        must(store.migrate());

        assert_eq!(fetch(&store, "A1").total, dec!(10));
        let versions = store
            .connection()
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| {
                row.get::<_, i64>(0)
            });
        match versions {
            Ok(count) => assert_eq!(count, 1),
            Err(err) => panic!("test failure: {err}"),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_reconciliation_is_idempotent_and_follows_table(
            internal_cents in -1_000_000i64..1_000_000,
            contribution_mills in prop::collection::vec(-1_000_000i64..1_000_000, 0..6),
        ) {
            let mut store = fixture_store();
            let internal = Decimal::new(internal_cents, 2);
            seed_simple(&store, "P", internal);
            for mills in &contribution_mills {
                contribute(&mut store, "P", Decimal::new(*mills, 3));
            }

            let agency: Decimal = contribution_mills
                .iter()
                .map(|mills| Decimal::new(*mills, 3))
                .sum();

            let first = must(store.reconcile_all());
            let second = must(store.reconcile_all());
            prop_assert_eq!(&first, &second);

            let record = fetch(&store, "P");
            let expected_status = if agency >= internal {
                ReconStatus::Matched
            } else {
                ReconStatus::Pending
            };
            prop_assert_eq!(record.status, expected_status);
            prop_assert_eq!(
                record.outstanding,
                Some(assignment_recon_core::round_outstanding(agency - internal))
            );
        }
    }
}
