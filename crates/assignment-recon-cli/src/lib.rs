//! Command surface for the assignment reconciliation store.
//!
//! Host programs can embed the same behavior the `recon` binary exposes:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_recon_with_db`] for direct `ReconCommand` execution against a DB path.
//! - [`run_recon`] for execution against an existing [`SqliteReconStore`].
//!
//! Arguments are parsed into typed values before the store is touched, so a
//! malformed date, amount or facility list fails without running any query.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use assignment_recon_core::{
    parse_amount, parse_rfc3339_utc, parse_shift_date, AssignmentId, DateRange, FacilitySet,
    NewAssignment, SelectionMode,
};
use assignment_recon_store_sqlite::SqliteReconStore;
use clap::{Args, Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::debug;

#[derive(Debug, Parser)]
#[command(name = "recon")]
#[command(about = "Assignment ledger reconciliation CLI")]
pub struct Cli {
    #[arg(long, env = "RECON_DB", default_value = "./assignment_recon.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: ReconCommand,
}

#[derive(Debug, Subcommand)]
pub enum ReconCommand {
    /// Reconcile internal totals against agency contributions.
    Reconcile {
        #[command(subcommand)]
        command: ReconcileCommand,
    },
    /// Load rows into either ledger.
    Ingest {
        #[command(subcommand)]
        command: IngestCommand,
    },
    Assignment {
        #[command(subcommand)]
        command: AssignmentCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum ReconcileCommand {
    /// Unreconciled backlog (or latest batch) plus every Pending row.
    All,
    /// Every row with a shift date in the window, whatever its status.
    ByDate(DateRangeArgs),
    /// Unset and Pending rows in the window for the given facilities.
    ByFacility(FacilityArgs),
}

#[derive(Debug, Args)]
pub struct DateRangeArgs {
    #[arg(long)]
    start: String,
    #[arg(long)]
    end: String,
}

#[derive(Debug, Args)]
pub struct FacilityArgs {
    #[command(flatten)]
    range: DateRangeArgs,
    /// Repeat the flag or pass a comma-separated list.
    #[arg(long = "facility", required = true, value_delimiter = ',')]
    facilities: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum IngestCommand {
    Assignment(IngestAssignmentArgs),
    /// Load a JSON array of assignments as one batch.
    Assignments(IngestBatchArgs),
    Contribution(IngestContributionArgs),
}

#[derive(Debug, Args)]
pub struct IngestAssignmentArgs {
    #[arg(long)]
    assignment_id: String,
    #[arg(long, allow_hyphen_values = true)]
    total: String,
    #[arg(long)]
    shift_date: String,
    #[arg(long)]
    facility: String,
    #[arg(long)]
    created_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct IngestBatchArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct IngestContributionArgs {
    #[arg(long)]
    assignment_id: String,
    #[arg(long, allow_hyphen_values = true)]
    total: String,
}

#[derive(Debug, Subcommand)]
pub enum AssignmentCommand {
    Show(AssignmentShowArgs),
}

#[derive(Debug, Args)]
pub struct AssignmentShowArgs {
    #[arg(long)]
    assignment_id: String,
}

/// A command whose arguments have been validated and typed.
#[derive(Debug)]
enum Operation {
    Reconcile(SelectionMode),
    IngestAssignment(NewAssignment),
    IngestAssignments(Vec<NewAssignment>),
    IngestContribution(AssignmentId, Decimal),
    ShowAssignment(AssignmentId),
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when argument validation, store open/migrate, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_recon_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when argument validation fails (before the DB is opened),
/// store open/migrate fails, or the requested command fails.
pub fn run_recon_with_db(db_path: &Path, command: ReconCommand) -> Result<()> {
    let operation = parse_operation(command)?;

    let mut store = SqliteReconStore::open(db_path)?;
    store.migrate()?;
    debug!(db = %db_path.display(), "opened reconciliation store");

    execute(operation, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when argument validation, persistence, or reconciliation
/// fails.
pub fn run_recon(command: ReconCommand, store: &mut SqliteReconStore) -> Result<()> {
    let operation = parse_operation(command)?;
    execute(operation, store)
}

fn parse_operation(command: ReconCommand) -> Result<Operation> {
    match command {
        ReconCommand::Reconcile { command } => Ok(Operation::Reconcile(parse_mode(command)?)),
        ReconCommand::Ingest { command } => match command {
            IngestCommand::Assignment(args) => {
                let input = NewAssignment {
                    assignment_id: AssignmentId::parse(&args.assignment_id)?,
                    total: parse_amount(&args.total)?,
                    shift_date: parse_shift_date(&args.shift_date)?,
                    facility: args.facility,
                    created_at: args
                        .created_at
                        .as_deref()
                        .map(parse_rfc3339_utc)
                        .transpose()
                        .map_err(|err| anyhow!("invalid --created-at value: {err}"))?,
                };
                input.validate()?;
                Ok(Operation::IngestAssignment(input))
            }
            IngestCommand::Assignments(args) => {
                let raw = std::fs::read_to_string(&args.file).with_context(|| {
                    format!("failed to read assignment batch {}", args.file.display())
                })?;
                let inputs: Vec<NewAssignment> = serde_json::from_str(&raw).with_context(|| {
                    format!("invalid assignment batch {}", args.file.display())
                })?;
                for input in &inputs {
                    input.validate()?;
                }
                Ok(Operation::IngestAssignments(inputs))
            }
            IngestCommand::Contribution(args) => Ok(Operation::IngestContribution(
                AssignmentId::parse(&args.assignment_id)?,
                parse_amount(&args.total)?,
            )),
        },
        ReconCommand::Assignment { command } => match command {
            AssignmentCommand::Show(args) => Ok(Operation::ShowAssignment(AssignmentId::parse(
                &args.assignment_id,
            )?)),
        },
    }
}

fn parse_mode(command: ReconcileCommand) -> Result<SelectionMode> {
    match command {
        ReconcileCommand::All => Ok(SelectionMode::Default),
        ReconcileCommand::ByDate(args) => Ok(SelectionMode::DateRange(parse_range(&args)?)),
        ReconcileCommand::ByFacility(args) => {
            let range = parse_range(&args.range)?;
            let facilities = FacilitySet::normalize(args.facilities)?;
            Ok(SelectionMode::DateRangeAndFacility(range, facilities))
        }
    }
}

fn parse_range(args: &DateRangeArgs) -> Result<DateRange> {
    let start =
        parse_shift_date(&args.start).map_err(|err| anyhow!("invalid --start value: {err}"))?;
    let end = parse_shift_date(&args.end).map_err(|err| anyhow!("invalid --end value: {err}"))?;
    Ok(DateRange::new(start, end))
}

fn execute(operation: Operation, store: &mut SqliteReconStore) -> Result<()> {
    match operation {
        Operation::Reconcile(mode) => {
            let records = store.reconcile(&mode)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Operation::IngestAssignment(input) => {
            let record = store.insert_assignment(&input)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Operation::IngestAssignments(inputs) => {
            let records = store.insert_assignments(&inputs)?;
            println!("{}", serde_json::to_string_pretty(&records)?);
            Ok(())
        }
        Operation::IngestContribution(assignment_id, total) => {
            let contribution = store.append_contribution(&assignment_id, total)?;
            println!("{}", serde_json::to_string_pretty(&contribution)?);
            Ok(())
        }
        Operation::ShowAssignment(assignment_id) => {
            let Some(record) = store.get_assignment(&assignment_id)? else {
                return Err(anyhow!("assignment not found: {assignment_id}"));
            };
            let contributions = store.list_contributions(&assignment_id)?;

            let payload = serde_json::json!({
                "assignment": record,
                "contributions": contributions,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
    }
}
