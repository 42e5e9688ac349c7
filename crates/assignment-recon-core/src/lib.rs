//! Domain model and decision rules for two-ledger assignment reconciliation.
//!
//! This crate holds everything that does not touch storage: the record types,
//! the fixed status decision table, outstanding-amount rounding, the typed
//! selection arguments (date ranges and facility sets) and candidate-set
//! planning for the default pass. Persistence lives in
//! `assignment-recon-store-sqlite`.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::FormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, UtcOffset};
use ulid::Ulid;

/// Decimal places kept on `outstanding`.
pub const OUTSTANDING_SCALE: u32 = 2;

const SHIFT_DATE_FORMAT: &[FormatItem<'static>] = format_description!("[year]-[month]-[day]");
const LEDGER_TIMESTAMP_FORMAT: &[FormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReconError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("arithmetic error: {0}")]
    Arithmetic(String),
}

/// Serialized the way the `status` column stores it: `null`, `"Matched"`
/// or `"Pending"`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ReconStatus {
    Unset,
    Matched,
    Pending,
}

impl ReconStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Matched => "matched",
            Self::Pending => "pending",
        }
    }

    /// Column value in the `assignments.status` column. `Unset` is stored as NULL.
    #[must_use]
    pub fn as_sql(self) -> Option<&'static str> {
        match self {
            Self::Unset => None,
            Self::Matched => Some("Matched"),
            Self::Pending => Some("Pending"),
        }
    }

    #[must_use]
    pub fn from_sql(value: Option<&str>) -> Option<Self> {
        match value {
            None => Some(Self::Unset),
            Some("Matched") => Some(Self::Matched),
            Some("Pending") => Some(Self::Pending),
            Some(_) => None,
        }
    }
}

impl Display for ReconStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ReconStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_sql().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ReconStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Self::from_sql(raw.as_deref())
            .ok_or_else(|| serde::de::Error::custom(format!("unknown status value: {raw:?}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AssignmentId(String);

impl AssignmentId {
    /// Builds an assignment id from caller input, trimming surrounding whitespace.
    ///
    /// # Errors
    /// Returns [`ReconError::InvalidArgument`] when the id is blank.
    pub fn parse(raw: &str) -> Result<Self, ReconError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ReconError::InvalidArgument(
                "assignment_id MUST be non-empty".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for AssignmentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AssignmentId {
    type Err = ReconError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Internal ledger row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssignmentRecord {
    pub assignment_id: AssignmentId,
    pub total: Decimal,
    pub status: ReconStatus,
    /// `None` until the row has been reconciled at least once.
    pub outstanding: Option<Decimal>,
    #[serde(with = "shift_date_serde")]
    pub shift_date: Date,
    pub facility: String,
    #[serde(with = "utc_serde")]
    pub created_at: OffsetDateTime,
}

/// Agency ledger row. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalContribution {
    pub contribution_seq: i64,
    pub contribution_id: Ulid,
    pub assignment_id: AssignmentId,
    pub total: Decimal,
    #[serde(with = "utc_serde")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewAssignment {
    pub assignment_id: AssignmentId,
    pub total: Decimal,
    #[serde(with = "shift_date_serde")]
    pub shift_date: Date,
    pub facility: String,
    /// Defaults to the insert time when absent.
    #[serde(default, with = "utc_serde::option")]
    pub created_at: Option<OffsetDateTime>,
}

impl NewAssignment {
    /// Validates an internal ledger row before insert.
    ///
    /// # Errors
    /// Returns [`ReconError::Validation`] when the facility is blank or the
    /// creation timestamp is not UTC.
    pub fn validate(&self) -> Result<(), ReconError> {
        if self.facility.trim().is_empty() {
            return Err(ReconError::Validation(
                "facility MUST be provided for every assignment".to_string(),
            ));
        }

        if let Some(created_at) = self.created_at {
            if created_at.offset() != UtcOffset::UTC {
                return Err(ReconError::Validation(
                    "created_at MUST be UTC (offset Z)".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// The slice of an assignment row the reconciler needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub assignment_id: AssignmentId,
    pub total: Decimal,
}

/// Result of comparing one assignment's internal total with its agency sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub agency_sum: Decimal,
    pub difference: Decimal,
    pub status: ReconStatus,
    pub outstanding: Decimal,
}

/// Applies the fixed two-way comparison to one assignment.
///
/// Any agency sum at or above the internal total is `Matched`; only an
/// underpayment is `Pending`. `outstanding` is `agency_sum - internal_total`
/// rounded half-to-even to [`OUTSTANDING_SCALE`] places.
///
/// # Errors
/// Returns [`ReconError::Arithmetic`] when the difference overflows.
pub fn reconcile_amounts(
    internal_total: Decimal,
    agency_sum: Decimal,
) -> Result<Reconciliation, ReconError> {
    let difference = agency_sum.checked_sub(internal_total).ok_or_else(|| {
        ReconError::Arithmetic(format!(
            "difference overflow: {agency_sum} - {internal_total}"
        ))
    })?;

    let status = if difference.is_zero() || agency_sum > internal_total {
        ReconStatus::Matched
    } else {
        ReconStatus::Pending
    };

    Ok(Reconciliation {
        agency_sum,
        difference,
        status,
        outstanding: round_outstanding(difference),
    })
}

#[must_use]
pub fn round_outstanding(value: Decimal) -> Decimal {
    let mut rounded =
        value.round_dp_with_strategy(OUTSTANDING_SCALE, RoundingStrategy::MidpointNearestEven);
    // Always carry two places so "0" and "0.00" serialize the same way.
    rounded.rescale(OUTSTANDING_SCALE);
    if rounded.is_zero() {
        rounded.set_sign_positive(true);
    }
    rounded
}

/// Sums agency contribution totals. An empty input sums to zero.
///
/// # Errors
/// Returns [`ReconError::Arithmetic`] when the running sum overflows.
pub fn sum_contributions<I>(totals: I) -> Result<Decimal, ReconError>
where
    I: IntoIterator<Item = Decimal>,
{
    totals.into_iter().try_fold(Decimal::ZERO, |acc, value| {
        acc.checked_add(value)
            .ok_or_else(|| ReconError::Arithmetic(format!("contribution sum overflow at {value}")))
    })
}

/// Inclusive shift-date window. A window whose start is after its end
/// matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: Date,
    pub end: Date,
}

impl DateRange {
    #[must_use]
    pub fn new(start: Date, end: Date) -> Self {
        Self { start, end }
    }
}

/// A facility filter argument as callers supply it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FacilityArg {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for FacilityArg {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

impl From<String> for FacilityArg {
    fn from(value: String) -> Self {
        Self::One(value)
    }
}

impl From<Vec<String>> for FacilityArg {
    fn from(value: Vec<String>) -> Self {
        Self::Many(value)
    }
}

/// Non-empty, ordered, de-duplicated set of facility identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilitySet(BTreeSet<String>);

impl FacilitySet {
    /// Normalizes a single identifier or a collection of them.
    ///
    /// Identifiers are trimmed and blank entries dropped.
    ///
    /// # Errors
    /// Returns [`ReconError::InvalidArgument`] when no non-blank identifier
    /// remains.
    pub fn normalize(arg: impl Into<FacilityArg>) -> Result<Self, ReconError> {
        let raw = match arg.into() {
            FacilityArg::One(value) => vec![value],
            FacilityArg::Many(values) => values,
        };

        let set = raw
            .iter()
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect::<BTreeSet<_>>();

        if set.is_empty() {
            return Err(ReconError::InvalidArgument(
                "facilities MUST contain at least one non-empty identifier".to_string(),
            ));
        }

        Ok(Self(set))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false for a constructed set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// Row predicates the selection modes are built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateFilter {
    Unset,
    Pending,
    /// Rows sharing the maximum `created_at` across the whole ledger.
    LatestBatch,
    /// Any status.
    DateRange(DateRange),
    /// Unset or Pending rows only.
    OpenInDateRangeAndFacility(DateRange, FacilitySet),
}

/// Which half of the default pass produced the primary candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultPassBranch {
    /// Never-reconciled rows exist.
    Backlog,
    /// No backlog; the most recently ingested batch is re-checked.
    LatestBatch,
}

impl DefaultPassBranch {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::LatestBatch => "latest_batch",
        }
    }

    #[must_use]
    pub fn primary_filter(self) -> CandidateFilter {
        match self {
            Self::Backlog => CandidateFilter::Unset,
            Self::LatestBatch => CandidateFilter::LatestBatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMode {
    Default,
    DateRange(DateRange),
    DateRangeAndFacility(DateRange, FacilitySet),
}

impl SelectionMode {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::DateRange(_) => "date_range",
            Self::DateRangeAndFacility(..) => "date_range_and_facility",
        }
    }
}

/// Unions the primary candidate set with the Pending rows.
///
/// Each assignment appears once, at its first position; primary rows keep
/// their order ahead of the remaining Pending rows.
#[must_use]
pub fn plan_candidates(primary: Vec<Candidate>, pending: Vec<Candidate>) -> Vec<Candidate> {
    let mut seen = BTreeSet::new();
    primary
        .into_iter()
        .chain(pending)
        .filter(|candidate| seen.insert(candidate.assignment_id.clone()))
        .collect()
}

/// Parses a decimal amount such as `100.25` or `-3`.
///
/// # Errors
/// Returns [`ReconError::InvalidArgument`] when the text is not a decimal.
pub fn parse_amount(raw: &str) -> Result<Decimal, ReconError> {
    Decimal::from_str(raw.trim())
        .map_err(|err| ReconError::InvalidArgument(format!("invalid decimal amount {raw:?}: {err}")))
}

/// Parses a `YYYY-MM-DD` shift date.
///
/// # Errors
/// Returns [`ReconError::InvalidArgument`] when parsing fails.
pub fn parse_shift_date(raw: &str) -> Result<Date, ReconError> {
    Date::parse(raw.trim(), SHIFT_DATE_FORMAT)
        .map_err(|err| ReconError::InvalidArgument(format!("invalid shift date {raw:?}: {err}")))
}

/// Formats a shift date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`ReconError::Validation`] when formatting fails.
pub fn format_shift_date(value: Date) -> Result<String, ReconError> {
    value
        .format(SHIFT_DATE_FORMAT)
        .map_err(|err| ReconError::Validation(format!("failed to format shift date: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ReconError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ReconError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ReconError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ReconError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ReconError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ReconError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ReconError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Fixed-width UTC form used in storage so lexical order is chronological.
///
/// # Errors
/// Returns [`ReconError::Validation`] when formatting fails.
pub fn format_ledger_timestamp(value: OffsetDateTime) -> Result<String, ReconError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(LEDGER_TIMESTAMP_FORMAT)
        .map_err(|err| ReconError::Validation(format!("failed to format ledger timestamp: {err}")))
}

/// Inverse of [`format_ledger_timestamp`].
///
/// # Errors
/// Returns [`ReconError::Validation`] when the text is not in ledger form.
pub fn parse_ledger_timestamp(value: &str) -> Result<OffsetDateTime, ReconError> {
    PrimitiveDateTime::parse(value, LEDGER_TIMESTAMP_FORMAT)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| ReconError::Validation(format!("invalid ledger timestamp {value:?}: {err}")))
}

/// Current UTC time truncated to the microsecond precision stored in the ledger.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}

/// Default `created_at` for ingested assignments, truncated to whole seconds.
/// Rows sharing a stamp form one batch for the default pass.
#[must_use]
pub fn batch_timestamp() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

mod shift_date_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        let text = super::format_shift_date(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_shift_date(&raw).map_err(serde::de::Error::custom)
    }
}

mod utc_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(
        value: &OffsetDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let text = super::format_rfc3339(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<OffsetDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_rfc3339_utc(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use time::OffsetDateTime;

        pub fn serialize<S: Serializer>(
            value: &Option<OffsetDateTime>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(inner) => super::serialize(inner, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<OffsetDateTime>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| super::super::parse_rfc3339_utc(&raw))
                .transpose()
                .map_err(serde::de::Error::custom)
        }
    }
}
