//! Append reconciliation: resolve the monthly partition, reconcile its header,
//! recover sequence and identifier state, then map and append new records.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ledger_core::{
    canonical_header, identifier_set, max_sequence, partition_for_date, Column, IncomingRecord,
    MonthLocale, PartitionError, CANONICAL_COLUMNS,
};
use ledger_storage::{
    BackendError, MemoryBackend, PartitionHandle, SheetsBackend, SheetsConfig, TabularBackend,
    WorkbookDir,
};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ledger-sync";

/// Keyword list maintained by hand in the workbook: column F, rows 8 to 19.
pub const KEYWORDS_PARTITION: &str = "Palabras Clave";
const KEYWORDS_COLUMN: usize = 5;
const KEYWORDS_FIRST_ROW: usize = 8;
const KEYWORDS_LAST_ROW: usize = 19;

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub backend: String,
    pub workbook_dir: PathBuf,
    pub spreadsheet_id: Option<String>,
    pub sheets_token: Option<String>,
    pub month_locale: MonthLocale,
    pub http_timeout_secs: u64,
    pub user_agent: String,
}

impl LedgerConfig {
    pub fn from_env() -> Self {
        Self {
            backend: std::env::var("LEDGER_BACKEND").unwrap_or_else(|_| "dir".to_string()),
            workbook_dir: std::env::var("LEDGER_WORKBOOK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./workbook")),
            spreadsheet_id: std::env::var("LEDGER_SPREADSHEET_ID").ok(),
            sheets_token: std::env::var("LEDGER_SHEETS_TOKEN").ok(),
            month_locale: std::env::var("LEDGER_MONTH_LOCALE")
                .ok()
                .and_then(|v| MonthLocale::parse(&v))
                .unwrap_or_default(),
            http_timeout_secs: std::env::var("LEDGER_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("LEDGER_USER_AGENT")
                .unwrap_or_else(|_| "tender-ledger/0.1".to_string()),
        }
    }
}

pub fn open_backend(config: &LedgerConfig) -> Result<Box<dyn TabularBackend>> {
    match config.backend.as_str() {
        "dir" => Ok(Box::new(WorkbookDir::new(config.workbook_dir.clone()))),
        "memory" => Ok(Box::new(MemoryBackend::new())),
        "sheets" => {
            let spreadsheet_id = config
                .spreadsheet_id
                .clone()
                .context("LEDGER_SPREADSHEET_ID is required for the sheets backend")?;
            let token = config
                .sheets_token
                .clone()
                .context("LEDGER_SHEETS_TOKEN is required for the sheets backend")?;
            let mut sheets = SheetsConfig::new(spreadsheet_id, token);
            sheets.timeout = Duration::from_secs(config.http_timeout_secs);
            sheets.user_agent = Some(config.user_agent.clone());
            Ok(Box::new(
                SheetsBackend::new(sheets).context("building sheets client")?,
            ))
        }
        other => bail!("unknown LEDGER_BACKEND {other:?} (expected dir, sheets or memory)"),
    }
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    InvalidDate(#[from] PartitionError),
    #[error("opening partition {partition:?}: {source}")]
    PartitionOpen {
        partition: String,
        #[source]
        source: BackendError,
    },
    #[error("reading header of {partition:?}: {source}")]
    HeaderRead {
        partition: String,
        #[source]
        source: BackendError,
    },
    #[error("writing header of {partition:?}: {source}")]
    SchemaWrite {
        partition: String,
        #[source]
        source: BackendError,
    },
    #[error("reading column {column} of {partition:?}: {source}")]
    ColumnRead {
        partition: String,
        column: usize,
        #[source]
        source: BackendError,
    },
    #[error("appending {rows} rows to {partition:?}: {source}")]
    Append {
        partition: String,
        rows: usize,
        #[source]
        source: BackendError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReconcileWarning {
    /// No incoming record carried an `id`, so every record went in undeduplicated.
    IdentifierFieldMissing,
    /// The partition header has no identifier column, so stored identifiers are unknown.
    IdentifierColumnMissing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NothingToAdd {
    NoInput,
    AllDuplicates,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AppendStatus {
    Appended {
        count: usize,
        first_sequence: u64,
        last_sequence: u64,
    },
    NothingToAdd(NothingToAdd),
}

#[derive(Debug, Clone, Serialize)]
pub struct AppendReport {
    pub run_id: Uuid,
    pub partition: String,
    pub partition_created: bool,
    pub header_added: Vec<String>,
    pub skipped_duplicates: usize,
    pub status: AppendStatus,
    pub warnings: Vec<ReconcileWarning>,
}

impl AppendReport {
    pub fn appended(&self) -> usize {
        match self.status {
            AppendStatus::Appended { count, .. } => count,
            AppendStatus::NothingToAdd(_) => 0,
        }
    }
}

/// Dry-run view of what `append` would write.
#[derive(Debug, Clone, Serialize)]
pub struct AppendPlan {
    pub partition: String,
    pub partition_exists: bool,
    pub header: Vec<String>,
    pub header_added: Vec<String>,
    pub last_sequence: u64,
    pub skipped_duplicates: usize,
    pub rows: Vec<Vec<String>>,
    pub warnings: Vec<ReconcileWarning>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionSnapshot {
    pub partition: String,
    pub exists: bool,
    pub header: Vec<String>,
    pub missing_columns: Vec<String>,
    pub last_sequence: u64,
    pub stored_identifiers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPlan {
    /// Header after reconciliation.
    pub header: Vec<String>,
    /// Canonical names that were missing, in canonical order.
    pub added: Vec<String>,
    /// Whether the header has to be written back.
    pub write: bool,
}

/// Superset of `existing` that contains every canonical name.
///
/// An empty header becomes the canonical list. Otherwise missing names are
/// appended at the end; existing columns keep their text and position.
pub fn plan_header(existing: &[String], canonical: &[String]) -> HeaderPlan {
    if existing.is_empty() {
        return HeaderPlan {
            header: canonical.to_vec(),
            added: canonical.to_vec(),
            write: true,
        };
    }
    let added = canonical
        .iter()
        .filter(|name| !existing.contains(name))
        .cloned()
        .collect::<Vec<_>>();
    let mut header = existing.to_vec();
    header.extend(added.iter().cloned());
    HeaderPlan {
        header,
        write: !added.is_empty(),
        added,
    }
}

pub async fn reconcile_header(
    backend: &dyn TabularBackend,
    partition: &PartitionHandle,
) -> Result<HeaderPlan, ReconcileError> {
    let existing = backend
        .read_header(partition)
        .await
        .map_err(|source| ReconcileError::HeaderRead {
            partition: partition.title.clone(),
            source,
        })?;
    let plan = plan_header(&existing, &canonical_header());
    if plan.write {
        backend
            .write_header(partition, &plan.header)
            .await
            .map_err(|source| ReconcileError::SchemaWrite {
                partition: partition.title.clone(),
                source,
            })?;
        info!(added = ?plan.added, "reconciled header");
    }
    Ok(plan)
}

async fn read_column(
    backend: &dyn TabularBackend,
    partition: &PartitionHandle,
    column: usize,
) -> Result<Vec<String>, ReconcileError> {
    backend
        .read_column(partition, column)
        .await
        .map_err(|source| ReconcileError::ColumnRead {
            partition: partition.title.clone(),
            column,
            source,
        })
}

/// Highest sequence number in the highest-priority sequence column.
///
/// Reconciliation appends an empty canonical "Número" next to a hand-typed
/// alias such as "N°". When the priority column holds no valid number, the
/// other alias columns are scanned and their maximum is used instead.
pub async fn last_sequence_number(
    backend: &dyn TabularBackend,
    partition: &PartitionHandle,
    header: &[String],
) -> Result<u64, ReconcileError> {
    let Some(primary) = Column::Sequence.locate(header) else {
        debug!("no sequence column; numbering starts at 1");
        return Ok(0);
    };
    let cells = read_column(backend, partition, primary).await?;
    let last = max_sequence(cells.iter().map(String::as_str));
    if last > 0 {
        return Ok(last);
    }

    let mut fallback = 0;
    for index in Column::Sequence.locate_all(header) {
        if index == primary {
            continue;
        }
        let cells = read_column(backend, partition, index).await?;
        fallback = fallback.max(max_sequence(cells.iter().map(String::as_str)));
    }
    if fallback > 0 {
        debug!(fallback, "priority sequence column empty; using alias columns");
    }
    Ok(fallback)
}

/// Stored identifiers across every identifier-alias column, or `None` when there is none.
///
/// The result is a superset: a legacy "Id" column and the appended "ID" are
/// both read, so an identifier in either one counts as stored.
pub async fn existing_identifiers(
    backend: &dyn TabularBackend,
    partition: &PartitionHandle,
    header: &[String],
) -> Result<Option<HashSet<String>>, ReconcileError> {
    let indices = Column::Id.locate_all(header);
    if indices.is_empty() {
        return Ok(None);
    }
    let mut ids = HashSet::new();
    for index in indices {
        let cells = read_column(backend, partition, index).await?;
        ids.extend(identifier_set(cells.iter().map(String::as_str)));
    }
    Ok(Some(ids))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedBatch {
    /// Rows in canonical column order.
    pub rows: Vec<Vec<String>>,
    pub first_sequence: u64,
    pub skipped_duplicates: usize,
    /// True when no record carried an identifier and filtering was skipped.
    pub dedup_skipped: bool,
}

/// Drops already-stored identifiers, numbers the survivors from `last_sequence + 1`
/// in input order, and lays each one out in canonical column order.
pub fn map_records(
    records: &[IncomingRecord],
    last_sequence: u64,
    existing: &HashSet<String>,
) -> MappedBatch {
    let dedup_skipped = !records.iter().any(|r| r.id.is_some());
    let survivors = records
        .iter()
        .filter(|r| {
            dedup_skipped
                || r.id
                    .as_deref()
                    .map_or(true, |id| !existing.contains(id))
        })
        .collect::<Vec<_>>();

    let rows = survivors
        .iter()
        .zip(1u64..)
        .map(|(record, offset)| canonical_row(record, last_sequence.saturating_add(offset)))
        .collect::<Vec<_>>();

    MappedBatch {
        skipped_duplicates: records.len() - rows.len(),
        first_sequence: last_sequence.saturating_add(1),
        dedup_skipped,
        rows,
    }
}

fn canonical_row(record: &IncomingRecord, sequence: u64) -> Vec<String> {
    CANONICAL_COLUMNS
        .iter()
        .map(|column| match column {
            Column::Sequence => sequence.to_string(),
            other => record.value_for(*other).unwrap_or_default().to_string(),
        })
        .collect()
}

/// Reorders a canonical row to match `header` position by position.
///
/// Backends append by position, so a sheet whose columns were rearranged by
/// hand still gets each value under the right name. Header cells are matched
/// through column aliases, so a hand-typed "N°" next to the canonical "Número"
/// receives the sequence number too. Unrecognized columns receive empty cells.
pub fn align_to_header(header: &[String], canonical_row: &[String]) -> Vec<String> {
    header
        .iter()
        .map(|name| {
            let name = std::slice::from_ref(name);
            CANONICAL_COLUMNS
                .iter()
                .position(|c| c.locate(name).is_some())
                .and_then(|i| canonical_row.get(i))
                .cloned()
                .unwrap_or_default()
        })
        .collect()
}

struct PreparedBatch {
    rows: Vec<Vec<String>>,
    first_sequence: u64,
    skipped_duplicates: usize,
    warnings: Vec<ReconcileWarning>,
}

fn prepare_batch(
    records: &[IncomingRecord],
    header: &[String],
    last_sequence: u64,
    existing: Option<HashSet<String>>,
) -> PreparedBatch {
    let mut warnings = Vec::new();
    if existing.is_none() {
        warn!("partition has no identifier column; stored identifiers unknown");
        warnings.push(ReconcileWarning::IdentifierColumnMissing);
    }
    let batch = map_records(records, last_sequence, &existing.unwrap_or_default());
    if batch.dedup_skipped {
        warn!(records = records.len(), "incoming records carry no id field; deduplication skipped");
        warnings.push(ReconcileWarning::IdentifierFieldMissing);
    }
    PreparedBatch {
        rows: batch
            .rows
            .iter()
            .map(|row| align_to_header(header, row))
            .collect(),
        first_sequence: batch.first_sequence,
        skipped_duplicates: batch.skipped_duplicates,
        warnings,
    }
}

/// Runs one append per call against an injected backend. Runs against the same
/// partition must not overlap: sequence and identifier state is read, then written,
/// without locking.
pub struct Reconciler {
    backend: Box<dyn TabularBackend>,
    locale: MonthLocale,
}

impl Reconciler {
    pub fn new(backend: Box<dyn TabularBackend>) -> Self {
        Self {
            backend,
            locale: MonthLocale::default(),
        }
    }

    pub fn with_locale(mut self, locale: MonthLocale) -> Self {
        self.locale = locale;
        self
    }

    pub fn partition_name(&self, target_date: &str) -> Result<String, ReconcileError> {
        Ok(partition_for_date(target_date, self.locale)?)
    }

    pub async fn append(
        &self,
        records: &[IncomingRecord],
        target_date: &str,
    ) -> Result<AppendReport, ReconcileError> {
        let partition = self.partition_name(target_date)?;
        let run_id = Uuid::new_v4();
        let span = info_span!("append", %run_id, partition = %partition);
        self.append_to(run_id, partition, records)
            .instrument(span)
            .await
    }

    async fn append_to(
        &self,
        run_id: Uuid,
        partition: String,
        records: &[IncomingRecord],
    ) -> Result<AppendReport, ReconcileError> {
        let mut report = AppendReport {
            run_id,
            partition,
            partition_created: false,
            header_added: Vec::new(),
            skipped_duplicates: 0,
            status: AppendStatus::NothingToAdd(NothingToAdd::NoInput),
            warnings: Vec::new(),
        };
        if records.is_empty() {
            info!("no records to append");
            return Ok(report);
        }

        let backend = self.backend.as_ref();
        let handle = backend
            .open_or_create_partition(&report.partition)
            .await
            .map_err(|source| ReconcileError::PartitionOpen {
                partition: report.partition.clone(),
                source,
            })?;
        report.partition_created = handle.created;

        let header = reconcile_header(backend, &handle).await?;
        report.header_added = header.added.clone();

        let last_sequence = last_sequence_number(backend, &handle, &header.header).await?;
        let existing = existing_identifiers(backend, &handle, &header.header).await?;
        let batch = prepare_batch(records, &header.header, last_sequence, existing);
        report.skipped_duplicates = batch.skipped_duplicates;
        report.warnings = batch.warnings;

        if batch.rows.is_empty() {
            info!(
                skipped = batch.skipped_duplicates,
                "nothing new to append; every record is already stored"
            );
            report.status = AppendStatus::NothingToAdd(NothingToAdd::AllDuplicates);
            return Ok(report);
        }

        let count = batch.rows.len();
        backend
            .append_rows(&handle, &batch.rows)
            .await
            .map_err(|source| ReconcileError::Append {
                partition: report.partition.clone(),
                rows: count,
                source,
            })?;

        let last = batch.first_sequence.saturating_add(count as u64 - 1);
        info!(
            count,
            first_sequence = batch.first_sequence,
            last_sequence = last,
            skipped = batch.skipped_duplicates,
            "appended rows"
        );
        report.status = AppendStatus::Appended {
            count,
            first_sequence: batch.first_sequence,
            last_sequence: last,
        };
        Ok(report)
    }

    /// Computes the rows `append` would write without touching the backend's contents.
    pub async fn plan(
        &self,
        records: &[IncomingRecord],
        target_date: &str,
    ) -> Result<AppendPlan, ReconcileError> {
        let partition = self.partition_name(target_date)?;
        let backend = self.backend.as_ref();
        let handle = backend
            .find_partition(&partition)
            .await
            .map_err(|source| ReconcileError::PartitionOpen {
                partition: partition.clone(),
                source,
            })?;

        let (header, last_sequence, existing) = match &handle {
            Some(handle) => {
                let existing_header = backend.read_header(handle).await.map_err(|source| {
                    ReconcileError::HeaderRead {
                        partition: partition.clone(),
                        source,
                    }
                })?;
                let header = plan_header(&existing_header, &canonical_header());
                let last = last_sequence_number(backend, handle, &existing_header).await?;
                // Reconciliation always adds an `ID` column, so a missing one reads as empty.
                let ids = existing_identifiers(backend, handle, &existing_header)
                    .await?
                    .unwrap_or_default();
                (header, last, Some(ids))
            }
            None => (
                plan_header(&[], &canonical_header()),
                0,
                Some(HashSet::new()),
            ),
        };

        let batch = prepare_batch(records, &header.header, last_sequence, existing);
        Ok(AppendPlan {
            partition,
            partition_exists: handle.is_some(),
            header: header.header,
            header_added: header.added,
            last_sequence,
            skipped_duplicates: batch.skipped_duplicates,
            rows: batch.rows,
            warnings: batch.warnings,
        })
    }

    /// Read-only summary of a partition's current state.
    pub async fn inspect(&self, target_date: &str) -> Result<PartitionSnapshot, ReconcileError> {
        let partition = self.partition_name(target_date)?;
        let backend = self.backend.as_ref();
        let handle = backend
            .find_partition(&partition)
            .await
            .map_err(|source| ReconcileError::PartitionOpen {
                partition: partition.clone(),
                source,
            })?;
        let Some(handle) = handle else {
            return Ok(PartitionSnapshot {
                partition,
                exists: false,
                header: Vec::new(),
                missing_columns: canonical_header(),
                last_sequence: 0,
                stored_identifiers: 0,
            });
        };

        let header = backend
            .read_header(&handle)
            .await
            .map_err(|source| ReconcileError::HeaderRead {
                partition: partition.clone(),
                source,
            })?;
        let missing_columns = plan_header(&header, &canonical_header()).added;
        let last_sequence = last_sequence_number(backend, &handle, &header).await?;
        let stored_identifiers = existing_identifiers(backend, &handle, &header)
            .await?
            .map_or(0, |ids| ids.len());
        Ok(PartitionSnapshot {
            partition,
            exists: true,
            header,
            missing_columns,
            last_sequence,
            stored_identifiers,
        })
    }

    /// Search keywords from the `Palabras Clave` tab. A missing tab yields no keywords.
    pub async fn keywords(&self) -> Result<Vec<String>, BackendError> {
        let backend = self.backend.as_ref();
        let Some(handle) = backend.find_partition(KEYWORDS_PARTITION).await? else {
            warn!(partition = KEYWORDS_PARTITION, "keyword partition not found");
            return Ok(Vec::new());
        };
        // read_column starts at row 2.
        let cells = backend.read_column(&handle, KEYWORDS_COLUMN).await?;
        let keywords = cells
            .iter()
            .skip(KEYWORDS_FIRST_ROW - 2)
            .take(KEYWORDS_LAST_ROW - KEYWORDS_FIRST_ROW + 1)
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();
        info!(count = keywords.len(), "loaded keywords");
        Ok(keywords)
    }
}

/// Reads a JSON array of producer records.
pub async fn load_records(path: impl AsRef<Path>) -> Result<Vec<IncomingRecord>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub fn reconciler_from_env() -> Result<Reconciler> {
    let config = LedgerConfig::from_env();
    let backend = open_backend(&config)?;
    Ok(Reconciler::new(backend).with_locale(config.month_locale))
}
