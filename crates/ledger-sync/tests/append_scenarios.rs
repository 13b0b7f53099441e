use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ledger_core::{canonical_header, IncomingRecord, MonthLocale};
use ledger_storage::{BackendError, MemoryBackend, PartitionHandle, TabularBackend, WorkbookDir};
use ledger_sync::{
    load_records, AppendStatus, NothingToAdd, ReconcileError, ReconcileWarning, Reconciler,
    KEYWORDS_PARTITION,
};

/// Memory backend that counts calls and can be told to refuse header writes or appends.
#[derive(Clone, Default)]
struct FaultyBackend {
    inner: MemoryBackend,
    fail_header_writes: bool,
    fail_appends: bool,
    calls: Arc<AtomicUsize>,
}

impl FaultyBackend {
    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TabularBackend for FaultyBackend {
    async fn find_partition(&self, name: &str) -> Result<Option<PartitionHandle>, BackendError> {
        self.tick();
        self.inner.find_partition(name).await
    }

    async fn create_partition(&self, name: &str) -> Result<PartitionHandle, BackendError> {
        self.tick();
        self.inner.create_partition(name).await
    }

    async fn read_header(&self, partition: &PartitionHandle) -> Result<Vec<String>, BackendError> {
        self.tick();
        self.inner.read_header(partition).await
    }

    async fn write_header(
        &self,
        partition: &PartitionHandle,
        header: &[String],
    ) -> Result<(), BackendError> {
        self.tick();
        if self.fail_header_writes {
            return Err(BackendError::Message("permission denied".into()));
        }
        self.inner.write_header(partition, header).await
    }

    async fn read_column(
        &self,
        partition: &PartitionHandle,
        index: usize,
    ) -> Result<Vec<String>, BackendError> {
        self.tick();
        self.inner.read_column(partition, index).await
    }

    async fn append_rows(
        &self,
        partition: &PartitionHandle,
        rows: &[Vec<String>],
    ) -> Result<(), BackendError> {
        self.tick();
        if self.fail_appends {
            return Err(BackendError::HttpStatus {
                status: 429,
                url: "https://sheets.example/append".into(),
            });
        }
        self.inner.append_rows(partition, rows).await
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn rec(id: &str, titulo: &str) -> IncomingRecord {
    IncomingRecord {
        id: Some(id.to_string()),
        titulo: Some(titulo.to_string()),
        ..Default::default()
    }
}

fn row_with(header: &[String], values: &[(&str, &str)]) -> Vec<String> {
    header
        .iter()
        .map(|h| {
            values
                .iter()
                .find(|(name, _)| name == h)
                .map(|(_, v)| v.to_string())
                .unwrap_or_default()
        })
        .collect()
}

fn reconciler(backend: &MemoryBackend) -> Reconciler {
    Reconciler::new(Box::new(backend.clone()))
}

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name)
}

#[tokio::test]
async fn empty_partition_gets_canonical_header_and_first_rows() {
    let backend = MemoryBackend::new();
    let report = reconciler(&backend)
        .append(&[rec("A1", "X"), rec("A2", "Y")], "2024-08-15")
        .await
        .unwrap();

    assert_eq!(report.partition, "August");
    assert!(report.partition_created);
    assert_eq!(report.header_added, canonical_header());
    assert_eq!(
        report.status,
        AppendStatus::Appended {
            count: 2,
            first_sequence: 1,
            last_sequence: 2
        }
    );
    assert!(report.warnings.is_empty());

    let rows = backend.rows("August").await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], canonical_header());
    assert_eq!((rows[1][0].as_str(), rows[1][3].as_str(), rows[1][4].as_str()), ("1", "A1", "X"));
    assert_eq!((rows[2][0].as_str(), rows[2][3].as_str(), rows[2][4].as_str()), ("2", "A2", "Y"));
}

#[tokio::test]
async fn stored_identifier_is_skipped_and_numbering_continues() {
    let backend = MemoryBackend::new();
    let header = canonical_header();
    backend
        .insert_partition(
            "August",
            vec![header.clone(), row_with(&header, &[("Número", "5"), ("ID", "A1")])],
        )
        .await;

    let report = reconciler(&backend)
        .append(&[IncomingRecord::with_id("A1"), IncomingRecord::with_id("A2")], "2024-08-02")
        .await
        .unwrap();

    assert_eq!(report.appended(), 1);
    assert_eq!(report.skipped_duplicates, 1);
    assert!(!report.partition_created);
    assert!(report.header_added.is_empty());
    let rows = backend.rows("August").await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[2][0], "6");
    assert_eq!(rows[2][3], "A2");
}

#[tokio::test]
async fn repeating_a_run_adds_nothing() {
    let backend = MemoryBackend::new();
    let records = vec![rec("A1", "X"), rec("A2", "Y"), rec("A3", "Z")];
    let reconciler = reconciler(&backend);

    let first = reconciler.append(&records, "2024-08-15").await.unwrap();
    assert_eq!(first.appended(), 3);
    let after_first = backend.rows("August").await.unwrap();

    let second = reconciler.append(&records, "2024-08-16").await.unwrap();
    assert_eq!(
        second.status,
        AppendStatus::NothingToAdd(NothingToAdd::AllDuplicates)
    );
    assert_eq!(second.skipped_duplicates, 3);
    assert_eq!(backend.rows("August").await.unwrap(), after_first);
}

#[tokio::test]
async fn sequence_runs_are_contiguous_across_appends() {
    let backend = MemoryBackend::new();
    let reconciler = reconciler(&backend);
    reconciler
        .append(&[rec("A1", "a"), rec("A2", "b")], "2024-08-01")
        .await
        .unwrap();
    let report = reconciler
        .append(&[rec("A2", "b"), rec("A3", "c"), rec("A4", "d")], "2024-08-02")
        .await
        .unwrap();
    assert_eq!(
        report.status,
        AppendStatus::Appended {
            count: 2,
            first_sequence: 3,
            last_sequence: 4
        }
    );
    let numbers = backend.rows("August").await.unwrap()[1..]
        .iter()
        .map(|r| r[0].clone())
        .collect::<Vec<_>>();
    assert_eq!(numbers, strings(&["1", "2", "3", "4"]));
}

#[tokio::test]
async fn records_without_ids_are_appended_with_a_warning() {
    let backend = MemoryBackend::new();
    let header = canonical_header();
    backend
        .insert_partition(
            "March",
            vec![header.clone(), row_with(&header, &[("Número", "3"), ("ID", "Q1")])],
        )
        .await;
    let records = vec![
        IncomingRecord {
            titulo: Some("sin id".into()),
            ..Default::default()
        },
        IncomingRecord {
            monto: Some("1000".into()),
            ..Default::default()
        },
    ];

    let report = reconciler(&backend).append(&records, "2025-03-09").await.unwrap();
    assert_eq!(report.appended(), 2);
    assert!(report
        .warnings
        .contains(&ReconcileWarning::IdentifierFieldMissing));
    let rows = backend.rows("March").await.unwrap();
    assert_eq!(rows[2][0], "4");
    assert_eq!(rows[3][0], "5");
    assert_eq!(rows[3][7], "1000");
}

#[tokio::test]
async fn drifted_sequence_header_and_malformed_cells_are_tolerated() {
    let backend = MemoryBackend::new();
    let mut header = canonical_header();
    header[0] = "N°".to_string();
    let cells = ["3 (pending)", "", "-1", "7"];
    let mut rows = vec![header.clone()];
    for (i, cell) in cells.iter().enumerate() {
        let id = format!("OLD{i}");
        rows.push(row_with(&header, &[("N°", cell), ("ID", id.as_str())]));
    }
    backend.insert_partition("August", rows).await;

    let report = reconciler(&backend)
        .append(&[rec("NEW", "t")], "2024-08-30")
        .await
        .unwrap();

    assert_eq!(report.header_added, strings(&["Número"]));
    let stored = backend.rows("August").await.unwrap();
    let header = &stored[0];
    assert_eq!(header[0], "N°");
    assert_eq!(header.last().map(String::as_str), Some("Número"));
    let new_row = stored.last().unwrap();
    assert_eq!(new_row[0], "8");
    assert_eq!(new_row.last().map(String::as_str), Some("8"));
    assert_eq!(new_row[3], "NEW");
}

#[tokio::test]
async fn out_of_range_sequence_cell_does_not_break_numbering() {
    let backend = MemoryBackend::new();
    let header = canonical_header();
    backend
        .insert_partition(
            "August",
            vec![
                header.clone(),
                row_with(&header, &[("Número", "4"), ("ID", "KEEP")]),
                row_with(&header, &[("Número", "18446744073709551615"), ("ID", "OLD")]),
            ],
        )
        .await;

    let report = reconciler(&backend)
        .append(&[IncomingRecord::with_id("OLD"), IncomingRecord::with_id("NEW")], "2024-08-15")
        .await
        .unwrap();

    assert_eq!(
        report.status,
        AppendStatus::Appended {
            count: 1,
            first_sequence: 5,
            last_sequence: 5
        }
    );
    let stored = backend.rows("August").await.unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[3][0], "5");
    assert_eq!(stored[3][3], "NEW");
}

#[tokio::test]
async fn legacy_id_column_keeps_deduplicating_after_reconciliation() {
    let backend = MemoryBackend::new();
    let mut header = canonical_header();
    header[3] = "Id".to_string();
    backend
        .insert_partition(
            "August",
            vec![header.clone(), row_with(&header, &[("Número", "1"), ("Id", "OLD")])],
        )
        .await;
    let reconciler = reconciler(&backend);

    let first = reconciler
        .append(&[rec("OLD", "x"), rec("NEW", "y")], "2024-08-15")
        .await
        .unwrap();
    assert_eq!(first.header_added, strings(&["ID"]));
    assert_eq!(first.appended(), 1);

    let second = reconciler
        .append(&[rec("OLD", "x"), rec("NEW", "y")], "2024-08-16")
        .await
        .unwrap();
    assert_eq!(
        second.status,
        AppendStatus::NothingToAdd(NothingToAdd::AllDuplicates)
    );
}

#[tokio::test]
async fn reordered_header_receives_values_by_name() {
    let backend = MemoryBackend::new();
    let mut header = canonical_header();
    header.reverse();
    header.push("Notas".to_string());
    backend.insert_partition("August", vec![header.clone()]).await;

    reconciler(&backend)
        .append(&[rec("A1", "X")], "2024-08-15")
        .await
        .unwrap();

    let stored = backend.rows("August").await.unwrap();
    assert_eq!(stored[0], header, "a complete header is left untouched");
    let row = &stored[1];
    let at = |name: &str| row[header.iter().position(|h| h == name).unwrap()].as_str();
    assert_eq!(at("Número"), "1");
    assert_eq!(at("ID"), "A1");
    assert_eq!(at("Título"), "X");
    assert_eq!(at("Notas"), "");
}

#[tokio::test]
async fn invalid_date_fails_before_any_backend_call() {
    let backend = FaultyBackend::default();
    let calls = backend.calls.clone();
    let err = Reconciler::new(Box::new(backend))
        .append(&[rec("A1", "X")], "15/08/2024")
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidDate(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_input_is_a_noop_without_backend_io() {
    let backend = FaultyBackend::default();
    let calls = backend.calls.clone();
    let report = Reconciler::new(Box::new(backend))
        .append(&[], "2024-08-15")
        .await
        .unwrap();
    assert_eq!(report.status, AppendStatus::NothingToAdd(NothingToAdd::NoInput));
    assert_eq!(report.appended(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn header_write_failure_aborts_before_append() {
    let backend = FaultyBackend {
        fail_header_writes: true,
        ..Default::default()
    };
    let inner = backend.inner.clone();
    let err = Reconciler::new(Box::new(backend))
        .append(&[rec("A1", "X")], "2024-08-15")
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::SchemaWrite { .. }));
    assert_eq!(inner.rows("August").await, Some(Vec::new()));
}

#[tokio::test]
async fn append_failure_surfaces_and_a_rerun_recovers() {
    let failing = FaultyBackend {
        fail_appends: true,
        ..Default::default()
    };
    let inner = failing.inner.clone();
    let err = Reconciler::new(Box::new(failing))
        .append(&[rec("A1", "X")], "2024-08-15")
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::Append { rows: 1, .. }));
    assert_eq!(inner.rows("August").await.unwrap(), vec![canonical_header()]);

    let report = reconciler(&inner)
        .append(&[rec("A1", "X")], "2024-08-15")
        .await
        .unwrap();
    assert_eq!(report.appended(), 1);
    assert!(report.header_added.is_empty());
}

#[tokio::test]
async fn plan_leaves_the_backend_untouched() {
    let backend = MemoryBackend::new();
    let plan = reconciler(&backend)
        .plan(&[rec("A1", "X"), rec("A2", "Y")], "2024-08-15")
        .await
        .unwrap();
    assert_eq!(plan.partition, "August");
    assert!(!plan.partition_exists);
    assert_eq!(plan.header, canonical_header());
    assert_eq!(plan.rows.len(), 2);
    assert_eq!(plan.rows[1][0], "2");
    assert!(backend.partition_names().await.is_empty());
}

#[tokio::test]
async fn inspect_reports_partition_state() {
    let backend = MemoryBackend::new();
    let reconciler = reconciler(&backend);

    let missing = reconciler.inspect("2024-08-15").await.unwrap();
    assert!(!missing.exists);
    assert_eq!(missing.missing_columns.len(), 13);

    reconciler
        .append(&[rec("A1", "X"), rec("A2", "Y")], "2024-08-15")
        .await
        .unwrap();
    let snapshot = reconciler.inspect("2024-08-31").await.unwrap();
    assert!(snapshot.exists);
    assert!(snapshot.missing_columns.is_empty());
    assert_eq!(snapshot.last_sequence, 2);
    assert_eq!(snapshot.stored_identifiers, 2);
}

#[tokio::test]
async fn spanish_locale_names_partitions_in_spanish() {
    let backend = MemoryBackend::new();
    let report = Reconciler::new(Box::new(backend.clone()))
        .with_locale(MonthLocale::Spanish)
        .append(&[rec("A1", "X")], "2024-08-15")
        .await
        .unwrap();
    assert_eq!(report.partition, "Agosto");
    assert!(backend.rows("Agosto").await.is_some());
}

#[tokio::test]
async fn keywords_come_from_column_f_rows_8_to_19() {
    let backend = MemoryBackend::new();
    let rows = (1..=22)
        .map(|r| {
            let mut row = vec![String::new(); 6];
            row[5] = match r {
                10 => "   ".to_string(),
                8..=19 => format!(" kw{r} "),
                _ => format!("other{r}"),
            };
            row
        })
        .collect::<Vec<_>>();
    backend.insert_partition(KEYWORDS_PARTITION, rows).await;

    let keywords = reconciler(&backend).keywords().await.unwrap();
    let expected = (8..=19)
        .filter(|r| *r != 10)
        .map(|r| format!("kw{r}"))
        .collect::<Vec<_>>();
    assert_eq!(keywords, expected);
}

#[tokio::test]
async fn missing_keyword_partition_yields_no_keywords() {
    let backend = MemoryBackend::new();
    assert!(reconciler(&backend).keywords().await.unwrap().is_empty());
}

#[tokio::test]
async fn workbook_dir_round_trip_with_fixture_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let records = load_records(fixture_path("sample-records.json"))
        .await
        .unwrap();
    assert_eq!(records.len(), 3);

    let reconciler = Reconciler::new(Box::new(WorkbookDir::new(dir.path())));
    let first = reconciler.append(&records, "2024-08-15").await.unwrap();
    assert_eq!(first.appended(), 3);
    let second = reconciler.append(&records, "2024-08-15").await.unwrap();
    assert_eq!(
        second.status,
        AppendStatus::NothingToAdd(NothingToAdd::AllDuplicates)
    );

    let workbook = WorkbookDir::new(dir.path());
    let handle = workbook.find_partition("August").await.unwrap().unwrap();
    let amounts = workbook.read_column(&handle, 7).await.unwrap();
    assert_eq!(amounts, strings(&["48500000", "NF", ""]));
    let flags = workbook.read_column(&handle, 11).await.unwrap();
    assert_eq!(flags, strings(&["Sí", "false", ""]));
}
