//! Tabular backends the ledger appends into: in-memory grids, a workbook
//! directory of JSON partitions, and the Google Sheets values API.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ledger-storage";

/// Opaque reference to one partition (sheet tab) of a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHandle {
    pub title: String,
    /// True when this handle came from `create_partition` in the current run.
    pub created: bool,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("partition {0:?} not found")]
    PartitionNotFound(String),
    #[error("partition {0:?} already exists")]
    PartitionExists(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed partition file {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid request url: {0}")]
    Url(String),
    #[error("{op} gave up without a response")]
    RetriesExhausted { op: &'static str },
    #[error("{0}")]
    Message(String),
}

/// Grid-shaped storage addressed by partition name, row and column.
///
/// Row 1 of every partition is the header. `read_column` takes a 0-based
/// column index and returns the cells below the header, so element 0 is row 2.
#[async_trait]
pub trait TabularBackend: Send + Sync {
    async fn find_partition(&self, name: &str) -> Result<Option<PartitionHandle>, BackendError>;

    async fn create_partition(&self, name: &str) -> Result<PartitionHandle, BackendError>;

    async fn open_or_create_partition(&self, name: &str) -> Result<PartitionHandle, BackendError> {
        match self.find_partition(name).await? {
            Some(handle) => Ok(handle),
            None => self.create_partition(name).await,
        }
    }

    /// Header row with trailing empty cells removed. Empty when the partition has no header.
    async fn read_header(&self, partition: &PartitionHandle) -> Result<Vec<String>, BackendError>;

    async fn write_header(
        &self,
        partition: &PartitionHandle,
        header: &[String],
    ) -> Result<(), BackendError>;

    async fn read_column(
        &self,
        partition: &PartitionHandle,
        index: usize,
    ) -> Result<Vec<String>, BackendError>;

    async fn append_rows(
        &self,
        partition: &PartitionHandle,
        rows: &[Vec<String>],
    ) -> Result<(), BackendError>;
}

fn trim_trailing_empty(mut row: Vec<String>) -> Vec<String> {
    while row.last().is_some_and(|c| c.is_empty()) {
        row.pop();
    }
    row
}

fn grid_header(rows: &[Vec<String>]) -> Vec<String> {
    rows.first()
        .cloned()
        .map(trim_trailing_empty)
        .unwrap_or_default()
}

fn grid_column(rows: &[Vec<String>], index: usize) -> Vec<String> {
    rows.iter()
        .skip(1)
        .map(|row| row.get(index).cloned().unwrap_or_default())
        .collect()
}

fn grid_set_header(rows: &mut Vec<Vec<String>>, header: &[String]) {
    match rows.first_mut() {
        Some(first) => *first = header.to_vec(),
        None => rows.push(header.to_vec()),
    }
}

/// In-process backend. Clones share the same grids.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    partitions: Arc<Mutex<BTreeMap<String, Vec<Vec<String>>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a partition with raw rows (header first).
    pub async fn insert_partition(&self, name: &str, rows: Vec<Vec<String>>) {
        self.partitions.lock().await.insert(name.to_string(), rows);
    }

    pub async fn rows(&self, name: &str) -> Option<Vec<Vec<String>>> {
        self.partitions.lock().await.get(name).cloned()
    }

    pub async fn partition_names(&self) -> Vec<String> {
        self.partitions.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl TabularBackend for MemoryBackend {
    async fn find_partition(&self, name: &str) -> Result<Option<PartitionHandle>, BackendError> {
        let map = self.partitions.lock().await;
        Ok(map.contains_key(name).then(|| PartitionHandle {
            title: name.to_string(),
            created: false,
        }))
    }

    async fn create_partition(&self, name: &str) -> Result<PartitionHandle, BackendError> {
        let mut map = self.partitions.lock().await;
        if map.contains_key(name) {
            return Err(BackendError::PartitionExists(name.to_string()));
        }
        map.insert(name.to_string(), Vec::new());
        Ok(PartitionHandle {
            title: name.to_string(),
            created: true,
        })
    }

    async fn read_header(&self, partition: &PartitionHandle) -> Result<Vec<String>, BackendError> {
        let map = self.partitions.lock().await;
        let rows = map
            .get(&partition.title)
            .ok_or_else(|| BackendError::PartitionNotFound(partition.title.clone()))?;
        Ok(grid_header(rows))
    }

    async fn write_header(
        &self,
        partition: &PartitionHandle,
        header: &[String],
    ) -> Result<(), BackendError> {
        let mut map = self.partitions.lock().await;
        let rows = map
            .get_mut(&partition.title)
            .ok_or_else(|| BackendError::PartitionNotFound(partition.title.clone()))?;
        grid_set_header(rows, header);
        Ok(())
    }

    async fn read_column(
        &self,
        partition: &PartitionHandle,
        index: usize,
    ) -> Result<Vec<String>, BackendError> {
        let map = self.partitions.lock().await;
        let rows = map
            .get(&partition.title)
            .ok_or_else(|| BackendError::PartitionNotFound(partition.title.clone()))?;
        Ok(grid_column(rows, index))
    }

    async fn append_rows(
        &self,
        partition: &PartitionHandle,
        rows: &[Vec<String>],
    ) -> Result<(), BackendError> {
        let mut map = self.partitions.lock().await;
        let grid = map
            .get_mut(&partition.title)
            .ok_or_else(|| BackendError::PartitionNotFound(partition.title.clone()))?;
        grid.extend(rows.iter().cloned());
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PartitionFile {
    title: String,
    rows: Vec<Vec<String>>,
}

/// Directory of partitions, one `<title>.json` document each.
#[derive(Debug, Clone)]
pub struct WorkbookDir {
    root: PathBuf,
}

impl WorkbookDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_path(&self, title: &str) -> PathBuf {
        let stem = title
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                other => other,
            })
            .collect::<String>();
        self.root.join(format!("{stem}.json"))
    }

    async fn load(&self, title: &str) -> Result<PartitionFile, BackendError> {
        let path = self.partition_path(title);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::PartitionNotFound(title.to_string()))
            }
            Err(source) => return Err(BackendError::Io { path, source }),
        };
        serde_json::from_str(&text).map_err(|source| BackendError::Malformed { path, source })
    }

    /// Write via a temp file and atomic rename so a crash never leaves a torn partition.
    async fn save(&self, file: &PartitionFile) -> Result<(), BackendError> {
        let path = self.partition_path(&file.title);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| BackendError::Io { path, source }
        };

        fs::create_dir_all(&self.root)
            .await
            .map_err(io_err(&self.root))?;

        let bytes = serde_json::to_vec_pretty(file).map_err(|source| BackendError::Malformed {
            path: path.clone(),
            source,
        })?;
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut handle = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err(&temp_path))?;
        handle.write_all(&bytes).await.map_err(io_err(&temp_path))?;
        handle.flush().await.map_err(io_err(&temp_path))?;
        drop(handle);

        if let Err(source) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(BackendError::Io { path, source });
        }
        debug!(path = %path.display(), rows = file.rows.len(), "saved partition");
        Ok(())
    }
}

#[async_trait]
impl TabularBackend for WorkbookDir {
    async fn find_partition(&self, name: &str) -> Result<Option<PartitionHandle>, BackendError> {
        let path = self.partition_path(name);
        let exists = fs::try_exists(&path)
            .await
            .map_err(|source| BackendError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(exists.then(|| PartitionHandle {
            title: name.to_string(),
            created: false,
        }))
    }

    async fn create_partition(&self, name: &str) -> Result<PartitionHandle, BackendError> {
        if self.find_partition(name).await?.is_some() {
            return Err(BackendError::PartitionExists(name.to_string()));
        }
        self.save(&PartitionFile {
            title: name.to_string(),
            rows: Vec::new(),
        })
        .await?;
        Ok(PartitionHandle {
            title: name.to_string(),
            created: true,
        })
    }

    async fn read_header(&self, partition: &PartitionHandle) -> Result<Vec<String>, BackendError> {
        let file = self.load(&partition.title).await?;
        Ok(grid_header(&file.rows))
    }

    async fn write_header(
        &self,
        partition: &PartitionHandle,
        header: &[String],
    ) -> Result<(), BackendError> {
        let mut file = self.load(&partition.title).await?;
        grid_set_header(&mut file.rows, header);
        self.save(&file).await
    }

    async fn read_column(
        &self,
        partition: &PartitionHandle,
        index: usize,
    ) -> Result<Vec<String>, BackendError> {
        let file = self.load(&partition.title).await?;
        Ok(grid_column(&file.rows, index))
    }

    async fn append_rows(
        &self,
        partition: &PartitionHandle,
        rows: &[Vec<String>],
    ) -> Result<(), BackendError> {
        let mut file = self.load(&partition.title).await?;
        file.rows.extend(rows.iter().cloned());
        self.save(&file).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Sheets reports exhausted per-minute quota as 429.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// New tabs get the same grid size the sheet UI uses for manual tabs.
const NEW_SHEET_ROWS: u32 = 1000;
const NEW_SHEET_COLUMNS: u32 = 20;

#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    /// OAuth bearer token; obtaining and refreshing it is the caller's job.
    pub access_token: String,
    pub api_base: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl SheetsConfig {
    pub fn new(spreadsheet_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.into(),
            access_token: access_token.into(),
            api_base: SHEETS_API_BASE.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

/// Spreadsheet column letters for a 0-based index: 0 → A, 25 → Z, 26 → AA.
pub fn column_letter(index: usize) -> String {
    let mut n = index + 1;
    let mut letters = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        n = (n - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Sheet title quoted for A1 notation, with embedded quotes doubled.
pub fn quoted_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

#[derive(Debug)]
pub struct SheetsBackend {
    client: reqwest::Client,
    config: SheetsConfig,
}

impl SheetsBackend {
    pub fn new(config: SheetsConfig) -> Result<Self, BackendError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build()?;
        Ok(Self { client, config })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url =
            Url::parse(&self.config.api_base).map_err(|err| BackendError::Url(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| BackendError::Url(format!("{} cannot be a base", self.config.api_base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn values_url(&self, range: &str) -> Result<Url, BackendError> {
        self.url(&[self.config.spreadsheet_id.as_str(), "values", range])
    }

    async fn send<F>(&self, op: &'static str, build: F) -> Result<reqwest::Response, BackendError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder + Send + Sync,
    {
        let backoff = self.config.backoff;
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=backoff.max_retries {
            let result = build(&self.client)
                .bearer_auth(&self.config.access_token)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(op, status = status.as_u16(), attempt, "retrying sheets request");
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(BackendError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < backoff.max_retries
                    {
                        warn!(op, attempt, error = %err, "retrying sheets request");
                        last_request_error = Some(err);
                        tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(BackendError::Request(err));
                }
            }
        }

        Err(match last_request_error {
            Some(err) => BackendError::Request(err),
            None => BackendError::RetriesExhausted { op },
        })
    }

    async fn get_values(
        &self,
        op: &'static str,
        range: &str,
        by_column: bool,
    ) -> Result<ValueRange, BackendError> {
        let url = self.values_url(range)?;
        let dimension = if by_column { "COLUMNS" } else { "ROWS" };
        let resp = self
            .send(op, |client| {
                client
                    .get(url.clone())
                    .query(&[("majorDimension", dimension)])
            })
            .await?;
        Ok(resp.json::<ValueRange>().await?)
    }
}

#[async_trait]
impl TabularBackend for SheetsBackend {
    async fn find_partition(&self, name: &str) -> Result<Option<PartitionHandle>, BackendError> {
        let url = self.url(&[self.config.spreadsheet_id.as_str()])?;
        let resp = self
            .send("list_sheets", |client| {
                client
                    .get(url.clone())
                    .query(&[("fields", "sheets.properties.title")])
            })
            .await?;
        let meta = resp.json::<SpreadsheetMeta>().await?;
        Ok(meta
            .sheets
            .into_iter()
            .any(|s| s.properties.title == name)
            .then(|| PartitionHandle {
                title: name.to_string(),
                created: false,
            }))
    }

    async fn create_partition(&self, name: &str) -> Result<PartitionHandle, BackendError> {
        let batch_update = format!("{}:batchUpdate", self.config.spreadsheet_id);
        let url = self.url(&[batch_update.as_str()])?;
        let body = serde_json::json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": name,
                        "gridProperties": {
                            "rowCount": NEW_SHEET_ROWS,
                            "columnCount": NEW_SHEET_COLUMNS,
                        }
                    }
                }
            }]
        });
        self.send("add_sheet", |client| client.post(url.clone()).json(&body))
            .await?;
        Ok(PartitionHandle {
            title: name.to_string(),
            created: true,
        })
    }

    async fn read_header(&self, partition: &PartitionHandle) -> Result<Vec<String>, BackendError> {
        let range = format!("{}!1:1", quoted_title(&partition.title));
        let values = self.get_values("read_header", &range, false).await?;
        Ok(values
            .values
            .into_iter()
            .next()
            .map(trim_trailing_empty)
            .unwrap_or_default())
    }

    async fn write_header(
        &self,
        partition: &PartitionHandle,
        header: &[String],
    ) -> Result<(), BackendError> {
        let range = format!("{}!A1", quoted_title(&partition.title));
        let url = self.values_url(&range)?;
        let body = serde_json::json!({ "range": range, "values": [header] });
        self.send("write_header", |client| {
            client
                .put(url.clone())
                .query(&[("valueInputOption", "RAW")])
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn read_column(
        &self,
        partition: &PartitionHandle,
        index: usize,
    ) -> Result<Vec<String>, BackendError> {
        let letter = column_letter(index);
        let range = format!("{}!{letter}2:{letter}", quoted_title(&partition.title));
        let values = self.get_values("read_column", &range, true).await?;
        Ok(values.values.into_iter().next().unwrap_or_default())
    }

    async fn append_rows(
        &self,
        partition: &PartitionHandle,
        rows: &[Vec<String>],
    ) -> Result<(), BackendError> {
        if rows.is_empty() {
            return Ok(());
        }
        let range = format!("{}!A1", quoted_title(&partition.title));
        let url = self.values_url(&format!("{range}:append"))?;
        let body = serde_json::json!({ "values": rows });
        self.send("append_rows", |client| {
            client
                .post(url.clone())
                .query(&[
                    ("valueInputOption", "USER_ENTERED"),
                    ("insertDataOption", "INSERT_ROWS"),
                ])
                .json(&body)
        })
        .await?;
        Ok(())
    }
}
