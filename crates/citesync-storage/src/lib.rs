//! Citation store (SQLite), derived-artifact storage and HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::NaiveDateTime;
use citesync_core::{format_timestamp, parse_timestamp, CitationRecord, Column, CITATIONS_TABLE};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "citesync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored timestamp {0:?} is not ISO-8601")]
    CorruptTimestamp(String),
}

/// Per-year count of citations carrying a geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryCount {
    pub year: i32,
    pub count: i64,
}

/// Handle to the citation database. Acquired once by the caller and passed
/// to every component that reads or appends citations.
#[derive(Debug, Clone)]
pub struct CitationStore {
    pool: SqlitePool,
}

impl CitationStore {
    /// Open (creating the file if needed) a SQLite database such as
    /// `sqlite://sfmta_parking_citations.db`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn create_table(&self) -> Result<(), StoreError> {
        sqlx::query(&create_table_sql()).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn table_exists(&self) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        )
        .bind(CITATIONS_TABLE)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Append records in one transaction, creating the table when absent.
    /// No deduplication is performed against existing rows.
    pub async fn append(&self, records: &[CitationRecord]) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let insert = insert_sql();
        let mut tx = self.pool.begin().await?;
        sqlx::query(&create_table_sql()).execute(&mut *tx).await?;
        let mut appended = 0u64;
        for record in records {
            let result = sqlx::query(&insert)
                .bind(record.citation_number.as_deref())
                .bind(format_timestamp(record.citation_issued_datetime))
                .bind(record.violation.as_deref())
                .bind(record.violation_description.as_deref())
                .bind(record.citation_location.as_deref())
                .bind(record.vehicle_plate_state.as_deref())
                .bind(record.vehicle_plate.as_deref())
                .bind(record.fine_amount)
                .bind(record.date_added.as_deref())
                .bind(record.geom.as_deref())
                .execute(&mut *tx)
                .await?;
            appended += result.rows_affected();
        }
        tx.commit().await?;
        Ok(appended)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        if !self.table_exists().await? {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) FROM {CITATIONS_TABLE}");
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }

    /// Issued timestamp of the most recent stored citation, `None` when the
    /// store holds no rows.
    pub async fn latest_issued(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        if !self.table_exists().await? {
            return Ok(None);
        }
        let sql = format!("SELECT MAX({}) FROM {CITATIONS_TABLE}", Column::CitationIssuedDateTime);
        let raw: Option<String> = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        raw.map(|raw| parse_timestamp(&raw).ok_or(StoreError::CorruptTimestamp(raw)))
            .transpose()
    }

    /// Every stored citation sharing the most recent issued timestamp.
    pub async fn latest_records(&self) -> Result<Vec<CitationRecord>, StoreError> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM {CITATIONS_TABLE} \
             WHERE {issued} = (SELECT MAX({issued}) FROM {CITATIONS_TABLE}) ORDER BY rowid",
            select_list(),
            issued = Column::CitationIssuedDateTime,
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(record) = map_row(row)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Citations issued in `[year-01-01, (year+1)-01-01)`, in insertion order.
    pub async fn records_for_year(&self, year: i32) -> Result<Vec<CitationRecord>, StoreError> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {} FROM {CITATIONS_TABLE} WHERE {issued} >= ?1 AND {issued} < ?2 ORDER BY rowid",
            select_list(),
            issued = Column::CitationIssuedDateTime,
        );
        let rows = sqlx::query(&sql)
            .bind(format!("{year:04}-01-01"))
            .bind(format!("{:04}-01-01", year + 1))
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match map_row(row)? {
                Some(record) => records.push(record),
                None => warn!(year, "skipping stored row with unparseable issued timestamp"),
            }
        }
        Ok(records)
    }

    pub async fn geometry_counts_by_year(&self) -> Result<Vec<GeometryCount>, StoreError> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT substr({issued}, 1, 4) AS year, COUNT(*) AS count FROM {CITATIONS_TABLE} \
             WHERE geom IS NOT NULL GROUP BY year ORDER BY year",
            issued = Column::CitationIssuedDateTime,
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut counts = Vec::new();
        for row in rows {
            let year: Option<String> = row.try_get("year")?;
            let count: i64 = row.try_get("count")?;
            if let Some(year) = year.and_then(|y| y.parse::<i32>().ok()) {
                counts.push(GeometryCount { year, count });
            }
        }
        Ok(counts)
    }
}

fn create_table_sql() -> String {
    let columns = Column::ALL
        .iter()
        .map(|c| format!("{} {}", c.name(), c.sql_type()))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE IF NOT EXISTS {CITATIONS_TABLE} ({columns})")
}

fn insert_sql() -> String {
    let names = Column::ALL.map(Column::name).join(", ");
    let params = (1..=Column::ALL.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {CITATIONS_TABLE} ({names}) VALUES ({params})")
}

// Rows seeded by the bulk import may carry integer or text affinities that
// differ from the declared column types; cast so decoding is uniform.
fn select_list() -> String {
    Column::ALL
        .iter()
        .map(|c| {
            let target = if *c == Column::FineAmount { "REAL" } else { "TEXT" };
            format!("CAST({name} AS {target}) AS {name}", name = c.name())
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_row(row: &SqliteRow) -> Result<Option<CitationRecord>, StoreError> {
    let text = |column: Column| row.try_get::<Option<String>, _>(column.name());
    let Some(issued) = text(Column::CitationIssuedDateTime)?.as_deref().and_then(parse_timestamp)
    else {
        return Ok(None);
    };
    Ok(Some(CitationRecord {
        citation_number: text(Column::CitationNumber)?,
        citation_issued_datetime: issued,
        violation: text(Column::Violation)?,
        violation_description: text(Column::ViolationDescription)?,
        citation_location: text(Column::CitationLocation)?,
        vehicle_plate_state: text(Column::VehiclePlateState)?,
        vehicle_plate: text(Column::VehiclePlate)?,
        fine_amount: row.try_get(Column::FineAmount.name())?,
        date_added: text(Column::DateAdded)?,
        geom: text(Column::Geom)?,
    }))
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Write-once storage for derived outputs (enrichment tables, manifests).
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<kind>/<label>-<hash prefix>.<ext>`, e.g. `enrichment/2022-3f9a1c2b4d5e.parquet`.
    pub fn artifact_relative_path(
        &self,
        kind: &str,
        label: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let short = &content_hash[..content_hash.len().min(12)];
        PathBuf::from(kind).join(format!("{label}-{short}.{ext}"))
    }

    /// Store bytes under a content-addressed name via temp file + rename.
    /// Identical content for the same kind and label is written only once.
    pub async fn store_bytes(
        &self,
        kind: &str,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(kind, label, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = self.root.join(kind);

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        debug!(path = %absolute_path.display(), bytes = bytes.len(), "stored artifact");
        Ok(artifact(false))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Thin GET client shared by the remote adapters. Calls are issued one at a
/// time by their callers and are never retried here.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    /// URL after redirects.
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get(
        &self,
        api: &str,
        url: &str,
        query: &[(&str, &str)],
        headers: &[(&str, &str)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", api, url);
        async {
            let started = Instant::now();
            let mut request = self.client.get(url).query(query);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            let resp = request.send().await.map_err(|err| classify(err, url))?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| classify(err, url))?
                .to_vec();
            debug!(
                status = status.as_u16(),
                bytes = body.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "fetched"
            );
            Ok(FetchedResponse {
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn classify(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Request(err)
    }
}
