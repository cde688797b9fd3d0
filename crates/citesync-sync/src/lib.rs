//! Incremental citation sync, the zip code enrichment sampler and the
//! scheduled runner that drives them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Local, NaiveDateTime, TimeDelta, Utc};
use citesync_adapters::{
    resolve_zip_codes, CitationFeed, LookupError, SocrataCitationSource, SourceError,
    UspsZipLookup, ZipLookup, BATCH_SLOTS, DEFAULT_FETCH_LIMIT, DEFAULT_SOCRATA_BASE_URL,
    DEFAULT_USPS_BASE_URL,
};
use citesync_core::{format_timestamp, CitationRecord, Column, ColumnMap, EnrichmentRow, FetchWindow};
use citesync_storage::{
    ArtifactStore, CitationStore, HttpClientConfig, HttpFetcher, StoreError, StoredArtifact,
};
use parquet::arrow::ArrowWriter;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "citesync-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub socrata_base_url: String,
    pub usps_base_url: String,
    pub socrata_token_file: PathBuf,
    pub usps_userid_file: PathBuf,
    pub fetch_limit: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub sample_seed: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("CITESYNC_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://sfmta_parking_citations.db".to_string()),
            artifacts_dir: std::env::var("CITESYNC_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            socrata_base_url: std::env::var("CITESYNC_SOCRATA_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_SOCRATA_BASE_URL.to_string()),
            usps_base_url: std::env::var("CITESYNC_USPS_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_USPS_BASE_URL.to_string()),
            socrata_token_file: std::env::var("CITESYNC_SOCRATA_TOKEN_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("API_token/sfmta_app_token.txt")),
            usps_userid_file: std::env::var("CITESYNC_USPS_USERID_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("API_token/usps_userid.txt")),
            fetch_limit: std::env::var("CITESYNC_FETCH_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_FETCH_LIMIT),
            http_timeout_secs: std::env::var("CITESYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("CITESYNC_USER_AGENT")
                .unwrap_or_else(|_| format!("citesync/{}", env!("CARGO_PKG_VERSION"))),
            scheduler_enabled: std::env::var("CITESYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("CITESYNC_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            sample_seed: std::env::var("CITESYNC_SAMPLE_SEED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// First line of a plain-text credential file, surrounding whitespace removed.
pub fn read_credential(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading credential file {}", path.display()))?;
    let value = raw.lines().next().unwrap_or_default().trim().to_string();
    if value.is_empty() {
        bail!("credential file {} is empty", path.display());
    }
    Ok(value)
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("citation store is empty; seed it before running an incremental sync")]
    EmptyStore,
    #[error(transparent)]
    Upstream(#[from] SourceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Most recent issued timestamp in the store. Read-only.
pub async fn resolve_watermark(store: &CitationStore) -> Result<NaiveDateTime, SyncError> {
    store.latest_issued().await?.ok_or(SyncError::EmptyStore)
}

/// Day-stepping cursor over `[watermark, now)`.
///
/// The step starts at one day and is halved (never below one minute) when a
/// window comes back truncated. Advancing restores the full day step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCursor {
    position: NaiveDateTime,
    now: NaiveDateTime,
    step: TimeDelta,
}

impl SyncCursor {
    pub fn new(watermark: NaiveDateTime, now: NaiveDateTime) -> Self {
        Self {
            position: watermark,
            now,
            step: Self::day_step(),
        }
    }

    pub fn day_step() -> TimeDelta {
        TimeDelta::days(1)
    }

    pub fn min_step() -> TimeDelta {
        TimeDelta::minutes(1)
    }

    pub fn position(&self) -> NaiveDateTime {
        self.position
    }

    pub fn step(&self) -> TimeDelta {
        self.step
    }

    pub fn is_done(&self) -> bool {
        self.position >= self.now
    }

    pub fn next_window(&self) -> Option<FetchWindow> {
        if self.is_done() {
            return None;
        }
        let end = (self.position + self.step).min(self.now);
        FetchWindow::new(self.position, end)
    }

    pub fn advance(&mut self, window: &FetchWindow) {
        self.position = window.end;
        self.step = Self::day_step();
    }

    /// Halve the step; `false` once the minimum step is already in use.
    pub fn shrink(&mut self) -> bool {
        if self.step <= Self::min_step() {
            return false;
        }
        self.step = (self.step / 2).max(Self::min_step());
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub watermark: NaiveDateTime,
    pub synced_until: NaiveDateTime,
    pub windows_fetched: usize,
    pub windows_shrunk: usize,
    pub truncated_windows: usize,
    pub rows_fetched: usize,
    pub rows_appended: u64,
    pub rows_rejected: usize,
    pub rows_already_stored: usize,
}

/// Pulls every citation issued since the watermark into the store, one
/// window at a time.
pub struct SyncDriver<'a> {
    store: &'a CitationStore,
    feed: &'a dyn CitationFeed,
    columns: ColumnMap,
    limit: usize,
}

impl<'a> SyncDriver<'a> {
    pub fn new(store: &'a CitationStore, feed: &'a dyn CitationFeed) -> Self {
        Self {
            store,
            feed,
            columns: ColumnMap::default(),
            limit: DEFAULT_FETCH_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_columns(mut self, columns: ColumnMap) -> Self {
        self.columns = columns;
        self
    }

    /// Sync `[watermark, now)`. Windows appended before an upstream failure
    /// stay committed, so a later run resumes from the new watermark.
    pub async fn run(&self, now: NaiveDateTime) -> Result<SyncRunSummary, SyncError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let watermark = resolve_watermark(self.store).await?;
        let at_watermark = self.store.latest_records().await?;
        info!(%run_id, watermark = %format_timestamp(watermark), now = %format_timestamp(now), "starting sync run");

        let mut summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            watermark,
            synced_until: watermark,
            windows_fetched: 0,
            windows_shrunk: 0,
            truncated_windows: 0,
            rows_fetched: 0,
            rows_appended: 0,
            rows_rejected: 0,
            rows_already_stored: 0,
        };

        let mut cursor = SyncCursor::new(watermark, now);
        while let Some(window) = cursor.next_window() {
            let batch = match self.feed.fetch_window(window, self.limit).await {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(%run_id, %window, error = %err, "window fetch failed; aborting run");
                    return Err(err.into());
                }
            };
            summary.windows_fetched += 1;

            if let Some(truncated) = batch.truncation() {
                if cursor.shrink() {
                    warn!(%truncated, step_secs = cursor.step().num_seconds(), "shrinking window");
                    summary.windows_shrunk += 1;
                    continue;
                }
                warn!(%truncated, "window truncated at the minimum step; appending partial result");
                summary.truncated_windows += 1;
            }

            summary.rows_fetched += batch.records.len();
            let mut records = Vec::with_capacity(batch.records.len());
            for raw in &batch.records {
                let record = match self.columns.reconcile(raw) {
                    Ok(record) => record,
                    Err(rejection) => {
                        warn!(%window, %rejection, "skipping citation row");
                        summary.rows_rejected += 1;
                        continue;
                    }
                };
                if record.citation_issued_datetime == watermark
                    && at_watermark.iter().any(|stored| same_citation(stored, &record))
                {
                    summary.rows_already_stored += 1;
                    continue;
                }
                records.push(record);
            }

            let appended = self.store.append(&records).await?;
            summary.rows_appended += appended;
            cursor.advance(&window);
            summary.synced_until = cursor.position();
            info!(%window, appended, "window synced");
        }

        summary.finished_at = Utc::now();
        info!(
            %run_id,
            windows = summary.windows_fetched,
            appended = summary.rows_appended,
            rejected = summary.rows_rejected,
            "sync run finished"
        );
        Ok(summary)
    }
}

// Rows at the watermark instant were stored by an earlier run and come back
// from the inclusive window start.
fn same_citation(stored: &CitationRecord, fetched: &CitationRecord) -> bool {
    match (&stored.citation_number, &fetched.citation_number) {
        (Some(a), Some(b)) => a == b,
        _ => stored == fetched,
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("sample fraction must be within [0, 1], got {0}")]
    InvalidFraction(f64),
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Seeded choice of `round(fraction * row_count)` row indices, ascending.
/// Halves round to even, so `(5, 0.5)` picks two rows.
pub fn sample_indices(row_count: usize, fraction: f64, seed: u64) -> Result<Vec<usize>, EnrichError> {
    if !fraction.is_finite() || !(0.0..=1.0).contains(&fraction) {
        return Err(EnrichError::InvalidFraction(fraction));
    }
    let amount = ((fraction * row_count as f64).round_ties_even() as usize).min(row_count);
    if amount == 0 {
        return Ok(Vec::new());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = index::sample(&mut rng, row_count, amount).into_vec();
    picked.sort_unstable();
    Ok(picked)
}

/// Attaches zip codes to a seeded sample of a year's citations.
pub struct EnrichmentSampler<'a> {
    lookup: &'a dyn ZipLookup,
    seed: u64,
}

impl<'a> EnrichmentSampler<'a> {
    pub fn new(lookup: &'a dyn ZipLookup, seed: u64) -> Self {
        Self { lookup, seed }
    }

    pub async fn sample(
        &self,
        rows: &[CitationRecord],
        fraction: f64,
    ) -> Result<Vec<EnrichmentRow>, EnrichError> {
        let picked = sample_indices(rows.len(), fraction, self.seed)?;
        let total_chunks = picked.len().div_ceil(BATCH_SLOTS);
        info!(population = rows.len(), sampled = picked.len(), chunks = total_chunks, "sampling for enrichment");

        let mut enriched = Vec::with_capacity(picked.len());
        for (chunk_no, chunk) in picked.chunks(BATCH_SLOTS).enumerate() {
            let addresses = chunk
                .iter()
                .map(|&i| rows[i].citation_location.as_deref())
                .collect::<Vec<_>>();
            let zips = resolve_zip_codes(self.lookup, &addresses).await?;
            for (&i, zip_code) in chunk.iter().zip(zips) {
                enriched.push(EnrichmentRow {
                    record: rows[i].clone(),
                    zip_code,
                });
            }
            info!(chunk = chunk_no + 1, total = total_chunks, "resolved zip code chunk");
        }
        Ok(enriched)
    }
}

/// Stored citations as Parquet, one column per storage column.
pub fn citations_parquet_bytes(records: &[CitationRecord]) -> Result<Vec<u8>> {
    let records = records.iter().collect::<Vec<_>>();
    parquet_bytes(citation_batch(&records, None)?)
}

/// Enriched rows as Parquet: every storage column plus `Zip_Code`.
pub fn enrichment_parquet_bytes(rows: &[EnrichmentRow]) -> Result<Vec<u8>> {
    let records = rows.iter().map(|r| &r.record).collect::<Vec<_>>();
    let zips = StringArray::from(rows.iter().map(|r| r.zip_code.as_deref()).collect::<Vec<_>>());
    parquet_bytes(citation_batch(&records, Some(zips))?)
}

fn citation_batch(records: &[&CitationRecord], zips: Option<StringArray>) -> Result<RecordBatch> {
    let mut fields = Column::ALL
        .iter()
        .map(|c| {
            let data_type = if *c == Column::FineAmount {
                DataType::Float64
            } else {
                DataType::Utf8
            };
            ArrowField::new(c.name(), data_type, *c != Column::CitationIssuedDateTime)
        })
        .collect::<Vec<_>>();

    let text = |pick: fn(&CitationRecord) -> Option<&str>| {
        Arc::new(StringArray::from(
            records.iter().map(|r| pick(r)).collect::<Vec<_>>(),
        )) as ArrayRef
    };
    let issued = StringArray::from(
        records
            .iter()
            .map(|r| Some(format_timestamp(r.citation_issued_datetime)))
            .collect::<Vec<_>>(),
    );
    let fines = Float64Array::from(records.iter().map(|r| r.fine_amount).collect::<Vec<_>>());

    let mut columns: Vec<ArrayRef> = vec![
        text(|r| r.citation_number.as_deref()),
        Arc::new(issued),
        text(|r| r.violation.as_deref()),
        text(|r| r.violation_description.as_deref()),
        text(|r| r.citation_location.as_deref()),
        text(|r| r.vehicle_plate_state.as_deref()),
        text(|r| r.vehicle_plate.as_deref()),
        Arc::new(fines),
        text(|r| r.date_added.as_deref()),
        text(|r| r.geom.as_deref()),
    ];
    if let Some(zips) = zips {
        fields.push(ArrowField::new("Zip_Code", DataType::Utf8, true));
        columns.push(Arc::new(zips));
    }

    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
        .context("building citation record batch")
}

fn parquet_bytes(batch: RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)
        .context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentManifest {
    pub schema_version: u32,
    pub year: i32,
    pub fraction: f64,
    pub seed: u64,
    pub population: usize,
    pub sampled: usize,
    pub resolved: usize,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentSummary {
    pub manifest: EnrichmentManifest,
    pub artifact_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// Write the Parquet table and its manifest next to each other under
/// `enrichment/`.
pub async fn store_enrichment(
    artifacts: &ArtifactStore,
    year: i32,
    fraction: f64,
    seed: u64,
    population: usize,
    rows: &[EnrichmentRow],
) -> Result<EnrichmentSummary> {
    let bytes = enrichment_parquet_bytes(rows)?;
    let table: StoredArtifact = artifacts
        .store_bytes("enrichment", &year.to_string(), "parquet", &bytes)
        .await
        .context("storing enrichment parquet")?;

    let manifest = EnrichmentManifest {
        schema_version: 1,
        year,
        fraction,
        seed,
        population,
        sampled: rows.len(),
        resolved: rows.iter().filter(|r| r.zip_code.is_some()).count(),
        path: table.relative_path.display().to_string(),
        sha256: table.content_hash.clone(),
        bytes: table.byte_size as u64,
        created_at: Utc::now(),
    };
    let manifest_bytes =
        serde_json::to_vec_pretty(&manifest).context("serializing enrichment manifest")?;
    let stored_manifest = artifacts
        .store_bytes("enrichment", &format!("{year}-manifest"), "json", &manifest_bytes)
        .await
        .context("storing enrichment manifest")?;

    Ok(EnrichmentSummary {
        manifest,
        artifact_path: table.absolute_path,
        manifest_path: stored_manifest.absolute_path,
    })
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<SyncRunSummary> {
    let store = CitationStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening citation store {}", config.database_url))?;
    let app_token = match read_credential(&config.socrata_token_file) {
        Ok(token) => token,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "no citation source app token; requests will be throttled");
            String::new()
        }
    };
    let http = HttpFetcher::new(config.http_client_config())?;
    let source = SocrataCitationSource::new(http, &config.socrata_base_url, app_token);
    let summary = SyncDriver::new(&store, &source)
        .with_limit(config.fetch_limit)
        .run(Local::now().naive_local())
        .await?;
    Ok(summary)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    run_sync_once(&SyncConfig::from_env()).await
}

pub async fn run_enrichment(config: &SyncConfig, year: i32, fraction: f64) -> Result<EnrichmentSummary> {
    let store = CitationStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening citation store {}", config.database_url))?;
    let rows = store.records_for_year(year).await?;
    let user_id = read_credential(&config.usps_userid_file)?;
    let http = HttpFetcher::new(config.http_client_config())?;
    let lookup = UspsZipLookup::new(http, &config.usps_base_url, user_id);

    let enriched = EnrichmentSampler::new(&lookup, config.sample_seed)
        .sample(&rows, fraction)
        .await?;
    let artifacts = ArtifactStore::new(&config.artifacts_dir);
    let summary = store_enrichment(
        &artifacts,
        year,
        fraction,
        config.sample_seed,
        rows.len(),
        &enriched,
    )
    .await?;
    info!(
        year,
        sampled = summary.manifest.sampled,
        resolved = summary.manifest.resolved,
        path = %summary.artifact_path.display(),
        "enrichment artifact written"
    );
    Ok(summary)
}

/// One year of stored citations as a Parquet artifact under `exports/`,
/// optionally only the rows carrying a geometry.
pub async fn export_year(config: &SyncConfig, year: i32, geometry_only: bool) -> Result<StoredArtifact> {
    let store = CitationStore::connect(&config.database_url)
        .await
        .with_context(|| format!("opening citation store {}", config.database_url))?;
    let mut rows = store.records_for_year(year).await?;
    if geometry_only {
        rows.retain(|r| r.geom.is_some());
    }
    let bytes = citations_parquet_bytes(&rows)?;
    let label = if geometry_only {
        format!("{year}-geom")
    } else {
        year.to_string()
    };
    let stored = ArtifactStore::new(&config.artifacts_dir)
        .store_bytes("exports", &label, "parquet", &bytes)
        .await
        .context("storing year export")?;
    info!(year, geometry_only, rows = rows.len(), path = %stored.absolute_path.display(), "year export written");
    Ok(stored)
}

/// Cron-driven sync, `None` unless the scheduler is enabled. Ticks that fire
/// while a run is still in progress are skipped.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.sync_cron.clone();
    let config = Arc::new(config.clone());
    let running = Arc::new(Mutex::new(()));
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let config = Arc::clone(&config);
        let running = Arc::clone(&running);
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous sync still running; skipping scheduled tick");
                return;
            };
            match run_sync_once(&config).await {
                Ok(summary) => info!(run_id = %summary.run_id, appended = summary.rows_appended, "scheduled sync finished"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use citesync_adapters::{normalize_address, AddressBatch, WindowBatch};
    use citesync_core::{parse_timestamp, RawRecord};
    use citesync_storage::FetchError;
    use serde_json::json;
    use tempfile::tempdir;

    fn ts(raw: &str) -> NaiveDateTime {
        parse_timestamp(raw).expect("timestamp")
    }

    fn stored(number: &str, issued: &str) -> CitationRecord {
        CitationRecord {
            citation_number: Some(number.to_string()),
            citation_location: Some("530 HAYES ST".into()),
            fine_amount: Some(96.0),
            ..CitationRecord::issued_at(ts(issued))
        }
    }

    fn remote(number: &str, issued: &str) -> RawRecord {
        let row = json!({
            "citation_number": number,
            "citation_issued_datetime": issued,
            "violation": "TRC7.2.22",
            "violation_desc": "STR CLEAN",
            "citation_location": "530 HAYES ST",
            "fine_amount": "96",
            "the_geom": {"type": "Point", "coordinates": [-122.42, 37.77]},
        });
        match row {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    /// In-memory citation source that serves `[start, end)` slices of a
    /// fixed row set and records every window it was asked for.
    #[derive(Default)]
    struct FakeFeed {
        rows: StdMutex<Vec<RawRecord>>,
        calls: StdMutex<Vec<FetchWindow>>,
        fail_on_call: Option<usize>,
    }

    impl FakeFeed {
        fn with_rows(rows: Vec<RawRecord>) -> Self {
            Self {
                rows: StdMutex::new(rows),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<FetchWindow> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl CitationFeed for FakeFeed {
        async fn fetch_window(
            &self,
            window: FetchWindow,
            limit: usize,
        ) -> Result<WindowBatch, SourceError> {
            let call = {
                let mut calls = self.calls.lock().expect("calls");
                calls.push(window);
                calls.len()
            };
            if self.fail_on_call == Some(call) {
                return Err(SourceError::Upstream {
                    status: 503,
                    url: "http://fake/resource".into(),
                });
            }
            let mut records = self
                .rows
                .lock()
                .expect("rows")
                .iter()
                .filter(|row| {
                    row.get("citation_issued_datetime")
                        .and_then(|v| v.as_str())
                        .and_then(parse_timestamp)
                        .map_or(true, |issued| window.contains(issued))
                })
                .cloned()
                .collect::<Vec<_>>();
            records.truncate(limit);
            Ok(WindowBatch {
                window,
                limit,
                returned: records.len(),
                records,
            })
        }
    }

    async fn seeded_store() -> CitationStore {
        let store = CitationStore::in_memory().await.expect("store");
        store
            .append(&[
                stored("A-1", "2022-12-30T10:00:00"),
                stored("A-2", "2022-12-31T23:00:00"),
            ])
            .await
            .expect("seed");
        store
    }

    #[test]
    fn cursor_walks_two_windows_to_now() {
        let mut cursor = SyncCursor::new(ts("2022-12-31T23:00:00"), ts("2023-01-02T00:00:00"));
        let mut windows = Vec::new();
        while let Some(window) = cursor.next_window() {
            windows.push(window);
            cursor.advance(&window);
        }

        assert!(cursor.is_done());
        assert_eq!(
            windows,
            vec![
                FetchWindow::new(ts("2022-12-31T23:00:00"), ts("2023-01-01T23:00:00")).expect("w1"),
                FetchWindow::new(ts("2023-01-01T23:00:00"), ts("2023-01-02T00:00:00")).expect("w2"),
            ]
        );
    }

    #[test]
    fn cursor_shrinks_to_one_minute_then_refuses() {
        let mut cursor = SyncCursor::new(ts("2023-01-01T00:00:00"), ts("2023-01-05T00:00:00"));
        let mut shrinks = 0;
        while cursor.shrink() {
            shrinks += 1;
        }
        assert_eq!(cursor.step(), SyncCursor::min_step());
        assert!(shrinks > 5);

        let window = cursor.next_window().expect("window");
        assert_eq!(window.end - window.start, TimeDelta::minutes(1));
        cursor.advance(&window);
        assert_eq!(cursor.step(), SyncCursor::day_step());
    }

    #[test]
    fn cursor_at_now_is_terminal() {
        let cursor = SyncCursor::new(ts("2023-01-02T00:00:00"), ts("2023-01-02T00:00:00"));
        assert!(cursor.is_done());
        assert_eq!(cursor.next_window(), None);
    }

    #[tokio::test]
    async fn watermark_is_max_issued_and_idempotent() {
        let store = seeded_store().await;
        let first = resolve_watermark(&store).await.expect("watermark");
        let second = resolve_watermark(&store).await.expect("watermark");
        assert_eq!(first, ts("2022-12-31T23:00:00"));
        assert_eq!(first, second);
        assert_eq!(store.count().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn empty_store_refuses_to_sync() {
        let store = CitationStore::in_memory().await.expect("store");
        assert!(matches!(resolve_watermark(&store).await, Err(SyncError::EmptyStore)));

        let feed = FakeFeed::default();
        let err = SyncDriver::new(&store, &feed)
            .run(ts("2023-01-02T00:00:00"))
            .await
            .expect_err("empty store");
        assert!(matches!(err, SyncError::EmptyStore));
        assert!(feed.calls().is_empty());
    }

    #[tokio::test]
    async fn run_appends_new_rows_with_reconciled_columns() {
        let store = seeded_store().await;
        let feed = FakeFeed::with_rows(vec![
            remote("A-2", "2022-12-31T23:00:00"),
            remote("B-1", "2023-01-01T08:15:00"),
            remote("B-2", "2023-01-01T23:00:00"),
        ]);

        let summary = SyncDriver::new(&store, &feed)
            .run(ts("2023-01-02T00:00:00"))
            .await
            .expect("sync");

        assert_eq!(feed.calls().len(), 2);
        assert_eq!(summary.windows_fetched, 2);
        assert_eq!(summary.rows_appended, 2);
        assert_eq!(summary.rows_already_stored, 1);
        assert_eq!(summary.synced_until, ts("2023-01-02T00:00:00"));
        assert_eq!(store.count().await.expect("count"), 4);

        let rows = store.records_for_year(2023).await.expect("2023");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].violation_description.as_deref(), Some("STR CLEAN"));
        assert_eq!(rows[0].fine_amount, Some(96.0));
        assert!(rows[0].geom.as_deref().expect("geom").contains("Point"));
    }

    #[tokio::test]
    async fn second_run_without_new_data_leaves_count_unchanged() {
        let store = seeded_store().await;
        let feed = FakeFeed::with_rows(vec![
            remote("A-2", "2022-12-31T23:00:00"),
            remote("B-1", "2023-01-01T08:15:00"),
        ]);
        let driver = SyncDriver::new(&store, &feed);

        driver.run(ts("2023-01-02T00:00:00")).await.expect("first run");
        let after_first = store.count().await.expect("count");
        let second = driver.run(ts("2023-01-02T00:30:00")).await.expect("second run");

        assert_eq!(after_first, 3);
        assert_eq!(second.rows_appended, 0);
        assert_eq!(store.count().await.expect("count"), after_first);
    }

    #[tokio::test]
    async fn upstream_failure_keeps_earlier_windows() {
        let store = seeded_store().await;
        let rows = vec![
            remote("B-1", "2023-01-01T08:15:00"),
            remote("C-1", "2023-01-02T09:00:00"),
        ];
        let failing = FakeFeed {
            fail_on_call: Some(2),
            ..FakeFeed::with_rows(rows.clone())
        };

        let err = SyncDriver::new(&store, &failing)
            .run(ts("2023-01-03T00:00:00"))
            .await
            .expect_err("upstream failure");
        assert!(matches!(err, SyncError::Upstream(SourceError::Upstream { status: 503, .. })));
        assert_eq!(store.count().await.expect("count"), 3);
        assert_eq!(
            resolve_watermark(&store).await.expect("watermark"),
            ts("2023-01-01T08:15:00")
        );

        let healthy = FakeFeed::with_rows(rows);
        SyncDriver::new(&store, &healthy)
            .run(ts("2023-01-03T00:00:00"))
            .await
            .expect("resume");
        assert_eq!(store.count().await.expect("count"), 4);
    }

    #[tokio::test]
    async fn truncated_window_is_refetched_with_a_smaller_step() {
        let store = seeded_store().await;
        let feed = FakeFeed::with_rows(vec![
            remote("B-1", "2023-01-01T01:00:00"),
            remote("B-2", "2023-01-01T05:00:00"),
            remote("B-3", "2023-01-01T20:00:00"),
        ]);

        let summary = SyncDriver::new(&store, &feed)
            .with_limit(3)
            .run(ts("2023-01-02T00:00:00"))
            .await
            .expect("sync");

        assert!(summary.windows_shrunk >= 1);
        assert_eq!(summary.truncated_windows, 0);
        assert_eq!(summary.rows_appended, 3);
        assert_eq!(store.count().await.expect("count"), 5);
        let calls = feed.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].end - calls[0].start, TimeDelta::days(1));
        assert_eq!(calls[1].start, calls[0].start);
        assert_eq!(calls[1].end - calls[1].start, TimeDelta::hours(12));
    }

    #[tokio::test]
    async fn invalid_rows_are_counted_not_appended() {
        let store = seeded_store().await;
        let mut negative = remote("B-2", "2023-01-01T09:00:00");
        negative.insert("fine_amount".into(), json!(-5));
        let mut undated = remote("B-3", "2023-01-01T09:30:00");
        undated.remove("citation_issued_datetime");
        let feed = FakeFeed::with_rows(vec![remote("B-1", "2023-01-01T08:15:00"), negative, undated]);

        let summary = SyncDriver::new(&store, &feed)
            .run(ts("2023-01-01T12:00:00"))
            .await
            .expect("sync");

        assert_eq!(summary.rows_rejected, 2);
        assert_eq!(summary.rows_appended, 1);
        assert_eq!(store.count().await.expect("count"), 3);
    }

    #[test]
    fn sample_size_rounds_and_is_seeded() {
        let picked = sample_indices(5, 0.5, 0).expect("sample");
        assert_eq!(picked.len(), 2);
        assert_eq!(sample_indices(7, 0.5, 0).expect("ties up").len(), 4);
        assert!(sample_indices(1, 0.5, 0).expect("ties down").is_empty());
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(picked, sample_indices(5, 0.5, 0).expect("again"));

        assert_eq!(sample_indices(10, 1.0, 7).expect("all"), (0..10).collect::<Vec<_>>());
        assert!(sample_indices(10, 0.0, 7).expect("none").is_empty());
        assert!(sample_indices(0, 0.3, 7).expect("empty").is_empty());
        assert!(matches!(
            sample_indices(10, 1.5, 0),
            Err(EnrichError::InvalidFraction(_))
        ));
        assert!(sample_indices(10, f64::NAN, 0).is_err());
    }

    struct FakeLookup {
        zips: HashMap<String, String>,
        batch_sizes: StdMutex<Vec<usize>>,
        fail_on_batch: Option<usize>,
    }

    #[async_trait]
    impl ZipLookup for FakeLookup {
        async fn lookup_batch(
            &self,
            batch: &AddressBatch,
        ) -> Result<[Option<String>; BATCH_SLOTS], LookupError> {
            let batch_no = {
                let mut sizes = self.batch_sizes.lock().expect("sizes");
                sizes.push(batch.len());
                sizes.len()
            };
            if self.fail_on_batch == Some(batch_no) {
                return Err(LookupError::Transport(FetchError::HttpStatus {
                    status: 503,
                    url: "http://fake/ShippingAPI.dll".into(),
                }));
            }
            let mut out: [Option<String>; BATCH_SLOTS] = Default::default();
            for (slot, address) in out.iter_mut().zip(batch.slots()) {
                *slot = address
                    .as_deref()
                    .and_then(|a| self.zips.get(&normalize_address(a)).cloned());
            }
            Ok(out)
        }
    }

    #[tokio::test]
    async fn sampler_resolves_in_chunks_of_five_in_row_order() {
        let rows = (0..12)
            .map(|i| CitationRecord {
                citation_number: Some(format!("S-{i}")),
                citation_location: Some(if i % 2 == 0 { "530 HAYES ST" } else { "1 NOWHERE" }.into()),
                ..CitationRecord::issued_at(ts("2022-03-01T10:00:00"))
            })
            .collect::<Vec<_>>();
        let lookup = FakeLookup {
            zips: HashMap::from([("530 HAYES ST".to_string(), "94102".to_string())]),
            batch_sizes: StdMutex::new(Vec::new()),
            fail_on_batch: None,
        };

        let enriched = EnrichmentSampler::new(&lookup, 0)
            .sample(&rows, 1.0)
            .await
            .expect("sample");

        assert_eq!(*lookup.batch_sizes.lock().expect("sizes"), vec![5, 5, 2]);
        assert_eq!(enriched.len(), 12);
        assert_eq!(enriched[0].record.citation_number.as_deref(), Some("S-0"));
        assert_eq!(enriched[0].zip_code.as_deref(), Some("94102"));
        assert_eq!(enriched[1].zip_code, None);
        assert_eq!(enriched[11].record.citation_number.as_deref(), Some("S-11"));
    }

    #[tokio::test]
    async fn lookup_failure_mid_sample_reaches_the_caller() {
        let rows = (0..12)
            .map(|i| CitationRecord {
                citation_location: Some(format!("{i} HAYES ST")),
                ..CitationRecord::issued_at(ts("2022-03-01T10:00:00"))
            })
            .collect::<Vec<_>>();
        let lookup = FakeLookup {
            zips: HashMap::new(),
            batch_sizes: StdMutex::new(Vec::new()),
            fail_on_batch: Some(2),
        };

        let err = EnrichmentSampler::new(&lookup, 0)
            .sample(&rows, 1.0)
            .await
            .expect_err("lookup failure");

        assert!(matches!(
            err,
            EnrichError::Lookup(LookupError::Transport(FetchError::HttpStatus { status: 503, .. }))
        ));
        assert_eq!(*lookup.batch_sizes.lock().expect("sizes"), vec![5, 5]);
    }

    #[tokio::test]
    async fn enrichment_artifact_is_parquet_with_manifest() {
        let dir = tempdir().expect("tempdir");
        let artifacts = ArtifactStore::new(dir.path());
        let rows = vec![
            EnrichmentRow {
                record: stored("A-1", "2022-05-01T10:00:00"),
                zip_code: Some("94102".into()),
            },
            EnrichmentRow {
                record: stored("A-2", "2022-05-02T10:00:00"),
                zip_code: None,
            },
        ];

        let bytes = enrichment_parquet_bytes(&rows).expect("parquet");
        assert!(bytes.starts_with(b"PAR1"));
        assert!(bytes.ends_with(b"PAR1"));

        let summary = store_enrichment(&artifacts, 2022, 0.1, 0, 20, &rows)
            .await
            .expect("store");
        assert!(summary.artifact_path.exists());
        assert_eq!(summary.manifest.sampled, 2);
        assert_eq!(summary.manifest.resolved, 1);
        assert_eq!(summary.manifest.sha256, ArtifactStore::sha256_hex(&bytes));

        let manifest: serde_json::Value = serde_json::from_slice(
            &std::fs::read(&summary.manifest_path).expect("read manifest"),
        )
        .expect("manifest json");
        assert_eq!(manifest["year"], 2022);
        assert_eq!(manifest["population"], 20);
    }

    #[tokio::test]
    async fn year_export_filters_to_geometry_rows() {
        let dir = tempdir().expect("tempdir");
        let mut config = SyncConfig::from_env();
        config.database_url = format!("sqlite://{}", dir.path().join("citations.db").display());
        config.artifacts_dir = dir.path().join("artifacts");

        let store = CitationStore::connect(&config.database_url).await.expect("store");
        let with_geom = CitationRecord {
            geom: Some("POINT (-122.42 37.77)".into()),
            ..stored("G-1", "2019-04-01T10:00:00")
        };
        store
            .append(&[with_geom.clone(), stored("G-2", "2019-05-01T10:00:00"), stored("G-3", "2020-01-01T10:00:00")])
            .await
            .expect("append");

        let all = export_year(&config, 2019, false).await.expect("export");
        let geom_only = export_year(&config, 2019, true).await.expect("geom export");

        assert_ne!(all.content_hash, geom_only.content_hash);
        assert!(geom_only.relative_path.to_string_lossy().contains("2019-geom"));
        let bytes = std::fs::read(&geom_only.absolute_path).expect("read export");
        assert_eq!(bytes, citations_parquet_bytes(&[with_geom]).expect("parquet"));
    }

    #[test]
    fn credential_is_first_trimmed_line() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("token.txt");
        std::fs::write(&path, "abc123\r\nsecond line\n").expect("write");
        assert_eq!(read_credential(&path).expect("credential"), "abc123");

        std::fs::write(&path, "\n").expect("write");
        assert!(read_credential(&path).is_err());
        assert!(read_credential(&dir.path().join("missing.txt")).is_err());
    }

    #[tokio::test]
    async fn scheduler_is_built_only_when_enabled() {
        let mut config = SyncConfig::from_env();
        config.scheduler_enabled = false;
        assert!(maybe_build_scheduler(&config).await.expect("disabled").is_none());

        config.scheduler_enabled = true;
        config.sync_cron = "0 0 6 * * *".into();
        assert!(maybe_build_scheduler(&config).await.expect("enabled").is_some());
    }
}
