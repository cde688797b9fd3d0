//! Remote adapters: the citation source window fetcher and the batched
//! zip code lookup.

use async_trait::async_trait;
use citesync_core::{format_timestamp, parse_timestamp, Column, ColumnMap, FetchWindow, RawRecord};
use citesync_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "citesync-adapters";

pub const DEFAULT_SOCRATA_BASE_URL: &str = "https://data.sfgov.org";
pub const CITATIONS_DATASET: &str = "ab4h-6ztd";
/// Comfortably above a day's citation volume.
pub const DEFAULT_FETCH_LIMIT: usize = 100_000;

pub const DEFAULT_USPS_BASE_URL: &str = "https://secure.shippingapis.com";
/// The lookup wire format carries exactly this many address envelopes.
pub const BATCH_SLOTS: usize = 5;
pub const LOOKUP_CITY: &str = "San Francisco";
pub const LOOKUP_STATE: &str = "CA";

const ISSUED_FIELD: &str = "citation_issued_datetime";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("citation source returned http {status} for {url}")]
    Upstream { status: u16, url: String },
    #[error("citation source transport failure: {0}")]
    Transport(FetchError),
    #[error("citation source payload is not a JSON array of objects: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, url } => SourceError::Upstream { status, url },
            other => SourceError::Transport(other),
        }
    }
}

/// Raised (as a value, not an error path) when a window hit the row cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("window {window} returned {limit} rows, the request limit; rows may be missing")]
pub struct TruncatedResult {
    pub window: FetchWindow,
    pub limit: usize,
}

/// Result of one window fetch.
#[derive(Debug, Clone)]
pub struct WindowBatch {
    pub window: FetchWindow,
    pub limit: usize,
    /// Rows the API sent back, before the client-side window check.
    pub returned: usize,
    pub records: Vec<RawRecord>,
}

impl WindowBatch {
    pub fn truncation(&self) -> Option<TruncatedResult> {
        (self.limit > 0 && self.returned >= self.limit).then_some(TruncatedResult {
            window: self.window,
            limit: self.limit,
        })
    }
}

/// Time-range-scoped access to citation records.
#[async_trait]
pub trait CitationFeed: Send + Sync {
    async fn fetch_window(
        &self,
        window: FetchWindow,
        limit: usize,
    ) -> Result<WindowBatch, SourceError>;
}

/// Socrata (SODA) endpoint serving the SFMTA citation dataset.
#[derive(Debug, Clone)]
pub struct SocrataCitationSource {
    http: HttpFetcher,
    base_url: String,
    dataset: String,
    app_token: String,
    columns: ColumnMap,
}

impl SocrataCitationSource {
    pub fn new(http: HttpFetcher, base_url: &str, app_token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            dataset: CITATIONS_DATASET.to_string(),
            app_token: app_token.into(),
            columns: ColumnMap::default(),
        }
    }

    pub fn with_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = dataset.into();
        self
    }

    pub fn with_columns(mut self, columns: ColumnMap) -> Self {
        self.columns = columns;
        self
    }

    pub fn resource_url(&self) -> String {
        format!("{}/resource/{}.json", self.base_url, self.dataset)
    }

    fn issued_of(&self, record: &RawRecord) -> Option<chrono::NaiveDateTime> {
        record
            .iter()
            .filter(|(field, _)| self.columns.resolve(field) == Some(Column::CitationIssuedDateTime))
            .find_map(|(_, value)| value.as_str().and_then(parse_timestamp))
    }
}

/// SoQL filter for `[start, end)`.
pub fn window_filter(window: &FetchWindow) -> String {
    format!(
        "{ISSUED_FIELD} >= '{}' AND {ISSUED_FIELD} < '{}'",
        format_timestamp(window.start),
        format_timestamp(window.end)
    )
}

#[async_trait]
impl CitationFeed for SocrataCitationSource {
    async fn fetch_window(
        &self,
        window: FetchWindow,
        limit: usize,
    ) -> Result<WindowBatch, SourceError> {
        let url = self.resource_url();
        let filter = window_filter(&window);
        let limit_param = limit.to_string();
        let query = [
            ("$where", filter.as_str()),
            ("$order", ISSUED_FIELD),
            ("$limit", limit_param.as_str()),
        ];
        let mut headers = Vec::new();
        if !self.app_token.is_empty() {
            headers.push(("X-App-Token", self.app_token.as_str()));
        }

        let response = self.http.get("socrata", &url, &query, &headers).await?;
        let rows: Vec<JsonValue> = serde_json::from_slice(&response.body)?;
        let returned = rows.len();

        let mut records = Vec::with_capacity(returned);
        let mut dropped = 0usize;
        for row in rows {
            let JsonValue::Object(record) = row else {
                dropped += 1;
                continue;
            };
            // Rows without a readable timestamp are kept; reconciliation rejects them.
            match self.issued_of(&record) {
                Some(issued) if !window.contains(issued) => dropped += 1,
                _ => records.push(record),
            }
        }
        if dropped > 0 {
            debug!(%window, dropped, "dropped rows outside the requested window");
        }
        info!(%window, url = %response.final_url, returned, kept = records.len(), "fetched citation window");

        Ok(WindowBatch {
            window,
            limit,
            returned,
            records,
        })
    }
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("an address batch holds at most 5 addresses, got {0}")]
    BatchOverflow(usize),
    #[error("zip code lookup transport failure: {0}")]
    Transport(#[from] FetchError),
    #[error("invalid response selector: {0}")]
    Selector(String),
}

/// Up to five addresses padded to the fixed five-slot wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressBatch {
    slots: [Option<String>; BATCH_SLOTS],
    len: usize,
}

impl AddressBatch {
    /// Normalize each address and pad with empty slots. Blank strings count
    /// as absent.
    pub fn new(addresses: &[Option<&str>]) -> Result<Self, LookupError> {
        if addresses.len() > BATCH_SLOTS {
            return Err(LookupError::BatchOverflow(addresses.len()));
        }
        let mut slots: [Option<String>; BATCH_SLOTS] = Default::default();
        for (slot, address) in slots.iter_mut().zip(addresses) {
            *slot = address
                .map(normalize_address)
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty());
        }
        Ok(Self {
            slots,
            len: addresses.len(),
        })
    }

    /// Number of caller-supplied entries (before padding).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when no slot carries an address, so no lookup is needed.
    pub fn is_blank(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    pub fn slots(&self) -> &[Option<String>; BATCH_SLOTS] {
        &self.slots
    }

    /// Cut a five-slot result back to the caller's length. Slots that held
    /// no address are always `None`.
    pub fn truncate<T>(&self, results: [Option<T>; BATCH_SLOTS]) -> Vec<Option<T>> {
        results
            .into_iter()
            .zip(&self.slots)
            .take(self.len)
            .map(|(result, slot)| if slot.is_some() { result } else { None })
            .collect()
    }

    pub fn request_xml(&self, user_id: &str) -> String {
        let mut xml = format!("<ZipCodeLookupRequest USERID=\"{}\">", escape_xml(user_id));
        for (idx, slot) in self.slots.iter().enumerate() {
            xml.push_str(&format!(
                "<Address ID=\"{}\"><Address1></Address1><Address2>{}</Address2>\
                 <City>{LOOKUP_CITY}</City><State>{LOOKUP_STATE}</State></Address>",
                idx + 1,
                escape_xml(slot.as_deref().unwrap_or_default()),
            ));
        }
        xml.push_str("</ZipCodeLookupRequest>");
        xml
    }
}

/// Drop a `0` that directly follows whitespace; the lookup provider does not
/// recognize zero-padded ordinals (`23 01ST` -> `23 1ST`).
pub fn normalize_address(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut after_space = false;
    for ch in raw.chars() {
        if !(after_space && ch == '0') {
            out.push(ch);
        }
        after_space = ch.is_whitespace();
    }
    out
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn selector(css: &str) -> Result<Selector, LookupError> {
    Selector::parse(css).map_err(|e| LookupError::Selector(e.to_string()))
}

fn first_text(element: ElementRef<'_>, sel: &Selector) -> Option<String> {
    element
        .select(sel)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Map a `ZipCodeLookupResponse` onto the five request slots. Entries are
/// placed by their `ID` attribute (1-based), falling back to document order.
/// Error entries, missing entries and anything that is not a five-digit zip
/// become `None`.
pub fn parse_zip_response(body: &str) -> Result<[Option<String>; BATCH_SLOTS], LookupError> {
    let document = Html::parse_document(body);
    let address_sel = selector("address")?;
    let zip_sel = selector("zip5")?;
    let error_sel = selector("error")?;
    let description_sel = selector("description")?;

    let mut zips: [Option<String>; BATCH_SLOTS] = Default::default();
    let mut seen = 0usize;
    for (position, address) in document.select(&address_sel).enumerate() {
        seen += 1;
        let slot = address
            .value()
            .attr("id")
            .and_then(|id| id.trim().parse::<usize>().ok())
            .filter(|id| (1..=BATCH_SLOTS).contains(id))
            .map(|id| id - 1)
            .unwrap_or(position);
        if slot >= BATCH_SLOTS || zips[slot].is_some() {
            continue;
        }
        if address.select(&error_sel).next().is_some() {
            continue;
        }
        zips[slot] = first_text(address, &zip_sel)
            .filter(|zip| zip.len() == 5 && zip.chars().all(|c| c.is_ascii_digit()));
    }

    if seen == 0 {
        let root = document.root_element();
        let reason = root
            .select(&error_sel)
            .next()
            .and_then(|err| first_text(err, &description_sel));
        warn!(reason = reason.as_deref().unwrap_or("no address entries"), "zip lookup returned no results");
    }
    Ok(zips)
}

/// Batched address to zip code resolution.
#[async_trait]
pub trait ZipLookup: Send + Sync {
    /// One outbound request covering all five slots of `batch`.
    async fn lookup_batch(
        &self,
        batch: &AddressBatch,
    ) -> Result<[Option<String>; BATCH_SLOTS], LookupError>;
}

/// Resolve up to five addresses; the result has the same length as the
/// input. Batches with no usable address skip the network call.
pub async fn resolve_zip_codes(
    lookup: &dyn ZipLookup,
    addresses: &[Option<&str>],
) -> Result<Vec<Option<String>>, LookupError> {
    let batch = AddressBatch::new(addresses)?;
    if batch.is_blank() {
        return Ok(vec![None; batch.len()]);
    }
    let zips = lookup.lookup_batch(&batch).await?;
    Ok(batch.truncate(zips))
}

/// USPS Web Tools `ZipCodeLookup`.
#[derive(Debug, Clone)]
pub struct UspsZipLookup {
    http: HttpFetcher,
    base_url: String,
    user_id: String,
}

impl UspsZipLookup {
    pub fn new(http: HttpFetcher, base_url: &str, user_id: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_id: user_id.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/ShippingAPI.dll", self.base_url)
    }
}

#[async_trait]
impl ZipLookup for UspsZipLookup {
    async fn lookup_batch(
        &self,
        batch: &AddressBatch,
    ) -> Result<[Option<String>; BATCH_SLOTS], LookupError> {
        let xml = batch.request_xml(&self.user_id);
        let url = self.endpoint();
        let query = [("API", "ZipCodeLookup"), ("XML", xml.as_str())];
        let response = self.http.get("usps", &url, &query, &[]).await?;
        debug!(url = %response.final_url, slots = batch.len(), "zip code lookup answered");
        parse_zip_response(&String::from_utf8_lossy(&response.body))
    }
}
