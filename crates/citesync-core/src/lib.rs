//! Core domain model for citation sync: records, fetch windows and the
//! remote-to-storage column mapping.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "citesync-core";

/// Table holding every synchronized citation.
pub const CITATIONS_TABLE: &str = "parking_citations";

/// One row as returned by the citation source API, before reconciliation.
pub type RawRecord = Map<String, JsonValue>;

/// Columns of the `parking_citations` table, in storage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Column {
    CitationNumber,
    CitationIssuedDateTime,
    Violation,
    ViolationDescription,
    CitationLocation,
    VehiclePlateState,
    VehiclePlate,
    FineAmount,
    DateAdded,
    Geom,
}

impl Column {
    pub const ALL: [Column; 10] = [
        Column::CitationNumber,
        Column::CitationIssuedDateTime,
        Column::Violation,
        Column::ViolationDescription,
        Column::CitationLocation,
        Column::VehiclePlateState,
        Column::VehiclePlate,
        Column::FineAmount,
        Column::DateAdded,
        Column::Geom,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Column::CitationNumber => "Citation_Number",
            Column::CitationIssuedDateTime => "Citation_Issued_DateTime",
            Column::Violation => "Violation",
            Column::ViolationDescription => "Violation_Description",
            Column::CitationLocation => "Citation_Location",
            Column::VehiclePlateState => "Vehicle_Plate_State",
            Column::VehiclePlate => "Vehicle_Plate",
            Column::FineAmount => "Fine_Amount",
            Column::DateAdded => "Date_Added",
            Column::Geom => "geom",
        }
    }

    pub fn sql_type(self) -> &'static str {
        match self {
            Column::CitationIssuedDateTime | Column::DateAdded => "DATETIME",
            Column::FineAmount => "REAL",
            _ => "TEXT",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Canonical persisted citation. Only the issued timestamp is guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRecord {
    pub citation_number: Option<String>,
    pub citation_issued_datetime: NaiveDateTime,
    pub violation: Option<String>,
    pub violation_description: Option<String>,
    pub citation_location: Option<String>,
    pub vehicle_plate_state: Option<String>,
    pub vehicle_plate: Option<String>,
    pub fine_amount: Option<f64>,
    pub date_added: Option<String>,
    pub geom: Option<String>,
}

impl CitationRecord {
    pub fn issued_at(issued: NaiveDateTime) -> Self {
        Self {
            citation_number: None,
            citation_issued_datetime: issued,
            violation: None,
            violation_description: None,
            citation_location: None,
            vehicle_plate_state: None,
            vehicle_plate: None,
            fine_amount: None,
            date_added: None,
            geom: None,
        }
    }

    fn text_slot(&mut self, column: Column) -> Option<&mut Option<String>> {
        match column {
            Column::CitationNumber => Some(&mut self.citation_number),
            Column::Violation => Some(&mut self.violation),
            Column::ViolationDescription => Some(&mut self.violation_description),
            Column::CitationLocation => Some(&mut self.citation_location),
            Column::VehiclePlateState => Some(&mut self.vehicle_plate_state),
            Column::VehiclePlate => Some(&mut self.vehicle_plate),
            Column::DateAdded => Some(&mut self.date_added),
            Column::Geom => Some(&mut self.geom),
            Column::CitationIssuedDateTime | Column::FineAmount => None,
        }
    }
}

/// A sampled citation with its best-effort postal code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRow {
    pub record: CitationRecord,
    pub zip_code: Option<String>,
}

/// Half-open time range `[start, end)` scoping one remote query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl FetchWindow {
    /// Returns `None` for empty or inverted ranges.
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    /// A record issued exactly at `end` belongs to the following window.
    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        self.start <= ts && ts < self.end
    }
}

impl fmt::Display for FetchWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            format_timestamp(self.start),
            format_timestamp(self.end)
        )
    }
}

/// Renders timestamps the way the store keeps them (`2022-12-31T23:00:00`,
/// with a fractional part only when non-zero).
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

/// Lenient ISO-8601 parsing covering the source API's floating timestamps,
/// space-separated SQL timestamps, RFC 3339 and bare dates.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, pattern) {
            return Some(ts);
        }
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.naive_local());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Why a remote row was not appended.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowRejection {
    #[error("missing citation issued timestamp")]
    MissingIssued,
    #[error("unparseable citation issued timestamp {0:?}")]
    BadIssued(String),
    #[error("unparseable fine amount {0:?}")]
    BadFine(String),
    #[error("negative fine amount {0}")]
    NegativeFine(f64),
}

/// Source-field to storage-column mapping applied before every append.
///
/// Lookups are case-insensitive, so the storage names themselves
/// (`Citation_Number`, ...) always resolve to their own column.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    entries: Vec<(String, Column)>,
}

const DEFAULT_ALIASES: &[(&str, Column)] = &[
    ("violation_desc", Column::ViolationDescription),
    ("the_geom", Column::Geom),
];

impl Default for ColumnMap {
    fn default() -> Self {
        let mut map = Self {
            entries: Vec::new(),
        };
        for column in Column::ALL {
            map.insert(column.name(), column);
        }
        for (field, column) in DEFAULT_ALIASES {
            map.insert(field, *column);
        }
        map
    }
}

impl ColumnMap {
    pub fn insert(&mut self, source_field: &str, column: Column) {
        let key = source_field.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = column,
            None => self.entries.push((key, column)),
        }
    }

    pub fn resolve(&self, source_field: &str) -> Option<Column> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(source_field))
            .map(|(_, column)| *column)
    }

    /// Reconcile one remote row into a storage record. Unknown fields are
    /// dropped; the first non-null value wins when two fields share a column.
    pub fn reconcile(&self, raw: &RawRecord) -> Result<CitationRecord, RowRejection> {
        let mut issued_raw: Option<String> = None;
        let mut fine_raw: Option<&JsonValue> = None;
        let mut record = CitationRecord::issued_at(NaiveDateTime::MIN);

        for (field, value) in raw {
            let Some(column) = self.resolve(field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            match column {
                Column::CitationIssuedDateTime => {
                    issued_raw.get_or_insert_with(|| text_value(value));
                }
                Column::FineAmount => {
                    fine_raw.get_or_insert(value);
                }
                other => {
                    if let Some(slot) = record.text_slot(other) {
                        if slot.is_none() {
                            *slot = Some(text_value(value));
                        }
                    }
                }
            }
        }

        let issued_raw = issued_raw.ok_or(RowRejection::MissingIssued)?;
        record.citation_issued_datetime =
            parse_timestamp(&issued_raw).ok_or(RowRejection::BadIssued(issued_raw))?;
        record.fine_amount = fine_raw.map(parse_fine).transpose()?;
        record.date_added = record
            .date_added
            .map(|raw| parse_timestamp(&raw).map(format_timestamp).unwrap_or(raw));
        Ok(record)
    }
}

/// Strings pass through; structured values (e.g. GeoJSON points) are
/// serialized to their JSON text.
fn text_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_fine(value: &JsonValue) -> Result<f64, RowRejection> {
    let amount = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
    .ok_or_else(|| RowRejection::BadFine(text_value(value)))?;
    if amount < 0.0 {
        return Err(RowRejection::NegativeFine(amount));
    }
    Ok(amount)
}
