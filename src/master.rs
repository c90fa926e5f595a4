use calamine::{Data, Reader, Xlsx};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// One row of the master workbook: a (store, product) target for the current
/// reporting period. `store_code` + `product_code` form the natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRow {
    pub store_code: String,
    pub store_name: String,
    pub area_manager: String,
    pub area_supervisor: String,
    pub product_code: String,
    pub description: String,
    pub quantity: f64,
    pub amount: f64,
    /// Free-text explanation entered by a field user; empty until someone
    /// annotates the row.
    pub annotation: String,
}

/// Metadata about the currently active master, kept at `config/master.json`
/// so every session (and every restart) agrees on which workbook and which
/// version tag is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterMeta {
    /// Blob key of the active master workbook.
    pub key: String,
    /// Version tag (seri), e.g. "2026-01".
    pub version: String,
    /// RFC 3339 upload timestamp.
    pub uploaded_at: String,
}

/// Parse locale-formatted accounting text into a number.
///
/// The master stores quantities and amounts as display text: thousands
/// separators, and parentheses for negatives ("(262,200)" is -262200).
/// Unparseable values default to zero rather than failing the whole load.
pub fn clean_numeric(raw: &str) -> f64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let negative = trimmed.starts_with('(') && trimmed.ends_with(')');
    let inner = if negative {
        &trimmed[1..trimmed.len() - 1]
    } else {
        trimmed
    };

    let value = inner.replace(',', "").trim().parse::<f64>().unwrap_or(0.0);
    if negative { -value } else { value }
}

/// Header names are matched case-insensitively after whitespace trimming.
pub fn normalize_header(raw: &str) -> String {
    raw.trim().to_uppercase()
}

// Candidate header names per canonical column. The column set varies between
// master revisions (Indonesian and English headers both occur), so each
// canonical column accepts several spellings.
const STORE_CODE_HEADERS: &[&str] = &["KODE TOKO", "KODE_TOKO", "KDTOKO", "STORE CODE", "TOKO"];
const STORE_NAME_HEADERS: &[&str] = &["NAMA TOKO", "NAMA_TOKO", "STORE NAME", "NAMA"];
const AREA_MANAGER_HEADERS: &[&str] = &["AM", "AREA MANAGER"];
const AREA_SUPERVISOR_HEADERS: &[&str] = &["AS", "AREA SUPERVISOR"];
const PRODUCT_CODE_HEADERS: &[&str] = &["PRDCD", "PLU", "KODE PRODUK", "PRODUCT CODE"];
const DESCRIPTION_HEADERS: &[&str] = &["DESKRIPSI", "DESCRIPTION", "NAMA BARANG"];
const QUANTITY_HEADERS: &[&str] = &["QTY", "QUANTITY", "JUMLAH"];
const AMOUNT_HEADERS: &[&str] = &["RUPIAH", "AMOUNT", "NILAI", "TOTAL"];
pub(crate) const ANNOTATION_HEADERS: &[&str] =
    &["KETERANGAN", "ALASAN", "CATATAN", "ANNOTATION", "REMARK"];

/// Column positions resolved from a workbook's header row.
#[derive(Debug, Default)]
pub struct HeaderMap {
    pub store_code: Option<usize>,
    pub store_name: Option<usize>,
    pub area_manager: Option<usize>,
    pub area_supervisor: Option<usize>,
    pub product_code: Option<usize>,
    pub description: Option<usize>,
    pub quantity: Option<usize>,
    pub amount: Option<usize>,
    pub annotation: Option<usize>,
}

impl HeaderMap {
    /// Resolve canonical columns against a raw header row.
    pub fn resolve(headers: &[Data]) -> HeaderMap {
        let mut map = HeaderMap::default();
        for (idx, cell) in headers.iter().enumerate() {
            let name = normalize_header(&cell_text(cell));
            if name.is_empty() {
                continue;
            }
            let slot = if STORE_CODE_HEADERS.contains(&name.as_str()) {
                &mut map.store_code
            } else if STORE_NAME_HEADERS.contains(&name.as_str()) {
                &mut map.store_name
            } else if AREA_MANAGER_HEADERS.contains(&name.as_str()) {
                &mut map.area_manager
            } else if AREA_SUPERVISOR_HEADERS.contains(&name.as_str()) {
                &mut map.area_supervisor
            } else if PRODUCT_CODE_HEADERS.contains(&name.as_str()) {
                &mut map.product_code
            } else if DESCRIPTION_HEADERS.contains(&name.as_str()) {
                &mut map.description
            } else if QUANTITY_HEADERS.contains(&name.as_str()) {
                &mut map.quantity
            } else if AMOUNT_HEADERS.contains(&name.as_str()) {
                &mut map.amount
            } else if ANNOTATION_HEADERS.contains(&name.as_str()) {
                &mut map.annotation
            } else {
                continue;
            };
            // First match wins when a header repeats.
            if slot.is_none() {
                *slot = Some(idx);
            }
        }
        map
    }
}

/// Render a cell as text. Product and store codes arrive as numbers in some
/// revisions; integral floats are printed without the trailing ".0" so the
/// join key stays stable across type drift.
pub fn cell_text(cell: &Data) -> String {
    match cell {
        Data::String(s) => s.clone(),
        Data::Float(f) => {
            if f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", *f as i64)
            } else {
                f.to_string()
            }
        }
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        _ => String::new(),
    }
}

fn field(row: &[Data], idx: Option<usize>) -> String {
    idx.and_then(|i| row.get(i))
        .map(|c| cell_text(c).trim().to_string())
        .unwrap_or_default()
}

/// Parse a master workbook (first sheet, header on the first row) into rows.
///
/// Rows with a blank store or product code are skipped. A missing annotation
/// column simply yields empty annotations.
pub fn parse_master(bytes: &[u8]) -> Result<Vec<MasterRow>, String> {
    let mut workbook = Xlsx::new(Cursor::new(bytes))
        .map_err(|e| format!("failed to open master workbook: {}", e))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| "master workbook has no sheets".to_string())?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| format!("failed to read sheet '{}': {}", sheet_name, e))?;

    let mut rows_iter = range.rows();
    let headers = rows_iter
        .next()
        .ok_or_else(|| "master workbook is empty".to_string())?;
    let map = HeaderMap::resolve(headers);

    if map.store_code.is_none() || map.product_code.is_none() {
        return Err("master workbook is missing a store or product column".to_string());
    }

    let mut rows = Vec::new();
    for raw in rows_iter {
        let store_code = field(raw, map.store_code);
        let product_code = field(raw, map.product_code);
        if store_code.is_empty() || product_code.is_empty() {
            continue;
        }
        rows.push(MasterRow {
            store_code,
            store_name: field(raw, map.store_name),
            area_manager: field(raw, map.area_manager),
            area_supervisor: field(raw, map.area_supervisor),
            product_code,
            description: field(raw, map.description),
            quantity: clean_numeric(&field(raw, map.quantity)),
            amount: clean_numeric(&field(raw, map.amount)),
            annotation: field(raw, map.annotation),
        });
    }

    Ok(rows)
}

lazy_static! {
    static ref YEAR_MONTH: Regex = Regex::new(r"(20\d{2})-(0[1-9]|1[0-2])").unwrap();
    static ref MONTH_YEAR: Regex = Regex::new(r"(0[1-9]|1[0-2])-(20\d{2})").unwrap();
}

/// Derive the version tag (seri) for an uploaded master.
///
/// A month embedded in the filename wins ("Laporan 2026-01.xlsx" or
/// "Laporan 01-2026.xlsx" both tag as "2026-01"); otherwise the upload month
/// is used. Result filenames embed this tag, so it has to be filename-safe.
pub fn derive_version(filename: &str, uploaded_at: DateTime<Utc>) -> String {
    if let Some(caps) = YEAR_MONTH.captures(filename) {
        return format!("{}-{}", &caps[1], &caps[2]);
    }
    if let Some(caps) = MONTH_YEAR.captures(filename) {
        return format!("{}-{}", &caps[2], &caps[1]);
    }
    uploaded_at.format("%Y-%m").to_string()
}

/// Unique stores of a master, keeping the first row seen per store code.
/// Codes are compared canonicalized, the same way result keys are built, so
/// "t001" and "T001 " count as one store owing one result file.
pub fn unique_stores(rows: &[MasterRow]) -> Vec<MasterRow> {
    let mut seen = std::collections::HashSet::new();
    rows.iter()
        .filter(|r| seen.insert(crate::blob::keys::canonical_store(&r.store_code)))
        .cloned()
        .collect()
}

/// Master rows belonging to one store.
pub fn rows_for_store(rows: &[MasterRow], store_code: &str) -> Vec<MasterRow> {
    let wanted = crate::blob::keys::canonical_store(store_code);
    rows.iter()
        .filter(|r| crate::blob::keys::canonical_store(&r.store_code) == wanted)
        .cloned()
        .collect()
}
