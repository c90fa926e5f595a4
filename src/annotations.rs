use crate::blob::{BlobStore, Fetch, keys};
use crate::master::{HeaderMap, MasterRow, cell_text};
use calamine::{Reader, Xlsx};
use log::warn;
use std::io::Cursor;

/// The reduced form of a saved result file: one annotation per natural key.
/// Everything else in the file is a stale copy of master attributes and is
/// dropped before reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationRow {
    pub store_code: String,
    pub product_code: String,
    pub annotation: String,
}

/// Reduce working rows to their annotation content.
pub fn to_annotations(rows: &[MasterRow]) -> Vec<AnnotationRow> {
    rows.iter()
        .map(|r| AnnotationRow {
            store_code: r.store_code.clone(),
            product_code: r.product_code.clone(),
            annotation: r.annotation.clone(),
        })
        .collect()
}

/// Parse a saved result workbook into annotation rows.
///
/// Result files carry the master column subset for one store plus the
/// annotation column, so the same header matching applies. A file without an
/// annotation column is treated as holding no annotations at all.
pub fn parse_result(bytes: &[u8]) -> Result<Vec<AnnotationRow>, String> {
    let mut workbook = Xlsx::new(Cursor::new(bytes))
        .map_err(|e| format!("failed to open result workbook: {}", e))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| "result workbook has no sheets".to_string())?;

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| format!("failed to read sheet '{}': {}", sheet_name, e))?;

    let mut rows_iter = range.rows();
    let headers = match rows_iter.next() {
        Some(headers) => headers,
        None => return Ok(Vec::new()),
    };
    let map = HeaderMap::resolve(headers);

    let (store_idx, product_idx) = match (map.store_code, map.product_code) {
        (Some(s), Some(p)) => (s, p),
        _ => return Err("result workbook is missing a store or product column".to_string()),
    };

    let mut rows = Vec::new();
    for raw in rows_iter {
        let store_code = raw
            .get(store_idx)
            .map(|c| cell_text(c).trim().to_string())
            .unwrap_or_default();
        let product_code = raw
            .get(product_idx)
            .map(|c| cell_text(c).trim().to_string())
            .unwrap_or_default();
        if store_code.is_empty() || product_code.is_empty() {
            continue;
        }
        let annotation = map
            .annotation
            .and_then(|i| raw.get(i))
            .map(|c| cell_text(c).trim().to_string())
            .unwrap_or_default();
        rows.push(AnnotationRow {
            store_code,
            product_code,
            annotation,
        });
    }

    Ok(rows)
}

/// Save a store's working rows as the result file for (store, version).
///
/// The upload overwrites by fixed key, so saving twice for the same store and
/// version leaves exactly one file. Returns the key written.
pub async fn save(
    store: &dyn BlobStore,
    namespace: &str,
    store_code: &str,
    version: &str,
    rows: &[MasterRow],
) -> Result<String, String> {
    let bytes = crate::export::to_xlsx(rows).map_err(|e| e.to_string())?;
    let key = keys::result(namespace, store_code, version);
    store.put(&key, &bytes).await?;
    Ok(key)
}

/// Load the previously saved result file for (store, version).
///
/// `Missing` is authoritative absence (first save for this store/version).
/// A file that exists but cannot be parsed is logged and reported as
/// `Missing` too, since there is nothing recoverable in it; only a store
/// outage comes back as `Unavailable`, which callers must not confuse with
/// "no prior data".
pub async fn load(
    store: &dyn BlobStore,
    namespace: &str,
    store_code: &str,
    version: &str,
) -> Fetch<Vec<AnnotationRow>> {
    let key = keys::result(namespace, store_code, version);
    match store.fetch(&key).await {
        Fetch::Found(blob) => match parse_result(&blob.bytes) {
            Ok(rows) => Fetch::Found(rows),
            Err(e) => {
                warn!("discarding unreadable result file {}: {}", key, e);
                Fetch::Missing
            }
        },
        Fetch::Missing => Fetch::Missing,
        Fetch::Unavailable(e) => Fetch::Unavailable(e),
    }
}

/// Keys of every result file currently saved, optionally limited to one
/// version. Feeds the progress aggregation.
pub async fn list_result_keys(
    store: &dyn BlobStore,
    namespace: &str,
    version: Option<&str>,
) -> Result<Vec<String>, String> {
    let entries = store.list(&keys::results_prefix(namespace)).await?;
    let mut result_keys: Vec<String> = entries.into_iter().map(|e| e.key).collect();
    if let Some(version) = version {
        let suffix = format!("_{}.xlsx", version);
        result_keys.retain(|k| k.ends_with(&suffix));
    }
    Ok(result_keys)
}

/// Administrative bulk delete of the results namespace.
///
/// With a version, only that version's files go; without one the whole
/// `hasil/` prefix is wiped. Returns how many files were deleted.
pub async fn purge(
    store: &dyn BlobStore,
    namespace: &str,
    version: Option<&str>,
) -> Result<usize, String> {
    match version {
        None => store.delete_prefix(&keys::results_prefix(namespace)).await,
        Some(version) => {
            let targets = list_result_keys(store, namespace, Some(version)).await?;
            let mut deleted = 0;
            for key in &targets {
                store.delete(key).await?;
                deleted += 1;
            }
            Ok(deleted)
        }
    }
}

/// Concatenate every saved result file for a version into one row set, for
/// the administrator's aggregated download. A file deleted between the
/// listing and the fetch is skipped; an unreachable store is an error.
pub async fn collect_results(
    store: &dyn BlobStore,
    namespace: &str,
    version: &str,
) -> Result<Vec<MasterRow>, String> {
    let mut all_rows = Vec::new();
    for key in list_result_keys(store, namespace, Some(version)).await? {
        match store.fetch(&key).await {
            Fetch::Found(blob) => match crate::master::parse_master(&blob.bytes) {
                Ok(mut rows) => all_rows.append(&mut rows),
                Err(e) => warn!("skipping unreadable result file {}: {}", key, e),
            },
            Fetch::Missing => continue,
            Fetch::Unavailable(e) => {
                return Err(format!("could not read {}: {}", key, e));
            }
        }
    }
    Ok(all_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{Blob, BlobEntry, DirBlobStore, PutError};
    use crate::reconcile::reconcile;

    /// A store whose backend is down: every operation fails.
    struct DownStore;

    #[async_trait::async_trait]
    impl BlobStore for DownStore {
        async fn list(&self, _prefix: &str) -> Result<Vec<BlobEntry>, String> {
            Err("store down".to_string())
        }
        async fn fetch(&self, _key: &str) -> Fetch<Blob> {
            Fetch::Unavailable("store down".to_string())
        }
        async fn put(&self, _key: &str, _bytes: &[u8]) -> Result<(), String> {
            Err("store down".to_string())
        }
        async fn put_if_match(
            &self,
            _key: &str,
            _bytes: &[u8],
            _expected: Option<&str>,
        ) -> Result<(), PutError> {
            Err(PutError::Failed("store down".to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), String> {
            Err("store down".to_string())
        }
        async fn delete_prefix(&self, _prefix: &str) -> Result<usize, String> {
            Err("store down".to_string())
        }
    }

    fn working_rows() -> Vec<MasterRow> {
        vec![
            MasterRow {
                store_code: "T001".to_string(),
                store_name: "Toko Satu".to_string(),
                area_manager: "AM1".to_string(),
                area_supervisor: "AS1".to_string(),
                product_code: "P1".to_string(),
                description: "Produk 1".to_string(),
                quantity: -262200.0,
                amount: 1234.0,
                annotation: "barang rusak di DC".to_string(),
            },
            MasterRow {
                store_code: "T001".to_string(),
                store_name: "Toko Satu".to_string(),
                area_manager: "AM1".to_string(),
                area_supervisor: "AS1".to_string(),
                product_code: "P2".to_string(),
                description: "Produk 2".to_string(),
                quantity: 5.0,
                amount: 5000.0,
                annotation: String::new(),
            },
        ]
    }

    #[tokio::test]
    async fn save_reload_reconcile_round_trips_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        let rows = working_rows();

        save(&store, "ns", "T001", "2026-01", &rows).await.unwrap();
        let prior = load(&store, "ns", "T001", "2026-01")
            .await
            .found()
            .expect("saved file should load");

        let merged = reconcile(&rows, Some(&prior));
        assert_eq!(merged.len(), rows.len());
        assert_eq!(merged[0].annotation, "barang rusak di DC");
        assert_eq!(merged[1].annotation, "");
        // Master attributes untouched by the trip through the workbook.
        assert_eq!(merged[0].quantity, -262200.0);
    }

    #[tokio::test]
    async fn saving_twice_leaves_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        let mut rows = working_rows();

        save(&store, "ns", "T001", "2026-01", &rows).await.unwrap();
        rows[1].annotation = "menyusul".to_string();
        save(&store, "ns", "T001", "2026-01", &rows).await.unwrap();

        let listed = list_result_keys(&store, "ns", Some("2026-01")).await.unwrap();
        assert_eq!(listed, vec!["ns/hasil/T001_2026-01.xlsx".to_string()]);

        let prior = load(&store, "ns", "T001", "2026-01").await.found().unwrap();
        assert_eq!(prior[1].annotation, "menyusul");
    }

    #[tokio::test]
    async fn load_reports_absence_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        assert_eq!(load(&store, "ns", "T404", "2026-01").await, Fetch::Missing);
    }

    #[tokio::test]
    async fn unreachable_store_is_not_reported_as_absence() {
        // An outage must come back as Unavailable so callers refuse to
        // proceed as if there were no saved annotations; reconciling against
        // "nothing" here would overwrite the prior file on the next save.
        match load(&DownStore, "ns", "T001", "2026-01").await {
            Fetch::Unavailable(e) => assert_eq!(e, "store down"),
            other => panic!("expected Unavailable, got {:?}", other),
        }

        // The aggregated download fails outright instead of producing an
        // empty (and plausible-looking) result set.
        assert!(collect_results(&DownStore, "ns", "2026-01").await.is_err());
    }

    #[tokio::test]
    async fn unreadable_result_file_counts_as_no_prior_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        store
            .put("ns/hasil/T001_2026-01.xlsx", b"not a workbook")
            .await
            .unwrap();
        assert_eq!(load(&store, "ns", "T001", "2026-01").await, Fetch::Missing);
    }

    #[tokio::test]
    async fn purge_can_target_one_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        let rows = working_rows();
        save(&store, "ns", "T001", "2026-01", &rows).await.unwrap();
        save(&store, "ns", "T002", "2026-01", &rows).await.unwrap();
        save(&store, "ns", "T001", "2026-02", &rows).await.unwrap();

        let deleted = purge(&store, "ns", Some("2026-01")).await.unwrap();
        assert_eq!(deleted, 2);
        let remaining = list_result_keys(&store, "ns", None).await.unwrap();
        assert_eq!(remaining, vec!["ns/hasil/T001_2026-02.xlsx".to_string()]);

        let deleted = purge(&store, "ns", None).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn collect_results_concatenates_saved_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        let mut rows_a = working_rows();
        let mut rows_b = working_rows();
        for r in rows_b.iter_mut() {
            r.store_code = "T002".to_string();
        }
        rows_a.truncate(1);

        save(&store, "ns", "T001", "2026-01", &rows_a).await.unwrap();
        save(&store, "ns", "T002", "2026-01", &rows_b).await.unwrap();

        let collected = collect_results(&store, "ns", "2026-01").await.unwrap();
        assert_eq!(collected.len(), 3);
        assert!(collected.iter().any(|r| r.store_code == "T002"));
    }
}
