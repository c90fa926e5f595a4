use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use axum_extra::extract::cookie::CookieJar;
use log::info;
use serde::Deserialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::admin;
use crate::annotations;
use crate::blob::{BlobStore, Fetch, keys};
use crate::cache::VersionCache;
use crate::config::Config;
use crate::export;
use crate::login::{self, Session};
use crate::master::{self, MasterMeta, MasterRow};
use crate::progress::{self, Dimension};
use crate::reconcile::reconcile;

/// Shared per-process state: the blob store handle, configuration, and the
/// version-keyed caches for parsed masters and result listings.
pub struct AppState {
    pub store: Arc<dyn BlobStore>,
    pub cfg: Config,
    pub master_cache: VersionCache<Vec<MasterRow>>,
    pub listing_cache: VersionCache<Vec<String>>,
}

/// Build the router and serve until shutdown.
pub async fn run(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = cfg.make_store()?;
    let bind_addr = cfg.bind_addr.clone();

    let state = Arc::new(AppState {
        store,
        cfg,
        master_cache: VersionCache::new(),
        listing_cache: VersionCache::new(),
    });

    let app = Router::new()
        .route("/api/login", post(login::handle_login))
        .route("/api/register", post(login::handle_register))
        .route("/api/logout", post(login::handle_logout))
        .route("/api/master", get(get_master_info))
        .route("/api/rows", get(get_rows).post(save_rows))
        .route("/api/progress", get(get_progress))
        .route("/api/export", get(export_rows))
        .route("/api/admin/login", post(login::handle_admin_login))
        .route("/api/admin/master", post(admin::upload_master))
        .route("/api/admin/users", get(admin::list_users))
        .route("/api/admin/users/reset", post(admin::reset_user_password))
        .route("/api/admin/users/:username", delete(admin::delete_user))
        .route("/api/admin/activity", get(admin::activity))
        .route("/api/admin/activity.csv", get(admin::activity_download))
        .route(
            "/api/admin/results",
            get(admin::download_results).delete(admin::purge_results),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!("listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}

pub(crate) fn err(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, msg.into()).into_response()
}

pub(crate) fn require_user(jar: &CookieJar) -> Result<Session, Response> {
    login::session_from(jar).ok_or_else(|| err(StatusCode::UNAUTHORIZED, "Login required"))
}

pub(crate) fn require_admin(jar: &CookieJar) -> Result<Session, Response> {
    login::session_from(jar)
        .filter(|session| session.is_admin)
        .ok_or_else(|| err(StatusCode::UNAUTHORIZED, "Admin login required"))
}

/// Metadata of the active master, or the appropriate error when there is
/// none / the store is down.
pub(crate) async fn load_master_meta(state: &AppState) -> Result<MasterMeta, Response> {
    match state
        .store
        .fetch(&keys::master_meta(&state.cfg.namespace))
        .await
    {
        Fetch::Found(blob) => serde_json::from_slice(&blob.bytes).map_err(|e| {
            err(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("master metadata is corrupt: {}", e),
            )
        }),
        Fetch::Missing => Err(err(StatusCode::NOT_FOUND, "No master uploaded yet")),
        Fetch::Unavailable(e) => Err(err(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("blob store unavailable: {}", e),
        )),
    }
}

/// Parsed rows of the active master, cached per version tag.
pub(crate) async fn cached_master_rows(
    state: &AppState,
    meta: &MasterMeta,
) -> Result<Vec<MasterRow>, Response> {
    if let Some(rows) = state.master_cache.get("master", &meta.version) {
        return Ok(rows);
    }

    match state.store.fetch(&meta.key).await {
        Fetch::Found(blob) => {
            let rows = master::parse_master(&blob.bytes)
                .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e))?;
            state.master_cache.put("master", &meta.version, rows.clone());
            Ok(rows)
        }
        Fetch::Missing => Err(err(
            StatusCode::NOT_FOUND,
            "Master workbook is missing from the store",
        )),
        Fetch::Unavailable(e) => Err(err(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("blob store unavailable: {}", e),
        )),
    }
}

/// Result-file listing for a version, cached until a save or purge
/// invalidates it.
pub(crate) async fn cached_result_listing(
    state: &AppState,
    version: &str,
) -> Result<Vec<String>, Response> {
    if let Some(listed) = state.listing_cache.get("results", version) {
        return Ok(listed);
    }

    let listed =
        annotations::list_result_keys(state.store.as_ref(), &state.cfg.namespace, Some(version))
            .await
            .map_err(|e| err(StatusCode::SERVICE_UNAVAILABLE, e))?;
    state.listing_cache.put("results", version, listed.clone());
    Ok(listed)
}

/// The reconciled working rows for one store: current master rows with any
/// previously saved annotations merged back on.
async fn working_rows(
    state: &AppState,
    store_code: &str,
) -> Result<(MasterMeta, Vec<MasterRow>), Response> {
    let meta = load_master_meta(state).await?;
    let all_rows = cached_master_rows(state, &meta).await?;
    let store_rows = master::rows_for_store(&all_rows, store_code);
    if store_rows.is_empty() {
        return Err(err(StatusCode::NOT_FOUND, "Store not found in the master"));
    }

    let prior = match annotations::load(
        state.store.as_ref(),
        &state.cfg.namespace,
        store_code,
        &meta.version,
    )
    .await
    {
        Fetch::Found(rows) => Some(rows),
        Fetch::Missing => None,
        // A transient failure must not masquerade as "no prior annotations";
        // that path used to lose user data silently.
        Fetch::Unavailable(e) => {
            return Err(err(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("saved annotations unavailable, try again: {}", e),
            ));
        }
    };

    let merged = reconcile(&store_rows, prior.as_deref());
    Ok((meta, merged))
}

#[derive(Deserialize)]
struct StoreQuery {
    store: String,
}

#[derive(Deserialize)]
struct ProgressQuery {
    dim: Option<String>,
}

#[derive(Deserialize)]
struct ExportQuery {
    store: String,
    format: Option<String>,
}

/// One submitted annotation; keys the client did not send keep whatever
/// annotation was previously saved.
#[derive(Deserialize)]
struct AnnotationInput {
    product_code: String,
    annotation: String,
}

/// Version, upload time, and store list of the active master.
async fn get_master_info(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    if let Err(resp) = require_user(&jar) {
        return resp;
    }
    let meta = match load_master_meta(&state).await {
        Ok(meta) => meta,
        Err(resp) => return resp,
    };
    let rows = match cached_master_rows(&state, &meta).await {
        Ok(rows) => rows,
        Err(resp) => return resp,
    };

    let stores: Vec<serde_json::Value> = master::unique_stores(&rows)
        .iter()
        .map(|r| {
            serde_json::json!({
                "code": r.store_code,
                "name": r.store_name,
            })
        })
        .collect();

    Json(serde_json::json!({
        "version": meta.version,
        "uploaded_at": meta.uploaded_at,
        "stores": stores,
    }))
    .into_response()
}

/// Reconciled working rows for one store.
async fn get_rows(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<StoreQuery>,
) -> Response {
    if let Err(resp) = require_user(&jar) {
        return resp;
    }
    match working_rows(&state, &params.store).await {
        Ok((meta, rows)) => Json(serde_json::json!({
            "version": meta.version,
            "store": keys::canonical_store(&params.store),
            "rows": rows,
        }))
        .into_response(),
        Err(resp) => resp,
    }
}

/// Save annotations for one store. The submitted annotations are applied on
/// top of the reconciled working rows, and the whole set is written back as
/// this store's result file for the active version.
async fn save_rows(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<StoreQuery>,
    Json(input): Json<Vec<AnnotationInput>>,
) -> Response {
    let session = match require_user(&jar) {
        Ok(session) => session,
        Err(resp) => return resp,
    };

    let (meta, mut rows) = match working_rows(&state, &params.store).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let submitted: std::collections::HashMap<String, String> = input
        .into_iter()
        .map(|a| (a.product_code.trim().to_string(), a.annotation))
        .collect();
    for row in rows.iter_mut() {
        if let Some(note) = submitted.get(row.product_code.trim()) {
            row.annotation = note.trim().to_string();
        }
    }

    match annotations::save(
        state.store.as_ref(),
        &state.cfg.namespace,
        &params.store,
        &meta.version,
        &rows,
    )
    .await
    {
        Ok(key) => {
            info!(
                "{} saved {} rows for {} ({})",
                session.user_id,
                rows.len(),
                params.store,
                meta.version
            );
            state.listing_cache.invalidate("results", &meta.version);
            Json(serde_json::json!({
                "status": "ok",
                "key": key,
                "rows_saved": rows.len(),
            }))
            .into_response()
        }
        Err(e) => err(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to save annotations: {}", e),
        ),
    }
}

/// Per-group progress for the active version, least-progressed group first.
async fn get_progress(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<ProgressQuery>,
) -> Response {
    if let Err(resp) = require_user(&jar) {
        return resp;
    }

    let dimension = match params.dim.as_deref() {
        None => Dimension::AreaManager,
        Some(raw) => match Dimension::parse(raw) {
            Some(dim) => dim,
            None => return err(StatusCode::BAD_REQUEST, "dim must be 'am' or 'as'"),
        },
    };

    let meta = match load_master_meta(&state).await {
        Ok(meta) => meta,
        Err(resp) => return resp,
    };
    let rows = match cached_master_rows(&state, &meta).await {
        Ok(rows) => rows,
        Err(resp) => return resp,
    };
    let listing = match cached_result_listing(&state, &meta.version).await {
        Ok(listing) => listing,
        Err(resp) => return resp,
    };

    let report = progress::aggregate(
        &rows,
        &listing,
        &state.cfg.namespace,
        &meta.version,
        dimension,
    );
    Json(serde_json::json!({
        "version": meta.version,
        "progress": report,
    }))
    .into_response()
}

/// Download the working rows for one store as CSV or XLSX.
async fn export_rows(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<ExportQuery>,
) -> Response {
    if let Err(resp) = require_user(&jar) {
        return resp;
    }

    let (meta, rows) = match working_rows(&state, &params.store).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let store_code = keys::canonical_store(&params.store);
    match params.format.as_deref().unwrap_or("csv") {
        "csv" => {
            let csv = export::to_csv(&rows);
            download_response(
                csv.into_bytes(),
                "text/csv",
                &format!("Laporan_{}_{}.csv", store_code, meta.version),
            )
        }
        "xlsx" => match export::to_xlsx(&rows) {
            Ok(bytes) => download_response(
                bytes,
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                &format!("Laporan_{}_{}.xlsx", store_code, meta.version),
            ),
            Err(e) => err(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to build workbook: {}", e),
            ),
        },
        _ => err(StatusCode::BAD_REQUEST, "format must be 'csv' or 'xlsx'"),
    }
}

/// Build an attachment response around generated bytes.
pub(crate) fn download_response(bytes: Vec<u8>, content_type: &str, filename: &str) -> Response {
    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(axum::body::Body::from(Bytes::from(bytes)))
    {
        Ok(resp) => resp,
        Err(e) => err(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to build response: {}", e),
        ),
    }
}
