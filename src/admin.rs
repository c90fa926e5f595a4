use axum::{
    Form, Json,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use log::info;
use serde::Deserialize;
use std::sync::Arc;

use crate::annotations;
use crate::app::{AppState, download_response, err, load_master_meta, require_admin};
use crate::blob::keys;
use crate::export;
use crate::login::{self, CredentialStore};
use crate::master::{self, MasterMeta};

/// Upload a new master workbook.
///
/// The file is validated by parsing it before anything is written; only then
/// do the workbook and the refreshed metadata go to the store, in that order,
/// so the metadata never points at a key that is not there yet. All caches
/// are cleared because the active version changes.
pub async fn upload_master(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut multipart: Multipart,
) -> Response {
    let session = match require_admin(&jar) {
        Ok(session) => session,
        Err(resp) => return resp,
    };

    let mut upload: Option<(String, Vec<u8>)> = None;
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                if field.name() != Some("master") {
                    continue;
                }
                let filename = field
                    .file_name()
                    .map(|f| f.to_string())
                    .unwrap_or_else(|| "master.xlsx".to_string());
                match field.bytes().await {
                    Ok(bytes) => upload = Some((filename, bytes.to_vec())),
                    Err(e) => {
                        return err(
                            StatusCode::BAD_REQUEST,
                            format!("failed to read upload: {}", e),
                        );
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                return err(
                    StatusCode::BAD_REQUEST,
                    format!("invalid multipart request: {}", e),
                );
            }
        }
    }

    let (filename, bytes) = match upload {
        Some(v) => v,
        None => return err(StatusCode::BAD_REQUEST, "missing 'master' file field"),
    };

    let rows = match master::parse_master(&bytes) {
        Ok(rows) if !rows.is_empty() => rows,
        Ok(_) => return err(StatusCode::BAD_REQUEST, "master workbook has no data rows"),
        Err(e) => return err(StatusCode::BAD_REQUEST, e),
    };

    let uploaded_at = Utc::now();
    let meta = MasterMeta {
        key: keys::master(&state.cfg.namespace, &filename),
        version: master::derive_version(&filename, uploaded_at),
        uploaded_at: uploaded_at.to_rfc3339(),
    };

    if let Err(e) = state.store.put(&meta.key, &bytes).await {
        return err(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("failed to store master workbook: {}", e),
        );
    }
    let meta_json = match serde_json::to_vec_pretty(&meta) {
        Ok(json) => json,
        Err(e) => {
            return err(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to serialize master metadata: {}", e),
            );
        }
    };
    if let Err(e) = state
        .store
        .put(&keys::master_meta(&state.cfg.namespace), &meta_json)
        .await
    {
        return err(
            StatusCode::SERVICE_UNAVAILABLE,
            format!("failed to store master metadata: {}", e),
        );
    }

    state.master_cache.clear();
    state.listing_cache.clear();
    info!(
        "{} uploaded master {} as version {} ({} rows)",
        session.user_id,
        filename,
        meta.version,
        rows.len()
    );

    Json(serde_json::json!({
        "status": "ok",
        "version": meta.version,
        "rows": rows.len(),
    }))
    .into_response()
}

/// List registered usernames.
pub async fn list_users(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    if let Err(resp) = require_admin(&jar) {
        return resp;
    }
    let creds = CredentialStore::new(state.store.clone(), state.cfg.namespace.clone());
    match creds.list().await {
        Ok(users) => Json(serde_json::json!({ "users": users })).into_response(),
        Err(e) => err(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

#[derive(Deserialize)]
pub struct ResetForm {
    pub username: String,
    pub password: String,
}

/// Set a new password for an existing user.
pub async fn reset_user_password(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(form): Form<ResetForm>,
) -> Response {
    let session = match require_admin(&jar) {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    let creds = CredentialStore::new(state.store.clone(), state.cfg.namespace.clone());
    match creds.reset_password(&form.username, &form.password).await {
        Ok(()) => {
            info!("{} reset password for {}", session.user_id, form.username);
            Json(serde_json::json!({ "status": "ok" })).into_response()
        }
        Err(e) if e == "User not found" => err(StatusCode::NOT_FOUND, e),
        Err(e) => err(StatusCode::BAD_REQUEST, e),
    }
}

/// Delete a user account.
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Path(username): Path<String>,
) -> Response {
    let session = match require_admin(&jar) {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    let creds = CredentialStore::new(state.store.clone(), state.cfg.namespace.clone());
    match creds.remove(&username).await {
        Ok(()) => {
            info!("{} deleted user {}", session.user_id, username);
            Json(serde_json::json!({ "status": "ok" })).into_response()
        }
        Err(e) if e == "User not found" => err(StatusCode::NOT_FOUND, e),
        Err(e) => err(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// Activity log as JSON, newest day first.
pub async fn activity(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    if let Err(resp) = require_admin(&jar) {
        return resp;
    }
    match login::activity_entries(state.store.as_ref(), &state.cfg.namespace).await {
        Ok(entries) => Json(serde_json::json!({ "activity": entries })).into_response(),
        Err(e) => err(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

/// Activity log as a CSV download.
pub async fn activity_download(State(state): State<Arc<AppState>>, jar: CookieJar) -> Response {
    if let Err(resp) = require_admin(&jar) {
        return resp;
    }
    match login::activity_entries(state.store.as_ref(), &state.cfg.namespace).await {
        Ok(entries) => {
            let csv = login::activity_csv(&entries);
            download_response(csv.into_bytes(), "text/csv", "log_aktivitas.csv")
        }
        Err(e) => err(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

#[derive(Deserialize)]
pub struct ResultsQuery {
    pub version: Option<String>,
    pub format: Option<String>,
}

#[derive(Deserialize)]
pub struct PurgeQuery {
    pub version: Option<String>,
    pub confirm: Option<String>,
}

/// Download every saved result file for a version, concatenated into one
/// workbook or CSV. Defaults to the active master's version.
pub async fn download_results(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<ResultsQuery>,
) -> Response {
    if let Err(resp) = require_admin(&jar) {
        return resp;
    }

    let version = match params.version {
        Some(v) => v,
        None => match load_master_meta(&state).await {
            Ok(meta) => meta.version,
            Err(resp) => return resp,
        },
    };

    let rows =
        match annotations::collect_results(state.store.as_ref(), &state.cfg.namespace, &version)
            .await
        {
            Ok(rows) => rows,
            Err(e) => return err(StatusCode::SERVICE_UNAVAILABLE, e),
        };
    if rows.is_empty() {
        return err(
            StatusCode::NOT_FOUND,
            format!("no result files for version {}", version),
        );
    }

    match params.format.as_deref().unwrap_or("xlsx") {
        "csv" => download_response(
            export::to_csv(&rows).into_bytes(),
            "text/csv",
            &format!("Rekap_{}.csv", version),
        ),
        "xlsx" => match export::to_xlsx(&rows) {
            Ok(bytes) => download_response(
                bytes,
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
                &format!("Rekap_{}.xlsx", version),
            ),
            Err(e) => err(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to build workbook: {}", e),
            ),
        },
        _ => err(StatusCode::BAD_REQUEST, "format must be 'csv' or 'xlsx'"),
    }
}

/// Bulk-delete result files, scoped to one version when given. Requires
/// `confirm=true`; a bare DELETE does nothing.
pub async fn purge_results(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Query(params): Query<PurgeQuery>,
) -> Response {
    let session = match require_admin(&jar) {
        Ok(session) => session,
        Err(resp) => return resp,
    };
    if params.confirm.as_deref() != Some("true") {
        return err(
            StatusCode::BAD_REQUEST,
            "pass confirm=true to delete result files",
        );
    }

    match annotations::purge(
        state.store.as_ref(),
        &state.cfg.namespace,
        params.version.as_deref(),
    )
    .await
    {
        Ok(deleted) => {
            state.listing_cache.clear();
            info!(
                "{} purged {} result files ({})",
                session.user_id,
                deleted,
                params.version.as_deref().unwrap_or("all versions")
            );
            Json(serde_json::json!({ "status": "ok", "deleted": deleted })).into_response()
        }
        Err(e) => err(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}
