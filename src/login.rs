use crate::app::AppState;
use crate::blob::{BlobStore, Fetch, PutError, keys};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use axum::{
    Form, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Credential data for login and registration forms.
#[derive(Debug, Serialize, Deserialize)]
pub struct UserCredentials {
    pub username: String,
    /// Password in plaintext (only transmitted, never stored).
    pub password: String,
}

/// An authenticated session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Username of the authenticated user.
    pub user_id: String,
    /// Whether this session came from the admin login.
    pub is_admin: bool,
    /// Time when the session expires.
    pub expires_at: SystemTime,
}

lazy_static! {
    static ref SESSIONS: RwLock<HashMap<String, Session>> = RwLock::new(HashMap::new());
}

const SESSION_DURATION: u64 = 24 * 60 * 60; // 24 hours in seconds

/// The identifier -> secret mapping, stored wholesale as one JSON blob at
/// `config/users.json`.
///
/// Every update is a read-modify-write of the whole file. Registration goes
/// through a compare-and-swap on the blob's etag so two concurrent
/// registrations cannot both succeed with the later write clobbering the
/// earlier one; password resets and deletions overwrite the loaded snapshot
/// unconditionally.
pub struct CredentialStore {
    store: Arc<dyn BlobStore>,
    namespace: String,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn BlobStore>, namespace: impl Into<String>) -> Self {
        CredentialStore {
            store,
            namespace: namespace.into(),
        }
    }

    /// Load the whole credential map plus the etag it was read at.
    ///
    /// A missing file is an empty mapping; an unreachable store is an error,
    /// never an empty mapping, so an outage cannot look like "no users".
    async fn load(&self) -> Result<(HashMap<String, String>, Option<String>), String> {
        match self.store.fetch(&keys::users(&self.namespace)).await {
            Fetch::Found(blob) => {
                let users = serde_json::from_slice(&blob.bytes)
                    .map_err(|e| format!("credential file is corrupt: {}", e))?;
                Ok((users, blob.etag))
            }
            Fetch::Missing => Ok((HashMap::new(), None)),
            Fetch::Unavailable(e) => Err(format!("credential store unavailable: {}", e)),
        }
    }

    async fn save(&self, users: &HashMap<String, String>) -> Result<(), String> {
        let json = serde_json::to_string_pretty(users)
            .map_err(|_| "Failed to serialize users data".to_string())?;
        self.store
            .put(&keys::users(&self.namespace), json.as_bytes())
            .await
    }

    /// Register a new user. Fails if the identifier is already present; the
    /// write is conditional on the etag observed at read time, so a
    /// concurrent registration surfaces as a conflict instead of silently
    /// losing one of the two accounts.
    pub async fn register(&self, username: &str, password: &str) -> Result<(), String> {
        // Stray whitespace in a signup form must not mint a second account
        // for an existing identifier.
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err("Username and password cannot be empty".to_string());
        }

        let (mut users, etag) = self.load().await?;
        if users.contains_key(username) {
            return Err("Username already exists".to_string());
        }

        users.insert(username.to_string(), hash_password(password)?);
        let json = serde_json::to_string_pretty(&users)
            .map_err(|_| "Failed to serialize users data".to_string())?;

        match self
            .store
            .put_if_match(&keys::users(&self.namespace), json.as_bytes(), etag.as_deref())
            .await
        {
            Ok(()) => Ok(()),
            Err(PutError::Conflict) => {
                Err("Another registration happened at the same time, try again".to_string())
            }
            Err(PutError::Failed(e)) => Err(format!("Failed to save users data: {}", e)),
        }
    }

    /// Verify user credentials.
    ///
    /// Unknown identifier and wrong password are indistinguishable to the
    /// caller; both are simply `false`.
    pub async fn verify(&self, username: &str, password: &str) -> Result<bool, String> {
        let (users, _) = self.load().await?;
        match users.get(username) {
            Some(hash) => verify_password(password, hash),
            None => Ok(false),
        }
    }

    /// Set a new password for an existing user (admin action).
    pub async fn reset_password(&self, username: &str, new_password: &str) -> Result<(), String> {
        if new_password.is_empty() {
            return Err("Password cannot be empty".to_string());
        }
        let (mut users, _) = self.load().await?;
        if !users.contains_key(username) {
            return Err("User not found".to_string());
        }
        users.insert(username.to_string(), hash_password(new_password)?);
        self.save(&users).await
    }

    /// Remove a user account (admin action).
    pub async fn remove(&self, username: &str) -> Result<(), String> {
        let (mut users, _) = self.load().await?;
        if users.remove(username).is_none() {
            return Err("User not found".to_string());
        }
        self.save(&users).await
    }

    /// All registered identifiers, sorted.
    pub async fn list(&self) -> Result<Vec<String>, String> {
        let (users, _) = self.load().await?;
        let mut names: Vec<String> = users.into_keys().collect();
        names.sort();
        Ok(names)
    }
}

/// Hash a password with Argon2id.
fn hash_password(password: &str) -> Result<String, String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();

    match argon2.hash_password(password.as_bytes(), &salt) {
        Ok(hash) => Ok(hash.to_string()),
        Err(_) => Err("Password hashing failed".to_string()),
    }
}

/// Verify a password against a stored Argon2 hash.
fn verify_password(password: &str, hash: &str) -> Result<bool, String> {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(hash) => hash,
        Err(_) => return Err("Invalid password hash format".to_string()),
    };

    match Argon2::default().verify_password(password.as_bytes(), &parsed_hash) {
        Ok(_) => Ok(true),
        Err(_) => Ok(false), // Password didn't match
    }
}

/// Create a new session and return its ID.
pub fn create_session(username: &str, is_admin: bool) -> String {
    let session_id = Uuid::new_v4().to_string();
    let expires_at = SystemTime::now() + Duration::from_secs(SESSION_DURATION);

    let session = Session {
        user_id: username.to_string(),
        is_admin,
        expires_at,
    };

    let mut sessions = SESSIONS.write().unwrap();
    sessions.insert(session_id.clone(), session);

    session_id
}

/// Look up a session, returning it only while unexpired.
pub fn validate_session(session_id: &str) -> Option<Session> {
    let sessions = SESSIONS.read().unwrap();

    if let Some(session) = sessions.get(session_id) {
        if session.expires_at > SystemTime::now() {
            return Some(session.clone());
        }
    }

    None
}

pub fn destroy_session(session_id: &str) {
    let mut sessions = SESSIONS.write().unwrap();
    sessions.remove(session_id);
}

/// The session attached to a request's cookie jar, if any.
pub fn session_from(jar: &CookieJar) -> Option<Session> {
    jar.get("session")
        .and_then(|cookie| validate_session(cookie.value()))
}

/// Per-day per-user login counters, kept at `config/logs.json`.
pub type ActivityLog = BTreeMap<String, BTreeMap<String, u64>>;

/// One flattened row of the activity log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub date: String,
    pub username: String,
    pub logins: u64,
}

/// Count a successful login. Best effort: a broken log must never fail the
/// login itself, so failures are logged and swallowed here.
pub async fn record_login(
    store: &dyn BlobStore,
    namespace: &str,
    username: &str,
    now: DateTime<Utc>,
) {
    let key = keys::activity_log(namespace);
    let mut activity: ActivityLog = match store.fetch(&key).await {
        Fetch::Found(blob) => serde_json::from_slice(&blob.bytes).unwrap_or_default(),
        Fetch::Missing => ActivityLog::new(),
        Fetch::Unavailable(e) => {
            warn!("activity log unavailable, skipping login record: {}", e);
            return;
        }
    };

    let day = now.format("%Y-%m-%d").to_string();
    *activity
        .entry(day)
        .or_default()
        .entry(username.to_string())
        .or_insert(0) += 1;

    match serde_json::to_vec(&activity) {
        Ok(bytes) => {
            if let Err(e) = store.put(&key, &bytes).await {
                warn!("failed to record login activity: {}", e);
            }
        }
        Err(e) => warn!("failed to serialize activity log: {}", e),
    }
}

/// Flatten the activity log for display: newest day first, usernames sorted
/// within a day.
pub async fn activity_entries(
    store: &dyn BlobStore,
    namespace: &str,
) -> Result<Vec<ActivityEntry>, String> {
    let activity: ActivityLog = match store.fetch(&keys::activity_log(namespace)).await {
        Fetch::Found(blob) => serde_json::from_slice(&blob.bytes)
            .map_err(|e| format!("activity log is corrupt: {}", e))?,
        Fetch::Missing => ActivityLog::new(),
        Fetch::Unavailable(e) => return Err(format!("activity log unavailable: {}", e)),
    };

    let mut entries = Vec::new();
    for (date, users) in activity.iter().rev() {
        for (username, logins) in users {
            entries.push(ActivityEntry {
                date: date.clone(),
                username: username.clone(),
                logins: *logins,
            });
        }
    }
    Ok(entries)
}

/// Activity log as CSV, for the admin download.
pub fn activity_csv(entries: &[ActivityEntry]) -> String {
    let mut csv = String::from("Tanggal,Username,Jumlah Akses\n");
    for entry in entries {
        csv.push_str(&format!(
            "{},{},{}\n",
            entry.date, entry.username, entry.logins
        ));
    }
    csv
}

// Web handler functions below.

/// Handle field-user login: verify against the credential blob, create a
/// session cookie, and count the login in the activity log.
pub async fn handle_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(credentials): Form<UserCredentials>,
) -> Response {
    let creds = CredentialStore::new(state.store.clone(), state.cfg.namespace.clone());
    match creds
        .verify(&credentials.username, &credentials.password)
        .await
    {
        Ok(true) => {
            info!("user {} logged in", credentials.username);
            record_login(
                state.store.as_ref(),
                &state.cfg.namespace,
                &credentials.username,
                Utc::now(),
            )
            .await;
            let session_id = create_session(&credentials.username, false);
            let cookie = Cookie::new("session", session_id);
            (
                jar.add(cookie),
                Json(serde_json::json!({
                    "status": "ok",
                    "user": credentials.username,
                })),
            )
                .into_response()
        }
        Ok(false) => (StatusCode::UNAUTHORIZED, "Invalid username or password").into_response(),
        Err(e) => {
            warn!("login verification failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Authentication backend unavailable, try again",
            )
                .into_response()
        }
    }
}

/// Handle new-account registration.
pub async fn handle_register(
    State(state): State<Arc<AppState>>,
    Form(credentials): Form<UserCredentials>,
) -> Response {
    let creds = CredentialStore::new(state.store.clone(), state.cfg.namespace.clone());
    match creds
        .register(&credentials.username, &credentials.password)
        .await
    {
        Ok(()) => {
            info!("registered user {}", credentials.username);
            Json(serde_json::json!({ "status": "ok" })).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e).into_response(),
    }
}

/// Handle admin login against the configured admin credentials. Admin
/// sessions use the same cookie but are flagged, so the admin routes can
/// tell them apart.
pub async fn handle_admin_login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Form(credentials): Form<UserCredentials>,
) -> Response {
    if credentials.username == state.cfg.admin_username
        && credentials.password == state.cfg.admin_password
    {
        info!("admin {} logged in", credentials.username);
        let session_id = create_session(&credentials.username, true);
        let cookie = Cookie::new("session", session_id);
        (jar.add(cookie), Json(serde_json::json!({ "status": "ok" }))).into_response()
    } else {
        (StatusCode::UNAUTHORIZED, "Invalid username or password").into_response()
    }
}

/// Clear the session cookie and forget the session.
pub async fn handle_logout(jar: CookieJar) -> Response {
    if let Some(cookie) = jar.get("session") {
        destroy_session(cookie.value());
    }
    let cookie = Cookie::new("session", "");
    (jar.add(cookie), Json(serde_json::json!({ "status": "ok" }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::DirBlobStore;

    fn credential_store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DirBlobStore::new(dir.path()));
        (dir, CredentialStore::new(store, "ns"))
    }

    #[tokio::test]
    async fn register_then_verify() {
        let (_dir, creds) = credential_store();
        creds.register("gean", "rahasia").await.unwrap();

        assert!(creds.verify("gean", "rahasia").await.unwrap());
        assert!(!creds.verify("gean", "salah").await.unwrap());
        assert!(!creds.verify("tidak_ada", "rahasia").await.unwrap());
    }

    #[tokio::test]
    async fn duplicate_registration_leaves_mapping_unchanged() {
        let (_dir, creds) = credential_store();
        creds.register("putu", "satu").await.unwrap();

        let err = creds.register("putu", "dua").await.unwrap_err();
        assert_eq!(err, "Username already exists");

        // Original password still works; the attempted one does not.
        assert!(creds.verify("putu", "satu").await.unwrap());
        assert!(!creds.verify("putu", "dua").await.unwrap());
        assert_eq!(creds.list().await.unwrap(), vec!["putu".to_string()]);
    }

    #[tokio::test]
    async fn padded_username_is_the_same_account() {
        let (_dir, creds) = credential_store();
        creds.register("putu", "satu").await.unwrap();

        let err = creds.register(" putu ", "dua").await.unwrap_err();
        assert_eq!(err, "Username already exists");
        assert_eq!(creds.list().await.unwrap(), vec!["putu".to_string()]);

        // And registering with padding stores the trimmed identifier.
        creds.register("  made ", "pw").await.unwrap();
        assert!(creds.verify("made", "pw").await.unwrap());
    }

    #[tokio::test]
    async fn empty_credentials_are_rejected() {
        let (_dir, creds) = credential_store();
        assert!(creds.register("", "x").await.is_err());
        assert!(creds.register("x", "").await.is_err());
    }

    #[tokio::test]
    async fn reset_password_replaces_the_secret() {
        let (_dir, creds) = credential_store();
        creds.register("dwi", "lama").await.unwrap();
        creds.reset_password("dwi", "baru").await.unwrap();

        assert!(!creds.verify("dwi", "lama").await.unwrap());
        assert!(creds.verify("dwi", "baru").await.unwrap());

        let err = creds.reset_password("tidak_ada", "x").await.unwrap_err();
        assert_eq!(err, "User not found");
    }

    #[tokio::test]
    async fn remove_deletes_the_account() {
        let (_dir, creds) = credential_store();
        creds.register("ari", "pw").await.unwrap();
        creds.remove("ari").await.unwrap();

        assert!(!creds.verify("ari", "pw").await.unwrap());
        assert!(creds.remove("ari").await.is_err());
    }

    #[test]
    fn sessions_validate_until_destroyed() {
        let id = create_session("yani", false);
        let session = validate_session(&id).unwrap();
        assert_eq!(session.user_id, "yani");
        assert!(!session.is_admin);

        destroy_session(&id);
        assert!(validate_session(&id).is_none());
    }

    #[tokio::test]
    async fn activity_log_counts_logins_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirBlobStore::new(dir.path());
        let day = Utc::now();

        record_login(&store, "ns", "gean", day).await;
        record_login(&store, "ns", "gean", day).await;
        record_login(&store, "ns", "putu", day).await;

        let entries = activity_entries(&store, "ns").await.unwrap();
        assert_eq!(entries.len(), 2);
        let gean = entries.iter().find(|e| e.username == "gean").unwrap();
        assert_eq!(gean.logins, 2);

        let csv = activity_csv(&entries);
        assert!(csv.starts_with("Tanggal,Username,Jumlah Akses\n"));
        assert!(csv.contains(",gean,2\n"));
    }
}
