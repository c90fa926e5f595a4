/*!
Monitoring service for retail-distribution reporting.

A small axum web service: an administrator uploads a monthly master workbook
into a blob store, field users pull their store's slice of it, annotate the
rows, and save the annotated sheet back as that store's result file for the
month. Supervisors watch per-group completion progress and download the
aggregated results.

All state lives in the blob store; the process itself only keeps
version-scoped caches that become irrelevant when a new master is uploaded.
*/

pub mod admin;
pub mod annotations;
pub mod app;
pub mod blob;
pub mod cache;
pub mod config;
pub mod export;
pub mod login;
pub mod master;
pub mod progress;
pub mod reconcile;

pub use app::AppState;
pub use blob::{Blob, BlobEntry, BlobStore, DirBlobStore, Fetch, HttpBlobStore, PutError};
pub use config::Config;
pub use master::{MasterMeta, MasterRow};
pub use reconcile::reconcile;
