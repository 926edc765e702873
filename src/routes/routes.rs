//! Defines routes for the download relay API.
//!
//! ## Structure
//! - **Health**
//!   - `GET    /health`: liveness
//!   - `GET    /readyz`: output directory check
//!
//! - **Jobs**
//!   - `POST   /download`: validate, download and upload a video
//!   - `GET    /status/{job_id}`: current state of a job
//!   - `GET    /jobs`: every job known to this process
//!   - `GET    /download/{job_id}/file`: the downloaded file (stream or base64),
//!     deleted after delivery unless `auto_delete=false`
//!   - `GET    /jobs/{job_id}/file`: same as above
//!   - `DELETE /cleanup/{job_id}`: remove local and remote artifacts
//!   - `GET    /formats`: accepted format presets

use crate::{
    handlers::{
        health_handlers::{health, readyz},
        job_handlers::{
            cleanup_job, job_file, job_status, list_formats, list_jobs, submit_download,
        },
    },
    services::job_service::JobService,
};
use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::trace::TraceLayer;

/// Build the router. Shared state (`JobService`) is attached by the caller.
pub fn routes() -> Router<JobService> {
    Router::new()
        // health endpoints
        .route("/health", get(health))
        .route("/readyz", get(readyz))
        // job endpoints
        .route("/download", post(submit_download))
        .route("/status/{job_id}", get(job_status))
        .route("/jobs", get(list_jobs))
        .route("/download/{job_id}/file", get(job_file))
        .route("/jobs/{job_id}/file", get(job_file))
        .route("/cleanup/{job_id}", delete(cleanup_job))
        .route("/formats", get(list_formats))
        .layer(TraceLayer::new_for_http())
}
