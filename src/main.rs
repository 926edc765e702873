use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::{AppConfig, ConfigError};
use services::{
    credential_loader::load_credentials,
    downloader::{Downloader, YtDlpDownloader},
    job_service::{JobService, SubmitRequest},
    token_provider::TokenProvider,
    uploader::{DriveEndpoints, DriveUploader, Uploader, drive_http_client},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + one-shot URL ---
    let (cfg, fetch) = match AppConfig::from_env_and_args() {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::error!("Invalid configuration: {}", err);
            return Err(err.into());
        }
    };
    tracing::info!("Starting video-relay with config: {:?}", cfg);

    // --- Initialize core service ---
    let service = match build_job_service(cfg) {
        Ok(service) => service,
        Err(err) => {
            tracing::error!("Startup failed: {:#}", err);
            return Err(err);
        }
    };

    // --- Handle one-shot mode ---
    if let Some(url) = fetch {
        return run_once(&service, &url).await;
    }

    // --- Build router ---
    let cfg = service.config().clone();
    let app: Router = routes::routes::routes().with_state(service);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Wire the downloader and, unless uploads are disabled, the Drive uploader.
///
/// Fails before anything is bound when credentials are missing or unreadable.
fn build_job_service(cfg: AppConfig) -> Result<JobService> {
    // --- Ensure output directory exists ---
    if !Path::new(&cfg.output_dir).exists() {
        fs::create_dir_all(&cfg.output_dir).map_err(|source| ConfigError::Io {
            path: cfg.output_dir.clone(),
            source,
        })?;
        tracing::info!("Created output directory at {}", cfg.output_dir.display());
    }

    let uploader: Option<Arc<dyn Uploader>> = if cfg.upload_enabled {
        let credentials = load_credentials(&cfg.credentials)?;
        let http = drive_http_client()?;
        let tokens = Arc::new(TokenProvider::new(credentials, http.clone()));
        Some(Arc::new(DriveUploader::new(
            http,
            tokens,
            DriveEndpoints::default(),
        )))
    } else {
        tracing::info!("Drive uploads disabled; files stay in {}", cfg.output_dir.display());
        None
    };

    let downloader: Arc<dyn Downloader> = Arc::new(YtDlpDownloader::new(
        cfg.yt_dlp_path.clone(),
        cfg.ffmpeg_location.clone(),
        cfg.job_timeout,
    ));

    Ok(JobService::new(Arc::new(cfg), downloader, uploader))
}

/// Run a single job and print it as JSON.
async fn run_once(service: &JobService, raw_url: &str) -> Result<()> {
    let (url, format) = service.validate(Some(raw_url), None)?;
    let request = SubmitRequest {
        url,
        folder_id: None,
        share_public: None,
        format,
        ffmpeg_location: None,
    };
    let job = service.create(&request).await;
    let outcome = service.process(job.id, request.url).await;

    let job = service.get(job.id).await?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    outcome.map(|_| ()).map_err(Into::into)
}
