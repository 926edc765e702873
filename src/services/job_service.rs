//! JobService: in-memory job registry and the download → upload pipeline.
//!
//! Every job downloads into its own directory (`output_dir/{job_id}`), so two
//! jobs for the same URL never write to the same path. Jobs live for the
//! lifetime of the process; nothing is persisted.
//!
//! The pipeline always runs on its own tokio task. A caller that waits for
//! the result only awaits that task, so a dropped HTTP request never leaves a
//! job stuck mid-pipeline.

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{fs, sync::RwLock, time::timeout};
use tracing::{Instrument, debug, error, info, info_span, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    models::job::{DeliveryState, InvalidTransition, Job, JobStatus},
    services::{
        downloader::{
            DownloadError, DownloadRequest, Downloader, FormatPreset, ValidationError,
            validate_source_url,
        },
        uploader::{UploadError, Uploader},
    },
};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job `{0}` not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),
    #[error("job timed out after {0}s")]
    Timeout(u64),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("job task stopped unexpectedly: {0}")]
    Interrupted(String),
    #[error("file for job `{0}` is no longer available")]
    FileGone(Uuid),
    #[error("file for job `{0}` was already delivered")]
    AlreadyDelivered(Uuid),
    #[error("{0}")]
    FileBusy(String),
}

pub type JobResult<T> = Result<T, JobError>;

/// A validated submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub url: Url,
    pub folder_id: Option<String>,
    pub share_public: Option<bool>,
    pub format: Option<FormatPreset>,
    /// Overrides the configured ffmpeg location for this job only.
    pub ffmpeg_location: Option<PathBuf>,
}

/// What `cleanup` managed to remove.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CleanupReport {
    pub local_removed: bool,
    pub remote_removed: bool,
    pub remote_error: Option<String>,
}

/// Owns the job registry and drives jobs through the collaborators.
///
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct JobService {
    config: Arc<AppConfig>,
    downloader: Arc<dyn Downloader>,
    uploader: Option<Arc<dyn Uploader>>,
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
}

impl JobService {
    pub fn new(
        config: Arc<AppConfig>,
        downloader: Arc<dyn Downloader>,
        uploader: Option<Arc<dyn Uploader>>,
    ) -> Self {
        Self {
            config,
            downloader,
            uploader,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn upload_enabled(&self) -> bool {
        self.uploader.is_some()
    }

    /// Check raw client input and turn it into a `SubmitRequest`.
    pub fn validate(
        &self,
        url: Option<&str>,
        format: Option<&str>,
    ) -> Result<(Url, Option<FormatPreset>), ValidationError> {
        let url = validate_source_url(url.unwrap_or_default(), &self.config.allowed_hosts)?;
        let format = format
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(|f| {
                f.parse::<FormatPreset>()
                    .map_err(|_| ValidationError::UnknownFormat(f.to_string()))
            })
            .transpose()?;
        Ok((url, format))
    }

    /// Register a new pending job.
    pub async fn create(&self, request: &SubmitRequest) -> Job {
        let folder_id = request
            .folder_id
            .clone()
            .filter(|f| !f.trim().is_empty())
            .or_else(|| self.config.folder_id.clone());
        let mut job = Job::new(
            request.url.as_str(),
            request.format.unwrap_or(self.config.default_format).key(),
            folder_id,
            request.share_public.unwrap_or(self.config.share_public),
        );
        job.ffmpeg_location = request.ffmpeg_location.clone();
        self.jobs.write().await.insert(job.id, job.clone());
        info!(job_id = %job.id, url = %job.url, "job created");
        job
    }

    pub async fn get(&self, id: Uuid) -> JobResult<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(JobError::NotFound(id))
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Apply `change` to a job under the registry lock and return the result.
    async fn update<F>(&self, id: Uuid, change: F) -> JobResult<Job>
    where
        F: FnOnce(&mut Job) -> Result<(), InvalidTransition>,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        change(job)?;
        job.touch();
        Ok(job.clone())
    }

    /// Run a job to completion and wait for the outcome.
    ///
    /// The work happens on a separate task: dropping this future stops the
    /// wait, not the job, which still ends `complete` or `failed`.
    pub async fn process(&self, id: Uuid, url: Url) -> JobResult<Job> {
        let service = self.clone();
        let handle = tokio::spawn(async move { service.run(id, url).await });
        match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => {
                let err = JobError::Interrupted(join_err.to_string());
                error!(job_id = %id, "{}", err);
                let message = err.to_string();
                self.update(id, |job| {
                    job.fail(message);
                    Ok(())
                })
                .await?;
                Err(err)
            }
        }
    }

    /// Start a job on a background task without waiting for it.
    pub fn spawn(&self, id: Uuid, url: Url) {
        let service = self.clone();
        tokio::spawn(async move {
            // Outcome is recorded on the job itself.
            let _ = service.run(id, url).await;
        });
    }

    /// The pipeline bounded by the job timeout. Whatever happens, the job
    /// ends `complete` or `failed`.
    async fn run(&self, id: Uuid, url: Url) -> JobResult<Job> {
        let span = info_span!("job", job_id = %id);
        async move {
            let limit = self.config.job_timeout;
            let outcome = match timeout(limit, self.pipeline(id, url)).await {
                Ok(result) => result,
                Err(_) => Err(JobError::Timeout(limit.as_secs())),
            };

            match outcome {
                Ok(job) => {
                    info!(status = %job.status, link = ?job.link, "job finished");
                    Ok(job)
                }
                Err(err) => {
                    error!("job failed: {}", err);
                    let message = err.to_string();
                    // A missing job cannot be marked; anything else is recorded.
                    if !matches!(err, JobError::NotFound(_)) {
                        self.update(id, |job| {
                            job.fail(message);
                            Ok(())
                        })
                        .await?;
                    }
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn pipeline(&self, id: Uuid, url: Url) -> JobResult<Job> {
        let job = self.update(id, |job| job.advance(JobStatus::Downloading)).await?;
        let format = job
            .format
            .parse::<FormatPreset>()
            .unwrap_or(self.config.default_format);

        let request = DownloadRequest {
            url,
            output_dir: self.config.output_dir.join(id.to_string()),
            format,
            ffmpeg_location: job.ffmpeg_location.clone(),
        };
        let file = self.downloader.download(&request).await?;
        debug!(file = %file.path.display(), size = file.size_bytes, "downloaded");

        let job = self
            .update(id, |job| {
                job.output_file = Some(file.path.clone());
                job.file_name = Some(file.file_name.clone());
                job.size_bytes = Some(file.size_bytes);
                Ok(())
            })
            .await?;

        let Some(uploader) = &self.uploader else {
            return self.update(id, |job| job.advance(JobStatus::Complete)).await;
        };

        self.update(id, |job| job.advance(JobStatus::Uploading)).await?;
        let share = uploader
            .upload(&file.path, job.folder_id.as_deref(), job.share_public)
            .await?;

        self.update(id, |job| {
            job.link = Some(share.view_url.clone());
            job.download_link = Some(share.download_url.clone());
            job.remote_file_id = Some(share.file_id.clone());
            job.warning = share.sharing_warning.clone();
            job.advance(JobStatus::Complete)
        })
        .await
    }

    /// Claim a finished job's file for one client.
    ///
    /// Only one delivery runs at a time. With `auto_delete` the file may be
    /// fetched once; without it the job stays downloadable until a later
    /// fetch or a cleanup consumes it.
    pub async fn begin_delivery(&self, id: Uuid, auto_delete: bool) -> JobResult<Delivery> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;

        match job.delivery {
            DeliveryState::Delivered => return Err(JobError::AlreadyDelivered(id)),
            DeliveryState::Delivering => {
                return Err(JobError::FileBusy(
                    "file is being delivered to another request".into(),
                ));
            }
            DeliveryState::Downloaded if auto_delete => {
                return Err(JobError::FileBusy(
                    "file was already downloaded; fetch again with auto_delete=false".into(),
                ));
            }
            DeliveryState::Ready | DeliveryState::Downloaded => {}
        }
        if job.status != JobStatus::Complete {
            return Err(JobError::FileBusy(format!(
                "job is {}, file not available",
                job.status
            )));
        }
        if job.output_file.is_none() {
            return Err(JobError::FileGone(id));
        }

        let previous = job.delivery;
        job.delivery = DeliveryState::Delivering;
        job.touch();
        debug!(job_id = %id, auto_delete, "delivery started");
        Ok(Delivery {
            service: self.clone(),
            job: job.clone(),
            previous,
            auto_delete,
            settled: false,
        })
    }

    async fn set_delivery(&self, id: Uuid, state: DeliveryState) -> JobResult<Job> {
        self.update(id, |job| {
            job.delivery = state;
            Ok(())
        })
        .await
    }

    /// Delete a job's local file and remote object. The job record and its
    /// status are kept; only the artifact fields are cleared. A finished job's
    /// file counts as delivered afterwards.
    pub async fn cleanup(&self, id: Uuid) -> JobResult<CleanupReport> {
        let job = self.get(id).await?;
        let mut report = CleanupReport::default();

        if let Some(path) = &job.output_file {
            report.local_removed = remove_local(path).await;
            let job_dir = self.config.output_dir.join(id.to_string());
            if let Err(err) = fs::remove_dir(&job_dir).await {
                if err.kind() != ErrorKind::NotFound {
                    debug!("leaving {}: {}", job_dir.display(), err);
                }
            }
        }

        if let (Some(file_id), Some(uploader)) = (&job.remote_file_id, &self.uploader) {
            match uploader.delete(file_id).await {
                Ok(()) => report.remote_removed = true,
                Err(err) => {
                    warn!(job_id = %id, file_id = %file_id, "remote delete failed: {}", err);
                    report.remote_error = Some(err.to_string());
                }
            }
        }

        let remote_removed = report.remote_removed;
        self.update(id, |job| {
            job.output_file = None;
            if job.status == JobStatus::Complete {
                job.delivery = DeliveryState::Delivered;
            }
            if remote_removed {
                job.remote_file_id = None;
                job.link = None;
                job.download_link = None;
            }
            Ok(())
        })
        .await?;

        info!(job_id = %id, ?report, "job cleaned up");
        Ok(report)
    }
}

/// An in-flight file delivery, from `JobService::begin_delivery`.
///
/// Settle it with `finish` or `abort`. Dropped unsettled (the client went
/// away mid-stream), the job returns to its previous delivery state.
pub struct Delivery {
    service: JobService,
    job: Job,
    previous: DeliveryState,
    auto_delete: bool,
    settled: bool,
}

impl Delivery {
    /// The job as it was when the delivery started.
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// The file reached the client: consume it, or mark it downloaded.
    pub async fn finish(mut self) -> JobResult<Job> {
        let id = self.job.id;
        let state = if self.auto_delete {
            self.service.cleanup(id).await?;
            DeliveryState::Delivered
        } else {
            DeliveryState::Downloaded
        };
        let job = self.service.set_delivery(id, state).await?;
        self.settled = true;
        Ok(job)
    }

    /// The file could not be sent; a later request may try again.
    pub async fn abort(mut self) {
        self.settled = true;
        if let Err(err) = self.service.set_delivery(self.job.id, self.previous).await {
            warn!(job_id = %self.job.id, "could not release delivery: {}", err);
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let (service, id, previous) = (self.service.clone(), self.job.id, self.previous);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    debug!(job_id = %id, restored = previous.as_str(), "delivery abandoned");
                    let _ = service.set_delivery(id, previous).await;
                });
            }
            Err(_) => warn!(job_id = %id, "delivery abandoned outside a runtime"),
        }
    }
}

async fn remove_local(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => {
            warn!("failed to remove {}: {}", path.display(), err);
            false
        }
    }
}
