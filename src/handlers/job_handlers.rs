//! HTTP handlers for download jobs.
//! Validation and orchestration live in `JobService`; these handlers only
//! translate between HTTP and the service.

use crate::{
    config::resolve_ffmpeg_location,
    errors::AppError,
    models::job::{Job, JobStatus},
    services::{
        downloader::FormatPreset,
        job_service::{JobService, SubmitRequest},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures::{StreamExt, future, stream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{io, path::PathBuf};
use tokio::{fs::File, io::AsyncReadExt};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

/// Body of `POST /download`.
#[derive(Debug, Deserialize)]
pub struct DownloadBody {
    pub url: Option<String>,
    pub folder_id: Option<String>,
    pub public: Option<bool>,
    pub format: Option<String>,
    /// ffmpeg binary or directory for this job, instead of the configured one.
    pub ffmpeg_location: Option<String>,
    /// Return `202` right away and run the job on a background task.
    #[serde(default)]
    pub background: bool,
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    #[serde(default)]
    pub as_base64: bool,
    /// Delete the local file and the Drive copy once the file was sent.
    #[serde(default = "default_auto_delete")]
    pub auto_delete: bool,
}

fn default_auto_delete() -> bool {
    true
}

/// A job as returned to clients, with absolute links back into the API.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    #[serde(flatten)]
    pub job: Job,
    pub status_url: String,
    pub file_url: Option<String>,
}

impl JobResponse {
    pub fn new(mut job: Job, headers: &HeaderMap) -> Self {
        let status_url = absolute_url(headers, &format!("/status/{}", job.id));
        let file_url = job
            .output_file
            .as_ref()
            .map(|_| absolute_url(headers, &format!("/download/{}/file", job.id)));
        // Without Drive the local file is the shareable link.
        if job.link.is_none() && job.status == JobStatus::Complete {
            job.link = file_url.clone();
        }
        Self {
            job,
            status_url,
            file_url,
        }
    }
}

/// `POST /download`
///
/// Runs the job inline and answers with its final state, unless `background`
/// is set.
pub async fn submit_download(
    State(service): State<JobService>,
    headers: HeaderMap,
    payload: Result<Json<DownloadBody>, JsonRejection>,
) -> Result<(StatusCode, Json<JobResponse>), AppError> {
    let Json(body) = payload.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;
    let (url, format) = service.validate(body.url.as_deref(), body.format.as_deref())?;
    let ffmpeg_location = request_ffmpeg_location(body.ffmpeg_location.as_deref())?;

    let request = SubmitRequest {
        url,
        folder_id: body.folder_id,
        share_public: body.public,
        format,
        ffmpeg_location,
    };
    let job = service.create(&request).await;
    let job_id = job.id;

    if body.background {
        service.spawn(job_id, request.url);
        return Ok((StatusCode::ACCEPTED, Json(JobResponse::new(job, &headers))));
    }

    let job = service
        .process(job_id, request.url)
        .await
        .map_err(|err| AppError::from(err).with_job(job_id))?;
    Ok((StatusCode::OK, Json(JobResponse::new(job, &headers))))
}

/// `GET /status/{job_id}`
pub async fn job_status(
    State(service): State<JobService>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let job = service.get(parse_job_id(&job_id)?).await?;
    Ok(Json(JobResponse::new(job, &headers)))
}

/// `GET /jobs`
pub async fn list_jobs(State(service): State<JobService>, headers: HeaderMap) -> impl IntoResponse {
    let jobs: Vec<JobResponse> = service
        .list()
        .await
        .into_iter()
        .map(|job| JobResponse::new(job, &headers))
        .collect();
    Json(json!({ "jobs": jobs }))
}

/// `GET /formats`
pub async fn list_formats(State(service): State<JobService>) -> impl IntoResponse {
    let formats: Vec<_> = FormatPreset::ALL
        .iter()
        .map(|preset| {
            json!({
                "key": preset.key(),
                "label": preset.label(),
                "selector": preset.selector(),
            })
        })
        .collect();
    Json(json!({
        "formats": formats,
        "default": service.config().default_format.key(),
    }))
}

/// `GET /download/{job_id}/file` (also `/jobs/{job_id}/file`)
///
/// Streams the downloaded file, or wraps it in base64 JSON when
/// `as_base64=true`. With `auto_delete` (the default) the local file and the
/// Drive copy are removed once the client has it, and later fetches get `410`.
pub async fn job_file(
    State(service): State<JobService>,
    Path(job_id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Result<Response, AppError> {
    let job_id = parse_job_id(&job_id)?;
    let delivery = service
        .begin_delivery(job_id, query.auto_delete)
        .await
        .map_err(|err| AppError::from(err).with_job(job_id))?;
    let gone = || AppError::not_found("file no longer available").with_job(job_id);

    let job = delivery.job();
    let Some(path) = job.output_file.clone() else {
        delivery.abort().await;
        return Err(gone());
    };
    let file_name = job
        .file_name
        .clone()
        .or_else(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "download".into());
    let mime_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();

    let opened = match File::open(&path).await {
        Ok(file) => file.metadata().await.map(|meta| (file, meta.len())),
        Err(err) => Err(err),
    };
    let (mut file, size) = match opened {
        Ok(opened) => opened,
        Err(err) => {
            delivery.abort().await;
            return Err(if err.kind() == io::ErrorKind::NotFound {
                gone()
            } else {
                AppError::internal(err.to_string()).with_job(job_id)
            });
        }
    };

    if query.as_base64 {
        let mut bytes = Vec::with_capacity(size as usize);
        if let Err(err) = file.read_to_end(&mut bytes).await {
            delivery.abort().await;
            return Err(AppError::internal(err.to_string()).with_job(job_id));
        }
        delivery
            .finish()
            .await
            .map_err(|err| AppError::from(err).with_job(job_id))?;
        let body = Json(json!({
            "filename": file_name,
            "size": size,
            "mime_type": mime_type,
            "data": general_purpose::STANDARD.encode(bytes),
        }));
        return Ok(body.into_response());
    }

    // Settles the delivery after the last chunk. If the client disconnects
    // first, the stream is dropped unfinished and the delivery is released.
    let settle = stream::once(async move {
        if let Err(err) = delivery.finish().await {
            warn!(%job_id, "delivery bookkeeping failed: {}", err);
        }
    })
    .filter_map(|()| future::ready(None::<io::Result<Bytes>>));
    let stream = ReaderStream::new(file).chain(settle);
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &file_name, &mime_type, size);
    Ok(response)
}

/// `DELETE /cleanup/{job_id}`
pub async fn cleanup_job(
    State(service): State<JobService>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let job_id = parse_job_id(&job_id)?;
    let report = service.cleanup(job_id).await?;
    info!(%job_id, "cleanup requested");
    Ok(Json(json!({
        "job_id": job_id,
        "local_removed": report.local_removed,
        "remote_removed": report.remote_removed,
        "remote_error": report.remote_error,
    })))
}

/// A blank value means "use the configured location".
fn request_ffmpeg_location(raw: Option<&str>) -> Result<Option<PathBuf>, AppError> {
    match raw.map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => resolve_ffmpeg_location(Some(raw))
            .map_err(|err| AppError::bad_request(err.to_string())),
        None => Ok(None),
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::bad_request(format!("invalid job id `{}`", raw)))
}

fn set_file_headers(headers: &mut HeaderMap, file_name: &str, mime_type: &str, size: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 UTF-8 name.
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let encoded: String =
        url::form_urlencoded::byte_serialize(file_name.as_bytes()).collect::<String>();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        encoded.replace('+', "%20")
    )
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        // Proxies may append their own value; the first one is the client's.
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Absolute URL for `path`, honouring `X-Forwarded-*` headers.
///
/// A forwarded host is used verbatim. Otherwise a forwarded port replaces
/// whatever port the `Host` header carried.
pub fn absolute_url(headers: &HeaderMap, path: &str) -> String {
    let proto = header_str(headers, "x-forwarded-proto").unwrap_or("http");
    let authority = match header_str(headers, "x-forwarded-host") {
        Some(forwarded) => forwarded.to_string(),
        None => {
            let host = header_str(headers, header::HOST.as_str()).unwrap_or("localhost");
            match header_str(headers, "x-forwarded-port") {
                Some(port) => format!("{}:{}", host_name(host), port),
                None => host.to_string(),
            }
        }
    };
    format!("{}://{}{}", proto, authority, path)
}

/// `host[:port]` without the port. IPv6 literals keep their brackets.
fn host_name(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    host.split_once(':').map_or(host, |(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn absolute_url_uses_host_header() {
        let h = headers(&[("host", "relay.local:8000")]);
        assert_eq!(absolute_url(&h, "/status/1"), "http://relay.local:8000/status/1");
        assert_eq!(absolute_url(&HeaderMap::new(), "/x"), "http://localhost/x");
    }

    #[test]
    fn forwarded_host_is_used_verbatim() {
        let h = headers(&[
            ("host", "10.0.0.5:8000"),
            ("x-forwarded-proto", "https, http"),
            ("x-forwarded-host", "relay.example.com"),
            ("x-forwarded-port", "443"),
        ]);
        assert_eq!(
            absolute_url(&h, "/download/1/file"),
            "https://relay.example.com/download/1/file"
        );

        let h = headers(&[
            ("x-forwarded-host", "relay.example.com"),
            ("x-forwarded-port", "8443"),
            ("x-forwarded-proto", "https"),
        ]);
        assert_eq!(absolute_url(&h, "/"), "https://relay.example.com/");

        let h = headers(&[("x-forwarded-host", "relay.example.com:9000")]);
        assert_eq!(absolute_url(&h, "/"), "http://relay.example.com:9000/");
    }

    #[test]
    fn forwarded_port_replaces_the_host_port() {
        let h = headers(&[("host", "relay.local:8000"), ("x-forwarded-port", "443")]);
        assert_eq!(absolute_url(&h, "/status/1"), "http://relay.local:443/status/1");

        let h = headers(&[
            ("host", "relay.local"),
            ("x-forwarded-proto", "https"),
            ("x-forwarded-port", "8443"),
        ]);
        assert_eq!(absolute_url(&h, "/"), "https://relay.local:8443/");

        let h = headers(&[("host", "[::1]:8000"), ("x-forwarded-port", "9000")]);
        assert_eq!(absolute_url(&h, "/"), "http://[::1]:9000/");
    }

    #[test]
    fn blank_ffmpeg_location_falls_back_to_config() {
        assert_eq!(request_ffmpeg_location(None).unwrap(), None);
        assert_eq!(request_ffmpeg_location(Some("  ")).unwrap(), None);

        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().to_string_lossy().into_owned();
        assert_eq!(
            request_ffmpeg_location(Some(&raw)).unwrap(),
            Some(dir.path().to_path_buf())
        );

        let err = request_ffmpeg_location(Some("/no/such/ffmpeg")).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn content_disposition_escapes_names() {
        assert_eq!(
            content_disposition("clip.mp4"),
            "attachment; filename=\"clip.mp4\"; filename*=UTF-8''clip.mp4"
        );
        let value = content_disposition("my \"vidéo\".mp4");
        assert!(value.starts_with("attachment; filename=\"my _vid_o_.mp4\""));
        assert!(value.ends_with("filename*=UTF-8''my%20%22vid%C3%A9o%22.mp4"));
        assert!(HeaderValue::from_str(&value).is_ok());
    }
}
