//! Upload side of the pipeline: the `Uploader` trait and its Google Drive
//! adapter.
//!
//! Files go through Drive's resumable protocol in fixed-size chunks. The MD5
//! of the payload is computed while reading and checked against the checksum
//! Drive reports for the finished object.

use async_trait::async_trait;
use bytes::Bytes;
use md5::Context;
use reqwest::{
    Client, Response, StatusCode,
    header::{CONTENT_RANGE, CONTENT_TYPE, HeaderMap, LOCATION, RANGE},
    redirect::Policy,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt},
};
use tracing::{debug, info, warn};

use crate::{
    models::media::ShareResult,
    services::token_provider::{TokenError, TokenProvider},
};

const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;
/// Consecutive `308` replies without progress before the upload is abandoned.
const MAX_STALLED_CHUNKS: u32 = 3;
const FILE_FIELDS: &str = "id,name,size,webViewLink,md5Checksum";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file {} does not exist", .0.display())]
    MissingFile(PathBuf),
    #[error("file {} is empty", .0.display())]
    EmptyFile(PathBuf),
    #[error("drive folder `{0}` not found or not accessible")]
    FolderNotFound(String),
    #[error(
        "drive storage quota exceeded: {0} (service accounts have no quota of their own; share a folder from a user drive or use OAuth credentials)"
    )]
    QuotaExceeded(String),
    #[error("drive authentication failed: {0}")]
    Auth(String),
    #[error("drive rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("checksum mismatch: local {local}, remote {remote}")]
    ChecksumMismatch { local: String, remote: String },
    #[error("drive request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<TokenError> for UploadError {
    fn from(err: TokenError) -> Self {
        UploadError::Auth(err.to_string())
    }
}

/// The external storage capability: given a local file, produce a shared link.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `file` under `folder_id`, optionally granting public read access.
    ///
    /// A failed sharing step is reported through `ShareResult::sharing_warning`;
    /// the uploaded object is kept.
    async fn upload(
        &self,
        file: &Path,
        folder_id: Option<&str>,
        make_public: bool,
    ) -> Result<ShareResult, UploadError>;

    /// Remove a previously uploaded object. Missing objects are not an error.
    async fn delete(&self, file_id: &str) -> Result<(), UploadError>;
}

/// Base URLs of the Drive API. Overridable so tests can point at a local server.
#[derive(Debug, Clone)]
pub struct DriveEndpoints {
    pub upload_base: String,
    pub api_base: String,
}

impl Default for DriveEndpoints {
    fn default() -> Self {
        Self {
            upload_base: "https://www.googleapis.com".into(),
            api_base: "https://www.googleapis.com".into(),
        }
    }
}

/// HTTP client suited to the Drive API.
///
/// Redirects are disabled because the resumable protocol answers `308` for
/// "chunk accepted, send the next one".
pub fn drive_http_client() -> reqwest::Result<Client> {
    Client::builder()
        .redirect(Policy::none())
        .connect_timeout(Duration::from_secs(30))
        .build()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    web_view_link: Option<String>,
    #[serde(default)]
    md5_checksum: Option<String>,
}

/// `Uploader` backed by the Google Drive v3 API.
pub struct DriveUploader {
    http: Client,
    tokens: Arc<TokenProvider>,
    endpoints: DriveEndpoints,
    chunk_size: usize,
}

impl DriveUploader {
    pub fn new(http: Client, tokens: Arc<TokenProvider>, endpoints: DriveEndpoints) -> Self {
        Self {
            http,
            tokens,
            endpoints,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Drive requires chunks to be multiples of 256 KiB except for the last one.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    async fn bearer(&self) -> Result<String, UploadError> {
        Ok(self.tokens.access_token().await?)
    }

    /// Open a resumable session and return its URI.
    async fn start_session(
        &self,
        name: &str,
        mime_type: &str,
        size: u64,
        folder_id: Option<&str>,
    ) -> Result<String, UploadError> {
        let mut metadata = json!({ "name": name, "mimeType": mime_type });
        if let Some(folder) = folder_id {
            metadata["parents"] = json!([folder]);
        }

        let url = format!("{}/upload/drive/v3/files", self.endpoints.upload_base);
        let response = self
            .http
            .post(&url)
            .query(&[
                ("uploadType", "resumable"),
                ("supportsAllDrives", "true"),
                ("fields", FILE_FIELDS),
            ])
            .bearer_auth(self.bearer().await?)
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", size)
            .json(&metadata)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.rejection(response, folder_id).await);
        }
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .ok_or_else(|| UploadError::Rejected {
                status: response.status().as_u16(),
                message: "resumable session without Location header".into(),
            })
    }

    /// Send the file in chunks. Returns the final object and the local MD5.
    async fn send_chunks(
        &self,
        session: &str,
        path: &Path,
        total: u64,
        mime_type: &str,
    ) -> Result<(DriveFile, String), UploadError> {
        let mut file = File::open(path).await?;
        let mut digest = Context::new();
        // Bytes fed to the digest so far; a resent range is not hashed twice.
        let mut hashed: u64 = 0;
        let mut offset: u64 = 0;
        let mut stalled = 0;

        loop {
            let mut chunk = Vec::with_capacity(self.chunk_size);
            (&mut file)
                .take(self.chunk_size as u64)
                .read_to_end(&mut chunk)
                .await?;
            if chunk.is_empty() {
                return Err(UploadError::Io(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("{} shrank during upload", path.display()),
                )));
            }
            let end = offset + chunk.len() as u64 - 1;
            if end >= hashed {
                let fresh = hashed.saturating_sub(offset) as usize;
                digest.consume(&chunk[fresh..]);
                hashed = end + 1;
            }

            debug!(session, offset, end, total, "uploading chunk");
            let response = self
                .http
                .put(session)
                .bearer_auth(self.bearer().await?)
                .header(CONTENT_TYPE, mime_type)
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end, total))
                .body(Bytes::from(chunk))
                .send()
                .await?;

            match response.status() {
                StatusCode::PERMANENT_REDIRECT => {
                    // Drive may keep less than it was sent; resume after what it has.
                    let next = persisted_bytes(response.headers());
                    if next >= total {
                        return Err(self.rejection(response, None).await);
                    }
                    if next <= offset {
                        stalled += 1;
                        if stalled >= MAX_STALLED_CHUNKS {
                            return Err(UploadError::Rejected {
                                status: StatusCode::PERMANENT_REDIRECT.as_u16(),
                                message: format!("upload made no progress past byte {}", next),
                            });
                        }
                    } else {
                        stalled = 0;
                    }
                    if next != end + 1 {
                        debug!(session, sent = end + 1, persisted = next, "resuming upload");
                        file.seek(SeekFrom::Start(next)).await?;
                    }
                    offset = next;
                }
                status if status.is_success() => {
                    let file: DriveFile = response.json().await?;
                    return Ok((file, format!("{:x}", digest.compute())));
                }
                _ => return Err(self.rejection(response, None).await),
            }
        }
    }

    async fn grant_public_read(&self, file_id: &str) -> Result<(), UploadError> {
        let url = format!(
            "{}/drive/v3/files/{}/permissions",
            self.endpoints.api_base, file_id
        );
        let response = self
            .http
            .post(&url)
            .query(&[("supportsAllDrives", "true"), ("fields", "id")])
            .bearer_auth(self.bearer().await?)
            .json(&json!({ "role": "reader", "type": "anyone" }))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.rejection(response, None).await)
        }
    }

    /// Translate a non-success Drive response into an `UploadError`.
    async fn rejection(&self, response: Response, folder_id: Option<&str>) -> UploadError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = drive_error_message(&body).unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string()
        });

        if body.contains("storageQuotaExceeded") {
            return UploadError::QuotaExceeded(message);
        }
        match (status, folder_id) {
            (StatusCode::UNAUTHORIZED, _) => {
                self.tokens.invalidate().await;
                UploadError::Auth(message)
            }
            (StatusCode::FORBIDDEN, _) => UploadError::Auth(message),
            (StatusCode::NOT_FOUND, Some(folder)) => UploadError::FolderNotFound(folder.into()),
            _ => UploadError::Rejected {
                status: status.as_u16(),
                message,
            },
        }
    }
}

/// `error.message` from a Drive error body.
fn drive_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value["error"]["message"]
        .as_str()
        .or_else(|| value["error"].as_str())
        .map(ToString::to_string)
}

pub fn drive_download_url(file_id: &str) -> String {
    format!("https://drive.google.com/uc?export=download&id={}", file_id)
}

#[async_trait]
impl Uploader for DriveUploader {
    async fn upload(
        &self,
        file: &Path,
        folder_id: Option<&str>,
        make_public: bool,
    ) -> Result<ShareResult, UploadError> {
        let meta = match fs::metadata(file).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Err(UploadError::MissingFile(file.to_path_buf())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(UploadError::MissingFile(file.to_path_buf()));
            }
            Err(err) => return Err(err.into()),
        };
        if meta.len() == 0 {
            return Err(UploadError::EmptyFile(file.to_path_buf()));
        }

        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".into());
        let mime_type = mime_guess::from_path(file)
            .first_or_octet_stream()
            .essence_str()
            .to_string();

        let session = self
            .start_session(&name, &mime_type, meta.len(), folder_id)
            .await?;
        let (remote, local_md5) = self.send_chunks(&session, file, meta.len(), &mime_type).await?;

        if let Some(remote_md5) = &remote.md5_checksum {
            if !remote_md5.eq_ignore_ascii_case(&local_md5) {
                return Err(UploadError::ChecksumMismatch {
                    local: local_md5,
                    remote: remote_md5.clone(),
                });
            }
        }

        let download_url = drive_download_url(&remote.id);
        let mut result = ShareResult {
            file_id: remote.id.clone(),
            view_url: remote
                .web_view_link
                .clone()
                .unwrap_or_else(|| download_url.clone()),
            download_url,
            size_bytes: remote.size.as_deref().and_then(|s| s.parse().ok()),
            md5_checksum: remote.md5_checksum.clone(),
            sharing_warning: None,
        };
        info!(file_id = %result.file_id, name = %name, size = meta.len(), "uploaded to drive");

        if make_public {
            if let Err(err) = self.grant_public_read(&result.file_id).await {
                warn!(file_id = %result.file_id, "public sharing failed: {}", err);
                result.sharing_warning =
                    Some(format!("file uploaded but public sharing failed: {}", err));
            }
        }

        Ok(result)
    }

    async fn delete(&self, file_id: &str) -> Result<(), UploadError> {
        let url = format!("{}/drive/v3/files/{}", self.endpoints.api_base, file_id);
        let response = self
            .http
            .delete(&url)
            .query(&[("supportsAllDrives", "true")])
            .bearer_auth(self.bearer().await?)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                debug!(file_id, "deleted drive object");
                Ok(())
            }
            StatusCode::NOT_FOUND => {
                debug!(file_id, "drive object already gone");
                Ok(())
            }
            _ => Err(self.rejection(response, None).await),
        }
    }
}

/// Bytes Drive holds for a resumable session, from a `Range: bytes=0-N`
/// header. No header means nothing was persisted.
fn persisted_bytes(headers: &HeaderMap) -> u64 {
    headers
        .get(RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(_, last)| last.trim().parse::<u64>().ok())
        .map_or(0, |last| last + 1)
}
