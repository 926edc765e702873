//! Download side of the pipeline: URL validation, format presets and the
//! `yt-dlp` subprocess adapter.

use async_trait::async_trait;
use std::{
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tokio::{fs, process::Command, time::timeout};
use tracing::{debug, info, warn};
use url::Url;

use crate::models::media::FileResult;

/// Malformed client input. Reported to the caller as a 400.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("url is required")]
    MissingUrl,
    #[error("invalid url")]
    InvalidUrl,
    #[error("unsupported host `{0}`")]
    UnsupportedHost(String),
    #[error("unknown format `{0}` (supported: auto, merge_best, video_only, audio_only)")]
    UnknownFormat(String),
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("downloader `{0}` is not installed")]
    ToolMissing(String),
    #[error("download exceeded {0}s")]
    Timeout(u64),
    #[error("extraction failed: {0}")]
    Extraction(String),
    #[error("downloaded file not found in {}", .0.display())]
    MissingOutput(PathBuf),
    #[error("downloaded file {} is empty", .0.display())]
    EmptyOutput(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Named yt-dlp format selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatPreset {
    Auto,
    MergeBest,
    VideoOnly,
    AudioOnly,
}

impl FormatPreset {
    pub const ALL: [FormatPreset; 4] = [
        FormatPreset::Auto,
        FormatPreset::MergeBest,
        FormatPreset::VideoOnly,
        FormatPreset::AudioOnly,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            FormatPreset::Auto => "auto",
            FormatPreset::MergeBest => "merge_best",
            FormatPreset::VideoOnly => "video_only",
            FormatPreset::AudioOnly => "audio_only",
        }
    }

    /// Format expression passed to `yt-dlp -f`.
    pub fn selector(&self) -> &'static str {
        match self {
            FormatPreset::Auto => "best",
            FormatPreset::MergeBest => "bv*+ba/best",
            FormatPreset::VideoOnly => "bv*",
            FormatPreset::AudioOnly => "ba/best",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FormatPreset::Auto => "Best (single file)",
            FormatPreset::MergeBest => "Best video + audio (requires ffmpeg)",
            FormatPreset::VideoOnly => "Video only",
            FormatPreset::AudioOnly => "Audio only",
        }
    }
}

impl FromStr for FormatPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FormatPreset::ALL
            .into_iter()
            .find(|preset| preset.key() == s)
            .ok_or_else(|| format!("unknown format preset `{}`", s))
    }
}

impl fmt::Display for FormatPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Parse and check a client-supplied source URL.
///
/// Accepts only absolute `http`/`https` URLs with a host. When
/// `allowed_hosts` is non-empty the host must equal one of the entries or be
/// a subdomain of one.
pub fn validate_source_url(raw: &str, allowed_hosts: &[String]) -> Result<Url, ValidationError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ValidationError::MissingUrl);
    }

    let url = Url::parse(raw).map_err(|_| ValidationError::InvalidUrl)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidUrl);
    }
    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host.to_ascii_lowercase(),
        _ => return Err(ValidationError::InvalidUrl),
    };

    if !allowed_hosts.is_empty()
        && !allowed_hosts
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
    {
        return Err(ValidationError::UnsupportedHost(host));
    }

    Ok(url)
}

/// One unit of work for a `Downloader`.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: Url,
    /// Destination directory. Callers give every job its own directory.
    pub output_dir: PathBuf,
    pub format: FormatPreset,
    /// Overrides the downloader's own ffmpeg location for this request.
    pub ffmpeg_location: Option<PathBuf>,
}

/// The external download capability: given a URL, produce a local file.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, request: &DownloadRequest) -> Result<FileResult, DownloadError>;
}

/// `Downloader` backed by the `yt-dlp` command line tool.
#[derive(Debug, Clone)]
pub struct YtDlpDownloader {
    binary: String,
    ffmpeg_location: Option<PathBuf>,
    timeout: Duration,
}

const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
const UNFINISHED_SUFFIXES: [&str; 4] = [".part", ".ytdl", ".temp", ".tmp"];

impl YtDlpDownloader {
    pub fn new(
        binary: impl Into<String>,
        ffmpeg_location: Option<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            ffmpeg_location,
            timeout,
        }
    }

    /// Command line for a single download. The final file path is printed on
    /// stdout once post-processing is done.
    fn build_args(&self, request: &DownloadRequest) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-progress".to_string(),
            "--no-warnings".to_string(),
            "--restrict-filenames".to_string(),
            "-f".to_string(),
            request.format.selector().to_string(),
            "-o".to_string(),
            request
                .output_dir
                .join(OUTPUT_TEMPLATE)
                .to_string_lossy()
                .into_owned(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
        ];
        let ffmpeg_location = request
            .ffmpeg_location
            .as_ref()
            .or(self.ffmpeg_location.as_ref());
        if let Some(ffmpeg) = ffmpeg_location {
            args.push("--ffmpeg-location".to_string());
            args.push(ffmpeg.to_string_lossy().into_owned());
        }
        args.push(request.url.to_string());
        args
    }
}

#[async_trait]
impl Downloader for YtDlpDownloader {
    async fn download(&self, request: &DownloadRequest) -> Result<FileResult, DownloadError> {
        fs::create_dir_all(&request.output_dir).await?;

        let args = self.build_args(request);
        debug!(binary = %self.binary, ?args, "running downloader");

        let mut command = Command::new(&self.binary);
        command.args(&args).kill_on_drop(true);
        let output = timeout(self.timeout, command.output())
            .await
            .map_err(|_| DownloadError::Timeout(self.timeout.as_secs()))?
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    DownloadError::ToolMissing(self.binary.clone())
                } else {
                    DownloadError::Io(err)
                }
            })?;

        if !output.status.success() {
            let message = extraction_message(&output.stderr);
            warn!(url = %request.url, status = ?output.status, "downloader failed: {}", message);
            return Err(DownloadError::Extraction(message));
        }

        let printed = last_line(&output.stdout);
        let path = resolve_downloaded_file(&request.output_dir, printed.as_deref()).await?;
        let result = file_result_for(&path).await?;
        info!(
            url = %request.url,
            file = %result.path.display(),
            size = result.size_bytes,
            "download finished"
        );
        Ok(result)
    }
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string)
}

/// Most useful line of yt-dlp's stderr, without the `ERROR:` tag.
fn extraction_message(stderr: &[u8]) -> String {
    let line = last_line(stderr).unwrap_or_else(|| "downloader exited with an error".into());
    line.strip_prefix("ERROR:")
        .map(str::trim)
        .unwrap_or(line.as_str())
        .to_string()
}

/// Locate the finished media file.
///
/// Tries the path yt-dlp printed (absolute or relative to `dir`), then the
/// same name without a `.fNNN` format tag, then the largest finished file in
/// `dir`.
pub async fn resolve_downloaded_file(
    dir: &Path,
    printed: Option<&str>,
) -> Result<PathBuf, DownloadError> {
    if let Some(printed) = printed {
        let printed = Path::new(printed);
        let candidates = [printed.to_path_buf(), dir.join(printed)];
        for candidate in candidates {
            if is_file(&candidate).await {
                return Ok(fs::canonicalize(&candidate).await?);
            }
            if let Some(stripped) = strip_format_tag(&candidate) {
                if is_file(&stripped).await {
                    return Ok(fs::canonicalize(&stripped).await?);
                }
            }
        }
        debug!("printed path {} not found, scanning {}", printed.display(), dir.display());
    }

    let mut best: Option<(u64, PathBuf)> = None;
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(DownloadError::MissingOutput(dir.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') || UNFINISHED_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        if best.as_ref().is_none_or(|(size, _)| meta.len() > *size) {
            best = Some((meta.len(), entry.path()));
        }
    }

    match best {
        Some((_, path)) => Ok(fs::canonicalize(&path).await?),
        None => Err(DownloadError::MissingOutput(dir.to_path_buf())),
    }
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// `clip.f137.mp4` → `clip.mp4`.
fn strip_format_tag(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;
    let (stem, ext) = name.rsplit_once('.')?;
    let (base, tag) = stem.rsplit_once('.')?;
    let digits = tag.strip_prefix('f')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(path.with_file_name(format!("{}.{}", base, ext)))
}

/// Build a `FileResult` for an existing file, rejecting empty ones.
pub async fn file_result_for(path: &Path) -> Result<FileResult, DownloadError> {
    let meta = fs::metadata(path).await.map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            DownloadError::MissingOutput(path.to_path_buf())
        } else {
            DownloadError::Io(err)
        }
    })?;
    if meta.len() == 0 {
        return Err(DownloadError::EmptyOutput(path.to_path_buf()));
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mime_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();

    Ok(FileResult {
        path: path.to_path_buf(),
        file_name,
        size_bytes: meta.len(),
        mime_type,
    })
}
