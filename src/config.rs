use clap::Parser;
use std::{
    env, fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::services::downloader::FormatPreset;

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
    #[error(
        "no Google Drive credentials found (set GOOGLE_OAUTH_TOKEN_* or GOOGLE_SERVICE_ACCOUNT_*, or disable uploads)"
    )]
    MissingCredentials,
    #[error("invalid {kind} credentials from {source_name}: {reason}")]
    InvalidCredentials {
        kind: &'static str,
        source_name: String,
        reason: String,
    },
    #[error("ffmpeg location `{}` does not exist", .0.display())]
    FfmpegNotFound(PathBuf),
    #[error("reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where Drive credentials may come from. Each field holds the raw value of
/// the matching environment variable.
#[derive(Clone, Default)]
pub struct CredentialSources {
    pub oauth_token_base64: Option<String>,
    pub oauth_token_json: Option<String>,
    pub oauth_token_file: Option<String>,
    pub service_account_base64: Option<String>,
    pub service_account_json: Option<String>,
    pub service_account_file: Option<String>,
    /// Directory searched for `token.json` / `service_account.json` when no
    /// variable is set.
    pub default_dir: PathBuf,
}

// Raw values may be inline secrets; only report which sources are set.
impl fmt::Debug for CredentialSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |value: &Option<String>| value.is_some();
        f.debug_struct("CredentialSources")
            .field("oauth_token_base64", &set(&self.oauth_token_base64))
            .field("oauth_token_json", &set(&self.oauth_token_json))
            .field("oauth_token_file", &self.oauth_token_file)
            .field("service_account_base64", &set(&self.service_account_base64))
            .field("service_account_json", &set(&self.service_account_json))
            .field("service_account_file", &set(&self.service_account_file))
            .field("default_dir", &self.default_dir)
            .finish()
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub output_dir: PathBuf,
    pub folder_id: Option<String>,
    pub share_public: bool,
    pub upload_enabled: bool,
    pub default_format: FormatPreset,
    pub yt_dlp_path: String,
    pub ffmpeg_location: Option<PathBuf>,
    /// Source hosts accepted by `POST /download`. Empty means any host.
    pub allowed_hosts: Vec<String>,
    pub job_timeout: Duration,
    pub credentials: CredentialSources,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Video download relay with Google Drive upload")]
pub struct Args {
    /// Host to bind to (overrides HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Scratch directory for downloads (overrides OUTPUT_DIR)
    #[arg(long)]
    pub output_dir: Option<PathBuf>,

    /// Drive folder receiving uploads (overrides GOOGLE_DRIVE_FOLDER_ID)
    #[arg(long)]
    pub folder_id: Option<String>,

    /// Keep files local and skip Drive entirely
    #[arg(long)]
    pub no_upload: bool,

    /// Download (and upload) a single URL, print the job as JSON and exit
    #[arg(long, value_name = "URL")]
    pub fetch: Option<String>,
}

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 30 * 60;
const DEFAULT_FFMPEG_DIR: &str = "ffmpeg/bin";

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the optional
    /// one-shot URL.
    pub fn from_env_and_args() -> Result<(Self, Option<String>), ConfigError> {
        let mut args = Args::parse();
        let fetch = args.fetch.take();
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, fetch))
    }

    /// Build the configuration from parsed args and an environment lookup.
    pub fn from_sources<F>(args: Args, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        // --- Environment fallback ---
        let env_port = match var("PORT") {
            Some(value) => value.parse::<u16>().map_err(|err| ConfigError::InvalidValue {
                name: "PORT",
                reason: err.to_string(),
                value,
            })?,
            None => DEFAULT_PORT,
        };
        let share_public = match var("GOOGLE_DRIVE_SHARE_PUBLIC") {
            Some(value) => parse_flag("GOOGLE_DRIVE_SHARE_PUBLIC", &value)?,
            None => true,
        };
        let env_upload = match var("DRIVE_UPLOAD_ENABLED") {
            Some(value) => parse_flag("DRIVE_UPLOAD_ENABLED", &value)?,
            None => true,
        };
        let default_format = match var("DOWNLOAD_FORMAT") {
            Some(value) => value
                .parse::<FormatPreset>()
                .map_err(|reason| ConfigError::InvalidValue {
                    name: "DOWNLOAD_FORMAT",
                    value,
                    reason,
                })?,
            None => FormatPreset::Auto,
        };
        let job_timeout = match var("JOB_TIMEOUT_SECS") {
            Some(value) => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                Ok(_) => {
                    return Err(ConfigError::InvalidValue {
                        name: "JOB_TIMEOUT_SECS",
                        value,
                        reason: "must be greater than zero".into(),
                    });
                }
                Err(err) => {
                    return Err(ConfigError::InvalidValue {
                        name: "JOB_TIMEOUT_SECS",
                        reason: err.to_string(),
                        value,
                    });
                }
            },
            None => Duration::from_secs(DEFAULT_JOB_TIMEOUT_SECS),
        };
        let allowed_hosts = var("ALLOWED_HOSTS")
            .map(|raw| {
                raw.split(',')
                    .map(|h| h.trim().trim_start_matches('.').to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let ffmpeg_location = resolve_ffmpeg_location(var("FFMPEG_LOCATION").as_deref())?;

        let credentials = CredentialSources {
            oauth_token_base64: var("GOOGLE_OAUTH_TOKEN_JSON_BASE64"),
            oauth_token_json: var("GOOGLE_OAUTH_TOKEN_JSON"),
            oauth_token_file: var("GOOGLE_OAUTH_TOKEN_FILE"),
            service_account_base64: var("GOOGLE_SERVICE_ACCOUNT_JSON_BASE64"),
            service_account_json: var("GOOGLE_SERVICE_ACCOUNT_JSON"),
            service_account_file: var("GOOGLE_SERVICE_ACCOUNT_FILE"),
            default_dir: var("CREDENTIALS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("credentials")),
        };

        // --- Merge ---
        Ok(Self {
            host: args
                .host
                .or_else(|| var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.unwrap_or(env_port),
            output_dir: args
                .output_dir
                .or_else(|| var("OUTPUT_DIR").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from("./downloads")),
            folder_id: args.folder_id.or_else(|| var("GOOGLE_DRIVE_FOLDER_ID")),
            share_public,
            upload_enabled: env_upload && !args.no_upload,
            default_format,
            yt_dlp_path: var("YT_DLP_PATH").unwrap_or_else(|| "yt-dlp".into()),
            ffmpeg_location,
            allowed_hosts,
            job_timeout,
            credentials,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
            reason: "expected one of 1/true/yes/on or 0/false/no/off".into(),
        }),
    }
}

/// Directory holding the ffmpeg binaries, if any.
///
/// An explicit location may name the binary itself or its directory. Without
/// one, `./ffmpeg/bin` is used when present.
pub fn resolve_ffmpeg_location(custom: Option<&str>) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(raw) = custom {
        let candidate = Path::new(raw);
        if candidate.is_file() {
            return Ok(candidate.parent().map(Path::to_path_buf));
        }
        if candidate.is_dir() {
            return Ok(Some(candidate.to_path_buf()));
        }
        return Err(ConfigError::FfmpegNotFound(candidate.to_path_buf()));
    }

    let default = Path::new(DEFAULT_FFMPEG_DIR);
    Ok(default.is_dir().then(|| default.to_path_buf()))
}
