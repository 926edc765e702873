//! Results handed back by the download and upload adapters.

use serde::Serialize;
use std::path::PathBuf;

/// A finished download on local disk.
#[derive(Serialize, Clone, Debug)]
pub struct FileResult {
    /// Absolute path of the media file.
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

/// A file stored with the cloud provider.
#[derive(Serialize, Clone, Debug)]
pub struct ShareResult {
    pub file_id: String,
    pub view_url: String,
    pub download_url: String,
    pub size_bytes: Option<u64>,
    pub md5_checksum: Option<String>,

    /// Present when the object was uploaded but public sharing failed.
    pub sharing_warning: Option<String>,
}
