//! Core data models for the download relay service.
//!
//! A `Job` tracks one client request through download and upload. The
//! credential and media types describe what flows between the service and
//! its two external collaborators (yt-dlp and Google Drive).

pub mod credentials;
pub mod job;
pub mod media;
