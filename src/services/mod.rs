pub mod credential_loader;
pub mod downloader;
pub mod job_service;
pub mod token_provider;
pub mod uploader;

#[cfg(test)]
mod fake_drive;
