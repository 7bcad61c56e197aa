//! Remote inclusions
//!
//! Inclusions are files downloaded into a service directory before start.
//! Downloads are cached by URL hash so every service of a task shares them.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::service::ServiceRemoteInclusion;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Download failed: {0}")]
    DownloadError(String),

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Deterministic cache location for a URL, keeping the file extension
pub fn cache_path_for_url(url: &str, cache_dir: &Path) -> PathBuf {
    let hash = format!("{:x}", Sha256::digest(url.as_bytes()));

    let extension = url
        .rsplit('/')
        .next()
        .and_then(|filename| filename.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| !ext.is_empty() && !ext.contains('?'))
        .unwrap_or("");

    let filename = if extension.is_empty() {
        hash[..16].to_string()
    } else {
        format!("{}.{}", &hash[..16], extension)
    };

    cache_dir.join(filename)
}

/// Resolve an inclusion destination inside the service directory
///
/// Absolute paths and `..` components are rejected so an inclusion can never
/// write outside its service.
pub fn destination_path(service_dir: &Path, destination: &str) -> Result<PathBuf, FetchError> {
    let relative = Path::new(destination);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));

    if destination.is_empty() || escapes {
        return Err(FetchError::InvalidDestination(destination.to_string()));
    }
    Ok(service_dir.join(relative))
}

pub async fn download_file(url: &str, dest: &Path) -> Result<(), FetchError> {
    let lower = url.to_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return Err(FetchError::InvalidUrl(url.to_string()));
    }

    let response = reqwest::get(url)
        .await
        .map_err(|e| FetchError::DownloadError(e.to_string()))?;

    if !response.status().is_success() {
        return Err(FetchError::DownloadError(format!(
            "HTTP {} for {}",
            response.status(),
            url
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| FetchError::DownloadError(e.to_string()))?;

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, &bytes).await?;
    Ok(())
}

/// Download (or take from cache) an inclusion and copy it into the service
pub async fn include(
    inclusion: &ServiceRemoteInclusion,
    cache_dir: &Path,
    service_dir: &Path,
) -> Result<PathBuf, FetchError> {
    let target = destination_path(service_dir, &inclusion.destination)?;
    let cached = cache_path_for_url(&inclusion.url, cache_dir);

    if !cached.exists() {
        debug!("Downloading inclusion {}", inclusion.url);
        download_file(&inclusion.url, &cached).await?;
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(&cached, &target).await?;
    Ok(target)
}
