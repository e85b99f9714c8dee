use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("config error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("network error: {url} failed after {attempts} attempt(s): {message}")]
    TransientNetwork {
        url: String,
        attempts: u32,
        message: String,
    },
    #[error("http error: {url} returned HTTP {status}")]
    Http { url: String, status: u16 },
    #[error("no version could be resolved from any source")]
    VersionUnavailable,
    #[error("package download failed: {package}: {reason}")]
    PackageDownloadFailed { package: String, reason: String },
    #[error("archive write failed: {0}")]
    ArchiveWrite(String),
    #[error("resource locked: {}: {message}", path.display())]
    ResourceLocked { path: PathBuf, message: String },
    #[error("install error: {0}")]
    Install(String),
    #[error("process error: {0}")]
    Process(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
}

impl LaunchError {
    /// Failures that abort a deployment attempt outright; nothing after them
    /// may try to launch.
    pub fn is_fatal_deployment(&self) -> bool {
        matches!(
            self,
            LaunchError::Install(_)
                | LaunchError::ResourceLocked { .. }
                | LaunchError::ArchiveWrite(_)
                | LaunchError::PackageDownloadFailed { .. }
        )
    }
}
