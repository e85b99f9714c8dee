use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::LaunchError;
use serde::Serialize;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use zip::ZipArchive;

#[derive(Debug, Clone, Copy)]
pub struct InstallOptions {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl InstallOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.install.max_attempts.max(1),
            retry_delay: Duration::from_millis(cfg.install.retry_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
    pub destination: PathBuf,
    pub files: usize,
}

pub struct InstallationManager {
    options: InstallOptions,
    cancel: CancelToken,
}

impl InstallationManager {
    pub fn new(options: InstallOptions, cancel: CancelToken) -> Self {
        Self { options, cancel }
    }

    /// Replaces `destination` with the contents of `archive`, then deletes the
    /// archive. Archive deletion is attempted even when extraction fails.
    pub fn install(&self, archive: &Path, destination: &Path) -> Result<InstallReport, LaunchError> {
        info!(archive = %archive.display(), destination = %destination.display(), "installing");
        let outcome = self
            .with_retry("remove previous install", destination, || {
                remove_dir_if_present(destination)
            })
            .and_then(|_| {
                self.with_retry("extract archive", destination, || {
                    extract_archive(archive, destination)
                })
            });
        let cleanup = self.with_retry("delete archive", archive, || remove_file_if_present(archive));

        let files = outcome?;
        cleanup?;
        info!(destination = %destination.display(), files, "install complete");
        Ok(InstallReport {
            destination: destination.to_path_buf(),
            files,
        })
    }

    fn with_retry<T>(
        &self,
        step: &str,
        path: &Path,
        mut action: impl FnMut() -> io::Result<T>,
    ) -> Result<T, LaunchError> {
        let mut attempt = 1;
        loop {
            match action() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.options.max_attempts && is_transient(&err) => {
                    warn!(
                        step,
                        path = %path.display(),
                        attempt,
                        error = %err,
                        "install step failed, retrying"
                    );
                    if !self.cancel.sleep(self.options.retry_delay * attempt) {
                        return Err(LaunchError::Cancelled);
                    }
                    attempt += 1;
                }
                Err(err) if is_lock_error(&err) => {
                    return Err(LaunchError::ResourceLocked {
                        path: path.to_path_buf(),
                        message: format!("{step}: {err}"),
                    })
                }
                Err(err) => {
                    return Err(LaunchError::Install(format!(
                        "{step} failed for {} after {attempt} attempt(s): {err}",
                        path.display()
                    )))
                }
            }
        }
    }
}

/// Corrupt archives will not get better by retrying.
fn is_transient(err: &io::Error) -> bool {
    err.kind() != io::ErrorKind::InvalidData && err.kind() != io::ErrorKind::NotFound
}

fn is_lock_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::WouldBlock
    ) {
        return true;
    }
    #[cfg(unix)]
    const LOCK_CODES: &[i32] = &[16, 26];
    #[cfg(windows)]
    const LOCK_CODES: &[i32] = &[32, 33];
    #[cfg(not(any(unix, windows)))]
    const LOCK_CODES: &[i32] = &[];
    err.raw_os_error()
        .map(|code| LOCK_CODES.contains(&code))
        .unwrap_or(false)
}

fn remove_dir_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn remove_file_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn zip_to_io(err: zip::result::ZipError) -> io::Error {
    match err {
        zip::result::ZipError::Io(inner) => inner,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

fn extract_archive(archive: &Path, destination: &Path) -> io::Result<usize> {
    let mut zip = ZipArchive::new(File::open(archive)?).map_err(zip_to_io)?;
    fs::create_dir_all(destination)?;
    let mut files = 0;
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(zip_to_io)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsafe entry path in archive: {}", entry.name()),
            ));
        };
        let target = destination.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        files += 1;
    }
    Ok(files)
}

/// Path of the executable when `version_dir` holds a complete install.
pub fn installed_executable(version_dir: &Path, executable: &str) -> Option<PathBuf> {
    let candidate = version_dir.join(executable);
    candidate.is_file().then_some(candidate)
}
