//! Concurrent package download and merge into a single output archive.
//!
//! Fetch and in-memory decompression run on up to `parallelism` worker
//! threads. Only entry creation in the output archive is serialized, behind
//! the `ArchiveSink` mutex.

use crate::config::{ensure_parent, Config, DeploymentConfiguration};
use crate::error::LaunchError;
use crate::http::RetryingHttpClient;
use crate::manifest::Manifest;
use crate::roots::PackageRootMap;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use tracing::{debug, info, warn};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Largest uncompressed entry accepted from a package.
const MAX_ENTRY_LEN: u64 = 1 << 31;
/// Declared sizes only hint the buffer; reads grow past this on demand.
const MAX_PREALLOC: u64 = 8 << 20;

pub const APP_SETTINGS_NAME: &str = "AppSettings.xml";

pub const APP_SETTINGS_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n\
<Settings>\r\n\
\t<ContentFolder>content</ContentFolder>\r\n\
\t<BaseUrl>http://www.roblox.com</BaseUrl>\r\n\
</Settings>\r\n";

#[derive(Debug, Clone, Serialize)]
pub struct AssembledArchive {
    pub path: PathBuf,
    pub version_hash: String,
    pub entry_count: usize,
    pub skipped_packages: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    pub parallelism: usize,
    pub allow_partial: bool,
}

impl AcquireOptions {
    pub fn from_config(cfg: &Config) -> Self {
        let parallelism = if cfg.deployment.max_parallel_downloads == 0 {
            available_parallelism()
        } else {
            cfg.deployment.max_parallel_downloads
        };
        Self {
            parallelism,
            allow_partial: cfg.deployment.allow_partial_packages,
        }
    }
}

pub fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1)
}

struct PackageEntry {
    name: String,
    data: Vec<u8>,
}

struct ArchiveSink {
    writer: ZipWriter<File>,
    options: FileOptions,
    names: HashSet<String>,
    entry_count: usize,
}

impl ArchiveSink {
    fn create(path: &Path, compression_level: Option<i32>) -> Result<Self, LaunchError> {
        ensure_parent(path)?;
        let file = File::create(path)
            .map_err(|err| LaunchError::ArchiveWrite(format!("{}: {err}", path.display())))?;
        let options = match compression_level {
            Some(0) => FileOptions::default().compression_method(CompressionMethod::Stored),
            level => FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(level),
        };
        Ok(Self {
            writer: ZipWriter::new(file),
            options,
            names: HashSet::new(),
            entry_count: 0,
        })
    }

    /// Returns `false` when an entry of the same name already exists; the
    /// first writer keeps it.
    fn write_entry(&mut self, name: &str, data: &[u8]) -> Result<bool, LaunchError> {
        if !self.names.insert(name.to_string()) {
            return Ok(false);
        }
        self.writer
            .start_file(name, self.options)
            .map_err(|err| LaunchError::ArchiveWrite(format!("{name}: {err}")))?;
        self.writer
            .write_all(data)
            .map_err(|err| LaunchError::ArchiveWrite(format!("{name}: {err}")))?;
        self.entry_count += 1;
        Ok(true)
    }

    fn finish(mut self) -> Result<usize, LaunchError> {
        let file = self
            .writer
            .finish()
            .map_err(|err| LaunchError::ArchiveWrite(format!("finalize: {err}")))?;
        file.sync_all()
            .map_err(|err| LaunchError::ArchiveWrite(format!("flush: {err}")))?;
        Ok(self.entry_count)
    }
}

pub struct PackageAcquisition<'a> {
    client: &'a RetryingHttpClient,
    deployment: &'a DeploymentConfiguration,
    roots: PackageRootMap,
    options: AcquireOptions,
}

impl<'a> PackageAcquisition<'a> {
    pub fn new(
        client: &'a RetryingHttpClient,
        deployment: &'a DeploymentConfiguration,
        roots: PackageRootMap,
        options: AcquireOptions,
    ) -> Self {
        Self {
            client,
            deployment,
            roots,
            options,
        }
    }

    /// Downloads every manifest package and merges it into `output`. On any
    /// failure the partially written archive is removed.
    pub fn acquire(&self, manifest: &Manifest, output: &Path) -> Result<AssembledArchive, LaunchError> {
        if !manifest.is_valid {
            return Err(LaunchError::Validation(
                "manifest is invalid; refusing to download packages".to_string(),
            ));
        }
        if !manifest.contains(self.roots.umbrella()) {
            warn!(
                umbrella = self.roots.umbrella(),
                roots = self.roots.label(),
                "manifest does not list the umbrella package"
            );
        }
        // Fail fast on an unaddressable deployment before touching the disk.
        self.deployment.package_url(self.roots.umbrella())?;

        let result = self.assemble(manifest, output);
        if result.is_err() {
            let _ = fs::remove_file(output);
        }
        result
    }

    fn assemble(&self, manifest: &Manifest, output: &Path) -> Result<AssembledArchive, LaunchError> {
        let mut sink = ArchiveSink::create(output, self.deployment.compression_level())?;
        sink.write_entry(APP_SETTINGS_NAME, APP_SETTINGS_XML.as_bytes())?;

        let packages = &manifest.packages;
        let workers = self.options.parallelism.max(1).min(packages.len().max(1));
        info!(
            version = self.deployment.version_hash(),
            packages = packages.len(),
            workers,
            "downloading packages"
        );

        let sink = Mutex::new(sink);
        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let failure: Mutex<Option<LaunchError>> = Mutex::new(None);
        let skipped: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let cancel = self.client.cancel_token();

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if abort.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(package) = packages.get(index) else {
                        break;
                    };
                    let Err(err) = self.merge_package(package, &sink) else {
                        continue;
                    };
                    if self.is_skippable(package, &err) {
                        warn!(package = %package, error = %err, "skipping package");
                        if let Ok(mut list) = skipped.lock() {
                            list.push(package.clone());
                        }
                        continue;
                    }
                    warn!(package = %package, error = %err, "package acquisition failed");
                    abort.store(true, Ordering::SeqCst);
                    if let Ok(mut slot) = failure.lock() {
                        slot.get_or_insert(err);
                    }
                    break;
                });
            }
        });

        let failure = failure
            .into_inner()
            .map_err(|_| LaunchError::Process("acquisition failure lock poisoned".to_string()))?;
        if let Some(err) = failure {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(LaunchError::Cancelled);
        }

        let sink = sink
            .into_inner()
            .map_err(|_| LaunchError::ArchiveWrite("archive writer lock poisoned".to_string()))?;
        let entry_count = sink.finish()?;
        let skipped_packages = skipped
            .into_inner()
            .map_err(|_| LaunchError::Process("skipped list lock poisoned".to_string()))?;
        info!(
            path = %output.display(),
            entries = entry_count,
            skipped = skipped_packages.len(),
            "archive assembled"
        );
        Ok(AssembledArchive {
            path: output.to_path_buf(),
            version_hash: self.deployment.version_hash().to_string(),
            entry_count,
            skipped_packages,
        })
    }

    fn is_skippable(&self, package: &str, err: &LaunchError) -> bool {
        self.options.allow_partial
            && !self.roots.is_umbrella(package)
            && matches!(err, LaunchError::PackageDownloadFailed { .. })
    }

    fn merge_package(&self, package: &str, sink: &Mutex<ArchiveSink>) -> Result<(), LaunchError> {
        let url = self.deployment.package_url(package)?;
        let bytes = self.client.get_bytes(&url).map_err(|err| match err {
            LaunchError::Cancelled => LaunchError::Cancelled,
            other => LaunchError::PackageDownloadFailed {
                package: package.to_string(),
                reason: other.to_string(),
            },
        })?;
        if bytes.is_empty() {
            return Err(LaunchError::PackageDownloadFailed {
                package: package.to_string(),
                reason: "empty response body".to_string(),
            });
        }

        let entries = match self.roots.prefix_for(package) {
            Some(prefix) => {
                rerooted_entries(&bytes, prefix).map_err(|err| LaunchError::PackageDownloadFailed {
                    package: package.to_string(),
                    reason: format!("unreadable package archive: {err}"),
                })?
            }
            None => vec![PackageEntry {
                name: package.to_string(),
                data: bytes,
            }],
        };

        let mut sink = sink
            .lock()
            .map_err(|_| LaunchError::ArchiveWrite("archive writer lock poisoned".to_string()))?;
        let mut written = 0usize;
        for entry in &entries {
            if sink.write_entry(&entry.name, &entry.data)? {
                written += 1;
            } else {
                warn!(package, entry = %entry.name, "duplicate archive entry ignored");
            }
        }
        debug!(package, entries = written, "package merged");
        Ok(())
    }
}

/// Opens a package as a nested archive and re-roots every file entry under
/// `prefix`. Directory entries are skipped.
fn rerooted_entries(bytes: &[u8], prefix: &str) -> Result<Vec<PackageEntry>, zip::result::ZipError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let normalized = file.name().replace('\\', "/");
        let relative = normalized.trim_start_matches('/');
        if relative.is_empty() || relative.ends_with('/') {
            continue;
        }
        if !is_contained_path(relative) {
            return Err(zip::result::ZipError::InvalidArchive(
                "entry path escapes the archive root",
            ));
        }
        if file.size() > MAX_ENTRY_LEN {
            return Err(zip::result::ZipError::InvalidArchive(
                "entry declares an oversized payload",
            ));
        }
        let mut data = Vec::with_capacity(file.size().min(MAX_PREALLOC) as usize);
        (&mut file).take(MAX_ENTRY_LEN + 1).read_to_end(&mut data)?;
        if data.len() as u64 > MAX_ENTRY_LEN {
            return Err(zip::result::ZipError::InvalidArchive(
                "entry payload exceeds its size limit",
            ));
        }
        entries.push(PackageEntry {
            name: format!("{prefix}{relative}"),
            data,
        });
    }
    Ok(entries)
}

pub(crate) fn is_contained_path(relative: &str) -> bool {
    !relative.contains(':')
        && relative
            .split('/')
            .all(|component| component != ".." && component != ".")
}
