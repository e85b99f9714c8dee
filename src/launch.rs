//! Deployment sequencing and the managed process lifecycle.
//!
//! `deploy` brings the resolved version onto disk (resolve, installed check,
//! manifest, acquire, install). `launch` starts the executable and, when this
//! instance becomes Master, supervises the managed process tree until it
//! exits before releasing the singleton.

use crate::acquire::{AcquireOptions, PackageAcquisition};
use crate::cancel::CancelToken;
use crate::config::{Config, DeploymentConfiguration, LaunchPaths};
use crate::coordinator::{
    FileLockSingleton, InstanceCoordinator, InstanceRole, RoleChange, SystemSingleton,
};
use crate::error::LaunchError;
use crate::http::{HttpTransport, ReqwestTransport, RetryPolicy, RetryingHttpClient};
use crate::install::{installed_executable, InstallOptions, InstallationManager};
use crate::ipc::{self, IpcServer};
use crate::manifest::{self, Manifest};
use crate::process::{ProcessTable, SysinfoProcessTable};
use crate::roots::PackageRootMap;
use crate::version::{ResolvedVersion, ResolverOptions, VersionResolver};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const READY_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub version: ResolvedVersion,
    pub version_dir: PathBuf,
    pub executable: PathBuf,
    pub freshly_installed: bool,
    pub entry_count: Option<usize>,
    pub skipped_packages: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub configuration: DeploymentConfiguration,
    pub report: DeployReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub executable: PathBuf,
    pub launched: bool,
    pub role: InstanceRole,
    pub pid: Option<u32>,
    pub ready: bool,
    /// Master only: whether the whole managed tree exited before the timeout.
    pub managed_exited: Option<bool>,
    pub notices: usize,
    /// Role transitions observed while this launch held or sought the singleton.
    pub role_changes: Vec<RoleChange>,
}

impl LaunchReport {
    fn new(executable: &Path) -> Self {
        Self {
            executable: executable.to_path_buf(),
            launched: false,
            role: InstanceRole::None,
            pid: None,
            ready: false,
            managed_exited: None,
            notices: 0,
            role_changes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub deploy: DeployReport,
    pub launch: LaunchReport,
}

/// Releases the singleton on every exit path out of `launch`.
struct ReleaseOnDrop<'a>(&'a InstanceCoordinator);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.release_singleton();
    }
}

pub struct LaunchOrchestrator {
    cfg: Config,
    paths: LaunchPaths,
    client: RetryingHttpClient,
    coordinator: Option<InstanceCoordinator>,
    cancel: CancelToken,
}

impl LaunchOrchestrator {
    pub fn new(
        cfg: Config,
        transport: Arc<dyn HttpTransport>,
        singleton: Box<dyn SystemSingleton>,
        processes: Arc<dyn ProcessTable>,
        cancel: CancelToken,
    ) -> Self {
        let paths = LaunchPaths::resolve(&cfg);
        let client = RetryingHttpClient::new(
            transport,
            RetryPolicy::from_settings(&cfg.http),
            cancel.clone(),
        );
        let coordinator = cfg.coordination.multi_instance.then(|| {
            InstanceCoordinator::new(
                singleton,
                processes,
                vec![cfg.executable_name()],
                Duration::from_millis(cfg.coordination.exit_poll_ms.max(1)),
            )
        });
        Self {
            cfg,
            paths,
            client,
            coordinator,
            cancel,
        }
    }

    /// Production wiring: reqwest, a lock file under the runtime dir and the
    /// sysinfo process table.
    pub fn from_config(cfg: Config, cancel: CancelToken) -> Result<Self, LaunchError> {
        let transport = Arc::new(ReqwestTransport::new(&cfg.http)?);
        let lock_path = LaunchPaths::resolve(&cfg).lock_path;
        Ok(Self::new(
            cfg,
            transport,
            Box::new(FileLockSingleton::new(lock_path)),
            Arc::new(SysinfoProcessTable::new()),
            cancel,
        ))
    }

    #[cfg(test)]
    pub fn paths(&self) -> &LaunchPaths {
        &self.paths
    }

    #[cfg(test)]
    pub fn coordinator(&self) -> Option<&InstanceCoordinator> {
        self.coordinator.as_ref()
    }

    pub fn resolve_version(&self) -> Result<ResolvedVersion, LaunchError> {
        VersionResolver::new(&self.client, ResolverOptions::from_config(&self.cfg)).resolve()
    }

    pub fn fetch_manifest(&self, deployment: &DeploymentConfiguration) -> Result<Manifest, LaunchError> {
        let url = deployment.manifest_url()?;
        let text = self.client.get_string(&url)?;
        let manifest = manifest::parse(&text);
        if !manifest.is_valid {
            return Err(LaunchError::Validation(format!(
                "manifest at {url} does not start with v0"
            )));
        }
        debug!(packages = ?manifest.packages, "manifest parsed");
        Ok(manifest)
    }

    /// Ensures the resolved version is installed. An existing install with the
    /// executable present is reused without touching the network again.
    pub fn deploy(&self, launch_argument: Option<String>) -> Result<Deployment, LaunchError> {
        let version = self.resolve_version()?;
        let configuration = self
            .cfg
            .deployment_configuration(launch_argument)
            .with_version(&version.version_hash);
        let version_dir = self.paths.version_dir(configuration.version_hash());
        let executable_name = self.cfg.executable_name();

        if let Some(executable) = installed_executable(&version_dir, &executable_name) {
            info!(version = %version.version_hash, "version already installed");
            return Ok(Deployment {
                configuration,
                report: DeployReport {
                    version,
                    version_dir,
                    executable,
                    freshly_installed: false,
                    entry_count: None,
                    skipped_packages: Vec::new(),
                },
            });
        }
        if self.cancel.is_cancelled() {
            return Err(LaunchError::Cancelled);
        }

        let manifest = self.fetch_manifest(&configuration)?;
        let roots = PackageRootMap::for_manifest(&manifest).unwrap_or_else(|| {
            let fallback = PackageRootMap::for_binary(configuration.binary_kind());
            warn!(
                roots = fallback.label(),
                "manifest lists no known umbrella package; using configured binary layout"
            );
            fallback
        });
        let archive_path = self.paths.archive_path(configuration.version_hash());
        let archive = PackageAcquisition::new(
            &self.client,
            &configuration,
            roots,
            AcquireOptions::from_config(&self.cfg),
        )
        .acquire(&manifest, &archive_path)?;

        InstallationManager::new(InstallOptions::from_config(&self.cfg), self.cancel.clone())
            .install(&archive.path, &version_dir)?;
        let executable = installed_executable(&version_dir, &executable_name).ok_or_else(|| {
            LaunchError::Install(format!(
                "{executable_name} missing from installed version {}",
                configuration.version_hash()
            ))
        })?;

        Ok(Deployment {
            configuration,
            report: DeployReport {
                version,
                version_dir,
                executable,
                freshly_installed: true,
                entry_count: Some(archive.entry_count),
                skipped_packages: archive.skipped_packages,
            },
        })
    }

    pub fn deploy_and_launch(&self, launch_argument: Option<String>) -> Result<RunReport, LaunchError> {
        let deployment = self.deploy(launch_argument).map_err(|err| {
            if err.is_fatal_deployment() {
                error!(error = %err, "deployment failed; not launching");
            }
            err
        })?;
        let launch = self.launch(&deployment.configuration)?;
        Ok(RunReport {
            deploy: deployment.report,
            launch,
        })
    }

    pub fn launch(&self, deployment: &DeploymentConfiguration) -> Result<LaunchReport, LaunchError> {
        let executable = self
            .paths
            .version_dir(deployment.version_hash())
            .join(self.cfg.executable_name());
        self.launch_executable(&executable, deployment.launch_argument())
    }

    /// `Ok` with `launched == false` covers the ordinary failures (missing
    /// executable, spawn error). A Master returns only after the managed tree
    /// exits or the exit timeout elapses.
    pub fn launch_executable(
        &self,
        executable: &Path,
        argument: Option<&str>,
    ) -> Result<LaunchReport, LaunchError> {
        let mut report = LaunchReport::new(executable);
        if !executable.is_file() {
            error!(executable = %executable.display(), "executable not found");
            return Ok(report);
        }

        let Some(coordinator) = &self.coordinator else {
            if let Some(mut child) = self.start(executable, argument) {
                report.launched = true;
                report.pid = Some(child.id());
                report.ready = self.wait_until_ready(&mut child);
            }
            return Ok(report);
        };

        let role_changes = coordinator.subscribe();
        let is_master = coordinator.capture_singleton()?;
        report.role = coordinator.role();
        {
            let _release = is_master.then(|| ReleaseOnDrop(coordinator));
            self.run_under_role(coordinator, is_master, executable, argument, &mut report);
        }
        report.role_changes = role_changes
            .try_iter()
            .inspect(|change| {
                info!(previous = ?change.previous, current = ?change.current, "instance role changed");
            })
            .collect();
        Ok(report)
    }

    fn run_under_role(
        &self,
        coordinator: &InstanceCoordinator,
        is_master: bool,
        executable: &Path,
        argument: Option<&str>,
        report: &mut LaunchReport,
    ) {
        let Some(mut child) = self.start(executable, argument) else {
            return;
        };
        report.launched = true;
        report.pid = Some(child.id());
        report.ready = self.wait_until_ready(&mut child);

        if !is_master {
            self.notify_master(argument);
            return;
        }

        let (exited, notices) = self.supervise(coordinator, child);
        report.managed_exited = Some(exited);
        report.notices = notices;
    }

    fn start(&self, executable: &Path, argument: Option<&str>) -> Option<Child> {
        let mut command = Command::new(executable);
        if let Some(dir) = executable.parent() {
            command.current_dir(dir);
        }
        if let Some(argument) = argument {
            command.arg(argument);
        }
        command.stdin(Stdio::null());
        match command.spawn() {
            Ok(child) => {
                info!(pid = child.id(), executable = %executable.display(), "process started");
                Some(child)
            }
            Err(err) => {
                error!(executable = %executable.display(), error = %err, "failed to start process");
                None
            }
        }
    }

    /// Ready once the child survives the settle window or exits successfully
    /// inside it.
    fn wait_until_ready(&self, child: &mut Child) -> bool {
        let settle = Duration::from_millis(
            self.cfg
                .coordination
                .readiness_settle_ms
                .min(self.cfg.coordination.readiness_timeout_ms),
        );
        let deadline = Instant::now() + settle;
        loop {
            match child.try_wait() {
                Ok(Some(status)) if status.success() => return true,
                Ok(Some(status)) => {
                    warn!(status = %status, "process exited before becoming ready");
                    return false;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "failed to poll process readiness");
                    return false;
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            if !self.cancel.sleep(READY_POLL.min(deadline - now)) {
                return false;
            }
        }
    }

    fn notify_master(&self, argument: Option<&str>) {
        let message = match argument {
            Some(argument) => format!("launched {argument}"),
            None => "launched".to_string(),
        };
        if let Err(err) = ipc::send_message(&self.paths.socket_path, &message) {
            debug!(error = %err, "master not reachable over ipc");
        }
    }

    /// Runs the exit watcher and the ipc listener on scoped threads; both are
    /// joined before returning.
    fn supervise(&self, coordinator: &InstanceCoordinator, mut child: Child) -> (bool, usize) {
        let server = match IpcServer::bind(&self.paths.socket_path) {
            Ok(server) => Some(server),
            Err(err) => {
                warn!(error = %err, "ipc listener unavailable");
                None
            }
        };
        let stop = CancelToken::new();
        let cancel = &self.cancel;
        let timeout = Duration::from_millis(self.cfg.coordination.exit_timeout_ms);
        let poll = Duration::from_millis(self.cfg.coordination.exit_poll_ms.max(1));

        thread::scope(|scope| {
            let listener = server.map(|server| {
                let stop = &stop;
                scope.spawn(move || {
                    let mut notices = 0;
                    let served = server.serve(stop, |message| {
                        notices += 1;
                        info!(message = %message, "instance notice");
                    });
                    if let Err(err) = served {
                        warn!(error = %err, "ipc listener stopped");
                    }
                    notices
                })
            });
            let watcher = scope.spawn(|| watch_exit(coordinator, &mut child, timeout, poll, cancel));

            let exited = watcher.join().unwrap_or(false);
            stop.cancel();
            let notices = listener
                .map(|handle| handle.join().unwrap_or(0))
                .unwrap_or(0);
            (exited, notices)
        })
    }
}

/// Reaps the launched child, then waits for every other managed process.
/// Gives up early when the role is lost, the deadline passes, or `cancel`
/// fires.
fn watch_exit(
    coordinator: &InstanceCoordinator,
    child: &mut Child,
    timeout: Duration,
    poll: Duration,
    cancel: &CancelToken,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(status = %status, "launched process exited");
                break;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, "failed to poll launched process");
                break;
            }
        }
        if coordinator.role() != InstanceRole::Master {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(timeout_ms = timeout.as_millis() as u64, "launched process outlived exit timeout");
            return false;
        }
        if !cancel.sleep(poll.min(deadline - now)) {
            return false;
        }
    }
    coordinator.wait_for_all_managed_processes_to_exit(deadline.saturating_duration_since(Instant::now()), cancel)
}
