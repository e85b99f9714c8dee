use crate::error::LaunchError;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;
pub const LIVE_CHANNEL: &str = "LIVE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BinaryKind {
    Player,
    Studio,
}

impl BinaryKind {
    /// Name used by the client-settings service for this binary.
    pub fn client_version_type(&self) -> &'static str {
        match self {
            BinaryKind::Player => "WindowsPlayer",
            BinaryKind::Studio => "WindowsStudio64",
        }
    }

    pub fn executable_name(&self) -> &'static str {
        match self {
            BinaryKind::Player => "RobloxPlayerBeta.exe",
            BinaryKind::Studio => "RobloxStudioBeta.exe",
        }
    }

    /// Platform keys of the secondary version feed, most specific first.
    pub fn secondary_feed_keys(&self) -> &'static [&'static str] {
        match self {
            BinaryKind::Player => &["WindowsPlayer", "Windows"],
            BinaryKind::Studio => &["WindowsStudio64", "WindowsStudio", "Windows"],
        }
    }

    pub fn default_blob_directory(&self) -> &'static str {
        "/"
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub deployment: DeploymentSettings,
    pub endpoints: Endpoints,
    pub http: HttpSettings,
    pub install: InstallSettings,
    pub coordination: CoordinationSettings,
    pub paths: PathSettings,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct DeploymentSettings {
    pub binary: BinaryKind,
    pub channel: String,
    pub blob_directory: String,
    pub executable: String,
    pub version_override: String,
    pub safe_mode: bool,
    pub compression_level: Option<i32>,
    pub allow_partial_packages: bool,
    pub max_parallel_downloads: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Endpoints {
    pub cdn_host: String,
    pub settings_host: String,
    pub secondary_version_url: String,
    pub csrf_url: String,
    pub ticket_url: String,
    pub ticket_referrer: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSettings {
    pub timeout_sec: u64,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub user_agent: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct InstallSettings {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinationSettings {
    pub multi_instance: bool,
    pub exit_poll_ms: u64,
    pub exit_timeout_ms: u64,
    pub readiness_timeout_ms: u64,
    pub readiness_settle_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct PathSettings {
    pub root: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            deployment: DeploymentSettings::default(),
            endpoints: Endpoints::default(),
            http: HttpSettings::default(),
            install: InstallSettings::default(),
            coordination: CoordinationSettings::default(),
            paths: PathSettings::default(),
        }
    }
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            binary: BinaryKind::Player,
            channel: LIVE_CHANNEL.to_string(),
            blob_directory: String::new(),
            executable: String::new(),
            version_override: String::new(),
            safe_mode: false,
            compression_level: None,
            allow_partial_packages: false,
            max_parallel_downloads: 0,
        }
    }
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            cdn_host: "https://setup.rbxcdn.com".to_string(),
            settings_host: "https://clientsettingscdn.roblox.com".to_string(),
            secondary_version_url: String::new(),
            csrf_url: "https://auth.roblox.com/v2/logout".to_string(),
            ticket_url: "https://auth.roblox.com/v1/authentication-ticket".to_string(),
            ticket_referrer: "https://www.roblox.com/".to_string(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_sec: 300,
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            user_agent: format!("launchpad/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_ms: 200,
        }
    }
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            multi_instance: true,
            exit_poll_ms: 1_000,
            exit_timeout_ms: 86_400_000,
            readiness_timeout_ms: 10_000,
            readiness_settle_ms: 1_500,
        }
    }
}

impl Config {
    pub fn executable_name(&self) -> String {
        let configured = self.deployment.executable.trim();
        if configured.is_empty() {
            self.deployment.binary.executable_name().to_string()
        } else {
            configured.to_string()
        }
    }

    /// Builds the per-run deployment record. `version_hash` stays empty until
    /// the resolver fills it in.
    pub fn deployment_configuration(&self, launch_argument: Option<String>) -> DeploymentConfiguration {
        let blob = if self.deployment.blob_directory.trim().is_empty() {
            self.deployment.binary.default_blob_directory().to_string()
        } else {
            self.deployment.blob_directory.clone()
        };
        DeploymentConfiguration::new(self.deployment.binary, &self.endpoints.cdn_host)
            .with_channel(&self.deployment.channel)
            .with_blob_directory(&blob)
            .with_compression_level(self.deployment.compression_level)
            .with_launch_argument(launch_argument)
    }
}

/// Immutable description of one deployment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentConfiguration {
    binary_kind: BinaryKind,
    cdn_host: String,
    channel: String,
    version_hash: String,
    blob_directory: String,
    launch_argument: Option<String>,
    compression_level: Option<i32>,
}

impl DeploymentConfiguration {
    pub fn new(binary_kind: BinaryKind, cdn_host: &str) -> Self {
        Self {
            binary_kind,
            cdn_host: cdn_host.trim().trim_end_matches('/').to_string(),
            channel: LIVE_CHANNEL.to_string(),
            version_hash: String::new(),
            blob_directory: normalize_blob_directory(binary_kind.default_blob_directory()),
            launch_argument: None,
            compression_level: None,
        }
    }

    pub fn with_channel(mut self, channel: &str) -> Self {
        let trimmed = channel.trim();
        self.channel = if trimmed.is_empty() {
            LIVE_CHANNEL.to_string()
        } else {
            trimmed.to_string()
        };
        self
    }

    pub fn with_blob_directory(mut self, blob_directory: &str) -> Self {
        self.blob_directory = normalize_blob_directory(blob_directory);
        self
    }

    pub fn with_launch_argument(mut self, argument: Option<String>) -> Self {
        self.launch_argument = argument.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn with_compression_level(mut self, level: Option<i32>) -> Self {
        self.compression_level = level;
        self
    }

    pub fn with_version(mut self, version_hash: &str) -> Self {
        self.version_hash = version_hash.trim().to_string();
        self
    }

    pub fn binary_kind(&self) -> BinaryKind {
        self.binary_kind
    }

    pub fn version_hash(&self) -> &str {
        &self.version_hash
    }

    pub fn launch_argument(&self) -> Option<&str> {
        self.launch_argument.as_deref()
    }

    pub fn compression_level(&self) -> Option<i32> {
        self.compression_level
    }

    pub fn is_live_channel(&self) -> bool {
        self.channel.eq_ignore_ascii_case(LIVE_CHANNEL)
    }

    pub fn base_url(&self) -> String {
        if self.is_live_channel() {
            self.cdn_host.clone()
        } else {
            format!("{}/channel/{}", self.cdn_host, self.channel)
        }
    }

    pub fn package_url(&self, package: &str) -> Result<String, LaunchError> {
        self.require_addressable()?;
        Ok(format!(
            "{}{}{}-{}",
            self.base_url(),
            self.blob_directory,
            self.version_hash,
            package
        ))
    }

    pub fn manifest_url(&self) -> Result<String, LaunchError> {
        self.package_url("rbxPkgManifest.txt")
    }

    fn require_addressable(&self) -> Result<(), LaunchError> {
        if self.blob_directory.is_empty()
            || !self.blob_directory.starts_with('/')
            || !self.blob_directory.ends_with('/')
        {
            return Err(LaunchError::Validation(format!(
                "blob directory '{}' must begin and end with '/'",
                self.blob_directory
            )));
        }
        if self.version_hash.is_empty() {
            return Err(LaunchError::Validation(
                "version hash must be resolved before building package URLs".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn normalize_blob_directory(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

/// On-disk layout derived from `paths.root`.
#[derive(Debug, Clone)]
pub struct LaunchPaths {
    pub root: PathBuf,
    pub versions_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub lock_path: PathBuf,
    pub socket_path: PathBuf,
}

impl LaunchPaths {
    pub fn from_root(root: PathBuf) -> Self {
        let runtime_dir = root.join("Runtime");
        Self {
            versions_dir: root.join("Versions"),
            downloads_dir: root.join("Downloads"),
            lock_path: runtime_dir.join("launchpad.lock"),
            socket_path: runtime_dir.join("launchpad.sock"),
            runtime_dir,
            root,
        }
    }

    pub fn resolve(cfg: &Config) -> Self {
        let configured = cfg.paths.root.trim();
        let root = if configured.is_empty() {
            default_data_root()
        } else {
            PathBuf::from(expand_path(configured))
        };
        Self::from_root(root)
    }

    pub fn version_dir(&self, version_hash: &str) -> PathBuf {
        self.versions_dir.join(version_hash)
    }

    pub fn archive_path(&self, version_hash: &str) -> PathBuf {
        self.downloads_dir.join(format!("{version_hash}.zip"))
    }
}

fn default_data_root() -> PathBuf {
    if let Ok(path) = env::var("LAUNCHPAD_ROOT") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::data_local_dir()
        .or_else(home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("launchpad")
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("LAUNCHPAD_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("launchpad");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("LAUNCHPAD_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.yaml")
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn ensure_parent(path: &Path) -> Result<(), LaunchError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn read_config_from_str(content: &str) -> Result<Config, LaunchError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(LaunchError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, LaunchError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// Reads the config file when present, otherwise falls back to defaults.
pub fn load_config(path: &Path) -> Result<Config, LaunchError> {
    if path.exists() {
        read_config(path)
    } else {
        Ok(Config::default())
    }
}

pub fn validate_config(cfg: &Config) -> Result<(), LaunchError> {
    if cfg.deployment.channel.trim().is_empty() {
        return Err(LaunchError::Config(
            "deployment.channel must be non-empty".to_string(),
        ));
    }
    if cfg.deployment.channel.contains('/') {
        return Err(LaunchError::Config(
            "deployment.channel must not contain '/'".to_string(),
        ));
    }
    if let Some(level) = cfg.deployment.compression_level {
        if !(0..=9).contains(&level) {
            return Err(LaunchError::Config(format!(
                "deployment.compression_level must be between 0 and 9 (got {level})"
            )));
        }
    }
    for (field, value) in [
        ("endpoints.cdn_host", &cfg.endpoints.cdn_host),
        ("endpoints.settings_host", &cfg.endpoints.settings_host),
    ] {
        let trimmed = value.trim();
        if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
            return Err(LaunchError::Config(format!(
                "{field} must be an http(s) URL"
            )));
        }
    }
    if cfg.http.max_attempts == 0 {
        return Err(LaunchError::Config(
            "http.max_attempts must be greater than 0".to_string(),
        ));
    }
    if cfg.http.timeout_sec == 0 {
        return Err(LaunchError::Config(
            "http.timeout_sec must be greater than 0".to_string(),
        ));
    }
    if cfg.install.max_attempts == 0 {
        return Err(LaunchError::Config(
            "install.max_attempts must be greater than 0".to_string(),
        ));
    }
    if cfg.coordination.exit_poll_ms == 0 {
        return Err(LaunchError::Config(
            "coordination.exit_poll_ms must be greater than 0".to_string(),
        ));
    }
    if cfg.executable_name().contains('/') {
        return Err(LaunchError::Config(
            "deployment.executable must be a file name, not a path".to_string(),
        ));
    }
    Ok(())
}
