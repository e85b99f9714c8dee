use crate::config::{BinaryKind, Config, LIVE_CHANNEL};
use crate::error::LaunchError;
use crate::http::RetryingHttpClient;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// A secondary answer older than this is treated as stale.
pub const STALE_AFTER_DAYS: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    Override,
    Official,
    Secondary,
    StaleSecondary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedVersion {
    pub version_hash: String,
    pub source: VersionSource,
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub binary: BinaryKind,
    pub channel: String,
    pub settings_host: String,
    pub secondary_url: Option<String>,
    pub version_override: Option<String>,
    pub safe_mode: bool,
}

impl ResolverOptions {
    pub fn from_config(cfg: &Config) -> Self {
        let non_empty = |value: &str| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };
        Self {
            binary: cfg.deployment.binary,
            channel: cfg.deployment.channel.trim().to_string(),
            settings_host: cfg.endpoints.settings_host.trim_end_matches('/').to_string(),
            secondary_url: non_empty(&cfg.endpoints.secondary_version_url),
            version_override: non_empty(&cfg.deployment.version_override),
            safe_mode: cfg.deployment.safe_mode,
        }
    }

    pub fn official_url(&self) -> String {
        let base = format!(
            "{}/v2/client-version/{}",
            self.settings_host,
            self.binary.client_version_type()
        );
        if self.channel.is_empty() || self.channel.eq_ignore_ascii_case(LIVE_CHANNEL) {
            base
        } else {
            format!("{base}/channel/{}", self.channel)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SecondaryVersion {
    version: String,
    last_update: DateTime<Utc>,
}

pub struct VersionResolver<'a> {
    client: &'a RetryingHttpClient,
    options: ResolverOptions,
}

impl<'a> VersionResolver<'a> {
    pub fn new(client: &'a RetryingHttpClient, options: ResolverOptions) -> Self {
        Self { client, options }
    }

    pub fn resolve(&self) -> Result<ResolvedVersion, LaunchError> {
        self.resolve_at(Utc::now())
    }

    pub fn resolve_at(&self, now: DateTime<Utc>) -> Result<ResolvedVersion, LaunchError> {
        if let Some(pinned) = &self.options.version_override {
            info!(version = %pinned, "using configured version override");
            return Ok(ResolvedVersion {
                version_hash: pinned.clone(),
                source: VersionSource::Override,
            });
        }

        let secondary_url = match (&self.options.secondary_url, self.options.safe_mode) {
            (Some(url), false) => Some(url.as_str()),
            _ => None,
        };
        let Some(secondary_url) = secondary_url else {
            return self
                .fetch_official()
                .map(|version| ResolvedVersion {
                    version_hash: version,
                    source: VersionSource::Official,
                })
                .ok_or(LaunchError::VersionUnavailable);
        };

        match self.fetch_secondary(secondary_url) {
            Some(secondary) if !is_stale(secondary.last_update, now) => {
                info!(version = %secondary.version, "resolved version from secondary source");
                Ok(ResolvedVersion {
                    version_hash: secondary.version,
                    source: VersionSource::Secondary,
                })
            }
            Some(secondary) => {
                warn!(
                    version = %secondary.version,
                    last_update = %secondary.last_update,
                    "secondary version source is stale, preferring official endpoint"
                );
                match self.fetch_official() {
                    Some(version) => Ok(ResolvedVersion {
                        version_hash: version,
                        source: VersionSource::Official,
                    }),
                    None => {
                        warn!(version = %secondary.version, "official endpoint failed, using stale secondary answer");
                        Ok(ResolvedVersion {
                            version_hash: secondary.version,
                            source: VersionSource::StaleSecondary,
                        })
                    }
                }
            }
            None => self
                .fetch_official()
                .map(|version| ResolvedVersion {
                    version_hash: version,
                    source: VersionSource::Official,
                })
                .ok_or(LaunchError::VersionUnavailable),
        }
    }

    fn fetch_official(&self) -> Option<String> {
        let url = self.options.official_url();
        match self.client.get_json(&url) {
            Ok(value) => {
                let parsed = parse_official(&value);
                if parsed.is_none() {
                    warn!(url = %url, "official version response is missing clientVersionUpload");
                }
                parsed
            }
            Err(err) => {
                warn!(url = %url, error = %err, "official version lookup failed");
                None
            }
        }
    }

    fn fetch_secondary(&self, url: &str) -> Option<SecondaryVersion> {
        match self.client.get_json(url) {
            Ok(value) => {
                let keys = self.options.binary.secondary_feed_keys();
                let parsed = parse_secondary(&value, keys).and_then(|(version, unix)| {
                    Utc.timestamp_opt(unix, 0)
                        .single()
                        .map(|last_update| SecondaryVersion {
                            version,
                            last_update,
                        })
                });
                if parsed.is_none() {
                    warn!(url, "secondary version response is missing expected fields");
                }
                parsed
            }
            Err(err) => {
                warn!(url, error = %err, "secondary version lookup failed");
                None
            }
        }
    }
}

fn is_stale(last_update: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(last_update) > Duration::days(STALE_AFTER_DAYS)
}

/// `{ "clientVersionUpload": "<version>" }`
pub fn parse_official(value: &Value) -> Option<String> {
    value
        .get("clientVersionUpload")?
        .as_str()
        .map(str::trim)
        .filter(|version| !version.is_empty())
        .map(str::to_string)
}

/// The secondary feed is an array whose first element holds an object with
/// `roblox_version` and `last_update_unix`, either directly or one level
/// down under a platform key. Entries under `preferred_keys` win, in order,
/// over any other platform.
pub fn parse_secondary(value: &Value, preferred_keys: &[&str]) -> Option<(String, i64)> {
    let first = value.as_array()?.first()?;
    let read = |object: &Value| -> Option<(String, i64)> {
        let version = object.get("roblox_version")?.as_str()?.trim();
        if version.is_empty() {
            return None;
        }
        let unix = object.get("last_update_unix")?;
        let unix = unix
            .as_i64()
            .or_else(|| unix.as_str().and_then(|text| text.trim().parse().ok()))?;
        Some((version.to_string(), unix))
    };
    if let Some(found) = read(first) {
        return Some(found);
    }
    let platforms = first.as_object()?;
    preferred_keys
        .iter()
        .find_map(|wanted| {
            platforms
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(wanted))
                .and_then(|(_, nested)| read(nested))
        })
        .or_else(|| {
            platforms
                .values()
                .filter(|nested| nested.is_object())
                .find_map(read)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing::{client, StubTransport};
    use serde_json::json;
    use std::sync::Arc;

    const OFFICIAL: &str = "https://settings.example/v2/client-version/WindowsPlayer";
    const SECONDARY: &str = "https://feed.example/versions";

    fn options() -> ResolverOptions {
        ResolverOptions {
            binary: BinaryKind::Player,
            channel: "LIVE".to_string(),
            settings_host: "https://settings.example".to_string(),
            secondary_url: Some(SECONDARY.to_string()),
            version_override: None,
            safe_mode: false,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn secondary_body(version: &str, age_days: i64) -> Vec<u8> {
        let unix = (now() - Duration::days(age_days)).timestamp();
        json!([{ "Windows": { "roblox_version": version, "last_update_unix": unix } }])
            .to_string()
            .into_bytes()
    }

    fn official_body(version: &str) -> Vec<u8> {
        json!({ "version": "0.1", "clientVersionUpload": version })
            .to_string()
            .into_bytes()
    }

    #[test]
    fn override_skips_network() {
        let stub = Arc::new(StubTransport::new());
        let http = client(Arc::clone(&stub), 3);
        let mut opts = options();
        opts.version_override = Some("123.45".to_string());

        let resolved = VersionResolver::new(&http, opts).resolve().unwrap();
        assert_eq!(resolved.version_hash, "123.45");
        assert_eq!(resolved.source, VersionSource::Override);
        assert!(stub.requests().is_empty());
    }

    #[test]
    fn fresh_secondary_wins() {
        let stub = Arc::new(StubTransport::new());
        stub.respond(SECONDARY, 200, &secondary_body("version-fresh", 1));
        stub.respond(OFFICIAL, 200, &official_body("version-official"));
        let http = client(Arc::clone(&stub), 1);

        let resolved = VersionResolver::new(&http, options()).resolve_at(now()).unwrap();
        assert_eq!(resolved.version_hash, "version-fresh");
        assert_eq!(resolved.source, VersionSource::Secondary);
        assert_eq!(stub.count(OFFICIAL), 0);
    }

    #[test]
    fn stale_secondary_prefers_official() {
        let stub = Arc::new(StubTransport::new());
        stub.respond(SECONDARY, 200, &secondary_body("version-stale", 11));
        stub.respond(OFFICIAL, 200, &official_body("version-official"));
        let http = client(Arc::clone(&stub), 1);

        let resolved = VersionResolver::new(&http, options()).resolve_at(now()).unwrap();
        assert_eq!(resolved.version_hash, "version-official");
        assert_eq!(resolved.source, VersionSource::Official);
    }

    #[test]
    fn stale_secondary_is_fallback_when_official_fails() {
        let stub = Arc::new(StubTransport::new());
        stub.respond(SECONDARY, 200, &secondary_body("version-stale", 30));
        stub.respond(OFFICIAL, 500, b"");
        let http = client(Arc::clone(&stub), 2);

        let resolved = VersionResolver::new(&http, options()).resolve_at(now()).unwrap();
        assert_eq!(resolved.version_hash, "version-stale");
        assert_eq!(resolved.source, VersionSource::StaleSecondary);
    }

    #[test]
    fn safe_mode_only_queries_official() {
        let stub = Arc::new(StubTransport::new());
        stub.respond(OFFICIAL, 200, &official_body("version-official"));
        let http = client(Arc::clone(&stub), 1);
        let mut opts = options();
        opts.safe_mode = true;

        let resolved = VersionResolver::new(&http, opts).resolve_at(now()).unwrap();
        assert_eq!(resolved.version_hash, "version-official");
        assert_eq!(stub.count(SECONDARY), 0);
    }

    #[test]
    fn secondary_missing_fields_falls_back_to_official() {
        let stub = Arc::new(StubTransport::new());
        stub.respond(SECONDARY, 200, br#"[{"Windows": {"roblox_version": "x"}}]"#);
        stub.respond(OFFICIAL, 200, &official_body("version-official"));
        let http = client(Arc::clone(&stub), 1);

        let resolved = VersionResolver::new(&http, options()).resolve_at(now()).unwrap();
        assert_eq!(resolved.source, VersionSource::Official);
    }

    #[test]
    fn all_sources_failing_is_version_unavailable() {
        let stub = Arc::new(StubTransport::new());
        stub.fail(SECONDARY, "dns failure");
        stub.respond(OFFICIAL, 200, br#"{"unexpected": true}"#);
        let http = client(Arc::clone(&stub), 2);

        let err = VersionResolver::new(&http, options())
            .resolve_at(now())
            .expect_err("no sources");
        assert!(matches!(err, LaunchError::VersionUnavailable));
    }

    #[test]
    fn official_url_includes_non_live_channel() {
        let mut opts = options();
        opts.channel = "zcanary".to_string();
        assert_eq!(
            opts.official_url(),
            "https://settings.example/v2/client-version/WindowsPlayer/channel/zcanary"
        );
    }

    #[test]
    fn parse_secondary_accepts_flat_and_string_timestamps() {
        let flat = json!([{ "roblox_version": "version-a", "last_update_unix": "1700000000" }]);
        let keys = BinaryKind::Player.secondary_feed_keys();
        assert_eq!(
            parse_secondary(&flat, keys),
            Some(("version-a".to_string(), 1_700_000_000))
        );
        assert_eq!(parse_secondary(&json!([]), keys), None);
        assert_eq!(parse_secondary(&json!({"roblox_version": "x"}), keys), None);
    }

    #[test]
    fn parse_secondary_prefers_the_configured_platform() {
        let feed = json!([{
            "Mac": { "roblox_version": "version-mac", "last_update_unix": 1 },
            "Windows": { "roblox_version": "version-win", "last_update_unix": 2 },
            "WindowsStudio64": { "roblox_version": "version-studio", "last_update_unix": 3 }
        }]);
        assert_eq!(
            parse_secondary(&feed, BinaryKind::Player.secondary_feed_keys()),
            Some(("version-win".to_string(), 2))
        );
        assert_eq!(
            parse_secondary(&feed, BinaryKind::Studio.secondary_feed_keys()),
            Some(("version-studio".to_string(), 3))
        );
        let mac_only = json!([{ "Mac": { "roblox_version": "version-mac", "last_update_unix": 1 } }]);
        assert_eq!(
            parse_secondary(&mac_only, BinaryKind::Player.secondary_feed_keys()),
            Some(("version-mac".to_string(), 1))
        );
    }
}
