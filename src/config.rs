use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::{Context as _, bail, ensure};
use serde::{Deserialize, Deserializer};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use url::Url;

use crate::{
    json_file,
    limit_enforcement::{LimitConfig, LimitSettings},
    notify::MessageMode,
    panel::Credentials,
};

fn default_out_of_limit_number() -> u32 {
    3
}

/// Empty strings in the config file mean "not set".
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<Url>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(value) if !value.trim().is_empty() => Url::parse(value.trim())
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}

/// `SPECIAL_LIMIT` is a list of `[user, limit]` pairs; an object mapping
/// users to limits is accepted too.
fn special_limits<'de, D>(deserializer: D) -> Result<Vec<(String, usize)>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SpecialLimits {
        Pairs(Vec<(String, usize)>),
        Map(BTreeMap<String, usize>),
    }

    Ok(match SpecialLimits::deserialize(deserializer)? {
        SpecialLimits::Pairs(pairs) => pairs,
        SpecialLimits::Map(map) => map.into_iter().collect(),
    })
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Config {
    #[serde(rename = "PANEL_DOMAIN")]
    pub(crate) panel_domain: String,
    #[serde(rename = "PANEL_USERNAME")]
    pub(crate) panel_username: String,
    #[serde(rename = "PANEL_PASSWORD")]
    pub(crate) panel_password: String,
    /// Seconds between detection cycles.
    #[serde(rename = "CHECK_INTERVAL")]
    pub(crate) check_interval: u64,
    /// Seconds after which enforcement-disabled users are re-enabled.
    #[serde(rename = "TIME_TO_ACTIVE_USERS", default)]
    pub(crate) time_to_active_users: Option<u64>,
    #[serde(rename = "GENERAL_LIMIT")]
    pub(crate) general_limit: usize,
    #[serde(rename = "SPECIAL_LIMIT", default, deserialize_with = "special_limits")]
    pub(crate) special_limit: Vec<(String, usize)>,
    #[serde(rename = "EXCEPT_USERS", default)]
    pub(crate) except_users: HashSet<String>,
    #[serde(rename = "outOfLimitNumber", default = "default_out_of_limit_number")]
    pub(crate) out_of_limit_number: u32,
    #[serde(rename = "OWNER_USERNAME", default)]
    pub(crate) owner_username: Option<String>,
    #[serde(rename = "WEBHOOK_URL", default, deserialize_with = "empty_as_none")]
    pub(crate) webhook_url: Option<Url>,
    #[serde(rename = "TELEGRAM_MESSAGE_MODE", default)]
    pub(crate) message_mode: MessageMode,
    #[serde(rename = "BOT_TOKEN", default)]
    pub(crate) bot_token: Option<String>,
    #[serde(rename = "ADMINS", default)]
    pub(crate) admins: Vec<i64>,
}

impl Config {
    pub(crate) fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Config =
            serde_json::from_str(contents).context("Failed to parse config file")?;

        ensure!(config.check_interval >= 1, "CHECK_INTERVAL must be at least 1 second");
        ensure!(config.out_of_limit_number >= 1, "outOfLimitNumber must be at least 1");
        ensure!(!config.panel_domain.trim().is_empty(), "PANEL_DOMAIN must not be empty");

        // Surface duplicate special limits at load time.
        config.limit_settings()?;

        Ok(config)
    }

    pub(crate) fn credentials(&self) -> Credentials {
        Credentials {
            username: self.panel_username.clone(),
            password: self.panel_password.clone(),
        }
    }

    pub(crate) fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub(crate) fn reenable_after(&self) -> Option<Duration> {
        self.time_to_active_users
            .filter(|&seconds| seconds > 0)
            .map(Duration::from_secs)
    }

    pub(crate) fn limit_settings(&self) -> anyhow::Result<LimitSettings> {
        Ok(LimitSettings {
            limits: LimitConfig::new(
                self.general_limit,
                self.special_limit.clone(),
                self.except_users.clone(),
            )?,
            out_of_limit_threshold: self.out_of_limit_number,
        })
    }
}

#[derive(Debug)]
struct Cached {
    modified: SystemTime,
    config: Arc<Config>,
}

/// Config file that is re-read whenever its modification time moves forward.
#[derive(Debug)]
pub(crate) struct ConfigSource {
    path: PathBuf,
    cached: Mutex<Option<Cached>>,
}

impl ConfigSource {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub(crate) async fn current(&self) -> anyhow::Result<Arc<Config>> {
        let modified = tokio::fs::metadata(&self.path)
            .await
            .and_then(|metadata| metadata.modified())
            .with_context(|| format!("Config file {} not found", self.path.display()))?;

        let mut cached = self.cached.lock().await;

        if let Some(cached) = cached.as_ref()
            && modified <= cached.modified
        {
            return Ok(Arc::clone(&cached.config));
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read config file {}", self.path.display()))?;
        let config = Arc::new(
            Config::parse(&contents)
                .with_context(|| format!("Invalid config file {}", self.path.display()))?,
        );

        if cached.is_some() {
            info!("Config file changed, reloaded");
        } else {
            debug!("Loaded config file");
        }

        *cached = Some(Cached {
            modified,
            config: Arc::clone(&config),
        });

        Ok(config)
    }
}

/// Set a user's special limit in the config file, replacing an existing entry
/// for that user rather than adding a second one. Other keys are preserved.
/// The file is replaced atomically, so a running monitor never reads a
/// partial write.
///
/// Returns `true` if an existing entry was updated.
pub(crate) async fn set_special_limit(
    path: &Path,
    user: &str,
    limit: usize,
) -> anyhow::Result<bool> {
    use serde_json::Value;

    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let mut document: Value = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;

    let Some(object) = document.as_object_mut() else {
        bail!("Config file {} is not a JSON object", path.display());
    };

    let slot = object.entry("SPECIAL_LIMIT").or_insert(Value::Null);
    let mut entries = match slot.take() {
        Value::Array(entries) => entries,
        Value::Object(map) => map
            .into_iter()
            .map(|(name, limit)| Value::Array(vec![Value::String(name), limit]))
            .collect(),
        _ => Vec::new(),
    };

    let mut updated = false;
    entries.retain_mut(|entry| {
        let is_user = entry
            .get(0)
            .and_then(Value::as_str)
            .is_some_and(|name| name == user);
        if !is_user {
            return true;
        }
        if updated {
            return false;
        }
        *entry = serde_json::json!([user, limit]);
        updated = true;
        true
    });

    if !updated {
        entries.push(serde_json::json!([user, limit]));
    }
    *slot = Value::Array(entries);

    json_file::persist(path, &document)
        .await
        .with_context(|| format!("Failed to write config file {}", path.display()))?;

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "PANEL_DOMAIN": "panel.example:8000",
        "PANEL_USERNAME": "admin",
        "PANEL_PASSWORD": "secret",
        "CHECK_INTERVAL": 240,
        "GENERAL_LIMIT": 2,
        "BOT_TOKEN": "123:abc",
        "ADMINS": [1111]
    }"#;

    #[test]
    fn defaults_for_optional_keys() {
        let config = Config::parse(MINIMAL).unwrap();

        assert_eq!(config.out_of_limit_number, 3);
        assert_eq!(config.message_mode, MessageMode::Always);
        assert_eq!(config.webhook_url, None);
        assert_eq!(config.reenable_after(), None);
        assert_eq!(config.check_interval(), Duration::from_secs(240));
        assert_eq!(config.admins, [1111]);
    }

    #[test]
    fn full_config() {
        let config = Config::parse(
            r#"{
                "PANEL_DOMAIN": "panel.example",
                "PANEL_USERNAME": "admin",
                "PANEL_PASSWORD": "secret",
                "CHECK_INTERVAL": 60,
                "TIME_TO_ACTIVE_USERS": 1800,
                "GENERAL_LIMIT": 2,
                "SPECIAL_LIMIT": [["family", 5]],
                "EXCEPT_USERS": ["owner"],
                "outOfLimitNumber": 4,
                "OWNER_USERNAME": "reseller",
                "WEBHOOK_URL": "https://hooks.example/ip",
                "TELEGRAM_MESSAGE_MODE": "on_ban",
                "IP_LOCATION": "IR"
            }"#,
        )
        .unwrap();

        let settings = config.limit_settings().unwrap();
        assert_eq!(settings.limits.limit_for("family"), 5);
        assert!(settings.limits.is_exempt("owner"));
        assert_eq!(settings.out_of_limit_threshold, 4);
        assert_eq!(config.reenable_after(), Some(Duration::from_secs(1800)));
        assert_eq!(config.owner_username.as_deref(), Some("reseller"));
        assert_eq!(
            config.webhook_url.map(String::from).as_deref(),
            Some("https://hooks.example/ip")
        );
        assert_eq!(config.message_mode, MessageMode::OnBan);
    }

    #[test]
    fn empty_webhook_is_none() {
        let contents = MINIMAL.replace(
            "\"GENERAL_LIMIT\"",
            "\"WEBHOOK_URL\": \"\", \"GENERAL_LIMIT\"",
        );

        assert_eq!(Config::parse(&contents).unwrap().webhook_url, None);
    }

    #[test]
    fn duplicate_special_limits_rejected() {
        let contents = MINIMAL.replace(
            "\"GENERAL_LIMIT\"",
            "\"SPECIAL_LIMIT\": [[\"a\", 3], [\"a\", 4]], \"GENERAL_LIMIT\"",
        );

        assert!(Config::parse(&contents).is_err());
    }

    #[test]
    fn zero_interval_rejected() {
        let contents = MINIMAL.replace("240", "0");

        assert!(Config::parse(&contents).is_err());
    }

    #[tokio::test]
    async fn reloads_when_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, MINIMAL).unwrap();

        let source = ConfigSource::new(&path);
        assert_eq!(source.current().await.unwrap().general_limit, 2);

        std::fs::write(
            &path,
            MINIMAL.replace("\"GENERAL_LIMIT\": 2", "\"GENERAL_LIMIT\": 7"),
        )
        .unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        assert_eq!(source.current().await.unwrap().general_limit, 7);
    }

    #[tokio::test]
    async fn set_special_limit_coalesces_and_preserves_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            MINIMAL.replace(
                "\"GENERAL_LIMIT\"",
                "\"SPECIAL_LIMIT\": [[\"a\", 3], [\"b\", 1], [\"a\", 9]], \"GENERAL_LIMIT\"",
            ),
        )
        .unwrap();

        assert!(set_special_limit(&path, "a", 4).await.unwrap());
        assert!(!set_special_limit(&path, "c", 6).await.unwrap());

        let config = Config::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            config.special_limit,
            [("a".to_owned(), 4), ("b".to_owned(), 1), ("c".to_owned(), 6)]
        );
        assert_eq!(config.bot_token.as_deref(), Some("123:abc"));
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[tokio::test]
    async fn set_special_limit_is_seen_by_running_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, MINIMAL).unwrap();
        let source = ConfigSource::new(&path);
        assert!(source.current().await.unwrap().special_limit.is_empty());
        // Let the clock move past the first file's modification time.
        tokio::time::sleep(Duration::from_millis(50)).await;

        set_special_limit(&path, "a", 4).await.unwrap();

        let config = source.current().await.unwrap();
        assert_eq!(config.special_limit, [("a".to_owned(), 4)]);
    }

    #[tokio::test]
    async fn set_special_limit_replaces_legacy_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            MINIMAL.replace("\"GENERAL_LIMIT\"", "\"SPECIAL_LIMIT\": {}, \"GENERAL_LIMIT\""),
        )
        .unwrap();

        set_special_limit(&path, "a", 2).await.unwrap();

        let config = Config::parse(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(config.special_limit, [("a".to_owned(), 2)]);
    }
}
