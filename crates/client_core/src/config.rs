use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

pub const DEFAULT_SETTINGS_FILE: &str = "push.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    pub gap_timeout_ms: u64,
    pub typing_timeout_ms: u64,
    pub funnel_capacity: usize,
    pub skip_read_slack: i64,
    pub database_url: String,
}

impl Default for PushSettings {
    fn default() -> Self {
        Self {
            gap_timeout_ms: 2_000,
            typing_timeout_ms: 10_000,
            funnel_capacity: 5_000,
            skip_read_slack: 100,
            database_url: "sqlite://./data/push.db".into(),
        }
    }
}

impl PushSettings {
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    gap_timeout_ms: Option<u64>,
    typing_timeout_ms: Option<u64>,
    funnel_capacity: Option<usize>,
    skip_read_slack: Option<i64>,
    database_url: Option<String>,
}

pub fn load_settings() -> PushSettings {
    load_settings_from(DEFAULT_SETTINGS_FILE)
}

/// Defaults, then `path` if it exists, then `PUSH_*` / `APP__*` environment
/// overrides. Unparseable values are logged and skipped.
pub fn load_settings_from(path: impl AsRef<Path>) -> PushSettings {
    let mut settings = PushSettings::default();
    let path = path.as_ref();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file(&mut settings, file_cfg),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config: ignoring malformed settings file")
            }
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut PushSettings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.gap_timeout_ms {
        settings.gap_timeout_ms = v;
    }
    if let Some(v) = file_cfg.typing_timeout_ms {
        settings.typing_timeout_ms = v;
    }
    if let Some(v) = file_cfg.funnel_capacity {
        settings.funnel_capacity = v;
    }
    if let Some(v) = file_cfg.skip_read_slack {
        settings.skip_read_slack = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
}

fn apply_env(settings: &mut PushSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = parsed(&var, "PUSH_GAP_TIMEOUT_MS", "APP__GAP_TIMEOUT_MS") {
        settings.gap_timeout_ms = v;
    }
    if let Some(v) = parsed(&var, "PUSH_TYPING_TIMEOUT_MS", "APP__TYPING_TIMEOUT_MS") {
        settings.typing_timeout_ms = v;
    }
    if let Some(v) = parsed(&var, "PUSH_FUNNEL_CAPACITY", "APP__FUNNEL_CAPACITY") {
        settings.funnel_capacity = v;
    }
    if let Some(v) = parsed(&var, "PUSH_SKIP_READ_SLACK", "APP__SKIP_READ_SLACK") {
        settings.skip_read_slack = v;
    }

    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }
}

fn parsed<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    plain: &str,
    app: &str,
) -> Option<T> {
    let mut value = None;
    for key in [plain, app] {
        let Some(raw) = var(key) else {
            continue;
        };
        match raw.trim().parse::<T>() {
            Ok(parsed) => value = Some(parsed),
            Err(_) => warn!(key, value = %raw, "config: ignoring unparseable override"),
        }
    }
    value
}

/// Turns a bare path or `sqlite:` path into a `sqlite://` url. The storage
/// layer creates the parent directory when it opens the pool.
pub fn prepare_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return PushSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url);
    format!("sqlite://{}", path.replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        env,
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    fn temp_root(label: &str) -> PathBuf {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let root = env::temp_dir().join(format!("push_config_{label}_{suffix}"));
        fs::create_dir_all(&root).expect("temp root");
        root
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = PushSettings::default();
        assert_eq!(settings.gap_timeout(), Duration::from_secs(2));
        assert_eq!(settings.typing_timeout(), Duration::from_secs(10));
        assert_eq!(settings.funnel_capacity, 5000);
        assert_eq!(settings.skip_read_slack, 100);
    }

    #[test]
    fn file_values_override_defaults() {
        let root = temp_root("file");
        let path = root.join("push.toml");
        fs::write(&path, "gap_timeout_ms = 500\nskip_read_slack = 10\n").expect("write");

        let settings = load_settings_from(&path);
        assert_eq!(settings.gap_timeout_ms, 500);
        assert_eq!(settings.skip_read_slack, 10);
        assert_eq!(settings.typing_timeout_ms, 10_000);

        fs::remove_dir_all(root).expect("cleanup");
    }

    #[test]
    fn app_prefixed_env_wins_over_plain_name() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PUSH_GAP_TIMEOUT_MS", "300"),
            ("APP__GAP_TIMEOUT_MS", "400"),
            ("PUSH_FUNNEL_CAPACITY", "not-a-number"),
            ("DATABASE_URL", "sqlite::memory:"),
        ]);
        let mut settings = PushSettings::default();
        apply_env(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(settings.gap_timeout_ms, 400);
        assert_eq!(settings.funnel_capacity, 5000);
        assert_eq!(settings.database_url, "sqlite::memory:");
    }

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            prepare_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
        assert_eq!(prepare_database_url("sqlite:push.db"), "sqlite://push.db");
        assert_eq!(prepare_database_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(
            prepare_database_url("  "),
            PushSettings::default().database_url
        );
    }
}
