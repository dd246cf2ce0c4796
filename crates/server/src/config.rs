use std::{fs, path::Path};

use anyhow::{bail, Context};
use lifecycle::AggregateConfig;
use serde::Deserialize;
use tracing::warn;

pub const SETTINGS_FILE: &str = "registry.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub child_age_threshold: u32,
    pub retirement_age: u32,
    /// Seconds between retries of mirror writes that failed.
    pub flush_interval_secs: u32,
}

impl Default for Settings {
    fn default() -> Self {
        let aggregates = AggregateConfig::default();
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/registry.db".into(),
            child_age_threshold: aggregates.child_age_threshold,
            retirement_age: aggregates.retirement_age,
            flush_interval_secs: 15,
        }
    }
}

impl Settings {
    pub fn aggregate_config(&self) -> AggregateConfig {
        AggregateConfig {
            child_age_threshold: self.child_age_threshold,
            retirement_age: self.retirement_age,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    child_age_threshold: Option<u32>,
    retirement_age: Option<u32>,
    flush_interval_secs: Option<u32>,
}

/// Defaults, then `registry.toml` in the working directory, then the
/// environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new(SETTINGS_FILE), |name| std::env::var(name).ok())
}

pub fn load_settings_from(
    file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(file) {
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("failed to parse '{}'", file.display()))?;
        if let Some(v) = file_cfg.bind_addr {
            settings.bind_addr = v;
        }
        if let Some(v) = file_cfg.database_url {
            settings.database_url = v;
        }
        if let Some(v) = file_cfg.child_age_threshold {
            settings.child_age_threshold = v;
        }
        if let Some(v) = file_cfg.retirement_age {
            settings.retirement_age = v;
        }
        if let Some(v) = file_cfg.flush_interval_secs {
            settings.flush_interval_secs = v;
        }
    }

    if let Some(v) = env("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    for (name, slot) in [
        ("APP__CHILD_AGE_THRESHOLD", &mut settings.child_age_threshold),
        ("APP__RETIREMENT_AGE", &mut settings.retirement_age),
        ("APP__FLUSH_INTERVAL_SECS", &mut settings.flush_interval_secs),
    ] {
        if let Some(v) = env(name) {
            match v.trim().parse::<u32>() {
                Ok(parsed) => *slot = parsed,
                Err(_) => warn!(%name, value = %v, "ignoring non-numeric setting"),
            }
        }
    }

    if settings.child_age_threshold >= settings.retirement_age {
        bail!(
            "child_age_threshold ({}) must be below retirement_age ({})",
            settings.child_age_threshold,
            settings.retirement_age
        );
    }

    if settings.flush_interval_secs == 0 {
        bail!("flush_interval_secs must be at least 1");
    }

    Ok(settings)
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
