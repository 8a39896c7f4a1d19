use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const FILE_FORMAT_VERSION: &str = "2.0";
pub const CONFIG_FILENAME: &str = "heavy-lifter.toml";
pub const EXAMPLE_CONFIG_FILENAME: &str = "example.heavy-lifter.toml";
pub const DEFAULT_SITE: &str = "default";

const EMBEDDED_EXAMPLE_CONFIG: &str = include_str!("../assets/example.heavy-lifter.toml");

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ProjectConfig {
    #[serde(default)]
    pub project: ProjectSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ProjectSection {
    pub version: Option<String>,
    #[serde(default)]
    pub sites: BTreeMap<String, SiteConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteConfig {
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub files: FilesSection,
    #[serde(default)]
    pub develop: DevelopSection,
    #[serde(default)]
    pub database: DatabaseSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncSection {
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub sql: SqlSyncSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SqlSyncSection {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FilesSection {
    pub public_path: Option<PathBuf>,
    pub private_path: Option<PathBuf>,
    #[serde(default)]
    pub sync: FilesSyncSection,
    #[serde(default)]
    pub dump: FilesDumpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FilesSyncSection {
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct FilesDumpSection {
    pub location: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DevelopSection {
    pub admin_username: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DatabaseSection {
    pub path: Option<PathBuf>,
    pub table_prefix: Option<String>,
}

/// HTTP basic-auth pair sent with staging downloads.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl ProjectConfig {
    /// Reject configs written for an older file format.
    pub fn validate(&self) -> Result<()> {
        let version = match self.project.version.as_deref().map(str::trim) {
            Some(version) if !version.is_empty() => version,
            _ => bail!(
                "Make sure {CONFIG_FILENAME} exists and configuration updated to format version: {FILE_FORMAT_VERSION}"
            ),
        };
        if compare_versions(version, FILE_FORMAT_VERSION) == Ordering::Less {
            bail!(
                "Update your obsolete {CONFIG_FILENAME} configuration with changes from {EXAMPLE_CONFIG_FILENAME} to file format: {FILE_FORMAT_VERSION}"
            );
        }
        Ok(())
    }

    /// Site section by name. An unknown site behaves like an empty section so
    /// that each command reports the exact key it is missing.
    pub fn site(&self, name: &str) -> SiteConfig {
        self.project.sites.get(name).cloned().unwrap_or_default()
    }

    /// Basic-auth pair for staging downloads: env > config.
    pub fn sync_credentials(&self, site: &str) -> Option<Credentials> {
        self.sync_credentials_with_lookup(site, |key| env::var(key).ok())
    }

    fn sync_credentials_with_lookup<F>(&self, site: &str, lookup_env: F) -> Option<Credentials>
    where
        F: Fn(&str) -> Option<String>,
    {
        let section = self.site(site).sync;
        let username = non_empty(lookup_env("HEAVY_LIFTER_SYNC_USERNAME"))
            .or(section.username)
            .filter(|value| !value.trim().is_empty());
        let password = non_empty(lookup_env("HEAVY_LIFTER_SYNC_PASSWORD"))
            .or(section.password)
            .unwrap_or_default();
        let username = username.or_else(|| {
            warn!("Missing configuration key: {}", site_key(site, "sync.username"));
            None
        })?;
        Some(Credentials { username, password })
    }
}

/// Full dotted key of a site setting, as shown in diagnostics.
pub fn site_key(site: &str, key: &str) -> String {
    format!("project.sites.{site}.{key}")
}

/// Returns the value or warns with the full key when it is unset.
pub fn require_site_value<T: Clone>(value: Option<&T>, site: &str, key: &str) -> Option<T> {
    match value {
        Some(value) => Some(value.clone()),
        None => {
            warn!("Missing configuration key: {}", site_key(site, key));
            None
        }
    }
}

/// Credentials are only ever sent over HTTPS.
pub fn ensure_https(url: Option<&str>, label: &str) -> Result<()> {
    if let Some(url) = url
        && !url.trim().is_empty()
        && !url.trim().starts_with("https://")
    {
        bail!(
            "{label} URL is not HTTPS, cannot send credentials over unencrypted connection to: {url}"
        );
    }
    Ok(())
}

/// Load and parse a ProjectConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ProjectConfig> {
    if !config_path.exists() {
        return Ok(ProjectConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ProjectConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn embedded_example_config() -> &'static str {
    EMBEDDED_EXAMPLE_CONFIG
}

/// Numeric, dot-separated comparison; missing components count as zero.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let parse = |value: &str| -> Vec<u64> {
        value
            .trim()
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
                digits.parse::<u64>().unwrap_or(0)
            })
            .collect()
    };
    let left = parse(left);
    let right = parse(right);
    let width = left.len().max(right.len());
    for index in 0..width {
        let a = left.get(index).copied().unwrap_or(0);
        let b = right.get(index).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
