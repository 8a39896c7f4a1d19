use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::{Client, Response};
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};
use tracing::{info, warn};

use crate::config::Credentials;

const DEFAULT_USER_AGENT: &str = concat!("heavy-lifter/", env!("CARGO_PKG_VERSION"));
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_TIMEOUT_MS: u64 = 3_600_000;
const DEFAULT_RETRIES: usize = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 500;
const MAX_REDIRECTS: usize = 10;

pub trait Downloader {
    /// Fetches `url` into `destination`, returning the number of bytes written.
    fn download(
        &mut self,
        url: &str,
        credentials: Option<&Credentials>,
        destination: &Path,
    ) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct HttpDownloaderConfig {
    pub user_agent: String,
    pub connect_timeout_ms: u64,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl HttpDownloaderConfig {
    pub fn from_env() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout_ms: env_value_u64(
                "HEAVY_LIFTER_HTTP_CONNECT_TIMEOUT_MS",
                DEFAULT_CONNECT_TIMEOUT_MS,
            ),
            timeout_ms: env_value_u64("HEAVY_LIFTER_HTTP_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
            max_retries: env_value_u64("HEAVY_LIFTER_HTTP_RETRIES", DEFAULT_RETRIES as u64)
                as usize,
            retry_delay_ms: env_value_u64(
                "HEAVY_LIFTER_HTTP_RETRY_DELAY_MS",
                DEFAULT_RETRY_DELAY_MS,
            ),
        }
    }
}

/// Blocking HTTP downloader. Redirects are followed by hand so that basic
/// auth is re-sent to every location, like curl `--location-trusted`.
pub struct HttpDownloader {
    client: Client,
    config: HttpDownloaderConfig,
}

impl HttpDownloader {
    pub fn from_env() -> Result<Self> {
        Self::new(HttpDownloaderConfig::from_env())
    }

    pub fn new(config: HttpDownloaderConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.timeout_ms))
            .redirect(Policy::none())
            .build()
            .context("failed to build download HTTP client")?;
        Ok(Self { client, config })
    }

    fn fetch(&self, url: &str, credentials: Option<&Credentials>) -> Result<Response> {
        let mut current = Url::parse(url).with_context(|| format!("invalid download URL: {url}"))?;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = self
                .client
                .get(current.clone())
                .header("User-Agent", self.config.user_agent.clone());
            if let Some(credentials) = credentials {
                request = request.basic_auth(&credentials.username, Some(&credentials.password));
            }
            let response = request.send()?;
            let status = response.status();
            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| anyhow::anyhow!("redirect from {current} has no Location"))?;
                current = current
                    .join(location)
                    .with_context(|| format!("invalid redirect target: {location}"))?;
                continue;
            }
            return Ok(response);
        }
        bail!("too many redirects while downloading {url}")
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl Downloader for HttpDownloader {
    fn download(
        &mut self,
        url: &str,
        credentials: Option<&Credentials>,
        destination: &Path,
    ) -> Result<u64> {
        ensure_parent(destination)?;
        let partial = partial_path(destination);

        for attempt in 0..=self.config.max_retries {
            info!("downloading {url}");
            let mut response = match self.fetch(url, credentials) {
                Ok(response) => response,
                Err(error) => {
                    let retryable = error
                        .downcast_ref::<reqwest::Error>()
                        .is_some_and(is_retryable_error);
                    if attempt < self.config.max_retries && retryable {
                        warn!("download attempt {} failed: {error}", attempt + 1);
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to download {url}"));
                }
            };

            let status = response.status();
            if !status.is_success() {
                if attempt < self.config.max_retries && is_retryable_status(status) {
                    warn!("download attempt {} got HTTP {status}", attempt + 1);
                    self.wait_before_retry(attempt);
                    continue;
                }
                bail!("download of {url} failed with HTTP {status}");
            }

            let mut file = File::create(&partial)
                .with_context(|| format!("failed to create {}", partial.display()))?;
            let bytes = response
                .copy_to(&mut file)
                .with_context(|| format!("failed to write {}", partial.display()))?;
            drop(file);
            fs::rename(&partial, destination).with_context(|| {
                format!(
                    "failed to move {} to {}",
                    partial.display(),
                    destination.display()
                )
            })?;
            return Ok(bytes);
        }

        bail!("download of {url} exhausted retry budget")
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use anyhow::{Result, bail};

    use super::{Downloader, partial_path};
    use crate::config::Credentials;

    /// Writes canned bytes instead of touching the network.
    #[derive(Debug, Default)]
    pub(crate) struct FakeDownloader {
        pub(crate) body: Vec<u8>,
        pub(crate) fail: bool,
        pub(crate) requests: Vec<(String, Option<String>, PathBuf)>,
    }

    impl Downloader for FakeDownloader {
        fn download(
            &mut self,
            url: &str,
            credentials: Option<&Credentials>,
            destination: &Path,
        ) -> Result<u64> {
            self.requests.push((
                url.to_string(),
                credentials.map(|credentials| credentials.username.clone()),
                destination.to_path_buf(),
            ));
            if self.fail {
                bail!("download of {url} failed with HTTP 401 Unauthorized");
            }
            if let Some(parent) = destination.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(destination, &self.body)?;
            Ok(self.body.len() as u64)
        }
    }

    #[test]
    fn partial_path_appends_suffix() {
        assert_eq!(
            partial_path(Path::new("/tmp/database.sql.gz")),
            PathBuf::from("/tmp/database.sql.gz.part")
        );
    }
}
