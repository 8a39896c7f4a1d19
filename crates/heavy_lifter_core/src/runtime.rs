use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::config::CONFIG_FILENAME;

const DRUPAL_ROOT_CANDIDATES: &[&str] = &["web", "docroot", "."];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Heuristic,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Heuristic => "heuristic",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub project_root: Option<PathBuf>,
    pub drupal_root: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
    pub executable_dir: Option<PathBuf>,
    pub temp_dir: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        let executable_dir = env::current_exe()
            .ok()
            .and_then(|path| path.parent().map(Path::to_path_buf));
        Ok(Self {
            cwd,
            executable_dir,
            temp_dir: env::temp_dir(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub working_dir: PathBuf,
    pub project_root: PathBuf,
    pub drupal_root: Option<PathBuf>,
    pub vendor_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub config_path: PathBuf,
    pub root_source: ValueSource,
    pub drupal_source: ValueSource,
    pub config_source: ValueSource,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "working_dir={}\nproject_root={} ({})\ndrupal_root={} ({})\nvendor_dir={}\ntmp_dir={}\nconfig_path={} ({})",
            normalize_for_display(&self.working_dir),
            normalize_for_display(&self.project_root),
            self.root_source.as_str(),
            self.drupal_root
                .as_deref()
                .map(normalize_for_display)
                .unwrap_or_else(|| "<not found>".to_string()),
            self.drupal_source.as_str(),
            normalize_for_display(&self.vendor_dir),
            normalize_for_display(&self.tmp_dir),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }

    /// Drupal installation folder, required by most commands.
    pub fn require_drupal_root(&self) -> Result<&Path> {
        match self.drupal_root.as_deref() {
            Some(root) => Ok(root),
            None => bail!(
                "Cannot find the Drupal installation folder under {} (looked for web/, docroot/ and ./ containing core/). Use --drupal-root to point at it.",
                normalize_for_display(&self.project_root)
            ),
        }
    }

    /// `<drupal>/sites/<site>/files`.
    pub fn site_files_dir(&self, site: &str) -> Result<PathBuf> {
        Ok(self
            .require_drupal_root()?
            .join("sites")
            .join(site)
            .join("files"))
    }

    pub fn drush_executable(&self) -> Result<PathBuf> {
        let candidates = [
            self.vendor_dir.join("bin").join("drush"),
            self.vendor_dir.join("drush").join("drush").join("drush"),
        ];
        for candidate in candidates {
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        bail!("Cannot find Drush executable inside this project");
    }

    pub fn git_dir(&self) -> PathBuf {
        self.project_root.join(".git")
    }

    pub fn example_config_path(&self) -> PathBuf {
        self.project_root
            .join(crate::config::EXAMPLE_CONFIG_FILENAME)
    }

    /// Relative paths are taken from the directory the command was started in.
    pub fn absolutize_from_working_dir(&self, path: &Path) -> PathBuf {
        absolutize(path, &self.working_dir)
    }

    pub fn absolutize_from_project(&self, path: &Path) -> PathBuf {
        absolutize(path, &self.project_root)
    }
}

/// Several commands wrap GNU userland tools and only run on Linux.
pub fn ensure_linux() -> Result<()> {
    if !cfg!(target_os = "linux") {
        bail!(
            "This command is only supported on Linux (current platform: {})",
            env::consts::OS
        );
    }
    Ok(())
}

pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> Result<ResolvedPaths> {
    resolve_paths_with_lookup(context, overrides, |key| env::var(key).ok())
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: F,
) -> Result<ResolvedPaths>
where
    F: Fn(&str) -> Option<String>,
{
    let (project_root, root_source) = resolve_project_root(context, overrides, &lookup_env)
        .context("failed to resolve project root")?;

    let (drupal_root, drupal_source) = if let Some(path) = overrides.drupal_root.as_deref() {
        (Some(absolutize(path, &project_root)), ValueSource::Flag)
    } else if let Some(value) = non_empty_env(&lookup_env, "HEAVY_LIFTER_DRUPAL_ROOT") {
        (
            Some(absolutize(Path::new(&value), &project_root)),
            ValueSource::Env,
        )
    } else {
        (detect_drupal_root(&project_root), ValueSource::Heuristic)
    };

    let (config_path, config_source) = if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &project_root), ValueSource::Flag)
    } else if let Some(value) = non_empty_env(&lookup_env, "HEAVY_LIFTER_CONFIG") {
        (absolutize(Path::new(&value), &project_root), ValueSource::Env)
    } else {
        (project_root.join(CONFIG_FILENAME), ValueSource::Default)
    };

    let tmp_dir = match non_empty_env(&lookup_env, "HEAVY_LIFTER_TMP_DIR") {
        Some(value) => absolutize(Path::new(&value), &context.cwd),
        None => context.temp_dir.clone(),
    };

    Ok(ResolvedPaths {
        working_dir: context.cwd.clone(),
        vendor_dir: project_root.join("vendor"),
        project_root,
        drupal_root,
        tmp_dir,
        config_path,
        root_source,
        drupal_source,
        config_source,
    })
}

fn resolve_project_root<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> Result<(PathBuf, ValueSource)>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.project_root.as_deref() {
        return Ok((absolutize(path, &context.cwd), ValueSource::Flag));
    }

    if let Some(value) = non_empty_env(lookup_env, "HEAVY_LIFTER_PROJECT_ROOT") {
        return Ok((
            absolutize(Path::new(&value), &context.cwd),
            ValueSource::Env,
        ));
    }

    let root = detect_project_root_heuristic(&context.cwd, context.executable_dir.as_deref());
    Ok((root, ValueSource::Heuristic))
}

fn detect_project_root_heuristic(cwd: &Path, executable_dir: Option<&Path>) -> PathBuf {
    let mut seen = HashSet::new();
    for candidate in candidate_roots(cwd, executable_dir) {
        let key = normalize_for_display(&candidate);
        if !seen.insert(key) {
            continue;
        }
        if candidate.join("composer.json").is_file() {
            return candidate;
        }
    }
    cwd.to_path_buf()
}

fn detect_drupal_root(project_root: &Path) -> Option<PathBuf> {
    DRUPAL_ROOT_CANDIDATES
        .iter()
        .map(|candidate| {
            if *candidate == "." {
                project_root.to_path_buf()
            } else {
                project_root.join(candidate)
            }
        })
        .find(|candidate| candidate.join("core").is_dir())
}

fn candidate_roots(cwd: &Path, executable_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut out = ancestors(cwd);
    if let Some(exe_dir) = executable_dir {
        out.extend(ancestors(exe_dir));
    }
    out
}

fn ancestors(path: &Path) -> Vec<PathBuf> {
    path.ancestors().map(Path::to_path_buf).collect()
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn non_empty_env<F>(lookup_env: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup_env(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
