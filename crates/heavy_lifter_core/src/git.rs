use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use crate::exec::{CommandRunner, CommandSpec, ExecStack, run_checked};
use crate::runtime::{ResolvedPaths, normalize_for_display};

const PRE_COMMIT_HOOK: &str = include_str!("../assets/pre-commit");
const PRE_COMMIT_HOOK_WITH_WARNINGS: &str = include_str!("../assets/pre-commit-with-warnings");

const PHPCS_PACKAGE: &str = "squizlabs/php_codesniffer";
const CODER_PACKAGE: &str = "drupal/coder";
const CODER_SNIFFER_PATH: &str = "drupal/coder/coder_sniffer";
const CODER_INSTALLED_PATHS: &str = "../../drupal/coder/coder_sniffer";

#[derive(Debug, Clone, Copy, Default)]
pub struct PhpcsHookOptions {
    pub disable: bool,
    pub accept_warnings: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    Installed,
    InstalledWithWarnings,
    Removed,
    AlreadyDisabled,
}

impl HookAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::InstalledWithWarnings => "installed (warnings accepted)",
            Self::Removed => "removed",
            Self::AlreadyDisabled => "already disabled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PhpcsHookReport {
    pub action: HookAction,
    pub hook_path: String,
    pub backup_created: bool,
    pub packages_installed: Vec<String>,
    pub sniffs_registered: bool,
    pub phpcs_xml_created: bool,
}

/// Install or remove the phpcs git pre-commit hook, preparing phpcs and the
/// Drupal coder standard on the way.
pub fn install_phpcs_pre_commit(
    paths: &ResolvedPaths,
    options: PhpcsHookOptions,
    runner: &mut dyn CommandRunner,
) -> Result<PhpcsHookReport> {
    let git_dir = paths.git_dir();
    if !git_dir.exists() {
        bail!(
            "This command can only be run inside git repositories. Please run `git init` first."
        );
    }

    let packages_installed = install_missing_packages(paths, runner)?;
    let sniffs_registered = register_coder_sniffs(paths, runner)?;
    let phpcs_xml_created = ensure_phpcs_xml(paths)?;

    let hooks_dir = git_dir.join("hooks");
    let hook = hooks_dir.join("pre-commit");
    let backup = hooks_dir.join("pre-commit.backup");
    let mut backup_created = false;

    let action = if options.disable {
        if !hook.is_file() {
            info!("The phpcs pre-commit hook is already disabled");
            HookAction::AlreadyDisabled
        } else {
            backup_created = backup_once(&hook, &backup)?;
            fs::remove_file(&hook)
                .with_context(|| format!("failed to remove {}", hook.display()))?;
            HookAction::Removed
        }
    } else {
        if hook.is_file() {
            backup_created = backup_once(&hook, &backup)?;
        }
        let (script, action) = if options.accept_warnings {
            (PRE_COMMIT_HOOK_WITH_WARNINGS, HookAction::InstalledWithWarnings)
        } else {
            (PRE_COMMIT_HOOK, HookAction::Installed)
        };
        fs::create_dir_all(&hooks_dir)
            .with_context(|| format!("failed to create {}", hooks_dir.display()))?;
        fs::write(&hook, script).with_context(|| format!("failed to write {}", hook.display()))?;
        make_executable(&hook)?;
        action
    };

    Ok(PhpcsHookReport {
        action,
        hook_path: normalize_for_display(&hook),
        backup_created,
        packages_installed,
        sniffs_registered,
        phpcs_xml_created,
    })
}

fn install_missing_packages(
    paths: &ResolvedPaths,
    runner: &mut dyn CommandRunner,
) -> Result<Vec<String>> {
    let mut stack = ExecStack::new();
    let mut installed = Vec::new();
    for package in [PHPCS_PACKAGE, CODER_PACKAGE] {
        if package_dir(paths, package).is_dir() {
            continue;
        }
        stack.push(
            CommandSpec::new("composer")
                .arg("require")
                .arg(package)
                .current_dir(&paths.project_root),
        );
        installed.push(package.to_string());
    }
    if stack.is_empty() {
        return Ok(installed);
    }
    stack.run(runner).context("failed to install phpcs packages")?;

    if installed.iter().any(|package| package == CODER_PACKAGE) {
        let coder_git = package_dir(paths, CODER_PACKAGE).join(".git");
        if coder_git.exists() {
            fs::remove_dir_all(&coder_git)
                .with_context(|| format!("failed to remove {}", coder_git.display()))?;
        }
    }
    Ok(installed)
}

/// Returns true when the coder standard had to be registered.
fn register_coder_sniffs(paths: &ResolvedPaths, runner: &mut dyn CommandRunner) -> Result<bool> {
    let phpcs = paths.vendor_dir.join("bin").join("phpcs");
    let show = runner.run(&CommandSpec::program_path(&phpcs).arg("--config-show"))?;
    if show.stdout.contains(CODER_SNIFFER_PATH) {
        return Ok(false);
    }
    run_checked(
        runner,
        &CommandSpec::program_path(&phpcs)
            .arg("--config-set")
            .arg("installed_paths")
            .arg(CODER_INSTALLED_PATHS),
    )?;
    Ok(true)
}

fn ensure_phpcs_xml(paths: &ResolvedPaths) -> Result<bool> {
    let target = paths.project_root.join("phpcs.xml");
    if target.exists() {
        return Ok(false);
    }
    let source = paths
        .require_drupal_root()?
        .join("core")
        .join("phpcs.xml.dist");
    fs::copy(&source, &target).with_context(|| {
        format!(
            "failed to copy {} to {}",
            source.display(),
            target.display()
        )
    })?;
    Ok(true)
}

/// Keep the first hook found so a hand-written one is never lost.
fn backup_once(hook: &Path, backup: &Path) -> Result<bool> {
    if backup.exists() {
        return Ok(false);
    }
    fs::copy(hook, backup).with_context(|| format!("failed to back up {}", hook.display()))?;
    Ok(true)
}

fn package_dir(paths: &ResolvedPaths, package: &str) -> PathBuf {
    package
        .split('/')
        .fold(paths.vendor_dir.clone(), |dir, part| dir.join(part))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?
        .permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
