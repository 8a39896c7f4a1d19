use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{CONFIG_FILENAME, ProjectConfig, embedded_example_config, site_key};
use crate::exec::{CommandRunner, CommandSpec, ExecStack};
use crate::runtime::{ResolvedPaths, normalize_for_display};

pub const DEFAULT_DEVELOP_PASSWORD: &str = "password";
pub const DEVEL_PERMISSION: &str = "access devel information";
const DEVELOP_MODULES: &[&str] = &["devel", "webprofiler"];
const DEVEL_ROLES: &[&str] = &["anonymous", "authenticated"];
const DEV_CONFIG_PROFILE: &str = "dev";

#[derive(Debug, Clone, Serialize)]
pub struct DevelopReport {
    pub password_reset_for: Option<String>,
    pub drush_major: Option<u32>,
    pub modules_enabled: Vec<String>,
    pub dev_config_imported: bool,
    pub steps: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Created,
    LeftIntact,
}

impl FileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::LeftIntact => "already exists, left intact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GitignoreStatus {
    Added,
    AlreadyIgnored,
    Missing,
}

impl GitignoreStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "entry added",
            Self::AlreadyIgnored => "already ignored",
            Self::Missing => "no .gitignore",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteConfigReport {
    pub example_path: String,
    pub example: FileStatus,
    pub personal_path: String,
    pub personal: FileStatus,
    pub gitignore: GitignoreStatus,
}

/// Turn a freshly synced site into a development instance.
pub fn develop_site(
    paths: &ResolvedPaths,
    config: &ProjectConfig,
    site_name: &str,
    new_password: &str,
    runner: &mut dyn CommandRunner,
) -> Result<DevelopReport> {
    config.validate()?;
    let site = config.site(site_name);
    let admin = site
        .develop
        .admin_username
        .filter(|value| !value.trim().is_empty());
    if admin.is_none() {
        warn!(
            "{} not set, password will not be reset",
            site_key(site_name, "develop.admin_username")
        );
    }

    let drush = paths.drush_executable()?;
    let drush_command = || CommandSpec::program_path(&drush).current_dir(&paths.project_root);
    let mut stack = ExecStack::new();

    let mut drush_major = None;
    if let Some(admin) = admin.as_deref() {
        let version = runner.run(&drush_command().arg("--version"))?;
        drush_major = parse_drush_major(&version.stdout);
        let reset = match drush_major {
            Some(major) if major < 9 => drush_command()
                .arg("user:password")
                .arg(format!("--password={new_password}"))
                .arg(admin),
            Some(_) => drush_command()
                .arg("user:password")
                .arg(admin)
                .arg(new_password),
            None => {
                warn!("could not detect the Drush version, assuming Drush 9 or later");
                drush_command()
                    .arg("user:password")
                    .arg(admin)
                    .arg(new_password)
            }
        };
        stack.push(reset);
    }

    for module in DEVELOP_MODULES {
        stack.push(drush_command().arg("pm:enable").arg(*module).arg("-y"));
    }
    for role in DEVEL_ROLES {
        stack.push(
            drush_command()
                .arg("role:perm:add")
                .arg(*role)
                .arg(DEVEL_PERMISSION),
        );
    }
    stack.push(
        drush_command()
            .arg("config:set")
            .arg("devel.settings")
            .arg("devel_dumper")
            .arg("var_dumper")
            .arg("-y"),
    );

    let dev_config_imported = paths
        .project_root
        .join("config")
        .join(DEV_CONFIG_PROFILE)
        .is_dir();
    if dev_config_imported {
        stack.push(
            drush_command()
                .arg("config:import")
                .arg(DEV_CONFIG_PROFILE)
                .arg("--partial")
                .arg("-y"),
        );
    } else {
        warn!("Skipping import of '{DEV_CONFIG_PROFILE}' profile because it's missing");
    }

    let steps = stack.run(runner)?;
    Ok(DevelopReport {
        password_reset_for: admin,
        drush_major,
        modules_enabled: DEVELOP_MODULES.iter().map(|module| module.to_string()).collect(),
        dev_config_imported,
        steps,
    })
}

/// First number in `drush --version` output, e.g. "Drush Commandline Tool 10.6.2"
/// or " Drush Version   :  8.4.8".
fn parse_drush_major(output: &str) -> Option<u32> {
    let start = output.find(|ch: char| ch.is_ascii_digit())?;
    let digits: String = output[start..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Write the example and personal config files and keep the personal one
/// out of git. Existing files are never overwritten.
pub fn write_site_config(paths: &ResolvedPaths) -> Result<SiteConfigReport> {
    let example_path = paths.example_config_path();
    let example = write_if_absent(&example_path)?;
    match example {
        FileStatus::Created => info!("Configuration template created: {}", example_path.display()),
        FileStatus::LeftIntact => info!(
            "Configuration file already exists and it was left intact: {}",
            example_path.display()
        ),
    }

    let personal_path = paths.project_root.join(CONFIG_FILENAME);
    let personal = write_if_absent(&personal_path)?;
    match personal {
        FileStatus::Created => info!("Your personal configuration created: {}", personal_path.display()),
        FileStatus::LeftIntact => info!(
            "Personal configuration already exists and it was left intact: {}",
            personal_path.display()
        ),
    }

    let gitignore = ignore_personal_config(&paths.project_root.join(".gitignore"))?;
    Ok(SiteConfigReport {
        example_path: normalize_for_display(&example_path),
        example,
        personal_path: normalize_for_display(&personal_path),
        personal,
        gitignore,
    })
}

fn write_if_absent(path: &Path) -> Result<FileStatus> {
    if path.exists() {
        return Ok(FileStatus::LeftIntact);
    }
    fs::write(path, embedded_example_config())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(FileStatus::Created)
}

fn ignore_personal_config(gitignore: &Path) -> Result<GitignoreStatus> {
    if !gitignore.is_file() {
        return Ok(GitignoreStatus::Missing);
    }
    let content = fs::read_to_string(gitignore)
        .with_context(|| format!("failed to read {}", gitignore.display()))?;
    let already = content.lines().any(|line| {
        let line = line.trim();
        line == CONFIG_FILENAME || line.strip_prefix('/') == Some(CONFIG_FILENAME)
    });
    if already {
        info!(".gitignore already ignores {CONFIG_FILENAME}");
        return Ok(GitignoreStatus::AlreadyIgnored);
    }

    let mut updated = content;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(CONFIG_FILENAME);
    updated.push('\n');
    fs::write(gitignore, updated)
        .with_context(|| format!("failed to write {}", gitignore.display()))?;
    info!("Added {CONFIG_FILENAME} to project .gitignore");
    Ok(GitignoreStatus::Added)
}

/// Validates the configuration and does nothing else.
pub fn do_nothing(config: &ProjectConfig) -> Result<()> {
    config.validate()?;
    info!("Done doing nothing");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tempfile::tempdir;

    use super::{
        FileStatus, GitignoreStatus, develop_site, do_nothing, parse_drush_major,
        write_site_config,
    };
    use crate::config::{ProjectConfig, embedded_example_config};
    use crate::exec::tests::RecordingRunner;
    use crate::runtime::tests::project_paths;

    fn config(admin: Option<&str>) -> ProjectConfig {
        let develop = admin
            .map(|name| format!("\n[project.sites.default.develop]\nadmin_username = \"{name}\"\n"))
            .unwrap_or_default();
        toml::from_str(&format!("[project]\nversion = \"2.0\"\n{develop}")).expect("parse config")
    }

    fn install_drush(root: &Path) -> PathBuf {
        let bin = root.join("vendor/bin");
        fs::create_dir_all(&bin).expect("vendor/bin");
        fs::write(bin.join("drush"), "#!/bin/sh\n").expect("drush");
        bin.join("drush")
    }

    #[test]
    fn parses_drush_versions() {
        assert_eq!(parse_drush_major("Drush Commandline Tool 10.6.2\n"), Some(10));
        assert_eq!(parse_drush_major(" Drush Version   :  8.4.8 \n"), Some(8));
        assert_eq!(parse_drush_major("drush"), None);
    }

    #[test]
    fn develop_site_with_drush_9_and_dev_config() {
        let temp = tempdir().expect("tempdir");
        let drush = install_drush(temp.path());
        fs::create_dir_all(temp.path().join("config/dev")).expect("config/dev");
        let paths = project_paths(temp.path());
        let mut runner = RecordingRunner::default();
        runner.reply(0, "Drush Commandline Tool 9.7.1\n");

        let report = develop_site(&paths, &config(Some("admin")), "default", "secret", &mut runner)
            .expect("develop");

        let drush = drush.display();
        assert_eq!(
            runner.rendered(),
            vec![
                format!("{drush} --version"),
                format!("{drush} user:password admin secret"),
                format!("{drush} pm:enable devel -y"),
                format!("{drush} pm:enable webprofiler -y"),
                format!("{drush} role:perm:add anonymous 'access devel information'"),
                format!("{drush} role:perm:add authenticated 'access devel information'"),
                format!("{drush} config:set devel.settings devel_dumper var_dumper -y"),
                format!("{drush} config:import dev --partial -y"),
            ]
        );
        assert_eq!(report.password_reset_for.as_deref(), Some("admin"));
        assert_eq!(report.drush_major, Some(9));
        assert!(report.dev_config_imported);
        assert_eq!(report.steps, 7);
    }

    #[test]
    fn develop_site_uses_drush_8_password_form() {
        let temp = tempdir().expect("tempdir");
        let drush = install_drush(temp.path());
        let paths = project_paths(temp.path());
        let mut runner = RecordingRunner::default();
        runner.reply(0, " Drush Version   :  8.1.17 \n");

        let report = develop_site(&paths, &config(Some("admin")), "default", "password", &mut runner)
            .expect("develop");

        assert_eq!(
            runner.rendered()[1],
            format!("{} user:password --password=password admin", drush.display())
        );
        assert!(!report.dev_config_imported);
        assert!(!runner.rendered().iter().any(|line| line.contains("config:import")));
    }

    #[test]
    fn develop_site_skips_password_without_admin() {
        let temp = tempdir().expect("tempdir");
        install_drush(temp.path());
        let paths = project_paths(temp.path());
        let mut runner = RecordingRunner::default();

        let report =
            develop_site(&paths, &config(None), "default", "password", &mut runner).expect("develop");

        assert!(report.password_reset_for.is_none());
        assert!(
            !runner
                .rendered()
                .iter()
                .any(|line| line.contains("user:password") || line.contains("--version"))
        );
        assert_eq!(report.steps, 5);
    }

    #[test]
    fn site_config_never_overwrites_and_ignores_once() {
        let temp = tempdir().expect("tempdir");
        let paths = project_paths(temp.path());
        fs::write(temp.path().join("heavy-lifter.toml"), "mine").expect("personal");
        fs::write(temp.path().join(".gitignore"), "/vendor").expect("gitignore");

        let report = write_site_config(&paths).expect("site config");
        assert_eq!(report.example, FileStatus::Created);
        assert_eq!(report.personal, FileStatus::LeftIntact);
        assert_eq!(report.gitignore, GitignoreStatus::Added);
        assert_eq!(
            fs::read_to_string(temp.path().join("example.heavy-lifter.toml")).expect("example"),
            embedded_example_config()
        );
        assert_eq!(
            fs::read_to_string(temp.path().join("heavy-lifter.toml")).expect("personal"),
            "mine"
        );

        let again = write_site_config(&paths).expect("site config again");
        assert_eq!(again.example, FileStatus::LeftIntact);
        assert_eq!(again.gitignore, GitignoreStatus::AlreadyIgnored);
        assert_eq!(
            fs::read_to_string(temp.path().join(".gitignore")).expect("gitignore"),
            "/vendor\nheavy-lifter.toml\n"
        );
    }

    #[test]
    fn site_config_without_gitignore() {
        let temp = tempdir().expect("tempdir");
        let report = write_site_config(&project_paths(temp.path())).expect("site config");
        assert_eq!(report.personal, FileStatus::Created);
        assert_eq!(report.gitignore, GitignoreStatus::Missing);
        assert!(!temp.path().join(".gitignore").exists());
    }

    #[test]
    fn do_nothing_validates_config() {
        assert!(do_nothing(&config(None)).is_ok());
        let err = do_nothing(&ProjectConfig::default()).expect_err("must fail");
        assert!(err.to_string().contains("format version: 2.0"));
    }
}
