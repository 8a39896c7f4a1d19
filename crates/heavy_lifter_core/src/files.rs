use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Serialize;
use tracing::info;

use crate::config::{ProjectConfig, ensure_https, require_site_value, site_key};
use crate::download::Downloader;
use crate::exec::{CommandRunner, CommandSpec, run_checked};
use crate::runtime::{ResolvedPaths, ensure_linux, normalize_for_display};

pub const FILES_ARCHIVE_NAME: &str = "files.tar.gz";
/// Generated assets that are rebuilt on the target and stay out of archives.
pub const ARCHIVE_EXCLUDES: &[&str] = &["css", "js", "php", "styles", "languages", "xmlsitemap"];
pub const PERMISSIONS_REMINDER: &str =
    "Do not forget to check permissions on the files/*. Use \"chown\" to fix them.";

#[derive(Debug, Clone, Serialize)]
pub struct FilesSyncReport {
    pub source: String,
    pub files_dir: String,
    pub archive: String,
    pub downloaded_bytes: u64,
    pub removed_entries: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesArchiveReport {
    pub output: String,
    pub files_dir: String,
    pub replaced_existing: bool,
}

/// Replace the site's public files with the staging archive.
pub fn sync_files(
    paths: &ResolvedPaths,
    config: &ProjectConfig,
    site_name: &str,
    downloader: &mut dyn Downloader,
    runner: &mut dyn CommandRunner,
) -> Result<FilesSyncReport> {
    ensure_linux()?;
    config.validate()?;
    let site = config.site(site_name);
    ensure_https(site.files.sync.source.as_deref(), "Files sync")?;
    let Some(source) = require_site_value(site.files.sync.source.as_ref(), site_name, "files.sync.source")
    else {
        bail!(
            "Missing configuration key: {}",
            site_key(site_name, "files.sync.source")
        );
    };
    let credentials = config.sync_credentials(site_name);

    let files_dir = paths.site_files_dir(site_name)?;
    if !is_writable_dir(&files_dir) {
        bail!(
            "{} does not exist or it is not writable",
            normalize_for_display(&files_dir)
        );
    }

    let archive = paths.tmp_dir.join(FILES_ARCHIVE_NAME);
    let downloaded_bytes = downloader.download(&source, credentials.as_ref(), &archive)?;
    info!("downloaded {downloaded_bytes} bytes to {}", archive.display());

    let removed_entries = clear_directory(&files_dir)?;
    run_checked(
        runner,
        &CommandSpec::new("tar")
            .arg("zxf")
            .path_arg(&archive)
            .arg("-p")
            .arg("--strip-components=1")
            .current_dir(&files_dir),
    )?;
    remove_if_exists(&archive)?;

    Ok(FilesSyncReport {
        source,
        files_dir: normalize_for_display(&files_dir),
        archive: normalize_for_display(&archive),
        downloaded_bytes,
        removed_entries,
    })
}

/// Pack the site's files directory into a gzip tarball.
pub fn archive_files(
    paths: &ResolvedPaths,
    config: &ProjectConfig,
    site_name: &str,
    output: Option<&Path>,
    runner: &mut dyn CommandRunner,
) -> Result<FilesArchiveReport> {
    ensure_linux()?;
    let site = config.site(site_name);
    let output = match output {
        Some(path) => path.to_path_buf(),
        None => match require_site_value(site.files.dump.location.as_ref(), site_name, "files.dump.location") {
            Some(path) => path,
            None => bail!(
                "No archive output given and {} is not set",
                site_key(site_name, "files.dump.location")
            ),
        },
    };
    let output = paths.absolutize_from_working_dir(&output);

    let files_dir = paths.site_files_dir(site_name)?;
    if !files_dir.is_dir() {
        bail!(
            "{} does not exist",
            normalize_for_display(&files_dir)
        );
    }

    let replaced_existing = remove_if_exists(&output)?;
    run_checked(runner, &archive_command(&output, &files_dir))?;

    Ok(FilesArchiveReport {
        output: normalize_for_display(&output),
        files_dir: normalize_for_display(&files_dir),
        replaced_existing,
    })
}

fn archive_command(output: &Path, files_dir: &Path) -> CommandSpec {
    CommandSpec::new("tar")
        .arg("cfz")
        .path_arg(output)
        .args(ARCHIVE_EXCLUDES.iter().map(|name| format!("--exclude={name}")))
        .arg(".")
        .current_dir(files_dir)
}

/// Remove every entry of `dir`, dotfiles included, keeping `dir` itself.
fn clear_directory(dir: &Path) -> Result<usize> {
    let mut removed = 0usize;
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        let path: PathBuf = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to inspect {}", path.display()))?;
        if file_type.is_dir() {
            fs::remove_dir_all(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        } else {
            fs::remove_file(&path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        removed += 1;
    }
    Ok(removed)
}

fn is_writable_dir(path: &Path) -> bool {
    fs::metadata(path)
        .map(|metadata| metadata.is_dir() && !metadata.permissions().readonly())
        .unwrap_or(false)
}

/// Returns whether something was removed.
pub(crate) fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::tempdir;

    use super::{ARCHIVE_EXCLUDES, archive_files, sync_files};
    use crate::config::ProjectConfig;
    use crate::download::tests::FakeDownloader;
    use crate::exec::tests::RecordingRunner;
    use crate::runtime::tests::project_paths;

    fn config(extra: &str) -> ProjectConfig {
        toml::from_str(&format!(
            "[project]\nversion = \"2.0\"\n\n[project.sites.default.sync]\nusername = \"deploy\"\npassword = \"secret\"\n{extra}"
        ))
        .expect("parse config")
    }

    #[test]
    fn sync_files_downloads_clears_and_extracts() {
        let temp = tempdir().expect("tempdir");
        let paths = project_paths(temp.path());
        let files_dir = temp.path().join("web/sites/default/files");
        fs::create_dir_all(files_dir.join("styles/thumb")).expect("styles");
        fs::write(files_dir.join("old.png"), "old").expect("old file");
        fs::write(files_dir.join(".htaccess"), "deny").expect("dotfile");

        let config = config(
            "[project.sites.default.files.sync]\nsource = \"https://staging.example.org/files.tar.gz\"\n",
        );
        let mut downloader = FakeDownloader {
            body: b"archive".to_vec(),
            ..FakeDownloader::default()
        };
        let mut runner = RecordingRunner::default();

        let report = sync_files(&paths, &config, "default", &mut downloader, &mut runner)
            .expect("sync files");

        assert_eq!(report.downloaded_bytes, 7);
        assert_eq!(report.removed_entries, 3);
        assert_eq!(fs::read_dir(&files_dir).expect("list").count(), 0);
        assert_eq!(downloader.requests.len(), 1);
        assert_eq!(
            downloader.requests[0].0,
            "https://staging.example.org/files.tar.gz"
        );
        assert_eq!(downloader.requests[0].1.as_deref(), Some("deploy"));

        let archive = paths.tmp_dir.join("files.tar.gz");
        assert_eq!(
            runner.rendered(),
            vec![format!(
                "tar zxf {} -p --strip-components=1",
                archive.display()
            )]
        );
        assert_eq!(runner.commands[0].current_dir.as_deref(), Some(files_dir.as_path()));
        assert!(!archive.exists());
    }

    #[test]
    fn sync_files_rejects_plain_http_source() {
        let temp = tempdir().expect("tempdir");
        let paths = project_paths(temp.path());
        let config = config(
            "[project.sites.default.files.sync]\nsource = \"http://staging.example.org/files.tar.gz\"\n",
        );
        let err = sync_files(
            &paths,
            &config,
            "default",
            &mut FakeDownloader::default(),
            &mut RecordingRunner::default(),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("Files sync URL is not HTTPS"));
    }

    #[test]
    fn sync_files_requires_files_dir() {
        let temp = tempdir().expect("tempdir");
        let paths = project_paths(temp.path());
        let config = config(
            "[project.sites.default.files.sync]\nsource = \"https://staging.example.org/files.tar.gz\"\n",
        );
        let mut downloader = FakeDownloader::default();
        let err = sync_files(
            &paths,
            &config,
            "default",
            &mut downloader,
            &mut RecordingRunner::default(),
        )
        .expect_err("must fail");
        assert!(err.to_string().contains("does not exist or it is not writable"));
        assert!(downloader.requests.is_empty());
    }

    #[test]
    fn failed_download_leaves_files_alone() {
        let temp = tempdir().expect("tempdir");
        let paths = project_paths(temp.path());
        let files_dir = temp.path().join("web/sites/default/files");
        fs::create_dir_all(&files_dir).expect("files dir");
        fs::write(files_dir.join("keep.png"), "keep").expect("file");

        let config = config(
            "[project.sites.default.files.sync]\nsource = \"https://staging.example.org/files.tar.gz\"\n",
        );
        let mut downloader = FakeDownloader {
            fail: true,
            ..FakeDownloader::default()
        };
        let mut runner = RecordingRunner::default();
        let err = sync_files(&paths, &config, "default", &mut downloader, &mut runner)
            .expect_err("must fail");
        assert!(err.to_string().contains("401"));
        assert!(files_dir.join("keep.png").is_file());
        assert!(runner.commands.is_empty());
    }

    #[test]
    fn archive_files_uses_configured_location_and_excludes() {
        let temp = tempdir().expect("tempdir");
        let paths = project_paths(temp.path());
        let files_dir = temp.path().join("web/sites/default/files");
        fs::create_dir_all(&files_dir).expect("files dir");
        let output = temp.path().join("dump").join("files.tar.gz");
        fs::create_dir_all(output.parent().expect("parent")).expect("dump dir");
        fs::write(&output, "stale").expect("stale archive");

        let config = config("[project.sites.default.files.dump]\nlocation = \"dump/files.tar.gz\"\n");
        let mut runner = RecordingRunner::default();
        let report =
            archive_files(&paths, &config, "default", None, &mut runner).expect("archive");

        assert!(report.replaced_existing);
        assert!(!output.exists());
        let excludes = ARCHIVE_EXCLUDES
            .iter()
            .map(|name| format!("--exclude={name}"))
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(
            runner.rendered(),
            vec![format!("tar cfz {} {excludes} .", output.display())]
        );
        assert_eq!(runner.commands[0].current_dir.as_deref(), Some(files_dir.as_path()));
    }

    #[test]
    fn archive_files_explicit_output_wins() {
        let temp = tempdir().expect("tempdir");
        let paths = project_paths(temp.path());
        fs::create_dir_all(temp.path().join("web/sites/default/files")).expect("files dir");

        let mut runner = RecordingRunner::default();
        let report = archive_files(
            &paths,
            &config(""),
            "default",
            Some(Path::new("/backups/files.tgz")),
            &mut runner,
        )
        .expect("archive");
        assert_eq!(report.output, "/backups/files.tgz");
        assert!(!report.replaced_existing);
    }

    #[test]
    fn archive_files_without_output_fails() {
        let temp = tempdir().expect("tempdir");
        let paths = project_paths(temp.path());
        let err = archive_files(
            &paths,
            &config(""),
            "default",
            None,
            &mut RecordingRunner::default(),
        )
        .expect_err("must fail");
        assert!(
            err.to_string()
                .contains("project.sites.default.files.dump.location")
        );
    }
}
