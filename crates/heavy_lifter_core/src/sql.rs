use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::info;

use crate::config::{ProjectConfig, ensure_https, require_site_value, site_key};
use crate::download::Downloader;
use crate::exec::{CommandRunner, CommandSpec, ExecStack};
use crate::files::remove_if_exists;
use crate::runtime::{ResolvedPaths, normalize_for_display};

pub const SQL_DUMP_NAME: &str = "database.sql";
pub const SQL_DUMP_GZ_NAME: &str = "database.sql.gz";

#[derive(Debug, Clone, Serialize)]
pub struct SqlDownloadReport {
    pub url: String,
    pub dump: String,
    pub downloaded_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SqlSyncReport {
    pub download: SqlDownloadReport,
    pub imported: String,
    pub anonymized: bool,
    pub steps: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqlSyncOptions {
    pub anonymize: bool,
}

fn dump_paths(paths: &ResolvedPaths) -> (PathBuf, PathBuf) {
    (
        paths.tmp_dir.join(SQL_DUMP_NAME),
        paths.tmp_dir.join(SQL_DUMP_GZ_NAME),
    )
}

/// Fetch the staging dump into the tmp dir without importing it.
pub fn download_sql(
    paths: &ResolvedPaths,
    config: &ProjectConfig,
    site_name: &str,
    downloader: &mut dyn Downloader,
) -> Result<SqlDownloadReport> {
    config.validate()?;
    let site = config.site(site_name);
    ensure_https(site.sync.sql.url.as_deref(), "SQL sync")?;
    let Some(url) = require_site_value(site.sync.sql.url.as_ref(), site_name, "sync.sql.url") else {
        bail!(
            "Missing configuration key: {}",
            site_key(site_name, "sync.sql.url")
        );
    };
    let credentials = config.sync_credentials(site_name);

    let (dump, dump_gz) = dump_paths(paths);
    remove_if_exists(&dump)?;
    remove_if_exists(&dump_gz)?;

    let downloaded_bytes = downloader.download(&url, credentials.as_ref(), &dump_gz)?;
    info!("downloaded {downloaded_bytes} bytes to {}", dump_gz.display());
    Ok(SqlDownloadReport {
        url,
        dump: normalize_for_display(&dump_gz),
        downloaded_bytes,
    })
}

/// Drop the local database and import a fresh staging dump.
pub fn sync_sql(
    paths: &ResolvedPaths,
    config: &ProjectConfig,
    site_name: &str,
    options: SqlSyncOptions,
    downloader: &mut dyn Downloader,
    runner: &mut dyn CommandRunner,
) -> Result<SqlSyncReport> {
    config.validate()?;
    let drush = paths.drush_executable()?;
    let download = download_sql(paths, config, site_name, downloader)?;
    let (dump, dump_gz) = dump_paths(paths);

    let drush_command = || CommandSpec::program_path(&drush).current_dir(&paths.project_root);
    let mut stack = ExecStack::new();
    stack
        .push(
            CommandSpec::new("gzip")
                .arg("-d")
                .arg("--keep")
                .path_arg(&dump_gz),
        )
        .push(drush_command().arg("sql:drop").arg("-y"))
        .push(
            drush_command()
                .arg("sql:query")
                .arg("--file")
                .path_arg(&dump),
        );
    if options.anonymize {
        stack.push(drush_command().arg("project:anonymize").arg("-y"));
    }
    let steps = stack.run(runner)?;

    Ok(SqlSyncReport {
        download,
        imported: normalize_for_display(&dump),
        anonymized: options.anonymize,
        steps,
    })
}
