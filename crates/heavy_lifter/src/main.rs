use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use heavy_lifter_core::config::{DEFAULT_SITE, ProjectConfig, load_config};
use heavy_lifter_core::download::HttpDownloader;
use heavy_lifter_core::exec::SystemRunner;
use heavy_lifter_core::files::{PERMISSIONS_REMINDER, archive_files, sync_files};
use heavy_lifter_core::git::{PhpcsHookOptions, install_phpcs_pre_commit};
use heavy_lifter_core::integrity::{IntegrityOptions, Problem, check_integrity};
use heavy_lifter_core::logging::init_logging;
use heavy_lifter_core::registry::{SqliteFileRegistry, site_database_path};
use heavy_lifter_core::report::render_integrity_report;
use heavy_lifter_core::runtime::{PathOverrides, ResolutionContext, ResolvedPaths, resolve_paths};
use heavy_lifter_core::site::{
    DEFAULT_DEVELOP_PASSWORD, develop_site, do_nothing, write_site_config,
};
use heavy_lifter_core::sql::{SqlSyncOptions, download_sql, sync_sql};
use heavy_lifter_core::streams::StreamPaths;

#[derive(Debug, Parser)]
#[command(
    name = "heavy-lifter",
    version,
    about = "Drupal project chores: staging sync, file archives, phpcs hooks and file integrity checks"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    drupal_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log debug output to stderr")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    drupal_root: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            drupal_root: cli.drupal_root.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(name = "files:sync", about = "Replace the public files with the staging archive")]
    FilesSync(SiteArgs),
    #[command(name = "files:archive", about = "Pack the public files into a tarball")]
    FilesArchive(FilesArchiveArgs),
    #[command(
        name = "files:integrity-check",
        about = "Report managed files that are missing from disk or unused"
    )]
    FilesIntegrityCheck(IntegrityCheckArgs),
    #[command(name = "sql:download", about = "Download the staging database dump")]
    SqlDownload(SiteArgs),
    #[command(name = "sql:sync", about = "Drop the local database and import the staging dump")]
    SqlSync(SqlSyncArgs),
    #[command(name = "git:phpcs-pre-commit", about = "Enable or disable the phpcs pre-commit hook")]
    GitPhpcsPreCommit(PhpcsPreCommitArgs),
    #[command(name = "site:develop", about = "Set up the site for local development")]
    SiteDevelop(SiteDevelopArgs),
    #[command(name = "site:config", about = "Create the project configuration files")]
    SiteConfig,
    #[command(name = "do:nothing", about = "Validate the configuration and exit")]
    DoNothing,
}

#[derive(Debug, Args)]
struct SiteArgs {
    #[arg(long, default_value = DEFAULT_SITE, help = "Site key under project.sites")]
    site: String,
}

#[derive(Debug, Args)]
struct FilesArchiveArgs {
    #[arg(value_name = "OUTPUT", help = "Archive path (defaults to files.dump.location)")]
    output: Option<PathBuf>,
    #[command(flatten)]
    site: SiteArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Args)]
struct IntegrityCheckArgs {
    #[arg(long, value_name = "N", help = "Only check the first N managed files")]
    limit: Option<usize>,
    #[arg(long, value_name = "PATH", help = "Site SQLite database (overrides database.path)")]
    db: Option<PathBuf>,
    #[arg(long, value_enum, default_value = "text")]
    format: OutputFormat,
    #[command(flatten)]
    site: SiteArgs,
}

#[derive(Debug, Args)]
struct SqlSyncArgs {
    #[arg(long, help = "Anonymize data after importing the dump")]
    anonymize: bool,
    #[command(flatten)]
    site: SiteArgs,
}

#[derive(Debug, Args)]
struct PhpcsPreCommitArgs {
    #[arg(long, help = "Disable the hook")]
    disable: bool,
    #[arg(long, help = "Accept phpcs warnings")]
    accept_warnings: bool,
}

#[derive(Debug, Args)]
struct SiteDevelopArgs {
    #[arg(value_name = "NEW_PASSWORD", default_value = DEFAULT_DEVELOP_PASSWORD)]
    new_password: String,
    #[command(flatten)]
    site: SiteArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::FilesSync(args)) => run_files_sync(&runtime, args),
        Some(Commands::FilesArchive(args)) => run_files_archive(&runtime, args),
        Some(Commands::FilesIntegrityCheck(args)) => run_files_integrity_check(&runtime, args),
        Some(Commands::SqlDownload(args)) => run_sql_download(&runtime, args),
        Some(Commands::SqlSync(args)) => run_sql_sync(&runtime, args),
        Some(Commands::GitPhpcsPreCommit(args)) => run_git_phpcs_pre_commit(&runtime, args),
        Some(Commands::SiteDevelop(args)) => run_site_develop(&runtime, args),
        Some(Commands::SiteConfig) => run_site_config(&runtime),
        Some(Commands::DoNothing) => run_do_nothing(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn run_files_sync(runtime: &RuntimeOptions, args: SiteArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let mut downloader = HttpDownloader::from_env()?;
    let report = sync_files(
        &paths,
        &config,
        &args.site,
        &mut downloader,
        &mut SystemRunner::default(),
    )?;

    println!("files sync");
    println!("site: {}", args.site);
    println!("source: {}", report.source);
    println!("files_dir: {}", report.files_dir);
    println!("downloaded_bytes: {}", report.downloaded_bytes);
    println!("removed_entries: {}", report.removed_entries);
    println!("note: {PERMISSIONS_REMINDER}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_files_archive(runtime: &RuntimeOptions, args: FilesArchiveArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let report = archive_files(
        &paths,
        &config,
        &args.site.site,
        args.output.as_deref(),
        &mut SystemRunner::default(),
    )?;

    println!("files archive");
    println!("site: {}", args.site.site);
    println!("files_dir: {}", report.files_dir);
    println!("output: {}", report.output);
    println!("replaced_existing: {}", format_flag(report.replaced_existing));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_files_integrity_check(runtime: &RuntimeOptions, args: IntegrityCheckArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let site_name = args.site.site.as_str();
    let site = config.site(site_name);
    let db_path = site_database_path(&paths, &site, site_name, args.db.as_deref())?;
    let mut registry =
        SqliteFileRegistry::open(&db_path, site.database.table_prefix.as_deref().unwrap_or(""))
            .context("Cannot boot site database, aborting!")?;
    let streams = StreamPaths::for_site(&paths, &site, site_name)?;

    let report = check_integrity(
        &mut registry,
        &streams,
        &IntegrityOptions { limit: args.limit },
    )?;

    match args.format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("files integrity-check");
            println!("site: {site_name}");
            println!("database: {}", normalize_path(&db_path));
            println!("missing: {}", report.count(Problem::Missing));
            println!("orphaned: {}", report.count(Problem::Orphaned));
            println!(
                "missing_and_orphaned: {}",
                report.count(Problem::MissingAndOrphaned)
            );
            println!();
            print!("{}", render_integrity_report(&report));
            print_diagnostics(runtime, &paths);
        }
    }
    Ok(())
}

fn run_sql_download(runtime: &RuntimeOptions, args: SiteArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let mut downloader = HttpDownloader::from_env()?;
    let report = download_sql(&paths, &config, &args.site, &mut downloader)?;

    println!("sql download");
    println!("site: {}", args.site);
    println!("url: {}", report.url);
    println!("dump: {}", report.dump);
    println!("downloaded_bytes: {}", report.downloaded_bytes);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_sql_sync(runtime: &RuntimeOptions, args: SqlSyncArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let mut downloader = HttpDownloader::from_env()?;
    let report = sync_sql(
        &paths,
        &config,
        &args.site.site,
        SqlSyncOptions {
            anonymize: args.anonymize,
        },
        &mut downloader,
        &mut SystemRunner::default(),
    )?;

    println!("sql sync");
    println!("site: {}", args.site.site);
    println!("url: {}", report.download.url);
    println!("downloaded_bytes: {}", report.download.downloaded_bytes);
    println!("imported: {}", report.imported);
    println!("anonymized: {}", format_flag(report.anonymized));
    println!("steps: {}", report.steps);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_git_phpcs_pre_commit(runtime: &RuntimeOptions, args: PhpcsPreCommitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = install_phpcs_pre_commit(
        &paths,
        PhpcsHookOptions {
            disable: args.disable,
            accept_warnings: args.accept_warnings,
        },
        &mut SystemRunner::default(),
    )?;

    println!("git phpcs-pre-commit");
    println!("hook: {}", report.hook_path);
    println!("action: {}", report.action.as_str());
    println!("backup_created: {}", format_flag(report.backup_created));
    if report.packages_installed.is_empty() {
        println!("packages_installed: <none>");
    } else {
        for package in &report.packages_installed {
            println!("packages_installed.package: {package}");
        }
    }
    println!("sniffs_registered: {}", format_flag(report.sniffs_registered));
    println!("phpcs_xml_created: {}", format_flag(report.phpcs_xml_created));
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_site_develop(runtime: &RuntimeOptions, args: SiteDevelopArgs) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    let report = develop_site(
        &paths,
        &config,
        &args.site.site,
        &args.new_password,
        &mut SystemRunner::default(),
    )?;

    println!("site develop");
    println!("site: {}", args.site.site);
    println!(
        "password_reset_for: {}",
        report.password_reset_for.as_deref().unwrap_or("<skipped>")
    );
    println!(
        "drush_major: {}",
        report
            .drush_major
            .map(|major| major.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("modules_enabled: {}", report.modules_enabled.join(", "));
    println!(
        "dev_config_imported: {}",
        format_flag(report.dev_config_imported)
    );
    println!("steps: {}", report.steps);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_site_config(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = write_site_config(&paths)?;

    println!("site config");
    println!("example: {} ({})", report.example_path, report.example.as_str());
    println!(
        "personal: {} ({})",
        report.personal_path,
        report.personal.as_str()
    );
    println!("gitignore: {}", report.gitignore.as_str());
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_do_nothing(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = load_runtime(runtime)?;
    do_nothing(&config)?;
    println!("Done doing nothing");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn load_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, ProjectConfig)> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        drupal_root: runtime.drupal_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
