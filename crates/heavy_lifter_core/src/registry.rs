use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags, params};

use crate::config::{SiteConfig, site_key};
use crate::integrity::{FileRecord, FileRegistry, ParagraphParents, ParentLink, UsageRecord};
use crate::runtime::{ResolvedPaths, normalize_for_display};

const PARAGRAPHS_TABLE: &str = "paragraphs_item_field_data";

/// Managed-file tables of a SQLite-backed site, opened read-only.
pub struct SqliteFileRegistry {
    connection: Connection,
    label: String,
    file_managed: String,
    file_usage: String,
    paragraphs: Option<String>,
}

impl SqliteFileRegistry {
    pub fn open(db_path: &Path, table_prefix: &str) -> Result<Self> {
        validate_table_prefix(table_prefix)?;
        if !db_path.is_file() {
            bail!("site database not found: {}", normalize_for_display(db_path));
        }
        let connection = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open {}", db_path.display()))?;
        connection
            .busy_timeout(Duration::from_secs(5))
            .context("failed to set sqlite busy timeout")?;
        Self::from_connection(connection, db_path, table_prefix)
    }

    fn from_connection(connection: Connection, db_path: &Path, table_prefix: &str) -> Result<Self> {
        let file_managed = format!("{table_prefix}file_managed");
        let file_usage = format!("{table_prefix}file_usage");
        for table in [&file_managed, &file_usage] {
            if !table_exists(&connection, table)? {
                bail!(
                    "table {table} is missing from {}",
                    normalize_for_display(db_path)
                );
            }
        }
        let paragraphs_table = format!("{table_prefix}{PARAGRAPHS_TABLE}");
        let paragraphs = if table_exists(&connection, &paragraphs_table)? {
            Some(paragraphs_table)
        } else {
            None
        };
        let label = db_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| normalize_for_display(db_path));

        Ok(Self {
            connection,
            label,
            file_managed,
            file_usage,
            paragraphs,
        })
    }

    fn query_files(&self, sql: &str, limit: Option<usize>) -> Result<Vec<FileRecord>> {
        let limit = sql_limit(limit)?;
        let mut statement = self
            .connection
            .prepare(sql)
            .context("failed to prepare managed file query")?;
        let rows = statement
            .query_map(params![limit], |row| {
                Ok(FileRecord {
                    fid: row.get(0)?,
                    uri: row.get(1)?,
                })
            })
            .context("failed to run managed file query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode managed file row")?);
        }
        Ok(out)
    }
}

impl ParagraphParents for SqliteFileRegistry {
    fn paragraph_parent(&mut self, paragraph_id: &str) -> Result<Option<ParentLink>> {
        let Some(table) = self.paragraphs.as_deref() else {
            return Ok(None);
        };
        let sql = format!("SELECT parent_type, parent_id FROM {table} WHERE id = ?1 LIMIT 1");
        let mut statement = self
            .connection
            .prepare_cached(&sql)
            .context("failed to prepare paragraph parent lookup")?;
        let mut rows = statement
            .query([paragraph_id])
            .context("failed to run paragraph parent lookup")?;
        let Some(row) = rows.next().context("failed to read paragraph row")? else {
            return Ok(None);
        };
        let parent_type: Option<String> = row.get(0).context("failed to decode parent_type")?;
        let parent_id: Value = row.get(1).context("failed to decode parent_id")?;
        match (parent_type, value_to_id(parent_id)) {
            (Some(parent_type), Some(parent_id)) if !parent_type.is_empty() => {
                Ok(Some(ParentLink {
                    parent_type,
                    parent_id,
                }))
            }
            _ => Ok(None),
        }
    }
}

impl FileRegistry for SqliteFileRegistry {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn managed_files(&mut self, limit: Option<usize>) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT fid, uri FROM {} WHERE status = 1 ORDER BY fid ASC LIMIT ?1",
            self.file_managed
        );
        self.query_files(&sql, limit)
    }

    fn file_usage(&mut self) -> Result<Vec<UsageRecord>> {
        let sql = format!(
            "SELECT u.fid, u.type, u.id, u.count
             FROM {} m
             INNER JOIN {} u ON u.fid = m.fid
             ORDER BY u.fid ASC, u.type ASC, u.id ASC",
            self.file_managed, self.file_usage
        );
        let mut statement = self
            .connection
            .prepare(&sql)
            .context("failed to prepare file usage query")?;
        let rows = statement
            .query_map([], |row| {
                let fid: i64 = row.get(0)?;
                let entity_type: Option<String> = row.get(1)?;
                let entity_id: Value = row.get(2)?;
                let count: Value = row.get(3)?;
                Ok(UsageRecord {
                    fid,
                    entity_type: entity_type.unwrap_or_default(),
                    entity_id: value_to_id(entity_id).unwrap_or_default(),
                    count: value_to_count(count),
                })
            })
            .context("failed to run file usage query")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode file usage row")?);
        }
        Ok(out)
    }

    fn unused_files(&mut self, limit: Option<usize>) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT m.fid, m.uri
             FROM {} m
             WHERE NOT EXISTS (SELECT 1 FROM {} u WHERE u.fid = m.fid)
             ORDER BY m.fid ASC
             LIMIT ?1",
            self.file_managed, self.file_usage
        );
        self.query_files(&sql, limit)
    }
}

/// `--db` flag > `project.sites.<site>.database.path`, relative to the project root.
pub fn site_database_path(
    paths: &ResolvedPaths,
    site: &SiteConfig,
    site_name: &str,
    flag: Option<&Path>,
) -> Result<PathBuf> {
    match flag.or(site.database.path.as_deref()) {
        Some(path) => Ok(paths.absolutize_from_project(path)),
        None => bail!(
            "No site database configured: set {} or pass --db",
            site_key(site_name, "database.path")
        ),
    }
}

fn validate_table_prefix(prefix: &str) -> Result<()> {
    if prefix
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Ok(());
    }
    bail!("invalid table prefix: {prefix:?} (only [A-Za-z0-9_] allowed)")
}

fn sql_limit(limit: Option<usize>) -> Result<i64> {
    match limit {
        Some(limit) => i64::try_from(limit).context("limit does not fit into i64"),
        // SQLite treats a negative LIMIT as unbounded.
        None => Ok(-1),
    }
}

fn value_to_id(value: Value) -> Option<String> {
    match value {
        Value::Integer(value) => Some(value.to_string()),
        Value::Text(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Value::Real(value) => Some(value.to_string()),
        _ => None,
    }
}

fn value_to_count(value: Value) -> i64 {
    match value {
        Value::Integer(value) => value,
        Value::Real(value) => value as i64,
        Value::Text(value) => value.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}

fn table_exists(connection: &Connection, table_name: &str) -> Result<bool> {
    let exists: i64 = connection
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table_name],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to check sqlite_master for table {table_name}"))?;
    Ok(exists == 1)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};

    use rusqlite::Connection;
    use tempfile::tempdir;

    use super::{SqliteFileRegistry, site_database_path};
    use crate::config::SiteConfig;
    use crate::integrity::{
        FileRegistry, IntegrityOptions, ParagraphParents, ParentLink, Problem, check_integrity,
    };
    use crate::runtime::tests::project_paths;
    use crate::streams::StreamPaths;

    pub(crate) const SITE_SCHEMA_SQL: &str = r#"
CREATE TABLE file_managed (
    fid INTEGER PRIMARY KEY,
    uri TEXT NOT NULL,
    status INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE file_usage (
    fid INTEGER NOT NULL,
    module TEXT NOT NULL DEFAULT 'file',
    type TEXT,
    id TEXT,
    count INTEGER
);
CREATE TABLE paragraphs_item_field_data (
    id INTEGER NOT NULL,
    langcode TEXT NOT NULL DEFAULT 'en',
    parent_type TEXT,
    parent_id TEXT
);
"#;

    pub(crate) fn site_database(path: &Path, seed_sql: &str) -> PathBuf {
        let connection = Connection::open(path).expect("open fixture db");
        connection
            .execute_batch(SITE_SCHEMA_SQL)
            .expect("create schema");
        connection.execute_batch(seed_sql).expect("seed fixture");
        path.to_path_buf()
    }

    #[test]
    fn reads_inventory_usage_and_unused_files() {
        let temp = tempdir().expect("tempdir");
        let db = site_database(
            &temp.path().join("default.sqlite"),
            "INSERT INTO file_managed (fid, uri, status) VALUES
                (3, 'public://c.png', 1),
                (1, 'public://a.png', 1),
                (2, 'private://b.pdf', 1),
                (4, 'temporary://upload.tmp', 0);
             INSERT INTO file_usage (fid, type, id, count) VALUES
                (1, 'node', '7', 1),
                (1, 'paragraph', 12, NULL),
                (9, 'node', '8', 1);",
        );

        let mut registry = SqliteFileRegistry::open(&db, "").expect("open registry");
        assert_eq!(registry.label(), "default");

        let files = registry.managed_files(None).expect("managed files");
        let fids: Vec<i64> = files.iter().map(|file| file.fid).collect();
        assert_eq!(fids, vec![1, 2, 3]);
        assert_eq!(registry.managed_files(Some(2)).expect("limited").len(), 2);

        let usage = registry.file_usage().expect("usage");
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].entity_type, "node");
        assert_eq!(usage[1].entity_type, "paragraph");
        assert_eq!(usage[1].entity_id, "12");
        assert_eq!(usage[1].count, 0);

        let unused = registry.unused_files(None).expect("unused");
        let unused_fids: Vec<i64> = unused.iter().map(|file| file.fid).collect();
        assert_eq!(unused_fids, vec![2, 3, 4]);
        assert_eq!(registry.unused_files(Some(1)).expect("limited").len(), 1);
    }

    #[test]
    fn integrity_check_against_site_database() {
        let temp = tempdir().expect("tempdir");
        let files_dir = temp.path().join("files");
        fs::create_dir_all(&files_dir).expect("files dir");
        fs::write(files_dir.join("present.png"), "x").expect("present");
        fs::write(files_dir.join("null-count.png"), "x").expect("null count");

        let db = site_database(
            &temp.path().join("default.sqlite"),
            "INSERT INTO file_managed (fid, uri, status) VALUES
                (1, 'public://present.png', 1),
                (2, 'public://gone-unused.png', 1),
                (3, 'public://gone-in-paragraph.png', 1),
                (4, 'public://null-count.png', 1),
                (5, 'public://gone-null-count.png', 1),
                (6, 'public://temporary.png', 0);
             INSERT INTO file_usage (fid, type, id, count) VALUES
                (1, 'node', '1', 1),
                (3, 'paragraph', '10', 2),
                (4, 'node', '5', NULL),
                (4, 'node', '6', NULL),
                (5, 'media', '8', NULL),
                (6, 'node', '9', 1);
             INSERT INTO paragraphs_item_field_data (id, parent_type, parent_id) VALUES
                (10, 'paragraph', '11'),
                (11, 'node', '42');",
        );
        let mut registry = SqliteFileRegistry::open(&db, "").expect("open registry");
        let streams = StreamPaths {
            public_dir: files_dir,
            private_dir: None,
        };

        let report = check_integrity(&mut registry, &streams, &IntegrityOptions::default())
            .expect("check");

        assert_eq!(report.database, "default");
        assert_eq!(report.total_files, 5);
        assert_eq!(report.unused_files, 1);
        let rows: Vec<(i64, Problem, Option<i64>, Vec<String>)> = report
            .rows
            .iter()
            .map(|row| (row.fid, row.problem, row.reference_count, row.usage.clone()))
            .collect();
        assert_eq!(
            rows,
            vec![
                (2, Problem::MissingAndOrphaned, None, Vec::new()),
                (
                    3,
                    Problem::Missing,
                    Some(2),
                    vec!["paragraph(s): node: 42".to_string()]
                ),
                (5, Problem::Missing, Some(0), vec!["media(s): 8".to_string()]),
            ]
        );
    }

    #[test]
    fn paragraph_parent_lookup() {
        let temp = tempdir().expect("tempdir");
        let db = site_database(
            &temp.path().join("site.sqlite"),
            "INSERT INTO paragraphs_item_field_data (id, langcode, parent_type, parent_id) VALUES
                (5, 'en', 'paragraph', '6'),
                (6, 'en', 'node', '42'),
                (6, 'fr', 'node', '42'),
                (7, 'en', NULL, NULL);",
        );
        let mut registry = SqliteFileRegistry::open(&db, "").expect("open registry");

        assert_eq!(
            registry.paragraph_parent("6").expect("lookup"),
            Some(ParentLink {
                parent_type: "node".to_string(),
                parent_id: "42".to_string(),
            })
        );
        assert_eq!(
            registry
                .paragraph_parent("5")
                .expect("lookup")
                .map(|link| link.parent_type),
            Some("paragraph".to_string())
        );
        assert_eq!(registry.paragraph_parent("7").expect("lookup"), None);
        assert_eq!(registry.paragraph_parent("404").expect("lookup"), None);
    }

    #[test]
    fn missing_paragraphs_table_means_no_parents() {
        let temp = tempdir().expect("tempdir");
        let db = temp.path().join("bare.sqlite");
        let connection = Connection::open(&db).expect("open");
        connection
            .execute_batch(
                "CREATE TABLE file_managed (fid INTEGER PRIMARY KEY, uri TEXT, status INTEGER);
                 CREATE TABLE file_usage (fid INTEGER, type TEXT, id TEXT, count INTEGER);",
            )
            .expect("schema");
        drop(connection);

        let mut registry = SqliteFileRegistry::open(&db, "").expect("open registry");
        assert_eq!(registry.paragraph_parent("1").expect("lookup"), None);
    }

    #[test]
    fn open_fails_without_database_or_tables() {
        let temp = tempdir().expect("tempdir");
        let missing = temp.path().join("missing.sqlite");
        let err = SqliteFileRegistry::open(&missing, "")
            .err()
            .expect("missing db must fail");
        assert!(err.to_string().contains("site database not found"));

        let empty = temp.path().join("empty.sqlite");
        Connection::open(&empty)
            .expect("create")
            .execute_batch("CREATE TABLE unrelated (id INTEGER);")
            .expect("schema");
        let err = SqliteFileRegistry::open(&empty, "")
            .err()
            .expect("missing tables must fail");
        assert!(err.to_string().contains("table file_managed is missing"));

        let err = SqliteFileRegistry::open(&empty, "drop table;--")
            .err()
            .expect("bad prefix must fail");
        assert!(err.to_string().contains("invalid table prefix"));
    }

    #[test]
    fn database_path_prefers_flag_then_config() {
        let temp = tempdir().expect("tempdir");
        let paths = project_paths(temp.path());
        let mut site = SiteConfig::default();

        let err = site_database_path(&paths, &site, "default", None).expect_err("unset");
        assert!(
            err.to_string()
                .contains("project.sites.default.database.path")
        );

        site.database.path = Some(PathBuf::from("db/site.sqlite"));
        assert_eq!(
            site_database_path(&paths, &site, "default", None).expect("config"),
            temp.path().join("db").join("site.sqlite")
        );
        assert_eq!(
            site_database_path(&paths, &site, "default", Some(Path::new("/data/x.sqlite")))
                .expect("flag"),
            PathBuf::from("/data/x.sqlite")
        );
    }
}
