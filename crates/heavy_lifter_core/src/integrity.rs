use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

pub const PARAGRAPH_ENTITY_TYPE: &str = "paragraph";
pub const PROGRESS_INTERVAL: usize = 5000;
pub const MAX_PARAGRAPH_DEPTH: usize = 32;
const USAGE_IDS_SHOWN: usize = 3;

/// Row of the managed-file inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub fid: i64,
    pub uri: String,
}

/// One `file_usage` row joined to a managed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    pub fid: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub parent_type: String,
    pub parent_id: String,
}

/// Lookup of a paragraph's direct parent entity.
pub trait ParagraphParents {
    fn paragraph_parent(&mut self, paragraph_id: &str) -> Result<Option<ParentLink>>;
}

/// Read access to the site's managed-file tables.
pub trait FileRegistry: ParagraphParents {
    /// Human-readable name of the backing database.
    fn label(&self) -> String;
    /// Permanent managed files, id ascending.
    fn managed_files(&mut self, limit: Option<usize>) -> Result<Vec<FileRecord>>;
    /// Usage rows of managed files.
    fn file_usage(&mut self) -> Result<Vec<UsageRecord>>;
    /// Managed files without any usage row, id ascending.
    fn unused_files(&mut self, limit: Option<usize>) -> Result<Vec<FileRecord>>;
}

/// Maps a stream URI such as `public://a.png` to an absolute path.
pub trait PathResolver {
    fn resolve(&self, uri: &str) -> Option<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Problem {
    Missing,
    Orphaned,
    MissingAndOrphaned,
}

impl Problem {
    pub fn code(self) -> &'static str {
        match self {
            Self::Missing => "M",
            Self::Orphaned => "O",
            Self::MissingAndOrphaned => "M/O",
        }
    }

    pub fn is_missing(self) -> bool {
        matches!(self, Self::Missing | Self::MissingAndOrphaned)
    }

    pub fn is_orphaned(self) -> bool {
        matches!(self, Self::Orphaned | Self::MissingAndOrphaned)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityRow {
    pub fid: i64,
    pub uri: String,
    pub problem: Problem,
    /// Sum of usage counts; `None` for files without usage rows.
    pub reference_count: Option<i64>,
    pub usage: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub database: String,
    pub total_files: usize,
    pub unused_files: usize,
    pub unresolved_uris: Vec<String>,
    /// Ordered by file id.
    pub rows: Vec<IntegrityRow>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn count(&self, problem: Problem) -> usize {
        self.rows.iter().filter(|row| row.problem == problem).count()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityOptions {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub lines: Vec<String>,
    pub total: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParagraphRoot {
    Entity(ParentLink),
    /// A paragraph in the chain no longer exists.
    Orphan { paragraph_id: String },
    /// The chain loops back on itself or exceeds `MAX_PARAGRAPH_DEPTH`.
    Unterminated { paragraph_id: String },
}

/// Reconcile the managed-file inventory against disk and `file_usage`.
pub fn check_integrity(
    registry: &mut dyn FileRegistry,
    resolver: &dyn PathResolver,
    options: &IntegrityOptions,
) -> Result<IntegrityReport> {
    let database = registry.label();
    info!("Checking files in {database}.file_managed");

    // Zero means no cap.
    let limit = options.limit.filter(|limit| *limit > 0);
    let files = registry.managed_files(limit)?;
    let usage = registry.file_usage()?;
    let unused = registry.unused_files(limit)?;

    let total_files = files.len();
    let unused_files = unused.len();
    info!("Total files in file_managed: {total_files}");
    if unused_files > 0 {
        info!("Files not in use: {unused_files}");
    }

    let mut orphans: BTreeMap<i64, FileRecord> =
        unused.into_iter().map(|file| (file.fid, file)).collect();
    let mut usage_by_fid: BTreeMap<i64, Vec<UsageRecord>> = BTreeMap::new();
    for record in usage {
        usage_by_fid.entry(record.fid).or_default().push(record);
    }

    let mut rows: BTreeMap<i64, IntegrityRow> = BTreeMap::new();
    let mut unresolved_uris = Vec::new();
    for (index, file) in files.iter().enumerate() {
        let processed = index + 1;
        if processed % PROGRESS_INTERVAL == 0 {
            info!("Processed: {processed:04}/{total_files}");
        }

        let Some(path) = resolver.resolve(&file.uri) else {
            warn!(
                "Cannot resolve a local path for fid {} ({}), skipping",
                file.fid, file.uri
            );
            unresolved_uris.push(file.uri.clone());
            continue;
        };
        if path.exists() {
            continue;
        }

        if orphans.remove(&file.fid).is_some() {
            rows.insert(
                file.fid,
                IntegrityRow {
                    fid: file.fid,
                    uri: file.uri.clone(),
                    problem: Problem::MissingAndOrphaned,
                    reference_count: None,
                    usage: Vec::new(),
                },
            );
            continue;
        }

        let summary = match usage_by_fid.get(&file.fid) {
            Some(records) => summarize_usage(records, &mut *registry)?,
            None => UsageSummary::default(),
        };
        rows.insert(
            file.fid,
            IntegrityRow {
                fid: file.fid,
                uri: file.uri.clone(),
                problem: Problem::Missing,
                reference_count: Some(summary.total),
                usage: summary.lines,
            },
        );
    }

    for (fid, file) in orphans {
        rows.entry(fid).or_insert(IntegrityRow {
            fid,
            uri: file.uri,
            problem: Problem::Orphaned,
            reference_count: None,
            usage: Vec::new(),
        });
    }

    Ok(IntegrityReport {
        database,
        total_files,
        unused_files,
        unresolved_uris,
        rows: rows.into_values().collect(),
    })
}

/// Group usage rows by entity type into display lines plus a total count.
pub fn summarize_usage<P>(records: &[UsageRecord], parents: &mut P) -> Result<UsageSummary>
where
    P: ParagraphParents + ?Sized,
{
    let mut total = 0i64;
    // Entity types in first-seen order.
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();

    for record in records {
        if record.entity_type.is_empty() || record.entity_id.is_empty() {
            warn!("Ignoring malformed file_usage row for fid {}", record.fid);
            continue;
        }
        total = total.saturating_add(record.count.max(0));

        let (group, reference) = if record.entity_type == PARAGRAPH_ENTITY_TYPE {
            match resolve_paragraph_root(&mut *parents, &record.entity_id)? {
                ParagraphRoot::Entity(link) => (
                    PARAGRAPH_ENTITY_TYPE.to_string(),
                    format!("{}: {}", link.parent_type, link.parent_id),
                ),
                ParagraphRoot::Orphan { paragraph_id } => {
                    warn!("Found orphan paragraph with id:{paragraph_id}");
                    continue;
                }
                ParagraphRoot::Unterminated { paragraph_id } => {
                    warn!(
                        "Paragraph parent chain starting at id:{} does not reach a non-paragraph entity (stopped at id:{paragraph_id})",
                        record.entity_id
                    );
                    continue;
                }
            }
        } else {
            (record.entity_type.clone(), record.entity_id.clone())
        };

        match groups.iter_mut().find(|(name, _)| *name == group) {
            Some((_, ids)) => ids.push(reference),
            None => groups.push((group, vec![reference])),
        }
    }

    let lines = groups
        .iter()
        .map(|(entity_type, ids)| format_usage_line(entity_type, ids))
        .collect();
    Ok(UsageSummary { lines, total })
}

/// `node(s): 1, 2, 3 and 2 more`
pub fn format_usage_line(entity_type: &str, ids: &[String]) -> String {
    let shown = ids
        .iter()
        .take(USAGE_IDS_SHOWN)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    let more = ids.len().saturating_sub(USAGE_IDS_SHOWN);
    if more > 0 {
        format!("{entity_type}(s): {shown} and {more} more")
    } else {
        format!("{entity_type}(s): {shown}")
    }
}

/// Walk paragraph parents up to the first non-paragraph entity.
pub fn resolve_paragraph_root<P>(parents: &mut P, paragraph_id: &str) -> Result<ParagraphRoot>
where
    P: ParagraphParents + ?Sized,
{
    let mut visited = HashSet::new();
    let mut current = paragraph_id.to_string();

    for _ in 0..MAX_PARAGRAPH_DEPTH {
        if !visited.insert(current.clone()) {
            return Ok(ParagraphRoot::Unterminated {
                paragraph_id: current,
            });
        }
        let Some(link) = parents.paragraph_parent(&current)? else {
            return Ok(ParagraphRoot::Orphan {
                paragraph_id: current,
            });
        };
        if link.parent_type != PARAGRAPH_ENTITY_TYPE {
            return Ok(ParagraphRoot::Entity(link));
        }
        current = link.parent_id;
    }

    Ok(ParagraphRoot::Unterminated {
        paragraph_id: current,
    })
}
