use comfy_table::presets::ASCII_FULL;
use comfy_table::{ContentArrangement, Table};

use crate::integrity::{IntegrityReport, Problem};

pub const NO_ISSUES_MESSAGE: &str = "No issues detected";

const LEGEND: &[(Problem, &str)] = &[
    (
        Problem::Missing,
        "File recorded in file_managed but missing from disk",
    ),
    (
        Problem::Orphaned,
        "File recorded in file_managed but no record in file_usage",
    ),
];

/// Summary, legend and table, as printed by `files:integrity-check`.
pub fn render_integrity_report(report: &IntegrityReport) -> String {
    let mut out = String::new();
    out.push_str("Summary:\n");
    out.push_str(&format!(
        "Total files in file_managed: {}\n",
        report.total_files
    ));
    if report.unused_files > 0 {
        out.push_str(&format!("Files not in use: {}\n", report.unused_files));
    }
    if !report.unresolved_uris.is_empty() {
        out.push_str(&format!(
            "Files with unsupported stream scheme (not checked): {}\n",
            report.unresolved_uris.len()
        ));
    }
    out.push('\n');

    if report.is_clean() {
        out.push_str(NO_ISSUES_MESSAGE);
        out.push('\n');
        return out;
    }

    for (problem, description) in LEGEND {
        out.push_str(&format!("{} = {description}\n", problem.code()));
    }
    out.push_str(&render_integrity_table(report));
    out.push('\n');
    out
}

pub fn render_integrity_table(report: &IntegrityReport) -> String {
    let mut table = Table::new();
    table
        .load_preset(ASCII_FULL)
        .set_content_arrangement(ContentArrangement::Disabled)
        .set_header(vec!["FID", "Path", "Problem", "Count", "Usage"]);

    for row in &report.rows {
        table.add_row(vec![
            row.fid.to_string(),
            row.uri.clone(),
            row.problem.code().to_string(),
            row.reference_count
                .map(|count| count.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
            row.usage.join("\n"),
        ]);
    }
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::{NO_ISSUES_MESSAGE, render_integrity_report};
    use crate::integrity::{IntegrityReport, IntegrityRow, Problem};

    fn report(rows: Vec<IntegrityRow>) -> IntegrityReport {
        IntegrityReport {
            database: "default".to_string(),
            total_files: 10,
            unused_files: 2,
            unresolved_uris: Vec::new(),
            rows,
        }
    }

    #[test]
    fn clean_report_says_so() {
        let rendered = render_integrity_report(&report(Vec::new()));
        assert!(rendered.contains("Total files in file_managed: 10"));
        assert!(rendered.contains("Files not in use: 2"));
        assert!(rendered.contains(NO_ISSUES_MESSAGE));
        assert!(!rendered.contains("M = "));
    }

    #[test]
    fn problem_rows_render_with_legend() {
        let rendered = render_integrity_report(&report(vec![
            IntegrityRow {
                fid: 2,
                uri: "public://gone.png".to_string(),
                problem: Problem::MissingAndOrphaned,
                reference_count: None,
                usage: Vec::new(),
            },
            IntegrityRow {
                fid: 3,
                uri: "public://used.png".to_string(),
                problem: Problem::Missing,
                reference_count: Some(4),
                usage: vec![
                    "node(s): 1, 2, 3 and 1 more".to_string(),
                    "paragraph(s): node: 42".to_string(),
                ],
            },
        ]));

        assert!(rendered.contains("M = File recorded in file_managed but missing from disk"));
        assert!(!rendered.contains("M/O = "));
        assert!(rendered.contains("O = File recorded in file_managed but no record in file_usage"));
        assert!(rendered.contains("FID"));
        assert!(rendered.contains("public://gone.png"));
        assert!(rendered.contains("M/O"));
        assert!(rendered.contains("n/a"));
        assert!(rendered.contains("node(s): 1, 2, 3 and 1 more"));
        assert!(rendered.contains("paragraph(s): node: 42"));
        assert!(!rendered.contains(NO_ISSUES_MESSAGE));
    }
}
