//! Run reports, rendered two ways: a table for the terminal and CSV for
//! files other tooling picks up.

use std::fs;
use std::io;
use std::path::Path;

use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, ContentArrangement, Table};

use crate::model::ec2::Ec2Snapshot;
use crate::model::rds::DeleteRow;
use crate::queue::{ExportTask, QueueReport};

fn table_with_header(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(|h| Cell::new(h)).collect::<Vec<_>>());
    table
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn csv_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|field| csv_field(field))
        .collect::<Vec<_>>()
        .join(",")
}

/// Write a CSV report, creating parent directories as needed.
pub fn write_report(path: &Path, csv: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, csv)
}

pub fn queue_report_table(report: &QueueReport) -> Table {
    let mut table = table_with_header(&[
        "active_exports",
        "added_to_queue",
        "queue_limit",
        "un_processed",
        "not_allowed",
        "historical_completed",
    ]);
    table.add_row(vec![
        Cell::new(report.active_exports),
        Cell::new(report.added_to_queue),
        Cell::new(report.queue_limit),
        Cell::new(report.un_processed),
        Cell::new(report.not_allowed),
        Cell::new(report.historical_completed),
    ]);
    table
}

pub fn queue_report_csv(report: &QueueReport) -> String {
    let mut csv = String::from(
        "active_exports,added_to_queue,queue_limit,un_processed,not_allowed,historical_completed\n",
    );
    csv.push_str(&format!(
        "{},{},{},{},{},{}\n",
        report.active_exports,
        report.added_to_queue,
        report.queue_limit,
        report.un_processed,
        report.not_allowed,
        report.historical_completed,
    ));
    csv
}

const EXPORT_TASK_COLUMNS: &[&str] = &[
    "SourceArn",
    "ExportTaskIdentifier",
    "Status",
    "PercentProgress",
    "S3Bucket",
    "S3Prefix",
    "TotalExtractedDataInGB",
];

fn export_task_fields(task: &ExportTask) -> Vec<String> {
    vec![
        task.source_arn.clone(),
        task.identifier.clone(),
        task.status.clone(),
        task.percent_progress.to_string(),
        task.s3_bucket.clone(),
        task.s3_prefix.clone(),
        task.total_extracted_data_in_gb.to_string(),
    ]
}

pub fn export_tasks_table(tasks: &[ExportTask]) -> Table {
    let mut table = table_with_header(EXPORT_TASK_COLUMNS);
    for task in tasks {
        table.add_row(export_task_fields(task));
    }
    table
}

pub fn export_tasks_csv(tasks: &[ExportTask]) -> String {
    let mut csv = EXPORT_TASK_COLUMNS.join(",");
    csv.push('\n');
    for task in tasks {
        csv.push_str(&csv_line(&export_task_fields(task)));
        csv.push('\n');
    }
    csv
}

const VERDICT_COLUMNS: &[&str] = &["Name", "Snapshot", "Created", "Verdict", "Reasons"];

fn verdict_fields(snapshot: &Ec2Snapshot) -> Vec<String> {
    vec![
        snapshot.name_tag.clone(),
        snapshot.snapshot_id.clone(),
        snapshot.start_time.clone().unwrap_or_default(),
        snapshot.lifecycle.verdict.as_str().to_string(),
        snapshot.lifecycle.reasons.join("; "),
    ]
}

pub fn verdict_table(snapshots: &[Ec2Snapshot]) -> Table {
    let mut table = table_with_header(VERDICT_COLUMNS);
    for snapshot in snapshots {
        table.add_row(verdict_fields(snapshot));
    }
    table
}

pub fn verdict_csv(snapshots: &[Ec2Snapshot]) -> String {
    let mut csv = VERDICT_COLUMNS.join(",");
    csv.push('\n');
    for snapshot in snapshots {
        csv.push_str(&csv_line(&verdict_fields(snapshot)));
        csv.push('\n');
    }
    csv
}

const DELETE_COLUMNS: &[&str] = &[
    "Name",
    "Is Archived",
    "Is Deletable",
    "Deleted",
    "Snapshot Created",
    "S3 Bucket",
    "S3 Path",
];

fn delete_fields(row: &DeleteRow) -> Vec<String> {
    vec![
        row.id.clone(),
        row.archived.to_string(),
        row.deletable.to_string(),
        row.outcome.clone(),
        row.created.clone(),
        row.bucket.clone(),
        row.key.clone(),
    ]
}

pub fn delete_rows_table(rows: &[DeleteRow]) -> Table {
    let mut table = table_with_header(DELETE_COLUMNS);
    for row in rows {
        table.add_row(delete_fields(row));
    }
    table
}

pub fn delete_rows_csv(rows: &[DeleteRow]) -> String {
    let mut csv = DELETE_COLUMNS.join(",");
    csv.push('\n');
    for row in rows {
        csv.push_str(&csv_line(&delete_fields(row)));
        csv.push('\n');
    }
    csv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ec2::{Lifecycle, Verdict};
    use tempfile::TempDir;

    #[test]
    fn queue_report_csv_has_fixed_column_order() {
        let report = QueueReport {
            active_exports: 3,
            added_to_queue: 2,
            queue_limit: 5,
            un_processed: 7,
            not_allowed: 1,
            historical_completed: 40,
        };
        let csv = queue_report_csv(&report);
        let mut lines = csv.lines();
        assert_eq!(
            lines.next(),
            Some("active_exports,added_to_queue,queue_limit,un_processed,not_allowed,historical_completed")
        );
        assert_eq!(lines.next(), Some("3,2,5,7,1,40"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn export_task_csv_rows_follow_the_header() {
        let task = ExportTask {
            identifier: "nightly".to_string(),
            source_arn: "arn:aws:rds:us-east-1:123456789012:cluster-snapshot:nightly".to_string(),
            status: "COMPLETE".to_string(),
            percent_progress: 100,
            s3_bucket: "archive".to_string(),
            s3_prefix: "app-cluster".to_string(),
            total_extracted_data_in_gb: 12,
            ..Default::default()
        };
        let csv = export_tasks_csv(&[task]);
        assert!(csv.starts_with("SourceArn,ExportTaskIdentifier,Status,"));
        assert!(csv.contains("arn:aws:rds:us-east-1:123456789012:cluster-snapshot:nightly,nightly,COMPLETE,100,archive,app-cluster,12"));
    }

    #[test]
    fn verdict_csv_quotes_fields_with_commas() {
        let snapshot = Ec2Snapshot {
            snapshot_id: "snap-1".to_string(),
            name_tag: "[web]::[vol-1]".to_string(),
            start_time: Some("2024-01-01T00:00:00Z".to_string()),
            lifecycle: Lifecycle {
                verdict: Verdict::Retain,
                reasons: vec!["Snapshot is the newest".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        let csv = verdict_csv(&[snapshot]);
        assert!(csv.contains("[web]::[vol-1],snap-1,2024-01-01T00:00:00Z,retain,Snapshot is the newest"));

        let mut tricky = Ec2Snapshot {
            snapshot_id: "snap-2".to_string(),
            name_tag: "a,b".to_string(),
            ..Default::default()
        };
        tricky.lifecycle.reasons = vec!["x".to_string(), "y".to_string()];
        let csv = verdict_csv(&[tricky]);
        assert!(csv.contains("\"a,b\",snap-2"));
        assert!(csv.contains("x; y"));
    }

    #[test]
    fn delete_rows_csv_matches_the_report_layout() {
        let row = DeleteRow {
            id: "nightly".to_string(),
            archived: true,
            deletable: false,
            outcome: "retained".to_string(),
            created: "2024-01-01T00:00:00Z".to_string(),
            bucket: "archive".to_string(),
            key: "app-cluster/nightly/export_info_nightly.json".to_string(),
        };
        let csv = delete_rows_csv(&[row]);
        assert!(csv.starts_with("Name,Is Archived,Is Deletable,Deleted,Snapshot Created,S3 Bucket,S3 Path"));
        assert!(csv.contains(
            "nightly,true,false,retained,2024-01-01T00:00:00Z,archive,app-cluster/nightly/export_info_nightly.json"
        ));
    }

    #[test]
    fn tables_render_without_panicking() {
        let table = queue_report_table(&QueueReport::default());
        assert!(table.to_string().contains("active_exports"));

        let table = export_tasks_table(&[ExportTask::default()]);
        assert!(table.to_string().contains("ExportTaskIdentifier"));
    }

    #[test]
    fn write_report_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("reports").join("queue.csv");
        write_report(&path, "a,b\n1,2\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a,b\n1,2\n");
    }
}
