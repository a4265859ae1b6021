//! Aurora cluster snapshot model and the archived-snapshot deletion flow.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::aws::error::ApiError;
use crate::aws::gateway::{Gateway, InventoryRequest, RemoteApi};
use crate::model::Tag;
use crate::util::{parse_timestamp, sha_hex};

/// AWS caps export task identifiers at 60 characters.
pub const EXPORT_ID_MAX_LEN: usize = 60;

/// Identifiers over the cap are replaced with a hash. The prefix satisfies
/// the leading-letter requirement and marks the id as derived.
pub const HASHED_ID_PREFIX: &str = "sha-id-";

/// A snapshot must stay restorable for this long after creation before the
/// archived copy is allowed to replace it.
pub const MIN_AGE_DAYS_FOR_DELETE: i64 = 60;

static ARN_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^arn:(.*)cluster-snapshot:").expect("static pattern is valid"));

/// One Aurora cluster snapshot as reported by RDS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSnapshot {
    #[serde(rename = "DBClusterSnapshotIdentifier")]
    pub identifier: String,
    #[serde(rename = "DBClusterIdentifier")]
    pub cluster_identifier: String,
    #[serde(rename = "DBClusterSnapshotArn")]
    pub arn: String,
    #[serde(rename = "SnapshotCreateTime")]
    pub create_time: Option<String>,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Engine")]
    pub engine: String,
    #[serde(rename = "EngineMode")]
    pub engine_mode: String,
    #[serde(rename = "TagList")]
    pub tags: Vec<Tag>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    /// Whether the export marker object exists in the archive bucket.
    /// Filled in by [`probe_archive`](Self::probe_archive).
    #[serde(skip)]
    pub archived: bool,
}

impl ClusterSnapshot {
    pub fn from_record(record: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record)
    }

    /// The export task identifier for this snapshot: the snapshot id where
    /// it fits, otherwise a hash of it under the cap.
    pub fn export_id(&self) -> String {
        if self.identifier.len() > EXPORT_ID_MAX_LEN {
            let digest = sha_hex(&self.identifier);
            format!("{HASHED_ID_PREFIX}{}", &digest[..32])
        } else {
            self.identifier.clone()
        }
    }

    /// The S3 prefix for this snapshot's exports, from the cluster
    /// identifier with any ARN front matter stripped.
    pub fn prefix(&self) -> String {
        ARN_PREFIX.replace(&self.cluster_identifier, "").into_owned()
    }

    pub fn s3_base_path(&self) -> String {
        format!("{}/{}", self.prefix(), self.export_id())
    }

    /// Key of the marker object the export writes last; its presence means
    /// the snapshot is fully archived.
    pub fn s3_key(&self) -> String {
        let id = self.export_id();
        format!("{}/export_info_{}.json", self.s3_base_path(), id)
    }

    pub fn can_archive(&self) -> bool {
        self.status.eq_ignore_ascii_case("available")
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.create_time.as_deref().and_then(parse_timestamp)
    }

    /// A snapshot may be deleted only once it is archived and older than
    /// [`MIN_AGE_DAYS_FOR_DELETE`].
    pub fn can_delete(&self, now: DateTime<Utc>) -> bool {
        let Some(created) = self.created_at() else {
            return false;
        };
        self.archived && now.signed_duration_since(created).num_days() > MIN_AGE_DAYS_FOR_DELETE
    }

    /// Check the archive bucket for this snapshot's export marker.
    pub async fn probe_archive<C: RemoteApi>(
        &mut self,
        gateway: &Gateway<C>,
        bucket: &str,
    ) -> Result<(), ApiError> {
        let request = InventoryRequest::new("s3", "head_object").params(json!({
            "Bucket": bucket,
            "Key": self.s3_key(),
        }));
        self.archived = gateway.call(&request).await?.is_some();
        debug!(
            snapshot = %self.identifier,
            archived = self.archived,
            "archive probe"
        );
        Ok(())
    }
}

/// Settings for the archived-snapshot deletion pass.
#[derive(Debug, Clone)]
pub struct DeleteConfig {
    pub bucket: String,
    /// Maximum deletions this run; zero means unlimited.
    pub limit: usize,
    pub dry_run: bool,
    pub cache_ttl: u64,
}

/// One row of the deletion report.
#[derive(Debug, Clone)]
pub struct DeleteRow {
    pub id: String,
    pub archived: bool,
    pub deletable: bool,
    pub outcome: String,
    pub created: String,
    pub bucket: String,
    pub key: String,
}

#[derive(Debug, Default)]
pub struct DeleteOutcome {
    pub rows: Vec<DeleteRow>,
    pub deleted: usize,
    pub retained: usize,
    pub failed: usize,
}

/// Delete manual cluster snapshots whose archive marker exists and whose
/// restore window has passed. Deletions stop at `config.limit`; individual
/// failures are reported and do not stop the pass.
pub async fn delete_archived<C: RemoteApi>(
    gateway: &Gateway<C>,
    config: &DeleteConfig,
) -> Result<DeleteOutcome, ApiError> {
    let records = gateway
        .records(
            &InventoryRequest::new("rds", "describe_db_cluster_snapshots")
                .extraction_key("DBClusterSnapshots")
                .params(json!({
                    "SnapshotType": "manual",
                    "PaginationConfig": {"MaxRecords": 9999},
                }))
                .cache_ttl(config.cache_ttl),
        )
        .await?;

    let now = Utc::now();
    let mut outcome = DeleteOutcome::default();

    for record in records {
        if config.limit > 0 && outcome.deleted >= config.limit {
            info!(limit = config.limit, "deletion limit reached");
            break;
        }

        let mut snapshot = match ClusterSnapshot::from_record(record) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %err, "skipping unreadable cluster snapshot record");
                continue;
            }
        };
        snapshot.probe_archive(gateway, &config.bucket).await?;

        let deletable = snapshot.can_delete(now);
        let result = if deletable {
            if config.dry_run {
                info!(snapshot = %snapshot.identifier, "[DRY RUN] would delete");
                outcome.deleted += 1;
                "dry run".to_string()
            } else {
                match delete_snapshot(gateway, &snapshot).await {
                    Ok(()) => {
                        info!(snapshot = %snapshot.identifier, "deleted");
                        outcome.deleted += 1;
                        "deleted".to_string()
                    }
                    Err(err) => {
                        warn!(snapshot = %snapshot.identifier, error = %err, "failed to delete");
                        outcome.failed += 1;
                        "failed".to_string()
                    }
                }
            }
        } else {
            outcome.retained += 1;
            "retained".to_string()
        };

        outcome.rows.push(DeleteRow {
            id: snapshot.export_id(),
            archived: snapshot.archived,
            deletable,
            outcome: result,
            created: snapshot.create_time.clone().unwrap_or_default(),
            bucket: config.bucket.clone(),
            key: snapshot.s3_key(),
        });
    }

    Ok(outcome)
}

async fn delete_snapshot<C: RemoteApi>(
    gateway: &Gateway<C>,
    snapshot: &ClusterSnapshot,
) -> Result<(), ApiError> {
    let request = InventoryRequest::new("rds", "delete_db_cluster_snapshot").params(json!({
        "DBClusterSnapshotIdentifier": snapshot.identifier,
    }));
    if let Some(result) = gateway.call(&request).await? {
        // Keep a line-per-deletion audit trail next to the cache.
        gateway
            .cache()
            .append_log("log.rds.delete_db_cluster_snapshot", &result);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::gateway::ApiResponse;
    use crate::cache::ResponseCache;
    use crate::testing::fakes::{pages, single, FakeApi};
    use chrono::Duration;
    use tempfile::TempDir;

    fn snapshot(identifier: &str) -> ClusterSnapshot {
        ClusterSnapshot {
            identifier: identifier.to_string(),
            cluster_identifier: "app-cluster".to_string(),
            arn: format!("arn:aws:rds:us-east-1:123456789012:cluster-snapshot:{identifier}"),
            status: "available".to_string(),
            engine: "aurora-postgresql".to_string(),
            engine_mode: "provisioned".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn short_identifier_is_its_own_export_id() {
        assert_eq!(snapshot("nightly-2024-01-01").export_id(), "nightly-2024-01-01");
    }

    #[test]
    fn long_identifier_is_hashed_under_the_cap() {
        let long = "x".repeat(EXPORT_ID_MAX_LEN + 1);
        let id = snapshot(&long).export_id();
        assert!(id.starts_with(HASHED_ID_PREFIX));
        assert!(id.len() <= EXPORT_ID_MAX_LEN);
        assert_eq!(id, snapshot(&long).export_id(), "hashing is deterministic");
    }

    #[test]
    fn identifier_at_the_cap_is_unchanged() {
        let exact = "y".repeat(EXPORT_ID_MAX_LEN);
        assert_eq!(snapshot(&exact).export_id(), exact);
    }

    #[test]
    fn prefix_strips_arn_front_matter() {
        let mut snap = snapshot("nightly");
        snap.cluster_identifier =
            "arn:aws:rds:us-east-1:123456789012:cluster-snapshot:app-cluster".to_string();
        assert_eq!(snap.prefix(), "app-cluster");

        let plain = snapshot("nightly");
        assert_eq!(plain.prefix(), "app-cluster");
    }

    #[test]
    fn s3_key_places_marker_under_base_path() {
        let snap = snapshot("nightly");
        assert_eq!(
            snap.s3_key(),
            "app-cluster/nightly/export_info_nightly.json"
        );
    }

    #[test]
    fn can_delete_requires_archive_and_age() {
        let now = Utc::now();
        let mut snap = snapshot("nightly");
        snap.create_time = Some((now - Duration::days(90)).to_rfc3339());

        snap.archived = false;
        assert!(!snap.can_delete(now), "unarchived is never deletable");

        snap.archived = true;
        assert!(snap.can_delete(now));

        snap.create_time = Some((now - Duration::days(10)).to_rfc3339());
        assert!(!snap.can_delete(now), "too young to delete");

        snap.create_time = None;
        assert!(!snap.can_delete(now), "unknown age is never deletable");
    }

    fn record(identifier: &str, created: DateTime<Utc>) -> Value {
        json!({
            "DBClusterSnapshotIdentifier": identifier,
            "DBClusterIdentifier": "app-cluster",
            "DBClusterSnapshotArn":
                format!("arn:aws:rds:us-east-1:123456789012:cluster-snapshot:{identifier}"),
            "SnapshotCreateTime": created.to_rfc3339(),
            "Status": "available",
            "Engine": "aurora-postgresql",
            "EngineMode": "provisioned",
        })
    }

    fn delete_api(now: DateTime<Utc>) -> FakeApi {
        FakeApi::new()
            .on("rds", "describe_db_cluster_snapshots", move |_| {
                Ok(pages(vec![json!({"DBClusterSnapshots": [
                    record("old-archived", now - Duration::days(90)),
                    record("young-archived", now - Duration::days(10)),
                    record("old-unarchived", now - Duration::days(90)),
                ]})]))
            })
            .on("s3", "head_object", |req| {
                let key = req.params["Key"].as_str().unwrap_or_default();
                if key.contains("old-unarchived") {
                    Err(ApiError::classify(
                        "s3",
                        "head_object",
                        "us-east-1",
                        Some("404"),
                        "missing",
                    ))
                } else {
                    Ok(single(json!({"ContentLength": 42})))
                }
            })
            .on("rds", "delete_db_cluster_snapshot", |req| {
                Ok(ApiResponse::Single(json!({
                    "DBClusterSnapshotIdentifier":
                        req.params["DBClusterSnapshotIdentifier"],
                    "Status": "deleting",
                })))
            })
    }

    #[tokio::test]
    async fn deletes_only_aged_archived_snapshots_within_limit() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let gateway = Gateway::new(
            delete_api(now),
            ResponseCache::new(dir.path(), "run-test"),
            "ns-test",
        );

        let outcome = delete_archived(
            &gateway,
            &DeleteConfig {
                bucket: "archive-bucket".to_string(),
                limit: 2,
                dry_run: false,
                cache_ttl: 0,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.retained, 2);
        assert_eq!(outcome.failed, 0);
        assert_eq!(outcome.rows.len(), 3);
        assert_eq!(outcome.rows[0].outcome, "deleted");
        assert_eq!(outcome.rows[1].outcome, "retained");
        assert_eq!(outcome.rows[2].outcome, "retained");

        // One deletion, and an audit line for it.
        let log = std::fs::read_to_string(
            dir.path().join("log.rds.delete_db_cluster_snapshot.log"),
        )
        .unwrap();
        assert_eq!(log.lines().count(), 1);
        assert!(log.contains("old-archived"));
    }

    #[tokio::test]
    async fn dry_run_counts_would_delete_without_calling() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let gateway = Gateway::new(
            delete_api(now),
            ResponseCache::new(dir.path(), "run-test"),
            "ns-test",
        );

        let outcome = delete_archived(
            &gateway,
            &DeleteConfig {
                bucket: "archive-bucket".to_string(),
                limit: 0,
                dry_run: true,
                cache_ttl: 0,
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.rows[0].outcome, "dry run");
        assert_eq!(
            gateway.api_ref().call_count("rds", "delete_db_cluster_snapshot"),
            0
        );
    }
}
