//! Bounded work queue for Aurora cluster snapshot exports to S3.
//!
//! RDS caps concurrent snapshot exports, so each run tops the queue up to
//! [`BATCH_LIMIT`] in-flight exports and leaves the rest for a later run.
//! A snapshot is admitted only when it is exportable at all: available, not
//! serverless, not already exporting, and not already archived in S3.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::aws::error::ApiError;
use crate::aws::gateway::{Gateway, InventoryRequest, RemoteApi};
use crate::model::rds::ClusterSnapshot;

/// Maximum exports in flight (queued this run plus already active).
pub const BATCH_LIMIT: usize = 5;

/// Export task statuses that count against the batch limit.
pub const ACTIVE_STATUSES: &[&str] = &["started", "in_progress", "running", "pending", "starting"];

/// Export task statuses that mean the export finished successfully.
pub const COMPLETED_STATUSES: &[&str] = &["complete"];

/// One RDS export task, as reported by `describe_export_tasks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportTask {
    #[serde(rename = "ExportTaskIdentifier", default)]
    pub identifier: String,
    #[serde(rename = "SourceArn", default)]
    pub source_arn: String,
    #[serde(rename = "Status", default)]
    pub status: String,
    #[serde(rename = "PercentProgress", default)]
    pub percent_progress: i64,
    #[serde(rename = "S3Bucket", default)]
    pub s3_bucket: String,
    #[serde(rename = "S3Prefix", default)]
    pub s3_prefix: String,
    #[serde(rename = "TotalExtractedDataInGB", default)]
    pub total_extracted_data_in_gb: i64,
    #[serde(rename = "FailureCause", default, skip_serializing_if = "Option::is_none")]
    pub failure_cause: Option<String>,
    #[serde(rename = "WarningMessage", default, skip_serializing_if = "Option::is_none")]
    pub warning_message: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ExportTask {
    pub fn from_record(record: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record)
    }

    pub fn is_active(&self) -> bool {
        let status = self.status.to_lowercase();
        ACTIVE_STATUSES.contains(&status.as_str())
    }

    pub fn is_completed(&self) -> bool {
        let status = self.status.to_lowercase();
        COMPLETED_STATUSES.contains(&status.as_str())
    }
}

/// Settings for one export run.
#[derive(Debug, Clone, Default)]
pub struct ExportConfig {
    pub bucket: String,
    pub iam_role_arn: String,
    pub kms_key_id: String,
    pub dry_run: bool,
    /// TTL for the snapshot listing; export task state is never cached.
    pub cache_ttl: u64,
    pub region: Option<String>,
}

/// How every snapshot and export task was bucketed this run.
#[derive(Debug, Default)]
pub struct QueueState {
    pub active: Vec<ExportTask>,
    pub completed: Vec<ExportTask>,
    pub queued: Vec<ClusterSnapshot>,
    /// Eligible snapshots the closed queue could not admit.
    pub un_processed: Vec<String>,
    /// Snapshot id and the reason it cannot be exported.
    pub not_allowed: Vec<(String, String)>,
}

impl QueueState {
    pub fn is_open(&self) -> bool {
        self.queued.len() + self.active.len() < BATCH_LIMIT
    }
}

/// Counters summarizing a run, in reporting order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueReport {
    pub active_exports: usize,
    pub added_to_queue: usize,
    pub queue_limit: usize,
    pub un_processed: usize,
    pub not_allowed: usize,
    pub historical_completed: usize,
}

impl QueueReport {
    pub fn from_state(state: &QueueState) -> Self {
        Self {
            active_exports: state.active.len(),
            added_to_queue: state.queued.len(),
            queue_limit: BATCH_LIMIT,
            un_processed: state.un_processed.len(),
            not_allowed: state.not_allowed.len(),
            historical_completed: state.completed.len(),
        }
    }
}

pub struct ExportQueue<'a, C> {
    gateway: &'a Gateway<C>,
    config: ExportConfig,
}

impl<'a, C: RemoteApi> ExportQueue<'a, C> {
    pub fn new(gateway: &'a Gateway<C>, config: ExportConfig) -> Self {
        Self { gateway, config }
    }

    /// Run one pass: verify the KMS key, bucket the existing export tasks,
    /// fill the queue from the manual snapshot listing, and submit what was
    /// admitted. Returns the final state for reporting.
    pub async fn run(&self) -> Result<QueueState, ApiError> {
        self.preflight().await?;
        let mut state = self.load_state().await?;
        self.fill(&mut state).await?;
        self.submit(&state).await?;
        Ok(state)
    }

    /// The export key must exist and be describable before anything is
    /// queued; a queue full of exports against a bad key is worse than no
    /// run at all.
    async fn preflight(&self) -> Result<(), ApiError> {
        let request = self
            .request(InventoryRequest::new("kms", "describe_key"))
            .extraction_key("KeyMetadata")
            .params(json!({"KeyId": self.config.kms_key_id}));
        match self.gateway.call(&request).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(ApiError::Preflight {
                message: format!("KMS key '{}' does not exist", self.config.kms_key_id),
            }),
            Err(err) => Err(ApiError::Preflight {
                message: format!("KMS key '{}' is unusable: {err}", self.config.kms_key_id),
            }),
        }
    }

    async fn load_state(&self) -> Result<QueueState, ApiError> {
        let request = self
            .request(InventoryRequest::new("rds", "describe_export_tasks"))
            .extraction_key("ExportTasks")
            .params(json!({"PaginationConfig": {"MaxRecords": 100}}));

        let mut state = QueueState::default();
        for record in self.gateway.records(&request).await? {
            let task = match ExportTask::from_record(record) {
                Ok(task) => task,
                Err(err) => {
                    warn!(error = %err, "skipping malformed export task record");
                    continue;
                }
            };
            if task.is_active() {
                state.active.push(task);
            } else if task.is_completed() {
                state.completed.push(task);
            }
        }
        Ok(state)
    }

    async fn fill(&self, state: &mut QueueState) -> Result<(), ApiError> {
        let request = self
            .request(InventoryRequest::new("rds", "describe_db_cluster_snapshots"))
            .extraction_key("DBClusterSnapshots")
            .cache_ttl(self.config.cache_ttl)
            .params(json!({
                "SnapshotType": "manual",
                "PaginationConfig": {"MaxRecords": 100},
            }));

        for record in self.gateway.records(&request).await? {
            let mut snapshot = match ClusterSnapshot::from_record(record) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    warn!(error = %err, "skipping malformed cluster snapshot record");
                    continue;
                }
            };
            let id = snapshot.identifier.clone();

            // A closed queue cannot admit anything, so eligibility is not
            // worth evaluating: every remaining candidate is un_processed.
            if !state.is_open() {
                state.un_processed.push(id);
                continue;
            }
            if snapshot.engine_mode.eq_ignore_ascii_case("serverless") {
                state
                    .not_allowed
                    .push((id, "serverless engine mode".to_string()));
                continue;
            }
            if !snapshot.can_archive() {
                state.not_allowed.push((
                    id,
                    format!("snapshot status is '{}'", snapshot.status),
                ));
                continue;
            }
            let export_id = snapshot.export_id();
            if state.active.iter().any(|task| task.identifier == export_id) {
                state
                    .not_allowed
                    .push((id, "export already in progress".to_string()));
                continue;
            }
            snapshot.probe_archive(self.gateway, &self.config.bucket).await?;
            if snapshot.archived {
                state.not_allowed.push((id, "already archived".to_string()));
                continue;
            }
            state.queued.push(snapshot);
        }
        Ok(())
    }

    async fn submit(&self, state: &QueueState) -> Result<(), ApiError> {
        for snapshot in &state.queued {
            let export_id = snapshot.export_id();
            if self.config.dry_run {
                info!(
                    export = %export_id,
                    snapshot = %snapshot.identifier,
                    bucket = %self.config.bucket,
                    prefix = %snapshot.prefix(),
                    "[DRY RUN] Would start export"
                );
                continue;
            }
            let request = self
                .request(InventoryRequest::new("rds", "start_export_task"))
                .params(json!({
                    "ExportTaskIdentifier": export_id,
                    "SourceArn": snapshot.arn,
                    "S3BucketName": self.config.bucket,
                    "IamRoleArn": self.config.iam_role_arn,
                    "KmsKeyId": self.config.kms_key_id,
                    "S3Prefix": snapshot.prefix(),
                }));
            match self.gateway.call(&request).await {
                Ok(Some(response)) => {
                    if let Ok(task) = ExportTask::from_record(response) {
                        if let Some(cause) = &task.failure_cause {
                            warn!(export = %task.identifier, cause = %cause, "export failed at start");
                        }
                        if let Some(message) = &task.warning_message {
                            warn!(export = %task.identifier, warning = %message, "export started with warning");
                        }
                    }
                    info!(export = %export_id, snapshot = %snapshot.identifier, "export started");
                }
                Ok(None) => {
                    warn!(export = %export_id, "export submission returned no task");
                }
                Err(err) => {
                    warn!(export = %export_id, error = %err, "failed to start export");
                }
            }
        }
        Ok(())
    }

    fn request(&self, request: InventoryRequest) -> InventoryRequest {
        match &self.config.region {
            Some(region) => request.region(region),
            None => request,
        }
    }
}
