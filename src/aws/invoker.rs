//! Registry of AWS SDK handlers behind the [`RemoteApi`] trait.
//!
//! Each supported `(service, operation)` pair maps to one typed SDK call.
//! Handlers normalize SDK output back into wire-shaped JSON (the field names
//! AWS uses on the wire) so the gateway, cache, and models all see one
//! representation. Paginated operations follow the service's token or
//! marker until exhaustion and return every page.

use serde_json::{json, Value};

use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::Filter;

use crate::aws::context::AwsContext;
use crate::aws::error::ApiError;
use crate::aws::gateway::{ApiResponse, InventoryRequest, RemoteApi};

/// Production [`RemoteApi`] backed by the AWS SDK.
pub struct SdkInvoker {
    ctx: AwsContext,
}

impl SdkInvoker {
    pub fn new(ctx: AwsContext) -> Self {
        Self { ctx }
    }
}

impl RemoteApi for SdkInvoker {
    async fn invoke(&self, request: &InventoryRequest) -> Result<ApiResponse, ApiError> {
        let region = request
            .region
            .clone()
            .unwrap_or_else(|| self.ctx.default_region().to_string());

        match (request.service.as_str(), request.operation.as_str()) {
            ("ec2", "describe_snapshots") => self.ec2_describe_snapshots(request, &region).await,
            ("ec2", "describe_volumes") => self.ec2_describe_volumes(request, &region).await,
            ("ec2", "describe_instances") => self.ec2_describe_instances(request, &region).await,
            ("ec2", "describe_images") => self.ec2_describe_images(request, &region).await,
            ("ec2", "describe_tags") => self.ec2_describe_tags(request, &region).await,
            ("ec2", "delete_snapshot") => self.ec2_delete_snapshot(request, &region).await,
            ("rds", "describe_db_cluster_snapshots") => {
                self.rds_describe_cluster_snapshots(request, &region).await
            }
            ("rds", "describe_export_tasks") => {
                self.rds_describe_export_tasks(request, &region).await
            }
            ("rds", "start_export_task") => self.rds_start_export_task(request, &region).await,
            ("rds", "delete_db_cluster_snapshot") => {
                self.rds_delete_cluster_snapshot(request, &region).await
            }
            ("s3", "head_object") => self.s3_head_object(request, &region).await,
            ("kms", "describe_key") => self.kms_describe_key(request, &region).await,
            ("resourcegroupstaggingapi", "tag_resources") => {
                self.tagging_tag_resources(request, &region).await
            }
            _ => Err(ApiError::UnknownOperation {
                service: request.service.clone(),
                operation: request.operation.clone(),
            }),
        }
    }
}

impl SdkInvoker {
    async fn ec2_describe_snapshots(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let client = self.ctx.ec2(region).await;
        let max = page_size(&request.params, 1000, 5, 1000);
        let owners = string_list(&request.params, "OwnerIds");
        let filters = ec2_filters(&request.params);

        let mut pages = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut call = client.describe_snapshots().max_results(max);
            if !owners.is_empty() {
                call = call.set_owner_ids(Some(owners.clone()));
            }
            if !filters.is_empty() {
                call = call.set_filters(Some(filters.clone()));
            }
            if let Some(token) = &token {
                call = call.next_token(token);
            }
            let out = call
                .send()
                .await
                .map_err(|e| classify_sdk("ec2", "describe_snapshots", region, e))?;
            let items: Vec<Value> = out.snapshots().iter().map(snapshot_to_value).collect();
            let page = json!({ "Snapshots": items });
            if !request.is_paginated() {
                return Ok(ApiResponse::Single(page));
            }
            pages.push(page);
            match out.next_token() {
                Some(next) if !next.is_empty() => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(ApiResponse::Pages(pages))
    }

    async fn ec2_describe_volumes(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let client = self.ctx.ec2(region).await;
        let max = page_size(&request.params, 500, 5, 500);
        let filters = ec2_filters(&request.params);

        let mut pages = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut call = client.describe_volumes().max_results(max);
            if !filters.is_empty() {
                call = call.set_filters(Some(filters.clone()));
            }
            if let Some(token) = &token {
                call = call.next_token(token);
            }
            let out = call
                .send()
                .await
                .map_err(|e| classify_sdk("ec2", "describe_volumes", region, e))?;
            let items: Vec<Value> = out.volumes().iter().map(volume_to_value).collect();
            let page = json!({ "Volumes": items });
            if !request.is_paginated() {
                return Ok(ApiResponse::Single(page));
            }
            pages.push(page);
            match out.next_token() {
                Some(next) if !next.is_empty() => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(ApiResponse::Pages(pages))
    }

    async fn ec2_describe_instances(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let client = self.ctx.ec2(region).await;
        let max = page_size(&request.params, 1000, 5, 1000);
        let filters = ec2_filters(&request.params);

        let mut pages = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut call = client.describe_instances().max_results(max);
            if !filters.is_empty() {
                call = call.set_filters(Some(filters.clone()));
            }
            if let Some(token) = &token {
                call = call.next_token(token);
            }
            let out = call
                .send()
                .await
                .map_err(|e| classify_sdk("ec2", "describe_instances", region, e))?;
            let reservations: Vec<Value> = out
                .reservations()
                .iter()
                .map(|r| {
                    let instances: Vec<Value> =
                        r.instances().iter().map(instance_to_value).collect();
                    json!({ "Instances": instances })
                })
                .collect();
            let page = json!({ "Reservations": reservations });
            if !request.is_paginated() {
                return Ok(ApiResponse::Single(page));
            }
            pages.push(page);
            match out.next_token() {
                Some(next) if !next.is_empty() => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(ApiResponse::Pages(pages))
    }

    async fn ec2_describe_images(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let client = self.ctx.ec2(region).await;
        let owners = string_list(&request.params, "Owners");
        let filters = ec2_filters(&request.params);

        let mut pages = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut call = client.describe_images();
            if !owners.is_empty() {
                call = call.set_owners(Some(owners.clone()));
            }
            if !filters.is_empty() {
                call = call.set_filters(Some(filters.clone()));
            }
            if let Some(token) = &token {
                call = call.next_token(token);
            }
            let out = call
                .send()
                .await
                .map_err(|e| classify_sdk("ec2", "describe_images", region, e))?;
            let items: Vec<Value> = out.images().iter().map(image_to_value).collect();
            let page = json!({ "Images": items });
            if !request.is_paginated() {
                return Ok(ApiResponse::Single(page));
            }
            pages.push(page);
            match out.next_token() {
                Some(next) if !next.is_empty() => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(ApiResponse::Pages(pages))
    }

    async fn ec2_describe_tags(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let client = self.ctx.ec2(region).await;
        let max = page_size(&request.params, 1000, 5, 1000);
        let filters = ec2_filters(&request.params);

        let mut pages = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut call = client.describe_tags().max_results(max);
            if !filters.is_empty() {
                call = call.set_filters(Some(filters.clone()));
            }
            if let Some(token) = &token {
                call = call.next_token(token);
            }
            let out = call
                .send()
                .await
                .map_err(|e| classify_sdk("ec2", "describe_tags", region, e))?;
            let items: Vec<Value> = out
                .tags()
                .iter()
                .map(|t| {
                    json!({
                        "ResourceId": t.resource_id(),
                        "ResourceType": t.resource_type().map(|rt| rt.as_str()),
                        "Key": t.key(),
                        "Value": t.value(),
                    })
                })
                .collect();
            let page = json!({ "Tags": items });
            if !request.is_paginated() {
                return Ok(ApiResponse::Single(page));
            }
            pages.push(page);
            match out.next_token() {
                Some(next) if !next.is_empty() => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(ApiResponse::Pages(pages))
    }

    async fn ec2_delete_snapshot(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let id = require_str(request, "SnapshotId", region)?;
        let client = self.ctx.ec2(region).await;
        client
            .delete_snapshot()
            .snapshot_id(id)
            .send()
            .await
            .map_err(|e| classify_sdk("ec2", "delete_snapshot", region, e))?;
        Ok(ApiResponse::Single(
            json!({ "SnapshotId": id, "Deleted": true }),
        ))
    }

    async fn rds_describe_cluster_snapshots(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let client = self.ctx.rds(region).await;
        let max = page_size(&request.params, 100, 20, 100);
        let snapshot_type = opt_str(&request.params, "SnapshotType");

        let mut pages = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut call = client.describe_db_cluster_snapshots().max_records(max);
            if let Some(kind) = snapshot_type {
                call = call.snapshot_type(kind);
            }
            if let Some(marker) = &marker {
                call = call.marker(marker);
            }
            let out = call.send().await.map_err(|e| {
                classify_sdk("rds", "describe_db_cluster_snapshots", region, e)
            })?;
            let items: Vec<Value> = out
                .db_cluster_snapshots()
                .iter()
                .map(cluster_snapshot_to_value)
                .collect();
            let page = json!({ "DBClusterSnapshots": items });
            if !request.is_paginated() {
                return Ok(ApiResponse::Single(page));
            }
            pages.push(page);
            match out.marker() {
                Some(next) if !next.is_empty() => marker = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(ApiResponse::Pages(pages))
    }

    async fn rds_describe_export_tasks(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let client = self.ctx.rds(region).await;
        let max = page_size(&request.params, 100, 20, 100);

        let mut pages = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let mut call = client.describe_export_tasks().max_records(max);
            if let Some(marker) = &marker {
                call = call.marker(marker);
            }
            let out = call
                .send()
                .await
                .map_err(|e| classify_sdk("rds", "describe_export_tasks", region, e))?;
            let items: Vec<Value> = out.export_tasks().iter().map(export_task_to_value).collect();
            let page = json!({ "ExportTasks": items });
            if !request.is_paginated() {
                return Ok(ApiResponse::Single(page));
            }
            pages.push(page);
            match out.marker() {
                Some(next) if !next.is_empty() => marker = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(ApiResponse::Pages(pages))
    }

    async fn rds_start_export_task(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let id = require_str(request, "ExportTaskIdentifier", region)?;
        let source_arn = require_str(request, "SourceArn", region)?;
        let bucket = require_str(request, "S3BucketName", region)?;
        let role = require_str(request, "IamRoleArn", region)?;
        let kms_key = require_str(request, "KmsKeyId", region)?;

        let client = self.ctx.rds(region).await;
        let mut call = client
            .start_export_task()
            .export_task_identifier(id)
            .source_arn(source_arn)
            .s3_bucket_name(bucket)
            .iam_role_arn(role)
            .kms_key_id(kms_key);
        if let Some(prefix) = opt_str(&request.params, "S3Prefix") {
            call = call.s3_prefix(prefix);
        }
        let out = call
            .send()
            .await
            .map_err(|e| classify_sdk("rds", "start_export_task", region, e))?;

        Ok(ApiResponse::Single(json!({
            "ExportTaskIdentifier": out.export_task_identifier(),
            "SourceArn": out.source_arn(),
            "Status": out.status(),
            "PercentProgress": out.percent_progress(),
            "S3Bucket": out.s3_bucket(),
            "S3Prefix": out.s3_prefix(),
            "IamRoleArn": out.iam_role_arn(),
            "KmsKeyId": out.kms_key_id(),
            "FailureCause": out.failure_cause(),
            "WarningMessage": out.warning_message(),
        })))
    }

    async fn rds_delete_cluster_snapshot(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let id = require_str(request, "DBClusterSnapshotIdentifier", region)?;
        let client = self.ctx.rds(region).await;
        let out = client
            .delete_db_cluster_snapshot()
            .db_cluster_snapshot_identifier(id)
            .send()
            .await
            .map_err(|e| classify_sdk("rds", "delete_db_cluster_snapshot", region, e))?;
        let value = out
            .db_cluster_snapshot()
            .map(cluster_snapshot_to_value)
            .unwrap_or_else(|| json!({ "DBClusterSnapshotIdentifier": id }));
        Ok(ApiResponse::Single(value))
    }

    async fn s3_head_object(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let bucket = require_str(request, "Bucket", region)?;
        let key = require_str(request, "Key", region)?;
        let client = self.ctx.s3(region).await;
        let out = client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk("s3", "head_object", region, e))?;
        Ok(ApiResponse::Single(json!({
            "ContentLength": out.content_length(),
            "LastModified": datetime_value(out.last_modified()),
            "ETag": out.e_tag(),
        })))
    }

    async fn kms_describe_key(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let key_id = require_str(request, "KeyId", region)?;
        let client = self.ctx.kms(region).await;
        let out = client
            .describe_key()
            .key_id(key_id)
            .send()
            .await
            .map_err(|e| classify_sdk("kms", "describe_key", region, e))?;
        let metadata = out
            .key_metadata()
            .map(|meta| {
                json!({
                    "KeyId": meta.key_id(),
                    "Arn": meta.arn(),
                    "Description": meta.description(),
                })
            })
            .unwrap_or(Value::Null);
        Ok(ApiResponse::Single(json!({ "KeyMetadata": metadata })))
    }

    async fn tagging_tag_resources(
        &self,
        request: &InventoryRequest,
        region: &str,
    ) -> Result<ApiResponse, ApiError> {
        let arns = string_list(&request.params, "ResourceARNList");
        if arns.is_empty() {
            return Err(missing_param(request, "ResourceARNList", region));
        }
        let client = self.ctx.tagging(region).await;
        let mut call = client.tag_resources();
        for arn in &arns {
            call = call.resource_arn_list(arn);
        }
        if let Some(tags) = request.params.get("Tags").and_then(Value::as_object) {
            for (key, value) in tags {
                call = call.tags(key, value.as_str().unwrap_or_default());
            }
        }
        let out = call
            .send()
            .await
            .map_err(|e| classify_sdk("resourcegroupstaggingapi", "tag_resources", region, e))?;
        let mut failed = serde_json::Map::new();
        if let Some(map) = out.failed_resources_map() {
            for (arn, info) in map {
                failed.insert(
                    arn.clone(),
                    json!({
                        "StatusCode": info.status_code(),
                        "ErrorCode": info.error_code().map(|c| c.as_str()),
                        "ErrorMessage": info.error_message(),
                    }),
                );
            }
        }
        Ok(ApiResponse::Single(json!({ "FailedResourcesMap": failed })))
    }
}

// ── SDK output normalization ───────────────────────────────────────────────

fn datetime_value(dt: Option<&aws_smithy_types::DateTime>) -> Value {
    dt.and_then(|d| chrono::DateTime::from_timestamp(d.secs(), d.subsec_nanos()))
        .map(|t| Value::String(t.to_rfc3339()))
        .unwrap_or(Value::Null)
}

fn ec2_tags_value(tags: &[aws_sdk_ec2::types::Tag]) -> Value {
    Value::Array(
        tags.iter()
            .map(|t| {
                json!({
                    "Key": t.key().unwrap_or_default(),
                    "Value": t.value().unwrap_or_default(),
                })
            })
            .collect(),
    )
}

fn rds_tags_value(tags: &[aws_sdk_rds::types::Tag]) -> Value {
    Value::Array(
        tags.iter()
            .map(|t| {
                json!({
                    "Key": t.key().unwrap_or_default(),
                    "Value": t.value().unwrap_or_default(),
                })
            })
            .collect(),
    )
}

fn snapshot_to_value(s: &aws_sdk_ec2::types::Snapshot) -> Value {
    json!({
        "SnapshotId": s.snapshot_id().unwrap_or_default(),
        "VolumeId": s.volume_id().unwrap_or_default(),
        "StartTime": datetime_value(s.start_time()),
        "Description": s.description().unwrap_or_default(),
        "State": s.state().map(|st| st.as_str()),
        "Progress": s.progress(),
        "OwnerId": s.owner_id(),
        "Encrypted": s.encrypted(),
        "VolumeSize": s.volume_size(),
        "StorageTier": s.storage_tier().map(|t| t.as_str()),
        "Tags": ec2_tags_value(s.tags()),
    })
}

fn volume_to_value(v: &aws_sdk_ec2::types::Volume) -> Value {
    let attachments: Vec<Value> = v
        .attachments()
        .iter()
        .map(|a| {
            json!({
                "InstanceId": a.instance_id().unwrap_or_default(),
                "State": a.state().map(|s| s.as_str()),
                "Device": a.device(),
            })
        })
        .collect();
    json!({
        "VolumeId": v.volume_id().unwrap_or_default(),
        "SnapshotId": v.snapshot_id().unwrap_or_default(),
        "CreateTime": datetime_value(v.create_time()),
        "State": v.state().map(|s| s.as_str()),
        "Size": v.size(),
        "Attachments": attachments,
        "Tags": ec2_tags_value(v.tags()),
    })
}

fn instance_to_value(i: &aws_sdk_ec2::types::Instance) -> Value {
    json!({
        "InstanceId": i.instance_id().unwrap_or_default(),
        "State": { "Name": i.state().and_then(|s| s.name()).map(|n| n.as_str()) },
        "LaunchTime": datetime_value(i.launch_time()),
        "Tags": ec2_tags_value(i.tags()),
    })
}

fn image_to_value(i: &aws_sdk_ec2::types::Image) -> Value {
    json!({
        "ImageId": i.image_id().unwrap_or_default(),
        "Name": i.name().unwrap_or_default(),
        "Description": i.description().unwrap_or_default(),
        "CreationDate": i.creation_date(),
        "State": i.state().map(|s| s.as_str()),
        "Tags": ec2_tags_value(i.tags()),
    })
}

fn cluster_snapshot_to_value(s: &aws_sdk_rds::types::DbClusterSnapshot) -> Value {
    json!({
        "DBClusterSnapshotIdentifier": s.db_cluster_snapshot_identifier().unwrap_or_default(),
        "DBClusterIdentifier": s.db_cluster_identifier().unwrap_or_default(),
        "DBClusterSnapshotArn": s.db_cluster_snapshot_arn().unwrap_or_default(),
        "SnapshotCreateTime": datetime_value(s.snapshot_create_time()),
        "Status": s.status().unwrap_or_default(),
        "Engine": s.engine().unwrap_or_default(),
        "EngineMode": s.engine_mode().unwrap_or_default(),
        "EngineVersion": s.engine_version(),
        "SnapshotType": s.snapshot_type(),
        "AllocatedStorage": s.allocated_storage(),
        "StorageEncrypted": s.storage_encrypted(),
        "KmsKeyId": s.kms_key_id(),
        "TagList": rds_tags_value(s.tag_list()),
    })
}

fn export_task_to_value(t: &aws_sdk_rds::types::ExportTask) -> Value {
    json!({
        "ExportTaskIdentifier": t.export_task_identifier().unwrap_or_default(),
        "SourceArn": t.source_arn().unwrap_or_default(),
        "Status": t.status().unwrap_or_default(),
        "PercentProgress": t.percent_progress(),
        "TotalExtractedDataInGB": t.total_extracted_data_in_gb(),
        "S3Bucket": t.s3_bucket(),
        "S3Prefix": t.s3_prefix(),
        "IamRoleArn": t.iam_role_arn(),
        "KmsKeyId": t.kms_key_id(),
        "TaskStartTime": datetime_value(t.task_start_time()),
        "TaskEndTime": datetime_value(t.task_end_time()),
        "FailureCause": t.failure_cause(),
        "WarningMessage": t.warning_message(),
    })
}

// ── Request parameter helpers ──────────────────────────────────────────────

fn classify_sdk<E>(service: &str, operation: &str, region: &str, err: SdkError<E>) -> ApiError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => ApiError::Unavailable {
            service: service.to_string(),
            operation: operation.to_string(),
            region: region.to_string(),
            message: err.to_string(),
        },
        _ => {
            let code = err.code().map(str::to_string);
            let message = err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            ApiError::classify(service, operation, region, code.as_deref(), &message)
        }
    }
}

fn page_size(params: &Value, default: i64, min: i64, max: i64) -> i32 {
    params
        .get("PaginationConfig")
        .and_then(|config| {
            config
                .get("MaxResults")
                .or_else(|| config.get("MaxRecords"))
                .or_else(|| config.get("MaxItems"))
        })
        .and_then(Value::as_i64)
        .unwrap_or(default)
        .clamp(min, max) as i32
}

fn string_list(params: &Value, key: &str) -> Vec<String> {
    params
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn opt_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn require_str<'a>(
    request: &'a InventoryRequest,
    key: &str,
    region: &str,
) -> Result<&'a str, ApiError> {
    opt_str(&request.params, key).ok_or_else(|| missing_param(request, key, region))
}

fn missing_param(request: &InventoryRequest, key: &str, region: &str) -> ApiError {
    ApiError::Service {
        service: request.service.clone(),
        operation: request.operation.clone(),
        region: region.to_string(),
        code: "MissingParameter".to_string(),
        message: format!("required parameter '{key}' was not provided"),
    }
}

fn ec2_filters(params: &Value) -> Vec<Filter> {
    let mut filters = Vec::new();
    if let Some(items) = params.get("Filters").and_then(Value::as_array) {
        for item in items {
            let name = item.get("Name").and_then(Value::as_str).unwrap_or_default();
            let values: Vec<String> = item
                .get("Values")
                .and_then(Value::as_array)
                .map(|vs| {
                    vs.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            filters.push(Filter::builder().name(name).set_values(Some(values)).build());
        }
    }
    filters
}
