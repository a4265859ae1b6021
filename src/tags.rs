//! Tag policy: the canonical tag set, interactive resolution with
//! suggestions, ARN synthesis for bare resource ids, and inherited tagging
//! of snapshots from their parent volumes.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::aws::error::ApiError;
use crate::aws::gateway::{Gateway, InventoryRequest, RemoteApi};
use crate::model::ec2::Ec2Snapshot;
use crate::model::{get_tag, Tag};

/// How many times a bad answer may be re-asked before the run gives up.
pub const MAX_PROMPT_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum TagError {
    #[error("no valid value for tag '{key}' after {MAX_PROMPT_ATTEMPTS} attempts")]
    AttemptsExhausted { key: String },

    #[error("cannot derive an ARN for resource '{resource}'")]
    UnknownResource { resource: String },

    #[error("failed to read answer: {0}")]
    Io(#[from] io::Error),
}

/// Policy for one tag key.
#[derive(Debug, Clone, Default)]
pub struct TagSpec {
    pub key: String,
    /// A required tag must end up with a value; an optional one may be left
    /// blank and is then not applied at all.
    pub required: bool,
    /// Closed value set; empty means any non-empty value is accepted.
    pub allowed_values: Vec<String>,
    /// Other tag keys whose value is offered as a suggestion.
    pub allow_values_from: Vec<String>,
    /// Services this tag is not asked for.
    pub hide_for_services: Vec<String>,
    /// What the tag is for, shown when prompting without a suggestion.
    pub purpose: Option<String>,
    /// Free-text hint shown in the prompt.
    pub examples: Option<String>,
}

impl TagSpec {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            required: true,
            ..Default::default()
        }
    }

    pub fn applies_to(&self, service: &str) -> bool {
        !self
            .hide_for_services
            .iter()
            .any(|hidden| hidden.eq_ignore_ascii_case(service))
    }

    /// Validate a raw answer, folding case onto the canonical allowed value
    /// when the value set is closed. Empty answers are never valid.
    pub fn canonical_value(&self, raw: &str) -> Option<String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if self.allowed_values.is_empty() {
            return Some(trimmed.to_string());
        }
        self.allowed_values
            .iter()
            .find(|allowed| allowed.eq_ignore_ascii_case(trimmed))
            .cloned()
    }

    /// Best available suggestion: the resource's own value for this key,
    /// then the donor keys, then the service name for the Service tag.
    pub fn suggest(
        &self,
        existing: &[Tag],
        resolved: &HashMap<String, String>,
        service: &str,
    ) -> Option<String> {
        if let Some(value) = get_tag(existing, &self.key).and_then(|v| self.canonical_value(v)) {
            return Some(value);
        }
        for source in &self.allow_values_from {
            if let Some(value) = resolved
                .get(source)
                .map(String::as_str)
                .or_else(|| get_tag(existing, source))
                .and_then(|v| self.canonical_value(v))
            {
                return Some(value);
            }
        }
        if self.key == "Service" {
            return self.canonical_value(service);
        }
        None
    }
}

/// The canonical tag set, in the order tags are asked for.
pub fn default_tag_config() -> Vec<TagSpec> {
    vec![
        TagSpec {
            hide_for_services: vec![
                "s3".to_string(),
                "rds".to_string(),
                "redshift".to_string(),
                "ec2:asg".to_string(),
            ],
            purpose: Some("All things should be named.".to_string()),
            examples: Some("halo-api".to_string()),
            ..TagSpec::new("Name")
        },
        TagSpec {
            allow_values_from: vec!["Platform".to_string()],
            purpose: Some("The application this resource is part of.".to_string()),
            ..TagSpec::new("Application")
        },
        TagSpec {
            allow_values_from: vec!["Application".to_string()],
            purpose: Some(
                "The platform the resource belongs to, for cost tracking across services."
                    .to_string(),
            ),
            ..TagSpec::new("Platform")
        },
        TagSpec {
            allowed_values: vec![
                "Development".to_string(),
                "Production".to_string(),
                "Stage".to_string(),
                "Test".to_string(),
                "QA".to_string(),
                "UAT".to_string(),
            ],
            allow_values_from: vec![
                "Stage".to_string(),
                "ENV".to_string(),
                "ENV_NAME".to_string(),
            ],
            purpose: Some("The hosting environment perimeter.".to_string()),
            ..TagSpec::new("Environment")
        },
        TagSpec {
            allow_values_from: vec!["SYSTEM".to_string(), "project".to_string()],
            purpose: Some("What type of resource is being used.".to_string()),
            examples: Some("db, lb, logging, web".to_string()),
            ..TagSpec::new("Service")
        },
    ]
}

/// Source of answers for tag prompts. Production reads stdin; tests script
/// the answers.
pub trait Prompter {
    fn ask(&mut self, prompt: &str) -> Result<String, TagError>;
}

pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn ask(&mut self, prompt: &str) -> Result<String, TagError> {
        let mut out = io::stderr();
        write!(out, "{prompt}")?;
        out.flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(answer.trim_end().to_string())
    }
}

/// Resolve a full tag set for one resource, prompting for each applicable
/// tag with the best suggestion pre-filled. An empty answer accepts the
/// suggestion; an invalid answer is re-asked up to [`MAX_PROMPT_ATTEMPTS`].
pub fn resolve_tags<P: Prompter>(
    specs: &[TagSpec],
    existing: &[Tag],
    service: &str,
    prompter: &mut P,
) -> Result<Vec<Tag>, TagError> {
    let mut resolved: HashMap<String, String> = HashMap::new();
    let mut tags = Vec::new();

    for spec in specs {
        if !spec.applies_to(service) {
            continue;
        }
        let suggestion = spec.suggest(existing, &resolved, service);
        let prompt = render_prompt(spec, suggestion.as_deref());

        let mut value = None;
        let mut left_blank = false;
        for _ in 0..MAX_PROMPT_ATTEMPTS {
            let answer = prompter.ask(&prompt)?;
            let candidate = if answer.trim().is_empty() {
                suggestion.clone().unwrap_or_default()
            } else {
                answer
            };
            if candidate.trim().is_empty() && !spec.required {
                left_blank = true;
                break;
            }
            match spec.canonical_value(&candidate) {
                Some(canonical) => {
                    value = Some(canonical);
                    break;
                }
                None => {
                    if spec.allowed_values.is_empty() {
                        warn!(tag = %spec.key, "a value is required");
                    } else {
                        warn!(
                            tag = %spec.key,
                            answer = %candidate,
                            allowed = %spec.allowed_values.join(", "),
                            "not an allowed value"
                        );
                    }
                }
            }
        }
        if left_blank {
            continue;
        }

        let value = value.ok_or_else(|| TagError::AttemptsExhausted {
            key: spec.key.clone(),
        })?;
        resolved.insert(spec.key.clone(), value.clone());
        tags.push(Tag::new(spec.key.clone(), value));
    }

    Ok(tags)
}

/// One line per prompt. A suggestion replaces the purpose and examples: the
/// operator accepting it does not need the background.
fn render_prompt(spec: &TagSpec, suggestion: Option<&str>) -> String {
    if let Some(value) = suggestion {
        return format!("{} [{}]: ", spec.key, value);
    }
    let mut prompt = String::new();
    if let Some(purpose) = &spec.purpose {
        prompt.push_str(&format!("{purpose}\n"));
    }
    if !spec.allowed_values.is_empty() {
        prompt.push_str(&format!("Allowed: {}\n", spec.allowed_values.join(", ")));
    } else if let Some(examples) = &spec.examples {
        prompt.push_str(&format!("Examples: {examples}\n"));
    }
    prompt.push_str(&format!("{}: ", spec.key));
    prompt
}

/// Build the ARN for a bare resource id. Full ARNs pass through; prefixed
/// short forms (`elb-`, `s3-`, `redshift-`) name the service explicitly.
pub fn resource_arn(region: &str, account: &str, resource: &str) -> Result<String, TagError> {
    if resource.starts_with("arn:") {
        return Ok(resource.to_string());
    }
    if resource.starts_with("vol-") {
        return Ok(format!("arn:aws:ec2:{region}:{account}:volume/{resource}"));
    }
    if resource.starts_with("snap-") {
        return Ok(format!("arn:aws:ec2:{region}:{account}:snapshot/{resource}"));
    }
    if resource.starts_with("i-") {
        return Ok(format!("arn:aws:ec2:{region}:{account}:instance/{resource}"));
    }
    if let Some(name) = resource.strip_prefix("elb-") {
        return Ok(format!(
            "arn:aws:elasticloadbalancing:{region}:{account}:loadbalancer/{name}"
        ));
    }
    if let Some(name) = resource.strip_prefix("s3-") {
        return Ok(format!("arn:aws:s3:::{name}"));
    }
    if let Some(name) = resource.strip_prefix("redshift-") {
        return Ok(format!("arn:aws:redshift:{region}:{account}:cluster:{name}"));
    }
    Err(TagError::UnknownResource {
        resource: resource.to_string(),
    })
}

/// Apply a tag set to one resource through the resource groups tagging API.
pub async fn apply_tags<C: RemoteApi>(
    gateway: &Gateway<C>,
    region: Option<&str>,
    arn: &str,
    tags: &[Tag],
    dry_run: bool,
) -> Result<(), ApiError> {
    if tags.is_empty() {
        return Ok(());
    }
    if dry_run {
        let summary: Vec<String> = tags
            .iter()
            .map(|tag| format!("{}={}", tag.key, tag.value))
            .collect();
        info!(arn, tags = %summary.join(", "), "[DRY RUN] Would tag");
        return Ok(());
    }

    let tag_map: serde_json::Map<String, Value> = tags
        .iter()
        .map(|tag| (tag.key.clone(), Value::String(tag.value.clone())))
        .collect();
    let mut request = InventoryRequest::new("resourcegroupstaggingapi", "tag_resources").params(
        json!({
            "ResourceARNList": [arn],
            "Tags": tag_map,
        }),
    );
    if let Some(region) = region {
        request = request.region(region);
    }

    if let Some(response) = gateway.call(&request).await? {
        if let Some(failed) = response.get("FailedResourcesMap").and_then(Value::as_object) {
            for (resource, detail) in failed {
                warn!(resource = %resource, detail = %detail, "tagging failed");
            }
        }
    }
    info!(arn, "tagged");
    Ok(())
}

/// Tags one snapshot should inherit from its parent volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotTagPlan {
    pub snapshot_id: String,
    pub tags: Vec<Tag>,
}

/// Plan inherited tags for every snapshot with a tagged parent volume.
///
/// Snapshots whose volume is unknown or untagged are skipped. A missing
/// Name falls back to the volume id so the snapshot always ends up
/// identifiable; every other configured tag is copied from the parent only
/// when the snapshot does not carry it already.
pub fn plan_snapshot_inheritance(
    specs: &[TagSpec],
    snapshots: &[Ec2Snapshot],
    volume_tags: &HashMap<String, Vec<Tag>>,
) -> Vec<SnapshotTagPlan> {
    let mut plans = Vec::new();
    for snapshot in snapshots {
        let Some(parent) = volume_tags.get(&snapshot.volume_id) else {
            continue;
        };
        if parent.is_empty() {
            continue;
        }

        let mut tags = Vec::new();
        for spec in specs {
            if get_tag(&snapshot.tags, &spec.key).is_some_and(|v| !v.is_empty()) {
                continue;
            }
            if spec.key == "Name" {
                let name = get_tag(parent, "Name")
                    .filter(|v| !v.is_empty())
                    .unwrap_or(&snapshot.volume_id);
                tags.push(Tag::new("Name", name));
                continue;
            }
            if let Some(value) = get_tag(parent, &spec.key).filter(|v| !v.is_empty()) {
                tags.push(Tag::new(spec.key.clone(), value));
            }
        }

        if !tags.is_empty() {
            plans.push(SnapshotTagPlan {
                snapshot_id: snapshot.snapshot_id.clone(),
                tags,
            });
        }
    }
    plans
}

/// Settings for the snapshot tag inheritance pass.
#[derive(Debug, Clone, Default)]
pub struct TagSyncConfig {
    pub account: String,
    pub region: String,
    pub dry_run: bool,
    pub cache_ttl: u64,
}

#[derive(Debug, Default)]
pub struct TagSyncOutcome {
    pub planned: Vec<SnapshotTagPlan>,
    pub tagged: usize,
    pub failed: usize,
}

/// Propagate volume tags to snapshots missing them, per the canonical tag
/// config. Individual tagging failures are reported and do not stop the
/// pass.
pub async fn sync_snapshot_tags<C: RemoteApi>(
    gateway: &Gateway<C>,
    config: &TagSyncConfig,
) -> Result<TagSyncOutcome, ApiError> {
    let snapshot_records = gateway
        .records(
            &InventoryRequest::new("ec2", "describe_snapshots")
                .extraction_key("Snapshots")
                .params(json!({
                    "OwnerIds": ["self"],
                    "PaginationConfig": {"MaxResults": 99999},
                }))
                .cache_ttl(config.cache_ttl)
                .region(&config.region),
        )
        .await?;
    let mut snapshots = Vec::new();
    for record in snapshot_records {
        match Ec2Snapshot::from_record(record) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(err) => warn!(error = %err, "skipping unreadable snapshot record"),
        }
    }

    let tag_records = gateway
        .records(
            &InventoryRequest::new("ec2", "describe_tags")
                .extraction_key("Tags")
                .params(json!({
                    "Filters": [{"Name": "resource-type", "Values": ["volume"]}],
                    "PaginationConfig": {"MaxResults": 99999},
                }))
                .cache_ttl(config.cache_ttl)
                .region(&config.region),
        )
        .await?;
    let mut volume_tags: HashMap<String, Vec<Tag>> = HashMap::new();
    for record in tag_records {
        let Some(resource_id) = record.get("ResourceId").and_then(Value::as_str) else {
            continue;
        };
        let key = record.get("Key").and_then(Value::as_str).unwrap_or_default();
        let value = record
            .get("Value")
            .and_then(Value::as_str)
            .unwrap_or_default();
        volume_tags
            .entry(resource_id.to_string())
            .or_default()
            .push(Tag::new(key, value));
    }

    let specs = default_tag_config();
    let planned = plan_snapshot_inheritance(&specs, &snapshots, &volume_tags);

    let mut outcome = TagSyncOutcome::default();
    for plan in &planned {
        let arn = match resource_arn(&config.region, &config.account, &plan.snapshot_id) {
            Ok(arn) => arn,
            Err(err) => {
                warn!(snapshot = %plan.snapshot_id, error = %err, "cannot tag");
                outcome.failed += 1;
                continue;
            }
        };
        match apply_tags(
            gateway,
            Some(&config.region),
            &arn,
            &plan.tags,
            config.dry_run,
        )
        .await
        {
            Ok(()) => outcome.tagged += 1,
            Err(err) => {
                warn!(snapshot = %plan.snapshot_id, error = %err, "tagging failed");
                outcome.failed += 1;
            }
        }
    }
    outcome.planned = planned;
    Ok(outcome)
}
