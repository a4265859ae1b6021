//! EC2 snapshot model: lineage parsing, relationship enrichment, and the
//! inventory loader that assembles snapshots, volumes, instances, and images
//! into one navigable structure.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::aws::error::ApiError;
use crate::aws::gateway::{Gateway, InventoryRequest, RemoteApi};
use crate::model::{get_tag, Tag};
use crate::util::parse_timestamp;

/// Snapshots whose description starts with one of these are machine-managed
/// (AMI copies, backup tooling) and excluded from the inventory.
pub const IGNORED_DESCRIPTION_PREFIXES: &[&str] = &[
    "Copied for DestinationAmi",
    "ec2ab",
    "Created by AWS-VMImport",
    "Created for policy",
    "[Copied snap-",
];

static RESOURCE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b[a-z]+-[a-z0-9]+").expect("static pattern is valid"));
static NON_WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\W_]+").expect("static pattern is valid"));

/// Resource ids recovered from a snapshot description, plus a normalized
/// fallback slug when the description names no resources at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lineage {
    pub instance_ids: Vec<String>,
    pub image_ids: Vec<String>,
    pub volume_ids: Vec<String>,
    pub snapshot_ids: Vec<String>,
    pub slug: Option<String>,
}

impl Lineage {
    pub fn is_empty(&self) -> bool {
        self.instance_ids.is_empty()
            && self.image_ids.is_empty()
            && self.volume_ids.is_empty()
            && self.snapshot_ids.is_empty()
    }
}

/// Pull resource ids out of a free-form description.
///
/// Only ids with a known prefix are kept. When none are found the
/// description is normalized into a short slug so unrelated snapshots with
/// the same boilerplate description still group together.
pub fn parse_lineage(description: &str) -> Lineage {
    let mut lineage = Lineage::default();
    for found in RESOURCE_ID.find_iter(description) {
        let id = found.as_str();
        if id.starts_with("i-") {
            lineage.instance_ids.push(id.to_string());
        } else if id.starts_with("ami-") {
            lineage.image_ids.push(id.to_string());
        } else if id.starts_with("vol-") {
            lineage.volume_ids.push(id.to_string());
        } else if id.starts_with("snap-") {
            lineage.snapshot_ids.push(id.to_string());
        }
    }

    if lineage.is_empty() {
        let normalized = NON_WORD.replace_all(description, " ");
        let slug: String = normalized
            .trim()
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-")
            .chars()
            .take(24)
            .collect();
        if !slug.is_empty() {
            lineage.slug = Some(slug);
        }
    }

    lineage
}

/// Where a snapshot sits in its retention lifecycle, filled in during
/// adjudication.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Lifecycle {
    pub is_oldest: bool,
    pub is_newest: bool,
    pub is_eol: bool,
    pub is_older_than_cutoff: bool,
    pub is_newer_than_cutoff: bool,
    pub verdict: Verdict,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Verdict {
    #[default]
    Undecided,
    Retain,
    Remove,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Undecided => "undecided",
            Verdict::Retain => "retain",
            Verdict::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Volume {
    #[serde(rename = "VolumeId")]
    pub volume_id: String,
    #[serde(rename = "SnapshotId")]
    pub snapshot_id: String,
    #[serde(rename = "CreateTime")]
    pub create_time: Option<String>,
    #[serde(rename = "State")]
    pub state: Option<String>,
    #[serde(rename = "Size")]
    pub size: Option<i64>,
    #[serde(rename = "Attachments")]
    pub attachments: Vec<Attachment>,
    #[serde(rename = "Tags")]
    pub tags: Vec<Tag>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Attachment {
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "State")]
    pub state: Option<String>,
    #[serde(rename = "Device")]
    pub device: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Instance {
    #[serde(rename = "InstanceId")]
    pub instance_id: String,
    #[serde(rename = "State")]
    pub state: InstanceState,
    #[serde(rename = "LaunchTime")]
    pub launch_time: Option<String>,
    #[serde(rename = "Tags")]
    pub tags: Vec<Tag>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceState {
    #[serde(rename = "Name")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Image {
    #[serde(rename = "ImageId")]
    pub image_id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "CreationDate")]
    pub creation_date: Option<String>,
    #[serde(rename = "State")]
    pub state: Option<String>,
    #[serde(rename = "Tags")]
    pub tags: Vec<Tag>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An EC2 snapshot plus the relationships resolved for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Ec2Snapshot {
    #[serde(rename = "SnapshotId")]
    pub snapshot_id: String,
    #[serde(rename = "VolumeId")]
    pub volume_id: String,
    #[serde(rename = "StartTime")]
    pub start_time: Option<String>,
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "State")]
    pub state: Option<String>,
    #[serde(rename = "VolumeSize")]
    pub volume_size: Option<i64>,
    #[serde(rename = "StorageTier")]
    pub storage_tier: Option<String>,
    #[serde(rename = "OwnerId")]
    pub owner_id: Option<String>,
    #[serde(rename = "Encrypted")]
    pub encrypted: Option<bool>,
    #[serde(rename = "Tags")]
    pub tags: Vec<Tag>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    #[serde(skip)]
    pub lineage: Lineage,
    #[serde(skip)]
    pub lifecycle: Lifecycle,
    #[serde(skip)]
    pub name_tag: String,
    #[serde(skip)]
    pub volume: Option<Volume>,
    #[serde(skip)]
    pub instance: Option<Instance>,
    #[serde(skip)]
    pub image: Option<Image>,
}

impl Ec2Snapshot {
    pub fn from_record(record: Value) -> Result<Self, serde_json::Error> {
        let mut snapshot: Ec2Snapshot = serde_json::from_value(record)?;
        snapshot.lineage = parse_lineage(&snapshot.description);
        Ok(snapshot)
    }

    /// Snapshot creation time; epoch when the timestamp is missing or
    /// unparsable, which keeps ordering total.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.start_time
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Compose the grouping name from the snapshot's own Name tag, its
    /// volume's and instance's Name tags, the volume id, and markers
    /// recording which relations resolved. The result is never empty.
    pub fn build_name_tag(&mut self) {
        let mut names: Vec<String> = Vec::new();
        let mut markers: Vec<&str> = Vec::new();

        if let Some(name) = get_tag(&self.tags, "Name") {
            if !name.is_empty() {
                names.push(name.to_string());
            }
        }

        match &self.volume {
            Some(volume) if !volume.tags.is_empty() => {
                markers.push("volume found");
                if let Some(name) = get_tag(&volume.tags, "Name") {
                    if !name.is_empty() && !names.iter().any(|n| n == name) {
                        names.push(name.to_string());
                    }
                }
            }
            _ => markers.push("volume not found"),
        }

        match &self.instance {
            Some(instance) if !instance.tags.is_empty() => {
                markers.push("instance found");
                if let Some(name) = get_tag(&instance.tags, "Name") {
                    if !name.is_empty() && !names.iter().any(|n| n == name) {
                        names.push(name.to_string());
                    }
                }
            }
            _ => markers.push("instance not found"),
        }

        names.push(self.volume_id.clone());
        names.extend(markers.iter().map(|m| m.to_string()));
        self.name_tag = format!("[{}]", names.join("]::["));
    }
}

fn is_ignored_description(description: &str) -> bool {
    IGNORED_DESCRIPTION_PREFIXES
        .iter()
        .any(|prefix| description.starts_with(prefix))
}

/// The full EC2 snapshot inventory for one region, with relationships
/// resolved and name tags built.
#[derive(Debug, Default)]
pub struct SnapshotInventory {
    pub snapshots: Vec<Ec2Snapshot>,
    pub volumes: HashMap<String, Volume>,
    pub instances: HashMap<String, Instance>,
    pub images: HashMap<String, Image>,
}

impl SnapshotInventory {
    /// Load snapshots, volumes, instances, and images through the gateway
    /// and enrich every snapshot with its relations.
    pub async fn load<C: RemoteApi>(
        gateway: &Gateway<C>,
        cache_ttl: u64,
        region: Option<&str>,
    ) -> Result<Self, ApiError> {
        let with_region = |request: InventoryRequest| match region {
            Some(region) => request.region(region),
            None => request,
        };

        let volume_records = gateway
            .records(&with_region(
                InventoryRequest::new("ec2", "describe_volumes")
                    .extraction_key("Volumes")
                    .params(json!({"PaginationConfig": {"MaxResults": 99999}}))
                    .cache_ttl(cache_ttl),
            ))
            .await?;

        let image_records = gateway
            .records(&with_region(
                InventoryRequest::new("ec2", "describe_images")
                    .extraction_key("Images")
                    .params(json!({
                        "Owners": ["self"],
                        "Filters": [{"Name": "state", "Values": ["available"]}],
                    }))
                    .cache_ttl(cache_ttl),
            ))
            .await?;

        let reservation_records = gateway
            .records(&with_region(
                InventoryRequest::new("ec2", "describe_instances")
                    .extraction_key("Reservations")
                    .params(json!({"PaginationConfig": {"MaxResults": 99999}}))
                    .cache_ttl(cache_ttl),
            ))
            .await?;

        let snapshot_records = gateway
            .records(&with_region(
                InventoryRequest::new("ec2", "describe_snapshots")
                    .extraction_key("Snapshots")
                    .params(json!({
                        "OwnerIds": ["self"],
                        "PaginationConfig": {"MaxResults": 99999},
                        "Filters": [{"Name": "status", "Values": ["completed"]}],
                    }))
                    .cache_ttl(cache_ttl),
            ))
            .await?;

        let mut inventory = SnapshotInventory::default();

        for record in volume_records {
            match serde_json::from_value::<Volume>(record) {
                Ok(volume) => {
                    inventory.volumes.insert(volume.volume_id.clone(), volume);
                }
                Err(err) => warn!(error = %err, "skipping unreadable volume record"),
            }
        }

        for record in image_records {
            match serde_json::from_value::<Image>(record) {
                Ok(image) => {
                    inventory.images.insert(image.image_id.clone(), image);
                }
                Err(err) => warn!(error = %err, "skipping unreadable image record"),
            }
        }

        for record in reservation_records {
            let instances = record
                .get("Instances")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in instances {
                match serde_json::from_value::<Instance>(item) {
                    Ok(instance) => {
                        inventory
                            .instances
                            .insert(instance.instance_id.clone(), instance);
                    }
                    Err(err) => warn!(error = %err, "skipping unreadable instance record"),
                }
            }
        }

        for record in snapshot_records {
            let description = record
                .get("Description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if is_ignored_description(description) {
                debug!(description, "skipping machine-managed snapshot");
                continue;
            }
            match Ec2Snapshot::from_record(record) {
                Ok(snapshot) => inventory.snapshots.push(snapshot),
                Err(err) => warn!(error = %err, "skipping unreadable snapshot record"),
            }
        }

        inventory.enrich();
        Ok(inventory)
    }

    /// Resolve volume, instance, and image relations, then build the name
    /// tag every snapshot groups under.
    pub fn enrich(&mut self) {
        for snapshot in &mut self.snapshots {
            if let Some(volume) = self.volumes.get(&snapshot.volume_id) {
                snapshot.volume = Some(volume.clone());
                for attachment in &volume.attachments {
                    if let Some(instance) = self.instances.get(&attachment.instance_id) {
                        snapshot.instance = Some(instance.clone());
                    }
                }
            }
            for image_id in &snapshot.lineage.image_ids {
                if let Some(image) = self.images.get(image_id) {
                    snapshot.image = Some(image.clone());
                }
            }
            snapshot.build_name_tag();
        }
    }

    /// Group snapshots by name tag, preserving the order groups and their
    /// members were first seen.
    pub fn grouped(self) -> Vec<(String, Vec<Ec2Snapshot>)> {
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(String, Vec<Ec2Snapshot>)> = Vec::new();
        for snapshot in self.snapshots {
            if snapshot.name_tag.is_empty() {
                continue;
            }
            match index.get(&snapshot.name_tag) {
                Some(&slot) => groups[slot].1.push(snapshot),
                None => {
                    index.insert(snapshot.name_tag.clone(), groups.len());
                    groups.push((snapshot.name_tag.clone(), vec![snapshot]));
                }
            }
        }
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::testing::fakes::{pages, FakeApi};
    use tempfile::TempDir;

    #[test]
    fn lineage_extracts_known_id_prefixes() {
        let lineage =
            parse_lineage("Created by CreateImage(i-0abc123) for ami-0def456 from vol-0aaa111");
        assert_eq!(lineage.instance_ids, ["i-0abc123"]);
        assert_eq!(lineage.image_ids, ["ami-0def456"]);
        assert_eq!(lineage.volume_ids, ["vol-0aaa111"]);
        assert!(lineage.snapshot_ids.is_empty());
        assert_eq!(lineage.slug, None);
    }

    #[test]
    fn lineage_falls_back_to_normalized_slug() {
        let lineage = parse_lineage("Weekly Backup (Primary DB)!!");
        assert!(lineage.is_empty());
        assert_eq!(lineage.slug.as_deref(), Some("weekly-backup-primary-db"));
    }

    #[test]
    fn lineage_slug_is_capped_at_24_chars() {
        let lineage = parse_lineage("this description is quite long and rambling");
        let slug = lineage.slug.unwrap();
        assert!(slug.len() <= 24, "slug too long: {slug}");
    }

    #[test]
    fn lineage_of_empty_description_has_no_slug() {
        let lineage = parse_lineage("");
        assert!(lineage.is_empty());
        assert_eq!(lineage.slug, None);
    }

    fn named(volume_id: &str, tags: Vec<Tag>) -> Ec2Snapshot {
        Ec2Snapshot {
            snapshot_id: "snap-1".into(),
            volume_id: volume_id.into(),
            tags,
            ..Default::default()
        }
    }

    #[test]
    fn name_tag_with_no_relations_still_carries_volume_id() {
        let mut snapshot = named("vol-123", vec![]);
        snapshot.build_name_tag();
        assert_eq!(
            snapshot.name_tag,
            "[vol-123]::[volume not found]::[instance not found]"
        );
    }

    #[test]
    fn name_tag_merges_relation_names_without_duplicates() {
        let mut snapshot = named("vol-123", vec![Tag::new("Name", "web")]);
        snapshot.volume = Some(Volume {
            volume_id: "vol-123".into(),
            tags: vec![Tag::new("Name", "web")],
            ..Default::default()
        });
        snapshot.instance = Some(Instance {
            instance_id: "i-1".into(),
            tags: vec![Tag::new("Name", "web-01")],
            ..Default::default()
        });
        snapshot.build_name_tag();
        assert_eq!(
            snapshot.name_tag,
            "[web]::[web-01]::[vol-123]::[volume found]::[instance found]"
        );
    }

    #[test]
    fn name_tag_treats_untagged_volume_as_not_found() {
        let mut snapshot = named("vol-9", vec![]);
        snapshot.volume = Some(Volume {
            volume_id: "vol-9".into(),
            ..Default::default()
        });
        snapshot.build_name_tag();
        assert!(snapshot.name_tag.contains("volume not found"));
    }

    #[test]
    fn unknown_wire_fields_survive_in_extra() {
        let snapshot = Ec2Snapshot::from_record(serde_json::json!({
            "SnapshotId": "snap-1",
            "VolumeId": "vol-1",
            "Description": "",
            "KmsKeyId": "key-abc",
        }))
        .unwrap();
        assert_eq!(
            snapshot.extra.get("KmsKeyId"),
            Some(&Value::String("key-abc".into()))
        );
    }

    fn inventory_api() -> FakeApi {
        FakeApi::new()
            .on("ec2", "describe_volumes", |_| {
                Ok(pages(vec![json!({"Volumes": [
                    {
                        "VolumeId": "vol-1",
                        "Tags": [{"Key": "Name", "Value": "data"}],
                        "Attachments": [{"InstanceId": "i-1", "State": "attached"}],
                    },
                ]})]))
            })
            .on("ec2", "describe_images", |_| {
                Ok(pages(vec![json!({"Images": [
                    {"ImageId": "ami-1", "Name": "base"},
                ]})]))
            })
            .on("ec2", "describe_instances", |_| {
                Ok(pages(vec![json!({"Reservations": [
                    {"Instances": [
                        {"InstanceId": "i-1", "Tags": [{"Key": "Name", "Value": "app-01"}]},
                    ]},
                ]})]))
            })
            .on("ec2", "describe_snapshots", |_| {
                Ok(pages(vec![json!({"Snapshots": [
                    {
                        "SnapshotId": "snap-1",
                        "VolumeId": "vol-1",
                        "StartTime": "2024-01-01T00:00:00+00:00",
                        "Description": "Created by CreateImage(i-1) for ami-1",
                    },
                    {
                        "SnapshotId": "snap-ignored",
                        "VolumeId": "vol-2",
                        "Description": "Created by AWS-VMImport service",
                    },
                ]})]))
            })
    }

    #[tokio::test]
    async fn inventory_load_enriches_and_filters() {
        let dir = TempDir::new().unwrap();
        let gateway = Gateway::new(
            inventory_api(),
            ResponseCache::new(dir.path(), "run-test"),
            "ns-test",
        );

        let inventory = SnapshotInventory::load(&gateway, 0, None).await.unwrap();
        assert_eq!(inventory.snapshots.len(), 1, "ignored snapshot filtered");

        let snapshot = &inventory.snapshots[0];
        assert!(snapshot.volume.is_some());
        assert!(snapshot.instance.is_some());
        assert!(snapshot.image.is_some());
        assert_eq!(
            snapshot.name_tag,
            "[data]::[app-01]::[vol-1]::[volume found]::[instance found]"
        );
    }

    #[test]
    fn grouping_preserves_first_seen_order() {
        let mut a = named("vol-a", vec![]);
        a.snapshot_id = "snap-a".into();
        a.build_name_tag();
        let mut b = named("vol-b", vec![]);
        b.snapshot_id = "snap-b".into();
        b.build_name_tag();
        let mut a2 = named("vol-a", vec![]);
        a2.snapshot_id = "snap-a2".into();
        a2.build_name_tag();

        let inventory = SnapshotInventory {
            snapshots: vec![a, b, a2],
            ..Default::default()
        };
        let groups = inventory.grouped();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[0].1[0].snapshot_id, "snap-a");
        assert_eq!(groups[0].1[1].snapshot_id, "snap-a2");
        assert_eq!(groups[1].1[0].snapshot_id, "snap-b");
    }
}
