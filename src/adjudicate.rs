//! Retention adjudication for EC2 snapshot groups.
//!
//! Each group of snapshots sharing a name tag is judged against the
//! operator's rules. Marking happens first (cutoff dates, EOL, oldest and
//! newest), then every snapshot receives a verdict in strict precedence
//! order: EOL, oldest/newest, older-than-cutoff, newer-than-cutoff, and a
//! remove-by-default fallback.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use serde_json::json;
use tracing::{info, warn};

use crate::aws::error::ApiError;
use crate::aws::gateway::{Gateway, InventoryRequest, RemoteApi};
use crate::model::ec2::{Ec2Snapshot, SnapshotInventory, Verdict};

/// Substrings marking a snapshot as end-of-life. Matched case-insensitively
/// against the description and the name tag.
pub const EOL_MARKERS: &[&str] = &["eol", "final"];

pub const REASON_EOL: &str = "Snapshot is EOL";
pub const REASON_NEWEST: &str = "Snapshot is the newest";
pub const REASON_OLDEST: &str = "Snapshot is the oldest";
pub const REASON_OLDER: &str = "Snapshot is older than desired";
pub const REASON_NEWER: &str = "Snapshot is newer than desired";
pub const REASON_DEFAULT: &str = "Not otherwise retained";

/// Operator-supplied retention rules.
#[derive(Debug, Clone, Default)]
pub struct PurgeRules {
    /// Regex matched case-insensitively against group names; empty matches
    /// every group.
    pub name: String,
    pub delete_older_than: Option<DateTime<Utc>>,
    pub retain_newer_than: Option<DateTime<Utc>>,
    pub retain_oldest: bool,
    pub retain_newest: bool,
    pub retain_eol: bool,
}

pub struct Adjudicator {
    rules: PurgeRules,
    name_filter: Regex,
}

impl Adjudicator {
    pub fn new(rules: PurgeRules) -> Result<Self, regex::Error> {
        let name_filter = RegexBuilder::new(&rules.name)
            .case_insensitive(true)
            .build()?;
        Ok(Self { rules, name_filter })
    }

    /// Judge every allowed group and return the snapshots with verdicts and
    /// reasons filled in. Snapshots in groups the name filter rejects are
    /// not judged at all.
    pub fn judge(&self, groups: Vec<(String, Vec<Ec2Snapshot>)>) -> Vec<Ec2Snapshot> {
        let mut judged = Vec::new();
        for (name, mut snapshots) in groups {
            if !self.name_filter.is_match(&name) {
                continue;
            }

            self.mark_cutoffs(&mut snapshots);
            self.mark_eol(&mut snapshots);

            // Oldest/newest come from the snapshots the cutoffs left
            // undecided; when the cutoffs claimed everything, fall back to
            // the whole group so the markers still land somewhere.
            let available: Vec<usize> = snapshots
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    !s.lifecycle.is_older_than_cutoff && !s.lifecycle.is_newer_than_cutoff
                })
                .map(|(i, _)| i)
                .collect();
            let candidates: Vec<usize> = if available.is_empty() {
                (0..snapshots.len()).collect()
            } else {
                available
            };
            self.mark_oldest(&mut snapshots, &candidates);
            self.mark_newest(&mut snapshots, &candidates);

            for mut snapshot in snapshots {
                self.pass_verdict(&mut snapshot);
                judged.push(snapshot);
            }
        }
        judged
    }

    fn mark_cutoffs(&self, snapshots: &mut [Ec2Snapshot]) {
        if let Some(cutoff) = self.rules.delete_older_than {
            for snapshot in snapshots.iter_mut() {
                if snapshot.timestamp() < cutoff {
                    snapshot.lifecycle.is_older_than_cutoff = true;
                }
            }
        }
        if let Some(cutoff) = self.rules.retain_newer_than {
            for snapshot in snapshots.iter_mut() {
                if snapshot.timestamp() > cutoff {
                    snapshot.lifecycle.is_newer_than_cutoff = true;
                }
            }
        }
    }

    fn mark_eol(&self, snapshots: &mut [Ec2Snapshot]) {
        if !self.rules.retain_eol {
            return;
        }
        for snapshot in snapshots.iter_mut() {
            let description = snapshot.description.to_lowercase();
            let name_tag = snapshot.name_tag.to_lowercase();
            if EOL_MARKERS
                .iter()
                .any(|marker| description.contains(marker) || name_tag.contains(marker))
            {
                snapshot.lifecycle.is_eol = true;
            }
        }
    }

    fn mark_oldest(&self, snapshots: &mut [Ec2Snapshot], candidates: &[usize]) {
        if !self.rules.retain_oldest {
            return;
        }
        // First wins on ties.
        let oldest = candidates
            .iter()
            .copied()
            .reduce(|best, i| {
                if snapshots[i].timestamp() < snapshots[best].timestamp() {
                    i
                } else {
                    best
                }
            });
        if let Some(index) = oldest {
            snapshots[index].lifecycle.is_oldest = true;
        }
    }

    fn mark_newest(&self, snapshots: &mut [Ec2Snapshot], candidates: &[usize]) {
        if !self.rules.retain_newest {
            return;
        }
        let newest = candidates
            .iter()
            .copied()
            .reduce(|best, i| {
                if snapshots[i].timestamp() > snapshots[best].timestamp() {
                    i
                } else {
                    best
                }
            });
        if let Some(index) = newest {
            snapshots[index].lifecycle.is_newest = true;
        }
    }

    fn pass_verdict(&self, snapshot: &mut Ec2Snapshot) {
        let lifecycle = &mut snapshot.lifecycle;

        if lifecycle.is_eol {
            lifecycle.verdict = Verdict::Retain;
            lifecycle.reasons.push(REASON_EOL.to_string());
            return;
        }

        if lifecycle.is_oldest || lifecycle.is_newest {
            if lifecycle.is_newest {
                lifecycle.verdict = Verdict::Retain;
                lifecycle.reasons.push(REASON_NEWEST.to_string());
            }
            if lifecycle.is_oldest {
                lifecycle.verdict = Verdict::Retain;
                lifecycle.reasons.push(REASON_OLDEST.to_string());
            }
            return;
        }

        if lifecycle.is_older_than_cutoff {
            lifecycle.verdict = Verdict::Remove;
            lifecycle.reasons.push(REASON_OLDER.to_string());
            return;
        }

        if lifecycle.is_newer_than_cutoff {
            lifecycle.verdict = Verdict::Retain;
            lifecycle.reasons.push(REASON_NEWER.to_string());
            return;
        }

        lifecycle.verdict = Verdict::Remove;
        lifecycle.reasons.push(REASON_DEFAULT.to_string());
    }
}

/// Settings for one purge pass.
#[derive(Debug, Clone, Default)]
pub struct PurgeConfig {
    pub rules: PurgeRules,
    /// Maximum deletions this run; zero means unlimited.
    pub limit: usize,
    pub dry_run: bool,
    pub cache_ttl: u64,
    pub region: Option<String>,
}

#[derive(Debug, Default)]
pub struct PurgeOutcome {
    pub judged: Vec<Ec2Snapshot>,
    pub deleted: usize,
    pub retained: usize,
    pub failed: usize,
    /// Remove verdicts left untouched because the deletion limit was hit.
    pub skipped: usize,
}

/// Load the inventory, adjudicate it, and apply remove verdicts up to the
/// configured limit. Individual deletion failures are reported and do not
/// stop the pass.
pub async fn purge_snapshots<C: RemoteApi>(
    gateway: &Gateway<C>,
    config: &PurgeConfig,
) -> Result<PurgeOutcome, ApiError> {
    let adjudicator = Adjudicator::new(config.rules.clone()).map_err(|err| {
        ApiError::Preflight {
            message: format!("invalid name filter '{}': {err}", config.rules.name),
        }
    })?;

    let inventory =
        SnapshotInventory::load(gateway, config.cache_ttl, config.region.as_deref()).await?;
    let judged = adjudicator.judge(inventory.grouped());

    let mut outcome = PurgeOutcome::default();
    for snapshot in &judged {
        match snapshot.lifecycle.verdict {
            Verdict::Retain | Verdict::Undecided => outcome.retained += 1,
            Verdict::Remove => {
                if config.limit > 0 && outcome.deleted >= config.limit {
                    outcome.skipped += 1;
                    continue;
                }
                if config.dry_run {
                    info!(
                        snapshot = %snapshot.snapshot_id,
                        name = %snapshot.name_tag,
                        reasons = %snapshot.lifecycle.reasons.join(", "),
                        "[DRY RUN] would delete"
                    );
                    outcome.deleted += 1;
                    continue;
                }
                let request = InventoryRequest::new("ec2", "delete_snapshot")
                    .params(json!({"SnapshotId": snapshot.snapshot_id}));
                match gateway.call(&request).await {
                    Ok(_) => {
                        info!(
                            snapshot = %snapshot.snapshot_id,
                            name = %snapshot.name_tag,
                            reasons = %snapshot.lifecycle.reasons.join(", "),
                            "deleted"
                        );
                        outcome.deleted += 1;
                    }
                    Err(err) => {
                        warn!(
                            snapshot = %snapshot.snapshot_id,
                            error = %err,
                            "failed to delete"
                        );
                        outcome.failed += 1;
                    }
                }
            }
        }
    }
    outcome.judged = judged;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::testing::fakes::{pages, FakeApi};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn snapshot(id: &str, start: &str, description: &str) -> Ec2Snapshot {
        let mut snapshot = Ec2Snapshot {
            snapshot_id: id.to_string(),
            volume_id: "vol-1".to_string(),
            start_time: Some(start.to_string()),
            description: description.to_string(),
            ..Default::default()
        };
        snapshot.build_name_tag();
        snapshot
    }

    fn group(snapshots: Vec<Ec2Snapshot>) -> Vec<(String, Vec<Ec2Snapshot>)> {
        let name = snapshots[0].name_tag.clone();
        vec![(name, snapshots)]
    }

    fn judge(rules: PurgeRules, snapshots: Vec<Ec2Snapshot>) -> Vec<Ec2Snapshot> {
        Adjudicator::new(rules).unwrap().judge(group(snapshots))
    }

    fn cutoff(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn eol_wins_over_every_other_rule() {
        let judged = judge(
            PurgeRules {
                retain_eol: true,
                retain_oldest: true,
                delete_older_than: Some(cutoff(2024, 1, 1)),
                ..Default::default()
            },
            vec![snapshot("snap-1", "2020-06-01T00:00:00Z", "final image before decom")],
        );
        assert_eq!(judged[0].lifecycle.verdict, Verdict::Retain);
        assert_eq!(judged[0].lifecycle.reasons, [REASON_EOL]);
    }

    #[test]
    fn sole_snapshot_can_be_both_oldest_and_newest() {
        let judged = judge(
            PurgeRules {
                retain_oldest: true,
                retain_newest: true,
                ..Default::default()
            },
            vec![snapshot("snap-1", "2024-01-01T00:00:00Z", "")],
        );
        assert_eq!(judged[0].lifecycle.verdict, Verdict::Retain);
        assert_eq!(judged[0].lifecycle.reasons, [REASON_NEWEST, REASON_OLDEST]);
    }

    #[test]
    fn older_than_cutoff_is_removed() {
        let judged = judge(
            PurgeRules {
                delete_older_than: Some(cutoff(2024, 1, 1)),
                ..Default::default()
            },
            vec![
                snapshot("snap-old", "2022-01-01T00:00:00Z", ""),
                snapshot("snap-new", "2024-06-01T00:00:00Z", ""),
            ],
        );
        assert_eq!(judged[0].lifecycle.verdict, Verdict::Remove);
        assert_eq!(judged[0].lifecycle.reasons, [REASON_OLDER]);
        assert_eq!(judged[1].lifecycle.verdict, Verdict::Remove);
        assert_eq!(judged[1].lifecycle.reasons, [REASON_DEFAULT]);
    }

    #[test]
    fn newer_than_cutoff_is_retained() {
        let judged = judge(
            PurgeRules {
                retain_newer_than: Some(cutoff(2024, 1, 1)),
                ..Default::default()
            },
            vec![snapshot("snap-1", "2024-06-01T00:00:00Z", "")],
        );
        assert_eq!(judged[0].lifecycle.verdict, Verdict::Retain);
        assert_eq!(judged[0].lifecycle.reasons, [REASON_NEWER]);
    }

    #[test]
    fn newest_outranks_newer_than_cutoff() {
        let judged = judge(
            PurgeRules {
                retain_newest: true,
                retain_newer_than: Some(cutoff(2024, 1, 1)),
                ..Default::default()
            },
            vec![
                snapshot("snap-a", "2024-03-01T00:00:00Z", ""),
                snapshot("snap-b", "2024-06-01T00:00:00Z", ""),
            ],
        );
        // snap-b is newest; both are newer than the cutoff, so neither is a
        // candidate via the available set and the fallback applies.
        let b = judged.iter().find(|s| s.snapshot_id == "snap-b").unwrap();
        assert_eq!(b.lifecycle.reasons, [REASON_NEWEST]);
        let a = judged.iter().find(|s| s.snapshot_id == "snap-a").unwrap();
        assert_eq!(a.lifecycle.reasons, [REASON_NEWER]);
    }

    #[test]
    fn unmatched_rules_remove_by_default() {
        let judged = judge(
            PurgeRules::default(),
            vec![snapshot("snap-1", "2024-01-01T00:00:00Z", "")],
        );
        assert_eq!(judged[0].lifecycle.verdict, Verdict::Remove);
        assert_eq!(judged[0].lifecycle.reasons, [REASON_DEFAULT]);
    }

    #[test]
    fn markers_fall_back_to_whole_group_when_cutoffs_claim_all() {
        let judged = judge(
            PurgeRules {
                retain_oldest: true,
                retain_newest: true,
                delete_older_than: Some(cutoff(2025, 1, 1)),
                ..Default::default()
            },
            vec![
                snapshot("snap-a", "2023-01-01T00:00:00Z", ""),
                snapshot("snap-b", "2023-06-01T00:00:00Z", ""),
                snapshot("snap-c", "2024-01-01T00:00:00Z", ""),
            ],
        );
        let a = judged.iter().find(|s| s.snapshot_id == "snap-a").unwrap();
        assert_eq!(a.lifecycle.verdict, Verdict::Retain);
        assert_eq!(a.lifecycle.reasons, [REASON_OLDEST]);
        let c = judged.iter().find(|s| s.snapshot_id == "snap-c").unwrap();
        assert_eq!(c.lifecycle.verdict, Verdict::Retain);
        assert_eq!(c.lifecycle.reasons, [REASON_NEWEST]);
        let b = judged.iter().find(|s| s.snapshot_id == "snap-b").unwrap();
        assert_eq!(b.lifecycle.verdict, Verdict::Remove);
        assert_eq!(b.lifecycle.reasons, [REASON_OLDER]);
    }

    #[test]
    fn equal_timestamps_mark_the_first_seen() {
        let judged = judge(
            PurgeRules {
                retain_oldest: true,
                ..Default::default()
            },
            vec![
                snapshot("snap-first", "2024-01-01T00:00:00Z", ""),
                snapshot("snap-second", "2024-01-01T00:00:00Z", ""),
            ],
        );
        let first = judged.iter().find(|s| s.snapshot_id == "snap-first").unwrap();
        assert!(first.lifecycle.is_oldest);
        let second = judged.iter().find(|s| s.snapshot_id == "snap-second").unwrap();
        assert!(!second.lifecycle.is_oldest);
    }

    #[test]
    fn name_filter_excludes_whole_groups() {
        let mut matching = snapshot("snap-a", "2024-01-01T00:00:00Z", "");
        matching.name_tag = "[web]::[vol-1]".to_string();
        let mut other = snapshot("snap-b", "2024-01-01T00:00:00Z", "");
        other.name_tag = "[db]::[vol-2]".to_string();

        let adjudicator = Adjudicator::new(PurgeRules {
            name: "web".to_string(),
            ..Default::default()
        })
        .unwrap();
        let judged = adjudicator.judge(vec![
            ("[web]::[vol-1]".to_string(), vec![matching]),
            ("[db]::[vol-2]".to_string(), vec![other]),
        ]);
        assert_eq!(judged.len(), 1);
        assert_eq!(judged[0].snapshot_id, "snap-a");
    }

    #[test]
    fn invalid_name_filter_is_rejected() {
        assert!(Adjudicator::new(PurgeRules {
            name: "(".to_string(),
            ..Default::default()
        })
        .is_err());
    }

    fn purge_api() -> FakeApi {
        FakeApi::new()
            .on("ec2", "describe_volumes", |_| Ok(pages(vec![json!({"Volumes": []})])))
            .on("ec2", "describe_images", |_| Ok(pages(vec![json!({"Images": []})])))
            .on("ec2", "describe_instances", |_| {
                Ok(pages(vec![json!({"Reservations": []})]))
            })
            .on("ec2", "describe_snapshots", |_| {
                Ok(pages(vec![json!({"Snapshots": [
                    {"SnapshotId": "snap-1", "VolumeId": "vol-1",
                     "StartTime": "2024-01-01T00:00:00Z", "Description": ""},
                    {"SnapshotId": "snap-2", "VolumeId": "vol-1",
                     "StartTime": "2024-02-01T00:00:00Z", "Description": ""},
                    {"SnapshotId": "snap-3", "VolumeId": "vol-1",
                     "StartTime": "2024-03-01T00:00:00Z", "Description": ""},
                ]})]))
            })
            .on("ec2", "delete_snapshot", |req| {
                Ok(crate::aws::gateway::ApiResponse::Single(json!({
                    "SnapshotId": req.params["SnapshotId"],
                    "Deleted": true,
                })))
            })
    }

    #[tokio::test]
    async fn purge_deletes_remove_verdicts_and_keeps_the_newest() {
        let dir = TempDir::new().unwrap();
        let gateway = Gateway::new(
            purge_api(),
            ResponseCache::new(dir.path(), "run-test"),
            "ns-test",
        );

        let outcome = purge_snapshots(
            &gateway,
            &PurgeConfig {
                rules: PurgeRules {
                    retain_newest: true,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.retained, 1);
        assert_eq!(outcome.deleted, 2);
        assert_eq!(outcome.failed, 0);
        assert_eq!(gateway.api_ref().call_count("ec2", "delete_snapshot"), 2);
    }

    #[tokio::test]
    async fn purge_limit_short_circuits_deletions() {
        let dir = TempDir::new().unwrap();
        let gateway = Gateway::new(
            purge_api(),
            ResponseCache::new(dir.path(), "run-test"),
            "ns-test",
        );

        let outcome = purge_snapshots(
            &gateway,
            &PurgeConfig {
                rules: PurgeRules {
                    retain_newest: true,
                    ..Default::default()
                },
                limit: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome.deleted, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(gateway.api_ref().call_count("ec2", "delete_snapshot"), 1);
    }
}
