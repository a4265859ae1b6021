//! Typed views over the wire-shaped JSON the gateway returns.
//!
//! Every model keeps the AWS field names through serde renames and folds
//! anything it does not model into an `extra` map, so nothing from the wire
//! is lost across a cache round trip.

pub mod ec2;
pub mod rds;

use serde::{Deserialize, Serialize};

pub use ec2::{Ec2Snapshot, SnapshotInventory};
pub use rds::ClusterSnapshot;

/// A single resource tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "Key", default)]
    pub key: String,
    #[serde(rename = "Value", default)]
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Look up a tag value by key.
pub fn get_tag<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.key == key)
        .map(|tag| tag.value.as_str())
}
