//! snapwarden - lifecycle automation for AWS snapshots
//!
//! Every AWS read goes through a response cache keyed by a fingerprint of
//! the request, so repeated runs against large inventories stay cheap and
//! reproducible. On top of that sit the three workflows:
//!
//! - exporting Aurora cluster snapshots to S3 through a bounded work queue
//!   ([`queue`]), and deleting snapshots once their archive has aged
//!   ([`model::rds`]);
//! - adjudicating EC2 snapshot groups against retention rules and purging
//!   the losers ([`adjudicate`]);
//! - propagating the canonical tag set from volumes to their snapshots
//!   ([`tags`]).

pub mod adjudicate;
pub mod aws;
pub mod cache;
pub mod model;
pub mod queue;
pub mod report;
pub mod tags;
pub mod util;

#[cfg(test)]
pub mod testing;
