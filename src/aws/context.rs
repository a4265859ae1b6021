//! Shared AWS configuration context
//!
//! Provides `AwsContext` for loading AWS SDK configuration once per region
//! and creating service clients from it. Clients are memoized per region so
//! repeated calls hand back the same client, and the caller identity is
//! resolved once and reused for the lifetime of the context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use aws_config::{BehaviorVersion, Region, SdkConfig};
use tracing::debug;

use crate::aws::error::ApiError;
use crate::util::sha_hex;

/// The caller behind this run, as reported by STS.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
    pub user_id: String,
}

/// Shared AWS configuration context for creating service clients.
///
/// Cloning is cheap; all clones share the same memoized configs, clients,
/// and caller identity.
#[derive(Clone)]
pub struct AwsContext {
    inner: Arc<Inner>,
}

struct Inner {
    default_region: String,
    profile: Option<String>,
    configs: Mutex<HashMap<String, SdkConfig>>,
    ec2: Mutex<HashMap<String, aws_sdk_ec2::Client>>,
    rds: Mutex<HashMap<String, aws_sdk_rds::Client>>,
    s3: Mutex<HashMap<String, aws_sdk_s3::Client>>,
    kms: Mutex<HashMap<String, aws_sdk_kms::Client>>,
    tagging: Mutex<HashMap<String, aws_sdk_resourcegroupstagging::Client>>,
    identity: Mutex<Option<CallerIdentity>>,
}

impl AwsContext {
    /// Create a context with a default region and an optional named profile.
    ///
    /// Configuration is loaded lazily, the first time a client for a region
    /// is requested.
    pub fn new(default_region: &str, profile: Option<&str>) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_region: default_region.to_string(),
                profile: profile.map(str::to_string),
                configs: Mutex::new(HashMap::new()),
                ec2: Mutex::new(HashMap::new()),
                rds: Mutex::new(HashMap::new()),
                s3: Mutex::new(HashMap::new()),
                kms: Mutex::new(HashMap::new()),
                tagging: Mutex::new(HashMap::new()),
                identity: Mutex::new(None),
            }),
        }
    }

    pub fn default_region(&self) -> &str {
        &self.inner.default_region
    }

    /// Load (or reuse) the SDK config for a region.
    pub async fn sdk_config(&self, region: &str) -> SdkConfig {
        if let Some(config) = self
            .inner
            .configs
            .lock()
            .ok()
            .and_then(|map| map.get(region).cloned())
        {
            return config;
        }

        debug!(region, profile = ?self.inner.profile, "loading AWS SDK config");
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()));
        if let Some(profile) = &self.inner.profile {
            loader = loader.profile_name(profile);
        }
        let config = loader.load().await;

        if let Ok(mut map) = self.inner.configs.lock() {
            map.insert(region.to_string(), config.clone());
        }
        config
    }

    pub async fn ec2(&self, region: &str) -> aws_sdk_ec2::Client {
        if let Some(client) = self
            .inner
            .ec2
            .lock()
            .ok()
            .and_then(|map| map.get(region).cloned())
        {
            return client;
        }
        let client = aws_sdk_ec2::Client::new(&self.sdk_config(region).await);
        if let Ok(mut map) = self.inner.ec2.lock() {
            map.insert(region.to_string(), client.clone());
        }
        client
    }

    pub async fn rds(&self, region: &str) -> aws_sdk_rds::Client {
        if let Some(client) = self
            .inner
            .rds
            .lock()
            .ok()
            .and_then(|map| map.get(region).cloned())
        {
            return client;
        }
        let client = aws_sdk_rds::Client::new(&self.sdk_config(region).await);
        if let Ok(mut map) = self.inner.rds.lock() {
            map.insert(region.to_string(), client.clone());
        }
        client
    }

    pub async fn s3(&self, region: &str) -> aws_sdk_s3::Client {
        if let Some(client) = self
            .inner
            .s3
            .lock()
            .ok()
            .and_then(|map| map.get(region).cloned())
        {
            return client;
        }
        let client = aws_sdk_s3::Client::new(&self.sdk_config(region).await);
        if let Ok(mut map) = self.inner.s3.lock() {
            map.insert(region.to_string(), client.clone());
        }
        client
    }

    pub async fn kms(&self, region: &str) -> aws_sdk_kms::Client {
        if let Some(client) = self
            .inner
            .kms
            .lock()
            .ok()
            .and_then(|map| map.get(region).cloned())
        {
            return client;
        }
        let client = aws_sdk_kms::Client::new(&self.sdk_config(region).await);
        if let Ok(mut map) = self.inner.kms.lock() {
            map.insert(region.to_string(), client.clone());
        }
        client
    }

    pub async fn tagging(&self, region: &str) -> aws_sdk_resourcegroupstagging::Client {
        if let Some(client) = self
            .inner
            .tagging
            .lock()
            .ok()
            .and_then(|map| map.get(region).cloned())
        {
            return client;
        }
        let client = aws_sdk_resourcegroupstagging::Client::new(&self.sdk_config(region).await);
        if let Ok(mut map) = self.inner.tagging.lock() {
            map.insert(region.to_string(), client.clone());
        }
        client
    }

    /// Resolve the caller identity via STS, once per context.
    pub async fn caller_identity(&self) -> Result<CallerIdentity, ApiError> {
        if let Some(identity) = self
            .inner
            .identity
            .lock()
            .ok()
            .and_then(|slot| slot.clone())
        {
            return Ok(identity);
        }

        let client = aws_sdk_sts::Client::new(&self.sdk_config(&self.inner.default_region).await);
        let output = client.get_caller_identity().send().await.map_err(|err| {
            ApiError::Unavailable {
                service: "sts".into(),
                operation: "get_caller_identity".into(),
                region: self.inner.default_region.clone(),
                message: err.to_string(),
            }
        })?;

        let identity = CallerIdentity {
            account: output.account().unwrap_or_default().to_string(),
            arn: output.arn().unwrap_or_default().to_string(),
            user_id: output.user_id().unwrap_or_default().to_string(),
        };
        debug!(account = %identity.account, "resolved caller identity");

        if let Ok(mut slot) = self.inner.identity.lock() {
            *slot = Some(identity.clone());
        }
        Ok(identity)
    }

    /// A stable namespace for cache keys, derived from who is calling and
    /// from where. Two operators (or two accounts) never share cache files.
    pub async fn session_namespace(&self) -> Result<String, ApiError> {
        let identity = self.caller_identity().await?;
        Ok(session_namespace_for(
            &identity,
            &self.inner.default_region,
        ))
    }
}

/// Derive the cache namespace from an identity and region.
pub fn session_namespace_for(identity: &CallerIdentity, region: &str) -> String {
    sha_hex(&format!(
        "{}:{}:{}:{}",
        identity.account, identity.user_id, identity.arn, region
    ))
}

impl std::fmt::Debug for AwsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsContext")
            .field("default_region", &self.inner.default_region)
            .field("profile", &self.inner.profile)
            .finish_non_exhaustive()
    }
}
