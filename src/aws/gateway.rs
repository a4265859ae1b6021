//! Cache-aware gateway in front of the AWS API.
//!
//! Every remote read goes through [`Gateway::call`]: the request is
//! fingerprinted, looked up in the response cache, and only sent to AWS on a
//! miss. Responses are written through the cache unconditionally so a
//! later run with a longer TTL can still use them.

use std::future::Future;

use serde_json::Value;
use tracing::debug;

use crate::aws::error::ApiError;
use crate::cache::ResponseCache;
use crate::util::sha_hex;

/// A single AWS read or mutation, described by data.
///
/// `service` and `operation` select a handler in the invoker registry;
/// `params` carries the wire-shaped request parameters. Declaring a
/// `PaginationConfig` object inside `params` marks the call as paginated.
#[derive(Debug, Clone)]
pub struct InventoryRequest {
    pub service: String,
    pub operation: String,
    /// Response key holding the records of interest. Empty means "take the
    /// response as-is".
    pub extraction_key: String,
    pub params: Value,
    /// Cache TTL in seconds. Zero disables cache reads; writes still happen.
    pub cache_ttl: u64,
    /// Region override; `None` uses the context default.
    pub region: Option<String>,
}

impl InventoryRequest {
    pub fn new(service: &str, operation: &str) -> Self {
        Self {
            service: service.to_string(),
            operation: operation.to_string(),
            extraction_key: String::new(),
            params: Value::Object(serde_json::Map::new()),
            cache_ttl: 0,
            region: None,
        }
    }

    pub fn extraction_key(mut self, key: &str) -> Self {
        self.extraction_key = key.to_string();
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn cache_ttl(mut self, secs: u64) -> Self {
        self.cache_ttl = secs;
        self
    }

    pub fn region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    pub fn is_paginated(&self) -> bool {
        self.params.get("PaginationConfig").is_some()
    }
}

/// What an invoker hands back: either every page of a paginated call, or the
/// single response of a one-shot call. Pages keep their wire field names.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiResponse {
    Pages(Vec<Value>),
    Single(Value),
}

/// Anything that can execute an [`InventoryRequest`] against a remote API.
/// The production implementation talks to AWS; tests substitute a fake.
pub trait RemoteApi {
    fn invoke(
        &self,
        request: &InventoryRequest,
    ) -> impl Future<Output = Result<ApiResponse, ApiError>> + Send;
}

/// Cache-fronted access to a [`RemoteApi`].
pub struct Gateway<C> {
    api: C,
    cache: ResponseCache,
    session_namespace: String,
}

impl<C: RemoteApi> Gateway<C> {
    pub fn new(api: C, cache: ResponseCache, session_namespace: impl Into<String>) -> Self {
        Self {
            api,
            cache,
            session_namespace: session_namespace.into(),
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    #[cfg(test)]
    pub fn api_ref(&self) -> &C {
        &self.api
    }

    /// Cache key for a request: a fixed `aws.` prefix plus one digest over
    /// the call site (namespace, service, region, operation, extraction key)
    /// and one over the parameters. Identical requests always collide;
    /// different parameters never do.
    pub fn fingerprint(&self, request: &InventoryRequest) -> String {
        let region = request.region.as_deref().unwrap_or("");
        let site = format!(
            "{}.{}.{}.{}.{}",
            self.session_namespace, request.service, region, request.operation,
            request.extraction_key
        );
        let params = request.params.to_string();
        format!("aws.{}.{}", sha_hex(&site), sha_hex(&params))
    }

    /// Execute a request through the cache.
    ///
    /// Returns `Ok(None)` when a one-shot lookup hit a resource that does
    /// not exist (or an unreachable endpoint); that outcome is not cached.
    pub async fn call(&self, request: &InventoryRequest) -> Result<Option<Value>, ApiError> {
        let key = self.fingerprint(request);

        if request.cache_ttl > 0 {
            if let Some(value) = self.cache.get(&key, request.cache_ttl) {
                debug!(
                    service = %request.service,
                    operation = %request.operation,
                    "cache hit"
                );
                return Ok(Some(value));
            }
        }

        let response = match self.api.invoke(request).await {
            Ok(response) => response,
            Err(err) if err.is_absent() && !request.is_paginated() => {
                debug!(
                    service = %request.service,
                    operation = %request.operation,
                    error = %err,
                    "treating absent resource as empty result"
                );
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let value = self.extract(request, response)?;
        Ok(Some(self.cache.put(&key, value)?))
    }

    /// [`call`](Self::call), flattened to a list of records. Absent results
    /// and non-array payloads come back as an empty or single-element list.
    pub async fn records(&self, request: &InventoryRequest) -> Result<Vec<Value>, ApiError> {
        match self.call(request).await? {
            None => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) => Ok(Vec::new()),
            Some(other) => Ok(vec![other]),
        }
    }

    /// Pull the declared extraction key out of each page and accumulate the
    /// records. A declared key that is missing from a page is a protocol
    /// mismatch and fails the call.
    fn extract(&self, request: &InventoryRequest, response: ApiResponse) -> Result<Value, ApiError> {
        let key = request.extraction_key.as_str();
        match response {
            ApiResponse::Single(page) => {
                if key.is_empty() {
                    return Ok(page);
                }
                match page.get(key) {
                    Some(value) => Ok(value.clone()),
                    None => Err(self.mismatch(request)),
                }
            }
            ApiResponse::Pages(pages) => {
                let mut records = Vec::new();
                for page in pages {
                    if key.is_empty() {
                        records.push(page);
                        continue;
                    }
                    match page.get(key) {
                        Some(Value::Array(items)) => records.extend(items.iter().cloned()),
                        Some(other) => records.push(other.clone()),
                        None => return Err(self.mismatch(request)),
                    }
                }
                Ok(Value::Array(records))
            }
        }
    }

    fn mismatch(&self, request: &InventoryRequest) -> ApiError {
        ApiError::ProtocolMismatch {
            service: request.service.clone(),
            operation: request.operation.clone(),
            region: request
                .region
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            expected_key: request.extraction_key.clone(),
        }
    }
}
