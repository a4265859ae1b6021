//! Test doubles shared across the crate's unit tests.

pub mod fakes {
    //! An in-memory [`RemoteApi`] with per-operation scripted responses.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use serde_json::Value;

    use crate::aws::error::ApiError;
    use crate::aws::gateway::{ApiResponse, InventoryRequest, RemoteApi};

    type Handler = Box<dyn Fn(&InventoryRequest) -> Result<ApiResponse, ApiError> + Send + Sync>;

    /// Scripted stand-in for the AWS invoker. Handlers are registered per
    /// `service.operation` pair; anything unregistered fails the way the
    /// real invoker rejects an unsupported operation.
    #[derive(Default)]
    pub struct FakeApi {
        handlers: HashMap<String, Handler>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeApi {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on<F>(mut self, service: &str, operation: &str, handler: F) -> Self
        where
            F: Fn(&InventoryRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
        {
            self.handlers
                .insert(format!("{service}.{operation}"), Box::new(handler));
            self
        }

        /// How many times the given operation was invoked.
        pub fn call_count(&self, service: &str, operation: &str) -> usize {
            let key = format!("{service}.{operation}");
            self.calls
                .lock()
                .map(|calls| calls.iter().filter(|c| **c == key).count())
                .unwrap_or(0)
        }
    }

    impl RemoteApi for FakeApi {
        async fn invoke(&self, request: &InventoryRequest) -> Result<ApiResponse, ApiError> {
            let key = format!("{}.{}", request.service, request.operation);
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(key.clone());
            }
            match self.handlers.get(&key) {
                Some(handler) => handler(request),
                None => Err(ApiError::UnknownOperation {
                    service: request.service.clone(),
                    operation: request.operation.clone(),
                }),
            }
        }
    }

    /// Shorthand for a paginated response.
    pub fn pages(pages: Vec<Value>) -> ApiResponse {
        ApiResponse::Pages(pages)
    }

    /// Shorthand for a one-shot response.
    pub fn single(value: Value) -> ApiResponse {
        ApiResponse::Single(value)
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::{single, FakeApi};
    use crate::aws::error::ApiError;
    use crate::aws::gateway::{ApiResponse, InventoryRequest, RemoteApi};
    use serde_json::json;

    #[tokio::test]
    async fn dispatches_by_service_and_operation() {
        let api = FakeApi::new().on("s3", "head_object", |_| Ok(single(json!({"ok": true}))));

        let hit = InventoryRequest::new("s3", "head_object");
        assert_eq!(
            api.invoke(&hit).await.unwrap(),
            ApiResponse::Single(json!({"ok": true}))
        );

        let miss = InventoryRequest::new("s3", "get_object");
        assert!(matches!(
            api.invoke(&miss).await.unwrap_err(),
            ApiError::UnknownOperation { .. }
        ));
    }

    #[tokio::test]
    async fn counts_calls_per_operation() {
        let api = FakeApi::new().on("kms", "describe_key", |_| Ok(single(json!({}))));
        let request = InventoryRequest::new("kms", "describe_key");
        api.invoke(&request).await.unwrap();
        api.invoke(&request).await.unwrap();
        assert_eq!(api.call_count("kms", "describe_key"), 2);
        assert_eq!(api.call_count("kms", "other"), 0);
    }
}
