//! AWS access: shared context, error taxonomy, cache-aware gateway, and the
//! SDK invoker registry.

pub mod context;
pub mod error;
pub mod gateway;
pub mod invoker;

pub use context::AwsContext;
pub use error::ApiError;
pub use gateway::{ApiResponse, Gateway, InventoryRequest, RemoteApi};
pub use invoker::SdkInvoker;
