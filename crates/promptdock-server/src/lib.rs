//! Public HTTP edge and dynamic reverse-proxy surface.

pub mod api_errors;
pub mod handlers;
pub mod proxy;

pub use api_errors::ApiError;
pub use handlers::{build_router, AppState, ExecuteRequest, ExecuteResponse};
pub use proxy::ProxyTable;
