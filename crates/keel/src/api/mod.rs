//! HTTP and WebSocket API.

mod auth;
mod error;
mod extract;
mod files;
mod handlers;
mod rate_limit;
mod routes;
mod state;
mod transfer;
mod ws;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use extract::{ApiJson, ApiPath, ApiQuery};
pub use rate_limit::CreateLimiter;
pub use routes::create_router;
pub use state::AppState;
