pub mod auth_handlers;
pub mod error;
pub mod export_handlers;
pub mod handlers;
pub mod operation_handlers;
pub mod routes;
pub mod user_extractor;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::AppState;
pub use routes::*;
