pub mod audit;
pub mod error;
pub mod idempotency;
pub mod logging;

pub use audit::audit_middleware;
pub use error::ErrorResponse;
pub use idempotency::idempotency_middleware;
pub use logging::{request_logging_middleware, UuidRequestId};
