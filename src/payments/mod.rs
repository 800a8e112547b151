//! Payment gateway boundary

pub mod error;
pub mod guarded;
pub mod provider;
pub mod providers;
pub mod types;
pub mod utils;

pub use error::{GatewayError, GatewayResult};
pub use guarded::CircuitBreakingGateway;
pub use provider::PaymentGateway;
pub use providers::adyen::{AdyenConfig, AdyenGateway};
